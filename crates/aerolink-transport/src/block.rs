//! # Video Blocks & Reception Window
//!
//! A [`VideoBlock`] is one FEC coding unit: `data_packets` data segments
//! followed by `fec_packets` recovery segments, all `packet_length` bytes.
//! The [`ReceptionWindow`] is an ordered run of consecutive blocks, slot 0
//! being the next block to output.
//!
//! ## Arena
//!
//! The window never allocates after construction. It owns
//! [`MAX_RXTX_BLOCKS_BUFFER`] block records, each with
//! [`MAX_TOTAL_PACKETS_IN_BLOCK`] segment buffers of [`MAX_VIDEO_PAYLOAD`]
//! bytes. Logical slot `i` lives in arena entry `(base + i) % 200`; shifting
//! the window left only resets one record and advances `base`.
//!
//! Invariant: for every slot `i < len`, `block(i).index == first_index + i`.

use quanta::Instant;
use std::time::Duration;

use crate::codec::{FecCodec, FecError};
use crate::wire::{
    BlockScheme, VideoHeader, MAX_TOTAL_PACKETS_IN_BLOCK, MAX_VIDEO_PAYLOAD,
};

/// Number of pre-allocated block records.
pub const MAX_RXTX_BLOCKS_BUFFER: usize = 200;

/// Window capacity used until a stream tells us its bitrate.
pub const DEFAULT_WINDOW_CAPACITY: usize = 30;

// ─── Segment ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    #[default]
    Empty,
    Received,
}

/// One data or FEC packet slot of a block.
#[derive(Debug)]
pub struct Segment {
    pub state: SegmentState,
    payload: Vec<u8>,
    /// Number of times this segment was requested (0 = never).
    pub retry_count: u8,
    pub first_retry_at: Option<Instant>,
    pub last_retry_at: Option<Instant>,
}

impl Segment {
    fn new() -> Self {
        Segment {
            state: SegmentState::Empty,
            payload: Vec::with_capacity(MAX_VIDEO_PAYLOAD),
            retry_count: 0,
            first_retry_at: None,
            last_retry_at: None,
        }
    }

    fn reset(&mut self) {
        self.state = SegmentState::Empty;
        self.payload.clear();
        self.retry_count = 0;
        self.first_retry_at = None;
        self.last_retry_at = None;
    }

    #[inline]
    pub fn is_received(&self) -> bool {
        self.state == SegmentState::Received
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.retry_count > 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn store(&mut self, data: &[u8]) {
        self.payload.clear();
        self.payload.extend_from_slice(data);
        self.state = SegmentState::Received;
    }
}

// ─── Video Block ────────────────────────────────────────────────────────────

/// Result of inserting a packet into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Duplicate,
    /// Packet scheme differs from the scheme the block started with.
    SchemeMismatch,
}

/// One FEC coding unit being reassembled.
#[derive(Debug)]
pub struct VideoBlock {
    index: Option<u32>,
    scheme: BlockScheme,
    segments: Vec<Segment>,
    received_data: usize,
    received_fec: usize,
    highest_received: Option<u8>,
    first_packet_received_at: Option<Instant>,
    last_updated_at: Option<Instant>,
    /// Segments requested for this block so far, retries included.
    pub total_requested: u32,
}

impl VideoBlock {
    pub fn new() -> Self {
        VideoBlock {
            index: None,
            scheme: BlockScheme::default(),
            segments: (0..MAX_TOTAL_PACKETS_IN_BLOCK).map(|_| Segment::new()).collect(),
            received_data: 0,
            received_fec: 0,
            highest_received: None,
            first_packet_received_at: None,
            last_updated_at: None,
            total_requested: 0,
        }
    }

    pub fn reset(&mut self) {
        let used = self.scheme.total_packets().min(MAX_TOTAL_PACKETS_IN_BLOCK);
        for seg in &mut self.segments[..used] {
            seg.reset();
        }
        self.index = None;
        self.scheme = BlockScheme::default();
        self.received_data = 0;
        self.received_fec = 0;
        self.highest_received = None;
        self.first_packet_received_at = None;
        self.last_updated_at = None;
        self.total_requested = 0;
    }

    /// Claim the record for `index` without any packet (back-fill).
    fn assign(&mut self, index: u32, now: Instant) {
        if self.index.is_none() {
            self.index = Some(index);
            self.last_updated_at = Some(now);
        }
    }

    #[inline]
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    #[inline]
    pub fn scheme(&self) -> BlockScheme {
        self.scheme
    }

    /// Whether any packet was ever received for this block.
    #[inline]
    pub fn has_scheme(&self) -> bool {
        self.scheme.data_packets > 0
    }

    #[inline]
    pub fn received_data(&self) -> usize {
        self.received_data
    }

    #[inline]
    pub fn received_fec(&self) -> usize {
        self.received_fec
    }

    #[inline]
    pub fn highest_received(&self) -> Option<u8> {
        self.highest_received
    }

    #[inline]
    pub fn first_packet_received_at(&self) -> Option<Instant> {
        self.first_packet_received_at
    }

    #[inline]
    pub fn last_updated_at(&self) -> Option<Instant> {
        self.last_updated_at
    }

    /// Reference time for age eviction: first packet, else back-fill time.
    pub fn age_reference(&self) -> Option<Instant> {
        self.first_packet_received_at.or(self.last_updated_at)
    }

    pub fn age(&self, now: Instant) -> Duration {
        self.age_reference()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// All data segments present.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.has_scheme() && self.received_data >= self.scheme.data_packets as usize
    }

    /// Enough data + FEC segments present to restore every data segment.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.has_scheme()
            && self.received_data + self.received_fec >= self.scheme.data_packets as usize
    }

    /// Data segments not (yet) present.
    pub fn missing_data(&self) -> usize {
        (self.scheme.data_packets as usize).saturating_sub(self.received_data)
    }

    pub fn segment(&self, packet_index: usize) -> Option<&Segment> {
        if packet_index < self.scheme.total_packets() {
            self.segments.get(packet_index)
        } else {
            None
        }
    }

    pub fn segment_mut(&mut self, packet_index: usize) -> Option<&mut Segment> {
        if packet_index < self.scheme.total_packets() {
            self.segments.get_mut(packet_index)
        } else {
            None
        }
    }

    /// Store a validated packet.
    pub fn insert(&mut self, header: &VideoHeader, payload: &[u8], now: Instant) -> InsertResult {
        if !self.has_scheme() {
            self.scheme = header.scheme;
        } else if self.scheme != header.scheme {
            return InsertResult::SchemeMismatch;
        }
        let idx = header.packet_index as usize;
        let Some(seg) = self.segments.get_mut(idx) else {
            return InsertResult::SchemeMismatch;
        };
        if seg.is_received() {
            return InsertResult::Duplicate;
        }
        seg.store(payload);
        if header.is_data_packet() {
            self.received_data += 1;
        } else {
            self.received_fec += 1;
        }
        self.highest_received = Some(
            self.highest_received
                .map_or(header.packet_index, |h| h.max(header.packet_index)),
        );
        if self.first_packet_received_at.is_none() {
            self.first_packet_received_at = Some(now);
        }
        self.last_updated_at = Some(now);
        InsertResult::Inserted
    }

    /// Restore the missing data segments with FEC.
    ///
    /// Requires `received_data + received_fec >= data_packets` and at least one
    /// missing data segment. Only as many FEC segments as there are missing
    /// data segments are handed to the codec. Returns the number of FEC
    /// segments used.
    pub fn reconstruct(&mut self, codec: &dyn FecCodec) -> Result<usize, FecError> {
        let data_count = self.scheme.data_packets as usize;
        let fec_count = self.scheme.fec_packets as usize;
        if !self.is_recoverable() {
            return Err(FecError::Shape("block is not recoverable"));
        }
        if self.is_complete() {
            return Ok(0);
        }

        let missing: Vec<usize> = (0..data_count)
            .filter(|&i| !self.segments[i].is_received())
            .collect();
        let present_data: Vec<(usize, &[u8])> = (0..data_count)
            .filter(|&i| self.segments[i].is_received())
            .map(|i| (i, self.segments[i].payload()))
            .collect();
        let present_fec: Vec<(usize, &[u8])> = (0..fec_count)
            .filter(|&i| self.segments[data_count + i].is_received())
            .take(missing.len())
            .map(|i| (i, self.segments[data_count + i].payload()))
            .collect();
        let used = present_fec.len();

        let restored =
            codec.decode(data_count, fec_count, &present_data, &present_fec, &missing)?;
        for (idx, shard) in restored {
            if let Some(seg) = self.segments.get_mut(idx) {
                if !seg.is_received() {
                    seg.store(&shard);
                    self.received_data += 1;
                }
            }
        }
        Ok(used)
    }

    /// Present data segments in ascending packet order.
    pub fn data_segments(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        let data = (self.scheme.data_packets as usize).min(MAX_TOTAL_PACKETS_IN_BLOCK);
        self.segments[..data]
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_received())
            .map(|(i, s)| (i as u8, s.payload()))
    }
}

impl Default for VideoBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Window Capacity ────────────────────────────────────────────────────────

/// Window capacity in blocks for a stream.
///
/// Enough blocks to hold `window_ms` of video at `bitrate_bps` plus 50 ms of
/// slack, times 2.5, capped below the arena size.
pub fn compute_window_capacity(
    window_ms: u32,
    scheme: BlockScheme,
    bitrate_bps: u32,
) -> usize {
    let pl = scheme.packet_length as u64;
    let dc = scheme.data_packets as u64;
    let br = bitrate_bps as u64;
    let win = window_ms as u64;

    let mut blocks = if pl == 0 || dc == 0 || br == 0 || win == 0 {
        5
    } else {
        let bytes = br / 1000 * win / 8;
        2 + bytes / pl / dc
    };
    if br > 0 {
        let ms_per_block = 8000 * pl * dc / br;
        if ms_per_block > 0 {
            blocks += 50 / ms_per_block;
        }
    }
    let blocks = (blocks as f64 * 2.5) as usize;
    blocks.clamp(2, MAX_RXTX_BLOCKS_BUFFER - 1)
}

// ─── Reception Window ───────────────────────────────────────────────────────

/// Ordered, bounded run of consecutive blocks over a fixed arena.
pub struct ReceptionWindow {
    arena: Vec<VideoBlock>,
    base: usize,
    len: usize,
    capacity: usize,
}

impl ReceptionWindow {
    pub fn new(capacity: usize) -> Self {
        ReceptionWindow {
            arena: (0..MAX_RXTX_BLOCKS_BUFFER).map(|_| VideoBlock::new()).collect(),
            base: 0,
            len: 0,
            capacity: capacity.clamp(1, MAX_RXTX_BLOCKS_BUFFER - 1),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity. Only allowed while empty.
    pub fn set_capacity(&mut self, capacity: usize) -> bool {
        if !self.is_empty() {
            return false;
        }
        self.capacity = capacity.clamp(1, MAX_RXTX_BLOCKS_BUFFER - 1);
        true
    }

    #[inline]
    fn arena_slot(&self, slot: usize) -> usize {
        (self.base + slot) % MAX_RXTX_BLOCKS_BUFFER
    }

    pub fn get(&self, slot: usize) -> Option<&VideoBlock> {
        if slot < self.len {
            Some(&self.arena[self.arena_slot(slot)])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut VideoBlock> {
        if slot < self.len {
            let idx = self.arena_slot(slot);
            Some(&mut self.arena[idx])
        } else {
            None
        }
    }

    /// Block index of slot 0.
    pub fn first_index(&self) -> Option<u32> {
        self.get(0).and_then(|b| b.index())
    }

    /// Block index of the newest slot.
    pub fn top_index(&self) -> Option<u32> {
        self.len
            .checked_sub(1)
            .and_then(|s| self.get(s))
            .and_then(|b| b.index())
    }

    pub fn newest(&self) -> Option<&VideoBlock> {
        self.len.checked_sub(1).and_then(|s| self.get(s))
    }

    /// Slot that `block_index` maps to, if not before slot 0.
    pub fn slot_of(&self, block_index: u32) -> Option<usize> {
        let first = self.first_index()?;
        block_index.checked_sub(first).map(|d| d as usize)
    }

    /// Open an empty window at `block_index`.
    pub fn start(&mut self, block_index: u32, now: Instant) {
        debug_assert!(self.is_empty());
        self.clear();
        let idx = self.arena_slot(0);
        self.arena[idx].assign(block_index, now);
        self.len = 1;
    }

    /// Grow the window to cover `slot`, back-filling untouched slots.
    /// Returns false if `slot` lies beyond the capacity.
    pub fn extend_to(&mut self, slot: usize, now: Instant) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let Some(first) = self.first_index() else {
            return false;
        };
        while self.len <= slot {
            let idx = self.arena_slot(self.len);
            self.arena[idx].reset();
            self.arena[idx].assign(first.wrapping_add(self.len as u32), now);
            self.len += 1;
        }
        true
    }

    /// Drop slot 0 and shift the window left by one.
    pub fn pop_front(&mut self) {
        if self.len == 0 {
            return;
        }
        let idx = self.arena_slot(0);
        self.arena[idx].reset();
        self.base = (self.base + 1) % MAX_RXTX_BLOCKS_BUFFER;
        self.len -= 1;
    }

    pub fn clear(&mut self) {
        for slot in 0..self.len {
            let idx = self.arena_slot(slot);
            self.arena[idx].reset();
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &VideoBlock> + '_ {
        (0..self.len).map(move |s| &self.arena[self.arena_slot(s)])
    }
}

impl Default for ReceptionWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReedSolomonCodec;

    fn header(block: u32, idx: u8, scheme: BlockScheme) -> VideoHeader {
        VideoHeader::new(block, idx, scheme)
    }

    fn shards(scheme: BlockScheme) -> Vec<Vec<u8>> {
        let data: Vec<Vec<u8>> = (0..scheme.data_packets)
            .map(|i| vec![i.wrapping_mul(17); scheme.packet_length as usize])
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let fec = ReedSolomonCodec
            .encode(&refs, scheme.fec_packets as usize)
            .unwrap();
        data.into_iter().chain(fec).collect()
    }

    // ─── Block Tests ────────────────────────────────────────────────────

    #[test]
    fn insert_counts_data_and_fec() {
        let now = Instant::now();
        let scheme = BlockScheme::new(16, 4, 2);
        let mut block = VideoBlock::new();
        assert_eq!(
            block.insert(&header(1, 0, scheme), &[0; 16], now),
            InsertResult::Inserted
        );
        assert_eq!(
            block.insert(&header(1, 5, scheme), &[0; 16], now),
            InsertResult::Inserted
        );
        assert_eq!(
            block.insert(&header(1, 0, scheme), &[0; 16], now),
            InsertResult::Duplicate
        );
        assert_eq!(block.received_data(), 1);
        assert_eq!(block.received_fec(), 1);
        assert_eq!(block.highest_received(), Some(5));
        assert!(!block.is_recoverable());
    }

    #[test]
    fn scheme_change_mid_block_rejected() {
        let now = Instant::now();
        let mut block = VideoBlock::new();
        block.insert(&header(1, 0, BlockScheme::new(16, 4, 2)), &[0; 16], now);
        let res = block.insert(&header(1, 1, BlockScheme::new(16, 6, 2)), &[0; 16], now);
        assert_eq!(res, InsertResult::SchemeMismatch);
    }

    #[test]
    fn reconstruct_restores_missing_data() {
        let now = Instant::now();
        let scheme = BlockScheme::new(32, 4, 2);
        let all = shards(scheme);
        let mut block = VideoBlock::new();
        for idx in [0u8, 2, 3, 4, 5] {
            block.insert(&header(9, idx, scheme), &all[idx as usize], now);
        }
        assert!(block.is_recoverable());
        assert!(!block.is_complete());

        let used = block.reconstruct(&ReedSolomonCodec).unwrap();
        assert_eq!(used, 1);
        assert!(block.is_complete());
        let out: Vec<_> = block.data_segments().map(|(i, d)| (i, d.to_vec())).collect();
        assert_eq!(out.len(), 4);
        for (i, d) in out {
            assert_eq!(d, all[i as usize]);
        }
    }

    #[test]
    fn reconstruct_requires_enough_segments() {
        let now = Instant::now();
        let scheme = BlockScheme::new(8, 4, 2);
        let mut block = VideoBlock::new();
        block.insert(&header(1, 0, scheme), &[1; 8], now);
        block.insert(&header(1, 4, scheme), &[1; 8], now);
        assert!(block.reconstruct(&ReedSolomonCodec).is_err());
    }

    #[test]
    fn reset_clears_block() {
        let now = Instant::now();
        let scheme = BlockScheme::new(8, 2, 1);
        let mut block = VideoBlock::new();
        block.insert(&header(3, 0, scheme), &[1; 8], now);
        block.reset();
        assert_eq!(block.index(), None);
        assert_eq!(block.received_data(), 0);
        assert!(block.segment(0).is_none());
    }

    // ─── Window Tests ───────────────────────────────────────────────────

    #[test]
    fn window_backfills_consecutive_indices() {
        let now = Instant::now();
        let mut w = ReceptionWindow::new(10);
        w.start(100, now);
        assert!(w.extend_to(4, now));
        assert_eq!(w.len(), 5);
        for (i, b) in w.iter().enumerate() {
            assert_eq!(b.index(), Some(100 + i as u32));
        }
        assert_eq!(w.top_index(), Some(104));
        assert!(!w.extend_to(10, now));
    }

    #[test]
    fn window_wraps_arena() {
        let now = Instant::now();
        let mut w = ReceptionWindow::new(5);
        w.start(0, now);
        for next in 1..500u32 {
            assert!(w.extend_to(1, now));
            w.pop_front();
            assert_eq!(w.first_index(), Some(next));
        }
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn slot_lookup() {
        let now = Instant::now();
        let mut w = ReceptionWindow::new(8);
        assert_eq!(w.slot_of(5), None);
        w.start(10, now);
        assert_eq!(w.slot_of(9), None);
        assert_eq!(w.slot_of(13), Some(3));
        assert!(w.get(1).is_none());
    }

    #[test]
    fn capacity_only_changes_while_empty() {
        let now = Instant::now();
        let mut w = ReceptionWindow::new(8);
        w.start(0, now);
        assert!(!w.set_capacity(20));
        w.clear();
        assert!(w.set_capacity(500));
        assert_eq!(w.capacity(), MAX_RXTX_BLOCKS_BUFFER - 1);
    }

    #[test]
    fn window_capacity_formula() {
        // 4 Mbps, 140 ms window, 8 x 1100 byte blocks
        let cap = compute_window_capacity(140, BlockScheme::new(1100, 8, 4), 4_000_000);
        assert_eq!(cap, 27);
        // unknown bitrate falls back to five blocks
        assert_eq!(compute_window_capacity(140, BlockScheme::new(1100, 8, 4), 0), 12);
        // huge window is capped
        let cap = compute_window_capacity(1275, BlockScheme::new(100, 1, 1), 50_000_000);
        assert_eq!(cap, MAX_RXTX_BLOCKS_BUFFER - 1);
    }
}
