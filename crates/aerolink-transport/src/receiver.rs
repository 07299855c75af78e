//! # Reliability Pipeline
//!
//! Pure logic, no I/O. The station loop feeds decoded video packets in; the
//! pipeline reassembles FEC blocks in a bounded reception window, forwards
//! finished blocks in order to a [`VideoSink`], asks the vehicle for missing
//! segments through the [`OutboundQueue`], and keeps the interval counters
//! the adaptive controllers read.
//!
//! ## Responsibilities
//!
//! 1. **Validation**: drop size-invalid packets before touching any state
//! 2. **Stream tracking**: stream info, restart detection, window capacity
//! 3. **Ingest**: stale/duplicate filtering, back-fill, window overflow
//! 4. **Output**: in-order delivery of clean, reconstructed or bad blocks
//! 5. **Eviction**: age-based discard of blocks that can no longer be saved
//! 6. **Retransmission**: paced, bounded segment requests and RTT matching
//!
//! Every operation takes `now` explicitly; the pipeline never reads a clock.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

use crate::arq::{PendingRequest, RequestPacer, RetransmissionStats, RetransmissionTracker, RttStats};
use crate::block::{compute_window_capacity, InsertResult, ReceptionWindow, DEFAULT_WINDOW_CAPACITY};
use crate::codec::{FecCodec, FecError, ReedSolomonCodec};
use crate::history::{AdaptiveIntervalHistory, FLAG_WINDOW_DISCARD};
use crate::queue::OutboundQueue;
use crate::stats::{OutputHistory, PipelineStats};
use crate::wire::{
    retransmission_window_ms, BlockScheme, Packet, RequestedSegment, SegmentRequest, VideoHeader,
    VideoPacket, VideoProfile, ENCODING_ADAPTIVE_KEYFRAME, ENCODING_ADAPTIVE_VIDEO,
    ENCODING_MEDIUM_ADAPTIVE_ONLY, ENCODING_ONE_WAY_LINK, ENCODING_RETRANSMISSIONS,
    MAX_RETRANSMISSION_PACKETS_IN_REQUEST, MAX_TOTAL_PACKETS_IN_BLOCK, MAX_VIDEO_PAYLOAD,
};

/// Segments per request, leaving room in the wire packet.
pub const MAX_SEGMENTS_PER_REQUEST: usize = MAX_RETRANSMISSION_PACKETS_IN_REQUEST - 2;

/// Backward jump of the stream packet index that means the vehicle restarted.
pub const STREAM_RESTART_BACKWARD_JUMP: u32 = 10_000;

/// A block stops being requested after this many requests per segment.
const MAX_REQUESTS_PER_SEGMENT: usize = 4;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Station-side switch; the stream flags must also allow retransmissions.
    pub retransmissions_enabled: bool,
    /// Minimum age of a segment's last request before asking again.
    pub retry_timeout: Duration,
    /// Silence before the newest block is requested and the stall breaker fires.
    pub silence_request: Duration,
    /// No video for this long means the link is presumed dead.
    pub link_lost_timeout: Duration,
    /// No retransmission, ack or ping reply from the vehicle for this long
    /// means our uplink is not getting through.
    pub uplink_lost_timeout: Duration,
    /// Retransmission window used when the stream does not carry one.
    pub fallback_window_ms: u32,
    pub max_segments_per_request: usize,
    /// Blocks output per call at most.
    pub max_output_per_call: usize,
    pub stats_slice: Duration,
    pub stats_slices: usize,
    /// Stream id carried in outgoing requests.
    pub stream: u8,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            retransmissions_enabled: true,
            retry_timeout: Duration::from_millis(40),
            silence_request: Duration::from_millis(50),
            link_lost_timeout: Duration::from_millis(1000),
            uplink_lost_timeout: Duration::from_millis(3000),
            fallback_window_ms: 140,
            max_segments_per_request: MAX_SEGMENTS_PER_REQUEST,
            max_output_per_call: 20,
            stats_slice: Duration::from_millis(100),
            stats_slices: 30,
            stream: 0,
        }
    }
}

// ─── Video Sink ─────────────────────────────────────────────────────────────

/// Consumer of output data packets, called in ascending packet order.
pub trait VideoSink {
    fn forward(&mut self, block_index: u32, packet_index: u8, data: &[u8]);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl VideoSink for NullSink {
    fn forward(&mut self, _block_index: u32, _packet_index: u8, _data: &[u8]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPacket {
    pub block_index: u32,
    pub packet_index: u8,
    pub data: Vec<u8>,
}

/// Sink that keeps every forwarded packet.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub packets: Vec<ForwardedPacket>,
}

impl VideoSink for CollectingSink {
    fn forward(&mut self, block_index: u32, packet_index: u8, data: &[u8]) {
        self.packets.push(ForwardedPacket {
            block_index,
            packet_index,
            data: data.to_vec(),
        });
    }
}

// ─── Stream Info ────────────────────────────────────────────────────────────

/// What the vehicle currently sends, as seen in the latest video headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub profile: VideoProfile,
    pub scheme: BlockScheme,
    pub encoding_flags: u16,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub keyframe_ms: u16,
    pub video_bitrate_bps: u32,
    pub retransmission_window_ms: u32,
    pub packets_seen: u64,
}

impl StreamInfo {
    fn update(&mut self, h: &VideoHeader) {
        self.profile = h.profile;
        self.scheme = h.scheme;
        self.encoding_flags = h.encoding_flags;
        self.width = h.width;
        self.height = h.height;
        self.fps = h.fps;
        self.keyframe_ms = h.keyframe_ms;
        self.video_bitrate_bps = h.video_bitrate_bps;
        self.retransmission_window_ms = retransmission_window_ms(h.encoding_flags);
    }

    pub fn retransmissions_enabled(&self) -> bool {
        self.encoding_flags & ENCODING_RETRANSMISSIONS != 0
    }

    pub fn adaptive_video(&self) -> bool {
        self.encoding_flags & ENCODING_ADAPTIVE_VIDEO != 0
    }

    pub fn adaptive_keyframe(&self) -> bool {
        self.encoding_flags & ENCODING_ADAPTIVE_KEYFRAME != 0
    }

    pub fn one_way_link(&self) -> bool {
        self.encoding_flags & ENCODING_ONE_WAY_LINK != 0
    }

    pub fn medium_adaptive_only(&self) -> bool {
        self.encoding_flags & ENCODING_MEDIUM_ADAPTIVE_ONLY != 0
    }
}

// ─── Outcomes & Events ──────────────────────────────────────────────────────

/// What happened to one ingested packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
    /// Block already output (or before the window).
    Stale,
    /// Retransmitted packet outside the current window.
    OutsideWindow,
    /// Empty window and the packet is too far into its block to start one.
    NotStarted,
    Malformed,
}

/// Classification of an output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Clean,
    Reconstructed { fec_used: usize },
    Bad { lost: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// Only complete or recoverable blocks. If decoding still fails, the
    /// data that did arrive is forwarded.
    Ready,
    /// Anything; present data of bad blocks is still forwarded.
    BestEffort,
    /// Anything; data of bad blocks is dropped.
    Discard,
}

/// Events for the station loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StreamStarted(StreamInfo),
    StreamRestarted,
    WindowDiscarded {
        last_output_block: Option<u32>,
        reason: &'static str,
    },
}

fn validate(h: &VideoHeader, payload: &[u8]) -> Result<(), &'static str> {
    let s = h.scheme;
    if s.data_packets == 0 {
        return Err("no data packets in block");
    }
    if s.total_packets() > MAX_TOTAL_PACKETS_IN_BLOCK {
        return Err("too many packets in block");
    }
    if h.packet_index as usize >= s.total_packets() {
        return Err("packet index outside block");
    }
    if s.packet_length == 0 || s.packet_length as usize > MAX_VIDEO_PAYLOAD {
        return Err("packet length out of range");
    }
    if payload.len() != s.packet_length as usize {
        return Err("payload length mismatch");
    }
    Ok(())
}

// ─── Pipeline State ─────────────────────────────────────────────────────────

/// All mutable state of the reliability pipeline.
pub struct ReliabilityPipelineState {
    config: ReceiverConfig,
    codec: Box<dyn FecCodec>,
    window: ReceptionWindow,
    last_output_block: Option<u32>,
    tracker: RetransmissionTracker,
    pacer: RequestPacer,
    history: AdaptiveIntervalHistory,
    output_history: OutputHistory,
    stats: PipelineStats,
    stream: Option<StreamInfo>,
    last_stream_packet_index: Option<u32>,
    last_video_packet_at: Option<Instant>,
    /// Newest non-retransmitted `(block, packet)` seen.
    last_received: Option<(u32, u8)>,
    uplink_lost: bool,
    searching: bool,
    spectator: bool,
    can_tx: bool,
    events: Vec<PipelineEvent>,
}

impl ReliabilityPipelineState {
    pub fn new(config: ReceiverConfig) -> Self {
        Self::with_codec(config, Box::new(ReedSolomonCodec::new()))
    }

    pub fn with_codec(config: ReceiverConfig, codec: Box<dyn FecCodec>) -> Self {
        let output_history = OutputHistory::new(config.stats_slice, config.stats_slices);
        ReliabilityPipelineState {
            config,
            codec,
            window: ReceptionWindow::new(DEFAULT_WINDOW_CAPACITY),
            last_output_block: None,
            tracker: RetransmissionTracker::new(),
            pacer: RequestPacer::new(),
            history: AdaptiveIntervalHistory::new(),
            output_history,
            stats: PipelineStats::new(),
            stream: None,
            last_stream_packet_index: None,
            last_video_packet_at: None,
            last_received: None,
            uplink_lost: false,
            searching: false,
            spectator: false,
            can_tx: false,
            events: Vec::new(),
        }
    }

    // ─── Ingest ─────────────────────────────────────────────────────────

    /// Ingest one video packet, then output whatever became ready.
    pub fn on_video_packet(
        &mut self,
        packet: &VideoPacket,
        stream_packet_index: u32,
        now: Instant,
        sink: &mut dyn VideoSink,
    ) -> IngestOutcome {
        let h = &packet.header;
        self.stats.packets_received += 1;
        if let Err(reason) = validate(h, &packet.payload) {
            self.stats.malformed += 1;
            tracing::warn!(
                block = h.block_index,
                packet = h.packet_index,
                len = packet.payload.len(),
                reason,
                "dropping malformed video packet"
            );
            return IngestOutcome::Malformed;
        }

        self.track_stream(h, stream_packet_index, now);
        let outcome = self.ingest(h, &packet.payload, now, sink);

        if outcome == IngestOutcome::Inserted
            && !h.is_retransmitted()
            && h.can_tx()
            && h.packet_index as usize + 1 == h.scheme.total_packets()
        {
            self.can_tx = true;
        }

        self.output_ready_blocks(sink);
        self.forced_output(sink);
        outcome
    }

    fn track_stream(&mut self, h: &VideoHeader, stream_packet_index: u32, now: Instant) {
        let window_ms = retransmission_window_ms(h.encoding_flags);
        let restarted = match (&self.stream, self.last_stream_packet_index) {
            (Some(info), Some(last)) => {
                let jumped_back = last > stream_packet_index
                    && last - stream_packet_index > STREAM_RESTART_BACKWARD_JUMP;
                jumped_back || info.retransmission_window_ms != window_ms
            }
            _ => false,
        };
        if restarted {
            tracing::info!(
                last_stream_packet = self.last_stream_packet_index,
                stream_packet_index,
                window_ms,
                "video stream restarted, resetting reception state"
            );
            self.full_reset();
            self.events.push(PipelineEvent::StreamRestarted);
        }

        if let Some(info) = self.stream.as_mut() {
            info.packets_seen += 1;
            if !h.is_retransmitted() {
                if info.scheme != h.scheme {
                    tracing::debug!(
                        block = h.block_index,
                        data = h.scheme.data_packets,
                        fec = h.scheme.fec_packets,
                        "FEC scheme changed"
                    );
                }
                info.update(h);
            }
        } else {
            let mut info = StreamInfo::default();
            info.update(h);
            info.packets_seen = 1;
            let capacity = compute_window_capacity(
                self.window_ms_for(info.retransmission_window_ms),
                info.scheme,
                info.video_bitrate_bps,
            );
            self.window.set_capacity(capacity);
            tracing::info!(
                profile = ?info.profile,
                data = info.scheme.data_packets,
                fec = info.scheme.fec_packets,
                packet_length = info.scheme.packet_length,
                bitrate = info.video_bitrate_bps,
                window_ms = info.retransmission_window_ms,
                capacity = self.window.capacity(),
                "video stream started"
            );
            self.events.push(PipelineEvent::StreamStarted(info.clone()));
            self.stream = Some(info);
        }
        self.last_stream_packet_index = Some(stream_packet_index);
        self.last_video_packet_at = Some(now);
    }

    fn ingest(
        &mut self,
        h: &VideoHeader,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn VideoSink,
    ) -> IngestOutcome {
        let block_index = h.block_index;

        if h.is_retransmitted() {
            self.stats.retransmitted_received += 1;
            self.tracker
                .on_response(h.request_id, block_index, h.packet_index, now);
            let inside = match (self.window.first_index(), self.window.top_index()) {
                (Some(first), Some(top)) => block_index >= first && block_index <= top,
                _ => false,
            };
            if !inside {
                self.stats.retransmitted_ignored += 1;
                tracing::trace!(block = block_index, packet = h.packet_index, "retransmission outside window");
                return IngestOutcome::OutsideWindow;
            }
        }

        if self.last_output_block.is_some_and(|last| block_index <= last) {
            self.stats.stale += 1;
            tracing::trace!(block = block_index, packet = h.packet_index, "stale packet");
            return IngestOutcome::Stale;
        }

        if self.window.is_empty() && !self.open_window(h, now) {
            return IngestOutcome::NotStarted;
        }

        let Some(mut slot) = self.window.slot_of(block_index) else {
            self.stats.stale += 1;
            return IngestOutcome::Stale;
        };
        if slot >= self.window.capacity() {
            self.handle_overflow(block_index, now, sink);
            if self.window.is_empty() && !self.open_window(h, now) {
                return IngestOutcome::NotStarted;
            }
            slot = match self.window.slot_of(block_index) {
                Some(s) if s < self.window.capacity() => s,
                _ => {
                    tracing::warn!(block = block_index, "block still outside window after overflow");
                    self.stats.stale += 1;
                    return IngestOutcome::Stale;
                }
            };
        }
        self.window.extend_to(slot, now);

        let Some(block) = self.window.get_mut(slot) else {
            return IngestOutcome::Stale;
        };
        match block.insert(h, payload, now) {
            InsertResult::Inserted => {}
            InsertResult::Duplicate => {
                self.stats.duplicates += 1;
                return IngestOutcome::Duplicate;
            }
            InsertResult::SchemeMismatch => {
                self.stats.malformed += 1;
                tracing::debug!(block = block_index, packet = h.packet_index, "packet scheme differs from its block");
                return IngestOutcome::Malformed;
            }
        }

        if h.is_retransmitted() {
            self.output_history.current_mut().retransmitted_packets += 1;
        } else if self
            .last_received
            .is_none_or(|last| (block_index, h.packet_index) > last)
        {
            self.last_received = Some((block_index, h.packet_index));
        }
        IngestOutcome::Inserted
    }

    /// Open the empty window for the block of `h`.
    ///
    /// The window restarts at the block after the last output one so skipped
    /// blocks get back-filled and requested; a gap wider than the window is
    /// skipped outright. A block may only start at a packet index up to its
    /// FEC count; otherwise nothing moves.
    fn open_window(&mut self, h: &VideoHeader, now: Instant) -> bool {
        let block_index = h.block_index;
        let expected = self
            .last_output_block
            .map_or(block_index, |l| l.wrapping_add(1))
            .min(block_index);
        let gap = (block_index - expected) as usize;
        let skip = gap >= self.window.capacity();
        let start = if skip { block_index } else { expected };

        if start == block_index && h.packet_index > h.scheme.fec_packets {
            self.stats.refused_start += 1;
            tracing::trace!(block = block_index, packet = h.packet_index, "refusing to start window mid-block");
            return false;
        }
        if skip {
            self.discard_window(Some(block_index), "gap", &mut NullSink);
        }
        self.window.start(start, now);
        true
    }

    /// Make room for `block_index`, which lies beyond the window capacity.
    pub fn handle_overflow(&mut self, block_index: u32, _now: Instant, sink: &mut dyn VideoSink) {
        let capacity = self.window.capacity();
        let Some(slot) = self.window.slot_of(block_index) else {
            return;
        };
        if slot < capacity {
            return;
        }
        let overflow = slot + 1 - capacity;
        let top_slot = self.window.len().saturating_sub(1);
        let limit = capacity * 2 / 3;

        if overflow > limit || slot - top_slot > limit {
            self.discard_window(Some(block_index), "overflow", sink);
            return;
        }

        for _ in 0..overflow {
            self.output_front(OutputMode::Discard, sink);
        }
        let lookahead = 2 + capacity / 10;
        for _ in 0..lookahead {
            if self.window.get(0).is_none_or(|b| b.is_recoverable()) {
                break;
            }
            self.output_front(OutputMode::Discard, sink);
        }
        tracing::debug!(block = block_index, overflow, "window overflow, pushed out oldest blocks");
    }

    /// Push out every block. With `resume_at`, output continues at that block.
    fn discard_window(&mut self, resume_at: Option<u32>, reason: &'static str, sink: &mut dyn VideoSink) {
        let dropped = self.window.len();
        while !self.window.is_empty() {
            self.output_front(OutputMode::Discard, sink);
        }
        if let Some(resume) = resume_at {
            let skip_to = resume.wrapping_sub(1);
            if self.last_output_block.is_none_or(|l| l < skip_to) {
                self.last_output_block = Some(skip_to);
                self.stats.last_output_block = Some(skip_to);
            }
        }
        self.stats.window_discards += 1;
        self.history.set_flag(FLAG_WINDOW_DISCARD);
        tracing::info!(
            blocks = dropped,
            reason,
            last_output = self.last_output_block,
            "reception window discarded"
        );
        self.events.push(PipelineEvent::WindowDiscarded {
            last_output_block: self.last_output_block,
            reason,
        });
    }

    // ─── Output ─────────────────────────────────────────────────────────

    /// Output slot 0 if it is complete or recoverable.
    pub fn output_first_block(&mut self, sink: &mut dyn VideoSink) -> Option<BlockOutcome> {
        self.output_front(OutputMode::Ready, sink)
    }

    /// Output slot 0 regardless of completeness, forwarding what is present.
    pub fn force_output_first_block(&mut self, sink: &mut dyn VideoSink) -> Option<BlockOutcome> {
        self.output_front(OutputMode::BestEffort, sink)
    }

    fn output_front(&mut self, mode: OutputMode, sink: &mut dyn VideoSink) -> Option<BlockOutcome> {
        let fallback_data = self
            .stream
            .as_ref()
            .map_or(0, |s| s.scheme.data_packets as usize);
        let block = self.window.get_mut(0)?;
        let index = block.index()?;
        let ready = block.is_recoverable();
        if mode == OutputMode::Ready && !ready {
            return None;
        }

        let outcome = if block.is_complete() {
            BlockOutcome::Clean
        } else if ready {
            match block.reconstruct(self.codec.as_ref()) {
                Ok(fec_used) => BlockOutcome::Reconstructed { fec_used },
                Err(e) => {
                    self.stats.fec_failures += 1;
                    match e {
                        FecError::Shape(_) => {
                            tracing::warn!(block = index, error = %e, "FEC reconstruction failed")
                        }
                        FecError::Codec(_) | FecError::Erasure(_) => {
                            tracing::error!(block = index, error = %e, "FEC reconstruction failed")
                        }
                    }
                    BlockOutcome::Bad {
                        lost: block.missing_data(),
                    }
                }
            }
        } else if block.has_scheme() {
            BlockOutcome::Bad {
                lost: block.missing_data(),
            }
        } else {
            BlockOutcome::Bad {
                lost: fallback_data,
            }
        };

        let is_bad = matches!(outcome, BlockOutcome::Bad { .. });
        let mut forwarded = 0u64;
        if !is_bad || mode != OutputMode::Discard {
            for (packet_index, data) in block.data_segments() {
                sink.forward(index, packet_index, data);
                forwarded += 1;
            }
        }
        if is_bad && mode == OutputMode::Discard {
            self.stats.discarded_blocks += 1;
        }

        let interval = self.history.current_mut();
        let slice = self.output_history.current_mut();
        match outcome {
            BlockOutcome::Clean => {
                self.stats.blocks_clean += 1;
                interval.clean_blocks += 1;
                slice.clean += 1;
            }
            BlockOutcome::Reconstructed { fec_used } => {
                self.stats.blocks_reconstructed += 1;
                interval.reconstructed_blocks += 1;
                slice.reconstructed += 1;
                slice.max_fec_used = slice.max_fec_used.max(fec_used as u8);
            }
            BlockOutcome::Bad { lost } => {
                self.stats.blocks_bad += 1;
                self.stats.lost_packets += lost as u64;
                interval.bad_blocks += 1;
                interval.missing_segments += lost as u32;
                slice.bad += 1;
                slice.missing_packets += lost as u32;
                tracing::debug!(block = index, lost, "block output incomplete");
            }
        }
        self.stats.forwarded_packets += forwarded;
        self.last_output_block = Some(index);
        self.stats.last_output_block = Some(index);
        self.window.pop_front();
        Some(outcome)
    }

    /// Output every ready block at the front of the window.
    pub fn output_ready_blocks(&mut self, sink: &mut dyn VideoSink) -> usize {
        let mut n = 0;
        while n < self.config.max_output_per_call {
            if self.output_front(OutputMode::Ready, sink).is_none() {
                break;
            }
            n += 1;
        }
        n
    }

    /// Without a working uplink nothing will be retransmitted, so blocks
    /// behind the newest are output best-effort.
    fn forced_output(&mut self, sink: &mut dyn VideoSink) -> usize {
        if self.retransmissions_active() && !self.uplink_lost {
            return 0;
        }
        let mut n = 0;
        while self.window.len() > 1 && n < self.config.max_output_per_call {
            if self.output_front(OutputMode::BestEffort, sink).is_none() {
                break;
            }
            n += 1;
        }
        n
    }

    // ─── Eviction ───────────────────────────────────────────────────────

    /// Push out blocks that waited longer than the retransmission window.
    ///
    /// If even the newest block is older than 1.5 windows the whole window
    /// goes. Otherwise the newest expired block and everything before it
    /// is pushed out.
    pub fn evict_expired(&mut self, now: Instant, sink: &mut dyn VideoSink) -> usize {
        let Some(newest) = self.window.newest() else {
            return 0;
        };
        let window = self.retransmission_window();
        if newest.age(now) > window * 3 / 2 {
            let n = self.window.len();
            self.discard_window(None, "expired", sink);
            return n;
        }

        let expired = (0..self.window.len())
            .rev()
            .find(|&slot| self.window.get(slot).is_some_and(|b| b.age(now) > window));
        let Some(slot) = expired else {
            return 0;
        };
        for _ in 0..=slot {
            self.output_front(OutputMode::Discard, sink);
        }
        tracing::debug!(blocks = slot + 1, "evicted expired blocks");
        slot + 1
    }

    // ─── Retransmission Requests ────────────────────────────────────────

    fn requests_allowed(&self, now: Instant) -> bool {
        !self.searching
            && !self.spectator
            && self.retransmissions_active()
            && self
                .last_video_packet_at
                .is_some_and(|t| now.saturating_duration_since(t) <= self.config.link_lost_timeout)
    }

    /// Build and enqueue one retransmission request for missing segments.
    ///
    /// Returns the request id when a request was queued.
    pub fn request_missing_segments(&mut self, now: Instant, queue: &mut OutboundQueue) -> Option<u32> {
        if !self.pacer.is_due(now) || !self.requests_allowed(now) {
            return None;
        }
        let silence = self
            .last_video_packet_at
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        let silent = silence >= self.config.silence_request;
        let max = self
            .config
            .max_segments_per_request
            .min(MAX_RETRANSMISSION_PACKETS_IN_REQUEST);
        let retry_timeout = self.config.retry_timeout;
        let backoff_cap = retry_timeout.saturating_sub(Duration::from_millis(10));

        let mut segments: Vec<RequestedSegment> = Vec::with_capacity(max);
        let mut retried = 0u32;
        let len = self.window.len();

        'blocks: for slot in 0..len {
            if segments.len() >= max {
                break;
            }
            let is_top = slot + 1 == len;
            let Some(block) = self.window.get_mut(slot) else {
                break;
            };
            let Some(block_index) = block.index() else {
                continue;
            };
            if !block.has_scheme() || block.is_recoverable() {
                continue;
            }
            let scheme = block.scheme();
            let data = scheme.data_packets as usize;
            let total = scheme.total_packets();
            if block.total_requested as usize >= total * MAX_REQUESTS_PER_SEGMENT {
                continue;
            }
            let limit = if is_top {
                let idle = block
                    .last_updated_at()
                    .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                if idle < self.config.silence_request {
                    continue;
                }
                block.highest_received().map_or(0, |h| h as usize)
            } else {
                total
            };

            // Segments asked for before and still missing.
            for idx in 0..limit {
                if segments.len() >= max {
                    break 'blocks;
                }
                let Some(seg) = block.segment_mut(idx) else {
                    break;
                };
                if seg.is_received() || !seg.is_requested() {
                    continue;
                }
                let due = seg
                    .last_retry_at
                    .is_none_or(|t| now.saturating_duration_since(t) >= retry_timeout);
                if !due {
                    continue;
                }
                seg.retry_count = seg.retry_count.saturating_add(1);
                let backoff = (Duration::from_millis(5) * seg.retry_count as u32).min(backoff_cap);
                seg.last_retry_at = Some(now.checked_sub(backoff).unwrap_or(now));
                segments.push(RequestedSegment {
                    block_index,
                    packet_index: idx as u8,
                    retry_count: seg.retry_count,
                });
                block.total_requested += 1;
                retried += 1;
            }

            let outstanding = (0..total)
                .filter(|&i| block.segment(i).is_some_and(|s| !s.is_received() && s.is_requested()))
                .count();

            // Never-requested data segments, as many as reconstruction needs.
            let mut needed = data.saturating_sub(block.received_data() + block.received_fec() + outstanding);
            for idx in 0..data.min(limit) {
                if needed == 0 {
                    break;
                }
                if segments.len() >= max {
                    break 'blocks;
                }
                let Some(seg) = block.segment_mut(idx) else {
                    break;
                };
                if seg.is_received() || seg.is_requested() {
                    continue;
                }
                seg.retry_count = 1;
                seg.first_retry_at = Some(now);
                seg.last_retry_at = Some(now);
                segments.push(RequestedSegment {
                    block_index,
                    packet_index: idx as u8,
                    retry_count: 1,
                });
                block.total_requested += 1;
                needed -= 1;
            }

            // FEC segments: half of the FEC share of the missing data.
            let ec_target = block.missing_data() * scheme.fec_packets as usize / data / 2;
            let ec_outstanding = (data..total)
                .filter(|&i| block.segment(i).is_some_and(|s| !s.is_received() && s.is_requested()))
                .count();
            let mut ec_needed = ec_target.saturating_sub(ec_outstanding);
            for idx in data..total.min(limit) {
                if ec_needed == 0 {
                    break;
                }
                if segments.len() >= max {
                    break 'blocks;
                }
                let Some(seg) = block.segment_mut(idx) else {
                    break;
                };
                if seg.is_received() || seg.is_requested() {
                    continue;
                }
                seg.retry_count = 1;
                seg.first_retry_at = Some(now);
                seg.last_retry_at = Some(now);
                segments.push(RequestedSegment {
                    block_index,
                    packet_index: idx as u8,
                    retry_count: 1,
                });
                block.total_requested += 1;
                ec_needed -= 1;
            }
        }

        if silent && segments.len() < max {
            if let Some(next) = self.stall_breaker_segment(now, &segments) {
                segments.push(next);
            }
        }

        if segments.is_empty() {
            return None;
        }

        let request_id = self.tracker.next_request_id();
        let request = SegmentRequest {
            request_id,
            stream: self.config.stream,
            segments,
        };
        let wire = Packet::RequestSegments(request.clone()).encode(0).freeze();
        if let Err(e) = queue.push(wire, now) {
            self.stats.requests_queue_full += 1;
            tracing::warn!(request_id, error = %e, "dropping retransmission request");
            return None;
        }

        self.tracker.record_request(request_id, now, &request.segments);
        self.pacer.on_request_sent(now);
        let interval = self.history.current_mut();
        interval.requested_segments += request.segments.len() as u32;
        interval.retried_segments += retried;
        tracing::trace!(
            request_id,
            segments = request.segments.len(),
            retried,
            "retransmission request queued"
        );
        Some(request_id)
    }

    /// The segment after the newest one received, to break a stall.
    fn stall_breaker_segment(&mut self, now: Instant, queued: &[RequestedSegment]) -> Option<RequestedSegment> {
        let (block_index, packet_index) = self.last_received?;
        let total = self.stream.as_ref().map_or(0, |s| s.scheme.total_packets());
        let mut next = if (packet_index as usize) + 1 < total {
            (block_index, packet_index + 1)
        } else {
            (block_index.wrapping_add(1), 0)
        };
        if let Some(last) = self.last_output_block {
            if next.0 <= last {
                next = (last.wrapping_add(1), 0);
            }
        }
        if queued
            .iter()
            .any(|s| s.block_index == next.0 && s.packet_index == next.1)
        {
            return None;
        }
        if let Some(slot) = self.window.slot_of(next.0) {
            if let Some(seg) = self
                .window
                .get_mut(slot)
                .and_then(|b| b.segment_mut(next.1 as usize))
            {
                if seg.is_received() || seg.is_requested() {
                    return None;
                }
                seg.retry_count = 1;
                seg.first_retry_at = Some(now);
                seg.last_retry_at = Some(now);
            }
        }
        Some(RequestedSegment {
            block_index: next.0,
            packet_index: next.1,
            retry_count: 1,
        })
    }

    // ─── Periodic ───────────────────────────────────────────────────────

    /// Housekeeping once per loop iteration: stats slice refresh, pending
    /// request purge, age eviction, forced output. Returns true when an
    /// output stats slice was closed.
    pub fn periodic(&mut self, now: Instant, sink: &mut dyn VideoSink) -> bool {
        let rolled = self.output_history.refresh(now);
        let window = self.retransmission_window();
        self.tracker.purge_expired(now, window);
        self.evict_expired(now, sink);
        self.forced_output(sink);
        rolled
    }

    /// Close the current adaptive interval.
    pub fn close_interval(&mut self) {
        let missing = self.missing_data_segments() as u32;
        self.history.advance(missing);
    }

    /// Data segments missing from every block but the newest.
    pub fn missing_data_segments(&self) -> usize {
        let len = self.window.len();
        self.window
            .iter()
            .take(len.saturating_sub(1))
            .filter(|b| b.has_scheme())
            .map(|b| b.missing_data())
            .sum()
    }

    /// Drop all reception state. Lifetime counters survive.
    pub fn full_reset(&mut self) {
        self.window.clear();
        self.last_output_block = None;
        self.tracker.clear_pending();
        self.pacer.reset();
        self.history.reset();
        self.stream = None;
        self.last_stream_packet_index = None;
        self.last_video_packet_at = None;
        self.last_received = None;
        self.can_tx = false;
        self.stats.full_resets += 1;
        self.stats.last_output_block = None;
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    fn window_ms_for(&self, stream_window_ms: u32) -> u32 {
        if stream_window_ms > 0 {
            stream_window_ms
        } else {
            self.config.fallback_window_ms
        }
    }

    /// Retransmission window of the current stream.
    pub fn retransmission_window(&self) -> Duration {
        let ms = self.window_ms_for(self.stream.as_ref().map_or(0, |s| s.retransmission_window_ms));
        Duration::from_millis(ms as u64)
    }

    pub fn retransmissions_active(&self) -> bool {
        self.config.retransmissions_enabled
            && self
                .stream
                .as_ref()
                .is_some_and(|s| s.retransmissions_enabled() && !s.one_way_link())
    }

    pub fn set_uplink_lost(&mut self, lost: bool) {
        if lost != self.uplink_lost {
            tracing::info!(lost, "uplink state changed");
        }
        self.uplink_lost = lost;
    }

    pub fn uplink_lost(&self) -> bool {
        self.uplink_lost
    }

    pub fn set_searching(&mut self, searching: bool) {
        self.searching = searching;
    }

    pub fn set_spectator(&mut self, spectator: bool) {
        self.spectator = spectator;
    }

    /// Whether the vehicle signalled it listens for uplink; clears the flag.
    pub fn take_can_tx(&mut self) -> bool {
        std::mem::take(&mut self.can_tx)
    }

    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn window(&self) -> &ReceptionWindow {
        &self.window
    }

    pub fn last_output_block(&self) -> Option<u32> {
        self.last_output_block
    }

    pub fn last_video_packet_at(&self) -> Option<Instant> {
        self.last_video_packet_at
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn retransmission_stats(&self) -> &RetransmissionStats {
        self.tracker.stats()
    }

    pub fn rtt(&self) -> &RttStats {
        self.tracker.rtt()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &PendingRequest> {
        self.tracker.pending()
    }

    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    pub fn history(&self) -> &AdaptiveIntervalHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut AdaptiveIntervalHistory {
        &mut self.history
    }

    pub fn output_history(&self) -> &OutputHistory {
        &self.output_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encoding_flags_with_window, VIDEO_FLAG_CAN_TX, VIDEO_FLAG_RETRANSMITTED};
    use bytes::Bytes;

    const RETX: u16 = ENCODING_RETRANSMISSIONS | ENCODING_ADAPTIVE_VIDEO;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn flags(features: u16) -> u16 {
        encoding_flags_with_window(features, 140)
    }

    /// 100-byte packets at 100 kbit/s: 4+2 blocks give a 17-block window.
    fn scheme(data: u8, fec: u8) -> BlockScheme {
        BlockScheme::new(100, data, fec)
    }

    fn block_packets(block: u32, scheme: BlockScheme, features: u16) -> Vec<VideoPacket> {
        let data: Vec<Vec<u8>> = (0..scheme.data_packets)
            .map(|i| {
                (0..scheme.packet_length)
                    .map(|j| (block as u8).wrapping_mul(31) ^ i.wrapping_add(j as u8))
                    .collect()
            })
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let fec = ReedSolomonCodec
            .encode(&refs, scheme.fec_packets as usize)
            .unwrap();
        data.into_iter()
            .chain(fec)
            .enumerate()
            .map(|(i, payload)| {
                let mut header = VideoHeader::new(block, i as u8, scheme);
                header.encoding_flags = flags(features);
                header.video_bitrate_bps = 100_000;
                VideoPacket {
                    header,
                    payload: Bytes::from(payload),
                }
            })
            .collect()
    }

    struct Harness {
        pipe: ReliabilityPipelineState,
        sink: CollectingSink,
        queue: OutboundQueue,
        stream_index: u32,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                pipe: ReliabilityPipelineState::new(ReceiverConfig::default()),
                sink: CollectingSink::default(),
                queue: OutboundQueue::default(),
                stream_index: 0,
                t0: Instant::now(),
            }
        }

        fn at(&self, offset_ms: u64) -> Instant {
            self.t0 + ms(offset_ms)
        }

        fn send(&mut self, pkt: &VideoPacket, at_ms: u64) -> IngestOutcome {
            self.stream_index += 1;
            let now = self.at(at_ms);
            self.pipe
                .on_video_packet(pkt, self.stream_index, now, &mut self.sink)
        }

        fn send_indices(&mut self, pkts: &[VideoPacket], indices: &[usize], at_ms: u64) {
            for &i in indices {
                self.send(&pkts[i], at_ms);
            }
        }

        fn request(&mut self, at_ms: u64) -> Option<SegmentRequest> {
            let now = self.at(at_ms);
            self.pipe.request_missing_segments(now, &mut self.queue)?;
            let mut wire = self.queue.pop()?;
            match Packet::decode(&mut wire) {
                Some((_, Packet::RequestSegments(req))) => Some(req),
                _ => None,
            }
        }
    }

    fn pairs(req: &SegmentRequest) -> Vec<(u32, u8, u8)> {
        req.segments
            .iter()
            .map(|s| (s.block_index, s.packet_index, s.retry_count))
            .collect()
    }

    // ─── Ingest Tests ───────────────────────────────────────────────────

    #[test]
    fn clean_blocks_forwarded_in_order() {
        let mut h = Harness::new();
        for b in 0..4 {
            let pkts = block_packets(b, scheme(4, 2), RETX);
            for p in &pkts {
                h.send(p, b as u64);
            }
        }
        assert_eq!(h.pipe.window().capacity(), 17);
        let order: Vec<(u32, u8)> = h
            .sink
            .packets
            .iter()
            .map(|p| (p.block_index, p.packet_index))
            .collect();
        let expected: Vec<(u32, u8)> = (0..4).flat_map(|b| (0..4).map(move |i| (b, i))).collect();
        assert_eq!(order, expected);
        assert_eq!(h.pipe.stats().blocks_clean, 4);
        // FEC packets arrive after their block was output
        assert_eq!(h.pipe.stats().stale, 8);
        assert_eq!(h.pipe.last_output_block(), Some(3));
        assert!(h.pipe.window().is_empty());
    }

    #[test]
    fn malformed_packet_touches_nothing() {
        let mut h = Harness::new();
        let mut pkt = block_packets(0, scheme(4, 2), RETX).remove(0);
        pkt.payload = Bytes::from_static(&[0u8; 10]);
        assert_eq!(h.send(&pkt, 0), IngestOutcome::Malformed);
        assert!(h.pipe.stream_info().is_none());
        assert_eq!(h.pipe.stats().malformed, 1);

        let mut pkt = block_packets(0, scheme(4, 2), RETX).remove(0);
        pkt.header.packet_index = 6;
        assert_eq!(h.send(&pkt, 0), IngestOutcome::Malformed);
    }

    #[test]
    fn empty_window_refuses_mid_block_start() {
        let mut h = Harness::new();
        let pkts = block_packets(5, scheme(4, 2), RETX);
        assert_eq!(h.send(&pkts[3], 0), IngestOutcome::NotStarted);
        assert!(h.pipe.window().is_empty());
        assert_eq!(h.send(&pkts[2], 0), IngestOutcome::Inserted);
        assert_eq!(h.pipe.window().first_index(), Some(5));
    }

    #[test]
    fn duplicates_ignored() {
        let mut h = Harness::new();
        let pkts = block_packets(0, scheme(4, 2), RETX);
        assert_eq!(h.send(&pkts[0], 0), IngestOutcome::Inserted);
        assert_eq!(h.send(&pkts[0], 1), IngestOutcome::Duplicate);
        assert_eq!(h.pipe.stats().duplicates, 1);
        assert_eq!(h.pipe.window().get(0).unwrap().received_data(), 1);
    }

    #[test]
    fn skipped_blocks_are_backfilled() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        h.send_indices(&b0, &[0, 1, 2, 3], 0);
        let b3 = block_packets(3, scheme(4, 2), RETX);
        h.send(&b3[0], 1);

        let w = h.pipe.window();
        assert_eq!(w.len(), 3);
        assert_eq!(w.first_index(), Some(1));
        assert_eq!(w.top_index(), Some(3));
        assert!(!w.get(0).unwrap().has_scheme());
        assert_eq!(w.get(0).unwrap().age_reference(), Some(h.at(1)));
    }

    #[test]
    fn reconstructs_when_fec_arrives() {
        let mut h = Harness::new();
        let pkts = block_packets(0, scheme(4, 2), RETX);
        h.send_indices(&pkts, &[0, 2, 3, 4], 0);
        assert_eq!(h.pipe.stats().blocks_reconstructed, 1);
        assert_eq!(h.sink.packets.len(), 4);
        assert_eq!(h.sink.packets[1].data, pkts[1].payload.to_vec());
        assert_eq!(h.pipe.history().current().reconstructed_blocks, 1);
    }

    // ─── Overflow & Eviction Tests ──────────────────────────────────────

    #[test]
    fn overflow_pushes_oldest_with_lookahead() {
        let mut h = Harness::new();
        for b in 0..11 {
            let pkts = block_packets(b, scheme(4, 2), RETX);
            h.send(&pkts[0], 0);
        }
        assert_eq!(h.pipe.window().len(), 11);

        let far = block_packets(17, scheme(4, 2), RETX);
        assert_eq!(h.send(&far[0], 1), IngestOutcome::Inserted);

        // one block for room plus three look-ahead blocks that cannot recover
        assert_eq!(h.pipe.last_output_block(), Some(3));
        assert_eq!(h.pipe.window().first_index(), Some(4));
        assert_eq!(h.pipe.stats().blocks_bad, 4);
        assert_eq!(h.pipe.stats().discarded_blocks, 4);
        assert_eq!(h.pipe.stats().window_discards, 0);
        assert!(h.sink.packets.is_empty());
    }

    #[test]
    fn far_block_discards_whole_window() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        h.send(&b0[0], 0);
        let far = block_packets(40, scheme(4, 2), RETX);
        h.send(&far[0], 1);

        assert_eq!(h.pipe.stats().window_discards, 1);
        assert_eq!(h.pipe.last_output_block(), Some(39));
        assert_eq!(h.pipe.window().first_index(), Some(40));
        let events = h.pipe.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::WindowDiscarded { reason: "overflow", .. })));
    }

    #[test]
    fn age_eviction_then_full_discard() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        let b1 = block_packets(1, scheme(4, 2), RETX);
        h.send(&b0[0], 0);
        h.send(&b1[0], 100);

        let now = h.at(150);
        assert_eq!(h.pipe.evict_expired(now, &mut h.sink), 1);
        assert_eq!(h.pipe.last_output_block(), Some(0));
        assert_eq!(h.pipe.window().len(), 1);

        let now = h.at(400);
        assert_eq!(h.pipe.evict_expired(now, &mut h.sink), 1);
        assert!(h.pipe.window().is_empty());
        assert_eq!(h.pipe.stats().window_discards, 1);
        assert_eq!(h.pipe.last_output_block(), Some(1));
    }

    #[test]
    fn forced_output_without_retransmissions() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), ENCODING_ADAPTIVE_VIDEO);
        let b1 = block_packets(1, scheme(4, 2), ENCODING_ADAPTIVE_VIDEO);
        h.send_indices(&b0, &[0, 1], 0);
        assert!(h.sink.packets.is_empty());
        h.send(&b1[0], 1);

        assert_eq!(h.pipe.stats().blocks_bad, 1);
        let got: Vec<(u32, u8)> = h.sink.packets.iter().map(|p| (p.block_index, p.packet_index)).collect();
        assert_eq!(got, vec![(0, 0), (0, 1)]);
        assert_eq!(h.pipe.stats().lost_packets, 2);
        assert!(h.request(2).is_none());
    }

    #[test]
    fn forced_output_while_uplink_lost() {
        let mut h = Harness::new();
        h.pipe.set_uplink_lost(true);
        let b0 = block_packets(0, scheme(4, 2), RETX);
        let b1 = block_packets(1, scheme(4, 2), RETX);
        h.send(&b0[0], 0);
        h.send(&b1[0], 1);
        assert_eq!(h.pipe.last_output_block(), Some(0));
        assert_eq!(h.sink.packets.len(), 1);
    }

    // ─── Request Tests ──────────────────────────────────────────────────

    #[test]
    fn requests_missing_data_and_half_fec_share() {
        let mut h = Harness::new();
        let b10 = block_packets(10, scheme(8, 4), RETX);
        let b11 = block_packets(11, scheme(8, 4), RETX);
        h.send_indices(&b10, &[0, 1, 2, 3], 0);
        h.send_indices(&b11, &[0, 1, 2, 3, 4, 5, 6, 7], 0);

        let req = h.request(1).unwrap();
        // 4 missing data * 4 fec / 8 data / 2 = 1 FEC packet
        assert_eq!(
            pairs(&req),
            vec![(10, 4, 1), (10, 5, 1), (10, 6, 1), (10, 7, 1), (10, 8, 1)]
        );
        assert_eq!(h.pipe.history().current().requested_segments, 5);
        assert_eq!(h.pipe.pending_requests().count(), 1);
    }

    #[test]
    fn rerequests_after_retry_timeout_with_backoff() {
        let mut h = Harness::new();
        let b10 = block_packets(10, scheme(8, 4), RETX);
        let b11 = block_packets(11, scheme(8, 4), RETX);
        h.send_indices(&b10, &[0, 1, 2, 3], 0);
        h.send_indices(&b11, &[0], 0);

        // b11 is the newest block and still fresh
        assert_eq!(h.request(0).unwrap().segments.len(), 5);
        assert!(h.request(20).is_none());

        h.send(&b11[1], 30);
        let req = h.request(40).unwrap();
        assert!(req.segments.iter().all(|s| s.retry_count == 2));
        assert_eq!(req.segments.len(), 5);
        assert_eq!(h.pipe.history().current().retried_segments, 5);

        // next due at 40 - 10 + 40 = 70
        h.send(&b11[2], 60);
        assert!(h.request(65).is_none());
        let req = h.request(70).unwrap();
        assert!(req.segments.iter().all(|s| s.retry_count == 3 && s.block_index == 10));
    }

    #[test]
    fn newest_block_requested_only_below_highest_after_silence() {
        let mut h = Harness::new();
        let pkts = block_packets(0, scheme(4, 2), RETX);
        h.send_indices(&pkts, &[0, 1, 3], 0);

        assert!(h.request(10).is_none());
        let req = h.request(60).unwrap();
        // packet 2 is below the highest seen; packet 4 comes from the stall breaker
        assert_eq!(pairs(&req), vec![(0, 2, 1), (0, 4, 1)]);
    }

    #[test]
    fn stall_breaker_asks_for_next_block() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        for p in &b0 {
            h.send(p, 0);
        }
        assert!(h.pipe.window().is_empty());
        let req = h.request(60).unwrap();
        assert_eq!(pairs(&req), vec![(1, 0, 1)]);
    }

    #[test]
    fn request_size_is_bounded() {
        let mut h = Harness::new();
        for b in 0..10 {
            let pkts = block_packets(b, scheme(8, 4), RETX);
            h.send(&pkts[0], 0);
        }
        let req = h.request(1).unwrap();
        assert_eq!(req.segments.len(), MAX_SEGMENTS_PER_REQUEST);
    }

    #[test]
    fn no_requests_when_link_presumed_dead_or_spectating() {
        let mut h = Harness::new();
        for b in 0..3 {
            let pkts = block_packets(b, scheme(4, 2), RETX);
            h.send(&pkts[0], 0);
        }
        assert!(h.request(1100).is_none());

        h.pipe.set_spectator(true);
        assert!(h.request(1).is_none());
        h.pipe.set_spectator(false);
        h.pipe.set_searching(true);
        assert!(h.request(1).is_none());
        h.pipe.set_searching(false);
        assert!(h.request(1).is_some());
    }

    #[test]
    fn retransmitted_packet_matches_request() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        let b1 = block_packets(1, scheme(4, 2), RETX);
        h.send_indices(&b0, &[0, 2], 0);
        h.send(&b1[0], 0);
        let req = h.request(1).unwrap();
        assert_eq!(pairs(&req), vec![(0, 1, 1), (0, 3, 1), (0, 4, 1)]);

        let answer = |idx: usize| {
            let mut p = b0[idx].clone();
            p.header.flags |= VIDEO_FLAG_RETRANSMITTED;
            p.header.request_id = req.request_id;
            p
        };
        assert_eq!(h.send(&answer(1), 13), IngestOutcome::Inserted);
        assert_eq!(h.send(&answer(3), 13), IngestOutcome::Inserted);
        assert_eq!(h.pipe.stats().blocks_clean, 1);
        // block 0 is already out, the FEC answer only completes the request
        assert_eq!(h.send(&answer(4), 13), IngestOutcome::OutsideWindow);
        assert_eq!(h.pipe.retransmission_stats().requests_completed, 1);
        assert_eq!(h.pipe.rtt().last_us, Some(12_000));

        let mut late = b0[1].clone();
        late.header.flags |= VIDEO_FLAG_RETRANSMITTED;
        assert_eq!(h.send(&late, 20), IngestOutcome::OutsideWindow);
    }

    // ─── Stream Tests ───────────────────────────────────────────────────

    #[test]
    fn backward_jump_resets_state() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        h.stream_index = 50_000;
        h.send(&b0[0], 0);
        h.pipe.drain_events();

        h.stream_index = 10;
        let b7 = block_packets(7, scheme(4, 2), RETX);
        h.send(&b7[0], 1);
        let events = h.pipe.drain_events();
        assert_eq!(events[0], PipelineEvent::StreamRestarted);
        assert!(matches!(events[1], PipelineEvent::StreamStarted(_)));
        assert_eq!(h.pipe.stats().full_resets, 1);
        assert_eq!(h.pipe.window().first_index(), Some(7));
    }

    #[test]
    fn window_change_resets_state() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        h.send(&b0[0], 0);
        let mut p = b0[1].clone();
        p.header.encoding_flags = encoding_flags_with_window(RETX, 200);
        h.send(&p, 1);
        assert_eq!(h.pipe.stats().full_resets, 1);
        assert_eq!(h.pipe.stream_info().unwrap().retransmission_window_ms, 200);
    }

    #[test]
    fn can_tx_set_by_last_packet_of_block() {
        let mut h = Harness::new();
        let mut pkts = block_packets(0, scheme(4, 2), RETX);
        for p in &mut pkts {
            p.header.flags |= VIDEO_FLAG_CAN_TX;
        }
        h.send_indices(&pkts, &[0, 1], 0);
        assert!(!h.pipe.take_can_tx());
        let mut b1 = block_packets(1, scheme(4, 2), RETX);
        b1[5].header.flags |= VIDEO_FLAG_CAN_TX;
        h.send(&b1[5], 0);
        assert!(h.pipe.take_can_tx());
        assert!(!h.pipe.take_can_tx());
    }

    #[test]
    fn closing_interval_records_missing_segments() {
        let mut h = Harness::new();
        let b0 = block_packets(0, scheme(4, 2), RETX);
        let b1 = block_packets(1, scheme(4, 2), RETX);
        h.send(&b0[0], 0);
        h.send(&b1[0], 0);
        assert_eq!(h.pipe.missing_data_segments(), 3);
        h.pipe.close_interval();
        assert_eq!(h.pipe.history().closed(1).unwrap().missing_segments, 3);
    }
}
