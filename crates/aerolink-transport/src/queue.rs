//! # Outbound Packet Queue
//!
//! Fixed-capacity circular queue of serialized packets awaiting transmission
//! on the uplink. Bulk traffic (retransmission requests) is appended at the
//! tail; urgent control traffic (level and keyframe switches) is injected at
//! the head so it overtakes everything already queued.
//!
//! The ring never reallocates. A full queue rejects `push` (the caller drops
//! the packet); `inject_first` instead evicts the newest tail packet.

use bytes::Bytes;
use quanta::Instant;
use serde::Serialize;
use thiserror::Error;

/// Default queue capacity in packets.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Returned by [`OutboundQueue::push`] when no slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound queue full ({capacity} packets)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Queue counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub injected: u64,
    pub dequeued: u64,
    /// `push` calls rejected because the queue was full.
    pub dropped_full: u64,
    /// Tail packets evicted by `inject_first` on a full queue.
    pub evicted: u64,
    pub depth: usize,
    pub max_depth: usize,
}

#[derive(Debug)]
struct Entry {
    packet: Bytes,
    enqueued_at: Instant,
}

/// Fixed-size circular packet queue.
pub struct OutboundQueue {
    slots: Vec<Option<Entry>>,
    head: usize,
    len: usize,
    stats: QueueStats,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        OutboundQueue {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            stats: QueueStats::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
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
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[inline]
    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity()
    }

    /// Append a packet at the tail.
    pub fn push(&mut self, packet: Bytes, now: Instant) -> Result<(), QueueFull> {
        if self.is_full() {
            self.stats.dropped_full += 1;
            return Err(QueueFull {
                capacity: self.capacity(),
            });
        }
        let idx = self.slot(self.len);
        self.slots[idx] = Some(Entry {
            packet,
            enqueued_at: now,
        });
        self.len += 1;
        self.stats.enqueued += 1;
        self.track_depth();
        Ok(())
    }

    /// Insert a packet at the head, ahead of everything queued.
    pub fn inject_first(&mut self, packet: Bytes, now: Instant) {
        if self.is_full() {
            let tail = self.slot(self.len - 1);
            self.slots[tail] = None;
            self.len -= 1;
            self.stats.evicted += 1;
            tracing::debug!(capacity = self.capacity(), "queue full, evicted tail for control packet");
        }
        let cap = self.capacity();
        self.head = (self.head + cap - 1) % cap;
        self.slots[self.head] = Some(Entry {
            packet,
            enqueued_at: now,
        });
        self.len += 1;
        self.stats.injected += 1;
        self.track_depth();
    }

    /// Remove and return the head packet.
    pub fn pop(&mut self) -> Option<Bytes> {
        if self.len == 0 {
            return None;
        }
        let entry = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        self.stats.dequeued += 1;
        self.stats.depth = self.len;
        entry.map(|e| e.packet)
    }

    /// Packet at `offset` from the head without removing it.
    pub fn peek(&self, offset: usize) -> Option<&Bytes> {
        if offset >= self.len {
            return None;
        }
        self.slots[self.slot(offset)].as_ref().map(|e| &e.packet)
    }

    /// Enqueue time of the current head packet.
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref().map(|e| e.enqueued_at)
    }

    /// Drop every queued packet.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
        self.stats.depth = 0;
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn track_depth(&mut self) {
        self.stats.depth = self.len;
        self.stats.max_depth = self.stats.max_depth.max(self.len);
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
