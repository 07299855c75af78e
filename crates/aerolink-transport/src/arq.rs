//! # ARQ — Retransmission Request Tracking
//!
//! Station-side bookkeeping for selective retransmission. The pipeline
//! decides *what* to request (see `receiver`); this module paces requests,
//! remembers what was asked, matches retransmitted packets against the
//! outstanding requests, and keeps round-trip statistics.
//!
//! ## Key design decisions
//!
//! - **Adaptive pacing**: 10 ms between requests, growing by 1 ms per request
//!   up to 20 ms, back to 10 ms after a 400 ms quiet gap
//! - **Bounded pending list**: at most 100 outstanding requests, oldest
//!   dropped first
//! - **RTT on first receipt only**: duplicate answers are counted, not timed

use quanta::Instant;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::wire::RequestedSegment;

/// Outstanding requests kept for RTT matching.
pub const MAX_PENDING_REQUESTS: usize = 100;

/// Samples in the rolling RTT average.
pub const RTT_HISTORY_SAMPLES: usize = 20;

const PACING_MIN: Duration = Duration::from_millis(10);
const PACING_MAX: Duration = Duration::from_millis(20);
const PACING_RESET_GAP: Duration = Duration::from_millis(400);

// ─── Request Pacer ──────────────────────────────────────────────────────────

/// Decides when the next retransmission request may go out.
#[derive(Debug, Clone)]
pub struct RequestPacer {
    interval: Duration,
    last_request_at: Option<Instant>,
}

impl RequestPacer {
    pub fn new() -> Self {
        RequestPacer {
            interval: PACING_MIN,
            last_request_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_request_at {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.interval,
        }
    }

    pub fn on_request_sent(&mut self, now: Instant) {
        let gap = self
            .last_request_at
            .map(|t| now.saturating_duration_since(t));
        self.interval = match gap {
            Some(g) if g <= PACING_RESET_GAP => {
                (self.interval + Duration::from_millis(1)).min(PACING_MAX)
            }
            _ => PACING_MIN,
        };
        self.last_request_at = Some(now);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── RTT Statistics ─────────────────────────────────────────────────────────

/// Round-trip statistics of retransmission requests, in microseconds.
#[derive(Debug, Clone, Serialize)]
pub struct RttStats {
    pub last_us: Option<u64>,
    pub min_us: Option<u64>,
    pub max_us: Option<u64>,
    #[serde(skip)]
    samples: [u64; RTT_HISTORY_SAMPLES],
    #[serde(skip)]
    next: usize,
    pub sample_count: u64,
}

impl RttStats {
    pub fn new() -> Self {
        RttStats {
            last_us: None,
            min_us: None,
            max_us: None,
            samples: [0; RTT_HISTORY_SAMPLES],
            next: 0,
            sample_count: 0,
        }
    }

    pub fn record(&mut self, rtt: Duration) {
        let us = rtt.as_micros() as u64;
        self.last_us = Some(us);
        self.min_us = Some(self.min_us.map_or(us, |m| m.min(us)));
        self.max_us = Some(self.max_us.map_or(us, |m| m.max(us)));
        self.samples[self.next] = us;
        self.next = (self.next + 1) % RTT_HISTORY_SAMPLES;
        self.sample_count += 1;
    }

    /// Average over the last [`RTT_HISTORY_SAMPLES`] samples.
    pub fn avg_us(&self) -> Option<u64> {
        let n = (self.sample_count as usize).min(RTT_HISTORY_SAMPLES);
        if n == 0 {
            return None;
        }
        let sum: u64 = if n == RTT_HISTORY_SAMPLES {
            self.samples.iter().sum()
        } else {
            self.samples[..n].iter().sum()
        };
        Some(sum / n as u64)
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Pending Requests ───────────────────────────────────────────────────────

/// One requested segment and what came back for it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSegment {
    pub block_index: u32,
    pub packet_index: u8,
    pub retry_count: u8,
    pub received_count: u32,
    #[serde(skip)]
    pub received_at: Option<Instant>,
}

/// A retransmission request awaiting answers.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub request_id: u32,
    #[serde(skip)]
    pub sent_at: Instant,
    pub segments: Vec<PendingSegment>,
    pub received_segments: usize,
    pub min_rtt_us: Option<u64>,
    pub max_rtt_us: Option<u64>,
}

impl PendingRequest {
    pub fn is_satisfied(&self) -> bool {
        self.received_segments >= self.segments.len()
    }
}

/// Outcome of matching a retransmitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMatch {
    /// First answer for the segment; RTT recorded.
    First { rtt: Duration, completed: bool },
    /// Segment already answered before.
    Duplicate,
    /// No pending request carries this id and segment.
    Unmatched,
}

/// Retransmission counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetransmissionStats {
    pub requests_sent: u64,
    pub segments_requested: u64,
    pub segments_retried: u64,
    pub segments_received: u64,
    pub duplicate_responses: u64,
    pub unmatched_responses: u64,
    pub requests_completed: u64,
    pub requests_dropped: u64,
}

/// Pending request list plus RTT accounting.
pub struct RetransmissionTracker {
    next_request_id: u32,
    pending: VecDeque<PendingRequest>,
    rtt: RttStats,
    stats: RetransmissionStats,
}

impl RetransmissionTracker {
    pub fn new() -> Self {
        RetransmissionTracker {
            next_request_id: 1,
            pending: VecDeque::with_capacity(MAX_PENDING_REQUESTS),
            rtt: RttStats::new(),
            stats: RetransmissionStats::default(),
        }
    }

    /// Allocate the next request id.
    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// Remember a request that was just enqueued.
    pub fn record_request(&mut self, request_id: u32, now: Instant, segments: &[RequestedSegment]) {
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            if let Some(old) = self.pending.pop_front() {
                self.stats.requests_dropped += 1;
                tracing::debug!(request_id = old.request_id, "pending request list full, dropped oldest");
            }
        }
        self.stats.requests_sent += 1;
        self.stats.segments_requested += segments.len() as u64;
        self.stats.segments_retried += segments.iter().filter(|s| s.retry_count > 1).count() as u64;
        self.pending.push_back(PendingRequest {
            request_id,
            sent_at: now,
            segments: segments
                .iter()
                .map(|s| PendingSegment {
                    block_index: s.block_index,
                    packet_index: s.packet_index,
                    retry_count: s.retry_count,
                    received_count: 0,
                    received_at: None,
                })
                .collect(),
            received_segments: 0,
            min_rtt_us: None,
            max_rtt_us: None,
        });
    }

    /// Match a retransmitted packet carrying `request_id`.
    pub fn on_response(
        &mut self,
        request_id: u32,
        block_index: u32,
        packet_index: u8,
        now: Instant,
    ) -> ResponseMatch {
        let Some(pos) = self.pending.iter().position(|r| r.request_id == request_id) else {
            self.stats.unmatched_responses += 1;
            return ResponseMatch::Unmatched;
        };
        let req = &mut self.pending[pos];
        let Some(seg) = req
            .segments
            .iter_mut()
            .find(|s| s.block_index == block_index && s.packet_index == packet_index)
        else {
            self.stats.unmatched_responses += 1;
            return ResponseMatch::Unmatched;
        };

        seg.received_count += 1;
        if seg.received_count > 1 {
            self.stats.duplicate_responses += 1;
            return ResponseMatch::Duplicate;
        }
        seg.received_at = Some(now);
        let rtt = now.saturating_duration_since(req.sent_at);
        let us = rtt.as_micros() as u64;
        req.received_segments += 1;
        req.min_rtt_us = Some(req.min_rtt_us.map_or(us, |m| m.min(us)));
        req.max_rtt_us = Some(req.max_rtt_us.map_or(us, |m| m.max(us)));
        self.rtt.record(rtt);
        self.stats.segments_received += 1;

        let completed = req.is_satisfied();
        if completed {
            self.pending.remove(pos);
            self.stats.requests_completed += 1;
        }
        ResponseMatch::First { rtt, completed }
    }

    /// Purge requests older than `window`; incomplete ones count as dropped.
    pub fn purge_expired(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.pending.len();
        let mut dropped = 0u64;
        self.pending.retain(|r| {
            let keep = now.saturating_duration_since(r.sent_at) <= window;
            if !keep && !r.is_satisfied() {
                dropped += 1;
            }
            keep
        });
        self.stats.requests_dropped += dropped;
        before - self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn find(&self, request_id: u32) -> Option<&PendingRequest> {
        self.pending.iter().find(|r| r.request_id == request_id)
    }

    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    pub fn stats(&self) -> &RetransmissionStats {
        &self.stats
    }

    /// Forget all pending requests (stream reset). Counters are kept.
    pub fn clear_pending(&mut self) {
        self.stats.requests_dropped += self.pending.iter().filter(|r| !r.is_satisfied()).count() as u64;
        self.pending.clear();
    }
}

impl Default for RetransmissionTracker {
    fn default() -> Self {
        Self::new()
    }
}
