//! # Snapshot Publication
//!
//! The station loop is the only writer of pipeline state. Readers (metrics
//! server, status dumps, tests) see it through a [`PipelineSnapshot`]
//! published into an [`ArcSwap`]: loading is wait-free and never blocks the
//! loop.
//!
//! Every publication carries a monotonically increasing sequence number and
//! an FNV-1a checksum of the snapshot's JSON encoding so a reader can tell a
//! fresh, intact snapshot from a stale one.

use std::sync::Arc;

use arc_swap::ArcSwap;
use quanta::Instant;
use serde::Serialize;

use aerolink_transport::arq::{RetransmissionStats, RttStats};
use aerolink_transport::history::IntervalCounters;
use aerolink_transport::queue::{OutboundQueue, QueueStats};
use aerolink_transport::receiver::{ReliabilityPipelineState, StreamInfo};
use aerolink_transport::stats::{OutputSlice, PipelineStats};

use crate::adaptation::{KeyframeController, KeyframeStatus, QualityController, QualityStatus};
use crate::net::interface::InterfaceMetrics;
use crate::net::selector::{LinkSelector, SelectorStats};

/// Closed adaptive intervals included in a snapshot.
const SNAPSHOT_INTERVALS: usize = 10;

/// Pending request as reported to readers.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub request_id: u32,
    pub segments: usize,
    pub received_segments: usize,
    pub min_rtt_us: Option<u64>,
    pub max_rtt_us: Option<u64>,
}

/// Point-in-time view of the station.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub stream: Option<StreamInfo>,
    pub stats: PipelineStats,
    pub retransmissions: RetransmissionStats,
    /// False while the uplink is lost, whatever the stream flags say.
    pub retransmissions_active: bool,
    pub uplink_lost: bool,
    pub rtt: RttStats,
    pub rtt_avg_us: Option<u64>,
    pub pending: Vec<PendingSummary>,
    pub window_depth: usize,
    pub window_capacity: usize,
    pub last_output_block: Option<u32>,
    pub queue: QueueStats,
    pub quality: QualityStatus,
    pub keyframe: KeyframeStatus,
    pub interfaces: Vec<InterfaceMetrics>,
    pub selector: SelectorStats,
    /// Output history, oldest slice first.
    pub slices: Vec<OutputSlice>,
    /// Latest closed adaptive intervals, newest first.
    pub recent_intervals: Vec<IntervalCounters>,
}

impl PipelineSnapshot {
    /// Capture the current state. `slices` is the cached output history,
    /// refreshed by the caller on every slice roll.
    pub fn capture(
        pipe: &ReliabilityPipelineState,
        quality: &QualityController,
        keyframe: &KeyframeController,
        queue: &OutboundQueue,
        selector: &LinkSelector,
        slices: &[OutputSlice],
        now: Instant,
    ) -> Self {
        let rtt = pipe.rtt().clone();
        PipelineSnapshot {
            stream: pipe.stream_info().cloned(),
            stats: pipe.stats().clone(),
            retransmissions: pipe.retransmission_stats().clone(),
            retransmissions_active: pipe.retransmissions_active() && !pipe.uplink_lost(),
            uplink_lost: pipe.uplink_lost(),
            rtt_avg_us: rtt.avg_us(),
            rtt,
            pending: pipe
                .pending_requests()
                .map(|p| PendingSummary {
                    request_id: p.request_id,
                    segments: p.segments.len(),
                    received_segments: p.received_segments,
                    min_rtt_us: p.min_rtt_us,
                    max_rtt_us: p.max_rtt_us,
                })
                .collect(),
            window_depth: pipe.window().len(),
            window_capacity: pipe.window().capacity(),
            last_output_block: pipe.last_output_block(),
            queue: queue.stats().clone(),
            quality: quality.status(now),
            keyframe: keyframe.status(),
            interfaces: selector.interface_metrics(now),
            selector: selector.stats().clone(),
            slices: slices.to_vec(),
            recent_intervals: pipe.history().recent(SNAPSHOT_INTERVALS),
        }
    }
}

// ─── Publication ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Published {
    pub sequence: u64,
    pub checksum: u64,
    pub snapshot: Option<PipelineSnapshot>,
}

impl Published {
    /// Recompute the checksum and compare.
    pub fn verify(&self) -> bool {
        checksum_of(&self.snapshot) == self.checksum
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ *b as u64).wrapping_mul(FNV_PRIME))
}

fn checksum_of(snapshot: &Option<PipelineSnapshot>) -> u64 {
    match serde_json::to_vec(snapshot) {
        Ok(json) => fnv1a(&json),
        Err(e) => {
            tracing::warn!(error = %e, "snapshot encoding failed");
            0
        }
    }
}

/// Read side, cheap to clone and share across threads.
#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<ArcSwap<Published>>,
}

impl SnapshotHandle {
    pub fn load(&self) -> Arc<Published> {
        self.inner.load_full()
    }

    pub fn sequence(&self) -> u64 {
        self.inner.load().sequence
    }
}

/// Single writer of snapshots.
pub struct SnapshotPublisher {
    inner: Arc<ArcSwap<Published>>,
    sequence: u64,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let empty = Published {
            sequence: 0,
            checksum: checksum_of(&None),
            snapshot: None,
        };
        SnapshotPublisher {
            inner: Arc::new(ArcSwap::from_pointee(empty)),
            sequence: 0,
        }
    }

    pub fn handle(&self) -> SnapshotHandle {
        SnapshotHandle {
            inner: self.inner.clone(),
        }
    }

    /// Publish and return the new sequence number.
    pub fn publish(&mut self, snapshot: PipelineSnapshot) -> u64 {
        self.sequence += 1;
        let snapshot = Some(snapshot);
        let checksum = checksum_of(&snapshot);
        self.inner.store(Arc::new(Published {
            sequence: self.sequence,
            checksum,
            snapshot,
        }));
        self.sequence
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}
