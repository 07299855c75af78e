//! # Pipeline Statistics
//!
//! Lifetime totals of the reliability pipeline and the sliced output history
//! shown by telemetry. All stats are designed for Prometheus export and JSON
//! serialization.

use quanta::Instant;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

// ─── Pipeline Totals ────────────────────────────────────────────────────────

/// Aggregate ingest/output statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Video packets handed to the pipeline.
    pub packets_received: u64,
    /// Of which carried the retransmitted flag.
    pub retransmitted_received: u64,
    /// Retransmitted packets outside the window, not ingested.
    pub retransmitted_ignored: u64,
    pub duplicates: u64,
    /// Packets for blocks already output.
    pub stale: u64,
    /// Packets that could not start an empty window.
    pub refused_start: u64,
    /// Packets failing validation.
    pub malformed: u64,

    pub blocks_clean: u64,
    pub blocks_reconstructed: u64,
    pub blocks_bad: u64,
    /// Data packets never forwarded because their block was lost.
    pub lost_packets: u64,
    /// Data packets passed to the video sink.
    pub forwarded_packets: u64,
    pub fec_failures: u64,

    /// Whole-window discards (overflow, gap or age).
    pub window_discards: u64,
    /// Blocks pushed out by overflow or age before being ready.
    pub discarded_blocks: u64,
    pub full_resets: u64,

    pub requests_queue_full: u64,
    pub last_output_block: Option<u32>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_output(&self) -> u64 {
        self.blocks_clean + self.blocks_reconstructed + self.blocks_bad
    }

    /// Fraction of output blocks that needed FEC or were lost.
    pub fn impaired_ratio(&self) -> f64 {
        let total = self.blocks_output();
        if total == 0 {
            0.0
        } else {
            (self.blocks_reconstructed + self.blocks_bad) as f64 / total as f64
        }
    }
}

// ─── Output History ─────────────────────────────────────────────────────────

/// Output counters of one stats slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputSlice {
    pub clean: u32,
    pub reconstructed: u32,
    pub bad: u32,
    pub missing_packets: u32,
    pub retransmitted_packets: u32,
    pub max_fec_used: u8,
}

/// Rolling history of output slices.
pub struct OutputHistory {
    slices: VecDeque<OutputSlice>,
    max_slices: usize,
    slice_duration: Duration,
    current: OutputSlice,
    slice_started_at: Option<Instant>,
}

impl OutputHistory {
    pub fn new(slice_duration: Duration, max_slices: usize) -> Self {
        OutputHistory {
            slices: VecDeque::with_capacity(max_slices),
            max_slices: max_slices.max(1),
            slice_duration,
            current: OutputSlice::default(),
            slice_started_at: None,
        }
    }

    pub fn current_mut(&mut self) -> &mut OutputSlice {
        &mut self.current
    }

    /// Close the current slice if its duration elapsed. Returns true when a
    /// slice was closed.
    pub fn refresh(&mut self, now: Instant) -> bool {
        let Some(started) = self.slice_started_at else {
            self.slice_started_at = Some(now);
            return false;
        };
        if now.saturating_duration_since(started) < self.slice_duration {
            return false;
        }
        if self.slices.len() >= self.max_slices {
            self.slices.pop_front();
        }
        self.slices.push_back(std::mem::take(&mut self.current));
        self.slice_started_at = Some(now);
        true
    }

    /// Closed slices, oldest first.
    pub fn slices(&self) -> impl Iterator<Item = &OutputSlice> {
        self.slices.iter()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn reset(&mut self) {
        self.slices.clear();
        self.current = OutputSlice::default();
        self.slice_started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impaired_ratio() {
        let mut s = PipelineStats::new();
        assert_eq!(s.impaired_ratio(), 0.0);
        s.blocks_clean = 6;
        s.blocks_reconstructed = 3;
        s.blocks_bad = 1;
        assert!((s.impaired_ratio() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn history_rolls_slices() {
        let t0 = Instant::now();
        let mut h = OutputHistory::new(Duration::from_millis(100), 3);
        assert!(!h.refresh(t0));
        h.current_mut().clean = 4;
        assert!(!h.refresh(t0 + Duration::from_millis(50)));
        assert!(h.refresh(t0 + Duration::from_millis(100)));
        assert_eq!(h.slices().next().unwrap().clean, 4);

        for i in 2..10u64 {
            h.current_mut().bad = i as u32;
            h.refresh(t0 + Duration::from_millis(100 * i));
        }
        assert_eq!(h.len(), 3);
        let last: Vec<u32> = h.slices().map(|s| s.bad).collect();
        assert_eq!(last, vec![7, 8, 9]);
    }

    #[test]
    fn serializes_to_json() {
        let s = PipelineStats {
            packets_received: 10,
            last_output_block: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"packets_received\":10"));
        assert!(json.contains("\"last_output_block\":3"));
    }
}
