//! # Adaptive Interval History
//!
//! Fixed ring of per-interval link counters shared by the two adaptive
//! controllers. One slot is open at a time; the station advances it once per
//! controller tick, independent of packet arrival. Controllers look back over
//! closed slots only.

use serde::Serialize;

/// Number of interval slots kept.
pub const ADAPTIVE_HISTORY_INTERVALS: usize = 200;

/// Interval flag: quality level shifted to a worse level.
pub const FLAG_QUALITY_DOWN: u8 = 0x01;
/// Interval flag: quality level shifted to a better level.
pub const FLAG_QUALITY_UP: u8 = 0x02;
/// Interval flag: keyframe interval shortened.
pub const FLAG_KEYFRAME_DOWN: u8 = 0x04;
/// Interval flag: keyframe interval lengthened.
pub const FLAG_KEYFRAME_UP: u8 = 0x08;
/// Interval flag: the reception window was discarded.
pub const FLAG_WINDOW_DISCARD: u8 = 0x10;

/// Counters of one controller interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntervalCounters {
    pub clean_blocks: u32,
    pub reconstructed_blocks: u32,
    pub bad_blocks: u32,
    pub missing_segments: u32,
    pub requested_segments: u32,
    pub retried_segments: u32,
    pub flags: u8,
}

impl IntervalCounters {
    #[inline]
    pub fn has_missing(&self) -> bool {
        self.missing_segments > 0 || self.bad_blocks > 0
    }
}

/// Activity counts over a look-back of closed intervals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookbackSummary {
    /// Intervals examined.
    pub intervals: usize,
    /// Intervals with at least one FEC-reconstructed block.
    pub reconstructed: usize,
    /// Intervals with at least one segment requested.
    pub retransmissions: usize,
    /// Intervals with at least one segment requested again.
    pub re_retransmissions: usize,
    /// Intervals with missing segments or lost blocks.
    pub missing: usize,
    /// Longest run of consecutive reconstructed intervals.
    pub longest_reconstructed_run: usize,
}

pub struct AdaptiveIntervalHistory {
    slots: Vec<IntervalCounters>,
    current: usize,
    closed: u64,
}

impl AdaptiveIntervalHistory {
    pub fn new() -> Self {
        AdaptiveIntervalHistory {
            slots: vec![IntervalCounters::default(); ADAPTIVE_HISTORY_INTERVALS],
            current: 0,
            closed: 0,
        }
    }

    /// The open interval.
    pub fn current(&self) -> &IntervalCounters {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut IntervalCounters {
        &mut self.slots[self.current]
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.slots[self.current].flags |= flag;
    }

    /// Close the open interval, recording `missing_now` segments still
    /// missing from the window, and open a fresh one.
    pub fn advance(&mut self, missing_now: u32) {
        let cur = &mut self.slots[self.current];
        cur.missing_segments = cur.missing_segments.saturating_add(missing_now);
        self.current = (self.current + 1) % ADAPTIVE_HISTORY_INTERVALS;
        self.slots[self.current] = IntervalCounters::default();
        self.closed += 1;
    }

    /// Number of intervals closed since the last reset.
    pub fn closed_intervals(&self) -> u64 {
        self.closed
    }

    /// Closed interval `age` steps back (1 = most recently closed).
    pub fn closed(&self, age: usize) -> Option<&IntervalCounters> {
        if age == 0 || age >= ADAPTIVE_HISTORY_INTERVALS || age as u64 > self.closed {
            return None;
        }
        let idx = (self.current + ADAPTIVE_HISTORY_INTERVALS - age) % ADAPTIVE_HISTORY_INTERVALS;
        Some(&self.slots[idx])
    }

    /// Summarize up to `count` most recently closed intervals.
    pub fn summarize(&self, count: usize) -> LookbackSummary {
        let mut s = LookbackSummary::default();
        let mut run = 0usize;
        for age in 1..=count {
            let Some(slot) = self.closed(age) else {
                break;
            };
            s.intervals += 1;
            if slot.reconstructed_blocks > 0 {
                s.reconstructed += 1;
                run += 1;
                s.longest_reconstructed_run = s.longest_reconstructed_run.max(run);
            } else {
                run = 0;
            }
            if slot.requested_segments > 0 {
                s.retransmissions += 1;
            }
            if slot.retried_segments > 0 {
                s.re_retransmissions += 1;
            }
            if slot.has_missing() {
                s.missing += 1;
            }
        }
        s
    }

    /// Up to `count` most recently closed intervals, newest first.
    pub fn recent(&self, count: usize) -> Vec<IntervalCounters> {
        (1..=count).map_while(|age| self.closed(age).copied()).collect()
    }

    pub fn reset(&mut self) {
        self.slots.fill(IntervalCounters::default());
        self.current = 0;
        self.closed = 0;
    }
}

impl Default for AdaptiveIntervalHistory {
    fn default() -> Self {
        Self::new()
    }
}
