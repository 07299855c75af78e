//! Threshold arithmetic of both adaptive controllers.
//!
//! These are field-tuned heuristics. Every function is pure so the numbers
//! can be pinned by tests. The change strength `s` (0.0-1.0) is carried in
//! tenths so that every product truncates exactly; the truncations are part
//! of the behavior.

use std::time::Duration;

use aerolink_transport::history::{ADAPTIVE_HISTORY_INTERVALS, LookbackSummary};

/// Look-back windows never reach the full ring.
const MAX_LOOKBACK: usize = ADAPTIVE_HISTORY_INTERVALS - 2;

/// Strength in tenths, clamped to 0-10.
fn strength_tenths(change_strength: u8) -> usize {
    change_strength.min(10) as usize
}

// ─── Quality Level ──────────────────────────────────────────────────────────

/// Look-back sizes and limits for one quality controller evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// Intervals examined for shifting down.
    pub down_window: usize,
    /// Intervals examined for shifting up.
    pub up_window: usize,
    pub reconstructed_down: usize,
    pub longest_run_down: usize,
    pub retransmissions_down: usize,
    /// Minimum time between two down shifts.
    pub min_down_gap: Duration,
    pub reconstructed_up: usize,
    pub longest_run_up: usize,
    pub retransmissions_up: usize,
    /// Time without any shift before shifting up.
    pub up_cooldown: Duration,
}

/// Thresholds for the quality controller.
///
/// `beyond_high` is true when the requested level is already past the
/// high-quality levels; the controller then reacts a bit more gently.
/// `intervals_since_down` caps the down window so that a fresh shift is
/// judged only on what happened after it.
pub fn quality_thresholds(
    change_strength: u8,
    beyond_high: bool,
    intervals_since_down: u64,
    update_interval: Duration,
) -> QualityThresholds {
    let mut st = strength_tenths(change_strength);
    if beyond_high {
        st = st.saturating_sub(1).max(1);
    }
    let weak = 10 - st;

    // (1 - 0.4s) and (1 - 0.3s) of the ring
    let since = intervals_since_down.clamp(1, MAX_LOOKBACK as u64) as usize;
    let down = (ADAPTIVE_HISTORY_INTERVALS - 8 * st).min(MAX_LOOKBACK).min(since);
    let up = (ADAPTIVE_HISTORY_INTERVALS - 6 * st).min(MAX_LOOKBACK);

    let reconstructed_down = 2 + weak * down * 9 / 100;
    let longest_run_down = 2 + weak * down * 7 / 100;
    let retransmissions_down = 1 + weak * down / 80;

    let gap_intervals = down.min(reconstructed_down).min(retransmissions_down) as u32;
    let min_down_gap = (update_interval * gap_intervals)
        .clamp(Duration::from_millis(100), Duration::from_millis(500));

    let reconstructed_up = 2 + weak * up * 6 / 100;
    let longest_run_up = 2 + weak * up * 3 / 100;
    let retransmissions_up = 2 + weak * down / 140;
    let up_ms = (1000 - 50 * st as u64).clamp(100, 1000);

    QualityThresholds {
        down_window: down,
        up_window: up,
        reconstructed_down,
        longest_run_down,
        retransmissions_down,
        min_down_gap,
        reconstructed_up,
        longest_run_up,
        retransmissions_up,
        up_cooldown: Duration::from_millis(up_ms),
    }
}

// ─── Keyframe Interval ──────────────────────────────────────────────────────

/// Divisors of the maximum keyframe interval per down tier, mildest first.
///
/// Golden constants: reconstruct-slow, reconstruct-fast, retransmit-slow,
/// retransmit-fast.
pub const KEYFRAME_DOWN_DIVISORS: [u32; 4] = [2, 4, 10, 20];

/// Activity counts that move the keyframe interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeThresholds {
    pub reconstructed_slow: usize,
    pub reconstructed_fast: usize,
    pub retransmissions_slow: usize,
    pub retransmissions_fast: usize,
    pub re_retransmissions: usize,
    pub reconstructed_up: usize,
    pub retransmissions_up: usize,
}

pub fn keyframe_thresholds(change_strength: u8) -> KeyframeThresholds {
    let weak = 10 - strength_tenths(change_strength);
    let reconstructed_slow = 2 + 2 * weak;
    let reconstructed_fast = 5 + 3 * weak;
    let retransmissions_slow = 1 + weak / 2;
    let retransmissions_fast = 2 + weak;
    KeyframeThresholds {
        reconstructed_slow,
        reconstructed_fast,
        retransmissions_slow,
        retransmissions_fast,
        re_retransmissions: retransmissions_slow,
        reconstructed_up: reconstructed_slow.saturating_sub(2).max(1),
        retransmissions_up: retransmissions_slow.saturating_sub(2).max(1),
    }
}

/// Which down rule fired, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyframeTier {
    ReconstructSlow,
    ReconstructFast,
    RetransmitSlow,
    RetransmitFast,
}

impl KeyframeTier {
    pub fn divisor(self) -> u32 {
        KEYFRAME_DOWN_DIVISORS[self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyframeTier::ReconstructSlow => "reconstruct-slow",
            KeyframeTier::ReconstructFast => "reconstruct-fast",
            KeyframeTier::RetransmitSlow => "retransmit-slow",
            KeyframeTier::RetransmitFast => "retransmit-fast",
        }
    }
}

/// Most severe down tier that fires over `summary`, if any.
///
/// A tier needs at least its own threshold worth of intervals in the
/// look-back before it can fire.
pub fn keyframe_down_tier(
    th: &KeyframeThresholds,
    summary: &LookbackSummary,
) -> Option<KeyframeTier> {
    let window = summary.intervals;
    let retransmit_fires = |limit: usize| {
        window >= limit
            && (summary.retransmissions >= limit || summary.missing >= limit / 2 + 1)
    };

    if retransmit_fires(th.retransmissions_fast) {
        return Some(KeyframeTier::RetransmitFast);
    }
    if retransmit_fires(th.retransmissions_slow)
        || (window >= th.re_retransmissions
            && summary.re_retransmissions >= th.re_retransmissions)
    {
        return Some(KeyframeTier::RetransmitSlow);
    }
    if window >= th.reconstructed_fast && summary.reconstructed >= th.reconstructed_fast {
        return Some(KeyframeTier::ReconstructFast);
    }
    if window >= th.reconstructed_slow && summary.reconstructed >= th.reconstructed_slow {
        return Some(KeyframeTier::ReconstructSlow);
    }
    None
}

/// No video for this long halves the keyframe interval.
pub fn keyframe_stall_timeout(change_strength: u8) -> Duration {
    let ms = (10 - change_strength.min(10) as u64) * 20;
    Duration::from_millis(ms.max(20))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    // ─── Quality Threshold Tests ────────────────────────────────────────

    #[test]
    fn strongest_setting_reacts_to_two_intervals() {
        let th = quality_thresholds(10, false, 1000, TICK);
        assert_eq!(th.down_window, 120);
        assert_eq!(th.up_window, 140);
        assert_eq!(th.reconstructed_down, 2);
        assert_eq!(th.longest_run_down, 2);
        assert_eq!(th.retransmissions_down, 1);
        assert_eq!(th.min_down_gap, Duration::from_millis(100));
        assert_eq!(th.up_cooldown, Duration::from_millis(500));
    }

    #[test]
    fn weakest_setting_uses_full_windows() {
        let th = quality_thresholds(0, false, 1000, TICK);
        assert_eq!(th.down_window, 198);
        assert_eq!(th.up_window, 198);
        // 2 + 198 * 0.9
        assert_eq!(th.reconstructed_down, 180);
        assert_eq!(th.longest_run_down, 140);
        // 1 + 198 / 8
        assert_eq!(th.retransmissions_down, 25);
        assert_eq!(th.reconstructed_up, 120);
        assert_eq!(th.longest_run_up, 61);
        // 2 + 198 / 14
        assert_eq!(th.retransmissions_up, 16);
        assert_eq!(th.min_down_gap, Duration::from_millis(500));
        assert_eq!(th.up_cooldown, Duration::from_secs(1));
    }

    #[test]
    fn down_window_is_capped_by_last_down_shift() {
        let th = quality_thresholds(5, false, 10, TICK);
        assert_eq!(th.down_window, 10);
        let th = quality_thresholds(5, false, 0, TICK);
        assert_eq!(th.down_window, 1);
    }

    #[test]
    fn beyond_high_levels_soften_strength() {
        let normal = quality_thresholds(10, false, 1000, TICK);
        let beyond = quality_thresholds(10, true, 1000, TICK);
        assert!(beyond.down_window > normal.down_window);
        assert!(beyond.reconstructed_down > normal.reconstructed_down);
        // floor at 0.1: strength 0 and 1 behave the same past high
        assert_eq!(
            quality_thresholds(0, true, 1000, TICK),
            quality_thresholds(1, true, 1000, TICK)
        );
    }

    #[test]
    fn min_down_gap_is_clamped() {
        let th = quality_thresholds(5, false, 3, Duration::from_millis(1));
        assert_eq!(th.min_down_gap, Duration::from_millis(100));
        let th = quality_thresholds(0, false, 1000, Duration::from_millis(50));
        assert_eq!(th.min_down_gap, Duration::from_millis(500));
    }

    // ─── Keyframe Threshold Tests ───────────────────────────────────────

    #[test]
    fn keyframe_divisors_are_golden() {
        assert_eq!(KEYFRAME_DOWN_DIVISORS, [2, 4, 10, 20]);
        assert_eq!(KeyframeTier::ReconstructSlow.divisor(), 2);
        assert_eq!(KeyframeTier::RetransmitFast.divisor(), 20);
    }

    #[test]
    fn keyframe_thresholds_by_strength() {
        let th = keyframe_thresholds(10);
        assert_eq!(th.reconstructed_slow, 2);
        assert_eq!(th.reconstructed_fast, 5);
        assert_eq!(th.retransmissions_slow, 1);
        assert_eq!(th.retransmissions_fast, 2);
        assert_eq!(th.re_retransmissions, 1);
        assert_eq!(th.reconstructed_up, 1);
        assert_eq!(th.retransmissions_up, 1);

        let th = keyframe_thresholds(0);
        assert_eq!(th.reconstructed_slow, 22);
        assert_eq!(th.reconstructed_fast, 35);
        assert_eq!(th.retransmissions_slow, 6);
        assert_eq!(th.retransmissions_fast, 12);
        assert_eq!(th.reconstructed_up, 20);
        assert_eq!(th.retransmissions_up, 4);
    }

    fn summary(intervals: usize, reconstructed: usize, retr: usize, missing: usize) -> LookbackSummary {
        LookbackSummary {
            intervals,
            reconstructed,
            retransmissions: retr,
            missing,
            ..Default::default()
        }
    }

    #[test]
    fn most_severe_tier_wins() {
        let th = keyframe_thresholds(0);
        // reconstruct-slow only
        assert_eq!(
            keyframe_down_tier(&th, &summary(50, 22, 0, 0)),
            Some(KeyframeTier::ReconstructSlow)
        );
        // reconstruct-fast beats slow
        assert_eq!(
            keyframe_down_tier(&th, &summary(50, 40, 0, 0)),
            Some(KeyframeTier::ReconstructFast)
        );
        // retransmissions beat reconstruction
        assert_eq!(
            keyframe_down_tier(&th, &summary(50, 40, 6, 0)),
            Some(KeyframeTier::RetransmitSlow)
        );
        assert_eq!(
            keyframe_down_tier(&th, &summary(50, 40, 12, 0)),
            Some(KeyframeTier::RetransmitFast)
        );
        assert_eq!(keyframe_down_tier(&th, &summary(50, 1, 0, 0)), None);
    }

    #[test]
    fn missing_segments_count_half() {
        let th = keyframe_thresholds(0);
        // retransmit-slow fires at 6 / 2 + 1 = 4 missing intervals
        assert_eq!(
            keyframe_down_tier(&th, &summary(50, 0, 0, 4)),
            Some(KeyframeTier::RetransmitSlow)
        );
        assert_eq!(keyframe_down_tier(&th, &summary(50, 0, 0, 3)), None);
    }

    #[test]
    fn short_lookback_cannot_fire() {
        let th = keyframe_thresholds(0);
        assert_eq!(keyframe_down_tier(&th, &summary(5, 5, 5, 5)), None);
    }

    #[test]
    fn re_retransmissions_fire_slow_tier() {
        let th = keyframe_thresholds(0);
        let s = LookbackSummary {
            intervals: 50,
            re_retransmissions: 6,
            ..Default::default()
        };
        assert_eq!(keyframe_down_tier(&th, &s), Some(KeyframeTier::RetransmitSlow));
    }

    #[test]
    fn stall_timeout_scales_with_strength() {
        assert_eq!(keyframe_stall_timeout(0), Duration::from_millis(200));
        assert_eq!(keyframe_stall_timeout(5), Duration::from_millis(100));
        assert_eq!(keyframe_stall_timeout(10), Duration::from_millis(20));
    }
}
