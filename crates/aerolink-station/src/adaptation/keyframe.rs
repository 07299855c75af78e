//! # Keyframe Interval Controller
//!
//! Shortens the vehicle's keyframe interval when the link gets rough, so a
//! broken picture recovers sooner, and lengthens it again while the link is
//! clean, so bandwidth goes to picture quality.
//!
//! The controller is inert until a video header told it the interval in
//! use. A profile with a pinned interval is only mirrored. Otherwise:
//!
//! - **stall**: no video for `(10 - strength) * 20 ms` halves the interval,
//!   not below 200 ms.
//! - **down**: the most severe firing tier sets the interval to a fixed
//!   fraction of the maximum. A firing tier always restarts the down
//!   look-back, whether or not the interval changed.
//! - **up**: a quiet look-back doubles the interval, up to the maximum.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

use aerolink_transport::history::{
    ADAPTIVE_HISTORY_INTERVALS, AdaptiveIntervalHistory, FLAG_KEYFRAME_DOWN, FLAG_KEYFRAME_UP,
};
use aerolink_transport::queue::OutboundQueue;
use aerolink_transport::receiver::StreamInfo;
use aerolink_transport::wire::Packet;

use super::ControllerInput;
use super::thresholds::{keyframe_down_tier, keyframe_stall_timeout, keyframe_thresholds};

/// Shortest interval ever requested.
pub const MIN_KEYFRAME_MS: u32 = 100;
/// Longest interval ever requested.
pub const MAX_KEYFRAME_MS: u32 = 20_000;
/// Floor of stall-driven halving.
pub const STALL_KEYFRAME_FLOOR_MS: u32 = 200;

const RETRY_WRAP: u32 = 20;
const MAX_RETRY: u32 = 100;

#[derive(Debug, Clone)]
pub struct KeyframeConfig {
    /// 0 (gentle) to 10 (aggressive).
    pub change_strength: u8,
    /// Profile maximum interval.
    pub max_interval_ms: u32,
    /// Interval pinned by the profile, mirrored when the stream is not
    /// adaptive.
    pub fixed_interval_ms: Option<u32>,
    /// Adjustments at most this often.
    pub adjust_interval: Duration,
    /// No adjustment this soon after a new request.
    pub request_guard: Duration,
    /// Quiet time after any change before shifting down again.
    pub down_guard: Duration,
    /// Quiet time after any change before shifting up.
    pub up_guard: Duration,
    /// Base resend delay of an unacknowledged request.
    pub update_interval: Duration,
    pub resend_step: Duration,
    pub forced_resend: Duration,
    pub stream: u8,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        KeyframeConfig {
            change_strength: 5,
            max_interval_ms: 5_000,
            fixed_interval_ms: None,
            adjust_interval: Duration::from_millis(100),
            request_guard: Duration::from_millis(50),
            down_guard: Duration::from_millis(100),
            up_guard: Duration::from_millis(900),
            update_interval: Duration::from_millis(20),
            resend_step: Duration::from_millis(10),
            forced_resend: Duration::from_secs(5),
            stream: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyframeStatus {
    pub observed: bool,
    pub requested_ms: u32,
    pub acked_ms: Option<u32>,
    pub max_ms: u32,
    pub retry: u32,
    pub shifts_down: u64,
    pub shifts_up: u64,
    pub stall_shifts: u64,
    pub switches_sent: u64,
}

pub struct KeyframeController {
    config: KeyframeConfig,
    observed: bool,
    requested: u32,
    acked: Option<u32>,
    retry: u32,
    /// `None` sends on the next check.
    last_send: Option<Instant>,
    /// When the requested value last changed.
    last_change: Option<Instant>,
    last_down: Option<Instant>,
    last_up: Option<Instant>,
    last_adjust: Option<Instant>,
    down_mark: u64,
    up_mark: u64,
    shifts_down: u64,
    shifts_up: u64,
    stall_shifts: u64,
    switches_sent: u64,
}

fn elapsed_over(since: Option<Instant>, now: Instant, limit: Duration) -> bool {
    since.is_none_or(|t| now.saturating_duration_since(t) > limit)
}

fn lookback(history: &AdaptiveIntervalHistory, mark: u64) -> usize {
    let since = history.closed_intervals().saturating_sub(mark);
    since.min(ADAPTIVE_HISTORY_INTERVALS as u64 - 1) as usize
}

impl KeyframeController {
    pub fn new(config: KeyframeConfig) -> Self {
        KeyframeController {
            config,
            observed: false,
            requested: 0,
            acked: None,
            retry: 0,
            last_send: None,
            last_change: None,
            last_down: None,
            last_up: None,
            last_adjust: None,
            down_mark: 0,
            up_mark: 0,
            shifts_down: 0,
            shifts_up: 0,
            stall_shifts: 0,
            switches_sent: 0,
        }
    }

    pub fn requested_ms(&self) -> u32 {
        self.requested
    }

    pub fn acked_ms(&self) -> Option<u32> {
        self.acked
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    fn max_interval(&self) -> u32 {
        self.config.max_interval_ms.clamp(MIN_KEYFRAME_MS, MAX_KEYFRAME_MS)
    }

    pub fn on_keyframe_acknowledged(&mut self, keyframe_ms: u32) {
        self.acked = Some(keyframe_ms);
        if keyframe_ms == self.requested {
            self.retry = 0;
        }
    }

    /// Forget the observed interval; used when the stream restarts.
    pub fn reset(&mut self) {
        *self = KeyframeController::new(self.config.clone());
    }

    fn observe(&mut self, stream: &StreamInfo, history: &AdaptiveIntervalHistory, now: Instant) {
        let observed = match stream.keyframe_ms as u32 {
            0 => self.max_interval(),
            ms => ms,
        };
        self.observed = true;
        self.requested = observed;
        self.acked = Some(observed);
        self.retry = 0;
        self.last_send = Some(now);
        self.last_change = Some(now);
        self.down_mark = history.closed_intervals();
        self.up_mark = self.down_mark;
        tracing::info!(keyframe_ms = observed, "keyframe interval tracking started");
    }

    /// Request a new interval. Returns false when nothing changed.
    fn request(&mut self, keyframe_ms: u32, now: Instant) -> bool {
        let ms = keyframe_ms.clamp(MIN_KEYFRAME_MS, self.max_interval());
        if ms == self.requested {
            return false;
        }
        self.requested = ms;
        self.retry = 0;
        self.last_send = None;
        self.last_change = Some(now);
        true
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: Instant, input: &mut ControllerInput<'_>, queue: &mut OutboundQueue) {
        let Some(stream) = input.stream else {
            return;
        };
        if !self.observed {
            self.observe(stream, input.history, now);
        }
        if input.link_lost || stream.one_way_link() {
            return;
        }

        if !stream.adaptive_keyframe() {
            if let Some(fixed) = self.config.fixed_interval_ms {
                self.request(fixed, now);
            }
            self.send_if_due(now, queue);
            return;
        }

        let adjust_due = self
            .last_adjust
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.adjust_interval)
            && self
                .last_change
                .is_none_or(|t| now.saturating_duration_since(t) >= self.config.request_guard);
        if adjust_due {
            self.last_adjust = Some(now);
            self.adjust(now, input.history, input.last_video_packet_at);
        }
        self.send_if_due(now, queue);
    }

    fn adjust(
        &mut self,
        now: Instant,
        history: &mut AdaptiveIntervalHistory,
        last_video: Option<Instant>,
    ) {
        let c = &self.config;
        let stall_timeout = keyframe_stall_timeout(c.change_strength);
        let (down_guard, up_guard) = (c.down_guard, c.up_guard);
        let th = keyframe_thresholds(c.change_strength);
        let max = self.max_interval();

        let stalled = last_video.is_some_and(|t| now.saturating_duration_since(t) >= stall_timeout);
        if stalled {
            if self.requested > STALL_KEYFRAME_FLOOR_MS {
                let ms = (self.requested / 2).max(STALL_KEYFRAME_FLOOR_MS);
                tracing::debug!(from = self.requested, to = ms, "video stalled, shortening keyframe interval");
                if self.request(ms, now) {
                    self.last_down = Some(now);
                    self.down_mark = history.closed_intervals();
                    history.set_flag(FLAG_KEYFRAME_DOWN);
                    self.stall_shifts += 1;
                }
            }
            return;
        }

        let quiet_since = |t: Option<Instant>, d: Duration| elapsed_over(t, now, d);
        if quiet_since(self.last_change, down_guard)
            && quiet_since(self.last_down, down_guard)
            && quiet_since(self.last_up, down_guard)
        {
            let s = history.summarize(lookback(history, self.down_mark));
            if let Some(tier) = keyframe_down_tier(&th, &s) {
                let ms = (max / tier.divisor()).max(MIN_KEYFRAME_MS);
                self.last_down = Some(now);
                self.down_mark = history.closed_intervals();
                if ms < self.requested {
                    tracing::info!(
                        from = self.requested,
                        to = ms,
                        tier = tier.as_str(),
                        "keyframe interval shift down"
                    );
                    self.request(ms, now);
                    history.set_flag(FLAG_KEYFRAME_DOWN);
                    self.shifts_down += 1;
                }
                return;
            }
        }

        if self.requested < max
            && quiet_since(self.last_change, up_guard)
            && quiet_since(self.last_up, up_guard)
            && quiet_since(self.last_down, up_guard)
        {
            let window = lookback(history, self.up_mark);
            let s = history.summarize(window);
            // Re-retransmissions and missing segments share the retransmission bound.
            let clean = window >= th.reconstructed_up
                && s.reconstructed < th.reconstructed_up
                && window >= th.retransmissions_up
                && s.retransmissions < th.retransmissions_up
                && s.re_retransmissions < th.retransmissions_up
                && s.missing < th.retransmissions_up;
            if clean {
                let ms = self.requested.saturating_mul(2).min(max);
                tracing::info!(from = self.requested, to = ms, "keyframe interval shift up");
                self.request(ms, now);
                self.last_up = Some(now);
                self.up_mark = history.closed_intervals();
                history.set_flag(FLAG_KEYFRAME_UP);
                self.shifts_up += 1;
            }
        }
    }

    fn send_if_due(&mut self, now: Instant, queue: &mut OutboundQueue) {
        let due = match self.last_send {
            None => true,
            Some(last) => {
                let unacked = self.acked != Some(self.requested)
                    && now >= last + self.config.update_interval + self.config.resend_step * self.retry;
                unacked || now >= last + self.config.forced_resend
            }
        };
        if !due {
            return;
        }
        let packet = Packet::SwitchKeyframe {
            keyframe_ms: self.requested,
            stream: self.config.stream,
        };
        queue.inject_first(packet.encode(0).freeze(), now);
        self.switches_sent += 1;
        self.last_send = Some(now);
        self.retry += 1;
        if self.retry > MAX_RETRY {
            self.retry = RETRY_WRAP;
        }
    }

    pub fn status(&self) -> KeyframeStatus {
        KeyframeStatus {
            observed: self.observed,
            requested_ms: self.requested,
            acked_ms: self.acked,
            max_ms: self.max_interval(),
            retry: self.retry,
            shifts_down: self.shifts_down,
            shifts_up: self.shifts_up,
            stall_shifts: self.stall_shifts,
            switches_sent: self.switches_sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerolink_transport::history::IntervalCounters;
    use aerolink_transport::wire::{ENCODING_ADAPTIVE_KEYFRAME, ENCODING_ONE_WAY_LINK};

    fn stream(keyframe_ms: u16, flags: u16) -> StreamInfo {
        StreamInfo {
            keyframe_ms,
            encoding_flags: flags,
            ..Default::default()
        }
    }

    fn controller(strength: u8, max_ms: u32) -> KeyframeController {
        KeyframeController::new(KeyframeConfig {
            change_strength: strength,
            max_interval_ms: max_ms,
            ..Default::default()
        })
    }

    fn fill(history: &mut AdaptiveIntervalHistory, n: usize, c: IntervalCounters) {
        for _ in 0..n {
            *history.current_mut() = c;
            history.advance(0);
        }
    }

    fn reconstructed() -> IntervalCounters {
        IntervalCounters {
            reconstructed_blocks: 1,
            ..Default::default()
        }
    }

    fn retransmitted() -> IntervalCounters {
        IntervalCounters {
            requested_segments: 1,
            ..Default::default()
        }
    }

    struct Rig {
        history: AdaptiveIntervalHistory,
        queue: OutboundQueue,
        last_video: Option<Instant>,
        link_lost: bool,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                history: AdaptiveIntervalHistory::new(),
                queue: OutboundQueue::default(),
                last_video: None,
                link_lost: false,
            }
        }

        fn tick(&mut self, ctl: &mut KeyframeController, info: Option<&StreamInfo>, now: Instant) {
            let mut input = ControllerInput {
                history: &mut self.history,
                stream: info,
                last_video_packet_at: self.last_video.or(Some(now)),
                link_lost: self.link_lost,
            };
            ctl.tick(now, &mut input, &mut self.queue);
        }

        fn sent(&mut self) -> Vec<u32> {
            let mut out = Vec::new();
            while let Some(mut wire) = self.queue.pop() {
                if let Some((_, Packet::SwitchKeyframe { keyframe_ms, .. })) = Packet::decode(&mut wire) {
                    out.push(keyframe_ms);
                }
            }
            out
        }
    }

    // ─── Observation Tests ──────────────────────────────────────────────

    #[test]
    fn inert_until_interval_observed() {
        let mut ctl = controller(10, 4000);
        let mut rig = Rig::new();
        fill(&mut rig.history, 50, retransmitted());
        rig.tick(&mut ctl, None, Instant::now());
        assert!(!ctl.is_observed());
        assert!(rig.queue.is_empty());
    }

    #[test]
    fn first_observation_is_mirrored_without_sending() {
        let mut ctl = controller(5, 4000);
        let mut rig = Rig::new();
        rig.tick(&mut ctl, Some(&stream(1500, ENCODING_ADAPTIVE_KEYFRAME)), Instant::now());
        assert_eq!(ctl.requested_ms(), 1500);
        assert_eq!(ctl.acked_ms(), Some(1500));
        assert!(rig.queue.is_empty());

        let mut ctl = controller(5, 4000);
        rig.tick(&mut ctl, Some(&stream(0, ENCODING_ADAPTIVE_KEYFRAME)), Instant::now());
        assert_eq!(ctl.requested_ms(), 4000);
    }

    #[test]
    fn fixed_profile_interval_is_sent_until_acknowledged() {
        let mut ctl = KeyframeController::new(KeyframeConfig {
            fixed_interval_ms: Some(1000),
            ..Default::default()
        });
        let mut rig = Rig::new();
        let info = stream(2000, 0);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);
        assert_eq!(rig.sent(), vec![1000]);

        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(35));
        assert_eq!(rig.sent(), vec![1000]);

        ctl.on_keyframe_acknowledged(1000);
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_secs(1));
        assert!(rig.sent().is_empty());
    }

    // ─── Shift Down Tests ───────────────────────────────────────────────

    #[test]
    fn reconstruct_slow_tier_halves_maximum() {
        let mut ctl = controller(0, 4000);
        let mut rig = Rig::new();
        let info = stream(4000, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);

        fill(&mut rig.history, 20, IntervalCounters::default());
        fill(&mut rig.history, 25, reconstructed());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(200));
        assert_eq!(ctl.requested_ms(), 2000);
        assert_eq!(rig.sent(), vec![2000]);
        assert_ne!(rig.history.current().flags & FLAG_KEYFRAME_DOWN, 0);
    }

    #[test]
    fn retransmit_fast_tier_uses_twentieth() {
        let mut ctl = controller(0, 4000);
        let mut rig = Rig::new();
        let info = stream(4000, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);

        fill(&mut rig.history, 30, retransmitted());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(200));
        assert_eq!(ctl.requested_ms(), 200);
    }

    #[test]
    fn tier_result_is_clamped_to_minimum() {
        let mut ctl = controller(0, 1000);
        let mut rig = Rig::new();
        let info = stream(1000, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);
        fill(&mut rig.history, 30, retransmitted());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(200));
        assert_eq!(ctl.requested_ms(), MIN_KEYFRAME_MS);
    }

    #[test]
    fn firing_tier_restarts_lookback_even_without_change() {
        let mut ctl = controller(0, 4000);
        let mut rig = Rig::new();
        let info = stream(300, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);

        fill(&mut rig.history, 30, reconstructed());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(200));
        // 2000 is not below 300
        assert_eq!(ctl.requested_ms(), 300);
        assert!(rig.queue.is_empty());
        assert_eq!(ctl.down_mark, rig.history.closed_intervals());
    }

    #[test]
    fn stall_halves_interval_down_to_floor() {
        let mut ctl = controller(5, 4000);
        let mut rig = Rig::new();
        let info = stream(1000, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.last_video = Some(t0);
        rig.tick(&mut ctl, Some(&info), t0);

        let mut expected = [500, 250, 200, 200].into_iter();
        for step in 1..=4u64 {
            rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(150 * step));
            assert_eq!(ctl.requested_ms(), expected.next().unwrap());
        }
        assert_eq!(ctl.status().stall_shifts, 3);
    }

    // ─── Shift Up Tests ─────────────────────────────────────────────────

    #[test]
    fn quiet_link_doubles_interval_up_to_maximum() {
        let mut ctl = controller(10, 4000);
        let mut rig = Rig::new();
        let info = stream(1000, ENCODING_ADAPTIVE_KEYFRAME);
        let t0 = Instant::now();
        rig.tick(&mut ctl, Some(&info), t0);

        fill(&mut rig.history, 10, IntervalCounters::default());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(500));
        assert_eq!(ctl.requested_ms(), 1000);
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(950));
        assert_eq!(ctl.requested_ms(), 2000);

        fill(&mut rig.history, 5, IntervalCounters::default());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(1900));
        assert_eq!(ctl.requested_ms(), 4000);
        assert_eq!(rig.sent(), vec![4000, 2000]);
        ctl.on_keyframe_acknowledged(4000);

        fill(&mut rig.history, 5, IntervalCounters::default());
        rig.tick(&mut ctl, Some(&info), t0 + Duration::from_millis(2900));
        assert_eq!(ctl.requested_ms(), 4000);
        assert_eq!(ctl.status().shifts_up, 2);
        assert!(rig.sent().is_empty());
    }

    // ─── Skip Tests ─────────────────────────────────────────────────────

    #[test]
    fn lost_or_one_way_link_is_left_alone() {
        let mut ctl = controller(0, 4000);
        let mut rig = Rig::new();
        let t0 = Instant::now();
        rig.link_lost = true;
        fill(&mut rig.history, 30, retransmitted());
        rig.tick(&mut ctl, Some(&stream(4000, ENCODING_ADAPTIVE_KEYFRAME)), t0);
        rig.tick(&mut ctl, Some(&stream(4000, ENCODING_ADAPTIVE_KEYFRAME)), t0 + Duration::from_millis(300));
        assert_eq!(ctl.requested_ms(), 4000);

        rig.link_lost = false;
        let one_way = stream(4000, ENCODING_ADAPTIVE_KEYFRAME | ENCODING_ONE_WAY_LINK);
        rig.tick(&mut ctl, Some(&one_way), t0 + Duration::from_millis(600));
        assert_eq!(ctl.requested_ms(), 4000);
        assert!(rig.queue.is_empty());
    }
}
