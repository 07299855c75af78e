//! # Video Quality Level Controller
//!
//! Levels are numbered from 0 (best). The first `high_levels` belong to the
//! user-selected high profile, then come the medium and (unless the vehicle
//! runs medium-only adaptation) the low profile levels. A higher level means
//! more FEC per block or a cheaper profile.
//!
//! The controller cannot invent the level the vehicle is using, so it stays
//! [`QualityState::Uninitialized`] until the first stream packet arrives.
//! From then on, every tick it looks back over the interval history:
//!
//! - **down**: too many intervals with reconstructed blocks, or a long run
//!   of them, moves one level down; too many intervals with retransmissions
//!   jumps to the next profile boundary.
//! - **up**: a quiet history for `min_ok_interval` moves one level up,
//!   provided no shift happened within the cool-down.
//!
//! The last level of every profile but the final one is skipped when there
//! is room: it has the same data-to-FEC ratio as the next profile's first.
//! Every new level is injected at the head of the outbound queue and resent
//! until acknowledged.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

use aerolink_transport::history::{AdaptiveIntervalHistory, FLAG_QUALITY_DOWN, FLAG_QUALITY_UP};
use aerolink_transport::queue::OutboundQueue;
use aerolink_transport::receiver::StreamInfo;
use aerolink_transport::wire::{Packet, VideoProfile};

use super::ControllerInput;
use super::thresholds::quality_thresholds;

/// Retry counter wraps back here after passing [`MAX_RETRY`].
const RETRY_WRAP: u32 = 20;
const MAX_RETRY: u32 = 100;

#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Tick period the station drives the controller with.
    pub update_interval: Duration,
    /// 0 (gentle) to 10 (aggressive).
    pub change_strength: u8,
    pub high_levels: u32,
    pub medium_levels: u32,
    pub low_levels: u32,
    /// FEC packets per block of each profile's first level (High, Medium, Low).
    pub profile_base_fec: [u8; 3],
    /// Quiet time required before shifting up.
    pub min_ok_interval: Duration,
    /// No adjustment this soon after any shift.
    pub shift_guard: Duration,
    /// Added to the resend delay per unacknowledged send.
    pub resend_step: Duration,
    /// The current level is resent this often even when acknowledged.
    pub forced_resend: Duration,
    /// Shifts held off after the stream starts.
    pub startup_hold: Duration,
    /// Adjustments paused after falling back to the medium profile.
    pub medium_pause: Duration,
    /// Stream id carried in switch requests.
    pub stream: u8,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            update_interval: Duration::from_millis(20),
            change_strength: 5,
            high_levels: 4,
            medium_levels: 4,
            low_levels: 4,
            profile_base_fec: [1, 2, 3],
            min_ok_interval: Duration::from_millis(200),
            shift_guard: Duration::from_millis(50),
            resend_step: Duration::from_millis(10),
            forced_resend: Duration::from_secs(5),
            startup_hold: Duration::from_secs(1),
            medium_pause: Duration::from_secs(3),
            stream: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityState {
    Uninitialized,
    Tracking,
}

/// Published view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct QualityStatus {
    pub state: QualityState,
    pub target_level: u32,
    pub acked_level: Option<u32>,
    pub max_level: u32,
    pub retry: u32,
    pub shifts_down: u64,
    pub shifts_up: u64,
    pub switches_sent: u64,
    pub paused: bool,
}

pub struct QualityController {
    config: QualityConfig,
    state: QualityState,
    target: u32,
    acked: Option<u32>,
    retry: u32,
    last_down: Option<Instant>,
    last_up: Option<Instant>,
    /// `None` sends on the next check.
    last_request: Option<Instant>,
    good_since: Option<Instant>,
    paused_until: Option<Instant>,
    /// Closed interval count at the last down shift.
    down_mark: u64,
    medium_only: bool,
    shifts_down: u64,
    shifts_up: u64,
    switches_sent: u64,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        QualityController {
            config,
            state: QualityState::Uninitialized,
            target: 0,
            acked: None,
            retry: 0,
            last_down: None,
            last_up: None,
            last_request: None,
            good_since: None,
            paused_until: None,
            down_mark: 0,
            medium_only: false,
            shifts_down: 0,
            shifts_up: 0,
            switches_sent: 0,
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn state(&self) -> QualityState {
        self.state
    }

    pub fn target_level(&self) -> u32 {
        self.target
    }

    pub fn acked_level(&self) -> Option<u32> {
        self.acked
    }

    /// Number of levels in use.
    pub fn max_levels(&self) -> u32 {
        let c = &self.config;
        let mut max = c.high_levels + c.medium_levels;
        if !self.medium_only {
            max += c.low_levels;
        }
        max.max(1)
    }

    fn highest_level(&self) -> u32 {
        self.max_levels() - 1
    }

    /// Last level of each profile but the final one.
    fn is_wasteful(&self, level: u32) -> bool {
        let c = &self.config;
        let boundaries = [
            c.high_levels,
            c.high_levels + c.medium_levels,
            c.high_levels + c.medium_levels + c.low_levels,
        ];
        boundaries.iter().any(|&b| b > 0 && level + 1 == b)
    }

    /// Level the vehicle starts with, from the first stream packet.
    pub fn initial_level(&self, stream: &StreamInfo) -> u32 {
        let c = &self.config;
        let (base, base_fec) = match stream.profile {
            VideoProfile::High => (0, c.profile_base_fec[0]),
            VideoProfile::Medium => (c.high_levels, c.profile_base_fec[1]),
            VideoProfile::Low => (c.high_levels + c.medium_levels, c.profile_base_fec[2]),
        };
        let excess = stream.scheme.fec_packets.saturating_sub(base_fec) as u32;
        (base + excess).min(self.highest_level())
    }

    /// Take the level the vehicle is using and start tracking.
    pub fn on_stream_started(&mut self, stream: &StreamInfo, now: Instant) {
        self.medium_only = stream.medium_adaptive_only();
        let level = self.initial_level(stream);
        self.state = QualityState::Tracking;
        self.target = level;
        self.acked = Some(level);
        self.retry = 0;
        let hold = now + self.config.startup_hold;
        self.last_down = Some(hold);
        self.last_up = Some(hold);
        self.last_request = Some(hold);
        self.good_since = None;
        self.paused_until = None;
        self.down_mark = 0;
        tracing::info!(level, profile = ?stream.profile, "video level tracking started");
    }

    /// Fall back to the first medium level after a pipeline reset.
    pub fn switch_to_medium_level(&mut self, now: Instant) {
        let pause = now + self.config.medium_pause;
        self.state = QualityState::Tracking;
        self.target = self.config.high_levels.min(self.highest_level());
        self.acked = None;
        self.retry = 0;
        self.last_request = None;
        self.last_down = Some(pause);
        self.last_up = Some(pause);
        self.paused_until = Some(pause);
        self.good_since = None;
        tracing::info!(level = self.target, "falling back to medium video level");
    }

    pub fn on_level_acknowledged(&mut self, level: u32) {
        if self.acked != Some(level) {
            tracing::debug!(level, target = self.target, "video level acknowledged");
        }
        self.acked = Some(level);
        if level == self.target {
            self.retry = 0;
        }
    }

    /// Back to the state before the first stream.
    pub fn reset(&mut self) {
        *self = QualityController::new(self.config.clone());
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: Instant, input: &mut ControllerInput<'_>, queue: &mut OutboundQueue) {
        if self.state == QualityState::Uninitialized {
            return;
        }
        let Some(stream) = input.stream else {
            return;
        };
        let one_way = stream.one_way_link();

        if !stream.adaptive_video() || one_way {
            if self.target != 0 {
                self.target = 0;
                self.retry = 0;
                self.last_request = None;
            }
            if self.acked != Some(0) {
                self.send_if_due(now, queue, one_way);
            }
            return;
        }

        let paused = self.paused_until.is_some_and(|until| now < until);
        if !paused {
            self.medium_only = stream.medium_adaptive_only();
            self.adjust(now, input.history);
        }
        self.send_if_due(now, queue, one_way);
    }

    fn adjust(&mut self, now: Instant, history: &mut AdaptiveIntervalHistory) {
        let (Some(last_down), Some(last_up)) = (self.last_down, self.last_up) else {
            return;
        };
        let guard = self.config.shift_guard;
        if now < last_down + guard || now < last_up + guard {
            return;
        }

        let c = &self.config;
        let highest = self.highest_level();
        let since = history.closed_intervals().saturating_sub(self.down_mark);
        let th = quality_thresholds(
            c.change_strength,
            self.target > c.high_levels,
            since,
            c.update_interval,
        );

        // down
        if now > last_down + th.min_down_gap {
            let s = history.summarize(th.down_window);
            let mut level = self.target;
            let mut reason = "";
            if s.retransmissions > th.retransmissions_down {
                let medium_start = c.high_levels;
                let low_start = c.high_levels + c.medium_levels;
                level = if self.target < medium_start {
                    medium_start
                } else if self.target < low_start {
                    low_start
                } else {
                    highest
                };
                reason = "retransmissions";
            } else if s.reconstructed > th.reconstructed_down
                || s.longest_reconstructed_run > th.longest_run_down
            {
                level = self.target + 1;
                reason = "reconstructions";
            }
            level = level.min(highest);
            if self.is_wasteful(level) && level < highest {
                level += 1;
            }
            if level > self.target {
                tracing::info!(
                    from = self.target,
                    to = level,
                    reason,
                    reconstructed = s.reconstructed,
                    retransmissions = s.retransmissions,
                    window = th.down_window,
                    "video level shift down"
                );
                self.target = level;
                self.last_down = Some(now);
                self.down_mark = history.closed_intervals();
                self.shifted(history, FLAG_QUALITY_DOWN);
                self.shifts_down += 1;
                return;
            }
        }

        // up
        if self.target > 0 && now > last_down + th.up_cooldown && now > last_up + th.up_cooldown {
            let s = history.summarize(th.up_window);
            let quiet = s.reconstructed < th.reconstructed_up
                && s.longest_reconstructed_run < th.longest_run_up
                && s.retransmissions < th.retransmissions_up;
            if quiet {
                let since = *self.good_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.config.min_ok_interval {
                    let mut level = self.target - 1;
                    if self.is_wasteful(level) && level > 0 {
                        level -= 1;
                    }
                    tracing::info!(from = self.target, to = level, "video level shift up");
                    self.target = level;
                    self.last_up = Some(now);
                    self.shifted(history, FLAG_QUALITY_UP);
                    self.shifts_up += 1;
                }
                return;
            }
        }
        self.good_since = None;
    }

    fn shifted(&mut self, history: &mut AdaptiveIntervalHistory, flag: u8) {
        history.set_flag(flag);
        self.retry = 0;
        self.last_request = None;
        self.good_since = None;
    }

    fn send_if_due(&mut self, now: Instant, queue: &mut OutboundQueue, one_way: bool) {
        let due = match self.last_request {
            None => true,
            Some(last) => {
                let unacked = self.acked != Some(self.target)
                    && now >= last + self.config.update_interval + self.config.resend_step * self.retry;
                let forced = !one_way && now >= last + self.config.forced_resend;
                unacked || forced
            }
        };
        if !due {
            return;
        }
        let packet = Packet::SwitchVideoLevel {
            level: self.target,
            stream: self.config.stream,
        };
        queue.inject_first(packet.encode(0).freeze(), now);
        tracing::trace!(level = self.target, retry = self.retry, "video level switch sent");
        self.switches_sent += 1;
        self.last_request = Some(now);
        self.retry += 1;
        if self.retry > MAX_RETRY {
            self.retry = RETRY_WRAP;
        }
    }

    pub fn status(&self, now: Instant) -> QualityStatus {
        QualityStatus {
            state: self.state,
            target_level: self.target,
            acked_level: self.acked,
            max_level: self.highest_level(),
            retry: self.retry,
            shifts_down: self.shifts_down,
            shifts_up: self.shifts_up,
            switches_sent: self.switches_sent,
            paused: self.paused_until.is_some_and(|until| now < until),
        }
    }
}
