//! # Radio Link Output Selector
//!
//! Decides where uplink packets go. Each logical radio link that can
//! transmit gets one copy of every outgoing packet, sent on the single
//! physical interface that currently carries that link best, at a data
//! rate derived from the link's uplink policy.
//!
//! ## Interface choice
//!
//! Among the interfaces assigned to a link that are enabled, TX and data
//! capable and open for write, the one with the lowest positive
//! preferred-TX rank wins. Without a ranked interface the best relative RX
//! quality wins. Serial radios running at 80 % of their air rate or more
//! are passed over.
//!
//! ## Data rate
//!
//! Per link policy (`Fixed`, `SameAsVideo`, `Lowest`, `Auto`), then forced
//! down to the lowest rate of the same family when the vehicle reports it
//! lost the controller link, or for command, pairing and negotiation
//! traffic.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

use aerolink_transport::wire::{PacketType, VideoProfile};

use crate::net::datarate::{self, DEFAULT_DATA_DATARATE};
use crate::net::interface::{Capabilities, InterfaceMetrics, RadioInterface};

/// Minimum spacing of "no interface can send" warnings per link.
const NO_ROUTE_WARN_INTERVAL: Duration = Duration::from_millis(500);

/// How a link picks its uplink data rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UplinkDatarate {
    Fixed(i32),
    SameAsVideo,
    Lowest,
    #[default]
    Auto,
}

/// One logical radio link.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioLink {
    pub id: usize,
    pub capabilities: Capabilities,
    pub uplink: UplinkDatarate,
    /// Data rate the vehicle sends video at on this link.
    pub video_datarate: i32,
    pub ht40: bool,
    /// Rate pinned per video profile (High, Medium, Low); 0 = not pinned.
    pub profile_datarates: [i32; 3],
}

impl RadioLink {
    pub fn new(id: usize) -> Self {
        RadioLink {
            id,
            capabilities: Capabilities::all_traffic(),
            uplink: UplinkDatarate::Auto,
            video_datarate: DEFAULT_DATA_DATARATE,
            ht40: false,
            profile_datarates: [0; 3],
        }
    }

    fn can_carry_uplink(&self) -> bool {
        let caps = self.capabilities;
        caps.contains(Capabilities::CAN_TX)
            && !caps.contains(Capabilities::DISABLED)
            && !caps.contains(Capabilities::RELAY)
    }

    /// Uplink rate from the link policy alone.
    pub fn policy_datarate(&self, profile: VideoProfile) -> i32 {
        match self.uplink {
            UplinkDatarate::Fixed(rate) => rate,
            UplinkDatarate::SameAsVideo => {
                let video = if self.video_datarate != 0 {
                    self.video_datarate
                } else {
                    DEFAULT_DATA_DATARATE
                };
                match self.profile_datarates[profile as usize] {
                    0 => video,
                    pinned => datarate::slower(video, pinned, self.ht40),
                }
            }
            UplinkDatarate::Lowest | UplinkDatarate::Auto => {
                datarate::lowest_like(self.video_datarate)
            }
        }
    }
}

/// Station state the routing depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteContext {
    pub profile: VideoProfile,
    /// The vehicle reported it no longer hears the controller.
    pub vehicle_lost_controller: bool,
}

/// Where and how one copy of a packet goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDecision {
    pub link: usize,
    /// Index into the selector's interfaces.
    pub interface: usize,
    pub datarate: i32,
    /// Extra sends after the first.
    pub repeat: u8,
}

/// Extra sends per packet type.
pub fn repeat_count(packet_type: PacketType) -> u8 {
    match packet_type {
        PacketType::RequestSegments | PacketType::SwitchKeyframe | PacketType::SwitchVideoLevel => 1,
        _ => 0,
    }
}

fn forces_lowest_rate(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::Command | PacketType::PairingRequest | PacketType::NegotiateRadioLinks
    )
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectorStats {
    pub packets_routed: u64,
    pub copies_sent: u64,
    pub send_errors: u64,
    pub unroutable: u64,
}

// ─── Selector ───────────────────────────────────────────────────────────────

pub struct LinkSelector {
    links: Vec<RadioLink>,
    interfaces: Vec<RadioInterface>,
    last_no_route_warn: Vec<Option<Instant>>,
    stats: SelectorStats,
}

impl LinkSelector {
    pub fn new(links: Vec<RadioLink>, interfaces: Vec<RadioInterface>) -> Self {
        let last_no_route_warn = vec![None; links.len()];
        LinkSelector {
            links,
            interfaces,
            last_no_route_warn,
            stats: SelectorStats::default(),
        }
    }

    pub fn links(&self) -> &[RadioLink] {
        &self.links
    }

    pub fn interfaces(&self) -> &[RadioInterface] {
        &self.interfaces
    }

    pub fn interface_mut(&mut self, index: usize) -> Option<&mut RadioInterface> {
        self.interfaces.get_mut(index)
    }

    pub fn link_mut(&mut self, id: usize) -> Option<&mut RadioLink> {
        self.links.iter_mut().find(|l| l.id == id)
    }

    pub fn stats(&self) -> &SelectorStats {
        &self.stats
    }

    pub fn interface_metrics(&self, now: Instant) -> Vec<InterfaceMetrics> {
        self.interfaces.iter().map(|i| i.metrics(now)).collect()
    }

    /// Best interface for `link`, if any can send.
    pub fn choose_interface(&self, link: usize, now: Instant) -> Option<usize> {
        let candidates = || {
            self.interfaces
                .iter()
                .enumerate()
                .filter(|(_, i)| i.eligible_for(link) && !i.overloaded(now))
        };
        candidates()
            .filter(|(_, i)| i.config().preferred_tx > 0)
            .min_by_key(|(_, i)| i.config().preferred_tx)
            .or_else(|| {
                // first of equals wins
                candidates().fold(None, |best: Option<(usize, &RadioInterface)>, cur| match best {
                    Some(b) if b.1.rx_quality() >= cur.1.rx_quality() => Some(b),
                    _ => Some(cur),
                })
            })
            .map(|(idx, _)| idx)
    }

    /// One decision per link that can carry `packet_type` right now.
    pub fn route(
        &mut self,
        packet_type: PacketType,
        ctx: &RouteContext,
        now: Instant,
    ) -> Vec<TxDecision> {
        let use_lowest = ctx.vehicle_lost_controller || forces_lowest_rate(packet_type);
        let repeat = repeat_count(packet_type);
        let mut out = Vec::with_capacity(self.links.len());

        for (pos, link) in self.links.iter().enumerate() {
            if !link.can_carry_uplink() {
                continue;
            }
            let Some(interface) = self.choose_interface(link.id, now) else {
                let due = self.last_no_route_warn[pos]
                    .is_none_or(|t| now.saturating_duration_since(t) >= NO_ROUTE_WARN_INTERVAL);
                if due {
                    tracing::warn!(link = link.id, "no radio interface can send on link");
                    self.last_no_route_warn[pos] = Some(now);
                }
                continue;
            };
            let mut rate = link.policy_datarate(ctx.profile);
            if use_lowest {
                rate = datarate::lowest_like(rate);
            }
            out.push(TxDecision {
                link: link.id,
                interface,
                datarate: rate,
                repeat,
            });
        }
        out
    }

    /// Route and send one serialized packet. Returns copies sent.
    pub fn transmit(&mut self, packet: &[u8], ctx: &RouteContext, now: Instant) -> usize {
        let Some(packet_type) = PacketType::peek(packet) else {
            tracing::warn!(len = packet.len(), "refusing to send packet of unknown type");
            return 0;
        };
        self.stats.packets_routed += 1;
        let decisions = self.route(packet_type, ctx, now);
        if decisions.is_empty() {
            self.stats.unroutable += 1;
            return 0;
        }

        let mut sent = 0;
        for d in decisions {
            let Some(iface) = self.interfaces.get_mut(d.interface) else {
                continue;
            };
            for _ in 0..=d.repeat {
                match iface.send(packet, d.datarate, now) {
                    Ok(_) => sent += 1,
                    Err(e) => {
                        self.stats.send_errors += 1;
                        tracing::warn!(
                            link = d.link,
                            interface = iface.name(),
                            packet_type = %packet_type,
                            error = %e,
                            "send failed"
                        );
                        break;
                    }
                }
            }
        }
        self.stats.copies_sent += sent as u64;
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::interface::{InterfaceConfig, InterfaceKind, RadioTx};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(String, i32)>>>;

    struct RecordingTx {
        name: String,
        log: Log,
    }

    impl RadioTx for RecordingTx {
        fn send(&self, packet: &[u8], datarate: i32) -> anyhow::Result<usize> {
            self.log.lock().unwrap().push((self.name.clone(), datarate));
            Ok(packet.len())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn iface(cfg: InterfaceConfig, log: &Log) -> RadioInterface {
        let tx = RecordingTx {
            name: cfg.name.clone(),
            log: log.clone(),
        };
        RadioInterface::new(cfg, Some(Box::new(tx)))
    }

    fn ranked(name: &str, link: usize, rank: u32) -> InterfaceConfig {
        let mut cfg = InterfaceConfig::wifi(name, link);
        cfg.preferred_tx = rank;
        cfg
    }

    // ─── Interface Choice Tests ─────────────────────────────────────────

    #[test]
    fn lowest_positive_rank_wins() {
        let log = Log::default();
        let sel = LinkSelector::new(
            vec![RadioLink::new(0)],
            vec![
                iface(ranked("a", 0, 0), &log),
                iface(ranked("b", 0, 3), &log),
                iface(ranked("c", 0, 2), &log),
            ],
        );
        assert_eq!(sel.choose_interface(0, Instant::now()), Some(2));
    }

    #[test]
    fn best_rx_quality_wins_without_rank() {
        let log = Log::default();
        let mut sel = LinkSelector::new(
            vec![RadioLink::new(0)],
            vec![
                iface(InterfaceConfig::wifi("a", 0), &log),
                iface(InterfaceConfig::wifi("b", 0), &log),
                iface(InterfaceConfig::wifi("c", 1), &log),
            ],
        );
        sel.interface_mut(0).unwrap().set_rx_quality(40);
        sel.interface_mut(1).unwrap().set_rx_quality(75);
        sel.interface_mut(2).unwrap().set_rx_quality(99);
        assert_eq!(sel.choose_interface(0, Instant::now()), Some(1));
    }

    #[test]
    fn overloaded_serial_radio_is_skipped() {
        let log = Log::default();
        let mut serial = ranked("serial", 0, 1);
        serial.kind = InterfaceKind::Serial { air_rate_bps: 1_000 };
        let mut sel = LinkSelector::new(
            vec![RadioLink::new(0)],
            vec![iface(serial, &log), iface(InterfaceConfig::wifi("wifi", 0), &log)],
        );
        let now = Instant::now();
        assert_eq!(sel.choose_interface(0, now), Some(0));
        sel.interface_mut(0).unwrap().send(&[0u8; 200], 0, now).unwrap();
        assert_eq!(sel.choose_interface(0, now), Some(1));
    }

    // ─── Routing Tests ──────────────────────────────────────────────────

    #[test]
    fn relay_and_rx_only_links_get_nothing() {
        let log = Log::default();
        let mut relay = RadioLink::new(1);
        relay.capabilities = relay.capabilities | Capabilities::RELAY;
        let mut rx_only = RadioLink::new(2);
        rx_only.capabilities = Capabilities::CAN_RX;
        let mut sel = LinkSelector::new(
            vec![RadioLink::new(0), relay, rx_only],
            vec![
                iface(InterfaceConfig::wifi("a", 0), &log),
                iface(InterfaceConfig::wifi("b", 1), &log),
                iface(InterfaceConfig::wifi("c", 2), &log),
            ],
        );
        let d = sel.route(PacketType::VideoData, &RouteContext::default(), Instant::now());
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].link, 0);
    }

    #[test]
    fn control_switches_and_requests_repeat_once() {
        assert_eq!(repeat_count(PacketType::RequestSegments), 1);
        assert_eq!(repeat_count(PacketType::SwitchKeyframe), 1);
        assert_eq!(repeat_count(PacketType::SwitchVideoLevel), 1);
        assert_eq!(repeat_count(PacketType::Command), 0);
    }

    #[test]
    fn transmit_sends_repeats_on_chosen_interface() {
        let log = Log::default();
        let mut sel = LinkSelector::new(
            vec![RadioLink::new(0)],
            vec![iface(InterfaceConfig::wifi("a", 0), &log)],
        );
        let packet = [PacketType::RequestSegments as u8, 0, 0, 0, 0];
        let sent = sel.transmit(&packet, &RouteContext::default(), Instant::now());
        assert_eq!(sent, 2);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(sel.stats().copies_sent, 2);
    }

    #[test]
    fn unknown_packet_type_is_not_sent() {
        let log = Log::default();
        let mut sel = LinkSelector::new(
            vec![RadioLink::new(0)],
            vec![iface(InterfaceConfig::wifi("a", 0), &log)],
        );
        assert_eq!(sel.transmit(&[0xEE, 0, 0, 0, 0], &RouteContext::default(), Instant::now()), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn no_interface_means_no_decision() {
        let mut sel = LinkSelector::new(vec![RadioLink::new(0)], Vec::new());
        let now = Instant::now();
        assert!(sel.route(PacketType::Command, &RouteContext::default(), now).is_empty());
        assert_eq!(sel.transmit(&[PacketType::Command as u8, 0, 0, 0, 0], &RouteContext::default(), now), 0);
        assert_eq!(sel.stats().unroutable, 1);
    }

    // ─── Data Rate Tests ────────────────────────────────────────────────

    #[test]
    fn same_as_video_uses_slower_pinned_rate() {
        let mut link = RadioLink::new(0);
        link.uplink = UplinkDatarate::SameAsVideo;
        link.video_datarate = 24_000_000;
        link.profile_datarates = [0, 12_000_000, 36_000_000];
        assert_eq!(link.policy_datarate(VideoProfile::High), 24_000_000);
        assert_eq!(link.policy_datarate(VideoProfile::Medium), 12_000_000);
        assert_eq!(link.policy_datarate(VideoProfile::Low), 24_000_000);
    }

    #[test]
    fn auto_and_lowest_pick_lowest_of_family() {
        let mut link = RadioLink::new(0);
        link.video_datarate = -4;
        assert_eq!(link.policy_datarate(VideoProfile::High), datarate::LOWEST_MCS_DATARATE);
        link.uplink = UplinkDatarate::Lowest;
        link.video_datarate = 18_000_000;
        assert_eq!(link.policy_datarate(VideoProfile::High), datarate::LOWEST_LEGACY_DATARATE);
    }

    #[test]
    fn lost_controller_and_commands_force_lowest_rate() {
        let log = Log::default();
        let mut link = RadioLink::new(0);
        link.uplink = UplinkDatarate::Fixed(24_000_000);
        let mut sel = LinkSelector::new(vec![link], vec![iface(InterfaceConfig::wifi("a", 0), &log)]);
        let now = Instant::now();

        let normal = sel.route(PacketType::RequestSegments, &RouteContext::default(), now);
        assert_eq!(normal[0].datarate, 24_000_000);

        let cmd = sel.route(PacketType::PairingRequest, &RouteContext::default(), now);
        assert_eq!(cmd[0].datarate, datarate::LOWEST_LEGACY_DATARATE);

        let lost = RouteContext {
            vehicle_lost_controller: true,
            ..Default::default()
        };
        let d = sel.route(PacketType::SwitchVideoLevel, &lost, now);
        assert_eq!(d[0].datarate, datarate::LOWEST_LEGACY_DATARATE);
    }
}
