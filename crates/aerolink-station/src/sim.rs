//! # Vehicle Simulator
//!
//! A seeded stand-in for the air side. Produces FEC-coded video blocks the
//! way the vehicle does, drops packets at a configured rate, answers
//! retransmission requests from the blocks it still holds, and acknowledges
//! quality and keyframe switches.
//!
//! Used by integration tests and by the binary's `--simulate` mode, where a
//! thread runs it against the station loop through crossbeam channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use quanta::Instant;
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use aerolink_transport::codec::{FecCodec, ReedSolomonCodec};
use aerolink_transport::wire::{
    BlockScheme, ENCODING_ADAPTIVE_KEYFRAME, ENCODING_ADAPTIVE_VIDEO, ENCODING_RETRANSMISSIONS,
    Packet, VIDEO_FLAG_CAN_TX, VIDEO_FLAG_RETRANSMITTED, VideoHeader, VideoPacket,
    encoding_flags_with_window,
};

use crate::net::interface::RadioTx;
use crate::net::transport::RadioFrame;

/// Blocks kept for answering requests.
const HELD_BLOCKS: usize = 64;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    /// Probability of losing any one packet, both directions.
    pub loss: f64,
    pub scheme: BlockScheme,
    pub retransmission_window_ms: u32,
    /// Keyframe interval the vehicle starts with.
    pub keyframe_ms: u32,
    pub base_bitrate_bps: u32,
    /// Time between blocks when run as a thread.
    pub block_interval: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            seed: 1,
            loss: 0.0,
            scheme: BlockScheme::new(1024, 8, 2),
            retransmission_window_ms: 140,
            keyframe_ms: 2000,
            base_bitrate_bps: 4_000_000,
            block_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    pub blocks: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub requests_received: u64,
    pub retransmissions_sent: u64,
    pub requests_unanswerable: u64,
    pub level_switches: u64,
    pub keyframe_switches: u64,
    pub pings_answered: u64,
}

struct HeldBlock {
    index: u32,
    packets: Vec<Bytes>,
}

pub struct VehicleSim {
    config: SimConfig,
    rng: StdRng,
    codec: ReedSolomonCodec,
    next_block: u32,
    stream_index: u32,
    held: VecDeque<HeldBlock>,
    level: u32,
    keyframe_ms: u32,
    stats: SimStats,
}

impl VehicleSim {
    pub fn new(config: SimConfig) -> Self {
        VehicleSim {
            rng: StdRng::seed_from_u64(config.seed),
            codec: ReedSolomonCodec::new(),
            next_block: 0,
            stream_index: 0,
            held: VecDeque::with_capacity(HELD_BLOCKS),
            level: 0,
            keyframe_ms: config.keyframe_ms,
            stats: SimStats::default(),
            config,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn keyframe_ms(&self) -> u32 {
        self.keyframe_ms
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn set_loss(&mut self, loss: f64) {
        self.config.loss = loss.clamp(0.0, 1.0);
    }

    fn lost(&mut self) -> bool {
        self.config.loss > 0.0 && self.rng.random::<f64>() < self.config.loss
    }

    fn bitrate(&self) -> u32 {
        let cut = (self.level * 5).min(90);
        self.config.base_bitrate_bps / 100 * (100 - cut)
    }

    fn header(&self, block: u32, packet: u8) -> VideoHeader {
        let mut h = VideoHeader::new(block, packet, self.config.scheme);
        h.encoding_flags = encoding_flags_with_window(
            ENCODING_RETRANSMISSIONS | ENCODING_ADAPTIVE_VIDEO | ENCODING_ADAPTIVE_KEYFRAME,
            self.config.retransmission_window_ms,
        );
        h.video_bitrate_bps = self.bitrate();
        h.keyframe_ms = self.keyframe_ms.min(u16::MAX as u32) as u16;
        h
    }

    fn encode(&mut self, packet: &Packet) -> Bytes {
        self.stream_index = self.stream_index.wrapping_add(1);
        packet.encode(self.stream_index).freeze()
    }

    /// Build the next block and return the packets that survive the channel.
    pub fn next_block(&mut self) -> Vec<Bytes> {
        let scheme = self.config.scheme;
        let block = self.next_block;
        self.next_block = self.next_block.wrapping_add(1);
        self.stats.blocks += 1;

        let data: Vec<Vec<u8>> = (0..scheme.data_packets)
            .map(|_| {
                (0..scheme.packet_length)
                    .map(|_| self.rng.random::<u8>())
                    .collect::<Vec<u8>>()
            })
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(|p| p.as_slice()).collect();
        let fec = match self.codec.encode(&refs, scheme.fec_packets as usize) {
            Ok(fec) => fec,
            Err(e) => {
                tracing::warn!(block, error = %e, "simulated FEC encode failed");
                Vec::new()
            }
        };

        let total = data.len() + fec.len();
        let mut held = Vec::with_capacity(total);
        let mut out = Vec::with_capacity(total);
        for (i, payload) in data.into_iter().chain(fec).enumerate() {
            let mut header = self.header(block, i as u8);
            if i + 1 == total {
                header.flags |= VIDEO_FLAG_CAN_TX;
            }
            let packet = Packet::Video(VideoPacket {
                header,
                payload: Bytes::from(payload),
            });
            let wire = self.encode(&packet);
            held.push(wire.clone());
            if self.lost() {
                self.stats.packets_dropped += 1;
            } else {
                self.stats.packets_sent += 1;
                out.push(wire);
            }
        }

        if self.held.len() == HELD_BLOCKS {
            self.held.pop_front();
        }
        self.held.push_back(HeldBlock {
            index: block,
            packets: held,
        });
        out
    }

    /// Handle one uplink packet from the station; returns the replies that
    /// survive the channel.
    pub fn handle_uplink(&mut self, wire: &[u8]) -> Vec<Bytes> {
        if self.lost() {
            return Vec::new();
        }
        let mut buf = Bytes::copy_from_slice(wire);
        let Some((_, packet)) = Packet::decode(&mut buf) else {
            tracing::debug!(len = wire.len(), "simulator ignored malformed uplink packet");
            return Vec::new();
        };
        match packet {
            Packet::RequestSegments(req) => {
                self.stats.requests_received += 1;
                let mut replies = Vec::with_capacity(req.segments.len());
                for seg in &req.segments {
                    let original = self
                        .held
                        .iter()
                        .find(|b| b.index == seg.block_index)
                        .and_then(|b| b.packets.get(seg.packet_index as usize))
                        .cloned();
                    let Some(original) = original else {
                        self.stats.requests_unanswerable += 1;
                        continue;
                    };
                    let mut raw = original;
                    let Some((_, Packet::Video(mut video))) = Packet::decode(&mut raw) else {
                        continue;
                    };
                    video.header.flags |= VIDEO_FLAG_RETRANSMITTED;
                    video.header.flags &= !VIDEO_FLAG_CAN_TX;
                    video.header.request_id = req.request_id;
                    let wire = self.encode(&Packet::Video(video));
                    if self.lost() {
                        self.stats.packets_dropped += 1;
                    } else {
                        self.stats.retransmissions_sent += 1;
                        replies.push(wire);
                    }
                }
                replies
            }
            Packet::SwitchVideoLevel { level, .. } => {
                if level != self.level {
                    self.stats.level_switches += 1;
                    self.level = level;
                }
                vec![self.encode(&Packet::VideoLevelAck { level })]
            }
            Packet::SwitchKeyframe { keyframe_ms, .. } => {
                if keyframe_ms != self.keyframe_ms {
                    self.stats.keyframe_switches += 1;
                    self.keyframe_ms = keyframe_ms;
                }
                vec![self.encode(&Packet::KeyframeAck { keyframe_ms })]
            }
            Packet::Ping { ping_id } => {
                self.stats.pings_answered += 1;
                vec![self.encode(&Packet::PingReply { ping_id })]
            }
            other => {
                tracing::trace!(packet_type = %other.packet_type(), "simulator ignored uplink packet");
                Vec::new()
            }
        }
    }
}

// ─── Threaded Mode ──────────────────────────────────────────────────────────

/// Uplink "radio" that hands station packets to the simulator thread.
pub struct SimUplink {
    tx: Sender<Bytes>,
}

impl SimUplink {
    pub fn new(tx: Sender<Bytes>) -> Self {
        SimUplink { tx }
    }
}

impl RadioTx for SimUplink {
    fn send(&self, packet: &[u8], _datarate: i32) -> anyhow::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| anyhow::anyhow!("simulator stopped"))?;
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        "sim"
    }
}

/// Run the simulator on its own thread, emitting one block per
/// `block_interval` into `frames` as if received on `interface`.
pub fn spawn_simulator(
    mut sim: VehicleSim,
    interface: usize,
    frames: Sender<RadioFrame>,
    uplink: Receiver<Bytes>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<SimStats>> {
    let interval = sim.config.block_interval;
    let handle = std::thread::Builder::new()
        .name("vehicle-sim".into())
        .spawn(move || {
            let deliver = |wire: Bytes| {
                frames
                    .send(RadioFrame {
                        interface,
                        data: wire,
                        received_at: Instant::now(),
                    })
                    .is_ok()
            };
            let mut next = Instant::now();
            'run: while !shutdown.load(Ordering::Relaxed) {
                let now = Instant::now();
                if now >= next {
                    next = now + interval;
                    for wire in sim.next_block() {
                        if !deliver(wire) {
                            break 'run;
                        }
                    }
                }
                let wait = next.saturating_duration_since(Instant::now());
                if let Ok(packet) = uplink.recv_timeout(wait) {
                    for wire in sim.handle_uplink(&packet) {
                        if !deliver(wire) {
                            break 'run;
                        }
                    }
                }
            }
            tracing::debug!(blocks = sim.stats().blocks, "vehicle simulator stopped");
            sim.stats().clone()
        })?;
    Ok(handle)
}
