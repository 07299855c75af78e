//! # Station Loop
//!
//! Single-threaded owner of all reception state. Each iteration:
//!
//! 1. waits up to 5 ms for radio input, then drains everything queued;
//! 2. feeds video to the reliability pipeline, acknowledgements to the
//!    controllers;
//! 3. runs pipeline housekeeping and queues retransmission requests;
//! 4. ticks both adaptive controllers every update interval;
//! 5. flushes the outbound queue through the link selector;
//! 6. publishes snapshots.
//!
//! The uplink counts as lost once the vehicle has not answered anything
//! (retransmitted video, switch acks, ping replies) for the uplink timeout.
//! Pings go out when the vehicle flags that it listens, so a clean link
//! with nothing to request still gets answers.
//!
//! Reader threads and the metrics server talk to the loop only through
//! channels and the snapshot handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use quanta::Instant;
use serde::Serialize;

use aerolink_transport::queue::OutboundQueue;
use aerolink_transport::receiver::{PipelineEvent, ReliabilityPipelineState, VideoSink};
use aerolink_transport::stats::OutputSlice;
use aerolink_transport::wire::{Packet, VideoProfile, stamp_stream_packet_index};

use crate::adaptation::{ControllerInput, KeyframeController, QualityController, QualityState};
use crate::config::{StationConfig, TelemetryConfig};
use crate::net::selector::{LinkSelector, RouteContext};
use crate::net::transport::RadioFrame;
use crate::snapshot::{PipelineSnapshot, SnapshotHandle, SnapshotPublisher};

/// Longest wait for radio input per iteration.
const INPUT_WAIT: Duration = Duration::from_millis(5);

/// Minimum spacing of keepalive pings.
const PING_INTERVAL: Duration = Duration::from_millis(250);

/// Loop-level counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub frames: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub level_acks: u64,
    pub keyframe_acks: u64,
    pub pings_sent: u64,
    pub ping_replies: u64,
    pub controller_ticks: u64,
    pub uplink_packets: u64,
}

pub struct StationLoop<S: VideoSink> {
    telemetry: TelemetryConfig,
    link_lost_timeout: Duration,
    uplink_lost_timeout: Duration,
    pipe: ReliabilityPipelineState,
    quality: QualityController,
    keyframe: KeyframeController,
    queue: OutboundQueue,
    selector: LinkSelector,
    sink: S,
    publisher: SnapshotPublisher,
    slices: Vec<OutputSlice>,
    frames: Option<Receiver<RadioFrame>>,
    last_tick: Option<Instant>,
    last_publish: Option<Instant>,
    last_stats_log: Option<Instant>,
    first_video_at: Option<Instant>,
    /// Last packet the vehicle sent in answer to our uplink.
    last_vehicle_response: Option<Instant>,
    last_ping: Option<Instant>,
    ping_id: u8,
    tx_stream_index: u32,
    stats: LoopStats,
}

impl<S: VideoSink> StationLoop<S> {
    pub fn new(config: &StationConfig, selector: LinkSelector, sink: S) -> Self {
        StationLoop {
            telemetry: config.telemetry.clone(),
            link_lost_timeout: config.receiver.link_lost_timeout,
            uplink_lost_timeout: config.receiver.uplink_lost_timeout,
            pipe: ReliabilityPipelineState::new(config.receiver.clone()),
            quality: QualityController::new(config.quality.clone()),
            keyframe: KeyframeController::new(config.keyframe.clone()),
            queue: OutboundQueue::new(config.queue_capacity),
            selector,
            sink,
            publisher: SnapshotPublisher::new(),
            slices: Vec::new(),
            frames: None,
            last_tick: None,
            last_publish: None,
            last_stats_log: None,
            first_video_at: None,
            last_vehicle_response: None,
            last_ping: None,
            ping_id: 0,
            tx_stream_index: 0,
            stats: LoopStats::default(),
        }
    }

    /// Radio input for [`run`](Self::run).
    pub fn with_frames(mut self, frames: Receiver<RadioFrame>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn snapshots(&self) -> SnapshotHandle {
        self.publisher.handle()
    }

    pub fn pipeline(&self) -> &ReliabilityPipelineState {
        &self.pipe
    }

    pub fn quality(&self) -> &QualityController {
        &self.quality
    }

    pub fn keyframe(&self) -> &KeyframeController {
        &self.keyframe
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn selector(&self) -> &LinkSelector {
        &self.selector
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run until `shutdown` is set or every radio reader is gone.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let Some(frames) = self.frames.clone() else {
            tracing::warn!("station loop started without radio input");
            return;
        };
        tracing::info!("station loop running");
        while !shutdown.load(Ordering::Relaxed) {
            match frames.recv_timeout(INPUT_WAIT) {
                Ok(frame) => {
                    self.handle_frame(frame);
                    while let Ok(frame) = frames.try_recv() {
                        self.handle_frame(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("all radio readers stopped");
                    break;
                }
            }
            self.service(Instant::now());
        }
        self.publish(Instant::now());
        tracing::info!(frames = self.stats.frames, "station loop stopped");
    }

    pub fn handle_frame(&mut self, frame: RadioFrame) {
        self.stats.frames += 1;
        self.handle_datagram(frame.data, frame.received_at);
    }

    /// Decode one datagram off the radio and dispatch it.
    pub fn handle_datagram(&mut self, data: Bytes, now: Instant) {
        let mut buf = data;
        let Some((stream_packet_index, packet)) = Packet::decode(&mut buf) else {
            self.stats.malformed += 1;
            tracing::trace!(len = buf.len(), "undecodable radio packet");
            return;
        };
        match packet {
            Packet::Video(video) => {
                self.first_video_at.get_or_insert(now);
                if video.header.is_retransmitted() {
                    self.last_vehicle_response = Some(now);
                }
                self.pipe
                    .on_video_packet(&video, stream_packet_index, now, &mut self.sink);
            }
            Packet::VideoLevelAck { level } => {
                self.stats.level_acks += 1;
                self.last_vehicle_response = Some(now);
                self.quality.on_level_acknowledged(level);
            }
            Packet::KeyframeAck { keyframe_ms } => {
                self.stats.keyframe_acks += 1;
                self.last_vehicle_response = Some(now);
                self.keyframe.on_keyframe_acknowledged(keyframe_ms);
            }
            Packet::PingReply { ping_id } => {
                self.stats.ping_replies += 1;
                self.last_vehicle_response = Some(now);
                tracing::trace!(ping_id, "ping reply");
            }
            other => {
                self.stats.ignored += 1;
                tracing::trace!(packet_type = %other.packet_type(), "ignoring radio packet");
            }
        }
    }

    /// Nothing answered our uplink within the timeout, counted from the
    /// first video when the vehicle never answered at all.
    fn uplink_silent(&self, now: Instant) -> bool {
        self.last_vehicle_response
            .or(self.first_video_at)
            .is_some_and(|t| now.saturating_duration_since(t) > self.uplink_lost_timeout)
    }

    fn video_silent_for(&self, now: Instant, limit: Duration) -> bool {
        self.pipe
            .last_video_packet_at()
            .is_none_or(|t| now.saturating_duration_since(t) > limit)
    }

    /// Everything but input: housekeeping, requests, controllers, uplink,
    /// snapshots.
    pub fn service(&mut self, now: Instant) {
        let rolled = self.pipe.periodic(now, &mut self.sink);
        if rolled {
            self.slices = self.pipe.output_history().slices().copied().collect();
        }

        if self.pipe.take_can_tx() {
            self.maybe_ping(now);
        }
        let uplink_lost = self.uplink_silent(now);
        self.pipe.set_uplink_lost(uplink_lost);

        self.pipe.request_missing_segments(now, &mut self.queue);
        self.handle_events(now);

        let interval = self.quality.config().update_interval;
        if self
            .last_tick
            .is_none_or(|t| now.saturating_duration_since(t) >= interval)
        {
            self.last_tick = Some(now);
            self.tick_controllers(now);
        }

        self.flush_uplink(uplink_lost, now);

        let publish_due = self
            .last_publish
            .is_none_or(|t| now.saturating_duration_since(t) >= self.telemetry.core_stats_interval);
        if publish_due || rolled {
            self.publish(now);
        }

        if self
            .last_stats_log
            .is_none_or(|t| now.saturating_duration_since(t) >= self.telemetry.stats_log_interval)
        {
            if self.last_stats_log.is_some() {
                self.log_stats(now);
            }
            self.last_stats_log = Some(now);
        }
    }

    fn maybe_ping(&mut self, now: Instant) {
        if self
            .last_ping
            .is_some_and(|t| now.saturating_duration_since(t) < PING_INTERVAL)
        {
            return;
        }
        self.ping_id = self.ping_id.wrapping_add(1);
        let ping = Packet::Ping {
            ping_id: self.ping_id,
        };
        if self.queue.push(ping.encode(0).freeze(), now).is_ok() {
            self.stats.pings_sent += 1;
            self.last_ping = Some(now);
        }
    }

    fn handle_events(&mut self, now: Instant) {
        for event in self.pipe.drain_events() {
            match event {
                PipelineEvent::StreamStarted(info) => {
                    if self.quality.state() == QualityState::Uninitialized {
                        self.quality.on_stream_started(&info, now);
                    }
                }
                PipelineEvent::StreamRestarted => {
                    tracing::info!("vehicle stream restarted");
                    self.last_vehicle_response = Some(now);
                    self.quality.switch_to_medium_level(now);
                    self.keyframe.reset();
                }
                PipelineEvent::WindowDiscarded {
                    last_output_block,
                    reason,
                } => {
                    tracing::info!(?last_output_block, reason, "reception window discarded");
                }
            }
        }
    }

    fn tick_controllers(&mut self, now: Instant) {
        self.stats.controller_ticks += 1;
        self.pipe.close_interval();
        let link_lost = self.video_silent_for(now, self.link_lost_timeout);
        let stream = self.pipe.stream_info().cloned();
        let last_video_packet_at = self.pipe.last_video_packet_at();
        let mut input = ControllerInput {
            history: self.pipe.history_mut(),
            stream: stream.as_ref(),
            last_video_packet_at,
            link_lost,
        };
        self.quality.tick(now, &mut input, &mut self.queue);
        self.keyframe.tick(now, &mut input, &mut self.queue);
    }

    fn flush_uplink(&mut self, uplink_lost: bool, now: Instant) {
        let ctx = RouteContext {
            profile: self
                .pipe
                .stream_info()
                .map_or(VideoProfile::default(), |s| s.profile),
            vehicle_lost_controller: uplink_lost,
        };
        while let Some(packet) = self.queue.pop() {
            let mut buf = BytesMut::from(&packet[..]);
            self.tx_stream_index = self.tx_stream_index.wrapping_add(1);
            if !stamp_stream_packet_index(&mut buf, self.tx_stream_index) {
                continue;
            }
            self.stats.uplink_packets += 1;
            self.selector.transmit(&buf, &ctx, now);
        }
    }

    fn publish(&mut self, now: Instant) {
        let snapshot = PipelineSnapshot::capture(
            &self.pipe,
            &self.quality,
            &self.keyframe,
            &self.queue,
            &self.selector,
            &self.slices,
            now,
        );
        self.publisher.publish(snapshot);
        self.last_publish = Some(now);
    }

    fn log_stats(&self, now: Instant) {
        let st = self.pipe.stats();
        let rtx = self.pipe.retransmission_stats();
        tracing::info!(
            clean = st.blocks_clean,
            reconstructed = st.blocks_reconstructed,
            bad = st.blocks_bad,
            window = self.pipe.window().len(),
            requests = rtx.requests_sent,
            recovered = rtx.segments_received,
            rtt_avg_us = self.pipe.rtt().avg_us(),
            level = self.quality.target_level(),
            keyframe_ms = self.keyframe.requested_ms(),
            uplink = self.stats.uplink_packets,
            unroutable = self.selector.stats().unroutable,
            video_silent = self.video_silent_for(now, self.link_lost_timeout),
            uplink_silent = self.uplink_silent(now),
            "station stats"
        );
    }
}
