//! Hot-path benchmarks for aerolink-transport.
//!
//! Measures the per-packet costs on the ground station:
//! - Video packet decode off the wire
//! - Reed-Solomon reconstruction of one block
//! - Full pipeline ingest (clean and lossy streams)
//! - Retransmission request building over a damaged window
//!
//! Run with: cargo bench --package aerolink-transport

use bytes::Bytes;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use quanta::Instant;
use std::time::Duration;

use aerolink_transport::codec::{FecCodec, ReedSolomonCodec};
use aerolink_transport::queue::OutboundQueue;
use aerolink_transport::receiver::{NullSink, ReceiverConfig, ReliabilityPipelineState};
use aerolink_transport::wire::{
    BlockScheme, ENCODING_RETRANSMISSIONS, Packet, VideoHeader, VideoPacket,
    encoding_flags_with_window,
};

const SCHEME: BlockScheme = BlockScheme {
    packet_length: 1100,
    data_packets: 8,
    fec_packets: 4,
};

fn block_packets(block: u32) -> Vec<VideoPacket> {
    let data: Vec<Vec<u8>> = (0..SCHEME.data_packets as usize)
        .map(|i| vec![(block as usize + i) as u8; SCHEME.packet_length as usize])
        .collect();
    let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
    let fec = ReedSolomonCodec
        .encode(&refs, SCHEME.fec_packets as usize)
        .unwrap();
    data.into_iter()
        .chain(fec)
        .enumerate()
        .map(|(i, p)| {
            let mut header = VideoHeader::new(block, i as u8, SCHEME);
            header.encoding_flags = encoding_flags_with_window(ENCODING_RETRANSMISSIONS, 140);
            header.video_bitrate_bps = 4_000_000;
            VideoPacket {
                header,
                payload: Bytes::from(p),
            }
        })
        .collect()
}

// ─── Wire ───────────────────────────────────────────────────────────────

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_decode");
    let wire = Packet::Video(block_packets(0).remove(0)).encode(1).freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("video_1100", |b| {
        b.iter(|| {
            let mut buf = black_box(wire.clone());
            black_box(Packet::decode(&mut buf));
        });
    });
    group.finish();
}

// ─── FEC ────────────────────────────────────────────────────────────────

fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_reconstruct");
    let packets = block_packets(0);
    for lost in [1usize, 2, 4] {
        let missing: Vec<usize> = (0..lost).collect();
        let present: Vec<(usize, &[u8])> = (lost..8).map(|i| (i, &packets[i].payload[..])).collect();
        let fec: Vec<(usize, &[u8])> = (0..lost).map(|i| (i, &packets[8 + i].payload[..])).collect();
        group.throughput(Throughput::Bytes((lost * SCHEME.packet_length as usize) as u64));
        group.bench_function(format!("8+4_lost{lost}"), |b| {
            b.iter(|| {
                black_box(
                    ReedSolomonCodec
                        .decode(8, 4, black_box(&present), &fec, &missing)
                        .unwrap(),
                );
            });
        });
    }
    group.finish();
}

// ─── Pipeline ───────────────────────────────────────────────────────────

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_ingest");
    let blocks: Vec<Vec<VideoPacket>> = (0..64).map(block_packets).collect();
    group.throughput(Throughput::Elements(64 * 12));

    group.bench_function("clean_64_blocks", |b| {
        b.iter(|| {
            let mut pipe = ReliabilityPipelineState::new(ReceiverConfig::default());
            let now = Instant::now();
            let mut idx = 0;
            for pkt in blocks.iter().flatten() {
                idx += 1;
                pipe.on_video_packet(pkt, idx, now, &mut NullSink);
            }
            black_box(pipe.stats().blocks_clean);
        });
    });

    group.bench_function("one_loss_per_block_64_blocks", |b| {
        b.iter(|| {
            let mut pipe = ReliabilityPipelineState::new(ReceiverConfig::default());
            let now = Instant::now();
            let mut idx = 0;
            for block in &blocks {
                for pkt in block.iter().skip(1) {
                    idx += 1;
                    pipe.on_video_packet(pkt, idx, now, &mut NullSink);
                }
            }
            black_box(pipe.stats().blocks_reconstructed);
        });
    });
    group.finish();
}

fn bench_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("retransmission_request");
    let blocks: Vec<Vec<VideoPacket>> = (0..20).map(block_packets).collect();

    group.bench_function("damaged_window_20_blocks", |b| {
        b.iter(|| {
            let mut pipe = ReliabilityPipelineState::new(ReceiverConfig::default());
            let mut queue = OutboundQueue::default();
            let t0 = Instant::now();
            let mut idx = 0;
            for block in &blocks {
                for pkt in block.iter().step_by(3) {
                    idx += 1;
                    pipe.on_video_packet(pkt, idx, t0, &mut NullSink);
                }
            }
            black_box(pipe.request_missing_segments(t0 + Duration::from_millis(60), &mut queue));
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_decode,
    bench_reconstruct,
    bench_ingest,
    bench_requests
);
criterion_main!(benches);
