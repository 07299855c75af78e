//! Property-based tests for the FEC codec.
//!
//! Any erasure pattern that leaves at least `data_count` shards must give
//! back the original data, both through the codec directly and through
//! `VideoBlock` reassembly.

use proptest::prelude::*;
use quanta::Instant;

use aerolink_transport::block::VideoBlock;
use aerolink_transport::codec::{FecCodec, ReedSolomonCodec};
use aerolink_transport::wire::{BlockScheme, VideoHeader};

fn data_shards(count: usize, len: usize, seed: u64) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            (0..len)
                .map(|j| ((i as u64).wrapping_mul(31).wrapping_add(j as u64 * 7).wrapping_add(seed)) as u8)
                .collect()
        })
        .collect()
}

/// `(data_count, fec_count, shard length)`, odd and even lengths alike.
fn shape() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..=16, 1usize..=8, 1usize..=256)
}

// ─── Codec Recovery ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn codec_recovers_any_erasure_within_budget(
        (data_count, fec_count, len) in shape(),
        seed in any::<u64>(),
        lost_mask in any::<u32>(),
    ) {
        let data = data_shards(data_count, len, seed);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let fec = ReedSolomonCodec.encode(&refs, fec_count).unwrap();
        prop_assert_eq!(fec.len(), fec_count);

        // Lose up to fec_count shards, data first.
        let total = data_count + fec_count;
        let lost: Vec<usize> = (0..total)
            .filter(|i| lost_mask & (1 << (i % 32)) != 0)
            .take(fec_count)
            .collect();
        let missing: Vec<usize> = lost.iter().copied().filter(|&i| i < data_count).collect();
        let present_data: Vec<(usize, &[u8])> = (0..data_count)
            .filter(|i| !lost.contains(i))
            .map(|i| (i, refs[i]))
            .collect();
        let present_fec: Vec<(usize, &[u8])> = (0..fec_count)
            .filter(|i| !lost.contains(&(data_count + i)))
            .map(|i| (i, fec[i].as_slice()))
            .collect();

        let restored = ReedSolomonCodec
            .decode(data_count, fec_count, &present_data, &present_fec, &missing)
            .unwrap();
        prop_assert_eq!(restored.len(), missing.len());
        for (idx, shard) in restored {
            prop_assert_eq!(&shard, &data[idx]);
        }
    }

    #[test]
    fn codec_refuses_too_many_erasures(
        (data_count, fec_count, len) in shape(),
        seed in any::<u64>(),
    ) {
        let data = data_shards(data_count, len, seed);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let fec = ReedSolomonCodec.encode(&refs, fec_count).unwrap();

        // All FEC shards plus one short of the data count.
        let present_data: Vec<(usize, &[u8])> = (0..data_count.saturating_sub(fec_count + 1))
            .map(|i| (i, refs[i]))
            .collect();
        let present_fec: Vec<(usize, &[u8])> =
            fec.iter().enumerate().map(|(i, s)| (i, s.as_slice())).collect();
        let missing: Vec<usize> = (present_data.len()..data_count).collect();
        prop_assume!(present_data.len() + present_fec.len() < data_count);

        prop_assert!(ReedSolomonCodec
            .decode(data_count, fec_count, &present_data, &present_fec, &missing)
            .is_err());
    }
}

// ─── Block Reassembly ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn block_reconstruction_matches_sent_data(
        (data_count, fec_count, len) in shape(),
        seed in any::<u64>(),
        order in Just((0u8..24).collect::<Vec<u8>>()).prop_shuffle(),
    ) {
        let scheme = BlockScheme::new(len as u16, data_count as u8, fec_count as u8);
        let data = data_shards(data_count, len, seed);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let fec = ReedSolomonCodec.encode(&refs, fec_count).unwrap();
        let all: Vec<&[u8]> = refs.iter().copied().chain(fec.iter().map(|v| v.as_slice())).collect();

        // Deliver exactly data_count segments in a shuffled order.
        let now = Instant::now();
        let mut block = VideoBlock::new();
        let total = data_count + fec_count;
        for idx in order.into_iter().map(usize::from).filter(|&i| i < total).take(data_count) {
            let header = VideoHeader::new(3, idx as u8, scheme);
            block.insert(&header, all[idx], now);
        }
        prop_assert!(block.is_recoverable());

        block.reconstruct(&ReedSolomonCodec).unwrap();
        prop_assert!(block.is_complete());
        for (i, payload) in block.data_segments() {
            prop_assert_eq!(payload, data[i as usize].as_slice());
        }
    }
}
