//! Radio data rate encoding.
//!
//! A data rate is an `i32`: positive values are legacy rates in bits per
//! second, negative values are HT MCS indices encoded as `-(mcs + 1)`.
//! Comparing two rates means comparing their real air throughput, which
//! for MCS rates depends on the channel width.

/// Slowest rate used for uplink data on legacy-rate links.
pub const LOWEST_LEGACY_DATARATE: i32 = 2_000_000;

/// MCS 0 in the signed encoding.
pub const LOWEST_MCS_DATARATE: i32 = -1;

/// Rate used when nothing better is known.
pub const DEFAULT_DATA_DATARATE: i32 = 6_000_000;

/// Legacy 802.11 rates, ascending.
pub const LEGACY_DATARATES: [i32; 12] = [
    1_000_000, 2_000_000, 5_500_000, 6_000_000, 9_000_000, 11_000_000, 12_000_000, 18_000_000,
    24_000_000, 36_000_000, 48_000_000, 54_000_000,
];

/// Single-stream long-GI throughput per MCS index, HT20.
const MCS_HT20_BPS: [u64; 8] = [
    6_500_000, 13_000_000, 19_500_000, 26_000_000, 39_000_000, 52_000_000, 58_500_000,
    65_000_000,
];

/// Single-stream long-GI throughput per MCS index, HT40.
const MCS_HT40_BPS: [u64; 8] = [
    13_500_000, 27_000_000, 40_500_000, 54_000_000, 81_000_000, 108_000_000, 121_500_000,
    135_000_000,
];

#[inline]
pub fn is_mcs(rate: i32) -> bool {
    rate < 0
}

/// MCS index of a negative rate.
#[inline]
pub fn mcs_index(rate: i32) -> Option<usize> {
    if rate < 0 {
        Some((-(rate as i64) - 1) as usize)
    } else {
        None
    }
}

/// Real air throughput of a rate in bits per second.
///
/// MCS indices beyond the table saturate at the highest entry.
pub fn real_datarate_bps(rate: i32, ht40: bool) -> u64 {
    match mcs_index(rate) {
        Some(mcs) => {
            let table = if ht40 { &MCS_HT40_BPS } else { &MCS_HT20_BPS };
            table[mcs.min(table.len() - 1)]
        }
        None => rate.max(0) as u64,
    }
}

/// The slower of two rates by real throughput.
pub fn slower(a: i32, b: i32, ht40: bool) -> i32 {
    if real_datarate_bps(b, ht40) < real_datarate_bps(a, ht40) {
        b
    } else {
        a
    }
}

/// Lowest rate of the same family as `rate`.
pub fn lowest_like(rate: i32) -> i32 {
    if rate > 0 {
        LOWEST_LEGACY_DATARATE
    } else {
        LOWEST_MCS_DATARATE
    }
}

/// Human-readable form for logs.
pub fn describe(rate: i32) -> String {
    match mcs_index(rate) {
        Some(mcs) => format!("MCS-{mcs}"),
        None if rate % 1_000_000 == 0 => format!("{} Mbps", rate / 1_000_000),
        None => format!("{:.1} Mbps", rate as f64 / 1_000_000.0),
    }
}
