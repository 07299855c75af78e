//! # FEC Codec
//!
//! Block erasure coding consumed as a black box. The reception window only
//! needs two operations: produce `fec_count` recovery shards for a block of
//! data shards (used by the vehicle simulator and tests), and restore the
//! missing data shards of a block from whatever data and FEC shards arrived.
//!
//! [`ReedSolomonCodec`] accepts any non-zero shard length:
//!
//! - even lengths go through `reed-solomon-simd` (GF(2^16), Leopard);
//! - odd lengths go through `reed-solomon-erasure` (GF(2^8)), since a 16-bit
//!   recovery symbol does not fit an odd packet.
//!
//! The choice depends only on the packet length, so both ends of the link
//! agree on it.

use reed_solomon_erasure::galois_8;
use thiserror::Error;

/// FEC primitive failures.
#[derive(Debug, Error)]
pub enum FecError {
    #[error("reed-solomon: {0}")]
    Codec(#[from] reed_solomon_simd::Error),
    #[error("reed-solomon (gf8): {0}")]
    Erasure(#[from] reed_solomon_erasure::Error),
    #[error("invalid shard shape: {0}")]
    Shape(&'static str),
}
/// Erasure code over equally sized shards.
pub trait FecCodec: Send {
    /// Produce `fec_count` recovery shards for `data`.
    fn encode(&self, data: &[&[u8]], fec_count: usize) -> Result<Vec<Vec<u8>>, FecError>;

    /// Restore the `missing` data shards.
    ///
    /// `present_data` and `present_fec` carry `(index, shard)` pairs, FEC
    /// indices counted from zero. Returns one `(index, shard)` per entry
    /// in `missing`.
    fn decode(
        &self,
        data_count: usize,
        fec_count: usize,
        present_data: &[(usize, &[u8])],
        present_fec: &[(usize, &[u8])],
        missing: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, FecError>;
}

// ─── Reed-Solomon ───────────────────────────────────────────────────────────

/// Reed-Solomon codec for any shard length.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReedSolomonCodec;

impl ReedSolomonCodec {
    pub fn new() -> Self {
        ReedSolomonCodec
    }
}

fn shard_len<'a>(shards: impl Iterator<Item = &'a [u8]>) -> Result<usize, FecError> {
    let mut len = None;
    for shard in shards {
        match len {
            None => len = Some(shard.len()),
            Some(l) if l != shard.len() => return Err(FecError::Shape("shard lengths differ")),
            Some(_) => {}
        }
    }
    match len {
        Some(0) | None => Err(FecError::Shape("empty shard set")),
        Some(l) => Ok(l),
    }
}

/// GF(2^8) path for odd shard lengths. Returns all shards, data restored.
fn decode_gf8(
    data_count: usize,
    fec_count: usize,
    present_data: &[(usize, &[u8])],
    present_fec: &[(usize, &[u8])],
) -> Result<Vec<Option<Vec<u8>>>, FecError> {
    let rs = galois_8::ReedSolomon::new(data_count, fec_count)?;
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; data_count + fec_count];
    for &(i, shard) in present_data {
        shards[i] = Some(shard.to_vec());
    }
    for &(i, shard) in present_fec {
        shards[data_count + i] = Some(shard.to_vec());
    }
    rs.reconstruct_data(&mut shards)?;
    Ok(shards)
}

impl FecCodec for ReedSolomonCodec {
    fn encode(&self, data: &[&[u8]], fec_count: usize) -> Result<Vec<Vec<u8>>, FecError> {
        let len = shard_len(data.iter().copied())?;
        if fec_count == 0 {
            return Ok(Vec::new());
        }
        if len % 2 == 0 {
            return Ok(reed_solomon_simd::encode(data.len(), fec_count, data.iter())?);
        }

        let rs = galois_8::ReedSolomon::new(data.len(), fec_count)?;
        let mut shards: Vec<Vec<u8>> = data
            .iter()
            .map(|s| s.to_vec())
            .chain(std::iter::repeat(vec![0u8; len]).take(fec_count))
            .collect();
        rs.encode(&mut shards)?;
        Ok(shards.split_off(data.len()))
    }

    fn decode(
        &self,
        data_count: usize,
        fec_count: usize,
        present_data: &[(usize, &[u8])],
        present_fec: &[(usize, &[u8])],
        missing: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, FecError> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        if present_data.len() + present_fec.len() < data_count {
            return Err(FecError::Shape("not enough shards to reconstruct"));
        }
        if present_fec.iter().any(|&(i, _)| i >= fec_count)
            || present_data.iter().any(|&(i, _)| i >= data_count)
            || missing.iter().any(|&i| i >= data_count)
        {
            return Err(FecError::Shape("shard index out of range"));
        }
        let len = shard_len(
            present_data
                .iter()
                .chain(present_fec.iter())
                .map(|&(_, s)| s),
        )?;

        let mut out = Vec::with_capacity(missing.len());
        if len % 2 == 0 {
            let mut restored = reed_solomon_simd::decode(
                data_count,
                fec_count,
                present_data.iter().copied(),
                present_fec.iter().copied(),
            )?;
            for &idx in missing {
                let shard = restored
                    .remove(&idx)
                    .ok_or(FecError::Shape("decoder did not restore a missing shard"))?;
                out.push((idx, shard));
            }
        } else {
            let mut shards = decode_gf8(data_count, fec_count, present_data, present_fec)?;
            for &idx in missing {
                let shard = shards[idx]
                    .take()
                    .ok_or(FecError::Shape("decoder did not restore a missing shard"))?;
                out.push((idx, shard));
            }
        }
        Ok(out)
    }
}
