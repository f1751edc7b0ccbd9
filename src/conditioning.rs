//! # Conditioner - From Raw Jitter to Uniform Bytes
//!
//! Raw source output is biased and correlated: timing LSBs cluster, RSSI
//! readings drift, counter deltas favour small values. The conditioner
//! offers three primitives with well-defined composition semantics:
//!
//! - **Von Neumann debiasing**: consumes bit pairs, emits one bit per
//!   unequal pair, discards equal pairs. Removes first-order bias with an
//!   information-theoretic guarantee, at ~25% throughput for unbiased input.
//! - **XOR folding**: collapses groups of `k` bytes into one by XOR,
//!   increasing entropy density at a fixed throughput cost.
//! - **Keyed SHA-256 extraction**: the workhorse. Each 32-byte block is
//!   `SHA-256(state || chunk || LE64(counter) || LE64(wall_ns) || mix8)`
//!   where `mix8` is fresh system-CSPRNG material. The block output
//!   replaces the state, so the state never reverts and the chain is
//!   forward-evolving by construction.
//!
//! The pool always applies the keyed extractor for its default output path;
//! the raw and debiased modes exist as opt-in research choices.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{HarvestError, Result};

/// Conditioning modes selectable on pool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditioningMode {
    /// Buffer bytes emitted verbatim. Research use only.
    Raw,
    /// Von Neumann debiased buffer bits, packed into bytes.
    VonNeumann,
    /// Keyed SHA-256 extractor. The default, and the only mode with
    /// cryptographic output guarantees.
    #[default]
    Sha256,
}

impl ConditioningMode {
    /// Stable string token for this mode.
    #[must_use]
    pub fn token(&self) -> &'static str {
        match self {
            ConditioningMode::Raw => "raw",
            ConditioningMode::VonNeumann => "vonneumann",
            ConditioningMode::Sha256 => "sha256",
        }
    }
}

impl FromStr for ConditioningMode {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ConditioningMode::Raw),
            "vonneumann" => Ok(ConditioningMode::VonNeumann),
            "sha256" => Ok(ConditioningMode::Sha256),
            other => Err(HarvestError::InvalidArgument(format!(
                "unknown conditioning mode '{other}'"
            ))),
        }
    }
}

/// Accounting for a Von Neumann debiasing pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DebiasStats {
    pub input_bits: usize,
    pub output_bits: usize,
    /// `output_bits / input_bits`; ~0.25 for unbiased input.
    pub efficiency: f64,
}

/// Accounting for an XOR folding pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FoldStats {
    pub input_len: usize,
    pub output_len: usize,
    pub fold_factor: usize,
}

/// Unpack bytes into bits, most significant bit first.
#[must_use]
pub(crate) fn unpack_bits(data: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for &byte in data {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

/// Pack a bit slice into bytes, most significant bit first. A trailing
/// partial byte is zero-extended.
#[must_use]
pub(crate) fn pack_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len().div_ceil(8));
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            byte |= (bit & 1) << (7 - i);
        }
        out.push(byte);
    }
    out
}

/// Von Neumann debiasing over a 0/1 bit slice.
///
/// Pairs (0,1) emit 0, (1,0) emit 1, equal pairs are discarded; a trailing
/// unpaired bit is dropped. The output is unbiased regardless of the input
/// bias, provided successive input bits are independent.
#[must_use]
pub fn von_neumann_debias_bits(bits: &[u8]) -> (Vec<u8>, DebiasStats) {
    let mut out = Vec::with_capacity(bits.len() / 4);
    for pair in bits.chunks_exact(2) {
        let (a, b) = (pair[0] & 1, pair[1] & 1);
        if a != b {
            out.push(a);
        }
    }
    let stats = DebiasStats {
        input_bits: bits.len(),
        output_bits: out.len(),
        efficiency: out.len() as f64 / bits.len().max(1) as f64,
    };
    (out, stats)
}

/// Von Neumann debiasing over bytes: unpack to bits, debias, repack.
#[must_use]
pub fn von_neumann_debias(data: &[u8]) -> (Vec<u8>, DebiasStats) {
    let bits = unpack_bits(data);
    let (out_bits, stats) = von_neumann_debias_bits(&bits);
    (pack_bits(&out_bits), stats)
}

/// XOR-fold `data` by integer factor `k`: each group of `k` bytes collapses
/// to their XOR; the remainder group is truncated. Output length is
/// `floor(len / k)`.
#[must_use]
pub fn xor_fold(data: &[u8], fold_factor: usize) -> (Vec<u8>, FoldStats) {
    let k = fold_factor.max(1);
    let out: Vec<u8> = data
        .chunks_exact(k)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &b| acc ^ b))
        .collect();
    let stats = FoldStats {
        input_len: data.len(),
        output_len: out.len(),
        fold_factor: k,
    };
    (out, stats)
}

/// Evolving 32-byte extractor state. Zeroised on drop so conditioned key
/// material does not linger in freed memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConditionerState(pub(crate) [u8; 32]);

impl std::fmt::Debug for ConditionerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // State bytes stay out of logs.
        write!(f, "ConditionerState(..)")
    }
}

impl ConditionerState {
    /// Seed a fresh state as `SHA-256(csprng32 || seed?)`.
    pub fn seeded(seed: Option<&[u8]>) -> Result<Self> {
        let mut initial = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut initial)
            .map_err(|e| HarvestError::EntropyUnavailable(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(initial);
        if let Some(seed) = seed {
            hasher.update(seed);
        }
        Ok(Self(hasher.finalize().into()))
    }
}

/// One keyed extractor block:
/// `SHA-256(state || chunk || LE64(counter) || LE64(wall_ns) || mix)`.
///
/// Deterministic in its five inputs. Callers are responsible for feeding a
/// strictly monotonic counter and fresh `mix` material; under that regime
/// two blocks never repeat even for identical chunks.
#[must_use]
pub fn extract_block(
    state: &[u8; 32],
    chunk: &[u8],
    counter: u64,
    wall_time_ns: u64,
    mix: &[u8; 8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(state);
    hasher.update(chunk);
    hasher.update(counter.to_le_bytes());
    hasher.update(wall_time_ns.to_le_bytes());
    hasher.update(mix);
    hasher.finalize().into()
}

/// Fresh 8 bytes from the operating system CSPRNG.
pub fn fresh_mix() -> Result<[u8; 8]> {
    let mut mix = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut mix)
        .map_err(|e| HarvestError::EntropyUnavailable(e.to_string()))?;
    Ok(mix)
}

/// Wall-clock nanoseconds since the Unix epoch, saturating on clock skew.
#[must_use]
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
