//! Conditioning pipeline validation: debiasing laws, fold laws, the fixed
//! extractor vector, and the freshness guarantee of pool output.

use entropy_forge::conditioning::{
    extract_block, von_neumann_debias_bits, xor_fold, ConditioningMode,
};
use entropy_forge::quality::{quick_quality, quick_shannon};
use entropy_forge::{EntropyPool, PoolConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

/// Pack a 0/1 bit vector into bytes, MSB first, mirroring how a biased
/// bitstream would arrive on the wire.
fn pack(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | ((b & 1) << (7 - i)))
        })
        .collect()
}

fn unpack(data: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for &byte in data {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

#[test]
fn debias_removes_seventy_percent_bias() {
    // 10_000 bits with p(1) = 0.7, packed to 1250 bytes and unpacked again
    // the way the pool's vonneumann path sees them.
    let mut rng = ChaCha20Rng::seed_from_u64(0x5eed);
    let bits: Vec<u8> = (0..10_000)
        .map(|_| u8::from(rng.gen::<f64>() < 0.7))
        .collect();
    let packed = pack(&bits);
    assert_eq!(packed.len(), 1250);

    let (debiased, stats) = von_neumann_debias_bits(&unpack(&packed));
    assert!(
        debiased.len() >= 500,
        "expected >= 500 debiased bits, got {}",
        debiased.len()
    );
    let mean = debiased.iter().map(|&b| f64::from(b)).sum::<f64>() / debiased.len() as f64;
    assert!(
        (mean - 0.5).abs() < 0.05,
        "debiased mean {mean} outside tolerance"
    );
    assert_eq!(stats.input_bits, 10_000);
    // Biased input discards more pairs than the unbiased 25% rate keeps.
    assert!(stats.efficiency < 0.25);
}

#[test]
fn xor_fold_length_law_holds_for_all_factors() {
    let mut rng = ChaCha20Rng::seed_from_u64(9);
    let mut data = vec![0u8; 1000];
    rng.fill(&mut data[..]);
    for k in 1..=16 {
        let (folded, stats) = xor_fold(&data, k);
        assert_eq!(folded.len(), data.len() / k, "fold factor {k}");
        assert_eq!(stats.fold_factor, k);
    }
}

#[test]
fn extractor_fixed_vector() {
    // state = 32 zero bytes, chunk = "abc", counter = 1, wall time = 0,
    // mix = 8 zero bytes: the block must equal the straight-line digest of
    // the concatenated input.
    let block = extract_block(&[0u8; 32], b"abc", 1, 0, &[0u8; 8]);

    let mut concatenated = Vec::new();
    concatenated.extend_from_slice(&[0u8; 32]);
    concatenated.extend_from_slice(b"abc");
    concatenated.extend_from_slice(&1u64.to_le_bytes());
    concatenated.extend_from_slice(&0u64.to_le_bytes());
    concatenated.extend_from_slice(&[0u8; 8]);
    let expected: [u8; 32] = Sha256::digest(&concatenated).into();

    assert_eq!(block, expected);
}

#[test]
fn identical_seeds_still_produce_fresh_output() {
    // Two pools, identical all-zero seed, zero sources: the per-block
    // system-CSPRNG mix must keep their outputs distinct.
    let config = || PoolConfig {
        seed: Some(vec![0u8; 32]),
        ..PoolConfig::default()
    };
    let a = EntropyPool::with_config(config()).unwrap();
    let b = EntropyPool::with_config(config()).unwrap();

    let out_a = a.get_random_bytes(32).unwrap();
    let out_b = b.get_random_bytes(32).unwrap();
    assert_eq!(out_a.len(), 32);
    assert_ne!(out_a, out_b, "freshness requirement violated");
}

#[test]
fn mode_tokens_are_the_external_contract() {
    assert_eq!(
        "sha256".parse::<ConditioningMode>().unwrap(),
        ConditioningMode::Sha256
    );
    assert_eq!(
        "vonneumann".parse::<ConditioningMode>().unwrap(),
        ConditioningMode::VonNeumann
    );
    assert_eq!(
        "raw".parse::<ConditioningMode>().unwrap(),
        ConditioningMode::Raw
    );
    assert!("base64".parse::<ConditioningMode>().is_err());
}

#[test]
fn quick_shannon_matches_report_field() {
    let mut rng = ChaCha20Rng::seed_from_u64(77);
    let mut data = vec![0u8; 2048];
    rng.fill(&mut data[..]);
    let report = quick_quality(&data, "law");
    assert_eq!(report.shannon_entropy, quick_shannon(&data));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fold_length_is_always_floor_division(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            k in 1usize..9,
        ) {
            let (folded, stats) = xor_fold(&data, k);
            prop_assert_eq!(folded.len(), data.len() / k);
            prop_assert_eq!(stats.output_len, folded.len());
        }

        #[test]
        fn debias_never_exceeds_half_the_pairs(
            bits in proptest::collection::vec(0u8..2, 0..2048),
        ) {
            let (out, stats) = von_neumann_debias_bits(&bits);
            prop_assert!(out.len() <= bits.len() / 2);
            prop_assert_eq!(stats.output_bits, out.len());
            prop_assert!(out.iter().all(|&b| b <= 1));
        }

        #[test]
        fn quality_scores_stay_in_range(
            data in proptest::collection::vec(any::<u8>(), 16..1024),
        ) {
            let report = quick_quality(&data, "prop");
            prop_assert!(report.shannon_entropy >= 0.0 && report.shannon_entropy <= 8.0);
            prop_assert!(report.min_entropy <= report.shannon_entropy + 1e-9);
            prop_assert!((0.0..=100.0).contains(&report.quality_score));
        }
    }
}

#[test]
fn quality_report_bounds_hold() {
    let samples: [&[u8]; 4] = [
        &[0u8; 64],
        &[0xFFu8; 64],
        b"abcabcabcabcabcabc",
        &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
    ];
    for data in samples {
        let report = quick_quality(data, "bounds");
        assert!(report.shannon_entropy >= 0.0 && report.shannon_entropy <= 8.0);
        assert!(report.min_entropy >= 0.0);
        assert!(
            report.min_entropy <= report.shannon_entropy + 1e-9,
            "min-entropy above Shannon for {data:?}"
        );
    }
}
