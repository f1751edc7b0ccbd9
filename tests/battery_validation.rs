//! End-to-end battery scenarios: degenerate streams, uniform coverage,
//! CSPRNG-grade data and conditioned pool output.

use entropy_forge::battery::{calculate_quality_score, run_all_tests, BATTERY_SIZE};
use entropy_forge::capability::HostCapabilities;
use entropy_forge::quality::{quick_quality, Grade};
use entropy_forge::sources::{EntropySource, SourceCategory};
use entropy_forge::EntropyPool;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;

fn chacha_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

#[test]
fn constant_stream_fails_across_the_board() {
    let data = vec![0u8; 10_000];

    let report = quick_quality(&data, "constant");
    assert_eq!(report.shannon_entropy, 0.0);
    assert!(report.min_entropy.abs() < 1e-9);
    assert!(report.compression_ratio < 0.05);
    assert_eq!(report.grade, Grade::F);

    let results = run_all_tests(&data);
    assert_eq!(results.len(), BATTERY_SIZE);

    let monobit = &results[0];
    assert_eq!(monobit.name, "Monobit Frequency");
    assert!(!monobit.passed);

    let byte_freq = results.iter().find(|r| r.name == "Byte Frequency").unwrap();
    assert!(!byte_freq.passed);
    assert!(byte_freq.p_value.unwrap() < 1e-100);

    let score = calculate_quality_score(&results);
    assert!(score < 20.0, "constant stream scored {score}");
}

#[test]
fn cyclic_uniform_coverage_has_perfect_entropy() {
    // Every byte value exactly 40 times.
    let data: Vec<u8> = (0..=255u8).cycle().take(10_240).collect();

    let report = quick_quality(&data, "cyclic");
    assert!(report.shannon_entropy >= 7.99);
    assert!(report.min_entropy >= 7.99);
    assert_eq!(report.unique_values, 256);
    assert_eq!(report.grade, Grade::A);

    let results = run_all_tests(&data);
    let monobit = &results[0];
    assert!(monobit.p_value.unwrap() > 0.5);
    let byte_freq = results.iter().find(|r| r.name == "Byte Frequency").unwrap();
    assert!(byte_freq.p_value.unwrap() > 0.9);
}

#[test]
fn csprng_stream_passes_the_battery() {
    let data = chacha_bytes(16_384, 0xC0FFEE);

    let report = quick_quality(&data, "csprng");
    assert!(report.compression_ratio > 0.95);
    assert_eq!(report.grade, Grade::A);

    let results = run_all_tests(&data);
    let passed = results.iter().filter(|r| r.passed).count();
    assert!(
        passed >= 25,
        "only {passed}/{BATTERY_SIZE} passed: {:?}",
        results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| (&r.name, &r.details))
            .collect::<Vec<_>>()
    );
    assert!(calculate_quality_score(&results) >= 75.0);
}

#[test]
fn insufficient_inputs_are_graded_not_skipped() {
    let results = run_all_tests(&[0xAB; 4]);
    assert_eq!(results.len(), BATTERY_SIZE);
    let insufficient = results
        .iter()
        .filter(|r| r.details.starts_with("insufficient"))
        .count();
    assert!(insufficient >= 25, "expected near-total insufficiency");
    for result in results.iter().filter(|r| r.details.starts_with("insufficient")) {
        assert!(!result.passed);
        assert_eq!(result.grade, Grade::F);
    }
    // The Fs drag the overall score down instead of being excluded.
    assert!(calculate_quality_score(&results) < 20.0);
}

#[test]
fn battery_is_deterministic_over_identical_input() {
    let data = chacha_bytes(8_192, 11);
    let first = run_all_tests(&data);
    let second = run_all_tests(&data);
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.p_value, b.p_value);
        assert_eq!(a.statistic, b.statistic);
    }
    assert_eq!(
        calculate_quality_score(&first),
        calculate_quality_score(&second)
    );
}

/// Heavily biased source: long runs of slowly-incrementing values.
struct BiasedSource;

impl EntropySource for BiasedSource {
    fn name(&self) -> &'static str {
        "biased"
    }
    fn description(&self) -> &'static str {
        "low-entropy ramp"
    }
    fn category(&self) -> SourceCategory {
        SourceCategory::Other
    }
    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }
    fn sample(&self, n: usize) -> Vec<u8> {
        (0..n).map(|i| (i / 17) as u8 & 0x07).collect()
    }
}

#[test]
fn conditioned_output_is_indistinguishable_from_uniform() {
    // Feed the pool nothing but a heavily biased stream; the keyed
    // extractor must still produce battery-grade output.
    let pool = EntropyPool::new().unwrap();
    pool.add_source(Arc::new(BiasedSource), 1.0).unwrap();

    let output = pool.get_random_bytes(8_192).unwrap();
    assert_eq!(output.len(), 8_192);

    let results = run_all_tests(&output);
    let passed = results.iter().filter(|r| r.passed).count();
    assert!(
        passed >= 20,
        "conditioned output failed the battery: {passed}/{BATTERY_SIZE}"
    );
    assert!(calculate_quality_score(&results) >= 60.0);
}

#[test]
fn test_results_serialize_for_report_sinks() {
    let results = run_all_tests(&chacha_bytes(4_096, 5));
    let json = serde_json::to_string(&results).unwrap();
    assert!(json.contains("Monobit Frequency"));
    let back: Vec<entropy_forge::battery::TestResult> = serde_json::from_str(&json).unwrap();
    assert_eq!(back.len(), BATTERY_SIZE);
}
