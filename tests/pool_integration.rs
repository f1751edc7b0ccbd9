//! Pool-level integration: output invariants, duplicate rejection, failure
//! containment and the parallel collection deadline.

use entropy_forge::capability::HostCapabilities;
use entropy_forge::sources::{detect_available, EntropySource, SourceCategory};
use entropy_forge::{ConditioningMode, EntropyPool, HarvestError, PoolConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configurable stub source for scheduler tests.
struct StubSource {
    name: &'static str,
    bytes: usize,
    delay: Duration,
}

impl EntropySource for StubSource {
    fn name(&self) -> &'static str {
        self.name
    }
    fn description(&self) -> &'static str {
        "test stub"
    }
    fn category(&self) -> SourceCategory {
        SourceCategory::Other
    }
    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }
    fn sample(&self, n: usize) -> Vec<u8> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let len = self.bytes.min(n + n / 2);
        (0..len).map(|i| (i % 13 + 40) as u8).collect()
    }
}

fn fast(name: &'static str) -> Arc<StubSource> {
    Arc::new(StubSource {
        name,
        bytes: 100,
        delay: Duration::from_millis(10),
    })
}

#[test]
fn output_length_always_matches_request() {
    let pool = EntropyPool::new().unwrap();
    pool.add_source(fast("fast"), 1.0).unwrap();
    for n in [0usize, 1, 7, 32, 64, 255, 256, 1024] {
        for mode in [
            ConditioningMode::Sha256,
            ConditioningMode::Raw,
            ConditioningMode::VonNeumann,
        ] {
            let out = pool.get_bytes(n, mode).unwrap();
            assert_eq!(out.len(), n, "mode {mode:?}, n {n}");
        }
    }
}

#[test]
fn one_hundred_outputs_never_repeat() {
    let pool = EntropyPool::new().unwrap();
    pool.add_source(fast("fast"), 1.0).unwrap();
    let mut seen = HashSet::new();
    for _ in 0..100 {
        let out = pool.get_random_bytes(64).unwrap();
        assert!(seen.insert(out), "identical 64-byte output observed twice");
    }
}

#[test]
fn duplicate_registration_is_invalid() {
    let pool = EntropyPool::new().unwrap();
    pool.add_source(fast("twin"), 1.0).unwrap();
    match pool.add_source(fast("twin"), 2.0) {
        Err(HarvestError::DuplicateSource(name)) => assert_eq!(name, "twin"),
        other => panic!("expected duplicate-source error, got {other:?}"),
    }
    assert_eq!(pool.sources().len(), 1);
}

#[test]
fn empty_pool_collects_nothing_but_still_answers() {
    let pool = EntropyPool::new().unwrap();
    assert_eq!(pool.collect_all(false, Duration::from_secs(1)), 0);
    assert_eq!(pool.collect_all(true, Duration::from_secs(1)), 0);
    let report = pool.health_report();
    assert_eq!(report.total, 0);
    assert_eq!(report.buffer_size, 0);

    // Output still flows, carried by the extractor's CSPRNG mix alone.
    let out = pool.get_random_bytes(256).unwrap();
    assert_eq!(out.len(), 256);
}

#[test]
fn parallel_deadline_abandons_stalled_sources() {
    let pool = EntropyPool::new().unwrap();
    pool.add_source(fast("quick"), 1.0).unwrap();
    pool.add_source(
        Arc::new(StubSource {
            name: "stalled",
            bytes: 100,
            delay: Duration::from_secs(10),
        }),
        1.0,
    )
    .unwrap();

    let start = Instant::now();
    let appended = pool.collect_all(true, Duration::from_secs(2));
    let elapsed = start.elapsed();

    assert!(
        elapsed <= Duration::from_millis(2500),
        "deadline overrun: {elapsed:?}"
    );
    assert!(appended >= 100);

    let report = pool.health_report();
    let quick = report.sources.iter().find(|s| s.name == "quick").unwrap();
    let stalled = report.sources.iter().find(|s| s.name == "stalled").unwrap();

    assert!(quick.bytes >= 100);
    // The abandoned source keeps its prior record: no bytes, no failure,
    // still presumed healthy.
    assert_eq!(stalled.bytes, 0);
    assert_eq!(stalled.failures, 0);
    assert!(stalled.healthy);

    // The pool remains fully usable afterwards.
    assert_eq!(pool.get_random_bytes(64).unwrap().len(), 64);
}

#[test]
fn health_report_serializes_to_json() {
    let pool = EntropyPool::new().unwrap();
    pool.add_source(fast("json"), 1.5).unwrap();
    pool.collect_all(false, Duration::from_secs(1));
    let report = pool.health_report();
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"json\""));
    assert!(json.contains("raw_bytes"));
}

#[test]
fn configured_sample_size_reaches_sources() {
    struct SizeRecorder(parking_lot::Mutex<Vec<usize>>);
    impl EntropySource for SizeRecorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn description(&self) -> &'static str {
            "records requested sizes"
        }
        fn category(&self) -> SourceCategory {
            SourceCategory::Other
        }
        fn is_available(&self, _caps: &HostCapabilities) -> bool {
            true
        }
        fn sample(&self, n: usize) -> Vec<u8> {
            self.0.lock().push(n);
            vec![0xA5; n]
        }
    }

    let recorder = Arc::new(SizeRecorder(parking_lot::Mutex::new(Vec::new())));
    let pool = EntropyPool::with_config(PoolConfig {
        default_sample_size: 333,
        ..PoolConfig::default()
    })
    .unwrap();
    pool.add_source(recorder.clone(), 1.0).unwrap();
    pool.collect_all(false, Duration::from_secs(1));
    assert_eq!(recorder.0.lock().as_slice(), &[333]);
}

#[test]
fn detected_sources_meet_the_availability_floor() {
    let caps = HostCapabilities::probe();
    for source in detect_available(&caps) {
        // Network reachability is environment-dependent; the contract for
        // offline sources is graceful emptiness, not throughput.
        if source.category() == SourceCategory::Network {
            continue;
        }
        let total: usize = (0..10).map(|_| source.sample(200).len()).sum();
        assert!(
            total >= 10,
            "source {} fell below the availability floor ({total} bytes)",
            source.name()
        );
    }
}

#[test]
fn self_checks_produce_reports_for_detected_sources() {
    let caps = HostCapabilities::probe();
    for source in detect_available(&caps) {
        if source.category() == SourceCategory::Network {
            continue;
        }
        let report = source.self_check();
        assert_eq!(report.label, source.name());
        assert!(report.shannon_entropy >= 0.0 && report.shannon_entropy <= 8.0);
        assert!(report.min_entropy <= report.shannon_entropy + 1e-9);
    }
}
