//! # Entropy Pool - Multi-Source Scheduler and Byte API
//!
//! The pool owns the instantiated sources, drives collection rounds into a
//! shared raw-byte buffer, tracks per-source health, and conditions buffer
//! contents into output through the [`crate::conditioning`] primitives.
//!
//! ## Collection
//!
//! Sequential collection samples sources in registration order. Parallel
//! collection fans out one OS thread per source and joins against a hard
//! wall-clock deadline: workers report through a channel whose receiver is
//! dropped when the deadline passes, so an abandoned worker can finish (or
//! hang) without ever touching pool state. A timed-out source keeps its
//! previous health record untouched.
//!
//! ## Degradation
//!
//! No source failure propagates to callers. With every source failed the
//! extractor still evolves under fresh system-CSPRNG mixes, so output is
//! never worse than the operating system's own generator.
//!
//! ## Locking
//!
//! A collection lock serialises collection rounds and output production; a
//! separate data mutex guards buffer and source state so observers
//! (`health_report`, `sources`) stay responsive during long collections.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::capability::HostCapabilities;
use crate::conditioning::{
    extract_block, fresh_mix, von_neumann_debias, wall_clock_ns, ConditionerState,
    ConditioningMode,
};
use crate::quality::{quick_min_entropy, quick_shannon};
use crate::sources::{self, EntropySource};
use crate::{HarvestError, Result};

/// Default soft cap for the raw buffer.
pub const DEFAULT_BUFFER_CAP: usize = 16 * 1024 * 1024;

/// Extractor input chunk size per output block.
const CHUNK_PER_BLOCK: usize = 256;

/// Upper bound on collection rounds the debiased output path may trigger.
const MAX_DEBIAS_REFILLS: usize = 8;

/// Pool configuration. `Default` matches the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Optional caller seed folded into the initial conditioner state.
    pub seed: Option<Vec<u8>>,
    /// Collect in parallel by default.
    pub parallel: bool,
    /// Wall-clock deadline for parallel collection.
    pub timeout: Duration,
    /// Per-source byte hint passed to `sample`.
    pub default_sample_size: usize,
    /// Default conditioning mode for output.
    pub conditioning: ConditioningMode,
    /// Soft cap on the raw buffer; oldest bytes are trimmed beyond it.
    pub buffer_cap_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            seed: None,
            parallel: true,
            timeout: Duration::from_secs(10),
            default_sample_size: 200,
            conditioning: ConditioningMode::Sha256,
            buffer_cap_bytes: DEFAULT_BUFFER_CAP,
        }
    }
}

/// Runtime state for one registered source.
struct SourceState {
    source: Arc<dyn EntropySource>,
    weight: f64,
    total_bytes: u64,
    failures: u64,
    last_shannon: f64,
    last_min_entropy: f64,
    last_collect_time: f64,
    healthy: bool,
}

impl SourceState {
    fn new(source: Arc<dyn EntropySource>, weight: f64) -> Self {
        Self {
            source,
            weight,
            total_bytes: 0,
            failures: 0,
            last_shannon: 0.0,
            last_min_entropy: 0.0,
            last_collect_time: 0.0,
            healthy: true,
        }
    }

    fn snapshot(&self) -> SourceHealth {
        SourceHealth {
            name: self.source.name().to_string(),
            healthy: self.healthy,
            weight: self.weight,
            bytes: self.total_bytes,
            shannon: self.last_shannon,
            min_entropy: self.last_min_entropy,
            time_seconds: self.last_collect_time,
            failures: self.failures,
        }
    }
}

/// Read-only view of one source's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub name: String,
    pub healthy: bool,
    pub weight: f64,
    pub bytes: u64,
    pub shannon: f64,
    pub min_entropy: f64,
    pub time_seconds: f64,
    pub failures: u64,
}

/// Pool-wide health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Number of sources currently healthy.
    pub healthy: usize,
    /// Number of registered sources.
    pub total: usize,
    /// Cumulative raw bytes collected.
    pub raw_bytes: u64,
    /// Cumulative conditioned bytes emitted.
    pub output_bytes: u64,
    /// Current raw buffer occupancy.
    pub buffer_size: usize,
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceHealth>,
}

impl HealthReport {
    /// Render the report as a fixed-width table for terminal sinks.
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", "=".repeat(64));
        let _ = writeln!(out, "ENTROPY POOL HEALTH REPORT");
        let _ = writeln!(out, "{}", "=".repeat(64));
        let _ = writeln!(out, "Sources: {}/{} healthy", self.healthy, self.total);
        let _ = writeln!(out, "Raw collected: {} bytes", self.raw_bytes);
        let _ = writeln!(
            out,
            "Output: {} bytes | Buffer: {} bytes",
            self.output_bytes, self.buffer_size
        );
        let _ = writeln!(
            out,
            "\n{:<24} {:>4} {:>10} {:>6} {:>8} {:>5}",
            "Source", "OK", "Bytes", "H", "Time", "Fail"
        );
        let _ = writeln!(out, "{}", "-".repeat(64));
        for s in &self.sources {
            let ok = if s.healthy { "+" } else { "x" };
            let _ = writeln!(
                out,
                "{:<24} {:>4} {:>10} {:>6.2} {:>7.3}s {:>5}",
                s.name, ok, s.bytes, s.shannon, s.time_seconds, s.failures
            );
        }
        out
    }
}

struct PoolInner {
    sources: Vec<SourceState>,
    buffer: VecDeque<u8>,
    state: ConditionerState,
    counter: u64,
    total_output: u64,
    total_raw: u64,
}

/// Thread-safe multi-source entropy pool.
///
/// ```rust,no_run
/// # fn main() -> entropy_forge::Result<()> {
/// let pool = entropy_forge::EntropyPool::auto()?;
/// let bytes = pool.get_random_bytes(32)?;
/// # Ok(())
/// # }
/// ```
pub struct EntropyPool {
    config: PoolConfig,
    /// Serialises collection rounds and block production.
    collect_lock: Mutex<()>,
    inner: Mutex<PoolInner>,
}

impl EntropyPool {
    /// Construct an empty pool with default configuration. The conditioner
    /// state is seeded as `SHA-256(csprng32)`.
    pub fn new() -> Result<Self> {
        Self::with_config(PoolConfig::default())
    }

    /// Construct with explicit configuration. The conditioner state is
    /// seeded as `SHA-256(csprng32 || seed?)`.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        let state = ConditionerState::seeded(config.seed.as_deref())?;
        Ok(Self {
            config,
            collect_lock: Mutex::new(()),
            inner: Mutex::new(PoolInner {
                sources: Vec::new(),
                buffer: VecDeque::new(),
                state,
                counter: 0,
                total_output: 0,
                total_raw: 0,
            }),
        })
    }

    /// Probe the host and register every available catalog source at
    /// weight 1.0.
    pub fn auto() -> Result<Self> {
        Self::auto_with_config(PoolConfig::default())
    }

    /// `auto()` with explicit configuration.
    pub fn auto_with_config(config: PoolConfig) -> Result<Self> {
        let pool = Self::with_config(config)?;
        let caps = HostCapabilities::probe();
        for source in sources::detect_available(&caps) {
            pool.add_source(source, 1.0)?;
        }
        Ok(pool)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a source. Idempotence is enforced by name: registering a
    /// second source with an existing name is rejected.
    pub fn add_source(&self, source: Arc<dyn EntropySource>, weight: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .sources
            .iter()
            .any(|s| s.source.name() == source.name())
        {
            return Err(HarvestError::DuplicateSource(source.name().to_string()));
        }
        debug!(source = source.name(), weight, "source registered");
        inner.sources.push(SourceState::new(source, weight.max(0.0)));
        Ok(())
    }

    /// Read-only snapshot of every registered source's state, in
    /// registration order.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceHealth> {
        self.inner.lock().sources.iter().map(SourceState::snapshot).collect()
    }

    /// Drive one collection round across every registered source and
    /// append the raw bytes to the buffer. Returns the number of bytes
    /// appended. Never errors: individual source failures only increment
    /// that source's failure counter.
    pub fn collect_all(&self, parallel: bool, timeout: Duration) -> usize {
        let _guard = self.collect_lock.lock();
        if parallel {
            self.collect_parallel_locked(timeout)
        } else {
            self.collect_sequential_locked()
        }
    }

    /// One collection round using the configured mode and timeout.
    pub fn collect(&self) -> usize {
        self.collect_all(self.config.parallel, self.config.timeout)
    }

    /// Return exactly `n` conditioned bytes.
    ///
    /// If the buffer holds fewer than `2 * n` bytes a sequential collection
    /// round runs first. Mode semantics:
    /// - `Sha256`: keyed extractor blocks; an empty buffer contributes an
    ///   empty sample chunk rather than blocking, freshness being carried
    ///   by the per-block CSPRNG mix.
    /// - `Raw`: drains up to `n` buffer bytes verbatim and zero-extends a
    ///   shortfall; no additional collection loop. Research use only.
    /// - `VonNeumann`: debiases buffer bits, re-collecting at most a
    ///   bounded number of rounds before zero-extending.
    pub fn get_bytes(&self, n: usize, mode: ConditioningMode) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.collect_lock.lock();

        let shortfall = self.inner.lock().buffer.len() < n.saturating_mul(2);
        if shortfall {
            trace!(requested = n, "buffer below 2n, collecting");
            self.collect_sequential_locked();
        }

        match mode {
            ConditioningMode::Raw => Ok(self.output_raw(n)),
            ConditioningMode::VonNeumann => Ok(self.output_debiased(n)),
            ConditioningMode::Sha256 => self.output_extracted(n),
        }
    }

    /// Alias for `get_bytes(n, ConditioningMode::Sha256)`.
    pub fn get_random_bytes(&self, n: usize) -> Result<Vec<u8>> {
        self.get_bytes(n, ConditioningMode::Sha256)
    }

    /// Alias for `get_bytes(n, ConditioningMode::Raw)`.
    pub fn get_raw_bytes(&self, n: usize) -> Result<Vec<u8>> {
        self.get_bytes(n, ConditioningMode::Raw)
    }

    /// Pool-wide health snapshot.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let inner = self.inner.lock();
        let sources: Vec<SourceHealth> =
            inner.sources.iter().map(SourceState::snapshot).collect();
        HealthReport {
            healthy: sources.iter().filter(|s| s.healthy).count(),
            total: sources.len(),
            raw_bytes: inner.total_raw,
            output_bytes: inner.total_output,
            buffer_size: inner.buffer.len(),
            generated_at: Utc::now(),
            sources,
        }
    }

    // ── collection internals (collect_lock held) ──

    fn source_snapshot(&self) -> Vec<(usize, Arc<dyn EntropySource>)> {
        self.inner
            .lock()
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.source.clone()))
            .collect()
    }

    fn collect_sequential_locked(&self) -> usize {
        let snapshot = self.source_snapshot();
        let n = self.config.default_sample_size;
        let mut appended = 0;
        for (idx, source) in snapshot {
            let start = Instant::now();
            let data = source.sample(n);
            let elapsed = start.elapsed();
            let mut inner = self.inner.lock();
            Self::apply_result(&mut inner, idx, &data, elapsed);
            appended += data.len();
            Self::push_raw(&mut inner, data, self.config.buffer_cap_bytes);
        }
        trace!(appended, "sequential collection round complete");
        appended
    }

    fn collect_parallel_locked(&self, timeout: Duration) -> usize {
        let snapshot = self.source_snapshot();
        if snapshot.is_empty() {
            return 0;
        }
        let n = self.config.default_sample_size;
        let expected = snapshot.len();
        let (tx, rx) = crossbeam_channel::unbounded();

        for (idx, source) in snapshot {
            let tx = tx.clone();
            let spawn = std::thread::Builder::new()
                .name(format!("harvest-{}", source.name()))
                .spawn(move || {
                    let start = Instant::now();
                    let data = source.sample(n);
                    // Send fails harmlessly once the receiver is dropped at
                    // the deadline; the result is simply discarded.
                    let _ = tx.send((idx, data, start.elapsed()));
                });
            if let Err(e) = spawn {
                warn!(error = %e, "failed to spawn collection worker");
            }
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(expected);
        while results.len() < expected {
            match rx.recv_deadline(deadline) {
                Ok(result) => results.push(result),
                Err(_) => {
                    debug!(
                        received = results.len(),
                        expected, "collection deadline reached, abandoning stragglers"
                    );
                    break;
                }
            }
        }
        drop(rx);

        let mut appended = 0;
        let mut inner = self.inner.lock();
        for (idx, data, elapsed) in results {
            Self::apply_result(&mut inner, idx, &data, elapsed);
            appended += data.len();
            Self::push_raw(&mut inner, data, self.config.buffer_cap_bytes);
        }
        trace!(appended, "parallel collection round complete");
        appended
    }

    /// Health bookkeeping for one sampling attempt. A non-empty sample with
    /// Shannon entropy above 1.0 bits/byte marks the source healthy; an
    /// empty sample marks it unhealthy and counts a failure.
    fn apply_result(inner: &mut PoolInner, idx: usize, data: &[u8], elapsed: Duration) {
        let Some(state) = inner.sources.get_mut(idx) else {
            return;
        };
        state.last_collect_time = elapsed.as_secs_f64();
        if data.is_empty() {
            state.failures += 1;
            state.healthy = false;
            debug!(source = state.source.name(), "collection produced no bytes");
            return;
        }
        state.total_bytes += data.len() as u64;
        state.last_shannon = quick_shannon(data);
        state.last_min_entropy = quick_min_entropy(data);
        let was_healthy = state.healthy;
        state.healthy = state.last_shannon > 1.0;
        if was_healthy != state.healthy {
            debug!(
                source = state.source.name(),
                healthy = state.healthy,
                shannon = state.last_shannon,
                "health transition"
            );
        }
    }

    fn push_raw(inner: &mut PoolInner, data: Vec<u8>, cap: usize) {
        inner.total_raw += data.len() as u64;
        inner.buffer.extend(data);
        if inner.buffer.len() > cap {
            let excess = inner.buffer.len() - cap;
            inner.buffer.drain(..excess);
            trace!(excess, "buffer cap reached, trimmed oldest bytes");
        }
    }

    // ── output internals (collect_lock held) ──

    fn output_raw(&self, n: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let take = n.min(inner.buffer.len());
        let mut out: Vec<u8> = inner.buffer.drain(..take).collect();
        out.resize(n, 0);
        inner.total_output += n as u64;
        out
    }

    fn output_debiased(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut refills = 0;
        while out.len() < n {
            let chunk: Vec<u8> = {
                let mut inner = self.inner.lock();
                let take = inner.buffer.len().min(4096);
                inner.buffer.drain(..take).collect()
            };
            if chunk.is_empty() {
                if refills >= MAX_DEBIAS_REFILLS {
                    warn!(
                        produced = out.len(),
                        requested = n,
                        "debias refill limit reached, zero-extending"
                    );
                    break;
                }
                refills += 1;
                self.collect_sequential_locked();
                continue;
            }
            let (bytes, _stats) = von_neumann_debias(&chunk);
            out.extend(bytes);
        }
        out.resize(n, 0);
        self.inner.lock().total_output += n as u64;
        out
    }

    fn output_extracted(&self, n: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(n + 32);
        while out.len() < n {
            inner.counter += 1;
            let take = inner.buffer.len().min(CHUNK_PER_BLOCK);
            let chunk: Vec<u8> = inner.buffer.drain(..take).collect();
            let mix = fresh_mix()?;
            let block = extract_block(
                &inner.state.0,
                &chunk,
                inner.counter,
                wall_clock_ns(),
                &mix,
            );
            inner.state.0 = block;
            out.extend_from_slice(&block);
        }
        out.truncate(n);
        inner.total_output += n as u64;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityReport;
    use crate::sources::SourceCategory;

    /// Deterministic stub source for pool-level tests.
    struct StubSource {
        name: &'static str,
        byte: u8,
        delay: Duration,
    }

    impl StubSource {
        fn new(name: &'static str, byte: u8) -> Self {
            Self {
                name,
                byte,
                delay: Duration::ZERO,
            }
        }
    }

    impl EntropySource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }
        fn description(&self) -> &'static str {
            "stub"
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
            // Alternate values so the stub passes the health threshold.
            (0..n).map(|i| self.byte.wrapping_add((i % 7) as u8)).collect()
        }
        fn self_check(&self) -> QualityReport {
            crate::quality::quick_quality(&self.sample(64), self.name)
        }
    }

    /// Stub that always fails.
    struct DeadSource;

    impl EntropySource for DeadSource {
        fn name(&self) -> &'static str {
            "dead"
        }
        fn description(&self) -> &'static str {
            "always empty"
        }
        fn category(&self) -> SourceCategory {
            SourceCategory::Other
        }
        fn is_available(&self, _caps: &HostCapabilities) -> bool {
            true
        }
        fn sample(&self, _n: usize) -> Vec<u8> {
            Vec::new()
        }
    }

    #[test]
    fn duplicate_source_names_are_rejected() {
        let pool = EntropyPool::new().unwrap();
        pool.add_source(Arc::new(StubSource::new("stub", 1)), 1.0)
            .unwrap();
        let err = pool
            .add_source(Arc::new(StubSource::new("stub", 2)), 1.0)
            .unwrap_err();
        assert!(matches!(err, HarvestError::DuplicateSource(_)));
    }

    #[test]
    fn collect_with_zero_sources_is_a_no_op() {
        let pool = EntropyPool::new().unwrap();
        assert_eq!(pool.collect_all(false, Duration::from_secs(1)), 0);
        assert_eq!(pool.collect_all(true, Duration::from_secs(1)), 0);
        assert_eq!(pool.health_report().buffer_size, 0);
    }

    #[test]
    fn get_bytes_returns_exact_lengths() {
        let pool = EntropyPool::new().unwrap();
        pool.add_source(Arc::new(StubSource::new("stub", 3)), 1.0)
            .unwrap();
        for n in [0usize, 1, 31, 32, 33, 200, 1000] {
            for mode in [
                ConditioningMode::Raw,
                ConditioningMode::VonNeumann,
                ConditioningMode::Sha256,
            ] {
                assert_eq!(pool.get_bytes(n, mode).unwrap().len(), n);
            }
        }
    }

    #[test]
    fn zero_source_pool_still_produces_output() {
        let pool = EntropyPool::new().unwrap();
        let a = pool.get_random_bytes(64).unwrap();
        let b = pool.get_random_bytes(64).unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b, "extractor output repeated across calls");
    }

    #[test]
    fn raw_mode_zero_extends_an_empty_buffer() {
        let pool = EntropyPool::new().unwrap();
        let out = pool.get_raw_bytes(16).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn failing_source_is_tracked_not_propagated() {
        let pool = EntropyPool::new().unwrap();
        pool.add_source(Arc::new(DeadSource), 1.0).unwrap();
        pool.collect_all(false, Duration::from_secs(1));
        pool.collect_all(false, Duration::from_secs(1));

        let report = pool.health_report();
        assert_eq!(report.healthy, 0);
        assert_eq!(report.total, 1);
        assert_eq!(report.sources[0].failures, 2);
        assert!(!report.sources[0].healthy);

        // Output still flows.
        assert_eq!(pool.get_random_bytes(32).unwrap().len(), 32);
    }

    #[test]
    fn health_recovers_when_a_source_comes_back() {
        // One pool, one name, two collections: first empty, then healthy.
        struct Flaky {
            calls: Mutex<u32>,
        }
        impl EntropySource for Flaky {
            fn name(&self) -> &'static str {
                "flaky"
            }
            fn description(&self) -> &'static str {
                "fails on first call"
            }
            fn category(&self) -> SourceCategory {
                SourceCategory::Other
            }
            fn is_available(&self, _caps: &HostCapabilities) -> bool {
                true
            }
            fn sample(&self, n: usize) -> Vec<u8> {
                let mut calls = self.calls.lock();
                *calls += 1;
                if *calls == 1 {
                    Vec::new()
                } else {
                    (0..n).map(|i| (i % 251) as u8).collect()
                }
            }
        }

        let pool = EntropyPool::new().unwrap();
        pool.add_source(
            Arc::new(Flaky {
                calls: Mutex::new(0),
            }),
            1.0,
        )
        .unwrap();

        pool.collect_all(false, Duration::from_secs(1));
        assert!(!pool.sources()[0].healthy);

        pool.collect_all(false, Duration::from_secs(1));
        let state = &pool.sources()[0];
        assert!(state.healthy);
        assert!(state.shannon > 1.0);
        assert_eq!(state.failures, 1);
    }

    #[test]
    fn buffer_cap_trims_oldest_bytes() {
        let config = PoolConfig {
            buffer_cap_bytes: 512,
            default_sample_size: 300,
            ..PoolConfig::default()
        };
        let pool = EntropyPool::with_config(config).unwrap();
        pool.add_source(Arc::new(StubSource::new("a", 1)), 1.0)
            .unwrap();
        pool.add_source(Arc::new(StubSource::new("b", 2)), 1.0)
            .unwrap();
        pool.collect_all(false, Duration::from_secs(1));
        assert!(pool.health_report().buffer_size <= 512);
        assert_eq!(pool.health_report().raw_bytes, 600);
    }

    #[test]
    fn weights_are_clamped_and_reported() {
        let pool = EntropyPool::new().unwrap();
        pool.add_source(Arc::new(StubSource::new("w", 1)), -3.0)
            .unwrap();
        assert_eq!(pool.sources()[0].weight, 0.0);
    }

    #[test]
    fn health_report_renders() {
        let pool = EntropyPool::new().unwrap();
        pool.add_source(Arc::new(StubSource::new("render", 9)), 1.0)
            .unwrap();
        pool.collect_all(false, Duration::from_secs(1));
        let table = pool.health_report().render_table();
        assert!(table.contains("ENTROPY POOL HEALTH REPORT"));
        assert!(table.contains("render"));
    }
}
