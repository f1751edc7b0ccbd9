//! Kernel-facing sources: counter deltas, VM statistics, process-table
//! churn and filesystem metadata query timing.
//!
//! The kernel counter source is the richest of the catalog. Operating
//! systems expose hundreds of numeric counters (context switches, page
//! faults, TCP segments, interrupt counts); dozens of them advance at
//! rates no observer can predict. Sampling the deltas of the fluctuating
//! subset harvests entropy from the micro-behaviour of the entire OS.
//!
//! Reading counters is separated from timing through the [`CounterReader`]
//! seam so the discovery and delta logic is testable with injected
//! snapshots.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::debug;

use crate::capability::{run_probe, HostCapabilities};
use crate::sources::{bound_sample, delta_lsbs, elapsed_ns, EntropySource, SourceCategory};

/// Snapshot provider for numeric kernel counters. The default system
/// implementation reads `/proc` tables on Linux and `sysctl -a` on macOS;
/// tests inject scripted snapshots.
pub trait CounterReader: Send + Sync {
    fn snapshot(&self) -> BTreeMap<String, i64>;
}

/// Counter reader backed by the real operating system.
pub struct SystemCounterReader;

impl CounterReader for SystemCounterReader {
    fn snapshot(&self) -> BTreeMap<String, i64> {
        if cfg!(target_os = "linux") {
            linux_counters()
        } else if cfg!(target_os = "macos") {
            darwin_counters()
        } else {
            BTreeMap::new()
        }
    }
}

fn linux_counters() -> BTreeMap<String, i64> {
    let mut counters = BTreeMap::new();

    if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
        for line in stat.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(v) = value.parse::<i64>() {
                counters.insert(format!("stat.{key}"), v);
            }
        }
    }

    if let Ok(vmstat) = std::fs::read_to_string("/proc/vmstat") {
        for line in vmstat.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(key), Some(Ok(v))) =
                (parts.next(), parts.next().map(str::parse::<i64>))
            {
                counters.insert(format!("vm.{key}"), v);
            }
        }
    }

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            if let Some(Ok(v)) = rest
                .split_whitespace()
                .next()
                .map(str::parse::<i64>)
            {
                counters.insert(format!("mem.{key}"), v);
            }
        }
    }

    // SNMP-style tables pair a header line with a value line per protocol.
    for path in ["/proc/net/snmp", "/proc/net/netstat"] {
        let Ok(body) = std::fs::read_to_string(path) else {
            continue;
        };
        let lines: Vec<&str> = body.lines().collect();
        for pair in lines.chunks(2) {
            if pair.len() != 2 {
                continue;
            }
            let mut header = pair[0].split_whitespace();
            let Some(proto) = header.next() else {
                continue;
            };
            let proto = proto.trim_end_matches(':');
            let values = pair[1].split_whitespace().skip(1);
            for (name, num) in header.zip(values) {
                if let Ok(v) = num.parse::<i64>() {
                    counters.insert(format!("net.{proto}.{name}"), v);
                }
            }
        }
    }

    counters
}

fn darwin_counters() -> BTreeMap<String, i64> {
    let mut counters = BTreeMap::new();
    let Some(out) = run_probe("/usr/sbin/sysctl", &["-a"], Duration::from_secs(5)) else {
        return counters;
    };
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if let Ok(v) = value.trim().parse::<i64>() {
            counters.insert(key.trim().to_string(), v);
        }
    }
    counters
}

/// Harvest entropy from the fluctuating subset of kernel counters.
///
/// On first use the source snapshots every numeric counter, waits ~200 ms,
/// snapshots again, and retains the keys whose values changed. Sampling
/// then takes snapshots close together in time and emits the LSB of each
/// per-key delta in sorted-key order.
pub struct KernelCounterSource {
    reader: Arc<dyn CounterReader>,
    fluctuating: OnceLock<Vec<String>>,
}

impl KernelCounterSource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_reader(Arc::new(SystemCounterReader))
    }

    /// Construct with an injected counter reader (test seam).
    #[must_use]
    pub fn with_reader(reader: Arc<dyn CounterReader>) -> Self {
        Self {
            reader,
            fluctuating: OnceLock::new(),
        }
    }

    /// The discovered fluctuating key set, sorted. Discovery runs once per
    /// source instance.
    pub fn fluctuating_keys(&self) -> &[String] {
        self.fluctuating.get_or_init(|| {
            let first = self.reader.snapshot();
            std::thread::sleep(Duration::from_millis(200));
            let second = self.reader.snapshot();
            let mut changed: Vec<String> = first
                .iter()
                .filter(|(key, v1)| second.get(*key).is_some_and(|v2| v2 != *v1))
                .map(|(key, _)| key.clone())
                .collect();
            changed.sort();
            debug!(
                total = first.len(),
                fluctuating = changed.len(),
                "kernel counter discovery complete"
            );
            changed
        })
    }
}

impl Default for KernelCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for KernelCounterSource {
    fn name(&self) -> &'static str {
        "kernel_counters"
    }

    fn description(&self) -> &'static str {
        "Kernel counter deltas across the fluctuating sysctl/procfs keys"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Other
    }

    fn estimated_rate_bps(&self) -> f64 {
        5000.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "Dozens of independent kernel counters advance at rates set by \
             interrupt load, network traffic and memory pressure. The deltas \
             between close-together snapshots are unpredictable to any \
             observer outside the kernel.",
        )
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        !self.reader.snapshot().is_empty()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let keys = self.fluctuating_keys();
        if keys.is_empty() {
            return Vec::new();
        }

        let rounds = (n_requested / keys.len()).max(1);
        let mut out = Vec::with_capacity(n_requested);
        let mut prev = self.reader.snapshot();
        for _ in 0..rounds {
            // Give the counters time to advance between snapshots.
            std::thread::sleep(Duration::from_millis(5));
            let current = self.reader.snapshot();
            for key in keys {
                if let (Some(a), Some(b)) = (prev.get(key), current.get(key)) {
                    out.push((b.wrapping_sub(*a) as u64 & 0xFF) as u8);
                }
            }
            prev = current;
            if out.len() >= n_requested {
                break;
            }
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from virtual-memory statistics deltas.
///
/// A single text-parsed call (`/proc/vmstat` on Linux, `vm_stat` on macOS)
/// yields page-fault, page-in/out and swap counters. Absent fields are
/// tolerated; only counters present in consecutive snapshots contribute.
pub struct VmStatSource;

impl VmStatSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn read_counters() -> BTreeMap<String, i64> {
        if cfg!(target_os = "linux") {
            let Ok(body) = std::fs::read_to_string("/proc/vmstat") else {
                return BTreeMap::new();
            };
            body.lines()
                .filter_map(|line| {
                    let mut parts = line.split_whitespace();
                    match (parts.next(), parts.next().map(str::parse::<i64>)) {
                        (Some(key), Some(Ok(v))) => Some((key.to_string(), v)),
                        _ => None,
                    }
                })
                .collect()
        } else if cfg!(target_os = "macos") {
            let Some(out) = run_probe("/usr/bin/vm_stat", &[], Duration::from_secs(5)) else {
                return BTreeMap::new();
            };
            out.lines()
                .filter_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    let v = value.trim().trim_end_matches('.').parse::<i64>().ok()?;
                    Some((key.trim().to_string(), v))
                })
                .collect()
        } else {
            BTreeMap::new()
        }
    }
}

impl Default for VmStatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for VmStatSource {
    fn name(&self) -> &'static str {
        "vm_stats"
    }

    fn description(&self) -> &'static str {
        "VM statistics counter deltas (page faults, swaps, pageouts)"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Other
    }

    fn estimated_rate_bps(&self) -> f64 {
        1000.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        !Self::read_counters().is_empty()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let mut prev = Self::read_counters();
        if prev.is_empty() {
            return Vec::new();
        }
        let per_round = prev.len().max(1);
        let rounds = (n_requested / per_round).max(2);

        let mut out = Vec::with_capacity(n_requested);
        for _ in 0..rounds {
            std::thread::sleep(Duration::from_millis(5));
            let current = Self::read_counters();
            for (key, value) in &current {
                if let Some(previous) = prev.get(key) {
                    let delta = value.wrapping_sub(*previous);
                    if delta != 0 {
                        out.push((delta as u64 & 0xFF) as u8);
                    }
                }
            }
            prev = current;
            if out.len() >= n_requested {
                break;
            }
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from process-table churn.
///
/// PID allocation, per-process CPU times and resident-set sizes shift
/// constantly. Each round hashes a serialized snapshot of the table and
/// interleaves the digest with micro-timing LSBs of the snapshot itself.
pub struct ProcessTableSource {
    system: Mutex<System>,
}

impl ProcessTableSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessTableSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for ProcessTableSource {
    fn name(&self) -> &'static str {
        "process_table"
    }

    fn description(&self) -> &'static str {
        "Process table churn, PID allocation and CPU-time fluctuation"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Other
    }

    fn estimated_rate_bps(&self) -> f64 {
        400.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        let mut sys = self.system.lock();
        sys.refresh_processes();
        !sys.processes().is_empty()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let rounds = (n_requested / 40).max(1);
        let mut out = Vec::with_capacity(n_requested);

        for _ in 0..rounds {
            let start = Instant::now();
            {
                let mut sys = self.system.lock();
                sys.refresh_processes();
                let mut table = String::with_capacity(sys.processes().len() * 24);
                for (pid, process) in sys.processes() {
                    table.push_str(&format!(
                        "{} {:.2} {}\n",
                        pid.as_u32(),
                        process.cpu_usage(),
                        process.memory()
                    ));
                }
                let digest: [u8; 32] = Sha256::digest(table.as_bytes()).into();
                out.extend_from_slice(&digest);
            }
            out.push((elapsed_ns(start) & 0xFF) as u8);

            for _ in 0..5 {
                let start = Instant::now();
                black_box(std::process::id());
                out.push((elapsed_ns(start) & 0xFF) as u8);
            }
            if out.len() >= n_requested {
                break;
            }
        }
        out.truncate(n_requested);
        out
    }
}

/// Entropy from filesystem metadata query timing.
///
/// Statting well-known paths exercises the metadata index and dentry/inode
/// caches; latency depends on cache residency, concurrent filesystem
/// activity and background indexing.
pub struct MetadataIndexSource;

const METADATA_TARGETS: &[&str] = &[
    "/usr/bin/env",
    "/bin/sh",
    "/etc/hosts",
    "/etc/passwd",
    "/usr/lib",
    "/tmp",
];

impl MetadataIndexSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn existing_targets() -> Vec<&'static str> {
        METADATA_TARGETS
            .iter()
            .copied()
            .filter(|p| Path::new(p).exists())
            .collect()
    }
}

impl Default for MetadataIndexSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for MetadataIndexSource {
    fn name(&self) -> &'static str {
        "metadata_index"
    }

    fn description(&self) -> &'static str {
        "Filesystem metadata query timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
    }

    fn estimated_rate_bps(&self) -> f64 {
        800.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        !Self::existing_targets().is_empty()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let targets = Self::existing_targets();
        if targets.is_empty() {
            return Vec::new();
        }
        let mut timings = Vec::with_capacity(n_requested + 1);
        for i in 0..=n_requested {
            let start = Instant::now();
            let _ = black_box(std::fs::symlink_metadata(targets[i % targets.len()]));
            timings.push(elapsed_ns(start));
        }
        bound_sample(delta_lsbs(&timings), n_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted reader: key "a" advances every snapshot, "b" is frozen,
    /// "c" advances by a varying stride.
    struct ScriptedReader {
        calls: Mutex<i64>,
    }

    impl CounterReader for ScriptedReader {
        fn snapshot(&self) -> BTreeMap<String, i64> {
            let mut calls = self.calls.lock();
            *calls += 1;
            let n = *calls;
            let mut map = BTreeMap::new();
            map.insert("a".to_string(), n * 3);
            map.insert("b".to_string(), 42);
            map.insert("c".to_string(), n * n);
            map
        }
    }

    #[test]
    fn discovery_retains_only_fluctuating_keys() {
        let source = KernelCounterSource::with_reader(Arc::new(ScriptedReader {
            calls: Mutex::new(0),
        }));
        let keys = source.fluctuating_keys();
        assert_eq!(keys, &["a".to_string(), "c".to_string()]);
        // Memoised: a second query must not re-discover.
        assert_eq!(source.fluctuating_keys().len(), 2);
    }

    #[test]
    fn kernel_counter_sample_emits_delta_lsbs_in_key_order() {
        let source = KernelCounterSource::with_reader(Arc::new(ScriptedReader {
            calls: Mutex::new(0),
        }));
        let data = source.sample(8);
        assert!(!data.is_empty());
        // "a" advances by 3 per snapshot; every other byte is its delta.
        assert_eq!(data[0], 3);
    }

    #[test]
    fn empty_reader_degrades_to_empty_sample() {
        struct EmptyReader;
        impl CounterReader for EmptyReader {
            fn snapshot(&self) -> BTreeMap<String, i64> {
                BTreeMap::new()
            }
        }
        let source = KernelCounterSource::with_reader(Arc::new(EmptyReader));
        let caps = HostCapabilities::none();
        assert!(!source.is_available(&caps));
        assert!(source.sample(64).is_empty());
    }

    #[test]
    fn metadata_index_produces_output_on_unix() {
        let source = MetadataIndexSource::new();
        let caps = HostCapabilities::none();
        if source.is_available(&caps) {
            let data = source.sample(64);
            assert!(!data.is_empty());
            assert!(data.len() <= 64 + 32);
        }
    }

    #[test]
    fn process_table_sample_is_bounded() {
        let source = ProcessTableSource::new();
        let caps = HostCapabilities::none();
        if source.is_available(&caps) {
            let data = source.sample(100);
            assert!(data.len() <= 100);
            assert!(!data.is_empty());
        }
    }
}
