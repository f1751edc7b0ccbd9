//! # Entropy Source Catalog
//!
//! Every esoteric source implements the same three-operation contract:
//! availability under the probed host capabilities, byte sampling, and a
//! self-check that grades a canonical sample through the quality estimator.
//!
//! Sources never surface errors. A source that cannot currently produce
//! entropy returns a truncated or empty sample and the pool's health
//! tracker records the outcome. Timing-based sources all interpret "LSB"
//! identically: the low 8 bits of the unsigned numeric representation of
//! the measured quantity.
//!
//! The registry at the bottom of this module is the single static catalog;
//! the pool's auto-discovery path filters it through the capability probe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::capability::HostCapabilities;
use crate::quality::{quick_quality, QualityReport};

pub mod cross_domain;
pub mod kernel;
#[cfg(any(feature = "audio", feature = "camera"))]
pub mod media;
pub mod network;
pub mod novel;
pub mod radio;
pub mod silicon;
pub mod timing;

/// Canonical sample size used by `self_check`.
pub const SELF_CHECK_SAMPLE: usize = 4096;

/// Broad grouping of source kinds, used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Timing,
    Hardware,
    Network,
    Silicon,
    Novel,
    CrossDomain,
    Other,
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceCategory::Timing => "timing",
            SourceCategory::Hardware => "hardware",
            SourceCategory::Network => "network",
            SourceCategory::Silicon => "silicon",
            SourceCategory::Novel => "novel",
            SourceCategory::CrossDomain => "cross_domain",
            SourceCategory::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// The uniform contract every entropy source implements.
///
/// Implementations must be callable from multiple threads; the pool invokes
/// at most one `sample` concurrently per registered source, but abandoned
/// parallel collections may still be draining a previous call.
pub trait EntropySource: Send + Sync {
    /// Stable identifier, unique across the registry.
    fn name(&self) -> &'static str;

    /// Human-readable one-liner.
    fn description(&self) -> &'static str;

    fn category(&self) -> SourceCategory;

    /// Capability tokens that must all hold for this source to be
    /// considered. Checked before `is_available`.
    fn platform_requirements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Advisory throughput estimate in bits per second. Never enforced.
    fn estimated_rate_bps(&self) -> f64 {
        0.0
    }

    /// Optional note on the physical phenomenon behind the source.
    fn physics(&self) -> Option<&'static str> {
        None
    }

    /// Short probe deciding whether the source can operate here. Any
    /// internal failure answers `false`.
    fn is_available(&self, caps: &HostCapabilities) -> bool;

    /// Collect up to `n_requested` bytes (bounded at `n_requested + 50%`).
    /// May return fewer, including zero on unrecoverable failure. Returned
    /// bytes originate from the claimed phenomenon; no pseudo-random
    /// padding.
    fn sample(&self, n_requested: usize) -> Vec<u8>;

    /// Sample a canonical size and grade it.
    fn self_check(&self) -> QualityReport {
        quick_quality(&self.sample(SELF_CHECK_SAMPLE), self.name())
    }
}

// ── helpers shared by source implementations ──

/// Truncate a sample to the contract bound of `n + 50%`.
pub(crate) fn bound_sample(mut data: Vec<u8>, n_requested: usize) -> Vec<u8> {
    let cap = n_requested + n_requested / 2;
    if data.len() > cap {
        data.truncate(cap);
    }
    data
}

/// Nanoseconds elapsed since `start`, saturating into u64.
pub(crate) fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// LSBs of consecutive deltas of a timing series.
pub(crate) fn delta_lsbs(timings: &[u64]) -> Vec<u8> {
    timings
        .windows(2)
        .map(|w| (w[1].wrapping_sub(w[0]) & 0xFF) as u8)
        .collect()
}

/// XOR of consecutive deltas, LSB extracted. One extra decorrelation step
/// for sources whose successive deltas share slow drift.
pub(crate) fn xor_decorrelated_lsbs(timings: &[u64]) -> Vec<u8> {
    let deltas: Vec<u64> = timings
        .windows(2)
        .map(|w| w[1].wrapping_sub(w[0]))
        .collect();
    deltas
        .windows(2)
        .map(|w| ((w[0] ^ w[1]) & 0xFF) as u8)
        .collect()
}

/// Minimal 64-bit LCG used by micro-benchmark workloads that need a cheap,
/// data-dependent instruction stream.
#[derive(Clone, Copy)]
pub(crate) struct Lcg(pub u64);

impl Lcg {
    pub(crate) fn step(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }
}

// ── registry ──

/// Descriptor plus factory for one registered source kind.
pub struct SourceFactory {
    pub name: &'static str,
    pub category: SourceCategory,
    pub platform_requirements: &'static [&'static str],
    build: fn() -> Arc<dyn EntropySource>,
}

impl SourceFactory {
    /// Instantiate the source. Construction is always cheap; expensive
    /// discovery happens lazily on first use.
    #[must_use]
    pub fn build(&self) -> Arc<dyn EntropySource> {
        (self.build)()
    }
}

macro_rules! factory {
    ($name:literal, $category:expr, $reqs:expr, $ty:ty) => {
        SourceFactory {
            name: $name,
            category: $category,
            platform_requirements: $reqs,
            build: || -> Arc<dyn EntropySource> { Arc::new(<$ty>::new()) },
        }
    };
}

/// Enumerate every registered source factory in stable catalog order.
#[must_use]
#[allow(unused_mut)]
pub fn enumerate() -> Vec<SourceFactory> {
    let mut catalog = vec![
        factory!("clock_jitter", SourceCategory::Timing, &[], timing::ClockJitterSource),
        factory!("timer_phase", SourceCategory::Timing, &[], timing::TimerPhaseSource),
        factory!("sleep_jitter", SourceCategory::Timing, &[], timing::SleepJitterSource),
        factory!("kernel_counters", SourceCategory::Other, &[], kernel::KernelCounterSource),
        factory!("vm_stats", SourceCategory::Other, &[], kernel::VmStatSource),
        factory!("dns_timing", SourceCategory::Network, &[], network::DnsTimingSource),
        factory!("tcp_connect", SourceCategory::Network, &[], network::TcpConnectSource),
        factory!("disk_io", SourceCategory::Silicon, &[], silicon::DiskIoSource),
        factory!("memory_timing", SourceCategory::Silicon, &[], silicon::MemoryTimingSource),
        factory!("dram_row_buffer", SourceCategory::Silicon, &[], silicon::DramRowBufferSource),
        factory!("cache_contention", SourceCategory::Silicon, &[], silicon::CacheContentionSource),
        factory!("page_fault_timing", SourceCategory::Silicon, &[], silicon::PageFaultSource),
        factory!(
            "speculative_execution",
            SourceCategory::Silicon,
            &[],
            silicon::SpeculativeExecutionSource
        ),
        factory!("process_table", SourceCategory::Other, &[], kernel::ProcessTableSource),
        factory!("metadata_index", SourceCategory::Novel, &[], kernel::MetadataIndexSource),
        factory!("dispatch_queue", SourceCategory::Novel, &[], novel::DispatchQueueSource),
        factory!("loader_timing", SourceCategory::Novel, &[], novel::LoaderTimingSource),
        factory!("vm_page_timing", SourceCategory::Novel, &[], novel::VmPageTimingSource),
        factory!("compression_timing", SourceCategory::Novel, &[], novel::CompressionTimingSource),
        factory!("hash_timing", SourceCategory::Novel, &[], novel::HashTimingSource),
        factory!("cpu_io_beat", SourceCategory::CrossDomain, &[], cross_domain::CpuIoBeatSource),
        factory!(
            "cpu_memory_beat",
            SourceCategory::CrossDomain,
            &[],
            cross_domain::CpuMemoryBeatSource
        ),
        factory!(
            "cpu_kernel_beat",
            SourceCategory::CrossDomain,
            &[],
            cross_domain::CpuKernelBeatSource
        ),
        factory!(
            "multi_domain_beat",
            SourceCategory::CrossDomain,
            &[],
            cross_domain::MultiDomainBeatSource
        ),
        factory!("wifi_rssi", SourceCategory::Hardware, &["wifi"], radio::WifiRssiSource),
        factory!(
            "bluetooth_ble",
            SourceCategory::Hardware,
            &["bluetooth"],
            radio::BluetoothBleSource
        ),
    ];

    #[cfg(feature = "audio")]
    catalog.push(factory!(
        "audio_thermal",
        SourceCategory::Hardware,
        &["microphone"],
        media::AudioThermalSource
    ));

    #[cfg(feature = "camera")]
    catalog.push(factory!(
        "camera_shot_noise",
        SourceCategory::Hardware,
        &["camera"],
        media::CameraShotNoiseSource
    ));

    catalog
}

/// Instantiate every catalog source whose platform requirements and
/// availability probe both pass under the supplied capabilities.
///
/// Idempotent and side-effect free beyond the short probes the sources
/// themselves perform.
#[must_use]
pub fn detect_available(caps: &HostCapabilities) -> Vec<Arc<dyn EntropySource>> {
    let mut available = Vec::new();
    for factory in enumerate() {
        if !caps.satisfies_all(factory.platform_requirements) {
            trace!(source = factory.name, "platform requirements not met");
            continue;
        }
        let source = factory.build();
        if source.is_available(caps) {
            available.push(source);
        } else {
            trace!(source = factory.name, "availability probe failed");
        }
    }
    debug!(
        available = available.len(),
        catalog = enumerate().len(),
        "source detection complete"
    );
    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_names_are_unique_and_order_stable() {
        let first: Vec<&str> = enumerate().iter().map(|f| f.name).collect();
        let second: Vec<&str> = enumerate().iter().map(|f| f.name).collect();
        assert_eq!(first, second);

        let unique: HashSet<&str> = first.iter().copied().collect();
        assert_eq!(unique.len(), first.len(), "duplicate source names");
        assert!(first.len() >= 26);
    }

    #[test]
    fn factory_metadata_matches_built_sources() {
        for factory in enumerate() {
            let source = factory.build();
            assert_eq!(factory.name, source.name());
            assert_eq!(
                factory.platform_requirements,
                source.platform_requirements(),
                "requirement mismatch for {}",
                factory.name
            );
            assert!(!source.description().is_empty());
        }
    }

    #[test]
    fn detection_with_no_capabilities_excludes_gated_sources() {
        let caps = HostCapabilities::none();
        let names: Vec<&str> = detect_available(&caps)
            .iter()
            .map(|s| s.name())
            .collect();
        assert!(!names.contains(&"wifi_rssi"));
        assert!(!names.contains(&"bluetooth_ble"));
        // Pure timing sources are capability-free and must survive.
        assert!(names.contains(&"clock_jitter"));
    }

    #[test]
    fn sample_zero_returns_empty_everywhere() {
        let caps = HostCapabilities::none();
        for source in detect_available(&caps) {
            assert!(
                source.sample(0).is_empty(),
                "{} returned bytes for a zero request",
                source.name()
            );
        }
    }

    #[test]
    fn helper_lsb_semantics() {
        assert_eq!(delta_lsbs(&[10, 30, 25]), vec![20, 251]);
        let xd = xor_decorrelated_lsbs(&[0, 10, 30, 31]);
        assert_eq!(xd, vec![10 ^ 20, 20 ^ 1]);
        assert_eq!(bound_sample(vec![0u8; 100], 50), vec![0u8; 75]);
    }
}
