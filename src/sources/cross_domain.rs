//! Cross-clock-domain beat sources.
//!
//! CPU, memory controller, I/O and kernel timekeeping run on separate
//! clock domains with independent PLLs. Operations that cross a domain
//! boundary pick up the beat pattern of those oscillators, the same way
//! two close tuning forks produce an audible beat. Every source here
//! interleaves a CPU-bound workload with one or more boundary crossings
//! and emits the XOR of consecutive timing deltas.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::hint::black_box;
use std::io::{Seek, SeekFrom, Write};
use std::time::Instant;

use crate::capability::HostCapabilities;
use crate::conditioning::wall_clock_ns;
use crate::sources::{
    bound_sample, elapsed_ns, xor_decorrelated_lsbs, EntropySource, Lcg, SourceCategory,
};

/// Cheap CPU burst that cannot be optimised away.
fn cpu_burst(lcg: &mut Lcg, iterations: usize) -> u64 {
    let mut x = 0u64;
    for _ in 0..iterations {
        x ^= lcg.step();
    }
    black_box(x)
}

/// Kernel boundary crossing: a real syscall on unix, a clock read
/// elsewhere.
fn kernel_crossing() {
    #[cfg(unix)]
    unsafe {
        black_box(libc::getpid());
    }
    #[cfg(not(unix))]
    black_box(wall_clock_ns());
}

/// Entropy from CPU-to-I/O domain crossing timing.
pub struct CpuIoBeatSource;

impl CpuIoBeatSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuIoBeatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for CpuIoBeatSource {
    fn name(&self) -> &'static str {
        "cpu_io_beat"
    }

    fn description(&self) -> &'static str {
        "CPU to I/O clock-domain beat timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::CrossDomain
    }

    fn estimated_rate_bps(&self) -> f64 {
        1500.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "Alternates a CPU burst with a small file write. The storage \
             path runs on its own clock domain; the crossing latency carries \
             the PLL beat between the two oscillators.",
        )
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        tempfile::tempfile().is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let Ok(mut scratch) = tempfile::tempfile() else {
            return Vec::new();
        };
        let mut lcg = Lcg(wall_clock_ns() | 1);
        let mut timings = Vec::with_capacity(n_requested + 2);

        for _ in 0..n_requested + 2 {
            let x = cpu_burst(&mut lcg, 50);
            let start = Instant::now();
            let ok = scratch
                .seek(SeekFrom::Start(0))
                .and_then(|_| scratch.write_all(&x.to_le_bytes()))
                .is_ok();
            timings.push(elapsed_ns(start));
            if !ok {
                break;
            }
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from CPU-to-memory-controller domain crossing timing.
pub struct CpuMemoryBeatSource;

const BEAT_BUFFER_BYTES: usize = 16 * 1024 * 1024;

impl CpuMemoryBeatSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuMemoryBeatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for CpuMemoryBeatSource {
    fn name(&self) -> &'static str {
        "cpu_memory_beat"
    }

    fn description(&self) -> &'static str {
        "CPU to memory-controller clock-domain beat timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::CrossDomain
    }

    fn estimated_rate_bps(&self) -> f64 {
        2500.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let buf = vec![0u8; BEAT_BUFFER_BYTES];
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let mut timings = Vec::with_capacity(n_requested + 2);

        for _ in 0..n_requested + 2 {
            let idx = rng.gen_range(0..buf.len());
            let start = Instant::now();
            // black_box keeps the uncached load from being optimised away.
            black_box(buf[idx]);
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from CPU-to-kernel domain crossing timing.
pub struct CpuKernelBeatSource;

impl CpuKernelBeatSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuKernelBeatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for CpuKernelBeatSource {
    fn name(&self) -> &'static str {
        "cpu_kernel_beat"
    }

    fn description(&self) -> &'static str {
        "CPU to kernel boundary crossing beat timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::CrossDomain
    }

    fn estimated_rate_bps(&self) -> f64 {
        2000.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let mut lcg = Lcg(wall_clock_ns() | 1);
        let mut timings = Vec::with_capacity(n_requested + 2);
        for _ in 0..n_requested + 2 {
            cpu_burst(&mut lcg, 30);
            let start = Instant::now();
            kernel_crossing();
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from interleaving every domain in one tight loop.
///
/// CPU burst, uncached memory read and kernel crossing per iteration;
/// the composite timing carries interference from all the domain PLLs at
/// once.
pub struct MultiDomainBeatSource;

const MULTI_BUFFER_BYTES: usize = 4 * 1024 * 1024;

impl MultiDomainBeatSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for MultiDomainBeatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for MultiDomainBeatSource {
    fn name(&self) -> &'static str {
        "multi_domain_beat"
    }

    fn description(&self) -> &'static str {
        "Multi-domain (CPU/memory/kernel) interleaved beat timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::CrossDomain
    }

    fn estimated_rate_bps(&self) -> f64 {
        3000.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let buf = vec![0u8; MULTI_BUFFER_BYTES];
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let mut lcg = Lcg(wall_clock_ns() | 1);
        let mut timings = Vec::with_capacity(n_requested + 2);

        for _ in 0..n_requested + 2 {
            let start = Instant::now();
            cpu_burst(&mut lcg, 30);
            let idx = rng.gen_range(0..buf.len());
            black_box(buf[idx]);
            kernel_crossing();
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_sources_fill_requests_exactly() {
        let caps = HostCapabilities::none();
        let sources: Vec<Box<dyn EntropySource>> = vec![
            Box::new(CpuIoBeatSource::new()),
            Box::new(CpuMemoryBeatSource::new()),
            Box::new(CpuKernelBeatSource::new()),
            Box::new(MultiDomainBeatSource::new()),
        ];
        for source in &sources {
            assert!(source.is_available(&caps));
            assert_eq!(source.sample(96).len(), 96, "{}", source.name());
            assert!(source.sample(0).is_empty());
        }
    }

    #[test]
    fn cpu_burst_depends_on_lcg_state() {
        let mut a = Lcg(1);
        let mut b = Lcg(2);
        assert_ne!(cpu_burst(&mut a, 10), cpu_burst(&mut b, 10));
    }
}
