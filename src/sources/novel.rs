//! Novel sources discovered through systematic subsystem probing: worker
//! dispatch latency, dynamic loader resolution, VM page cycling, and the
//! compression and hash timing oracles.
//!
//! The timing oracles exploit data-dependent execution paths: deflate's
//! match search and a hash's message schedule leave branch-predictor and
//! cache state behind that varies the next measurement.

use crossbeam_channel::unbounded;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use memmap2::MmapMut;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Sha3_256};
use std::hint::black_box;
use std::io::Write;
use std::time::{Duration, Instant};

use crate::capability::HostCapabilities;
use crate::conditioning::wall_clock_ns;
use crate::sources::{
    bound_sample, delta_lsbs, elapsed_ns, xor_decorrelated_lsbs, EntropySource, SourceCategory,
};

/// Entropy from worker-pool dispatch latency.
///
/// Each task's round trip through a small thread pool crosses the
/// scheduler twice. Queue arbitration, core migration and power-state
/// transitions make per-task latency non-deterministic.
pub struct DispatchQueueSource;

const DISPATCH_WORKERS: usize = 4;

impl DispatchQueueSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for DispatchQueueSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for DispatchQueueSource {
    fn name(&self) -> &'static str {
        "dispatch_queue"
    }

    fn description(&self) -> &'static str {
        "Worker-pool dispatch latency jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
    }

    fn estimated_rate_bps(&self) -> f64 {
        1500.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let (job_tx, job_rx) = unbounded::<u64>();
        let (done_tx, done_rx) = unbounded::<u64>();

        let workers: Vec<_> = (0..DISPATCH_WORKERS)
            .map(|_| {
                let jobs = job_rx.clone();
                let done = done_tx.clone();
                std::thread::spawn(move || {
                    while let Ok(task) = jobs.recv() {
                        if done.send(task).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(done_tx);

        let mut timings = Vec::with_capacity(n_requested + 2);
        for i in 0..n_requested + 2 {
            let start = Instant::now();
            if job_tx.send(i as u64).is_err() {
                break;
            }
            if done_rx.recv_timeout(Duration::from_millis(250)).is_err() {
                break;
            }
            timings.push(elapsed_ns(start));
        }

        drop(job_tx);
        for worker in workers {
            let _ = worker.join();
        }
        bound_sample(delta_lsbs(&timings), n_requested)
    }
}

/// Entropy from dynamic loader resolution timing.
///
/// `dlopen` of an already-resident library still walks the loader's search
/// and bookkeeping paths; timing shifts with shared-cache page residency
/// and loader lock contention.
pub struct LoaderTimingSource;

#[cfg(target_os = "linux")]
const LOADER_LIBS: &[&str] = &["libz.so.1", "libm.so.6", "libpthread.so.0", "libdl.so.2"];

#[cfg(target_os = "macos")]
const LOADER_LIBS: &[&str] = &[
    "/usr/lib/libz.dylib",
    "/usr/lib/libc++.dylib",
    "/usr/lib/libobjc.dylib",
    "/usr/lib/libSystem.B.dylib",
];

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const LOADER_LIBS: &[&str] = &[];

impl LoaderTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[cfg(unix)]
    fn timed_load(lib: &str) -> Option<u64> {
        let name = std::ffi::CString::new(lib).ok()?;
        let start = Instant::now();
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
        let elapsed = elapsed_ns(start);
        if handle.is_null() {
            return None;
        }
        unsafe {
            libc::dlclose(handle);
        }
        Some(elapsed)
    }

    #[cfg(not(unix))]
    fn timed_load(_lib: &str) -> Option<u64> {
        None
    }
}

impl Default for LoaderTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for LoaderTimingSource {
    fn name(&self) -> &'static str {
        "loader_timing"
    }

    fn description(&self) -> &'static str {
        "Dynamic loader shared-library resolution timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
    }

    fn estimated_rate_bps(&self) -> f64 {
        1200.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        LOADER_LIBS.iter().any(|lib| Self::timed_load(lib).is_some())
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 || LOADER_LIBS.is_empty() {
            return Vec::new();
        }
        let mut timings = Vec::with_capacity(n_requested + 1);
        for i in 0..n_requested + 1 {
            match Self::timed_load(LOADER_LIBS[i % LOADER_LIBS.len()]) {
                Some(t) => timings.push(t),
                None => continue,
            }
        }
        bound_sample(delta_lsbs(&timings), n_requested)
    }
}

/// Entropy from anonymous page map/touch/unmap cycling.
///
/// Each cycle crosses the VM layer: map-entry allocation, page-table
/// update, TLB shootdown, physical page recycling. The XOR of consecutive
/// deltas strips the slow drift component.
pub struct VmPageTimingSource;

impl VmPageTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for VmPageTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for VmPageTimingSource {
    fn name(&self) -> &'static str {
        "vm_page_timing"
    }

    fn description(&self) -> &'static str {
        "VM subsystem map/touch/unmap timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
    }

    fn estimated_rate_bps(&self) -> f64 {
        1300.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        MmapMut::map_anon(4096).is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let mut timings = Vec::with_capacity(n_requested + 2);
        for i in 0..n_requested + 2 {
            let start = Instant::now();
            let Ok(mut map) = MmapMut::map_anon(4096) else {
                break;
            };
            map[0] = (i & 0xFF) as u8;
            drop(map);
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from deflate compression timing.
///
/// Compression time depends on match-search branch outcomes and hash-table
/// cache behaviour, both functions of input content and residual
/// micro-architectural state.
pub struct CompressionTimingSource;

impl CompressionTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompressionTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for CompressionTimingSource {
    fn name(&self) -> &'static str {
        "compression_timing"
    }

    fn description(&self) -> &'static str {
        "Deflate timing oracle over mixed-content buffers"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
    }

    fn estimated_rate_bps(&self) -> f64 {
        1800.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let mut buf = [0u8; 192];
        let mut timings = Vec::with_capacity(n_requested + 2);

        for i in 0..n_requested + 2 {
            // Mixed content exercises both the literal and the match paths.
            rng.fill(&mut buf[..64]);
            buf[64..128].fill((i & 0xFF) as u8);
            rng.fill(&mut buf[128..]);

            let start = Instant::now();
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(6));
            if encoder.write_all(&buf).is_err() {
                break;
            }
            let Ok(compressed) = encoder.finish() else {
                break;
            };
            black_box(compressed);
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from hash timing over a self-updating buffer.
///
/// Each iteration hashes the previous digest, so the instruction stream is
/// fixed while the data, and with it cache and pipeline state, walks.
pub struct HashTimingSource;

impl HashTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for HashTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for HashTimingSource {
    fn name(&self) -> &'static str {
        "hash_timing"
    }

    fn description(&self) -> &'static str {
        "SHA-3 timing oracle over a self-updating buffer"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Novel
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
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let mut state = [0u8; 32];
        rng.fill_bytes(&mut state);

        let mut timings = Vec::with_capacity(n_requested + 1);
        for i in 0..n_requested + 1 {
            let mut hasher = Sha3_256::new();
            hasher.update(state);
            hasher.update((i as u64).to_le_bytes());
            let start = Instant::now();
            state = hasher.finalize().into();
            timings.push(elapsed_ns(start));
        }
        bound_sample(delta_lsbs(&timings), n_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_queue_round_trips_produce_bytes() {
        let data = DispatchQueueSource::new().sample(64);
        assert!(!data.is_empty());
        assert!(data.len() <= 96);
    }

    #[test]
    fn compression_and_hash_oracles_fill_requests() {
        assert_eq!(CompressionTimingSource::new().sample(100).len(), 100);
        assert_eq!(HashTimingSource::new().sample(100).len(), 100);
    }

    #[test]
    fn vm_page_source_is_available_and_bounded() {
        let source = VmPageTimingSource::new();
        assert!(source.is_available(&HostCapabilities::none()));
        let data = source.sample(50);
        assert_eq!(data.len(), 50);
    }

    #[test]
    fn loader_source_degrades_on_unsupported_targets() {
        let source = LoaderTimingSource::new();
        let caps = HostCapabilities::none();
        if source.is_available(&caps) {
            let data = source.sample(32);
            assert!(!data.is_empty());
        } else {
            assert!(source.sample(32).is_empty());
        }
    }
}
