//! Silicon-level sources: storage latency, DRAM row-buffer state, cache
//! contention, page-fault service time and speculative-execution timing.
//!
//! Each source runs a tight micro-benchmark and keeps only the low byte of
//! every measured wall time. The phenomena are physically random at that
//! scale: NAND cell read margins, DRAM refresh collisions, replacement
//! policy state and branch-predictor history all shift between iterations.

use memmap2::MmapMut;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::hint::black_box;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;
use tracing::trace;

use crate::capability::HostCapabilities;
use crate::conditioning::wall_clock_ns;
use crate::sources::{
    bound_sample, elapsed_ns, xor_decorrelated_lsbs, EntropySource, Lcg, SourceCategory,
};

const PAGE_SIZE: usize = 4096;

/// Entropy from storage read latency jitter.
///
/// Flash read latency varies with cell voltage margins, wear-leveling and
/// garbage-collection decisions, controller queue state and NAND thermal
/// conditions. Random-offset reads against a scratch file surface that
/// jitter even through the page cache.
pub struct DiskIoSource;

impl DiskIoSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiskIoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for DiskIoSource {
    fn name(&self) -> &'static str {
        "disk_io"
    }

    fn description(&self) -> &'static str {
        "Storage read latency jitter against a scratch file"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
    }

    fn estimated_rate_bps(&self) -> f64 {
        800.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        tempfile::tempfile().is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let Ok(mut scratch) = tempfile::NamedTempFile::new() else {
            return Vec::new();
        };

        // 64 KiB of varied content; timing, not content, carries the entropy.
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let mut content = vec![0u8; 64 * 1024];
        rng.fill(&mut content[..]);
        if scratch.write_all(&content).is_err() {
            return Vec::new();
        }
        if scratch.as_file().sync_all().is_err() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(n_requested);
        let mut page = [0u8; PAGE_SIZE];
        for _ in 0..n_requested {
            let offset = rng.gen_range(0..60 * 1024u64);
            let start = Instant::now();
            let ok = std::fs::File::open(scratch.path())
                .and_then(|mut f| {
                    f.seek(SeekFrom::Start(offset))?;
                    f.read_exact(&mut page)
                })
                .is_ok();
            if !ok {
                trace!("disk scratch read failed, truncating sample");
                break;
            }
            black_box(&page);
            out.push((elapsed_ns(start) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from anonymous page allocation and first-touch timing.
///
/// Each map/touch/unmap cycle exercises the VM allocator, page zeroing and
/// TLB maintenance; latency shifts with memory pressure and refresh state.
pub struct MemoryTimingSource;

impl MemoryTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for MemoryTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for MemoryTimingSource {
    fn name(&self) -> &'static str {
        "memory_timing"
    }

    fn description(&self) -> &'static str {
        "Anonymous page map and first-touch timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
    }

    fn estimated_rate_bps(&self) -> f64 {
        1500.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        MmapMut::map_anon(PAGE_SIZE).is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_requested);
        for _ in 0..n_requested {
            let start = Instant::now();
            let Ok(mut map) = MmapMut::map_anon(PAGE_SIZE) else {
                break;
            };
            map[0] = 42;
            drop(map);
            out.push((elapsed_ns(start) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from DRAM row-buffer hit/miss timing.
///
/// Random accesses across a buffer larger than the last-level cache force
/// row-buffer activity in the memory controller. Hit/miss timing depends
/// on refresh scheduling, thermal state and controller arbitration.
/// Consecutive deltas are XORed for decorrelation.
pub struct DramRowBufferSource;

const DRAM_BUFFER_WORDS: usize = 32 * 1024 * 1024 / 8;

impl DramRowBufferSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for DramRowBufferSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for DramRowBufferSource {
    fn name(&self) -> &'static str {
        "dram_row_buffer"
    }

    fn description(&self) -> &'static str {
        "DRAM row-buffer hit/miss timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
    }

    fn estimated_rate_bps(&self) -> f64 {
        3000.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "A 32 MiB working set exceeds the last-level cache, so random \
             reads hit DRAM. Whether a read lands in an open row depends on \
             refresh timing and controller scheduling that no software \
             observer controls.",
        )
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let buf = vec![0u64; DRAM_BUFFER_WORDS];
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());

        let mut timings = Vec::with_capacity(n_requested + 2);
        for _ in 0..n_requested + 2 {
            let idx = rng.gen_range(0..buf.len());
            let start = Instant::now();
            // black_box keeps the load from being optimised away.
            black_box(buf[idx]);
            timings.push(elapsed_ns(start));
        }
        bound_sample(xor_decorrelated_lsbs(&timings), n_requested)
    }
}

/// Entropy from cache miss-pattern timing.
///
/// Alternating sequential (cache-friendly) and random (cache-hostile)
/// accesses exposes the replacement policy and prefetcher state in the
/// timestamp stream.
pub struct CacheContentionSource;

const CACHE_BUFFER_WORDS: usize = 8 * 1024 * 1024 / 8;

impl CacheContentionSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CacheContentionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for CacheContentionSource {
    fn name(&self) -> &'static str {
        "cache_contention"
    }

    fn description(&self) -> &'static str {
        "Cache miss-pattern timing under alternating access patterns"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
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
        let buf = vec![0u64; CACHE_BUFFER_WORDS];
        let mut rng = ChaCha20Rng::seed_from_u64(wall_clock_ns());
        let anchor = Instant::now();

        let mut timings = Vec::with_capacity(n_requested + 1);
        for i in 0..n_requested + 1 {
            let idx = if i & 1 == 1 {
                i % buf.len()
            } else {
                rng.gen_range(0..buf.len())
            };
            black_box(buf[idx]);
            timings.push(elapsed_ns(anchor));
        }
        let deltas: Vec<u8> = timings
            .windows(2)
            .map(|w| (w[1].wrapping_sub(w[0]) & 0xFF) as u8)
            .collect();
        bound_sample(deltas, n_requested)
    }
}

/// Entropy from minor page-fault service timing.
///
/// Mapping fresh anonymous memory and touching each page forces the kernel
/// through page-table updates and zero-page allocation whose latency moves
/// with system load.
pub struct PageFaultSource;

impl PageFaultSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PageFaultSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for PageFaultSource {
    fn name(&self) -> &'static str {
        "page_fault_timing"
    }

    fn description(&self) -> &'static str {
        "Minor page fault and TLB refill timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
    }

    fn estimated_rate_bps(&self) -> f64 {
        1500.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        MmapMut::map_anon(PAGE_SIZE * 4).is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_requested);
        for _ in 0..n_requested {
            let start = Instant::now();
            let Ok(mut map) = MmapMut::map_anon(PAGE_SIZE * 4) else {
                break;
            };
            for page in 0..4 {
                map[page * PAGE_SIZE] = 1;
            }
            drop(map);
            out.push((elapsed_ns(start) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from branch misprediction and pipeline-flush timing.
///
/// A data-dependent branch pattern defeats the predictor; the resulting
/// flush costs vary with micro-architectural history that is effectively
/// random across iterations.
pub struct SpeculativeExecutionSource;

impl SpeculativeExecutionSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for SpeculativeExecutionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for SpeculativeExecutionSource {
    fn name(&self) -> &'static str {
        "speculative_execution"
    }

    fn description(&self) -> &'static str {
        "Branch predictor and speculative execution timing"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Silicon
    }

    fn estimated_rate_bps(&self) -> f64 {
        2000.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_requested);
        let mut lcg = Lcg(0x1234_5678_9ABC_DEF0);
        for _ in 0..n_requested {
            let start = Instant::now();
            let mut x = lcg.0;
            for _ in 0..20 {
                x = lcg.step();
                // Unpredictable branch directions flush the pipeline.
                if x & 0x8000_0000_0000_0000 != 0 {
                    x ^= 0xD800_0000_0000_0000;
                } else {
                    x = x.rotate_left(1);
                }
                if (x >> 32) & 1 == 1 {
                    x = x.wrapping_add(0x1234);
                } else {
                    x = x.wrapping_sub(0x5678);
                }
                lcg.0 = x;
            }
            black_box(x);
            out.push((elapsed_ns(start) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::quick_shannon;

    #[test]
    fn all_silicon_sources_respect_length_contract() {
        let caps = HostCapabilities::none();
        let sources: Vec<Box<dyn EntropySource>> = vec![
            Box::new(DiskIoSource::new()),
            Box::new(MemoryTimingSource::new()),
            Box::new(PageFaultSource::new()),
            Box::new(SpeculativeExecutionSource::new()),
        ];
        for source in &sources {
            assert!(source.is_available(&caps), "{} unavailable", source.name());
            let data = source.sample(100);
            assert!(data.len() <= 150, "{} overshot", source.name());
            assert!(source.sample(0).is_empty());
        }
    }

    #[test]
    fn speculative_execution_timings_vary() {
        let data = SpeculativeExecutionSource::new().sample(512);
        assert_eq!(data.len(), 512);
        assert!(quick_shannon(&data) > 0.5, "timings suspiciously constant");
    }

    #[test]
    fn dram_source_emits_decorrelated_bytes() {
        let data = DramRowBufferSource::new().sample(128);
        assert_eq!(data.len(), 128);
    }

    #[test]
    fn cache_contention_sample_is_exact_length() {
        let data = CacheContentionSource::new().sample(64);
        assert_eq!(data.len(), 64);
    }
}
