//! Clock-domain phase noise, hardware timer jitter, and scheduler sleep
//! jitter sources.
//!
//! These are the always-available workhorses: no hardware beyond the CPU's
//! own clocks is required, and a single sample call costs microseconds per
//! byte.

use std::hint::black_box;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::capability::HostCapabilities;
use crate::conditioning::wall_clock_ns;
use crate::sources::{bound_sample, elapsed_ns, EntropySource, SourceCategory};

/// Entropy from the difference between two independently driven clocks.
///
/// The monotonic clock and the wall clock are typically serviced by
/// different hardware counters and disciplined by different mechanisms
/// (PLL trim, NTP slew). The low bits of their instantaneous difference
/// drift unpredictably.
pub struct ClockJitterSource {
    anchor: Instant,
}

impl ClockJitterSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for ClockJitterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for ClockJitterSource {
    fn name(&self) -> &'static str {
        "clock_jitter"
    }

    fn description(&self) -> &'static str {
        "Phase noise between the monotonic and wall clocks"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Timing
    }

    fn estimated_rate_bps(&self) -> f64 {
        500.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "Reads two clocks driven by independent oscillators in a tight loop. \
             Their difference drifts with PLL phase noise, interrupt coalescing \
             and NTP slew; the low byte of each difference is genuine jitter.",
        )
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_requested);
        for _ in 0..n_requested {
            let mono = elapsed_ns(self.anchor);
            let wall = wall_clock_ns();
            out.push((wall.wrapping_sub(mono) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from a monotonic hardware timer read between tiny variable
/// workloads, conditioned through a keyed hash before emission.
///
/// CPU pipeline state bleeds into back-to-back timer reads: speculative
/// execution depth, store-buffer drain and power-state transitions all
/// shift the observed deltas. The raw delta stream is correlated, so it is
/// passed through a rolling SHA-256 chain rather than emitted directly.
pub struct TimerPhaseSource;

impl TimerPhaseSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Collect one raw timer delta with a small data-dependent workload
    /// between the reads.
    fn raw_delta(iteration: usize) -> u64 {
        let start = Instant::now();
        // Workload length varies per call so the pipeline never settles.
        let mut x = iteration as u64;
        for _ in 0..(iteration % 7 + 1) {
            x = black_box(x.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17));
        }
        black_box(x);
        elapsed_ns(start)
    }

    /// Keyed-hash conditioning of the raw delta stream: 32 deltas per
    /// block, rolling state, 32 output bytes per block.
    fn digest_stream(deltas: &[u64], n_out: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_out + 32);
        let mut state = [0u8; 32];
        for (i, chunk) in deltas.chunks(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(state);
            for delta in chunk {
                hasher.update(delta.to_le_bytes());
            }
            hasher.update((i as u64).to_le_bytes());
            state = hasher.finalize().into();
            out.extend_from_slice(&state);
            if out.len() >= n_out {
                break;
            }
        }
        out.truncate(n_out);
        out
    }
}

impl Default for TimerPhaseSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for TimerPhaseSource {
    fn name(&self) -> &'static str {
        "timer_phase"
    }

    fn description(&self) -> &'static str {
        "Hardware timer deltas across variable workloads, keyed-hashed"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Timing
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
        let deltas: Vec<u64> = (0..n_requested).map(Self::raw_delta).collect();
        Self::digest_stream(&deltas, n_requested)
    }
}

/// Entropy from scheduler yield timing.
///
/// Yielding the thread hands control to the OS scheduler; how long the
/// round trip takes depends on run-queue state, timer interrupt phase and
/// core migration decisions.
pub struct SleepJitterSource;

impl SleepJitterSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for SleepJitterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for SleepJitterSource {
    fn name(&self) -> &'static str {
        "sleep_jitter"
    }

    fn description(&self) -> &'static str {
        "OS scheduler jitter from zero-length yields"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Timing
    }

    fn estimated_rate_bps(&self) -> f64 {
        200.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        true
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_requested);
        for _ in 0..n_requested {
            let start = Instant::now();
            std::thread::yield_now();
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
    fn clock_jitter_returns_requested_length() {
        let source = ClockJitterSource::new();
        assert_eq!(source.sample(200).len(), 200);
        assert!(source.sample(0).is_empty());
    }

    #[test]
    fn timer_phase_output_is_well_mixed() {
        let source = TimerPhaseSource::new();
        let data = source.sample(1024);
        assert_eq!(data.len(), 1024);
        // Hash conditioning should leave no visible structure.
        assert!(quick_shannon(&data) > 6.0, "shannon {}", quick_shannon(&data));
    }

    #[test]
    fn sleep_jitter_is_nonconstant() {
        let source = SleepJitterSource::new();
        let data = source.sample(256);
        assert_eq!(data.len(), 256);
        let first = data[0];
        assert!(
            data.iter().any(|&b| b != first),
            "yield timings were perfectly constant"
        );
    }

    #[test]
    fn availability_floor() {
        let caps = HostCapabilities::none();
        for source in [
            &ClockJitterSource::new() as &dyn EntropySource,
            &TimerPhaseSource::new(),
            &SleepJitterSource::new(),
        ] {
            assert!(source.is_available(&caps));
            let total: usize = (0..10).map(|_| source.sample(200).len()).sum();
            assert!(total >= 10, "{} under availability floor", source.name());
        }
    }
}
