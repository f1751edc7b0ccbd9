//! # Entropy Forge v1.0.0
//!
//! An esoteric hardware entropy harvester: a library that extracts randomness
//! from unconventional physical and micro-architectural phenomena on the host
//! machine, mixes the streams through a weighted conditioning pipeline, and
//! exposes cryptographic-quality output through a simple byte API.
//!
//! ## 🔬 Physical Entropy Sources
//!
//! Every source taps a phenomenon that is random at the physical layer:
//! - **Clock phase noise**: independent oscillators drift against each other
//! - **Micro-architectural state**: DRAM row buffers, cache contention,
//!   branch predictors, TLB refills
//! - **Kernel counters**: dozens of independently advancing statistics
//! - **Environmental RF**: WiFi RSSI multipath fading, BLE ambient noise
//! - **Sensor noise**: microphone ADC thermal noise, camera shot noise
//! - **Cross-clock-domain beats**: PLL phase noise at domain boundaries
//!
//! ## 🏗️ Architecture Overview
//!
//! The engine is organised as a pipeline of small, testable layers:
//!
//! ### Capability Probe
//! - Detects OS, machine, chip and the presence of microphones, cameras,
//!   radios and privileged sensors
//! - Individual probe failures always degrade to `false`, never to errors
//! - Bounded probe time so construction stays fast
//!
//! ### Source Registry
//! - Static catalog of ~25 capability-gated source factories
//! - `detect_available` instantiates exactly the sources this host supports
//!
//! ### Entropy Sources
//! - Uniform three-operation contract: availability, sampling, self-check
//! - Samples degrade to truncated or empty output, never propagate errors
//!
//! ### Quality Estimator
//! - Shannon entropy, min-entropy, deflate compressibility and a composite
//!   0-100 score with A-F grading
//!
//! ### Conditioner
//! - Von Neumann debiasing, XOR folding, and a keyed SHA-256 extractor whose
//!   evolving state is mixed with a fresh system-CSPRNG contribution per block
//!
//! ### Entropy Pool
//! - Thread-safe multi-source scheduler with health tracking per source
//! - Parallel collection joins worker threads against a hard wall-clock
//!   deadline; stalled sources are abandoned without corrupting pool state
//! - Graceful degradation: even with every source failed, output quality is
//!   never worse than the system CSPRNG
//!
//! ### Test Battery
//! - Fixed battery of NIST-inspired statistical tests with graded verdicts
//!   and an aggregate quality score
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entropy_forge::EntropyPool;
//!
//! fn main() -> entropy_forge::Result<()> {
//!     // Discover every entropy source available on this machine
//!     let pool = EntropyPool::auto()?;
//!
//!     // Pull conditioned random bytes
//!     let key = pool.get_random_bytes(32)?;
//!     assert_eq!(key.len(), 32);
//!
//!     // Inspect per-source health
//!     let report = pool.health_report();
//!     println!("{}", report.render_table());
//!     Ok(())
//! }
//! ```
//!
//! ## Validating Output Quality
//!
//! ```rust,no_run
//! use entropy_forge::battery::{run_all_tests, calculate_quality_score};
//! # use entropy_forge::EntropyPool;
//! # fn main() -> entropy_forge::Result<()> {
//! # let pool = EntropyPool::auto()?;
//! let sample = pool.get_random_bytes(16_384)?;
//! let results = run_all_tests(&sample);
//! let score = calculate_quality_score(&results);
//! println!("battery score: {score:.1}/100");
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Guarantees
//!
//! - **Output length**: `get_bytes(n, _)` always returns exactly `n` bytes
//! - **Freshness**: successive outputs differ with overwhelming probability
//!   because every extractor block mixes fresh system-CSPRNG material
//! - **Containment**: source failures are absorbed into per-source health
//!   counters and never propagate to callers
//! - **No persistence**: the engine writes nothing to disk; reports are
//!   plain serde records the caller may serialise as it sees fit

/// Engine version for compatibility tracking.
pub const ENGINE_VERSION: &str = "1.0.0-harvester";

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod battery;
pub mod capability;
pub mod conditioning;
pub mod logging;
pub mod pool;
pub mod quality;
pub mod sources;

pub use conditioning::ConditioningMode;
pub use pool::{EntropyPool, HealthReport, PoolConfig, SourceHealth};
pub use quality::{Grade, QualityReport};

/// Error type covering every failure mode the engine can surface to callers.
///
/// Source-level failures are deliberately absent: by contract they are
/// absorbed into per-source health counters inside the pool and never
/// propagate. The variants below are the only errors a caller can observe.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum HarvestError {
    /// A caller-supplied argument was rejected, e.g. an unknown
    /// conditioning-mode token.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A source with the same name is already registered in the pool.
    #[error("duplicate source: {0}")]
    DuplicateSource(String),

    /// The operating system CSPRNG required by the conditioner failed.
    /// Rare, and fatal for the specific call only.
    #[error("system entropy unavailable: {0}")]
    EntropyUnavailable(String),

    /// The capability probe could not produce a host-facts record.
    #[error("capability probe failed: {0}")]
    Capability(String),

    /// Logging subsystem initialisation failed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Result type used across the engine.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        let err = HarvestError::DuplicateSource("clock_jitter".into());
        assert_eq!(err.to_string(), "duplicate source: clock_jitter");

        let err = HarvestError::InvalidArgument("unknown mode 'xor'".into());
        assert!(err.to_string().starts_with("invalid argument"));
    }

    #[test]
    fn errors_round_trip_through_serde() {
        let err = HarvestError::EntropyUnavailable("os rng failed".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: HarvestError = serde_json::from_str(&json).unwrap();
        assert_eq!(err.to_string(), back.to_string());
    }
}
