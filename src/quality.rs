//! # Quality Estimator - Fast Entropy Characterisation
//!
//! Lightweight statistical grading for byte samples. The estimator runs in
//! two places: inline during pool collection, where it drives per-source
//! health tracking, and on demand against pool output or raw source dumps.
//!
//! Three measurements feed a composite 0-100 score:
//! - **Shannon entropy** over the empirical byte distribution (bits/byte)
//! - **Min-entropy**, the most conservative guessability measure
//! - **Deflate compressibility** at level 9, where ratios near 1.0 mean
//!   the sample is incompressible
//!
//! The full battery in [`crate::battery`] is the heavyweight counterpart;
//! this module is intentionally cheap enough to run on every collection
//! round without distorting timing-sensitive sources.

use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// Minimum sample length the estimator will grade. Shorter inputs produce
/// an immediate F with an "insufficient" detail.
pub const MIN_SAMPLE_LEN: usize = 16;

/// Letter grade on the standard A-F scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Map a 0-100 quality score to a grade.
    ///
    /// Thresholds: A >= 80, B >= 60, C >= 40, D >= 20, else F.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Grade::A
        } else if score >= 60.0 {
            Grade::B
        } else if score >= 40.0 {
            Grade::C
        } else if score >= 20.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    /// Map a statistical p-value to a grade. `None` (no p-value could be
    /// computed) grades F.
    ///
    /// Thresholds: A >= 0.1, B >= 0.01, C >= 0.001, D >= 0.0001, else F.
    #[must_use]
    pub fn from_p_value(p: Option<f64>) -> Self {
        match p {
            Some(p) if p >= 0.1 => Grade::A,
            Some(p) if p >= 0.01 => Grade::B,
            Some(p) if p >= 0.001 => Grade::C,
            Some(p) if p >= 0.0001 => Grade::D,
            _ => Grade::F,
        }
    }

    /// Numeric weight used when averaging grades into an overall score.
    #[must_use]
    pub fn numeric(&self) -> f64 {
        match self {
            Grade::A => 100.0,
            Grade::B => 75.0,
            Grade::C => 50.0,
            Grade::D => 25.0,
            Grade::F => 0.0,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Grade::A => 'A',
            Grade::B => 'B',
            Grade::C => 'C',
            Grade::D => 'D',
            Grade::F => 'F',
        };
        write!(f, "{c}")
    }
}

/// Immutable quality report for one byte sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Caller-supplied label, typically the source name.
    pub label: String,
    /// Number of byte samples graded.
    pub samples: usize,
    /// Distinct byte values observed (1..=256; 0 for empty input).
    pub unique_values: usize,
    /// Shannon entropy in bits per byte (0..=8).
    pub shannon_entropy: f64,
    /// Min-entropy in bits per byte (0..=8), never above Shannon.
    pub min_entropy: f64,
    /// Deflate(level 9) output size over input size; ~1.0 = incompressible.
    pub compression_ratio: f64,
    /// Composite score 0..=100, rounded to one decimal.
    pub quality_score: f64,
    /// Letter grade derived from the score.
    pub grade: Grade,
    /// Populated when grading failed, e.g. "insufficient".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QualityReport {
    /// Report used when the sample is too small (or empty) to grade.
    #[must_use]
    pub fn insufficient(label: &str, samples: usize) -> Self {
        Self {
            label: label.to_string(),
            samples,
            unique_values: 0,
            shannon_entropy: 0.0,
            min_entropy: 0.0,
            compression_ratio: 0.0,
            quality_score: 0.0,
            grade: Grade::F,
            error: Some("insufficient".to_string()),
        }
    }
}

/// Byte-value histogram over a sample.
fn histogram(data: &[u8]) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    counts
}

/// Fast Shannon entropy in bits per byte.
///
/// A small epsilon inside the log keeps the computation defined for
/// probabilities that round to zero.
#[must_use]
pub fn quick_shannon(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in histogram(data).iter() {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * (p + 1e-15).log2();
        }
    }
    entropy.max(0.0)
}

/// Min-entropy in bits per byte: `-log2(max p_i)`.
#[must_use]
pub fn quick_min_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let max_count = histogram(data).iter().copied().max().unwrap_or(0);
    let p_max = max_count as f64 / data.len() as f64;
    (-(p_max + 1e-15).log2()).max(0.0)
}

/// Deflate(level 9) size ratio. Values near or above 1.0 indicate the
/// sample is incompressible, i.e. structureless.
#[must_use]
pub fn deflate_ratio(data: &[u8]) -> f64 {
    if data.len() < 10 {
        return 0.0;
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(9));
    if encoder.write_all(data).is_err() {
        return 0.0;
    }
    match encoder.finish() {
        Ok(compressed) => compressed.len() as f64 / data.len() as f64,
        Err(_) => 0.0,
    }
}

/// Run the lightweight quality metrics on a byte sample.
///
/// Inputs shorter than [`MIN_SAMPLE_LEN`] grade F with an "insufficient"
/// error detail. Score formula:
/// `60 * H/8 + 20 * min(ratio, 1) + 20 * min(unique/256, 1)`,
/// rounded to one decimal.
#[must_use]
pub fn quick_quality(data: &[u8], label: &str) -> QualityReport {
    if data.len() < MIN_SAMPLE_LEN {
        return QualityReport::insufficient(label, data.len());
    }

    let shannon = quick_shannon(data);
    let min_entropy = quick_min_entropy(data);
    let ratio = deflate_ratio(data);
    let unique = histogram(data).iter().filter(|&&c| c > 0).count();

    let score = 60.0 * (shannon / 8.0)
        + 20.0 * ratio.min(1.0)
        + 20.0 * (unique as f64 / 256.0).min(1.0);
    let score = (score * 10.0).round() / 10.0;

    QualityReport {
        label: label.to_string(),
        samples: data.len(),
        unique_values: unique,
        shannon_entropy: shannon,
        min_entropy,
        compression_ratio: ratio,
        quality_score: score,
        grade: Grade::from_score(score),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn constant_input_has_zero_entropy() {
        let data = vec![0u8; 4096];
        let report = quick_quality(&data, "constant");
        assert_eq!(report.shannon_entropy, 0.0);
        assert!(report.min_entropy.abs() < 1e-9);
        assert!(report.compression_ratio < 0.05);
        assert_eq!(report.grade, Grade::F);
        assert_eq!(report.unique_values, 1);
    }

    #[test]
    fn uniform_input_grades_a() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_240).collect();
        let report = quick_quality(&data, "uniform");
        assert!(report.shannon_entropy > 7.99);
        assert!(report.min_entropy > 7.99);
        assert_eq!(report.unique_values, 256);
        assert_eq!(report.grade, Grade::A);
    }

    #[test]
    fn csprng_input_is_incompressible() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut data = vec![0u8; 8192];
        rng.fill_bytes(&mut data);
        let report = quick_quality(&data, "chacha");
        assert!(report.compression_ratio > 0.95);
        assert!(report.shannon_entropy > 7.9);
        assert_eq!(report.grade, Grade::A);
    }

    #[test]
    fn short_input_is_insufficient() {
        let report = quick_quality(&[1, 2, 3], "short");
        assert_eq!(report.grade, Grade::F);
        assert_eq!(report.error.as_deref(), Some("insufficient"));
        assert_eq!(report.samples, 3);
    }

    #[test]
    fn min_entropy_never_exceeds_shannon() {
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        for len in [16usize, 64, 1024] {
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            // Inject bias to separate the two measures
            for b in data.iter_mut().step_by(3) {
                *b = 0x41;
            }
            let shannon = quick_shannon(&data);
            let min_e = quick_min_entropy(&data);
            assert!(min_e <= shannon + 1e-9, "min {min_e} > shannon {shannon}");
            assert!((0.0..=8.0).contains(&shannon));
            assert!((0.0..=8.0).contains(&min_e));
        }
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(Grade::from_score(80.0), Grade::A);
        assert_eq!(Grade::from_score(79.9), Grade::B);
        assert_eq!(Grade::from_score(60.0), Grade::B);
        assert_eq!(Grade::from_score(40.0), Grade::C);
        assert_eq!(Grade::from_score(20.0), Grade::D);
        assert_eq!(Grade::from_score(19.9), Grade::F);
    }

    #[test]
    fn p_value_grades() {
        assert_eq!(Grade::from_p_value(Some(0.5)), Grade::A);
        assert_eq!(Grade::from_p_value(Some(0.05)), Grade::B);
        assert_eq!(Grade::from_p_value(Some(0.005)), Grade::C);
        assert_eq!(Grade::from_p_value(Some(0.0005)), Grade::D);
        assert_eq!(Grade::from_p_value(Some(0.0)), Grade::F);
        assert_eq!(Grade::from_p_value(None), Grade::F);
    }
}
