//! # Statistical Test Battery
//!
//! A fixed battery of NIST-inspired randomness tests over byte samples.
//! Registration order is stable; each test produces a [`TestResult`] with
//! a pass verdict, an optional p-value, the raw statistic and an A-F
//! grade. Tests that cannot run on the supplied length return a graded F
//! with an "insufficient" detail, and the overall score still counts them.
//!
//! Where a p-value exists the pass threshold is 0.01 and the grade follows
//! the p-value ladder (A >= 0.1, B >= 0.01, C >= 0.001, D >= 0.0001,
//! else F). Tests without a p-value grade on the statistic's distance
//! from its theoretical ideal.
//!
//! Survival functions come from `statrs`; the spectral tests run a real
//! FFT through `rustfft`. The Anderson-Darling normal-case critical
//! values are carried as an explicit table.

use flate2::write::DeflateEncoder;
use flate2::Compression;
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, DiscreteCDF, Normal, Poisson, StudentsT};
use statrs::function::erf::erfc;
use std::collections::HashMap;
use std::io::Write;

use crate::conditioning::unpack_bits;
use crate::quality::Grade;

/// Result of a single randomness test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub p_value: Option<f64>,
    pub statistic: f64,
    pub grade: Grade,
    pub details: String,
}

impl TestResult {
    /// Standard p-value verdict: pass at p >= 0.01, grade on the ladder.
    fn from_p(name: &str, p: f64, statistic: f64, details: String) -> Self {
        let p = p.clamp(0.0, 1.0);
        Self {
            name: name.to_string(),
            passed: p >= 0.01,
            p_value: Some(p),
            statistic,
            grade: Grade::from_p_value(Some(p)),
            details,
        }
    }

    /// Verdict for tests graded on a statistic rather than a p-value.
    fn graded(name: &str, passed: bool, grade: Grade, statistic: f64, details: String) -> Self {
        Self {
            name: name.to_string(),
            passed,
            p_value: None,
            statistic,
            grade,
            details,
        }
    }

    /// Below-minimum-input verdict.
    fn insufficient(name: &str, needed: usize, got: usize) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            p_value: None,
            statistic: 0.0,
            grade: Grade::F,
            details: format!("insufficient: need {needed}, got {got}"),
        }
    }

    fn failed(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            p_value: Some(0.0),
            statistic: 0.0,
            grade: Grade::F,
            details: details.to_string(),
        }
    }
}

// ── survival-function helpers ──

fn chi2_sf(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    ChiSquared::new(df)
        .map(|d| (1.0 - d.cdf(x)).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

fn normal_cdf(z: f64) -> f64 {
    Normal::new(0.0, 1.0).map(|d| d.cdf(z)).unwrap_or(0.5)
}

fn normal_two_sided_p(z: f64) -> f64 {
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

fn poisson_sf(k: u64, lambda: f64) -> f64 {
    Poisson::new(lambda.max(1e-9))
        .map(|d| (1.0 - d.cdf(k)).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

fn students_t_two_sided_p(t: f64, df: f64) -> f64 {
    if df <= 0.0 {
        return 0.0;
    }
    StudentsT::new(0.0, 1.0, df)
        .map(|d| (2.0 * (1.0 - d.cdf(t.abs()))).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

// ── small numeric helpers ──

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn variance(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|&x| (x - m) * (x - m)).sum::<f64>() / data.len() as f64
}

fn as_f64(data: &[u8]) -> Vec<f64> {
    data.iter().map(|&b| f64::from(b)).collect()
}

fn deflate_len(data: &[u8], level: u32) -> usize {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    if encoder.write_all(data).is_err() {
        return data.len();
    }
    encoder.finish().map(|v| v.len()).unwrap_or(data.len())
}

/// Correlation of a series against itself at `lag`, normalised by the
/// series variance.
fn lag_correlation(data: &[f64], lag: usize, m: f64, var: f64) -> f64 {
    if lag >= data.len() || var < 1e-10 {
        return 0.0;
    }
    let n = data.len() - lag;
    let mut acc = 0.0;
    for i in 0..n {
        acc += (data[i] - m) * (data[i + lag] - m);
    }
    acc / n as f64 / var
}

/// Counts of every overlapping `m`-bit pattern, with wraparound, as in the
/// serial and approximate-entropy statistics.
fn overlapping_pattern_counts(bits: &[u8], m: usize) -> Vec<u64> {
    let n = bits.len();
    let mut counts = vec![0u64; 1 << m];
    if n == 0 || m == 0 {
        return counts;
    }
    let mask = (1usize << m) - 1;
    let mut window = 0usize;
    for bit in bits.iter().take(m - 1) {
        window = (window << 1) | *bit as usize;
    }
    for i in 0..n {
        let next = bits[(i + m - 1) % n] as usize;
        window = ((window << 1) | next) & mask;
        counts[window] += 1;
    }
    counts
}

fn fft_magnitudes(signal: &[f64]) -> Vec<f64> {
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(signal.len());
    let mut buffer: Vec<Complex<f64>> =
        signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut buffer);
    buffer[..signal.len() / 2].iter().map(|c| c.norm()).collect()
}

/// Rank of a 32x32 bit matrix over GF(2).
fn gf2_rank(rows: &mut [u32; 32]) -> usize {
    let mut rank = 0;
    for col in (0..32).rev() {
        let Some(pivot) = (rank..32).find(|&r| (rows[r] >> col) & 1 == 1) else {
            continue;
        };
        rows.swap(rank, pivot);
        let pivot_row = rows[rank];
        for (r, row) in rows.iter_mut().enumerate() {
            if r != rank && (*row >> col) & 1 == 1 {
                *row ^= pivot_row;
            }
        }
        rank += 1;
        if rank == 32 {
            break;
        }
    }
    rank
}

/// Berlekamp-Massey linear complexity of a binary sequence.
fn berlekamp_massey(seq: &[u8]) -> usize {
    let n = seq.len();
    let mut c = vec![0u8; n];
    let mut b = vec![0u8; n];
    c[0] = 1;
    b[0] = 1;
    let mut l = 0usize;
    let mut m = -1i64;
    for i in 0..n {
        let mut d = seq[i];
        for j in 1..=l.min(i) {
            d ^= c[j] & seq[i - j];
        }
        if d == 1 {
            let t = c.clone();
            let shift = (i as i64 - m) as usize;
            for j in shift..n {
                c[j] ^= b[j - shift];
            }
            if l <= i / 2 {
                l = i + 1 - l;
                m = i as i64;
                b = t;
            }
        }
    }
    l
}

// ═══ frequency tests ═══

fn monobit_frequency(data: &[u8]) -> TestResult {
    let name = "Monobit Frequency";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let ones: i64 = bits.iter().map(|&b| i64::from(b)).sum();
    let s = 2 * ones - n as i64;
    let s_obs = s.abs() as f64 / (n as f64).sqrt();
    let p = erfc(s_obs / 2f64.sqrt());
    TestResult::from_p(name, p, s_obs, format!("S={s}, n={n}"))
}

fn block_frequency(data: &[u8]) -> TestResult {
    let name = "Block Frequency";
    let block_size = 128usize;
    let bits = unpack_bits(data);
    let n = bits.len();
    let num_blocks = n / block_size;
    if num_blocks < 10 {
        return TestResult::insufficient(name, block_size * 10, n);
    }
    let mut chi2 = 0.0;
    for block in bits.chunks_exact(block_size).take(num_blocks) {
        let pi = block.iter().map(|&b| f64::from(b)).sum::<f64>() / block_size as f64;
        chi2 += (pi - 0.5) * (pi - 0.5);
    }
    chi2 *= 4.0 * block_size as f64;
    let p = chi2_sf(chi2, num_blocks as f64);
    TestResult::from_p(
        name,
        p,
        chi2,
        format!("blocks={num_blocks}, M={block_size}"),
    )
}

fn byte_frequency(data: &[u8]) -> TestResult {
    let name = "Byte Frequency";
    let n = data.len();
    if n < 256 {
        return TestResult::insufficient(name, 256, n);
    }
    let mut hist = [0u64; 256];
    for &b in data {
        hist[b as usize] += 1;
    }
    let expected = n as f64 / 256.0;
    let chi2: f64 = hist
        .iter()
        .map(|&c| {
            let d = c as f64 - expected;
            d * d / expected
        })
        .sum();
    let p = chi2_sf(chi2, 255.0);
    TestResult::from_p(
        name,
        p,
        chi2,
        format!("n={n}, expected_per_bin={expected:.1}"),
    )
}

// ═══ runs tests ═══

fn runs_test(data: &[u8]) -> TestResult {
    let name = "Runs Test";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let prop = bits.iter().map(|&b| f64::from(b)).sum::<f64>() / n as f64;
    if (prop - 0.5).abs() >= 2.0 / (n as f64).sqrt() {
        return TestResult::failed(name, &format!("pre-test failed: proportion={prop:.4}"));
    }
    let runs = 1 + bits.windows(2).filter(|w| w[0] != w[1]).count();
    let expected = 2.0 * n as f64 * prop * (1.0 - prop) + 1.0;
    let std = 2.0 * (2.0 * n as f64).sqrt() * prop * (1.0 - prop);
    if std < 1e-10 {
        return TestResult::failed(name, "zero variance");
    }
    let z = (runs as f64 - expected).abs() / std;
    let p = erfc(z / 2f64.sqrt());
    TestResult::from_p(name, p, z, format!("runs={runs}, expected={expected:.0}"))
}

fn longest_run_of_ones(data: &[u8]) -> TestResult {
    let name = "Longest Run of Ones";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 128 {
        return TestResult::insufficient(name, 128, n);
    }
    let block_size = 8usize;
    let num_blocks = n / block_size;
    // Category counts for longest run <=1, 2, 3, >=4 within 8-bit blocks.
    let mut observed = [0f64; 4];
    for block in bits.chunks_exact(block_size).take(num_blocks) {
        let mut longest = 0usize;
        let mut current = 0usize;
        for &bit in block {
            if bit == 1 {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        let category = match longest {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            _ => 3,
        };
        observed[category] += 1.0;
    }
    let probs = [0.2148, 0.3672, 0.2305, 0.1875];
    let mut chi2 = 0.0;
    for (obs, p) in observed.iter().zip(probs.iter()) {
        let expected = p * num_blocks as f64;
        if expected > 0.0 {
            chi2 += (obs - expected) * (obs - expected) / expected;
        }
    }
    let p = chi2_sf(chi2, 3.0);
    TestResult::from_p(name, p, chi2, format!("blocks={num_blocks}, M={block_size}"))
}

// ═══ serial tests ═══

const SERIAL_BIT_CAP: usize = 20_000;

fn serial_test(data: &[u8]) -> TestResult {
    let name = "Serial Test";
    let m = 4usize;
    let mut bits = unpack_bits(data);
    if bits.len() > SERIAL_BIT_CAP {
        bits.truncate(SERIAL_BIT_CAP);
    }
    let n = bits.len();
    if n < (1 << m) + 10 {
        return TestResult::insufficient(name, (1 << m) + 10, n);
    }
    let psi_sq = |m_val: usize| -> f64 {
        if m_val == 0 {
            return 0.0;
        }
        let counts = overlapping_pattern_counts(&bits, m_val);
        let sum_sq: f64 = counts.iter().map(|&c| (c as f64) * (c as f64)).sum();
        sum_sq * (1u64 << m_val) as f64 / n as f64 - n as f64
    };
    let delta1 = psi_sq(m) - psi_sq(m - 1);
    let p = chi2_sf(delta1, (1u64 << (m - 1)) as f64);
    TestResult::from_p(name, p, delta1, format!("m={m}, n_bits={n}"))
}

fn approximate_entropy(data: &[u8]) -> TestResult {
    let name = "Approximate Entropy";
    let m = 3usize;
    let mut bits = unpack_bits(data);
    if bits.len() > SERIAL_BIT_CAP {
        bits.truncate(SERIAL_BIT_CAP);
    }
    let n = bits.len();
    if n < 64 {
        return TestResult::insufficient(name, 64, n);
    }
    let phi = |block_len: usize| -> f64 {
        let counts = overlapping_pattern_counts(&bits, block_len);
        counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let prob = c as f64 / n as f64;
                prob * prob.log2()
            })
            .sum()
    };
    let apen = phi(m) - phi(m + 1);
    let chi2 = 2.0 * n as f64 * (1.0 - apen);
    let p = chi2_sf(chi2, (1u64 << m) as f64);
    TestResult::from_p(name, p, chi2, format!("ApEn={apen:.6}, m={m}"))
}

// ═══ spectral tests ═══

fn dft_spectral(data: &[u8]) -> TestResult {
    let name = "DFT Spectral";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 64 {
        return TestResult::insufficient(name, 64, n);
    }
    let signal: Vec<f64> = bits.iter().map(|&b| f64::from(b) * 2.0 - 1.0).collect();
    let magnitudes = fft_magnitudes(&signal);
    let threshold = (2.995732274 * n as f64).sqrt();
    let n0 = 0.95 * n as f64 / 2.0;
    let n1 = magnitudes.iter().filter(|&&m| m < threshold).count() as f64;
    let d = (n1 - n0) / (n as f64 * 0.95 * 0.05 / 4.0).sqrt();
    let p = erfc(d.abs() / 2f64.sqrt());
    TestResult::from_p(
        name,
        p,
        d,
        format!("peaks_below_threshold={}/{}", n1 as u64, n / 2),
    )
}

fn spectral_flatness(data: &[u8]) -> TestResult {
    let name = "Spectral Flatness";
    let n = data.len();
    if n < 64 {
        return TestResult::insufficient(name, 64, n);
    }
    let signal = as_f64(data);
    // The DC bin carries the sample mean, not noise shape; skip it.
    let power: Vec<f64> = fft_magnitudes(&signal)
        .iter()
        .skip(1)
        .map(|&m| m * m + 1e-15)
        .collect();
    let arith_mean = mean(&power);
    if arith_mean <= 1e-9 {
        return TestResult::graded(name, false, Grade::F, 0.0, "zero variance".into());
    }
    let geo_mean = (power.iter().map(|&s| s.ln()).sum::<f64>() / power.len() as f64).exp();
    let flatness = geo_mean / arith_mean;
    let grade = if flatness > 0.8 {
        Grade::A
    } else if flatness > 0.6 {
        Grade::B
    } else if flatness > 0.4 {
        Grade::C
    } else if flatness > 0.2 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        flatness > 0.5,
        grade,
        flatness,
        format!("flatness={flatness:.4} (1.0=white noise)"),
    )
}

// ═══ entropy tests ═══

fn shannon_entropy_test(data: &[u8]) -> TestResult {
    let name = "Shannon Entropy";
    let n = data.len();
    if n < 16 {
        return TestResult::insufficient(name, 16, n);
    }
    let h = crate::quality::quick_shannon(data);
    let ratio = h / 8.0;
    let grade = if ratio > 0.95 {
        Grade::A
    } else if ratio > 0.85 {
        Grade::B
    } else if ratio > 0.7 {
        Grade::C
    } else if ratio > 0.5 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        ratio > 0.85,
        grade,
        h,
        format!("{h:.4} / 8.0 bits ({:.1}%)", ratio * 100.0),
    )
}

fn min_entropy_test(data: &[u8]) -> TestResult {
    let name = "Min-Entropy";
    let n = data.len();
    if n < 16 {
        return TestResult::insufficient(name, 16, n);
    }
    let h_min = crate::quality::quick_min_entropy(data);
    let ratio = h_min / 8.0;
    let grade = if ratio > 0.9 {
        Grade::A
    } else if ratio > 0.75 {
        Grade::B
    } else if ratio > 0.5 {
        Grade::C
    } else if ratio > 0.25 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        ratio > 0.7,
        grade,
        h_min,
        format!("{h_min:.4} / 8.0 bits ({:.1}%)", ratio * 100.0),
    )
}

fn permutation_entropy_test(data: &[u8]) -> TestResult {
    let name = "Permutation Entropy";
    let order = 4usize;
    let n = data.len();
    if n < order + 10 {
        return TestResult::insufficient(name, order + 10, n);
    }
    let values = as_f64(data);
    let mut patterns: HashMap<[u8; 4], u64> = HashMap::new();
    for window in values.windows(order) {
        let mut idx = [0u8, 1, 2, 3];
        // Stable argsort by (value, index) settles ties deterministically.
        idx.sort_by(|&a, &b| {
            window[a as usize]
                .partial_cmp(&window[b as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        *patterns.entry(idx).or_insert(0) += 1;
    }
    let total: u64 = patterns.values().sum();
    let h: f64 = patterns
        .values()
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.log2()
        })
        .sum();
    let h_max = 24f64.log2(); // log2(4!)
    let normalized = if h_max > 0.0 { h / h_max } else { 0.0 };
    let grade = if normalized > 0.95 {
        Grade::A
    } else if normalized > 0.85 {
        Grade::B
    } else if normalized > 0.7 {
        Grade::C
    } else if normalized > 0.5 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        normalized > 0.85,
        grade,
        normalized,
        format!("PE={h:.4}/{h_max:.4} = {normalized:.4}"),
    )
}

fn compression_ratio_test(data: &[u8]) -> TestResult {
    let name = "Compression Ratio";
    let n = data.len();
    if n < 32 {
        return TestResult::insufficient(name, 32, n);
    }
    let compressed = deflate_len(data, 9);
    let ratio = compressed as f64 / n as f64;
    let grade = if ratio > 0.95 {
        Grade::A
    } else if ratio > 0.85 {
        Grade::B
    } else if ratio > 0.7 {
        Grade::C
    } else if ratio > 0.5 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        ratio > 0.85,
        grade,
        ratio,
        format!("{compressed}/{n} = {ratio:.4}"),
    )
}

fn kolmogorov_complexity_test(data: &[u8]) -> TestResult {
    let name = "Kolmogorov Complexity";
    let n = data.len();
    if n < 32 {
        return TestResult::insufficient(name, 32, n);
    }
    let c1 = deflate_len(data, 1);
    let c9 = deflate_len(data, 9);
    let complexity = c9 as f64 / n as f64;
    let spread = (c1 as f64 - c9 as f64) / n as f64;
    let grade = if complexity > 0.95 {
        Grade::A
    } else if complexity > 0.85 {
        Grade::B
    } else if complexity > 0.7 {
        Grade::C
    } else if complexity > 0.5 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        complexity > 0.85,
        grade,
        complexity,
        format!("K~{complexity:.4}, spread={spread:.4}"),
    )
}

// ═══ correlation tests ═══

fn autocorrelation_test(data: &[u8]) -> TestResult {
    let name = "Autocorrelation";
    let max_lag = 50usize;
    let n = data.len();
    if n < max_lag + 10 {
        return TestResult::insufficient(name, max_lag + 10, n);
    }
    let values = as_f64(data);
    let m = mean(&values);
    let var = variance(&values);
    if var < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 1.0, "zero variance".into());
    }
    let threshold = 2.0 / (n as f64).sqrt();
    let mut max_corr: f64 = 0.0;
    let mut violations = 0u64;
    for lag in 1..=max_lag.min(n - 1) {
        let c = lag_correlation(&values, lag, m, var);
        max_corr = max_corr.max(c.abs());
        if c.abs() > threshold {
            violations += 1;
        }
    }
    // ~5% of lags breach the 95% band by chance; more indicates structure.
    let expected_violations = 0.05 * max_lag as f64;
    let p = poisson_sf(violations, expected_violations.max(1.0));
    TestResult::from_p(
        name,
        p,
        max_corr,
        format!("violations={violations}/{max_lag}, max|r|={max_corr:.4}"),
    )
}

fn serial_correlation_test(data: &[u8]) -> TestResult {
    let name = "Serial Correlation";
    let n = data.len();
    if n < 20 {
        return TestResult::insufficient(name, 20, n);
    }
    let values = as_f64(data);
    let m = mean(&values);
    let var = variance(&values);
    if var < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 1.0, "zero variance".into());
    }
    let r = lag_correlation(&values, 1, m, var);
    let z = r * (n as f64).sqrt();
    let p = normal_two_sided_p(z);
    TestResult::from_p(name, p, r.abs(), format!("r={r:.6}, z={z:.4}"))
}

fn lag_n_correlation(data: &[u8]) -> TestResult {
    let name = "Lag-N Correlation";
    let lags = [1usize, 2, 4, 8, 16, 32];
    let n = data.len();
    if n < 32 + 10 {
        return TestResult::insufficient(name, 42, n);
    }
    let values = as_f64(data);
    let m = mean(&values);
    let var = variance(&values);
    if var < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 1.0, "zero variance".into());
    }
    let mut max_corr: f64 = 0.0;
    let mut parts = Vec::new();
    for &lag in &lags {
        if lag >= n {
            continue;
        }
        let c = lag_correlation(&values, lag, m, var);
        max_corr = max_corr.max(c.abs());
        parts.push(format!("lag{lag}={c:.4}"));
    }
    let threshold = 2.0 / (n as f64).sqrt();
    let grade = if max_corr < threshold * 0.5 {
        Grade::A
    } else if max_corr < threshold {
        Grade::B
    } else if max_corr < threshold * 2.0 {
        Grade::C
    } else if max_corr < threshold * 4.0 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(name, max_corr < threshold, grade, max_corr, parts.join(", "))
}

fn cross_correlation_test(data: &[u8]) -> TestResult {
    let name = "Cross-Correlation";
    let n = data.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let even: Vec<f64> = data.iter().step_by(2).map(|&b| f64::from(b)).collect();
    let odd: Vec<f64> = data.iter().skip(1).step_by(2).map(|&b| f64::from(b)).collect();
    let len = even.len().min(odd.len());
    let (even, odd) = (&even[..len], &odd[..len]);

    let (mx, my) = (mean(even), mean(odd));
    let (vx, vy) = (variance(even), variance(odd));
    if vx < 1e-10 || vy < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 1.0, "zero variance".into());
    }
    let cov: f64 = even
        .iter()
        .zip(odd.iter())
        .map(|(&x, &y)| (x - mx) * (y - my))
        .sum::<f64>()
        / len as f64;
    let r = cov / (vx.sqrt() * vy.sqrt());

    let df = len as f64 - 2.0;
    let p = if (1.0 - r * r) < 1e-12 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        students_t_two_sided_p(t, df)
    };
    TestResult::from_p(name, p, r.abs(), format!("r={r:.6} (even vs odd bytes)"))
}

// ═══ distribution tests ═══

fn ks_test(data: &[u8]) -> TestResult {
    let name = "Kolmogorov-Smirnov";
    let n = data.len();
    if n < 50 {
        return TestResult::insufficient(name, 50, n);
    }
    let mut normalized: Vec<f64> = data.iter().map(|&b| f64::from(b) / 255.0).collect();
    normalized.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let nf = n as f64;
    let mut d_stat: f64 = 0.0;
    for (i, &x) in normalized.iter().enumerate() {
        let upper = (i as f64 + 1.0) / nf - x;
        let lower = x - i as f64 / nf;
        d_stat = d_stat.max(upper.max(lower));
    }
    // Asymptotic Kolmogorov distribution with small-sample correction.
    let sqrt_n = nf.sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d_stat;
    let mut sum = 0.0;
    for k in 1..=100u32 {
        let term = (-2.0 * f64::from(k * k) * lambda * lambda).exp();
        sum += if k % 2 == 1 { term } else { -term };
    }
    let p = (2.0 * sum).clamp(0.0, 1.0);
    TestResult::from_p(name, p, d_stat, format!("D={d_stat:.6}, n={n}"))
}

/// Anderson-Darling critical values for the normal case at significance
/// levels 15%, 10%, 5%, 2.5% and 1%.
const AD_CRITICAL: [f64; 5] = [0.576, 0.656, 0.787, 0.918, 1.092];

fn anderson_darling_test(data: &[u8]) -> TestResult {
    let name = "Anderson-Darling";
    let n = data.len();
    if n < 50 {
        return TestResult::insufficient(name, 50, n);
    }
    // Tiny deterministic ramp breaks ties without disturbing the shape.
    let mut values: Vec<f64> = data
        .iter()
        .enumerate()
        .map(|(i, &b)| f64::from(b) / 255.0 + i as f64 * 1e-12)
        .collect();
    let m = mean(&values);
    let sd = variance(&values).sqrt();
    if sd < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 0.0, "zero variance".into());
    }
    for v in values.iter_mut() {
        *v = (*v - m) / sd;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let nf = n as f64;
    let mut acc = 0.0;
    for i in 0..n {
        let phi_lo = normal_cdf(values[i]).clamp(1e-300, 1.0 - 1e-16);
        let phi_hi = normal_cdf(values[n - 1 - i]).clamp(1e-300, 1.0 - 1e-16);
        acc += (2.0 * i as f64 + 1.0) * (phi_lo.ln() + (1.0 - phi_hi).ln());
    }
    let a2 = -nf - acc / nf;
    // Small-sample adjustment for estimated mean and variance.
    let a2_star = a2 * (1.0 + 0.75 / nf + 2.25 / (nf * nf));

    let grade = if a2_star < AD_CRITICAL[0] {
        Grade::A
    } else if a2_star < AD_CRITICAL[1] {
        Grade::B
    } else if a2_star < AD_CRITICAL[2] {
        Grade::C
    } else if a2_star < AD_CRITICAL[3] {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        a2_star < AD_CRITICAL[2],
        grade,
        a2_star,
        format!("A2={a2_star:.4}, 5%critical={:.3}", AD_CRITICAL[2]),
    )
}

// ═══ pattern tests ═══

fn overlapping_template(data: &[u8]) -> TestResult {
    let name = "Overlapping Template";
    let template = [1u8, 1, 1, 1];
    let bits = unpack_bits(data);
    let n = bits.len();
    let m = template.len();
    if n < 1000 {
        return TestResult::insufficient(name, 1000, n);
    }
    let count = bits.windows(m).filter(|w| *w == template).count() as f64;
    let positions = (n - m + 1) as f64;
    let expected = positions / 16.0;
    let std = (expected * (1.0 - 1.0 / 16.0)).sqrt();
    if std < 1e-10 {
        return TestResult::graded(name, false, Grade::F, 0.0, "zero std".into());
    }
    let z = (count - expected) / std;
    let p = normal_two_sided_p(z);
    TestResult::from_p(
        name,
        p,
        z.abs(),
        format!("count={}, expected={expected:.0}", count as u64),
    )
}

fn non_overlapping_template(data: &[u8]) -> TestResult {
    let name = "Non-overlapping Template";
    let template = [0u8, 0, 1, 1];
    let bits = unpack_bits(data);
    let n = bits.len();
    let m = template.len();
    if n < 1000 {
        return TestResult::insufficient(name, 1000, n);
    }
    let mut count = 0f64;
    let mut i = 0usize;
    while i + m <= n {
        if bits[i..i + m] == template {
            count += 1.0;
            i += m;
        } else {
            i += 1;
        }
    }
    let expected = n as f64 / 16.0;
    let var = n as f64 * (1.0 / 16.0 - 7.0 / 256.0);
    let z = (count - expected) / var.max(1.0).sqrt();
    let p = normal_two_sided_p(z);
    TestResult::from_p(
        name,
        p,
        z.abs(),
        format!("count={}, expected={expected:.0}", count as u64),
    )
}

fn maurers_universal(data: &[u8]) -> TestResult {
    let name = "Maurer's Universal";
    let (l, q) = (6usize, 640usize);
    let bits = unpack_bits(data);
    let n_bits = bits.len();
    let total_blocks = n_bits / l;
    if total_blocks <= q || total_blocks - q < 100 {
        return TestResult::insufficient(name, (q + 100) * l / 8, data.len());
    }
    let k = total_blocks - q;

    let block_at = |i: usize| -> usize {
        let mut value = 0usize;
        for j in 0..l {
            value = (value << 1) | bits[i * l + j] as usize;
        }
        value
    };

    let mut table = vec![0usize; 1 << l];
    for i in 0..q {
        table[block_at(i)] = i + 1;
    }
    let mut total = 0.0;
    for i in q..q + k {
        let block = block_at(i);
        let distance = if table[block] > 0 {
            i + 1 - table[block]
        } else {
            i + 1
        };
        total += (distance as f64).log2();
        table[block] = i + 1;
    }
    let fn_stat = total / k as f64;
    // Expected value and variance for L=6.
    let expected = 5.2177052;
    let sigma = (2.954 / k as f64).sqrt();
    let z = (fn_stat - expected).abs() / sigma.max(1e-10);
    let p = erfc(z / 2f64.sqrt());
    TestResult::from_p(
        name,
        p,
        fn_stat,
        format!("fn={fn_stat:.4}, expected={expected:.4}, L={l}"),
    )
}

// ═══ advanced tests ═══

fn binary_matrix_rank(data: &[u8]) -> TestResult {
    let name = "Binary Matrix Rank";
    let bits = unpack_bits(data);
    let n = bits.len();
    let matrix_bits = 32 * 32;
    let num_matrices = n / matrix_bits;
    if num_matrices < 38 {
        return TestResult::insufficient(name, 38 * matrix_bits / 8, data.len());
    }
    let mut full_rank = 0f64;
    let mut rank_minus_one = 0f64;
    for block in 0..num_matrices {
        let offset = block * matrix_bits;
        let mut rows = [0u32; 32];
        for (r, row) in rows.iter_mut().enumerate() {
            let mut value = 0u32;
            for c in 0..32 {
                value = (value << 1) | u32::from(bits[offset + r * 32 + c]);
            }
            *row = value;
        }
        match gf2_rank(&mut rows) {
            32 => full_rank += 1.0,
            31 => rank_minus_one += 1.0,
            _ => {}
        }
    }
    let rest = num_matrices as f64 - full_rank - rank_minus_one;
    let nf = num_matrices as f64;
    // Asymptotic probabilities for full rank, rank-1 and the remainder.
    let (p_full, p_m1, p_rest) = (0.2888, 0.5776, 0.1336);
    let chi2 = (full_rank - nf * p_full).powi(2) / (nf * p_full)
        + (rank_minus_one - nf * p_m1).powi(2) / (nf * p_m1)
        + (rest - nf * p_rest).powi(2) / (nf * p_rest);
    let p = chi2_sf(chi2, 2.0);
    TestResult::from_p(
        name,
        p,
        chi2,
        format!(
            "N={num_matrices}, full={}, full-1={}",
            full_rank as u64, rank_minus_one as u64
        ),
    )
}

fn linear_complexity(data: &[u8]) -> TestResult {
    let name = "Linear Complexity";
    let block_size = 200usize;
    let bits = unpack_bits(data);
    let n = bits.len();
    let num_blocks = n / block_size;
    if num_blocks < 6 {
        return TestResult::insufficient(name, 6 * block_size / 8, data.len());
    }

    let mf = block_size as f64;
    // Sign term is +1 for even block sizes.
    let mu = mf / 2.0 + (9.0 - 1.0) / 36.0 - (mf / 3.0 + 2.0 / 9.0) / 2f64.powf(mf);

    let mut observed = [0f64; 7];
    let mut complexity_sum = 0f64;
    for i in 0..num_blocks {
        let block = &bits[i * block_size..(i + 1) * block_size];
        let l = berlekamp_massey(block) as f64;
        complexity_sum += l;
        let t = l - mu + 2.0 / 9.0;
        let bin = if t <= -2.5 {
            0
        } else if t <= -1.5 {
            1
        } else if t <= -0.5 {
            2
        } else if t <= 0.5 {
            3
        } else if t <= 1.5 {
            4
        } else if t <= 2.5 {
            5
        } else {
            6
        };
        observed[bin] += 1.0;
    }
    // Asymptotic bin probabilities for the T statistic.
    let probs = [0.010417, 0.03125, 0.125, 0.5, 0.25, 0.0625, 0.020833];
    let nf = num_blocks as f64;
    let mut chi2 = 0.0;
    for (obs, prob) in observed.iter().zip(probs.iter()) {
        let expected = prob * nf;
        if expected > 0.0 {
            chi2 += (obs - expected) * (obs - expected) / expected;
        }
    }
    let p = chi2_sf(chi2, 6.0);
    TestResult::from_p(
        name,
        p,
        chi2,
        format!(
            "N={num_blocks}, mean_complexity={:.1}",
            complexity_sum / nf
        ),
    )
}

fn cusum_test(data: &[u8]) -> TestResult {
    let name = "Cumulative Sums";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let mut running = 0i64;
    let mut z_max = 0i64;
    for &bit in &bits {
        running += if bit == 1 { 1 } else { -1 };
        z_max = z_max.max(running.abs());
    }
    let z = z_max as f64;
    let nf = n as f64;
    let sqrt_n = nf.sqrt();

    let k_start = ((-nf / z + 1.0) / 4.0) as i64;
    let k_end = ((nf / z - 1.0) / 4.0) as i64 + 1;
    let mut acc = 0.0;
    for k in k_start..=k_end {
        let kf = k as f64;
        acc += normal_cdf((4.0 * kf + 1.0) * z / sqrt_n)
            - normal_cdf((4.0 * kf - 1.0) * z / sqrt_n);
    }
    let p = (1.0 - acc).clamp(0.0, 1.0);
    TestResult::from_p(name, p, z, format!("max|S|={z:.0}, n={n}"))
}

fn random_excursions_test(data: &[u8]) -> TestResult {
    let name = "Random Excursions";
    let bits = unpack_bits(data);
    let n = bits.len();
    if n < 1000 {
        return TestResult::insufficient(name, 1000, n);
    }
    // Zero crossings of the +-1 random walk delimit cycles.
    let mut running = 0i64;
    let mut cycles = 0u64;
    for &bit in &bits {
        running += if bit == 1 { 1 } else { -1 };
        if running == 0 {
            cycles += 1;
        }
    }
    if running != 0 {
        // The unfinished excursion closes at the appended endpoint.
        cycles += 1;
    }
    if cycles < 500 {
        return TestResult::graded(
            name,
            true,
            Grade::B,
            cycles as f64,
            format!("only {cycles} cycles (need 500 for a reliable verdict)"),
        );
    }
    let expected = n as f64 / (2.0 * std::f64::consts::PI * n as f64).sqrt();
    let ratio = cycles as f64 / expected.max(1.0);
    let passed = ratio > 0.5 && ratio < 2.0;
    let grade = if ratio > 0.8 && ratio < 1.2 {
        Grade::A
    } else if ratio > 0.6 && ratio < 1.5 {
        Grade::B
    } else if passed {
        Grade::C
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        passed,
        grade,
        cycles as f64,
        format!("cycles={cycles}, expected~{expected:.0}"),
    )
}

fn birthday_spacing_test(data: &[u8]) -> TestResult {
    let name = "Birthday Spacing";
    let n = data.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let mut values: Vec<u64> = if n < 200 {
        data.iter().map(|&b| u64::from(b)).collect()
    } else {
        let half = n / 2;
        (0..half)
            .map(|i| u64::from(data[2 * i]) * 256 + u64::from(data[2 * i + 1]))
            .collect()
    };
    values.sort_unstable();
    let mut spacings: Vec<u64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    spacings.sort_unstable();
    let duplicates = spacings.windows(2).filter(|w| w[0] == w[1]).count() as u64;

    let m = values.len() as f64;
    let domain = (values.last().copied().unwrap_or(0) + 1) as f64;
    let lambda = (m * m * m / (4.0 * domain)).max(0.01);
    let p_tail = poisson_sf(duplicates, lambda);
    let p = p_tail.max(1.0 - p_tail);
    TestResult::from_p(
        name,
        p,
        duplicates as f64,
        format!("duplicates={duplicates}, lambda={lambda:.2}, m={}", m as u64),
    )
}

// ═══ practical tests ═══

fn bit_avalanche_test(data: &[u8]) -> TestResult {
    let name = "Bit Avalanche";
    let n = data.len();
    if n < 100 {
        return TestResult::insufficient(name, 100, n);
    }
    let diffs: Vec<f64> = data
        .windows(2)
        .map(|w| f64::from((w[0] ^ w[1]).count_ones()))
        .collect();
    let mean_diff = mean(&diffs);
    // Binomial(8, 0.5): mean 4, stddev sqrt(2).
    let z = (mean_diff - 4.0).abs() / (2f64.sqrt() / (diffs.len() as f64).sqrt());
    let p = normal_two_sided_p(z);
    TestResult::from_p(
        name,
        p,
        mean_diff,
        format!("mean_diff={mean_diff:.3}/8 bits, expected=4.0"),
    )
}

fn monte_carlo_pi(data: &[u8]) -> TestResult {
    let name = "Monte Carlo Pi";
    let n = data.len();
    if n < 200 {
        return TestResult::insufficient(name, 200, n);
    }
    let pairs = n / 2;
    let mut inside = 0u64;
    for i in 0..pairs {
        let x = f64::from(data[i]) / 255.0;
        let y = f64::from(data[pairs + i]) / 255.0;
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }
    let pi_est = 4.0 * inside as f64 / pairs as f64;
    let error = (pi_est - std::f64::consts::PI).abs() / std::f64::consts::PI;
    let grade = if error < 0.01 {
        Grade::A
    } else if error < 0.03 {
        Grade::B
    } else if error < 0.1 {
        Grade::C
    } else if error < 0.2 {
        Grade::D
    } else {
        Grade::F
    };
    TestResult::graded(
        name,
        error < 0.05,
        grade,
        pi_est,
        format!("pi~{pi_est:.6}, error={:.4}%", error * 100.0),
    )
}

fn mean_variance_test(data: &[u8]) -> TestResult {
    let name = "Mean & Variance";
    let n = data.len();
    if n < 50 {
        return TestResult::insufficient(name, 50, n);
    }
    let values = as_f64(data);
    let m = mean(&values);
    let var = variance(&values);
    let expected_mean = 127.5;
    let expected_var = (256.0 * 256.0 - 1.0) / 12.0;

    let nf = n as f64;
    let z_mean = (m - expected_mean).abs() / (expected_var / nf).sqrt();
    let p_mean = normal_two_sided_p(z_mean);

    let chi2_var = (nf - 1.0) * var / expected_var;
    let p_var = ChiSquared::new(nf - 1.0)
        .map(|d| {
            let cdf = d.cdf(chi2_var);
            (2.0 * cdf.min(1.0 - cdf)).clamp(0.0, 1.0)
        })
        .unwrap_or(0.0);

    let p = p_mean.min(p_var);
    TestResult::from_p(
        name,
        p,
        z_mean,
        format!("mean={m:.2} (exp 127.5), var={var:.1} (exp {expected_var:.1})"),
    )
}

// ═══ battery driver ═══

type TestFn = fn(&[u8]) -> TestResult;

/// The registered battery, in presentation order.
const BATTERY: &[TestFn] = &[
    // Frequency
    monobit_frequency,
    block_frequency,
    byte_frequency,
    // Runs
    runs_test,
    longest_run_of_ones,
    // Serial
    serial_test,
    approximate_entropy,
    // Spectral
    dft_spectral,
    spectral_flatness,
    // Entropy
    shannon_entropy_test,
    min_entropy_test,
    permutation_entropy_test,
    compression_ratio_test,
    kolmogorov_complexity_test,
    // Correlation
    autocorrelation_test,
    serial_correlation_test,
    lag_n_correlation,
    cross_correlation_test,
    // Distribution
    ks_test,
    anderson_darling_test,
    // Pattern
    overlapping_template,
    non_overlapping_template,
    maurers_universal,
    // Advanced
    binary_matrix_rank,
    linear_complexity,
    cusum_test,
    random_excursions_test,
    birthday_spacing_test,
    // Practical
    bit_avalanche_test,
    monte_carlo_pi,
    mean_variance_test,
];

/// Number of tests in the registered battery.
pub const BATTERY_SIZE: usize = BATTERY.len();

/// Run the complete battery over a byte sample, preserving registration
/// order.
#[must_use]
pub fn run_all_tests(data: &[u8]) -> Vec<TestResult> {
    BATTERY.iter().map(|test| test(data)).collect()
}

/// Overall 0-100 score: grades map to {A:100, B:75, C:50, D:25, F:0} and
/// average across every result, insufficient-data Fs included.
#[must_use]
pub fn calculate_quality_score(results: &[TestResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.grade.numeric()).sum::<f64>() / results.len() as f64
}
