//! Radio sources: WiFi RSSI fluctuations and Bluetooth inventory timing.
//!
//! The WiFi radio is effectively an RF field probe: received signal
//! strength moves with multipath fading, human and object movement,
//! interference and atmospheric effects. Several access paths are tried in
//! order because no single one exists on every platform or OS release;
//! when every path fails mid-sample the source falls back to the timing
//! jitter of the query calls themselves.

use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::capability::{run_probe, HostCapabilities};
use crate::sources::{bound_sample, elapsed_ns, EntropySource, SourceCategory};

/// One signal-strength observation.
#[derive(Debug, Clone, Copy)]
struct RssiReading {
    rssi: i64,
    noise: Option<i64>,
}

/// Extract the first integer following `label` on any line of `text`.
/// Tolerates "RSSI : -54", "signal: -54 dBm" and similar shapes.
fn parse_labeled_int(text: &str, label: &str) -> Option<i64> {
    for line in text.lines() {
        if !line.contains(label) {
            continue;
        }
        let value = line.split(':').nth(1)?.trim();
        let numeric: String = value
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        if let Ok(v) = numeric.parse() {
            return Some(v);
        }
    }
    None
}

/// Linux: `/proc/net/wireless` carries link, level (dBm) and noise columns.
fn read_proc_wireless() -> Option<RssiReading> {
    let body = std::fs::read_to_string("/proc/net/wireless").ok()?;
    for line in body.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let level = fields[3].trim_end_matches('.').parse::<f64>().ok()?;
        let noise = fields[4].trim_end_matches('.').parse::<f64>().ok();
        return Some(RssiReading {
            rssi: level as i64,
            noise: noise.map(|n| n as i64),
        });
    }
    None
}

/// Linux: `iw dev <iface> link` for the first wireless interface.
fn read_iw() -> Option<RssiReading> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        if !entry.path().join("wireless").exists() {
            continue;
        }
        let iface = entry.file_name().to_string_lossy().to_string();
        let out = run_probe("iw", &["dev", &iface, "link"], Duration::from_secs(1))?;
        if let Some(rssi) = parse_labeled_int(&out, "signal") {
            return Some(RssiReading { rssi, noise: None });
        }
    }
    None
}

/// macOS: `wdutil info` (modern replacement for the airport utility).
fn read_wdutil() -> Option<RssiReading> {
    let out = run_probe("/usr/bin/wdutil", &["info"], Duration::from_secs(2))?;
    let rssi = parse_labeled_int(&out, "RSSI")?;
    Some(RssiReading {
        rssi,
        noise: parse_labeled_int(&out, "Noise"),
    })
}

/// macOS: the deprecated airport utility, still present on some systems.
fn read_airport() -> Option<RssiReading> {
    let out = run_probe(
        "/System/Library/PrivateFrameworks/Apple80211.framework/Versions/Current/Resources/airport",
        &["-I"],
        Duration::from_secs(2),
    )?;
    let rssi = parse_labeled_int(&out, "agrCtlRSSI")?;
    Some(RssiReading {
        rssi,
        noise: parse_labeled_int(&out, "agrCtlNoise"),
    })
}

type AccessPath = (&'static str, fn() -> Option<RssiReading>);

const ACCESS_PATHS: &[AccessPath] = &[
    ("proc_wireless", read_proc_wireless),
    ("iw", read_iw),
    ("wdutil", read_wdutil),
    ("airport", read_airport),
];

/// Entropy from WiFi RSSI fluctuations.
///
/// Combines four signals per sampling burst: raw RSSI LSBs, RSSI deltas,
/// noise-floor LSBs where the access path reports them, and the timing
/// jitter of the measurement calls.
pub struct WifiRssiSource {
    chosen_path: OnceLock<Option<usize>>,
}

impl WifiRssiSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chosen_path: OnceLock::new(),
        }
    }

    fn path_index(&self) -> Option<usize> {
        *self.chosen_path.get_or_init(|| {
            for (i, (name, read)) in ACCESS_PATHS.iter().enumerate() {
                if read().is_some() {
                    trace!(path = name, "wifi rssi access path selected");
                    return Some(i);
                }
            }
            None
        })
    }
}

impl Default for WifiRssiSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for WifiRssiSource {
    fn name(&self) -> &'static str {
        "wifi_rssi"
    }

    fn description(&self) -> &'static str {
        "WiFi RSSI fluctuations (RF field measurement)"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Hardware
    }

    fn platform_requirements(&self) -> &'static [&'static str] {
        &["wifi"]
    }

    fn estimated_rate_bps(&self) -> f64 {
        30.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "The radio measures the electromagnetic field at 2.4/5/6 GHz. \
             Multipath fading, movement through the RF path and neighbouring \
             transmitters shift the received power between readings.",
        )
    }

    fn is_available(&self, caps: &HostCapabilities) -> bool {
        caps.satisfies("wifi") && self.path_index().is_some()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let reads = n_requested.min(24);
        let mut rssi_values: Vec<i64> = Vec::with_capacity(reads);
        let mut noise_values: Vec<i64> = Vec::new();
        let mut timings: Vec<u64> = Vec::with_capacity(reads);

        for _ in 0..reads {
            let start = Instant::now();
            let reading = match self.path_index() {
                Some(i) => (ACCESS_PATHS[i].1)(),
                None => None,
            };
            timings.push(elapsed_ns(start));
            if let Some(r) = reading {
                rssi_values.push(r.rssi);
                if let Some(n) = r.noise {
                    noise_values.push(n);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut out = Vec::with_capacity(reads * 4);
        for &v in &rssi_values {
            out.push((v as u64 & 0xFF) as u8);
        }
        for pair in rssi_values.windows(2) {
            out.push((pair[1].wrapping_sub(pair[0]) as u64 & 0xFF) as u8);
        }
        for &v in &noise_values {
            out.push((v as u64 & 0xFF) as u8);
        }
        // Measurement-call jitter doubles as the fallback signal when every
        // access path failed mid-sample.
        for &t in &timings {
            out.push((t & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from Bluetooth inventory query timing.
///
/// True BLE advertisement capture needs an event loop and elevated radio
/// access, so this source times the controller inventory path instead:
/// adapter enumeration latency moves with radio activity and controller
/// state.
pub struct BluetoothBleSource;

impl BluetoothBleSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// One inventory probe; the return value itself is discarded, only the
    /// latency matters.
    fn inventory_probe() {
        if cfg!(target_os = "linux") {
            if let Ok(entries) = std::fs::read_dir("/sys/class/bluetooth") {
                for entry in entries.flatten() {
                    let _ = std::fs::read_to_string(entry.path().join("address"));
                    let _ = std::fs::read_to_string(entry.path().join("name"));
                }
            }
        } else if cfg!(target_os = "macos") {
            let _ = run_probe(
                "/usr/sbin/system_profiler",
                &["SPBluetoothDataType"],
                Duration::from_secs(2),
            );
        }
    }
}

impl Default for BluetoothBleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for BluetoothBleSource {
    fn name(&self) -> &'static str {
        "bluetooth_ble"
    }

    fn description(&self) -> &'static str {
        "Bluetooth controller inventory timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Hardware
    }

    fn platform_requirements(&self) -> &'static [&'static str] {
        &["bluetooth"]
    }

    fn estimated_rate_bps(&self) -> f64 {
        50.0
    }

    fn is_available(&self, caps: &HostCapabilities) -> bool {
        if !caps.satisfies("bluetooth") {
            return false;
        }
        if cfg!(target_os = "linux") {
            std::fs::read_dir("/sys/class/bluetooth")
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        } else if cfg!(target_os = "macos") {
            run_probe(
                "/usr/sbin/system_profiler",
                &["SPBluetoothDataType"],
                Duration::from_secs(2),
            )
            .map(|out| out.contains("Bluetooth"))
            .unwrap_or(false)
        } else {
            false
        }
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let probes = n_requested.min(16);
        let mut out = Vec::with_capacity(probes);
        for _ in 0..probes {
            let start = Instant::now();
            Self::inventory_probe();
            out.push((elapsed_ns(start) & 0xFF) as u8);
        }
        bound_sample(out, n_requested)
    }
}
