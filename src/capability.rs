//! # Capability Probe - Host Hardware and Privilege Discovery
//!
//! A small immutable record of host facts used to filter the source
//! registry. The probe answers a fixed vocabulary of capability tokens
//! (`os:linux`, `microphone`, `bluetooth`, ...) that source descriptors
//! declare as platform requirements.
//!
//! Probing is deliberately forgiving: any individual check that fails, times
//! out, or hits a missing utility yields `false` for that capability and
//! never an error. External commands run behind a hard per-command deadline
//! so the whole probe stays within a few seconds even on hostile hosts.

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Per-command deadline for probe subprocesses.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Immutable record of host facts.
///
/// Capability tokens are opaque strings looked up through
/// [`HostCapabilities::satisfies`]; the engine attaches no meaning beyond
/// the boolean answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// Operating system identifier (`linux`, `macos`, `windows`, ...).
    pub os: String,
    /// Machine architecture (`x86_64`, `aarch64`, ...).
    pub machine: String,
    /// CPU or SoC brand string when discoverable.
    pub chip: Option<String>,
    /// Hardware model identifier when discoverable.
    pub model: Option<String>,
    pub has_microphone: bool,
    pub has_camera: bool,
    pub has_bluetooth: bool,
    pub has_wifi: bool,
    pub has_motion_sensors: bool,
    pub has_ambient_light: bool,
    pub has_battery: bool,
    pub has_trackpad: bool,
    pub has_magnetometer: bool,
    pub has_privileged_sensors: bool,
    pub has_smart_cli: bool,
}

impl HostCapabilities {
    /// Probe the current host. Never fails: unknown answers come back as
    /// `false`. Total runtime is bounded by the per-command deadlines.
    #[must_use]
    pub fn probe() -> Self {
        let os = std::env::consts::OS.to_string();
        let machine = std::env::consts::ARCH.to_string();
        let chip = probe_chip();
        let model = probe_model(&os);

        let caps = Self {
            has_microphone: probe_microphone(&os),
            has_camera: probe_camera(&os),
            has_bluetooth: probe_bluetooth(&os),
            has_wifi: probe_wifi(&os),
            has_motion_sensors: probe_iio_sensor(&os, &["accel", "gyro"])
                || probe_darwin_ioreg(&os, &["SMCMotionSensor", "Accelerometer"]),
            has_ambient_light: probe_iio_sensor(&os, &["als", "illuminance"])
                || probe_darwin_ioreg(&os, &["ALSSensor", "AmbientLight"]),
            has_battery: probe_battery(&os),
            has_trackpad: probe_trackpad(&os),
            has_magnetometer: probe_iio_sensor(&os, &["magn"])
                || probe_darwin_ioreg(&os, &["Magnetometer"]),
            has_privileged_sensors: probe_privileged(),
            has_smart_cli: probe_smart_cli(),
            os,
            machine,
            chip,
            model,
        };
        debug!(os = %caps.os, machine = %caps.machine, "capability probe complete");
        caps
    }

    /// Answer one capability token. Unknown tokens are `false`.
    #[must_use]
    pub fn satisfies(&self, token: &str) -> bool {
        match token {
            "os:darwin" => self.os == "macos",
            "os:linux" => self.os == "linux",
            "os:windows" => self.os == "windows",
            "microphone" => self.has_microphone,
            "camera" => self.has_camera,
            "bluetooth" => self.has_bluetooth,
            "wifi" => self.has_wifi,
            "motion_sensors" => self.has_motion_sensors,
            "ambient_light" => self.has_ambient_light,
            "battery" => self.has_battery,
            "trackpad" => self.has_trackpad,
            "magnetometer" => self.has_magnetometer,
            "privileged" => self.has_privileged_sensors,
            "smart_cli" => self.has_smart_cli,
            _ => false,
        }
    }

    /// Answer a conjunction of tokens.
    #[must_use]
    pub fn satisfies_all(&self, tokens: &[&str]) -> bool {
        tokens.iter().all(|t| self.satisfies(t))
    }

    /// A record that claims nothing. Useful as a test fixture and as the
    /// degenerate answer when probing is undesirable.
    #[must_use]
    pub fn none() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            machine: std::env::consts::ARCH.to_string(),
            chip: None,
            model: None,
            has_microphone: false,
            has_camera: false,
            has_bluetooth: false,
            has_wifi: false,
            has_motion_sensors: false,
            has_ambient_light: false,
            has_battery: false,
            has_trackpad: false,
            has_magnetometer: false,
            has_privileged_sensors: false,
            has_smart_cli: false,
        }
    }
}

/// Run a command with a hard deadline, returning captured stdout.
///
/// The child's stdout is drained on a separate thread so large outputs
/// (`sysctl -a` runs past the pipe buffer) cannot wedge the probe; on
/// deadline the child is killed and `None` returned.
pub(crate) fn run_probe(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let mut stdout = child.stdout.take()?;

    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut out = String::new();
        let _ = stdout.read_to_string(&mut out);
        let _ = tx.send(out);
    });

    match rx.recv_timeout(timeout) {
        Ok(out) => {
            let _ = child.wait();
            Some(out)
        }
        Err(_) => {
            trace!(program, "probe command exceeded deadline, killing");
            let _ = child.kill();
            let _ = child.wait();
            None
        }
    }
}

fn probe_output_contains(program: &str, args: &[&str], needles: &[&str]) -> bool {
    run_probe(program, args, PROBE_TIMEOUT)
        .map(|out| needles.iter().any(|n| out.contains(n)))
        .unwrap_or(false)
}

fn dir_non_empty(path: &str) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn probe_chip() -> Option<String> {
    if cfg!(target_os = "linux") {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
        for line in cpuinfo.lines() {
            if line.starts_with("model name") {
                return line.split(':').nth(1).map(|s| s.trim().to_string());
            }
        }
        None
    } else if cfg!(target_os = "macos") {
        run_probe(
            "/usr/sbin/sysctl",
            &["-n", "machdep.cpu.brand_string"],
            PROBE_TIMEOUT,
        )
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    } else {
        None
    }
}

fn probe_model(os: &str) -> Option<String> {
    match os {
        "linux" => std::fs::read_to_string("/sys/devices/virtual/dmi/id/product_name")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        "macos" => run_probe("/usr/sbin/sysctl", &["-n", "hw.model"], PROBE_TIMEOUT)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn probe_microphone(os: &str) -> bool {
    match os {
        "linux" => {
            // Capture devices show up as pcmC*c* nodes under /dev/snd
            std::fs::read_dir("/dev/snd")
                .map(|entries| {
                    entries.flatten().any(|e| {
                        let name = e.file_name().to_string_lossy().to_string();
                        name.starts_with("pcm") && name.ends_with('c')
                    })
                })
                .unwrap_or(false)
        }
        "macos" => probe_output_contains(
            "/usr/sbin/system_profiler",
            &["SPAudioDataType"],
            &["Input", "Microphone"],
        ),
        _ => false,
    }
}

fn probe_camera(os: &str) -> bool {
    match os {
        "linux" => Path::new("/dev/video0").exists(),
        "macos" => probe_output_contains(
            "/usr/sbin/system_profiler",
            &["SPCameraDataType"],
            &["FaceTime", "Camera"],
        ),
        _ => false,
    }
}

fn probe_bluetooth(os: &str) -> bool {
    match os {
        "linux" => dir_non_empty("/sys/class/bluetooth"),
        "macos" => probe_output_contains(
            "/usr/sbin/system_profiler",
            &["SPBluetoothDataType"],
            &["Bluetooth"],
        ),
        _ => false,
    }
}

fn probe_wifi(os: &str) -> bool {
    match os {
        "linux" => {
            if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
                for entry in entries.flatten() {
                    if entry.path().join("wireless").exists() {
                        return true;
                    }
                }
            }
            false
        }
        "macos" => probe_output_contains(
            "/usr/sbin/networksetup",
            &["-listallhardwareports"],
            &["Wi-Fi"],
        ),
        _ => false,
    }
}

/// Scan Linux IIO device names for a substring match.
fn probe_iio_sensor(os: &str, needles: &[&str]) -> bool {
    if os != "linux" {
        return false;
    }
    let Ok(entries) = std::fs::read_dir("/sys/bus/iio/devices") else {
        return false;
    };
    for entry in entries.flatten() {
        if let Ok(name) = std::fs::read_to_string(entry.path().join("name")) {
            let name = name.to_lowercase();
            if needles.iter().any(|n| name.contains(n)) {
                return true;
            }
        }
    }
    false
}

fn probe_darwin_ioreg(os: &str, needles: &[&str]) -> bool {
    if os != "macos" {
        return false;
    }
    probe_output_contains("/usr/sbin/ioreg", &["-l", "-w0"], needles)
}

fn probe_battery(os: &str) -> bool {
    match os {
        "linux" => std::fs::read_dir("/sys/class/power_supply")
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().starts_with("BAT"))
            })
            .unwrap_or(false),
        "macos" => probe_output_contains("/usr/bin/pmset", &["-g", "batt"], &["InternalBattery"]),
        _ => false,
    }
}

fn probe_trackpad(os: &str) -> bool {
    match os {
        "linux" => std::fs::read_to_string("/proc/bus/input/devices")
            .map(|s| s.contains("Touchpad") || s.contains("Trackpad"))
            .unwrap_or(false),
        "macos" => probe_output_contains(
            "/usr/sbin/system_profiler",
            &["SPUSBDataType"],
            &["Trackpad"],
        ),
        _ => false,
    }
}

fn probe_privileged() -> bool {
    #[cfg(unix)]
    {
        // Root can read privileged sensor interfaces directly.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn probe_smart_cli() -> bool {
    ["/usr/sbin/smartctl", "/usr/bin/smartctl", "/usr/local/sbin/smartctl"]
        .iter()
        .any(|p| Path::new(p).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn probe_is_bounded_and_never_panics() {
        let start = Instant::now();
        let caps = HostCapabilities::probe();
        assert!(start.elapsed() < Duration::from_secs(6));
        assert!(!caps.os.is_empty());
        assert!(!caps.machine.is_empty());
    }

    #[test]
    fn token_lookup_matches_fields() {
        let mut caps = HostCapabilities::none();
        caps.has_wifi = true;
        caps.has_battery = true;
        assert!(caps.satisfies("wifi"));
        assert!(caps.satisfies("battery"));
        assert!(!caps.satisfies("bluetooth"));
        assert!(!caps.satisfies("no-such-token"));
        assert!(caps.satisfies_all(&["wifi", "battery"]));
        assert!(!caps.satisfies_all(&["wifi", "camera"]));
    }

    #[test]
    fn os_tokens_map_to_target_names() {
        let caps = HostCapabilities::none();
        let expected = match std::env::consts::OS {
            "linux" => "os:linux",
            "macos" => "os:darwin",
            "windows" => "os:windows",
            _ => return,
        };
        assert!(caps.satisfies(expected));
    }

    #[test]
    fn probe_deadline_kills_stuck_commands() {
        #[cfg(unix)]
        {
            let start = Instant::now();
            let out = run_probe("/bin/sleep", &["30"], Duration::from_millis(200));
            assert!(out.is_none());
            assert!(start.elapsed() < Duration::from_secs(2));
        }
    }

    #[test]
    fn capabilities_serialize() {
        let caps = HostCapabilities::none();
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains("\"os\""));
    }
}
