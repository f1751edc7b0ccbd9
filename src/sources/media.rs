//! Hardware capture sources behind cargo features: microphone ADC thermal
//! noise (`audio`) and camera sensor shot noise (`camera`).
//!
//! Both backends need system libraries that not every build host carries,
//! so they compile only when their feature is enabled; the registry adds
//! them to the catalog conditionally.

#[cfg(feature = "audio")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(feature = "audio")]
use crossbeam_channel::bounded;
#[cfg(feature = "audio")]
use std::time::{Duration, Instant};
#[cfg(any(feature = "audio", feature = "camera"))]
use tracing::trace;

use crate::capability::HostCapabilities;
#[cfg(feature = "camera")]
use crate::sources::bound_sample;
use crate::sources::{EntropySource, SourceCategory};

/// Entropy from microphone ADC thermal noise.
///
/// With no deliberate signal present the ADC still digitises the thermal
/// agitation of electrons in the input impedance (Johnson-Nyquist noise).
/// A short 44.1 kHz mono capture is taken and the low byte of each 16-bit
/// sample emitted.
#[cfg(feature = "audio")]
pub struct AudioThermalSource;

#[cfg(feature = "audio")]
impl AudioThermalSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "audio")]
impl Default for AudioThermalSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "audio")]
impl EntropySource for AudioThermalSource {
    fn name(&self) -> &'static str {
        "audio_thermal"
    }

    fn description(&self) -> &'static str {
        "Microphone ADC thermal noise (Johnson-Nyquist)"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Hardware
    }

    fn platform_requirements(&self) -> &'static [&'static str] {
        &["microphone"]
    }

    fn estimated_rate_bps(&self) -> f64 {
        10_000.0
    }

    fn is_available(&self, caps: &HostCapabilities) -> bool {
        caps.satisfies("microphone") && cpal::default_host().default_input_device().is_some()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            return Vec::new();
        };
        let Ok(config) = device.default_input_config() else {
            return Vec::new();
        };

        let (tx, rx) = bounded::<Vec<u8>>(64);
        let err_fn = |e| trace!(error = %e, "audio stream error");

        let stream = match config.sample_format() {
            cpal::SampleFormat::I16 => {
                let tx = tx.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let bytes: Vec<u8> =
                            data.iter().map(|&s| (s as u16 & 0xFF) as u8).collect();
                        let _ = tx.try_send(bytes);
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::F32 => {
                let tx = tx.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let bytes: Vec<u8> = data
                            .iter()
                            .map(|&s| {
                                let q = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                                (q as u16 & 0xFF) as u8
                            })
                            .collect();
                        let _ = tx.try_send(bytes);
                    },
                    err_fn,
                    None,
                )
            }
            _ => return Vec::new(),
        };
        let Ok(stream) = stream else {
            return Vec::new();
        };
        if stream.play().is_err() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(n_requested);
        let deadline = Instant::now() + Duration::from_secs(3);
        while out.len() < n_requested {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match rx.recv_timeout(remaining) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
        drop(stream);
        out.truncate(n_requested);
        out
    }
}

/// Entropy from camera sensor shot noise.
///
/// Pixel charge accumulates from photon arrivals (a Poisson process) plus
/// thermal dark current. The low nibble of each channel byte of a single
/// frame is dominated by that noise.
#[cfg(feature = "camera")]
pub struct CameraShotNoiseSource;

#[cfg(feature = "camera")]
impl CameraShotNoiseSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn open_camera() -> Option<nokhwa::Camera> {
        use nokhwa::pixel_format::RgbFormat;
        use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};

        let format =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        nokhwa::Camera::new(CameraIndex::Index(0), format).ok()
    }
}

#[cfg(feature = "camera")]
impl Default for CameraShotNoiseSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "camera")]
impl EntropySource for CameraShotNoiseSource {
    fn name(&self) -> &'static str {
        "camera_shot_noise"
    }

    fn description(&self) -> &'static str {
        "Camera sensor photon shot noise and dark current"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Hardware
    }

    fn platform_requirements(&self) -> &'static [&'static str] {
        &["camera"]
    }

    fn estimated_rate_bps(&self) -> f64 {
        50_000.0
    }

    fn is_available(&self, caps: &HostCapabilities) -> bool {
        caps.satisfies("camera") && Self::open_camera().is_some()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let Some(mut camera) = Self::open_camera() else {
            return Vec::new();
        };
        if camera.open_stream().is_err() {
            return Vec::new();
        }
        let Ok(frame) = camera.frame() else {
            trace!("camera frame grab failed");
            return Vec::new();
        };
        let noise: Vec<u8> = frame.buffer().iter().map(|&b| b & 0x0F).collect();
        bound_sample(noise, n_requested)
    }
}
