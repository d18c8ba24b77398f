//! Audio device enumeration and name resolution.
//!
//! Devices are immutable snapshots: re-enumerating replaces the whole set.
//! Name resolution is exact match first, then case-insensitive substring
//! match; `""` and `"default"` select the platform default device.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata about one audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Position in the enumeration order.
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Channel count of the device's default configuration.
    pub channels: u16,
    /// Default sample rate in Hz.
    pub default_sample_rate: u32,
    /// Smallest hardware buffer the host will accept, in frames. Latency is
    /// fixed by the buffer size negotiated when a stream opens, so the
    /// supported buffer range is the latency capability reported here.
    pub min_buffer_size: Option<u32>,
    /// Largest supported hardware buffer, in frames.
    pub max_buffer_size: Option<u32>,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
}

/// The full set of input and output devices visible to the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioDevices {
    pub inputs: Vec<DeviceInfo>,
    pub outputs: Vec<DeviceInfo>,
}

/// `""` and `"default"` (any casing) mean "use the platform default".
pub fn is_default_alias(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("default")
}

/// Case-insensitive substring match used as the fallback after exact match.
pub fn name_matches_loosely(candidate: &str, wanted: &str) -> bool {
    candidate
        .to_ascii_lowercase()
        .contains(&wanted.trim().to_ascii_lowercase())
}

/// Enumerate all input and output devices.
///
/// # Errors
/// Returns `CallError::Device` if the audio host cannot list devices at all.
#[cfg(feature = "audio-cpal")]
pub fn enumerate() -> Result<AudioDevices> {
    use cpal::traits::{DeviceTrait, HostTrait};

    use crate::error::CallError;

    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = AudioDevices::default();

    let inputs = host
        .input_devices()
        .map_err(|e| CallError::Device(e.to_string()))?;
    for (index, device) in inputs.enumerate() {
        let name = device
            .name()
            .unwrap_or_else(|_| format!("Input Device {}", index + 1));
        let (channels, default_sample_rate, buffer_range) = match device.default_input_config() {
            Ok(cfg) => (cfg.channels(), cfg.sample_rate().0, buffer_size_range(&cfg)),
            Err(e) => {
                tracing::warn!(device = name.as_str(), "no default input config: {e}");
                (0, 0, (None, None))
            }
        };
        devices.inputs.push(DeviceInfo {
            index,
            name: name.clone(),
            channels,
            default_sample_rate,
            min_buffer_size: buffer_range.0,
            max_buffer_size: buffer_range.1,
            is_default: default_in.as_deref() == Some(name.as_str()),
        });
    }

    let outputs = host
        .output_devices()
        .map_err(|e| CallError::Device(e.to_string()))?;
    for (index, device) in outputs.enumerate() {
        let name = device
            .name()
            .unwrap_or_else(|_| format!("Output Device {}", index + 1));
        let (channels, default_sample_rate, buffer_range) = match device.default_output_config() {
            Ok(cfg) => (cfg.channels(), cfg.sample_rate().0, buffer_size_range(&cfg)),
            Err(e) => {
                tracing::warn!(device = name.as_str(), "no default output config: {e}");
                (0, 0, (None, None))
            }
        };
        devices.outputs.push(DeviceInfo {
            index,
            name: name.clone(),
            channels,
            default_sample_rate,
            min_buffer_size: buffer_range.0,
            max_buffer_size: buffer_range.1,
            is_default: default_out.as_deref() == Some(name.as_str()),
        });
    }

    Ok(devices)
}

#[cfg(feature = "audio-cpal")]
fn buffer_size_range(config: &cpal::SupportedStreamConfig) -> (Option<u32>, Option<u32>) {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => (Some(*min), Some(*max)),
        cpal::SupportedBufferSize::Unknown => (None, None),
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn enumerate() -> Result<AudioDevices> {
    Ok(AudioDevices::default())
}

/// Resolve an input device by name (exact, then loose, then fail).
#[cfg(feature = "audio-cpal")]
pub fn find_input_device(name: &str) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    use crate::error::CallError;

    let host = cpal::default_host();
    if is_default_alias(name) {
        return host
            .default_input_device()
            .ok_or(CallError::NoDefaultInputDevice);
    }
    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| CallError::Device(e.to_string()))?
        .collect();
    pick_by_name(devices, name)
}

/// Resolve an output device by name (exact, then loose, then fail).
#[cfg(feature = "audio-cpal")]
pub fn find_output_device(name: &str) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    use crate::error::CallError;

    let host = cpal::default_host();
    if is_default_alias(name) {
        return host
            .default_output_device()
            .ok_or(CallError::NoDefaultOutputDevice);
    }
    let devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| CallError::Device(e.to_string()))?
        .collect();
    pick_by_name(devices, name)
}

#[cfg(feature = "audio-cpal")]
fn pick_by_name(mut devices: Vec<cpal::Device>, wanted: &str) -> Result<cpal::Device> {
    use cpal::traits::DeviceTrait;

    use crate::error::CallError;

    let names: Vec<Option<String>> = devices.iter().map(|d| d.name().ok()).collect();

    if let Some(pos) = names.iter().position(|n| n.as_deref() == Some(wanted)) {
        return Ok(devices.swap_remove(pos));
    }
    if let Some(pos) = names.iter().position(|n| {
        n.as_deref()
            .map(|candidate| name_matches_loosely(candidate, wanted))
            .unwrap_or(false)
    }) {
        return Ok(devices.swap_remove(pos));
    }
    Err(CallError::DeviceNotFound(wanted.to_string()))
}
