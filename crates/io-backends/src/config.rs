use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Device name meaning "no device for this direction".
pub const NO_DEVICE: &str = "None";

/// Backend settings. Every field has a default so partial JSON documents are
/// accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub input_device: String,
    pub output_device: String,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub periods: u32,
    /// Requested capture channels, 0 for all the device offers.
    pub input_channels: u32,
    /// Requested playback channels, 0 for all the device offers.
    pub output_channels: u32,
    pub systemic_input_latency: u32,
    pub systemic_output_latency: u32,
    pub midi_option: String,
    pub disabled_midi_devices: Vec<String>,
    pub xrun_bailout_seconds: f32,
    pub realtime_priority: Option<i32>,
    pub lock_memory: bool,
    pub reservation_helper: Option<PathBuf>,
    pub reservation_timeout_ms: u64,
    pub dll_bandwidth: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            input_device: String::new(),
            output_device: String::new(),
            sample_rate: 48_000,
            buffer_size: 256,
            periods: 2,
            input_channels: 0,
            output_channels: 0,
            systemic_input_latency: 0,
            systemic_output_latency: 0,
            midi_option: NO_DEVICE.to_string(),
            disabled_midi_devices: Vec::new(),
            xrun_bailout_seconds: 5.0,
            realtime_priority: Some(70),
            lock_memory: true,
            reservation_helper: None,
            reservation_timeout_ms: 500,
            dll_bandwidth: engine_rt::DEFAULT_DLL_BANDWIDTH,
        }
    }
}

impl BackendConfig {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&text)?)
    }

    /// Sets both directions to the same device.
    pub fn set_device_name(&mut self, name: &str) {
        self.input_device = name.to_string();
        self.output_device = name.to_string();
    }

    pub fn has_device(&self) -> bool {
        is_device(&self.input_device) || is_device(&self.output_device)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BackendError::InvalidConfiguration(
                "sample rate must be positive".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(BackendError::InvalidConfiguration(
                "buffer size must be positive".into(),
            ));
        }
        if self.periods == 0 {
            return Err(BackendError::InvalidConfiguration(
                "at least one period per cycle is required".into(),
            ));
        }
        if !self.xrun_bailout_seconds.is_finite() || self.xrun_bailout_seconds <= 0.0 {
            return Err(BackendError::InvalidConfiguration(
                "xrun bailout must be a positive number of seconds".into(),
            ));
        }
        Ok(())
    }

    /// Consecutive xruns tolerated before the loop gives up.
    pub fn xrun_bailout_cycles(&self, sample_rate: u32, buffer_size: u32) -> u32 {
        let cycles = f64::from(self.xrun_bailout_seconds) * f64::from(sample_rate)
            / f64::from(buffer_size.max(1));
        cycles.ceil().max(1.0) as u32
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn is_midi_device_enabled(&self, name: &str) -> bool {
        !self.disabled_midi_devices.iter().any(|device| device == name)
    }

    pub fn set_midi_device_enabled(&mut self, name: &str, enabled: bool) {
        self.disabled_midi_devices.retain(|device| device != name);
        if !enabled {
            self.disabled_midi_devices.push(name.to_string());
        }
    }
}

pub(crate) fn is_device(name: &str) -> bool {
    !name.is_empty() && name != NO_DEVICE
}

/// Longest time the process thread blocks on the device: two periods,
/// capped at 100 ms.
pub(crate) fn device_wait_timeout(sample_rate: u32, buffer_size: u32) -> Duration {
    let nanos = 2 * u64::from(buffer_size) * 1_000_000_000 / u64::from(sample_rate.max(1));
    Duration::from_nanos(nanos).min(Duration::from_millis(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BackendConfig::default();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.buffer_size, 256);
        assert_eq!(config.periods, 2);
        assert_eq!(config.xrun_bailout_seconds, 5.0);
        assert_eq!(config.reservation_timeout(), Duration::from_millis(500));
        assert!(!config.has_device());
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            BackendConfig::from_json_str(r#"{ "input_device": "hw:1", "buffer_size": 128 }"#)
                .unwrap();
        assert_eq!(config.input_device, "hw:1");
        assert_eq!(config.buffer_size, 128);
        assert_eq!(config.sample_rate, 48_000);
        assert!(config.has_device());
    }

    #[test]
    fn bailout_scales_with_period() {
        let config = BackendConfig::default();
        assert_eq!(config.xrun_bailout_cycles(48_000, 256), 938);
        let short = BackendConfig {
            xrun_bailout_seconds: 0.01,
            ..BackendConfig::default()
        };
        assert_eq!(short.xrun_bailout_cycles(48_000, 256), 2);
    }

    #[test]
    fn wait_timeout_is_capped() {
        assert_eq!(
            device_wait_timeout(48_000, 240),
            Duration::from_millis(10)
        );
        assert_eq!(device_wait_timeout(8_000, 8_192), Duration::from_millis(100));
    }

    #[test]
    fn rejects_nonsense() {
        let config = BackendConfig {
            buffer_size: 0,
            ..BackendConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BackendError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn midi_devices_toggle() {
        let mut config = BackendConfig::default();
        config.set_midi_device_enabled("Keys", false);
        config.set_midi_device_enabled("Keys", false);
        assert_eq!(config.disabled_midi_devices.len(), 1);
        assert!(!config.is_midi_device_enabled("Keys"));
        config.set_midi_device_enabled("Keys", true);
        assert!(config.is_midi_device_enabled("Keys"));
    }
}
