//! The device abstraction every backend drives.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// Driver specific identifier, e.g. `hw:1` for ALSA.
    pub driver_id: String,
    /// Capture channels offered, 0 when the device cannot capture.
    pub capture: u32,
    /// Playback channels offered, 0 when the device cannot play.
    pub playback: u32,
}

/// Session parameters asked of a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub capture_device: Option<String>,
    pub playback_device: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub periods: u32,
    /// 0 for every channel the device has.
    pub capture_channels: u32,
    pub playback_channels: u32,
}

/// Parameters the driver actually opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub periods: u32,
    pub capture_channels: u32,
    pub playback_channels: u32,
}

/// Result of one bounded wait for the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitStatus {
    /// Frames ready for exchange. Zero on timeout.
    pub frames: u32,
    /// The device dropped or repeated data since the last wait.
    pub xrun: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MidiDirection {
    Capture,
    Playback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiDeviceInfo {
    pub name: String,
    pub capture: bool,
    pub playback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added {
        device: String,
        direction: MidiDirection,
    },
    Removed {
        device: String,
        direction: MidiDirection,
    },
}

/// Operations the realtime loop needs from an OS audio API.
///
/// `open`, `close` and the enumeration calls run on the control thread.
/// `start`, `stop`, `wait` and the per-channel exchange calls run on the
/// process thread while a session is live.
pub trait DeviceDriver: Send {
    fn name(&self) -> &str;

    fn devices(&self) -> DriverResult<Vec<DeviceInfo>>;

    fn available_sample_rates(&self, device: &str) -> Vec<u32>;

    fn available_buffer_sizes(&self, device: &str) -> Vec<u32>;

    fn midi_options(&self) -> Vec<String> {
        vec![crate::config::NO_DEVICE.to_string()]
    }

    fn midi_devices(&self, _option: &str) -> Vec<MidiDeviceInfo> {
        Vec::new()
    }

    fn open(&mut self, request: &OpenRequest) -> DriverResult<NegotiatedConfig>;

    /// Opens MIDI devices for `option`, skipping names in `disabled`.
    fn open_midi(&mut self, _option: &str, _disabled: &[String]) -> DriverResult<Vec<MidiDeviceInfo>> {
        Ok(Vec::new())
    }

    fn start(&mut self) -> DriverResult<()>;

    fn stop(&mut self) -> DriverResult<()>;

    fn close(&mut self);

    /// Blocks for at most `timeout` until a period can be exchanged. An
    /// error is fatal for the session.
    fn wait(&mut self, timeout: Duration) -> DriverResult<WaitStatus>;

    fn read_channel(&mut self, channel: usize, dst: &mut [f32]);

    fn capture_done(&mut self, _frames: u32) {}

    fn write_channel(&mut self, channel: usize, src: &[f32]);

    fn playback_done(&mut self, _frames: u32) -> DriverResult<()> {
        Ok(())
    }

    /// Hands every MIDI message received on `device` this period to `sink`.
    fn receive_midi(&mut self, _device: &str, _sink: &mut dyn FnMut(u32, &[u8])) {}

    fn send_midi(&mut self, _device: &str, _timestamp: u32, _data: &[u8]) -> DriverResult<()> {
        Ok(())
    }

    fn poll_hotplug(&mut self) -> Option<HotplugEvent> {
        None
    }
}

/// Placeholder for backends without an implementation in this build.
#[derive(Debug, Clone)]
pub struct StubDriver {
    name: String,
}

impl StubDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn not_available(&self) -> DriverError {
        DriverError::NotAvailable(self.name.clone())
    }
}

impl DeviceDriver for StubDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> DriverResult<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    fn available_sample_rates(&self, _device: &str) -> Vec<u32> {
        Vec::new()
    }

    fn available_buffer_sizes(&self, _device: &str) -> Vec<u32> {
        Vec::new()
    }

    fn open(&mut self, _request: &OpenRequest) -> DriverResult<NegotiatedConfig> {
        Err(self.not_available())
    }

    fn start(&mut self) -> DriverResult<()> {
        Err(self.not_available())
    }

    fn stop(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn wait(&mut self, _timeout: Duration) -> DriverResult<WaitStatus> {
        Err(self.not_available())
    }

    fn read_channel(&mut self, _channel: usize, dst: &mut [f32]) {
        dst.fill(0.0);
    }

    fn write_channel(&mut self, _channel: usize, _src: &[f32]) {}
}
