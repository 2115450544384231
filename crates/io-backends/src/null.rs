//! A device driver without hardware.
//!
//! The null driver produces silence (or queued test signals) and records
//! everything written to it. Its clock is either wall-clock paced, free
//! running, or stepped by hand through a [`NullHandle`], which is what makes
//! the process loop testable end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use engine_rt::EventQueue;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::is_device;
use crate::driver::{
    DeviceDriver, DeviceInfo, DriverResult, HotplugEvent, MidiDeviceInfo, MidiDirection,
    NegotiatedConfig, OpenRequest, WaitStatus,
};
use crate::error::DriverError;

const SAMPLE_RATES: &[u32] = &[
    8_000, 22_050, 24_000, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000,
];
const BUFFER_SIZES: &[u32] = &[32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];
const EVENT_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// One period per `NullHandle::tick`.
    Manual,
    /// One period per period of wall-clock time.
    Realtime,
    /// A period is always ready.
    Freerun,
}

#[derive(Debug, Clone)]
enum Injection {
    Xrun,
    Fault(String),
}

#[derive(Debug, Default)]
struct Recorded {
    inputs: Vec<VecDeque<f32>>,
    outputs: Vec<Vec<f32>>,
    midi_in: Vec<(String, u32, Vec<u8>)>,
    midi_out: Vec<(String, u32, Vec<u8>)>,
    open_failure: Option<String>,
    start_delay: Option<Duration>,
}

#[derive(Debug)]
struct NullShared {
    recorded: Mutex<Recorded>,
    injections: EventQueue<Injection>,
    hotplug: EventQueue<HotplugEvent>,
    xrun_storm: AtomicBool,
    refuse_midi: AtomicBool,
    open: AtomicBool,
    running: AtomicBool,
    opens: AtomicU64,
    starts: AtomicU64,
    cycles: AtomicU64,
}

/// Test handle onto a [`NullDriver`], usable from any thread.
#[derive(Debug, Clone)]
pub struct NullHandle {
    shared: Arc<NullShared>,
    permits: Sender<()>,
    completions: Receiver<u64>,
}

impl NullHandle {
    /// Releases `periods` manual clock ticks.
    pub fn tick(&self, periods: usize) {
        for _ in 0..periods {
            let _ = self.permits.send(());
        }
    }

    /// Waits until `periods` more periods have been completed.
    pub fn wait_cycles(&self, periods: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for _ in 0..periods {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false
                }
            }
        }
        true
    }

    /// Ticks the manual clock and waits for the periods to complete.
    pub fn step(&self, periods: usize, timeout: Duration) -> bool {
        self.tick(periods);
        self.wait_cycles(periods, timeout)
    }

    /// Queues samples to be captured on `channel`.
    pub fn feed(&self, channel: usize, samples: &[f32]) {
        let mut recorded = self.shared.recorded.lock();
        if recorded.inputs.len() <= channel {
            recorded.inputs.resize_with(channel + 1, VecDeque::new);
        }
        recorded.inputs[channel].extend(samples.iter().copied());
    }

    /// Everything written to playback `channel` since the device opened,
    /// starting with one period of device latency.
    pub fn output(&self, channel: usize) -> Vec<f32> {
        self.shared
            .recorded
            .lock()
            .outputs
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn feed_midi(&self, device: &str, timestamp: u32, data: &[u8]) {
        self.shared
            .recorded
            .lock()
            .midi_in
            .push((device.to_string(), timestamp, data.to_vec()));
    }

    pub fn sent_midi(&self) -> Vec<(String, u32, Vec<u8>)> {
        self.shared.recorded.lock().midi_out.clone()
    }

    /// Makes outgoing MIDI fail until switched off.
    pub fn refuse_midi(&self, enabled: bool) {
        self.shared.refuse_midi.store(enabled, Ordering::Release);
    }

    pub fn inject_xrun(&self) {
        let _ = self.shared.injections.try_push(Injection::Xrun);
    }

    /// Makes every wait report an xrun until switched off.
    pub fn set_xrun_storm(&self, enabled: bool) {
        self.shared.xrun_storm.store(enabled, Ordering::Release);
    }

    pub fn inject_fault(&self, reason: &str) {
        let _ = self
            .shared
            .injections
            .try_push(Injection::Fault(reason.to_string()));
    }

    pub fn fail_next_open(&self, reason: &str) {
        self.shared.recorded.lock().open_failure = Some(reason.to_string());
    }

    /// Makes the next device start block for `delay`.
    pub fn delay_next_start(&self, delay: Duration) {
        self.shared.recorded.lock().start_delay = Some(delay);
    }

    pub fn plug_midi(&self, device: &str, direction: MidiDirection) {
        let _ = self.shared.hotplug.try_push(HotplugEvent::Added {
            device: device.to_string(),
            direction,
        });
    }

    pub fn unplug_midi(&self, device: &str, direction: MidiDirection) {
        let _ = self.shared.hotplug.try_push(HotplugEvent::Removed {
            device: device.to_string(),
            direction,
        });
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> u64 {
        self.shared.opens.load(Ordering::Acquire)
    }

    pub fn start_count(&self) -> u64 {
        self.shared.starts.load(Ordering::Acquire)
    }

    pub fn completed_cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }
}

pub struct NullDriver {
    clock: ClockMode,
    devices: Vec<DeviceInfo>,
    midi: Vec<MidiDeviceInfo>,
    shared: Arc<NullShared>,
    permits: Receiver<()>,
    permit_tx: Sender<()>,
    completions: Sender<u64>,
    completion_rx: Receiver<u64>,
    session: Option<NegotiatedConfig>,
    next_deadline: Option<Instant>,
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new(ClockMode::Realtime)
    }
}

impl NullDriver {
    pub fn new(clock: ClockMode) -> Self {
        let (permit_tx, permits) = unbounded();
        let (completions, completion_rx) = unbounded();
        Self {
            clock,
            devices: vec![DeviceInfo {
                name: "Null Device".to_string(),
                driver_id: "null:0".to_string(),
                capture: 8,
                playback: 8,
            }],
            midi: Vec::new(),
            shared: Arc::new(NullShared {
                recorded: Mutex::new(Recorded::default()),
                injections: EventQueue::new(EVENT_DEPTH),
                hotplug: EventQueue::new(EVENT_DEPTH),
                xrun_storm: AtomicBool::new(false),
                refuse_midi: AtomicBool::new(false),
                open: AtomicBool::new(false),
                running: AtomicBool::new(false),
                opens: AtomicU64::new(0),
                starts: AtomicU64::new(0),
                cycles: AtomicU64::new(0),
            }),
            permits,
            permit_tx,
            completions,
            completion_rx,
            session: None,
            next_deadline: None,
        }
    }

    /// Replaces the advertised devices.
    pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_midi_devices(mut self, devices: Vec<MidiDeviceInfo>) -> Self {
        self.midi = devices;
        self
    }

    pub fn handle(&self) -> NullHandle {
        NullHandle {
            shared: Arc::clone(&self.shared),
            permits: self.permit_tx.clone(),
            completions: self.completion_rx.clone(),
        }
    }

    fn device(&self, name: &str) -> DriverResult<&DeviceInfo> {
        self.devices
            .iter()
            .find(|device| device.name == name)
            .ok_or_else(|| DriverError::DeviceNotFound(name.to_string()))
    }

    fn period(&self) -> u32 {
        self.session.map_or(0, |session| session.buffer_size)
    }

    fn period_duration(&self) -> Duration {
        match self.session {
            Some(session) if session.sample_rate > 0 => Duration::from_nanos(
                u64::from(session.buffer_size) * 1_000_000_000 / u64::from(session.sample_rate),
            ),
            _ => Duration::ZERO,
        }
    }
}

fn nearest(options: &[u32], wanted: u32) -> u32 {
    options
        .iter()
        .copied()
        .min_by_key(|option| option.abs_diff(wanted))
        .unwrap_or(wanted)
}

fn clamp_channels(requested: u32, available: u32) -> u32 {
    if requested == 0 {
        available
    } else {
        requested.min(available)
    }
}

impl DeviceDriver for NullDriver {
    fn name(&self) -> &str {
        "Null"
    }

    fn devices(&self) -> DriverResult<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn available_sample_rates(&self, _device: &str) -> Vec<u32> {
        SAMPLE_RATES.to_vec()
    }

    fn available_buffer_sizes(&self, _device: &str) -> Vec<u32> {
        BUFFER_SIZES.to_vec()
    }

    fn midi_options(&self) -> Vec<String> {
        vec!["Null MIDI".to_string(), crate::config::NO_DEVICE.to_string()]
    }

    fn midi_devices(&self, option: &str) -> Vec<MidiDeviceInfo> {
        if is_device(option) {
            self.midi.clone()
        } else {
            Vec::new()
        }
    }

    fn open(&mut self, request: &OpenRequest) -> DriverResult<NegotiatedConfig> {
        if let Some(reason) = self.shared.recorded.lock().open_failure.take() {
            return Err(DriverError::Device(reason));
        }
        let capture = match request.capture_device.as_deref() {
            Some(name) => self.device(name)?.capture,
            None => 0,
        };
        let playback = match request.playback_device.as_deref() {
            Some(name) => self.device(name)?.playback,
            None => 0,
        };
        let negotiated = NegotiatedConfig {
            sample_rate: nearest(SAMPLE_RATES, request.sample_rate),
            buffer_size: nearest(BUFFER_SIZES, request.buffer_size),
            periods: request.periods.max(1),
            capture_channels: clamp_channels(request.capture_channels, capture),
            playback_channels: clamp_channels(request.playback_channels, playback),
        };

        let period = negotiated.buffer_size as usize;
        {
            let mut recorded = self.shared.recorded.lock();
            recorded.inputs.resize_with(negotiated.capture_channels as usize, VecDeque::new);
            recorded.outputs = (0..negotiated.playback_channels)
                .map(|_| vec![0.0; period])
                .collect();
        }
        while self.permits.try_recv().is_ok() {}
        self.session = Some(negotiated);
        self.shared.open.store(true, Ordering::Release);
        self.shared.opens.fetch_add(1, Ordering::AcqRel);
        debug!(?negotiated, "null device opened");
        Ok(negotiated)
    }

    fn open_midi(&mut self, option: &str, disabled: &[String]) -> DriverResult<Vec<MidiDeviceInfo>> {
        Ok(self
            .midi_devices(option)
            .into_iter()
            .filter(|device| !disabled.contains(&device.name))
            .collect())
    }

    fn start(&mut self) -> DriverResult<()> {
        if self.session.is_none() {
            return Err(DriverError::NotOpen);
        }
        let delay = self.shared.recorded.lock().start_delay.take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.next_deadline = None;
        self.shared.running.store(true, Ordering::Release);
        self.shared.starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.shared.running.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.open.store(false, Ordering::Release);
        self.session = None;
    }

    fn wait(&mut self, timeout: Duration) -> DriverResult<WaitStatus> {
        if self.session.is_none() {
            return Err(DriverError::NotOpen);
        }
        if let Ok(injection) = self.shared.injections.try_pop() {
            return match injection {
                Injection::Xrun => Ok(WaitStatus {
                    frames: 0,
                    xrun: true,
                }),
                Injection::Fault(reason) => Err(DriverError::Device(reason)),
            };
        }
        if self.shared.xrun_storm.load(Ordering::Acquire) {
            std::thread::sleep(self.period_duration().min(timeout));
            return Ok(WaitStatus {
                frames: 0,
                xrun: true,
            });
        }

        let period = self.period();
        let ready = match self.clock {
            ClockMode::Manual => self.permits.recv_timeout(timeout).is_ok(),
            ClockMode::Freerun => true,
            ClockMode::Realtime => {
                let now = Instant::now();
                let deadline = *self.next_deadline.get_or_insert(now);
                if deadline > now + timeout {
                    std::thread::sleep(timeout);
                    false
                } else {
                    std::thread::sleep(deadline.saturating_duration_since(now));
                    self.next_deadline = Some(deadline + self.period_duration());
                    true
                }
            }
        };
        Ok(WaitStatus {
            frames: if ready { period } else { 0 },
            xrun: false,
        })
    }

    fn read_channel(&mut self, channel: usize, dst: &mut [f32]) {
        let mut recorded = self.shared.recorded.lock();
        let Some(queue) = recorded.inputs.get_mut(channel) else {
            dst.fill(0.0);
            return;
        };
        for sample in dst.iter_mut() {
            *sample = queue.pop_front().unwrap_or(0.0);
        }
    }

    fn write_channel(&mut self, channel: usize, src: &[f32]) {
        if let Some(output) = self.shared.recorded.lock().outputs.get_mut(channel) {
            output.extend_from_slice(src);
        }
    }

    fn playback_done(&mut self, _frames: u32) -> DriverResult<()> {
        let cycle = self.shared.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.completions.send(cycle);
        Ok(())
    }

    fn receive_midi(&mut self, device: &str, sink: &mut dyn FnMut(u32, &[u8])) {
        let mut recorded = self.shared.recorded.lock();
        let mut index = 0;
        while index < recorded.midi_in.len() {
            if recorded.midi_in[index].0 == device {
                let (_, timestamp, data) = recorded.midi_in.remove(index);
                sink(timestamp, &data);
            } else {
                index += 1;
            }
        }
    }

    fn send_midi(&mut self, device: &str, timestamp: u32, data: &[u8]) -> DriverResult<()> {
        if self.shared.refuse_midi.load(Ordering::Acquire) {
            return Err(DriverError::Device(format!("{device} refused MIDI output")));
        }
        self.shared
            .recorded
            .lock()
            .midi_out
            .push((device.to_string(), timestamp, data.to_vec()));
        Ok(())
    }

    fn poll_hotplug(&mut self) -> Option<HotplugEvent> {
        self.shared.hotplug.try_pop().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OpenRequest {
        OpenRequest {
            capture_device: Some("Null Device".into()),
            playback_device: Some("Null Device".into()),
            sample_rate: 47_000,
            buffer_size: 200,
            periods: 2,
            capture_channels: 0,
            playback_channels: 12,
        }
    }

    #[test]
    fn open_negotiates_nearest_supported_values() {
        let mut driver = NullDriver::new(ClockMode::Freerun);
        let negotiated = driver.open(&request()).unwrap();
        assert_eq!(negotiated.sample_rate, 48_000);
        assert_eq!(negotiated.buffer_size, 256);
        assert_eq!(negotiated.capture_channels, 8);
        assert_eq!(negotiated.playback_channels, 8);
        assert!(driver.handle().is_open());
    }

    #[test]
    fn unknown_device_fails_to_open() {
        let mut driver = NullDriver::new(ClockMode::Freerun);
        let mut request = request();
        request.capture_device = Some("Missing".into());
        assert_eq!(
            driver.open(&request),
            Err(DriverError::DeviceNotFound("Missing".into()))
        );
    }

    #[test]
    fn manual_clock_waits_for_ticks() {
        let mut driver = NullDriver::new(ClockMode::Manual);
        let handle = driver.handle();
        driver.open(&request()).unwrap();
        driver.start().unwrap();
        let idle = driver.wait(Duration::from_millis(5)).unwrap();
        assert_eq!(idle.frames, 0);
        handle.tick(1);
        assert_eq!(driver.wait(Duration::from_millis(5)).unwrap().frames, 256);
    }

    #[test]
    fn injections_surface_in_wait() {
        let mut driver = NullDriver::new(ClockMode::Freerun);
        let handle = driver.handle();
        driver.open(&request()).unwrap();
        handle.inject_xrun();
        handle.inject_fault("cable pulled");
        assert!(driver.wait(Duration::ZERO).unwrap().xrun);
        assert_eq!(
            driver.wait(Duration::ZERO),
            Err(DriverError::Device("cable pulled".into()))
        );
        assert_eq!(driver.wait(Duration::ZERO).unwrap().frames, 256);
    }

    #[test]
    fn output_starts_with_one_period_of_latency() {
        let mut driver = NullDriver::new(ClockMode::Freerun);
        let handle = driver.handle();
        driver.open(&request()).unwrap();
        driver.write_channel(0, &[1.0; 4]);
        let output = handle.output(0);
        assert_eq!(output.len(), 260);
        assert!(output[..256].iter().all(|s| *s == 0.0));
        assert_eq!(&output[256..], &[1.0; 4]);
    }
}
