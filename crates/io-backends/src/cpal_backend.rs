//! Device driver on top of cpal.
//!
//! cpal streams are not `Send` on every host, so they live on a keeper
//! thread for the whole session. Audio crosses over lock-free interleaved
//! sample queues and the stream callbacks wake the process thread through
//! a channel whenever a period has moved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, FromSample, Sample, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize,
    SupportedStreamConfigRange,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::driver::{
    DeviceDriver, DeviceInfo, DriverResult, NegotiatedConfig, OpenRequest, WaitStatus,
};
use crate::error::DriverError;

const COMMON_RATES: [u32; 8] = [22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000];
const COMMON_SIZES: [u32; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];
const KEEPER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Play,
    Pause,
}

/// Flags the stream callbacks raise for the process thread.
#[derive(Default)]
struct StreamState {
    xrun: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl StreamState {
    fn fault(&self, reason: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(reason);
        }
    }
}

/// Format and device channel layout picked for one direction.
#[derive(Debug, Clone, Copy)]
struct StreamPlan {
    format: SampleFormat,
    device_channels: u16,
    used_channels: u32,
}

struct Session {
    keeper: Option<JoinHandle<()>>,
    commands: Sender<Command>,
    replies: Receiver<DriverResult<()>>,
    wake: Receiver<()>,
    state: Arc<StreamState>,
    capture: Option<(StreamPlan, Arc<ArrayQueue<f32>>)>,
    playback: Option<(StreamPlan, Arc<ArrayQueue<f32>>)>,
    negotiated: NegotiatedConfig,
    capture_frame: Vec<f32>,
    playback_frame: Vec<f32>,
}

impl Session {
    fn command(&self, command: Command) -> DriverResult<()> {
        self.commands
            .send(command)
            .map_err(|_| DriverError::Device("stream thread exited".into()))?;
        self.replies
            .recv_timeout(KEEPER_REPLY_TIMEOUT)
            .map_err(|_| DriverError::Device("stream thread did not respond".into()))?
    }

    fn period_samples(plan: &StreamPlan, period: u32) -> usize {
        period as usize * usize::from(plan.device_channels)
    }

    fn ready(&self) -> bool {
        let period = self.negotiated.buffer_size;
        let capture_ready = self
            .capture
            .as_ref()
            .map_or(true, |(plan, queue)| queue.len() >= Self::period_samples(plan, period));
        let playback_ready = self.playback.as_ref().map_or(true, |(plan, queue)| {
            queue.capacity() - queue.len() >= Self::period_samples(plan, period)
        });
        capture_ready && playback_ready
    }

    /// Fills the playback queue with silence up to one free period.
    fn preroll(&self) {
        if let Some((plan, queue)) = &self.playback {
            let keep_free = Self::period_samples(plan, self.negotiated.buffer_size);
            while queue.capacity() - queue.len() > keep_free {
                if queue.push(0.0).is_err() {
                    break;
                }
            }
        }
    }

    fn drain(&self) {
        for queue in [&self.capture, &self.playback].into_iter().flatten() {
            while queue.1.pop().is_some() {}
        }
        while self.wake.try_recv().is_ok() {}
    }
}

/// Driver for any host cpal exposes (ALSA, CoreAudio, ASIO, ...).
pub struct CpalDriver {
    name: String,
    host_id: cpal::HostId,
    session: Option<Session>,
}

impl std::fmt::Debug for CpalDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDriver")
            .field("name", &self.name)
            .field("host", &self.host_id.name())
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl CpalDriver {
    pub fn new(name: impl Into<String>, host_id: cpal::HostId) -> DriverResult<Self> {
        let name = name.into();
        if !cpal::available_hosts().contains(&host_id) {
            return Err(DriverError::NotAvailable(name));
        }
        Ok(Self {
            name,
            host_id,
            session: None,
        })
    }

    /// Driver on the platform's default cpal host.
    pub fn default_host(name: impl Into<String>) -> DriverResult<Self> {
        Self::new(name, cpal::default_host().id())
    }

    pub fn host_available(host_id: cpal::HostId) -> bool {
        cpal::available_hosts().contains(&host_id)
    }

    fn host(&self) -> DriverResult<cpal::Host> {
        cpal::host_from_id(self.host_id).map_err(|err| DriverError::NotAvailable(err.to_string()))
    }

    fn session(&self) -> DriverResult<&Session> {
        self.session.as_ref().ok_or(DriverError::NotOpen)
    }

    fn ranges(&self, device: &str) -> Vec<SupportedStreamConfigRange> {
        let Ok(host) = self.host() else {
            return Vec::new();
        };
        let Some(device) = find_device(&host, device) else {
            return Vec::new();
        };
        let mut ranges: Vec<_> = device
            .supported_output_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default();
        if let Ok(inputs) = device.supported_input_configs() {
            ranges.extend(inputs);
        }
        ranges
    }
}

fn device_error(err: impl std::fmt::Display) -> DriverError {
    DriverError::Device(err.to_string())
}

fn find_device(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    host.devices()
        .ok()?
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
}

fn max_channels(configs: impl Iterator<Item = SupportedStreamConfigRange>) -> u32 {
    configs
        .map(|range| u32::from(range.channels()))
        .max()
        .unwrap_or(0)
}

/// Picks the range that covers `rate`, preferring enough channels and f32.
fn select_range(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
    wanted: u32,
) -> Option<SupportedStreamConfigRange> {
    let sample_rate = cpal::SampleRate(rate);
    ranges
        .filter(|range| range.min_sample_rate() <= sample_rate && range.max_sample_rate() >= sample_rate)
        .filter(|range| matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .max_by_key(|range| {
            let channels = u32::from(range.channels());
            (
                wanted == 0 || channels >= wanted,
                range.sample_format() == SampleFormat::F32,
                channels,
            )
        })
}

fn plan_for(range: &SupportedStreamConfigRange, requested: u32) -> StreamPlan {
    let device_channels = range.channels();
    let used_channels = if requested == 0 {
        u32::from(device_channels)
    } else {
        requested.min(u32::from(device_channels))
    };
    StreamPlan {
        format: range.sample_format(),
        device_channels,
        used_channels,
    }
}

impl DeviceDriver for CpalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> DriverResult<Vec<DeviceInfo>> {
        let host = self.host()?;
        let devices = host.devices().map_err(device_error)?;
        Ok(devices
            .filter_map(|device| {
                let name = device.name().ok()?;
                let capture = device
                    .supported_input_configs()
                    .map(max_channels)
                    .unwrap_or(0);
                let playback = device
                    .supported_output_configs()
                    .map(max_channels)
                    .unwrap_or(0);
                Some(DeviceInfo {
                    driver_id: name.clone(),
                    name,
                    capture,
                    playback,
                })
            })
            .collect())
    }

    fn available_sample_rates(&self, device: &str) -> Vec<u32> {
        let ranges = self.ranges(device);
        COMMON_RATES
            .iter()
            .copied()
            .filter(|rate| {
                ranges.iter().any(|range| {
                    range.min_sample_rate().0 <= *rate && range.max_sample_rate().0 >= *rate
                })
            })
            .collect()
    }

    fn available_buffer_sizes(&self, device: &str) -> Vec<u32> {
        let ranges = self.ranges(device);
        if ranges.is_empty() {
            return Vec::new();
        }
        COMMON_SIZES
            .iter()
            .copied()
            .filter(|size| {
                ranges.iter().any(|range| match range.buffer_size() {
                    SupportedBufferSize::Range { min, max } => min <= size && size <= max,
                    SupportedBufferSize::Unknown => true,
                })
            })
            .collect()
    }

    fn open(&mut self, request: &OpenRequest) -> DriverResult<NegotiatedConfig> {
        self.close();
        let host = self.host()?;
        let rate = request.sample_rate;

        let capture = match request.capture_device.as_deref() {
            Some(name) => {
                let device =
                    find_device(&host, name).ok_or_else(|| DriverError::DeviceNotFound(name.into()))?;
                let ranges = device.supported_input_configs().map_err(device_error)?;
                let range = select_range(ranges, rate, request.capture_channels).ok_or_else(|| {
                    DriverError::UnsupportedConfiguration(format!("{name}: no capture format at {rate} Hz"))
                })?;
                Some((name.to_string(), plan_for(&range, request.capture_channels)))
            }
            None => None,
        };
        let playback = match request.playback_device.as_deref() {
            Some(name) => {
                let device =
                    find_device(&host, name).ok_or_else(|| DriverError::DeviceNotFound(name.into()))?;
                let ranges = device.supported_output_configs().map_err(device_error)?;
                let range = select_range(ranges, rate, request.playback_channels).ok_or_else(|| {
                    DriverError::UnsupportedConfiguration(format!("{name}: no playback format at {rate} Hz"))
                })?;
                Some((name.to_string(), plan_for(&range, request.playback_channels)))
            }
            None => None,
        };
        drop(host);

        let negotiated = NegotiatedConfig {
            sample_rate: rate,
            buffer_size: request.buffer_size,
            periods: request.periods.max(2),
            capture_channels: capture.as_ref().map_or(0, |(_, plan)| plan.used_channels),
            playback_channels: playback.as_ref().map_or(0, |(_, plan)| plan.used_channels),
        };
        let depth = negotiated.periods as usize + 1;
        let queue_for = |plan: &StreamPlan| {
            Arc::new(ArrayQueue::new(
                (Session::period_samples(plan, negotiated.buffer_size) * depth).max(1),
            ))
        };
        let capture = capture.map(|(name, plan)| (name, plan, queue_for(&plan)));
        let playback = playback.map(|(name, plan)| (name, plan, queue_for(&plan)));

        let state = Arc::new(StreamState::default());
        let (wake_tx, wake_rx) = bounded(4);
        let (command_tx, command_rx) = bounded(1);
        let (reply_tx, reply_rx) = bounded(1);
        let keeper = StreamKeeper {
            host_id: self.host_id,
            sample_rate: rate,
            buffer_size: request.buffer_size,
            capture: capture.clone(),
            playback: playback.clone(),
            state: Arc::clone(&state),
            wake: wake_tx,
        };
        let handle = thread::Builder::new()
            .name(format!("{}-streams", self.name))
            .spawn(move || keeper.run(command_rx, reply_tx))
            .map_err(device_error)?;

        let built = reply_rx
            .recv_timeout(KEEPER_REPLY_TIMEOUT)
            .unwrap_or_else(|_| Err(DriverError::Device("stream thread did not respond".into())));
        if let Err(err) = built {
            drop(command_tx);
            let _ = handle.join();
            return Err(err);
        }

        let capture_frame = capture.as_ref().map_or(0, |(_, plan, _)| {
            Session::period_samples(plan, negotiated.buffer_size)
        });
        let playback_frame = playback.as_ref().map_or(0, |(_, plan, _)| {
            Session::period_samples(plan, negotiated.buffer_size)
        });
        self.session = Some(Session {
            keeper: Some(handle),
            commands: command_tx,
            replies: reply_rx,
            wake: wake_rx,
            state,
            capture: capture.map(|(_, plan, queue)| (plan, queue)),
            playback: playback.map(|(_, plan, queue)| (plan, queue)),
            negotiated,
            capture_frame: vec![0.0; capture_frame],
            playback_frame: vec![0.0; playback_frame],
        });
        debug!(driver = %self.name, ?negotiated, "cpal device opened");
        Ok(negotiated)
    }

    fn start(&mut self) -> DriverResult<()> {
        let session = self.session()?;
        session.drain();
        session.state.xrun.store(false, Ordering::Release);
        session.preroll();
        session.command(Command::Play)
    }

    fn stop(&mut self) -> DriverResult<()> {
        match &self.session {
            Some(session) => session.command(Command::Pause),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let Session {
                commands, keeper, ..
            } = session;
            // Hanging up the command channel ends the keeper thread.
            drop(commands);
            if let Some(handle) = keeper {
                if handle.join().is_err() {
                    error!(driver = %self.name, "stream thread panicked");
                }
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> DriverResult<WaitStatus> {
        let session = self.session()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = session.state.fault.lock().take() {
                return Err(DriverError::Device(reason));
            }
            if session.ready() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitStatus {
                    frames: 0,
                    xrun: true,
                });
            }
            let _ = session.wake.recv_timeout(deadline - now);
        }

        let xrun = session.state.xrun.swap(false, Ordering::AcqRel);
        let frames = session.negotiated.buffer_size;
        if let Some(session) = self.session.as_mut() {
            if let Some((_, queue)) = &session.capture {
                for sample in session.capture_frame.iter_mut() {
                    *sample = queue.pop().unwrap_or(0.0);
                }
            }
            session.playback_frame.fill(0.0);
        }
        Ok(WaitStatus { frames, xrun })
    }

    fn read_channel(&mut self, channel: usize, dst: &mut [f32]) {
        let Some(session) = &self.session else {
            dst.fill(0.0);
            return;
        };
        let Some((plan, _)) = &session.capture else {
            dst.fill(0.0);
            return;
        };
        let stride = usize::from(plan.device_channels);
        if channel >= stride {
            dst.fill(0.0);
            return;
        }
        for (sample, frame) in dst.iter_mut().zip(session.capture_frame.chunks_exact(stride)) {
            *sample = frame[channel];
        }
    }

    fn write_channel(&mut self, channel: usize, src: &[f32]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some((plan, _)) = &session.playback else {
            return;
        };
        let stride = usize::from(plan.device_channels);
        if channel >= stride {
            return;
        }
        for (frame, sample) in session.playback_frame.chunks_exact_mut(stride).zip(src) {
            frame[channel] = *sample;
        }
    }

    fn playback_done(&mut self, _frames: u32) -> DriverResult<()> {
        let session = self.session()?;
        if let Some((_, queue)) = &session.playback {
            for sample in &session.playback_frame {
                if queue.push(*sample).is_err() {
                    session.state.xrun.store(true, Ordering::Release);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the cpal streams for one session.
struct StreamKeeper {
    host_id: cpal::HostId,
    sample_rate: u32,
    buffer_size: u32,
    capture: Option<(String, StreamPlan, Arc<ArrayQueue<f32>>)>,
    playback: Option<(String, StreamPlan, Arc<ArrayQueue<f32>>)>,
    state: Arc<StreamState>,
    wake: Sender<()>,
}

impl StreamKeeper {
    fn run(self, commands: Receiver<Command>, replies: Sender<DriverResult<()>>) {
        let streams = match self.build() {
            Ok(streams) => {
                let _ = replies.send(Ok(()));
                streams
            }
            Err(err) => {
                let _ = replies.send(Err(err));
                return;
            }
        };
        for command in commands.iter() {
            let result = streams.iter().try_for_each(|stream| match command {
                Command::Play => stream.play().map_err(device_error),
                Command::Pause => stream.pause().map_err(device_error),
            });
            if replies.send(result).is_err() {
                break;
            }
        }
        for stream in &streams {
            let _ = stream.pause();
        }
        debug!("cpal streams released");
    }

    fn build(&self) -> DriverResult<Vec<cpal::Stream>> {
        let host =
            cpal::host_from_id(self.host_id).map_err(|err| DriverError::NotAvailable(err.to_string()))?;
        let mut streams = Vec::new();
        if let Some((name, plan, queue)) = &self.capture {
            let device =
                find_device(&host, name).ok_or_else(|| DriverError::DeviceNotFound(name.clone()))?;
            streams.push(self.build_with_fallback(plan, |config| match plan.format {
                SampleFormat::I16 => self.build_input::<i16>(&device, config, queue),
                _ => self.build_input::<f32>(&device, config, queue),
            })?);
        }
        if let Some((name, plan, queue)) = &self.playback {
            let device =
                find_device(&host, name).ok_or_else(|| DriverError::DeviceNotFound(name.clone()))?;
            streams.push(self.build_with_fallback(plan, |config| match plan.format {
                SampleFormat::I16 => self.build_output::<i16>(&device, config, queue),
                _ => self.build_output::<f32>(&device, config, queue),
            })?);
        }
        Ok(streams)
    }

    /// Tries a fixed period first and falls back to the host's default.
    fn build_with_fallback(
        &self,
        plan: &StreamPlan,
        build: impl Fn(&StreamConfig) -> Result<cpal::Stream, cpal::BuildStreamError>,
    ) -> DriverResult<cpal::Stream> {
        let mut config = StreamConfig {
            channels: plan.device_channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: BufferSize::Fixed(self.buffer_size),
        };
        match build(&config) {
            Ok(stream) => Ok(stream),
            Err(err) => {
                warn!(%err, frames = self.buffer_size, "fixed period rejected, using the host default");
                config.buffer_size = BufferSize::Default;
                build(&config).map_err(|err| DriverError::UnsupportedConfiguration(err.to_string()))
            }
        }
    }

    fn build_input<T>(
        &self,
        device: &cpal::Device,
        config: &StreamConfig,
        queue: &Arc<ArrayQueue<f32>>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let queue = Arc::clone(queue);
        let state = Arc::clone(&self.state);
        let error_state = Arc::clone(&self.state);
        let wake = self.wake.clone();
        device.build_input_stream(
            config,
            move |input: &[T], _: &cpal::InputCallbackInfo| {
                for sample in input {
                    if queue.push(sample.to_sample::<f32>()).is_err() {
                        state.xrun.store(true, Ordering::Release);
                        break;
                    }
                }
                let _ = wake.try_send(());
            },
            move |err| {
                error!(%err, "capture stream error");
                error_state.fault(err.to_string());
            },
            None,
        )
    }

    fn build_output<T>(
        &self,
        device: &cpal::Device,
        config: &StreamConfig,
        queue: &Arc<ArrayQueue<f32>>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let queue = Arc::clone(queue);
        let state = Arc::clone(&self.state);
        let error_state = Arc::clone(&self.state);
        let wake = self.wake.clone();
        device.build_output_stream(
            config,
            move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut underflow = false;
                for sample in output.iter_mut() {
                    let value = queue.pop().unwrap_or_else(|| {
                        underflow = true;
                        0.0
                    });
                    *sample = T::from_sample(value);
                }
                if underflow {
                    state.xrun.store(true, Ordering::Release);
                }
                let _ = wake.try_send(());
            },
            move |err| {
                error!(%err, "playback stream error");
                error_state.fault(err.to_string());
            },
            None,
        )
    }
}
