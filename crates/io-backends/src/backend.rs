//! Backend state machine: device selection, session start and stop, and
//! the control-side port API.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, SendError};
use engine_rt::{freewheel_channel, spawn_realtime, FreewheelControl, RealtimeHints};
use port_engine::{
    ChanCount, LatencyRange, PortError, PortFlags, PortGraph, PortId, PortKind,
};
use tracing::{debug, error, info, warn};

use crate::config::{device_wait_timeout, is_device, BackendConfig};
use crate::driver::{
    DeviceDriver, DeviceInfo, MidiDeviceInfo, MidiDirection, NegotiatedConfig, OpenRequest,
};
use crate::engine::{AudioEngine, SilentEngine};
use crate::error::{BackendError, DriverError, Result};
use crate::process::{self, LoopSettings, PhysicalPorts, RealtimeContext, Shared};
use crate::reservation::DeviceReservation;
use crate::slave::{SlaveConfig, SlaveDevice, SlaveMode};

/// How long `start` waits for the process thread to come up.
pub const PROCESS_THREAD_START_TIMEOUT: Duration = Duration::from_millis(5000);

/// Enumeration results remembered while the driver belongs to the process
/// thread.
#[derive(Debug, Default, Clone)]
struct Enumeration {
    devices: Vec<DeviceInfo>,
    sample_rates: Vec<u32>,
    buffer_sizes: Vec<u32>,
    midi_options: Vec<String>,
    midi_devices: Vec<MidiDeviceInfo>,
}

struct Session {
    negotiated: NegotiatedConfig,
    physical: PhysicalPorts,
    reservation: Option<DeviceReservation>,
    for_latency_measurement: bool,
}

/// One instance of an audio backend.
///
/// Configure it while stopped, `start` it to open the device and spawn the
/// process thread, `stop` it to tear everything down again. Port topology
/// may be edited at any time from the control thread.
pub struct Backend {
    instance_name: String,
    driver_name: String,
    config: BackendConfig,
    driver: Option<Box<dyn DeviceDriver>>,
    engine: Option<Box<dyn AudioEngine>>,
    slaves: Vec<SlaveDevice>,
    shared: Arc<Shared>,
    freewheel: FreewheelControl,
    thread: Option<JoinHandle<Option<RealtimeContext>>>,
    session: Option<Session>,
    cache: Enumeration,
    start_timeout: Duration,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("instance_name", &self.instance_name)
            .field("driver", &self.driver_name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Backend {
    pub fn new(instance_name: &str, driver: Box<dyn DeviceDriver>) -> Self {
        let (freewheel, _) = freewheel_channel();
        Self {
            instance_name: instance_name.to_string(),
            driver_name: driver.name().to_string(),
            config: BackendConfig::default(),
            driver: Some(driver),
            engine: Some(Box::new(SilentEngine)),
            slaves: Vec::new(),
            shared: Arc::new(Shared::default()),
            freewheel,
            thread: None,
            session: None,
            cache: Enumeration::default(),
            start_timeout: PROCESS_THREAD_START_TIMEOUT,
        }
    }

    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides [`PROCESS_THREAD_START_TIMEOUT`].
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: BackendConfig) -> Result<()> {
        self.ensure_stopped()?;
        self.config = config;
        Ok(())
    }

    pub fn set_engine(&mut self, engine: Box<dyn AudioEngine>) -> Result<()> {
        self.ensure_stopped()?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Takes the engine back out of a stopped backend.
    pub fn take_engine(&mut self) -> Option<Box<dyn AudioEngine>> {
        if self.thread.is_some() {
            return None;
        }
        self.engine.take()
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.thread.is_some() {
            Err(BackendError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    // Enumeration -------------------------------------------------------

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        match &self.driver {
            Some(driver) => Ok(driver.devices()?),
            None => Ok(self.cache.devices.clone()),
        }
    }

    pub fn available_sample_rates(&self, device: &str) -> Vec<u32> {
        match &self.driver {
            Some(driver) => driver.available_sample_rates(device),
            None => self.cache.sample_rates.clone(),
        }
    }

    pub fn available_buffer_sizes(&self, device: &str) -> Vec<u32> {
        match &self.driver {
            Some(driver) => driver.available_buffer_sizes(device),
            None => self.cache.buffer_sizes.clone(),
        }
    }

    pub fn midi_options(&self) -> Vec<String> {
        match &self.driver {
            Some(driver) => driver.midi_options(),
            None => self.cache.midi_options.clone(),
        }
    }

    pub fn midi_devices(&self) -> Vec<MidiDeviceInfo> {
        match &self.driver {
            Some(driver) => driver.midi_devices(&self.config.midi_option),
            None => self.cache.midi_devices.clone(),
        }
    }

    // Configuration -----------------------------------------------------

    pub fn set_device_name(&mut self, name: &str) -> Result<()> {
        self.ensure_stopped()?;
        self.config.set_device_name(name);
        Ok(())
    }

    pub fn set_input_device_name(&mut self, name: &str) -> Result<()> {
        self.ensure_stopped()?;
        self.config.input_device = name.to_string();
        Ok(())
    }

    pub fn set_output_device_name(&mut self, name: &str) -> Result<()> {
        self.ensure_stopped()?;
        self.config.output_device = name.to_string();
        Ok(())
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.ensure_stopped()?;
        if sample_rate == 0 {
            return Err(BackendError::InvalidConfiguration(
                "sample rate must be positive".into(),
            ));
        }
        self.config.sample_rate = sample_rate;
        Ok(())
    }

    pub fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        self.ensure_stopped()?;
        if frames == 0 {
            return Err(BackendError::InvalidConfiguration(
                "buffer size must be positive".into(),
            ));
        }
        self.config.buffer_size = frames;
        Ok(())
    }

    pub fn set_periods(&mut self, periods: u32) -> Result<()> {
        self.ensure_stopped()?;
        self.config.periods = periods;
        Ok(())
    }

    pub fn set_input_channels(&mut self, channels: u32) -> Result<()> {
        self.ensure_stopped()?;
        self.config.input_channels = channels;
        Ok(())
    }

    pub fn set_output_channels(&mut self, channels: u32) -> Result<()> {
        self.ensure_stopped()?;
        self.config.output_channels = channels;
        Ok(())
    }

    pub fn set_midi_option(&mut self, option: &str) -> Result<()> {
        self.ensure_stopped()?;
        self.config.midi_option = option.to_string();
        Ok(())
    }

    pub fn set_midi_device_enabled(&mut self, device: &str, enabled: bool) -> Result<()> {
        self.ensure_stopped()?;
        self.config.set_midi_device_enabled(device, enabled);
        Ok(())
    }

    /// Takes effect immediately when running.
    pub fn set_systemic_input_latency(&mut self, samples: u32) {
        self.config.systemic_input_latency = samples;
        self.refresh_physical_latency();
    }

    /// Takes effect immediately when running.
    pub fn set_systemic_output_latency(&mut self, samples: u32) {
        self.config.systemic_output_latency = samples;
        self.refresh_physical_latency();
    }

    fn physical_latency(&self, period: u32, for_playback: bool, measuring: bool) -> LatencyRange {
        let systemic = match (measuring, for_playback) {
            (true, _) => 0,
            (false, false) => self.config.systemic_input_latency,
            (false, true) => self.config.systemic_output_latency,
        };
        LatencyRange::physical(period, systemic)
    }

    fn refresh_physical_latency(&mut self) {
        let Some(session) = &self.session else { return };
        let period = session.negotiated.buffer_size;
        let measuring = session.for_latency_measurement;
        let capture = self.physical_latency(period, false, measuring);
        let playback = self.physical_latency(period, true, measuring);
        let mut ports = self.shared.ports.lock();
        for port in &session.physical.audio_in {
            let _ = ports.set_latency_range(*port, false, capture);
        }
        for port in &session.physical.audio_out {
            let _ = ports.set_latency_range(*port, true, playback);
        }
    }

    /// Adds a secondary device opened alongside the primary at the next
    /// `start`.
    pub fn add_slave(
        &mut self,
        name: &str,
        driver: Box<dyn DeviceDriver>,
        device: &str,
        mode: SlaveMode,
    ) -> Result<()> {
        self.ensure_stopped()?;
        if name.is_empty() || name == "system" || name == self.instance_name {
            return Err(BackendError::InvalidConfiguration(format!(
                "invalid slave name {name:?}"
            )));
        }
        if self.slaves.iter().any(|slave| slave.name() == name) {
            return Err(BackendError::InvalidConfiguration(format!(
                "slave {name} already exists"
            )));
        }
        let config = SlaveConfig {
            name: name.to_string(),
            device: device.to_string(),
            mode,
        };
        self.slaves.push(SlaveDevice::new(config, driver));
        Ok(())
    }

    pub fn remove_slave(&mut self, name: &str) -> Result<bool> {
        self.ensure_stopped()?;
        let before = self.slaves.len();
        self.slaves.retain(|slave| slave.name() != name);
        Ok(self.slaves.len() != before)
    }

    pub fn slave_names(&self) -> Vec<String> {
        self.slaves
            .iter()
            .map(|slave| slave.name().to_string())
            .collect()
    }

    // Session -----------------------------------------------------------

    /// Whether the process thread is up and processing.
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.active.load(Ordering::Acquire)
    }

    /// The process thread died of a fault and `stop` has not been called.
    pub fn is_halted(&self) -> bool {
        self.thread.is_some()
            && self.shared.run.load(Ordering::Acquire)
            && !self.shared.active.load(Ordering::Acquire)
    }

    pub fn start(&mut self, for_latency_measurement: bool) -> Result<()> {
        if self.is_running() {
            warn!(instance = %self.instance_name, "backend is already running");
            return Err(BackendError::AlreadyRunning);
        }
        if self.thread.is_some() || self.shared.run.load(Ordering::Acquire) {
            info!(instance = %self.instance_name, "recovering halted session");
            self.stop()?;
        }
        self.config.validate()?;
        if !self.config.has_device() {
            return Err(BackendError::NoDeviceSelected);
        }

        let mut driver = self.driver.take().ok_or(BackendError::ProcessThreadLost)?;
        let mut engine = self.engine.take().unwrap_or_else(|| Box::new(SilentEngine));
        let session = match self.open_session(driver.as_mut(), engine.as_mut(), for_latency_measurement)
        {
            Ok(session) => session,
            Err(err) => {
                error!(instance = %self.instance_name, %err, "failed to start backend");
                self.driver = Some(driver);
                self.engine = Some(engine);
                return Err(err);
            }
        };
        self.launch(driver, engine, session)
    }

    /// Reserves and opens the device, reports the negotiated parameters and
    /// registers physical ports and slaves. On error nothing stays open.
    fn open_session(
        &mut self,
        driver: &mut dyn DeviceDriver,
        engine: &mut dyn AudioEngine,
        for_latency_measurement: bool,
    ) -> Result<Session> {
        let devices = driver.devices()?;
        let capture = self.resolve_device(&devices, &self.config.input_device)?;
        let playback = self.resolve_device(&devices, &self.config.output_device)?;
        let primary = playback.or(capture).cloned().unwrap_or_default();

        let reservation = match &self.config.reservation_helper {
            Some(helper) => Some(DeviceReservation::acquire(
                helper,
                &primary.driver_id,
                self.config.reservation_timeout(),
            )?),
            None => None,
        };

        let request = OpenRequest {
            capture_device: capture.map(|device| device.name.clone()),
            playback_device: playback.map(|device| device.name.clone()),
            sample_rate: self.config.sample_rate,
            buffer_size: self.config.buffer_size,
            periods: self.config.periods,
            capture_channels: self.config.input_channels,
            playback_channels: self.config.output_channels,
        };
        let negotiated = driver
            .open(&request)
            .map_err(|source| BackendError::AudioDeviceOpen {
                device: primary.name.clone(),
                source,
            })?;
        self.accept_negotiated(&request, &negotiated);

        let midi = match driver.open_midi(&self.config.midi_option, &self.config.disabled_midi_devices)
        {
            Ok(midi) => midi,
            Err(err) => {
                warn!(%err, option = %self.config.midi_option, "MIDI unavailable");
                Vec::new()
            }
        };

        engine.sample_rate_changed(negotiated.sample_rate);
        engine.buffer_size_changed(negotiated.buffer_size);

        let physical = {
            let mut ports = self.shared.ports.lock();
            match self.register_physical_ports(&mut ports, &negotiated, &midi, for_latency_measurement)
            {
                Ok(physical) => physical,
                Err(err) => {
                    remove_system_ports(&mut ports);
                    driver.close();
                    return Err(err.into());
                }
            }
        };

        {
            let mut ports = self.shared.ports.lock();
            for slave in &mut self.slaves {
                if let Err(err) = slave.open(
                    negotiated.sample_rate,
                    negotiated.buffer_size,
                    negotiated.periods,
                    &mut ports,
                ) {
                    warn!(slave = slave.name(), %err, "skipping slave device");
                }
            }
        }

        self.cache = Enumeration {
            sample_rates: driver.available_sample_rates(&primary.name),
            buffer_sizes: driver.available_buffer_sizes(&primary.name),
            midi_options: driver.midi_options(),
            midi_devices: driver.midi_devices(&self.config.midi_option),
            devices,
        };

        Ok(Session {
            negotiated,
            physical,
            reservation,
            for_latency_measurement,
        })
    }

    fn resolve_device<'a>(&self, devices: &'a [DeviceInfo], name: &str) -> Result<Option<&'a DeviceInfo>> {
        if !is_device(name) {
            return Ok(None);
        }
        devices
            .iter()
            .find(|device| device.name == name)
            .map(Some)
            .ok_or_else(|| BackendError::AudioDeviceOpen {
                device: name.to_string(),
                source: DriverError::DeviceNotFound(name.to_string()),
            })
    }

    fn accept_negotiated(&self, request: &OpenRequest, negotiated: &NegotiatedConfig) {
        if negotiated.sample_rate != request.sample_rate {
            warn!(
                requested = request.sample_rate,
                actual = negotiated.sample_rate,
                "device adjusted the sample rate"
            );
        }
        if negotiated.buffer_size != request.buffer_size {
            warn!(
                requested = request.buffer_size,
                actual = negotiated.buffer_size,
                "device adjusted the buffer size"
            );
        }
        if request.capture_channels > negotiated.capture_channels {
            warn!(
                requested = request.capture_channels,
                available = negotiated.capture_channels,
                "clamping capture channels to the device"
            );
        }
        if request.playback_channels > negotiated.playback_channels {
            warn!(
                requested = request.playback_channels,
                available = negotiated.playback_channels,
                "clamping playback channels to the device"
            );
        }
    }

    fn register_physical_ports(
        &self,
        ports: &mut PortGraph,
        negotiated: &NegotiatedConfig,
        midi: &[MidiDeviceInfo],
        measuring: bool,
    ) -> port_engine::Result<PhysicalPorts> {
        let period = negotiated.buffer_size;
        let terminal = PortFlags::PHYSICAL | PortFlags::TERMINAL;
        let mut physical = PhysicalPorts::default();

        let capture_latency = self.physical_latency(period, false, measuring);
        for index in 0..negotiated.capture_channels {
            let name = format!("system:capture_{}", index + 1);
            let id = ports.add_port(&name, PortKind::Audio, PortFlags::OUTPUT | terminal)?;
            ports.set_latency_range(id, false, capture_latency)?;
            physical.audio_in.push(id);
        }
        let playback_latency = self.physical_latency(period, true, measuring);
        for index in 0..negotiated.playback_channels {
            let name = format!("system:playback_{}", index + 1);
            let id = ports.add_port(&name, PortKind::Audio, PortFlags::INPUT | terminal)?;
            ports.set_latency_range(id, true, playback_latency)?;
            physical.audio_out.push(id);
        }
        for device in midi {
            if device.capture {
                physical.add_midi(ports, &device.name, MidiDirection::Capture, period)?;
            }
            if device.playback {
                physical.add_midi(ports, &device.name, MidiDirection::Playback, period)?;
            }
        }
        Ok(physical)
    }

    /// Spawns the process thread and waits for it to report in.
    fn launch(
        &mut self,
        mut driver: Box<dyn DeviceDriver>,
        engine: Box<dyn AudioEngine>,
        session: Session,
    ) -> Result<()> {
        let negotiated = session.negotiated;
        let settings = LoopSettings {
            sample_rate: negotiated.sample_rate,
            buffer_size: negotiated.buffer_size,
            bailout_cycles: self
                .config
                .xrun_bailout_cycles(negotiated.sample_rate, negotiated.buffer_size),
            wait_timeout: device_wait_timeout(negotiated.sample_rate, negotiated.buffer_size),
            dll_bandwidth: self.config.dll_bandwidth,
        };
        let hints = RealtimeHints {
            priority: self.config.realtime_priority,
            lock_memory: self.config.lock_memory,
        };

        let (freewheel, responder) = freewheel_channel();
        self.freewheel = freewheel;
        let graph = {
            let ports = self.shared.ports.lock();
            PortGraph::mirror(&ports, negotiated.buffer_size as usize)
        };
        self.shared
            .stats
            .configure(negotiated.sample_rate, negotiated.buffer_size);
        self.shared.run.store(true, Ordering::Release);

        let (context_tx, context_rx) = bounded::<RealtimeContext>(1);
        let (ready_tx, ready_rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let thread_name = format!("{}-process", self.instance_name);
        let spawned = spawn_realtime(&thread_name, hints, move || {
            let context = context_rx.recv().ok()?;
            Some(process::run(context, shared, settings, ready_tx))
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.run.store(false, Ordering::Release);
                driver.close();
                self.driver = Some(driver);
                self.engine = Some(engine);
                self.teardown_ports();
                drop(session);
                return Err(BackendError::ProcessThreadStart(err.to_string()));
            }
        };

        let context = RealtimeContext {
            engine,
            driver,
            slaves: std::mem::take(&mut self.slaves),
            graph,
            freewheel: responder,
            physical: session.physical.clone(),
        };
        self.thread = Some(handle);
        self.session = Some(session);
        if let Err(SendError(context)) = context_tx.send(context) {
            self.driver = Some(context.driver);
            self.engine = Some(context.engine);
            self.slaves = context.slaves;
            self.stop()?;
            return Err(BackendError::ProcessThreadStart(
                "process thread exited early".into(),
            ));
        }

        match ready_rx.recv_timeout(self.start_timeout) {
            Ok(Ok(())) => {
                info!(
                    instance = %self.instance_name,
                    driver = %self.driver_name,
                    rate = negotiated.sample_rate,
                    period = negotiated.buffer_size,
                    capture = negotiated.capture_channels,
                    playback = negotiated.playback_channels,
                    "backend started"
                );
                Ok(())
            }
            Ok(Err(source)) => {
                let device = self.primary_device_name();
                self.stop()?;
                Err(BackendError::AudioDeviceOpen { device, source })
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                error!(instance = %self.instance_name, "process thread did not start");
                self.shared.run.store(false, Ordering::Release);
                Err(BackendError::ProcessThreadStart(
                    "timed out waiting for the process thread".into(),
                ))
            }
        }
    }

    fn primary_device_name(&self) -> String {
        if is_device(&self.config.output_device) {
            self.config.output_device.clone()
        } else {
            self.config.input_device.clone()
        }
    }

    /// Stops the process thread and closes the session. Safe to call at any
    /// time, including after a fault and repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.run.store(false, Ordering::Release);
        let mut result = Ok(());
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(Some(context)) => {
                    self.driver = Some(context.driver);
                    self.engine = Some(context.engine);
                    self.slaves = context.slaves;
                }
                Ok(None) => debug!("process thread exited before receiving its context"),
                Err(_) => {
                    error!(instance = %self.instance_name, "process thread panicked");
                    result = Err(BackendError::ProcessThreadLost);
                }
            }
        }
        self.shared.active.store(false, Ordering::Release);

        if let Some(session) = self.session.take() {
            if let Some(driver) = self.driver.as_mut() {
                if let Err(err) = driver.stop() {
                    debug!(%err, "device stop reported an error");
                }
                driver.close();
            }
            self.teardown_ports();
            if let Some(reservation) = session.reservation {
                debug!(resource = reservation.resource(), "releasing device reservation");
            }
            info!(instance = %self.instance_name, "backend stopped");
        }
        self.freewheel.reset();
        result
    }

    fn teardown_ports(&mut self) {
        let mut ports = self.shared.ports.lock();
        for slave in &mut self.slaves {
            slave.close(&mut ports);
        }
        remove_system_ports(&mut ports);
    }

    // Freewheeling ------------------------------------------------------

    /// Asks the process thread to enter or leave freewheeling. Repeating
    /// the current request is a no-op.
    pub fn freewheel(&mut self, onoff: bool) -> Result<()> {
        if !self.is_running() {
            return Err(BackendError::NotRunning);
        }
        self.freewheel.request(onoff)?;
        Ok(())
    }

    pub fn is_freewheeling(&self) -> bool {
        self.freewheel.is_active()
    }

    /// Waits for the process thread to acknowledge a freewheel transition.
    pub fn wait_freewheel_ack(&self, timeout: Duration) -> Option<bool> {
        self.freewheel.wait_ack(timeout)
    }

    // Session info ------------------------------------------------------

    pub fn sample_rate(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.config.sample_rate, |session| session.negotiated.sample_rate)
    }

    pub fn buffer_size(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.config.buffer_size, |session| session.negotiated.buffer_size)
    }

    pub fn periods(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.config.periods, |session| session.negotiated.periods)
    }

    pub fn systemic_input_latency(&self) -> u32 {
        self.config.systemic_input_latency
    }

    pub fn systemic_output_latency(&self) -> u32 {
        self.config.systemic_output_latency
    }

    pub fn sample_time(&self) -> u64 {
        self.shared.stats.sample_time()
    }

    pub fn sample_time_at_cycle_start(&self) -> u64 {
        self.shared.stats.sample_time_at_cycle_start()
    }

    pub fn samples_since_cycle_start(&self) -> u32 {
        if !self.is_running() {
            return 0;
        }
        self.shared.stats.samples_since_cycle_start()
    }

    /// DSP load in percent.
    pub fn dsp_load(&self) -> f32 {
        self.shared.stats.dsp_load()
    }

    pub fn xrun_count(&self) -> u64 {
        self.shared.stats.xrun_count()
    }

    /// Outgoing MIDI events the device refused.
    pub fn midi_drop_count(&self) -> u64 {
        self.shared.stats.midi_drop_count()
    }

    // Ports -------------------------------------------------------------

    /// Registers an engine port named `<instance>:<name>`.
    pub fn register_port(&self, name: &str, kind: PortKind, flags: PortFlags) -> Result<PortId> {
        if name.is_empty() {
            return Err(PortError::InvalidName.into());
        }
        if flags.is_physical() {
            return Err(PortError::PhysicalPortReserved.into());
        }
        let full = format!("{}:{}", self.instance_name, name);
        Ok(self.shared.ports.lock().add_port(&full, kind, flags)?)
    }

    /// Removes an engine port. Unknown handles and backend-owned ports are
    /// logged and ignored.
    pub fn unregister_port(&self, port: PortId) {
        let mut ports = self.shared.ports.lock();
        match ports.port_flags(port) {
            Ok(flags) if flags.is_physical() => {
                warn!(?port, "refusing to unregister a physical port");
            }
            Ok(_) => {
                if let Err(err) = ports.unregister_port(port) {
                    warn!(%err, "failed to unregister port");
                }
            }
            Err(err) => warn!(%err, "unregister_port: invalid port"),
        }
    }

    pub fn set_port_name(&self, port: PortId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(PortError::InvalidName.into());
        }
        let mut ports = self.shared.ports.lock();
        if ports.port_flags(port)?.is_physical() {
            return Err(PortError::PhysicalPortReserved.into());
        }
        let full = format!("{}:{}", self.instance_name, name);
        Ok(ports.set_port_name(port, &full)?)
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.shared.ports.lock().port_by_name(name)
    }

    pub fn port_name(&self, port: PortId) -> Result<String> {
        Ok(self.shared.ports.lock().port_name(port)?.to_string())
    }

    pub fn port_kind(&self, port: PortId) -> Result<PortKind> {
        Ok(self.shared.ports.lock().port_kind(port)?)
    }

    pub fn port_flags(&self, port: PortId) -> Result<PortFlags> {
        Ok(self.shared.ports.lock().port_flags(port)?)
    }

    pub fn ports(&self, pattern: &str, kind: PortKind, flags: PortFlags) -> Vec<String> {
        self.shared.ports.lock().ports(pattern, kind, flags)
    }

    pub fn connect(&self, src: PortId, dst: PortId) -> Result<()> {
        Ok(self.shared.ports.lock().connect(src, dst)?)
    }

    pub fn connect_by_name(&self, src: &str, dst: &str) -> Result<()> {
        Ok(self.shared.ports.lock().connect_by_name(src, dst)?)
    }

    pub fn disconnect(&self, src: PortId, dst: PortId) -> Result<()> {
        Ok(self.shared.ports.lock().disconnect(src, dst)?)
    }

    pub fn disconnect_by_name(&self, src: &str, dst: &str) -> Result<()> {
        Ok(self.shared.ports.lock().disconnect_by_name(src, dst)?)
    }

    pub fn disconnect_all(&self, port: PortId) -> Result<()> {
        Ok(self.shared.ports.lock().disconnect_all(port)?)
    }

    pub fn is_connected(&self, port: PortId) -> Result<bool> {
        Ok(self.shared.ports.lock().is_connected(port)?)
    }

    pub fn connected_to(&self, a: PortId, b: PortId) -> bool {
        self.shared.ports.lock().connected_to(a, b)
    }

    pub fn physically_connected(&self, port: PortId) -> Result<bool> {
        Ok(self.shared.ports.lock().physically_connected(port)?)
    }

    pub fn connections(&self, port: PortId) -> Result<Vec<String>> {
        Ok(self.shared.ports.lock().connections(port)?)
    }

    pub fn physical_inputs(&self, kind: PortKind) -> Vec<String> {
        self.shared.ports.lock().physical_inputs(kind)
    }

    pub fn physical_outputs(&self, kind: PortKind) -> Vec<String> {
        self.shared.ports.lock().physical_outputs(kind)
    }

    /// `(physical inputs, physical outputs)` per data type.
    pub fn physical_counts(&self) -> (ChanCount, ChanCount) {
        self.shared.ports.lock().physical_counts()
    }

    pub fn set_latency_range(&self, port: PortId, for_playback: bool, range: LatencyRange) -> Result<()> {
        Ok(self
            .shared
            .ports
            .lock()
            .set_latency_range(port, for_playback, range)?)
    }

    pub fn latency_range(&self, port: PortId, for_playback: bool) -> Result<LatencyRange> {
        Ok(self.shared.ports.lock().latency_range(port, for_playback)?)
    }
}

fn remove_system_ports(ports: &mut PortGraph) -> usize {
    ports.remove_ports_where(|name, _, flags| flags.is_physical() && name.starts_with("system:"))
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "failed to stop backend on drop");
        }
    }
}
