//! Secondary devices kept in step with the primary clock.
//!
//! A slave is polled once per primary period. Captured audio goes through a
//! FIFO that the primary reads with linear interpolation at a ratio derived
//! from the FIFO fill level and the primary's clock speed; playback runs the
//! same way in the other direction. A slave that fails is halted, and at the
//! next cycle boundary its ports are removed and it is marked dead. The
//! primary never stops because of a slave.

use std::collections::VecDeque;
use std::time::Duration;

use port_engine::{LatencyRange, PortFlags, PortGraph, PortId, PortKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::driver::{DeviceDriver, NegotiatedConfig, OpenRequest};
use crate::error::{BackendError, Result};

/// Device periods exchanged with a slave per primary period, at most.
const MAX_POLLS_PER_CYCLE: usize = 4;
/// Proportional gain of the fill-level controller.
const FILL_GAIN: f64 = 1e-3;
/// One-pole smoothing applied to ratio updates.
const RATIO_SMOOTHING: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveMode {
    CaptureOnly,
    PlaybackOnly,
    Full,
}

impl SlaveMode {
    pub fn captures(self) -> bool {
        matches!(self, SlaveMode::CaptureOnly | SlaveMode::Full)
    }

    pub fn plays(self) -> bool {
        matches!(self, SlaveMode::PlaybackOnly | SlaveMode::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveState {
    Active,
    Halted,
    Dead,
}

/// FIFO read back at an arbitrary rate with linear interpolation.
#[derive(Debug, Default, Clone)]
pub struct ResamplingFifo {
    samples: VecDeque<f32>,
    phase: f64,
}

impl ResamplingFifo {
    pub fn push(&mut self, src: &[f32]) {
        self.samples.extend(src.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.phase = 0.0;
    }

    /// Fills `dst` reading `ratio` input samples per output sample. On
    /// underflow `dst` is silenced, the FIFO is left untouched and `false`
    /// is returned.
    pub fn pull(&mut self, ratio: f64, dst: &mut [f32]) -> bool {
        let needed = (self.phase + ratio * dst.len() as f64).floor() as usize + 2;
        if self.samples.len() < needed {
            dst.fill(0.0);
            return false;
        }
        let mut position = self.phase;
        for out in dst.iter_mut() {
            let index = position as usize;
            let frac = (position - index as f64) as f32;
            let a = self.samples[index];
            let b = self.samples[index + 1];
            *out = a + (b - a) * frac;
            position += ratio;
        }
        let consumed = position.floor() as usize;
        self.samples.drain(..consumed);
        self.phase = position - consumed as f64;
        true
    }
}

/// Slave description collected while the backend is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfig {
    pub name: String,
    pub device: String,
    pub mode: SlaveMode,
}

pub struct SlaveDevice {
    config: SlaveConfig,
    driver: Box<dyn DeviceDriver>,
    state: SlaveState,
    session: Option<NegotiatedConfig>,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    capture: Vec<ResamplingFifo>,
    playback: Vec<ResamplingFifo>,
    scratch: Vec<f32>,
    nominal_ratio: f64,
    ratio: f64,
    target_fill: usize,
    primary_period: u32,
    primed: bool,
    underflowed: bool,
    drain_requested: bool,
    reported_latency: u32,
    pending_latency: Option<u32>,
    halt_reason: Option<String>,
}

impl std::fmt::Debug for SlaveDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveDevice")
            .field("config", &self.config)
            .field("driver", &self.driver.name())
            .field("state", &self.state)
            .field("ratio", &self.ratio)
            .finish()
    }
}

impl SlaveDevice {
    pub fn new(config: SlaveConfig, driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            config,
            driver,
            state: SlaveState::Dead,
            session: None,
            capture_ports: Vec::new(),
            playback_ports: Vec::new(),
            capture: Vec::new(),
            playback: Vec::new(),
            scratch: Vec::new(),
            nominal_ratio: 1.0,
            ratio: 1.0,
            target_fill: 0,
            primary_period: 0,
            primed: false,
            underflowed: false,
            drain_requested: false,
            reported_latency: 0,
            pending_latency: None,
            halt_reason: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    fn owns_port(&self, name: &str) -> bool {
        name.strip_prefix(self.config.name.as_str())
            .map_or(false, |rest| rest.starts_with(':'))
    }

    /// Opens and starts the slave device and registers its ports. Runs on the
    /// control thread while the backend is starting.
    pub(crate) fn open(
        &mut self,
        sample_rate: u32,
        buffer_size: u32,
        periods: u32,
        graph: &mut PortGraph,
    ) -> Result<()> {
        let mode = self.config.mode;
        let request = OpenRequest {
            capture_device: mode.captures().then(|| self.config.device.clone()),
            playback_device: mode.plays().then(|| self.config.device.clone()),
            sample_rate,
            buffer_size,
            periods,
            capture_channels: 0,
            playback_channels: 0,
        };
        let session = self
            .driver
            .open(&request)
            .map_err(|source| BackendError::AudioDeviceOpen {
                device: self.config.device.clone(),
                source,
            })?;

        self.capture_ports.clear();
        self.playback_ports.clear();
        let registered = self.register_ports(&session, buffer_size, graph);
        let started = registered.and_then(|()| self.driver.start().map_err(BackendError::from));
        if let Err(err) = started {
            graph.remove_ports_where(|name, _, _| self.owns_port(name));
            self.driver.close();
            return Err(err);
        }

        self.capture = vec![ResamplingFifo::default(); self.capture_ports.len()];
        self.playback = vec![ResamplingFifo::default(); self.playback_ports.len()];
        self.scratch = vec![0.0; session.buffer_size.max(buffer_size) as usize * 2];
        self.nominal_ratio = f64::from(session.sample_rate) / f64::from(sample_rate.max(1));
        self.ratio = self.nominal_ratio;
        self.target_fill = Self::initial_fill(&session, buffer_size);
        self.primary_period = buffer_size;
        self.primed = false;
        self.underflowed = false;
        self.drain_requested = false;
        self.reported_latency = buffer_size + self.target_fill as u32;
        self.pending_latency = None;
        self.halt_reason = None;
        self.session = Some(session);
        self.state = SlaveState::Active;
        info!(
            slave = %self.config.name,
            device = %self.config.device,
            rate = session.sample_rate,
            "slave device started"
        );
        Ok(())
    }

    /// One slave period plus one primary period of buffering.
    fn initial_fill(session: &NegotiatedConfig, buffer_size: u32) -> usize {
        (session.buffer_size + buffer_size) as usize
    }

    fn register_ports(
        &mut self,
        session: &NegotiatedConfig,
        buffer_size: u32,
        graph: &mut PortGraph,
    ) -> Result<()> {
        let latency = LatencyRange::fixed(buffer_size + Self::initial_fill(session, buffer_size) as u32);
        let terminal = PortFlags::PHYSICAL | PortFlags::TERMINAL;
        for index in 0..session.capture_channels {
            let name = format!("{}:capture_{}", self.config.name, index + 1);
            let id = graph.add_port(&name, PortKind::Audio, PortFlags::OUTPUT | terminal)?;
            graph.set_latency_range(id, false, latency)?;
            self.capture_ports.push(id);
        }
        for index in 0..session.playback_channels {
            let name = format!("{}:playback_{}", self.config.name, index + 1);
            let id = graph.add_port(&name, PortKind::Audio, PortFlags::INPUT | terminal)?;
            graph.set_latency_range(id, true, latency)?;
            self.playback_ports.push(id);
        }
        Ok(())
    }

    /// Stops and closes the device and removes any ports still registered.
    pub(crate) fn close(&mut self, graph: &mut PortGraph) {
        if self.session.take().is_some() {
            if let Err(err) = self.driver.stop() {
                warn!(slave = %self.config.name, %err, "failed to stop slave device");
            }
            self.driver.close();
        }
        if self.state != SlaveState::Dead {
            graph.remove_ports_where(|name, _, _| self.owns_port(name));
        }
        self.capture_ports.clear();
        self.playback_ports.clear();
        self.state = SlaveState::Dead;
    }

    pub(crate) fn force_drain(&mut self) {
        self.drain_requested = true;
    }

    fn halt(&mut self, reason: String) {
        if self.state != SlaveState::Active {
            return;
        }
        error!(slave = %self.config.name, %reason, "slave device halted");
        if let Err(err) = self.driver.stop() {
            debug!(slave = %self.config.name, %err, "stopping halted slave failed");
        }
        self.halt_reason = Some(reason);
        self.state = SlaveState::Halted;
    }

    /// Exchanges pending device periods and updates the resampling ratio.
    pub(crate) fn cycle_start(&mut self, master_speed: f64) {
        if self.state != SlaveState::Active {
            return;
        }
        let Some(session) = self.session else { return };
        if self.drain_requested {
            if self.underflowed {
                // Each underflow buys one more slave period of headroom.
                let ceiling = 8 * session.buffer_size.max(1) as usize;
                self.target_fill = (self.target_fill + session.buffer_size as usize).min(ceiling);
                self.underflowed = false;
            }
            self.capture.iter_mut().for_each(ResamplingFifo::clear);
            self.playback.iter_mut().for_each(ResamplingFifo::clear);
            self.ratio = self.nominal_ratio / master_speed.max(f64::EPSILON);
            self.primed = false;
            self.drain_requested = false;
        }

        let period = session.buffer_size as usize;
        for _ in 0..MAX_POLLS_PER_CYCLE {
            if self.config.mode.captures() && self.capture_fill() >= 2 * self.target_fill {
                break;
            }
            match self.driver.wait(Duration::ZERO) {
                Ok(status) if status.frames as usize >= period => {
                    if status.xrun {
                        self.drain_requested = true;
                    }
                    self.exchange_period(period);
                    if let Err(err) = self.driver.playback_done(period as u32) {
                        self.halt(err.to_string());
                        return;
                    }
                }
                Ok(status) => {
                    if status.xrun {
                        self.drain_requested = true;
                    }
                    break;
                }
                Err(err) => {
                    self.halt(err.to_string());
                    return;
                }
            }
        }

        if !self.primed && self.fill_level() >= self.target_fill {
            self.primed = true;
            let latency = self.primary_period + self.target_fill as u32;
            if latency != self.reported_latency {
                self.pending_latency = Some(latency);
            }
        }
        if self.primed {
            let error = (self.fill_level() as f64 - self.target_fill as f64)
                / self.target_fill.max(1) as f64;
            let desired = self.nominal_ratio / master_speed.max(f64::EPSILON)
                * (1.0 + FILL_GAIN * error.clamp(-1.0, 1.0));
            self.ratio += RATIO_SMOOTHING * (desired - self.ratio);
        }
    }

    fn capture_fill(&self) -> usize {
        self.capture.first().map_or(0, ResamplingFifo::len)
    }

    /// Fill level steering the ratio: capture FIFO when capturing, otherwise
    /// the playback FIFO.
    fn fill_level(&self) -> usize {
        if self.config.mode.captures() {
            self.capture_fill()
        } else {
            self.playback.first().map_or(0, ResamplingFifo::len)
        }
    }

    fn exchange_period(&mut self, period: usize) {
        let scratch = &mut self.scratch[..period];
        for (channel, fifo) in self.capture.iter_mut().enumerate() {
            self.driver.read_channel(channel, scratch);
            fifo.push(scratch);
        }
        self.driver.capture_done(period as u32);
        let inverse = 1.0 / self.ratio.max(f64::EPSILON);
        for (channel, fifo) in self.playback.iter_mut().enumerate() {
            if self.primed && !fifo.pull(inverse, scratch) {
                self.drain_requested = true;
            } else if !self.primed {
                scratch.fill(0.0);
            }
            self.driver.write_channel(channel, scratch);
        }
    }

    /// Moves captured audio into the slave's capture ports.
    pub(crate) fn capture_into(&mut self, graph: &mut PortGraph, n_frames: usize) {
        if self.state != SlaveState::Active {
            return;
        }
        for (port, fifo) in self.capture_ports.iter().zip(self.capture.iter_mut()) {
            let Ok(dst) = graph.audio_buffer_mut(*port, n_frames) else {
                continue;
            };
            if !self.primed {
                dst.fill(0.0);
            } else if !fifo.pull(self.ratio, dst) {
                self.underflowed = true;
                self.drain_requested = true;
            }
        }
    }

    /// Queues this period's playback port data for the device.
    pub(crate) fn playback_from(&mut self, graph: &mut PortGraph, n_frames: usize) {
        if self.state != SlaveState::Active {
            return;
        }
        for (port, fifo) in self.playback_ports.iter().zip(self.playback.iter_mut()) {
            if let Ok(src) = graph.audio_buffer(*port, n_frames) {
                fifo.push(src);
            }
        }
    }

    /// Flags FIFO overruns for a drain at the next cycle start.
    pub(crate) fn cycle_end(&mut self) {
        if self.state != SlaveState::Active {
            return;
        }
        let limit = 4 * self.target_fill.max(1);
        let overflow = self
            .capture
            .iter()
            .chain(self.playback.iter())
            .any(|fifo| fifo.len() > limit);
        if overflow {
            debug!(slave = %self.config.name, "slave FIFO overflow, draining");
            self.drain_requested = true;
        }
    }

    /// Applies boundary work that needs the control-side graph: removes the
    /// ports of a halted slave and publishes latency changes. Returns whether
    /// the graph was modified.
    pub(crate) fn apply_to_graph(&mut self, graph: &mut PortGraph) -> bool {
        match self.state {
            SlaveState::Halted => {
                let removed = graph.remove_ports_where(|name, _, _| self.owns_port(name));
                info!(slave = %self.config.name, removed, "removed ports of halted slave");
                self.capture_ports.clear();
                self.playback_ports.clear();
                self.state = SlaveState::Dead;
                true
            }
            SlaveState::Active => {
                let Some(latency) = self.pending_latency.take() else {
                    return false;
                };
                let range = LatencyRange::fixed(latency);
                for port in &self.capture_ports {
                    let _ = graph.set_latency_range(*port, false, range);
                }
                for port in &self.playback_ports {
                    let _ = graph.set_latency_range(*port, true, range);
                }
                self.reported_latency = latency;
                true
            }
            SlaveState::Dead => false,
        }
    }
}
