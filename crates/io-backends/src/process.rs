//! The process thread.
//!
//! Owns the engine, the driver, the slaves and a mirror of the port graph
//! for the duration of a session and hands them back when it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use engine_rt::{CycleStats, DelayLockedLoop, DspLoadMeter, FreewheelResponder};
use parking_lot::Mutex;
use port_engine::{LatencyRange, PortFlags, PortGraph, PortId, PortKind, ProcessScope};
use tracing::{debug, error, info, warn};

use crate::driver::{DeviceDriver, HotplugEvent, MidiDirection};
use crate::engine::AudioEngine;
use crate::error::DriverError;
use crate::slave::SlaveDevice;

const FREEWHEEL_SLEEP: Duration = Duration::from_micros(100);

/// State shared between the control side and the process thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) run: AtomicBool,
    pub(crate) active: AtomicBool,
    pub(crate) stats: CycleStats,
    /// Topology authority. Locked by the control side, only try-locked by
    /// the process thread.
    pub(crate) ports: Mutex<PortGraph>,
}

/// Physical system ports of the primary device.
#[derive(Debug, Default, Clone)]
pub(crate) struct PhysicalPorts {
    pub(crate) audio_in: Vec<PortId>,
    pub(crate) audio_out: Vec<PortId>,
    pub(crate) midi_in: Vec<(String, PortId)>,
    pub(crate) midi_out: Vec<(String, PortId)>,
    pub(crate) next_midi_in: usize,
    pub(crate) next_midi_out: usize,
}

impl PhysicalPorts {
    pub(crate) fn add_midi(
        &mut self,
        graph: &mut PortGraph,
        device: &str,
        direction: MidiDirection,
        period: u32,
    ) -> port_engine::Result<PortId> {
        let terminal = PortFlags::PHYSICAL | PortFlags::TERMINAL;
        let (name, flags, for_playback) = match direction {
            MidiDirection::Capture => {
                self.next_midi_in += 1;
                (
                    format!("system:midi_capture_{}", self.next_midi_in),
                    PortFlags::OUTPUT | terminal,
                    false,
                )
            }
            MidiDirection::Playback => {
                self.next_midi_out += 1;
                (
                    format!("system:midi_playback_{}", self.next_midi_out),
                    PortFlags::INPUT | terminal,
                    true,
                )
            }
        };
        let id = graph.add_port(&name, PortKind::Midi, flags)?;
        graph.set_latency_range(id, for_playback, LatencyRange::fixed(period))?;
        let entry = (device.to_string(), id);
        match direction {
            MidiDirection::Capture => self.midi_in.push(entry),
            MidiDirection::Playback => self.midi_out.push(entry),
        }
        Ok(id)
    }

    fn remove_midi(&mut self, graph: &mut PortGraph, device: &str, direction: MidiDirection) -> bool {
        let list = match direction {
            MidiDirection::Capture => &mut self.midi_in,
            MidiDirection::Playback => &mut self.midi_out,
        };
        let Some(index) = list.iter().position(|(name, _)| name == device) else {
            return false;
        };
        let (_, id) = list.remove(index);
        if let Err(err) = graph.unregister_port(id) {
            warn!(%err, device, "failed to remove MIDI port");
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub(crate) sample_rate: u32,
    pub(crate) buffer_size: u32,
    pub(crate) bailout_cycles: u32,
    pub(crate) wait_timeout: Duration,
    pub(crate) dll_bandwidth: f64,
}

impl LoopSettings {
    fn period(&self) -> Duration {
        Duration::from_nanos(
            u64::from(self.buffer_size) * 1_000_000_000 / u64::from(self.sample_rate.max(1)),
        )
    }
}

/// Everything the process thread owns while a session runs.
pub(crate) struct RealtimeContext {
    pub(crate) engine: Box<dyn AudioEngine>,
    pub(crate) driver: Box<dyn DeviceDriver>,
    pub(crate) slaves: Vec<SlaveDevice>,
    pub(crate) graph: PortGraph,
    pub(crate) freewheel: FreewheelResponder,
    pub(crate) physical: PhysicalPorts,
}

struct ProcessLoop {
    ctx: RealtimeContext,
    shared: Arc<Shared>,
    settings: LoopSettings,
    dll: DelayLockedLoop,
    meter: DspLoadMeter,
    consecutive_xruns: u32,
    freewheeling: bool,
    midi_failing: bool,
}

/// Body of the process thread. Reports start-up on `ready` and returns the
/// context when the session ends.
pub(crate) fn run(
    ctx: RealtimeContext,
    shared: Arc<Shared>,
    settings: LoopSettings,
    ready: Sender<Result<(), DriverError>>,
) -> RealtimeContext {
    let mut process = ProcessLoop {
        dll: DelayLockedLoop::new(settings.sample_rate, settings.buffer_size, settings.dll_bandwidth),
        meter: DspLoadMeter::default(),
        consecutive_xruns: 0,
        freewheeling: false,
        midi_failing: false,
        ctx,
        shared,
        settings,
    };

    if let Err(err) = process.ctx.driver.start() {
        error!(%err, "failed to start device");
        let _ = ready.send(Err(err));
        return process.ctx;
    }
    if !process.shared.run.load(Ordering::Acquire) {
        warn!("session abandoned while the device was starting");
        if let Err(err) = process.ctx.driver.stop() {
            debug!(%err, "device stop reported an error");
        }
        return process.ctx;
    }
    process.shared.stats.reset();
    process.shared.active.store(true, Ordering::Release);
    let _ = ready.send(Ok(()));
    info!(
        rate = settings.sample_rate,
        period = settings.buffer_size,
        "process thread running"
    );

    process.ctx.engine.ports_registered();
    process.ctx.engine.graph_reordered();

    let fault = process.run_loop();

    if let Err(err) = process.ctx.driver.stop() {
        debug!(%err, "device stop reported an error");
    }
    process.shared.active.store(false, Ordering::Release);
    if let Some(reason) = fault {
        if process.shared.run.load(Ordering::Acquire) {
            error!(%reason, "process thread halted");
            process.ctx.engine.halted(&reason);
        }
    }
    process.ctx
}

fn apply_hotplug(
    physical: &mut PhysicalPorts,
    ports: &mut PortGraph,
    event: HotplugEvent,
    period: u32,
) {
    match event {
        HotplugEvent::Added { device, direction } => {
            match physical.add_midi(ports, &device, direction, period) {
                Ok(_) => info!(%device, ?direction, "MIDI device added"),
                Err(err) => warn!(%err, %device, "failed to register MIDI device"),
            }
        }
        HotplugEvent::Removed { device, direction } => {
            if physical.remove_midi(ports, &device, direction) {
                info!(%device, ?direction, "MIDI device removed");
            }
        }
    }
}

impl ProcessLoop {
    fn run_loop(&mut self) -> Option<String> {
        while self.shared.run.load(Ordering::Acquire) {
            self.cycle_boundary();

            if let Some(onoff) = self.ctx.freewheel.pending() {
                if let Err(reason) = self.set_freewheel(onoff) {
                    return Some(reason);
                }
            }

            let result = if self.freewheeling {
                self.freewheel_cycle()
            } else {
                self.device_cycle()
            };
            if let Err(reason) = result {
                return Some(reason);
            }
        }
        None
    }

    /// Picks up topology changes, hot-plug events and slave bookkeeping if
    /// the port lock is free, then delivers notifications with the lock
    /// released.
    fn cycle_boundary(&mut self) {
        let changes = {
            let Some(mut ports) = self.shared.ports.try_lock() else {
                return;
            };
            while let Some(event) = self.ctx.driver.poll_hotplug() {
                apply_hotplug(
                    &mut self.ctx.physical,
                    &mut ports,
                    event,
                    self.settings.buffer_size,
                );
            }
            for slave in &mut self.ctx.slaves {
                slave.apply_to_graph(&mut ports);
            }
            if ports.generation() != self.ctx.graph.generation() {
                self.ctx.graph.sync_topology_from(&ports);
            }
            if !ports.has_pending_changes() {
                return;
            }
            ports.take_changes()
        };

        let engine = &mut self.ctx.engine;
        if changes.ports_changed {
            engine.ports_registered();
        }
        for change in &changes.connections {
            engine.connection_changed(&change.a, &change.b, change.connected);
        }
        let reordered = changes.ports_changed || !changes.connections.is_empty();
        if reordered {
            engine.graph_reordered();
        }
        if reordered || changes.latency_changed {
            engine.latency_changed(false);
            engine.latency_changed(true);
        }
    }

    fn set_freewheel(&mut self, onoff: bool) -> Result<(), String> {
        if onoff {
            if let Err(err) = self.ctx.driver.stop() {
                warn!(%err, "failed to pause device for freewheeling");
            }
        } else {
            self.ctx
                .driver
                .start()
                .map_err(|err| format!("failed to restart device after freewheeling: {err}"))?;
        }
        self.freewheeling = onoff;
        self.consecutive_xruns = 0;
        self.meter.reset();
        self.shared.stats.set_dsp_load(0.0);
        self.dll = DelayLockedLoop::new(
            self.settings.sample_rate,
            self.settings.buffer_size,
            self.settings.dll_bandwidth,
        );
        for slave in &mut self.ctx.slaves {
            slave.force_drain();
        }
        self.ctx.engine.freewheel(onoff);
        self.ctx.freewheel.acknowledge(onoff);
        info!(freewheel = onoff, "freewheel state changed");
        Ok(())
    }

    fn freewheel_cycle(&mut self) -> Result<(), String> {
        let frames = self.settings.buffer_size as usize;
        self.shared.stats.begin_cycle(Duration::ZERO);
        self.ctx.graph.silence_outputs(frames, true);
        self.ctx.graph.silence_outputs(frames, false);
        {
            let mut scope =
                ProcessScope::new(&mut self.ctx.graph, frames, self.shared.stats.sample_time());
            self.ctx
                .engine
                .process(&mut scope)
                .map_err(|err| format!("process callback failed: {err:#}"))?;
        }
        thread::sleep(FREEWHEEL_SLEEP);
        self.shared.stats.advance(self.settings.buffer_size);
        self.shared.stats.set_dsp_load(100.0);
        Ok(())
    }

    fn device_cycle(&mut self) -> Result<(), String> {
        let status = self
            .ctx
            .driver
            .wait(self.settings.wait_timeout)
            .map_err(|err| format!("device wait failed: {err}"))?;

        // A wait that times out without data means the device stalled.
        if status.xrun || status.frames == 0 {
            self.note_xrun()?;
        }

        let period = self.settings.buffer_size;
        if status.frames < period {
            return Ok(());
        }

        self.dll.update(self.shared.stats.now_secs());
        self.shared
            .stats
            .begin_cycle(Duration::from_secs_f64(self.dll.period_estimate().max(0.0)));
        let speed = self.dll.speed();
        for slave in &mut self.ctx.slaves {
            slave.cycle_start(speed);
        }

        let mut available = status.frames;
        while available >= period {
            self.process_period()?;
            available -= period;
        }

        for slave in &mut self.ctx.slaves {
            slave.cycle_end();
        }
        Ok(())
    }

    fn note_xrun(&mut self) -> Result<(), String> {
        self.consecutive_xruns += 1;
        self.shared.stats.register_xrun();
        self.ctx.engine.xrun();
        if self.consecutive_xruns > self.settings.bailout_cycles {
            return Err(format!(
                "too many xruns ({} consecutive)",
                self.consecutive_xruns
            ));
        }
        Ok(())
    }

    fn process_period(&mut self) -> Result<(), String> {
        let started = Instant::now();
        let frames = self.settings.buffer_size as usize;
        let ctx = &mut self.ctx;

        for (channel, port) in ctx.physical.audio_in.iter().enumerate() {
            if let Ok(dst) = ctx.graph.audio_buffer_mut(*port, frames) {
                ctx.driver.read_channel(channel, dst);
            }
        }
        ctx.driver.capture_done(self.settings.buffer_size);

        for (device, port) in &ctx.physical.midi_in {
            if let Ok(buffer) = ctx.graph.midi_buffer_mut(*port) {
                buffer.clear();
                ctx.driver.receive_midi(device, &mut |timestamp, bytes| {
                    // Late or malformed events from the device are dropped.
                    let _ = buffer.push(timestamp, bytes);
                });
            }
        }

        for slave in &mut ctx.slaves {
            slave.capture_into(&mut ctx.graph, frames);
        }

        ctx.graph.silence_outputs(frames, false);
        {
            let mut scope =
                ProcessScope::new(&mut ctx.graph, frames, self.shared.stats.sample_time());
            ctx.engine
                .process(&mut scope)
                .map_err(|err| format!("process callback failed: {err:#}"))?;
        }

        for (device, port) in &ctx.physical.midi_out {
            if let Ok(buffer) = ctx.graph.midi_buffer(*port) {
                for event in buffer {
                    match ctx.driver.send_midi(device, event.timestamp(), event.data()) {
                        Ok(()) if self.midi_failing => {
                            self.midi_failing = false;
                            info!(%device, "MIDI output recovered");
                        }
                        Ok(()) => {}
                        Err(err) => {
                            self.shared.stats.register_midi_drop();
                            if !self.midi_failing {
                                self.midi_failing = true;
                                warn!(%err, %device, "dropping MIDI output");
                            }
                        }
                    }
                }
            }
        }

        for (channel, port) in ctx.physical.audio_out.iter().enumerate() {
            if let Ok(src) = ctx.graph.audio_buffer(*port, frames) {
                ctx.driver.write_channel(channel, src);
            }
        }

        for slave in &mut ctx.slaves {
            slave.playback_from(&mut ctx.graph, frames);
        }

        ctx.driver
            .playback_done(self.settings.buffer_size)
            .map_err(|err| format!("device write failed: {err}"))?;

        self.shared.stats.advance(self.settings.buffer_size);
        self.consecutive_xruns = 0;
        let load = self.meter.update(started.elapsed(), self.settings.period());
        self.shared.stats.set_dsp_load(load);
        Ok(())
    }
}
