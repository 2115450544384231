#![allow(dead_code)]

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use io_backends::port_engine::ProcessScope;
use io_backends::{AudioEngine, Backend, BackendConfig, ClockMode, NullDriver, NullHandle};

pub const RATE: u32 = 48_000;
pub const PERIOD: u32 = 256;
pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum Note {
    SampleRate(u32),
    BufferSize(u32),
    Freewheel(bool),
    Xrun,
    Halted(String),
    Latency(bool),
    PortsRegistered,
    Reordered,
    Connection(String, String, bool),
}

type ProcessFn = Box<dyn FnMut(&mut ProcessScope<'_>) -> anyhow::Result<()> + Send>;

/// Engine that reports every notification on a channel.
pub struct RecordingEngine {
    notes: Sender<Note>,
    process: Option<ProcessFn>,
}

impl RecordingEngine {
    pub fn new() -> (Self, Receiver<Note>) {
        let (notes, rx) = unbounded();
        (
            Self {
                notes,
                process: None,
            },
            rx,
        )
    }

    pub fn with_process(
        mut self,
        process: impl FnMut(&mut ProcessScope<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.process = Some(Box::new(process));
        self
    }

    fn note(&self, note: Note) {
        let _ = self.notes.send(note);
    }
}

impl AudioEngine for RecordingEngine {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> anyhow::Result<()> {
        match self.process.as_mut() {
            Some(process) => process(scope),
            None => Ok(()),
        }
    }

    fn sample_rate_changed(&mut self, sample_rate: u32) {
        self.note(Note::SampleRate(sample_rate));
    }

    fn buffer_size_changed(&mut self, frames: u32) {
        self.note(Note::BufferSize(frames));
    }

    fn freewheel(&mut self, onoff: bool) {
        self.note(Note::Freewheel(onoff));
    }

    fn xrun(&mut self) {
        self.note(Note::Xrun);
    }

    fn halted(&mut self, reason: &str) {
        self.note(Note::Halted(reason.to_string()));
    }

    fn latency_changed(&mut self, applied: bool) {
        self.note(Note::Latency(applied));
    }

    fn ports_registered(&mut self) {
        self.note(Note::PortsRegistered);
    }

    fn graph_reordered(&mut self) {
        self.note(Note::Reordered);
    }

    fn connection_changed(&mut self, a: &str, b: &str, connected: bool) {
        self.note(Note::Connection(a.to_string(), b.to_string(), connected));
    }
}

pub fn test_config() -> BackendConfig {
    let mut config = BackendConfig {
        sample_rate: RATE,
        buffer_size: PERIOD,
        realtime_priority: None,
        lock_memory: false,
        ..BackendConfig::default()
    };
    config.set_device_name("Null Device");
    config
}

/// A backend on a null device, configured but not started.
pub fn null_backend(clock: ClockMode) -> (Backend, NullHandle) {
    null_backend_with(NullDriver::new(clock), test_config())
}

pub fn null_backend_with(driver: NullDriver, config: BackendConfig) -> (Backend, NullHandle) {
    let handle = driver.handle();
    let backend = Backend::new("test", Box::new(driver)).with_config(config);
    (backend, handle)
}

/// Drains notes until `matches` accepts one or the timeout expires.
pub fn wait_for_note(notes: &Receiver<Note>, mut matches: impl FnMut(&Note) -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match notes.recv_timeout(remaining) {
            Ok(note) if matches(&note) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Polls `condition` until it holds or the timeout expires.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
