use crate::error::{MidiError, Result};
use crate::graph::PortGraph;
use crate::midi::MidiBuffer;
use crate::port::PortId;

/// Buffer access handed to the engine for one process cycle.
///
/// The scope only exposes port data; topology changes go through the
/// control-side graph and become visible at the next cycle boundary.
pub struct ProcessScope<'a> {
    graph: &'a mut PortGraph,
    n_frames: usize,
    sample_time: u64,
}

impl<'a> ProcessScope<'a> {
    pub fn new(graph: &'a mut PortGraph, n_frames: usize, sample_time: u64) -> Self {
        Self {
            graph,
            n_frames,
            sample_time,
        }
    }

    #[inline]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Frames processed before this cycle.
    #[inline]
    pub fn sample_time(&self) -> u64 {
        self.sample_time
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.graph.port_by_name(name)
    }

    pub fn audio_in(&mut self, port: PortId) -> Result<&[f32]> {
        self.graph.audio_buffer(port, self.n_frames)
    }

    pub fn audio_out(&mut self, port: PortId) -> Result<&mut [f32]> {
        self.graph.audio_buffer_mut(port, self.n_frames)
    }

    pub fn midi_in(&mut self, port: PortId) -> Result<&MidiBuffer> {
        self.graph.midi_buffer(port)
    }

    pub fn midi_out(&mut self, port: PortId) -> Result<&mut MidiBuffer> {
        self.graph.midi_buffer_mut(port)
    }

    /// Queues a MIDI event on an output port. Events must be written in
    /// timestamp order and within the current cycle.
    pub fn midi_event_put(
        &mut self,
        port: PortId,
        timestamp: u32,
        bytes: &[u8],
    ) -> std::result::Result<(), ScopeMidiError> {
        if timestamp as usize >= self.n_frames.max(1) {
            return Err(ScopeMidiError::OutOfCycle(timestamp));
        }
        let buffer = self.graph.midi_buffer_mut(port)?;
        buffer.push(timestamp, bytes)?;
        Ok(())
    }

    /// Copies one port's cycle data into an audio output port.
    pub fn copy_audio(&mut self, from: PortId, to: PortId) -> Result<()> {
        self.graph.copy_audio(from, to, self.n_frames)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeMidiError {
    #[error("event timestamp {0} is outside the current cycle")]
    OutOfCycle(u32),
    #[error(transparent)]
    Port(#[from] crate::error::PortError),
    #[error(transparent)]
    Midi(#[from] MidiError),
}
