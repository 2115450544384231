//! Port graph shared by the audio IO backends.
//!
//! A [`PortGraph`] holds named audio and MIDI ports, the connections between
//! them and the per-cycle buffers the realtime thread reads and writes. The
//! backend keeps one graph on the control side as the topology authority and
//! a mirror inside the realtime thread that owns the sample buffers.

mod error;
mod graph;
mod latency;
mod midi;
mod port;
mod scope;

pub use error::{MidiError, PortError, Result};
pub use graph::{ChanCount, ConnectionChange, PortGraph, TopologyChanges};
pub use latency::{LatencyDirection, LatencyRange};
pub use midi::{MidiBuffer, MidiEvent, MAX_MIDI_EVENT_SIZE};
pub use port::{PortBuffer, PortFlags, PortId, PortKind};
pub use scope::{ProcessScope, ScopeMidiError};
