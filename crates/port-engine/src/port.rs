use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::latency::{LatencyDirection, LatencyRange};
use crate::midi::MidiBuffer;

/// Stable handle to a port slot in a [`crate::PortGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl PortId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Midi,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Audio => f.write_str("audio"),
            PortKind::Midi => f.write_str("midi"),
        }
    }
}

/// Port flag set.
///
/// `INPUT` ports receive data (the engine reads them); `OUTPUT` ports carry
/// data the owner wrote this cycle. System capture ports are therefore
/// `OUTPUT | PHYSICAL | TERMINAL` and system playback ports are
/// `INPUT | PHYSICAL | TERMINAL`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortFlags(u8);

impl PortFlags {
    pub const INPUT: PortFlags = PortFlags(1 << 0);
    pub const OUTPUT: PortFlags = PortFlags(1 << 1);
    pub const PHYSICAL: PortFlags = PortFlags(1 << 2);
    pub const TERMINAL: PortFlags = PortFlags(1 << 3);

    pub const fn empty() -> Self {
        PortFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: PortFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_input(self) -> bool {
        self.contains(Self::INPUT)
    }

    pub const fn is_output(self) -> bool {
        self.contains(Self::OUTPUT)
    }

    pub const fn is_physical(self) -> bool {
        self.contains(Self::PHYSICAL)
    }

    pub const fn is_terminal(self) -> bool {
        self.contains(Self::TERMINAL)
    }
}

impl BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PortFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_input() {
            names.push("INPUT");
        }
        if self.is_output() {
            names.push("OUTPUT");
        }
        if self.is_physical() {
            names.push("PHYSICAL");
        }
        if self.is_terminal() {
            names.push("TERMINAL");
        }
        write!(f, "PortFlags({})", names.join(" | "))
    }
}

/// Backing store of a port for the current cycle.
#[derive(Debug, Clone)]
pub enum PortBuffer {
    Audio(Vec<f32>),
    Midi(MidiBuffer),
}

impl PortBuffer {
    pub(crate) fn for_kind(kind: PortKind, frames: usize) -> Self {
        match kind {
            PortKind::Audio => PortBuffer::Audio(vec![0.0; frames]),
            PortKind::Midi => PortBuffer::Midi(MidiBuffer::new()),
        }
    }

    pub(crate) fn resize(&mut self, frames: usize) {
        if let PortBuffer::Audio(samples) = self {
            samples.resize(frames, 0.0);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Port {
    pub(crate) name: String,
    pub(crate) kind: PortKind,
    pub(crate) flags: PortFlags,
    /// Peers in connection order. Order is significant for MIDI merging.
    pub(crate) connections: Vec<PortId>,
    pub(crate) capture_latency: LatencyRange,
    pub(crate) playback_latency: LatencyRange,
    pub(crate) buffer: PortBuffer,
}

impl Port {
    pub(crate) fn new(name: String, kind: PortKind, flags: PortFlags, frames: usize) -> Self {
        Self {
            name,
            kind,
            flags,
            connections: Vec::new(),
            capture_latency: LatencyRange::ZERO,
            playback_latency: LatencyRange::ZERO,
            buffer: PortBuffer::for_kind(kind, frames),
        }
    }

    pub(crate) fn latency(&self, direction: LatencyDirection) -> LatencyRange {
        match direction {
            LatencyDirection::Capture => self.capture_latency,
            LatencyDirection::Playback => self.playback_latency,
        }
    }

    pub(crate) fn set_latency(&mut self, direction: LatencyDirection, range: LatencyRange) {
        match direction {
            LatencyDirection::Capture => self.capture_latency = range,
            LatencyDirection::Playback => self.playback_latency = range,
        }
    }

    pub(crate) fn is_connected_to(&self, other: PortId) -> bool {
        self.connections.contains(&other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = PortFlags::OUTPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL;
        assert!(flags.is_output());
        assert!(!flags.is_input());
        assert!(flags.is_physical() && flags.is_terminal());
        assert!(flags.intersects(PortFlags::INPUT | PortFlags::OUTPUT));
        assert_eq!(
            format!("{flags:?}"),
            "PortFlags(OUTPUT | PHYSICAL | TERMINAL)"
        );
    }
}
