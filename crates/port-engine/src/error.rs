use thiserror::Error;

use crate::PortId;

pub type Result<T> = std::result::Result<T, PortError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port already exists: {0}")]
    NameCollision(String),
    #[error("invalid port name")]
    InvalidName,
    #[error("unknown port handle {0:?}")]
    UnknownPort(PortId),
    #[error("no port named {0}")]
    NoSuchPort(String),
    #[error("cannot connect ports of different data types")]
    TypeMismatch,
    #[error("cannot inter-connect two {0} ports")]
    DirectionError(&'static str),
    #[error("ports are already connected")]
    AlreadyConnected,
    #[error("ports are not connected")]
    NotConnected,
    #[error("cannot self-connect a port")]
    SelfConnect,
    #[error("physical ports are owned by the backend")]
    PhysicalPortReserved,
    #[error("port {0:?} is not a MIDI port")]
    NotMidi(PortId),
    #[error("port {0:?} is not an audio port")]
    NotAudio(PortId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MidiError {
    #[error("event at {timestamp} is older than the last queued event at {last}")]
    TooLate { timestamp: u32, last: u32 },
    #[error("event of {0} bytes exceeds the maximum MIDI event size")]
    Oversized(usize),
    #[error("empty MIDI event")]
    Empty,
}
