//! IO backends bridge a sound device and a realtime port graph.
//!
//! A [`Backend`] owns one [`DeviceDriver`], opens it on `start`, registers
//! the device's channels as physical `system:` ports and runs a dedicated
//! process thread that exchanges one period per cycle with the device and
//! hands the graph to an [`AudioEngine`]. Secondary devices can ride along
//! as [`SlaveDevice`]s with drift compensation.

pub mod backend;
pub mod config;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod driver;
pub mod engine;
pub mod error;
pub mod null;
mod process;
pub mod registry;
pub mod reservation;
pub mod slave;

pub use backend::{Backend, PROCESS_THREAD_START_TIMEOUT};
pub use config::{BackendConfig, NO_DEVICE};
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalDriver;
pub use driver::{
    DeviceDriver, DeviceInfo, DriverResult, HotplugEvent, MidiDeviceInfo, MidiDirection,
    NegotiatedConfig, OpenRequest, StubDriver, WaitStatus,
};
pub use engine::{AudioEngine, SilentEngine};
pub use error::{BackendError, DriverError, ReservationError, Result};
pub use null::{ClockMode, NullDriver, NullHandle};
pub use registry::{BackendDescriptor, BackendKind, BackendRegistry, DriverFactory};
pub use reservation::DeviceReservation;
pub use slave::{ResamplingFifo, SlaveConfig, SlaveDevice, SlaveMode, SlaveState};

pub use port_engine;
