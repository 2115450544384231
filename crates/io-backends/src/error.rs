use port_engine::PortError;
use thiserror::Error;

use engine_rt::FreewheelError;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Failures reported by a device driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("{0} backend not available in this build")]
    NotAvailable(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("device is not open")]
    NotOpen,
    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("device {0} has no card number to reserve")]
    NoCardNumber(String),
    #[error("failed to launch reservation helper: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("device reservation timed out after {0} ms")]
    Timeout(u64),
    #[error("reservation helper exited before acquiring the device")]
    HelperExited,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is already running")]
    AlreadyRunning,
    #[error("backend is not running")]
    NotRunning,
    #[error("no audio device selected")]
    NoDeviceSelected,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to open audio device {device}: {source}")]
    AudioDeviceOpen {
        device: String,
        #[source]
        source: DriverError,
    },
    #[error("failed to reserve audio device: {0}")]
    AudioDeviceReservation(#[from] ReservationError),
    #[error("process thread failed to start: {0}")]
    ProcessThreadStart(String),
    #[error("process thread panicked; the device driver was lost")]
    ProcessThreadLost,
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Freewheel(#[from] FreewheelError),
}

impl BackendError {
    /// Errors raised while acquiring or opening the device.
    pub fn is_device_open_error(&self) -> bool {
        matches!(
            self,
            BackendError::AudioDeviceOpen { .. } | BackendError::AudioDeviceReservation(_)
        )
    }
}
