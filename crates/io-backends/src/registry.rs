//! Catalogue of the backends this build can instantiate.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::driver::{DeviceDriver, StubDriver};
use crate::error::{BackendError, Result};
use crate::null::{ClockMode, NullDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Alsa,
    CoreAudio,
    Asio,
    Pulse,
    Null,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Alsa,
        BackendKind::CoreAudio,
        BackendKind::Asio,
        BackendKind::Pulse,
        BackendKind::Null,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Alsa => "ALSA",
            BackendKind::CoreAudio => "CoreAudio",
            BackendKind::Asio => "ASIO",
            BackendKind::Pulse => "PulseAudio",
            BackendKind::Null => "None (Dummy)",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alsa" => Ok(BackendKind::Alsa),
            "coreaudio" | "core-audio" => Ok(BackendKind::CoreAudio),
            "asio" => Ok(BackendKind::Asio),
            "pulse" | "pulseaudio" => Ok(BackendKind::Pulse),
            "null" | "dummy" | "none" | "none (dummy)" => Ok(BackendKind::Null),
            _ => Err(BackendError::UnknownBackend(s.to_string())),
        }
    }
}

pub type DriverFactory = Arc<dyn Fn() -> Box<dyn DeviceDriver> + Send + Sync>;

#[derive(Clone)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Whether the factory produces a working driver on this machine.
    pub available: bool,
    factory: DriverFactory,
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("kind", &self.kind)
            .field("available", &self.available)
            .finish()
    }
}

impl BackendDescriptor {
    pub fn new(kind: BackendKind, available: bool, factory: DriverFactory) -> Self {
        Self {
            kind,
            available,
            factory,
        }
    }

    pub fn driver(&self) -> Box<dyn DeviceDriver> {
        (self.factory)()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    descriptors: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The platform backends plus the dummy backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        #[cfg(target_os = "linux")]
        {
            registry.register(platform_descriptor(BackendKind::Alsa));
            registry.register(platform_descriptor(BackendKind::Pulse));
        }
        #[cfg(target_os = "macos")]
        registry.register(platform_descriptor(BackendKind::CoreAudio));
        #[cfg(target_os = "windows")]
        registry.register(platform_descriptor(BackendKind::Asio));
        registry.register(BackendDescriptor::new(
            BackendKind::Null,
            true,
            Arc::new(|| Box::new(NullDriver::new(ClockMode::Realtime)) as Box<dyn DeviceDriver>),
        ));
        registry
    }

    /// Adds or replaces the descriptor for its kind.
    pub fn register(&mut self, descriptor: BackendDescriptor) {
        match self
            .descriptors
            .iter_mut()
            .find(|existing| existing.kind == descriptor.kind)
        {
            Some(existing) => *existing = descriptor,
            None => self.descriptors.push(descriptor),
        }
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.descriptors.iter().map(|d| d.kind).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(|d| d.kind.name()).collect()
    }

    pub fn descriptor(&self, kind: BackendKind) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| d.kind == kind)
    }

    pub fn instantiate(&self, kind: BackendKind, instance_name: &str) -> Result<Backend> {
        let descriptor = self
            .descriptor(kind)
            .ok_or_else(|| BackendError::UnknownBackend(kind.name().to_string()))?;
        Ok(Backend::new(instance_name, descriptor.driver()))
    }

    /// Looks the backend up by display name or alias.
    pub fn instantiate_by_name(&self, name: &str, instance_name: &str) -> Result<Backend> {
        let kind = self
            .descriptors
            .iter()
            .map(|d| d.kind)
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
            .map_or_else(|| name.parse(), Ok)?;
        self.instantiate(kind, instance_name)
    }
}

#[cfg(feature = "cpal")]
fn platform_descriptor(kind: BackendKind) -> BackendDescriptor {
    use crate::cpal_backend::CpalDriver;

    let host_id = match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Alsa => Some(cpal::HostId::Alsa),
        #[cfg(target_os = "macos")]
        BackendKind::CoreAudio => Some(cpal::HostId::CoreAudio),
        #[cfg(target_os = "windows")]
        BackendKind::Asio => Some(cpal::default_host().id()),
        _ => None,
    };
    let available = host_id.is_some_and(CpalDriver::host_available);
    let factory: DriverFactory = Arc::new(move || match host_id.map(|id| CpalDriver::new(kind.name(), id)) {
        Some(Ok(driver)) => Box::new(driver) as Box<dyn DeviceDriver>,
        _ => Box::new(StubDriver::new(kind.name())),
    });
    BackendDescriptor::new(kind, available, factory)
}

#[cfg(not(feature = "cpal"))]
fn platform_descriptor(kind: BackendKind) -> BackendDescriptor {
    BackendDescriptor::new(
        kind,
        false,
        Arc::new(move || Box::new(StubDriver::new(kind.name())) as Box<dyn DeviceDriver>),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("ALSA".parse::<BackendKind>().unwrap(), BackendKind::Alsa);
        assert_eq!("coreaudio".parse::<BackendKind>().unwrap(), BackendKind::CoreAudio);
        assert_eq!("Dummy".parse::<BackendKind>().unwrap(), BackendKind::Null);
        assert!(matches!(
            "jack".parse::<BackendKind>(),
            Err(BackendError::UnknownBackend(_))
        ));
    }

    #[test]
    fn defaults_always_offer_the_dummy_backend() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.kinds().contains(&BackendKind::Null));
        let backend = registry
            .instantiate_by_name("None (Dummy)", "test")
            .unwrap();
        assert_eq!(backend.instance_name(), "test");
        assert_eq!(backend.driver_name(), "Null");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_defaults_list_alsa_and_pulse() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec![BackendKind::Alsa, BackendKind::Pulse, BackendKind::Null]
        );
        // No driver speaks PulseAudio yet, so it is listed but unavailable.
        let pulse = registry.descriptor(BackendKind::Pulse).unwrap();
        assert!(!pulse.available);
        let mut driver = pulse.driver();
        assert!(driver.devices().unwrap().is_empty());
        assert!(matches!(driver.start(), Err(DriverError::NotAvailable(_))));
    }

    #[test]
    fn registering_replaces_existing_kind() {
        let mut registry = BackendRegistry::new();
        for available in [false, true] {
            registry.register(BackendDescriptor::new(
                BackendKind::Pulse,
                available,
                Arc::new(|| Box::new(StubDriver::new("pulse")) as Box<dyn DeviceDriver>),
            ));
        }
        assert_eq!(registry.kinds(), vec![BackendKind::Pulse]);
        assert!(registry.descriptor(BackendKind::Pulse).unwrap().available);
        assert!(matches!(
            registry.instantiate(BackendKind::Alsa, "x"),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}
