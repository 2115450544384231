//! Exclusive device reservation through an external helper process.
//!
//! The helper is started with `-P <pid> Audio<N>` for card `N` and holds the
//! system-wide reservation for as long as it lives. It announces success on
//! stdout with a line starting with `Acquired audio-card`. Dropping the
//! reservation kills the helper, which releases the card.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, warn};

use crate::error::ReservationError;

const ACQUIRED: &str = "Acquired audio-card";

/// Card number of an ALSA style device identifier such as `hw:2,0`.
pub fn card_number(device: &str) -> Option<u32> {
    let rest = device.split_once("hw:")?.1;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Resource name handed to the reservation helper.
pub fn resource_name(device: &str) -> Option<String> {
    card_number(device).map(|card| format!("Audio{card}"))
}

#[derive(Debug)]
pub struct DeviceReservation {
    child: Child,
    resource: String,
}

impl DeviceReservation {
    pub fn acquire(
        helper: &Path,
        device: &str,
        timeout: Duration,
    ) -> Result<Self, ReservationError> {
        let resource =
            resource_name(device).ok_or_else(|| ReservationError::NoCardNumber(device.to_string()))?;
        let mut child = Command::new(helper)
            .arg("-P")
            .arg(std::process::id().to_string())
            .arg(&resource)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let (tx, rx) = bounded(1);
        if let Some(stdout) = child.stdout.take() {
            // Keeps draining after the handshake so the helper never blocks
            // on a full pipe.
            let spawned = thread::Builder::new()
                .name("device-reservation".into())
                .spawn(move || {
                    let mut announced = false;
                    for line in BufReader::new(stdout).lines() {
                        let Ok(line) = line else { break };
                        if !announced && line.starts_with(ACQUIRED) {
                            announced = true;
                            let _ = tx.send(());
                        }
                    }
                });
            if let Err(err) = spawned {
                kill(&mut child);
                return Err(ReservationError::Spawn(err));
            }
        }

        let mut reservation = Self { child, resource };
        match rx.recv_timeout(timeout) {
            Ok(()) => {
                debug!(resource = %reservation.resource, "device reserved");
                Ok(reservation)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(resource = %reservation.resource, "device reservation timed out");
                kill(&mut reservation.child);
                Err(ReservationError::Timeout(timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(resource = %reservation.resource, "reservation helper exited");
                kill(&mut reservation.child);
                Err(ReservationError::HelperExited)
            }
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        kill(&mut self.child);
        debug!(resource = %self.resource, "device reservation released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_follow_card_numbers() {
        assert_eq!(card_number("hw:2,0"), Some(2));
        assert_eq!(card_number("plughw:11"), Some(11));
        assert_eq!(resource_name("hw:0"), Some("Audio0".to_string()));
        assert_eq!(resource_name("default"), None);
        assert_eq!(resource_name("hw:CARD=PCH"), None);
    }

    #[test]
    fn device_without_card_is_rejected() {
        let err = DeviceReservation::acquire(Path::new("/bin/true"), "default", Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReservationError::NoCardNumber(_)));
    }
}
