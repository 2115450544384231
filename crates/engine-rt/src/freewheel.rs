//! Freewheel request/acknowledge handshake.
//!
//! The control side posts the wanted state; the realtime side picks it up at
//! an iteration boundary, performs the transition and acknowledges it. The
//! realtime side never blocks and only transitions when the wanted state
//! differs from the active one, so repeated requests are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

const CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FreewheelError {
    #[error("freewheel request queue is full")]
    Busy,
    #[error("realtime thread is gone")]
    Disconnected,
}

pub fn freewheel_channel() -> (FreewheelControl, FreewheelResponder) {
    let (request_tx, request_rx) = bounded(CHANNEL_DEPTH);
    let (ack_tx, ack_rx) = bounded(CHANNEL_DEPTH);
    let active = Arc::new(AtomicBool::new(false));
    (
        FreewheelControl {
            requests: request_tx,
            acks: ack_rx,
            active: Arc::clone(&active),
            requested: false,
        },
        FreewheelResponder {
            requests: request_rx,
            acks: ack_tx,
            active,
        },
    )
}

/// Control-thread end of the handshake.
#[derive(Debug)]
pub struct FreewheelControl {
    requests: Sender<bool>,
    acks: Receiver<bool>,
    active: Arc<AtomicBool>,
    requested: bool,
}

impl FreewheelControl {
    /// Posts `onoff` unless it is already the requested state. Returns whether
    /// a request was sent.
    pub fn request(&mut self, onoff: bool) -> Result<bool, FreewheelError> {
        if onoff == self.requested {
            return Ok(false);
        }
        while self.acks.try_recv().is_ok() {}
        match self.requests.try_send(onoff) {
            Ok(()) => {
                self.requested = onoff;
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Err(FreewheelError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(FreewheelError::Disconnected),
        }
    }

    pub fn requested(&self) -> bool {
        self.requested
    }

    /// State the realtime thread last acknowledged.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Waits for the next acknowledgement.
    pub fn wait_ack(&self, timeout: Duration) -> Option<bool> {
        match self.acks.recv_timeout(timeout) {
            Ok(state) => Some(state),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Forgets the requested state after the realtime thread went away.
    pub fn reset(&mut self) {
        self.requested = false;
        self.active.store(false, Ordering::Release);
        while self.acks.try_recv().is_ok() {}
    }
}

/// Realtime end of the handshake.
#[derive(Debug)]
pub struct FreewheelResponder {
    requests: Receiver<bool>,
    acks: Sender<bool>,
    active: Arc<AtomicBool>,
}

impl FreewheelResponder {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Drains pending requests and returns the new state if a transition is
    /// due.
    pub fn pending(&self) -> Option<bool> {
        let mut wanted = None;
        while let Ok(onoff) = self.requests.try_recv() {
            wanted = Some(onoff);
        }
        wanted.filter(|onoff| *onoff != self.is_active())
    }

    /// Publishes a completed transition.
    pub fn acknowledge(&self, onoff: bool) {
        self.active.store(onoff, Ordering::Release);
        let _ = self.acks.try_send(onoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_requests_collapse() {
        let (mut control, responder) = freewheel_channel();
        assert_eq!(control.request(true), Ok(true));
        assert_eq!(control.request(true), Ok(false));
        assert_eq!(responder.pending(), Some(true));
        responder.acknowledge(true);
        assert_eq!(responder.pending(), None);
        assert!(control.is_active());
        assert_eq!(control.wait_ack(Duration::from_millis(10)), Some(true));
    }

    #[test]
    fn toggling_back_before_pickup_is_a_no_op() {
        let (mut control, responder) = freewheel_channel();
        control.request(true).unwrap();
        control.request(false).unwrap();
        assert_eq!(responder.pending(), None);
        assert!(!responder.is_active());
    }

    #[test]
    fn dropped_responder_is_reported() {
        let (mut control, responder) = freewheel_channel();
        drop(responder);
        assert_eq!(control.request(true), Err(FreewheelError::Disconnected));
        assert!(!control.requested());
    }
}
