//! Transport double for state-machine tests.
//!
//! Tests script the event stream by hand and inspect what the code under
//! test tried to send, with no sockets involved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::{PeerId, Transport, TransportError, TransportEvent};

/// One recorded outgoing datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub peer: PeerId,
    pub data: Vec<u8>,
    pub reliable: bool,
}

/// In-memory [`Transport`] driven entirely by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    events: Mutex<VecDeque<TransportEvent>>,
    sent: Mutex<Vec<SentDatagram>>,
    started: AtomicBool,
    stopped: AtomicBool,
    fail_start: AtomicBool,
    connects: Mutex<Vec<(String, u16, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Variant whose `start` fails, for exercising startup error paths.
    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.fail_start.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// Queue an event for the next `poll_events` drain.
    pub fn push_event(&self, event: TransportEvent) {
        lock(&self.events).push_back(event);
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<SentDatagram> {
        lock(&self.sent).clone()
    }

    /// Drain the send record, so assertions only see traffic from the
    /// step under test.
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn sent_to(&self, peer: PeerId) -> Vec<SentDatagram> {
        lock(&self.sent)
            .iter()
            .filter(|d| d.peer == peer)
            .cloned()
            .collect()
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> Vec<(String, u16, String)> {
        lock(&self.connects).clone()
    }
}

impl Transport for ScriptedTransport {
    fn start(&self) -> Result<(), TransportError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "scripted bind failure",
            )));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn connect(&self, host: &str, port: u16, key: &str) -> Result<(), TransportError> {
        lock(&self.connects).push((host.to_string(), port, key.to_string()));
        Ok(())
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        lock(&self.events).drain(..).collect()
    }

    fn send_reliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        lock(&self.sent).push(SentDatagram {
            peer,
            data,
            reliable: true,
        });
        Ok(())
    }

    fn send_unreliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        lock(&self.sent).push(SentDatagram {
            peer,
            data,
            reliable: false,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DisconnectReason;

    #[test]
    fn test_event_queue_drains_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_event(TransportEvent::DataReceived {
            peer: 1,
            data: vec![1],
        });
        transport.push_event(TransportEvent::PeerDisconnected {
            peer: 1,
            reason: DisconnectReason::Timeout,
        });

        let events = transport.poll_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TransportEvent::DataReceived { .. }));
        assert!(transport.poll_events().is_empty());
    }

    #[test]
    fn test_send_recording() {
        let transport = ScriptedTransport::new();
        transport.send_reliable(3, vec![1, 2]).unwrap();
        transport.send_unreliable(4, vec![3]).unwrap();

        assert_eq!(transport.sent_to(3).len(), 1);
        assert!(transport.sent_to(3)[0].reliable);
        assert!(!transport.sent_to(4)[0].reliable);
        assert_eq!(transport.take_sent().len(), 2);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_failing_start() {
        let transport = ScriptedTransport::failing();
        assert!(transport.start().is_err());
        assert!(!transport.was_started());
    }
}
