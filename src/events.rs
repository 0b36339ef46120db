//! Connection event fan-out.
//!
//! Observers subscribe and receive [`ConnectionEvent`]s over an unbounded
//! channel; the hub prunes subscribers whose receiver has been dropped.
//! Because events are read from channels, an observer never runs re-entrantly
//! inside the connection call that emitted the event.

use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::error::SyncError;
use crate::protocol::Message;

/// Events emitted by a [`crate::connection::Connection`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Entered the `connecting` state.
    Connecting { reason: Option<String> },
    /// Entered the `connected` state.
    Connected { reason: Option<String> },
    /// Entered the `disconnected` state.
    Disconnected { reason: Option<String> },
    /// Entered the `closed` state.
    Closed { reason: Option<String> },
    /// Entered the `stopped` state.
    Stopped { reason: Option<String> },
    /// Generic state event, fired after the state-named event.
    State {
        state: ConnectionState,
        reason: Option<String>,
    },
    /// Protocol-level or state-machine error.
    Error(SyncError),
    /// Transport-reported error; state is unchanged by these.
    ConnectionError { message: String },
    /// A decoded inbound frame, before dispatch.
    Receive(Message),
    /// An outbound frame, just before it is handed to the socket.
    Send(Message),
    /// A document was registered via `get`.
    Doc { collection: String, id: String },
}

impl ConnectionEvent {
    /// The state-named event for an accepted transition.
    pub fn named(state: ConnectionState, reason: Option<String>) -> Self {
        match state {
            ConnectionState::Connecting => ConnectionEvent::Connecting { reason },
            ConnectionState::Connected => ConnectionEvent::Connected { reason },
            ConnectionState::Disconnected => ConnectionEvent::Disconnected { reason },
            ConnectionState::Closed => ConnectionEvent::Closed { reason },
            ConnectionState::Stopped => ConnectionEvent::Stopped { reason },
        }
    }
}

/// Mutable envelope handed to the receive hook before dispatch. Taking the
/// frame out suppresses dispatch.
pub struct ReceiveEnvelope {
    pub data: Option<Message>,
}

impl ReceiveEnvelope {
    /// Remove the frame, suppressing dispatch.
    pub fn take(&mut self) -> Option<Message> {
        self.data.take()
    }
}

/// Per-connection event fan-out.
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live observer, pruning dead ones.
    pub fn emit(&self, event: ConnectionEvent) {
        let mut subs = self.subscribers.lock().expect("event hub lock poisoned");
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live observers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let hub = EventHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.emit(ConnectionEvent::Connecting { reason: None });

        assert!(matches!(
            rx1.try_recv().unwrap(),
            ConnectionEvent::Connecting { .. }
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ConnectionEvent::Connecting { .. }
        ));
    }

    #[test]
    fn test_dead_subscribers_are_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let _rx2 = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx);
        hub.emit(ConnectionEvent::ConnectionError {
            message: "boom".into(),
        });
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_named_event_matches_state() {
        let ev = ConnectionEvent::named(ConnectionState::Stopped, Some("Stopped by server".into()));
        match ev {
            ConnectionEvent::Stopped { reason } => {
                assert_eq!(reason.as_deref(), Some("Stopped by server"));
            }
            other => panic!("expected stopped, got {other:?}"),
        }
    }

    #[test]
    fn test_receive_envelope_take_suppresses() {
        let msg = crate::protocol::decode(r#"{"a":"qu","id":1}"#).unwrap();
        let mut env = ReceiveEnvelope { data: Some(msg) };
        assert!(env.take().is_some());
        assert!(env.data.is_none());
    }
}
