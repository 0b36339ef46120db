//! Transport contract for the collaboration connection.
//!
//! The connection drives the socket through this trait and is driven back
//! through its four entry points (`handle_open`, `handle_message`,
//! `handle_close`, `handle_error`) — those are the only points at which the
//! outside world resumes connection activity.

use crate::protocol::{CodecError, Message};

/// Socket readiness, mirrored from the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Connection attempt in flight.
    Opening,
    Open,
    Closing,
    Closed,
}

/// The capability set a transport must provide.
///
/// Rebinding a connection to a new socket closes the previous one; a
/// transport must stop delivering entry-point calls once it has been
/// replaced.
pub trait SocketAdapter: Send {
    fn ready_state(&self) -> ReadyState;

    /// Hand a frame to the transport. Failures are logged by the connection,
    /// not surfaced; the close callback drives state.
    fn send(&mut self, frame: &Message) -> Result<(), CodecError>;

    fn close(&mut self);
}
