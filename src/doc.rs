//! The document collaborator contract.
//!
//! Document internals (snapshot state, OT application, pending op queues)
//! live outside this crate; the connection only drives documents through
//! [`DocLink`]. Methods take `&self` because links are re-entered while the
//! connection is mutably borrowed — implementations keep their mutable state
//! behind interior mutability.

use serde_json::Value as JsonValue;

use crate::connection::Connection;
use crate::error::SyncError;
use crate::protocol::OpMessage;

/// The interface the connection invokes on a registered document.
pub trait DocLink: Send + Sync {
    fn collection(&self) -> &str;

    fn id(&self) -> &str;

    /// Current document version, if known. Recorded with subscription
    /// traffic so the server can replay missed operations.
    fn version(&self) -> Option<u64>;

    /// Invoked once per accepted connection state transition, inside the
    /// transition's bulk window. Reaching the connected state is the moment
    /// to re-issue subscriptions through `conn`.
    fn on_connection_state_changed(&self, conn: &mut Connection);

    fn handle_fetch(&self, conn: &mut Connection, err: Option<SyncError>, snapshot: Option<JsonValue>);

    fn handle_subscribe(&self, conn: &mut Connection, err: Option<SyncError>, data: Option<JsonValue>);

    fn handle_unsubscribe(&self, conn: &mut Connection, err: Option<SyncError>);

    /// Inbound operation. An error envelope does not short-circuit delivery:
    /// both the error and the message arrive and the document decides.
    fn handle_op(&self, conn: &mut Connection, err: Option<SyncError>, message: &OpMessage);

    /// Whether any fetch, subscription or operation is still outstanding.
    fn has_pending(&self) -> bool;

    /// Whether an operation write is still outstanding.
    fn has_write_pending(&self) -> bool;

    /// Register a one-shot callback fired when the document next transitions
    /// to having nothing pending.
    fn once_nothing_pending(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Payload of an outbound operation frame.
#[derive(Debug, Clone)]
pub enum OpContent {
    /// An edit in the document's OT type.
    Op(JsonValue),
    /// Document creation carrying the initial data.
    Create(JsonValue),
    /// Document deletion.
    Del,
}

/// An operation as submitted by a document.
#[derive(Debug, Clone)]
pub struct DocOp {
    /// Source identity; usually the connection's client id.
    pub src: Option<String>,
    /// Sequence number allocated from the connection's `seq`.
    pub seq: u64,
    pub content: OpContent,
}
