//! The query collaborator contract.

use serde_json::Value as JsonValue;

use crate::connection::Connection;
use crate::error::SyncError;

/// Whether a query is a one-shot fetch or a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Fetch,
    Subscribe,
}

impl QueryAction {
    /// The wire action tag for this query kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryAction::Fetch => "qf",
            QueryAction::Subscribe => "qs",
        }
    }
}

/// The interface the connection invokes on a registered query.
///
/// Like [`crate::doc::DocLink`], methods take `&self`; implementations keep
/// mutable state behind interior mutability.
pub trait QueryLink: Send + Sync {
    /// Invoked once per accepted connection state transition. The connection
    /// re-sends the stored query frame itself after this returns.
    fn on_connection_state_changed(&self, conn: &mut Connection);

    fn handle_fetch(
        &self,
        conn: &mut Connection,
        err: Option<SyncError>,
        data: Option<JsonValue>,
        extra: Option<JsonValue>,
    );

    fn handle_subscribe(
        &self,
        conn: &mut Connection,
        err: Option<SyncError>,
        data: Option<JsonValue>,
        extra: Option<JsonValue>,
    );

    /// A `q` update without an error envelope.
    fn handle_diff(&self, conn: &mut Connection, diff: Option<JsonValue>, extra: Option<JsonValue>);

    /// A `q` update that carried an error envelope.
    fn handle_error(&self, conn: &mut Connection, err: SyncError);

    /// Whether the query is still waiting for its results.
    fn has_pending(&self) -> bool;

    /// Register a one-shot callback fired when the query next becomes ready.
    fn once_ready(&self, callback: Box<dyn FnOnce() + Send>);
}
