//! The client's long-lived session with a collaboration server.
//!
//! A [`Connection`] multiplexes many logical document and query
//! subscriptions over one bidirectional message channel:
//!
//! ```text
//! Doc / Query ──┐                        ┌── SocketAdapter ── wire
//!               ├── Connection ──────────┤
//! observers ◄───┘   ├ state machine      └── handle_open/message/
//!                   ├ registries                 close/error
//!                   ├ bulk accumulator
//!                   └ dispatcher
//! ```
//!
//! Outbound, documents call `send_fetch`/`send_subscribe`/`send_unsubscribe`
//! /`send_op`; inside a bulk window the subscription traffic coalesces into
//! at most two frames per collection per action. Inbound, decoded frames are
//! routed by action tag to the owning document or query. The registries
//! survive reconnects so documents can re-subscribe.
//!
//! The core is a synchronous state machine driven through `&mut self` entry
//! points; concurrent use wraps it in `Arc<Mutex<Connection>>` (see
//! [`crate::transport`]). All frames produced by one call-chain are sent in
//! issue order, and the `state` event fires only after the state has changed
//! and every document and query has been notified.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::bulk::{BulkAccumulator, BulkAction};
use crate::doc::{DocLink, DocOp, OpContent};
use crate::error::{codes, SyncError};
use crate::events::{ConnectionEvent, EventHub, ReceiveEnvelope};
use crate::protocol::{
    self, BulkField, BulkMessage, InitMessage, Message, OpMessage, QueryMessage, DEFAULT_TYPE,
    PROTOCOL_VERSION,
};
use crate::query::{QueryAction, QueryLink};
use crate::registry::{DocRegistry, QueryEntry, QueryRegistry};
use crate::socket::{ReadyState, SocketAdapter};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Map a transport close reason onto the state it drives.
fn state_for_close_reason(reason: &str) -> ConnectionState {
    match reason {
        "closed" | "Closed" => ConnectionState::Closed,
        "stopped" | "Stopped by server" => ConnectionState::Stopped,
        _ => ConnectionState::Disconnected,
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// The OT type the server must declare in its `init` frame.
    pub default_type: String,
    /// Log every frame sent and received.
    pub debug: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_type: DEFAULT_TYPE.to_string(),
            debug: false,
        }
    }
}

/// Hook run on every decoded inbound frame before dispatch; taking the frame
/// out of the envelope suppresses dispatch.
pub type ReceiveHook = Box<dyn FnMut(&mut ReceiveEnvelope) + Send>;

/// One-shot continuations queued for the end of the current entry point.
enum Task {
    Scan(oneshot::Sender<()>),
}

/// The client session object. See the module docs for the big picture.
pub struct Connection {
    state: ConnectionState,
    can_send: bool,
    /// Per-session operation sequence, starting at 1.
    seq: u64,
    /// Server-assigned client id, set by `init`.
    client_id: Option<String>,
    debug: bool,
    default_type: String,
    docs: DocRegistry,
    queries: QueryRegistry,
    bulk: Option<BulkAccumulator>,
    socket: Option<Box<dyn SocketAdapter>>,
    events: Arc<EventHub>,
    receive_hook: Option<ReceiveHook>,
    tasks_tx: mpsc::UnboundedSender<Task>,
    tasks_rx: mpsc::UnboundedReceiver<Task>,
}

impl Connection {
    pub fn new(options: ConnectionOptions) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        Self {
            state: ConnectionState::Disconnected,
            can_send: false,
            seq: 1,
            client_id: None,
            debug: options.debug,
            default_type: options.default_type,
            docs: DocRegistry::new(),
            queries: QueryRegistry::new(),
            bulk: None,
            socket: None,
            events: Arc::new(EventHub::new()),
            receive_hook: None,
            tasks_tx,
            tasks_rx,
        }
    }

    // ── observation ────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True iff the connection is in the connected state.
    pub fn can_send(&self) -> bool {
        self.can_send
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Allocate the next operation sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Register an event observer.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventHub> {
        self.events.clone()
    }

    /// Install the pre-dispatch receive hook.
    pub fn set_receive_hook(&mut self, hook: ReceiveHook) {
        self.receive_hook = Some(hook);
    }

    // ── socket binding and transport callbacks ─────────────────────

    /// Bind a socket, closing any previously bound one. The initial state is
    /// derived from the socket's ready-state: opening or open means a server
    /// `init` is coming, so the connection starts out connecting.
    pub fn bind_socket(&mut self, socket: Box<dyn SocketAdapter>) {
        if let Some(mut old) = self.socket.take() {
            old.close();
        }
        self.state = match socket.ready_state() {
            ReadyState::Opening | ReadyState::Open => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        };
        self.can_send = false;
        self.socket = Some(socket);
    }

    /// Transport reported an open socket; the server promotes us to
    /// connected with its `init` frame.
    pub fn handle_open(&mut self) {
        self.set_state(ConnectionState::Connecting, None);
        self.flush_tasks();
    }

    /// Transport delivered a raw frame.
    pub fn handle_message(&mut self, raw: &str) {
        let message = match protocol::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                return;
            }
        };
        if self.debug {
            log::debug!("recv: {raw}");
        }
        self.events.emit(ConnectionEvent::Receive(message.clone()));

        let mut envelope = ReceiveEnvelope {
            data: Some(message),
        };
        if let Some(hook) = self.receive_hook.as_mut() {
            hook(&mut envelope);
        }
        if let Some(message) = envelope.data {
            if let Err(err) = self.dispatch(message) {
                self.events.emit(ConnectionEvent::Error(err));
            }
        }
        self.flush_tasks();
    }

    /// Transport reported an error. State is not changed here; the close
    /// callback drives state.
    pub fn handle_error(&mut self, message: impl Into<String>) {
        self.events.emit(ConnectionEvent::ConnectionError {
            message: message.into(),
        });
        self.flush_tasks();
    }

    /// Transport reported the socket closed with a reason.
    pub fn handle_close(&mut self, reason: &str) {
        let next = state_for_close_reason(reason);
        self.set_state(next, Some(reason.to_string()));
        self.flush_tasks();
    }

    /// Close the bound socket; the transport's close callback then drives
    /// the state machine.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.close();
        }
    }

    // ── state machine ──────────────────────────────────────────────

    /// Apply a state transition. A same-state transition is a no-op (the
    /// socket may report open after bind already derived connecting);
    /// illegal transitions leave the state unchanged and surface a 5007
    /// error event.
    pub fn set_state(&mut self, new_state: ConnectionState, reason: Option<String>) {
        if new_state == self.state {
            return;
        }
        let legal = match new_state {
            ConnectionState::Connecting => matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Stopped | ConnectionState::Closed
            ),
            ConnectionState::Connected => self.state == ConnectionState::Connecting,
            ConnectionState::Disconnected
            | ConnectionState::Closed
            | ConnectionState::Stopped => true,
        };
        if !legal {
            self.events.emit(ConnectionEvent::Error(SyncError::new(
                codes::ILLEGAL_STATE_TRANSITION,
                format!(
                    "Cannot transition directly from {} to {}",
                    self.state, new_state
                ),
            )));
            return;
        }

        self.state = new_state;
        self.can_send = new_state == ConnectionState::Connected;
        if matches!(
            new_state,
            ConnectionState::Disconnected | ConnectionState::Closed | ConnectionState::Stopped
        ) {
            self.reset();
        }

        // Re-notify everything inside one bulk window so resubscribes
        // coalesce; registries are retained across the transition.
        self.start_bulk();
        for entry in self.queries.all() {
            entry.link.on_connection_state_changed(self);
            if self.state == ConnectionState::Connected {
                self.send_query_frame(&entry);
            }
        }
        for doc in self.docs.all() {
            doc.on_connection_state_changed(self);
        }
        self.end_bulk();

        self.events
            .emit(ConnectionEvent::named(new_state, reason.clone()));
        self.events.emit(ConnectionEvent::State {
            state: new_state,
            reason,
        });
    }

    fn reset(&mut self) {
        self.seq = 1;
        self.client_id = None;
    }

    // ── outbound ───────────────────────────────────────────────────

    /// Open a bulk window. Nested calls are absorbed into the open window.
    pub fn start_bulk(&mut self) {
        if self.bulk.is_none() {
            self.bulk = Some(BulkAccumulator::new());
        }
    }

    /// Close the bulk window, flushing the coalesced frames. Outside the
    /// connected state the window's recordings are discarded; documents
    /// re-record on the next connected notification.
    pub fn end_bulk(&mut self) {
        let Some(accumulator) = self.bulk.take() else {
            return;
        };
        if !self.can_send {
            if !accumulator.is_empty() {
                log::debug!("discarding bulk window recorded while {}", self.state);
            }
            return;
        }
        for frame in accumulator.flush() {
            self.send(frame);
        }
    }

    pub fn send_fetch(&mut self, collection: &str, id: &str, version: Option<u64>) -> bool {
        self.send_doc_action(BulkAction::Fetch, collection, id, version)
    }

    pub fn send_subscribe(&mut self, collection: &str, id: &str, version: Option<u64>) -> bool {
        self.send_doc_action(BulkAction::Subscribe, collection, id, version)
    }

    pub fn send_unsubscribe(&mut self, collection: &str, id: &str) -> bool {
        self.send_doc_action(BulkAction::Unsubscribe, collection, id, None)
    }

    /// Record into the open bulk window (reporting duplicates) or emit a
    /// single frame immediately.
    fn send_doc_action(
        &mut self,
        action: BulkAction,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> bool {
        if !self.docs.contains(collection, id) {
            log::warn!("{collection}/{id} is not registered with this connection");
        }
        if let Some(bulk) = self.bulk.as_mut() {
            return bulk.record(action, collection, id, version);
        }
        self.send(action.single_frame(collection, id, version));
        false
    }

    /// Emit an operation frame. Operations are never batched.
    pub fn send_op(&mut self, collection: &str, id: &str, version: Option<u64>, op: &DocOp) {
        let mut message = OpMessage {
            c: collection.to_string(),
            d: id.to_string(),
            v: version,
            src: op.src.clone(),
            seq: Some(op.seq),
            op: None,
            create: None,
            del: None,
            error: None,
        };
        match &op.content {
            OpContent::Op(value) => message.op = Some(value.clone()),
            OpContent::Create(value) => message.create = Some(value.clone()),
            OpContent::Del => message.del = Some(true),
        }
        self.send(Message::Op(message));
    }

    /// Hand a frame to the socket, emitting the `Send` event first.
    fn send(&mut self, frame: Message) {
        if self.debug {
            log::debug!("send: {frame:?}");
        }
        self.events.emit(ConnectionEvent::Send(frame.clone()));
        match self.socket.as_mut() {
            Some(socket) => {
                if let Err(e) = socket.send(&frame) {
                    log::warn!("socket send failed: {e}");
                }
            }
            None => log::warn!("no socket bound; dropping {} frame", frame.action()),
        }
    }

    // ── documents ──────────────────────────────────────────────────

    /// Return the registered document for (collection, id), or construct,
    /// register and announce a new one. Idempotent: the same identity comes
    /// back for the same coordinates.
    pub fn get(
        &mut self,
        collection: &str,
        id: &str,
        create: impl FnOnce() -> Arc<dyn DocLink>,
    ) -> Arc<dyn DocLink> {
        if let Some(doc) = self.docs.get(collection, id) {
            return doc;
        }
        let doc = create();
        self.docs.insert(collection, id, doc.clone());
        self.events.emit(ConnectionEvent::Doc {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        doc
    }

    /// Remove a document from the registry. A later `get` for the same
    /// coordinates constructs a fresh one.
    pub fn destroy_doc(&mut self, collection: &str, id: &str) -> bool {
        self.docs.remove(collection, id).is_some()
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    // ── queries ────────────────────────────────────────────────────

    /// Allocate an id, register the query and trigger its initial send.
    /// Returns the id used to route replies.
    pub fn create_query(
        &mut self,
        action: QueryAction,
        collection: &str,
        q: JsonValue,
        options: serde_json::Map<String, JsonValue>,
        link: Arc<dyn QueryLink>,
    ) -> u64 {
        let id = self.queries.create(action, collection, q, options, link);
        if self.can_send {
            if let Some(entry) = self.queries.get(id).cloned() {
                self.send_query_frame(&entry);
            }
        }
        id
    }

    pub fn destroy_query(&mut self, id: u64) -> bool {
        self.queries.remove(id).is_some()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    fn send_query_frame(&mut self, entry: &QueryEntry) {
        let message = QueryMessage {
            id: entry.id,
            c: Some(entry.collection.clone()),
            q: Some(entry.q.clone()),
            data: None,
            extra: None,
            error: None,
            rest: entry.options.clone(),
        };
        let frame = match entry.action {
            QueryAction::Fetch => Message::QueryFetch(message),
            QueryAction::Subscribe => Message::QuerySubscribe(message),
        };
        self.send(frame);
    }

    // ── quiescence ─────────────────────────────────────────────────

    /// Whether any registered document or query reports pending work.
    pub fn has_pending(&self) -> bool {
        self.docs.any_pending() || self.queries.any_pending()
    }

    /// Whether any registered document reports a pending write.
    pub fn has_write_pending(&self) -> bool {
        self.docs.any_write_pending()
    }

    /// Resolve once no registered document or query reports pending work.
    ///
    /// The scanner waits on the first pending document's nothing-pending
    /// event (or the first pending query's ready event) and then re-scans
    /// from the top, because handling an event may have registered new
    /// mutations. Resolution is only observable after this call returns.
    pub fn when_nothing_pending(&mut self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _ = self.tasks_tx.send(Task::Scan(done));
        self.flush_tasks();
        rx
    }

    /// Drain queued one-shot continuations. Invoked at the end of every
    /// transport entry point; continuations queued by document callbacks
    /// outside any entry point run at the next one.
    pub fn flush_tasks(&mut self) {
        while let Ok(task) = self.tasks_rx.try_recv() {
            match task {
                Task::Scan(done) => self.scan_pending(done),
            }
        }
    }

    fn scan_pending(&mut self, done: oneshot::Sender<()>) {
        if let Some(doc) = self.docs.first_pending() {
            let tx = self.tasks_tx.clone();
            doc.once_nothing_pending(Box::new(move || {
                let _ = tx.send(Task::Scan(done));
            }));
            return;
        }
        if let Some(query) = self.queries.first_pending() {
            let tx = self.tasks_tx.clone();
            query.once_ready(Box::new(move || {
                let _ = tx.send(Task::Scan(done));
            }));
            return;
        }
        let _ = done.send(());
    }

    // ── inbound dispatch ───────────────────────────────────────────

    fn dispatch(&mut self, message: Message) -> Result<(), SyncError> {
        let envelope_err = message
            .error()
            .map(|info| SyncError::from_envelope(info, &message));

        match message {
            Message::Init(init) => self.handle_init(init)?,

            Message::QueryFetch(m) => {
                let link = self.queries.get(m.id).map(|entry| entry.link.clone());
                if let Some(link) = link {
                    link.handle_fetch(self, envelope_err, m.data, m.extra);
                }
            }
            Message::QuerySubscribe(m) => {
                let link = self.queries.get(m.id).map(|entry| entry.link.clone());
                if let Some(link) = link {
                    link.handle_subscribe(self, envelope_err, m.data, m.extra);
                }
            }
            Message::QueryUnsubscribe(_) => {}
            Message::QueryUpdate(m) => {
                let link = self.queries.get(m.id).map(|entry| entry.link.clone());
                if let Some(link) = link {
                    match envelope_err {
                        Some(err) => link.handle_error(self, err),
                        None => link.handle_diff(self, m.diff, m.extra),
                    }
                }
            }

            // Replies for unknown documents are dropped silently: the doc
            // may have been destroyed while the reply was in flight.
            Message::Fetch(m) => {
                if let Some(doc) = self.docs.get(&m.c, &m.d) {
                    doc.handle_fetch(self, envelope_err, m.data);
                }
            }
            Message::Subscribe(m) => {
                if let Some(doc) = self.docs.get(&m.c, &m.d) {
                    doc.handle_subscribe(self, envelope_err, m.data);
                }
            }
            Message::Unsubscribe(m) => {
                if let Some(doc) = self.docs.get(&m.c, &m.d) {
                    doc.handle_unsubscribe(self, envelope_err);
                }
            }
            Message::Op(m) => {
                if let Some(doc) = self.docs.get(&m.c, &m.d) {
                    // An error envelope still delivers alongside the op; the
                    // document layer decides what it means.
                    doc.handle_op(self, envelope_err, &m);
                }
            }

            Message::BulkFetch(m) => self.route_bulk(BulkAction::Fetch, m, envelope_err),
            Message::BulkSubscribe(m) => self.route_bulk(BulkAction::Subscribe, m, envelope_err),
            Message::BulkUnsubscribe(m) => {
                self.route_bulk(BulkAction::Unsubscribe, m, envelope_err)
            }
        }
        Ok(())
    }

    fn handle_init(&mut self, init: InitMessage) -> Result<(), SyncError> {
        let protocol_ok =
            init.protocol.as_ref().and_then(JsonValue::as_u64) == Some(PROTOCOL_VERSION);
        if !protocol_ok {
            return Err(SyncError::new(
                codes::INVALID_PROTOCOL_VERSION,
                "Invalid protocol version",
            ));
        }

        let type_ok = init.default_type.as_ref().and_then(JsonValue::as_str)
            == Some(self.default_type.as_str());
        if !type_ok {
            return Err(SyncError::new(
                codes::INVALID_DEFAULT_TYPE,
                "Invalid default type",
            ));
        }

        let id = match init.id.as_ref().and_then(JsonValue::as_str) {
            Some(id) => id.to_string(),
            None => {
                return Err(SyncError::new(
                    codes::INVALID_CLIENT_ID,
                    "Invalid client id",
                ))
            }
        };

        // Only a connecting session may take the server's id: set_state
        // rejects connected-from-anywhere-else, and a rejected transition
        // must leave the connection untouched.
        if self.state == ConnectionState::Connecting {
            self.client_id = Some(id);
        }
        self.set_state(ConnectionState::Connected, None);
        Ok(())
    }

    fn route_bulk(&mut self, action: BulkAction, m: BulkMessage, err: Option<SyncError>) {
        if let Some(data) = m.data {
            for (id, payload) in data {
                if let Some(doc) = self.docs.get(&m.c, &id) {
                    self.forward_bulk(action, &doc, err.clone(), Some(payload));
                }
            }
        } else if let Some(field) = m.b {
            let ids: Vec<String> = match field {
                BulkField::Ids(ids) => ids,
                BulkField::Versions(map) => map.into_keys().collect(),
            };
            for id in ids {
                if let Some(doc) = self.docs.get(&m.c, &id) {
                    self.forward_bulk(action, &doc, err.clone(), None);
                }
            }
        } else {
            log::warn!("invalid bulk reply for collection {}", m.c);
        }
    }

    fn forward_bulk(
        &mut self,
        action: BulkAction,
        doc: &Arc<dyn DocLink>,
        err: Option<SyncError>,
        payload: Option<JsonValue>,
    ) {
        match action {
            BulkAction::Fetch => doc.handle_fetch(self, err, payload),
            BulkAction::Subscribe => doc.handle_subscribe(self, err, payload),
            BulkAction::Unsubscribe => doc.handle_unsubscribe(self, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DocMessage;
    use std::sync::Mutex;

    /// Doc link that tracks nothing; enough to occupy the registry.
    struct NullDoc {
        collection: String,
        id: String,
    }

    impl NullDoc {
        fn new(collection: &str, id: &str) -> Self {
            Self {
                collection: collection.into(),
                id: id.into(),
            }
        }
    }

    impl DocLink for NullDoc {
        fn collection(&self) -> &str {
            &self.collection
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> Option<u64> {
            None
        }
        fn on_connection_state_changed(&self, _conn: &mut Connection) {}
        fn handle_fetch(&self, _: &mut Connection, _: Option<SyncError>, _: Option<JsonValue>) {}
        fn handle_subscribe(&self, _: &mut Connection, _: Option<SyncError>, _: Option<JsonValue>) {
        }
        fn handle_unsubscribe(&self, _: &mut Connection, _: Option<SyncError>) {}
        fn handle_op(&self, _: &mut Connection, _: Option<SyncError>, _: &OpMessage) {}
        fn has_pending(&self) -> bool {
            false
        }
        fn has_write_pending(&self) -> bool {
            false
        }
        fn once_nothing_pending(&self, _callback: Box<dyn FnOnce() + Send>) {}
    }

    /// Socket that records every frame and its configured ready-state.
    struct RecordingSocket {
        ready: ReadyState,
        sent: Arc<Mutex<Vec<Message>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordingSocket {
        fn open() -> (Box<Self>, Arc<Mutex<Vec<Message>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self {
                    ready: ReadyState::Open,
                    sent: sent.clone(),
                    closed: Arc::new(Mutex::new(false)),
                }),
                sent,
            )
        }
    }

    impl SocketAdapter for RecordingSocket {
        fn ready_state(&self) -> ReadyState {
            self.ready
        }
        fn send(&mut self, frame: &Message) -> Result<(), crate::protocol::CodecError> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }
        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn connected_connection() -> (Connection, Arc<Mutex<Vec<Message>>>) {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, sent) = RecordingSocket::open();
        conn.bind_socket(socket);
        conn.handle_message(r#"{"a":"init","protocol":1,"type":"json0","id":"C1"}"#);
        assert_eq!(conn.state(), ConnectionState::Connected);
        (conn, sent)
    }

    #[test]
    fn test_initial_state_from_ready_state() {
        let mut conn = Connection::new(ConnectionOptions::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.can_send());
    }

    #[test]
    fn test_init_promotes_to_connected() {
        let (conn, _) = connected_connection();
        assert!(conn.can_send());
        assert_eq!(conn.client_id(), Some("C1"));
    }

    #[test]
    fn test_init_with_bad_protocol_is_rejected() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        let mut events = conn.subscribe_events();

        conn.handle_message(r#"{"a":"init","protocol":2,"type":"json0","id":"C1"}"#);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.client_id().is_none());
        let mut saw_4019 = false;
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Error(err) = ev {
                assert_eq!(err.code, codes::INVALID_PROTOCOL_VERSION);
                saw_4019 = true;
            }
        }
        assert!(saw_4019);
    }

    #[test]
    fn test_init_with_wrong_type_is_rejected() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        let mut events = conn.subscribe_events();

        conn.handle_message(r#"{"a":"init","protocol":1,"type":"text0","id":"C1"}"#);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        let mut codes_seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Error(err) = ev {
                codes_seen.push(err.code);
            }
        }
        assert_eq!(codes_seen, vec![codes::INVALID_DEFAULT_TYPE]);
    }

    #[test]
    fn test_init_with_non_string_id_is_rejected() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        let mut events = conn.subscribe_events();

        conn.handle_message(r#"{"a":"init","protocol":1,"type":"json0","id":7}"#);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        let mut codes_seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Error(err) = ev {
                codes_seen.push(err.code);
            }
        }
        assert_eq!(codes_seen, vec![codes::INVALID_CLIENT_ID]);
    }

    #[test]
    fn test_init_while_disconnected_leaves_connection_unchanged() {
        let (mut conn, _) = connected_connection();
        conn.handle_close("Request failed");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let mut events = conn.subscribe_events();

        // A racing or misbehaving server resends init after the close.
        conn.handle_message(r#"{"a":"init","protocol":1,"type":"json0","id":"C9"}"#);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.client_id().is_none());
        let mut saw_5007 = false;
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Error(err) = ev {
                assert_eq!(err.code, codes::ILLEGAL_STATE_TRANSITION);
                saw_5007 = true;
            }
        }
        assert!(saw_5007);
    }

    #[test]
    fn test_illegal_transition_is_rejected_with_5007() {
        let (mut conn, _) = connected_connection();
        let mut events = conn.subscribe_events();

        conn.set_state(ConnectionState::Connecting, None);

        assert_eq!(conn.state(), ConnectionState::Connected);
        match events.try_recv().unwrap() {
            ConnectionEvent::Error(err) => {
                assert_eq!(err.code, codes::ILLEGAL_STATE_TRANSITION);
                assert_eq!(
                    err.message,
                    "Cannot transition directly from connected to connecting"
                );
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_close_reason_mapping() {
        for (reason, expected) in [
            ("closed", ConnectionState::Closed),
            ("Closed", ConnectionState::Closed),
            ("stopped", ConnectionState::Stopped),
            ("Stopped by server", ConnectionState::Stopped),
            ("Request failed", ConnectionState::Disconnected),
            ("CLOSED", ConnectionState::Disconnected),
        ] {
            let (mut conn, _) = connected_connection();
            conn.handle_close(reason);
            assert_eq!(conn.state(), expected, "reason {reason:?}");
        }
    }

    #[test]
    fn test_disconnect_resets_seq_and_client_id() {
        let (mut conn, _) = connected_connection();
        conn.next_seq();
        conn.next_seq();
        assert_eq!(conn.seq(), 3);

        conn.handle_close("Request failed");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.seq(), 1);
        assert!(conn.client_id().is_none());
        assert!(!conn.can_send());
    }

    #[test]
    fn test_state_events_fire_in_order() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        let mut events = conn.subscribe_events();

        conn.handle_message(r#"{"a":"init","protocol":1,"type":"json0","id":"C1"}"#);

        let mut names = Vec::new();
        while let Ok(ev) = events.try_recv() {
            names.push(match ev {
                ConnectionEvent::Receive(_) => "receive",
                ConnectionEvent::Connected { .. } => "connected",
                ConnectionEvent::State { .. } => "state",
                _ => "other",
            });
        }
        assert_eq!(names, vec!["receive", "connected", "state"]);
    }

    #[test]
    fn test_send_outside_bulk_emits_single_frame() {
        let (mut conn, sent) = connected_connection();
        conn.get("books", "moby", || {
            Arc::new(NullDoc::new("books", "moby"))
        });

        let duplicate = conn.send_subscribe("books", "moby", Some(2));

        assert!(!duplicate);
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[Message::Subscribe(DocMessage::new("books", "moby", Some(2)))]
        );
    }

    #[test]
    fn test_bulk_window_coalesces_and_reports_duplicates() {
        let (mut conn, sent) = connected_connection();
        for id in ["a", "b"] {
            conn.get("books", id, || {
                Arc::new(NullDoc::new("books", id))
            });
        }

        conn.start_bulk();
        assert!(!conn.send_subscribe("books", "a", Some(1)));
        assert!(!conn.send_subscribe("books", "b", Some(1)));
        assert!(conn.send_subscribe("books", "a", Some(1)));
        assert!(sent.lock().unwrap().is_empty());
        conn.end_bulk();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Message::BulkSubscribe(m) => match &m.b {
                Some(BulkField::Versions(v)) => assert_eq!(v.len(), 2),
                other => panic!("expected versions, got {other:?}"),
            },
            other => panic!("expected bs, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_bulk_window_emits_nothing() {
        let (mut conn, sent) = connected_connection();
        conn.start_bulk();
        conn.end_bulk();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_get_is_idempotent() {
        let (mut conn, _) = connected_connection();
        let first = conn.get("books", "moby", || {
            Arc::new(NullDoc::new("books", "moby"))
        });
        let second = conn.get("books", "moby", || {
            panic!("must not construct a second doc")
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(conn.doc_count(), 1);
    }

    #[test]
    fn test_destroy_then_get_returns_fresh_doc() {
        let (mut conn, _) = connected_connection();
        let first = conn.get("books", "moby", || {
            Arc::new(NullDoc::new("books", "moby"))
        });
        assert!(conn.destroy_doc("books", "moby"));
        let second = conn.get("books", "moby", || {
            Arc::new(NullDoc::new("books", "moby"))
        });
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_send_op_is_never_batched() {
        let (mut conn, sent) = connected_connection();
        conn.get("books", "moby", || {
            Arc::new(NullDoc::new("books", "moby"))
        });

        conn.start_bulk();
        let seq = conn.next_seq();
        conn.send_op(
            "books",
            "moby",
            Some(5),
            &DocOp {
                src: Some("C1".into()),
                seq,
                content: OpContent::Del,
            },
        );

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Message::Op(m) => {
                assert_eq!(m.v, Some(5));
                assert_eq!(m.seq, Some(1));
                assert_eq!(m.del, Some(true));
                assert!(m.op.is_none());
            }
            other => panic!("expected op, got {other:?}"),
        }
        drop(frames);
        conn.end_bulk();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rebinding_closes_previous_socket() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        let closed = socket.closed.clone();
        conn.bind_socket(socket);

        let (replacement, _) = RecordingSocket::open();
        conn.bind_socket(replacement);
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_receive_hook_can_suppress_dispatch() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        conn.set_receive_hook(Box::new(|envelope| {
            envelope.take();
        }));

        conn.handle_message(r#"{"a":"init","protocol":1,"type":"json0","id":"C1"}"#);

        // Suppressed init never reached the dispatcher.
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.client_id().is_none());
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let mut conn = Connection::new(ConnectionOptions::default());
        let (socket, _) = RecordingSocket::open();
        conn.bind_socket(socket);
        let mut events = conn.subscribe_events();

        conn.handle_message("{\"a\":\"zz\"}");
        conn.handle_message("garbage");

        assert!(events.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_transport_error_does_not_change_state() {
        let (mut conn, _) = connected_connection();
        let mut events = conn.subscribe_events();

        conn.handle_error("tls handshake lost");

        assert_eq!(conn.state(), ConnectionState::Connected);
        match events.try_recv().unwrap() {
            ConnectionEvent::ConnectionError { message } => {
                assert_eq!(message, "tls handshake lost");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}
