//! # inkwire — OT collaboration connection core and pubsub fan-out
//!
//! The client half of an operational-transform collaboration protocol, plus
//! the server-side publish/subscribe fan-out that delivers document
//! mutations to subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ Connection   │ ◄──────────────► │ collab server│
//! │ (per client) │   SocketAdapter  └──────┬───────┘
//! └──────┬───────┘                         │ publishes ops
//!        │ registries                      ▼
//! ┌──────┴───────┐                  ┌──────────────┐
//! │ Doc / Query  │                  │ PubSub       │
//! │ (your types) │                  │ (fan-out)    │
//! └──────────────┘                  └──────┬───────┘
//!                                          │ OpStream per subscriber
//!                                   ┌──────┴───────┐
//!                                   │ subscribers  │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire codec, frames tagged by the action field `a`
//! - [`connection`] — reconnect-safe session state machine, registries,
//!   bulk batching, inbound dispatch, quiescence
//! - [`socket`] — the contract a transport must satisfy
//! - [`transport`] — websocket transport built on tokio-tungstenite
//! - [`doc`] / [`query`] — the interfaces the connection drives
//! - [`events`] — connection event fan-out
//! - [`pubsub`] — channel fan-out with refcounted transport subscription
//!
//! Documents and queries themselves (snapshot state, OT application, result
//! sets) live outside this crate; the connection drives them through the
//! [`doc::DocLink`] and [`query::QueryLink`] traits.

pub mod bulk;
pub mod connection;
pub mod doc;
pub mod error;
pub mod events;
pub mod protocol;
pub mod pubsub;
pub mod query;
pub mod registry;
pub mod socket;
pub mod transport;

// Re-exports for convenience
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use doc::{DocLink, DocOp, OpContent};
pub use error::{codes, SyncError};
pub use events::{ConnectionEvent, EventHub, ReceiveEnvelope};
pub use protocol::{Message, OpMessage, DEFAULT_TYPE};
pub use pubsub::{MemoryBackend, OpStream, PubSub, PubSubBackend, PubSubError, PubSubOptions};
pub use query::{QueryAction, QueryLink};
pub use socket::{ReadyState, SocketAdapter};
pub use transport::WsTransport;
