//! Websocket transport for the collaboration connection.
//!
//! Wires a [`Connection`] to a server over tokio-tungstenite: a writer task
//! drains encoded frames from the socket adapter, a reader task feeds
//! inbound text frames into the connection's entry points. Frames produced
//! by one call-chain keep their issue order (single writer queue), and
//! inbound frames are dispatched in receive order (single reader loop).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::connection::Connection;
use crate::protocol::{self, CodecError, Message};
use crate::socket::{ReadyState, SocketAdapter};

/// A connection shared between the caller and the transport tasks.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Transport errors.
#[derive(Debug)]
pub enum TransportError {
    Connect(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "websocket connect failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

enum Outbound {
    Frame(String),
    Close,
}

/// Socket adapter handed to the connection; sends enqueue onto the writer
/// task's queue.
struct WsSocket {
    state: Arc<AtomicU8>,
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketAdapter for WsSocket {
    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            STATE_CLOSED => ReadyState::Closed,
            _ => ReadyState::Opening,
        }
    }

    fn send(&mut self, frame: &Message) -> Result<(), CodecError> {
        let text = protocol::encode(frame)?;
        if self.out_tx.send(Outbound::Frame(text)).is_err() {
            log::warn!("websocket writer is gone; dropping frame");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state.store(STATE_CLOSING, Ordering::SeqCst);
        let _ = self.out_tx.send(Outbound::Close);
    }
}

/// A live websocket transport; dropping it leaves the tasks running until
/// the socket closes.
pub struct WsTransport {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to `url`, bind the socket to `conn` and spawn the transport
    /// tasks. The server is expected to send its `init` frame right away,
    /// promoting the connection to connected.
    pub async fn connect(url: &str, conn: SharedConnection) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(AtomicU8::new(STATE_OPEN));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        {
            let mut guard = conn.lock().expect("connection lock poisoned");
            guard.bind_socket(Box::new(WsSocket {
                state: state.clone(),
                out_tx,
            }));
            guard.handle_open();
        }

        let writer = tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(text) => {
                        if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_writer.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_conn = conn.clone();
        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            let mut close_reason: Option<String> = None;
            while let Some(incoming) = ws_reader.next().await {
                match incoming {
                    Ok(WsMessage::Text(text)) => {
                        let mut guard =
                            reader_conn.lock().expect("connection lock poisoned");
                        guard.handle_message(text.as_str());
                    }
                    Ok(WsMessage::Close(frame)) => {
                        close_reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|reason| !reason.is_empty());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let mut guard =
                            reader_conn.lock().expect("connection lock poisoned");
                        guard.handle_error(e.to_string());
                        break;
                    }
                }
            }

            reader_state.store(STATE_CLOSED, Ordering::SeqCst);
            let mut guard = reader_conn.lock().expect("connection lock poisoned");
            guard.handle_close(close_reason.as_deref().unwrap_or("disconnected"));
        });

        Ok(Self { writer, reader })
    }

    /// Abort the transport tasks without waiting for the socket.
    pub fn abort(&self) {
        self.writer.abort();
        self.reader.abort();
    }

    /// Wait for the socket to close. The writer is stopped afterwards;
    /// whatever it had not flushed has nowhere to go.
    pub async fn join(self) {
        let _ = self.reader.await;
        self.writer.abort();
        let _ = self.writer.await;
    }
}
