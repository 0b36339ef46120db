//! Per-subscriber delivery stream.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use super::PubSubInner;
use crate::protocol::OpMessage;

/// A subscriber's delivery queue on a pubsub channel.
///
/// Closing is idempotent; dropping the stream closes it. Closing the last
/// stream on a channel clears the channel's confirmed-subscription flag
/// synchronously and schedules the asynchronous backend unsubscribe.
pub struct OpStream {
    id: u64,
    channel: String,
    closed: bool,
    rx: mpsc::UnboundedReceiver<OpMessage>,
    inner: Weak<Mutex<PubSubInner>>,
    unsubscriber: Arc<dyn Fn(String) + Send + Sync>,
}

impl OpStream {
    pub(crate) fn new(
        id: u64,
        channel: String,
        rx: mpsc::UnboundedReceiver<OpMessage>,
        inner: Weak<Mutex<PubSubInner>>,
        unsubscriber: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Self {
        Self {
            id,
            channel,
            closed: false,
            rx,
            inner,
            unsubscriber,
        }
    }

    /// This stream's id, unique per pubsub instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The (prefixed) channel this stream is subscribed to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Await the next published payload. `None` once the stream is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<OpMessage> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<OpMessage> {
        self.rx.try_recv().ok()
    }

    /// Detach from the channel. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let was_last = {
            let mut guard = inner.lock().expect("pubsub lock poisoned");
            guard.remove_stream(&self.channel, self.id)
        };
        if was_last {
            log::debug!("last stream on {} closed; unsubscribing", self.channel);
            (self.unsubscriber)(self.channel.clone());
        }
    }

    /// Tear the stream down. Equivalent to [`close`](Self::close).
    pub fn destroy(&mut self) {
        self.close();
    }
}

impl Drop for OpStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpStream")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("closed", &self.closed)
            .finish()
    }
}
