//! Channel fan-out with reference-counted transport subscription.
//!
//! Server-side counterpart of the connection: published document mutations
//! arrive from an abstract backend (Redis, in-memory, …) and fan out to the
//! local subscriber streams of each channel.
//!
//! ```text
//! publish(channels, op)          backend wire
//!        │                            │
//!        ▼                            ▼
//! ┌────────────────────────────────────────┐
//! │ PubSub                                 │
//! │   subscribed: channel → confirmed      │
//! │   streams:    channel → {id → sender}  │
//! └──────┬─────────────┬───────────────────┘
//!        ▼             ▼   one copy per subscriber
//!    OpStream      OpStream
//! ```
//!
//! The correctness heart of this module is the unsubscribe race: when the
//! last stream on a channel closes, `subscribed` is cleared *synchronously*
//! under the same lock, before the asynchronous backend unsubscribe is even
//! scheduled. A subscribe arriving in that window therefore behaves as a
//! fresh subscribe instead of attaching to a transport subscription that is
//! about to be torn down.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 11

mod memory;
mod stream;

pub use memory::MemoryBackend;
pub use stream::OpStream;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::protocol::OpMessage;

/// The transport a [`PubSub`] delegates to.
///
/// `subscribe` resolves once the transport has confirmed the channel
/// subscription; messages for confirmed channels arrive on the delivery
/// channel handed over by `take_messages`.
pub trait PubSubBackend: Send + Sync + 'static {
    /// Hand over the inbound delivery channel. Called once, at
    /// [`PubSub::new`].
    fn take_messages(&mut self) -> mpsc::UnboundedReceiver<(String, OpMessage)>;

    fn publish(
        &self,
        channels: &[String],
        message: &OpMessage,
    ) -> impl Future<Output = Result<(), PubSubError>> + Send;

    fn subscribe(&self, channel: &str) -> impl Future<Output = Result<(), PubSubError>> + Send;

    fn unsubscribe(&self, channel: &str) -> impl Future<Output = Result<(), PubSubError>> + Send;
}

/// PubSub errors.
#[derive(Debug, Clone)]
pub enum PubSubError {
    /// The backend transport failed.
    Backend(String),
    /// The pubsub instance has been closed.
    Closed,
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::Backend(e) => write!(f, "pubsub backend error: {e}"),
            PubSubError::Closed => write!(f, "pubsub is closed"),
        }
    }
}

impl std::error::Error for PubSubError {}

/// PubSub configuration.
#[derive(Debug, Clone, Default)]
pub struct PubSubOptions {
    /// Prepended as `"<prefix> <channel>"` to every channel name, so one
    /// backend can serve several pubsub instances.
    pub prefix: Option<String>,
}

pub(crate) struct PubSubInner {
    /// Next stream id, starting at 1.
    next_stream_id: u64,
    /// Total live streams across all channels.
    streams_count: usize,
    streams: HashMap<String, HashMap<u64, mpsc::UnboundedSender<OpMessage>>>,
    /// Channels whose backend subscription has been confirmed. A channel may
    /// have a subscribe in flight and not appear here yet.
    subscribed: HashMap<String, bool>,
    closed: bool,
}

impl PubSubInner {
    /// Fan a payload out to every subscriber stream of a channel, one copy
    /// per stream so no subscriber observes another's mutations.
    fn emit(&self, channel: &str, message: &OpMessage) {
        let Some(streams) = self.streams.get(channel) else {
            return;
        };
        for sender in streams.values() {
            let copy = message.clone();
            if sender.send(copy).is_err() {
                log::trace!("dropping op for defunct stream on {channel}");
            }
        }
    }

    /// Remove one stream. Returns true when it was the channel's last, in
    /// which case `subscribed` has been cleared synchronously and the caller
    /// must schedule the backend unsubscribe.
    pub(crate) fn remove_stream(&mut self, channel: &str, id: u64) -> bool {
        let Some(streams) = self.streams.get_mut(channel) else {
            return false;
        };
        if streams.remove(&id).is_none() {
            return false;
        }
        self.streams_count -= 1;
        if streams.is_empty() {
            self.streams.remove(channel);
            self.subscribed.remove(channel);
            true
        } else {
            false
        }
    }
}

/// The fan-out core. Cheap to clone; clones share state.
pub struct PubSub<B: PubSubBackend> {
    backend: Arc<B>,
    inner: Arc<Mutex<PubSubInner>>,
    prefix: Option<String>,
    /// Type-erased deferred backend unsubscribe, cloned into each stream.
    unsubscriber: Arc<dyn Fn(String) + Send + Sync>,
}

impl<B: PubSubBackend> Clone for PubSub<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            inner: self.inner.clone(),
            prefix: self.prefix.clone(),
            unsubscriber: self.unsubscriber.clone(),
        }
    }
}

impl<B: PubSubBackend> PubSub<B> {
    /// Build a pubsub instance over a backend and start draining its
    /// delivery channel. Must run inside a tokio runtime.
    pub fn new(options: PubSubOptions, mut backend: B) -> Self {
        let mut messages = backend.take_messages();
        let backend = Arc::new(backend);
        let inner = Arc::new(Mutex::new(PubSubInner {
            next_stream_id: 1,
            streams_count: 0,
            streams: HashMap::new(),
            subscribed: HashMap::new(),
            closed: false,
        }));

        let pump_inner = inner.clone();
        tokio::spawn(async move {
            while let Some((channel, message)) = messages.recv().await {
                let guard = pump_inner.lock().expect("pubsub lock poisoned");
                guard.emit(&channel, &message);
            }
            log::debug!("pubsub delivery channel drained");
        });

        let unsub_backend = backend.clone();
        let unsubscriber: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |channel: String| {
            let backend = unsub_backend.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = backend.unsubscribe(&channel).await {
                            log::warn!("backend unsubscribe for {channel} failed: {e}");
                        }
                    });
                }
                Err(_) => log::warn!("no runtime to unsubscribe {channel}"),
            }
        });

        Self {
            backend,
            inner,
            prefix: options.prefix,
            unsubscriber,
        }
    }

    fn prefixed(&self, channel: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix} {channel}"),
            None => channel.to_string(),
        }
    }

    /// Publish a payload to a set of channels.
    pub async fn publish(
        &self,
        channels: &[&str],
        message: &OpMessage,
    ) -> Result<(), PubSubError> {
        if self.inner.lock().expect("pubsub lock poisoned").closed {
            return Err(PubSubError::Closed);
        }
        let channels: Vec<String> = channels.iter().map(|c| self.prefixed(c)).collect();
        self.backend.publish(&channels, message).await
    }

    /// Subscribe to a channel, returning a fresh local stream.
    ///
    /// When the channel's backend subscription is already confirmed, no
    /// backend call is made and the stream is created on a later tick,
    /// never synchronously with the caller's current poll.
    pub async fn subscribe(&self, channel: &str) -> Result<OpStream, PubSubError> {
        let channel = self.prefixed(channel);

        let already = {
            let guard = self.inner.lock().expect("pubsub lock poisoned");
            if guard.closed {
                return Err(PubSubError::Closed);
            }
            guard.subscribed.get(&channel).copied().unwrap_or(false)
        };

        if already {
            tokio::task::yield_now().await;
            if self.inner.lock().expect("pubsub lock poisoned").closed {
                return Err(PubSubError::Closed);
            }
            return Ok(self.create_stream(&channel));
        }

        self.backend.subscribe(&channel).await?;

        let mut guard = self.inner.lock().expect("pubsub lock poisoned");
        if guard.closed {
            return Err(PubSubError::Closed);
        }
        guard.subscribed.insert(channel.clone(), true);
        drop(guard);
        Ok(self.create_stream(&channel))
    }

    fn create_stream(&self, channel: &str) -> OpStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock().expect("pubsub lock poisoned");
        let id = guard.next_stream_id;
        guard.next_stream_id += 1;
        guard
            .streams
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        guard.streams_count += 1;
        drop(guard);

        log::debug!("stream {id} subscribed to {channel}");
        OpStream::new(
            id,
            channel.to_string(),
            rx,
            Arc::downgrade(&self.inner),
            self.unsubscriber.clone(),
        )
    }

    /// Destroy every live stream, tear down the confirmed backend
    /// subscriptions and refuse further use.
    pub fn close(&self) {
        let confirmed: Vec<String> = {
            let mut guard = self.inner.lock().expect("pubsub lock poisoned");
            guard.closed = true;
            guard.streams.clear();
            guard.streams_count = 0;
            guard.subscribed.drain().map(|(channel, _)| channel).collect()
        };
        // Each confirmed channel gets the same deferred backend unsubscribe
        // that closing its last stream would have triggered.
        for channel in confirmed {
            (self.unsubscriber)(channel);
        }
    }

    /// Total live streams across all channels.
    pub fn streams_count(&self) -> usize {
        self.inner.lock().expect("pubsub lock poisoned").streams_count
    }

    /// Whether the backend subscription for a channel is confirmed.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        let channel = self.prefixed(channel);
        self.inner
            .lock()
            .expect("pubsub lock poisoned")
            .subscribed
            .get(&channel)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(collection: &str, id: &str) -> OpMessage {
        OpMessage {
            c: collection.to_string(),
            d: id.to_string(),
            v: Some(1),
            src: None,
            seq: None,
            op: Some(serde_json::json!([{"p": ["x"], "na": 1}])),
            create: None,
            del: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_reaches_stream() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let mut stream = pubsub.subscribe("books.moby").await.unwrap();

        pubsub.publish(&["books.moby"], &op("books", "moby")).await.unwrap();

        let received = stream.recv().await.unwrap();
        assert_eq!(received.c, "books");
        assert_eq!(received.d, "moby");
    }

    #[tokio::test]
    async fn test_fan_out_copies_per_subscriber() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let mut s1 = pubsub.subscribe("room").await.unwrap();
        let mut s2 = pubsub.subscribe("room").await.unwrap();
        assert_eq!(pubsub.streams_count(), 2);

        pubsub.publish(&["room"], &op("books", "moby")).await.unwrap();

        let mut a = s1.recv().await.unwrap();
        let b = s2.recv().await.unwrap();
        a.d.push_str("-mutated");
        assert_eq!(b.d, "moby");
    }

    #[tokio::test]
    async fn test_second_subscribe_skips_backend() {
        let backend = MemoryBackend::new();
        let calls = backend.subscribe_calls();
        let pubsub = PubSub::new(PubSubOptions::default(), backend);

        let _s1 = pubsub.subscribe("room").await.unwrap();
        let _s2 = pubsub.subscribe("room").await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_ids_are_monotonic_from_one() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let s1 = pubsub.subscribe("a").await.unwrap();
        let s2 = pubsub.subscribe("b").await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 2);
    }

    #[tokio::test]
    async fn test_last_stream_close_clears_subscribed_synchronously() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let mut s1 = pubsub.subscribe("room").await.unwrap();
        let mut s2 = pubsub.subscribe("room").await.unwrap();

        s1.close();
        assert!(pubsub.is_subscribed("room"));

        s2.close();
        // No await between close and this check: the clear is synchronous.
        assert!(!pubsub.is_subscribed("room"));
        assert_eq!(pubsub.streams_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let mut stream = pubsub.subscribe("room").await.unwrap();
        stream.close();
        stream.close();
        assert_eq!(pubsub.streams_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_stream() {
        let pubsub = PubSub::new(PubSubOptions::default(), MemoryBackend::new());
        let stream = pubsub.subscribe("room").await.unwrap();
        drop(stream);
        assert_eq!(pubsub.streams_count(), 0);
        assert!(!pubsub.is_subscribed("room"));
    }

    #[tokio::test]
    async fn test_prefix_is_applied() {
        let backend = MemoryBackend::new();
        let channels = backend.subscribed_channels();
        let pubsub = PubSub::new(
            PubSubOptions {
                prefix: Some("app42".to_string()),
            },
            backend,
        );

        let mut stream = pubsub.subscribe("room").await.unwrap();
        assert!(channels.lock().unwrap().contains("app42 room"));

        pubsub.publish(&["room"], &op("books", "moby")).await.unwrap();
        assert!(stream.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_pubsub_close_refuses_further_use() {
        let backend = MemoryBackend::new();
        let unsubscribe_calls = backend.unsubscribe_calls();
        let pubsub = PubSub::new(PubSubOptions::default(), backend);
        let mut stream = pubsub.subscribe("room").await.unwrap();

        pubsub.close();

        assert!(stream.recv().await.is_none());
        assert!(matches!(
            pubsub.subscribe("room").await,
            Err(PubSubError::Closed)
        ));
        assert!(matches!(
            pubsub.publish(&["room"], &op("books", "moby")).await,
            Err(PubSubError::Closed)
        ));

        // The confirmed backend subscription is torn down, not abandoned.
        for _ in 0..50 {
            if unsubscribe_calls.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            unsubscribe_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // A straggling stream close after the teardown must not unsubscribe
        // a second time.
        stream.close();
        tokio::task::yield_now().await;
        assert_eq!(
            unsubscribe_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
