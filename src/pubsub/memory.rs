//! In-process pubsub backend.
//!
//! Publishes short-circuit straight into the local delivery channel for
//! every subscribed channel. Useful for single-process deployments and for
//! tests; a Redis-style backend implements the same trait over a wire.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{PubSubBackend, PubSubError};
use crate::protocol::OpMessage;

pub struct MemoryBackend {
    subscribed: Arc<Mutex<HashSet<String>>>,
    delivery_tx: mpsc::UnboundedSender<(String, OpMessage)>,
    delivery_rx: Option<mpsc::UnboundedReceiver<(String, OpMessage)>>,
    subscribe_calls: Arc<AtomicU64>,
    unsubscribe_calls: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Self {
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            delivery_tx,
            delivery_rx: Some(delivery_rx),
            subscribe_calls: Arc::new(AtomicU64::new(0)),
            unsubscribe_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of transport subscribe calls, for assertions on the
    /// refcounting behaviour.
    pub fn subscribe_calls(&self) -> Arc<AtomicU64> {
        self.subscribe_calls.clone()
    }

    /// Counter of transport unsubscribe calls.
    pub fn unsubscribe_calls(&self) -> Arc<AtomicU64> {
        self.unsubscribe_calls.clone()
    }

    /// The currently subscribed (prefixed) channel names.
    pub fn subscribed_channels(&self) -> Arc<Mutex<HashSet<String>>> {
        self.subscribed.clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubBackend for MemoryBackend {
    fn take_messages(&mut self) -> mpsc::UnboundedReceiver<(String, OpMessage)> {
        self.delivery_rx
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    async fn publish(
        &self,
        channels: &[String],
        message: &OpMessage,
    ) -> Result<(), PubSubError> {
        let subscribed = self.subscribed.lock().expect("memory backend lock poisoned");
        for channel in channels {
            if subscribed.contains(channel) {
                let _ = self.delivery_tx.send((channel.clone(), message.clone()));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), PubSubError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribed
            .lock()
            .expect("memory backend lock poisoned")
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribed
            .lock()
            .expect("memory backend lock poisoned")
            .remove(channel);
        Ok(())
    }
}
