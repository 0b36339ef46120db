//! Per-collection coalescing of subscription traffic.
//!
//! Between `start_bulk` and `end_bulk` the connection records outbound
//! fetch/subscribe/unsubscribe per collection and per action instead of
//! emitting frames. Flushing partitions each (collection, action) group by
//! whether a version was recorded:
//!
//! ```text
//! one version-less entry    →  {a, c, d}
//! one versioned entry       →  {a, c, d, v}
//! many version-less entries →  {a: "b"+a, c, b: [ids…]}
//! many versioned entries    →  {a: "b"+a, c, b: {id: v, …}}
//! ```
//!
//! so a state transition that re-notifies every document produces at most
//! two frames per collection per action.

use std::collections::BTreeMap;

use crate::protocol::{BulkField, BulkMessage, DocMessage, Message};

/// One of the three batchable document actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Fetch,
    Subscribe,
    Unsubscribe,
}

impl BulkAction {
    const ALL: [BulkAction; 3] = [
        BulkAction::Fetch,
        BulkAction::Subscribe,
        BulkAction::Unsubscribe,
    ];

    /// Build the single-frame form for one document.
    pub(crate) fn single_frame(&self, collection: &str, id: &str, version: Option<u64>) -> Message {
        self.single(DocMessage::new(collection, id, version))
    }

    /// The single-frame form of this action.
    fn single(&self, doc: DocMessage) -> Message {
        match self {
            BulkAction::Fetch => Message::Fetch(doc),
            BulkAction::Subscribe => Message::Subscribe(doc),
            BulkAction::Unsubscribe => Message::Unsubscribe(doc),
        }
    }

    /// The bulk-frame form of this action.
    fn bulk(&self, bulk: BulkMessage) -> Message {
        match self {
            BulkAction::Fetch => Message::BulkFetch(bulk),
            BulkAction::Subscribe => Message::BulkSubscribe(bulk),
            BulkAction::Unsubscribe => Message::BulkUnsubscribe(bulk),
        }
    }
}

#[derive(Default)]
struct CollectionBulk {
    fetch: BTreeMap<String, Option<u64>>,
    subscribe: BTreeMap<String, Option<u64>>,
    unsubscribe: BTreeMap<String, Option<u64>>,
}

impl CollectionBulk {
    fn entries(&mut self, action: BulkAction) -> &mut BTreeMap<String, Option<u64>> {
        match action {
            BulkAction::Fetch => &mut self.fetch,
            BulkAction::Subscribe => &mut self.subscribe,
            BulkAction::Unsubscribe => &mut self.unsubscribe,
        }
    }
}

/// The accumulator behind an open bulk window. The connection holds it in an
/// `Option`: recording outside a window is unrepresentable.
#[derive(Default)]
pub struct BulkAccumulator {
    collections: BTreeMap<String, CollectionBulk>,
}

impl BulkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one action for one document. Returns true when the document
    /// was already recorded for this (collection, action); the latest
    /// version wins.
    pub fn record(
        &mut self,
        action: BulkAction,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> bool {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .entries(action)
            .insert(id.to_string(), version)
            .is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Consume the accumulator into the frames to emit, in collection order,
    /// fetch/subscribe/unsubscribe per collection, versioned group first.
    pub fn flush(self) -> Vec<Message> {
        let mut frames = Vec::new();
        for (collection, mut bulk) in self.collections {
            for action in BulkAction::ALL {
                let entries = std::mem::take(bulk.entries(action));
                flush_group(&mut frames, action, &collection, entries);
            }
        }
        frames
    }
}

fn flush_group(
    frames: &mut Vec<Message>,
    action: BulkAction,
    collection: &str,
    entries: BTreeMap<String, Option<u64>>,
) {
    let mut bare: Vec<String> = Vec::new();
    let mut versioned: BTreeMap<String, Option<u64>> = BTreeMap::new();
    for (id, version) in entries {
        match version {
            Some(_) => {
                versioned.insert(id, version);
            }
            None => bare.push(id),
        }
    }

    match versioned.len() {
        0 => {}
        1 => {
            if let Some((id, version)) = versioned.into_iter().next() {
                frames.push(action.single(DocMessage::new(collection, &id, version)));
            }
        }
        _ => frames.push(action.bulk(BulkMessage {
            c: collection.to_string(),
            b: Some(BulkField::Versions(versioned)),
            data: None,
            error: None,
        })),
    }

    match bare.len() {
        0 => {}
        1 => frames.push(action.single(DocMessage::new(collection, &bare[0], None))),
        _ => frames.push(action.bulk(BulkMessage {
            c: collection.to_string(),
            b: Some(BulkField::Ids(bare)),
            data: None,
            error: None,
        })),
    }
}
