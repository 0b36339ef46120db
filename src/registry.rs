//! Document and query registries.
//!
//! The document registry is a two-level map `collection → id → link`; an
//! inner map that becomes empty is removed from the outer map. Registries
//! survive reconnects so documents and queries can re-subscribe.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::doc::DocLink;
use crate::query::{QueryAction, QueryLink};

/// Two-level document registry.
pub struct DocRegistry {
    collections: HashMap<String, HashMap<String, Arc<dyn DocLink>>>,
}

impl DocRegistry {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
        }
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Arc<dyn DocLink>> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.collections
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id))
    }

    /// Register a document. Returns the link already registered under the
    /// same coordinates, if any (the caller decides what a conflict means).
    pub fn insert(
        &mut self,
        collection: &str,
        id: &str,
        link: Arc<dyn DocLink>,
    ) -> Option<Arc<dyn DocLink>> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), link)
    }

    /// Remove a document, cleaning up the collection entry when it empties.
    pub fn remove(&mut self, collection: &str, id: &str) -> Option<Arc<dyn DocLink>> {
        let docs = self.collections.get_mut(collection)?;
        let removed = docs.remove(id);
        if docs.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    /// Snapshot of every registered link, for notification sweeps.
    pub fn all(&self) -> Vec<Arc<dyn DocLink>> {
        self.collections
            .values()
            .flat_map(|docs| docs.values().cloned())
            .collect()
    }

    /// The first document reporting pending work, if any.
    pub fn first_pending(&self) -> Option<Arc<dyn DocLink>> {
        self.collections
            .values()
            .flat_map(|docs| docs.values())
            .find(|link| link.has_pending())
            .cloned()
    }

    pub fn any_pending(&self) -> bool {
        self.first_pending().is_some()
    }

    pub fn any_write_pending(&self) -> bool {
        self.collections
            .values()
            .flat_map(|docs| docs.values())
            .any(|link| link.has_write_pending())
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(|docs| docs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Number of collections currently holding documents.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }
}

impl Default for DocRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered query: the link plus the parameters needed to (re-)send its
/// frame.
#[derive(Clone)]
pub struct QueryEntry {
    pub id: u64,
    pub action: QueryAction,
    pub collection: String,
    pub q: JsonValue,
    /// Query-specific request fields, flattened into the frame.
    pub options: serde_json::Map<String, JsonValue>,
    pub link: Arc<dyn QueryLink>,
}

/// Integer-id query registry with monotonically assigned ids.
pub struct QueryRegistry {
    entries: HashMap<u64, QueryEntry>,
    next_id: u64,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate an id and register the query.
    pub fn create(
        &mut self,
        action: QueryAction,
        collection: &str,
        q: JsonValue,
        options: serde_json::Map<String, JsonValue>,
        link: Arc<dyn QueryLink>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            QueryEntry {
                id,
                action,
                collection: collection.to_string(),
                q,
                options,
                link,
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<&QueryEntry> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<QueryEntry> {
        self.entries.remove(&id)
    }

    /// Snapshot of every registered query, for notification sweeps.
    pub fn all(&self) -> Vec<QueryEntry> {
        self.entries.values().cloned().collect()
    }

    /// The first query reporting pending work, if any.
    pub fn first_pending(&self) -> Option<Arc<dyn QueryLink>> {
        self.entries
            .values()
            .find(|entry| entry.link.has_pending())
            .map(|entry| entry.link.clone())
    }

    pub fn any_pending(&self) -> bool {
        self.first_pending().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
