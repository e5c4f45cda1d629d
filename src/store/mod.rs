//! Async key-value storage split into a small cross-device `Synced` scope and
//! a larger device-only `Local` scope, with change notifications.

mod memory;
mod sqlite;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Well-known keys shared by every context.
pub mod keys {
    /// Synced scope: interactive guessing toggle.
    pub const GUESS_MODE_ENABLED: &str = "guess_mode_enabled";
    /// Local scope: JSON array of revealed item ids.
    pub const REVEALED_ITEM_IDS: &str = "revealed_item_ids";
    /// Local scope: transient key used by the storage-event transport.
    pub const SYNC_MESSAGE: &str = "__sync_message__";

    const CACHE_PREFIX: &str = "score_cache:";

    pub fn cache_entry(identity_key: &str) -> String {
        format!("{CACHE_PREFIX}{identity_key}")
    }
}

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StoreScope {
    Synced,
    Local,
}

impl StoreScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreScope::Synced => "synced",
            StoreScope::Local => "local",
        }
    }
}

pub type StoreEntries = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct StoreChange {
    pub scope: StoreScope,
    pub changes: HashMap<String, ValueChange>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns only the keys that are present.
    async fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<StoreEntries>;

    async fn set(&self, scope: StoreScope, entries: StoreEntries) -> Result<()>;

    async fn remove(&self, scope: StoreScope, keys: &[&str]) -> Result<()>;

    /// Fires once per effective write. Rewriting an identical value or
    /// removing an absent key produces no notification.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    async fn get_one(&self, scope: StoreScope, key: &str) -> Result<Option<Value>> {
        let mut entries = self.get(scope, &[key]).await?;
        Ok(entries.remove(key))
    }

    async fn set_one(&self, scope: StoreScope, key: &str, value: Value) -> Result<()> {
        let mut entries = StoreEntries::new();
        entries.insert(key.to_string(), value);
        self.set(scope, entries).await
    }

    async fn get_synced(&self, keys: &[&str]) -> Result<StoreEntries> {
        self.get(StoreScope::Synced, keys).await
    }

    async fn set_synced(&self, entries: StoreEntries) -> Result<()> {
        self.set(StoreScope::Synced, entries).await
    }

    async fn get_local(&self, keys: &[&str]) -> Result<StoreEntries> {
        self.get(StoreScope::Local, keys).await
    }

    async fn set_local(&self, entries: StoreEntries) -> Result<()> {
        self.set(StoreScope::Local, entries).await
    }
}

/// Fan-out of store changes to every subscribed context.
#[derive(Clone)]
pub(crate) struct ChangeNotifier {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, scope: StoreScope, changes: HashMap<String, ValueChange>) {
        if changes.is_empty() {
            return;
        }
        // No receivers is fine: nobody is listening yet.
        let _ = self.sender.send(StoreChange { scope, changes });
    }
}
