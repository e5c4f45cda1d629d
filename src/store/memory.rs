use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ChangeNotifier, KeyValueStore, StoreChange, StoreEntries, StoreScope, ValueChange};

/// In-process store shared by every context in the same process. Clones share
/// state. `set_available(false)` simulates a store outage.
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<(StoreScope, String), Value>>>,
    available: Arc<AtomicBool>,
    notifier: ChangeNotifier,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!("memory store is unavailable");
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(StoreScope, String), Value>>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<StoreEntries> {
        self.ensure_available()?;
        let data = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                data.get(&(scope, key.to_string()))
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, scope: StoreScope, entries: StoreEntries) -> Result<()> {
        self.ensure_available()?;
        let changes = {
            let mut data = self.lock()?;
            let mut changes = HashMap::new();
            for (key, value) in entries {
                let old_value = data.insert((scope, key.clone()), value.clone());
                if old_value.as_ref() != Some(&value) {
                    changes.insert(
                        key,
                        ValueChange {
                            old_value,
                            new_value: Some(value),
                        },
                    );
                }
            }
            changes
        };
        self.notifier.emit(scope, changes);
        Ok(())
    }

    async fn remove(&self, scope: StoreScope, keys: &[&str]) -> Result<()> {
        self.ensure_available()?;
        let changes = {
            let mut data = self.lock()?;
            keys.iter()
                .filter_map(|key| {
                    data.remove(&(scope, key.to_string())).map(|old_value| {
                        (
                            key.to_string(),
                            ValueChange {
                                old_value: Some(old_value),
                                new_value: None,
                            },
                        )
                    })
                })
                .collect::<HashMap<_, _>>()
        };
        self.notifier.emit(scope, changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scopes_are_disjoint() {
        let store = MemoryStore::new();
        store
            .set_one(StoreScope::Synced, "flag", json!(true))
            .await
            .unwrap();

        assert_eq!(
            store.get_one(StoreScope::Synced, "flag").await.unwrap(),
            Some(json!(true))
        );
        assert_eq!(store.get_one(StoreScope::Local, "flag").await.unwrap(), None);
    }

    #[tokio::test]
    async fn notifies_only_effective_changes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        store.set_one(StoreScope::Local, "k", json!(1)).await.unwrap();
        store.set_one(StoreScope::Local, "k", json!(1)).await.unwrap();
        store.remove(StoreScope::Local, &["k"]).await.unwrap();
        store.remove(StoreScope::Local, &["k"]).await.unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.changes["k"].new_value, Some(json!(1)));
        let second = changes.recv().await.unwrap();
        assert_eq!(second.changes["k"].old_value, Some(json!(1)));
        assert_eq!(second.changes["k"].new_value, None);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(store.get_one(StoreScope::Local, "k").await.is_err());
        assert!(store.set_one(StoreScope::Local, "k", json!(1)).await.is_err());

        store.set_available(true);
        assert!(store.set_one(StoreScope::Local, "k", json!(1)).await.is_ok());
    }
}
