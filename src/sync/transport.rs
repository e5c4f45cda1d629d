//! Cross-context delivery of [`Envelope`]s.
//!
//! Two strategies behind one trait: a native named pub/sub channel
//! ([`BroadcastHub`]), and a fallback that piggybacks on the shared store's
//! change notifications by writing a transient key and deleting it again.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::store::{keys, KeyValueStore, StoreScope};

use super::messages::Envelope;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Channel,
    StorageEvent,
}

#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn publish(&self, envelope: &Envelope) -> Result<()>;

    /// Every envelope published after this call, own ones included.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// Process-wide registry of named channels; contexts opening the same name
/// hear each other.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> ChannelTransport {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        ChannelTransport { sender }
    }
}

pub struct ChannelTransport {
    sender: broadcast::Sender<Envelope>,
}

#[async_trait]
impl BroadcastTransport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        // Nobody else listening is not a failure.
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

/// Fallback transport: write-then-delete of one well-known key, so each
/// logical message produces exactly one "value appeared" change and nothing
/// lingers in the store.
pub struct StorageEventTransport {
    store: Arc<dyn KeyValueStore>,
    sender: broadcast::Sender<Envelope>,
    cancel: CancellationToken,
}

impl StorageEventTransport {
    /// Needs a running tokio runtime: spawns the store-change forwarder.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(forward_store_changes(
            store.subscribe(),
            sender.clone(),
            cancel.clone(),
        ));
        Self {
            store,
            sender,
            cancel,
        }
    }
}

impl Drop for StorageEventTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BroadcastTransport for StorageEventTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageEvent
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let value = serde_json::to_value(envelope).context("failed to encode sync envelope")?;
        self.store
            .set_one(StoreScope::Local, keys::SYNC_MESSAGE, value)
            .await
            .context("failed to write sync message")?;
        self.store
            .remove(StoreScope::Local, &[keys::SYNC_MESSAGE])
            .await
            .context("failed to clear sync message")
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

async fn forward_store_changes(
    mut changes: broadcast::Receiver<crate::store::StoreChange>,
    sender: broadcast::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };

        let change = match change {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                warn!("storage transport lagged, {skipped} store changes dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if change.scope != StoreScope::Local {
            continue;
        }
        // The delete half of write-then-delete carries no new value.
        let Some(value) = change
            .changes
            .get(keys::SYNC_MESSAGE)
            .and_then(|entry| entry.new_value.clone())
        else {
            continue;
        };

        match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => {
                let _ = sender.send(envelope);
            }
            Err(err) => warn!("ignoring undecodable sync message: {err}"),
        }
    }
}

/// Native channel when a hub is available, storage events otherwise.
pub fn select_transport(
    hub: Option<&BroadcastHub>,
    channel_name: &str,
    store: Arc<dyn KeyValueStore>,
) -> Arc<dyn BroadcastTransport> {
    match hub {
        Some(hub) => Arc::new(hub.open(channel_name)),
        None => Arc::new(StorageEventTransport::new(store)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, sync::messages::SyncMessage};
    use uuid::Uuid;

    fn envelope(item_id: &str) -> Envelope {
        Envelope::new(
            Uuid::new_v4(),
            SyncMessage::IqRevealed {
                item_id: item_id.into(),
            },
        )
    }

    #[tokio::test]
    async fn hub_connects_same_named_channels_only() {
        let hub = BroadcastHub::new();
        let tab_a = hub.open("sync");
        let tab_b = hub.open("sync");
        let other = hub.open("elsewhere");
        let mut inbox_b = tab_b.subscribe();
        let mut inbox_other = other.subscribe();

        let sent = envelope("post-1");
        tab_a.publish(&sent).await.unwrap();

        assert_eq!(inbox_b.recv().await.unwrap(), sent);
        assert!(inbox_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn storage_fallback_delivers_once_and_leaves_no_residue() {
        let store = Arc::new(MemoryStore::new());
        let tab_a = StorageEventTransport::new(store.clone());
        let tab_b = StorageEventTransport::new(store.clone());
        let mut inbox_b = tab_b.subscribe();

        let sent = envelope("post-1");
        tab_a.publish(&sent).await.unwrap();

        assert_eq!(inbox_b.recv().await.unwrap(), sent);
        assert_eq!(
            store.get_one(StoreScope::Local, keys::SYNC_MESSAGE).await.unwrap(),
            None
        );

        let again = envelope("post-1");
        tab_a.publish(&again).await.unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), again);
    }

    #[tokio::test]
    async fn storage_fallback_surfaces_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let transport = StorageEventTransport::new(store.clone());
        store.set_available(false);

        assert!(transport.publish(&envelope("post-1")).await.is_err());
    }

    #[tokio::test]
    async fn selection_prefers_native_channel() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let hub = BroadcastHub::new();

        assert_eq!(
            select_transport(Some(&hub), "sync", store.clone()).kind(),
            TransportKind::Channel
        );
        assert_eq!(
            select_transport(None, "sync", store).kind(),
            TransportKind::StorageEvent
        );
    }
}
