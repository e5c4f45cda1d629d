//! Keeps the revealed set and the guessing toggle consistent across every
//! open context.
//!
//! Inbound state is only ever unioned into the local [`RevealedSet`]. Once
//! any context reveals an item, every context (including ones opened later,
//! via the persisted list) treats it as revealed. All handlers are
//! idempotent, so duplicated, reordered or replayed messages are harmless.

pub mod messages;
pub mod revealed;
pub mod transport;

use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::{keys, KeyValueStore, StoreChange, StoreScope};

pub use messages::{Envelope, SyncMessage};
pub use revealed::{FeatureToggle, RevealedSet};
pub use transport::{
    select_transport, BroadcastHub, BroadcastTransport, ChannelTransport, StorageEventTransport,
    TransportKind,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Local consequences of sync traffic, for whoever renders annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    ModeChanged(bool),
    /// Ids that just became revealed in this context.
    Revealed(Vec<String>),
}

struct SyncInner {
    context_id: Uuid,
    transport: Arc<dyn BroadcastTransport>,
    store: Arc<dyn KeyValueStore>,
    revealed: RevealedSet,
    toggle: FeatureToggle,
    /// Toggle value this context wrote but could not persist yet.
    unpersisted_toggle: Mutex<Option<bool>>,
    updates: broadcast::Sender<SyncUpdate>,
    listener: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        let listener = match self.listener.get_mut() {
            Ok(listener) => listener.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((_, cancel)) = listener {
            cancel.cancel();
        }
    }
}

#[derive(Clone)]
pub struct CrossTabSync {
    inner: Arc<SyncInner>,
}

impl CrossTabSync {
    pub fn new(
        context_id: Uuid,
        transport: Arc<dyn BroadcastTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                context_id,
                transport,
                store,
                revealed: RevealedSet::new(),
                toggle: FeatureToggle::default(),
                unpersisted_toggle: Mutex::new(None),
                updates,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.inner.context_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn is_enabled_anywhere(&self) -> bool {
        self.inner.toggle.get()
    }

    pub fn toggle(&self) -> FeatureToggle {
        self.inner.toggle.clone()
    }

    pub fn is_revealed(&self, item_id: &str) -> bool {
        self.inner.revealed.contains(item_id)
    }

    pub fn revealed_ids(&self) -> Vec<String> {
        self.inner.revealed.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.inner.updates.subscribe()
    }

    /// Runs `handler` for every future [`SyncUpdate`] until the sync
    /// component is dropped. After a lag the handler gets the full current
    /// state instead of the missed updates.
    pub fn on_message<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(SyncUpdate) + Send + 'static,
    {
        let mut updates = self.subscribe();
        let revealed = self.inner.revealed.clone();
        let toggle = self.inner.toggle.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => handler(update),
                    Err(RecvError::Lagged(skipped)) => {
                        log_warn!("sync handler lagged, {skipped} updates dropped, resyncing");
                        handler(SyncUpdate::ModeChanged(toggle.get()));
                        handler(SyncUpdate::Revealed(revealed.snapshot()));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Loads persisted toggle and revealed ids, then announces this context
    /// with a `state_sync`. Store or transport trouble is logged, not raised.
    pub async fn join(&self) {
        match self
            .inner
            .store
            .get_one(StoreScope::Synced, keys::GUESS_MODE_ENABLED)
            .await
        {
            Ok(Some(Value::Bool(enabled))) => self.apply_toggle(enabled),
            Ok(_) => {}
            Err(err) => log_warn!("could not load guessing toggle: {err:#}"),
        }

        match self.load_persisted_revealed().await {
            Ok(ids) => {
                self.union_in(ids);
            }
            Err(err) => log_warn!("could not load revealed ids: {err:#}"),
        }

        if let Err(err) = self.broadcast(self.state_snapshot(None)).await {
            log_warn!("state_sync on join failed: {err:#}");
        }
    }

    pub async fn broadcast(&self, message: SyncMessage) -> Result<()> {
        log_debug!(
            "context {} broadcasting {}",
            self.inner.context_id,
            message.kind()
        );
        let envelope = Envelope::new(self.inner.context_id, message);
        self.inner.transport.publish(&envelope).await
    }

    /// Unions `ids` into the revealed set and persists the result. Returns
    /// the ids that were new to this context.
    pub async fn merge_revealed<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_toggle_persist().await;
        let added = self.union_in(ids);
        if !added.is_empty() {
            if let Err(err) = self.persist_revealed().await {
                log_warn!("could not persist revealed ids: {err:#}");
            }
        }
        added
    }

    /// Records a local reveal and tells every other context.
    pub async fn mark_revealed(&self, item_id: &str) {
        self.merge_revealed([item_id]).await;
        let message = SyncMessage::IqRevealed {
            item_id: item_id.to_string(),
        };
        if let Err(err) = self.broadcast(message).await {
            log_warn!("iq_revealed for {item_id} not broadcast: {err:#}");
        }
    }

    /// Local toggle write: persist, then broadcast both the flip and a full
    /// snapshot so late joiners and lagging peers converge. A failed persist
    /// is retried on the next inbound message or merge.
    pub async fn set_enabled(&self, enabled: bool) {
        self.apply_toggle(enabled);

        let persisted = self
            .inner
            .store
            .set_one(StoreScope::Synced, keys::GUESS_MODE_ENABLED, json!(enabled))
            .await;
        if let Err(err) = persisted {
            log_warn!("could not persist guessing toggle, will retry: {err:#}");
            *self.unpersisted_toggle() = Some(enabled);
        } else {
            self.unpersisted_toggle().take();
        }

        let snapshot = self.state_snapshot(Some(enabled));
        for message in [SyncMessage::ModeChanged { enabled }, snapshot] {
            if let Err(err) = self.broadcast(message).await {
                log_warn!("toggle broadcast failed: {err:#}");
            }
        }
    }

    /// Applies one inbound envelope. Own envelopes are ignored.
    pub async fn apply(&self, envelope: Envelope) {
        if envelope.origin == self.inner.context_id {
            return;
        }

        match envelope.message {
            SyncMessage::StateSync { enabled, revealed } => {
                if let Some(enabled) = enabled {
                    self.accept_remote_toggle(enabled);
                }
                let peer_is_behind = self.inner.revealed.missing_from(&revealed);
                self.merge_revealed(revealed).await;
                if peer_is_behind {
                    if let Err(err) = self.broadcast(self.state_snapshot(None)).await {
                        log_warn!("state_sync reply failed: {err:#}");
                    }
                }
            }
            SyncMessage::ModeChanged { enabled } => self.accept_remote_toggle(enabled),
            SyncMessage::IqRevealed { item_id } => {
                self.merge_revealed([item_id]).await;
            }
        }
    }

    /// Starts the background task that applies transport traffic and store
    /// changes. Calling it again replaces the previous listener.
    pub fn spawn_listener(&self) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            self.inner.transport.subscribe(),
            self.inner.store.subscribe(),
            cancel.clone(),
        ));

        let mut listener = match self.inner.listener.lock() {
            Ok(listener) => listener,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, previous)) = listener.replace((handle, cancel)) {
            previous.cancel();
        }
    }

    pub async fn stop_listener(&self) {
        let listener = match self.inner.listener.lock() {
            Ok(mut listener) => listener.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((handle, cancel)) = listener {
            cancel.cancel();
            if let Err(err) = handle.await {
                log_warn!("sync listener task failed to join: {err}");
            }
        }
    }

    /// `toggle` is `Some` only when this context is the writer.
    fn state_snapshot(&self, toggle: Option<bool>) -> SyncMessage {
        SyncMessage::StateSync {
            enabled: toggle,
            revealed: self.inner.revealed.snapshot(),
        }
    }

    fn unpersisted_toggle(&self) -> std::sync::MutexGuard<'_, Option<bool>> {
        match self.inner.unpersisted_toggle.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Another context wrote the toggle; its value supersedes any local
    /// write still waiting to be persisted.
    fn accept_remote_toggle(&self, enabled: bool) {
        self.unpersisted_toggle().take();
        self.apply_toggle(enabled);
    }

    /// Persists a toggle write that failed earlier. On success the other
    /// contexts are told again, since they may have joined in between.
    async fn retry_toggle_persist(&self) {
        let Some(enabled) = self.unpersisted_toggle().take() else {
            return;
        };

        match self
            .inner
            .store
            .set_one(StoreScope::Synced, keys::GUESS_MODE_ENABLED, json!(enabled))
            .await
        {
            Ok(()) => {
                log_debug!("guessing toggle persisted as {enabled}");
                if let Err(err) = self.broadcast(SyncMessage::ModeChanged { enabled }).await {
                    log_warn!("toggle rebroadcast failed: {err:#}");
                }
            }
            Err(err) => {
                log_warn!("could not persist guessing toggle, will retry: {err:#}");
                self.unpersisted_toggle().get_or_insert(enabled);
            }
        }
    }

    fn apply_toggle(&self, enabled: bool) {
        if self.inner.toggle.set(enabled) {
            log_info!(
                "context {} guessing mode -> {enabled}",
                self.inner.context_id
            );
            let _ = self.inner.updates.send(SyncUpdate::ModeChanged(enabled));
        }
    }

    fn union_in<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = self.inner.revealed.merge(ids);
        if !added.is_empty() {
            let _ = self.inner.updates.send(SyncUpdate::Revealed(added.clone()));
        }
        added
    }

    async fn load_persisted_revealed(&self) -> Result<Vec<String>> {
        let raw = self
            .inner
            .store
            .get_one(StoreScope::Local, keys::REVEALED_ITEM_IDS)
            .await?;
        match raw {
            Some(value) => serde_json::from_value(value).context("corrupt revealed id list"),
            None => Ok(Vec::new()),
        }
    }

    /// Read-union-write so ids persisted by another context are never lost.
    async fn persist_revealed(&self) -> Result<()> {
        let stored = self.load_persisted_revealed().await?;
        self.union_in(stored);
        self.inner
            .store
            .set_one(
                StoreScope::Local,
                keys::REVEALED_ITEM_IDS,
                json!(self.inner.revealed.snapshot()),
            )
            .await
    }
}

/// Holds only a weak handle so a forgotten listener cannot keep the
/// component alive; dropping the last `CrossTabSync` cancels it.
async fn listen(
    inner: Weak<SyncInner>,
    mut envelopes: broadcast::Receiver<Envelope>,
    mut store_changes: broadcast::Receiver<StoreChange>,
    cancel: CancellationToken,
) {
    let upgrade = || inner.upgrade().map(|inner| CrossTabSync { inner });
    let Some(context_id) = upgrade().map(|sync| sync.context_id()) else {
        return;
    };
    log_info!("sync listener started for context {context_id}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = envelopes.recv() => {
                let Some(sync) = upgrade() else { break };
                match envelope {
                    Ok(envelope) => sync.apply(envelope).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log_warn!("sync listener lagged, {skipped} messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            change = store_changes.recv() => {
                let Some(sync) = upgrade() else { break };
                match change {
                    Ok(change) => apply_store_change(&sync, change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log_warn!("sync listener lagged, {skipped} store changes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    log_info!("sync listener stopped for context {context_id}");
}

/// Cross-device toggle writes and other contexts' persisted reveals arrive
/// through the store even when no message does.
async fn apply_store_change(sync: &CrossTabSync, change: StoreChange) {
    match change.scope {
        StoreScope::Synced => {
            if let Some(Value::Bool(enabled)) = change
                .changes
                .get(keys::GUESS_MODE_ENABLED)
                .and_then(|entry| entry.new_value.clone())
            {
                sync.accept_remote_toggle(enabled);
            }
        }
        StoreScope::Local => {
            let Some(value) = change
                .changes
                .get(keys::REVEALED_ITEM_IDS)
                .and_then(|entry| entry.new_value.clone())
            else {
                return;
            };
            match serde_json::from_value::<Vec<String>>(value) {
                Ok(ids) => {
                    sync.union_in(ids);
                }
                Err(err) => log_warn!("ignoring corrupt revealed id list: {err}"),
            }
        }
    }
}
