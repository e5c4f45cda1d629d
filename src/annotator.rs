//! Per-context service tying the cache, the computation guard, the
//! annotation board and cross-tab sync together.
//!
//! One [`Annotator`] stands for one execution context. Requests for the same
//! item are deduplicated by the [`ComputationGuard`]; when that fails (a
//! waiter gives up, or another path inserted an instance) the final check in
//! [`AnnotationBoard::settle`] and the [`SweepScheduler`] clean up after it.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use log::{debug, info, warn};
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

use crate::{
    annotation::{AnnotationBoard, AnnotationState, ItemAnnotation, Settlement, TransitionError},
    cache::{ResultCache, Score},
    config::AnnotatorConfig,
    estimator::Estimator,
    guard::{Backoff, ComputationGuard, GuardPermit},
    store::KeyValueStore,
    sweep::SweepScheduler,
    sync::{select_transport, BroadcastHub, BroadcastTransport, CrossTabSync, SyncUpdate},
    text::Signature,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the rendering layer hears about instead of return values.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationEvent {
    StateChanged(ItemAnnotation),
    Removed(ItemAnnotation),
}

/// One computation for one annotation instance.
struct Job<'a> {
    instance_id: Uuid,
    item_id: &'a str,
    identity_key: &'a str,
    text: &'a str,
    signature: Signature,
    /// The instance was `Revealed` before its text changed; a fresh score
    /// goes straight back to `Revealed`.
    previously_revealed: bool,
    /// Guessing mode as it was when the item became visible.
    guessing: bool,
}

#[derive(Clone)]
pub struct Annotator {
    config: Arc<AnnotatorConfig>,
    cache: ResultCache,
    guard: ComputationGuard,
    board: AnnotationBoard,
    sync: CrossTabSync,
    estimator: Arc<dyn Estimator>,
    events: broadcast::Sender<AnnotationEvent>,
    sweeper: Arc<tokio::sync::Mutex<SweepScheduler>>,
    reveal_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Annotator {
    pub fn new(
        config: AnnotatorConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn BroadcastTransport>,
        estimator: Arc<dyn Estimator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sweeper = SweepScheduler::new(config.sweep_debounce(), config.sweep_interval());

        Self {
            cache: ResultCache::new(store.clone(), config.length_tolerance),
            guard: ComputationGuard::new(),
            board: AnnotationBoard::new(),
            sync: CrossTabSync::new(Uuid::new_v4(), transport, store),
            estimator,
            events,
            sweeper: Arc::new(tokio::sync::Mutex::new(sweeper)),
            reveal_task: Arc::new(Mutex::new(None)),
            config: Arc::new(config),
        }
    }

    /// Uses the hub's named channel when given one, the store's change
    /// notifications otherwise.
    pub fn open(
        config: AnnotatorConfig,
        store: Arc<dyn KeyValueStore>,
        hub: Option<&BroadcastHub>,
        estimator: Arc<dyn Estimator>,
    ) -> Self {
        let transport = select_transport(hub, &config.channel_name, store.clone());
        Self::new(config, store, transport, estimator)
    }

    /// Joins the sync group and starts the background tasks: the sync
    /// listener, remote reveals for pending items, and the sweep.
    pub async fn start(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_running() {
            bail!("annotator already started");
        }

        let board = self.board.clone();
        let events = self.events.clone();
        let handle = self.sync.on_message(move |update| {
            if let SyncUpdate::Revealed(ids) = update {
                let ids: HashSet<String> = ids.into_iter().collect();
                for annotation in board.reveal_pending(&ids) {
                    let _ = events.send(AnnotationEvent::StateChanged(annotation));
                }
            }
        });
        if let Some(previous) = self.reveal_task_slot().replace(handle) {
            previous.abort();
        }

        self.sync.spawn_listener();
        self.sync.join().await;

        let events = self.events.clone();
        sweeper.start(self.board.clone(), move |report| {
            for annotation in &report.removed {
                let _ = events.send(AnnotationEvent::Removed(annotation.clone()));
            }
        })?;

        info!(
            "annotator {} started on {:?} transport",
            self.sync.context_id(),
            self.sync.transport_kind()
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sync.stop_listener().await;
        if let Some(handle) = self.reveal_task_slot().take() {
            handle.abort();
        }
        self.sweeper.lock().await.stop().await
    }

    pub fn context_id(&self) -> Uuid {
        self.sync.context_id()
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    pub fn board(&self) -> &AnnotationBoard {
        &self.board
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn sync(&self) -> &CrossTabSync {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnnotationEvent> {
        self.events.subscribe()
    }

    pub fn is_feature_enabled_anywhere(&self) -> bool {
        self.sync.is_enabled_anywhere()
    }

    pub async fn set_feature_enabled(&self, enabled: bool) {
        self.sync.set_enabled(enabled).await;
    }

    /// Canonical annotation for `item_id`, if any instance exists.
    pub fn snapshot(&self, item_id: &str) -> Option<ItemAnnotation> {
        self.board.canonical(item_id)
    }

    /// Fire-and-forget entry point. The outcome reaches the rendering layer
    /// through [`subscribe`](Self::subscribe); the handle may be dropped.
    pub fn request_annotation<F>(
        &self,
        item_id: impl Into<String>,
        identity_key: impl Into<String>,
        text_provider: F,
    ) -> JoinHandle<Option<ItemAnnotation>>
    where
        F: FnOnce() -> String + Send + 'static,
    {
        let annotator = self.clone();
        let item_id = item_id.into();
        let identity_key = identity_key.into();
        tokio::spawn(async move {
            annotator
                .annotate(&item_id, &identity_key, text_provider)
                .await
        })
    }

    /// Drives one item to a settled state. Returns the annotation that ends
    /// up representing the item, or `None` when estimation failed and the
    /// item went back to unanalyzed.
    pub async fn annotate<F>(
        &self,
        item_id: &str,
        identity_key: &str,
        text_provider: F,
    ) -> Option<ItemAnnotation>
    where
        F: FnOnce() -> String,
    {
        let text = text_provider();
        let signature = Signature::from_text(&text, &self.config);

        if let Some(existing) = self.board.settled_for(item_id) {
            return self
                .revalidate(existing, identity_key, &text, signature)
                .await;
        }

        let (min, max) = self.config.backoff_range();
        let mut backoff = Backoff::new(self.config.max_backoff_retries, min, max);
        let permit = loop {
            if let Some(existing) = self.board.settled_for(item_id) {
                return Some(existing);
            }
            if let Some(permit) = self.guard.permit(item_id) {
                break Some(permit);
            }
            if !backoff.wait().await {
                debug!("{item_id} still locked after backoff, computing anyway");
                break None;
            }
        };

        let guessing = self.sync.is_enabled_anywhere();
        let mut placeholder = ItemAnnotation::new(item_id, identity_key);
        if let Err(err) = placeholder.begin_computing() {
            warn!("{err}");
            return None;
        }
        let instance_id = self.board.insert(placeholder.clone());
        self.emit(AnnotationEvent::StateChanged(placeholder));

        let job = Job {
            instance_id,
            item_id,
            identity_key,
            text: &text,
            signature,
            previously_revealed: false,
            guessing,
        };
        self.compute(job, permit).await
    }

    /// Records the user's guess and reveals the item here and in every other
    /// context. `false` when no instance of the item is awaiting a guess.
    pub async fn submit_guess(&self, item_id: &str, value: f64) -> bool {
        let Some(pending) = self
            .board
            .instances_for(item_id)
            .into_iter()
            .find(|annotation| annotation.state == AnnotationState::PendingGuess)
        else {
            return false;
        };

        match self
            .board
            .update(pending.instance_id, |annotation| annotation.submit_guess(value))
        {
            Some(Ok(annotation)) => self.emit(AnnotationEvent::StateChanged(annotation)),
            Some(Err(err)) => {
                debug!("guess for {item_id} rejected: {err}");
                return false;
            }
            None => return false,
        }

        let ids = HashSet::from([item_id.to_string()]);
        for annotation in self.board.reveal_pending(&ids) {
            self.emit(AnnotationEvent::StateChanged(annotation));
        }
        self.sync.mark_revealed(item_id).await;
        self.notify_mutation().await;
        true
    }

    /// The item left the document; every instance of it goes with it. An
    /// in-flight computation for it finishes without publishing.
    pub fn remove_item(&self, item_id: &str) -> usize {
        let removed = self.board.remove_item(item_id);
        let count = removed.len();
        for annotation in removed {
            self.emit(AnnotationEvent::Removed(annotation));
        }
        count
    }

    /// A `Revealed` item whose cached score no longer matches its text is
    /// recomputed in place. Everything else is returned as is.
    async fn revalidate(
        &self,
        existing: ItemAnnotation,
        identity_key: &str,
        text: &str,
        signature: Signature,
    ) -> Option<ItemAnnotation> {
        if existing.state != AnnotationState::Revealed {
            return Some(existing);
        }
        let Some(entry) = self.cache.get(identity_key).await else {
            return Some(existing);
        };
        if !self.cache.is_stale(&entry, &signature) {
            return Some(existing);
        }
        let Some(permit) = self.guard.permit(&existing.item_id) else {
            return Some(existing);
        };

        match self
            .board
            .update(existing.instance_id, ItemAnnotation::begin_computing)
        {
            Some(Ok(annotation)) => {
                info!("content behind {identity_key} changed, recomputing {}", annotation.item_id);
                self.emit(AnnotationEvent::StateChanged(annotation));
            }
            _ => return self.board.settled_for(&existing.item_id),
        }

        let job = Job {
            instance_id: existing.instance_id,
            item_id: &existing.item_id,
            identity_key,
            text,
            signature,
            previously_revealed: true,
            guessing: self.sync.is_enabled_anywhere(),
        };
        self.compute(job, Some(permit)).await
    }

    /// Runs with the instance already `Computing`. The permit, when held, is
    /// released on every exit path by drop.
    async fn compute(&self, job: Job<'_>, _permit: Option<GuardPermit>) -> Option<ItemAnnotation> {
        let Job {
            instance_id,
            item_id,
            identity_key,
            text,
            signature,
            previously_revealed,
            guessing,
        } = job;

        let score = match self.cache.lookup_fresh(identity_key, &signature).await {
            Some(entry) => {
                debug!("cache hit for {identity_key}");
                entry.score
            }
            None => {
                let estimate = match self.estimator.estimate(text).await {
                    Ok(estimate) => estimate,
                    Err(err) => {
                        warn!("estimation failed for {item_id}: {err:#}");
                        self.abandon(instance_id);
                        return None;
                    }
                };

                if !estimate.is_valid {
                    debug!("{item_id} rejected by estimator");
                    return self
                        .publish(instance_id, item_id, ItemAnnotation::mark_invalid)
                        .await;
                }

                let (Some(value), Some(confidence)) = (estimate.value, estimate.confidence) else {
                    warn!("estimator returned a valid result without a score for {item_id}");
                    self.abandon(instance_id);
                    return None;
                };
                let score = Score { value, confidence };
                self.cache.put(identity_key, score, estimate.signature_inputs);
                score
            }
        };

        let reveal = previously_revealed || !guessing || self.sync.is_revealed(item_id);
        let published = self
            .publish(instance_id, item_id, |annotation| {
                if reveal {
                    annotation.reveal(score)
                } else {
                    annotation.await_guess(score)
                }
            })
            .await?;

        // A reveal from another context may have landed while we published.
        if published.state == AnnotationState::PendingGuess && self.sync.is_revealed(item_id) {
            let ids = HashSet::from([item_id.to_string()]);
            for annotation in self.board.reveal_pending(&ids) {
                self.emit(AnnotationEvent::StateChanged(annotation));
            }
            return self.board.get(instance_id);
        }
        Some(published)
    }

    async fn publish<F>(
        &self,
        instance_id: Uuid,
        item_id: &str,
        transition: F,
    ) -> Option<ItemAnnotation>
    where
        F: FnOnce(&mut ItemAnnotation) -> Result<(), TransitionError>,
    {
        match self.board.settle(instance_id, transition) {
            Settlement::Published(annotation) => {
                debug!("{item_id} -> {}", annotation.state.as_str());
                self.emit(AnnotationEvent::StateChanged(annotation.clone()));
                self.notify_mutation().await;
                Some(annotation)
            }
            Settlement::Superseded {
                existing,
                discarded,
            } => {
                info!("{item_id} settled elsewhere first, discarding duplicate result");
                self.emit(AnnotationEvent::Removed(discarded));
                Some(existing)
            }
            Settlement::Gone => {
                debug!("{item_id} left the document while computing");
                None
            }
            Settlement::Rejected(err) => {
                warn!("{err}");
                self.board.canonical(item_id)
            }
        }
    }

    /// Estimation failed: back to unanalyzed and the placeholder goes away,
    /// so a later request starts from scratch.
    fn abandon(&self, instance_id: Uuid) {
        if let Some(Ok(reverted)) = self.board.update(instance_id, ItemAnnotation::revert) {
            self.emit(AnnotationEvent::StateChanged(reverted));
        }
        if let Some(removed) = self.board.remove_instance(instance_id) {
            self.emit(AnnotationEvent::Removed(removed));
        }
    }

    async fn notify_mutation(&self) {
        self.sweeper.lock().await.notify_mutation();
    }

    fn emit(&self, event: AnnotationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn reveal_task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.reveal_task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
