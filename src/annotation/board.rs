use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use uuid::Uuid;

use super::{AnnotationState, ItemAnnotation, TransitionError};

/// Result of publishing a computed annotation through [`AnnotationBoard::settle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Published(ItemAnnotation),
    /// Another instance settled first; ours was removed from the board.
    Superseded {
        existing: ItemAnnotation,
        discarded: ItemAnnotation,
    },
    /// The instance left the board while its result was being computed.
    Gone,
    Rejected(TransitionError),
}

/// Every annotation instance rendered in one context, in document order.
#[derive(Clone, Default)]
pub struct AnnotationBoard {
    instances: Arc<Mutex<Vec<ItemAnnotation>>>,
}

impl AnnotationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ItemAnnotation>> {
        match self.instances.lock() {
            Ok(instances) => instances,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends at the end of document order.
    pub fn insert(&self, annotation: ItemAnnotation) -> Uuid {
        let instance_id = annotation.instance_id;
        self.lock().push(annotation);
        instance_id
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ItemAnnotation> {
        self.lock().clone()
    }

    pub fn instances_for(&self, item_id: &str) -> Vec<ItemAnnotation> {
        self.lock()
            .iter()
            .filter(|annotation| annotation.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, instance_id: Uuid) -> Option<ItemAnnotation> {
        self.lock()
            .iter()
            .find(|annotation| annotation.instance_id == instance_id)
            .cloned()
    }

    /// The settled instance that survives a sweep: interacted first, then
    /// document order.
    pub fn settled_for(&self, item_id: &str) -> Option<ItemAnnotation> {
        let instances = self.lock();
        let mut settled = instances
            .iter()
            .filter(|annotation| annotation.item_id == item_id && annotation.state.is_settled());
        let first = settled.clone().next()?;
        Some(
            settled
                .find(|annotation| annotation.interacted)
                .unwrap_or(first)
                .clone(),
        )
    }

    /// Settled instance if any, otherwise the first in-flight one.
    pub fn canonical(&self, item_id: &str) -> Option<ItemAnnotation> {
        self.settled_for(item_id).or_else(|| {
            self.lock()
                .iter()
                .find(|annotation| annotation.item_id == item_id)
                .cloned()
        })
    }

    /// Applies `transition` to one instance. `None` means the instance is
    /// gone (item left the document or was swept).
    pub fn update<F>(
        &self,
        instance_id: Uuid,
        transition: F,
    ) -> Option<Result<ItemAnnotation, TransitionError>>
    where
        F: FnOnce(&mut ItemAnnotation) -> Result<(), TransitionError>,
    {
        let mut instances = self.lock();
        let annotation = instances
            .iter_mut()
            .find(|annotation| annotation.instance_id == instance_id)?;
        Some(transition(annotation).map(|()| annotation.clone()))
    }

    /// Final check and publish under one lock: if any other instance of the
    /// same item has settled, ours is discarded in its favour.
    pub fn settle<F>(&self, instance_id: Uuid, transition: F) -> Settlement
    where
        F: FnOnce(&mut ItemAnnotation) -> Result<(), TransitionError>,
    {
        let mut instances = self.lock();
        let Some(index) = instances
            .iter()
            .position(|annotation| annotation.instance_id == instance_id)
        else {
            return Settlement::Gone;
        };

        let item_id = instances[index].item_id.clone();
        let mut others = instances.iter().filter(|annotation| {
            annotation.item_id == item_id
                && annotation.instance_id != instance_id
                && annotation.state.is_settled()
        });
        let first = others.clone().next().cloned();
        if let Some(first) = first {
            let existing = others
                .find(|annotation| annotation.interacted)
                .cloned()
                .unwrap_or(first);
            let discarded = instances.remove(index);
            return Settlement::Superseded {
                existing,
                discarded,
            };
        }

        let annotation = &mut instances[index];
        match transition(annotation) {
            Ok(()) => Settlement::Published(annotation.clone()),
            Err(err) => Settlement::Rejected(err),
        }
    }

    pub fn remove_instance(&self, instance_id: Uuid) -> Option<ItemAnnotation> {
        let mut instances = self.lock();
        let index = instances
            .iter()
            .position(|annotation| annotation.instance_id == instance_id)?;
        Some(instances.remove(index))
    }

    pub fn remove_item(&self, item_id: &str) -> Vec<ItemAnnotation> {
        let mut instances = self.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = instances
            .drain(..)
            .partition(|annotation| annotation.item_id == item_id);
        *instances = kept;
        removed
    }

    /// Moves every `PendingGuess` instance of the given items to `Revealed`.
    pub fn reveal_pending(&self, item_ids: &HashSet<String>) -> Vec<ItemAnnotation> {
        let mut instances = self.lock();
        instances
            .iter_mut()
            .filter(|annotation| {
                annotation.state == AnnotationState::PendingGuess
                    && item_ids.contains(&annotation.item_id)
            })
            .filter_map(|annotation| {
                annotation.reveal_from_remote().ok()?;
                Some(annotation.clone())
            })
            .collect()
    }

    pub(crate) fn with_instances<T>(&self, f: impl FnOnce(&mut Vec<ItemAnnotation>) -> T) -> T {
        f(&mut self.lock())
    }
}
