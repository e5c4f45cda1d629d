//! Collapses duplicate annotation instances left behind by racing
//! insertion paths.

mod scheduler;

use std::collections::HashMap;

use crate::annotation::{AnnotationBoard, ItemAnnotation};

pub use scheduler::SweepScheduler;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub items_reconciled: usize,
    pub removed: Vec<ItemAnnotation>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Keeps one settled instance per item: the first one the user interacted
/// with, otherwise the first in document order. In-flight instances are left
/// for their own computation to resolve.
pub fn sweep(board: &AnnotationBoard) -> SweepReport {
    board.with_instances(|instances| {
        let (keep, items_reconciled) = {
            // item_id -> (index of keeper, settled instance count)
            let mut keepers: HashMap<&str, (usize, usize)> = HashMap::new();
            for (index, annotation) in instances.iter().enumerate() {
                if !annotation.state.is_settled() {
                    continue;
                }
                let (keeper, count) = keepers
                    .entry(annotation.item_id.as_str())
                    .or_insert((index, 0));
                *count += 1;
                if annotation.interacted && !instances[*keeper].interacted {
                    *keeper = index;
                }
            }

            let keep: Vec<bool> = instances
                .iter()
                .enumerate()
                .map(|(index, annotation)| {
                    !annotation.state.is_settled()
                        || keepers
                            .get(annotation.item_id.as_str())
                            .is_some_and(|(keeper, _)| *keeper == index)
                })
                .collect();
            let items_reconciled = keepers.values().filter(|(_, count)| *count > 1).count();
            (keep, items_reconciled)
        };

        let mut removed = Vec::new();
        let mut flags = keep.into_iter();
        instances.retain(|annotation| {
            let keep = flags.next().unwrap_or(true);
            if !keep {
                removed.push(annotation.clone());
            }
            keep
        });

        SweepReport {
            items_reconciled,
            removed,
        }
    })
}
