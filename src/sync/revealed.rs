use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

/// Grow-only set of item ids whose score has been shown in some context.
/// There is deliberately no way to remove an id.
#[derive(Clone, Default)]
pub struct RevealedSet {
    ids: Arc<RwLock<HashSet<String>>>,
}

impl RevealedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions `ids` in and returns the ones that were not known yet.
    pub fn merge<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = match self.ids.write() {
            Ok(known) => known,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.into_iter()
            .map(Into::into)
            .filter(|id| known.insert(id.clone()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read(|known| known.contains(id))
    }

    pub fn len(&self) -> usize {
        self.read(HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted, so two contexts with the same set persist identical lists.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read(|known| known.iter().cloned().collect());
        ids.sort();
        ids
    }

    pub fn missing_from(&self, other: &[String]) -> bool {
        let other: HashSet<&str> = other.iter().map(String::as_str).collect();
        self.read(|known| known.iter().any(|id| !other.contains(id.as_str())))
    }

    fn read<T>(&self, f: impl FnOnce(&HashSet<String>) -> T) -> T {
        match self.ids.read() {
            Ok(known) => f(&known),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

/// Whether guessing mode is on. Readers get a shared handle; only the sync
/// component writes it.
#[derive(Clone, Default)]
pub struct FeatureToggle {
    enabled: Arc<AtomicBool>,
}

impl FeatureToggle {
    pub fn get(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns whether the value changed.
    pub(super) fn set(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_a_union() {
        let revealed = RevealedSet::new();
        assert_eq!(revealed.merge(["A", "B"]), vec!["A", "B"]);
        assert_eq!(revealed.merge(["B", "C"]), vec!["C"]);
        assert_eq!(revealed.snapshot(), vec!["A", "B", "C"]);
    }

    #[test]
    fn replaying_a_merge_never_shrinks_the_set() {
        let revealed = RevealedSet::new();
        revealed.merge(["A", "B", "C"]);
        let before = revealed.len();

        assert!(revealed.merge(["A"]).is_empty());
        assert!(revealed.merge(Vec::<String>::new()).is_empty());
        assert_eq!(revealed.len(), before);
    }

    #[test]
    fn missing_from_detects_lagging_peers() {
        let revealed = RevealedSet::new();
        revealed.merge(["A", "B"]);

        assert!(revealed.missing_from(&["A".to_string()]));
        assert!(!revealed.missing_from(&["A".to_string(), "B".to_string(), "Z".to_string()]));
    }

    #[test]
    fn toggle_reports_changes_only() {
        let toggle = FeatureToggle::default();
        assert!(toggle.set(true));
        assert!(!toggle.set(true));
        assert!(toggle.get());
    }
}
