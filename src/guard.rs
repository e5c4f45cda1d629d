//! Advisory per-item computation lock plus the bounded wait used by callers
//! that find an item already locked.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;

#[derive(Clone, Default)]
pub struct ComputationGuard {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ComputationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// `true` means the caller now owns the computation for `item_id`.
    pub fn try_acquire(&self, item_id: &str) -> bool {
        self.held().insert(item_id.to_string())
    }

    /// No-op when `item_id` is not held.
    pub fn release(&self, item_id: &str) {
        self.held().remove(item_id);
    }

    pub fn is_held(&self, item_id: &str) -> bool {
        self.held().contains(item_id)
    }

    /// Like [`try_acquire`](Self::try_acquire) but the lock is released when
    /// the returned permit drops, on every exit path.
    pub fn permit(&self, item_id: &str) -> Option<GuardPermit> {
        self.try_acquire(item_id).then(|| GuardPermit {
            guard: self.clone(),
            item_id: item_id.to_string(),
        })
    }
}

#[must_use = "dropping the permit releases the lock"]
pub struct GuardPermit {
    guard: ComputationGuard,
    item_id: String,
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.guard.release(&self.item_id);
    }
}

/// Bounded wait-and-recheck state. Each `wait` consumes one attempt and
/// sleeps a jittered delay in `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts_remaining: u32,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, min: Duration, max: Duration) -> Self {
        Self {
            attempts_remaining: attempts,
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_remaining == 0 {
            return None;
        }
        self.attempts_remaining -= 1;

        if self.min == self.max {
            return Some(self.min);
        }
        let millis = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Some(Duration::from_millis(millis as u64))
    }

    /// Returns `false` without sleeping once attempts are exhausted.
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guard = ComputationGuard::new();
        assert!(guard.try_acquire("post-1"));
        assert!(!guard.try_acquire("post-1"));
        assert!(guard.try_acquire("post-2"));

        guard.release("post-1");
        assert!(guard.try_acquire("post-1"));
    }

    #[test]
    fn release_is_idempotent() {
        let guard = ComputationGuard::new();
        assert!(guard.try_acquire("post-1"));

        guard.release("post-1");
        guard.release("post-1");
        guard.release("never-held");

        assert!(!guard.is_held("post-1"));
    }

    #[test]
    fn permit_releases_on_drop_even_when_unwinding() {
        let guard = ComputationGuard::new();
        let cloned = guard.clone();

        let result = std::panic::catch_unwind(move || {
            let _permit = cloned.permit("post-1").unwrap();
            panic!("estimator blew up");
        });

        assert!(result.is_err());
        assert!(!guard.is_held("post-1"));
    }

    #[test]
    fn permit_is_refused_while_held() {
        let guard = ComputationGuard::new();
        let permit = guard.permit("post-1");
        assert!(permit.is_some());
        assert!(guard.permit("post-1").is_none());

        drop(permit);
        assert!(guard.permit("post-1").is_some());
    }

    #[test]
    fn backoff_delays_stay_in_range_and_run_out() {
        let mut backoff = Backoff::new(3, Duration::from_millis(50), Duration::from_millis(150));
        for _ in 0..3 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
        assert_eq!(backoff.attempts_remaining(), 0);
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_backoff_does_not_sleep() {
        let mut backoff = Backoff::new(1, Duration::from_millis(100), Duration::from_millis(100));
        let start = tokio::time::Instant::now();

        assert!(backoff.wait().await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert!(!backoff.wait().await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
