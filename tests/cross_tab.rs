use std::{sync::Arc, time::Duration};

use iq_annotator_lib::{
    AnnotationState, Annotator, AnnotatorConfig, BroadcastHub, HeuristicEstimator, KeyValueStore,
    MemoryStore, SqliteStore,
};

const TEXT: &str = "Honestly the new transit schedule makes far more sense than the old one did, \
                    although the weekend gaps are still rough.";

fn tab(store: Arc<dyn KeyValueStore>, hub: Option<&BroadcastHub>) -> Annotator {
    let config = AnnotatorConfig::default();
    let estimator = Arc::new(HeuristicEstimator::new(config.clone()));
    Annotator::open(config, store, hub, estimator)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn toggle_and_reveal_reach_the_other_tab(
    store: Arc<dyn KeyValueStore>,
    hub: Option<&BroadcastHub>,
) {
    let tab_1 = tab(store.clone(), hub);
    let tab_2 = tab(store, hub);
    tab_1.start().await.unwrap();
    tab_2.start().await.unwrap();

    tab_1.set_feature_enabled(true).await;
    assert!(eventually(|| tab_2.is_feature_enabled_anywhere()).await);

    let in_tab_1 = tab_1
        .annotate("X", "@commuter", || TEXT.to_string())
        .await
        .unwrap();
    let in_tab_2 = tab_2
        .annotate("X", "@commuter", || TEXT.to_string())
        .await
        .unwrap();
    assert_eq!(in_tab_1.state, AnnotationState::PendingGuess);
    assert_eq!(in_tab_2.state, AnnotationState::PendingGuess);

    assert!(tab_1.submit_guess("X", 115.0).await);

    assert!(eventually(|| tab_2.sync().is_revealed("X")).await);
    assert!(
        eventually(|| tab_2
            .snapshot("X")
            .is_some_and(|annotation| annotation.state == AnnotationState::Revealed))
        .await
    );
    let in_tab_2 = tab_2.snapshot("X").unwrap();
    assert_eq!(in_tab_2.guess, None);
    assert!(!in_tab_2.interacted);

    tab_1.shutdown().await.unwrap();
    tab_2.shutdown().await.unwrap();
}

#[tokio::test]
async fn tabs_converge_over_native_channel() {
    let hub = BroadcastHub::new();
    toggle_and_reveal_reach_the_other_tab(Arc::new(MemoryStore::new()), Some(&hub)).await;
}

#[tokio::test]
async fn tabs_converge_over_storage_events() {
    toggle_and_reveal_reach_the_other_tab(Arc::new(MemoryStore::new()), None).await;
}

#[tokio::test]
async fn late_tab_inherits_reveals_and_cached_scores() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let hub = BroadcastHub::new();
    let tab_1 = tab(store.clone(), Some(&hub));
    tab_1.start().await.unwrap();
    tab_1.set_feature_enabled(true).await;
    tab_1.annotate("X", "@commuter", || TEXT.to_string()).await;
    assert!(tab_1.submit_guess("X", 98.0).await);

    let tab_3 = tab(store, Some(&hub));
    tab_3.start().await.unwrap();

    assert!(tab_3.is_feature_enabled_anywhere());
    assert!(tab_3.sync().is_revealed("X"));
    let annotation = tab_3
        .annotate("X", "@commuter", || TEXT.to_string())
        .await
        .unwrap();
    assert_eq!(annotation.state, AnnotationState::Revealed);
    assert!(tab_3.cache().get("@commuter").await.is_some());
}

#[tokio::test]
async fn reveals_survive_a_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("annotator.sqlite3");

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(path.clone()).unwrap());
        let tab_1 = tab(store, None);
        tab_1.start().await.unwrap();
        tab_1.set_feature_enabled(true).await;
        tab_1.annotate("X", "@commuter", || TEXT.to_string()).await;
        assert!(tab_1.submit_guess("X", 130.0).await);
        tab_1.shutdown().await.unwrap();
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(path).unwrap());
    let reopened = tab(store, None);
    reopened.start().await.unwrap();

    assert!(reopened.is_feature_enabled_anywhere());
    assert!(reopened.sync().is_revealed("X"));
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn opening_a_tab_after_a_failed_toggle_write_keeps_guessing_on() {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn KeyValueStore> = memory.clone();
    let hub = BroadcastHub::new();
    let tab_1 = tab(store.clone(), Some(&hub));
    tab_1.start().await.unwrap();

    memory.set_available(false);
    tab_1.set_feature_enabled(true).await;
    memory.set_available(true);

    let tab_2 = tab(store, Some(&hub));
    tab_2.start().await.unwrap();

    assert!(eventually(|| tab_2.is_feature_enabled_anywhere()).await);
    assert!(tab_1.is_feature_enabled_anywhere());

    tab_1.shutdown().await.unwrap();
    tab_2.shutdown().await.unwrap();
}
