use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::annotation::AnnotationBoard;

use super::{sweep, SweepReport};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

type ReportHandler = Arc<dyn Fn(&SweepReport) + Send + Sync>;

/// Runs [`sweep`] shortly after each burst of board mutations and on a
/// fixed interval as a safety net.
pub struct SweepScheduler {
    debounce: Duration,
    interval: Duration,
    mutations: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl SweepScheduler {
    pub fn new(debounce: Duration, interval: Duration) -> Self {
        Self {
            debounce,
            interval,
            mutations: Arc::new(Notify::new()),
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start<F>(&mut self, board: AnnotationBoard, on_report: F) -> Result<()>
    where
        F: Fn(&SweepReport) + Send + Sync + 'static,
    {
        if self.handle.is_some() {
            bail!("sweep scheduler already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            board,
            self.debounce,
            self.interval,
            self.mutations.clone(),
            Arc::new(on_report),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Each call pushes the debounced sweep back by one debounce window.
    pub fn notify_mutation(&self) {
        self.mutations.notify_one();
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        match self.handle.take() {
            Some(handle) => handle.await.context("sweep loop task failed to join"),
            None => Ok(()),
        }
    }
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

async fn sweep_loop(
    board: AnnotationBoard,
    debounce: Duration,
    interval: Duration,
    mutations: Arc<Notify>,
    on_report: ReportHandler,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Option<Instant> = None;

    log_info!("sweep loop started");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => run_sweep(&board, &on_report, "periodic"),
            _ = mutations.notified() => pending = Some(Instant::now() + debounce),
            _ = tokio::time::sleep_until(pending.unwrap_or_else(Instant::now)), if pending.is_some() => {
                pending = None;
                run_sweep(&board, &on_report, "debounced");
            }
        }
    }
    log_info!("sweep loop stopped");
}

fn run_sweep(board: &AnnotationBoard, on_report: &ReportHandler, trigger: &str) {
    let report = sweep(board);
    if report.is_empty() {
        return;
    }
    log_debug!(
        "{trigger} sweep removed {} duplicate(s) across {} item(s)",
        report.removed.len(),
        report.items_reconciled
    );
    on_report(&report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotationState, ItemAnnotation};
    use std::sync::Mutex;

    fn revealed(item_id: &str) -> ItemAnnotation {
        let mut annotation = ItemAnnotation::new(item_id, "@author");
        annotation.state = AnnotationState::Revealed;
        annotation
    }

    fn recorder() -> (Arc<Mutex<Vec<SweepReport>>>, impl Fn(&SweepReport) + Send + Sync) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        (reports, move |report: &SweepReport| {
            sink.lock().unwrap().push(report.clone())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_burst_triggers_one_debounced_sweep() {
        let board = AnnotationBoard::new();
        let (reports, on_report) = recorder();
        let mut scheduler =
            SweepScheduler::new(Duration::from_millis(150), Duration::from_secs(3600));
        scheduler.start(board.clone(), on_report).unwrap();
        tokio::task::yield_now().await;

        board.insert(revealed("post-1"));
        scheduler.notify_mutation();
        tokio::time::sleep(Duration::from_millis(100)).await;
        board.insert(revealed("post-1"));
        scheduler.notify_mutation();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(board.len(), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(board.len(), 1);
        assert_eq!(reports.lock().unwrap().len(), 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_catches_unannounced_duplicates() {
        let board = AnnotationBoard::new();
        let (reports, on_report) = recorder();
        let mut scheduler = SweepScheduler::new(Duration::from_millis(150), Duration::from_secs(2));
        scheduler.start(board.clone(), on_report).unwrap();
        tokio::task::yield_now().await;

        board.insert(revealed("post-1"));
        board.insert(revealed("post-1"));
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(board.len(), 1);
        assert_eq!(reports.lock().unwrap()[0].items_reconciled, 1);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_reentrant() {
        let mut scheduler = SweepScheduler::new(Duration::from_millis(10), Duration::from_secs(1));
        scheduler.start(AnnotationBoard::new(), |_| {}).unwrap();

        assert!(scheduler.start(AnnotationBoard::new(), |_| {}).is_err());
        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }
}
