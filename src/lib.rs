pub mod annotation;
pub mod annotator;
pub mod cache;
pub mod config;
pub mod estimator;
pub mod guard;
pub mod store;
pub mod sweep;
pub mod sync;
pub mod text;
pub mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};

pub use annotation::{AnnotationBoard, AnnotationState, ItemAnnotation};
pub use annotator::{AnnotationEvent, Annotator};
pub use cache::{CacheEntry, ResultCache, Score};
pub use config::AnnotatorConfig;
pub use estimator::{Estimate, Estimator, HeuristicEstimator};
pub use guard::ComputationGuard;
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StoreScope};
pub use sweep::{sweep, SweepReport, SweepScheduler};
pub use sync::{BroadcastHub, CrossTabSync, RevealedSet, SyncMessage};
pub use text::Signature;

/// Reads `author<TAB>text` (or bare text) lines from stdin and prints one
/// JSON annotation per line.
pub fn run() {
    utils::logging::init_logging(LevelFilter::Info);

    info!("iq-annotator starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(annotate_stdin()) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("IQ_ANNOTATOR_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".iq-annotator"))
}

async fn annotate_stdin() -> Result<()> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let config = AnnotatorConfig::load(&data_dir.join("config.json"))?;
    let store: Arc<dyn KeyValueStore> =
        Arc::new(SqliteStore::open(data_dir.join("annotator.sqlite3"))?);
    let estimator = Arc::new(HeuristicEstimator::new(config.clone()));
    let hub = BroadcastHub::new();

    let annotator = Annotator::open(config, store, Some(&hub), estimator);
    annotator.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let (author, text) = match line.split_once('\t') {
            Some((author, text)) => (author.to_string(), text.to_string()),
            None => ("anonymous".to_string(), line),
        };

        let item_id = format!("line-{line_no}");
        match annotator.annotate(&item_id, &author, move || text).await {
            Some(annotation) => println!("{}", serde_json::to_string(&annotation)?),
            None => info!("{item_id}: no annotation"),
        }
    }

    annotator.shutdown().await
}
