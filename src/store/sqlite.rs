use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use super::{ChangeNotifier, KeyValueStore, StoreChange, StoreEntries, StoreScope, ValueChange};

/// Schema steps, applied in order; `user_version` records how many ran.
const MIGRATIONS: &[&str] = &[include_str!("schemas/schema_v1.sql")];

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Durable store backed by a single SQLite file. All statements run on one
/// dedicated thread; async callers get results back over a oneshot.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
    path: Arc<PathBuf>,
    notifier: ChangeNotifier,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("iq-annotator-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite store")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                if ready_tx.send(migrate(&mut conn)).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Store opened at {}", path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            path: Arc::new(path),
            notifier: ChangeNotifier::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;
    let applied = usize::try_from(version).context("user_version is negative")?;

    if applied > MIGRATIONS.len() {
        bail!(
            "store schema version {applied} is newer than supported {}",
            MIGRATIONS.len()
        );
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(applied) {
        tx.execute_batch(sql)
            .with_context(|| format!("migration to version {} failed", index + 1))?;
    }
    tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")
}

fn read_value(tx: &Transaction<'_>, scope: StoreScope, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT value FROM kv WHERE scope = ?1 AND key = ?2",
            params![scope.as_str(), key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read {}:{key}", scope.as_str()))?;

    raw.map(|text| {
        serde_json::from_str(&text).with_context(|| format!("corrupt value at {}:{key}", scope.as_str()))
    })
    .transpose()
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<StoreEntries> {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut entries = StoreEntries::new();
            for key in keys {
                if let Some(value) = read_value(&tx, scope, &key)? {
                    entries.insert(key, value);
                }
            }
            tx.commit()?;
            Ok(entries)
        })
        .await
    }

    async fn set(&self, scope: StoreScope, entries: StoreEntries) -> Result<()> {
        let changes = self
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().to_rfc3339();
                let mut changes = HashMap::new();
                for (key, value) in entries {
                    let old_value = read_value(&tx, scope, &key)?;
                    if old_value.as_ref() == Some(&value) {
                        continue;
                    }
                    tx.execute(
                        "INSERT INTO kv (scope, key, value, updated_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(scope, key) DO UPDATE SET
                             value = excluded.value,
                             updated_at = excluded.updated_at",
                        params![scope.as_str(), key, serde_json::to_string(&value)?, now],
                    )
                    .with_context(|| format!("failed to write {}:{key}", scope.as_str()))?;
                    changes.insert(
                        key,
                        ValueChange {
                            old_value,
                            new_value: Some(value),
                        },
                    );
                }
                tx.commit()?;
                Ok(changes)
            })
            .await?;

        self.notifier.emit(scope, changes);
        Ok(())
    }

    async fn remove(&self, scope: StoreScope, keys: &[&str]) -> Result<()> {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        let changes = self
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let mut changes = HashMap::new();
                for key in keys {
                    let Some(old_value) = read_value(&tx, scope, &key)? else {
                        continue;
                    };
                    tx.execute(
                        "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
                        params![scope.as_str(), key],
                    )?;
                    changes.insert(
                        key,
                        ValueChange {
                            old_value: Some(old_value),
                            new_value: None,
                        },
                    );
                }
                tx.commit()?;
                Ok(changes)
            })
            .await?;

        self.notifier.emit(scope, changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");

        {
            let store = SqliteStore::open(path.clone()).unwrap();
            store
                .set_one(StoreScope::Local, "revealed", json!(["a", "b"]))
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(path).unwrap();
        assert_eq!(
            reopened.get_one(StoreScope::Local, "revealed").await.unwrap(),
            Some(json!(["a", "b"]))
        );
        assert_eq!(reopened.get_one(StoreScope::Synced, "revealed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_delete_fires_two_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.sqlite3")).unwrap();
        let mut changes = store.subscribe();

        store.set_one(StoreScope::Local, "msg", json!({"n": 1})).await.unwrap();
        store.set_one(StoreScope::Local, "msg", json!({"n": 1})).await.unwrap();
        store.remove(StoreScope::Local, &["msg"]).await.unwrap();

        let written = changes.recv().await.unwrap();
        assert_eq!(written.changes["msg"].new_value, Some(json!({"n": 1})));
        let deleted = changes.recv().await.unwrap();
        assert_eq!(deleted.changes["msg"].new_value, None);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn migrate_is_idempotent_and_rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        conn.pragma_update(None, "user_version", MIGRATIONS.len() as i64 + 1)
            .unwrap();
        assert!(migrate(&mut conn).is_err());
    }
}
