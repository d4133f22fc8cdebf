use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aof::{self, Aof};
use crate::config::Config;
use crate::snapshot;
use crate::store::{Db, Store};

/// Redis-style save rules: trigger when `elapsed >= .0` seconds have passed
/// and at least `.1` changes accumulated.
const SAVE_RULES: [(u64, u64); 3] = [(900, 1), (300, 10), (60, 10_000)];

/// How often the supervisor wakes to reap workers, check the save rules,
/// and run the fsync cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// True when any save rule row is satisfied.
fn snapshot_due(elapsed: Duration, changes: u64) -> bool {
    SAVE_RULES
        .iter()
        .any(|&(secs, min_changes)| elapsed.as_secs() >= secs && changes >= min_changes)
}

struct RewriteJob {
    /// Taken by the reaper once finished; `None` between completion and
    /// handoff so appends keep landing in `buffered`.
    task: Option<JoinHandle<io::Result<()>>>,
    /// Commands appended while the rewrite ran; replayed onto the compacted
    /// log before it replaces the old one, so nothing committed is lost.
    buffered: Vec<String>,
}

struct PersistInner {
    changes_since_save: u64,
    last_save_time: Instant,
    snapshot_task: Option<JoinHandle<io::Result<()>>>,
    /// `None` when AOF is disabled by configuration or a failed open.
    aof: Option<Aof>,
    rewrite: Option<RewriteJob>,
}

struct PersistShared {
    snapshot_path: PathBuf,
    aof_path: PathBuf,
    inner: Mutex<PersistInner>,
}

/// Cheaply clonable handle to the persistence engine: the change counter,
/// the AOF, and the in-flight background workers.
#[derive(Clone)]
pub struct Persistence {
    shared: Arc<PersistShared>,
}

impl Persistence {
    pub fn new(config: &Config) -> Self {
        let aof = if config.aof_enabled {
            match Aof::open(config) {
                Ok(aof) => Some(aof),
                Err(e) => {
                    error!(
                        error = %e,
                        path = %config.aof_path().display(),
                        "failed to open append-only file, disabling AOF for this process"
                    );
                    None
                }
            }
        } else {
            None
        };
        Self {
            shared: Arc::new(PersistShared {
                snapshot_path: config.snapshot_path(),
                aof_path: config.aof_path(),
                inner: Mutex::new(PersistInner {
                    changes_since_save: 0,
                    last_save_time: Instant::now(),
                    snapshot_task: None,
                    aof,
                    rewrite: None,
                }),
            }),
        }
    }

    /// Record one successful mutation: count it against the save rules,
    /// append the raw command line to the AOF, and capture it in the
    /// rewrite buffer when a rewrite is in flight.
    ///
    /// Returns true when the auto-rewrite predicate fired and no rewrite is
    /// already running — the caller should start one.
    pub fn record_mutation(&self, line: &str) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.changes_since_save += 1;
        if let Some(job) = &mut inner.rewrite {
            job.buffered.push(line.to_string());
        }
        let mut rewrite_due = false;
        if let Some(aof) = &mut inner.aof {
            match aof.append(line) {
                Ok(due) => rewrite_due = due,
                Err(e) => error!(error = %e, "failed to append to AOF"),
            }
        }
        rewrite_due && inner.rewrite.is_none()
    }

    /// BGSAVE. Clones the keyspace image and hands it to a blocking worker.
    pub async fn start_background_save(&self, store: &Store) -> Result<(), &'static str> {
        let entries = store.read().await.clone_entries();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.snapshot_task.is_some() {
            return Err("Background save already in progress");
        }
        info!(keys = entries.len(), "background save started");
        let path = self.shared.snapshot_path.clone();
        inner.snapshot_task =
            Some(tokio::task::spawn_blocking(move || snapshot::save(&entries, &path)));
        Ok(())
    }

    /// BGREWRITEAOF. Clones the keyspace image and hands it to a blocking
    /// worker that writes the compacted log to the temp file.
    pub async fn start_background_rewrite(&self, store: &Store) -> Result<(), &'static str> {
        let entries = store.read().await.clone_entries();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.aof.is_none() {
            return Err("AOF is disabled");
        }
        if inner.rewrite.is_some() {
            return Err("Background AOF rewrite already in progress");
        }
        info!(keys = entries.len(), "background AOF rewrite started");
        let tmp = aof::rewrite_tmp_path(&self.shared.aof_path);
        let task = tokio::task::spawn_blocking(move || aof::rewrite_to(&tmp, &entries));
        inner.rewrite = Some(RewriteJob {
            task: Some(task),
            buffered: Vec::new(),
        });
        Ok(())
    }

    /// One supervisor iteration: reap finished workers, check the snapshot
    /// trigger, run the fsync cadence. Order matters: reaping first means a
    /// completed snapshot frees its slot before the trigger check.
    pub async fn tick(&self, store: &Store) {
        self.reap_snapshot().await;
        self.reap_rewrite().await;
        self.maybe_snapshot(store).await;
        self.fsync_tick();
    }

    async fn reap_snapshot(&self) {
        let finished = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner
                .snapshot_task
                .as_ref()
                .is_some_and(|t| t.is_finished())
            {
                inner.snapshot_task.take()
            } else {
                None
            }
        };
        if let Some(task) = finished {
            match task.await {
                Ok(Ok(())) => {
                    metrics::counter!("redis_clone_snapshots_total").increment(1);
                    info!("background save completed");
                }
                Ok(Err(e)) => error!(error = %e, "background save failed"),
                Err(e) => error!(error = %e, "background save worker panicked"),
            }
        }
    }

    async fn reap_rewrite(&self) {
        // Take only the finished task; the job itself stays registered so
        // appends landing between here and the handoff keep buffering.
        let finished = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.rewrite.as_mut().and_then(|job| {
                if job.task.as_ref().is_some_and(|t| t.is_finished()) {
                    job.task.take()
                } else {
                    None
                }
            })
        };
        let Some(task) = finished else {
            return;
        };
        let result = task.await;
        let mut inner = self.shared.inner.lock().unwrap();
        let Some(job) = inner.rewrite.take() else {
            return;
        };
        match result {
            Ok(Ok(())) => {
                match finish_rewrite(&self.shared.aof_path, &job.buffered, inner.aof.as_mut()) {
                    Ok(new_size) => {
                        metrics::counter!("redis_clone_aof_rewrites_total").increment(1);
                        info!(
                            size = new_size,
                            buffered = job.buffered.len(),
                            "background AOF rewrite completed"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "AOF rewrite handoff failed");
                        let _ = fs::remove_file(aof::rewrite_tmp_path(&self.shared.aof_path));
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "background AOF rewrite failed");
                let _ = fs::remove_file(aof::rewrite_tmp_path(&self.shared.aof_path));
            }
            Err(e) => {
                error!(error = %e, "background AOF rewrite worker panicked");
                let _ = fs::remove_file(aof::rewrite_tmp_path(&self.shared.aof_path));
            }
        }
    }

    /// Automatic snapshot trigger. Counters reset when the save is
    /// *triggered*, not when the worker completes.
    async fn maybe_snapshot(&self, store: &Store) {
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.snapshot_task.is_some()
                || !snapshot_due(inner.last_save_time.elapsed(), inner.changes_since_save)
            {
                return;
            }
        }
        let entries = store.read().await.clone_entries();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.snapshot_task.is_some() {
            return;
        }
        inner.changes_since_save = 0;
        inner.last_save_time = Instant::now();
        info!(keys = entries.len(), "automatic background save started");
        let path = self.shared.snapshot_path.clone();
        inner.snapshot_task =
            Some(tokio::task::spawn_blocking(move || snapshot::save(&entries, &path)));
    }

    fn fsync_tick(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(aof) = &mut inner.aof {
            if let Err(e) = aof.fsync_if_due() {
                error!(error = %e, "AOF fsync failed");
            }
        }
    }

    /// Final push of any buffered AOF writes before the process exits.
    pub fn sync_on_shutdown(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(aof) = &mut inner.aof {
            match aof.sync_now() {
                Ok(()) => info!("append-only file synced on shutdown"),
                Err(e) => error!(error = %e, "failed to sync append-only file on shutdown"),
            }
        }
    }

    #[cfg(test)]
    fn with_inner<T>(&self, f: impl FnOnce(&mut PersistInner) -> T) -> T {
        f(&mut self.shared.inner.lock().unwrap())
    }
}

/// Complete a successful rewrite: append the buffered commands to the
/// compacted temp file, sync it, atomically rename it over the canonical
/// log, and reopen the append handle against the new file. Runs under the
/// persistence lock so no append can interleave.
fn finish_rewrite(
    aof_path: &Path,
    buffered: &[String],
    aof: Option<&mut Aof>,
) -> io::Result<u64> {
    let tmp = aof::rewrite_tmp_path(aof_path);
    if !buffered.is_empty() {
        let mut file = OpenOptions::new().append(true).open(&tmp)?;
        for line in buffered {
            writeln!(file, "{line}")?;
        }
        file.sync_data()?;
    }
    fs::rename(&tmp, aof_path)?;
    let new_size = fs::metadata(aof_path)?.len();
    if let Some(aof) = aof {
        aof.reopen_after_rewrite(new_size)?;
    }
    Ok(new_size)
}

/// Supervisor background task; one per server.
pub async fn run_supervisor(persist: Persistence, store: Store) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        persist.tick(&store).await;
    }
}

/// Seed the keyspace from disk. The AOF, when enabled and present, is
/// authoritative; otherwise the snapshot; otherwise start empty.
pub fn recover(config: &Config) -> Db {
    let mut db = Db::new();
    let aof_path = config.aof_path();
    if config.aof_enabled && aof_path.exists() {
        match aof::load(&aof_path, &mut db) {
            Ok(applied) => {
                info!(
                    path = %aof_path.display(),
                    commands = applied,
                    keys = db.len(),
                    "recovered keyspace from append-only file"
                );
                return db;
            }
            Err(e) => {
                error!(
                    error = %e,
                    path = %aof_path.display(),
                    "failed to replay append-only file, falling back to snapshot"
                );
                db = Db::new();
            }
        }
    }
    let snapshot_path = config.snapshot_path();
    match snapshot::load(&snapshot_path) {
        Ok(entries) => {
            let keys = entries.len();
            for (key, value) in entries {
                db.set(key, value);
            }
            info!(path = %snapshot_path.display(), keys, "loaded snapshot");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no existing data, starting with empty keyspace");
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %snapshot_path.display(),
                "failed to load snapshot, starting with empty keyspace"
            );
        }
    }
    db
}
