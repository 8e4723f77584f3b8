//! Persistent `session key -> conversation handle` mapping.
//!
//! The mapping lives in one JSON file written atomically. Saves occasionally
//! snapshot the previous file into `backups/` (always after corruption was
//! seen), and a corrupt mapping is repaired from the newest parseable backup.
//! Storage is behind [`SessionBackend`] so tests can run fully in memory.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::service::{JobService, ServiceError};

pub const MAPPING_FILE: &str = "session_map.json";
pub const MARKER_FILE: &str = "session_map.last_saved";
pub const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "session_map_";

/// Raw storage for the mapping file, its backups and the save marker.
pub trait SessionBackend: Send + Sync {
    /// `Ok(None)` when no mapping has been written yet.
    fn read_mapping(&self) -> io::Result<Option<String>>;
    fn write_mapping(&self, contents: &str) -> io::Result<()>;
    fn write_marker(&self, contents: &str) -> io::Result<()>;
    fn list_backups(&self) -> io::Result<Vec<String>>;
    fn read_backup(&self, name: &str) -> io::Result<String>;
    fn write_backup(&self, name: &str, contents: &str) -> io::Result<()>;
    fn remove_backup(&self, name: &str) -> io::Result<()>;
}

/// Stores everything under one directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }
}

/// Writes to a sibling temp file and renames it over `path`.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

impl SessionBackend for FileBackend {
    fn read_mapping(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.dir.join(MAPPING_FILE)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_mapping(&self, contents: &str) -> io::Result<()> {
        atomic_write(&self.dir.join(MAPPING_FILE), contents)
    }

    fn write_marker(&self, contents: &str) -> io::Result<()> {
        atomic_write(&self.dir.join(MARKER_FILE), contents)
    }

    fn list_backups(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(self.backup_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(".json") {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn read_backup(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.backup_dir().join(name))
    }

    fn write_backup(&self, name: &str, contents: &str) -> io::Result<()> {
        atomic_write(&self.backup_dir().join(name), contents)
    }

    fn remove_backup(&self, name: &str) -> io::Result<()> {
        std::fs::remove_file(self.backup_dir().join(name))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    mapping: Option<String>,
    marker: Option<String>,
    backups: BTreeMap<String, String>,
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `contents` as the mapping file, parseable or not.
    pub fn with_mapping(contents: impl Into<String>) -> Self {
        let backend = Self::default();
        lock(&backend.state).mapping = Some(contents.into());
        backend
    }

    pub fn insert_backup(&self, name: impl Into<String>, contents: impl Into<String>) {
        lock(&self.state)
            .backups
            .insert(name.into(), contents.into());
    }

    pub fn mapping(&self) -> Option<String> {
        lock(&self.state).mapping.clone()
    }

    pub fn marker(&self) -> Option<String> {
        lock(&self.state).marker.clone()
    }

    pub fn backup_names(&self) -> Vec<String> {
        lock(&self.state).backups.keys().cloned().collect()
    }
}

impl SessionBackend for MemoryBackend {
    fn read_mapping(&self) -> io::Result<Option<String>> {
        Ok(lock(&self.state).mapping.clone())
    }

    fn write_mapping(&self, contents: &str) -> io::Result<()> {
        lock(&self.state).mapping = Some(contents.to_string());
        Ok(())
    }

    fn write_marker(&self, contents: &str) -> io::Result<()> {
        lock(&self.state).marker = Some(contents.to_string());
        Ok(())
    }

    fn list_backups(&self) -> io::Result<Vec<String>> {
        Ok(self.backup_names())
    }

    fn read_backup(&self, name: &str) -> io::Result<String> {
        lock(&self.state)
            .backups
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn write_backup(&self, name: &str, contents: &str) -> io::Result<()> {
        self.insert_backup(name, contents);
        Ok(())
    }

    fn remove_backup(&self, name: &str) -> io::Result<()> {
        lock(&self.state).backups.remove(name);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// When saves snapshot the previous mapping, and how many snapshots to keep.
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    /// Chance per save of writing a backup, in `[0, 1]`.
    pub probability: f64,
    /// Newest backups kept after pruning.
    pub retention: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            probability: 0.2,
            retention: 10,
        }
    }
}

type Mapping = HashMap<String, String>;

pub struct SessionStore<B> {
    backend: B,
    entries: Mutex<Mapping>,
    save_lock: Mutex<()>,
    policy: BackupPolicy,
    backup_pending: AtomicBool,
}

impl<B: SessionBackend> SessionStore<B> {
    /// Creates the store and loads whatever the backend holds.
    pub fn open(backend: B, policy: BackupPolicy) -> Self {
        let store = Self {
            backend,
            entries: Mutex::new(HashMap::new()),
            save_lock: Mutex::new(()),
            policy,
            backup_pending: AtomicBool::new(false),
        };
        store.load();
        store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Replaces the in-memory mapping with the persisted one, repairing it
    /// from backups when unreadable. Returns the number of entries loaded.
    pub fn load(&self) -> usize {
        let mapping = match self.backend.read_mapping() {
            Ok(None) => Mapping::new(),
            Ok(Some(raw)) => match serde_json::from_str::<Mapping>(&raw) {
                Ok(mapping) => mapping,
                Err(e) => {
                    warn!(error = %e, "session map is corrupt");
                    self.recover()
                }
            },
            Err(e) => {
                warn!(error = %e, "session map is unreadable");
                self.recover()
            }
        };
        let count = mapping.len();
        *lock(&self.entries) = mapping;
        debug!(entries = count, "session map loaded");
        count
    }

    fn recover(&self) -> Mapping {
        self.backup_pending.store(true, Ordering::SeqCst);
        let _guard = lock(&self.save_lock);

        let mut names = self.backend.list_backups().unwrap_or_else(|e| {
            warn!(error = %e, "cannot list session map backups");
            Vec::new()
        });
        names.sort_unstable_by(|a, b| b.cmp(a));

        for name in names {
            let restored = self
                .backend
                .read_backup(&name)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<Mapping>(&raw)
                        .map(|mapping| (raw, mapping))
                        .map_err(|e| e.to_string())
                });
            match restored {
                Ok((raw, mapping)) => {
                    info!(backup = %name, entries = mapping.len(), "session map restored from backup");
                    if let Err(e) = self.backend.write_mapping(&raw) {
                        warn!(error = %e, "could not promote backup");
                    }
                    return mapping;
                }
                Err(e) => warn!(backup = %name, error = %e, "skipping unusable backup"),
            }
        }

        warn!("no usable backup, starting with an empty session map");
        if let Err(e) = self.backend.write_mapping("{}") {
            warn!(error = %e, "could not reset session map");
        }
        Mapping::new()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remember(&self, key: &str, handle: &str) {
        lock(&self.entries).insert(key.to_string(), handle.to_string());
    }

    fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "session map save failed");
        }
    }

    /// Drops the handle cached for `key` and persists the change.
    pub fn invalidate(&self, key: &str) -> Option<String> {
        let removed = lock(&self.entries).remove(key);
        if removed.is_some() {
            info!(key, "session invalidated");
            self.save_or_warn();
        }
        removed
    }

    /// Writes the mapping atomically, maybe snapshotting the previous file.
    pub fn save(&self) -> Result<()> {
        let _guard = lock(&self.save_lock);
        let snapshot = {
            let entries = lock(&self.entries);
            let ordered: BTreeMap<&String, &String> = entries.iter().collect();
            serde_json::to_string_pretty(&ordered)?
        };

        let forced = self.backup_pending.swap(false, Ordering::SeqCst);
        if forced || rand::random::<f64>() < self.policy.probability {
            self.backup_previous();
        }

        self.backend.write_mapping(&snapshot)?;
        if let Err(e) = self.backend.write_marker(&Utc::now().to_rfc3339()) {
            warn!(error = %e, "could not write save marker");
        }
        debug!("session map saved");
        Ok(())
    }

    fn backup_previous(&self) {
        let previous = match self.backend.read_mapping() {
            Ok(Some(previous)) => previous,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "cannot read session map for backup");
                return;
            }
        };
        let name = format!(
            "{BACKUP_PREFIX}{}.json",
            Utc::now().format("%Y%m%d_%H%M%S_%6f")
        );
        if let Err(e) = self.backend.write_backup(&name, &previous) {
            warn!(backup = %name, error = %e, "session map backup failed");
            return;
        }
        debug!(backup = %name, "session map backed up");
        self.prune_backups();
    }

    fn prune_backups(&self) {
        let mut names = match self.backend.list_backups() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "cannot list backups for pruning");
                return;
            }
        };
        if names.len() <= self.policy.retention {
            return;
        }
        names.sort_unstable();
        let excess = names.len() - self.policy.retention;
        for name in names.into_iter().take(excess) {
            if let Err(e) = self.backend.remove_backup(&name) {
                warn!(backup = %name, error = %e, "could not remove old backup");
            }
        }
    }

    /// Returns a live handle for `key`, creating (and persisting) a new
    /// session when none is cached or the cached one was rejected.
    pub async fn get_or_create<S: JobService>(
        &self,
        service: &S,
        key: &str,
    ) -> std::result::Result<String, ServiceError> {
        if let Some(handle) = self.get(key) {
            match service.session_exists(&handle).await {
                Ok(true) => return Ok(handle),
                Ok(false) => warn!(key, handle = %handle, "cached session no longer exists"),
                Err(e) => warn!(key, handle = %handle, error = %e, "could not verify cached session"),
            }
            self.invalidate(key);
        }

        let handle = service.create_session().await?;
        info!(key, handle = %handle, "created session");
        self.remember(key, &handle);
        self.save_or_warn();
        Ok(handle)
    }
}

/// Handle to the background task that saves the store periodically.
pub struct PeriodicSave {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicSave {
    /// Cancels the task and waits at most `grace` for it to finish.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        match timeout(grace, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "periodic save task failed"),
            Err(_) => warn!(grace_ms = grace.as_millis() as u64, "periodic save task did not stop in time"),
        }
    }
}

impl<B: SessionBackend + 'static> SessionStore<B> {
    /// Saves every `every` until stopped. Each save runs on the blocking
    /// pool.
    pub fn spawn_periodic_save(self: &Arc<Self>, every: Duration) -> PeriodicSave {
        let every = every.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        if let Err(e) = tokio::task::spawn_blocking(move || store.save_or_warn()).await {
                            warn!(error = %e, "periodic save task failed");
                        }
                    }
                }
            }
        });

        PeriodicSave { cancel, handle }
    }

    /// Stops periodic saving and writes the mapping one last time.
    pub async fn shutdown(&self, saver: PeriodicSave, grace: Duration) -> Result<()> {
        saver.stop(grace).await;
        self.save()
    }
}
