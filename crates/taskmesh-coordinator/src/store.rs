//! Shared hierarchical document store.
//!
//! The store is the only shared state between coordinator instances. Every
//! logical path (`tasks/{id}`, `budget/ledger`, ...) maps to one JSON file
//! under the root directory, wrapped in a [`Document`] envelope carrying a
//! version for optimistic concurrency.
//!
//! Two primitives give cross-process safety without a database:
//! - exclusive create (`hard_link` of a fully written temp file), used for
//!   write-once records and lock files;
//! - version-checked replacement under a short-lived guard file, used by
//!   [`StateStore::write_atomic`] and [`StateStore::remove_if`].
//!
//! A guard file holds the token of the writer that created it. An abandoned
//! guard is taken over by renaming it to a unique name first, so of several
//! writers that judged it expired only the one that moved it may clear it.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use taskmesh_core::TaskId;

use crate::config::StoreConfig;
use crate::error::{CoordinatorError, Result};
use crate::retry::Backoff;

const EXT: &str = ".json";

/// Versioned envelope around a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub data: T,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u64,
}

/// A per-document write guard held by this process.
struct Guard {
    path: PathBuf,
    token: String,
}

enum GuardState {
    Live,
    Gone,
    /// Older than the TTL; carries the token it held when inspected.
    Expired(String),
}

/// File-backed document store.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    backoff: Backoff,
    guard_ttl: Duration,
}

impl StateStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, config: &StoreConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            backoff: config.backoff(),
            guard_ttl: Duration::from_millis(config.guard_ttl_ms),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a document with its envelope.
    pub async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<Document<T>>> {
        let file = self.file_path(path)?;
        match fs::read(&file).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read just the record.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        Ok(self.read(path).await?.map(|d| d.data))
    }

    /// Read a record that must exist.
    pub async fn require<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(path.to_string()))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.file_path(path)?).await?)
    }

    /// Create a document that must not exist yet.
    ///
    /// Fails with `DuplicateId` when the path is taken. Readers never observe
    /// a partially written document.
    pub async fn create<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let file = self.file_path(path)?;
        let doc = Document {
            version: 1,
            updated_at: Utc::now(),
            data: value,
        };
        let tmp = self.write_temp(&file, &doc).await?;
        let linked = fs::hard_link(&tmp, &file).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(CoordinatorError::DuplicateId(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write with optimistic concurrency.
    ///
    /// `mutate` receives the current record (`None` if absent) and returns the
    /// replacement. On a version conflict the whole cycle is retried with
    /// bounded exponential backoff; `mutate` may therefore run more than once
    /// and must not have side effects outside the values it returns.
    pub async fn write_atomic<T, F>(&self, path: &str, mut mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let current: Option<Document<T>> = self.read(path).await?;
            let expected = current.as_ref().map_or(0, |d| d.version);
            let next = mutate(current.map(|d| d.data))?;

            match self.commit(path, expected, &next).await {
                Ok(()) => return Ok(next),
                Err(CoordinatorError::Conflict(reason)) => {
                    attempt += 1;
                    if attempt >= self.backoff.attempts {
                        warn!(path, attempts = attempt, "Write conflict not resolved");
                        return Err(CoordinatorError::Conflict(format!("{path}: {reason}")));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    debug!(path, attempt, delay_ms = delay.as_millis() as u64, "Write conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`write_atomic`](Self::write_atomic) but the record must exist.
    pub async fn update<T, F>(&self, path: &str, mut mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(T) -> Result<T>,
    {
        self.write_atomic(path, |current: Option<T>| match current {
            Some(value) => mutate(value),
            None => Err(CoordinatorError::NotFound(path.to_string())),
        })
        .await
    }

    /// Document names (without extension) directly under `dir`, sorted.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir_path = self.dir_path(dir)?;
        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(EXT) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// All records under `dir`, skipping ones removed mid-listing.
    pub async fn list_values<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for name in self.list(dir).await? {
            if let Some(value) = self.get(&format!("{dir}/{name}")).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Delete a document iff `pred` holds for its current record.
    ///
    /// The check and the delete happen under the document's write guard, so
    /// a record replaced in between is never removed by mistake. Guard
    /// contention is retried with the store backoff.
    pub async fn remove_if<T, P>(&self, path: &str, pred: P) -> Result<bool>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        let file = self.file_path(path)?;
        let mut attempt = 0;
        loop {
            match self.remove_guarded(&file, &pred).await {
                Err(CoordinatorError::Conflict(reason)) => {
                    attempt += 1;
                    if attempt >= self.backoff.attempts {
                        return Err(CoordinatorError::Conflict(format!("{path}: {reason}")));
                    }
                    tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                }
                other => return other,
            }
        }
    }

    async fn remove_guarded<T, P>(&self, file: &Path, pred: &P) -> Result<bool>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        let guard = self.acquire_guard(file).await?;
        let result = async {
            let current: Document<T> = match fs::read(file).await {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if !pred(&current.data) {
                return Ok(false);
            }
            self.verify_guard(&guard).await?;
            match fs::remove_file(file).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        .await;
        self.release_guard(&guard).await;
        result
    }

    /// Delete a document. Returns whether it existed.
    pub async fn remove(&self, path: &str) -> Result<bool> {
        match fs::remove_file(self.file_path(path)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a document. Fails with `NotFound` if the source is gone, so
    /// exactly one of several racing movers succeeds.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.file_path(from)?;
        let dst = self.file_path(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CoordinatorError::NotFound(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the document iff its version is still `expected`.
    async fn commit<T: Serialize>(&self, path: &str, expected: u64, value: &T) -> Result<()> {
        let file = self.file_path(path)?;
        let guard = self.acquire_guard(&file).await?;

        let result = async {
            let actual = self.read_version(&file).await?;
            if actual != expected {
                return Err(CoordinatorError::Conflict(format!(
                    "version moved from {expected} to {actual}"
                )));
            }
            let doc = Document {
                version: expected + 1,
                updated_at: Utc::now(),
                data: value,
            };
            let tmp = self.write_temp(&file, &doc).await?;
            if let Err(e) = self.verify_guard(&guard).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
            if let Err(e) = fs::rename(&tmp, &file).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            Ok(())
        }
        .await;

        self.release_guard(&guard).await;
        result
    }

    async fn read_version(&self, file: &Path) -> Result<u64> {
        match fs::read(file).await {
            Ok(bytes) => Ok(serde_json::from_slice::<VersionOnly>(&bytes)?.version),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the per-document write guard, clearing one abandoned by a crash.
    async fn acquire_guard(&self, file: &Path) -> Result<Guard> {
        let path = sibling(file, "", ".guard");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        for _ in 0..3 {
            let token = uuid::Uuid::new_v4().simple().to_string();
            if link_new(&path, token.as_bytes()).await? {
                return Ok(Guard { path, token });
            }
            match self.guard_state(&path).await? {
                GuardState::Live => break,
                GuardState::Gone => {}
                GuardState::Expired(seen) => {
                    if !take_over_guard(&path, &seen).await? {
                        break;
                    }
                }
            }
        }
        Err(CoordinatorError::Conflict("write guard held".into()))
    }

    /// Age and token are read through one handle, so both describe the same
    /// guard file.
    async fn guard_state(&self, path: &Path) -> Result<GuardState> {
        let mut f = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(GuardState::Gone),
            Err(e) => return Err(e.into()),
        };
        let expired = f
            .metadata()
            .await?
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .is_some_and(|age| age > self.guard_ttl);
        if !expired {
            return Ok(GuardState::Live);
        }
        let mut token = String::new();
        f.read_to_string(&mut token).await?;
        Ok(GuardState::Expired(token))
    }

    /// Fails with `Conflict` if our guard was taken over as abandoned.
    async fn verify_guard(&self, guard: &Guard) -> Result<()> {
        match fs::read_to_string(&guard.path).await {
            Ok(token) if token == guard.token => Ok(()),
            Ok(_) => Err(CoordinatorError::Conflict("write guard taken over".into())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CoordinatorError::Conflict("write guard taken over".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_guard(&self, guard: &Guard) {
        if matches!(fs::read_to_string(&guard.path).await, Ok(token) if token == guard.token) {
            let _ = fs::remove_file(&guard.path).await;
        }
    }

    async fn write_temp<T: Serialize>(&self, file: &Path, doc: &Document<T>) -> Result<PathBuf> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = sibling(file, ".", &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&bytes).await?;
        f.sync_all().await?;
        Ok(tmp)
    }

    fn file_path(&self, path: &str) -> Result<PathBuf> {
        Ok(sibling(&self.dir_path(path)?, "", EXT))
    }

    fn dir_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let valid = !path.is_empty()
            && rel.components().all(|c| match c {
                Component::Normal(s) => !s.to_string_lossy().starts_with('.'),
                _ => false,
            });
        if !valid {
            return Err(CoordinatorError::Core(taskmesh_core::CoreError::InvalidInput(
                format!("invalid store path '{path}'"),
            )));
        }
        Ok(self.root.join(rel))
    }
}

/// Store path of a task record.
pub fn task_path(id: &TaskId) -> String {
    format!("tasks/{id}")
}

/// Exclusively create `path` with `bytes`. False if it already exists.
async fn link_new(path: &Path, bytes: &[u8]) -> Result<bool> {
    let tmp = sibling(path, ".", &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    let linked = fs::hard_link(&tmp, path).await;
    let _ = fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Clear an expired guard that held `seen`. Only the caller whose rename
/// moves the guard may clear it; a guard that turns out to be a fresh one
/// is discarded and its owner fails verification. Returns whether the
/// caller may try to create the guard again.
async fn take_over_guard(path: &Path, seen: &str) -> Result<bool> {
    let moved = sibling(path, ".", &format!(".{}.stale", uuid::Uuid::new_v4().simple()));
    match fs::rename(path, &moved).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    let token = fs::read_to_string(&moved).await.unwrap_or_default();
    let _ = fs::remove_file(&moved).await;
    if token == seen {
        warn!(guard = %path.display(), "Removed abandoned write guard");
        Ok(true)
    } else {
        debug!(guard = %path.display(), "Guard was renewed before takeover");
        Ok(false)
    }
}

/// `dir/{prefix}{file_name}{suffix}`
fn sibling(file: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.with_file_name(format!("{prefix}{name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path(), &StoreConfig::default())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let (_dir, store) = store().await;
        store.create("tasks/a", &1u32).await.unwrap();
        let err = store.create("tasks/a", &2u32).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateId(_)));
        assert_eq!(store.get::<u32>("tasks/a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_write_atomic_bumps_version() {
        let (_dir, store) = store().await;
        store
            .write_atomic("budget/ledger", |v: Option<u64>| Ok(v.unwrap_or(0) + 5))
            .await
            .unwrap();
        store
            .write_atomic("budget/ledger", |v: Option<u64>| Ok(v.unwrap_or(0) + 5))
            .await
            .unwrap();
        let doc = store.read::<u64>("budget/ledger").await.unwrap().unwrap();
        assert_eq!(doc.data, 10);
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let backoff = Backoff::new(50, Duration::from_millis(1), Duration::from_millis(20));
                    // Conflicts past the store's own retries are retried here.
                    loop {
                        match store
                            .write_atomic("counter", |v: Option<u64>| Ok(v.unwrap_or(0) + 1))
                            .await
                        {
                            Ok(_) => break,
                            Err(CoordinatorError::Conflict(_)) => {
                                tokio::time::sleep(backoff.delay(0)).await
                            }
                            Err(e) => panic!("{e}"),
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get::<u64>("counter").await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let (_dir, store) = store().await;
        let err = store
            .update("tasks/missing", |v: u32| Ok(v + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_sorts() {
        let (dir, store) = store().await;
        store.create("events/x/queue/0002", &2u8).await.unwrap();
        store.create("events/x/queue/0001", &1u8).await.unwrap();
        std::fs::write(dir.path().join("events/x/queue/.junk.tmp"), b"x").unwrap();
        assert_eq!(
            store.list("events/x/queue").await.unwrap(),
            vec!["0001".to_string(), "0002".to_string()]
        );
        assert!(store.list("nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_only_once() {
        let (_dir, store) = store().await;
        store.create("pool/active/w1", &"w").await.unwrap();
        store.rename("pool/active/w1", "pool/failed/w1").await.unwrap();
        let again = store.rename("pool/active/w1", "pool/failed/w1").await;
        assert!(matches!(again, Err(CoordinatorError::NotFound(_))));
        assert!(store.exists("pool/failed/w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_dir, store) = store().await;
        assert!(store.get::<u8>("../etc/passwd").await.is_err());
        assert!(store.get::<u8>("/abs").await.is_err());
        assert!(store.get::<u8>("tasks/.hidden").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_if_checks_current_record() {
        let (_dir, store) = store().await;
        store.create("locks/x", &"holder-a").await.unwrap();
        assert!(!store
            .remove_if("locks/x", |h: &String| h == "holder-b")
            .await
            .unwrap());
        assert!(store.exists("locks/x").await.unwrap());
        assert!(store
            .remove_if("locks/x", |h: &String| h == "holder-a")
            .await
            .unwrap());
        assert!(!store
            .remove_if("locks/x", |_: &String| true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_renewed_guard_is_not_cleared_as_stale() {
        let dir = TempDir::new().unwrap();
        let guard = dir.path().join("a.json.guard");
        std::fs::write(&guard, b"fresh-token").unwrap();

        // A writer that inspected the previous, expired guard loses the race.
        assert!(!take_over_guard(&guard, "old-token").await.unwrap());
        assert!(!guard.exists());

        std::fs::write(&guard, b"old-token").unwrap();
        assert!(take_over_guard(&guard, "old-token").await.unwrap());
        assert!(!guard.exists());
    }

    #[tokio::test]
    async fn test_writer_whose_guard_was_taken_over_conflicts() {
        let (dir, store) = store().await;
        let file = dir.path().join("tasks/a.json");
        let guard = store.acquire_guard(&file).await.unwrap();
        std::fs::write(&guard.path, b"someone-else").unwrap();

        let err = store.verify_guard(&guard).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        store.release_guard(&guard).await;
        // Another writer's guard is left alone.
        assert_eq!(std::fs::read_to_string(&guard.path).unwrap(), "someone-else");
    }

    #[tokio::test]
    async fn test_racing_writers_after_abandoned_guard() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            guard_ttl_ms: 300,
            ..StoreConfig::default()
        };
        let store = Arc::new(StateStore::open(dir.path(), &config).await.unwrap());
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::write(dir.path().join("tasks/n.json.guard"), b"crashed-writer").unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    loop {
                        match store
                            .write_atomic("tasks/n", |v: Option<u64>| Ok(v.unwrap_or(0) + 1))
                            .await
                        {
                            Ok(_) => break,
                            Err(CoordinatorError::Conflict(_)) => {
                                tokio::time::sleep(Duration::from_millis(2)).await
                            }
                            Err(e) => panic!("{e}"),
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get::<u64>("tasks/n").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_stale_guard_is_cleared() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            guard_ttl_ms: 0,
            ..StoreConfig::default()
        };
        let store = StateStore::open(dir.path(), &config).await.unwrap();
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::write(dir.path().join("tasks/a.json.guard"), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .write_atomic("tasks/a", |_: Option<u8>| Ok(1))
            .await
            .unwrap();
        assert_eq!(store.get::<u8>("tasks/a").await.unwrap(), Some(1));
    }
}
