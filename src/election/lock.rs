//! Lease records and the lock backends they live in
//!
//! A [`DistributedLock`] is one contender's handle on a named lease. Handles
//! remember the version they last read, so `update` is a compare-and-swap
//! against that read: two contenders racing on the same stale view cannot
//! both win.

use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// The durable lease record shared by all contenders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Current holder; empty means the lease is free.
    pub holder_identity: String,
    pub lease_duration_ms: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub acquire_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u64,
}

impl LeaseRecord {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Instant after which another contender may take the lease over.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renew_time + chrono::Duration::milliseconds(self.lease_duration_ms as i64)
    }

    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Read-modify-write access to one named lease.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Fetch the record and its raw encoding.
    /// Returns [`Error::LeaseNotFound`] when no record exists yet.
    async fn get(&self) -> Result<(LeaseRecord, Vec<u8>)>;

    /// Create the record; fails if one already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<()>;

    /// Replace the record last returned by `get`.
    async fn update(&self, record: &LeaseRecord) -> Result<()>;

    /// Attach a lifecycle event to the lock (audit trail).
    fn record_event(&self, event: &str);

    /// Identity this handle writes as holder.
    fn identity(&self) -> &str;

    /// Human readable lock description for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct StoredLease {
    record: Option<LeaseRecord>,
    version: u64,
}

/// Process-local lease store. Contenders obtain handles with
/// [`MemoryLockStore::handle`]; handles on the same name contend for the
/// same lease.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    leases: Mutex<HashMap<String, StoredLease>>,
    events: Mutex<Vec<String>>,
}

impl MemoryLockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle(self: &Arc<Self>, name: &str, identity: &str) -> MemoryLock {
        MemoryLock {
            store: Arc::clone(self),
            name: name.to_string(),
            identity: identity.to_string(),
            seen_version: Mutex::new(None),
            partitioned: Mutex::new(false),
        }
    }

    /// Current record for `name`, bypassing any handle.
    pub fn peek(&self, name: &str) -> Option<LeaseRecord> {
        self.leases
            .lock()
            .get(name)
            .and_then(|stored| stored.record.clone())
    }

    /// Events recorded by all handles, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

/// One contender's handle on a [`MemoryLockStore`] lease.
#[derive(Debug)]
pub struct MemoryLock {
    store: Arc<MemoryLockStore>,
    name: String,
    identity: String,
    seen_version: Mutex<Option<u64>>,
    partitioned: Mutex<bool>,
}

impl MemoryLock {
    /// Simulate losing (or regaining) connectivity to the store.
    pub fn set_partitioned(&self, partitioned: bool) {
        *self.partitioned.lock() = partitioned;
    }

    fn reachable(&self) -> Result<()> {
        if *self.partitioned.lock() {
            return Err(Error::Lock(format!("{} unreachable", self.describe())));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn get(&self) -> Result<(LeaseRecord, Vec<u8>)> {
        self.reachable()?;
        let leases = self.store.leases.lock();
        match leases.get(&self.name) {
            Some(StoredLease {
                record: Some(record),
                version,
            }) => {
                *self.seen_version.lock() = Some(*version);
                let raw = record.encode()?;
                Ok((record.clone(), raw))
            }
            _ => Err(Error::LeaseNotFound(self.name.clone())),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        self.reachable()?;
        let mut leases = self.store.leases.lock();
        let stored = leases.entry(self.name.clone()).or_default();
        if stored.record.is_some() {
            return Err(Error::LeaseConflict(format!("{} already exists", self.name)));
        }
        stored.record = Some(record.clone());
        stored.version += 1;
        *self.seen_version.lock() = Some(stored.version);
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        self.reachable()?;
        let mut leases = self.store.leases.lock();
        let stored = leases
            .get_mut(&self.name)
            .ok_or_else(|| Error::LeaseNotFound(self.name.clone()))?;
        let mut seen = self.seen_version.lock();
        if *seen != Some(stored.version) {
            return Err(Error::LeaseConflict(format!(
                "{} changed since last read",
                self.name
            )));
        }
        stored.record = Some(record.clone());
        stored.version += 1;
        *seen = Some(stored.version);
        Ok(())
    }

    fn record_event(&self, event: &str) {
        tracing::info!(lock = %self.describe(), identity = %self.identity, "{}", event);
        self.store
            .events
            .lock()
            .push(format!("{} {}", self.identity, event));
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }
}

// ============================================================================
// File backend
// ============================================================================

/// How long `update` waits for the guard file between attempts.
const GUARD_POLL: Duration = Duration::from_millis(5);

/// A guard file older than this was left behind by a crashed writer.
const GUARD_STALE: Duration = Duration::from_secs(10);

/// Exclusive hold on `{lease}.guard`, removed on drop.
///
/// Dropping also covers an `update` future cancelled by a timeout.
struct Guard {
    path: PathBuf,
}

impl Guard {
    async fn acquire(path: PathBuf) -> Result<Self> {
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path).await {
                        tracing::warn!(guard = %path.display(), "removing stale lease guard");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(GUARD_POLL).await;
                }
                Err(e) => return Err(Error::Lock(format!("{}: {}", path.display(), e))),
            }
        }
    }

    async fn is_stale(path: &Path) -> bool {
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age > GUARD_STALE)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Lease stored as a JSON file, typically on a filesystem shared by the
/// fleet. `create` is exclusive; `update` holds a guard file while it
/// re-reads the lease and replaces it (write-then-rename), and only when the
/// lease still matches the last read.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    identity: String,
    seen_raw: Mutex<Option<Vec<u8>>>,
}

impl FileLock {
    /// Open the lease `name` inside `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>, name: &str, identity: &str) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let file_name = format!(
            "{}.lease",
            name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "_")
        );
        Ok(Self {
            path: dir.as_ref().join(file_name),
            identity: identity.to_string(),
            seen_raw: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_raw(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Lock(format!("{}: {}", self.path.display(), e))),
        }
    }
}

#[async_trait]
impl DistributedLock for FileLock {
    async fn get(&self) -> Result<(LeaseRecord, Vec<u8>)> {
        let raw = self
            .read_raw()
            .await?
            .ok_or_else(|| Error::LeaseNotFound(self.path.display().to_string()))?;
        let record = LeaseRecord::decode(&raw)?;
        *self.seen_raw.lock() = Some(raw.clone());
        Ok((record, raw))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let raw = record.encode()?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    Error::LeaseConflict(format!("{} already exists", self.path.display()))
                }
                _ => Error::Lock(format!("{}: {}", self.path.display(), e)),
            })?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        *self.seen_raw.lock() = Some(raw);
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        let _guard = Guard::acquire(self.path.with_extension("lease.guard")).await?;
        let current = self.read_raw().await?;
        let seen = self.seen_raw.lock().clone();
        if current.is_none() || current != seen {
            return Err(Error::LeaseConflict(format!(
                "{} changed since last read",
                self.path.display()
            )));
        }

        let raw = record.encode()?;
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &raw).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Lock(format!("{}: {}", self.path.display(), e)));
        }
        *self.seen_raw.lock() = Some(raw);
        Ok(())
    }

    fn record_event(&self, event: &str) {
        tracing::info!(lock = %self.describe(), identity = %self.identity, "{}", event);
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        format!("file/{}", self.path.display())
    }
}

/// Where a node keeps its leases.
#[derive(Debug, Clone)]
pub enum LockBackend {
    Memory(Arc<MemoryLockStore>),
    File(PathBuf),
}

impl LockBackend {
    /// Open the lease `name` as contender `identity`.
    pub fn open(&self, name: &str, identity: &str) -> Result<Arc<dyn DistributedLock>> {
        Ok(match self {
            LockBackend::Memory(store) => Arc::new(store.handle(name, identity)),
            LockBackend::File(dir) => Arc::new(FileLock::new(dir, name, identity)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(holder: &str) -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            holder_identity: holder.to_string(),
            lease_duration_ms: 5_000,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        }
    }

    #[test]
    fn test_backend_opens_shared_lease() {
        let store = MemoryLockStore::new();
        let backend = LockBackend::Memory(store.clone());
        let a = backend.open("svc/fleet", "a").unwrap();
        let b = backend.open("svc/fleet", "b").unwrap();
        assert_eq!(a.identity(), "a");
        assert_eq!(a.describe(), b.describe());
    }

    #[test]
    fn test_record_expiry() {
        let rec = record("a");
        assert!(rec.is_held());
        assert_eq!(
            rec.expires_at() - rec.renew_time,
            chrono::Duration::milliseconds(5_000)
        );
        assert!(!LeaseRecord::default().is_held());
    }

    #[test]
    fn test_record_keeps_millisecond_precision() {
        let rec = record("a");
        let decoded = LeaseRecord::decode(&rec.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.renew_time.timestamp_millis(),
            rec.renew_time.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_memory_lock_not_found_then_create() {
        let store = MemoryLockStore::new();
        let lock = store.handle("fleet", "a");

        assert!(matches!(lock.get().await, Err(Error::LeaseNotFound(_))));
        lock.create(&record("a")).await.unwrap();
        let (rec, raw) = lock.get().await.unwrap();
        assert_eq!(rec.holder_identity, "a");
        assert!(!raw.is_empty());

        let other = store.handle("fleet", "b");
        assert!(matches!(
            other.create(&record("b")).await,
            Err(Error::LeaseConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_lock_stale_update_rejected() {
        let store = MemoryLockStore::new();
        let a = store.handle("fleet", "a");
        let b = store.handle("fleet", "b");
        a.create(&record("a")).await.unwrap();

        a.get().await.unwrap();
        b.get().await.unwrap();
        b.update(&record("b")).await.unwrap();
        // a's view is now stale
        assert!(matches!(
            a.update(&record("a")).await,
            Err(Error::LeaseConflict(_))
        ));
        assert_eq!(store.peek("fleet").unwrap().holder_identity, "b");
    }

    #[tokio::test]
    async fn test_memory_lock_partition() {
        let store = MemoryLockStore::new();
        let lock = store.handle("fleet", "a");
        lock.set_partitioned(true);
        let err = lock.get().await.unwrap_err();
        assert!(err.is_retryable());
        lock.set_partitioned(false);
        assert!(matches!(lock.get().await, Err(Error::LeaseNotFound(_))));
    }

    #[tokio::test]
    async fn test_file_lock_lifecycle() {
        let dir = TempDir::new().unwrap();
        let a = FileLock::new(dir.path(), "sensor-gateway/default", "a").unwrap();
        let b = FileLock::new(dir.path(), "sensor-gateway/default", "b").unwrap();
        assert_eq!(a.path(), b.path());

        assert!(matches!(a.get().await, Err(Error::LeaseNotFound(_))));
        a.create(&record("a")).await.unwrap();
        assert!(matches!(
            b.create(&record("b")).await,
            Err(Error::LeaseConflict(_))
        ));

        let (rec, _) = b.get().await.unwrap();
        assert_eq!(rec.holder_identity, "a");
        b.update(&record("b")).await.unwrap();

        // a never re-read, so its update must not clobber b
        assert!(matches!(
            a.update(&record("a")).await,
            Err(Error::LeaseConflict(_))
        ));
        let (rec, _) = a.get().await.unwrap();
        assert_eq!(rec.holder_identity, "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_lock_concurrent_updates_single_winner() {
        let dir = TempDir::new().unwrap();
        let a = Arc::new(FileLock::new(dir.path(), "sensor-gateway/default", "a").unwrap());
        let b = Arc::new(FileLock::new(dir.path(), "sensor-gateway/default", "b").unwrap());
        a.create(&record("")).await.unwrap();

        for _ in 0..50 {
            a.get().await.unwrap();
            b.get().await.unwrap();

            let (ra, rb) = tokio::join!(
                tokio::spawn({
                    let a = a.clone();
                    async move { a.update(&record("a")).await }
                }),
                tokio::spawn({
                    let b = b.clone();
                    async move { b.update(&record("b")).await }
                }),
            );
            let (ra, rb) = (ra.unwrap(), rb.unwrap());
            assert!(ra.is_ok() != rb.is_ok(), "exactly one update wins");

            let winner = if ra.is_ok() { "a" } else { "b" };
            let (rec, _) = a.get().await.unwrap();
            assert_eq!(rec.holder_identity, winner);
        }
        assert!(!a.path().with_extension("lease.guard").exists());
    }

    #[tokio::test]
    async fn test_file_lock_stale_guard_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let a = FileLock::new(dir.path(), "sensor-gateway/default", "a").unwrap();
        a.create(&record("a")).await.unwrap();

        let guard = a.path().with_extension("lease.guard");
        let file = std::fs::File::create(&guard).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        a.get().await.unwrap();
        a.update(&record("a")).await.unwrap();
        assert!(!guard.exists());
    }
}
