use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use courier_common::internal;
use serde::Deserialize;
use tokio::fs;

use crate::{
    QueueItem, QueueItemId, QueueStatus, QueueStore, Result, StoreError,
    store::{is_purgeable, is_stale, mark_recovered},
};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

mod defaults {
    use std::time::Duration;

    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
    pub const STALE_LOCK_AGE: Duration = Duration::from_secs(60);
}

/// One bincode file per queue item.
///
/// - Records: `{id}.bin`
/// - Locks: `{id}.lock`, created with `create_new` so that exactly one
///   holder exists across every process sharing the directory
/// - Writes go to `.tmp_{id}.bin` and are renamed into place, so a reader
///   never sees a partial record
///
/// Each conditional mutation takes the record lock, re-reads the record,
/// checks its condition and writes, then releases the lock. Locks older than
/// a minute are assumed to belong to a crashed process and are broken.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
    lock_timeout: Duration,
    stale_lock_age: Duration,
}

impl Default for FileQueueStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/courier/queue"),
            lock_timeout: defaults::LOCK_TIMEOUT,
            stale_lock_age: defaults::STALE_LOCK_AGE,
        }
    }
}

impl<'de> Deserialize<'de> for FileQueueStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileQueueStoreHelper {
            path: PathBuf,
        }

        let helper = FileQueueStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            ..Self::default()
        })
    }
}

/// Removes the lock file when dropped, including on early returns.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), %err, "Failed to release queue lock");
        }
    }
}

impl FileQueueStore {
    /// Reject relative paths, `..` components and system directories.
    fn validate_path(path: &Path) -> Result<()> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(StoreError::Validation(format!(
                "Queue path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(StoreError::Validation(format!(
                "Queue path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];
        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(StoreError::Validation(format!(
                "Queue path cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileQueueStoreBuilder {
        FileQueueStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed and clear leftovers from a crash:
    /// temporary files and stale locks.
    pub fn init(&self) -> Result<()> {
        internal!("Initialising queue store at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(StoreError::Validation(format!(
                "Expected {} to be a directory",
                self.path.display()
            )));
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let leftover = name.starts_with(".tmp_") || name.ends_with(".deleted");
            let stale_lock = name.ends_with(".lock") && self.is_stale_lock(&entry.path());
            if leftover || stale_lock {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} leftover files from the queue store"
            );
        }

        Ok(())
    }

    fn record_path(&self, id: &QueueItemId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    fn is_stale_lock(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.stale_lock_age)
    }

    async fn lock(&self, id: &QueueItemId) -> Result<LockGuard> {
        let path = self.path.join(format!("{id}.lock"));
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale_lock(&path) {
                        tracing::warn!(%id, "Breaking stale queue lock");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::Lock(id.clone()));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn read(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        let bytes = match fs::read(self.record_path(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let (item, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(item))
    }

    async fn write(&self, item: &QueueItem) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())?;
        let temp = self.path.join(format!(".tmp_{}.bin", item.id));

        fs::write(&temp, &bytes).await?;
        fs::rename(&temp, self.record_path(&item.id)).await?;
        Ok(())
    }

    async fn remove(&self, id: &QueueItemId) -> Result<bool> {
        let path = self.record_path(id);
        let deleted = self.path.join(format!("{id}.bin.deleted"));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        fs::remove_file(&deleted).await?;
        Ok(true)
    }

    async fn ids(&self) -> Result<Vec<QueueItemId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = QueueItemId::from_filename(&name.to_string_lossy()) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Read every record, skipping ones that vanish or fail to decode.
    async fn scan(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();
        for id in self.ids().await? {
            match self.read(&id).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(err) => tracing::warn!(%id, %err, "Skipping unreadable queue record"),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    #[tracing::instrument(level = "debug", skip_all, fields(id = %item.id))]
    async fn insert(&self, item: &QueueItem) -> Result<()> {
        let _lock = self.lock(&item.id).await?;
        if fs::try_exists(self.record_path(&item.id)).await? {
            return Err(StoreError::AlreadyExists(item.id.clone()));
        }
        self.write(item).await
    }

    async fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        self.read(id).await
    }

    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
        let mut items = self.scan().await?;
        items.retain(|item| status.is_none_or(|s| item.status == s));
        Ok(items)
    }

    async fn fetch_ready(&self, now: SystemTime, limit: usize) -> Result<Vec<QueueItem>> {
        let mut ready = self.scan().await?;
        ready.retain(|item| item.is_ready(now));
        ready.sort_by(QueueItem::dispatch_order);
        ready.truncate(limit);
        Ok(ready)
    }

    #[tracing::instrument(level = "debug", skip(self, now))]
    async fn claim(&self, id: &QueueItemId, now: SystemTime) -> Result<Option<QueueItem>> {
        let _lock = self.lock(id).await?;
        let Some(mut item) = self.read(id).await? else {
            return Ok(None);
        };

        if !item.is_ready(now) {
            return Ok(None);
        }

        item.mark_claimed(now);
        self.write(&item).await?;
        Ok(Some(item))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %item.id, status = %item.status))]
    async fn update(&self, item: &QueueItem) -> Result<Option<QueueItem>> {
        let _lock = self.lock(&item.id).await?;
        let Some(stored) = self.read(&item.id).await? else {
            return Err(StoreError::NotFound(item.id.clone()));
        };

        if stored.version != item.version {
            return Ok(None);
        }

        let mut next = item.clone();
        next.version += 1;
        self.write(&next).await?;
        Ok(Some(next))
    }

    async fn delete(&self, id: &QueueItemId) -> Result<bool> {
        let _lock = self.lock(id).await?;
        self.remove(id).await
    }

    async fn purge(
        &self,
        completed_before: SystemTime,
        failed_before: SystemTime,
    ) -> Result<usize> {
        let mut purged = 0;
        for candidate in self.scan().await? {
            if !is_purgeable(&candidate, completed_before, failed_before) {
                continue;
            }

            let _lock = self.lock(&candidate.id).await?;
            let still_purgeable = self
                .read(&candidate.id)
                .await?
                .is_some_and(|item| is_purgeable(&item, completed_before, failed_before));
            if still_purgeable && self.remove(&candidate.id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn reset_stale(
        &self,
        started_before: SystemTime,
        now: SystemTime,
        skip: &[QueueItemId],
    ) -> Result<Vec<QueueItem>> {
        let mut reset = Vec::new();
        for candidate in self.scan().await? {
            if !is_stale(&candidate, started_before, skip) {
                continue;
            }

            let _lock = self.lock(&candidate.id).await?;
            if let Some(mut item) = self.read(&candidate.id).await?
                && is_stale(&item, started_before, skip)
            {
                mark_recovered(&mut item, now);
                self.write(&item).await?;
                reset.push(item);
            }
        }
        Ok(reset)
    }
}

#[derive(Debug)]
pub struct FileQueueStoreBuilder {
    path: PathBuf,
    lock_timeout: Duration,
    stale_lock_age: Duration,
}

impl Default for FileQueueStoreBuilder {
    fn default() -> Self {
        let defaults = FileQueueStore::default();
        Self {
            path: defaults.path,
            lock_timeout: defaults.lock_timeout,
            stale_lock_age: defaults.stale_lock_age,
        }
    }
}

impl FileQueueStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn stale_lock_age(mut self, age: Duration) -> Self {
        self.stale_lock_age = age;
        self
    }

    pub fn build(self) -> Result<FileQueueStore> {
        FileQueueStore::validate_path(&self.path)?;
        Ok(FileQueueStore {
            path: self.path,
            lock_timeout: self.lock_timeout,
            stale_lock_age: self.stale_lock_age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dangerous_paths() {
        for path in ["relative/queue", "/var/../etc/queue", "/etc/courier", "/proc/queue"] {
            assert!(
                FileQueueStore::builder().path(path.into()).build().is_err(),
                "{path} should be rejected"
            );
        }
        assert!(
            FileQueueStore::builder()
                .path("/var/spool/courier".into())
                .build()
                .is_ok()
        );
    }

    #[test]
    fn deserialize_validates() {
        let ok: std::result::Result<FileQueueStore, _> =
            ron::from_str(r#"(path: "/var/spool/courier/queue")"#);
        assert!(ok.is_ok());

        let bad: std::result::Result<FileQueueStore, _> = ron::from_str(r#"(path: "/etc/queue")"#);
        assert!(bad.is_err());
    }

    #[test]
    fn init_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".tmp_x.bin"), b"partial").unwrap();
        std::fs::write(dir.path().join("y.bin.deleted"), b"gone").unwrap();

        let store = FileQueueStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .unwrap();
        store.init().unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn records_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .unwrap();
        store.init().unwrap();

        let item = QueueItem::new("m1", "a@example.com", 3, 5);
        store.insert(&item).await.unwrap();

        let reopened = FileQueueStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .unwrap();
        assert_eq!(reopened.get(&item.id).await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::builder()
            .path(dir.path().to_path_buf())
            .lock_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        store.init().unwrap();

        let item = QueueItem::new("m1", "a@example.com", 0, 5);
        store.insert(&item).await.unwrap();

        let _held = store.lock(&item.id).await.unwrap();
        assert!(matches!(
            store.claim(&item.id, SystemTime::now()).await,
            Err(StoreError::Lock(_))
        ));
    }
}
