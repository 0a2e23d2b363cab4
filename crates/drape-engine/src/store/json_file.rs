use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use drape_contracts::{JobRecord, LedgerTransaction, NewTransaction, QualityTier, TransactionKind};
use fs2::FileExt;
use tempfile::NamedTempFile;

use super::{JobStore, LedgerStore, StoreDocument, StoreError};

/// Store backed by a single JSON document on disk.
///
/// Every operation holds an OS-level lock on a sidecar `<name>.lock` file:
/// shared for reads, exclusive for read-modify-write. Separate processes (or
/// separate handles) on the same document are serialized by that lock.
/// Writes stage through a uniquely named temp file in the same directory and
/// are renamed over the document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Held for the duration of one store operation.
struct DocumentLock {
    file: File,
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "store".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self, mode: LockMode) -> Result<DocumentLock, StoreError> {
        let lock_path = self.lock_path.clone();
        // flock blocks the calling thread
        tokio::task::spawn_blocking(move || acquire_lock(&lock_path, mode))
            .await
            .map_err(|err| StoreError::Unavailable(format!("lock task failed: {err}")))?
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> Result<T, StoreError> {
        let _lock = self.lock(LockMode::Shared).await?;
        let document = read_document(&self.path).await?;
        Ok(f(&document))
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut document = read_document(&self.path).await?;
        let value = f(&mut document)?;
        write_document(&self.path, &document).await?;
        Ok(value)
    }
}

fn acquire_lock(lock_path: &Path, mode: LockMode) -> Result<DocumentLock, StoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    match mode {
        LockMode::Shared => FileExt::lock_shared(&file)?,
        LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
    }
    Ok(DocumentLock { file })
}

async fn read_document(path: &Path) -> Result<StoreDocument, StoreError> {
    match tokio::fs::read(path).await {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(StoreDocument::default()),
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(err) => Err(err.into()),
    }
}

async fn write_document(path: &Path, document: &StoreDocument) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(document)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist_document(&path, &bytes))
        .await
        .map_err(|err| StoreError::Unavailable(format!("write task failed: {err}")))?
}

fn persist_document(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut staged = NamedTempFile::new_in(&parent)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn open_account(&self, identity: &str, initial_balance: u64) -> Result<u64, StoreError> {
        self.mutate(|doc| Ok(doc.open_account(identity, initial_balance)))
            .await
    }

    async fn balance(&self, identity: &str) -> Result<u64, StoreError> {
        self.read(|doc| doc.balance(identity)).await
    }

    async fn apply(&self, entry: NewTransaction) -> Result<LedgerTransaction, StoreError> {
        self.mutate(|doc| doc.apply(entry)).await
    }

    async fn find_transaction(
        &self,
        job_id: &str,
        kind: TransactionKind,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        self.read(|doc| doc.find_transaction(job_id, kind).cloned())
            .await
    }

    async fn transactions(&self, identity: &str) -> Result<Vec<LedgerTransaction>, StoreError> {
        self.read(|doc| doc.transactions(identity)).await
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.mutate(|doc| doc.insert_job(record)).await
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.mutate(|doc| doc.update_job(record)).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.read(|doc| doc.get_job(job_id)).await
    }

    async fn jobs_for(&self, identity: &str) -> Result<Vec<JobRecord>, StoreError> {
        self.read(|doc| doc.jobs_for(identity)).await
    }

    async fn find_cached(
        &self,
        identity: &str,
        cache_key: &str,
        tier: QualityTier,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.read(|doc| doc.find_cached(identity, cache_key, tier))
            .await
    }
}
