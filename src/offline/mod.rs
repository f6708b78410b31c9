//! Per-folder offline store
//!
//! Each folder keeps its cached bodies in one append-mostly file. A body is
//! addressed by its store token (byte offset) and length, which the message
//! layer records on the message. Three locks guard a store:
//!
//! - the writer lock serialises appends and is held for a whole compaction;
//! - the file lock lets readers share the file while compaction swaps it;
//! - the folder semaphore is an exclusive owner token for long structural
//!   operations, during which appends are skipped rather than queued.
//!
//! Every rewrite of the file (compaction, reset) bumps the store generation
//! while the file lock is held exclusively. A location looked up under an
//! older generation is refused by [`OfflineStore::read_at`] instead of being
//! read against the new file.

pub mod compact;
pub mod semaphore;

pub use compact::{CompactionGuard, CompactionResult};
pub use semaphore::{SemaphoreGuard, SemaphoreHolder};

use crate::folder::FolderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Offline store errors
#[derive(Error, Debug)]
pub enum OfflineStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Offline store of folder {folder} is held by '{owner}' ({reason})")]
    Locked {
        folder: FolderId,
        owner: String,
        reason: String,
    },

    #[error("Semaphore of folder {folder} is not held by '{owner}'")]
    NotHolder { folder: FolderId, owner: String },

    #[error("Offline store of folder {folder} was rewritten since generation {generation}")]
    Relocated { folder: FolderId, generation: u64 },

    #[error("Store token {token} (+{length}) lies outside the {file_size} byte store")]
    OutOfRange {
        token: u64,
        length: u64,
        file_size: u64,
    },
}

pub type OfflineResult<T> = Result<T, OfflineStoreError>;

/// Where a body lives inside a store file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub token: u64,
    pub length: u64,
}

/// Size and recency reported to the eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetrics {
    pub size: u64,
    pub last_use: DateTime<Utc>,
}

/// Offline body cache of a single folder
pub struct OfflineStore {
    folder: FolderId,
    path: PathBuf,
    writer: Arc<Mutex<()>>,
    file: Arc<RwLock<()>>,
    generation: AtomicU64,
    compacting: AtomicBool,
    semaphore: std::sync::Mutex<Option<SemaphoreHolder>>,
    metrics: std::sync::Mutex<StoreMetrics>,
}

impl std::fmt::Debug for OfflineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineStore")
            .field("folder", &self.folder)
            .field("path", &self.path)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl OfflineStore {
    /// Open the store at `path`, creating its directory if needed
    pub async fn open(folder: FolderId, path: PathBuf) -> OfflineResult<Self> {
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        let size = match async_fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        debug!("Opened offline store for folder {} at {} ({} bytes)", folder, path.display(), size);

        Ok(Self {
            folder,
            path,
            writer: Arc::new(Mutex::new(())),
            file: Arc::new(RwLock::new(())),
            generation: AtomicU64::new(0),
            compacting: AtomicBool::new(false),
            semaphore: std::sync::Mutex::new(None),
            metrics: std::sync::Mutex::new(StoreMetrics {
                size,
                last_use: Utc::now(),
            }),
        })
    }

    pub fn folder(&self) -> FolderId {
        self.folder
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn metrics_lock(&self) -> MutexGuard<'_, StoreMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> StoreMetrics {
        *self.metrics_lock()
    }

    /// Current size of the store file in bytes
    pub fn size(&self) -> u64 {
        self.metrics_lock().size
    }

    pub fn last_use(&self) -> DateTime<Utc> {
        self.metrics_lock().last_use
    }

    pub fn touch(&self) {
        self.metrics_lock().last_use = Utc::now();
    }

    fn set_size(&self, size: u64) {
        let mut metrics = self.metrics_lock();
        metrics.size = size;
        metrics.last_use = Utc::now();
    }

    /// Counter bumped each time the file is rewritten
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Must be called with the file lock held exclusively
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    /// Whether an append would currently be accepted
    pub fn is_writable(&self) -> bool {
        !self.is_compacting() && !self.is_locked()
    }

    /// Append a body unless the store is being compacted or its semaphore is
    /// held. `Ok(None)` means the write was skipped.
    pub async fn try_append(&self, data: &[u8]) -> OfflineResult<Option<StoreLocation>> {
        if !self.is_writable() {
            debug!("Skipping offline write for folder {}: store is busy", self.folder);
            return Ok(None);
        }

        let _writer = self.writer.lock().await;
        if !self.is_writable() {
            debug!("Skipping offline write for folder {}: store became busy", self.folder);
            return Ok(None);
        }

        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let start = file.metadata().await?.len();

        match write_entry(&mut file, start, data).await {
            Ok((location, end)) => {
                self.set_size(end);
                Ok(Some(location))
            }
            Err(e) => {
                warn!("Offline write to {} failed, rolling back: {}", self.path.display(), e);
                if let Err(truncate) = file.set_len(start).await {
                    error!("Failed to roll back {}: {}", self.path.display(), truncate);
                }
                Err(e.into())
            }
        }
    }

    /// Read a cached body. Errors mean the cached copy cannot be trusted.
    pub async fn read(&self, location: StoreLocation) -> OfflineResult<Vec<u8>> {
        let _file = self.file.read().await;
        self.read_locked(location).await
    }

    /// Read a body whose location was looked up while the store was at
    /// `generation`. [`OfflineStoreError::Relocated`] means the location is
    /// stale and should be looked up again; the cached copy itself is fine.
    pub async fn read_at(&self, location: StoreLocation, generation: u64) -> OfflineResult<Vec<u8>> {
        let _file = self.file.read().await;
        if self.generation() != generation {
            return Err(OfflineStoreError::Relocated {
                folder: self.folder,
                generation,
            });
        }
        self.read_locked(location).await
    }

    async fn read_locked(&self, location: StoreLocation) -> OfflineResult<Vec<u8>> {
        let mut file = async_fs::File::open(&self.path).await?;
        let file_size = file.metadata().await?.len();

        let in_range = location
            .token
            .checked_add(location.length)
            .map_or(false, |end| end <= file_size);
        if !in_range {
            return Err(OfflineStoreError::OutOfRange {
                token: location.token,
                length: location.length,
                file_size,
            });
        }

        file.seek(SeekFrom::Start(location.token)).await?;
        let mut body = vec![0u8; location.length as usize];
        file.read_exact(&mut body).await?;

        self.touch();
        Ok(body)
    }

    /// Empty the store, e.g. after the folder's UIDVALIDITY changed
    pub async fn reset(&self) -> OfflineResult<()> {
        let _writer = self.writer.lock().await;
        self.reset_locked().await
    }

    /// Empty the store unless an append, compaction or semaphore holder is
    /// using it. Returns whether the store was reset.
    pub async fn try_reset(&self) -> OfflineResult<bool> {
        if self.is_locked() {
            return Ok(false);
        }
        let Ok(_writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        self.reset_locked().await?;
        Ok(true)
    }

    async fn reset_locked(&self) -> OfflineResult<()> {
        let _file = self.file.write().await;
        match async_fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.bump_generation();
        self.set_size(0);
        info!("Reset offline store for folder {}", self.folder);
        Ok(())
    }
}

async fn write_entry(
    file: &mut async_fs::File,
    start: u64,
    data: &[u8],
) -> io::Result<(StoreLocation, u64)> {
    let mut offset = start;
    if start > 0 {
        file.seek(SeekFrom::Start(start - 1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] != b'\n' {
            file.write_all(b"\n").await?;
            offset += 1;
        }
    }

    file.write_all(data).await?;
    let mut end = offset + data.len() as u64;
    if !data.ends_with(b"\n") {
        file.write_all(b"\n").await?;
        end += 1;
    }
    file.flush().await?;
    file.sync_data().await?;

    Ok((
        StoreLocation {
            token: offset,
            length: data.len() as u64,
        },
        end,
    ))
}

/// Open offline stores of one account, keyed by folder
#[derive(Debug)]
pub struct OfflineStores {
    dir: PathBuf,
    stores: Mutex<HashMap<FolderId, Arc<OfflineStore>>>,
}

impl OfflineStores {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, folder: FolderId) -> PathBuf {
        self.dir.join(format!("{}.store", folder.0))
    }

    pub async fn open(&self, folder: FolderId) -> OfflineResult<Arc<OfflineStore>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&folder) {
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(OfflineStore::open(folder, self.path_for(folder)).await?);
        stores.insert(folder, Arc::clone(&store));
        Ok(store)
    }

    pub async fn get(&self, folder: FolderId) -> Option<Arc<OfflineStore>> {
        self.stores.lock().await.get(&folder).cloned()
    }

    pub async fn open_stores(&self) -> Vec<Arc<OfflineStore>> {
        self.stores.lock().await.values().cloned().collect()
    }

    /// Forget a deleted folder's store and remove its file
    pub async fn remove(&self, folder: FolderId) -> OfflineResult<()> {
        let store = self.stores.lock().await.remove(&folder);
        match store {
            Some(store) => store.reset().await,
            None => match async_fs::remove_file(self.path_for(folder)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}
