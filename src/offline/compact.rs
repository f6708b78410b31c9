//! Store compaction
//!
//! Compaction runs in two steps so callers can act while the store is held:
//! [`OfflineStore::begin_compaction`] takes the writer lock, and
//! [`CompactionGuard::run`] copies the live bodies into a fresh file and swaps
//! it in. Reads keep working against the old file until the swap. Appends
//! attempted in between are skipped.
//!
//! After the swap the guard keeps the file lock exclusively, so no reader can
//! use a pre-compaction location until the caller has recorded the new ones
//! and dropped the guard. Dropping it bumps the store generation.

use super::{OfflineResult, OfflineStore, OfflineStoreError, StoreLocation};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockWriteGuard};
use tracing::{info, warn};

/// Outcome of one compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// New location of every body that was copied
    pub locations: BTreeMap<u32, StoreLocation>,
    /// UIDs whose recorded location was no longer readable
    pub missing: Vec<u32>,
    pub size_before: u64,
    pub size_after: u64,
}

impl CompactionResult {
    pub fn reclaimed(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

/// Exclusive hold on a store's write path for the duration of a compaction
#[derive(Debug)]
pub struct CompactionGuard {
    store: Arc<OfflineStore>,
    _writer: OwnedMutexGuard<()>,
    swapped: Option<OwnedRwLockWriteGuard<()>>,
}

impl OfflineStore {
    /// Stop new appends and wait for any in-flight append to finish
    pub async fn begin_compaction(self: &Arc<Self>) -> OfflineResult<CompactionGuard> {
        if let Some(holder) = self.semaphore_holder() {
            return Err(OfflineStoreError::Locked {
                folder: self.folder,
                owner: holder.owner,
                reason: holder.reason,
            });
        }

        let writer = Arc::clone(&self.writer).lock_owned().await;
        self.compacting.store(true, Ordering::SeqCst);

        Ok(CompactionGuard {
            store: Arc::clone(self),
            _writer: writer,
            swapped: None,
        })
    }
}

impl CompactionGuard {
    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    /// Rewrite the store keeping only `live` bodies.
    ///
    /// The caller must record the returned locations before dropping the guard.
    /// Reads of this store wait until then.
    pub async fn run(&mut self, live: &BTreeMap<u32, StoreLocation>) -> OfflineResult<CompactionResult> {
        let store = Arc::clone(&self.store);
        let temp = store.path.with_extension("compact");

        let result = match copy_live(&store.path, &temp, live).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(cleanup) = async_fs::remove_file(&temp).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {}", temp.display(), cleanup);
                    }
                }
                return Err(e.into());
            }
        };

        let mut result = result;
        result.size_before = store.size();

        let file = Arc::clone(&store.file).write_owned().await;
        if temp.exists() {
            async_fs::rename(&temp, &store.path).await?;
        }
        self.swapped = Some(file);
        store.set_size(result.size_after);

        info!(
            "Compacted offline store of folder {}: {} -> {} bytes, {} bodies kept",
            store.folder,
            result.size_before,
            result.size_after,
            result.locations.len()
        );
        Ok(result)
    }
}

impl Drop for CompactionGuard {
    fn drop(&mut self) {
        if self.swapped.is_some() {
            self.store.bump_generation();
        }
        self.store.compacting.store(false, Ordering::SeqCst);
    }
}

async fn copy_live(
    source_path: &std::path::Path,
    temp: &std::path::Path,
    live: &BTreeMap<u32, StoreLocation>,
) -> io::Result<CompactionResult> {
    let mut result = CompactionResult::default();

    let mut source = match async_fs::File::open(source_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            result.missing = live.keys().copied().collect();
            return Ok(result);
        }
        Err(e) => return Err(e),
    };
    let file_size = source.metadata().await?.len();

    let mut ordered: Vec<(u32, StoreLocation)> = live.iter().map(|(uid, loc)| (*uid, *loc)).collect();
    ordered.sort_by_key(|(_, loc)| loc.token);

    let mut out = async_fs::File::create(temp).await?;
    let mut offset = 0u64;

    for (uid, location) in ordered {
        let readable = location
            .token
            .checked_add(location.length)
            .map_or(false, |end| end <= file_size);
        if !readable {
            result.missing.push(uid);
            continue;
        }

        source.seek(SeekFrom::Start(location.token)).await?;
        let mut body = vec![0u8; location.length as usize];
        source.read_exact(&mut body).await?;

        out.write_all(&body).await?;
        result.locations.insert(
            uid,
            StoreLocation {
                token: offset,
                length: location.length,
            },
        );
        offset += location.length;
        if !body.ends_with(b"\n") {
            out.write_all(b"\n").await?;
            offset += 1;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    result.size_after = offset;
    Ok(result)
}
