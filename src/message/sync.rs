//! Message synchronisation
//!
//! [`MessageSyncEngine`] keeps the per-folder message sets of one account in
//! step with the server and fills the offline stores. Bodies are fetched at
//! most once per account: before downloading, the engine looks the message up
//! by [`MessageKey`] in an index of bodies already cached in any folder, and
//! serves other folders' references from that copy.
//!
//! Open folder databases are cached in memory and can be closed by the idle
//! eviction policy; every change is written through to the database first.

use super::{parse_literal_length, LocalMessage, MessageError, MessageKey, MessageResult, MessageSet, UpsertOutcome};
use crate::config::SyncConfig;
use crate::database::{DatabaseError, SyncDatabase};
use crate::folder::{FolderError, FolderId};
use crate::offline::{CompactionGuard, OfflineStore, OfflineStoreError, OfflineStores, StoreLocation};
use crate::remote::{MessageSource, RemoteBody, RemoteError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sync engine errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Folder error: {0}")]
    Folder(#[from] FolderError),

    #[error("Offline store error: {0}")]
    Offline(#[from] OfflineStoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid message data: {0}")]
    Message(#[from] MessageError),

    #[error("Folder {0} has no remote counterpart")]
    FolderNotRegistered(FolderId),

    #[error("Message {uid} not found in folder {folder}")]
    MessageNotFound { folder: FolderId, uid: u32 },

    #[error("Message {uid} of folder {folder} is not available offline")]
    NotCached { folder: FolderId, uid: u32 },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether the next explicit request may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_recoverable(),
            SyncError::Cancelled | SyncError::Offline(_) => true,
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Engine tunables taken from [`SyncConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub fetch_bodies: bool,
    pub max_literal_size: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            fetch_bodies: config.fetch_bodies,
            max_literal_size: config.max_literal_size,
        }
    }
}

/// How [`MessageSyncEngine::stream_message`] may obtain a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Only serve bodies already cached in this or another folder
    LocalOnly,
    /// Serve from cache when possible, otherwise download
    PreferLocal,
}

/// Where a streamed body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySource {
    /// Offline store of the given folder
    Offline(FolderId),
    /// Downloaded; `persisted` tells whether it was added to the store
    Remote { persisted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedMessage {
    pub data: Vec<u8>,
    pub source: BodySource,
}

/// Result of copying a message between folders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub message: LocalMessage,
    pub body_copied: bool,
}

/// Per-folder counters of one message sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSyncReport {
    pub folder: Option<FolderId>,
    pub added: usize,
    pub updated: usize,
    pub expunged: usize,
    /// Messages ignored because their summary could not be parsed
    pub skipped: usize,
    pub bodies_fetched: usize,
    /// Bodies left to a copy already cached in another folder
    pub bodies_shared: usize,
    /// Bodies not stored (invalid literal, too large, store busy)
    pub bodies_skipped: usize,
    pub uid_validity_reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub folder: FolderId,
    pub size_before: u64,
    pub size_after: u64,
    pub kept: usize,
    pub dropped: usize,
}

/// What the eviction policy needs to know about one open folder database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDatabaseInfo {
    pub folder: FolderId,
    pub size: u64,
    pub last_use: DateTime<Utc>,
    pub visible: bool,
    /// False once the folder no longer exists in the account's tree
    pub open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedBody {
    folder: FolderId,
    uid: u32,
    location: StoreLocation,
}

struct OpenFolder {
    messages: Mutex<MessageSet>,
    visible: AtomicBool,
    last_use: std::sync::Mutex<DateTime<Utc>>,
}

impl OpenFolder {
    fn new(messages: MessageSet) -> Self {
        Self {
            messages: Mutex::new(messages),
            visible: AtomicBool::new(false),
            last_use: std::sync::Mutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_use.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn last_use(&self) -> DateTime<Utc> {
        *self.last_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reservation of message keys whose body is being downloaded
struct InFlight<'a> {
    set: &'a std::sync::Mutex<HashSet<MessageKey>>,
    keys: Vec<MessageKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            set.remove(key);
        }
    }
}

/// Message and body synchronisation for one account
pub struct MessageSyncEngine {
    account_id: String,
    remote: Arc<dyn MessageSource>,
    database: SyncDatabase,
    stores: Arc<OfflineStores>,
    options: EngineOptions,
    open: Mutex<HashMap<FolderId, Arc<OpenFolder>>>,
    remote_ids: std::sync::Mutex<HashMap<FolderId, String>>,
    cached: std::sync::Mutex<HashMap<MessageKey, CachedBody>>,
    in_flight: std::sync::Mutex<HashSet<MessageKey>>,
}

impl MessageSyncEngine {
    pub fn new(
        account_id: &str,
        remote: Arc<dyn MessageSource>,
        database: SyncDatabase,
        stores: Arc<OfflineStores>,
        options: EngineOptions,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            remote,
            database,
            stores,
            options,
            open: Mutex::new(HashMap::new()),
            remote_ids: std::sync::Mutex::new(HashMap::new()),
            cached: std::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn stores(&self) -> &Arc<OfflineStores> {
        &self.stores
    }

    /// Rebuild the cross-folder body index from the database
    pub async fn load_offline_index(&self) -> SyncResult<usize> {
        let messages = self.database.offline_messages(&self.account_id).await?;
        for (folder, message) in &messages {
            self.index_message(*folder, message);
        }
        debug!("Indexed {} offline bodies for account {}", messages.len(), self.account_id);
        Ok(messages.len())
    }

    fn remote_id_lock(&self) -> MutexGuard<'_, HashMap<FolderId, String>> {
        self.remote_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_lock(&self) -> MutexGuard<'_, HashMap<MessageKey, CachedBody>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the server id of a local folder
    pub fn register_folder(&self, folder: FolderId, remote_id: &str) {
        self.remote_id_lock().insert(folder, remote_id.to_string());
    }

    pub fn remote_id(&self, folder: FolderId) -> Option<String> {
        self.remote_id_lock().get(&folder).cloned()
    }

    fn index_message(&self, folder: FolderId, message: &LocalMessage) {
        let Some(location) = message.location() else {
            return;
        };
        let mut cached = self.cached_lock();
        for key in message.keys() {
            cached.entry(key).or_insert(CachedBody {
                folder,
                uid: message.uid,
                location,
            });
        }
    }

    fn unindex_message(&self, folder: FolderId, uid: u32) {
        self.cached_lock()
            .retain(|_, body| !(body.folder == folder && body.uid == uid));
    }

    fn unindex_folder(&self, folder: FolderId) {
        self.cached_lock().retain(|_, body| body.folder != folder);
    }

    fn relocate(&self, folder: FolderId, uid: u32, location: StoreLocation) {
        for body in self.cached_lock().values_mut() {
            if body.folder == folder && body.uid == uid {
                body.location = location;
            }
        }
    }

    /// A cached copy of the message held under a different folder/UID
    fn shared_copy(&self, keys: &[MessageKey], folder: FolderId, uid: u32) -> Option<CachedBody> {
        let cached = self.cached_lock();
        keys.iter()
            .filter_map(|key| cached.get(key))
            .find(|body| !(body.folder == folder && body.uid == uid))
            .copied()
    }

    /// Claim the download of a body; `None` if another task is fetching it
    fn reserve(&self, keys: &[MessageKey]) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.iter().any(|key| set.contains(key)) {
            return None;
        }
        set.extend(keys.iter().cloned());
        Some(InFlight {
            set: &self.in_flight,
            keys: keys.to_vec(),
        })
    }

    async fn open_folder(&self, folder: FolderId) -> SyncResult<Arc<OpenFolder>> {
        let mut open = self.open.lock().await;
        if let Some(state) = open.get(&folder) {
            state.touch();
            return Ok(Arc::clone(state));
        }

        let messages = self
            .database
            .load_folder_messages(&self.account_id, folder)
            .await?
            .unwrap_or_default();
        debug!("Opened message database of folder {} ({} messages)", folder, messages.len());

        let state = Arc::new(OpenFolder::new(messages));
        open.insert(folder, Arc::clone(&state));
        Ok(state)
    }

    /// Replace everything stored for the folder
    async fn persist(&self, folder: FolderId, messages: &MessageSet) -> SyncResult<()> {
        self.database
            .save_folder_messages(&self.account_id, folder, messages)
            .await?;
        Ok(())
    }

    /// Write the given UIDs through to the database and drop `removed`
    async fn persist_changes(
        &self,
        folder: FolderId,
        messages: &MessageSet,
        changed: &[u32],
        removed: &[u32],
    ) -> SyncResult<()> {
        let changed: Vec<&LocalMessage> = changed.iter().filter_map(|uid| messages.get(*uid)).collect();
        self.database
            .update_folder_messages(&self.account_id, folder, messages, &changed, removed)
            .await?;
        Ok(())
    }

    fn validate_body(&self, body: &RemoteBody) -> MessageResult<()> {
        let declared = parse_literal_length(&body.declared_length)?;
        if declared > self.options.max_literal_size {
            return Err(MessageError::LiteralTooLarge {
                size: declared,
                max: self.options.max_literal_size,
            });
        }
        let actual = body.data.len() as u64;
        if declared != actual {
            return Err(MessageError::LiteralLengthMismatch { declared, actual });
        }
        Ok(())
    }

    /// Bring one folder's messages in line with the server
    pub async fn sync_folder(&self, folder: FolderId, remote_id: &str) -> SyncResult<FolderSyncReport> {
        self.register_folder(folder, remote_id);
        let state = self.open_folder(folder).await?;
        let store = self.stores.open(folder).await?;
        let listing = self.remote.fetch_summaries(remote_id).await?;

        let mut report = FolderSyncReport {
            folder: Some(folder),
            ..Default::default()
        };

        let wanted: Vec<(u32, Vec<MessageKey>, Option<u64>)> = {
            let mut messages = state.messages.lock().await;

            if messages.uid_validity != listing.uid_validity {
                if messages.uid_validity != 0 {
                    info!(
                        "UIDVALIDITY of folder {} changed from {} to {}, resetting",
                        folder, messages.uid_validity, listing.uid_validity
                    );
                    report.uid_validity_reset = true;
                    self.unindex_folder(folder);
                    if !store.try_reset().await? {
                        debug!("Store of folder {} is busy, stale bodies left for compaction", folder);
                    }
                }
                messages.reset(listing.uid_validity);
            }

            let mut present = HashSet::with_capacity(listing.messages.len());
            let mut changed = Vec::new();
            let mut removed = Vec::new();
            for remote in &listing.messages {
                present.insert(remote.uid);
                match messages.upsert(remote) {
                    Ok(UpsertOutcome::Added) => {
                        report.added += 1;
                        changed.push(remote.uid);
                    }
                    Ok(UpsertOutcome::Updated) => {
                        report.updated += 1;
                        changed.push(remote.uid);
                    }
                    Ok(UpsertOutcome::Unchanged) => {}
                    Err(e) => {
                        warn!("Skipping message {} in folder {}: {}", remote.uid, folder, e);
                        report.skipped += 1;
                    }
                }
            }

            for gone in messages.expunge_missing(&present) {
                self.unindex_message(folder, gone.uid);
                removed.push(gone.uid);
                report.expunged += 1;
            }

            if report.uid_validity_reset {
                self.persist(folder, &messages).await?;
            } else {
                self.persist_changes(folder, &messages, &changed, &removed).await?;
            }

            if self.options.fetch_bodies {
                messages
                    .iter()
                    .filter(|m| !m.is_offline())
                    .map(|m| (m.uid, m.keys(), m.size))
                    .collect()
            } else {
                Vec::new()
            }
        };

        let mut stored: Vec<(u32, StoreLocation)> = Vec::new();
        // held until the stored bodies are indexed
        let mut reservations = Vec::new();
        let mut outcome: SyncResult<()> = Ok(());

        for (uid, keys, size) in wanted {
            if self.shared_copy(&keys, folder, uid).is_some() {
                debug!("Body of message {} in folder {} is cached elsewhere", uid, folder);
                report.bodies_shared += 1;
                continue;
            }
            if let Some(size) = size.filter(|size| *size > self.options.max_literal_size) {
                warn!(
                    "Skipping body of message {} in folder {}: {} bytes exceeds the limit",
                    uid, folder, size
                );
                report.bodies_skipped += 1;
                continue;
            }
            let Some(reservation) = self.reserve(&keys) else {
                report.bodies_shared += 1;
                continue;
            };
            reservations.push(reservation);

            match self.fetch_into_store(folder, remote_id, uid, &store).await {
                Ok(Some(location)) => {
                    stored.push((uid, location));
                    report.bodies_fetched += 1;
                }
                Ok(None) => report.bodies_skipped += 1,
                Err(SyncError::Message(e)) => {
                    warn!("Skipping body of message {} in folder {}: {}", uid, folder, e);
                    report.bodies_skipped += 1;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if !stored.is_empty() {
            let mut messages = state.messages.lock().await;
            let mut marked = Vec::with_capacity(stored.len());
            for (uid, location) in stored {
                if let Some(message) = messages.get_mut(uid) {
                    message.mark_offline(location);
                    let message = message.clone();
                    self.index_message(folder, &message);
                    marked.push(uid);
                }
            }
            self.persist_changes(folder, &messages, &marked, &[]).await?;
        }
        drop(reservations);
        outcome?;

        debug!("Synced folder {}: {:?}", folder, report);
        Ok(report)
    }

    /// Download one body and try to append it; `None` when nothing was stored
    async fn fetch_into_store(
        &self,
        folder: FolderId,
        remote_id: &str,
        uid: u32,
        store: &OfflineStore,
    ) -> SyncResult<Option<StoreLocation>> {
        let Some(body) = self.remote.fetch_body(remote_id, uid).await? else {
            debug!("Server returned no body for message {} in folder {}", uid, folder);
            return Ok(None);
        };
        self.validate_body(&body)?;
        Ok(store.try_append(&body.data).await?)
    }

    /// Read one message body for display.
    ///
    /// A failed read of this folder's own cached copy discards that copy and
    /// returns the error; the body is downloaded again on a later sync.
    pub async fn stream_message(&self, folder: FolderId, uid: u32, mode: StreamMode) -> SyncResult<StreamedMessage> {
        let state = self.open_folder(folder).await?;
        if let Some(data) = self.read_own(&state, folder, uid).await? {
            return Ok(StreamedMessage {
                data,
                source: BodySource::Offline(folder),
            });
        }

        let keys = state
            .messages
            .lock()
            .await
            .get(uid)
            .map(LocalMessage::keys)
            .ok_or(SyncError::MessageNotFound { folder, uid })?;
        if let Some((shared_folder, data)) = self.read_shared(&keys, folder, uid).await? {
            return Ok(StreamedMessage {
                data,
                source: BodySource::Offline(shared_folder),
            });
        }

        if mode == StreamMode::LocalOnly {
            return Err(SyncError::NotCached { folder, uid });
        }

        let remote_id = self.remote_id(folder).ok_or(SyncError::FolderNotRegistered(folder))?;
        let body = self
            .remote
            .fetch_body(&remote_id, uid)
            .await?
            .ok_or(SyncError::MessageNotFound { folder, uid })?;
        self.validate_body(&body)?;

        let store = self.stores.open(folder).await?;
        let mut persisted = false;
        if let Some(location) = store.try_append(&body.data).await? {
            let mut messages = state.messages.lock().await;
            if let Some(message) = messages.get_mut(uid) {
                message.mark_offline(location);
                let message = message.clone();
                self.index_message(folder, &message);
                self.persist_changes(folder, &messages, &[uid], &[]).await?;
                persisted = true;
            }
        }

        Ok(StreamedMessage {
            data: body.data,
            source: BodySource::Remote { persisted },
        })
    }

    /// Read the folder's own cached copy of `uid`; `Ok(None)` when it has none.
    ///
    /// The location is looked up after pinning the store generation, so a
    /// compaction finishing in between makes the read retry with the moved
    /// location. Any other read failure discards the copy.
    async fn read_own(&self, state: &OpenFolder, folder: FolderId, uid: u32) -> SyncResult<Option<Vec<u8>>> {
        let store = self.stores.open(folder).await?;
        loop {
            let generation = store.generation();
            let location = {
                let messages = state.messages.lock().await;
                messages
                    .get(uid)
                    .ok_or(SyncError::MessageNotFound { folder, uid })?
                    .location()
            };
            let Some(location) = location else {
                return Ok(None);
            };

            match store.read_at(location, generation).await {
                Ok(data) => return Ok(Some(data)),
                Err(OfflineStoreError::Relocated { .. }) => {
                    debug!("Store of folder {} was rewritten during a read, retrying", folder);
                }
                Err(e) => {
                    warn!("Offline copy of message {} in folder {} is unreadable: {}", uid, folder, e);
                    self.discard_offline(folder, uid).await?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Read a copy of the message cached under another folder or UID.
    /// An unreadable shared copy is discarded and `Ok(None)` returned.
    async fn read_shared(
        &self,
        keys: &[MessageKey],
        folder: FolderId,
        uid: u32,
    ) -> SyncResult<Option<(FolderId, Vec<u8>)>> {
        loop {
            let Some(candidate) = self.shared_copy(keys, folder, uid) else {
                return Ok(None);
            };
            let store = self.stores.open(candidate.folder).await?;
            let generation = store.generation();
            let Some(shared) = self.shared_copy(keys, folder, uid) else {
                return Ok(None);
            };
            if shared.folder != candidate.folder {
                continue;
            }

            match store.read_at(shared.location, generation).await {
                Ok(data) => return Ok(Some((shared.folder, data))),
                Err(OfflineStoreError::Relocated { .. }) => {
                    debug!("Store of folder {} was rewritten during a read, retrying", shared.folder);
                }
                Err(e) => {
                    warn!("Shared copy in folder {} is unreadable: {}", shared.folder, e);
                    self.discard_offline(shared.folder, shared.uid).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// Forget the offline copy of a message so it is fetched again
    pub async fn discard_offline(&self, folder: FolderId, uid: u32) -> SyncResult<()> {
        let state = self.open_folder(folder).await?;
        let mut messages = state.messages.lock().await;
        if let Some(message) = messages.get_mut(uid) {
            if message.is_offline() {
                message.clear_offline();
                self.unindex_message(folder, uid);
                self.persist_changes(folder, &messages, &[uid], &[]).await?;
                info!("Discarded offline copy of message {} in folder {}", uid, folder);
            }
        }
        Ok(())
    }

    /// Copy a message's metadata to `dst` as `dst_uid`, with its body when the
    /// destination store accepts writes
    pub async fn copy_message(&self, src: FolderId, uid: u32, dst: FolderId, dst_uid: u32) -> SyncResult<CopyOutcome> {
        let source_state = self.open_folder(src).await?;
        let source = source_state
            .messages
            .lock()
            .await
            .get(uid)
            .cloned()
            .ok_or(SyncError::MessageNotFound { folder: src, uid })?;

        let mut copy = source.clone();
        copy.uid = dst_uid;
        copy.clear_offline();

        let mut body_copied = false;
        if source.is_offline() {
            let dst_store = self.stores.open(dst).await?;
            if dst_store.is_writable() {
                match self.read_own(&source_state, src, uid).await {
                    Ok(Some(data)) => {
                        if let Some(new_location) = dst_store.try_append(&data).await? {
                            copy.mark_offline(new_location);
                            body_copied = true;
                        }
                    }
                    Ok(None) => {}
                    Err(SyncError::Offline(e)) => {
                        debug!("Copying metadata of message {} only: {}", uid, e);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!("Store of folder {} is locked, copying metadata of message {} only", dst, uid);
            }
        }

        let state = self.open_folder(dst).await?;
        let mut messages = state.messages.lock().await;
        messages.insert(copy.clone());
        if body_copied {
            self.index_message(dst, &copy);
        }
        self.persist_changes(dst, &messages, &[dst_uid], &[]).await?;

        Ok(CopyOutcome {
            message: copy,
            body_copied,
        })
    }

    /// Move a message between folders, holding the source semaphore when free
    pub async fn move_message(&self, src: FolderId, uid: u32, dst: FolderId, dst_uid: u32) -> SyncResult<CopyOutcome> {
        let src_store = self.stores.open(src).await?;
        let owner = format!("move-{}", Uuid::new_v4());
        let _guard = match src_store.acquire_semaphore(&owner, "offline move") {
            Ok(guard) => Some(guard),
            Err(OfflineStoreError::Locked { owner, .. }) => {
                debug!("Source folder {} is held by '{}', moving without its semaphore", src, owner);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = self.copy_message(src, uid, dst, dst_uid).await?;

        let state = self.open_folder(src).await?;
        let mut messages = state.messages.lock().await;
        messages.remove(uid);
        self.unindex_message(src, uid);
        self.index_message(dst, &outcome.message);
        self.persist_changes(src, &messages, &[], &[uid]).await?;

        Ok(outcome)
    }

    /// Hold a folder's store for compaction; appends are skipped until
    /// [`finish_compaction`](Self::finish_compaction)
    pub async fn begin_compaction(&self, folder: FolderId) -> SyncResult<CompactionGuard> {
        let store = self.stores.open(folder).await?;
        Ok(store.begin_compaction().await?)
    }

    pub async fn finish_compaction(&self, folder: FolderId, mut guard: CompactionGuard) -> SyncResult<CompactionReport> {
        let state = self.open_folder(folder).await?;
        let mut messages = state.messages.lock().await;

        let live = messages.offline_locations();
        let result = guard.run(&live).await?;

        for (uid, location) in &result.locations {
            if let Some(message) = messages.get_mut(*uid) {
                message.mark_offline(*location);
            }
            self.relocate(folder, *uid, *location);
        }
        for uid in &result.missing {
            if let Some(message) = messages.get_mut(*uid) {
                message.clear_offline();
            }
            self.unindex_message(folder, *uid);
        }
        let changed: Vec<u32> = result
            .locations
            .keys()
            .chain(result.missing.iter())
            .copied()
            .collect();
        self.persist_changes(folder, &messages, &changed, &[]).await?;

        Ok(CompactionReport {
            folder,
            size_before: result.size_before,
            size_after: result.size_after,
            kept: result.locations.len(),
            dropped: result.missing.len(),
        })
    }

    pub async fn compact_folder(&self, folder: FolderId) -> SyncResult<CompactionReport> {
        let guard = self.begin_compaction(folder).await?;
        self.finish_compaction(folder, guard).await
    }

    pub async fn message(&self, folder: FolderId, uid: u32) -> SyncResult<Option<LocalMessage>> {
        let state = self.open_folder(folder).await?;
        let messages = state.messages.lock().await;
        Ok(messages.get(uid).cloned())
    }

    pub async fn messages(&self, folder: FolderId) -> SyncResult<Vec<LocalMessage>> {
        let state = self.open_folder(folder).await?;
        let messages = state.messages.lock().await;
        Ok(messages.iter().cloned().collect())
    }

    /// Mark a folder as shown in a window; visible folders are never evicted
    pub async fn set_visible(&self, folder: FolderId, visible: bool) -> SyncResult<()> {
        let state = self.open_folder(folder).await?;
        state.visible.store(visible, Ordering::SeqCst);
        Ok(())
    }

    pub async fn is_open(&self, folder: FolderId) -> bool {
        self.open.lock().await.contains_key(&folder)
    }

    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }

    /// Close an open folder database. Busy or visible folders stay open.
    pub async fn close_folder(&self, folder: FolderId) -> bool {
        let mut open = self.open.lock().await;
        let Some(state) = open.get(&folder) else {
            return false;
        };
        // the map holds one reference, any other one belongs to a running operation
        let busy = Arc::strong_count(state) > 1 || state.messages.try_lock().is_err();
        if busy || state.visible.load(Ordering::SeqCst) {
            return false;
        }
        open.remove(&folder);
        debug!("Closed message database of folder {}", folder);
        true
    }

    pub async fn database_infos(&self) -> Vec<MessageDatabaseInfo> {
        let open: Vec<(FolderId, Arc<OpenFolder>)> = self
            .open
            .lock()
            .await
            .iter()
            .map(|(folder, state)| (*folder, Arc::clone(state)))
            .collect();

        let mut infos = Vec::with_capacity(open.len());
        for (folder, state) in open {
            let (size, store_use) = match self.stores.get(folder).await {
                Some(store) => {
                    let metrics = store.metrics();
                    (metrics.size, Some(metrics.last_use))
                }
                None => (0, None),
            };
            let last_use = store_use.map_or(state.last_use(), |used| used.max(state.last_use()));
            infos.push(MessageDatabaseInfo {
                folder,
                size,
                last_use,
                visible: state.visible.load(Ordering::SeqCst),
                open: self.remote_id_lock().contains_key(&folder),
            });
        }
        infos
    }

    /// Remove every trace of a deleted folder
    pub async fn forget_folder(&self, folder: FolderId) -> SyncResult<()> {
        self.open.lock().await.remove(&folder);
        self.remote_id_lock().remove(&folder);
        self.unindex_folder(folder);
        self.database.delete_folder_data(&self.account_id, &[folder]).await?;
        self.stores.remove(folder).await?;
        Ok(())
    }
}
