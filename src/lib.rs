pub mod cli;
pub mod config;
pub mod database;
pub mod events;
pub mod eviction;
pub mod folder;
pub mod message;
pub mod offline;
pub mod registry;
pub mod remote;
pub mod session;

pub use config::SyncConfig;
pub use database::SyncDatabase;
pub use events::{EventBus, Subscription, SyncEvent};
pub use folder::{FolderId, FolderTree, FolderTreeReconciler, LocalFolder};
pub use message::{MessageSyncEngine, StreamMode, SyncError, SyncResult};
pub use offline::{OfflineStore, OfflineStores};
pub use remote::{MemoryServer, RemoteError, RemoteFolder};
pub use session::{SessionOutcome, SessionReport, SessionState, SyncManager, SyncSessionCoordinator};
