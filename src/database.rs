use crate::folder::{FolderError, FolderFlags, FolderId, FolderProperties, FolderRecord, FolderTree};
use crate::message::{LocalMessage, MessageFlags, MessageSet};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Stored folder tree is invalid: {0}")]
    Folder(#[from] FolderError),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Persisted sync state of one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSyncState {
    pub folder: FolderId,
    pub uid_validity: u32,
    pub highest_uid: u32,
    pub message_count: u32,
    pub last_sync: DateTime<Utc>,
}

/// Summary of a finished sync session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub folders_synced: u32,
    pub folders_failed: u32,
    pub error: Option<String>,
}

/// SQLite store for folder trees, message summaries and session history
#[derive(Debug, Clone)]
pub struct SyncDatabase {
    pub pool: SqlitePool,
}

impl SyncDatabase {
    /// Open (or create) the database file at `path`
    pub async fn new(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Migration(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connection)?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create an in-memory database for testing
    pub async fn new_in_memory() -> DatabaseResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(":memory:")
            .await
            .map_err(DatabaseError::Connection)?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                parent_id INTEGER,
                name TEXT NOT NULL,
                ordinal INTEGER,
                flags INTEGER NOT NULL,
                properties TEXT NOT NULL, -- JSON, carries remoteId
                PRIMARY KEY (account_id, id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folder_trees (
                account_id TEXT PRIMARY KEY,
                next_folder_id INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folder_sync_state (
                account_id TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                uid_validity INTEGER NOT NULL,
                highest_uid INTEGER NOT NULL,
                message_count INTEGER NOT NULL,
                last_sync TEXT NOT NULL,
                PRIMARY KEY (account_id, folder_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                account_id TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                flags INTEGER NOT NULL,
                keywords TEXT NOT NULL, -- JSON array
                message_id TEXT,
                global_id TEXT,
                extensions TEXT NOT NULL, -- JSON object
                size INTEGER,
                store_token INTEGER,
                stored_length INTEGER,
                PRIMARY KEY (account_id, folder_id, uid)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_sessions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                succeeded BOOLEAN NOT NULL,
                folders_synced INTEGER NOT NULL,
                folders_failed INTEGER NOT NULL,
                error TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(account_id, message_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_account ON sync_sessions(account_id, started_at DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replace the stored tree of an account in one transaction
    pub async fn save_folder_tree(&self, tree: &FolderTree) -> DatabaseResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM folders WHERE account_id = ?1")
            .bind(tree.account_id())
            .execute(&mut *tx)
            .await?;

        for record in tree.records() {
            sqlx::query(
                r#"
                INSERT INTO folders (account_id, id, parent_id, name, ordinal, flags, properties)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            )
            .bind(tree.account_id())
            .bind(record.id.0 as i64)
            .bind(record.parent.map(|p| p.0 as i64))
            .bind(&record.name)
            .bind(record.ordinal.map(|o| o as i64))
            .bind(record.flags.bits() as i64)
            .bind(record.properties.to_json()?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT OR REPLACE INTO folder_trees (account_id, next_folder_id, updated_at) VALUES (?1, ?2, ?3)")
            .bind(tree.account_id())
            .bind(tree.next_id() as i64)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Saved {} folders for account {}", tree.len(), tree.account_id());
        Ok(())
    }

    /// Load an account's tree, `None` if it was never synced
    pub async fn load_folder_tree(&self, account_id: &str) -> DatabaseResult<Option<FolderTree>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_id, name, ordinal, flags, properties
            FROM folders
            WHERE account_id = ?1
            ORDER BY id
        "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let properties: String = row.get("properties");
            records.push(FolderRecord {
                id: FolderId(row.get::<i64, _>("id") as u64),
                parent: row.get::<Option<i64>, _>("parent_id").map(|p| FolderId(p as u64)),
                name: row.get("name"),
                ordinal: row.get::<Option<i64>, _>("ordinal").map(|o| o as u64),
                flags: FolderFlags::from_bits_truncate(row.get::<i64, _>("flags") as u32),
                properties: FolderProperties::from_json(&properties)?,
            });
        }

        let next_id: Option<i64> = sqlx::query_scalar("SELECT next_folder_id FROM folder_trees WHERE account_id = ?1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(Some(FolderTree::from_records(
            account_id,
            records,
            next_id.unwrap_or(0) as u64,
        )?))
    }

    /// Replace the stored messages and sync state of one folder
    pub async fn save_folder_messages(
        &self,
        account_id: &str,
        folder: FolderId,
        messages: &MessageSet,
    ) -> DatabaseResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE account_id = ?1 AND folder_id = ?2")
            .bind(account_id)
            .bind(folder.0 as i64)
            .execute(&mut *tx)
            .await?;
        for message in messages.iter() {
            upsert_message(&mut *tx, account_id, folder, message).await?;
        }
        save_sync_state(&mut *tx, account_id, folder, messages).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upsert `changed`, delete `removed` and refresh the folder's sync state.
    /// Rows of other messages are left alone.
    pub async fn update_folder_messages(
        &self,
        account_id: &str,
        folder: FolderId,
        messages: &MessageSet,
        changed: &[&LocalMessage],
        removed: &[u32],
    ) -> DatabaseResult<()> {
        let mut tx = self.pool.begin().await?;

        for uid in removed {
            sqlx::query("DELETE FROM messages WHERE account_id = ?1 AND folder_id = ?2 AND uid = ?3")
                .bind(account_id)
                .bind(folder.0 as i64)
                .bind(*uid as i64)
                .execute(&mut *tx)
                .await?;
        }
        for message in changed {
            upsert_message(&mut *tx, account_id, folder, message).await?;
        }
        save_sync_state(&mut *tx, account_id, folder, messages).await?;

        tx.commit().await?;
        debug!(
            "Updated {} and removed {} messages of folder {}",
            changed.len(),
            removed.len(),
            folder
        );
        Ok(())
    }

    pub async fn get_folder_sync_state(
        &self,
        account_id: &str,
        folder: FolderId,
    ) -> DatabaseResult<Option<FolderSyncState>> {
        let row = sqlx::query(
            r#"
            SELECT folder_id, uid_validity, highest_uid, message_count, last_sync
            FROM folder_sync_state
            WHERE account_id = ?1 AND folder_id = ?2
        "#,
        )
        .bind(account_id)
        .bind(folder.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let last_sync: DateTime<Utc> = DateTime::parse_from_rfc3339(row.get("last_sync"))?.into();
                Ok(Some(FolderSyncState {
                    folder: FolderId(row.get::<i64, _>("folder_id") as u64),
                    uid_validity: row.get::<i64, _>("uid_validity") as u32,
                    highest_uid: row.get::<i64, _>("highest_uid") as u32,
                    message_count: row.get::<i64, _>("message_count") as u32,
                    last_sync,
                }))
            }
            None => Ok(None),
        }
    }

    /// Load a folder's messages, `None` if the folder was never synced
    pub async fn load_folder_messages(
        &self,
        account_id: &str,
        folder: FolderId,
    ) -> DatabaseResult<Option<MessageSet>> {
        let Some(state) = self.get_folder_sync_state(account_id, folder).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT uid, flags, keywords, message_id, global_id, extensions, size, store_token, stored_length
            FROM messages
            WHERE account_id = ?1 AND folder_id = ?2
            ORDER BY uid
        "#,
        )
        .bind(account_id)
        .bind(folder.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let keywords: BTreeSet<String> = serde_json::from_str(row.get("keywords"))?;
            let extensions: BTreeMap<String, String> = serde_json::from_str(row.get("extensions"))?;
            messages.push(LocalMessage {
                uid: row.get::<i64, _>("uid") as u32,
                flags: MessageFlags::from_bits_truncate(row.get::<i64, _>("flags") as u32),
                keywords,
                message_id: row.get("message_id"),
                global_id: row.get("global_id"),
                extensions,
                size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
                store_token: row.get::<Option<i64>, _>("store_token").map(|t| t as u64),
                stored_length: row.get::<Option<i64>, _>("stored_length").map(|l| l as u64),
            });
        }

        Ok(Some(MessageSet::from_messages(
            state.uid_validity,
            state.highest_uid,
            messages,
        )))
    }

    /// Every message of the account with a body in an offline store
    pub async fn offline_messages(&self, account_id: &str) -> DatabaseResult<Vec<(FolderId, LocalMessage)>> {
        let rows = sqlx::query(
            r#"
            SELECT folder_id, uid, flags, message_id, global_id, size, store_token, stored_length
            FROM messages
            WHERE account_id = ?1 AND store_token IS NOT NULL AND (flags & ?2) != 0
            ORDER BY folder_id, uid
        "#,
        )
        .bind(account_id)
        .bind(MessageFlags::OFFLINE.bits() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let folder = FolderId(row.get::<i64, _>("folder_id") as u64);
                let message = LocalMessage {
                    uid: row.get::<i64, _>("uid") as u32,
                    flags: MessageFlags::from_bits_truncate(row.get::<i64, _>("flags") as u32),
                    message_id: row.get("message_id"),
                    global_id: row.get("global_id"),
                    size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
                    store_token: row.get::<Option<i64>, _>("store_token").map(|t| t as u64),
                    stored_length: row.get::<Option<i64>, _>("stored_length").map(|l| l as u64),
                    ..Default::default()
                };
                (folder, message)
            })
            .collect())
    }

    /// Drop messages and sync state of deleted folders
    pub async fn delete_folder_data(&self, account_id: &str, folders: &[FolderId]) -> DatabaseResult<()> {
        let mut tx = self.pool.begin().await?;
        for folder in folders {
            sqlx::query("DELETE FROM messages WHERE account_id = ?1 AND folder_id = ?2")
                .bind(account_id)
                .bind(folder.0 as i64)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM folder_sync_state WHERE account_id = ?1 AND folder_id = ?2")
                .bind(account_id)
                .bind(folder.0 as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Accounts with a stored folder tree
    pub async fn accounts(&self) -> DatabaseResult<Vec<String>> {
        let accounts = sqlx::query_scalar("SELECT DISTINCT account_id FROM folders ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    pub async fn record_session(&self, record: &SessionRecord) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, account_id, started_at, finished_at, succeeded, folders_synced, folders_failed, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        )
        .bind(record.id.to_string())
        .bind(&record.account_id)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.to_rfc3339())
        .bind(record.succeeded)
        .bind(record.folders_synced as i64)
        .bind(record.folders_failed as i64)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_sessions(&self, account_id: &str, limit: u32) -> DatabaseResult<Vec<SessionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, started_at, finished_at, succeeded, folders_synced, folders_failed, error
            FROM sync_sessions
            WHERE account_id = ?1
            ORDER BY started_at DESC
            LIMIT ?2
        "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let started_at: DateTime<Utc> = DateTime::parse_from_rfc3339(row.get("started_at"))?.into();
            let finished_at: DateTime<Utc> = DateTime::parse_from_rfc3339(row.get("finished_at"))?.into();
            sessions.push(SessionRecord {
                id: Uuid::parse_str(row.get("id"))?,
                account_id: row.get("account_id"),
                started_at,
                finished_at,
                succeeded: row.get("succeeded"),
                folders_synced: row.get::<i64, _>("folders_synced") as u32,
                folders_failed: row.get::<i64, _>("folders_failed") as u32,
                error: row.get("error"),
            });
        }
        Ok(sessions)
    }
}

async fn upsert_message(
    conn: &mut SqliteConnection,
    account_id: &str,
    folder: FolderId,
    message: &LocalMessage,
) -> DatabaseResult<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO messages (
            account_id, folder_id, uid, flags, keywords, message_id, global_id,
            extensions, size, store_token, stored_length
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    "#,
    )
    .bind(account_id)
    .bind(folder.0 as i64)
    .bind(message.uid as i64)
    .bind(message.flags.bits() as i64)
    .bind(serde_json::to_string(&message.keywords)?)
    .bind(&message.message_id)
    .bind(&message.global_id)
    .bind(serde_json::to_string(&message.extensions)?)
    .bind(message.size.map(|s| s as i64))
    .bind(message.store_token.map(|t| t as i64))
    .bind(message.stored_length.map(|l| l as i64))
    .execute(conn)
    .await?;
    Ok(())
}

async fn save_sync_state(
    conn: &mut SqliteConnection,
    account_id: &str,
    folder: FolderId,
    messages: &MessageSet,
) -> DatabaseResult<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO folder_sync_state (
            account_id, folder_id, uid_validity, highest_uid, message_count, last_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    "#,
    )
    .bind(account_id)
    .bind(folder.0 as i64)
    .bind(messages.uid_validity as i64)
    .bind(messages.highest_uid as i64)
    .bind(messages.len() as i64)
    .bind(Utc::now().to_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::StoreLocation;
    use crate::remote::RemoteMessage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_folder_tree_round_trip() {
        let db = SyncDatabase::new_in_memory().await.unwrap();
        assert!(db.load_folder_tree("acct").await.unwrap().is_none());

        let mut tree = FolderTree::new("acct");
        let inbox = tree.insert_folder(tree.root(), "Inbox").unwrap();
        tree.set_flags(inbox, FolderFlags::INBOX).unwrap();
        tree.properties_mut(inbox).unwrap().set_remote_id("AQMk-inbox");
        tree.insert_folder(inbox, "Receipts").unwrap();

        db.save_folder_tree(&tree).await.unwrap();
        let loaded = db.load_folder_tree("acct").await.unwrap().unwrap();
        assert_eq!(loaded, tree);
        assert_eq!(loaded.find_by_remote_id("AQMk-inbox"), Some(inbox));
        assert_eq!(db.accounts().await.unwrap(), vec!["acct".to_string()]);

        tree.delete_folder(inbox).unwrap();
        db.save_folder_tree(&tree).await.unwrap();
        let reloaded = db.load_folder_tree("acct").await.unwrap().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.next_id(), tree.next_id());
    }

    #[tokio::test]
    async fn test_messages_round_trip() {
        let db = SyncDatabase::new_in_memory().await.unwrap();
        let folder = FolderId(2);
        assert!(db.load_folder_messages("acct", folder).await.unwrap().is_none());

        let mut set = MessageSet::new(42);
        let mut remote = RemoteMessage::new(5);
        remote.flags = vec!["\\Seen".to_string(), "receipts".to_string()];
        remote.message_id = Some("<m5@example.com>".to_string());
        remote.extensions.insert("X-GM-THRID".to_string(), "1278455344230334865".to_string());
        set.upsert(&remote).unwrap();
        set.get_mut(5).unwrap().mark_offline(StoreLocation { token: 0, length: 120 });
        set.upsert(&RemoteMessage::new(8)).unwrap();

        db.save_folder_messages("acct", folder, &set).await.unwrap();
        let loaded = db.load_folder_messages("acct", folder).await.unwrap().unwrap();
        assert_eq!(loaded, set);

        let state = db.get_folder_sync_state("acct", folder).await.unwrap().unwrap();
        assert_eq!(state.uid_validity, 42);
        assert_eq!(state.highest_uid, 8);
        assert_eq!(state.message_count, 2);

        db.delete_folder_data("acct", &[folder]).await.unwrap();
        assert!(db.load_folder_messages("acct", folder).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_touches_only_changed_rows() {
        let db = SyncDatabase::new_in_memory().await.unwrap();
        let folder = FolderId(3);

        let mut set = MessageSet::new(7);
        for uid in 1..=3 {
            set.upsert(&RemoteMessage::new(uid)).unwrap();
        }
        db.save_folder_messages("acct", folder, &set).await.unwrap();

        // a row the update must not rewrite
        sqlx::query("UPDATE messages SET size = 999 WHERE account_id = 'acct' AND uid = 1")
            .execute(&db.pool)
            .await
            .unwrap();

        set.get_mut(2).unwrap().mark_offline(StoreLocation { token: 0, length: 10 });
        set.remove(3);
        let changed = vec![set.get(2).unwrap()];
        db.update_folder_messages("acct", folder, &set, &changed, &[3]).await.unwrap();

        let loaded = db.load_folder_messages("acct", folder).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(1).unwrap().size, Some(999));
        assert!(loaded.get(2).unwrap().is_offline());
        assert!(loaded.get(3).is_none());
        assert_eq!(db.get_folder_sync_state("acct", folder).await.unwrap().unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_session_history() {
        let db = SyncDatabase::new_in_memory().await.unwrap();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            account_id: "acct".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            succeeded: false,
            folders_synced: 3,
            folders_failed: 1,
            error: Some("Connection error: reset".to_string()),
        };
        db.record_session(&record).await.unwrap();

        let sessions = db.recent_sessions("acct", 10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, record.id);
        assert_eq!(sessions[0].folders_failed, 1);
        assert!(!sessions[0].succeeded);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("mailsync.db");

        {
            let db = SyncDatabase::new(&path).await.unwrap();
            db.save_folder_tree(&FolderTree::new("acct")).await.unwrap();
            db.pool.close().await;
        }

        let db = SyncDatabase::new(&path).await.unwrap();
        assert!(db.load_folder_tree("acct").await.unwrap().is_some());
    }
}
