use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{default_config_path, SyncConfig};
use crate::database::SyncDatabase;
use crate::events::{EventBus, SyncEvent};
use crate::folder::FolderTree;
use crate::message::{EngineOptions, MessageSyncEngine};
use crate::offline::OfflineStores;
use crate::remote::{FolderListing, MemoryServer, MessageSource, RemoteBody, RemoteError, RemoteResult};
use crate::session::{SessionReport, SyncSessionCoordinator};

/// mailsync - folder and offline message synchronisation
#[derive(Parser)]
#[command(name = "mailsync")]
#[command(about = "Synchronise a mail account's folders and offline message stores")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Load the configuration named on the command line, or the default one
    pub fn load_config(&self) -> Result<SyncConfig> {
        let path = self.config.clone().unwrap_or_else(default_config_path);
        SyncConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one "get new messages" session against a server snapshot
    Sync(SyncArgs),

    /// Compact the offline stores of an account
    Compact(CompactArgs),

    /// Print the stored folder tree of an account
    Tree(TreeArgs),

    /// Show recent sync sessions of an account
    History(HistoryArgs),
}

#[derive(Args)]
pub struct SyncArgs {
    /// JSON snapshot of the server (folders and messages)
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Account id
    #[arg(short, long, default_value = "default")]
    pub account: String,

    /// Print progress events while syncing
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args)]
pub struct CompactArgs {
    /// Account id
    #[arg(short, long)]
    pub account: String,
}

#[derive(Args)]
pub struct TreeArgs {
    /// Account id
    #[arg(short, long)]
    pub account: String,
}

#[derive(Args)]
pub struct HistoryArgs {
    /// Account id
    #[arg(short, long)]
    pub account: String,

    /// Number of sessions to show
    #[arg(long, default_value = "10")]
    pub limit: u32,
}

/// Message source for commands that must not touch the network
struct Disconnected;

#[async_trait]
impl MessageSource for Disconnected {
    async fn fetch_summaries(&self, folder_id: &str) -> RemoteResult<FolderListing> {
        Err(RemoteError::connection(format!("offline, cannot list {}", folder_id)))
    }

    async fn fetch_body(&self, folder_id: &str, _uid: u32) -> RemoteResult<Option<RemoteBody>> {
        Err(RemoteError::connection(format!("offline, cannot fetch from {}", folder_id)))
    }
}

/// CLI command handler
pub struct CliHandler {
    config: SyncConfig,
    database: SyncDatabase,
}

impl CliHandler {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let database = SyncDatabase::new(&config.database_path()).await?;
        Ok(Self { config, database })
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Sync(args) => self.handle_sync(args).await,
            Commands::Compact(args) => self.handle_compact(args).await,
            Commands::Tree(args) => self.handle_tree(args).await,
            Commands::History(args) => self.handle_history(args).await,
        }
    }

    async fn handle_sync(&self, args: SyncArgs) -> Result<()> {
        let json = tokio::fs::read_to_string(&args.snapshot)
            .await
            .with_context(|| format!("Failed to read {}", args.snapshot.display()))?;
        let server = Arc::new(MemoryServer::from_json(&json)?);

        let events = EventBus::new();
        let mut subscription = events.subscribe();
        let coordinator =
            SyncSessionCoordinator::open(&args.account, server, self.database.clone(), &self.config, events)
                .await?;

        let root = coordinator.tree().await.root();
        let outcome = coordinator.get_new_messages(root).await;

        if args.verbose {
            for event in subscription.drain() {
                print_event(&event);
            }
        }

        match outcome {
            Ok(report) => {
                print_report(&report);
                if report.is_complete() {
                    Ok(())
                } else {
                    Err(anyhow!("{} folders failed to sync", report.failures.len()))
                }
            }
            Err(e) => Err(anyhow!("Sync failed: {}", e)),
        }
    }

    async fn load_tree(&self, account: &str) -> Result<FolderTree> {
        self.database
            .load_folder_tree(account)
            .await?
            .ok_or_else(|| anyhow!("Account '{}' has never been synced", account))
    }

    async fn handle_compact(&self, args: CompactArgs) -> Result<()> {
        let tree = self.load_tree(&args.account).await?;
        let stores = Arc::new(OfflineStores::new(self.config.store_dir(&args.account)));
        let engine = MessageSyncEngine::new(
            &args.account,
            Arc::new(Disconnected),
            self.database.clone(),
            stores,
            EngineOptions::from(&self.config),
        );
        engine.load_offline_index().await?;

        let mut reclaimed = 0u64;
        for folder in tree.iter().filter(|f| !f.is_root()) {
            let report = engine.compact_folder(folder.id()).await?;
            reclaimed += report.size_before.saturating_sub(report.size_after);
            println!(
                "  {:<40} {:>10} -> {:>10} bytes ({} kept, {} dropped)",
                tree.path(folder.id()).unwrap_or_default(),
                report.size_before,
                report.size_after,
                report.kept,
                report.dropped
            );
        }
        println!("✅ Reclaimed {} bytes", reclaimed);
        Ok(())
    }

    async fn handle_tree(&self, args: TreeArgs) -> Result<()> {
        let tree = self.load_tree(&args.account).await?;
        print_folder(&tree);
        Ok(())
    }

    async fn handle_history(&self, args: HistoryArgs) -> Result<()> {
        let sessions = self.database.recent_sessions(&args.account, args.limit).await?;
        if sessions.is_empty() {
            println!("No sync sessions recorded for '{}'", args.account);
            return Ok(());
        }
        for session in sessions {
            let status = if session.succeeded { "✅" } else { "❌" };
            println!(
                "{} {} {} synced, {} failed{}",
                status,
                session.started_at.format("%Y-%m-%d %H:%M:%S"),
                session.folders_synced,
                session.folders_failed,
                session.error.map(|e| format!(" ({})", e)).unwrap_or_default()
            );
        }
        Ok(())
    }
}

fn print_folder(tree: &FolderTree) {
    for line in folder_lines(tree) {
        println!("{}", line);
    }
}

/// Indented listing of the tree, depth first in sibling order
fn folder_lines(tree: &FolderTree) -> Vec<String> {
    let mut lines = Vec::new();
    let mut stack = vec![(tree.root(), 0usize)];
    while let Some((id, depth)) = stack.pop() {
        let Some(folder) = tree.get(id) else {
            continue;
        };
        lines.push(format!(
            "{}{} [{}]",
            "  ".repeat(depth),
            folder.name(),
            folder.remote_id().unwrap_or("-")
        ));
        stack.extend(folder.children().iter().rev().map(|child| (*child, depth + 1)));
    }
    lines
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::FolderCreated { path, .. } => println!("  + {}", path),
        SyncEvent::FolderRenamed { name, .. } => println!("  ~ renamed to {}", name),
        SyncEvent::FolderMoved { path, .. } => println!("  > moved to {}", path),
        SyncEvent::FolderDeleted { name, .. } => println!("  - {}", name),
        SyncEvent::FolderFailed { folder, error } => println!("  ! {}: {}", folder, error),
        _ => {}
    }
}

fn print_report(report: &SessionReport) {
    println!("📬 Sync of '{}' finished", report.account_id);
    println!(
        "   Folders: {} created, {} renamed, {} moved, {} deleted",
        report.structure.created.len(),
        report.structure.renamed.len(),
        report.structure.moved.len(),
        report.structure.deleted.len()
    );
    println!(
        "   Messages: {} new, {} bodies downloaded in {} folders",
        report.messages_added(),
        report.bodies_fetched(),
        report.folders.len()
    );
    for failure in &report.failures {
        println!("   ❌ {}: {}", failure.path, failure.error);
    }
}
