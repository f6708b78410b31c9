//! Idle message database eviction
//!
//! A periodic check over the open folder databases of an engine. Policy and
//! runner are separate: [`plan_evictions`] decides from a snapshot of
//! [`MessageDatabaseInfo`]s, [`IdleEvictor`] applies the plan on a timer.

use crate::config::EvictionConfig;
use crate::folder::FolderId;
use crate::message::{MessageDatabaseInfo, MessageSyncEngine};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The folder no longer exists
    FolderClosed,
    /// Unused for longer than the idle threshold and small
    Idle,
    /// Closed to get under the open database limit
    OverLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionAction {
    pub folder: FolderId,
    pub reason: EvictionReason,
}

/// Combined size/recency score; lower scores are closed first
fn eviction_score(info: &MessageDatabaseInfo) -> f64 {
    let size = info.size.max(1) as f64;
    size.log10() * info.last_use.timestamp().max(0) as f64
}

/// Decide which databases to close. Visible databases are never chosen.
pub fn plan_evictions(
    infos: &[MessageDatabaseInfo],
    config: &EvictionConfig,
    now: DateTime<Utc>,
) -> Vec<EvictionAction> {
    let mut actions = Vec::new();
    let mut closed: HashSet<FolderId> = HashSet::new();

    for info in infos.iter().filter(|info| !info.visible && !info.open) {
        actions.push(EvictionAction {
            folder: info.folder,
            reason: EvictionReason::FolderClosed,
        });
        closed.insert(info.folder);
    }

    let idle_since = now - config.idle_threshold();
    let idle: Vec<FolderId> = infos
        .iter()
        .filter(|info| !info.visible && !closed.contains(&info.folder))
        .filter(|info| info.last_use < idle_since && info.size < config.keep_open_size_bytes)
        .map(|info| info.folder)
        .collect();
    for folder in idle {
        actions.push(EvictionAction {
            folder,
            reason: EvictionReason::Idle,
        });
        closed.insert(folder);
    }

    let remaining = infos.len() - closed.len();
    if remaining > config.max_open_databases {
        let mut candidates: Vec<&MessageDatabaseInfo> = infos
            .iter()
            .filter(|info| !info.visible && !closed.contains(&info.folder))
            .collect();
        candidates.sort_by(|a, b| eviction_score(a).total_cmp(&eviction_score(b)));

        for info in candidates.into_iter().take(remaining - config.max_open_databases) {
            actions.push(EvictionAction {
                folder: info.folder,
                reason: EvictionReason::OverLimit,
            });
        }
    }

    actions
}

/// Periodic runner of the eviction policy for one engine
pub struct IdleEvictor {
    engine: Arc<MessageSyncEngine>,
    config: EvictionConfig,
}

impl IdleEvictor {
    pub fn new(engine: Arc<MessageSyncEngine>, config: EvictionConfig) -> Self {
        Self { engine, config }
    }

    /// Run one check now; returns the folders actually closed
    pub async fn run_once(&self) -> Vec<FolderId> {
        let infos = self.engine.database_infos().await;
        let actions = plan_evictions(&infos, &self.config, Utc::now());

        let mut closed = Vec::with_capacity(actions.len());
        for action in actions {
            if self.engine.close_folder(action.folder).await {
                debug!("Evicted database of folder {} ({:?})", action.folder, action.reason);
                closed.push(action.folder);
            }
        }
        if !closed.is_empty() {
            info!(
                "Closed {} idle message databases for account {}",
                closed.len(),
                self.engine.account_id()
            );
        }
        closed
    }

    /// Start the periodic check. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn info(folder: u64, size: u64, idle_secs: i64, now: DateTime<Utc>) -> MessageDatabaseInfo {
        MessageDatabaseInfo {
            folder: FolderId(folder),
            size,
            last_use: now - Duration::seconds(idle_secs),
            visible: false,
            open: true,
        }
    }

    fn config(max_open: usize) -> EvictionConfig {
        EvictionConfig {
            check_interval_secs: 60,
            idle_threshold_secs: 3600,
            keep_open_size_bytes: 1_000_000,
            max_open_databases: max_open,
        }
    }

    #[test]
    fn test_idle_small_databases_are_closed() {
        let now = Utc::now();
        let infos = vec![
            info(1, 10_000, 7200, now),
            info(2, 50_000_000, 7200, now),
            info(3, 10_000, 60, now),
        ];
        let actions = plan_evictions(&infos, &config(30), now);
        assert_eq!(
            actions,
            vec![EvictionAction {
                folder: FolderId(1),
                reason: EvictionReason::Idle
            }]
        );
    }

    #[test]
    fn test_closed_folders_are_dropped() {
        let now = Utc::now();
        let mut gone = info(4, 10, 0, now);
        gone.open = false;
        let actions = plan_evictions(&[gone], &config(30), now);
        assert_eq!(actions[0].reason, EvictionReason::FolderClosed);
    }

    #[test]
    fn test_over_limit_closes_lowest_scores() {
        let now = Utc::now();
        let infos = vec![
            info(1, 5_000_000, 10, now),
            info(2, 100, 10, now),
            info(3, 5_000_000, 20, now),
            info(4, 5_000_000, 5, now),
        ];
        let actions = plan_evictions(&infos, &config(2), now);
        let folders: Vec<FolderId> = actions.iter().map(|a| a.folder).collect();
        assert_eq!(folders, vec![FolderId(2), FolderId(3)]);
        assert!(actions.iter().all(|a| a.reason == EvictionReason::OverLimit));
    }

    #[test]
    fn test_each_database_is_closed_once_across_passes() {
        let now = Utc::now();
        let mut gone = info(1, 10, 7200, now);
        gone.open = false;
        let infos = vec![
            gone,
            info(2, 10, 7200, now),
            info(3, 10, 7200, now),
            info(4, 5_000_000, 10, now),
            info(5, 6_000_000, 10, now),
        ];
        let actions = plan_evictions(&infos, &config(1), now);
        assert_eq!(
            actions,
            vec![
                EvictionAction {
                    folder: FolderId(1),
                    reason: EvictionReason::FolderClosed
                },
                EvictionAction {
                    folder: FolderId(2),
                    reason: EvictionReason::Idle
                },
                EvictionAction {
                    folder: FolderId(3),
                    reason: EvictionReason::Idle
                },
                EvictionAction {
                    folder: FolderId(4),
                    reason: EvictionReason::OverLimit
                },
            ]
        );
    }

    #[test]
    fn test_visible_databases_are_never_closed() {
        let now = Utc::now();
        let mut shown = info(1, 10, 99_999, now);
        shown.visible = true;
        let mut also_gone = info(2, 10, 99_999, now);
        also_gone.visible = true;
        also_gone.open = false;
        assert!(plan_evictions(&[shown, also_gone], &config(0), now).is_empty());
    }
}
