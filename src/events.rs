//! Sync progress events
//!
//! Events are informational: listeners learn about folder changes as a session
//! runs, but the outcome of a session is only ever its completion result.
//! Each listener owns a [`Subscription`]; dropping it unregisters the listener,
//! so a bus never accumulates dead senders.

use crate::folder::FolderId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Progress of a sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SessionStarted {
        account_id: String,
        session_id: Uuid,
    },
    FolderCreated {
        folder: FolderId,
        path: String,
    },
    FolderRenamed {
        folder: FolderId,
        name: String,
    },
    FolderMoved {
        folder: FolderId,
        path: String,
    },
    FolderDeleted {
        folder: FolderId,
        name: String,
    },
    FolderSynced {
        folder: FolderId,
        added: usize,
        expunged: usize,
    },
    FolderFailed {
        folder: FolderId,
        error: String,
    },
    SessionFinished {
        account_id: String,
        session_id: Uuid,
        succeeded: bool,
    },
}

type Listeners = Mutex<HashMap<Uuid, mpsc::UnboundedSender<SyncEvent>>>;

fn lock(listeners: &Listeners) -> MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<SyncEvent>>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broadcasts [`SyncEvent`]s to every live subscription
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    listeners: Arc<Listeners>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        lock(&self.listeners).insert(id, sender);

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver an event to all listeners, pruning any whose receiver is gone
    pub fn publish(&self, event: SyncEvent) {
        lock(&self.listeners).retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

/// Handle of one listener
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
    bus: Weak<Listeners>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain every event received so far
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.bus.upgrade() {
            lock(&listeners).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(SyncEvent::FolderFailed {
            folder: FolderId(3),
            error: "timeout".to_string(),
        });

        assert!(matches!(first.recv().await, Some(SyncEvent::FolderFailed { .. })));
        assert_eq!(second.drain().len(), 1);
    }

    #[test]
    fn test_dropped_subscription_unregisters() {
        let bus = EventBus::new();
        let subscription = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);
        drop(subscription);
        assert_eq!(bus.listener_count(), 0);

        bus.publish(SyncEvent::FolderDeleted {
            folder: FolderId(2),
            name: "Old".to_string(),
        });
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe();
        drop(bus);
        assert!(subscription.try_recv().is_none());
    }
}
