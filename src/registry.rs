//! Reusable authenticated sessions
//!
//! Sessions (tokens, authenticated connections) are shared between accounts
//! that talk to the same endpoint as the same principal. The cache holds only
//! weak references: a session lives as long as some account uses it, and dead
//! entries are pruned whenever the cache is consulted.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

/// What a cached session was authenticated for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub endpoint: String,
    pub principal: String,
    pub scopes: BTreeSet<String>,
}

impl SessionKey {
    pub fn new<I, S>(endpoint: &str, principal: &str, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoint: endpoint.to_string(),
            principal: principal.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a session for `self` can serve a request for `wanted`
    pub fn covers(&self, wanted: &SessionKey) -> bool {
        self.endpoint.eq_ignore_ascii_case(&wanted.endpoint)
            && self.principal.eq_ignore_ascii_case(&wanted.principal)
            && self.scopes.is_superset(&wanted.scopes)
    }
}

/// Weak cache of shared sessions
#[derive(Debug)]
pub struct AuthSessionCache<T> {
    entries: Mutex<Vec<(SessionKey, Weak<T>)>>,
}

impl<T> Default for AuthSessionCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> AuthSessionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(SessionKey, Weak<T>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(entries: &mut Vec<(SessionKey, Weak<T>)>) {
        let before = entries.len();
        entries.retain(|(_, session)| session.strong_count() > 0);
        if entries.len() != before {
            debug!("Pruned {} dead auth sessions", before - entries.len());
        }
    }

    /// A live session whose scopes include every scope of `key`
    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<T>> {
        let mut entries = self.entries();
        Self::prune(&mut entries);
        entries
            .iter()
            .filter(|(cached, _)| cached.covers(key))
            .find_map(|(_, session)| session.upgrade())
    }

    pub fn insert(&self, key: SessionKey, session: &Arc<T>) {
        let mut entries = self.entries();
        Self::prune(&mut entries);
        entries.retain(|(cached, _)| cached != &key);
        entries.push((key, Arc::downgrade(session)));
    }

    /// Reuse a covering session or create and register a new one
    pub fn get_or_insert_with<F>(&self, key: SessionKey, create: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let mut entries = self.entries();
        Self::prune(&mut entries);
        if let Some(session) = entries
            .iter()
            .filter(|(cached, _)| cached.covers(&key))
            .find_map(|(_, session)| session.upgrade())
        {
            return session;
        }

        let session = Arc::new(create());
        entries.push((key, Arc::downgrade(&session)));
        session
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        let mut entries = self.entries();
        Self::prune(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
