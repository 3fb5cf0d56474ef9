//! Presence Reconciler
//!
//! Single source of truth for "who is online". Three inputs feed it in any
//! order: the snapshot frame sent on connect, the fallback fetch issued right
//! after the channel opens, and incremental connect/disconnect frames.
//!
//! Full-state inputs replace the working list wholesale, so stale incremental
//! state from before a reconnect is always superseded by the next snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::protocol::ConnectedUser;

/// Which full-state input produced a replacement. Logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Frame,
    Fallback,
}

/// Canonical presence set plus its derived, externally visible view.
#[derive(Clone)]
pub struct PresenceReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    working: watch::Sender<Vec<ConnectedUser>>,
    view: watch::Sender<Vec<ConnectedUser>>,
}

impl Default for PresenceReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceReconciler {
    pub fn new() -> Self {
        let (working, _) = watch::channel(Vec::new());
        let (view, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner { working, view }),
        }
    }

    /// Subscribe to the externally visible presence list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConnectedUser>> {
        self.inner.view.subscribe()
    }

    /// Current externally visible presence list.
    pub fn current(&self) -> Vec<ConnectedUser> {
        self.inner.view.borrow().clone()
    }

    /// Snapshot frame or fallback fetch: last writer wins.
    pub fn replace_all(&self, users: Vec<ConnectedUser>, source: SnapshotSource) {
        debug!(count = users.len(), source = ?source, "presence snapshot applied");
        self.update(|list| {
            *list = users;
            true
        });
    }

    /// Replace any entry with the same id, then append the new one.
    pub fn user_connected(&self, mut user: ConnectedUser) {
        user.session_count = 1;
        self.update(|list| {
            if let Some(id) = user.id.as_deref() {
                list.retain(|existing| existing.id.as_deref() != Some(id));
            }
            list.push(user);
            true
        });
    }

    /// Remove the entry with this id. Unknown ids are a no-op.
    pub fn user_disconnected(&self, user_id: &str) {
        self.remove_user(user_id);
    }

    /// Remove one user's entry, leaving every other entry untouched.
    /// Returns whether anything was removed.
    pub fn remove_user(&self, user_id: &str) -> bool {
        self.update(|list| {
            let before = list.len();
            list.retain(|existing| existing.id.as_deref() != Some(user_id));
            list.len() != before
        })
    }

    /// Apply `f` to the working list and recompute the view while the working
    /// list is still locked, so views are published in mutation order.
    fn update(&self, f: impl FnOnce(&mut Vec<ConnectedUser>) -> bool) -> bool {
        let view = &self.inner.view;
        self.inner.working.send_if_modified(|list| {
            let modified = f(list);
            if modified {
                view.send_replace(unique_valid_users(list));
            }
            modified
        })
    }
}

/// Derived view: drop invalid entries and keep the first occurrence of each id.
pub fn unique_valid_users(users: &[ConnectedUser]) -> Vec<ConnectedUser> {
    let mut seen = HashSet::new();
    users
        .iter()
        .filter(|user| user.is_valid())
        .filter(|user| match user.id.as_deref() {
            Some(id) if !id.is_empty() => seen.insert(id.to_string()),
            _ => true,
        })
        .cloned()
        .collect()
}
