//! Credential source: the stored bearer token shared with the rest of the host.
//!
//! The store is external shared state. This crate only reads it, except on the
//! corrupt-credential path where it wipes it.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Key under which the bearer token is stored.
pub const TOKEN_KEY: &str = "token";
/// Key under which the cached user-profile blob is stored.
pub const USER_KEY: &str = "user";

/// An opaque bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Length in UTF-16 code units, the unit host string lengths are measured in.
    pub fn len(&self) -> usize {
        self.0.encode_utf16().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A credential longer than `max_len` is never a legitimate session.
    pub fn is_oversized(&self, max_len: usize) -> bool {
        self.len() > max_len
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.len())
    }
}

/// Where a value lives: shared across tabs, or private to one tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Persistent,
    Session,
}

/// One mutation of the store, as observed by other tabs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub scope: StorageScope,
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

impl StorageChange {
    /// True when this change cleared the bearer token.
    pub fn is_token_cleared(&self) -> bool {
        self.key == TOKEN_KEY && self.new_value.is_none()
    }
}

/// Key-value credential storage with two scopes and a change feed.
pub trait CredentialStore: Send + Sync {
    fn get(&self, scope: StorageScope, key: &str) -> Option<String>;

    fn set(&self, scope: StorageScope, key: &str, value: String);

    fn remove(&self, scope: StorageScope, key: &str);

    /// Subscribe to storage changes (the cross-tab notification feed).
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// The current bearer credential: persistent scope first, then session.
    fn credential(&self) -> Option<Credential> {
        [StorageScope::Persistent, StorageScope::Session]
            .into_iter()
            .filter_map(|scope| self.get(scope, TOKEN_KEY))
            .find(|value| !value.is_empty())
            .map(Credential::new)
    }

    /// Erase the token and the cached user blob from both scopes.
    fn wipe(&self) {
        for scope in [StorageScope::Persistent, StorageScope::Session] {
            self.remove(scope, TOKEN_KEY);
            self.remove(scope, USER_KEY);
        }
    }
}

/// In-process credential store.
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<(StorageScope, String), String>>,
    change_tx: broadcast::Sender<StorageChange>,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(HashMap::new()),
            change_tx,
        }
    }

    /// Store a token in the persistent scope.
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(StorageScope::Persistent, TOKEN_KEY, token.into());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, scope: StorageScope, key: &str) -> Option<String> {
        self.entries.read().get(&(scope, key.to_string())).cloned()
    }

    fn set(&self, scope: StorageScope, key: &str, value: String) {
        self.entries
            .write()
            .insert((scope, key.to_string()), value.clone());
        let _ = self.change_tx.send(StorageChange {
            scope,
            key: key.to_string(),
            new_value: Some(value),
        });
    }

    fn remove(&self, scope: StorageScope, key: &str) {
        let removed = self.entries.write().remove(&(scope, key.to_string()));
        if removed.is_some() {
            let _ = self.change_tx.send(StorageChange {
                scope,
                key: key.to_string(),
                new_value: None,
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.change_tx.subscribe()
    }
}
