//! In-memory stand-ins for the push transport and the presence endpoint.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::credential::Credential;
use crate::error::ChannelError;
use crate::protocol::ConnectedUser;
use crate::transport::{PresenceApi, PushTransport, TransportEvent, TransportStream};

/// Let spawned tasks run. Under a paused clock this also auto-advances time
/// by one millisecond, well short of any timer the crate schedules.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn user(id: &str, username: &str) -> ConnectedUser {
    ConnectedUser {
        id: Some(id.to_string()),
        username: Some(username.to_string()),
        first_name: None,
        last_name: None,
        role: None,
        connected_at: None,
        session_count: 1,
    }
}

/// Records every channel it opens; tests push events into the latest one.
#[derive(Default)]
pub struct FakeTransport {
    channels: Mutex<Vec<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Push an event into the most recently opened channel.
    pub fn send(&self, event: TransportEvent) {
        if let Some(Some(tx)) = self.channels.lock().last() {
            let _ = tx.send(event);
        }
    }

    /// End the most recently opened channel's stream.
    pub fn close_latest(&self) {
        if let Some(slot) = self.channels.lock().last_mut() {
            slot.take();
        }
    }
}

impl PushTransport for FakeTransport {
    fn open(&self, credential: &Credential) -> Result<TransportStream, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().push(Some(tx));
        self.tokens.lock().push(credential.expose().to_string());
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Presence endpoint returning a canned list, or failing on demand.
#[derive(Default)]
pub struct FakePresenceApi {
    users: Mutex<Vec<ConnectedUser>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakePresenceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_users(&self, users: Vec<ConnectedUser>) {
        *self.users.lock() = users;
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceApi for FakePresenceApi {
    async fn online_users(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<ConnectedUser>, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::PresenceRejected);
        }
        Ok(self.users.lock().clone())
    }
}
