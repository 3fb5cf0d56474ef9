//! ChannelManager: the single server-push channel and its repair loop.
//!
//! At most one channel exists per manager, and at most one reconnect timer is
//! pending. Both live in one slot behind one lock, so teardown cancels the
//! channel and the pending reconnect together.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::credential::{Credential, CredentialStore};
use crate::error::FatalAuthError;
use crate::metrics::ChannelMetrics;
use crate::presence::{PresenceReconciler, SnapshotSource};
use crate::router::{EventRouter, HandlerCell, RouteOutcome};
use crate::transport::{PresenceApi, PushTransport, TransportEvent, TransportStream};

/// Observable state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Open,
    ReconnectScheduled,
}

/// What a call to [`ChannelManager::connect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new channel is connecting.
    Opened,
    /// A channel already exists; nothing was done.
    AlreadyOpen,
    NotAuthenticated,
    /// No credential stored (expected on a login screen).
    NoCredential,
    /// The credential was oversized; storage was wiped and a fatal signal sent.
    CredentialCorrupt,
    /// The transport could not start a channel; a reconnect is scheduled.
    TransportUnavailable,
}

struct ActiveChannel {
    id: Uuid,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ChannelSlot {
    channel: Option<ActiveChannel>,
    pending_reconnect: Option<CancellationToken>,
}

impl ChannelSlot {
    fn is_current(&self, id: Uuid) -> bool {
        self.channel.as_ref().is_some_and(|c| c.id == id)
    }
}

struct Shared {
    config: ChannelConfig,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn PushTransport>,
    presence_api: Arc<dyn PresenceApi>,
    router: EventRouter,
    presence: PresenceReconciler,
    metrics: Arc<ChannelMetrics>,
    slot: Mutex<ChannelSlot>,
    authenticated: AtomicBool,
    connected_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
    fatal_tx: broadcast::Sender<FatalAuthError>,
}

/// Owns the lifecycle of the push channel.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Shared>,
}

impl ChannelManager {
    pub fn new(
        config: ChannelConfig,
        credentials: Arc<dyn CredentialStore>,
        transport: Arc<dyn PushTransport>,
        presence_api: Arc<dyn PresenceApi>,
        presence: PresenceReconciler,
        handlers: HandlerCell,
    ) -> Self {
        let metrics = Arc::new(ChannelMetrics::new());
        let router = EventRouter::new(handlers, presence.clone(), metrics.clone());
        let (connected_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Absent);
        let (fatal_tx, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(Shared {
                config,
                credentials,
                transport,
                presence_api,
                router,
                presence,
                metrics,
                slot: Mutex::new(ChannelSlot::default()),
                authenticated: AtomicBool::new(false),
                connected_tx,
                state_tx,
                fatal_tx,
            }),
        }
    }

    /// Record the host's authentication state. `connect()` is a no-op while
    /// unauthenticated.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner
            .authenticated
            .store(authenticated, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Fatal authentication errors. The host restarts its session bootstrap
    /// when one arrives.
    pub fn fatal_errors(&self) -> broadcast::Receiver<FatalAuthError> {
        self.inner.fatal_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.inner.metrics
    }

    pub fn presence(&self) -> &PresenceReconciler {
        &self.inner.presence
    }

    pub fn handlers(&self) -> &HandlerCell {
        self.inner.router.handlers()
    }

    pub async fn has_channel(&self) -> bool {
        self.inner.slot.lock().await.channel.is_some()
    }

    pub async fn has_pending_reconnect(&self) -> bool {
        self.inner.slot.lock().await.pending_reconnect.is_some()
    }

    /// Open the channel if none exists and the session allows it.
    pub async fn connect(&self) -> ConnectOutcome {
        let mut slot = self.inner.slot.lock().await;
        self.open_locked(&mut slot)
    }

    /// Close the channel and cancel any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.slot.lock().await;
        self.teardown_locked(&mut slot);
    }

    fn open_locked(&self, slot: &mut ChannelSlot) -> ConnectOutcome {
        if slot.channel.is_some() {
            debug!("channel already exists, connect is a no-op");
            return ConnectOutcome::AlreadyOpen;
        }
        if !self.is_authenticated() {
            debug!("not authenticated, skipping connect");
            return ConnectOutcome::NotAuthenticated;
        }
        let Some(credential) = self.inner.credentials.credential() else {
            debug!("no credential stored, skipping connect");
            return ConnectOutcome::NoCredential;
        };
        if credential.is_oversized(self.inner.config.max_credential_len) {
            self.handle_corrupt_credential(slot, &credential);
            return ConnectOutcome::CredentialCorrupt;
        }

        let stream = match self.inner.transport.open(&credential) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to start channel");
                self.inner.metrics.transport_error();
                self.schedule_reconnect_locked(slot);
                return ConnectOutcome::TransportUnavailable;
            }
        };

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        slot.channel = Some(ActiveChannel {
            id,
            cancel: cancel.clone(),
        });
        self.inner.state_tx.send_replace(ConnectionState::Connecting);
        info!(channel_id = %id, "opening channel");

        // The reader owns the stream from the start, so a snapshot frame sent
        // right after acceptance is processed in order with everything else.
        tokio::spawn(
            self.clone()
                .run_channel(id, cancel, stream)
                .instrument(info_span!("channel", channel_id = %id)),
        );
        ConnectOutcome::Opened
    }

    fn teardown_locked(&self, slot: &mut ChannelSlot) {
        if let Some(channel) = slot.channel.take() {
            channel.cancel.cancel();
            info!(channel_id = %channel.id, "channel closed");
        }
        if let Some(pending) = slot.pending_reconnect.take() {
            pending.cancel();
            debug!("pending reconnect cancelled");
        }
        self.inner.connected_tx.send_replace(false);
        self.inner.state_tx.send_replace(ConnectionState::Absent);
    }

    fn handle_corrupt_credential(&self, slot: &mut ChannelSlot, credential: &Credential) {
        let length = credential.len();
        error!(
            length,
            limit = self.inner.config.max_credential_len,
            "stored credential exceeds size ceiling, wiping credential storage"
        );
        self.inner.credentials.wipe();
        if let Some(pending) = slot.pending_reconnect.take() {
            pending.cancel();
        }
        self.inner.connected_tx.send_replace(false);
        self.inner.state_tx.send_replace(ConnectionState::Absent);
        let _ = self
            .inner
            .fatal_tx
            .send(FatalAuthError::CorruptCredential { length });
    }

    async fn run_channel(self, id: Uuid, cancel: CancellationToken, mut stream: TransportStream) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("channel reader stopped");
                    return;
                }
                event = stream.next() => event,
            };

            match event {
                Some(TransportEvent::Open) => self.on_open(id, &cancel).await,
                Some(TransportEvent::Frame(frame)) => {
                    if self.inner.router.route(&frame).await == RouteOutcome::TransportError {
                        self.on_transport_error(id, "server sent error frame").await;
                        return;
                    }
                }
                Some(TransportEvent::Error(reason)) => {
                    self.on_transport_error(id, &reason).await;
                    return;
                }
                None => {
                    self.on_transport_error(id, "stream ended").await;
                    return;
                }
            }
        }
    }

    async fn on_open(&self, id: Uuid, cancel: &CancellationToken) {
        if !self.inner.slot.lock().await.is_current(id) {
            return;
        }
        self.inner.metrics.channel_opened();
        self.inner.connected_tx.send_replace(true);
        self.inner.state_tx.send_replace(ConnectionState::Open);
        info!("channel open");
        self.spawn_fallback_fetch(cancel.child_token());
    }

    /// One-shot reconciliation against the presence endpoint, in case the
    /// snapshot frame was lost.
    fn spawn_fallback_fetch(&self, cancel: CancellationToken) {
        let Some(credential) = self.inner.credentials.credential() else {
            return;
        };
        let api = self.inner.presence_api.clone();
        let presence = self.inner.presence.clone();
        let metrics = self.inner.metrics.clone();

        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("fallback presence fetch cancelled"),
                    result = api.online_users(&credential) => match result {
                        Ok(users) if !cancel.is_cancelled() => {
                            presence.replace_all(users, SnapshotSource::Fallback);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            metrics.fallback_fetch_failed();
                            warn!(error = %e, "fallback presence fetch failed");
                        }
                    },
                }
            }
            .in_current_span(),
        );
    }

    async fn on_transport_error(&self, id: Uuid, reason: &str) {
        let mut slot = self.inner.slot.lock().await;
        if !slot.is_current(id) {
            debug!(reason, "ignoring error from a channel that was already replaced");
            return;
        }
        self.inner.metrics.transport_error();
        warn!(reason, "channel transport error");

        // Clear the handle first so a broken channel never blocks reconnects.
        if let Some(channel) = slot.channel.take() {
            channel.cancel.cancel();
        }
        self.inner.connected_tx.send_replace(false);
        self.schedule_reconnect_locked(&mut slot);
    }

    fn schedule_reconnect_locked(&self, slot: &mut ChannelSlot) {
        self.inner
            .state_tx
            .send_replace(ConnectionState::ReconnectScheduled);
        if slot.pending_reconnect.is_some() {
            debug!("reconnect already pending");
            return;
        }
        let token = CancellationToken::new();
        slot.pending_reconnect = Some(token.clone());
        self.inner.metrics.reconnect_scheduled();
        info!(
            delay_ms = self.inner.config.reconnect_delay.as_millis() as u64,
            "reconnect scheduled"
        );
        tokio::spawn(self.clone().reconnect_after(token));
    }

    // Boxed so the connect → reader → error → reconnect chain has a nameable type.
    fn reconnect_after(self, token: CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let delay = self.inner.config.reconnect_delay;
        Box::pin(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut slot = self.inner.slot.lock().await;
            if token.is_cancelled() {
                return;
            }
            slot.pending_reconnect = None;
            info!("reconnecting");
            self.teardown_locked(&mut slot);
            let outcome = self.open_locked(&mut slot);
            debug!(outcome = ?outcome, "reconnect attempt finished");
        })
    }
}
