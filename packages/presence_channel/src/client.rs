//! PresenceClient: the surface a host application holds.
//!
//! Wires the credential store, transport, presence reconciler, router and
//! channel manager together, and owns the session monitor once started.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::channel::{ChannelManager, ConnectionState};
use crate::config::ChannelConfig;
use crate::credential::CredentialStore;
use crate::error::{ChannelError, FatalAuthError};
use crate::lifecycle::{LogoutSignal, MonitorHandle, SessionMonitor};
use crate::metrics::MetricsSnapshot;
use crate::presence::PresenceReconciler;
use crate::protocol::ConnectedUser;
use crate::router::{HandlerCell, Handlers};
use crate::transport::{HttpPresenceApi, PresenceApi, PushTransport, SseTransport};

pub struct PresenceClient {
    config: ChannelConfig,
    credentials: Arc<dyn CredentialStore>,
    manager: ChannelManager,
    logout_tx: broadcast::Sender<LogoutSignal>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl PresenceClient {
    pub fn new(
        config: ChannelConfig,
        credentials: Arc<dyn CredentialStore>,
        transport: Arc<dyn PushTransport>,
        presence_api: Arc<dyn PresenceApi>,
    ) -> Self {
        let manager = ChannelManager::new(
            config.clone(),
            credentials.clone(),
            transport,
            presence_api,
            PresenceReconciler::new(),
            HandlerCell::default(),
        );
        let (logout_tx, _) = broadcast::channel(8);
        Self {
            config,
            credentials,
            manager,
            logout_tx,
            monitor: Mutex::new(None),
        }
    }

    /// Client backed by the SSE transport and the HTTP presence endpoint.
    pub fn connect_http(
        config: ChannelConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ChannelError> {
        let http = Client::builder().build()?;
        let transport = Arc::new(SseTransport::new(http.clone(), config.events_url.clone()));
        let presence_api = Arc::new(HttpPresenceApi::new(
            http,
            config.online_users_url.clone(),
        ));
        Ok(Self::new(config, credentials, transport, presence_api))
    }

    /// Start the session monitor. The channel follows `auth` from here on.
    /// Calling this twice is a no-op.
    pub fn start(&self, auth: watch::Receiver<bool>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            warn!("presence client already started");
            return;
        }
        *monitor = Some(SessionMonitor::spawn(
            self.manager.clone(),
            self.credentials.clone(),
            auth,
            self.logout_tx.subscribe(),
            self.config.credential_check_interval,
        ));
        info!(events_url = %self.config.events_url, "presence client started");
    }

    /// Replace the event handlers. Takes effect for the next frame.
    pub async fn set_handlers(&self, handlers: Handlers) {
        self.manager.handlers().replace(handlers).await;
    }

    /// Tell the client the local user logged out in this tab.
    pub fn notify_logout(&self, user_id: Option<String>) {
        if self.logout_tx.send(LogoutSignal { user_id }).is_err() {
            warn!("logout signal sent before the client was started");
        }
    }

    pub fn is_connected(&self) -> watch::Receiver<bool> {
        self.manager.subscribe_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn connected_users(&self) -> watch::Receiver<Vec<ConnectedUser>> {
        self.manager.presence().subscribe()
    }

    pub fn fatal_errors(&self) -> broadcast::Receiver<FatalAuthError> {
        self.manager.fatal_errors()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics().snapshot()
    }

    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    /// Stop the monitor and close the channel. The client can be started
    /// again afterwards.
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        match monitor {
            Some(monitor) => monitor.shutdown().await,
            None => self.manager.disconnect().await,
        }
    }
}
