//! Session/lifecycle monitor.
//!
//! Keeps the channel's existence in step with authentication: the auth flag,
//! a periodic credential check, the cross-tab storage feed, and the same-tab
//! logout signal. Every task hangs off one root [`CancellationToken`] held by
//! [`MonitorHandle`], so teardown cannot leave a timer or listener behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelManager;
use crate::credential::{CredentialStore, StorageChange};
use crate::presence::PresenceReconciler;

/// Same-tab "logged out" signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutSignal {
    /// The user who logged out, if the host knows it.
    pub user_id: Option<String>,
}

/// Disposer for every task the monitor started.
pub struct MonitorHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    manager: ChannelManager,
}

impl MonitorHandle {
    /// Cancel every monitor task, wait for them, and close the channel.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.manager.disconnect().await;
        info!("session monitor stopped");
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        // The auth task disconnects on its way out.
        self.cancel.cancel();
    }
}

/// Watches authentication and credential storage on behalf of a
/// [`ChannelManager`].
pub struct SessionMonitor;

impl SessionMonitor {
    /// Start monitoring. The channel connects right away if `auth` is true.
    pub fn spawn(
        manager: ChannelManager,
        credentials: Arc<dyn CredentialStore>,
        auth: watch::Receiver<bool>,
        logout: broadcast::Receiver<LogoutSignal>,
        check_interval: Duration,
    ) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let storage = credentials.subscribe();
        let storage_credentials = credentials.clone();

        let tasks = vec![
            tokio::spawn(watch_authentication(
                manager.clone(),
                auth,
                cancel.child_token(),
            )),
            tokio::spawn(check_credential_periodically(
                manager.clone(),
                credentials,
                check_interval,
                cancel.child_token(),
            )),
            tokio::spawn(watch_storage(
                manager.clone(),
                storage_credentials,
                storage,
                cancel.child_token(),
            )),
            tokio::spawn(watch_logout(
                manager.clone(),
                manager.presence().clone(),
                logout,
                cancel.child_token(),
            )),
        ];

        MonitorHandle {
            cancel,
            tasks,
            manager,
        }
    }
}

async fn apply_authentication(manager: &ChannelManager, authenticated: bool) {
    manager.set_authenticated(authenticated);
    if authenticated {
        let outcome = manager.connect().await;
        debug!(outcome = ?outcome, "authenticated, connect requested");
    } else {
        info!("unauthenticated, closing channel");
        manager.disconnect().await;
    }
}

async fn watch_authentication(
    manager: ChannelManager,
    mut auth: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let mut authenticated = *auth.borrow_and_update();
    apply_authentication(&manager, authenticated).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = auth.changed() => {
                if changed.is_err() {
                    debug!("auth source dropped, treating as logged out");
                    apply_authentication(&manager, false).await;
                    cancel.cancelled().await;
                    break;
                }
                let now = *auth.borrow_and_update();
                if now != authenticated {
                    authenticated = now;
                    apply_authentication(&manager, now).await;
                }
            }
        }
    }

    manager.disconnect().await;
}

async fn check_credential_periodically(
    manager: ChannelManager,
    credentials: Arc<dyn CredentialStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if credentials.credential().is_none() && manager.has_channel().await {
                    warn!("credential disappeared while channel open, disconnecting");
                    manager.disconnect().await;
                }
            }
        }
    }
}

async fn watch_storage(
    manager: ChannelManager,
    credentials: Arc<dyn CredentialStore>,
    mut changes: broadcast::Receiver<StorageChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(change) if change.is_token_cleared() => {
                    // A cleared copy in one scope is harmless while the other still holds one.
                    if credentials.credential().is_some() {
                        debug!(scope = ?change.scope, "token cleared in one scope, credential still present");
                    } else {
                        info!(scope = ?change.scope, "credential cleared in another tab, disconnecting");
                        manager.disconnect().await;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "storage change feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn watch_logout(
    manager: ChannelManager,
    presence: PresenceReconciler,
    mut logout: broadcast::Receiver<LogoutSignal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = logout.recv() => match signal {
                Ok(signal) => {
                    info!(user_id = ?signal.user_id, "local logout, disconnecting");
                    manager.disconnect().await;
                    if let Some(user_id) = signal.user_id.as_deref() {
                        presence.remove_user(user_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "logout signal feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
