//! Real-time presence and change-notification client.
//!
//! Keeps one authenticated server-push channel open while the host is logged
//! in, repairs it after transport errors, reconciles the list of connected
//! users, and fans typed events out to registered handlers.

pub mod channel;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use channel::{ChannelManager, ConnectOutcome, ConnectionState};
pub use client::PresenceClient;
pub use config::ChannelConfig;
pub use credential::{Credential, CredentialStore, MemoryCredentialStore, StorageScope};
pub use error::{ChannelError, FatalAuthError, FrameError};
pub use lifecycle::{LogoutSignal, MonitorHandle, SessionMonitor};
pub use presence::PresenceReconciler;
pub use protocol::{ConnectedUser, EntityAction, EntityChangeEvent, NewMessage, UserPresence};
pub use router::{Handlers, RouteOutcome};
pub use transport::{HttpPresenceApi, PresenceApi, PushTransport, SseTransport, TransportEvent};
