//! Event Router
//!
//! Demultiplexes inbound frames by name, feeds presence frames to the
//! reconciler, applies the entity-type allow-list, and invokes whichever
//! callbacks are registered *at dispatch time*.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::metrics::ChannelMetrics;
use crate::presence::{PresenceReconciler, SnapshotSource};
use crate::protocol::{
    EntityChangeEvent, InboundFrame, NewMessage, RawFrame, SnapshotPayload, UserPresence,
};

/// A caller-supplied callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Optional callbacks plus the entity-type allow-list.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_entity_changed: Option<Callback<EntityChangeEvent>>,
    pub on_user_connected: Option<Callback<UserPresence>>,
    pub on_user_disconnected: Option<Callback<UserPresence>>,
    pub on_connected: Option<Callback<SnapshotPayload>>,
    pub on_new_message: Option<Callback<NewMessage>>,
    /// `None` accepts every entity type.
    pub entity_types: Option<Arc<HashSet<String>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entity_changed(
        mut self,
        f: impl Fn(&EntityChangeEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_entity_changed = Some(Arc::new(f));
        self
    }

    pub fn on_user_connected(mut self, f: impl Fn(&UserPresence) + Send + Sync + 'static) -> Self {
        self.on_user_connected = Some(Arc::new(f));
        self
    }

    pub fn on_user_disconnected(
        mut self,
        f: impl Fn(&UserPresence) + Send + Sync + 'static,
    ) -> Self {
        self.on_user_disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl Fn(&SnapshotPayload) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_new_message(mut self, f: impl Fn(&NewMessage) + Send + Sync + 'static) -> Self {
        self.on_new_message = Some(Arc::new(f));
        self
    }

    /// Only forward entity changes whose `entityType` is in `types`.
    pub fn with_entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = Some(Arc::new(types.into_iter().map(Into::into).collect()));
        self
    }

    pub fn accepts_entity(&self, entity_type: &str) -> bool {
        self.entity_types
            .as_ref()
            .is_none_or(|types| types.contains(entity_type))
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_entity_changed", &self.on_entity_changed.is_some())
            .field("on_user_connected", &self.on_user_connected.is_some())
            .field("on_user_disconnected", &self.on_user_disconnected.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .field("on_new_message", &self.on_new_message.is_some())
            .field("entity_types", &self.entity_types)
            .finish()
    }
}

/// Indirection cell holding the current handlers. The router reads it on
/// every frame, so replacing handlers takes effect on an already-open channel.
#[derive(Clone, Default, Debug)]
pub struct HandlerCell(Arc<RwLock<Handlers>>);

impl HandlerCell {
    pub fn new(handlers: Handlers) -> Self {
        Self(Arc::new(RwLock::new(handlers)))
    }

    pub async fn replace(&self, handlers: Handlers) {
        *self.0.write().await = handlers;
    }

    pub async fn current(&self) -> Handlers {
        self.0.read().await.clone()
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Entity change suppressed by the allow-list.
    Filtered,
    /// Payload could not be decoded.
    Dropped,
    /// Frame name not consumed by this client.
    Ignored,
    /// The server sent a transport-level `error` frame.
    TransportError,
}

#[derive(Clone)]
pub struct EventRouter {
    handlers: HandlerCell,
    presence: PresenceReconciler,
    metrics: Arc<ChannelMetrics>,
}

impl EventRouter {
    pub fn new(
        handlers: HandlerCell,
        presence: PresenceReconciler,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        Self {
            handlers,
            presence,
            metrics,
        }
    }

    pub fn handlers(&self) -> &HandlerCell {
        &self.handlers
    }

    pub async fn route(&self, frame: &RawFrame) -> RouteOutcome {
        self.metrics.frame_received();

        let parsed = match InboundFrame::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "dropping malformed frame");
                self.metrics.frame_dropped();
                return RouteOutcome::Dropped;
            }
        };

        let handlers = self.handlers.current().await;

        match parsed {
            InboundFrame::Connected(snapshot) => {
                self.presence
                    .replace_all(snapshot.connected_users.clone(), SnapshotSource::Frame);
                if let Some(cb) = &handlers.on_connected {
                    cb(&snapshot);
                }
            }
            InboundFrame::EntityChange(event) => {
                if !handlers.accepts_entity(&event.entity_type) {
                    debug!(entity_type = %event.entity_type, "entity change filtered");
                    self.metrics.entity_event_filtered();
                    return RouteOutcome::Filtered;
                }
                if let Some(cb) = &handlers.on_entity_changed {
                    cb(&event);
                }
            }
            InboundFrame::UserConnected(presence) => {
                self.presence
                    .user_connected(presence.clone().into_connected_user());
                if let Some(cb) = &handlers.on_user_connected {
                    cb(&presence);
                }
            }
            InboundFrame::UserDisconnected(presence) => {
                self.presence.user_disconnected(&presence.user_id);
                if let Some(cb) = &handlers.on_user_disconnected {
                    cb(&presence);
                }
            }
            InboundFrame::NewMessage(message) => {
                if let Some(cb) = &handlers.on_new_message {
                    cb(&message);
                }
            }
            InboundFrame::TransportError => return RouteOutcome::TransportError,
            InboundFrame::Unknown(name) => {
                debug!(event = %name, "ignoring unknown frame");
                return RouteOutcome::Ignored;
            }
        }

        RouteOutcome::Delivered
    }
}
