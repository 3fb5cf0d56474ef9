//! Push transport and presence snapshot endpoint.
//!
//! Both sit behind traits so the channel manager can be driven by fakes.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use tracing::debug;

use crate::credential::Credential;
use crate::error::ChannelError;
use crate::protocol::{ConnectedUser, OnlineUsersResponse, RawFrame};

/// What the transport reports for one open channel, in server-send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server accepted the connection.
    Open,
    Frame(RawFrame),
    /// The channel failed. Nothing follows this event.
    Error(String),
}

pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Opens server-push channels.
pub trait PushTransport: Send + Sync {
    /// Start a channel authenticated with `credential`. The returned stream is
    /// the channel; dropping it closes the connection.
    fn open(&self, credential: &Credential) -> Result<TransportStream, ChannelError>;
}

/// Server-Sent Events transport: `GET <events_url>?token=<credential>`.
#[derive(Clone)]
pub struct SseTransport {
    http: Client,
    events_url: String,
}

impl SseTransport {
    pub fn new(http: Client, events_url: impl Into<String>) -> Self {
        Self {
            http,
            events_url: events_url.into(),
        }
    }
}

impl PushTransport for SseTransport {
    fn open(&self, credential: &Credential) -> Result<TransportStream, ChannelError> {
        let request = self
            .http
            .get(&self.events_url)
            .query(&[("token", credential.expose())]);
        let source =
            EventSource::new(request).map_err(|e| ChannelError::Transport(e.to_string()))?;

        // The event source retries on its own; close it on the first error so
        // the channel manager's retry policy is the only one.
        Ok(stream::unfold(Some(source), |state| async move {
            let Some(mut source) = state else {
                return None;
            };
            match source.next().await {
                Some(Ok(Event::Open)) => Some((TransportEvent::Open, Some(source))),
                Some(Ok(Event::Message(message))) => Some((
                    TransportEvent::Frame(RawFrame::new(message.event, message.data)),
                    Some(source),
                )),
                Some(Err(e)) => {
                    debug!(error = %e, "event source failed, closing");
                    source.close();
                    Some((TransportEvent::Error(e.to_string()), None))
                }
                None => Some((TransportEvent::Error("stream ended".to_string()), None)),
            }
        })
        .boxed())
    }
}

/// The presence snapshot endpoint.
#[async_trait]
pub trait PresenceApi: Send + Sync {
    async fn online_users(&self, credential: &Credential)
    -> Result<Vec<ConnectedUser>, ChannelError>;
}

/// `GET <online_users_url>` with bearer auth.
#[derive(Clone)]
pub struct HttpPresenceApi {
    http: Client,
    online_users_url: String,
}

impl HttpPresenceApi {
    pub fn new(http: Client, online_users_url: impl Into<String>) -> Self {
        Self {
            http,
            online_users_url: online_users_url.into(),
        }
    }
}

#[async_trait]
impl PresenceApi for HttpPresenceApi {
    async fn online_users(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ConnectedUser>, ChannelError> {
        let res = self
            .http
            .get(&self.online_users_url)
            .bearer_auth(credential.expose())
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::UnexpectedStatus { status, body });
        }

        let body: OnlineUsersResponse = res.json().await?;
        if !body.success {
            return Err(ChannelError::PresenceRejected);
        }
        Ok(body.users)
    }
}
