//! Error types for the channel, its fallback fetch, and frame decoding.

/// Failures talking to the push endpoint or the presence snapshot endpoint.
///
/// None of these escape to UI code: the channel manager recovers from every
/// variant internally and only the coarse `is_connected` state is visible.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("presence endpoint reported failure")]
    PresenceRejected,

    #[error("transport error: {0}")]
    Transport(String),
}

/// A single frame could not be decoded. The frame is dropped; the channel
/// keeps running.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected frame shape: {0}")]
    UnexpectedShape(&'static str),
}

/// Unrecoverable authentication failure for the current session.
///
/// Published to the host instead of reloading the process; the host is
/// expected to restart its own session bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalAuthError {
    #[error("stored credential is corrupt ({length} characters)")]
    CorruptCredential { length: usize },
}
