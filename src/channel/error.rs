use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the channel client.
///
/// Cloneable so that a single connection outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The transport failed to open or dropped abnormally.
    #[error("connection error: {0}")]
    Connection(String),

    /// No matching reply arrived before the deadline.
    #[error("no response to `{action}` within {timeout:?}")]
    ResponseTimeout { action: String, timeout: Duration },

    /// A request was attempted while the channel could not be opened.
    #[error("channel unavailable")]
    Unavailable,

    /// The connection closed while the request was pending.
    #[error("channel closed")]
    Closed,

    /// The service answered with an error status.
    #[error("{0}")]
    Remote(String),

    /// An inbound frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The action name was empty.
    #[error("action name must not be empty")]
    InvalidAction,

    /// The request payload could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// The reply data did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::Connection(e.to_string())
    }
}
