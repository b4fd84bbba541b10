//! Wire envelopes exchanged with the bot service over the channel.
//!
//! Every request carries a `correlationId` that the service echoes back in its
//! response; the channel client matches replies on that id alone, so replies
//! may arrive in any order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::TaskAggregate;

/// Action names understood by the bot service.
pub mod actions {
    pub const LOGIN: &str = "login";
    pub const STATUS: &str = "status";
    pub const SEND_SIGNAL: &str = "send_signal";
    pub const PROCESS_TASKS: &str = "process_tasks";
    pub const GET_TASK_STATS: &str = "get_task_stats";
}

/// Fallback message when the service reports an error without text.
pub const UNKNOWN_ERROR: &str = "Unknown error";

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Outgoing request frame.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    pub action: &'a str,
    pub payload: &'a serde_json::Value,
    #[serde(rename = "correlationId")]
    pub correlation_id: u64,
}

/// Status marker of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Incoming response frame.
///
/// Older service builds echo the id as `messageId`; both spellings are
/// accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "correlationId", alias = "messageId")]
    pub correlation_id: u64,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response.
    pub fn success(correlation_id: u64, data: serde_json::Value) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(correlation_id: u64, message: &str) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.to_owned()),
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Split into the caller-facing result: `data` on success (`null` when
    /// absent), the server's error text otherwise.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self.status {
            ResponseStatus::Success => Ok(self.data.unwrap_or(serde_json::Value::Null)),
            ResponseStatus::Error => Err(self
                .error
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| UNKNOWN_ERROR.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Action payloads
// ---------------------------------------------------------------------------

/// Payload for `login` and `status`.
#[derive(Debug, Serialize)]
pub struct UserPayload<'a> {
    pub user_id: &'a str,
}

/// One line of a `send_signal` notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalMessage {
    pub text: String,
    pub count: u32,
}

/// Payload for `send_signal`.
#[derive(Debug, Serialize)]
pub struct SignalPayload<'a> {
    pub user_id: &'a str,
    pub messages: Vec<SignalMessage>,
}

/// Payload for `process_tasks` and `get_task_stats`.
#[derive(Debug, Serialize)]
pub struct TasksPayload<'a> {
    pub user_id: &'a str,
    pub tasks: &'a BTreeMap<String, TaskAggregate>,
}

/// Reply data for `status`.
#[derive(Debug, Default, Deserialize)]
pub struct StatusReply {
    #[serde(default)]
    pub status: Option<String>,
}

/// Reply data for `get_task_stats`. The service decides the units, so the
/// values are kept as it sent them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    #[serde(default)]
    pub total_time: serde_json::Value,
    #[serde(default)]
    pub total_payout: serde_json::Value,
}
