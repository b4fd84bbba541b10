//! Typed calls to the bot service over the channel.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::channel::{ChannelClient, ChannelError};
use crate::detector::SignalNotifier;
use crate::protocol::{
    actions, SignalMessage, SignalPayload, StatusReply, TaskStats, TasksPayload, UserPayload,
};
use crate::store::TaskAggregate;

pub const DEFAULT_SIGNAL_TEXT: &str = "Tasks are now available. Please check your task queue";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("user id should only contain digits")]
    InvalidUserId,

    #[error("user not authorized")]
    NotAuthorized,

    #[error("no tasks have been recorded yet")]
    NoTasks,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// What the service reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Online,
    Unknown,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::Online => write!(f, "Online"),
            BotStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone)]
pub struct BotApi {
    channel: ChannelClient,
    signal_text: String,
}

impl BotApi {
    pub fn new(channel: ChannelClient) -> Self {
        Self {
            channel,
            signal_text: DEFAULT_SIGNAL_TEXT.to_string(),
        }
    }

    pub fn with_signal_text(mut self, text: impl Into<String>) -> Self {
        self.signal_text = text.into();
        self
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    /// Register `user_id` with the service. The id must be all digits.
    pub async fn login(&self, user_id: &str) -> Result<(), BotError> {
        if user_id.is_empty() || !user_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BotError::InvalidUserId);
        }
        match self
            .channel
            .call::<_, serde_json::Value>(actions::LOGIN, &UserPayload { user_id })
            .await
        {
            Ok(_) => {
                tracing::info!(user_id, "logged in");
                Ok(())
            }
            Err(ChannelError::Remote(message))
                if message.contains("not allowed") || message.contains("not authorized") =>
            {
                tracing::warn!(user_id, %message, "login refused");
                Err(BotError::NotAuthorized)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, user_id: &str) -> Result<BotStatus, BotError> {
        let reply: Option<StatusReply> = self
            .channel
            .call(actions::STATUS, &UserPayload { user_id })
            .await?;
        let status = match reply.and_then(|r| r.status).as_deref() {
            Some("Online") => BotStatus::Online,
            _ => BotStatus::Unknown,
        };
        Ok(status)
    }

    pub async fn send_signal(&self, user_id: &str, text: &str) -> Result<(), BotError> {
        let payload = SignalPayload {
            user_id,
            messages: vec![SignalMessage {
                text: text.to_string(),
                count: 1,
            }],
        };
        let data = self.channel.request(actions::SEND_SIGNAL, to_value(&payload)?).await?;
        tracing::debug!(%data, "signal acknowledged");
        Ok(())
    }

    /// Upload the task aggregates as a report.
    pub async fn process_tasks(
        &self,
        user_id: &str,
        tasks: &BTreeMap<String, TaskAggregate>,
    ) -> Result<serde_json::Value, BotError> {
        if tasks.is_empty() {
            return Err(BotError::NoTasks);
        }
        let data = self
            .channel
            .request(actions::PROCESS_TASKS, to_value(&TasksPayload { user_id, tasks })?)
            .await?;
        tracing::info!(tasks = tasks.len(), "report sent");
        Ok(data)
    }

    pub async fn get_task_stats(
        &self,
        user_id: &str,
        tasks: &BTreeMap<String, TaskAggregate>,
    ) -> Result<TaskStats, BotError> {
        if tasks.is_empty() {
            return Err(BotError::NoTasks);
        }
        let stats: Option<TaskStats> = self
            .channel
            .call(actions::GET_TASK_STATS, &TasksPayload { user_id, tasks })
            .await?;
        Ok(stats.unwrap_or_default())
    }
}

fn to_value<T: serde::Serialize>(payload: &T) -> Result<serde_json::Value, ChannelError> {
    serde_json::to_value(payload).map_err(|e| ChannelError::Encode(e.to_string()))
}

impl SignalNotifier for BotApi {
    fn notify<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), BotError>> {
        self.send_signal(user_id, &self.signal_text).boxed()
    }
}
