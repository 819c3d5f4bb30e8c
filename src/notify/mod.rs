//! Live notifications for observers.
//!
//! [`NotificationHub`] keeps the connection registry and the task
//! subscription index. [`FrameBroadcaster`] sits in front of it and throttles
//! screenshot frames.

mod frames;
mod hub;

pub use frames::FrameBroadcaster;
pub use hub::{NotificationHub, Sink};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::TaskId;

/// Identifier of one live observer socket.
///
/// Generated by the hub on connect, so two sockets opened under the same
/// `client_id` never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// JSON message pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ConnectionEstablished {
        client_id: String,
    },
    TaskUpdate {
        task_id: TaskId,
        data: Value,
    },
    /// Base64 PNG frame; always goes through the [`FrameBroadcaster`]
    Screenshot {
        task_id: TaskId,
        data: Value,
    },
    PageState {
        task_id: TaskId,
        data: Value,
    },
    ActionFeedback {
        task_id: TaskId,
        data: Value,
    },
    Heartbeat {
        timestamp: i64,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl Envelope {
    pub fn heartbeat() -> Self {
        Envelope::Heartbeat {
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }
}
