//! Rate-limited screenshot streaming.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use super::{Envelope, NotificationHub};
use crate::config::MAX_SCREENSHOT_INTERVAL_MS;
use crate::task::TaskId;

/// Emits at most one frame per debounce window per producer.
///
/// Frames offered inside the window are dropped, not queued.
pub struct FrameBroadcaster {
    hub: Arc<NotificationHub>,
    min_interval: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl FrameBroadcaster {
    /// `min_interval` is clamped to `0..=1000ms`.
    pub fn new(hub: Arc<NotificationHub>, min_interval: Duration) -> Self {
        Self {
            hub,
            min_interval: min_interval.min(Duration::from_millis(MAX_SCREENSHOT_INTERVAL_MS)),
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Producers with an open debounce window.
    pub fn tracked(&self) -> usize {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offer a base64 PNG frame from `producer` for `task_id`.
    ///
    /// Returns whether the frame was broadcast.
    pub fn offer(&self, producer: &str, task_id: TaskId, image: String) -> bool {
        let now = Instant::now();
        {
            let mut last = self
                .last_emitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(prev) = last.get(producer) {
                if !self.min_interval.is_zero() && now.duration_since(*prev) <= self.min_interval {
                    return false;
                }
            }
            last.insert(producer.to_string(), now);
        }

        let envelope = Envelope::Screenshot {
            task_id,
            data: json!({
                "image": image,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        };
        self.hub.broadcast(task_id, &envelope);
        true
    }

    /// Forget a producer's window.
    pub fn forget(&self, producer: &str) {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(producer);
    }
}
