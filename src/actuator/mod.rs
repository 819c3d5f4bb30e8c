//! Actuator facade - the controlled browser the action handlers drive.
//!
//! The core never models browser internals. Everything it needs is behind the
//! [`Actuator`] trait: navigation, interaction, extraction and waiting. The
//! production implementation talks Chrome DevTools Protocol ([`CdpActuator`]);
//! tests use [`testing::ScriptedActuator`].
//!
//! The actuator is one shared, stateful session. Callers are expected to let a
//! single task drive it at a time; concurrent use is not coordinated here.

mod cdp;
#[cfg(test)]
pub(crate) mod testing;

pub use cdp::CdpActuator;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by an actuator operation.
#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    #[error("Browser session is not initialized")]
    NotInitialized,

    #[error("Failed to connect to browser at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Element '{0}' not found")]
    ElementNotFound(String),

    #[error("{0}")]
    Operation(String),
}

/// Snapshot of the page currently loaded in the actuator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub viewport: Option<Viewport>,
    pub ready_state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Point at which a navigation counts as finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// The navigation was committed; nothing else is awaited
    Commit,
    DomContentLoaded,
    Load,
    /// Load, then no new network requests for a short quiet window
    #[default]
    NetworkIdle,
}

impl WaitUntil {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitUntil::Commit => "commit",
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::Load => "load",
            WaitUntil::NetworkIdle => "networkidle",
        }
    }
}

impl fmt::Display for WaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitUntil {
    type Err = ActuatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(WaitUntil::Commit),
            "domcontentloaded" => Ok(WaitUntil::DomContentLoaded),
            "load" => Ok(WaitUntil::Load),
            "networkidle" => Ok(WaitUntil::NetworkIdle),
            other => Err(ActuatorError::Operation(format!(
                "Unknown wait_until '{}'. Expected one of: commit, domcontentloaded, load, networkidle",
                other
            ))),
        }
    }
}

/// Capability set of the controlled browser.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Whether a live session exists.
    async fn is_initialized(&self) -> bool;

    /// Start (or attach to) the browser session. Idempotent.
    async fn initialize(&self) -> Result<(), ActuatorError>;

    /// Navigate to `url`, wait for `wait_until`, and return the resulting
    /// document HTML.
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<String, ActuatorError>;

    /// Current document HTML.
    async fn content(&self) -> Result<String, ActuatorError>;

    /// PNG bytes of the viewport, or of the full scrollable page.
    async fn capture_screenshot(&self, full_page: bool) -> Result<Vec<u8>, ActuatorError>;

    async fn page_state(&self) -> Result<PageState, ActuatorError>;

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), ActuatorError>;

    /// Clear the element matched by `selector` and type `text` into it,
    /// pausing `delay` between keystrokes.
    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        delay: Duration,
    ) -> Result<(), ActuatorError>;

    async fn wait(&self, duration: Duration) -> Result<(), ActuatorError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    /// Tear the session down. A later `initialize` starts a fresh one.
    async fn close(&self) -> Result<(), ActuatorError>;
}

/// Bounded exponential backoff around session start.
#[derive(Debug, Clone)]
pub struct InitPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
}

impl Default for InitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl InitPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Make sure the actuator has a live session, starting one if needed.
///
/// Only session start is retried; individual actions never are.
pub async fn ensure_initialized(
    actuator: &dyn Actuator,
    policy: &InitPolicy,
) -> Result<(), ActuatorError> {
    if actuator.is_initialized().await {
        return Ok(());
    }

    let attempts = policy.max_attempts.max(1);
    let mut last_error = ActuatorError::NotInitialized;
    for attempt in 0..attempts {
        match actuator.initialize().await {
            Ok(()) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Browser session started after retry");
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "Browser session start failed"
                );
                last_error = e;
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedActuator;
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = InitPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_initialized_retries_then_succeeds() {
        let actuator = ScriptedActuator::new();
        actuator.fail_next_inits(2);

        let policy = InitPolicy::with_max_attempts(3);
        ensure_initialized(&actuator, &policy).await.unwrap();

        assert!(actuator.is_initialized().await);
        assert_eq!(actuator.init_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_initialized_gives_up() {
        let actuator = ScriptedActuator::new();
        actuator.fail_next_inits(5);

        let policy = InitPolicy::with_max_attempts(2);
        let err = ensure_initialized(&actuator, &policy).await.unwrap_err();

        assert!(matches!(err, ActuatorError::Connection { .. }));
        assert_eq!(actuator.init_calls(), 2);
        assert!(!actuator.is_initialized().await);
    }

    #[tokio::test]
    async fn test_ensure_initialized_skips_live_session() {
        let actuator = ScriptedActuator::initialized();
        ensure_initialized(&actuator, &InitPolicy::default())
            .await
            .unwrap();
        assert_eq!(actuator.init_calls(), 0);
    }
}
