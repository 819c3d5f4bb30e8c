//! Configuration management for browser-pilot.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8000`.
//! - `BROWSER_CDP_URL` - Optional. DevTools endpoint of the controlled browser.
//!   Defaults to `http://127.0.0.1:9222`.
//! - `DEFAULT_TIMEOUT_MS` - Optional. Per-action actuator timeout. Defaults to `10000`.
//! - `DEFAULT_NAVIGATION_TIMEOUT_MS` - Optional. Navigation timeout. Defaults to `30000`.
//! - `BROWSER_INIT_MAX_ATTEMPTS` - Optional. Attempts when starting the browser session. Defaults to `3`.
//! - `SCREENSHOT_MIN_INTERVAL_MS` - Optional. Minimum gap between streamed frames,
//!   clamped to `0..=1000`. Defaults to `100`.
//! - `WEBSOCKET_HEARTBEAT_INTERVAL` - Optional. Seconds between heartbeats. Defaults to `30`.
//! - `TASK_CLEANUP_INTERVAL` - Optional. Seconds between sweeps of finished tasks. Defaults to `3600`.
//! - `TASK_MAX_AGE` - Optional. Age in seconds after which finished tasks are swept. Defaults to `86400`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub const MAX_SCREENSHOT_INTERVAL_MS: u64 = 1000;

/// Browser (actuator) configuration.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Chrome DevTools endpoint
    pub cdp_url: String,

    /// Default timeout for element lookups and interactions
    pub default_timeout: Duration,

    /// Default timeout for navigations
    pub navigation_timeout: Duration,

    /// How many times session start is attempted before giving up
    pub init_max_attempts: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            cdp_url: "http://127.0.0.1:9222".to_string(),
            default_timeout: Duration::from_millis(10_000),
            navigation_timeout: Duration::from_millis(30_000),
            init_max_attempts: 3,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Actuator settings
    pub browser: BrowserConfig,

    /// Minimum interval between two streamed screenshots of one producer
    pub screenshot_min_interval: Duration,

    /// Interval between websocket heartbeats
    pub heartbeat_interval: Duration,

    /// Interval between sweeps of finished tasks
    pub task_cleanup_interval: Duration,

    /// Finished tasks older than this are removed by the sweep
    pub task_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            browser: BrowserConfig::default(),
            screenshot_min_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            task_cleanup_interval: Duration::from_secs(3600),
            task_max_age: Duration::from_secs(86_400),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let port = parse_env("PORT", defaults.port)?;

        let browser = BrowserConfig {
            cdp_url: std::env::var("BROWSER_CDP_URL").unwrap_or(defaults.browser.cdp_url),
            default_timeout: Duration::from_millis(parse_env("DEFAULT_TIMEOUT_MS", 10_000u64)?),
            navigation_timeout: Duration::from_millis(parse_env(
                "DEFAULT_NAVIGATION_TIMEOUT_MS",
                30_000u64,
            )?),
            init_max_attempts: parse_env("BROWSER_INIT_MAX_ATTEMPTS", 3u32)?.max(1),
        };

        let screenshot_ms =
            parse_env("SCREENSHOT_MIN_INTERVAL_MS", 100u64)?.min(MAX_SCREENSHOT_INTERVAL_MS);

        Ok(Self {
            host,
            port,
            browser,
            screenshot_min_interval: Duration::from_millis(screenshot_ms),
            heartbeat_interval: Duration::from_secs(
                parse_env("WEBSOCKET_HEARTBEAT_INTERVAL", 30u64)?.max(1),
            ),
            task_cleanup_interval: Duration::from_secs(
                parse_env("TASK_CLEANUP_INTERVAL", 3600u64)?.max(1),
            ),
            task_max_age: Duration::from_secs(parse_env("TASK_MAX_AGE", 86_400u64)?),
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
