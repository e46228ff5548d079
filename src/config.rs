//! Bridge configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional json5 file, and `JSBRIDGE_*` environment variables.

use crate::error::{Error, Result};
use crate::logging::{LogSeverity, default_log_level};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_SHUTDOWN: &str = "JSBRIDGE_SHUTDOWN";
pub const ENV_LIVE_LOADING: &str = "JSBRIDGE_LIVE_LOADING";
pub const ENV_WATCHDOG_MS: &str = "JSBRIDGE_WATCHDOG_MS";
pub const ENV_LOG_LEVEL: &str = "JSBRIDGE_LOG_LEVEL";

const DEFAULT_THREAD_NAME: &str = "jsbridge-dispatcher";

/// What happens to queued work when a dispatcher shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    /// Run everything already queued, then exit.
    #[default]
    Drain,
    /// Drop queued items; their completions report `InternalError`.
    Immediate,
}

impl ShutdownPolicy {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var(ENV_SHUTDOWN).ok().as_deref().and_then(Self::parse)
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drain" | "drain-and-stop" | "graceful" => Some(Self::Drain),
            "immediate" | "stop-immediately" | "abort" => Some(Self::Immediate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub shutdown: ShutdownPolicy,
    /// Accept script files after start when the engine can load them live.
    pub live_loading: bool,
    /// Flag work items running longer than this many milliseconds.
    pub watchdog_ms: Option<u64>,
    pub log_level: LogSeverity,
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shutdown: ShutdownPolicy::Drain,
            live_loading: false,
            watchdog_ms: None,
            log_level: default_log_level(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a json5 file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::internal(format!("read config {}: {err}", path.display()))
        })?;
        let mut config = Self::parse(&raw).map_err(|err| {
            Error::internal(format!("parse config {}: {err}", path.display()))
        })?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        json5::from_str(raw).map_err(|err| Error::internal(err.to_string()))
    }

    pub fn apply_env(&mut self) {
        if let Some(policy) = ShutdownPolicy::from_env() {
            self.shutdown = policy;
        }
        if let Some(live) = std::env::var(ENV_LIVE_LOADING)
            .ok()
            .as_deref()
            .and_then(parse_bool)
        {
            self.live_loading = live;
        }
        if let Ok(raw) = std::env::var(ENV_WATCHDOG_MS) {
            match raw.trim().parse::<u64>() {
                Ok(0) => self.watchdog_ms = None,
                Ok(ms) => self.watchdog_ms = Some(ms),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {ENV_WATCHDOG_MS}"),
            }
        }
        if let Some(level) = std::env::var(ENV_LOG_LEVEL)
            .ok()
            .as_deref()
            .and_then(LogSeverity::parse)
        {
            self.log_level = level;
        }
    }

    #[must_use]
    pub fn watchdog_threshold(&self) -> Option<Duration> {
        self.watchdog_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
