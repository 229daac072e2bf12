//! Host settings for the plugin engine.
//!
//! Every timing constant has a default in [`defaults`] and can be overridden by the
//! host, either programmatically, from JSON, or from the environment variables named
//! in [`env_vars`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default values.
pub mod defaults {
    /// How long a bootstrap observer waits for a missing anchor.
    pub const BOOTSTRAP_TIMEOUT_MS: u64 = 10_000;
    /// How long a single remote module load may take.
    pub const REMOTE_LOAD_TIMEOUT_MS: u64 = 8_000;
    /// Quiet period after a navigation event before eligibility is recomputed.
    pub const NAVIGATION_DEBOUNCE_MS: u64 = 60;
    /// Length of one coalesced "animation frame".
    pub const FRAME_INTERVAL_MS: u64 = 16;
    /// Buffered container events per subscriber.
    pub const EVENT_CAPACITY: usize = 1000;
}

/// Environment variable names.
pub mod env_vars {
    pub const BOOTSTRAP_TIMEOUT_MS: &str = "MOORING_BOOTSTRAP_TIMEOUT_MS";
    pub const REMOTE_LOAD_TIMEOUT_MS: &str = "MOORING_REMOTE_LOAD_TIMEOUT_MS";
    pub const NAVIGATION_DEBOUNCE_MS: &str = "MOORING_NAVIGATION_DEBOUNCE_MS";
    pub const FRAME_INTERVAL_MS: &str = "MOORING_FRAME_INTERVAL_MS";
    pub const HOST_ORIGIN: &str = "MOORING_HOST_ORIGIN";
    /// Set to `true` to emit JSON logs.
    pub const LOG_JSON: &str = "MOORING_LOG_JSON";
}

/// Tunables shared by the registry, injector and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub bootstrap_timeout_ms: u64,
    pub remote_load_timeout_ms: u64,
    pub navigation_debounce_ms: u64,
    pub frame_interval_ms: u64,
    /// Origin of the host page, e.g. `https://app.example.com`. Remote URLs on a
    /// different origin get a one-time warmup request.
    pub host_origin: Option<String>,
    pub event_capacity: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            bootstrap_timeout_ms: defaults::BOOTSTRAP_TIMEOUT_MS,
            remote_load_timeout_ms: defaults::REMOTE_LOAD_TIMEOUT_MS,
            navigation_debounce_ms: defaults::NAVIGATION_DEBOUNCE_MS,
            frame_interval_ms: defaults::FRAME_INTERVAL_MS,
            host_origin: None,
            event_capacity: defaults::EVENT_CAPACITY,
        }
    }
}

impl HostSettings {
    /// Defaults overlaid with any `MOORING_*` environment variables.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            bootstrap_timeout_ms: env_u64(env_vars::BOOTSTRAP_TIMEOUT_MS)
                .unwrap_or(base.bootstrap_timeout_ms),
            remote_load_timeout_ms: env_u64(env_vars::REMOTE_LOAD_TIMEOUT_MS)
                .unwrap_or(base.remote_load_timeout_ms),
            navigation_debounce_ms: env_u64(env_vars::NAVIGATION_DEBOUNCE_MS)
                .unwrap_or(base.navigation_debounce_ms),
            frame_interval_ms: env_u64(env_vars::FRAME_INTERVAL_MS)
                .unwrap_or(base.frame_interval_ms),
            host_origin: std::env::var(env_vars::HOST_ORIGIN)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .or(base.host_origin),
            event_capacity: base.event_capacity,
        }
    }

    pub fn with_host_origin(mut self, origin: impl Into<String>) -> Self {
        self.host_origin = Some(origin.into());
        self
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn remote_load_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_load_timeout_ms)
    }

    pub fn navigation_debounce(&self) -> Duration {
        Duration::from_millis(self.navigation_debounce_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HostSettings::default();
        assert_eq!(settings.bootstrap_timeout(), Duration::from_secs(10));
        assert_eq!(settings.remote_load_timeout(), Duration::from_secs(8));
        assert_eq!(settings.navigation_debounce(), Duration::from_millis(60));
        assert!(settings.host_origin.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings: HostSettings =
            serde_json::from_str(r#"{"bootstrap_timeout_ms": 500}"#).unwrap();
        assert_eq!(settings.bootstrap_timeout_ms, 500);
        assert_eq!(settings.remote_load_timeout_ms, defaults::REMOTE_LOAD_TIMEOUT_MS);
        assert_eq!(settings.frame_interval_ms, defaults::FRAME_INTERVAL_MS);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var(env_vars::REMOTE_LOAD_TIMEOUT_MS, "1234");
        std::env::set_var(env_vars::NAVIGATION_DEBOUNCE_MS, "not-a-number");
        let settings = HostSettings::from_env();
        assert_eq!(settings.remote_load_timeout_ms, 1234);
        assert_eq!(settings.navigation_debounce_ms, defaults::NAVIGATION_DEBOUNCE_MS);
        std::env::remove_var(env_vars::REMOTE_LOAD_TIMEOUT_MS);
        std::env::remove_var(env_vars::NAVIGATION_DEBOUNCE_MS);
    }
}
