//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::env_vars;

/// Install a global subscriber. `RUST_LOG` wins over the `mooring=info` default.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("mooring=info").add_directive(tracing::Level::WARN.into())
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
            .is_ok()
    }
}

/// [`init_tracing`] with JSON output chosen by `MOORING_LOG_JSON`.
pub fn init_tracing_from_env() -> bool {
    let json = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    init_tracing(json)
}
