//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use mooring_core::extension::{normalize_one, ExtensionConfig};
use mooring_testing::DescriptorBuilder;

pub const WIDGET_KEY: &str = "remote_app/Widget";

/// Validated config from a builder.
pub fn config(builder: DescriptorBuilder) -> ExtensionConfig {
    normalize_one(&builder.build()).expect("fixture descriptor should be valid")
}

/// Let spawned tasks run and pending frames fire. Time is paused in these
/// tests, so this only advances the virtual clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Past the navigation debounce window.
pub async fn after_debounce() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
