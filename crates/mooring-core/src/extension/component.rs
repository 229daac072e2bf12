//! Mountable UI units.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::types::Props;

/// What a render call hands to the context that mounts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub markup: String,
}

impl RenderedContent {
    pub fn new(markup: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new("")
    }
}

/// Inputs for one render of one extension instance.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub extension_id: &'a str,
    /// DOM id of the container being rendered into.
    pub container_id: &'a str,
    pub anchor_index: usize,
    pub props: &'a Props,
}

/// Render failure reported by a component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Render failed: {0}")]
    Failed(String),

    #[error("Render panicked: {0}")]
    Panicked(String),
}

/// A UI unit exported by a remote module.
pub trait PluginComponent: Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedContent, RenderError>;

    /// Display name for logs.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Shared handle to a component.
pub type ComponentRef = Arc<dyn PluginComponent>;

/// Wraps a closure as a component.
pub struct FnComponent<F> {
    name: String,
    render: F,
}

impl<F> FnComponent<F>
where
    F: Fn(&RenderContext<'_>) -> Result<RenderedContent, RenderError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, render: F) -> Self {
        Self {
            name: name.into(),
            render,
        }
    }
}

impl<F> PluginComponent for FnComponent<F>
where
    F: Fn(&RenderContext<'_>) -> Result<RenderedContent, RenderError> + Send + Sync,
{
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedContent, RenderError> {
        (self.render)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnComponent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnComponent").field("name", &self.name).finish()
    }
}
