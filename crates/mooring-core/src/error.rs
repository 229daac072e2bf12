//! Crate-level error type.
//!
//! Extension failures never surface through these types: they are turned into
//! incidents by the registry. `MooringError` only covers host-side misuse such as
//! handing the normalizer something that is not a descriptor list.

use crate::dom::DocumentError;
use crate::extension::{ConfigError, LoaderError, RenderError};

/// Errors returned to the host application.
#[derive(Debug, thiserror::Error)]
pub enum MooringError {
    #[error("Invalid descriptor list: {0}")]
    InvalidDescriptors(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using [`MooringError`].
pub type Result<T> = std::result::Result<T, MooringError>;
