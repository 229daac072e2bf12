//! Remote bundle loading.
//!
//! The concrete federation mechanism lives behind [`RemoteLoader`]. The registry
//! only needs to register a bundle entry point by name, import one exported unit
//! from it, and optionally prime a connection to its origin.

use async_trait::async_trait;
use std::fmt;

use super::component::ComponentRef;
use super::incident::IncidentCode;
use super::types::RemoteKey;

/// Loader failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Module evaluation failed: {0}")]
    Evaluation(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl LoaderError {
    /// Incident code for a failed load.
    pub fn incident_code(&self) -> IncidentCode {
        match self {
            Self::Registration(_) => IncidentCode::RemoteRegisterError,
            Self::Network(_) | Self::Evaluation(_) | Self::NotFound(_) => {
                IncidentCode::RemoteLoadError
            }
            Self::Other(_) => IncidentCode::UnknownError,
        }
    }
}

/// What importing a remote unit produced.
#[derive(Clone)]
pub enum RemoteModule {
    /// A module namespace. `default` is the default export when it is a component.
    Namespace {
        default: Option<ComponentRef>,
        exports: Vec<String>,
    },
    /// The import itself is invocable.
    Component(ComponentRef),
    /// Anything else, e.g. a plain data export.
    Value(serde_json::Value),
}

impl RemoteModule {
    /// The mountable component, if this module exposes one.
    pub fn component(&self) -> Option<ComponentRef> {
        match self {
            Self::Namespace { default, .. } => default.clone(),
            Self::Component(component) => Some(component.clone()),
            Self::Value(_) => None,
        }
    }
}

impl fmt::Debug for RemoteModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace { default, exports } => f
                .debug_struct("Namespace")
                .field("default", &default.as_ref().map(|c| c.name().to_string()))
                .field("exports", exports)
                .finish(),
            Self::Component(component) => {
                f.debug_tuple("Component").field(&component.name()).finish()
            }
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Loads exported units from remote bundles.
#[async_trait]
pub trait RemoteLoader: Send + Sync {
    /// Register a bundle entry point under a logical name.
    fn register(&self, name: &str, url: &str) -> Result<(), LoaderError>;

    /// Import the unit named by `key`.
    async fn load(&self, key: &RemoteKey) -> Result<RemoteModule, LoaderError>;

    /// Prime a connection to a cross-origin host. Best effort.
    async fn warmup(&self, _origin: &str) -> Result<(), LoaderError> {
        Ok(())
    }
}
