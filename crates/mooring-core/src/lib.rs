//! Dynamic extension loading and injection engine.
//!
//! Extensions are described by JSON descriptors naming a remote module, an
//! anchor selector and the routes they are visible on. The engine loads each
//! remote once, injects containers next to every matching anchor, renders the
//! component inside a failure boundary and tears everything down again when
//! the route changes.

pub mod config;
pub mod dom;
pub mod error;
pub mod extension;
pub mod host;
pub mod telemetry;

pub use config::HostSettings;
pub use error::{MooringError, Result};
pub use host::{ExtensionInfo, PluginHost};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, HostSettings};

    // Error handling
    pub use crate::error::{MooringError, Result};

    // Document
    pub use crate::dom::{
        container_dom_id, ContainerEvent, Document, DocumentError, DomInjector, DynDocument,
        InsertPosition, MutationCallback, NodeRef, ObserverId,
    };

    // Extensions
    pub use crate::extension::{
        ComponentRef, ExtensionConfig, ExtensionState, FnComponent, IncidentCode, LoaderError,
        ModuleRegistry, ObserverRoots, PluginComponent, Position, RemoteKey, RemoteLoader,
        RemoteModule, RenderContext, RenderError, RenderedContent,
    };

    // Host
    pub use crate::host::{ExtensionInfo, PluginHost};
}
