//! Extension descriptors, remote loading and render isolation.
//!
//! # Architecture
//!
//! ```text
//!   raw descriptors ──► normalize ──► ExtensionConfig ──► routes (per navigation)
//!                                           │
//!                                           ▼
//!                                    ModuleRegistry ──► RemoteLoader (register / load / warmup)
//!                                           │
//!                                           ▼
//!                              ComponentRef ──► IsolationBoundary ──► container
//! ```

pub mod component;
pub mod incident;
pub mod isolation;
pub mod loader;
pub mod normalize;
pub mod registry;
pub mod routes;
pub mod types;

pub use component::{
    ComponentRef, FnComponent, PluginComponent, RenderContext, RenderError, RenderedContent,
};
pub use incident::{IncidentCode, IncidentLedger, IncidentReport};
pub use isolation::{install_render_panic_hook, CrashHandler, IsolationBoundary};
pub use loader::{LoaderError, RemoteLoader, RemoteModule};
pub use normalize::{
    normalize_descriptors, normalize_json, normalize_one, ConfigError, NormalizeReport,
    RejectedDescriptor,
};
pub use registry::{IncidentSummary, LoadFailure, ModuleRegistry, TimingSnapshot};
pub use routes::RouteMatcher;
pub use types::{
    ExtensionConfig, ExtensionState, InjectionSpec, ObserverRoots, Position, Props, RemoteKey,
    RemoteSpec, Visibility,
};
