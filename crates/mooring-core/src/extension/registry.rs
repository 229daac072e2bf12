//! Remote module registry.
//!
//! The registry provides:
//! - Idempotent remote registration with one-time origin warmup
//! - Deduplicated loads: one shared future per [`RemoteKey`]
//! - A per-extension component cache, timing marks and incident ledger
//!
//! Nothing in here returns an error to the caller. Every failure becomes an
//! incident attributed to an extension id, and the caller sees "no component".

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::component::ComponentRef;
use super::incident::{IncidentCode, IncidentLedger, IncidentReport};
use super::loader::{RemoteLoader, RemoteModule};
use super::types::{ExtensionConfig, RemoteKey};
use crate::config::HostSettings;

/// Why a shared load settled without a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub code: IncidentCode,
    pub message: String,
}

type LoadOutcome = Result<RemoteModule, LoadFailure>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct InflightLoad {
    generation: u64,
    future: SharedLoad,
}

/// Monotonic marks, each set at most once.
#[derive(Debug, Clone, Copy, Default)]
struct Timings {
    register: Option<Instant>,
    load_start: Option<Instant>,
    resolved: Option<Instant>,
    render: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    Register,
    LoadStart,
    Resolved,
    Render,
}

impl Timings {
    /// Returns `true` if the mark was newly set.
    fn stamp(&mut self, mark: Mark) -> bool {
        let slot = match mark {
            Mark::Register => &mut self.register,
            Mark::LoadStart => &mut self.load_start,
            Mark::Resolved => &mut self.resolved,
            Mark::Render => &mut self.render,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(Instant::now());
        true
    }

    fn offset_ms(&self, mark: Option<Instant>) -> Option<u64> {
        let base = self.register?;
        mark.map(|at| at.saturating_duration_since(base).as_millis() as u64)
    }
}

/// Timing marks of one extension, as millisecond offsets from registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub registered_at: DateTime<Utc>,
    pub load_start_ms: Option<u64>,
    pub resolved_ms: Option<u64>,
    pub render_ms: Option<u64>,
}

/// Host-wide incident totals. Never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub totals: BTreeMap<IncidentCode, u64>,
}

impl IncidentSummary {
    pub fn total(&self, code: IncidentCode) -> u64 {
        self.totals.get(&code).copied().unwrap_or(0)
    }
}

struct RegistryEntry {
    /// Changes every time the entry is created again after a release.
    activation: u64,
    component: Option<ComponentRef>,
    timings: Timings,
    incidents: IncidentLedger,
    registered_at: DateTime<Utc>,
}

impl RegistryEntry {
    fn new(activation: u64) -> Self {
        Self {
            activation,
            component: None,
            timings: Timings::default(),
            incidents: IncidentLedger::default(),
            registered_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    registered: HashSet<String>,
    warmed_origins: HashSet<String>,
    loads: HashMap<RemoteKey, InflightLoad>,
    entries: HashMap<String, RegistryEntry>,
    totals: BTreeMap<IncidentCode, u64>,
    next_generation: u64,
    next_activation: u64,
}

impl RegistryState {
    fn entry(&mut self, id: &str) -> &mut RegistryEntry {
        let next = &mut self.next_activation;
        self.entries.entry(id.to_string()).or_insert_with(|| {
            let activation = *next;
            *next += 1;
            RegistryEntry::new(activation)
        })
    }

    /// The entry for `id`, unless it was released or recreated since `activation`.
    fn current(&mut self, id: &str, activation: u64) -> Option<&mut RegistryEntry> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.activation == activation)
    }
}

/// Whether an incident is reported (counted host-wide, logged once) or only
/// counted against the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    Report,
    CountOnly,
}

/// Registry for remote bundles and the components loaded from them.
pub struct ModuleRegistry {
    loader: Arc<dyn RemoteLoader>,
    remote_load_timeout: Duration,
    host_origin: Option<String>,
    state: Mutex<RegistryState>,
}

impl ModuleRegistry {
    /// Create a registry over a loader.
    pub fn new(loader: Arc<dyn RemoteLoader>, settings: &HostSettings) -> Self {
        let host_origin = settings.host_origin.as_deref().and_then(origin_of);
        Self {
            loader,
            remote_load_timeout: settings.remote_load_timeout(),
            host_origin,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register the extension's remote bundle, once per remote name.
    ///
    /// Also fires a best-effort warmup the first time a cross-origin host is seen.
    /// Returns `false` if the remote could not be registered.
    pub fn register_remote(self: &Arc<Self>, config: &ExtensionConfig) -> bool {
        self.register_for(config).is_some()
    }

    /// Registration for one activation of `config.id`. Returns the activation
    /// the caller must present when writing results back.
    fn register_for(self: &Arc<Self>, config: &ExtensionConfig) -> Option<u64> {
        let remote = &config.remote;
        let (activation, claimed, warm_origin) = {
            let mut state = self.state.lock();
            let entry = state.entry(&config.id);
            entry.timings.stamp(Mark::Register);
            let activation = entry.activation;

            let claimed = state.registered.insert(remote.name.clone());
            let warm_origin = self
                .cross_origin_of(&remote.url)
                .filter(|origin| state.warmed_origins.insert(origin.clone()));
            (activation, claimed, warm_origin)
        };

        if claimed {
            if let Err(e) = self.loader.register(&remote.name, &remote.url) {
                {
                    let mut state = self.state.lock();
                    state.registered.remove(&remote.name);
                    if let Some(origin) = &warm_origin {
                        state.warmed_origins.remove(origin);
                    }
                }
                self.note_incident(
                    &config.id,
                    Some(activation),
                    IncidentCode::RemoteRegisterError,
                    &e.to_string(),
                    Attribution::Report,
                );
                return None;
            }
            debug!(
                category = "plugins",
                remote = %remote.name,
                url = %remote.url,
                "Registered remote"
            );
        }

        if let Some(origin) = warm_origin {
            self.spawn_warmup(config.id.clone(), activation, origin);
        }

        Some(activation)
    }

    /// Resolve the component for an extension.
    ///
    /// Concurrent callers for the same [`RemoteKey`] await one shared load. The
    /// component is cached per extension id, and only if the id was not released
    /// while the load was in flight.
    pub async fn load_plugin(self: &Arc<Self>, config: &ExtensionConfig) -> Option<ComponentRef> {
        let activation = self.register_for(config)?;

        let key = config.remote_key();
        let (generation, future) = self.shared_load(&config.id, activation, &key);

        match future.await {
            Ok(module) => match module.component() {
                Some(component) => {
                    let stale = {
                        let mut state = self.state.lock();
                        match state.current(&config.id, activation) {
                            Some(entry) => {
                                entry.component = Some(component.clone());
                                entry.timings.stamp(Mark::Resolved);
                                false
                            }
                            None => true,
                        }
                    };
                    if stale {
                        debug!(
                            category = "plugins",
                            extension_id = %config.id,
                            remote_key = %key,
                            "Dropping component resolved for a released activation"
                        );
                        return None;
                    }
                    debug!(
                        category = "plugins",
                        extension_id = %config.id,
                        remote_key = %key,
                        component = component.name(),
                        "Resolved plugin component"
                    );
                    Some(component)
                }
                None => {
                    self.note_incident(
                        &config.id,
                        Some(activation),
                        IncidentCode::UnknownError,
                        &format!("module {} is neither invocable nor has a default export", key),
                        Attribution::Report,
                    );
                    None
                }
            },
            Err(failure) => {
                // Every waiter counts the failure; only the one that forgets the load reports it.
                let attribution = if self.forget_failed_load(&key, generation) {
                    Attribution::Report
                } else {
                    Attribution::CountOnly
                };
                self.note_incident(
                    &config.id,
                    Some(activation),
                    failure.code,
                    &failure.message,
                    attribution,
                );
                None
            }
        }
    }

    /// Cached component for an extension id.
    pub fn get_plugin(&self, id: &str) -> Option<ComponentRef> {
        self.state
            .lock()
            .entries
            .get(id)
            .and_then(|entry| entry.component.clone())
    }

    /// Stamp the render mark. On the first render the incident ledger is reset.
    /// Returns `true` the first time.
    pub fn mark_render(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        if !entry.timings.stamp(Mark::Render) {
            return false;
        }
        entry.incidents.reset();
        let timings = entry.timings;
        drop(state);

        info!(
            category = "plugins",
            extension_id = %id,
            load_ms = ?timings.offset_ms(timings.resolved),
            render_ms = ?timings.offset_ms(timings.render),
            "Plugin rendered"
        );
        true
    }

    /// Attribute a failure to an extension. Only the first occurrence of a code
    /// is logged with detail.
    pub fn record_incident(&self, id: &str, code: IncidentCode, detail: &str) {
        self.note_incident(id, None, code, detail, Attribution::Report);
    }

    /// With an `activation`, the incident is dropped from the per-extension
    /// ledger if that activation was released. Reported incidents always reach
    /// the host-wide totals.
    fn note_incident(
        &self,
        id: &str,
        activation: Option<u64>,
        code: IncidentCode,
        detail: &str,
        attribution: Attribution,
    ) {
        let noted = {
            let mut state = self.state.lock();
            if attribution == Attribution::Report {
                *state.totals.entry(code).or_insert(0) += 1;
            }
            let entry = match activation {
                Some(activation) => state.current(id, activation),
                None => Some(state.entry(id)),
            };
            entry.map(|entry| {
                let first = match attribution {
                    Attribution::Report => entry.incidents.record(code),
                    Attribution::CountOnly => {
                        entry.incidents.count_only(code);
                        false
                    }
                };
                (first, entry.incidents.count(code))
            })
        };

        let Some((first, count)) = noted else {
            debug!(category = "plugins", extension_id = %id, code = %code, "Incident for a released activation: {}", detail);
            return;
        };
        if first {
            warn!(
                category = "plugins",
                extension_id = %id,
                code = %code,
                "Plugin incident: {}",
                detail
            );
        } else {
            debug!(category = "plugins", extension_id = %id, code = %code, count, "Plugin incident repeated");
        }
    }

    /// Drop everything held for an extension id. Shared loads are left alone.
    pub fn release(&self, id: &str) {
        self.state.lock().entries.remove(id);
    }

    /// Drop every extension entry.
    pub fn release_all(&self) {
        self.state.lock().entries.clear();
    }

    pub fn timings(&self, id: &str) -> Option<TimingSnapshot> {
        let state = self.state.lock();
        let entry = state.entries.get(id)?;
        let t = entry.timings;
        Some(TimingSnapshot {
            registered_at: entry.registered_at,
            load_start_ms: t.offset_ms(t.load_start),
            resolved_ms: t.offset_ms(t.resolved),
            render_ms: t.offset_ms(t.render),
        })
    }

    pub fn incidents(&self, id: &str) -> IncidentReport {
        self.state
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.incidents.report())
            .unwrap_or_default()
    }

    pub fn incident_summary(&self) -> IncidentSummary {
        IncidentSummary {
            totals: self.state.lock().totals.clone(),
        }
    }

    fn shared_load(&self, id: &str, activation: u64, key: &RemoteKey) -> (u64, SharedLoad) {
        let mut state = self.state.lock();
        if let Some(entry) = state.current(id, activation) {
            entry.timings.stamp(Mark::LoadStart);
        }

        if let Some(load) = state.loads.get(key) {
            return (load.generation, load.future.clone());
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let loader = self.loader.clone();
        let timeout = self.remote_load_timeout;
        let load_key = key.clone();
        let future = async move {
            match tokio::time::timeout(timeout, loader.load(&load_key)).await {
                Ok(Ok(module)) => Ok(module),
                Ok(Err(e)) => Err(LoadFailure {
                    code: e.incident_code(),
                    message: e.to_string(),
                }),
                Err(_) => Err(LoadFailure {
                    code: IncidentCode::RemoteLoadTimeout,
                    message: format!(
                        "loading {} timed out after {}ms",
                        load_key,
                        timeout.as_millis()
                    ),
                }),
            }
        }
        .boxed()
        .shared();

        state.loads.insert(
            key.clone(),
            InflightLoad {
                generation,
                future: future.clone(),
            },
        );
        debug!(category = "plugins", extension_id = %id, remote_key = %key, "Starting remote load");
        (generation, future)
    }

    /// Failed loads are forgotten so a later attempt fetches again. Returns
    /// `true` for the caller that removed the load.
    fn forget_failed_load(&self, key: &RemoteKey, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state
            .loads
            .get(key)
            .is_some_and(|load| load.generation == generation)
        {
            state.loads.remove(key);
            return true;
        }
        false
    }

    /// Serialized origin of `url` when it differs from the host origin.
    fn cross_origin_of(&self, url: &str) -> Option<String> {
        let origin = origin_of(url)?;
        match &self.host_origin {
            Some(host) if *host == origin => None,
            _ => Some(origin),
        }
    }

    fn spawn_warmup(self: &Arc<Self>, id: String, activation: u64, origin: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(category = "plugins", origin = %origin, "No runtime, skipping origin warmup");
            return;
        };
        let registry = Arc::clone(self);
        handle.spawn(async move {
            match registry.loader.warmup(&origin).await {
                Ok(()) => debug!(category = "plugins", origin = %origin, "Warmed up origin"),
                Err(e) => registry.note_incident(
                    &id,
                    Some(activation),
                    IncidentCode::RemoteRegisterError,
                    &format!("warmup of {} failed: {}", origin, e),
                    Attribution::Report,
                ),
            }
        });
    }
}

/// `scheme://host[:port]` of an absolute http(s) URL. Relative URLs have no
/// origin of their own and are treated as same-origin.
fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}
