//! Lifecycle coordination.
//!
//! [`PluginHost`] owns the registry and injector for one host mount and drives
//! them from navigation:
//!
//! ```text
//! unregistered ──eligible──► pending ──rendered──► mounted
//!      ▲                        │                     │
//!      │                   load failed            render crash
//!      │                        ▼                     ▼
//!      └──── next eligibility ─ failed            ejected
//! ```
//!
//! Leaving the eligible set (navigation or shutdown) tears an extension down
//! from any state back to unregistered.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HostSettings;
use crate::dom::{container_dom_id, ContainerEvent, DomInjector, DynDocument, NodeRef};
use crate::extension::{
    install_render_panic_hook, normalize_descriptors, ComponentRef, ConfigError, CrashHandler,
    ExtensionConfig, ExtensionState, IncidentCode, IncidentReport, IsolationBoundary,
    ModuleRegistry, NormalizeReport, RemoteLoader, RenderContext, RenderError, RouteMatcher,
    TimingSnapshot,
};

/// Status of one extension, as reported by [`PluginHost::extensions`].
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub state: ExtensionState,
    /// DOM ids of the containers currently known for this extension.
    pub containers: Vec<String>,
    pub timings: Option<TimingSnapshot>,
    pub incidents: IncidentReport,
}

struct RouteScoped {
    config: ExtensionConfig,
    routes: RouteMatcher,
}

struct Tracked {
    config: ExtensionConfig,
    epoch: u64,
    state: ExtensionState,
}

#[derive(Debug, Clone)]
struct MountSlot {
    dom_id: String,
    anchor_index: usize,
}

#[derive(Default)]
struct HostState {
    configs: Vec<RouteScoped>,
    path: String,
    tracked: HashMap<String, Tracked>,
    /// Terminal outcome of ids that were ejected or failed and are not tracked.
    outcomes: HashMap<String, ExtensionState>,
    slots: HashMap<String, BTreeMap<NodeRef, MountSlot>>,
    debounce: Option<(u64, JoinHandle<()>)>,
    next_epoch: u64,
    next_debounce: u64,
    shut_down: bool,
}

struct HostInner {
    settings: HostSettings,
    document: DynDocument,
    registry: Arc<ModuleRegistry>,
    injector: Arc<DomInjector>,
    state: Mutex<HostState>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinates extension lifecycles for one host mount.
pub struct PluginHost {
    inner: Arc<HostInner>,
}

impl PluginHost {
    /// Create a host. Must be called inside a tokio runtime.
    pub fn new(
        document: DynDocument,
        loader: Arc<dyn RemoteLoader>,
        settings: HostSettings,
    ) -> Self {
        install_render_panic_hook();

        let registry = Arc::new(ModuleRegistry::new(loader, &settings));
        let injector = DomInjector::new(document.clone(), &settings);
        let events = injector.subscribe();
        let inner = Arc::new(HostInner {
            settings,
            document,
            registry,
            injector,
            state: Mutex::new(HostState {
                path: "/".to_string(),
                ..Default::default()
            }),
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(run_events(Arc::downgrade(&inner), events));
        *inner.event_loop.lock() = Some(handle);
        Self { inner }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    pub fn injector(&self) -> &Arc<DomInjector> {
        &self.inner.injector
    }

    /// Replace the descriptor set from raw host configuration and reconcile
    /// against the current path.
    pub fn set_descriptors(&self, raw: &[serde_json::Value]) -> NormalizeReport {
        let report = normalize_descriptors(raw);
        for rejected in &report.rejected {
            // A duplicate shares its id with the accepted descriptor.
            if matches!(rejected.error, ConfigError::DuplicateId(_)) {
                debug!(category = "plugins", index = rejected.index, "Dropped duplicate descriptor");
                continue;
            }
            if let Some(id) = &rejected.id {
                self.inner.registry.record_incident(
                    id,
                    IncidentCode::InvalidConfig,
                    &rejected.error.to_string(),
                );
            }
        }
        self.set_configs(report.accepted.clone());
        report
    }

    /// Replace the descriptor set with already-validated configs.
    pub fn set_configs(&self, configs: Vec<ExtensionConfig>) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.configs = configs
                .into_iter()
                .map(|config| RouteScoped {
                    routes: RouteMatcher::new(&config.visibility.routes),
                    config,
                })
                .collect();
        }
        self.inner.reconcile(true);
    }

    /// Navigation event. Eligibility is recomputed once the debounce window
    /// passes without another navigation.
    pub fn navigate(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return;
        }
        if let Some((_, pending)) = state.debounce.take() {
            pending.abort();
        }
        let seq = state.next_debounce;
        state.next_debounce += 1;

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.settings.navigation_debounce();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                {
                    let mut state = inner.state.lock();
                    if state.debounce.as_ref().is_some_and(|(s, _)| *s == seq) {
                        state.debounce = None;
                    }
                }
                inner.apply_route(path);
            }
        });
        state.debounce = Some((seq, handle));
    }

    /// Apply a path immediately, skipping the debounce.
    pub fn navigate_now(&self, path: impl Into<String>) {
        self.inner.apply_route(path.into());
    }

    pub fn current_path(&self) -> String {
        self.inner.state.lock().path.clone()
    }

    /// Whether a debounced navigation is waiting to be applied.
    pub fn has_pending_navigation(&self) -> bool {
        self.inner.state.lock().debounce.is_some()
    }

    /// Tear an extension down right now after a render crash.
    pub fn eject(&self, id: &str, error: &RenderError) {
        self.inner.eject(id, None, &error.to_string());
    }

    pub fn state(&self, id: &str) -> ExtensionState {
        self.inner.state_of(id)
    }

    /// Ids currently tracked as eligible, in descriptor order.
    pub fn eligible(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .configs
            .iter()
            .filter(|scoped| state.tracked.contains_key(&scoped.config.id))
            .map(|scoped| scoped.config.id.clone())
            .collect()
    }

    /// Status of every known extension, in descriptor order.
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        let rows: Vec<(String, ExtensionState, Vec<String>)> = {
            let state = self.inner.state.lock();
            state
                .configs
                .iter()
                .map(|scoped| {
                    let id = &scoped.config.id;
                    let containers = state
                        .slots
                        .get(id)
                        .map(|slots| slots.values().map(|slot| slot.dom_id.clone()).collect())
                        .unwrap_or_default();
                    (id.clone(), state_in(&state, id), containers)
                })
                .collect()
        };
        rows.into_iter()
            .map(|(id, state, containers)| ExtensionInfo {
                timings: self.inner.registry.timings(&id),
                incidents: self.inner.registry.incidents(&id),
                id,
                state,
                containers,
            })
            .collect()
    }

    /// Host unmount: cancel timers, tear down every extension, release the
    /// registry and stop the event loop.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl HostInner {
    fn apply_route(self: &Arc<Self>, path: String) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            debug!(category = "plugins", from = %state.path, to = %path, "Navigation");
            state.path = path;
        }
        self.reconcile(true);
    }

    /// Diff the eligible set for the current path against the tracked set.
    fn reconcile(self: &Arc<Self>, allow_bootstrap: bool) {
        let mut to_stop = Vec::new();
        let mut to_start = Vec::new();
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            let eligible: HashMap<&str, &ExtensionConfig> = state
                .configs
                .iter()
                .filter(|scoped| scoped.routes.matches(&state.path))
                .map(|scoped| (scoped.config.id.as_str(), &scoped.config))
                .collect();

            for (id, tracked) in &state.tracked {
                match eligible.get(id.as_str()) {
                    Some(config) if **config == tracked.config => {}
                    _ => to_stop.push(id.clone()),
                }
            }
            let starting: Vec<ExtensionConfig> = state
                .configs
                .iter()
                .map(|scoped| &scoped.config)
                .filter(|config| eligible.contains_key(config.id.as_str()))
                .filter(|config| {
                    to_stop.contains(&config.id) || !state.tracked.contains_key(&config.id)
                })
                .cloned()
                .collect();

            for id in &to_stop {
                state.tracked.remove(id);
                state.slots.remove(id);
                state.outcomes.remove(id);
            }
            for config in starting {
                let epoch = state.next_epoch;
                state.next_epoch += 1;
                state.outcomes.remove(&config.id);
                state.tracked.insert(
                    config.id.clone(),
                    Tracked {
                        config: config.clone(),
                        epoch,
                        state: ExtensionState::Pending,
                    },
                );
                to_start.push((config, epoch));
            }
        }

        for id in &to_stop {
            self.injector.stop(id);
            self.registry.release(id);
            info!(category = "plugins", extension_id = %id, "Plugin left eligible set");
        }
        for (config, epoch) in to_start {
            info!(category = "plugins", extension_id = %config.id, "Plugin entered eligible set");
            if !self.registry.register_remote(&config) {
                self.fail(&config.id, epoch);
                continue;
            }
            self.spawn_preload(config.clone(), epoch);
            self.injector.start(std::slice::from_ref(&config));
        }
        self.injector.refresh(allow_bootstrap);
    }

    fn spawn_preload(self: &Arc<Self>, config: ExtensionConfig, epoch: u64) {
        let weak = Arc::downgrade(self);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            // Stopped before the task ran; the registry entry is gone and must stay gone.
            let current = weak
                .upgrade()
                .is_some_and(|inner| inner.config_for(&config.id, epoch).is_some());
            if !current {
                return;
            }
            let component = registry.load_plugin(&config).await;
            if component.is_none() {
                if let Some(inner) = weak.upgrade() {
                    inner.fail(&config.id, epoch);
                }
            }
        });
    }

    fn on_event(self: &Arc<Self>, event: ContainerEvent) {
        match event {
            ContainerEvent::Added {
                extension_id,
                container,
                dom_id,
                anchor_index,
            } => {
                let epoch = {
                    let mut state = self.state.lock();
                    let Some(epoch) = state.tracked.get(&extension_id).map(|t| t.epoch) else {
                        return;
                    };
                    state.slots.entry(extension_id.clone()).or_default().insert(
                        container,
                        MountSlot {
                            dom_id: dom_id.clone(),
                            anchor_index,
                        },
                    );
                    epoch
                };
                self.spawn_mount(extension_id, epoch, container, dom_id, anchor_index);
            }
            ContainerEvent::Removed {
                extension_id,
                container,
                ..
            } => {
                let mut state = self.state.lock();
                let now_empty = match state.slots.get_mut(&extension_id) {
                    Some(slots) => {
                        slots.remove(&container);
                        slots.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    state.slots.remove(&extension_id);
                    if let Some(tracked) = state.tracked.get_mut(&extension_id) {
                        if tracked.state == ExtensionState::Mounted {
                            tracked.state = ExtensionState::Pending;
                        }
                    }
                }
            }
            ContainerEvent::BootstrapExpired { extension_id } => {
                self.registry.record_incident(
                    &extension_id,
                    IncidentCode::BootstrapTimeout,
                    &format!(
                        "anchor not found within {}ms",
                        self.settings.bootstrap_timeout_ms
                    ),
                );
            }
        }
    }

    /// Pick up containers whose events were dropped by a lagging receiver.
    fn resync(self: &Arc<Self>) {
        let tracked: Vec<String> = self.state.lock().tracked.keys().cloned().collect();
        for id in tracked {
            for (index, container) in self.injector.get_containers(&id).into_iter().enumerate() {
                let known = self
                    .state
                    .lock()
                    .slots
                    .get(&id)
                    .is_some_and(|slots| slots.contains_key(&container));
                if !known {
                    self.on_event(ContainerEvent::Added {
                        extension_id: id.clone(),
                        container,
                        dom_id: container_dom_id(&id, index),
                        anchor_index: index,
                    });
                }
            }
        }
    }

    fn spawn_mount(
        self: &Arc<Self>,
        id: String,
        epoch: u64,
        container: NodeRef,
        dom_id: String,
        anchor_index: usize,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let Some(config) = inner.config_for(&id, epoch) else {
                return;
            };
            let component = match inner.registry.get_plugin(&id) {
                Some(component) => component,
                None => match inner.registry.load_plugin(&config).await {
                    Some(component) => component,
                    None => {
                        inner.fail(&id, epoch);
                        return;
                    }
                },
            };
            inner.mount(&config, epoch, &component, container, &dom_id, anchor_index);
        });
    }

    /// Render one instance into its container inside an isolation boundary.
    fn mount(
        self: &Arc<Self>,
        config: &ExtensionConfig,
        epoch: u64,
        component: &ComponentRef,
        container: NodeRef,
        dom_id: &str,
        anchor_index: usize,
    ) {
        let still_wanted = {
            let state = self.state.lock();
            state.tracked.get(&config.id).is_some_and(|t| t.epoch == epoch)
                && state
                    .slots
                    .get(&config.id)
                    .is_some_and(|slots| slots.contains_key(&container))
        };
        if !still_wanted || !self.document.is_connected(container) {
            return;
        }

        let weak: Weak<HostInner> = Arc::downgrade(self);
        let on_crash: CrashHandler = Arc::new(move |id: &str, e: &RenderError| {
            if let Some(inner) = weak.upgrade() {
                inner.eject(id, Some(epoch), &e.to_string());
            }
        });
        let ctx = RenderContext {
            extension_id: &config.id,
            container_id: dom_id,
            anchor_index,
            props: &config.props,
        };
        let Some(content) = IsolationBoundary::new(on_crash).render(component, &ctx) else {
            return;
        };

        self.document.set_content(container, &content);
        self.injector.mark_rendered(&config.id, container);
        self.registry.mark_render(&config.id);

        let mut state = self.state.lock();
        if let Some(tracked) = state.tracked.get_mut(&config.id) {
            if tracked.epoch == epoch && tracked.state != ExtensionState::Mounted {
                tracked.state = ExtensionState::Mounted;
                debug!(category = "plugins", extension_id = %config.id, container = %dom_id, "Plugin mounted");
            }
        }
    }

    /// Immediate teardown after a render crash. `epoch` limits the ejection to
    /// one activation of the extension.
    fn eject(&self, id: &str, epoch: Option<u64>, detail: &str) {
        if !self.untrack(id, epoch, ExtensionState::Ejected) {
            return;
        }
        self.registry
            .record_incident(id, IncidentCode::RenderError, detail);
        self.injector.stop(id);
        self.registry.release(id);
        error!(category = "plugins", extension_id = %id, "Plugin ejected after render crash");
    }

    /// Teardown after a failed or unusable load. The incident is already recorded.
    fn fail(&self, id: &str, epoch: u64) {
        if !self.untrack(id, Some(epoch), ExtensionState::Failed) {
            return;
        }
        self.injector.stop(id);
        self.registry.release(id);
        warn!(category = "plugins", extension_id = %id, "Plugin unavailable, removed until next activation");
    }

    fn untrack(&self, id: &str, epoch: Option<u64>, outcome: ExtensionState) -> bool {
        let mut state = self.state.lock();
        let current = state
            .tracked
            .get(id)
            .is_some_and(|t| epoch.map_or(true, |e| e == t.epoch));
        if !current {
            return false;
        }
        state.tracked.remove(id);
        state.slots.remove(id);
        state.outcomes.insert(id.to_string(), outcome);
        true
    }

    fn config_for(&self, id: &str, epoch: u64) -> Option<ExtensionConfig> {
        self.state
            .lock()
            .tracked
            .get(id)
            .filter(|t| t.epoch == epoch)
            .map(|t| t.config.clone())
    }

    fn state_of(&self, id: &str) -> ExtensionState {
        state_in(&self.state.lock(), id)
    }

    fn shutdown(&self) {
        let ids: HashSet<String> = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            if let Some((_, pending)) = state.debounce.take() {
                pending.abort();
            }
            state.slots.clear();
            state.outcomes.clear();
            state.tracked.drain().map(|(id, _)| id).collect()
        };
        self.injector.destroy();
        self.registry.release_all();
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        info!(category = "plugins", count = ids.len(), "Plugin host shut down");
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.get_mut().take() {
            handle.abort();
        }
        if let Some((_, pending)) = self.state.get_mut().debounce.take() {
            pending.abort();
        }
    }
}

fn state_in(state: &HostState, id: &str) -> ExtensionState {
    if let Some(tracked) = state.tracked.get(id) {
        return tracked.state;
    }
    state
        .outcomes
        .get(id)
        .copied()
        .unwrap_or(ExtensionState::Unregistered)
}

async fn run_events(inner: Weak<HostInner>, mut events: broadcast::Receiver<ContainerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.on_event(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(category = "plugins", skipped, "Container events lagged, resyncing");
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.resync();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
