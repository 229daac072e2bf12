//! Anchor resolution, container placement and tree observation.
//!
//! For each started extension the injector:
//! - resolves `injection.target` into anchors and keeps one container per anchor,
//!   identified by `plugin-container-{id}-{index}` so passes are idempotent
//! - attaches one reference-counted observer per observed root, shared by every
//!   extension watching that root
//! - waits for missing anchors with a bootstrap observer bounded by a timeout
//! - coalesces mutation bursts into at most one pending frame per extension
//!
//! Observer callbacks only forward a [`Signal`] over a channel; all work happens
//! on the driver task so no callback ever runs under the injector lock.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    nearest_common_ancestor, DynDocument, InsertPosition, MutationCallback, NodeRef, ObserverId,
};
use crate::config::HostSettings;
use crate::extension::{ExtensionConfig, ObserverRoots, Position};

/// Marker set on `replace` originals once the replacement has rendered.
pub const HIDDEN_ATTRIBUTE: &str = "data-pluginsystem-hidden";

/// Marker set on every container, holding the owning extension id.
pub const CONTAINER_ATTRIBUTE: &str = "data-plugin-container";

const PRE_HIDE_PROPERTY: &str = "display";
const PRE_HIDE_VALUE: &str = "none";

/// Deterministic DOM id of the container for one anchor.
pub fn container_dom_id(extension_id: &str, anchor_index: usize) -> String {
    format!("plugin-container-{}-{}", extension_id, anchor_index)
}

/// Changes the lifecycle coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Added {
        extension_id: String,
        container: NodeRef,
        dom_id: String,
        anchor_index: usize,
    },
    Removed {
        extension_id: String,
        container: NodeRef,
        dom_id: String,
    },
    /// A bootstrap observer gave up waiting for its anchor.
    BootstrapExpired { extension_id: String },
}

impl ContainerEvent {
    pub fn extension_id(&self) -> &str {
        match self {
            Self::Added { extension_id, .. }
            | Self::Removed { extension_id, .. }
            | Self::BootstrapExpired { extension_id } => extension_id,
        }
    }
}

#[derive(Debug, Clone)]
enum Signal {
    RootMutated(NodeRef),
    Bootstrap(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    node: NodeRef,
    dom_id: String,
    anchor: NodeRef,
}

struct SharedObserver {
    observer: ObserverId,
    refs: usize,
}

struct Bootstrap {
    observer: ObserverId,
    timeout: JoinHandle<()>,
}

#[derive(Default)]
struct InjectorState {
    configs: HashMap<String, ExtensionConfig>,
    containers: HashMap<String, Vec<Slot>>,
    roots: HashMap<String, HashSet<NodeRef>>,
    observers: HashMap<NodeRef, SharedObserver>,
    bootstraps: HashMap<String, Bootstrap>,
    frames: HashMap<String, JoinHandle<()>>,
    /// `replace` originals carrying [`HIDDEN_ATTRIBUTE`].
    hidden: HashMap<String, HashSet<NodeRef>>,
    /// `replace` originals carrying the inline pre-hide, with their previous
    /// inline `display` value.
    pre_hidden: HashMap<String, HashMap<NodeRef, Option<String>>>,
}

/// Mounts containers at anchors and keeps them in sync with the tree.
pub struct DomInjector {
    document: DynDocument,
    bootstrap_timeout: Duration,
    frame_interval: Duration,
    state: Mutex<InjectorState>,
    signals: mpsc::UnboundedSender<Signal>,
    events: broadcast::Sender<ContainerEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DomInjector {
    /// Create an injector and spawn its signal driver. Must be called inside a
    /// tokio runtime.
    pub fn new(document: DynDocument, settings: &HostSettings) -> Arc<Self> {
        let (signals, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let injector = Arc::new(Self {
            document,
            bootstrap_timeout: settings.bootstrap_timeout(),
            frame_interval: settings.frame_interval(),
            state: Mutex::new(InjectorState::default()),
            signals,
            events,
            driver: Mutex::new(None),
        });
        let handle = tokio::spawn(drive(Arc::downgrade(&injector), rx));
        *injector.driver.lock() = Some(handle);
        injector
    }

    /// Subscribe to container events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    /// Start injecting the given extensions. Already started ids with an
    /// unchanged descriptor are left alone; a changed descriptor restarts the id.
    pub fn start(self: &Arc<Self>, configs: &[ExtensionConfig]) {
        for config in configs {
            let unchanged = {
                let state = self.state.lock();
                state.configs.get(&config.id) == Some(config)
            };
            if unchanged {
                continue;
            }
            self.stop(&config.id);
            self.state
                .lock()
                .configs
                .insert(config.id.clone(), config.clone());
            debug!(
                category = "plugins",
                extension_id = %config.id,
                target = %config.injection.target,
                position = %config.injection.position,
                "Starting injection"
            );
            self.run_pass(&config.id, true);
        }
    }

    /// Tear down everything held for `id`.
    pub fn stop(&self, id: &str) {
        let mut events = Vec::new();
        let mut disconnect = Vec::new();
        let was_known;
        {
            let mut state = self.state.lock();
            was_known = state.configs.remove(id).is_some();

            for root in state.roots.remove(id).unwrap_or_default() {
                if let Some(observer) = release_root(&mut state, root) {
                    disconnect.push(observer);
                }
            }
            if let Some(bootstrap) = state.bootstraps.remove(id) {
                bootstrap.timeout.abort();
                disconnect.push(bootstrap.observer);
            }
            if let Some(frame) = state.frames.remove(id) {
                frame.abort();
            }

            for slot in state.containers.remove(id).unwrap_or_default() {
                self.document.remove(slot.node);
                events.push(ContainerEvent::Removed {
                    extension_id: id.to_string(),
                    container: slot.node,
                    dom_id: slot.dom_id,
                });
            }
            for anchor in state.hidden.remove(id).unwrap_or_default() {
                self.document.remove_attribute(anchor, HIDDEN_ATTRIBUTE);
            }
            for (anchor, previous) in state.pre_hidden.remove(id).unwrap_or_default() {
                self.restore_display(anchor, previous);
            }
        }

        for observer in disconnect {
            self.document.disconnect(observer);
        }
        if was_known {
            debug!(category = "plugins", extension_id = %id, "Stopped injection");
        }
        self.emit(events);
    }

    /// Stop every known extension.
    pub fn destroy(&self) {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .configs
                .keys()
                .chain(state.containers.keys())
                .chain(state.roots.keys())
                .chain(state.bootstraps.keys())
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        for id in &ids {
            self.stop(id);
        }
        info!(category = "plugins", count = ids.len(), "Injector destroyed");
    }

    /// Re-run an injection pass for every started extension.
    pub fn refresh(self: &Arc<Self>, allow_bootstrap: bool) {
        let ids: Vec<String> = self.state.lock().configs.keys().cloned().collect();
        for id in ids {
            self.run_pass(&id, allow_bootstrap);
        }
    }

    /// Containers currently mounted for `id`, in anchor order.
    pub fn get_containers(&self, id: &str) -> Vec<NodeRef> {
        self.state
            .lock()
            .containers
            .get(id)
            .map(|slots| slots.iter().map(|slot| slot.node).collect())
            .unwrap_or_default()
    }

    /// Switch the anchor behind `container` from the inline pre-hide to the
    /// persistent hidden marker. No-op outside `replace` mode.
    pub fn mark_rendered(&self, id: &str, container: NodeRef) {
        let mut state = self.state.lock();
        let Some(anchor) = state
            .containers
            .get(id)
            .and_then(|slots| slots.iter().find(|slot| slot.node == container))
            .map(|slot| slot.anchor)
        else {
            return;
        };
        let Some(previous) = state
            .pre_hidden
            .get_mut(id)
            .and_then(|anchors| anchors.remove(&anchor))
        else {
            return;
        };
        // Marker first, then drop the inline style: the anchor is never shown.
        self.document.set_attribute(anchor, HIDDEN_ATTRIBUTE, "true");
        self.restore_display(anchor, previous);
        state.hidden.entry(id.to_string()).or_default().insert(anchor);
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.state.lock().configs.contains_key(id)
    }

    pub fn has_bootstrap(&self, id: &str) -> bool {
        self.state.lock().bootstraps.contains_key(id)
    }

    pub fn has_pending_frame(&self, id: &str) -> bool {
        self.state.lock().frames.contains_key(id)
    }

    /// Number of extensions sharing the observer on `root`.
    pub fn root_ref_count(&self, root: NodeRef) -> usize {
        self.state
            .lock()
            .observers
            .get(&root)
            .map(|shared| shared.refs)
            .unwrap_or(0)
    }

    /// Shared root observers plus bootstrap observers.
    pub fn observer_count(&self) -> usize {
        let state = self.state.lock();
        state.observers.len() + state.bootstraps.len()
    }

    /// One injection pass for `id`.
    fn run_pass(self: &Arc<Self>, id: &str, allow_bootstrap: bool) {
        let mut events = Vec::new();
        let mut disconnect = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get(id).cloned() else {
                return;
            };

            let anchors = self.resolve_anchors(&config);
            match &config.injection.observer_roots {
                ObserverRoots::Disabled => {
                    if !anchors.is_empty() {
                        disconnect.extend(cancel_bootstrap(&mut state, id));
                    } else if allow_bootstrap {
                        self.ensure_bootstrap(&mut state, id);
                    }
                }
                ObserverRoots::Document => {
                    let root = self.document.root();
                    disconnect.extend(self.retain_only_root(&mut state, id, Some(root)));
                }
                ObserverRoots::Selector(selector) => {
                    let candidates = self.query(id, selector);
                    let root = nearest_common_ancestor(self.document.as_ref(), &candidates);
                    disconnect.extend(self.retain_only_root(&mut state, id, root));
                    if root.is_some() {
                        disconnect.extend(cancel_bootstrap(&mut state, id));
                    } else if allow_bootstrap {
                        self.ensure_bootstrap(&mut state, id);
                    }
                }
            }

            self.reconcile(&mut state, &config, &anchors, &mut events);
        }

        for observer in disconnect {
            self.document.disconnect(observer);
        }
        self.emit(events);
    }

    fn resolve_anchors(&self, config: &ExtensionConfig) -> Vec<NodeRef> {
        self.query(&config.id, &config.injection.target)
            .into_iter()
            .filter(|node| self.document.attribute(*node, CONTAINER_ATTRIBUTE).is_none())
            .collect()
    }

    fn query(&self, id: &str, selector: &str) -> Vec<NodeRef> {
        match self.document.query_selector_all(selector) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(category = "plugins", extension_id = %id, selector, error = %e, "Selector query failed");
                Vec::new()
            }
        }
    }

    /// Make `root` the only root `id` references. Returns observers that lost
    /// their last reference.
    fn retain_only_root(
        &self,
        state: &mut InjectorState,
        id: &str,
        root: Option<NodeRef>,
    ) -> Vec<ObserverId> {
        let current = state.roots.remove(id).unwrap_or_default();
        let mut released = Vec::new();
        for old in current.iter().copied() {
            if Some(old) != root {
                released.extend(release_root(state, old));
            }
        }

        let Some(root) = root else {
            return released;
        };
        if !current.contains(&root) {
            let signals = self.signals.clone();
            let shared = state.observers.entry(root).or_insert_with(|| {
                let callback: MutationCallback = Arc::new(move || {
                    let _ = signals.send(Signal::RootMutated(root));
                });
                debug!(category = "plugins", root = %root, "Attaching shared observer");
                SharedObserver {
                    observer: self.document.observe(root, callback),
                    refs: 0,
                }
            });
            shared.refs += 1;
        }
        state.roots.entry(id.to_string()).or_default().insert(root);
        released
    }

    fn ensure_bootstrap(self: &Arc<Self>, state: &mut InjectorState, id: &str) {
        if state.bootstraps.contains_key(id) {
            return;
        }

        let signals = self.signals.clone();
        let owner = id.to_string();
        let callback: MutationCallback = Arc::new(move || {
            let _ = signals.send(Signal::Bootstrap(owner.clone()));
        });
        let observer = self.document.observe(self.document.root(), callback);

        let weak = Arc::downgrade(self);
        let owner = id.to_string();
        let timeout = self.bootstrap_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(injector) = weak.upgrade() {
                injector.expire_bootstrap(&owner);
            }
        });

        debug!(category = "plugins", extension_id = %id, "Waiting for anchor with bootstrap observer");
        state.bootstraps.insert(
            id.to_string(),
            Bootstrap {
                observer,
                timeout: handle,
            },
        );
    }

    fn expire_bootstrap(&self, id: &str) {
        let bootstrap = {
            let mut state = self.state.lock();
            if let Some(frame) = state.frames.remove(id) {
                frame.abort();
            }
            state.bootstraps.remove(id)
        };
        let Some(bootstrap) = bootstrap else {
            return;
        };
        self.document.disconnect(bootstrap.observer);
        warn!(
            category = "plugins",
            extension_id = %id,
            timeout_ms = self.bootstrap_timeout.as_millis() as u64,
            "Anchor never appeared, bootstrap observer expired"
        );
        self.emit(vec![ContainerEvent::BootstrapExpired {
            extension_id: id.to_string(),
        }]);
    }

    /// A mutation under the document root while `id` is bootstrapping.
    fn on_bootstrap_mutation(self: &Arc<Self>, id: &str) {
        let resolved = {
            let state = self.state.lock();
            if !state.bootstraps.contains_key(id) {
                return;
            }
            let Some(config) = state.configs.get(id) else {
                return;
            };
            match &config.injection.observer_roots {
                ObserverRoots::Selector(selector) => !self.query(id, selector).is_empty(),
                _ => !self.resolve_anchors(config).is_empty(),
            }
        };
        if !resolved {
            return;
        }

        let disconnect = cancel_bootstrap(&mut self.state.lock(), id);
        for observer in disconnect {
            self.document.disconnect(observer);
        }
        debug!(category = "plugins", extension_id = %id, "Bootstrap resolved");
        self.run_pass(id, false);
    }

    fn on_root_mutated(self: &Arc<Self>, root: NodeRef) {
        let ids: Vec<String> = self
            .state
            .lock()
            .roots
            .iter()
            .filter(|(_, roots)| roots.contains(&root))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.request_frame(&id);
        }
    }

    /// Schedule one coalesced pass for `id` unless one is already pending.
    fn request_frame(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock();
        if state.frames.contains_key(id) || !state.configs.contains_key(id) {
            return;
        }
        let weak = Arc::downgrade(self);
        let owner = id.to_string();
        let interval = self.frame_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(injector) = weak.upgrade() {
                injector.state.lock().frames.remove(&owner);
                injector.run_pass(&owner, false);
            }
        });
        state.frames.insert(id.to_string(), handle);
    }

    /// Diff current anchors against existing containers.
    fn reconcile(
        &self,
        state: &mut InjectorState,
        config: &ExtensionConfig,
        anchors: &[NodeRef],
        events: &mut Vec<ContainerEvent>,
    ) {
        let id = config.id.as_str();
        let position = config.injection.position;
        let previous = state.containers.remove(id).unwrap_or_default();
        let mut current = Vec::with_capacity(anchors.len());

        for (index, anchor) in anchors.iter().copied().enumerate() {
            let dom_id = container_dom_id(id, index);
            let reused = previous
                .iter()
                .find(|slot| slot.dom_id == dom_id && self.document.is_connected(slot.node))
                .cloned();

            let node = match reused {
                Some(slot) => {
                    if slot.anchor != anchor || !self.is_placed(slot.node, anchor, position) {
                        self.place(slot.node, anchor, position);
                    }
                    slot.node
                }
                None => {
                    let node = match self.document.element_by_id(&dom_id) {
                        Some(existing) => existing,
                        None => {
                            let node = self.document.create_element("div");
                            self.document.set_attribute(node, "id", &dom_id);
                            self.document.set_attribute(node, CONTAINER_ATTRIBUTE, id);
                            node
                        }
                    };
                    self.place(node, anchor, position);
                    events.push(ContainerEvent::Added {
                        extension_id: id.to_string(),
                        container: node,
                        dom_id: dom_id.clone(),
                        anchor_index: index,
                    });
                    node
                }
            };

            if position == Position::Replace {
                self.pre_hide(state, id, anchor);
            }
            current.push(Slot {
                node,
                dom_id,
                anchor,
            });
        }

        for slot in previous {
            if current.iter().any(|kept| kept.node == slot.node) {
                continue;
            }
            self.document.remove(slot.node);
            events.push(ContainerEvent::Removed {
                extension_id: id.to_string(),
                container: slot.node,
                dom_id: slot.dom_id,
            });
        }

        if position == Position::Replace {
            self.unhide_stale(state, id, anchors);
        }

        if current.is_empty() {
            state.containers.remove(id);
        } else {
            state.containers.insert(id.to_string(), current);
        }
    }

    fn place(&self, node: NodeRef, anchor: NodeRef, position: Position) {
        let at = match position {
            Position::Before | Position::Replace => InsertPosition::Before,
            Position::After => InsertPosition::After,
            Position::Prepend => InsertPosition::Prepend,
            Position::Append => InsertPosition::Append,
        };
        if let Err(e) = self.document.insert(node, anchor, at) {
            warn!(category = "plugins", anchor = %anchor, error = %e, "Failed to place container");
        }
    }

    /// Whether `node` still sits where `position` puts it relative to `anchor`.
    fn is_placed(&self, node: NodeRef, anchor: NodeRef, position: Position) -> bool {
        let parent = self.document.parent(node);
        match position {
            Position::Before | Position::After | Position::Replace => {
                parent.is_some() && parent == self.document.parent(anchor)
            }
            Position::Prepend | Position::Append => parent == Some(anchor),
        }
    }

    fn pre_hide(&self, state: &mut InjectorState, id: &str, anchor: NodeRef) {
        let already = state
            .hidden
            .get(id)
            .is_some_and(|hidden| hidden.contains(&anchor))
            || state
                .pre_hidden
                .get(id)
                .is_some_and(|pre| pre.contains_key(&anchor));
        if already {
            return;
        }
        let previous = self.document.style_property(anchor, PRE_HIDE_PROPERTY);
        self.document
            .set_style_property(anchor, PRE_HIDE_PROPERTY, Some(PRE_HIDE_VALUE));
        state
            .pre_hidden
            .entry(id.to_string())
            .or_default()
            .insert(anchor, previous);
    }

    /// Revert hiding on originals that no longer match the target.
    fn unhide_stale(&self, state: &mut InjectorState, id: &str, anchors: &[NodeRef]) {
        if let Some(hidden) = state.hidden.get_mut(id) {
            hidden.retain(|anchor| {
                let keep = anchors.contains(anchor);
                if !keep {
                    self.document.remove_attribute(*anchor, HIDDEN_ATTRIBUTE);
                }
                keep
            });
        }
        if let Some(pre) = state.pre_hidden.get_mut(id) {
            let stale: Vec<NodeRef> = pre
                .keys()
                .filter(|anchor| !anchors.contains(anchor))
                .copied()
                .collect();
            for anchor in stale {
                if let Some(previous) = pre.remove(&anchor) {
                    self.restore_display(anchor, previous);
                }
            }
        }
    }

    fn restore_display(&self, anchor: NodeRef, previous: Option<String>) {
        self.document
            .set_style_property(anchor, PRE_HIDE_PROPERTY, previous.as_deref());
    }

    fn emit(&self, events: Vec<ContainerEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

impl Drop for DomInjector {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
        let state = self.state.get_mut();
        for (_, bootstrap) in state.bootstraps.drain() {
            bootstrap.timeout.abort();
            self.document.disconnect(bootstrap.observer);
        }
        for (_, frame) in state.frames.drain() {
            frame.abort();
        }
        for (_, shared) in state.observers.drain() {
            self.document.disconnect(shared.observer);
        }
    }
}

/// Decrement the reference count on `root`; returns the observer to disconnect
/// when it reaches zero.
fn release_root(state: &mut InjectorState, root: NodeRef) -> Option<ObserverId> {
    let shared = state.observers.get_mut(&root)?;
    shared.refs = shared.refs.saturating_sub(1);
    if shared.refs > 0 {
        return None;
    }
    state.observers.remove(&root).map(|shared| shared.observer)
}

fn cancel_bootstrap(state: &mut InjectorState, id: &str) -> Option<ObserverId> {
    let bootstrap = state.bootstraps.remove(id)?;
    bootstrap.timeout.abort();
    Some(bootstrap.observer)
}

async fn drive(
    injector: Weak<DomInjector>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(injector) = injector.upgrade() else {
            break;
        };
        match signal {
            Signal::RootMutated(root) => injector.on_root_mutated(root),
            Signal::Bootstrap(id) => injector.on_bootstrap_mutation(&id),
        }
    }
}
