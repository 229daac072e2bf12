//! Scriptable [`RemoteLoader`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mooring_core::extension::{ComponentRef, LoaderError, RemoteKey, RemoteLoader, RemoteModule};

/// Result scripted for one remote key.
#[derive(Debug, Clone)]
pub enum LoadBehavior {
    Module(RemoteModule),
    Fail(LoaderError),
    /// Never resolves.
    Hang,
}

#[derive(Default)]
struct Calls {
    registrations: Vec<(String, String)>,
    loads: Vec<String>,
    warmups: Vec<String>,
}

/// In-memory loader recording every call.
///
/// Keys are `remote/module` strings as produced by [`RemoteKey`]. Unknown keys
/// fail with [`LoaderError::NotFound`].
#[derive(Default)]
pub struct FakeRemoteLoader {
    behaviors: Mutex<HashMap<String, LoadBehavior>>,
    latency: Mutex<Duration>,
    key_latency: Mutex<HashMap<String, Duration>>,
    register_failures: Mutex<HashSet<String>>,
    warmup_failures: Mutex<HashSet<String>>,
    calls: Mutex<Calls>,
}

impl FakeRemoteLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `component` as the default export of `key`.
    pub fn with_component(self: Arc<Self>, key: &str, component: ComponentRef) -> Arc<Self> {
        self.set_behavior(
            key,
            LoadBehavior::Module(RemoteModule::Namespace {
                default: Some(component),
                exports: vec!["default".to_string()],
            }),
        );
        self
    }

    pub fn with_module(self: Arc<Self>, key: &str, module: RemoteModule) -> Arc<Self> {
        self.set_behavior(key, LoadBehavior::Module(module));
        self
    }

    pub fn with_failure(self: Arc<Self>, key: &str, error: LoaderError) -> Arc<Self> {
        self.set_behavior(key, LoadBehavior::Fail(error));
        self
    }

    pub fn with_hang(self: Arc<Self>, key: &str) -> Arc<Self> {
        self.set_behavior(key, LoadBehavior::Hang);
        self
    }

    /// Delay every load by `latency`.
    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock() = latency;
        self
    }

    /// Delay loads of `key` by `latency`, overriding [`Self::with_latency`].
    pub fn with_key_latency(self: Arc<Self>, key: &str, latency: Duration) -> Arc<Self> {
        self.key_latency.lock().insert(key.to_string(), latency);
        self
    }

    pub fn set_behavior(&self, key: &str, behavior: LoadBehavior) {
        self.behaviors.lock().insert(key.to_string(), behavior);
    }

    /// Make `register` fail for remote `name` until [`Self::heal_registration`].
    pub fn fail_registration(&self, name: &str) {
        self.register_failures.lock().insert(name.to_string());
    }

    pub fn heal_registration(&self, name: &str) {
        self.register_failures.lock().remove(name);
    }

    pub fn fail_warmup(&self, origin: &str) {
        self.warmup_failures.lock().insert(origin.to_string());
    }

    /// `register` calls, failed ones included.
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.calls.lock().registrations.clone()
    }

    pub fn register_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .registrations
            .iter()
            .filter(|(registered, _)| registered == name)
            .count()
    }

    /// Fetches started for `key`.
    pub fn load_count(&self, key: &str) -> usize {
        self.calls.lock().loads.iter().filter(|k| *k == key).count()
    }

    pub fn total_loads(&self) -> usize {
        self.calls.lock().loads.len()
    }

    pub fn warmups(&self) -> Vec<String> {
        self.calls.lock().warmups.clone()
    }
}

#[async_trait]
impl RemoteLoader for FakeRemoteLoader {
    fn register(&self, name: &str, url: &str) -> Result<(), LoaderError> {
        self.calls
            .lock()
            .registrations
            .push((name.to_string(), url.to_string()));
        if self.register_failures.lock().contains(name) {
            return Err(LoaderError::Registration(format!(
                "cannot register {} from {}",
                name, url
            )));
        }
        Ok(())
    }

    async fn load(&self, key: &RemoteKey) -> Result<RemoteModule, LoaderError> {
        self.calls.lock().loads.push(key.as_str().to_string());
        let latency = self
            .key_latency
            .lock()
            .get(key.as_str())
            .copied()
            .unwrap_or_else(|| *self.latency.lock());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let behavior = self.behaviors.lock().get(key.as_str()).cloned();
        tracing::trace!(key = %key, scripted = behavior.is_some(), "Fake remote load");
        match behavior {
            Some(LoadBehavior::Module(module)) => Ok(module),
            Some(LoadBehavior::Fail(error)) => Err(error),
            Some(LoadBehavior::Hang) => std::future::pending().await,
            None => Err(LoaderError::NotFound(key.to_string())),
        }
    }

    async fn warmup(&self, origin: &str) -> Result<(), LoaderError> {
        self.calls.lock().warmups.push(origin.to_string());
        if self.warmup_failures.lock().contains(origin) {
            return Err(LoaderError::Network(format!("cannot reach {}", origin)));
        }
        Ok(())
    }
}
