//! Descriptor fixtures.
//!
//! Fluent builders producing raw descriptor JSON in the shape hosts hand to
//! the engine, plus a seeded generator for bulk descriptor sets.

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use mooring_core::extension::RemoteKey;

/// Builder for one raw descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    id: String,
    url: String,
    remote: String,
    module: String,
    target: String,
    position: Option<String>,
    observer_roots: Option<Value>,
    props: Map<String, Value>,
    routes: Vec<String>,
}

impl DescriptorBuilder {
    /// Descriptor for `id` loading `./Widget` from remote `remote_app`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: "https://cdn.example.com/remoteEntry.js".to_string(),
            remote: "remote_app".to_string(),
            module: "./Widget".to_string(),
            target: "#slot".to_string(),
            position: None,
            observer_roots: None,
            props: Map::new(),
            routes: Vec::new(),
        }
    }

    pub fn remote(mut self, url: impl Into<String>, name: impl Into<String>) -> Self {
        self.url = url.into();
        self.remote = name.into();
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn target(mut self, selector: impl Into<String>) -> Self {
        self.target = selector.into();
        self
    }

    pub fn position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// Observe the subtree spanned by `selector`.
    pub fn observe(mut self, selector: impl Into<String>) -> Self {
        self.observer_roots = Some(Value::String(selector.into()));
        self
    }

    /// Observe the whole document.
    pub fn observe_document(mut self) -> Self {
        self.observer_roots = Some(Value::Bool(true));
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn route(mut self, pattern: impl Into<String>) -> Self {
        self.routes.push(pattern.into());
        self
    }

    /// Remote key the registry will load for this descriptor.
    pub fn key(&self) -> String {
        RemoteKey::new(&self.remote, &self.module).to_string()
    }

    pub fn build(self) -> Value {
        let mut injection = json!({ "target": self.target });
        if let Some(position) = self.position {
            injection["position"] = Value::String(position);
        }
        if let Some(roots) = self.observer_roots {
            injection["observerRoots"] = roots;
        }
        let mut descriptor = json!({
            "id": self.id,
            "remote": { "url": self.url, "name": self.remote, "module": self.module },
            "injection": injection,
        });
        if !self.props.is_empty() {
            descriptor["props"] = Value::Object(self.props);
        }
        if !self.routes.is_empty() {
            descriptor["visibility"] = json!({ "routes": self.routes });
        }
        descriptor
    }
}

/// Parse a descriptor fixture: either a JSON array or an object with a
/// `extensions` array.
pub fn descriptors_from_json(text: &str) -> anyhow::Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text).context("descriptor fixture is not JSON")?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("extensions") {
            Some(Value::Array(items)) => Ok(items),
            _ => bail!("descriptor fixture object has no `extensions` array"),
        },
        other => bail!("unexpected descriptor fixture: {}", other),
    }
}

/// Seeded generator for descriptor sets.
pub struct DescriptorGenerator {
    rng: StdRng,
}

impl DescriptorGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `count` valid descriptors spread over `remotes` remotes, each targeting
    /// one of `targets` and visible under a random `/section-N/*` route.
    pub fn generate(&mut self, count: usize, remotes: usize, targets: &[&str]) -> Vec<Value> {
        let remotes = remotes.max(1);
        (0..count)
            .map(|i| {
                let remote = self.rng.gen_range(0..remotes);
                let section = self.rng.gen_range(0..4);
                let mut builder = DescriptorBuilder::new(format!("ext-{}", i))
                    .remote(
                        format!("https://remote-{}.example.com/remoteEntry.js", remote),
                        format!("remote_{}", remote),
                    )
                    .route(format!("/section-{}/*", section));
                if !targets.is_empty() {
                    let target = targets[self.rng.gen_range(0..targets.len())];
                    builder = builder.target(target);
                }
                if self.rng.gen_bool(0.3) {
                    builder = builder.position("prepend");
                }
                builder.build()
            })
            .collect()
    }

    /// Mix of valid and malformed descriptors. Returns the list and how many
    /// are malformed.
    pub fn generate_with_garbage(&mut self, count: usize) -> (Vec<Value>, usize) {
        let mut garbage = 0;
        let descriptors = (0..count)
            .map(|i| {
                if self.rng.gen_bool(0.25) {
                    garbage += 1;
                    match self.rng.gen_range(0..3) {
                        0 => json!("not an object"),
                        1 => json!({ "id": format!("broken-{}", i) }),
                        _ => DescriptorBuilder::new(format!("bad-position-{}", i))
                            .position("sideways")
                            .build(),
                    }
                } else {
                    DescriptorBuilder::new(format!("ext-{}", i)).build()
                }
            })
            .collect();
        (descriptors, garbage)
    }
}
