//! Extension descriptor types.
//!
//! These are the strict, already-defaulted shapes produced by
//! [`normalize`](super::normalize). Raw host configuration never reaches the
//! registry or injector directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Static props passed to a mounted component.
pub type Props = HashMap<String, serde_json::Value>;

/// A validated extension descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub id: String,
    pub remote: RemoteSpec,
    pub injection: InjectionSpec,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub visibility: Visibility,
}

impl ExtensionConfig {
    /// Key used to deduplicate in-flight loads of the same exported unit.
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey::new(&self.remote.name, &self.remote.module)
    }
}

/// Where the remote bundle lives and which unit to import from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub url: String,
    pub name: String,
    pub module: String,
}

/// Where and how to mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionSpec {
    pub target: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default, rename = "observerRoots")]
    pub observer_roots: ObserverRoots,
}

/// Placement of a container relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Before,
    After,
    Replace,
    Prepend,
    #[default]
    Append,
}

impl Position {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before" => Some(Self::Before),
            "after" => Some(Self::After),
            "replace" => Some(Self::Replace),
            "prepend" => Some(Self::Prepend),
            "append" => Some(Self::Append),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Replace => "replace",
            Self::Prepend => "prepend",
            Self::Append => "append",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the tree to watch for anchor churn.
///
/// `Disabled` mounts once with no ongoing observation, `Document` watches the whole
/// tree, and `Selector` watches the nearest common ancestor of the matching roots.
/// On the wire this is `false`, `true` or a selector string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ObserverRoots {
    #[default]
    Disabled,
    Document,
    Selector(String),
}

impl ObserverRoots {
    pub fn from_flag(flag: bool) -> Self {
        if flag {
            Self::Document
        } else {
            Self::Disabled
        }
    }

    pub fn is_observing(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ObserverRootsWire {
    Flag(bool),
    Selector(String),
}

impl Serialize for ObserverRoots {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Disabled => ObserverRootsWire::Flag(false),
            Self::Document => ObserverRootsWire::Flag(true),
            Self::Selector(s) => ObserverRootsWire::Selector(s.clone()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObserverRoots {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ObserverRootsWire::deserialize(deserializer)? {
            ObserverRootsWire::Flag(flag) => Self::from_flag(flag),
            ObserverRootsWire::Selector(s) => Self::Selector(s),
        })
    }
}

/// Route-scoped visibility rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    #[serde(default)]
    pub routes: Vec<String>,
}

/// `remoteName + "/" + normalizedModulePath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteKey(String);

impl RemoteKey {
    /// Builds the key, dropping a leading `./` or `/` from the module path.
    pub fn new(remote_name: &str, module: &str) -> Self {
        let module = module.trim();
        let module = module
            .strip_prefix("./")
            .or_else(|| module.strip_prefix('/'))
            .unwrap_or(module);
        Self(format!("{}/{}", remote_name.trim(), module))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of one extension id inside the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    /// Not tracked.
    Unregistered,
    /// Eligible and started; component load in flight or not yet rendered.
    Pending,
    /// Rendered into at least one container.
    Mounted,
    /// Torn down after a render crash.
    Ejected,
    /// Torn down because its module could not be loaded or was unusable.
    Failed,
}

impl ExtensionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Pending => "pending",
            Self::Mounted => "mounted",
            Self::Ejected => "ejected",
            Self::Failed => "failed",
        }
    }

    /// Whether the extension currently owns injector state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Mounted)
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
