//! Descriptor validation and defaulting.
//!
//! Turns the raw, host-delivered descriptor list into [`ExtensionConfig`]s. A bad
//! entry is dropped and counted; it never poisons the rest of the set.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

use super::types::{
    ExtensionConfig, InjectionSpec, ObserverRoots, Position, Props, RemoteSpec, Visibility,
};
use crate::error::{MooringError, Result};

/// Why a descriptor was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("descriptor is not an object")]
    NotAnObject,

    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("field {field} has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown injection position: {0}")]
    UnknownPosition(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),
}

impl ConfigError {
    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotAnObject => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::WrongType { .. } => "wrong_type",
            Self::UnknownPosition(_) => "unknown_position",
            Self::DuplicateId(_) => "duplicate_id",
        }
    }
}

/// A dropped descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDescriptor {
    /// Position in the input list.
    pub index: usize,
    /// The id, when one could be read.
    pub id: Option<String>,
    pub error: ConfigError,
}

/// Outcome of normalizing a descriptor list.
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub accepted: Vec<ExtensionConfig>,
    pub rejected: Vec<RejectedDescriptor>,
}

impl NormalizeReport {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

/// Normalize a list of raw descriptors. First occurrence of an id wins.
pub fn normalize_descriptors(raw: &[Value]) -> NormalizeReport {
    let mut report = NormalizeReport::default();
    let mut seen = HashSet::new();

    for (index, candidate) in raw.iter().enumerate() {
        let outcome = normalize_one(candidate).and_then(|config| {
            if seen.insert(config.id.clone()) {
                Ok(config)
            } else {
                Err(ConfigError::DuplicateId(config.id))
            }
        });

        match outcome {
            Ok(config) => report.accepted.push(config),
            Err(error) => {
                let id = candidate
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                debug!(
                    category = "plugins",
                    code = "invalid_config",
                    index,
                    extension_id = ?id,
                    reason = error.reason(),
                    "Dropping extension descriptor: {}",
                    error
                );
                report.rejected.push(RejectedDescriptor { index, id, error });
            }
        }
    }

    if !report.rejected.is_empty() {
        debug!(
            category = "plugins",
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Normalized extension descriptors"
        );
    }

    report
}

/// Normalize a JSON document holding an array of descriptors.
pub fn normalize_json(document: &str) -> Result<NormalizeReport> {
    let value: Value = serde_json::from_str(document)?;
    match value {
        Value::Array(items) => Ok(normalize_descriptors(&items)),
        other => Err(MooringError::InvalidDescriptors(format!(
            "expected an array, got {}",
            json_kind(&other)
        ))),
    }
}

/// Validate and default a single descriptor.
pub fn normalize_one(raw: &Value) -> std::result::Result<ExtensionConfig, ConfigError> {
    let object = raw.as_object().ok_or(ConfigError::NotAnObject)?;

    let id = required_str(object, "id", "id")?;

    let remote = object
        .get("remote")
        .and_then(Value::as_object)
        .ok_or(ConfigError::MissingField("remote"))?;
    let remote = RemoteSpec {
        url: required_str(remote, "url", "remote.url")?,
        name: required_str(remote, "name", "remote.name")?,
        module: required_str(remote, "module", "remote.module")?,
    };

    let injection = object
        .get("injection")
        .and_then(Value::as_object)
        .ok_or(ConfigError::MissingField("injection"))?;
    let target = required_str(injection, "target", "injection.target")?;

    let position = match injection.get("position") {
        None | Some(Value::Null) => Position::default(),
        Some(Value::String(s)) => {
            Position::parse(s).ok_or_else(|| ConfigError::UnknownPosition(s.clone()))?
        }
        Some(_) => {
            return Err(ConfigError::WrongType {
                field: "injection.position",
                expected: "string",
            })
        }
    };

    let observer_roots = match injection.get("observerRoots") {
        None | Some(Value::Null) => ObserverRoots::Disabled,
        Some(Value::Bool(flag)) => ObserverRoots::from_flag(*flag),
        Some(Value::String(s)) if s.trim().is_empty() => ObserverRoots::Disabled,
        Some(Value::String(s)) => ObserverRoots::Selector(s.trim().to_string()),
        Some(_) => {
            return Err(ConfigError::WrongType {
                field: "injection.observerRoots",
                expected: "string or boolean",
            })
        }
    };

    let props: Props = match object.get("props") {
        None | Some(Value::Null) => Props::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(_) => {
            return Err(ConfigError::WrongType {
                field: "props",
                expected: "object",
            })
        }
    };

    let routes = match object.get("visibility") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(visibility)) => match visibility.get("routes") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or(ConfigError::WrongType {
                        field: "visibility.routes",
                        expected: "array of strings",
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ConfigError::WrongType {
                    field: "visibility.routes",
                    expected: "array of strings",
                })
            }
        },
        Some(_) => {
            return Err(ConfigError::WrongType {
                field: "visibility",
                expected: "object",
            })
        }
    };

    Ok(ExtensionConfig {
        id,
        remote,
        injection: InjectionSpec {
            target,
            position,
            observer_roots,
        },
        props,
        visibility: Visibility { routes },
    })
}

fn required_str(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> std::result::Result<String, ConfigError> {
    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) | None | Some(Value::Null) => Err(ConfigError::MissingField(field)),
        Some(_) => Err(ConfigError::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(id: &str) -> Value {
        json!({
            "id": id,
            "remote": { "url": "https://cdn.x/remoteEntry.js", "name": "x", "module": "./Widget" },
            "injection": { "target": "#slot" }
        })
    }

    #[test]
    fn test_defaults_applied() {
        let config = normalize_one(&minimal("a")).unwrap();
        assert_eq!(config.injection.position, Position::Append);
        assert_eq!(config.injection.observer_roots, ObserverRoots::Disabled);
        assert!(config.props.is_empty());
        assert!(config.visibility.routes.is_empty());
    }

    #[test]
    fn test_full_descriptor() {
        let raw = json!({
            "id": "toolbar",
            "remote": { "url": "/plugins/remoteEntry.js", "name": "tools", "module": "./Toolbar" },
            "injection": { "target": ".header", "position": "replace", "observerRoots": ".layout" },
            "props": { "label": "Share", "compact": true },
            "visibility": { "routes": ["/docs/*", "!/docs/new"] }
        });
        let config = normalize_one(&raw).unwrap();
        assert_eq!(config.injection.position, Position::Replace);
        assert_eq!(
            config.injection.observer_roots,
            ObserverRoots::Selector(".layout".to_string())
        );
        assert_eq!(config.props.get("label"), Some(&json!("Share")));
        assert_eq!(config.visibility.routes.len(), 2);
    }

    #[test]
    fn test_invalid_entries_dropped_not_fatal() {
        let raw = vec![
            minimal("a"),
            json!({ "id": "b", "remote": { "url": "u", "name": "n" }, "injection": { "target": "#x" } }),
            json!("not an object"),
            json!({ "id": "", "remote": { "url": "u", "name": "n", "module": "m" }, "injection": { "target": "#x" } }),
            json!({ "id": "c", "remote": { "url": "u", "name": "n", "module": "m" }, "injection": {} }),
            minimal("d"),
        ];
        let report = normalize_descriptors(&raw);
        let ids: Vec<_> = report.accepted.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(report.rejected_count(), 4);
        assert_eq!(report.rejected[0].index, 1);
        assert_eq!(report.rejected[0].error, ConfigError::MissingField("remote.module"));
        assert_eq!(report.rejected[1].error, ConfigError::NotAnObject);
    }

    #[test]
    fn test_duplicate_id_first_wins() {
        let mut second = minimal("a");
        second["injection"]["target"] = json!("#other");
        let report = normalize_descriptors(&[minimal("a"), second]);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].injection.target, "#slot");
        assert_eq!(report.rejected[0].error.reason(), "duplicate_id");
    }

    #[test]
    fn test_bad_position_and_types_rejected() {
        let mut bad_position = minimal("a");
        bad_position["injection"]["position"] = json!("inside");
        assert_eq!(
            normalize_one(&bad_position),
            Err(ConfigError::UnknownPosition("inside".to_string()))
        );

        let mut bad_routes = minimal("a");
        bad_routes["visibility"] = json!({ "routes": [1, 2] });
        assert!(matches!(
            normalize_one(&bad_routes),
            Err(ConfigError::WrongType { field: "visibility.routes", .. })
        ));

        let mut bad_roots = minimal("a");
        bad_roots["injection"]["observerRoots"] = json!(3);
        assert!(normalize_one(&bad_roots).is_err());
    }

    #[test]
    fn test_normalize_json_requires_array() {
        assert!(normalize_json("{}").is_err());
        let report = normalize_json(&serde_json::to_string(&vec![minimal("a")]).unwrap()).unwrap();
        assert_eq!(report.accepted.len(), 1);
    }
}
