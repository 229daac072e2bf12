//! Per-extension incident ledger.
//!
//! The first occurrence of a code is logged with detail, later ones are only counted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCode {
    InvalidConfig,
    RemoteRegisterError,
    RemoteLoadTimeout,
    RemoteLoadError,
    UnknownError,
    RenderError,
    /// An anchor never appeared before the bootstrap observer expired.
    BootstrapTimeout,
}

impl IncidentCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::RemoteRegisterError => "remote_register_error",
            Self::RemoteLoadTimeout => "remote_load_timeout",
            Self::RemoteLoadError => "remote_load_error",
            Self::UnknownError => "unknown_error",
            Self::RenderError => "render_error",
            Self::BootstrapTimeout => "bootstrap_timeout",
        }
    }
}

impl fmt::Display for IncidentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts by code plus which codes have already been logged.
#[derive(Debug, Clone, Default)]
pub struct IncidentLedger {
    counts: BTreeMap<IncidentCode, u32>,
    logged_once: BTreeSet<IncidentCode>,
}

impl IncidentLedger {
    /// Count an occurrence. Returns `true` when this is the first one since the
    /// last reset, i.e. the caller should log it.
    pub fn record(&mut self, code: IncidentCode) -> bool {
        *self.counts.entry(code).or_insert(0) += 1;
        self.logged_once.insert(code)
    }

    /// Count an occurrence that another extension already reported.
    pub fn count_only(&mut self, code: IncidentCode) {
        *self.counts.entry(code).or_insert(0) += 1;
    }

    pub fn count(&self, code: IncidentCode) -> u32 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.logged_once.clear();
    }

    pub fn report(&self) -> IncidentReport {
        IncidentReport {
            counts: self.counts.clone(),
            logged: self.logged_once.iter().copied().collect(),
        }
    }
}

/// Snapshot of a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub counts: BTreeMap<IncidentCode, u32>,
    pub logged: Vec<IncidentCode>,
}

impl IncidentReport {
    pub fn count(&self, code: IncidentCode) -> u32 {
        self.counts.get(&code).copied().unwrap_or(0)
    }
}
