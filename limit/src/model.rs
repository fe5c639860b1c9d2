//! Data model: limit values, scopes, registry records, resolved sets and enforcement results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LimitError;

/// Registry wire value meaning "no cap".
pub const UNLIMITED_SENTINEL: i64 = -1;

/// A resource cap: a non-negative count or unlimited.
///
/// Serialized as an `i64` where `-1` means unlimited. Zero is a real limit: no usage permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum LimitValue {
    Capped(u64),
    Unlimited,
}

impl LimitValue {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, LimitValue::Unlimited)
    }

    /// Whether `projected` usage fits under this limit (equality fits).
    pub fn admits(&self, projected: i128) -> bool {
        match self {
            LimitValue::Unlimited => true,
            LimitValue::Capped(cap) => projected <= i128::from(*cap),
        }
    }
}

impl TryFrom<i64> for LimitValue {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            UNLIMITED_SENTINEL => Ok(LimitValue::Unlimited),
            v if v >= 0 => Ok(LimitValue::Capped(v as u64)),
            v => Err(format!("limit value must be >= 0 or {UNLIMITED_SENTINEL}, got {v}")),
        }
    }
}

impl From<LimitValue> for i64 {
    fn from(value: LimitValue) -> Self {
        match value {
            LimitValue::Unlimited => UNLIMITED_SENTINEL,
            LimitValue::Capped(v) => i64::try_from(v).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Capped(v) => write!(f, "{v}"),
            LimitValue::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Where a registry record applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project(String),
    Default,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project(id) => write!(f, "project:{id}"),
            Scope::Default => f.write_str("default"),
        }
    }
}

/// One raw limit record as returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub scope: Scope,
    pub resource_name: String,
    pub limit_value: LimitValue,
    #[serde(default = "default_strict")]
    pub is_strict: bool,
}

fn default_strict() -> bool {
    true
}

impl RegistryRecord {
    pub fn project(
        project_id: impl Into<String>,
        resource_name: impl Into<String>,
        limit_value: LimitValue,
    ) -> Self {
        Self {
            scope: Scope::Project(project_id.into()),
            resource_name: resource_name.into(),
            limit_value,
            is_strict: true,
        }
    }

    pub fn default_scope(resource_name: impl Into<String>, limit_value: LimitValue) -> Self {
        Self {
            scope: Scope::Default,
            resource_name: resource_name.into(),
            limit_value,
            is_strict: true,
        }
    }

    /// Marks the record as soft: exceeding it is flagged but not denied.
    pub fn soft(mut self) -> Self {
        self.is_strict = false;
        self
    }
}

impl fmt::Display for RegistryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}={} ({})",
            self.scope,
            self.resource_name,
            self.limit_value,
            if self.is_strict { "strict" } else { "soft" }
        )
    }
}

/// Everything the registry knows that is relevant to one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecords {
    pub project_id: String,
    /// The project first, then each ancestor up to the root.
    pub lineage: Vec<String>,
    pub records: Vec<RegistryRecord>,
}

/// A resource's effective cap for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub resource_name: String,
    pub limit_value: LimitValue,
    pub is_strict: bool,
}

impl ResourceLimit {
    pub fn unlimited(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            limit_value: LimitValue::Unlimited,
            is_strict: true,
        }
    }
}

/// Fully materialized limits for a project. Replaced wholesale, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLimitSet {
    pub project_id: String,
    pub limits: BTreeMap<String, ResourceLimit>,
    pub resolved_at: DateTime<Utc>,
}

impl ProjectLimitSet {
    /// Effective limit for `resource_name`; resources without any record are unlimited.
    pub fn limit_for(&self, resource_name: &str) -> ResourceLimit {
        self.limits
            .get(resource_name)
            .cloned()
            .unwrap_or_else(|| ResourceLimit::unlimited(resource_name))
    }
}

/// Proposed usage changes for one project. Negative deltas release usage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsageRequest {
    pub project_id: String,
    pub deltas: BTreeMap<String, i64>,
}

impl UsageRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            deltas: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) the delta for `resource_name`.
    pub fn add_resource(mut self, resource_name: impl Into<String>, delta: i64) -> Self {
        self.deltas.insert(resource_name.into(), delta);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), LimitError> {
        if self.project_id.trim().is_empty() {
            return Err(LimitError::InvalidClaim(
                "project_id must not be empty".to_string(),
            ));
        }
        if self.deltas.keys().any(|name| name.trim().is_empty()) {
            return Err(LimitError::InvalidClaim(
                "resource_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-resource diagnostics for one enforcement call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub current_usage: u64,
    pub requested_delta: i64,
    pub projected_usage: i128,
    pub effective_limit: LimitValue,
    pub is_strict: bool,
    pub over_limit: bool,
}

/// Admission decision plus per-resource outcomes. Admission is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementResult {
    pub admitted: bool,
    pub outcomes: BTreeMap<String, ResourceOutcome>,
}

impl EnforcementResult {
    pub fn empty() -> Self {
        Self {
            admitted: true,
            outcomes: BTreeMap::new(),
        }
    }

    /// Resources over a strict limit; non-empty exactly when the call was denied.
    pub fn denied(&self) -> impl Iterator<Item = (&str, &ResourceOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.over_limit && o.is_strict)
            .map(|(k, o)| (k.as_str(), o))
    }

    /// Resources over a soft limit: admitted but flagged.
    pub fn flagged(&self) -> impl Iterator<Item = (&str, &ResourceOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.over_limit && !o.is_strict)
            .map(|(k, o)| (k.as_str(), o))
    }

    /// Converts a denial into [`LimitError::ClaimExceedsLimit`] for the first denied resource.
    pub fn into_result(self) -> Result<Self, LimitError> {
        if self.admitted {
            return Ok(self);
        }
        let denial = self
            .denied()
            .next()
            .map(|(name, o)| LimitError::ClaimExceedsLimit {
                resource_name: name.to_string(),
                usage: o.current_usage,
                quantity: o.requested_delta,
                limit: o.effective_limit,
            });
        match denial {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
