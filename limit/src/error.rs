//! Enforcement errors.
//!
//! Every failure is scoped to the single `enforce` or resolution call that raised it; none
//! is fatal to the process. [`LimitError`] is `Clone` because a single failed cache fill is
//! handed to every caller waiting on it.

use thiserror::Error;

use crate::model::LimitValue;

/// Errors returned by the registry, resolver, cache and enforcer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    /// Transport failure or deadline expiry while talking to the registry. Transient.
    #[error("limit registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The registry does not know the project.
    #[error("project not found in limit registry: {project_id}")]
    RegistryNotFound { project_id: String },

    /// Registry data is malformed or contradictory (e.g. two records for one resource at
    /// the same scope). The offending records are included.
    #[error("conflicting limit records for {resource_name} at scope {scope}: {records:?}")]
    ResolutionConflict {
        resource_name: String,
        scope: String,
        records: Vec<String>,
    },

    /// The caller's usage probe failed.
    #[error("usage probe failed for {resource_name}: {message}")]
    UsageProbe {
        resource_name: String,
        message: String,
    },

    /// The usage request itself is malformed (empty project id or resource name).
    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    /// Settings cannot produce a working enforcer (e.g. no registry URL).
    #[error("invalid enforcer configuration: {0}")]
    Configuration(String),

    /// A strict limit would be exceeded. Returned by `EnforcementResult::into_result`.
    #[error(
        "{usage} {resource_name} have been used. Claiming {quantity} {resource_name} \
         would exceed the current limit of {limit}"
    )]
    ClaimExceedsLimit {
        resource_name: String,
        usage: u64,
        quantity: i64,
        limit: LimitValue,
    },
}

/// Error raised by a [`UsageProbe`](crate::probe::UsageProbe) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
