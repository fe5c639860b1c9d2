//! # limit
//!
//! Unified-limits enforcement for services: check that a proposed usage change keeps a
//! project under the quota assigned to it, without the service storing limits itself.
//!
//! ## Pieces
//!
//! - [`registry`]: [`RegistryClient`] seam; [`KeystoneRegistry`] (HTTP) and [`StaticRegistry`]
//!   (in-process). Records cover the project, its ancestors and the default scope.
//! - [`resolver`]: [`resolve`] walks project -> ancestors -> default and keeps the first explicit
//!   record per resource. Silence inherits; no record anywhere means unlimited.
//! - [`cache`]: [`LimitCache`], time-bounded per project with single-flight fills and
//!   [`LimitCache::invalidate`].
//! - [`enforcer`]: [`Enforcer::enforce`] probes current usage once per resource and admits the
//!   whole request or none of it. Strict limits deny; soft limits only flag.
//!
//! Settings come from `limit-config` ([`Enforcer::from_settings`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use limit::{probe_fn, Enforcer, LimitValue, RegistryRecord, StaticRegistry, UsageRequest};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), limit::LimitError> {
//! let registry = StaticRegistry::new()
//!     .with_project("alpha", None)
//!     .with_record(RegistryRecord::default_scope("cpu", LimitValue::Capped(10)));
//! let enforcer = Enforcer::new(Arc::new(registry));
//!
//! let request = UsageRequest::new("alpha").add_resource("cpu", 3);
//! let result = enforcer.enforce(&request, &probe_fn(|_, _| Ok(5))).await?;
//! assert!(result.admitted);
//! # Ok(())
//! # }
//! ```
//!
//! Admission is decided on the usage the probe reports. Callers that need race-free
//! admission must commit usage under their own lock or optimistic check, then recheck with a
//! zero delta.

pub mod cache;
pub mod enforcer;
pub mod error;
pub mod model;
pub mod probe;
pub mod registry;
pub mod resolver;

pub use cache::LimitCache;
pub use enforcer::{Enforcer, EnforcerBuilder};
pub use error::{LimitError, ProbeError};
pub use model::{
    EnforcementResult, LimitValue, ProjectLimitSet, ProjectRecords, RegistryRecord, ResourceLimit,
    ResourceOutcome, Scope, UsageRequest, UNLIMITED_SENTINEL,
};
pub use probe::{probe_fn, UsageProbe};
pub use registry::{
    fetch_with_timeout, HttpClient, KeystoneRegistry, RegistryClient, ReqwestHttpClient,
    StaticRegistry,
};
pub use resolver::{resolve, resolve_limit_set};
