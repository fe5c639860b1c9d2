//! Usage probe: the caller's view of current consumption.

use async_trait::async_trait;

use crate::error::ProbeError;

/// Reports current usage of a resource for a project.
///
/// Supplied per `enforce` call and consulted at most once per requested resource. The
/// returned figure is authoritative for that call; the engine does not serialize it against
/// concurrent commits.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn usage(&self, project_id: &str, resource_name: &str) -> Result<u64, ProbeError>;
}

#[async_trait]
impl<F> UsageProbe for F
where
    F: Fn(&str, &str) -> Result<u64, ProbeError> + Send + Sync,
{
    async fn usage(&self, project_id: &str, resource_name: &str) -> Result<u64, ProbeError> {
        self(project_id, resource_name)
    }
}

/// Pins a closure to the probe signature so its argument and return types are inferred.
pub fn probe_fn<F>(f: F) -> F
where
    F: Fn(&str, &str) -> Result<u64, ProbeError> + Send + Sync,
{
    f
}
