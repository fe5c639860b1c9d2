//! Registry clients: where raw limit records come from.
//!
//! [`RegistryClient`] is the I/O seam. [`StaticRegistry`] serves an in-process project tree;
//! [`KeystoneRegistry`] talks to a Keystone-style unified limits API over HTTP.

mod keystone;
mod static_registry;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LimitError;
use crate::model::ProjectRecords;

pub use keystone::{HttpClient, KeystoneRegistry, ReqwestHttpClient};
pub use static_registry::StaticRegistry;

/// Read-only source of limit records.
///
/// Implementations do not retry. Transport failures map to
/// [`LimitError::RegistryUnavailable`], unknown projects to [`LimitError::RegistryNotFound`].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Records for `project_id`, each ancestor up to the root, and the default scope.
    async fn fetch(&self, project_id: &str) -> Result<ProjectRecords, LimitError>;
}

/// Runs [`RegistryClient::fetch`] under a deadline; expiry is `RegistryUnavailable`.
pub async fn fetch_with_timeout(
    client: &dyn RegistryClient,
    project_id: &str,
    timeout: Duration,
) -> Result<ProjectRecords, LimitError> {
    match tokio::time::timeout(timeout, client.fetch(project_id)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(project_id, ?timeout, "limit registry fetch timed out");
            Err(LimitError::RegistryUnavailable(format!(
                "fetch for project {project_id} timed out after {timeout:?}"
            )))
        }
    }
}
