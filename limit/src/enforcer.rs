//! The enforcer: resolves a project's limits and adjudicates a usage request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use limit_config::{EnforcerSettings, DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT};

use crate::cache::LimitCache;
use crate::error::LimitError;
use crate::model::{EnforcementResult, ProjectLimitSet, ResourceOutcome, UsageRequest};
use crate::probe::UsageProbe;
use crate::registry::{fetch_with_timeout, KeystoneRegistry, RegistryClient, ReqwestHttpClient};
use crate::resolver::resolve_limit_set;

/// Builds an [`Enforcer`] with a custom freshness window, deadline or shared cache.
pub struct EnforcerBuilder {
    registry: Arc<dyn RegistryClient>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
    cache: Option<LimitCache>,
}

impl EnforcerBuilder {
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Shares an existing cache (its own freshness window wins over `cache_ttl`).
    pub fn cache(mut self, cache: LimitCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Enforcer {
        Enforcer {
            registry: self.registry,
            cache: self.cache.unwrap_or_else(|| LimitCache::new(self.cache_ttl)),
            fetch_timeout: self.fetch_timeout,
        }
    }
}

/// Public entry point. Cheap to clone; clones share the registry and the cache.
///
/// `enforce` reads usage through the caller's probe once per resource and decides on that
/// snapshot. It does not serialize concurrent usage commits: two requests that each fit but
/// jointly overflow are both admitted unless the caller pairs `enforce` with its own
/// locked or optimistic commit (a zero-delta re-`enforce` after committing is a valid recheck).
#[derive(Clone)]
pub struct Enforcer {
    registry: Arc<dyn RegistryClient>,
    cache: LimitCache,
    fetch_timeout: Duration,
}

impl Enforcer {
    /// Enforcer with the default freshness window and fetch deadline.
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self::builder(registry).build()
    }

    pub fn builder(registry: Arc<dyn RegistryClient>) -> EnforcerBuilder {
        EnforcerBuilder {
            registry,
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            cache: None,
        }
    }

    /// Enforcer backed by a [`KeystoneRegistry`] built from loaded settings.
    pub fn from_settings(settings: &EnforcerSettings) -> Result<Self, LimitError> {
        let url = settings
            .registry_url
            .as_deref()
            .ok_or_else(|| LimitError::Configuration("registry_url is not set".to_string()))?;
        let endpoint_id = settings
            .endpoint_id
            .as_deref()
            .ok_or_else(|| LimitError::Configuration("endpoint_id is not set".to_string()))?;
        let http = ReqwestHttpClient::new(settings.auth_token.clone(), settings.fetch_timeout)
            .map_err(LimitError::Configuration)?;
        let registry = KeystoneRegistry::with_client(url, endpoint_id, Arc::new(http));
        Ok(Self::builder(Arc::new(registry))
            .cache_ttl(settings.cache_ttl)
            .fetch_timeout(settings.fetch_timeout)
            .build())
    }

    pub fn cache(&self) -> &LimitCache {
        &self.cache
    }

    /// Resolved limits for `project_id`, from cache or a fresh registry fetch.
    pub async fn limits(&self, project_id: &str) -> Result<Arc<ProjectLimitSet>, LimitError> {
        let registry = Arc::clone(&self.registry);
        let id = project_id.to_string();
        let timeout = self.fetch_timeout;
        self.cache
            .get_or_resolve(project_id, move || async move {
                let records = fetch_with_timeout(registry.as_ref(), &id, timeout).await?;
                resolve_limit_set(&records, Utc::now())
            })
            .await
    }

    /// Administrative cache busting for one project.
    pub async fn invalidate(&self, project_id: &str) -> bool {
        self.cache.invalidate(project_id).await
    }

    /// Adjudicates `request` against the project's effective limits.
    ///
    /// Every requested resource gets an outcome, including after a denial. The call is
    /// admitted only if no resource exceeds a strict limit; soft limits only flag.
    pub async fn enforce<P>(
        &self,
        request: &UsageRequest,
        probe: &P,
    ) -> Result<EnforcementResult, LimitError>
    where
        P: UsageProbe + ?Sized,
    {
        if request.is_empty() {
            return Ok(EnforcementResult::empty());
        }
        request.validate()?;

        let project_id = request.project_id.as_str();
        let set = self.limits(project_id).await?;

        let mut admitted = true;
        let mut outcomes = BTreeMap::new();
        for (resource_name, &delta) in &request.deltas {
            let current_usage = probe
                .usage(project_id, resource_name)
                .await
                .map_err(|e| LimitError::UsageProbe {
                    resource_name: resource_name.clone(),
                    message: e.to_string(),
                })?;
            let limit = set.limit_for(resource_name);
            let projected_usage = i128::from(current_usage) + i128::from(delta);
            let over_limit = !limit.limit_value.admits(projected_usage);
            if over_limit {
                if limit.is_strict {
                    admitted = false;
                }
                tracing::warn!(
                    project_id,
                    resource_name = %resource_name,
                    current_usage,
                    delta,
                    limit = %limit.limit_value,
                    strict = limit.is_strict,
                    "claim exceeds limit"
                );
            }
            outcomes.insert(
                resource_name.clone(),
                ResourceOutcome {
                    current_usage,
                    requested_delta: delta,
                    projected_usage,
                    effective_limit: limit.limit_value,
                    is_strict: limit.is_strict,
                    over_limit,
                },
            );
        }

        tracing::debug!(project_id, admitted, resources = outcomes.len(), "enforced claim");
        Ok(EnforcementResult { admitted, outcomes })
    }

    /// [`enforce`](Self::enforce), turning a denial into [`LimitError::ClaimExceedsLimit`].
    pub async fn check<P>(
        &self,
        request: &UsageRequest,
        probe: &P,
    ) -> Result<EnforcementResult, LimitError>
    where
        P: UsageProbe + ?Sized,
    {
        self.enforce(request, probe).await?.into_result()
    }
}
