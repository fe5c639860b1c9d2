//! Keystone-style unified limits registry over HTTP.
//!
//! Queries used (all `GET`, JSON bodies):
//! - `/v3/endpoints/{endpoint_id}`: service and region that scope every limit query
//! - `/v3/projects/{project_id}`: `parent_id` / `is_domain`, walked up to the root
//! - `/v3/registered_limits?service_id=..&region_id=..`: default scope (`default_limit`)
//! - `/v3/limits?service_id=..&region_id=..&project_id=..`: per project (`resource_limit`)
//!
//! A limit of `-1` means unlimited. An optional `strict` flag per record defaults to `true`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::RegistryClient;
use crate::error::LimitError;
use crate::model::{LimitValue, ProjectRecords, RegistryRecord, Scope};

/// Fetches a URL body. `Ok(None)` means the resource does not exist (HTTP 404).
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<String>, String>;
}

/// Reqwest-based HTTP client; forwards an optional pre-issued token as `X-Auth-Token`.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl ReqwestHttpClient {
    pub fn new(auth_token: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client, auth_token })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<Option<String>, String> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.auth_token {
            request = request.header("X-Auth-Token", token);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        Ok(Some(body))
    }
}

#[derive(Deserialize)]
struct EndpointBody {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct Endpoint {
    service_id: String,
    region_id: Option<String>,
}

#[derive(Deserialize)]
struct ProjectBody {
    project: Project,
}

#[derive(Deserialize)]
struct Project {
    parent_id: Option<String>,
    #[serde(default)]
    is_domain: bool,
}

#[derive(Deserialize)]
struct RegisteredLimitsBody {
    registered_limits: Vec<RegisteredLimit>,
}

#[derive(Deserialize)]
struct RegisteredLimit {
    resource_name: String,
    default_limit: LimitValue,
    strict: Option<bool>,
}

#[derive(Deserialize)]
struct LimitsBody {
    limits: Vec<ProjectLimit>,
}

#[derive(Deserialize)]
struct ProjectLimit {
    resource_name: String,
    resource_limit: LimitValue,
    strict: Option<bool>,
}

/// Service and region scoping for limit queries.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceScope {
    service_id: String,
    region_id: Option<String>,
}

/// Registry client for a Keystone-style unified limits API.
pub struct KeystoneRegistry {
    base_url: String,
    endpoint_id: String,
    http_client: Arc<dyn HttpClient>,
    service_scope: OnceCell<ServiceScope>,
}

impl KeystoneRegistry {
    /// `endpoint_id` selects the service/region whose limits apply.
    pub fn with_client(
        base_url: impl Into<String>,
        endpoint_id: impl Into<String>,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint_id: endpoint_id.into(),
            http_client,
            service_scope: OnceCell::new(),
        }
    }

    /// `{base_url}/{segments..}?{query}`. Each segment is percent-encoded, so an id holding
    /// `/`, `..`, `?` or `#` stays one path segment.
    fn url(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<reqwest::Url, LimitError> {
        let bad_url =
            |detail: String| LimitError::RegistryUnavailable(format!("bad registry url: {detail}"));
        let mut url =
            reqwest::Url::parse(&self.base_url).map_err(|e| bad_url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad_url(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Option<T>, LimitError> {
        let url = self.url(segments, query)?;
        let body = self.http_client.get(url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "limit registry request failed");
            LimitError::RegistryUnavailable(e)
        })?;
        body.map(|b| {
            serde_json::from_str(&b).map_err(|e| {
                LimitError::RegistryUnavailable(format!("undecodable response from {url}: {e}"))
            })
        })
        .transpose()
    }

    async fn service_scope(&self) -> Result<&ServiceScope, LimitError> {
        self.service_scope
            .get_or_try_init(|| async {
                let endpoint_id = self.endpoint_id.as_str();
                let body: EndpointBody = self
                    .get_json(&["v3", "endpoints", endpoint_id], &[])
                    .await?
                    .ok_or_else(|| {
                        LimitError::RegistryUnavailable(format!(
                            "endpoint {endpoint_id} not found in registry"
                        ))
                    })?;
                Ok::<_, LimitError>(ServiceScope {
                    service_id: body.endpoint.service_id,
                    region_id: body.endpoint.region_id,
                })
            })
            .await
    }

    async fn project(&self, project_id: &str) -> Result<Option<Project>, LimitError> {
        // dot segments are dropped from a url path; no project can carry them as an id
        if project_id.is_empty() || project_id == "." || project_id == ".." {
            return Ok(None);
        }
        let body: Option<ProjectBody> =
            self.get_json(&["v3", "projects", project_id], &[]).await?;
        Ok(body.map(|b| b.project))
    }

    /// The project, then each parent until the root. Domains and parents the registry
    /// cannot show end the walk.
    async fn lineage(&self, project_id: &str) -> Result<Vec<String>, LimitError> {
        let mut project = self
            .project(project_id)
            .await?
            .ok_or_else(|| LimitError::RegistryNotFound {
                project_id: project_id.to_string(),
            })?;
        let mut lineage = vec![project_id.to_string()];
        while let Some(parent_id) = project.parent_id.take() {
            let Some(parent) = self.project(&parent_id).await? else {
                tracing::debug!(project_id, %parent_id, "parent not visible, lineage ends");
                break;
            };
            if parent.is_domain {
                break;
            }
            if lineage.contains(&parent_id) {
                return Err(LimitError::ResolutionConflict {
                    resource_name: "*".to_string(),
                    scope: Scope::Project(parent_id).to_string(),
                    records: vec![format!("cyclic parent chain {lineage:?}")],
                });
            }
            lineage.push(parent_id);
            project = parent;
        }
        Ok(lineage)
    }

    fn scope_query<'a>(scope: &'a ServiceScope) -> Vec<(&'static str, &'a str)> {
        let mut query = Vec::with_capacity(3);
        query.push(("service_id", scope.service_id.as_str()));
        if let Some(region_id) = &scope.region_id {
            query.push(("region_id", region_id.as_str()));
        }
        query
    }
}

#[async_trait]
impl RegistryClient for KeystoneRegistry {
    async fn fetch(&self, project_id: &str) -> Result<ProjectRecords, LimitError> {
        let scope = self.service_scope().await?;
        let lineage = self.lineage(project_id).await?;
        let base_query = Self::scope_query(scope);

        let registered: RegisteredLimitsBody = self
            .get_json(&["v3", "registered_limits"], &base_query)
            .await?
            .unwrap_or(RegisteredLimitsBody {
                registered_limits: Vec::new(),
            });
        let mut records: Vec<RegistryRecord> = registered
            .registered_limits
            .into_iter()
            .map(|l| RegistryRecord {
                scope: Scope::Default,
                resource_name: l.resource_name,
                limit_value: l.default_limit,
                is_strict: l.strict.unwrap_or(true),
            })
            .collect();

        for id in &lineage {
            let mut query = base_query.clone();
            query.push(("project_id", id.as_str()));
            let body: LimitsBody = self
                .get_json(&["v3", "limits"], &query)
                .await?
                .unwrap_or(LimitsBody { limits: Vec::new() });
            records.extend(body.limits.into_iter().map(|l| RegistryRecord {
                scope: Scope::Project(id.clone()),
                resource_name: l.resource_name,
                limit_value: l.resource_limit,
                is_strict: l.strict.unwrap_or(true),
            }));
        }

        tracing::debug!(
            project_id,
            depth = lineage.len(),
            records = records.len(),
            "fetched limit records from registry"
        );
        Ok(ProjectRecords {
            project_id: project_id.to_string(),
            lineage,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Routes by path-and-query substring; unknown URLs are 404.
    struct MockHttpClient {
        routes: Vec<(String, String)>,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        fn new(routes: &[(&str, &str)]) -> Self {
            Self {
                routes: routes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                fail: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<Option<String>, String> {
            self.seen.lock().unwrap().push(url.to_string());
            if self.fail {
                return Err("connection refused".to_string());
            }
            Ok(self
                .routes
                .iter()
                .find(|(pattern, _)| url.ends_with(pattern.as_str()))
                .map(|(_, body)| body.clone()))
        }
    }

    const BASE: &str = "http://keystone.test";

    fn fixture() -> MockHttpClient {
        MockHttpClient::new(&[
            (
                "/v3/endpoints/ep1",
                r#"{"endpoint":{"id":"ep1","service_id":"svc","region_id":"r1"}}"#,
            ),
            (
                "/v3/projects/leaf",
                r#"{"project":{"id":"leaf","parent_id":"root","is_domain":false}}"#,
            ),
            (
                "/v3/projects/root",
                r#"{"project":{"id":"root","parent_id":"dom","is_domain":false}}"#,
            ),
            (
                "/v3/projects/dom",
                r#"{"project":{"id":"dom","parent_id":null,"is_domain":true}}"#,
            ),
            (
                "/v3/registered_limits?service_id=svc&region_id=r1",
                r#"{"registered_limits":[
                    {"resource_name":"cpu","default_limit":10},
                    {"resource_name":"disk","default_limit":5,"strict":false}
                ]}"#,
            ),
            (
                "/v3/limits?service_id=svc&region_id=r1&project_id=leaf",
                r#"{"limits":[{"resource_name":"cpu","resource_limit":-1,"project_id":"leaf"}]}"#,
            ),
            (
                "/v3/limits?service_id=svc&region_id=r1&project_id=root",
                r#"{"limits":[{"resource_name":"ram","resource_limit":0,"project_id":"root"}]}"#,
            ),
        ])
    }

    #[tokio::test]
    async fn fetch_collects_lineage_defaults_and_project_limits() {
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(fixture()));
        let records = registry.fetch("leaf").await.unwrap();

        assert_eq!(records.lineage, vec!["leaf", "root"]);
        let by_key: HashMap<(Scope, String), &RegistryRecord> = records
            .records
            .iter()
            .map(|r| ((r.scope.clone(), r.resource_name.clone()), r))
            .collect();
        assert_eq!(by_key.len(), 4);
        assert_eq!(
            by_key[&(Scope::Default, "cpu".to_string())].limit_value,
            LimitValue::Capped(10)
        );
        assert!(!by_key[&(Scope::Default, "disk".to_string())].is_strict);
        assert_eq!(
            by_key[&(Scope::Project("leaf".into()), "cpu".to_string())].limit_value,
            LimitValue::Unlimited
        );
        assert_eq!(
            by_key[&(Scope::Project("root".into()), "ram".to_string())].limit_value,
            LimitValue::Capped(0)
        );
    }

    #[tokio::test]
    async fn endpoint_is_looked_up_once() {
        let client = Arc::new(fixture());
        let registry = KeystoneRegistry::with_client(BASE, "ep1", client.clone());
        registry.fetch("leaf").await.unwrap();
        registry.fetch("root").await.unwrap();
        let endpoint_calls = client
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.contains("/v3/endpoints/"))
            .count();
        assert_eq!(endpoint_calls, 1);
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(fixture()));
        let err = registry.fetch("ghost").await.unwrap_err();
        assert_eq!(
            err,
            LimitError::RegistryNotFound {
                project_id: "ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn transport_failure_is_unavailable() {
        let mut client = fixture();
        client.fail = true;
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(client));
        assert!(matches!(
            registry.fetch("leaf").await,
            Err(LimitError::RegistryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_unavailable() {
        let client = MockHttpClient::new(&[
            ("/v3/endpoints/ep1", r#"{"endpoint":{"service_id":"svc"}}"#),
            ("/v3/projects/p", "not json"),
        ]);
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(client));
        assert!(matches!(
            registry.fetch("p").await,
            Err(LimitError::RegistryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn ids_are_encoded_as_single_path_segments() {
        let client = Arc::new(fixture());
        let registry = KeystoneRegistry::with_client(BASE, "ep1", client.clone());
        for id in ["ghost/../leaf", "leaf?x=1", "leaf#frag", ".."] {
            let err = registry.fetch(id).await.unwrap_err();
            assert_eq!(
                err,
                LimitError::RegistryNotFound {
                    project_id: id.into()
                }
            );
        }
        let seen = client.seen.lock().unwrap();
        assert!(seen.iter().any(|u| u.ends_with("/v3/projects/ghost%2F..%2Fleaf")));
        assert!(!seen.iter().any(|u| u.ends_with("/v3/projects/leaf")));
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let client = Arc::new(MockHttpClient::new(&[]));
        let registry =
            KeystoneRegistry::with_client("http://keystone.test/identity/", "ep1", client.clone());
        let _ = registry.fetch("leaf").await;
        assert_eq!(
            client.seen.lock().unwrap()[0],
            "http://keystone.test/identity/v3/endpoints/ep1"
        );
    }

    #[tokio::test]
    async fn hidden_parent_ends_lineage() {
        let client = MockHttpClient::new(&[
            ("/v3/endpoints/ep1", r#"{"endpoint":{"service_id":"svc"}}"#),
            ("/v3/projects/child", r#"{"project":{"id":"child","parent_id":"mid"}}"#),
            ("/v3/projects/mid", r#"{"project":{"id":"mid","parent_id":"secret"}}"#),
            (
                "/v3/limits?service_id=svc&project_id=mid",
                r#"{"limits":[{"resource_name":"cpu","resource_limit":3}]}"#,
            ),
        ]);
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(client));
        let records = registry.fetch("child").await.unwrap();
        assert_eq!(records.lineage, vec!["child", "mid"]);
        assert_eq!(records.records.len(), 1);
        assert_eq!(records.records[0].scope, Scope::Project("mid".into()));
    }

    /// Fails only for URLs containing `needle`.
    struct FailingRoute {
        inner: MockHttpClient,
        needle: &'static str,
    }

    #[async_trait]
    impl HttpClient for FailingRoute {
        async fn get(&self, url: &str) -> Result<Option<String>, String> {
            if url.contains(self.needle) {
                return Err("HTTP status server error (503 Service Unavailable)".to_string());
            }
            self.inner.get(url).await
        }
    }

    #[tokio::test]
    async fn server_error_on_limits_is_unavailable() {
        let client = FailingRoute {
            inner: fixture(),
            needle: "/v3/limits",
        };
        let registry = KeystoneRegistry::with_client(BASE, "ep1", Arc::new(client));
        assert!(matches!(
            registry.fetch("leaf").await,
            Err(LimitError::RegistryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn every_limit_query_is_service_scoped() {
        let client = Arc::new(fixture());
        let registry = KeystoneRegistry::with_client(BASE, "ep1", client.clone());
        registry.fetch("leaf").await.unwrap();
        let seen = client.seen.lock().unwrap();
        let limit_queries: Vec<_> = seen.iter().filter(|u| u.contains("limits")).collect();
        assert_eq!(limit_queries.len(), 3);
        assert!(limit_queries.iter().all(|u| u.contains("service_id=svc")));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_unavailable() {
        let registry = KeystoneRegistry::with_client(BASE, "nope", Arc::new(fixture()));
        assert!(matches!(
            registry.fetch("leaf").await,
            Err(LimitError::RegistryUnavailable(_))
        ));
    }
}
