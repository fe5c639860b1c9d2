//! Load the `[limit]` table from `<config_home>/<app>/config.toml`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::{
    LoadError, ENV_AUTH_TOKEN, ENV_CACHE_TTL_SECS, ENV_ENDPOINT_ID, ENV_FETCH_TIMEOUT_MS,
    ENV_REGISTRY_URL,
};

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    limit: LimitTable,
}

#[derive(Deserialize, Default)]
struct LimitTable {
    registry_url: Option<String>,
    endpoint_id: Option<String>,
    auth_token: Option<String>,
    cache_ttl_secs: Option<u64>,
    fetch_timeout_ms: Option<u64>,
}

/// Returns the `[limit]` table keyed by the matching env var names, so it merges with the
/// other sources. Missing file or table returns an empty map.
pub fn load_limit_table(
    config_home: &Path,
    app_name: &str,
) -> Result<HashMap<String, String>, LoadError> {
    let path = config_home.join(app_name).join("config.toml");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    let t = file.limit;

    let mut out = HashMap::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            out.insert(key.to_string(), v);
        }
    };
    put(ENV_REGISTRY_URL, t.registry_url);
    put(ENV_ENDPOINT_ID, t.endpoint_id);
    put(ENV_AUTH_TOKEN, t.auth_token);
    put(ENV_CACHE_TTL_SECS, t.cache_ttl_secs.map(|v| v.to_string()));
    put(ENV_FETCH_TIMEOUT_MS, t.fetch_timeout_ms.map(|v| v.to_string()));
    Ok(out)
}
