//! Enforcer settings for the limit engine, merged from three sources with priority
//! **process env > project `.env` > XDG `config.toml`**.
//!
//! The process environment is only read, never written: callers get a typed
//! [`EnforcerSettings`] back instead of side effects on `std::env`.

mod dotenv_file;
#[cfg(feature = "tracing-init")]
pub mod tracing_init;
mod xdg_toml;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Registry base URL, e.g. `https://keystone.example.com`.
pub const ENV_REGISTRY_URL: &str = "LIMIT_REGISTRY_URL";
/// Endpoint id used to look up the service and region that scope every limit query.
pub const ENV_ENDPOINT_ID: &str = "LIMIT_ENDPOINT_ID";
/// Pre-issued token forwarded to the registry.
pub const ENV_AUTH_TOKEN: &str = "LIMIT_AUTH_TOKEN";
/// Cache freshness window in seconds.
pub const ENV_CACHE_TTL_SECS: &str = "LIMIT_CACHE_TTL_SECS";
/// Registry fetch deadline in milliseconds.
pub const ENV_FETCH_TIMEOUT_MS: &str = "LIMIT_FETCH_TIMEOUT_MS";

const ALL_KEYS: [&str; 5] = [
    ENV_REGISTRY_URL,
    ENV_ENDPOINT_ID,
    ENV_AUTH_TOKEN,
    ENV_CACHE_TTL_SECS,
    ENV_FETCH_TIMEOUT_MS,
];

/// Default cache freshness window.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default registry fetch deadline.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config path: {0}")]
    XdgPath(String),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Settings needed to build an enforcer against a remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcerSettings {
    pub registry_url: Option<String>,
    pub endpoint_id: Option<String>,
    pub auth_token: Option<String>,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self {
            registry_url: None,
            endpoint_id: None,
            auth_token: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Loads settings for `app_name`.
///
/// * `app_name`: used for the XDG path `$XDG_CONFIG_HOME/<app_name>/config.toml`.
/// * `override_dir`: if `Some`, look for `.env` there instead of the current directory.
pub fn load(app_name: &str, override_dir: Option<&Path>) -> Result<EnforcerSettings, LoadError> {
    let config_home = xdg_config_home()?;
    load_from(app_name, &config_home, override_dir)
}

/// Like [`load`] with an explicit XDG config home.
pub fn load_from(
    app_name: &str,
    config_home: &Path,
    override_dir: Option<&Path>,
) -> Result<EnforcerSettings, LoadError> {
    let xdg = xdg_toml::load_limit_table(config_home, app_name)?;
    let dotenv = dotenv_file::load_env_map(override_dir)?;
    let env: HashMap<String, String> = ALL_KEYS
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect();
    merge(&env, &dotenv, &xdg)
}

fn xdg_config_home() -> Result<PathBuf, LoadError> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .ok_or_else(|| LoadError::XdgPath("no config directory for this platform".into()))
}

/// Picks each key from the first source that has it: env, then `.env`, then XDG.
fn merge(
    env: &HashMap<String, String>,
    dotenv: &HashMap<String, String>,
    xdg: &HashMap<String, String>,
) -> Result<EnforcerSettings, LoadError> {
    let lookup = |key: &str| {
        env.get(key)
            .or_else(|| dotenv.get(key))
            .or_else(|| xdg.get(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut settings = EnforcerSettings {
        registry_url: lookup(ENV_REGISTRY_URL),
        endpoint_id: lookup(ENV_ENDPOINT_ID),
        auth_token: lookup(ENV_AUTH_TOKEN),
        ..EnforcerSettings::default()
    };
    if let Some(v) = lookup(ENV_CACHE_TTL_SECS) {
        settings.cache_ttl = Duration::from_secs(parse_u64(ENV_CACHE_TTL_SECS, v)?);
    }
    if let Some(v) = lookup(ENV_FETCH_TIMEOUT_MS) {
        settings.fetch_timeout = Duration::from_millis(parse_u64(ENV_FETCH_TIMEOUT_MS, v)?);
    }
    Ok(settings)
}

fn parse_u64(key: &'static str, value: String) -> Result<u64, LoadError> {
    value
        .parse::<u64>()
        .map_err(|_| LoadError::InvalidValue { key, value })
}
