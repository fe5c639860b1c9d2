//! Read a project `.env` into a map without touching the process environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::LoadError;

fn dotenv_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Load `.env` from `override_dir` or the current directory. Missing file returns an empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = dotenv_path(override_dir) else {
        return Ok(HashMap::new());
    };
    let iter = dotenv::from_path_iter(&path).map_err(|e| LoadError::DotenvRead(e.to_string()))?;
    let mut out = HashMap::new();
    for item in iter {
        let (k, v) = item.map_err(|e| LoadError::DotenvRead(e.to_string()))?;
        out.insert(k, v);
    }
    Ok(out)
}
