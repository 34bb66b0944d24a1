// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{VersoError, VersoResult};
use crate::server::{DEFAULT_PORT, THREAD_POOL_SIZE};

/// Server configuration, loadable from a JSON file. Every field falls back
/// to the built-in default when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub storage_root: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workers: THREAD_POOL_SIZE,
            storage_root: PathBuf::from("/tmp/data"),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> VersoResult<Config> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|_| VersoError::Input)
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: Config = serde_json::from_str(r#"{"port": 9090}"#).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.workers, THREAD_POOL_SIZE);
        assert_eq!(config.host_port(), "0.0.0.0:9090");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"prot": 1}"#).is_err());
    }

    #[test]
    fn missing_file_maps_into_the_taxonomy() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/verso.json")),
            Err(VersoError::Missing)
        ));
    }
}
