use anyhow::Context;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

use crate::rpc::DEFAULT_ENDPOINT;

pub const DEFAULT_API_KEY_ENV: &str = "GETBLOCK_API_KEY";
pub const DEFAULT_BLOCK_COUNT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// JSON-RPC endpoint of the eth node
    pub endpoint: String,
    /// environment variable holding the API key
    pub api_key_env: String,
    /// bound on concurrent block fetches, unbounded if absent
    pub max_in_flight: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            max_in_flight: None,
        }
    }
}

impl Config {
    /// Reads the YAML config at `path`, or the defaults if there is none.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => return Ok(Self::default()),
        };
        tracing::info!("Config file {:?}", path);
        let file = File::open(path)
            .with_context(|| format!("Cannot read config file {path}", path = path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot read config file {path}", path = path.display()))
    }

    pub fn api_key(&self) -> anyhow::Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(anyhow::anyhow!(
                "bad environment: can't find {}",
                self.api_key_env
            )),
        }
    }
}
