use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use xsg_types::Network;

fn get_env_var(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Process-level configuration for the header store.
#[derive(Deserialize, Clone, Debug)]
pub struct ClientConfig {
    /// Directory holding `blockchain_headers` and the `forks/` subdirectory.
    pub headers_dir: PathBuf,
    #[serde(default)]
    pub network: Network,
}

impl ClientConfig {
    #[must_use]
    pub fn new(headers_dir: impl Into<PathBuf>) -> Self {
        ClientConfig {
            headers_dir: headers_dir.into(),
            network: Network::default(),
        }
    }

    /// Parses a TOML config file. `XSG_HEADERS_DIR` in the environment
    /// overrides the configured directory.
    ///
    /// # Errors
    /// * config file not exists
    /// * incorrect config
    pub fn from_file(file: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_toml = fs::read_to_string(file).context("Failed to read config file")?;
        let mut config: ClientConfig =
            toml::from_str(&config_toml).context("Failed to parse config file")?;

        if let Some(dir) = get_env_var("XSG_HEADERS_DIR") {
            config.headers_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    #[must_use]
    pub fn headers_dir(&self) -> &Path {
        &self.headers_dir
    }
}
