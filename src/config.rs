//! Server configuration
//!
//! Resolved from (lowest to highest precedence) a TOML file, the
//! `STATE_DIRECTORY` environment variable (set by systemd when running under
//! `DynamicUser`/`StateDirectory=`), and CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

fn default_port() -> u16 {
    22123
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mobileshell")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default)]
    pub allow_root: bool,
    #[serde(default)]
    pub debug_html: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            port: default_port(),
            host: default_host(),
            allow_root: false,
            debug_html: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&contents).context("parsing config file")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults plus
    /// environment overrides. Used by `run` so a first launch doesn't
    /// require a config file to exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STATE_DIRECTORY") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("serializing config")?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).context("creating config directory")?;
        }
        std::fs::write(path.as_ref(), contents).context("writing config file")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.port != 0, "port must be nonzero");
        Ok(())
    }

    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.host, self.port)
    }
}
