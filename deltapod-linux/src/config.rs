//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use deltapod_core::signature::DEFAULT_BLOCK_SIZE;
use deltapod_core::{SyncConfig, DEFAULT_PORT};

/// Daemon configuration. File: ~/.config/deltapod/config.toml or /etc/deltapod/config.toml.
/// Env overrides: DELTAPOD_PORT, DELTAPOD_ROOT, DELTAPOD_PEERS (comma-separated).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer listen port (default 9876).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory kept in sync (default: current directory).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Peers to connect to, as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// Used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}
fn default_announce_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            root: default_root(),
            peers: Vec::new(),
            block_size: default_block_size(),
            include_hidden: false,
            announce_interval_secs: default_announce_interval(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            block_size: self.block_size,
            include_hidden: self.include_hidden,
            ..SyncConfig::default()
        }
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive".into()));
        }
        if self.announce_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "announce_interval_secs must be positive".into(),
            ));
        }
        if !self.root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}: {reason}")]
    Env { var: &'static str, reason: String },
    #[error("{0}")]
    Invalid(String),
}

/// Load config: merge default, then config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let file = match explicit {
        Some(p) => Some(read_file(p)?),
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => Some(read_file(&p)?),
            None => None,
        },
    };
    let mut c = file.unwrap_or_default();
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.validate()
}

/// Apply overrides; `lookup` returns the value of an environment variable.
fn apply_env(
    c: &mut Config,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = lookup("DELTAPOD_PORT") {
        c.listen_port = s.trim().parse::<u16>().map_err(|e| ConfigError::Env {
            var: "DELTAPOD_PORT",
            reason: e.to_string(),
        })?;
    }
    if let Some(s) = lookup("DELTAPOD_ROOT") {
        c.root = PathBuf::from(s);
    }
    if let Some(s) = lookup("DELTAPOD_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/deltapod/config.toml"));
    }
    out.push(PathBuf::from("/etc/deltapod/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
