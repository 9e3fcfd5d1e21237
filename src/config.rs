//! Layered configuration.
//!
//! Lowest to highest precedence: built-in defaults, the TOML file
//! (`mechbridge.toml`, or the path in `$MECHBRIDGE_CONFIG`), environment
//! variables (`MECHBRIDGE_SERVER__PORT=0`, `MECHBRIDGE_CLIENT__TIMEOUT_MS=...`),
//! then command-line overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::{HostingMode, validate_version};
use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "mechbridge.toml";
pub const CONFIG_PATH_ENV: &str = "MECHBRIDGE_CONFIG";
pub const ENV_PREFIX: &str = "MECHBRIDGE_";

pub const DEFAULT_PORT: u16 = 18861;
pub const DEFAULT_VERSION: u32 = 251;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// 0 picks a free port.
    pub port: u16,
    /// Three-digit engine release, e.g. 242 or 251.
    pub version: u32,
    pub mode: HostingMode,
    /// Project directory for the engine; a scratch directory when unset.
    pub project_root: Option<PathBuf>,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            version: DEFAULT_VERSION,
            mode: HostingMode::default(),
            project_root: None,
            verbose: false,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: IpAddr,
    pub port: u16,
    /// How long to keep retrying the initial connection.
    pub timeout_ms: u64,
    /// Per-call limit; calls wait indefinitely when unset.
    pub call_timeout_ms: Option<u64>,
    /// Ask the server to shut down when the client is dropped without an
    /// explicit `exit`.
    pub cleanup_on_exit: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            timeout_ms: 60_000,
            call_timeout_ms: None,
            cleanup_on_exit: false,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Settings {
    /// Path of the configuration file to read.
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    pub(crate) fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

fn layered<T: Serialize>(path: &Path, section: &str, overrides: Option<&T>) -> Figment {
    let figment = Settings::figment(path);
    match overrides {
        Some(overrides) => figment.merge(Serialized::default(section, overrides)),
        None => figment,
    }
}

impl ServerConfig {
    /// Load with optional CLI overrides (fields left `None` are skipped).
    pub fn load<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load_from(&Settings::path(), overrides)
    }

    pub fn load_from<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let config: ServerConfig = layered(path, "server", overrides)
            .extract_inner("server")
            .context("Failed to load server configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_version(self.version)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl ClientConfig {
    pub fn load<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load_from(&Settings::path(), overrides)
    }

    pub fn load_from<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        layered(path, "client", overrides)
            .extract_inner("client")
            .context("Failed to load client configuration")
    }

    /// Client config pointing at `addr` with defaults otherwise.
    pub fn for_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            ..Default::default()
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Write a configuration file holding the defaults. Refuses to overwrite.
pub fn write_default(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Config file {} already exists", path.display());
    }
    let contents =
        toml::to_string_pretty(&Settings::default()).context("Failed to serialize config")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}
