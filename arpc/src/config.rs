//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: ARPC_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/arpc/{service_name}/config.toml
//! 4. System directory: /etc/arpc/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Outbound connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Health service configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port the gRPC server listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// TCP keepalive for accepted connections, in seconds
    #[serde(default = "default_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl ServiceConfig {
    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get TCP keepalive as Duration
    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_secs)
    }
}

/// Outbound connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Timeout for establishing a connection, in seconds
    #[serde(default = "default_connection_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout on opened connections, in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// Establish the transport during `open` instead of on first use
    #[serde(default = "default_false")]
    pub connect_eagerly: bool,

    /// PEM bundle of trusted root certificates. Falls back to the system bundle.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Identity endpoint of the metadata server
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
}

impl PoolConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connection_timeout(),
            request_timeout_secs: default_timeout(),
            connect_eagerly: default_false(),
            ca_bundle_path: None,
            metadata_url: default_metadata_url(),
        }
    }
}

/// Health service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between two statuses on a watch stream, in milliseconds
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

impl HealthConfig {
    /// Get watch interval as Duration
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

fn default_port() -> u16 {
    50051
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    60
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_false() -> bool {
    false
}

fn default_metadata_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity"
        .to_string()
}

fn default_watch_interval_ms() -> u64 {
    5_000
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/arpc/{service_name}/config.toml
    /// 3. System directory: /etc/arpc/{service_name}/config.toml
    ///
    /// Environment variables (ARPC_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "arpc".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first, so higher priority files override lower ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("ARPC_").split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses XDG directories and loads directly from the given path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ARPC_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Find all possible config file paths for a service, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("arpc");
        if let Some(path) = xdg_dirs.find_config_file(Path::new(service_name).join("config.toml")) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/arpc").join(service_name).join("config.toml"));

        paths
    }

    /// Whether outbound connections must be authenticated
    pub fn is_release(&self) -> bool {
        self.service.environment == "production"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "arpc".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                tcp_keepalive_secs: default_keepalive(),
                environment: default_environment(),
            },
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 50051);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.health.watch_interval(), Duration::from_secs(5));
        assert!(!config.pool.connect_eagerly);
        assert!(!config.is_release());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "story-service"
port = 8080
environment = "production"

[pool]
connect_timeout_secs = 3
ca_bundle_path = "/opt/certs/roots.pem"

[health]
watch_interval_ms = 250
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.name, "story-service");
        assert_eq!(config.service.port, 8080);
        assert!(config.is_release());
        assert_eq!(config.pool.connect_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.pool.ca_bundle_path,
            Some(PathBuf::from("/opt/certs/roots.pem"))
        );
        assert_eq!(config.health.watch_interval(), Duration::from_millis(250));
        // Untouched keys keep their defaults
        assert_eq!(config.pool.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nport = \"not a port\"").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
