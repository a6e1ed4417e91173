//! Configuration types for the rewrite proxy.
//!
//! Settings come from an optional YAML file and are then overridden by
//! command-line flags or their environment variables (see `main.rs`).
//! `Config::validate` runs last; any error it reports is fatal at startup.

mod listen;
mod origin;
mod protocol;
mod scripting;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// Re-export all types for library consumers
#[allow(unused_imports)]
pub use listen::{ListenConfig, MetricsConfig, TlsConfig, DEFAULT_LISTEN_PORT};
#[allow(unused_imports)]
pub use origin::{ConnectionPoolConfig, OriginConfig};
pub use protocol::Protocol;
#[allow(unused_imports)]
pub use scripting::{
    ScriptPoolConfigFile, ScriptsConfig, DEFAULT_SCRIPTS_DIR, DEFAULT_SCRIPT_SUFFIX,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    /// Prometheus exporter (disabled when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

/// Values supplied on the command line or through the environment.
/// Every `Some` replaces the corresponding file setting.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub origin: Option<String>,
    pub port: Option<u16>,
    pub scripts_dir: Option<String>,
    pub script_suffix: Option<String>,
    pub script_timeout_ms: Option<u64>,
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Read a YAML config file. Validation is deferred until overrides are applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load the optional file, apply overrides and validate the result.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, anyhow::Error> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(ref origin) = overrides.origin {
            self.origin.url = origin.clone();
        }
        if let Some(port) = overrides.port {
            self.listen.port = port;
        }
        if let Some(ref dir) = overrides.scripts_dir {
            self.scripts.dir = dir.clone();
        }
        if let Some(ref suffix) = overrides.script_suffix {
            self.scripts.suffix = suffix.clone();
        }
        if let Some(timeout_ms) = overrides.script_timeout_ms {
            self.scripts.timeout_ms = timeout_ms;
        }
        if let Some(port) = overrides.metrics_port {
            self.metrics = Some(MetricsConfig { port });
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.origin.parse_uri().map_err(|e| anyhow::anyhow!(e))?;

        if self.listen.port == 0 {
            anyhow::bail!("Invalid listen port 0. Set PORT (or listen.port) to a value in 1-65535");
        }

        if self.listen.protocol == Protocol::Https && self.listen.tls.is_none() {
            anyhow::bail!(
                "TLS configuration is required when listener protocol is 'https'. \
                 Please provide 'listen.tls.cert_path' and 'listen.tls.key_path'"
            );
        }

        if self.scripts.dir.trim().is_empty() {
            anyhow::bail!("Script directory must not be empty");
        }

        if self.scripts.suffix.is_empty() {
            anyhow::bail!("Script file suffix must not be empty");
        }

        if self.scripts.timeout_ms == 0 {
            anyhow::bail!("scripts.timeout_ms must be greater than zero");
        }

        if self.scripts.pool.timeout_ms == 0 {
            anyhow::bail!("scripts.pool.timeout_ms must be greater than zero");
        }

        if self.scripts.pool.queue_size == 0 {
            anyhow::bail!("scripts.pool.queue_size must be greater than zero");
        }

        if let Some(ref metrics) = self.metrics {
            if metrics.port == 0 || metrics.port == self.listen.port {
                anyhow::bail!(
                    "Invalid metrics port {}: must be non-zero and differ from the listen port",
                    metrics.port
                );
            }
        }

        Ok(())
    }
}
