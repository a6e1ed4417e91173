//! Listen, metrics, and TLS configuration.

use super::protocol::Protocol;
use serde::{Deserialize, Serialize};

/// TLS configuration for HTTPS listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to TLS certificate file (PEM format)
    pub cert_path: String,
    /// Path to TLS private key file (PEM format)
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Protocol for listener (http or https)
    #[serde(default)]
    pub protocol: Protocol,
    /// TLS configuration (required when protocol is https)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Port used when neither the config file nor `PORT` sets one.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            protocol: Protocol::default(),
            tls: None,
        }
    }
}

/// Prometheus exporter settings. The exporter only runs when this block is present.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}
