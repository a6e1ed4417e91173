//! Origin and connection pool configuration.

use super::protocol::Protocol;
use hyper::Uri;
use serde::{Deserialize, Serialize};

/// The single upstream every request is proxied to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OriginConfig {
    /// Absolute origin URL, e.g. `http://backend:9000` or `https://api.internal/base`
    #[serde(default)]
    pub url: String,
    /// Skip TLS certificate verification (for self-signed certs in dev/test)
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Drop `Accept-Encoding` from forwarded requests so scripts receive
    /// uncompressed bodies
    #[serde(default = "default_identity_encoding")]
    pub identity_encoding: bool,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

fn default_identity_encoding() -> bool {
    true
}

impl OriginConfig {
    /// Parse the origin URL, requiring an http(s) scheme and a host.
    pub fn parse_uri(&self) -> Result<Uri, String> {
        if self.url.trim().is_empty() {
            return Err("origin URL is not set (use --origin or SOURCE_URL)".to_string());
        }
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| format!("Invalid origin URL `{}`: {e}", self.url))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| format!("Invalid origin URL `{}`: missing scheme", self.url))?;
        Protocol::from_scheme(scheme)
            .map_err(|e| format!("Invalid origin URL `{}`: {e}", self.url))?;
        match uri.host() {
            Some(host) if !host.is_empty() => Ok(uri),
            _ => Err(format!("Invalid origin URL `{}`: missing host", self.url)),
        }
    }

    /// Protocol of the origin; only meaningful after `parse_uri` succeeded.
    pub fn protocol(&self) -> Protocol {
        self.url
            .split_once("://")
            .and_then(|(scheme, _)| Protocol::from_scheme(scheme).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(url: &str) -> OriginConfig {
        OriginConfig {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_uri_valid() {
        let uri = origin("http://backend:9000/base").parse_uri().unwrap();
        assert_eq!(uri.host(), Some("backend"));
        assert_eq!(uri.port_u16(), Some(9000));
        assert_eq!(uri.path(), "/base");
    }

    #[test]
    fn test_parse_uri_empty() {
        let err = origin("").parse_uri().unwrap_err();
        assert!(err.contains("not set"));
    }

    #[test]
    fn test_parse_uri_missing_scheme() {
        assert!(origin("backend:9000").parse_uri().is_err());
        assert!(origin("/relative/path").parse_uri().is_err());
    }

    #[test]
    fn test_parse_uri_unsupported_scheme() {
        let err = origin("ftp://backend").parse_uri().unwrap_err();
        assert!(err.contains("ftp"));
    }

    #[test]
    fn test_protocol_from_url() {
        assert_eq!(origin("https://api.internal").protocol(), Protocol::Https);
        assert_eq!(origin("http://api.internal").protocol(), Protocol::Http);
    }

    #[test]
    fn test_connection_pool_defaults() {
        let pool = ConnectionPoolConfig::default();
        assert_eq!(pool.max_idle_per_host, 100);
        assert_eq!(pool.idle_timeout_secs, 90);
        assert_eq!(pool.keepalive_timeout_secs, 60);
        assert_eq!(pool.connect_timeout_secs, 5);
    }
}
