//! Protocol types.

use serde::{Deserialize, Serialize};

/// Protocol spoken by the listener and the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP protocol
    #[default]
    Http,
    /// HTTPS protocol (HTTP over TLS)
    Https,
}

impl Protocol {
    /// Get protocol name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Parse protocol from URL scheme
    pub fn from_scheme(scheme: &str) -> Result<Self, String> {
        match scheme.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(format!("Unsupported protocol scheme: {scheme}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_scheme_case_insensitive() {
        assert_eq!(Protocol::from_scheme("HTTP").unwrap(), Protocol::Http);
        assert_eq!(Protocol::from_scheme("https").unwrap(), Protocol::Https);
    }

    #[test]
    fn test_from_scheme_rejects_unknown() {
        let err = Protocol::from_scheme("ftp").unwrap_err();
        assert!(err.contains("ftp"));
    }

    #[test]
    fn test_protocol_yaml_names() {
        let protocol: Protocol = serde_yaml::from_str("https").unwrap();
        assert_eq!(protocol, Protocol::Https);
        assert_eq!(protocol.as_str(), "https");
    }
}
