use crate::cors::{OriginPolicy, WILDCARD_ORIGIN};
use crate::error::ProxyError;
use crate::forward::ForwardingConfig;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8787";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8787))
}

fn default_allowed_origins() -> Vec<String> {
    vec![WILDCARD_ORIGIN.to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    // "*" allows every origin
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    // Verify upstream TLS certificates
    #[serde(default = "default_true")]
    pub upstream_reject_unauthorized: bool,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_origins: default_allowed_origins(),
            upstream_reject_unauthorized: true,
            private_key: None,
            certificate: None,
            ca_certificate: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file '{}': {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Splits a comma-separated origin list, trimming entries and dropping empties.
    pub fn parse_origins(list: &str) -> Vec<String> {
        list.split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }

    /// Overrides the listen address. `host` may be an IP literal or a name; names
    /// resolve to their first address.
    pub fn set_listen_addr(&mut self, host: Option<&str>, port: Option<u16>) -> Result<(), ProxyError> {
        let port = port.unwrap_or(self.listen_addr.port());
        self.listen_addr = match host.map(str::trim).filter(|host| !host.is_empty()) {
            Some(host) => resolve_listen_addr(host, port)?,
            None => SocketAddr::new(self.listen_addr.ip(), port),
        };
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.private_key.is_some() && self.certificate.is_some()
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::new(&self.allowed_origins)
    }

    pub fn forwarding(&self) -> ForwardingConfig {
        ForwardingConfig {
            reject_unauthorized: self.upstream_reject_unauthorized,
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.allowed_origins.iter().all(|origin| origin.trim().is_empty()) {
            return Err(ProxyError::Config(
                "At least one allowed origin (or \"*\") is required".to_string(),
            ));
        }

        match (&self.private_key, &self.certificate) {
            (Some(key), Some(cert)) => {
                for (label, path) in [("private key", key), ("certificate", cert)] {
                    if !Path::new(path).exists() {
                        return Err(ProxyError::Config(format!("TLS {} file not found: {}", label, path)));
                    }
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ProxyError::Config(
                    "TLS requires both a private key and a certificate".to_string(),
                ));
            }
            (None, None) => {
                if self.ca_certificate.is_some() {
                    return Err(ProxyError::Config(
                        "A CA certificate was given without a private key and certificate".to_string(),
                    ));
                }
            }
        }

        if let Some(ca) = &self.ca_certificate {
            if !Path::new(ca).exists() {
                return Err(ProxyError::Config(format!("TLS CA file not found: {}", ca)));
            }
        }

        Ok(())
    }
}

fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProxyError::Config(format!("Cannot resolve listen host '{}': {}", host, e)))?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("Listen host '{}' resolved to no addresses", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert!(config.origin_policy().allows_any_origin());
        assert!(config.forwarding().reject_unauthorized);
        assert!(!config.tls_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"allowed_origins":["https://app.example.com"]}"#).unwrap();
        assert_eq!(config.listen_addr.port(), 8787);
        assert!(config.upstream_reject_unauthorized);
        assert!(!config.origin_policy().allows_any_origin());
    }

    #[test]
    fn test_round_trip_through_file() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let mut config = Config::default();
        config.allowed_origins = vec!["https://a.dev".to_string()];
        config.upstream_reject_unauthorized = false;
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.allowed_origins, vec!["https://a.dev"]);
        assert!(!loaded.upstream_reject_unauthorized);
    }

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            Config::parse_origins(" https://a.dev, ,https://b.dev,"),
            vec!["https://a.dev", "https://b.dev"]
        );
    }

    #[test]
    fn test_listen_addr_overrides() {
        let mut config = Config::default();
        config.set_listen_addr(None, Some(9000)).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:9000");

        config.set_listen_addr(Some("127.0.0.1"), None).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9000");

        config.set_listen_addr(Some("[::1]"), Some(8787)).unwrap();
        assert_eq!(config.listen_addr.to_string(), "[::1]:8787");

        config.set_listen_addr(Some("localhost"), Some(8080)).unwrap();
        assert!(config.listen_addr.ip().is_loopback());
        assert_eq!(config.listen_addr.port(), 8080);

        assert!(config.set_listen_addr(Some("no such host.invalid"), None).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.allowed_origins = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.private_key = Some("/nonexistent/key.pem".to_string());
        assert!(config.validate().is_err());

        config.certificate = Some("/nonexistent/cert.pem".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ca_certificate = Some("/nonexistent/ca.pem".to_string());
        assert!(config.validate().is_err());
    }
}
