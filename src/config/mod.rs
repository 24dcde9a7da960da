use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream target every request is forwarded to
    pub upstream: UpstreamConfig,
    /// Authorization probe configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Logging, request dumps and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Largest inbound body the gateway will buffer
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Upstream target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL (scheme + host, optionally a base path)
    pub url: String,
}

/// Authorization probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path prefix the probe path is rooted under
    #[serde(default = "default_auth_prefix")]
    pub prefix: String,
    /// Read-only method used for probes
    #[serde(default = "default_probe_method")]
    pub probe_method: String,
    /// Deadline for a single probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Dump every forwarded request at debug level
    #[serde(default)]
    pub dump_requests: bool,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Port for the Prometheus scrape endpoint (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_auth_prefix() -> String {
    "/trickster-auth".to_string()
}

fn default_probe_method() -> String {
    "GET".to_string()
}

fn default_probe_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            prefix: default_auth_prefix(),
            probe_method: default_probe_method(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// Parse and check the upstream URL
    pub fn parse(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| GatewayError::InvalidUpstream(format!("{}: {}", self.url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GatewayError::InvalidUpstream(format!(
                "Upstream URL must start with http:// or https://: {}",
                self.url
            )));
        }

        if url.host_str().is_none() {
            return Err(GatewayError::InvalidUpstream(format!(
                "Upstream URL has no host: {}",
                self.url
            )));
        }

        Ok(url)
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.upstream.parse()?;

        if self.server.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "Server timeout must be > 0".to_string(),
            ));
        }

        if !self.auth.prefix.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Auth prefix must start with '/': {}",
                self.auth.prefix
            )));
        }

        // Probes must never mutate state on the authorization service
        let method = self.auth.probe_method.to_uppercase();
        if method != "GET" && method != "HEAD" {
            return Err(GatewayError::Config(format!(
                "Probe method must be GET or HEAD, got '{}'",
                self.auth.probe_method
            )));
        }

        if self.auth.probe_timeout_secs == 0 {
            return Err(GatewayError::Config(
                "Probe timeout must be > 0".to_string(),
            ));
        }

        if self.observability.metrics_port == Some(self.server.port) {
            return Err(GatewayError::Config(format!(
                "Metrics port {} collides with the server port",
                self.server.port
            )));
        }

        Ok(())
    }

    /// Create a configuration pointing at the given upstream with defaults elsewhere
    pub fn with_upstream(url: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig { url: url.into() },
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
