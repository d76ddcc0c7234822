//! Configuration types for the home remote client

use std::collections::HashMap;
use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Home remote client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Backend endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_verify_path")]
    pub verify_path: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Headers sent with every authenticated request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// Live connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    /// Fixed delay before a dropped connection is reopened
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            verify_path: default_verify_path(),
            socket_path: default_socket_path(),
            headers: HashMap::new(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_seconds: default_connection_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl ServerConfig {
    fn base(&self) -> crate::Result<Url> {
        Url::parse(&self.base_url).map_err(|e| {
            RemoteError::Config(format!("Invalid base URL '{}': {}", self.base_url, e))
        })
    }

    /// Resolve a resource path against the base URL
    pub fn resolve(&self, path: &str) -> crate::Result<String> {
        let url = self
            .base()?
            .join(path)
            .map_err(|e| RemoteError::Config(format!("Invalid path '{}': {}", path, e)))?;
        Ok(url.to_string())
    }

    /// Socket endpoint: `wss` when the base URL is served over https, `ws` otherwise
    pub fn socket_url(&self) -> crate::Result<String> {
        let mut url = self.base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            RemoteError::Config(format!("Cannot derive socket URL from '{}'", self.base_url))
        })?;
        url.set_path(&self.socket_path);
        url.set_query(None);
        Ok(url.to_string())
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_verify_path() -> String {
    "/token/verify".to_string()
}

fn default_socket_path() -> String {
    "/ws".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    1000
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RemoteError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
