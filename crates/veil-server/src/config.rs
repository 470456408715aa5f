//! Server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// TLS listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Settings of the proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address; a bare port means 0.0.0.0:port
    pub listen: String,
    /// Master secret of the cipher and envelope
    pub key: String,
    /// Token bucket rate in bytes per second, 0 disables throttling
    pub throttling: u32,
    /// Token bucket burst in bytes
    pub throttling_max: u32,
    pub bind_timeout_secs: u64,
    pub bind_hard_timeout_secs: u64,
    pub bind_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub disable_udp: bool,
    pub disable_localrp: bool,
    /// Accepted auth tokens; unset accepts any
    pub users: Option<HashSet<String>>,
    /// Fallback: reverse proxy URL (http...) or static file root
    pub proxy_pass: Option<String>,
    pub tls: Option<TlsConfig>,
    pub abuse_capacity: usize,
    pub invalid_request_retry: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            key: String::new(),
            throttling: 0,
            throttling_max: 0,
            bind_timeout_secs: 10,
            bind_hard_timeout_secs: 30,
            bind_capacity: 100,
            heartbeat_interval_ms: 1000,
            disable_udp: false,
            disable_localrp: false,
            users: None,
            proxy_pass: None,
            tls: None,
            abuse_capacity: 128,
            invalid_request_retry: 8,
        }
    }
}

impl ServerConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Listen address with a bare port expanded to all interfaces
    pub fn listen_addr(&self) -> String {
        let listen = self.listen.trim();
        match listen.parse::<u16>() {
            Ok(port) => format!("0.0.0.0:{}", port),
            Err(_) => listen.to_string(),
        }
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    pub fn bind_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_hard_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Whether `auth` passes the configured token set
    pub fn is_authorized(&self, auth: &str) -> bool {
        match &self.users {
            Some(users) => users.contains(auth),
            None => true,
        }
    }
}
