//! Configuration loading: YAML file first, then flags and environment

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use veil_server::{ServerConfig, TlsConfig};

/// Server settings accepted on the command line
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(short, long, env = "VEIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address (a bare port listens on all interfaces)
    #[arg(short, long, env = "VEIL_LISTEN")]
    pub listen: Option<String>,

    /// Master secret shared with clients and agents
    #[arg(short, long, env = "VEIL_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Relay throughput limit in bytes per second (0 = unlimited)
    #[arg(long, env = "VEIL_THROTTLING")]
    pub throttling: Option<u32>,

    /// Burst size of the throughput limit in bytes
    #[arg(long)]
    pub throttling_max: Option<u32>,

    /// Seconds a LocalRP client waits for an agent
    #[arg(long)]
    pub bind_timeout: Option<u64>,

    /// Seconds a claimed LocalRP request may take after the wait expired
    #[arg(long)]
    pub bind_hard_timeout: Option<u64>,

    /// LocalRP queue capacity
    #[arg(long)]
    pub bind_capacity: Option<usize>,

    /// Refuse UDP relay requests
    #[arg(long)]
    pub disable_udp: bool,

    /// Refuse LocalRP agent registrations
    #[arg(long)]
    pub disable_localrp: bool,

    /// Accepted auth token (repeatable); without any, all tokens pass
    #[arg(long = "user")]
    pub users: Vec<String>,

    /// Fallback for non-proxy requests: upstream URL or static file root
    #[arg(long, env = "VEIL_PROXY_PASS")]
    pub proxy_pass: Option<String>,

    /// TLS certificate file (PEM)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<String>,

    /// TLS private key file (PEM)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<String>,
}

impl ConfigArgs {
    /// Build the server configuration
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_file(path)?,
            None => ServerConfig::default(),
        };

        self.apply(&mut config);
        validate(&config)?;
        Ok(config)
    }

    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(key) = &self.key {
            config.key = key.clone();
        }
        if let Some(rate) = self.throttling {
            config.throttling = rate;
        }
        if let Some(burst) = self.throttling_max {
            config.throttling_max = burst;
        }
        if let Some(secs) = self.bind_timeout {
            config.bind_timeout_secs = secs;
        }
        if let Some(secs) = self.bind_hard_timeout {
            config.bind_hard_timeout_secs = secs;
        }
        if let Some(capacity) = self.bind_capacity {
            config.bind_capacity = capacity;
        }
        config.disable_udp |= self.disable_udp;
        config.disable_localrp |= self.disable_localrp;

        if !self.users.is_empty() {
            config
                .users
                .get_or_insert_with(Default::default)
                .extend(self.users.iter().cloned());
        }
        if let Some(proxy_pass) = &self.proxy_pass {
            config.proxy_pass = Some(proxy_pass.clone());
        }
        if let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) {
            config.tls = Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            });
        }
    }
}

/// Load config from a YAML file
pub fn load_file(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config: {:?}", path))
}

fn validate(config: &ServerConfig) -> Result<()> {
    if config.key.is_empty() {
        anyhow::bail!("No key configured: set `key` in the config file, --key or VEIL_KEY");
    }
    if config.bind_capacity == 0 {
        anyhow::bail!("bind_capacity must be at least 1");
    }
    if config.heartbeat_interval_ms == 0 {
        anyhow::bail!("heartbeat_interval_ms must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_then_flags() {
        let file = yaml_file(
            r#"
key: from-file
listen: "8443"
throttling: 1000
users: [alice]
"#,
        );

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            throttling: Some(2000),
            users: vec!["bob".to_string()],
            disable_udp: true,
            ..Default::default()
        };
        let config = args.resolve().unwrap();

        assert_eq!(config.key, "from-file");
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        assert_eq!(config.throttling, 2000);
        assert!(config.disable_udp);
        assert!(config.is_authorized("alice"));
        assert!(config.is_authorized("bob"));
        assert!(!config.is_authorized("carol"));
    }

    #[test]
    fn test_flags_only() {
        let args = ConfigArgs {
            key: Some("secret".to_string()),
            tls_cert: Some("cert.pem".to_string()),
            tls_key: Some("key.pem".to_string()),
            ..Default::default()
        };
        let config = args.resolve().unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.bind_timeout_secs, 10);
        assert!(config.users.is_none());
        assert_eq!(config.tls.unwrap().key_path, "key.pem");
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let err = ConfigArgs::default().resolve().unwrap_err();
        assert!(err.to_string().contains("No key configured"));
    }

    #[test]
    fn test_invalid_yaml_names_the_file() {
        let file = yaml_file("key: [unterminated");
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let err = args.resolve().unwrap_err();
        assert!(err.to_string().contains("Failed to parse YAML config"));
    }
}
