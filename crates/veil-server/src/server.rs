//! Proxy server listener with optional TLS termination
use crate::config::ServerConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::mux::Accepted;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use veil_io::BoxedStream;

/// Interval of the statistics log line
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Sub-streams of mux sessions waiting for dispatch
const MUX_ACCEPT_QUEUE: usize = 128;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    mux_rx: mpsc::Receiver<Accepted>,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let tls = match &config.tls {
            Some(tls) => {
                ensure_crypto_provider();

                info!("Loading TLS certificate from: {}", tls.cert_path);
                let certs = Self::load_certs(Path::new(&tls.cert_path))?;

                info!("Loading TLS private key from: {}", tls.key_path);
                let key = Self::load_private_key(Path::new(&tls.key_path))?;

                let tls_config = tokio_rustls::rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| ServerError::TlsError(format!("Invalid cert/key: {}", e)))?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            None => None,
        };

        let (mux_tx, mux_rx) = mpsc::channel(MUX_ACCEPT_QUEUE);
        let dispatcher = Arc::new(Dispatcher::new(config, mux_tx)?);

        Ok(Self {
            dispatcher,
            mux_rx,
            tls,
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Load TLS certificates from PEM files
    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
        let file = File::open(path)
            .map_err(|e| ServerError::TlsError(format!("Failed to open cert file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::TlsError(format!("Failed to parse certs: {}", e)))
    }

    /// Load private key from PEM file
    fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
        let file = File::open(path)
            .map_err(|e| ServerError::TlsError(format!("Failed to open key file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ServerError::TlsError(format!("Failed to parse key: {}", e)))?
            .ok_or_else(|| ServerError::TlsError("No private key found".to_string()))
    }

    /// Bind with retry to ride out TIME_WAIT (3 attempts, 1 second apart)
    async fn bind_with_retry(addr: &str) -> Result<TcpListener, ServerError> {
        let (address, port) = split_host_port(addr);

        for attempt in 1..=3 {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Successfully bound to {} on attempt {}/3", addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        port, attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ServerError::BindError {
                        address,
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ServerError::BindError {
            address,
            port,
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<(), ServerError> {
        let addr = self.dispatcher.config().listen_addr();
        let listener = Self::bind_with_retry(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let Self {
            dispatcher,
            mut mux_rx,
            tls,
        } = self;

        let local_addr = listener.local_addr()?;
        info!(
            tls = tls.is_some(),
            localrp = !dispatcher.config().disable_localrp,
            udp = !dispatcher.config().disable_udp,
            "✅ Proxy server listening on {}",
            local_addr
        );

        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.tick().await;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let dispatcher = dispatcher.clone();
                        let tls = tls.clone();

                        tokio::spawn(async move {
                            let stream: BoxedStream = match tls {
                                Some(acceptor) => match acceptor.accept(tcp).await {
                                    Ok(tls_stream) => Box::new(tls_stream),
                                    Err(e) => {
                                        debug!("TLS handshake failed from {}: {}", peer_addr, e);
                                        return;
                                    }
                                },
                                None => Box::new(tcp),
                            };
                            dispatcher.serve(stream, Some(peer_addr)).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some((stream, peer_addr)) = mux_rx.recv() => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.serve(stream, Some(peer_addr)).await;
                    });
                }
                _ = stats.tick() => {
                    let localrp = dispatcher.controller().stats();
                    if localrp.active {
                        debug!(
                            agents = localrp.agents,
                            waiting = localrp.waiting,
                            queued = localrp.queued,
                            "📊 LocalRP stats"
                        );
                    }
                    debug!(tracked = dispatcher.abuse_guard().len(), "📊 Abuse guard");
                }
            }
        }
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// Host and port parts of a listen address, for error reporting
fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port.parse().unwrap_or(0),
        ),
        None => (addr.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("0.0.0.0:8080"), ("0.0.0.0".to_string(), 8080));
        assert_eq!(split_host_port("[::1]:443"), ("::1".to_string(), 443));
        assert_eq!(split_host_port("nonsense"), ("nonsense".to_string(), 0));
    }

    #[tokio::test]
    async fn test_bind_error_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        // AddrInUse is retried, so expect the error after the retries
        let err = ProxyServer::bind_with_retry(&addr).await.unwrap_err();
        match err {
            ServerError::BindError { address, port, .. } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(port, taken.local_addr().unwrap().port());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_certificate() {
        let mut config = ServerConfig::new("k");
        config.tls = Some(crate::config::TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
        });

        assert!(matches!(
            ProxyServer::new(config),
            Err(ServerError::TlsError(_))
        ));
    }
}
