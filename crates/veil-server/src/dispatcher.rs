//! Per-connection request dispatch
//!
//! Every accepted connection is read one HTTP request head at a time. A head
//! whose target decodes as an envelope is proxy traffic and is dispatched by
//! its option flags; anything else is either a client waiting for a LocalRP
//! agent (while a session is active) or a visitor who gets the fallback.

use crate::abuse_guard::AbuseGuard;
use crate::config::ServerConfig;
use crate::dns::{encode_answer, resolve_ipv4};
use crate::fallback::{Fallback, FallbackError};
use crate::forward::{ForwardError, Forwarder};
use crate::mux::{serve_mux, Accepted};
use crate::request_head::{HeadError, HttpConn, RequestHead, MAX_BODY_SIZE};
use crate::response::{not_found, reply_good, simple_response, write_error};
use crate::throttle::ThrottleFactory;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use veil_control::{LocalRpConfig, LocalRpController, PendingRequest};
use veil_io::{bridge, BoxedStream, IoConfig, UdpRelayConn};
use veil_proto::{
    strip_uri, Cipher, ClientRequest, CorrelationToken, EnvelopeCodec, RequestOptions, SealedEnvelope,
    DNS_ANSWER_HEADER, LOCALRP_DESTINATION,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Head(#[from] HeadError),

    #[error("Forward setup error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Fallback setup error: {0}")]
    Fallback(#[from] FallbackError),
}

/// What happens to a connection after one request
pub enum Outcome {
    /// The connection still speaks HTTP and may carry another request
    KeepAlive(HttpConn),
    /// The connection was answered and closed, or left HTTP for good
    Close,
}

/// Routes requests of accepted connections
pub struct Dispatcher {
    config: ServerConfig,
    codec: SealedEnvelope,
    cipher: Cipher,
    abuse: AbuseGuard,
    throttle: ThrottleFactory,
    controller: Arc<LocalRpController>,
    fallback: Fallback,
    forwarder: Forwarder,
    mux_tx: mpsc::Sender<Accepted>,
}

impl Dispatcher {
    /// `mux_tx` receives the sub-streams of upgraded connections
    pub fn new(config: ServerConfig, mux_tx: mpsc::Sender<Accepted>) -> Result<Self, DispatchError> {
        let cipher = Cipher::new(&config.key);
        let controller = LocalRpController::new(
            LocalRpConfig {
                disabled: config.disable_localrp,
                capacity: config.bind_capacity,
                heartbeat_interval: config.heartbeat_interval(),
                bind_timeout: config.bind_timeout(),
            },
            cipher.clone(),
        );

        Ok(Self {
            codec: SealedEnvelope::new(cipher.clone()),
            abuse: AbuseGuard::new(config.abuse_capacity),
            throttle: ThrottleFactory::new(config.throttling, config.throttling_max),
            fallback: Fallback::from_proxy_pass(config.proxy_pass.as_deref())?,
            forwarder: Forwarder::new(SealedEnvelope::new(cipher.clone()))?,
            controller,
            cipher,
            config,
            mux_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn abuse_guard(&self) -> &AbuseGuard {
        &self.abuse
    }

    pub fn controller(&self) -> &Arc<LocalRpController> {
        &self.controller
    }

    /// Serve every request of one connection
    pub async fn serve(self: Arc<Self>, stream: BoxedStream, peer: Option<SocketAddr>) {
        let mut conn = HttpConn::new(stream);
        loop {
            match self.handle(conn, peer).await {
                Ok(Outcome::KeepAlive(next)) => conn = next,
                Ok(Outcome::Close) => break,
                Err(e) => {
                    debug!(peer = ?peer, "Connection ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Handle the next request on `conn`
    pub async fn handle(
        &self,
        mut conn: HttpConn,
        peer: Option<SocketAddr>,
    ) -> Result<Outcome, DispatchError> {
        let head = match conn.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(Outcome::Close),
            Err(HeadError::Io(e)) => return Err(e.into()),
            Err(e) => {
                debug!(peer = ?peer, "Unreadable request: {}", e);
                if let Some(peer) = peer {
                    self.abuse.record(peer.ip());
                }
                conn.write_all(&not_found(false)).await?;
                return Ok(Outcome::Close);
            }
        };

        let body = match self.read_body(&mut conn, &head).await? {
            Some(body) => body,
            None => return Ok(Outcome::Close),
        };

        let Some(peer) = peer else {
            warn!(target = %head.target, "Request without a remote address");
            return self.default_page(conn, &head, body).await;
        };

        let raw_request = self.controller.is_active().then(|| {
            let mut raw = BytesMut::with_capacity(head.raw.len() + body.len());
            raw.extend_from_slice(&head.raw);
            raw.extend_from_slice(&body);
            raw.freeze()
        });

        let request = match self.codec.decode(&head.target) {
            Ok(request) => request,
            Err(e) => {
                if let Some(raw) = raw_request {
                    self.await_agent(conn, &head, raw, peer).await?;
                    return Ok(Outcome::Close);
                }
                debug!(peer = %peer, target = %head.target, "Invalid request: {}", e);
                self.abuse.record(peer.ip());
                return self.default_page(conn, &head, body).await;
            }
        };

        if !self.config.is_authorized(&request.auth) {
            info!(peer = %peer, "Rejected request with unknown auth token");
            self.abuse.record(peer.ip());
            return self.default_page(conn, &head, body).await;
        }

        let hits = self.abuse.hits(peer.ip());
        if hits > self.config.invalid_request_retry {
            debug!(peer = %peer, hits, "Repeated offender");
        }

        if request.is_set(RequestOptions::DNS) {
            let ip = resolve_ipv4(&request.destination).await;
            let keep_alive = head.keep_alive();
            let response = simple_response(
                "200 OK",
                &[(DNS_ANSWER_HEADER, encode_answer(ip))],
                b"",
                keep_alive,
            );
            conn.write_all(&response).await?;
            return Ok(if keep_alive {
                Outcome::KeepAlive(conn)
            } else {
                Outcome::Close
            });
        }

        if request.is_set(RequestOptions::LOCAL_RP) {
            let ioc = self.throttle.io_config(&request);
            let stream = conn.into_stream();

            if request.destination == LOCALRP_DESTINATION {
                if let Err(e) = self
                    .controller
                    .register_agent(stream, peer, request.iv, ioc)
                    .await
                {
                    debug!(peer = %peer, "LocalRP registration refused: {}", e);
                }
            } else {
                self.fulfil(stream, &head, &request, ioc, peer).await;
            }
            return Ok(Outcome::Close);
        }

        if request.is_set(RequestOptions::CONNECT) {
            self.connect(conn.into_stream(), &head, &request, peer).await?;
            return Ok(Outcome::Close);
        }

        if request.is_set(RequestOptions::FORWARD) {
            let url = match reqwest::Url::parse(&request.destination) {
                Ok(url) => url,
                Err(_) => return self.default_page(conn, &head, body).await,
            };

            let ioc = self.throttle.io_config(&request);
            let mut stream = conn.into_stream();
            if let Err(e) = self
                .forwarder
                .forward(&mut stream, url, &head, body, &request, &ioc)
                .await
            {
                error!(peer = %peer, destination = %request.destination, "HTTP forward failed: {}", e);
            }
            return Ok(Outcome::Close);
        }

        debug!(peer = %peer, options = request.options.as_u16(), "Request without a known option");
        self.abuse.record(peer.ip());
        self.default_page(conn, &head, body).await
    }

    /// Content-Length body of `head`; `None` when the request was refused
    async fn read_body(
        &self,
        conn: &mut HttpConn,
        head: &RequestHead,
    ) -> Result<Option<Bytes>, DispatchError> {
        if head.is_chunked {
            conn.write_all(&simple_response("411 Length Required", &[], b"", false))
                .await?;
            return Ok(None);
        }

        match head.content_length {
            Some(len) if len > MAX_BODY_SIZE => {
                conn.write_all(&simple_response("413 Payload Too Large", &[], b"", false))
                    .await?;
                Ok(None)
            }
            Some(len) if len > 0 => Ok(Some(conn.read_body(len).await?)),
            _ => Ok(Some(Bytes::new())),
        }
    }

    async fn default_page(
        &self,
        mut conn: HttpConn,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<Outcome, DispatchError> {
        if self.fallback.respond(&mut conn, head, body).await? {
            Ok(Outcome::KeepAlive(conn))
        } else {
            Ok(Outcome::Close)
        }
    }

    /// Park a non-proxy request until an agent serves it or the wait times out
    async fn await_agent(
        &self,
        conn: HttpConn,
        head: &RequestHead,
        raw: Bytes,
        peer: SocketAddr,
    ) -> Result<(), DispatchError> {
        let id = self.controller.next_request_id();
        let destination = strip_uri(&head.target).to_string();
        let (request, mut handle) = PendingRequest::new(id, destination, conn.into_stream(), raw);

        debug!(request_id = id, peer = %peer, "Queueing request for LocalRP");

        if let Err(e) = self.controller.enqueue(request).await {
            debug!(request_id = id, "LocalRP enqueue failed: {}", e);
            if let Some(mut stream) = handle.take_conn() {
                write_error(&mut stream, "502 Bad Gateway", &e.to_string()).await?;
            }
            return Ok(());
        }

        let waited = tokio::time::timeout(self.config.bind_timeout(), &mut handle.completion).await;
        let soft_expired = waited.is_err();

        match waited {
            Ok(Ok(Ok(()))) => debug!(request_id = id, "LocalRP request fulfilled"),
            Ok(Ok(Err(e))) => {
                if let Some(mut stream) = handle.take_conn() {
                    write_error(&mut stream, "400 Bad Request", &e.to_string()).await?;
                }
            }
            Ok(Err(_)) | Err(_) => match handle.take_conn() {
                Some(mut stream) => {
                    debug!(request_id = id, "LocalRP request timed out");
                    write_error(&mut stream, "502 Bad Gateway", "localrp timed out").await?;
                }
                None if soft_expired => {
                    let hard = self.config.bind_hard_timeout();
                    if tokio::time::timeout(hard, &mut handle.completion)
                        .await
                        .is_err()
                    {
                        warn!(
                            request_id = id,
                            hard_timeout_secs = hard.as_secs(),
                            "LocalRP hard timeout: fulfilment never completed"
                        );
                    }
                }
                None => {}
            },
        }

        self.controller.forget(id);
        Ok(())
    }

    /// Pair an agent's answering connection with the client waiting on its token
    async fn fulfil(
        &self,
        mut stream: BoxedStream,
        head: &RequestHead,
        request: &ClientRequest,
        mut ioc: IoConfig,
        peer: SocketAddr,
    ) {
        let Ok(token) = CorrelationToken::from_hex(&request.destination) else {
            debug!(peer = %peer, destination = %request.destination, "Malformed LocalRP token");
            return;
        };
        let Some(pending) = self.controller.claim(&token) else {
            debug!(peer = %peer, token = %token, "Unknown LocalRP token");
            return;
        };

        let Some(original) = pending.take_conn() else {
            debug!(request_id = pending.id, "LocalRP client already gone");
            return;
        };

        if let Err(e) = reply_good(&mut stream, request, &mut ioc, head).await {
            debug!(request_id = pending.id, "LocalRP fulfilment failed: {}", e);
            pending.complete(Err(e.into()));
            return;
        }

        let request_id = pending.id;
        let cipher = self.cipher.clone();
        let iv = request.iv;
        tokio::spawn(async move {
            if let Err(e) = bridge(stream, original, &cipher, &iv, &ioc).await {
                debug!(request_id, "LocalRP bridge ended: {}", e);
            }
        });

        debug!(request_id, peer = %peer, "LocalRP request paired");
        pending.complete(Ok(()));
    }

    /// Dial the destination and relay, or upgrade the connection into a mux
    async fn connect(
        &self,
        mut stream: BoxedStream,
        head: &RequestHead,
        request: &ClientRequest,
        peer: SocketAddr,
    ) -> Result<(), DispatchError> {
        let mut ioc = self.throttle.io_config(request);
        let destination = request.destination.as_str();

        let upstream: BoxedStream = if request.is_set(RequestOptions::UDP_RELAY) {
            if self.config.disable_udp {
                debug!(peer = %peer, "UDP relay disabled");
                let _ = stream.shutdown().await;
                return Ok(());
            }
            match UdpRelayConn::connect(destination).await {
                Ok(udp) => Box::new(udp),
                Err(e) => {
                    error!(destination, "UDP dial failed: {}", e);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        } else {
            match TcpStream::connect(destination).await {
                Ok(tcp) => Box::new(tcp),
                Err(e) => {
                    error!(destination, "Dial failed: {}", e);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        };

        reply_good(&mut stream, request, &mut ioc, head).await?;

        if request.is_set(RequestOptions::MUX_UPGRADE) {
            drop(upstream);
            debug!(peer = %peer, "Upgrading connection to mux");
            let accept_tx = self.mux_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_mux(stream, peer, accept_tx).await {
                    debug!(peer = %peer, "Mux session ended: {}", e);
                }
            });
            return Ok(());
        }

        debug!(peer = %peer, destination, "Relaying");
        let cipher = self.cipher.clone();
        let iv = request.iv;
        let destination = destination.to_string();
        tokio::spawn(async move {
            if let Err(e) = bridge(stream, upstream, &cipher, &iv, &ioc).await {
                debug!(destination = %destination, "Relay ended: {}", e);
            }
        });
        Ok(())
    }
}
