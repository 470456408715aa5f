//! HTTP forwarding of enveloped requests

use crate::request_head::RequestHead;
use bytes::Bytes;
use futures_util::TryStreamExt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;
use veil_io::{copy, IoConfig};
use veil_proto::{ClientRequest, EnvelopeCodec, EnvelopeError, SealedEnvelope, SEALED_HEADER};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Headers that describe one connection rather than the message
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
        "content-length",
    ];
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Build an HTTP client for upstream round trips; certificates are not verified
pub(crate) fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Performs the upstream round trip of Forward requests
pub struct Forwarder {
    client: reqwest::Client,
    codec: SealedEnvelope,
}

impl Forwarder {
    pub fn new(codec: SealedEnvelope) -> Result<Self, ForwardError> {
        Ok(Self {
            client: build_client()?,
            codec,
        })
    }

    /// Forward one request to `url` and stream the ciphered response to
    /// `stream`. The connection is closed after the response.
    pub async fn forward<W>(
        &self,
        stream: &mut W,
        url: reqwest::Url,
        head: &RequestHead,
        body: Bytes,
        request: &ClientRequest,
        ioc: &IoConfig,
    ) -> Result<(), ForwardError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let cipher = self.codec.cipher();

        match self.round_trip(url.clone(), head, body, request).await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= 400 {
                    debug!(url = %url, status = %status, "HTTP forward upstream error status");
                }

                let headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();

                let sealed = self.codec.seal_headers(&headers, &request.iv);
                let response_head = format!(
                    "HTTP/1.1 {} {}\r\n{}: {}\r\nConnection: close\r\n\r\n",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(""),
                    SEALED_HEADER,
                    sealed
                );
                stream.write_all(response_head.as_bytes()).await?;

                let body = response
                    .bytes_stream()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                let mut reader = StreamReader::new(Box::pin(body));
                let copied = copy(stream, &mut reader, cipher.stream(&request.iv), ioc).await?;
                debug!(url = %url, bytes = copied, "HTTP forward done");
            }
            Err(e) => {
                let mut message = e.to_string().into_bytes();
                cipher.stream(&request.iv).apply(&mut message);

                let response_head = format!(
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    message.len()
                );
                stream.write_all(response_head.as_bytes()).await?;
                stream.write_all(&message).await?;
                stream.flush().await?;
                return Err(e);
            }
        }

        stream.shutdown().await?;
        Ok(())
    }

    async fn round_trip(
        &self,
        url: reqwest::Url,
        head: &RequestHead,
        body: Bytes,
        request: &ClientRequest,
    ) -> Result<reqwest::Response, ForwardError> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(head.method.clone()))?;

        let mut headers: Vec<(String, String)> = head
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case(SEALED_HEADER))
            .cloned()
            .collect();

        if let Some(sealed) = head.header(SEALED_HEADER) {
            for (name, value) in self.codec.unseal_headers(sealed, &request.iv)? {
                headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
                headers.push((name, value));
            }
        }

        let mut plain_body = body.to_vec();
        self.codec
            .cipher()
            .stream(&request.iv)
            .apply(&mut plain_body);

        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            if is_hop_by_hop(&name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        Ok(builder.body(plain_body).send().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("host"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-Request-Meta"));
    }
}
