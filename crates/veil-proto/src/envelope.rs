//! Request envelope codec
//!
//! A client request travels as the HTTP request target:
//!
//! ```text
//! "/" + base64url(iv(16) || enc(opts u16 BE || auth_len u8 || auth || destination) || tag(8))
//! ```
//!
//! where `enc` is the envelope keystream of the request IV and `tag` is the
//! first 8 bytes of SHA-256(master || iv || plaintext).

use crate::cipher::Cipher;
use crate::options::RequestOptions;
use crate::request::{ClientRequest, Iv};
use crate::IV_LEN;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Header carrying sealed request or response headers of a forwarded request
pub const SEALED_HEADER: &str = "X-Request-Meta";

const TAG_LEN: usize = 8;
const MIN_ENVELOPE_LEN: usize = IV_LEN + 3 + TAG_LEN;

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Envelope too short: {0} bytes")]
    TooShort(usize),

    #[error("Tag mismatch")]
    TagMismatch,

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Encodes and decodes client requests and sealed header blocks
pub trait EnvelopeCodec: Send + Sync {
    /// Decode a request target into a client request
    fn decode(&self, target: &str) -> Result<ClientRequest, EnvelopeError>;

    /// Encode a client request into a request target
    fn encode(&self, request: &ClientRequest) -> Result<String, EnvelopeError>;

    /// Seal a header list under the request IV
    fn seal_headers(&self, headers: &[(String, String)], iv: &Iv) -> String;

    /// Recover a header list sealed with `seal_headers`
    fn unseal_headers(&self, sealed: &str, iv: &Iv)
        -> Result<Vec<(String, String)>, EnvelopeError>;
}

/// Envelope codec keyed by the server secret
#[derive(Debug, Clone)]
pub struct SealedEnvelope {
    cipher: Cipher,
}

impl SealedEnvelope {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }
}

impl EnvelopeCodec for SealedEnvelope {
    fn decode(&self, target: &str) -> Result<ClientRequest, EnvelopeError> {
        let encoded = strip_uri(target);
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|e| EnvelopeError::InvalidEncoding(e.to_string()))?;

        if raw.len() < MIN_ENVELOPE_LEN {
            return Err(EnvelopeError::TooShort(raw.len()));
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&raw[..IV_LEN]);

        let tag_start = raw.len() - TAG_LEN;
        let mut plain = raw[IV_LEN..tag_start].to_vec();
        self.cipher.envelope_stream(&iv).apply(&mut plain);

        if self.cipher.tag(&iv, &plain, TAG_LEN) != raw[tag_start..] {
            return Err(EnvelopeError::TagMismatch);
        }

        let mut buf = &plain[..];
        let options = RequestOptions::from_u16(buf.get_u16());
        let auth_len = buf.get_u8() as usize;
        if buf.remaining() < auth_len {
            return Err(EnvelopeError::Malformed(format!(
                "auth length {} exceeds payload",
                auth_len
            )));
        }

        let auth = String::from_utf8(buf[..auth_len].to_vec())
            .map_err(|_| EnvelopeError::Malformed("auth is not UTF-8".to_string()))?;
        let destination = String::from_utf8(buf[auth_len..].to_vec())
            .map_err(|_| EnvelopeError::Malformed("destination is not UTF-8".to_string()))?;
        if destination.is_empty() {
            return Err(EnvelopeError::Malformed("empty destination".to_string()));
        }

        Ok(ClientRequest {
            auth,
            destination,
            options,
            iv,
        })
    }

    fn encode(&self, request: &ClientRequest) -> Result<String, EnvelopeError> {
        if request.auth.len() > u8::MAX as usize {
            return Err(EnvelopeError::Malformed(format!(
                "auth too long: {} bytes",
                request.auth.len()
            )));
        }

        let mut plain =
            BytesMut::with_capacity(3 + request.auth.len() + request.destination.len());
        plain.put_u16(request.options.as_u16());
        plain.put_u8(request.auth.len() as u8);
        plain.put_slice(request.auth.as_bytes());
        plain.put_slice(request.destination.as_bytes());

        let tag = self.cipher.tag(&request.iv, &plain, TAG_LEN);
        self.cipher.envelope_stream(&request.iv).apply(&mut plain);

        let mut raw = Vec::with_capacity(IV_LEN + plain.len() + TAG_LEN);
        raw.extend_from_slice(&request.iv);
        raw.extend_from_slice(&plain);
        raw.extend_from_slice(&tag);

        Ok(format!("/{}", URL_SAFE_NO_PAD.encode(raw)))
    }

    fn seal_headers(&self, headers: &[(String, String)], iv: &Iv) -> String {
        let mut block = Vec::new();
        for (name, value) in headers {
            block.extend_from_slice(name.as_bytes());
            block.extend_from_slice(b": ");
            block.extend_from_slice(value.as_bytes());
            block.extend_from_slice(b"\r\n");
        }

        self.cipher.header_stream(iv).apply(&mut block);
        URL_SAFE_NO_PAD.encode(block)
    }

    fn unseal_headers(
        &self,
        sealed: &str,
        iv: &Iv,
    ) -> Result<Vec<(String, String)>, EnvelopeError> {
        let mut block = URL_SAFE_NO_PAD
            .decode(sealed.trim().as_bytes())
            .map_err(|e| EnvelopeError::InvalidEncoding(e.to_string()))?;
        self.cipher.header_stream(iv).apply(&mut block);

        let text = String::from_utf8(block)
            .map_err(|_| EnvelopeError::Malformed("headers are not UTF-8".to_string()))?;

        let mut headers = Vec::new();
        for line in text.split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| EnvelopeError::Malformed(format!("bad header line: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(headers)
    }
}

/// Reduce a request target to the envelope text
///
/// Drops an absolute-form `scheme://authority`, the query string and the
/// leading `/`.
pub fn strip_uri(target: &str) -> &str {
    let mut path = target;

    if let Some(idx) = path.find("://") {
        let rest = &path[idx + 3..];
        path = match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "",
        };
    }

    if let Some(q) = path.find('?') {
        path = &path[..q];
    }

    path.trim_start_matches('/')
}
