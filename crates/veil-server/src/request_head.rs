//! HTTP/1.x request heads read off a raw connection using httparse.
//!
//! The dispatcher reads heads itself so that a request can stop being HTTP at
//! any point: [`HttpConn::into_stream`] hands over the raw connection together
//! with any bytes already buffered past the head.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use veil_io::{BoxedStream, PrefixedStream};

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Largest accepted request head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest request body read into memory
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request head too large: {0} bytes")]
    TooLarge(usize),
}

/// A parsed request line and header block
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (origin or absolute form)
    pub target: String,
    /// Minor HTTP version (0 or 1)
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Bytes of the request line and headers including the blank line
    pub header_len: usize,
    pub content_length: Option<usize>,
    pub is_chunked: bool,
    /// The head exactly as received
    pub raw: Bytes,
}

impl RequestHead {
    /// Parse a head from the start of `buffer`; `None` when incomplete
    pub fn parse(buffer: &[u8]) -> Result<Option<Self>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buffer) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = req.method.unwrap_or("").to_string();
                let target = req.path.unwrap_or("").to_string();
                let version = req.version.unwrap_or(1);

                let mut parsed_headers = Vec::new();
                let mut content_length = None;
                let mut is_chunked = false;

                for header in req.headers.iter() {
                    let name = header.name.to_string();
                    let value = String::from_utf8_lossy(header.value).to_string();

                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().ok();
                    }
                    if name.eq_ignore_ascii_case("transfer-encoding")
                        && value.to_lowercase().contains("chunked")
                    {
                        is_chunked = true;
                    }

                    parsed_headers.push((name, value));
                }

                Ok(Some(Self {
                    method,
                    target,
                    version,
                    headers: parsed_headers,
                    header_len,
                    content_length,
                    is_chunked,
                    raw: Bytes::copy_from_slice(&buffer[..header_len]),
                }))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => {
                debug!("HTTP request parse error: {:?}", e);
                Err(HeadError::Malformed(e.to_string()))
            }
        }
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client allows another request on this connection
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.version >= 1,
        }
    }
}

/// A client connection still speaking HTTP
pub struct HttpConn {
    stream: BoxedStream,
    buf: BytesMut,
}

impl HttpConn {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next request head; `None` on a clean EOF between requests
    pub async fn read_head(&mut self) -> Result<Option<RequestHead>, HeadError> {
        loop {
            if !self.buf.is_empty() {
                if let Some(head) = RequestHead::parse(&self.buf)? {
                    let _ = self.buf.split_to(head.header_len);
                    return Ok(Some(head));
                }
                if self.buf.len() > MAX_HEAD_SIZE {
                    return Err(HeadError::TooLarge(self.buf.len()));
                }
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HeadError::Malformed(
                    "connection closed inside request head".to_string(),
                ));
            }
        }
    }

    /// Read exactly `len` body bytes following the head
    pub async fn read_body(&mut self, len: usize) -> Result<Bytes, HeadError> {
        while self.buf.len() < len {
            self.buf.reserve(READ_CHUNK.min(len - self.buf.len()));
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(HeadError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed inside request body",
                )));
            }
        }

        Ok(self.buf.split_to(len).freeze())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    pub fn stream_mut(&mut self) -> &mut BoxedStream {
        &mut self.stream
    }

    /// Leave HTTP: the raw connection, replaying bytes read past the head
    pub fn into_stream(self) -> BoxedStream {
        if self.buf.is_empty() {
            self.stream
        } else {
            Box::new(PrefixedStream::new(self.buf.freeze(), self.stream))
        }
    }
}
