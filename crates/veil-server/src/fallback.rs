//! Default responses for requests that are not proxy traffic

use crate::forward::{build_client, is_hop_by_hop};
use crate::request_head::{HttpConn, RequestHead};
use crate::response::{not_found, simple_response};
use bytes::Bytes;
use futures_util::TryStreamExt;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Invalid proxy_pass URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// What a non-proxy visitor sees
pub enum Fallback {
    /// nginx-style 404 page
    NotFound,
    /// Reverse proxy to an HTTP upstream
    Proxy {
        client: reqwest::Client,
        base: String,
    },
    /// Files under a static root
    Static { root: PathBuf },
}

impl Fallback {
    /// `proxy_pass` starting with `http` proxies, any other value is a static root
    pub fn from_proxy_pass(proxy_pass: Option<&str>) -> Result<Self, FallbackError> {
        match proxy_pass.map(str::trim) {
            None | Some("") => Ok(Fallback::NotFound),
            Some(addr) if addr.starts_with("http") => {
                reqwest::Url::parse(addr).map_err(|e| FallbackError::InvalidUrl(e.to_string()))?;
                Ok(Fallback::Proxy {
                    client: build_client()?,
                    base: addr.trim_end_matches('/').to_string(),
                })
            }
            Some(root) => Ok(Fallback::Static {
                root: PathBuf::from(root),
            }),
        }
    }

    /// Answer `head` on `conn`; returns whether the connection may be reused
    pub async fn respond(
        &self,
        conn: &mut HttpConn,
        head: &RequestHead,
        body: Bytes,
    ) -> io::Result<bool> {
        let keep_alive = head.keep_alive();

        match self {
            Fallback::NotFound => {
                conn.write_all(&not_found(keep_alive)).await?;
                Ok(keep_alive)
            }
            Fallback::Static { root } => {
                let response = match resolve_static(root, &head.target) {
                    Some(path) => match tokio::fs::read(&path).await {
                        Ok(content) => {
                            let mime = mime_guess::from_path(&path).first_or_octet_stream();
                            let body: &[u8] = if head.method.eq_ignore_ascii_case("HEAD") {
                                &[]
                            } else {
                                &content
                            };
                            simple_response(
                                "200 OK",
                                &[("Content-Type", mime.essence_str().to_string())],
                                body,
                                keep_alive,
                            )
                        }
                        Err(_) => not_found(keep_alive),
                    },
                    None => not_found(keep_alive),
                };
                conn.write_all(&response).await?;
                Ok(keep_alive)
            }
            Fallback::Proxy { client, base } => {
                proxy_pass(client, base, conn, head, body).await?;
                Ok(false)
            }
        }
    }
}

/// Path and query of a request target; drops an absolute-form
/// `scheme://authority`
fn origin_form(target: &str) -> &str {
    let Some(idx) = target.find("://") else {
        return target;
    };

    let rest = &target[idx + 3..];
    match rest.find(['/', '?']) {
        Some(start) if rest[start..].starts_with('/') => &rest[start..],
        _ => "/",
    }
}

/// File under `root` for a request target, `None` for paths escaping the root
fn resolve_static(root: &Path, target: &str) -> Option<PathBuf> {
    let path = origin_form(target).split(['?', '#']).next().unwrap_or("/");

    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if resolved.is_dir() {
        resolved.push("index.html");
    }
    Some(resolved)
}

async fn proxy_pass(
    client: &reqwest::Client,
    base: &str,
    conn: &mut HttpConn,
    head: &RequestHead,
    body: Bytes,
) -> io::Result<()> {
    let url = format!("{}{}", base, origin_form(&head.target));
    let method = match reqwest::Method::from_bytes(head.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            conn.write_all(&not_found(false)).await?;
            return Ok(());
        }
    };

    let mut builder = client.request(method, &url);
    for (name, value) in head.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = match builder.body(body).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, "Fallback proxy error: {}", e);
            let page = simple_response("502 Bad Gateway", &[], b"", false);
            conn.write_all(&page).await?;
            return Ok(());
        }
    };

    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    conn.write_all(out.as_bytes()).await?;

    let body = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(Box::pin(body));
    let copied = tokio::io::copy(&mut reader, conn.stream_mut()).await?;
    conn.stream_mut().shutdown().await?;

    debug!(url = %url, status = %status, bytes = copied, "Fallback proxy response");
    Ok(())
}
