//! Raw HTTP responses written on client connections

use crate::request_head::RequestHead;
use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use veil_io::{IoConfig, WsMode};
use veil_proto::{ClientRequest, RequestOptions};

/// Body of the default 404 page
pub const NOT_FOUND_PAGE: &str = "<html>
<head><title>404 Not Found</title></head>
<body bgcolor=\"white\">
<center><h1>404 Not Found</h1></center>
<hr><center>nginx</center>
</body>
</html>";

/// Current time in RFC 1123 format
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Sec-WebSocket-Accept` value for a client key
pub fn websocket_accept(key: &str) -> String {
    derive_accept_key(key.trim().as_bytes())
}

/// Success response preceding relayed bytes.
///
/// A WebSocket request switches the downstream side of `ioc` to WebSocket
/// framing and is answered with `101 Switching Protocols`.
pub async fn reply_good<W>(
    stream: &mut W,
    request: &ClientRequest,
    ioc: &mut IoConfig,
    head: &RequestHead,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let response = if request.is_set(RequestOptions::WEBSOCKET) {
        ioc.ws = WsMode::Server;
        let key = head.header("sec-websocket-key").unwrap_or("");
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            websocket_accept(key)
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nDate: {}\r\n\r\n",
            http_date()
        )
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Bare status line followed by `Error: <message>`, as answered to a
/// waiting LocalRP client
pub async fn write_error<W>(stream: &mut W, status: &str, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let response = format!("HTTP/1.1 {}\r\n\r\nError: {}", status, message);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Response head with a Content-Length body
pub fn simple_response(
    status: &str,
    headers: &[(&str, String)],
    body: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    out.push_str(&format!("Date: {}\r\n", http_date()));
    if !keep_alive {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// The default nginx-style 404 page
pub fn not_found(keep_alive: bool) -> Vec<u8> {
    simple_response(
        "404 Not Found",
        &[("Content-Type", "text/html".to_string()), ("Server", "nginx".to_string())],
        NOT_FOUND_PAGE.as_bytes(),
        keep_alive,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_accept() {
        assert_eq!(
            websocket_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), 29);
    }

    #[test]
    fn test_not_found_page() {
        let page = String::from_utf8(not_found(true)).unwrap();
        assert!(page.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(page.contains(&format!("Content-Length: {}", NOT_FOUND_PAGE.len())));
        assert!(page.ends_with("</html>"));
        assert!(!page.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_reply_good_plain() {
        let head = RequestHead::parse(b"GET /x HTTP/1.1\r\n\r\n").unwrap().unwrap();
        let request = ClientRequest::new("", "h:1", RequestOptions::new());
        let mut ioc = IoConfig::new();

        let mut out = Vec::new();
        reply_good(&mut out, &request, &mut ioc, &head).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nDate: "));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(ioc.ws, WsMode::None);
    }

    #[tokio::test]
    async fn test_reply_good_websocket() {
        let head = RequestHead::parse(
            b"GET /x HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let request = ClientRequest::new(
            "",
            "h:1",
            RequestOptions::new().with(RequestOptions::WEBSOCKET),
        );
        let mut ioc = IoConfig::new();

        let mut out = Vec::new();
        reply_good(&mut out, &request, &mut ioc, &head).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert_eq!(ioc.ws, WsMode::Server);
    }
}
