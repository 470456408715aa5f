//! DNS-over-tunnel answers

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};

/// Resolve `host` to its first IPv4 address, 127.0.0.1 when resolution fails
pub async fn resolve_ipv4(host: &str) -> Ipv4Addr {
    let lookup = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return ip,
        Ok(IpAddr::V6(_)) => None,
        Err(_) => tokio::net::lookup_host((host, 0)).await.ok(),
    };

    let resolved = lookup.and_then(|mut addrs| {
        addrs.find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    });

    match resolved {
        Some(ip) => {
            debug!(host, ip = %ip, "DNS query");
            ip
        }
        None => {
            warn!(host, "DNS resolution failed, answering loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Base64 of the four address bytes, as carried in the answer header
pub fn encode_answer(ip: Ipv4Addr) -> String {
    STANDARD.encode(ip.octets())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_answer() {
        assert_eq!(encode_answer(Ipv4Addr::LOCALHOST), "fwAAAQ==");
        assert_eq!(encode_answer(Ipv4Addr::new(8, 8, 4, 4)), "CAgEBA==");
    }

    #[tokio::test]
    async fn test_resolve_literal_and_localhost() {
        assert_eq!(resolve_ipv4("10.1.2.3").await, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(resolve_ipv4("localhost").await, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_unresolvable_falls_back() {
        assert_eq!(
            resolve_ipv4("does-not-exist.invalid").await,
            Ipv4Addr::LOCALHOST
        );
    }
}
