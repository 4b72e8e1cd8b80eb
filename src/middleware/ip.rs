//! Client IP extraction.
//!
//! The caller's IP is the default rate-limit key and the key used for
//! brute-force tracking on internal secrets.
//!
//! # Resolution order
//!
//! 1. `X-Forwarded-For` (first hop of the comma-separated list)
//! 2. `X-Real-IP`
//! 3. The socket peer address (`ConnectInfo<SocketAddr>`), when the server
//!    was started with connect info
//! 4. [`UNKNOWN_IP`]
//!
//! # IP spoofing
//!
//! Forwarding headers are client-controlled unless a reverse proxy
//! overwrites them. Deploy behind a proxy that sets these headers and block
//! direct access; otherwise callers can rotate spoofed addresses to dodge
//! per-IP limits. When [`TrustedProxyConfig`] is enabled, header-derived IPs
//! are only honoured if the socket peer is inside a trusted range.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
///
/// All requests without identifiable IPs share this key.
pub const UNKNOWN_IP: &str = "unknown";

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (full-length prefix).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Networks whose forwarding headers are trusted.
///
/// Empty means trust everyone (development mode).
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings; invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` may supply forwarding headers.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("x-forwarded-for")
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Some(first);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the caller's IP from headers and the socket peer.
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let peer_trusted = match peer {
        Some(addr) => trusted_proxies.is_trusted(&addr.ip()),
        None => true,
    };

    if let Some(ip) = forwarded_ip(headers) {
        if peer_trusted {
            return Cow::Owned(ip.to_string());
        }
        warn!(
            forwarded = %ip,
            peer = ?peer,
            "Ignoring forwarding header from untrusted peer"
        );
    }

    match peer {
        Some(addr) => Cow::Owned(addr.ip().to_string()),
        None => {
            if trusted_proxies.is_enabled() {
                debug!("No proxy headers or peer address - request may be bypassing reverse proxy");
            }
            Cow::Borrowed(UNKNOWN_IP)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len(), 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len(), 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len(), 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_xff_first_hop() {
        let h = headers(&[("x-forwarded-for", "203.0.113.50, 10.0.0.1")]);
        let ip = extract_client_ip(&h, None, &TrustedProxyConfig::default());
        assert_eq!(ip, "203.0.113.50");
    }

    #[test]
    fn test_real_ip_fallback() {
        let h = headers(&[("x-real-ip", "192.168.1.1")]);
        let ip = extract_client_ip(&h, None, &TrustedProxyConfig::default());
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_peer_fallback_and_unknown() {
        let peer: SocketAddr = "198.51.100.7:5555".parse().unwrap();
        let none = TrustedProxyConfig::default();
        assert_eq!(extract_client_ip(&HeaderMap::new(), Some(peer), &none), "198.51.100.7");
        assert_eq!(extract_client_ip(&HeaderMap::new(), None, &none), UNKNOWN_IP);
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);

        let from_proxy: SocketAddr = "10.1.2.3:80".parse().unwrap();
        assert_eq!(extract_client_ip(&h, Some(from_proxy), &trusted), "1.2.3.4");

        let direct: SocketAddr = "8.8.8.8:80".parse().unwrap();
        assert_eq!(extract_client_ip(&h, Some(direct), &trusted), "8.8.8.8");
    }

    #[test]
    fn test_invalid_cidrs_skipped() {
        let config = TrustedProxyConfig::new(&["bogus".to_string()]);
        assert!(!config.is_enabled());
    }
}
