use axum::http::HeaderMap;
use std::net::IpAddr;
use std::str::FromStr;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Reverse proxies whose `x-forwarded-for` header is believed.
///
/// A request's client address is its TCP peer unless that peer is a trusted
/// proxy, in which case the rightmost forwarded address that is not itself a
/// trusted proxy is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies {
    proxies: Vec<IpAddr>,
}

impl TrustedProxies {
    pub fn new(proxies: Vec<IpAddr>) -> Self {
        Self { proxies }
    }

    /// Trust nothing: the peer address is always the client.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.proxies.contains(ip)
    }

    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
        let peer = peer?;
        if !self.is_trusted(&peer) {
            return Some(peer);
        }

        let forwarded: Vec<IpAddr> = headers
            .get_all(FORWARDED_FOR_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|s| s.trim().parse::<IpAddr>().ok())
            .collect();

        forwarded
            .iter()
            .rev()
            .find(|ip| !self.is_trusted(ip))
            .or_else(|| forwarded.first())
            .copied()
            .or(Some(peer))
    }
}

impl FromStr for TrustedProxies {
    type Err = String;

    /// Comma-separated IP addresses. Empty input trusts nothing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let proxies = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<IpAddr>()
                    .map_err(|e| format!("Invalid proxy address '{}': {}", p, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { proxies })
    }
}
