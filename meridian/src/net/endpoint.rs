//! Socket addresses as carried in gossip.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint {input:?}: {reason}")]
    Invalid { input: String, reason: String },
    #[error("endpoint {0:?} resolved to no address")]
    Unresolved(String),
}

/// An IP address and port.
///
/// Ordered IPv4 before IPv6, then by address bytes, then by port. Gossip
/// uses this order to break ties between entries with equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// 0.0.0.0 on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Parses `ip:port` or resolves `host:port`, preferring IPv4 results.
    ///
    /// # Errors
    ///
    /// [`EndpointError::Invalid`] if the input has no port or the lookup
    /// fails, [`EndpointError::Unresolved`] if it yields no address.
    pub fn resolve(input: &str) -> Result<Self, EndpointError> {
        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        let candidates: Vec<SocketAddr> = input
            .to_socket_addrs()
            .map_err(|e| EndpointError::Invalid {
                input: input.to_owned(),
                reason: e.to_string(),
            })?
            .collect();
        candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .map(|addr| Self(*addr))
            .ok_or_else(|| EndpointError::Unresolved(input.to_owned()))
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// True for 0.0.0.0 or `::`, which peers cannot send to.
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.0.ip().is_unspecified()
    }

    /// Same port, different address.
    #[must_use]
    pub const fn with_ip(&self, ip: IpAddr) -> Self {
        Self::new(ip, self.0.port())
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_and_hostname() {
        assert_eq!(
            Endpoint::resolve("10.0.0.1:5000").unwrap(),
            Endpoint::new_v4(10, 0, 0, 1, 5000)
        );
        let local = Endpoint::resolve("localhost:8050").unwrap();
        assert_eq!(local.port(), 8050);
        assert!(local.ip().is_loopback());
    }

    #[test]
    fn test_resolve_rejects_missing_port() {
        assert!(matches!(
            Endpoint::resolve("10.0.0.1"),
            Err(EndpointError::Invalid { .. })
        ));
    }

    #[test]
    fn test_order_v4_before_v6_then_address_then_port() {
        let v4_low = Endpoint::new_v4(10, 0, 0, 1, 9000);
        let v4_high_port = Endpoint::new_v4(10, 0, 0, 1, 9001);
        let v4_high_addr = Endpoint::new_v4(10, 0, 0, 2, 1);
        let v6 = Endpoint::new("::1".parse().unwrap(), 1);

        assert!(v4_low < v4_high_port);
        assert!(v4_high_port < v4_high_addr);
        assert!(v4_high_addr < v6);
    }

    #[test]
    fn test_unspecified_replaced_by_ip() {
        let any = Endpoint::any(9000);
        assert!(any.is_unspecified());
        let fixed = any.with_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
        assert_eq!(fixed, Endpoint::new_v4(192, 168, 1, 7, 9000));
        assert_eq!(format!("{fixed}"), "192.168.1.7:9000");
    }
}
