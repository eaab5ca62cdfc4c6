use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{EndpointErrorKind, RtpError};

/// Multicast TTL used when an endpoint names none.
pub const DEFAULT_TTL: u8 = 16;

/// A parsed `[host]/port[/ttl]` triple.
///
/// `port` is the RTP data port; RTCP uses `port + 1`. An empty host parses
/// to the unspecified address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub ttl: u8,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            ttl: DEFAULT_TTL,
        }
    }

    /// Parse `[host]/port[/ttl]`, using `default_ttl` when none is given.
    /// Host names are resolved here, so a bad name fails before any socket
    /// is opened.
    pub fn parse(input: &str, default_ttl: u8) -> Result<Self, RtpError> {
        let invalid = |kind| RtpError::InvalidEndpoint {
            input: input.to_string(),
            kind,
        };
        let mut parts = input.split('/');
        let host = parts.next().unwrap_or_default();
        let port = parts.next().ok_or_else(|| invalid(EndpointErrorKind::MissingPort))?;
        let port: u16 = port
            .parse()
            .map_err(|_| invalid(EndpointErrorKind::InvalidPort))?;
        let ttl = match parts.next() {
            Some(ttl) => ttl
                .parse()
                .map_err(|_| invalid(EndpointErrorKind::InvalidTtl))?,
            None => default_ttl,
        };
        if parts.next().is_some() {
            return Err(invalid(EndpointErrorKind::InvalidTtl));
        }
        let addr = resolve(host).ok_or_else(|| invalid(EndpointErrorKind::UnresolvedHost))?;
        Ok(Self { addr, port, ttl })
    }

    /// Reject odd data ports, which would put RTCP on an even port.
    pub fn require_even_port(self) -> Result<Self, RtpError> {
        if self.port % 2 != 0 {
            return Err(RtpError::InvalidEndpoint {
                input: self.to_string(),
                kind: EndpointErrorKind::OddPort,
            });
        }
        Ok(self)
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }

    pub fn data_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }

    pub fn control_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port.wrapping_add(1))
    }

    /// Data or control address.
    pub fn addr_for(&self, control: bool) -> SocketAddrV4 {
        if control {
            self.control_addr()
        } else {
            self.data_addr()
        }
    }
}

impl FromStr for Endpoint {
    type Err = RtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, DEFAULT_TTL)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.addr, self.port, self.ttl)
    }
}

fn resolve(host: &str) -> Option<Ipv4Addr> {
    if host.is_empty() {
        return Some(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(addr) = host.parse() {
        return Some(addr);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_ttl() {
        let ep: Endpoint = "224.2.0.1/5004/127".parse().unwrap();
        assert_eq!(ep.addr, Ipv4Addr::new(224, 2, 0, 1));
        assert_eq!(ep.port, 5004);
        assert_eq!(ep.ttl, 127);
        assert!(ep.is_multicast());
        assert_eq!(ep.control_addr().port(), 5005);
    }

    #[test]
    fn defaults() {
        let ep: Endpoint = "10.0.0.1/6000".parse().unwrap();
        assert_eq!(ep.ttl, DEFAULT_TTL);
        assert_eq!(Endpoint::parse("10.0.0.1/6000", 1).unwrap().ttl, 1);

        let any: Endpoint = "/6000".parse().unwrap();
        assert!(any.is_unspecified());
    }

    #[test]
    fn resolves_localhost() {
        let ep: Endpoint = "localhost/5004".parse().unwrap();
        assert!(ep.addr.is_loopback());
    }

    #[test]
    fn malformed_inputs() {
        let kind = |s: &str| match s.parse::<Endpoint>() {
            Err(RtpError::InvalidEndpoint { kind, .. }) => Some(kind),
            _ => None,
        };
        assert_eq!(kind("10.0.0.1"), Some(EndpointErrorKind::MissingPort));
        assert_eq!(kind("10.0.0.1/"), Some(EndpointErrorKind::InvalidPort));
        assert_eq!(kind("10.0.0.1/70000"), Some(EndpointErrorKind::InvalidPort));
        assert_eq!(kind("10.0.0.1/5004/300"), Some(EndpointErrorKind::InvalidTtl));
        assert_eq!(kind("10.0.0.1/5004/1/2"), Some(EndpointErrorKind::InvalidTtl));
        assert_eq!(kind("no.such.host.invalid/5004"), Some(EndpointErrorKind::UnresolvedHost));
    }

    #[test]
    fn odd_port_rejected_when_required() {
        let ep: Endpoint = "10.0.0.1/5005".parse().unwrap();
        assert!(matches!(
            ep.require_even_port(),
            Err(RtpError::InvalidEndpoint {
                kind: EndpointErrorKind::OddPort,
                ..
            })
        ));
        assert!(Endpoint::new(Ipv4Addr::LOCALHOST, 5004).require_even_port().is_ok());
    }
}
