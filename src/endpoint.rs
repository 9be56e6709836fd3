//! Network endpoint the server binds to.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// Host used when the address leaves the host part empty (`:50051`).
const ANY_HOST: &str = "0.0.0.0";

/// A `host:port` pair, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a combined `host:port` string.
    ///
    /// IPv6 hosts must be bracketed (`[::1]:50051`). Port 0 is accepted and
    /// asks the OS for an ephemeral port.
    pub fn parse(address: &str) -> Result<Self, EndpointError> {
        let address = address.trim();
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(address.to_string()))?;

        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.contains(':') && !address.starts_with('[') {
            return Err(EndpointError::UnbracketedIpv6(address.to_string()));
        }

        let host = if host.is_empty() { ANY_HOST } else { host };

        Ok(Self::new(host, port))
    }

    /// Resolve to the first socket address the host maps to.
    pub fn resolve(&self) -> Result<SocketAddr, EndpointError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| EndpointError::Unresolvable(self.to_string(), e.to_string()))?
            .next()
            .ok_or_else(|| EndpointError::Unresolvable(self.to_string(), "no addresses".into()))
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Address parsing and resolution errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    MissingPort(String),
    InvalidPort(String),
    UnbracketedIpv6(String),
    Unresolvable(String, String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::MissingPort(addr) => {
                write!(f, "address '{}' has no port (expected host:port)", addr)
            }
            EndpointError::InvalidPort(port) => write!(f, "invalid port '{}'", port),
            EndpointError::UnbracketedIpv6(addr) => {
                write!(f, "IPv6 address '{}' must be written as [host]:port", addr)
            }
            EndpointError::Unresolvable(addr, reason) => {
                write!(f, "cannot resolve '{}': {}", addr, reason)
            }
        }
    }
}

impl std::error::Error for EndpointError {}
