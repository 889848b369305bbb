//! Service directory: backend service name to network address.
//!
//! Services are registered at bootstrap (from configuration) and looked up
//! when a room is created. A later registration under the same name
//! replaces the earlier address.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;

/// Host and port of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    /// Hostname or IP literal (IPv6 literals keep their brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl BackendAddress {
    /// Creates a new address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<std::net::SocketAddr> for BackendAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => Self::new(v4.ip().to_string(), v4.port()),
            std::net::SocketAddr::V6(v6) => Self::new(format!("[{}]", v6.ip()), v6.port()),
        }
    }
}

/// Errors from parsing a `host:port` string.
#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    /// No `:` separating host and port.
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    /// The host part is empty.
    #[error("missing host in address {0:?}")]
    MissingHost(String),
    /// The port is not a number in `1..=65535`.
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
}

impl FromStr for BackendAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError::MissingHost(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| AddressParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Thread-safe directory of backend services.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: RwLock<HashMap<String, BackendAddress>>,
}

impl ServiceDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` at `address`, returning the address it replaced.
    pub fn register(&self, name: &str, address: BackendAddress) -> Option<BackendAddress> {
        tracing::info!(service = %name, addr = %address, "registered backend service");
        self.services.write().insert(name.to_string(), address)
    }

    /// Returns the address registered for `name`, if any.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<BackendAddress> {
        self.services.read().get(name).cloned()
    }

    /// Returns every registered service, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<(String, BackendAddress)> {
        let mut services: Vec<_> = self
            .services
            .read()
            .iter()
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        services
    }
}
