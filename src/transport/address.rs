use std::fmt;

use serde::{Deserialize, Serialize};

/// Port the RPM spec language server listens on in TCP mode.
pub const DEFAULT_PORT: u16 = 2087;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Listening endpoint of the language server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address on the given port.
    #[must_use]
    pub fn loopback(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::loopback(DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
