//! TCP bootstrap for the RPM spec language server client.
//!
//! Architecture:
//! ```text
//! Extension ──activate/deactivate──► ProtocolClient ◄──transports── Connector
//!                                         │                            │
//!                                   async-lsp session ◄──── TCP ──── reconnect loop
//! ```

pub mod client;
pub mod error;
pub mod extension;
pub mod transport;

pub use client::{ClientConfig, ClientState, ProtocolClient};
pub use error::{ClientError, Error, Result};
pub use extension::Extension;
pub use transport::{ConnectOutcome, Connector, ServerAddress, Transport, TransportEvent};
