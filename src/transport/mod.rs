//! TCP transport to the language server.
//!
//! This module provides:
//! - `address`: the configured server endpoint
//! - `connector`: single connect attempts and the fixed-delay reconnect loop
//! - `stream`: the duplex transport handed to the protocol client

mod address;
mod connector;
mod stream;

pub use address::{ServerAddress, DEFAULT_HOST, DEFAULT_PORT};
pub use connector::{
    connect, ConnectOutcome, ConnectionFactory, Connector, InitialConnectPolicy, ReconnectHandle,
    TransportEvent, TransportSource, CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY,
    DEFAULT_RECONNECT_DELAY_MS,
};
pub use stream::{Transport, TransportReader, TransportWriter};
