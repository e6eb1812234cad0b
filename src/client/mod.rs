//! Protocol client and its configuration.
//!
//! This module provides:
//! - `config`: client configuration and document selectors
//! - `state`: the externally observable lifecycle state machine
//! - `protocol`: the client instance driving `async-lsp` sessions

mod config;
mod protocol;
mod state;

pub use config::{
    ClientConfig, DocumentFilter, DocumentSelector, DEFAULT_OUTPUT_CHANNEL, RPMSPEC_LANGUAGE_ID,
};
pub use protocol::ProtocolClient;
pub use state::ClientState;
