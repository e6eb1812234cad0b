use std::{error::Error as StdError, fmt, io, result::Result as StdResult};

use crate::transport::ServerAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    AlreadyActivated,
    AlreadyStarted,
    NotStarted,
    ConnectorStopped,
    InitialConnectFailed { address: ServerAddress, reason: String },
    Handshake(String),
    Shutdown(String),
    TaskFailed(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActivated => write!(f, "client was already activated"),
            Self::AlreadyStarted => write!(f, "client was already started"),
            Self::NotStarted => write!(f, "client has not been started"),
            Self::ConnectorStopped => write!(f, "transport connector stopped"),
            Self::InitialConnectFailed { address, reason } => {
                writeln!(f, "Could not connect to the language server at {address}.")?;
                writeln!(f)?;
                writeln!(f, "Reason: {reason}")?;
                writeln!(f)?;
                write!(f, "Is the server running in TCP mode on that port?")
            }
            Self::Handshake(msg) => write!(f, "Initialize handshake failed: {msg}"),
            Self::Shutdown(msg) => write!(f, "Shutdown failed: {msg}"),
            Self::TaskFailed(msg) => write!(f, "Client task failed: {msg}"),
        }
    }
}

impl StdError for ClientError {}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    Lsp(async_lsp::Error),
    Client(ClientError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Json(e) => write!(f, "JSON error: {e}"),
            Self::Lsp(e) => write!(f, "LSP error: {e}"),
            Self::Client(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Lsp(e) => Some(e),
            Self::Client(e) => Some(e),
        }
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<async_lsp::Error> for Error {
    fn from(e: async_lsp::Error) -> Self {
        Self::Lsp(e)
    }
}

impl Error {
    /// The lifecycle error carried by this error, if any.
    #[must_use]
    pub const fn as_client(&self) -> Option<&ClientError> {
        match self {
            Self::Client(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = StdResult<T, Error>;
