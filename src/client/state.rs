use std::{fmt, sync::Arc};

use tokio::sync::watch;

/// Externally observable lifecycle of the protocol client.
///
/// Reconnects happen inside `Running` and never move the client back to
/// `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ClientState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Starting)
                | (Self::Starting, Self::Running | Self::Stopping)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared state holder that only accepts valid transitions.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<watch::Sender<ClientState>>);

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClientState::Uninitialized);
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> ClientState {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.0.subscribe()
    }

    /// Move to `next` if allowed from the current state. Returns whether the
    /// state changed; rejected transitions leave watchers untouched.
    pub fn advance(&self, next: ClientState) -> bool {
        self.0.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("client state {current} -> {next}");
                *current = next;
                true
            } else {
                false
            }
        })
    }
}
