//! TCP connector with a fixed-delay reconnect loop.

use std::{io, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use super::{address::ServerAddress, stream::Transport};
use crate::error::{ClientError, Result};

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Delay between a close (or failed attempt) and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS);

/// Upper bound for a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of a single connect attempt.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(TcpStream),
    ConnectFailed(io::Error),
}

/// Attempt one connection to `address`.
pub async fn connect(address: &ServerAddress) -> ConnectOutcome {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((address.host(), address.port()))).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {address}: {e}");
            }
            ConnectOutcome::Connected(stream)
        }
        Ok(Err(e)) => ConnectOutcome::ConnectFailed(e),
        Err(_) => ConnectOutcome::ConnectFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {CONNECT_TIMEOUT:?}"),
        )),
    }
}

/// What to do when the very first connect attempt fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialConnectPolicy {
    /// Keep retrying at the fixed delay.
    #[default]
    Retry,
    /// Give up and report the failure to the client.
    FailFast,
}

/// Observable reconnect loop activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connecting { attempt: u64 },
    Connected { attempt: u64 },
    ConnectFailed { attempt: u64, reason: String },
    Closed { attempt: u64 },
    ReconnectScheduled { delay: Duration },
}

/// Produces connected transports for a protocol client.
pub trait ConnectionFactory: Send + 'static {
    /// Wait for the next ready transport.
    fn next_transport(&mut self) -> BoxFuture<'_, Result<Transport>>;
}

/// Opens transports to one address and reopens them after every close.
#[derive(Clone)]
pub struct Connector {
    address: ServerAddress,
    reconnect_delay: Duration,
    policy: InitialConnectPolicy,
    events: broadcast::Sender<TransportEvent>,
}

impl Connector {
    #[must_use]
    pub fn new(
        address: ServerAddress,
        reconnect_delay: Duration,
        policy: InitialConnectPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            address,
            reconnect_delay,
            policy,
            events,
        }
    }

    #[must_use]
    pub const fn address(&self) -> &ServerAddress {
        &self.address
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Start the reconnect loop.
    ///
    /// Transports are delivered through the returned [`TransportSource`]. The
    /// loop runs until the [`ReconnectHandle`] is cancelled, the source is
    /// dropped, or the first attempt fails under
    /// [`InitialConnectPolicy::FailFast`].
    #[must_use]
    pub fn spawn(self) -> (TransportSource, ReconnectHandle) {
        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let task = tokio::spawn(self.reconnect_loop(tx, token.clone()));
        (
            TransportSource { rx },
            ReconnectHandle {
                token,
                task: Some(task),
            },
        )
    }

    fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn reconnect_loop(self, tx: mpsc::Sender<Result<Transport>>, shutdown: CancellationToken) {
        let address = &self.address;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            self.emit(TransportEvent::Connecting { attempt });

            let outcome = tokio::select! {
                () = shutdown.cancelled() => break,
                outcome = connect(address) => outcome,
            };

            match outcome {
                ConnectOutcome::Connected(stream) => {
                    tracing::info!(attempt, %address, "connected to language server");
                    self.emit(TransportEvent::Connected { attempt });

                    let (transport, closed) = Transport::new(attempt, stream);
                    if tx.send(Ok(transport)).await.is_err() {
                        tracing::debug!("transport consumer gone, stopping reconnect loop");
                        break;
                    }

                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = closed.cancelled() => {}
                    }
                    tracing::info!(attempt, %address, "connection to language server closed");
                    self.emit(TransportEvent::Closed { attempt });
                }
                ConnectOutcome::ConnectFailed(e) => {
                    tracing::debug!(attempt, %address, "connect failed: {e}");
                    self.emit(TransportEvent::ConnectFailed {
                        attempt,
                        reason: e.to_string(),
                    });

                    if attempt == 1 && self.policy == InitialConnectPolicy::FailFast {
                        tracing::warn!(%address, "initial connect failed: {e}");
                        let failure = ClientError::InitialConnectFailed {
                            address: address.clone(),
                            reason: e.to_string(),
                        };
                        let _ = tx.send(Err(failure.into())).await;
                        break;
                    }
                }
            }

            self.emit(TransportEvent::ReconnectScheduled {
                delay: self.reconnect_delay,
            });
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(self.reconnect_delay) => {}
            }
        }

        tracing::debug!(%address, "reconnect loop stopped");
    }
}

/// Receiving end of the reconnect loop: the connection factory handed to
/// the protocol client.
pub struct TransportSource {
    rx: mpsc::Receiver<Result<Transport>>,
}

impl TransportSource {
    /// Next connected transport. Fails with
    /// [`ClientError::ConnectorStopped`] once the loop has ended.
    pub async fn next(&mut self) -> Result<Transport> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(ClientError::ConnectorStopped.into()),
        }
    }
}

impl ConnectionFactory for TransportSource {
    fn next_transport(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(self.next())
    }
}

/// Cancellation handle for a running reconnect loop. Dropping it cancels
/// the loop without waiting.
pub struct ReconnectHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReconnectHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel pending timers and in-flight connects, then wait for the loop
    /// to exit. No connect attempt is made after this returns.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("reconnect loop ended abnormally: {e}");
            }
        }
    }
}

impl Drop for ReconnectHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
