//! Host-facing entry points.
//!
//! An [`Extension`] is owned by whatever context the host provides and ties
//! the protocol client and its reconnect loop to that context's lifetime.

use tokio::sync::broadcast;

use crate::{
    client::{ClientConfig, ClientState, ProtocolClient},
    error::{ClientError, Result},
    transport::{Connector, ReconnectHandle, TransportEvent},
};

pub struct Extension {
    config: ClientConfig,
    connector: Connector,
    client: Option<ProtocolClient>,
    reconnect: Option<ReconnectHandle>,
}

impl Extension {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let connector = Connector::new(
            config.address(),
            config.reconnect_delay(),
            config.initial_connect,
        );
        Self {
            config,
            connector,
            client: None,
            reconnect: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn client(&self) -> Option<&ProtocolClient> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.client
            .as_ref()
            .map_or(ClientState::Uninitialized, ProtocolClient::state)
    }

    /// Observe connect attempts. Subscribe before [`Extension::activate`] to
    /// see the first one.
    #[must_use]
    pub fn subscribe_transport(&self) -> broadcast::Receiver<TransportEvent> {
        self.connector.subscribe()
    }

    /// Construct the client, start the reconnect loop and start the client.
    ///
    /// Returns once the client is starting. A second call fails with
    /// [`ClientError::AlreadyActivated`], also after deactivation.
    pub fn activate(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Err(ClientError::AlreadyActivated.into());
        }

        let mut client = ProtocolClient::new(&self.config);
        let (source, reconnect) = self.connector.clone().spawn();
        client.start(source)?;

        tracing::info!(
            name = client.name(),
            address = %self.connector.address(),
            "activated"
        );
        self.reconnect = Some(reconnect);
        self.client = Some(client);
        Ok(())
    }

    /// Cancel reconnects and stop the client.
    ///
    /// Resolves immediately when nothing was activated. Shutdown failures are
    /// returned to the host.
    pub async fn deactivate(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };

        if let Some(reconnect) = self.reconnect.take() {
            reconnect.cancel().await;
        }
        let result = client.stop().await;
        tracing::info!(name = client.name(), "deactivated");
        result
    }
}
