//! The client entry point.

use std::sync::Arc;

use tracing::info;

use crate::channel::{Channel, ChannelRegistry};
use crate::common::error::ClientError;
use crate::config::ClientOptions;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectivityProbe, HttpProbe};
use crate::transport::websocket::WebSocketFactory;
use crate::transport::TransportFactory;

/// A realtime client: one connection and the channels multiplexed over it.
///
/// Dropping the client disposes the connection.
pub struct Realtime {
    manager: ConnectionManager,
}

impl Realtime {
    /// Builds a client on the WebSocket transport and the HTTP connectivity
    /// probe. Connects straight away when `auto_connect` is set. Must be
    /// called inside a tokio runtime.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let probe = HttpProbe::new(options.connectivity_check_url.clone())?;
        Self::with_parts(options, Arc::new(WebSocketFactory::default()), Arc::new(probe))
    }

    /// Builds a client on a caller-supplied transport and probe.
    pub fn with_parts(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, ClientError> {
        let auto_connect = options.auto_connect;
        let manager = ConnectionManager::spawn(options, factory, probe);
        if auto_connect {
            info!("Auto-connecting");
            manager.handle().connect()?;
        }
        Ok(Self { manager })
    }

    pub fn connection(&self) -> &ConnectionHandle {
        self.manager.handle()
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        self.manager.channels()
    }

    /// Shorthand for `channels().get(name)`.
    pub fn channel(&self, name: &str) -> Channel {
        self.manager.channels().get(name)
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.connection().connect()
    }

    pub fn close(&self) -> Result<(), ClientError> {
        self.connection().close()
    }

    /// Disposes the connection and waits for its worker to stop.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}
