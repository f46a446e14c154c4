use std::sync::Arc;

use crate::channel::Channel;
use crate::config::FileConfig;
use crate::error::TransportError;
use crate::identifier::ChannelIdentifier;
use crate::metrics::MetricsSnapshot;
use crate::mux::{ConnectionState, Multiplexer, MuxOptions};
use crate::registry::ChannelRegistry;
use crate::transport::{Transport, WsTransport};

/// A started multiplexer together with its registry.
#[derive(Clone)]
pub struct LiveClient {
    mux: Multiplexer,
    registry: ChannelRegistry,
}

impl LiveClient {
    pub fn start(transport: Arc<dyn Transport>, options: MuxOptions) -> Result<Self, TransportError> {
        let mux = Multiplexer::start(transport, options)?;
        let registry = ChannelRegistry::new(mux.clone());
        Ok(Self { mux, registry })
    }

    /// Connect over WebSocket using the `[transport]` and `[channels]` sections.
    pub fn from_config(config: &FileConfig) -> Result<Self, TransportError> {
        let transport = WsTransport::from_file(&config.transport)?;
        Self::start(Arc::new(transport), MuxOptions::from_file(&config.channels))
    }

    pub fn channel(&self, id: &ChannelIdentifier) -> Channel {
        self.registry.get_channel(id)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.mux.connection_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.mux.metrics()
    }

    pub fn shutdown(&self) {
        self.mux.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelState;
    use crate::transport::memory;

    #[tokio::test]
    async fn from_config_without_url_fails() {
        let err = LiveClient::from_config(&FileConfig::default()).err().unwrap();
        assert!(matches!(err, TransportError::WebSocket(_)));
    }

    #[tokio::test]
    async fn channel_goes_through_registry() {
        let (transport, _server) = memory::pair();
        let client = LiveClient::start(Arc::new(transport), MuxOptions::default()).unwrap();
        let id = ChannelIdentifier::new("grafana", "dashboard", "1");
        let a = client.channel(&id);
        let b = client.registry().get_channel(&id);
        assert!(a.ptr_eq(&b));

        client.shutdown();
        assert_eq!(a.state(), ChannelState::Shutdown);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
