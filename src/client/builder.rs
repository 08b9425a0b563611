//! Builder for configuring and creating MCP clients

use std::sync::Arc;
use std::time::Duration;

use super::{Client, ClientCapabilities, ClientOptions};
use crate::auth::AuthProvider;
use crate::backoff::BackoffStrategy;
use crate::error::Error;
use crate::protocol::{DefaultProtocolHandler, ProtocolHandler, ProtocolVersion};
use crate::transport::{Transport, TransportConfig};

/// Builder for creating and configuring MCP clients
#[derive(Default)]
pub struct ClientBuilder {
    /// Client options
    options: ClientOptions,
    /// Declarative transport choice
    transport_config: Option<TransportConfig>,
    /// Custom transport implementation
    transport: Option<Arc<dyn Transport>>,
    auth: Option<Arc<dyn AuthProvider>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    protocol: Option<Arc<dyn ProtocolHandler>>,
}

impl ClientBuilder {
    /// Create a new client builder with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all options at once
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the client implementation name and version
    pub fn with_implementation(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.options.implementation.name = name.into();
        self.options.implementation.version = version.into();
        self
    }

    /// Set the client capabilities
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.options.capabilities = capabilities;
        self
    }

    /// Enable roots list changed notification capability
    pub fn with_roots_list_changed(mut self, enable: bool) -> Self {
        self.options.capabilities.roots = self.options.capabilities.roots || enable;
        self.options.capabilities.roots_list_changed = enable;
        self
    }

    /// Set the protocol version offered during the handshake
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.options.protocol_version = version;
        self
    }

    /// Set the default timeout for requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Set the timeout for opening the transport
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set how often `run` checks connectivity
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    /// Spawn `command` and talk to it over stdio
    pub fn with_stdio<I, S>(mut self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transport_config = Some(TransportConfig::Stdio {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Default::default(),
            cwd: None,
            shutdown_grace_ms: None,
        });
        self
    }

    /// Set the WebSocket URL to connect to
    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.transport_config = Some(TransportConfig::WebSocket { url: url.into() });
        self
    }

    /// Set the event stream URL of an SSE server
    pub fn with_sse_url(mut self, url: impl Into<String>) -> Self {
        self.transport_config = Some(TransportConfig::Sse {
            url: url.into(),
            endpoint_timeout_ms: None,
        });
        self
    }

    /// Select the transport from configuration
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    /// Set a custom transport implementation. Takes precedence over any
    /// configured URL or command.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Authenticate network transports with `auth`
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Reconnect automatically following `backoff`
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Use a custom protocol handler
    pub fn with_protocol_handler(mut self, protocol: Arc<dyn ProtocolHandler>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<Client, Error> {
        let transport = match (self.transport, self.transport_config) {
            (Some(transport), _) => transport,
            (None, Some(config)) => config.build(self.auth)?,
            (None, None) => {
                return Err(Error::ConfigError(
                    "No transport, command, or URL specified".to_string(),
                ))
            }
        };

        let protocol = self.protocol.unwrap_or_else(|| {
            Arc::new(DefaultProtocolHandler::new(self.options.protocol_version))
        });

        Ok(Client::with_parts(transport, protocol, self.options, self.backoff))
    }
}
