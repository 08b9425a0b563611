//! MCP client implementation
//!
//! A [`Client`] owns one [`Transport`] and one [`ProtocolHandler`]. It drives
//! the connection lifecycle (`Disconnected → Connecting → Connected`),
//! performs the `initialize` handshake, exposes the correlated request API,
//! fans notifications out to registered handlers and, when given a
//! [`BackoffStrategy`], reconnects after the transport drops.

mod builder;
mod features;
mod handler;
mod reconnect;
mod state;


pub use builder::ClientBuilder;
pub use handler::{
    ConnectionStatusHandler, LogHandler, NotificationHandler, ProgressHandler,
    ResourceUpdateHandler,
};
pub use state::{ConnectionState, ServerIdentity};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffStrategy;
use crate::error::Error;
use crate::protocol::json_rpc::error_codes;
use crate::protocol::notifications::methods;
use crate::protocol::{
    DefaultProtocolHandler, Implementation, JSONRPCError, JSONRPCMessage, JSONRPCNotification,
    JSONRPCRequest, JSONRPCResponse, LogMessage, ProgressNotification, ProtocolHandler, ProtocolVersion,
    RequestId, ServerCapabilities,
};
use crate::transport::Transport;

use self::handler::NotificationRegistry;

/// Client capability flags
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    /// Whether the client supports listing roots
    pub roots: bool,
    /// Whether the client supports notifications for changes to the roots list
    pub roots_list_changed: bool,
    /// Whether the client supports sampling from an LLM
    pub sampling: bool,
    /// Experimental capabilities
    pub experimental: Vec<String>,
}

impl ClientCapabilities {
    /// The `capabilities` object sent in `initialize`
    pub fn to_value(&self) -> Value {
        let mut caps = Map::new();
        if self.roots || self.roots_list_changed {
            caps.insert(
                "roots".to_string(),
                json!({ "listChanged": self.roots_list_changed }),
            );
        }
        if self.sampling {
            caps.insert("sampling".to_string(), json!({}));
        }
        if !self.experimental.is_empty() {
            let experimental: Map<String, Value> = self
                .experimental
                .iter()
                .map(|name| (name.clone(), json!({})))
                .collect();
            caps.insert("experimental".to_string(), Value::Object(experimental));
        }
        Value::Object(caps)
    }
}

/// MCP client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client implementation info
    pub implementation: Implementation,
    /// Client capabilities
    pub capabilities: ClientCapabilities,
    /// Version offered during the handshake
    pub protocol_version: ProtocolVersion,
    /// Default deadline for requests
    pub request_timeout: Duration,
    /// Deadline for opening the transport
    pub connect_timeout: Duration,
    /// How often [`Client::run`] checks connectivity
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            implementation: Implementation::new("mcplink", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            protocol_version: ProtocolVersion::latest(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// MCP client session
pub struct Client {
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn ProtocolHandler>,
    options: ClientOptions,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    state: RwLock<ConnectionState>,
    /// Serializes `connect` and `close`
    lifecycle: Mutex<()>,
    identity: StdRwLock<Option<ServerIdentity>>,
    registry: Arc<NotificationRegistry>,
    next_id: AtomicI64,
    shutdown: StdRwLock<CancellationToken>,
}

impl Client {
    /// Create a client with the default protocol handler and no reconnection
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let protocol = Arc::new(DefaultProtocolHandler::new(options.protocol_version));
        Self::with_parts(transport, protocol, options, None)
    }

    pub(crate) fn with_parts(
        transport: Arc<dyn Transport>,
        protocol: Arc<dyn ProtocolHandler>,
        options: ClientOptions,
        backoff: Option<Arc<dyn BackoffStrategy>>,
    ) -> Self {
        let registry = Arc::new(NotificationRegistry::default());

        let notifications = registry.clone();
        transport.set_notification_handler(Arc::new(move |notification: JSONRPCNotification| {
            notifications.dispatch(notification)
        }));

        let responder = Arc::downgrade(&transport);
        transport.set_request_handler(Arc::new(move |request: JSONRPCRequest| {
            let Some(transport) = responder.upgrade() else {
                return;
            };
            let reply = answer_server_request(&request);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = transport.send_message(reply).await {
                            warn!("Failed to answer server request {}: {}", request.method, e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to answer server request {}", request.method),
            }
        }));

        Self {
            transport,
            protocol,
            options,
            backoff,
            state: RwLock::new(ConnectionState::Disconnected),
            lifecycle: Mutex::new(()),
            identity: StdRwLock::new(None),
            registry,
            next_id: AtomicI64::new(1),
            shutdown: StdRwLock::new(CancellationToken::new()),
        }
    }

    /// Start building a client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The client options
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Connect to the server and perform the handshake.
    ///
    /// Fails with [`Error::AlreadyConnected`] when already connected. Any
    /// failure leaves the client disconnected with the transport closed.
    pub async fn connect(&self) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;

        let dropped = {
            let mut state = self.state.write().await;
            let dropped = match *state {
                ConnectionState::Connected if self.transport.is_connected() => {
                    return Err(Error::AlreadyConnected);
                }
                ConnectionState::Connected => {
                    debug!("Transport dropped since the last check, reconnecting");
                    true
                }
                _ => false,
            };
            *state = ConnectionState::Connecting;
            dropped
        };
        if dropped {
            self.registry.notify_connection_status(false);
        }

        match self.handshake().await {
            Ok(identity) => {
                info!(
                    "Connected to {} {} (protocol {})",
                    identity.server_info.name, identity.server_info.version, identity.protocol_version
                );
                *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
                *self.state.write().await = ConnectionState::Connected;
                self.registry.notify_connection_status(true);
                Ok(())
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                *self.state.write().await = ConnectionState::Disconnected;
                if let Err(close_err) = self.transport.close().await {
                    debug!("Error closing transport after failed connect: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<ServerIdentity, Error> {
        if self.transport.is_connected() {
            // A live channel left over from a torn-down session.
            self.transport.close().await?;
        }
        self.transport.connect(self.options.connect_timeout).await?;

        let params = json!({
            "protocolVersion": self.protocol.preferred_version(),
            "clientInfo": self.options.implementation,
            "capabilities": self.options.capabilities.to_value(),
        });
        let request = self
            .protocol
            .format_request(self.next_request_id(), "initialize", Some(params))?;
        let response = self
            .transport
            .send_request(request, self.options.request_timeout)
            .await?;
        let identity = ServerIdentity::from(self.protocol.parse_initialize(response)?);

        let initialized = self.protocol.format_notification(methods::INITIALIZED, None)?;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send_notification(initialized).await {
                warn!("Failed to send initialized notification: {}", e);
            }
        });

        Ok(identity)
    }

    /// Close the connection. Calling this when already closed is a no-op.
    ///
    /// Also stops a running [`Client::run`].
    pub async fn close(&self) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = *self.state.read().await;
        if previous.is_disconnected() && !self.transport.is_connected() {
            self.shutdown_token().cancel();
            return Ok(());
        }

        let result = self.transport.close().await;
        *self.state.write().await = ConnectionState::Disconnected;
        self.shutdown_token().cancel();
        if !previous.is_disconnected() {
            info!("Disconnected from server");
            self.registry.notify_connection_status(false);
        }
        result
    }

    /// Whether the client is connected. The transport is authoritative: if it
    /// has gone away the client demotes itself to `Disconnected` here.
    pub async fn is_connected(&self) -> bool {
        if *self.state.read().await != ConnectionState::Connected {
            return false;
        }
        if self.transport.is_connected() {
            return true;
        }

        let mut state = self.state.write().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnected;
            drop(state);
            warn!("Transport is no longer connected");
            self.registry.notify_connection_status(false);
        }
        false
    }

    /// The recorded lifecycle state, without revalidating against the transport
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Allocate a fresh request id
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request with the default timeout and return its result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for its result
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let request = self
            .protocol
            .format_request(self.next_request_id(), method, params)?;
        let response = self.transport.send_request(request, timeout).await?;
        self.protocol.parse_response(response)
    }

    /// Send a request without waiting. The response, or the error that ended
    /// the connection, is delivered on the returned receiver.
    pub async fn request_async(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(RequestId, oneshot::Receiver<Result<JSONRPCMessage, Error>>), Error> {
        let id = self.next_request_id();
        let request = self.protocol.format_request(id.clone(), method, params)?;
        let (tx, rx) = oneshot::channel();
        self.transport.send_request_async(request, tx).await?;
        Ok((id, rx))
    }

    /// Send a caller-built request as is. Reusing an id that is still in
    /// flight fails with [`Error::DuplicateRequestId`].
    pub async fn send_raw_request(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
    ) -> Result<JSONRPCMessage, Error> {
        self.transport.send_request(request, timeout).await
    }

    /// Send a notification to the server
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let notification = self.protocol.format_notification(method, params)?;
        self.transport.send_notification(notification).await
    }

    /// Everything learned in the last handshake
    pub fn identity(&self) -> Option<ServerIdentity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Server implementation info
    pub fn server_info(&self) -> Option<Implementation> {
        self.identity().map(|i| i.server_info)
    }

    /// Server capabilities
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.identity().map(|i| i.capabilities)
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.identity().map(|i| i.protocol_version)
    }

    /// Server instructions
    pub fn instructions(&self) -> Option<String> {
        self.identity().and_then(|i| i.instructions)
    }

    /// Register a handler for every notification with `method`
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.registry.on_notification(method, Arc::new(handler));
    }

    /// Register a handler for every progress notification
    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&ProgressNotification) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.registry.on_progress(Arc::new(handler));
    }

    /// Register a handler for server log messages
    pub fn on_log<F>(&self, handler: F)
    where
        F: Fn(&LogMessage) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.registry.on_log(Arc::new(handler));
    }

    /// Register a handler for updates to the resource at `uri`
    pub fn on_resource_updated<F>(&self, uri: impl Into<String>, handler: F)
    where
        F: Fn(&str) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.registry.on_resource_updated(uri, Arc::new(handler));
    }

    /// Register a handler told about every connect and disconnect
    pub fn on_connection_status<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.registry.on_connection_status(Arc::new(handler));
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The shutdown token for a new `run`, replacing one a previous `close` cancelled
    fn fresh_shutdown_token(&self) -> CancellationToken {
        let mut shutdown = self.shutdown.write().unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
        }
        shutdown.clone()
    }
}

/// The reply to a request the server sent us
fn answer_server_request(request: &JSONRPCRequest) -> JSONRPCMessage {
    match request.method.as_str() {
        "ping" => JSONRPCMessage::Response(JSONRPCResponse::new(request.id.clone(), json!({}))),
        other => {
            debug!("Rejecting unsupported server request {}", other);
            JSONRPCMessage::Error(JSONRPCError::new(
                request.id.clone(),
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
                None,
            ))
        }
    }
}
