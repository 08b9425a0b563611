//! Transport layer implementations for MCP
//!
//! Every transport owns one live raw channel, one background receive loop and
//! a correlation table, and satisfies the same contract: any number of tasks
//! may send concurrently, responses are matched to requests by id whatever
//! order they arrive in, and `close` unblocks every waiting caller.
//!
//! - [`StdioTransport`]: a child process speaking newline-delimited JSON
//! - [`WebSocketTransport`]: one JSON message per websocket text frame
//! - [`SseTransport`]: HTTP POST out, server-sent events in

mod shared;
mod sse;
mod stdio;
mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use self::shared::{
    NotificationCallback, RequestCallback, ResponseSink, NOTIFICATION_BUFFER_CAPACITY,
};
pub use self::sse::SseTransport;
pub use self::stdio::StdioTransport;
pub use self::websocket::WebSocketTransport;

pub(crate) use self::shared::TransportCore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::AuthProvider;
use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};

/// Transport interface for exchanging MCP messages with one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the raw channel and start the receive loop.
    ///
    /// Fails with [`Error::AlreadyConnected`] when already connected.
    async fn connect(&self, timeout: Duration) -> Result<(), Error>;

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Returns [`Error::NotConnected`] immediately when not connected and
    /// [`Error::Timeout`] when the deadline passes.
    async fn send_request(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
    ) -> Result<JSONRPCMessage, Error>;

    /// Send a request whose response will be delivered to `sink`
    async fn send_request_async(
        &self,
        request: JSONRPCRequest,
        sink: ResponseSink,
    ) -> Result<(), Error>;

    /// Send a message that expects no reply (a notification, or a response
    /// to a server-initiated request)
    async fn send_message(&self, message: JSONRPCMessage) -> Result<(), Error>;

    /// Send a notification
    async fn send_notification(&self, notification: JSONRPCNotification) -> Result<(), Error> {
        self.send_message(JSONRPCMessage::Notification(notification))
            .await
    }

    /// Stop the receive loop, release the raw channel and fail every pending request
    async fn close(&self) -> Result<(), Error>;

    /// Whether the raw channel is alive
    fn is_connected(&self) -> bool;

    /// Install the callback receiving server notifications. Notifications
    /// buffered before installation are replayed into it.
    fn set_notification_handler(&self, handler: NotificationCallback);

    /// Install the callback receiving server-initiated requests
    fn set_request_handler(&self, handler: RequestCallback);

    /// Take notifications buffered while no handler was installed
    fn drain_notifications(&self) -> Vec<JSONRPCNotification>;
}

/// Declarative transport selection
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a subprocess
    Stdio {
        /// Program to run
        command: String,
        /// Program arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<PathBuf>,
        /// How long to wait for the process to exit on close, in milliseconds
        #[serde(default)]
        shutdown_grace_ms: Option<u64>,
    },
    /// Connect to a websocket endpoint
    #[serde(alias = "ws")]
    WebSocket {
        /// `ws://` or `wss://` URL
        url: String,
    },
    /// Open an event stream and POST to the announced session endpoint
    Sse {
        /// URL of the event stream
        url: String,
        /// How long to wait for the session endpoint event, in milliseconds
        #[serde(default)]
        endpoint_timeout_ms: Option<u64>,
    },
}

impl TransportConfig {
    /// Build the configured transport
    pub fn build(&self, auth: Option<Arc<dyn AuthProvider>>) -> Result<Arc<dyn Transport>, Error> {
        let transport: Arc<dyn Transport> = match self {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
                shutdown_grace_ms,
            } => {
                let mut transport = StdioTransport::new(command, args.clone());
                if let Some(ms) = shutdown_grace_ms {
                    transport = transport.with_shutdown_grace(Duration::from_millis(*ms));
                }
                for (key, value) in env {
                    transport = transport.with_env(key, value);
                }
                if let Some(cwd) = cwd {
                    transport = transport.with_cwd(cwd);
                }
                Arc::new(transport)
            }
            TransportConfig::WebSocket { url } => {
                let mut transport = WebSocketTransport::new(url)?;
                if let Some(auth) = auth {
                    transport = transport.with_auth(auth);
                }
                Arc::new(transport)
            }
            TransportConfig::Sse {
                url,
                endpoint_timeout_ms,
            } => {
                let mut transport = SseTransport::new(url)?;
                if let Some(ms) = endpoint_timeout_ms {
                    transport = transport.with_endpoint_timeout(Duration::from_millis(*ms));
                }
                if let Some(auth) = auth {
                    transport = transport.with_auth(auth);
                }
                Arc::new(transport)
            }
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_config_deserializes() {
        let stdio: TransportConfig = serde_json::from_value(json!({
            "type": "stdio",
            "command": "npx",
            "args": ["-y", "server-everything"],
            "env": {"DEBUG": "1"},
            "shutdown_grace_ms": 500
        }))
        .unwrap();
        assert!(matches!(
            stdio,
            TransportConfig::Stdio { ref args, shutdown_grace_ms: Some(500), .. } if args.len() == 2
        ));
        assert!(stdio.build(None).is_ok());

        let ws: TransportConfig =
            serde_json::from_value(json!({"type": "ws", "url": "ws://localhost:3000"})).unwrap();
        assert_eq!(ws, TransportConfig::WebSocket { url: "ws://localhost:3000".to_string() });

        let sse: TransportConfig = serde_json::from_value(json!({
            "type": "sse",
            "url": "http://localhost:8080/sse",
            "endpoint_timeout_ms": 250
        }))
        .unwrap();
        assert!(sse.build(None).is_ok());
    }

    #[test]
    fn test_build_rejects_bad_urls() {
        let bad = TransportConfig::WebSocket { url: "http://nope".to_string() };
        assert!(bad.build(None).is_err());
        let bad = TransportConfig::Sse { url: "not a url".to_string(), endpoint_timeout_ms: None };
        assert!(bad.build(None).is_err());
    }
}
