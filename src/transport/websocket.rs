//! WebSocket transport implementation for MCP
//!
//! One JSON-RPC message per text frame. Writers queue frames for a single
//! writer task that owns the split sink; a single task drains the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::shared::{TransportCore, TRANSIENT_ERROR_BACKOFF};
use super::{NotificationCallback, RequestCallback, ResponseSink, Transport};
use crate::auth::AuthProvider;
use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames queued for the writer task
const OUTGOING_CAPACITY: usize = 100;

/// How long `close` waits for the close frame to go out
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket transport for MCP
pub struct WebSocketTransport {
    /// WebSocket URL
    url: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    inner: Arc<WsInner>,
}

struct WsInner {
    core: TransportCore,
    conn: RwLock<Option<WsConnection>>,
    generation: AtomicU64,
}

struct WsConnection {
    generation: u64,
    outgoing: mpsc::Sender<OutgoingFrame>,
    cancel: CancellationToken,
}

struct OutgoingFrame {
    message: WsMessage,
    sent: oneshot::Sender<Result<(), Error>>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport. The URL must use `ws` or `wss`.
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::UrlError(format!(
                "WebSocket URL must use ws:// or wss://, got {}",
                url
            )));
        }

        Ok(Self {
            url,
            auth: None,
            inner: Arc::new(WsInner {
                core: TransportCore::new("websocket"),
                conn: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Attach authentication headers to the upgrade request
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// The endpoint URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn write_message(&self, message: &JSONRPCMessage) -> Result<(), Error> {
        let json = serde_json::to_string(message)?;
        let outgoing = self
            .inner
            .conn
            .read()
            .await
            .as_ref()
            .map(|c| c.outgoing.clone())
            .ok_or(Error::NotConnected)?;
        send_frame(&outgoing, WsMessage::Text(json.into())).await
    }
}

/// Queue a frame and wait until the writer has sent it
async fn send_frame(
    outgoing: &mpsc::Sender<OutgoingFrame>,
    message: WsMessage,
) -> Result<(), Error> {
    let (sent, result) = oneshot::channel();
    outgoing
        .send(OutgoingFrame { message, sent })
        .await
        .map_err(|_| Error::ConnectionClosed("websocket writer stopped".to_string()))?;
    result.await.map_err(|_| {
        Error::ConnectionClosed("connection closed before the message was sent".to_string())
    })?
}

impl WsInner {
    /// With `Some(generation)` only that connection is torn down.
    async fn teardown(&self, reason: &str, generation: Option<u64>, send_close: bool) {
        let conn = {
            let mut guard = self.conn.write().await;
            if let Some(generation) = generation {
                if guard.as_ref().map(|c| c.generation) != Some(generation) {
                    return;
                }
            }
            guard.take()
        };
        self.core.mark_disconnected();
        self.core.fail_pending(reason);

        let Some(conn) = conn else {
            return;
        };
        if send_close {
            let close = send_frame(&conn.outgoing, WsMessage::Close(None));
            match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Failed to send close frame: {}", e),
                Err(_) => debug!("Close frame not sent within {:?}", CLOSE_FRAME_TIMEOUT),
            }
        }
        conn.cancel.cancel();
    }
}

/// Sole owner of the sink, so frames are never interleaved and a caller
/// giving up never leaves half a frame on the wire
async fn write_frames(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outgoing: mpsc::Receiver<OutgoingFrame>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some(OutgoingFrame { message, sent }) = next else {
            break;
        };

        let closing = matches!(message, WsMessage::Close(_));
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = sink.send(message) => result
                .map_err(|e| Error::TransportError(format!("WebSocket send failed: {}", e))),
        };
        let _ = sent.send(result);
        if closing {
            let _ = sink.close().await;
            break;
        }
    }
}

/// Errors after which the stream is still usable
fn is_transient(err: &WsError) -> bool {
    matches!(err, WsError::Capacity(_) | WsError::WriteBufferFull(_))
}

async fn receive_loop(
    inner: Arc<WsInner>,
    mut stream: SplitStream<WsStream>,
    generation: u64,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => inner.core.route_text(text.as_str()),
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("Received binary WebSocket message, ignoring");
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                // Handled automatically by tungstenite
            }
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(frame))) => {
                debug!("WebSocket connection closed by server: {:?}", frame);
                break "server closed the websocket".to_string();
            }
            Some(Err(e)) if is_transient(&e) => {
                warn!("Transient WebSocket receive error: {}", e);
                tokio::time::sleep(TRANSIENT_ERROR_BACKOFF).await;
            }
            Some(Err(e)) => {
                error!("WebSocket receive error: {}", e);
                break format!("websocket error: {}", e);
            }
            None => break "websocket stream ended".to_string(),
        }
    };

    inner.teardown(&reason, Some(generation), false).await;
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, timeout: Duration) -> Result<(), Error> {
        let mut guard = self.inner.conn.write().await;
        if guard.is_some() || self.inner.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let mut request = self.url.as_str().into_client_request()?;
        if let Some(auth) = &self.auth {
            for (name, value) in auth.auth_headers() {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::ConfigError(format!("Invalid header name {}: {}", name, e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| Error::ConfigError(format!("Invalid header value: {}", e)))?;
                request.headers_mut().insert(name, value);
            }
        }

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                Error::Timeout(format!("WebSocket connect to {} took longer than {:?}", self.url, timeout))
            })?
            .map_err(|e| Error::TransportError(format!("WebSocket connection failed: {}", e)))?;

        info!("WebSocket connected to {}", self.url);

        let (sink, stream) = ws_stream.split();
        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        self.inner.core.mark_connected();
        tokio::spawn(write_frames(sink, outgoing_rx, cancel.clone()));
        tokio::spawn(receive_loop(
            self.inner.clone(),
            stream,
            generation,
            cancel.clone(),
        ));

        *guard = Some(WsConnection {
            generation,
            outgoing,
            cancel,
        });
        Ok(())
    }

    async fn send_request(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
    ) -> Result<JSONRPCMessage, Error> {
        self.inner
            .core
            .round_trip(request, timeout, |message| async move {
                self.write_message(&message).await
            })
            .await
    }

    async fn send_request_async(
        &self,
        request: JSONRPCRequest,
        sink: ResponseSink,
    ) -> Result<(), Error> {
        self.inner
            .core
            .register_then_write(request, sink, |message| async move {
                self.write_message(&message).await
            })
            .await
    }

    async fn send_message(&self, message: JSONRPCMessage) -> Result<(), Error> {
        self.inner.core.ensure_connected()?;
        self.write_message(&message).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.teardown("transport closed", None, true).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn set_notification_handler(&self, handler: NotificationCallback) {
        self.inner.core.set_notification_handler(handler);
    }

    fn set_request_handler(&self, handler: RequestCallback) {
        self.inner.core.set_request_handler(handler);
    }

    fn drain_notifications(&self) -> Vec<JSONRPCNotification> {
        self.inner.core.drain_notifications()
    }
}
