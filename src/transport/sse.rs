//! Server-sent events transport
//!
//! Incoming messages arrive on a long-lived `GET` event stream. The first
//! `endpoint` event names the URL (usually carrying a `sessionId` query) that
//! every outgoing message is `POST`ed to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::shared::TransportCore;
use super::{NotificationCallback, RequestCallback, ResponseSink, Transport};
use crate::auth::AuthProvider;
use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};

const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(30);

/// SSE transport for MCP
pub struct SseTransport {
    url: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    endpoint_timeout: Duration,
    post_timeout: Duration,
    http: reqwest::Client,
    inner: Arc<SseInner>,
}

struct SseInner {
    core: TransportCore,
    session: RwLock<Option<SseSession>>,
    generation: AtomicU64,
}

struct SseSession {
    generation: u64,
    endpoint: Url,
    cancel: CancellationToken,
}

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    /// Feed a chunk and return every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block = self.buffer.split_to(pos);
            self.buffer.advance(2);
            if let Some(event) = parse_event(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

impl SseTransport {
    /// Create a transport for the event stream at `url`
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::UrlError(format!(
                "SSE URL must use http:// or https://, got {}",
                url
            )));
        }

        Ok(Self {
            url,
            auth: None,
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            post_timeout: DEFAULT_POST_TIMEOUT,
            http: reqwest::Client::new(),
            inner: Arc::new(SseInner {
                core: TransportCore::new("sse"),
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Attach authentication headers to every HTTP request
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// How long `connect` waits for the server to announce its message endpoint
    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    /// Upper bound on each `POST`. Requests are also bounded by their own
    /// deadline; this covers notifications and replies.
    pub fn with_post_timeout(mut self, timeout: Duration) -> Self {
        self.post_timeout = timeout;
        self
    }

    /// The URL messages are currently posted to
    pub async fn endpoint(&self) -> Option<Url> {
        self.inner.session.read().await.as_ref().map(|s| s.endpoint.clone())
    }

    /// The `sessionId` the server assigned, if its endpoint carries one
    pub async fn session_id(&self) -> Option<String> {
        let endpoint = self.endpoint().await?;
        let id = endpoint
            .query_pairs()
            .find(|(key, _)| key == "sessionId")
            .map(|(_, value)| value.into_owned());
        id
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(auth) = &self.auth {
            for (name, value) in auth.auth_headers() {
                request = request.header(name, value);
            }
        }
        request
    }

    async fn write_message(&self, message: &JSONRPCMessage) -> Result<(), Error> {
        let endpoint = self
            .inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.endpoint.clone())
            .ok_or(Error::NotConnected)?;

        let request = self
            .http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.post_timeout)
            .json(message);
        let response = self.apply_auth(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TransportError(format!(
                "POST {} failed with status {}: {}",
                endpoint, status, body
            )));
        }

        // Some servers answer inline instead of on the event stream.
        let body = response.text().await?;
        if !body.trim().is_empty() {
            match serde_json::from_str::<Value>(&body) {
                Ok(value) if value.is_object() => self.inner.core.route_value(value),
                _ => debug!("Ignoring non JSON-RPC POST response body"),
            }
        }
        Ok(())
    }
}

impl SseInner {
    /// With `Some(generation)` only that session is torn down.
    async fn teardown(&self, reason: &str, generation: Option<u64>) {
        let session = {
            let mut guard = self.session.write().await;
            if let Some(generation) = generation {
                if guard.as_ref().map(|s| s.generation) != Some(generation) {
                    return;
                }
            }
            guard.take()
        };
        self.core.mark_disconnected();
        self.core.fail_pending(reason);
        if let Some(session) = session {
            session.cancel.cancel();
        }
    }
}

async fn read_events(
    inner: Arc<SseInner>,
    base: Url,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<Url>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    let reason = loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            let endpoint = match base.join(event.data.trim()) {
                                Ok(url) => url,
                                Err(e) => {
                                    warn!("Server announced an invalid endpoint {:?}: {}", event.data, e);
                                    continue;
                                }
                            };
                            match endpoint_tx.take() {
                                Some(tx) => {
                                    let _ = tx.send(endpoint);
                                }
                                None => {
                                    info!("Server moved the message endpoint to {}", endpoint);
                                    if let Some(session) = inner
                                        .session
                                        .write()
                                        .await
                                        .as_mut()
                                        .filter(|s| s.generation == generation)
                                    {
                                        session.endpoint = endpoint;
                                    }
                                }
                            }
                        }
                        None | Some("message") => inner.core.route_text(&event.data),
                        Some(other) => debug!("Ignoring SSE event type {}", other),
                    }
                }
            }
            Some(Err(e)) => {
                error!("SSE stream error: {}", e);
                break format!("event stream failed: {}", e);
            }
            None => break "event stream ended".to_string(),
        }
    };

    // Unblock a connect still waiting for the endpoint before taking the lock.
    drop(endpoint_tx);
    inner.teardown(&reason, Some(generation)).await;
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self, timeout: Duration) -> Result<(), Error> {
        let mut guard = self.inner.session.write().await;
        if guard.is_some() || self.inner.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let request = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream");
        let response = tokio::time::timeout(timeout, self.apply_auth(request).send())
            .await
            .map_err(|_| Error::Timeout(format!("Opening event stream at {} timed out", self.url)))??;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TransportError(format!(
                "Event stream request to {} failed with status {}",
                self.url, status
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(read_events(
            self.inner.clone(),
            self.url.clone(),
            response,
            endpoint_tx,
            generation,
            cancel.clone(),
        ));

        let wait = timeout.min(self.endpoint_timeout);
        let endpoint = match tokio::time::timeout(wait, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(Error::ConnectionClosed(
                    "Event stream ended before announcing the message endpoint".to_string(),
                ));
            }
            Err(_) => {
                cancel.cancel();
                return Err(Error::Timeout(format!(
                    "No endpoint event from {} within {:?}",
                    self.url, wait
                )));
            }
        };

        info!("SSE connected to {}, posting to {}", self.url, endpoint);
        self.inner.core.mark_connected();
        *guard = Some(SseSession {
            generation,
            endpoint,
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
        self.inner.teardown("transport closed", None).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::sse::{Event, Sse};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::Stream;
    use serde_json::json;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::broadcast;

    #[derive(Clone)]
    struct MockServer {
        events: broadcast::Sender<String>,
        sessions: Arc<Mutex<Vec<String>>>,
    }

    async fn event_stream(
        State(server): State<MockServer>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let rx = server.events.subscribe();
        let endpoint = futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages?sessionId=abc123"))
        });
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(text) => Some((Ok(Event::default().event("message").data(text)), rx)),
                Err(_) => None,
            }
        });
        Sse::new(endpoint.chain(messages))
    }

    async fn short_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        Sse::new(futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages"))
        }))
    }

    async fn silent_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        Sse::new(futures::stream::pending::<Result<Event, Infallible>>())
    }

    async fn post_message(
        State(server): State<MockServer>,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> Response {
        if let Some(session) = query.get("sessionId") {
            server.sessions.lock().unwrap().push(session.clone());
        }
        let Some(method) = body["method"].as_str() else {
            return StatusCode::ACCEPTED.into_response();
        };
        if method == "stall" {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return StatusCode::ACCEPTED.into_response();
        }
        if body.get("id").is_none() {
            return StatusCode::ACCEPTED.into_response();
        }

        let reply = json!({"jsonrpc": "2.0", "id": body["id"], "result": {"method": method}});
        match method {
            "inline" => (StatusCode::OK, Json(reply)).into_response(),
            "reject" => (StatusCode::BAD_REQUEST, "nope").into_response(),
            _ => {
                if method == "chatty" {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {"level": "info", "data": "working"}
                    });
                    let _ = server.events.send(note.to_string());
                }
                let _ = server.events.send(reply.to_string());
                StatusCode::ACCEPTED.into_response()
            }
        }
    }

    async fn spawn_server() -> (String, MockServer) {
        let (events, _) = broadcast::channel(64);
        let server = MockServer {
            events,
            sessions: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/sse", get(event_stream))
            .route("/short", get(short_stream))
            .route("/silent", get(silent_stream))
            .route("/messages", post(post_message))
            .with_state(server.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), server)
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_multiline_data() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: endpoint\r\ndata: /mess").is_empty());
        let events = decoder.feed(b"ages?sessionId=1\r\n\r\n: keep-alive\n\ndata: a\ndata: b\nid: 7\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?sessionId=1");
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "a\nb");
        assert_eq!(events[1].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_rejects_invalid_urls() {
        assert!(SseTransport::new("not a url").is_err());
        assert!(SseTransport::new("ws://localhost/sse").is_err());
        assert!(SseTransport::new("https://example.com/sse").is_ok());
    }

    #[tokio::test]
    async fn test_endpoint_handshake_and_round_trip() {
        let (base, server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/sse", base)).unwrap();
        transport.connect(Duration::from_secs(5)).await.unwrap();

        assert_eq!(transport.session_id().await.as_deref(), Some("abc123"));
        assert_eq!(transport.endpoint().await.unwrap().path(), "/messages");

        let response = transport
            .send_request(JSONRPCRequest::new(1, "chatty", None), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap()["method"], "chatty");
        assert_eq!(transport.drain_notifications().len(), 1);

        let inline = transport
            .send_request(JSONRPCRequest::new(2, "inline", None), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(inline.into_result().unwrap()["method"], "inline");

        assert!(server.sessions.lock().unwrap().iter().all(|s| s == "abc123"));
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_post_is_a_transport_error() {
        let (base, _server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/sse", base)).unwrap();
        transport.connect(Duration::from_secs(5)).await.unwrap();

        let err = transport
            .send_request(JSONRPCRequest::new(1, "reject", None), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transport_error(), "got {:?}", err);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_covers_a_slow_post() {
        let (base, _server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/sse", base)).unwrap();
        transport.connect(Duration::from_secs(5)).await.unwrap();

        let start = Instant::now();
        let err = transport
            .send_request(JSONRPCRequest::new(1, "stall", None), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(1));

        // The session is still usable afterwards.
        let ok = transport
            .send_request(JSONRPCRequest::new(2, "fast", None), Duration::from_secs(5))
            .await;
        assert!(ok.is_ok());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_timeout_bounds_notifications() {
        let (base, _server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/sse", base))
            .unwrap()
            .with_post_timeout(Duration::from_millis(100));
        transport.connect(Duration::from_secs(5)).await.unwrap();

        let start = Instant::now();
        let err = transport
            .send_message(JSONRPCMessage::Notification(JSONRPCNotification::new("stall", None)))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(1));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_endpoint_event_times_out() {
        let (base, _server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/silent", base))
            .unwrap()
            .with_endpoint_timeout(Duration::from_millis(200));

        let err = transport.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_timeout(), "got {:?}", err);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stream_end_disconnects() {
        let (base, _server) = spawn_server().await;
        let transport = SseTransport::new(&format!("{}/short", base)).unwrap();
        // The stream may end before or after the endpoint is handed over.
        if transport.connect(Duration::from_secs(5)).await.is_ok() {
            for _ in 0..50 {
                if !transport.is_connected() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_http_error_on_stream_fails_connect() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, ResponseTemplate};

        let mock = wiremock::MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock)
            .await;

        let transport = SseTransport::new(&format!("{}/sse", mock.uri())).unwrap();
        let err = transport.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(!transport.is_connected());
    }
}
