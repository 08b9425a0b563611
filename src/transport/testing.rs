//! In-memory transport driven by a script, for client-level tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{NotificationCallback, RequestCallback, ResponseSink, Transport, TransportCore};
use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};

/// What the scripted server does with one request
pub(crate) enum Reply {
    Result(Value),
    Error(i32, &'static str),
    Delayed(Duration, Value),
    /// Emit these notifications, then answer straight away
    Progress(Vec<Value>, Value),
    Silent,
}

pub(crate) type Script = Arc<dyn Fn(&JSONRPCRequest) -> Reply + Send + Sync>;

pub(crate) struct MockTransport {
    pub(crate) core: Arc<TransportCore>,
    script: Script,
    sent: Mutex<Vec<JSONRPCMessage>>,
    pub(crate) connects: AtomicUsize,
    pub(crate) failing_connects: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(TransportCore::new("mock")),
            script,
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
        })
    }

    /// A server offering `tools` and answering everything else with `{}`
    pub(crate) fn with_tools(tools: Value) -> Arc<Self> {
        Self::new(Arc::new(move |request: &JSONRPCRequest| {
            match request.method.as_str() {
                "initialize" => Reply::Result(initialize_result("2025-03-26")),
                "tools/list" => Reply::Result(json!({ "tools": tools.clone() })),
                "tools/call" => {
                    let name = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("name"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    Reply::Result(json!({"content": [{"type": "text", "text": name}]}))
                }
                _ => Reply::Result(json!({})),
            }
        }))
    }

    /// The peer goes away without the client calling close
    pub(crate) fn drop_connection(&self) {
        self.core.mark_disconnected();
        self.core.fail_pending("peer went away");
    }

    pub(crate) fn inject(&self, value: Value) {
        self.core.route_value(value);
    }

    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    pub(crate) fn sent_replies(&self) -> Vec<JSONRPCMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, JSONRPCMessage::Response(_) | JSONRPCMessage::Error(_)))
            .cloned()
            .collect()
    }

    async fn write(&self, message: JSONRPCMessage) -> Result<(), Error> {
        self.core.ensure_connected()?;
        self.sent.lock().unwrap().push(message.clone());

        let JSONRPCMessage::Request(request) = message else {
            return Ok(());
        };
        let reply = (self.script)(&request);
        let core = self.core.clone();
        let id = json!(request.id);
        tokio::spawn(async move {
            match reply {
                Reply::Result(result) => {
                    core.route_value(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                }
                Reply::Error(code, message) => core.route_value(json!({
                    "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}
                })),
                Reply::Delayed(delay, result) => {
                    tokio::time::sleep(delay).await;
                    core.route_value(json!({"jsonrpc": "2.0", "id": id, "result": result}));
                }
                Reply::Progress(notifications, result) => {
                    for notification in notifications {
                        core.route_value(notification);
                    }
                    core.route_value(json!({"jsonrpc": "2.0", "id": id, "result": result}));
                }
                Reply::Silent => {}
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _timeout: Duration) -> Result<(), Error> {
        if self.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::TransportError("connection refused".to_string()));
        }
        self.core.mark_connected();
        Ok(())
    }

    async fn send_request(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
    ) -> Result<JSONRPCMessage, Error> {
        self.core
            .round_trip(request, timeout, |message| self.write(message))
            .await
    }

    async fn send_request_async(
        &self,
        request: JSONRPCRequest,
        sink: ResponseSink,
    ) -> Result<(), Error> {
        self.core
            .register_then_write(request, sink, |message| self.write(message))
            .await
    }

    async fn send_message(&self, message: JSONRPCMessage) -> Result<(), Error> {
        self.write(message).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.core.mark_disconnected();
        self.core.fail_pending("transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn set_notification_handler(&self, handler: NotificationCallback) {
        self.core.set_notification_handler(handler);
    }

    fn set_request_handler(&self, handler: RequestCallback) {
        self.core.set_request_handler(handler);
    }

    fn drain_notifications(&self) -> Vec<JSONRPCNotification> {
        self.core.drain_notifications()
    }
}

pub(crate) fn initialize_result(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "serverInfo": {"name": "mock-server", "version": "1.2.3"},
        "capabilities": {
            "tools": {"listChanged": true},
            "resources": {"subscribe": true},
            "logging": {},
            "completions": {}
        },
        "instructions": "be nice"
    })
}
