//! State shared by every transport: liveness, the response correlation table
//! and the notification sink.
//!
//! Each transport owns one [`TransportCore`]. Sender tasks register a
//! single-slot sink per request id and the transport's receive loop feeds
//! every decoded frame to [`TransportCore::route_text`], which delivers
//! responses to their sink, forwards notifications and hands server-initiated
//! requests to the registered callback.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::protocol::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest, RequestId};

/// Notifications kept while no handler is installed
pub const NOTIFICATION_BUFFER_CAPACITY: usize = 100;

/// Pause after a transient receive error before reading again
pub(crate) const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_millis(25);

/// Single-use slot a waiting caller listens on for its response
pub type ResponseSink = oneshot::Sender<Result<JSONRPCMessage, Error>>;

/// Receives notifications pushed by the server
pub type NotificationCallback = Arc<dyn Fn(JSONRPCNotification) + Send + Sync>;

/// Receives requests initiated by the server
pub type RequestCallback = Arc<dyn Fn(JSONRPCRequest) + Send + Sync>;

struct PendingEntry {
    seq: u64,
    sink: ResponseSink,
}

/// Liveness, correlation and notification plumbing for one transport
pub(crate) struct TransportCore {
    label: &'static str,
    connected: AtomicBool,
    pending: DashMap<RequestId, PendingEntry>,
    next_seq: AtomicU64,
    notification_handler: RwLock<Option<NotificationCallback>>,
    buffered: Mutex<VecDeque<JSONRPCNotification>>,
    request_handler: RwLock<Option<RequestCallback>>,
}

/// Removes a pending registration when the waiting caller goes away,
/// whatever the reason (response, timeout, or the future being dropped).
struct PendingGuard<'a> {
    core: &'a TransportCore,
    id: RequestId,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.core.unregister(&self.id, self.seq);
    }
}

impl TransportCore {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            connected: AtomicBool::new(false),
            pending: DashMap::new(),
            next_seq: AtomicU64::new(0),
            notification_handler: RwLock::new(None),
            buffered: Mutex::new(VecDeque::new()),
            request_handler: RwLock::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Returns true if this call performed the transition
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub fn ensure_connected(&self) -> Result<(), Error> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Register a sink for `id`. Fails fast if the id is already in flight.
    pub fn register(&self, id: RequestId, sink: ResponseSink) -> Result<u64, Error> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(id) {
            Entry::Occupied(entry) => Err(Error::DuplicateRequestId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(PendingEntry { seq, sink });
                Ok(seq)
            }
        }
    }

    pub fn unregister(&self, id: &RequestId, seq: u64) {
        self.pending.remove_if(id, |_, entry| entry.seq == seq);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Register, write, and wait for the correlated response.
    ///
    /// `timeout` bounds the write and the wait together. The registration is
    /// removed on every exit path, including the returned future being
    /// dropped before completion.
    pub async fn round_trip<F, Fut>(
        &self,
        request: JSONRPCRequest,
        timeout: Duration,
        write: F,
    ) -> Result<JSONRPCMessage, Error>
    where
        F: FnOnce(JSONRPCMessage) -> Fut + Send,
        Fut: Future<Output = Result<(), Error>> + Send,
    {
        self.ensure_connected()?;

        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        let seq = self.register(id.clone(), tx)?;
        let _guard = PendingGuard {
            core: self,
            id: id.clone(),
            seq,
        };

        let exchange = async {
            write(JSONRPCMessage::Request(request)).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionClosed(format!(
                    "{} transport dropped request {}",
                    self.label, id
                ))),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{} request {} timed out after {:?}", self.label, id, timeout);
                Err(Error::Timeout(format!(
                    "No response to request {} within {:?}",
                    id, timeout
                )))
            }
        }
    }

    /// Register an externally supplied sink, then write. The sink stays
    /// registered until a response arrives or the transport closes.
    pub async fn register_then_write<F, Fut>(
        &self,
        request: JSONRPCRequest,
        sink: ResponseSink,
        write: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(JSONRPCMessage) -> Fut + Send,
        Fut: Future<Output = Result<(), Error>> + Send,
    {
        self.ensure_connected()?;

        let id = request.id.clone();
        let seq = self.register(id.clone(), sink)?;
        if let Err(e) = write(JSONRPCMessage::Request(request)).await {
            self.unregister(&id, seq);
            return Err(e);
        }
        Ok(())
    }

    /// Decode one frame and route it
    pub fn route_text(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.route_value(value),
            Err(e) => warn!("{} dropping undecodable message: {}", self.label, e),
        }
    }

    pub fn route_value(&self, value: Value) {
        match JSONRPCMessage::classify(value) {
            Ok(message) => self.route_message(message),
            Err(e) => warn!("{} dropping malformed message: {}", self.label, e),
        }
    }

    pub fn route_message(&self, message: JSONRPCMessage) {
        match message {
            JSONRPCMessage::Response(_) | JSONRPCMessage::Error(_) => self.deliver(message),
            JSONRPCMessage::Notification(notification) => self.notify(notification),
            JSONRPCMessage::Request(request) => {
                let handler = self
                    .request_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler(request),
                    None => warn!(
                        "{} has no handler for server request {} ({})",
                        self.label, request.method, request.id
                    ),
                }
            }
        }
    }

    /// Hand a response to its sink. Never blocks; drops if nobody waits.
    fn deliver(&self, message: JSONRPCMessage) {
        let Some(id) = message.id().cloned() else {
            return;
        };
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                if entry.sink.send(Ok(message)).is_err() {
                    debug!("{} caller for request {} is gone, dropping response", self.label, id);
                }
            }
            None => debug!("{} response for unknown request {}", self.label, id),
        }
    }

    fn notify(&self, notification: JSONRPCNotification) {
        let handler = {
            let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            let installed = self
                .notification_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match installed {
                Some(handler) => handler,
                None => {
                    if buffered.len() >= NOTIFICATION_BUFFER_CAPACITY {
                        warn!(
                            "{} notification buffer full, dropping {}",
                            self.label, notification.method
                        );
                    } else {
                        buffered.push_back(notification);
                    }
                    return;
                }
            }
        };

        handler(notification);
    }

    /// Install the notification handler and flush anything buffered into it
    pub fn set_notification_handler(&self, handler: NotificationCallback) {
        let backlog: Vec<JSONRPCNotification> = {
            let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            *self
                .notification_handler
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(handler.clone());
            buffered.drain(..).collect()
        };
        for notification in backlog {
            handler(notification);
        }
    }

    pub fn set_request_handler(&self, handler: RequestCallback) {
        *self
            .request_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn drain_notifications(&self) -> Vec<JSONRPCNotification> {
        self.buffered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Complete every pending request with a connection error
    pub fn fail_pending(&self, reason: &str) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            debug!("{} failing {} pending requests: {}", self.label, ids.len(), reason);
        }
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry
                    .sink
                    .send(Err(Error::ConnectionClosed(reason.to_string())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn connected_core() -> Arc<TransportCore> {
        let core = Arc::new(TransportCore::new("test"));
        core.mark_connected();
        core
    }

    #[tokio::test]
    async fn test_round_trip_resolves_from_router() {
        let core = connected_core();
        let router = core.clone();

        let response = core
            .round_trip(
                JSONRPCRequest::new(5, "ping", None),
                Duration::from_secs(1),
                |message| async move {
                    assert_eq!(message.id(), Some(&RequestId::Integer(5)));
                    tokio::spawn(async move {
                        router.route_text(r#"{"jsonrpc":"2.0","id":5,"result":{"ok":true}}"#);
                    });
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(response.into_result().unwrap(), json!({"ok": true}));
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_timeout_leaves_no_registration() {
        let core = connected_core();
        let start = Instant::now();

        let err = core
            .round_trip(
                JSONRPCRequest::new(1, "slow", None),
                Duration::from_millis(50),
                |_| async { Ok(()) },
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(core.pending_len(), 0);

        // The same id can be reused and answered afterwards.
        let router = core.clone();
        let again = core
            .round_trip(
                JSONRPCRequest::new(1, "slow", None),
                Duration::from_secs(1),
                |_| async move {
                    router.route_text(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
                    Ok(())
                },
            )
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_write_still_times_out() {
        let core = connected_core();
        let start = Instant::now();

        let err = core
            .round_trip(
                JSONRPCRequest::new(3, "big", None),
                Duration::from_millis(50),
                |_| futures::future::pending(),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_unregisters() {
        let core = connected_core();
        let err = core
            .round_trip(
                JSONRPCRequest::new(2, "x", None),
                Duration::from_secs(1),
                |_| async { Err(Error::TransportError("broken pipe".to_string())) },
            )
            .await
            .unwrap_err();
        assert!(err.is_transport_error());
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_not_connected_fails_immediately() {
        let core = TransportCore::new("test");
        let err = core
            .round_trip(
                JSONRPCRequest::new(1, "x", None),
                Duration::from_secs(10),
                |_| async { Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn test_duplicate_ids_fail_fast() {
        let core = connected_core();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        core.register(RequestId::from("dup"), tx1).unwrap();
        let err = core.register(RequestId::from("dup"), tx2).unwrap_err();
        assert!(matches!(err, Error::DuplicateRequestId(_)));
        assert_eq!(core.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_fail_pending_unblocks_waiters() {
        let core = connected_core();
        let (tx, rx) = oneshot::channel();
        core.register(RequestId::Integer(9), tx).unwrap();
        core.fail_pending("transport closed");

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
        assert_eq!(core.pending_len(), 0);
    }

    #[test]
    fn test_unknown_and_malformed_messages_are_dropped() {
        let core = connected_core();
        core.route_text(r#"{"jsonrpc":"2.0","id":404,"result":{}}"#);
        core.route_text("not json at all");
        core.route_text(r#"{"jsonrpc":"2.0"}"#);
        core.route_text("   ");
        assert_eq!(core.pending_len(), 0);
        assert!(core.drain_notifications().is_empty());
    }

    #[test]
    fn test_notifications_buffer_until_handler_installed() {
        let core = connected_core();
        for i in 0..(NOTIFICATION_BUFFER_CAPACITY + 5) {
            core.route_value(json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": i}
            }));
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        core.set_notification_handler(Arc::new(move |_: JSONRPCNotification| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), NOTIFICATION_BUFFER_CAPACITY);

        core.route_value(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
        assert_eq!(seen.load(Ordering::SeqCst), NOTIFICATION_BUFFER_CAPACITY + 1);
        assert!(core.drain_notifications().is_empty());
    }

    #[test]
    fn test_server_requests_reach_request_handler() {
        let core = connected_core();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        core.set_request_handler(Arc::new(move |req: JSONRPCRequest| {
            sink.lock().unwrap().push(req.method);
        }));
        core.route_text(r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["ping".to_string()]);
    }
}
