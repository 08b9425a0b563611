//! Per-client notification registry
//!
//! Handlers are stored per method plus a few typed lists on top: progress
//! (global and per-token), log messages, resource updates keyed by URI and
//! connection status. Dispatch snapshots the relevant handlers and invokes
//! them without holding any lock, so a handler may register further handlers.
//!
//! The snapshot is taken as the notification arrives, before any response
//! that follows it on the wire is routed. A call's last progress update
//! therefore still reaches its scoped handler even if the call returns
//! before the handlers get to run.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};
use serde_json::Value;

use crate::error::Error;
use crate::protocol::handler::decode;
use crate::protocol::notifications::{methods, ResourceUpdated};
use crate::protocol::{JSONRPCNotification, LogMessage, ProgressNotification, ProgressToken};

/// Receives the raw params of a notification
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> Result<(), Error> + Send + Sync>;

/// Receives progress updates
pub type ProgressHandler = Arc<dyn Fn(&ProgressNotification) -> Result<(), Error> + Send + Sync>;

/// Receives server log messages
pub type LogHandler = Arc<dyn Fn(&LogMessage) -> Result<(), Error> + Send + Sync>;

/// Receives the URI of an updated resource
pub type ResourceUpdateHandler = Arc<dyn Fn(&str) -> Result<(), Error> + Send + Sync>;

/// Told whenever the client connects (`true`) or disconnects (`false`)
pub type ConnectionStatusHandler = Arc<dyn Fn(bool) + Send + Sync>;

type Invocation = Box<dyn FnOnce() -> Result<(), Error> + Send>;

#[derive(Default)]
pub(crate) struct NotificationRegistry {
    by_method: RwLock<HashMap<String, Vec<NotificationHandler>>>,
    progress: RwLock<Vec<ProgressHandler>>,
    scoped_progress: RwLock<HashMap<ProgressToken, ProgressHandler>>,
    log: RwLock<Vec<LogHandler>>,
    resource_updates: RwLock<HashMap<String, Vec<ResourceUpdateHandler>>>,
    connection_status: RwLock<Vec<ConnectionStatusHandler>>,
}

/// Keeps a per-token progress handler registered until dropped
pub(crate) struct ScopedProgress {
    registry: Arc<NotificationRegistry>,
    token: ProgressToken,
}

impl Drop for ScopedProgress {
    fn drop(&mut self) {
        self.registry
            .scoped_progress
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token);
    }
}

/// Every handler interested in one notification, bound to its payload
pub(crate) struct Delivery {
    method: String,
    invocations: Vec<(&'static str, Invocation)>,
}

impl Delivery {
    fn push(&mut self, kind: &'static str, invocation: Invocation) {
        self.invocations.push((kind, invocation));
    }

    /// Invoke the handlers in registration order
    pub fn run(self) {
        if self.invocations.is_empty() {
            debug!("No handler for notification {}", self.method);
            return;
        }
        for (kind, invocation) in self.invocations {
            if let Err(e) = invocation() {
                warn!("{} handler for {} failed: {}", kind, self.method, e);
            }
        }
    }
}

impl NotificationRegistry {
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.by_method
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.into())
            .or_default()
            .push(handler);
    }

    pub fn on_progress(&self, handler: ProgressHandler) {
        self.progress
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Route progress for `token` to `handler` for as long as the guard lives.
    /// Fails if another call already holds `token`.
    pub fn scope_progress(
        self: &Arc<Self>,
        token: ProgressToken,
        handler: ProgressHandler,
    ) -> Result<ScopedProgress, Error> {
        match self
            .scoped_progress
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(token.clone())
        {
            Entry::Occupied(entry) => return Err(Error::DuplicateProgressToken(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(handler);
            }
        }
        Ok(ScopedProgress {
            registry: self.clone(),
            token,
        })
    }

    pub fn on_log(&self, handler: LogHandler) {
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn on_resource_updated(&self, uri: impl Into<String>, handler: ResourceUpdateHandler) {
        self.resource_updates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uri.into())
            .or_default()
            .push(handler);
    }

    pub fn on_connection_status(&self, handler: ConnectionStatusHandler) {
        self.connection_status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn notify_connection_status(&self, connected: bool) {
        let handlers = self
            .connection_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(connected);
        }
    }

    /// Resolve the handlers now, then run them on a task of their own when a
    /// runtime is available
    pub fn dispatch(&self, notification: JSONRPCNotification) {
        let delivery = self.resolve(notification);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { delivery.run() });
            }
            Err(_) => delivery.run(),
        }
    }

    /// Invoke every handler interested in `notification` on the current task
    #[cfg(test)]
    pub fn deliver(&self, notification: JSONRPCNotification) {
        self.resolve(notification).run();
    }

    /// Snapshot the handlers interested in `notification`
    pub fn resolve(&self, notification: JSONRPCNotification) -> Delivery {
        let JSONRPCNotification { method, params, .. } = notification;
        let mut delivery = Delivery {
            method,
            invocations: Vec::new(),
        };

        let handlers = self
            .by_method
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&delivery.method)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let params = params.clone();
            delivery.push("Notification", Box::new(move || handler(params)));
        }

        match delivery.method.as_str() {
            methods::PROGRESS => self.resolve_progress(params, &mut delivery),
            methods::MESSAGE => self.resolve_log(params, &mut delivery),
            methods::RESOURCE_UPDATED => self.resolve_resource_update(params, &mut delivery),
            _ => {}
        }
        delivery
    }

    fn resolve_progress(&self, params: Option<Value>, delivery: &mut Delivery) {
        let progress: ProgressNotification = match decode(params.unwrap_or(Value::Null)) {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Malformed progress notification: {}", e);
                return;
            }
        };

        let mut handlers = self
            .progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(scoped) = self
            .scoped_progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&progress.progress_token)
        {
            handlers.push(scoped.clone());
        }

        let progress = Arc::new(progress);
        for handler in handlers {
            let progress = progress.clone();
            delivery.push("Progress", Box::new(move || handler(&progress)));
        }
    }

    fn resolve_log(&self, params: Option<Value>, delivery: &mut Delivery) {
        let message: LogMessage = match decode(params.unwrap_or(Value::Null)) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed log notification: {}", e);
                return;
            }
        };

        let message = Arc::new(message);
        let handlers = self.log.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            let message = message.clone();
            delivery.push("Log", Box::new(move || handler(&message)));
        }
    }

    fn resolve_resource_update(&self, params: Option<Value>, delivery: &mut Delivery) {
        let update: ResourceUpdated = match decode(params.unwrap_or(Value::Null)) {
            Ok(update) => update,
            Err(e) => {
                warn!("Malformed resource update notification: {}", e);
                return;
            }
        };

        let handlers = self
            .resource_updates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&update.uri)
            .cloned()
            .unwrap_or_default();
        let uri: Arc<str> = update.uri.into();
        for handler in handlers {
            let uri = uri.clone();
            delivery.push("Resource update", Box::new(move || handler(&uri)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn progress(token: &str, value: f64) -> JSONRPCNotification {
        JSONRPCNotification::new(
            methods::PROGRESS,
            Some(json!({"progressToken": token, "progress": value})),
        )
    }

    #[test]
    fn test_scoped_progress_only_reaches_its_token() {
        let registry = Arc::new(NotificationRegistry::default());
        let t1 = Arc::new(Mutex::new(Vec::new()));
        let t2 = Arc::new(Mutex::new(Vec::new()));

        let sink = t1.clone();
        let _g1 = registry.scope_progress(
            ProgressToken::from("T1"),
            Arc::new(move |p: &ProgressNotification| {
                sink.lock().unwrap().push(p.progress);
                Ok(())
            }),
        )
        .unwrap();
        let sink = t2.clone();
        let g2 = registry.scope_progress(
            ProgressToken::from("T2"),
            Arc::new(move |p: &ProgressNotification| {
                sink.lock().unwrap().push(p.progress);
                Ok(())
            }),
        )
        .unwrap();

        registry.deliver(progress("T1", 0.5));
        registry.deliver(progress("T1", 1.0));
        assert_eq!(*t1.lock().unwrap(), vec![0.5, 1.0]);
        assert!(t2.lock().unwrap().is_empty());

        drop(g2);
        registry.deliver(progress("T2", 1.0));
        assert!(t2.lock().unwrap().is_empty());
    }

    #[test]
    fn test_progress_token_in_use_is_rejected() {
        let registry = Arc::new(NotificationRegistry::default());
        let first = Arc::new(AtomicUsize::new(0));
        let counter = first.clone();
        let guard = registry
            .scope_progress(
                ProgressToken::from("shared"),
                Arc::new(move |_: &ProgressNotification| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let second = registry.scope_progress(
            ProgressToken::from("shared"),
            Arc::new(|_: &ProgressNotification| Ok(())),
        );
        assert!(matches!(second, Err(Error::DuplicateProgressToken(_))));

        // The rejected registration must not have displaced the first.
        registry.deliver(progress("shared", 0.5));
        assert_eq!(first.load(Ordering::SeqCst), 1);

        drop(guard);
        assert!(registry
            .scope_progress(
                ProgressToken::from("shared"),
                Arc::new(|_: &ProgressNotification| Ok(()))
            )
            .is_ok());
    }

    #[test]
    fn test_progress_resolved_before_scope_ends_is_still_delivered() {
        let registry = Arc::new(NotificationRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let guard = registry
            .scope_progress(
                ProgressToken::from("T1"),
                Arc::new(move |p: &ProgressNotification| {
                    sink.lock().unwrap().push(p.progress);
                    Ok(())
                }),
            )
            .unwrap();

        let delivery = registry.resolve(progress("T1", 1.0));
        drop(guard);
        delivery.run();
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);

        registry.resolve(progress("T1", 2.0)).run();
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_the_rest() {
        let registry = NotificationRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.on_notification(
            methods::TOOL_LIST_CHANGED,
            Arc::new(|_: Option<Value>| Err(Error::InternalError("boom".to_string()))),
        );
        let counter = calls.clone();
        registry.on_notification(
            methods::TOOL_LIST_CHANGED,
            Arc::new(move |_: Option<Value>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        registry.deliver(JSONRPCNotification::new(methods::TOOL_LIST_CHANGED, None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_may_register_while_dispatching() {
        let registry = Arc::new(NotificationRegistry::default());
        let inner = registry.clone();
        registry.on_notification(
            "custom/event",
            Arc::new(move |_: Option<Value>| {
                inner.on_notification("custom/event", Arc::new(|_: Option<Value>| Ok(())));
                Ok(())
            }),
        );

        registry.deliver(JSONRPCNotification::new("custom/event", None));
        assert_eq!(registry.by_method.read().unwrap()["custom/event"].len(), 2);
    }

    #[test]
    fn test_log_and_resource_updates_are_typed() {
        let registry = NotificationRegistry::default();
        let logs = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::new(AtomicUsize::new(0));

        let sink = logs.clone();
        registry.on_log(Arc::new(move |m: &LogMessage| {
            sink.lock().unwrap().push(m.text());
            Ok(())
        }));
        let counter = updates.clone();
        registry.on_resource_updated(
            "file:///a.txt",
            Arc::new(move |uri: &str| {
                assert_eq!(uri, "file:///a.txt");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        registry.deliver(JSONRPCNotification::new(
            methods::MESSAGE,
            Some(json!({"level": "warning", "data": "disk almost full"})),
        ));
        registry.deliver(JSONRPCNotification::new(
            methods::RESOURCE_UPDATED,
            Some(json!({"uri": "file:///a.txt"})),
        ));
        registry.deliver(JSONRPCNotification::new(
            methods::RESOURCE_UPDATED,
            Some(json!({"uri": "file:///b.txt"})),
        ));

        assert_eq!(*logs.lock().unwrap(), vec!["disk almost full".to_string()]);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_status_handlers() {
        let registry = NotificationRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.on_connection_status(Arc::new(move |up: bool| sink.lock().unwrap().push(up)));

        registry.notify_connection_status(true);
        registry.notify_connection_status(false);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}
