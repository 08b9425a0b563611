//! Server-to-client notification payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProgressToken;

/// Method names of the notifications the client understands
pub mod methods {
    /// Sent by the client once the handshake completed
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Progress update for a long-running request
    pub const PROGRESS: &str = "notifications/progress";
    /// Log message from the server
    pub const MESSAGE: &str = "notifications/message";
    /// A subscribed resource changed
    pub const RESOURCE_UPDATED: &str = "notifications/resources/updated";
    /// The resource list changed
    pub const RESOURCE_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// The tool list changed
    pub const TOOL_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// The prompt list changed
    pub const PROMPT_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    /// The client's roots changed
    pub const ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
    /// A request was cancelled
    pub const CANCELLED: &str = "notifications/cancelled";
}

/// The severity of a log message, as in RFC-5424.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    /// Debug-level message
    Debug,
    /// Informational message
    Info,
    /// Normal but significant condition
    Notice,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
    /// Critical conditions
    Critical,
    /// Action must be taken immediately
    Alert,
    /// System is unusable
    Emergency,
}

impl LoggingLevel {
    /// Map to the closest `log` crate level
    pub fn to_log_level(self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info | Self::Notice => log::Level::Info,
            Self::Warning => log::Level::Warn,
            Self::Error | Self::Critical | Self::Alert | Self::Emergency => log::Level::Error,
        }
    }
}

/// A `notifications/message` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    /// Severity
    pub level: LoggingLevel,
    /// Name of the logger issuing this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Arbitrary JSON payload, usually a string
    pub data: Value,
}

impl LogMessage {
    /// The payload rendered as text
    pub fn text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A `notifications/progress` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotification {
    /// Token given by the client in the original request's `_meta`
    pub progress_token: ProgressToken,
    /// Progress so far; increases monotonically
    pub progress: f64,
    /// Total work, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Human readable status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A `notifications/resources/updated` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUpdated {
    /// URI of the resource that changed
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_accepts_both_token_shapes() {
        let p: ProgressNotification =
            serde_json::from_value(json!({"progressToken": "T1", "progress": 0.5, "total": 1.0})).unwrap();
        assert_eq!(p.progress_token, ProgressToken::from("T1"));

        let p: ProgressNotification =
            serde_json::from_value(json!({"progressToken": 42, "progress": 3})).unwrap();
        assert_eq!(p.progress_token, ProgressToken::Integer(42));
        assert_eq!(p.total, None);
    }

    #[test]
    fn test_log_message_text() {
        let m: LogMessage = serde_json::from_value(json!({"level": "warning", "data": "disk low"})).unwrap();
        assert_eq!(m.text(), "disk low");
        assert_eq!(m.level.to_log_level(), log::Level::Warn);

        let m: LogMessage =
            serde_json::from_value(json!({"level": "info", "logger": "db", "data": {"rows": 3}})).unwrap();
        assert_eq!(m.text(), r#"{"rows":3}"#);
    }
}
