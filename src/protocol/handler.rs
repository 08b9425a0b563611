//! Version-aware message formatting and result parsing
//!
//! The client core never inspects wire shapes itself. It asks a
//! [`ProtocolHandler`] to build requests and to turn responses into typed
//! values. Shapes that differ between protocol revisions are resolved here,
//! once, into the [`InitializeResult`] tagged union.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::json_rpc::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest};
use super::{Implementation, RequestId};
use crate::error::Error;

/// A protocol revision the client knows how to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// The 2024-11-05 revision
    V2024_11_05,
    /// The 2025-03-26 revision
    V2025_03_26,
}

impl ProtocolVersion {
    /// Wire representation of the version
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2024_11_05 => "2024-11-05",
            Self::V2025_03_26 => "2025-03-26",
        }
    }

    /// Newest supported version
    pub fn latest() -> Self {
        Self::V2025_03_26
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::latest()
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2024-11-05" => Ok(Self::V2024_11_05),
            "2025-03-26" => Ok(Self::V2025_03_26),
            other => Err(Error::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Capability advertising list-change notifications
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether the server emits `list_changed` notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resource capability of a server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Whether the server supports `resources/subscribe`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    /// Whether the server emits `notifications/resources/list_changed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities a server announced during the handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Non-standard capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
    /// Present when the server can send log messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Present when the server offers argument completion (2025-03-26 and later)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    /// Present when the server offers prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    /// Present when the server offers resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Present when the server offers tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
}

impl ServerCapabilities {
    /// Whether the server offers tools
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }

    /// Whether the server offers resources
    pub fn supports_resources(&self) -> bool {
        self.resources.is_some()
    }

    /// Whether the server accepts resource subscriptions
    pub fn supports_resource_subscribe(&self) -> bool {
        self.resources
            .as_ref()
            .and_then(|r| r.subscribe)
            .unwrap_or(false)
    }

    /// Whether the server offers prompts
    pub fn supports_prompts(&self) -> bool {
        self.prompts.is_some()
    }

    /// Whether the server accepts `logging/setLevel`
    pub fn supports_logging(&self) -> bool {
        self.logging.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInitializeResult {
    protocol_version: String,
    capabilities: ServerCapabilities,
    server_info: Implementation,
    #[serde(default)]
    instructions: Option<String>,
}

/// The handshake result, resolved by negotiated protocol version
#[derive(Debug, Clone, PartialEq)]
pub enum InitializeResult {
    /// Negotiated 2024-11-05
    V2024_11_05 {
        /// Server implementation info
        server_info: Implementation,
        /// Server capabilities (`completions` is not part of this revision)
        capabilities: ServerCapabilities,
        /// Usage hints for the model
        instructions: Option<String>,
    },
    /// Negotiated 2025-03-26
    V2025_03_26 {
        /// Server implementation info
        server_info: Implementation,
        /// Server capabilities
        capabilities: ServerCapabilities,
        /// Usage hints for the model
        instructions: Option<String>,
    },
}

impl InitializeResult {
    /// The negotiated version
    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::V2024_11_05 { .. } => ProtocolVersion::V2024_11_05,
            Self::V2025_03_26 { .. } => ProtocolVersion::V2025_03_26,
        }
    }

    /// Server implementation info
    pub fn server_info(&self) -> &Implementation {
        match self {
            Self::V2024_11_05 { server_info, .. } | Self::V2025_03_26 { server_info, .. } => {
                server_info
            }
        }
    }

    /// Server capabilities
    pub fn capabilities(&self) -> &ServerCapabilities {
        match self {
            Self::V2024_11_05 { capabilities, .. } | Self::V2025_03_26 { capabilities, .. } => {
                capabilities
            }
        }
    }

    /// Server instructions, if any
    pub fn instructions(&self) -> Option<&str> {
        match self {
            Self::V2024_11_05 { instructions, .. } | Self::V2025_03_26 { instructions, .. } => {
                instructions.as_deref()
            }
        }
    }
}

/// Formats outgoing messages and parses incoming results for one client.
///
/// Implementations must be cheap to call from many tasks at once.
pub trait ProtocolHandler: Send + Sync {
    /// The version offered in `initialize`
    fn preferred_version(&self) -> ProtocolVersion;

    /// Build a request envelope
    fn format_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<JSONRPCRequest, Error>;

    /// Build a notification envelope
    fn format_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JSONRPCNotification, Error>;

    /// Parse the response to `initialize`
    fn parse_initialize(&self, response: JSONRPCMessage) -> Result<InitializeResult, Error>;

    /// Parse the response to any other request into its result value
    fn parse_response(&self, response: JSONRPCMessage) -> Result<Value, Error>;
}

/// The stock [`ProtocolHandler`] covering every version in
/// [`SUPPORTED_PROTOCOL_VERSIONS`](super::SUPPORTED_PROTOCOL_VERSIONS).
#[derive(Debug, Clone, Default)]
pub struct DefaultProtocolHandler {
    preferred: ProtocolVersion,
}

impl DefaultProtocolHandler {
    /// Create a handler offering `preferred` during the handshake
    pub fn new(preferred: ProtocolVersion) -> Self {
        Self { preferred }
    }
}

impl ProtocolHandler for DefaultProtocolHandler {
    fn preferred_version(&self) -> ProtocolVersion {
        self.preferred
    }

    fn format_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<JSONRPCRequest, Error> {
        if method.is_empty() {
            return Err(Error::ProtocolError("Request method must not be empty".to_string()));
        }
        if let Some(params) = &params {
            if !(params.is_object() || params.is_array()) {
                return Err(Error::ProtocolError(format!(
                    "Params for {} must be an object or array",
                    method
                )));
            }
        }
        Ok(JSONRPCRequest::new(id, method, params))
    }

    fn format_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JSONRPCNotification, Error> {
        if method.is_empty() {
            return Err(Error::ProtocolError(
                "Notification method must not be empty".to_string(),
            ));
        }
        Ok(JSONRPCNotification::new(method, params))
    }

    fn parse_initialize(&self, response: JSONRPCMessage) -> Result<InitializeResult, Error> {
        let result = response.into_result()?;
        let raw: RawInitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::ProtocolError(format!("Malformed initialize result: {}", e)))?;

        let version: ProtocolVersion = raw.protocol_version.parse()?;
        let parsed = match version {
            ProtocolVersion::V2024_11_05 => {
                let mut capabilities = raw.capabilities;
                capabilities.completions = None;
                InitializeResult::V2024_11_05 {
                    server_info: raw.server_info,
                    capabilities,
                    instructions: raw.instructions,
                }
            }
            ProtocolVersion::V2025_03_26 => InitializeResult::V2025_03_26 {
                server_info: raw.server_info,
                capabilities: raw.capabilities,
                instructions: raw.instructions,
            },
        };

        Ok(parsed)
    }

    fn parse_response(&self, response: JSONRPCMessage) -> Result<Value, Error> {
        response.into_result()
    }
}

/// Decode a result value into a typed payload
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(|e| Error::ParseError(e.to_string()))
}
