//! JSON-RPC envelope types and structural message classification

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RequestId;
use crate::error::Error;

/// JSON-RPC version used by the MCP protocol
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes
pub mod error_codes {
    /// Invalid JSON was received by the server.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// A JSON-RPC message travelling in either direction.
///
/// Incoming messages are never deserialized through this enum directly; use
/// [`JSONRPCMessage::classify`], which decides the variant from the shape of
/// the object (`id` and/or `method` present) before parsing the fields.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    /// A request that expects a response
    Request(JSONRPCRequest),
    /// A notification that does not expect a response
    Notification(JSONRPCNotification),
    /// A successful response to a request
    Response(JSONRPCResponse),
    /// An error response to a request
    Error(JSONRPCError),
}

impl JSONRPCMessage {
    /// Classify a decoded JSON value by structure alone.
    ///
    /// * `method` + `id` → request (server-initiated)
    /// * `method` only → notification
    /// * `id` with `result` or `error` → response
    pub fn classify(value: Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::ProtocolError("JSON-RPC message is not an object".to_string()))?;

        let has_method = obj.contains_key("method");
        let has_id = obj.get("id").map(|id| !id.is_null()).unwrap_or(false);

        let message = match (has_method, has_id) {
            (true, true) => JSONRPCMessage::Request(serde_json::from_value(value)?),
            (true, false) => JSONRPCMessage::Notification(serde_json::from_value(value)?),
            (false, true) if obj.contains_key("error") => {
                JSONRPCMessage::Error(serde_json::from_value(value)?)
            }
            (false, true) => {
                if !obj.contains_key("result") {
                    return Err(Error::ProtocolError(
                        "Response carries neither result nor error".to_string(),
                    ));
                }
                JSONRPCMessage::Response(serde_json::from_value(value)?)
            }
            (false, false) => {
                return Err(Error::ProtocolError(
                    "Message has neither id nor method".to_string(),
                ))
            }
        };

        Ok(message)
    }

    /// Parse and classify a single serialized message
    pub fn from_text(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::ParseError(format!("Invalid JSON-RPC message: {}", e)))?;
        Self::classify(value)
    }

    /// The correlation id, when the message carries one
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JSONRPCMessage::Request(r) => Some(&r.id),
            JSONRPCMessage::Response(r) => Some(&r.id),
            JSONRPCMessage::Error(e) => Some(&e.id),
            JSONRPCMessage::Notification(_) => None,
        }
    }

    /// The method name, for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JSONRPCMessage::Request(r) => Some(&r.method),
            JSONRPCMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Turn a response or error message into the result value, surfacing a
    /// structured error payload as [`Error::ServerError`].
    pub fn into_result(self) -> Result<Value, Error> {
        match self {
            JSONRPCMessage::Response(resp) => Ok(resp.result),
            JSONRPCMessage::Error(err) => Err(Error::ServerError(
                err.error.code,
                err.error.message,
                err.error.data,
            )),
            other => Err(Error::ProtocolError(format!(
                "Expected a response, got {:?}",
                other.method()
            ))),
        }
    }
}

/// A JSON-RPC request that expects a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JSONRPCRequest {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCRequest {
    /// Create a new JSON-RPC request
    pub fn new<I: Into<RequestId>>(id: I, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification that does not expect a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JSONRPCNotification {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCNotification {
    /// Create a new JSON-RPC notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JSONRPCResponse {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request ID that this is responding to
    pub id: RequestId,
    /// Result value
    pub result: Value,
}

impl JSONRPCResponse {
    /// Create a new JSON-RPC response
    pub fn new<I: Into<RequestId>>(id: I, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result,
        }
    }
}

/// A JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JSONRPCError {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request ID that this is responding to
    pub id: RequestId,
    /// Error information
    pub error: JSONRPCErrorInfo,
}

impl JSONRPCError {
    /// Create a new JSON-RPC error
    pub fn new<I: Into<RequestId>>(
        id: I,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            error: JSONRPCErrorInfo {
                code,
                message: message.into(),
                data,
            },
        }
    }
}

/// JSON-RPC error information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JSONRPCErrorInfo {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
