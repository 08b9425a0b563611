//! Protocol types for the Model Context Protocol (MCP)
//!
//! This module contains the JSON-RPC envelope types, the version-aware
//! [`ProtocolHandler`] that formats requests and parses typed results, and the
//! small set of typed payloads the client needs (tools, resources, prompts,
//! notifications).

pub mod handler;
pub mod json_rpc;
pub mod notifications;
pub mod prompts;
pub mod resources;
pub mod tools;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Latest protocol version supported by this library
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version the client can negotiate, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Describes the name and version of an MCP implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Implementation {
    /// Name of the implementation
    pub name: String,
    /// Version of the implementation
    pub version: String,
}

impl Implementation {
    /// Create a new Implementation
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A progress token, used to associate progress notifications with the original request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String token
    String(String),
    /// Integer token
    Integer(i64),
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for ProgressToken {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{}", i),
        }
    }
}

/// A unique request ID for JSON-RPC messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Integer ID
    Integer(i64),
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for RequestId {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for RequestId {
    fn from(i: i32) -> Self {
        Self::Integer(i as i64)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "\"{}\"", s),
            Self::Integer(i) => write!(f, "{}", i),
        }
    }
}

pub use self::handler::{
    DefaultProtocolHandler, InitializeResult, ProtocolHandler, ProtocolVersion, ServerCapabilities,
};
pub use self::json_rpc::{
    JSONRPCError, JSONRPCErrorInfo, JSONRPCMessage, JSONRPCNotification, JSONRPCRequest,
    JSONRPCResponse,
};
pub use self::notifications::{LogMessage, LoggingLevel, ProgressNotification};
pub use self::prompts::{GetPromptResult, Prompt, PromptMessage};
pub use self::resources::{Resource, ResourceContents};
pub use self::tools::{CallToolResult, Content, Tool};
