//! Client state management

use std::fmt;

use crate::protocol::{Implementation, InitializeResult, ProtocolVersion, ServerCapabilities};

/// Current client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected to server
    #[default]
    Disconnected,
    /// Transport is opening or the handshake is in flight
    Connecting,
    /// Handshake completed and the transport is live
    Connected,
}

impl ConnectionState {
    /// Check if the client is disconnected
    pub fn is_disconnected(&self) -> bool {
        *self == ConnectionState::Disconnected
    }

    /// Check if the client is connecting
    pub fn is_connecting(&self) -> bool {
        *self == ConnectionState::Connecting
    }

    /// Check if the client is connected
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What the server told us about itself during the last successful handshake
#[derive(Debug, Clone, PartialEq)]
pub struct ServerIdentity {
    /// Server implementation info
    pub server_info: Implementation,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Negotiated protocol version
    pub protocol_version: ProtocolVersion,
    /// Usage hints supplied by the server
    pub instructions: Option<String>,
}

impl From<InitializeResult> for ServerIdentity {
    fn from(result: InitializeResult) -> Self {
        let protocol_version = result.protocol_version();
        let (server_info, capabilities, instructions) = match result {
            InitializeResult::V2024_11_05 {
                server_info,
                capabilities,
                instructions,
            }
            | InitializeResult::V2025_03_26 {
                server_info,
                capabilities,
                instructions,
            } => (server_info, capabilities, instructions),
        };

        Self {
            server_info,
            capabilities,
            protocol_version,
            instructions,
        }
    }
}
