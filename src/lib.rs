//! # MCPLink: a resilient Model Context Protocol client runtime
//!
//! `mcplink` connects to one MCP server over an interchangeable transport,
//! performs the versioned `initialize` handshake, multiplexes concurrent
//! requests over the single connection, dispatches server notifications to
//! registered handlers and reconnects with exponential backoff when the
//! connection drops.
//!
//! Protocol revisions 2024-11-05 and 2025-03-26 are supported.
//!
//! ## Features
//!
//! - Stdio (child process), WebSocket and SSE transports
//! - Out-of-order response correlation with per-request timeouts
//! - Progress notifications scoped to the call that requested them
//! - Automatic reconnection driven by a pluggable [`BackoffStrategy`]
//! - An [`Aggregator`] for fanning out over several servers
//!
//! ```no_run
//! use mcplink::ClientBuilder;
//!
//! # async fn example() -> mcplink::Result<()> {
//! let client = ClientBuilder::new()
//!     .with_stdio("my-mcp-server", ["--stdio"])
//!     .build()?;
//! client.connect().await?;
//! for tool in client.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod auth;
pub mod backoff;
pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types for convenience
pub use aggregator::Aggregator;
pub use auth::{AuthProvider, BearerToken, StaticHeaders};
pub use backoff::{BackoffStrategy, ExponentialBackoff};
pub use client::{Client, ClientBuilder, ClientCapabilities, ClientOptions, ConnectionState};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{Implementation, ProtocolVersion};
pub use transport::{SseTransport, StdioTransport, Transport, TransportConfig, WebSocketTransport};
