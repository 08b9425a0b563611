//! # Stdio MCP Client Example
//!
//! Spawns an MCP server as a child process and talks to it over stdin/stdout.
//!
//! ## What This Example Does
//!
//! 1. Launches the server command given on the command line
//! 2. Performs the handshake and prints what the server announced
//! 3. Lists the server's tools and calls the first one, printing progress
//! 4. Keeps the connection supervised until Ctrl-C
//!
//! ## Running This Example
//!
//! ```bash
//! RUST_LOG=mcplink=debug cargo run --example stdio_client -- npx -y @modelcontextprotocol/server-everything
//! ```

use std::sync::Arc;
use std::time::Duration;

use mcplink::{ClientBuilder, Error, ExponentialBackoff};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let command = args
        .next()
        .ok_or_else(|| Error::ConfigError("usage: stdio_client <command> [args...]".to_string()))?;

    let client = Arc::new(
        ClientBuilder::new()
            .with_implementation("mcplink-stdio-demo", env!("CARGO_PKG_VERSION"))
            .with_stdio(command, args)
            .with_request_timeout(Duration::from_secs(60))
            .with_backoff(Arc::new(ExponentialBackoff::default()))
            .build()?,
    );

    client.on_connection_status(|up| info!("Connection is {}", if up { "up" } else { "down" }));
    client.on_log(|message| {
        info!("[server {:?}] {}", message.level, message.text());
        Ok(())
    });

    client.connect().await?;
    if let Some(identity) = client.identity() {
        info!(
            "Connected to {} {} over protocol {}",
            identity.server_info.name, identity.server_info.version, identity.protocol_version
        );
        if let Some(instructions) = identity.instructions {
            info!("Server instructions: {}", instructions);
        }
    }

    let tools = client.list_tools().await?;
    for tool in &tools {
        info!(
            "Tool {}: {}",
            tool.name,
            tool.description.as_deref().unwrap_or("(no description)")
        );
    }

    if let Some(tool) = tools.first() {
        let result = client
            .call_tool_with_progress(&tool.name, json!({}), None, |progress| {
                info!(
                    "Progress {}/{}",
                    progress.progress,
                    progress.total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string())
                );
                Ok(())
            })
            .await;
        match result {
            Ok(result) => info!("{} returned: {}", tool.name, result.text()),
            Err(e) => info!("{} failed: {}", tool.name, e),
        }
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    info!("Supervising connection, press Ctrl-C to exit");
    client.run(cancel).await
}
