//! # Aggregating Several MCP Servers
//!
//! Connects to every server listed in a JSON file and searches their tools.
//!
//! The file maps server names to transport configurations:
//!
//! ```json
//! {
//!   "files": { "type": "stdio", "command": "mcp-files", "args": ["--root", "."] },
//!   "search": { "type": "websocket", "url": "ws://localhost:3000/mcp" },
//!   "remote": { "type": "sse", "url": "http://localhost:8080/sse" }
//! }
//! ```
//!
//! ## Running This Example
//!
//! ```bash
//! cargo run --example aggregate -- servers.json [tool-name]
//! ```

use std::collections::BTreeMap;

use mcplink::{Aggregator, ClientBuilder, Error, TransportConfig};
use tracing::{info, warn, Level};
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
    let path = args
        .next()
        .ok_or_else(|| Error::ConfigError("usage: aggregate <servers.json> [tool]".to_string()))?;
    let wanted = args.next();

    let servers: BTreeMap<String, TransportConfig> =
        serde_json::from_str(&tokio::fs::read_to_string(&path).await?)?;

    let aggregator = Aggregator::new();
    for (name, config) in servers {
        let client = ClientBuilder::new().with_transport_config(config).build()?;
        aggregator.add(name, client).await;
    }

    for (name, outcome) in aggregator.connect_all().await {
        if let Err(e) = outcome {
            warn!("{} is unavailable: {}", name, e);
        }
    }
    info!("Connected servers: {:?}", aggregator.connected().await);

    for (name, tools) in aggregator.list_all_tools().await {
        if let Ok(tools) = tools {
            let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
            info!("{} offers {}", name, names.join(", "));
        }
    }

    if let Some(wanted) = wanted {
        match aggregator.find_tool(&wanted).await {
            Some((server, tool)) => info!(
                "{} is served by {}: {}",
                tool.name,
                server,
                tool.description.unwrap_or_default()
            ),
            None => warn!("No connected server offers {}", wanted),
        }
    }

    aggregator.close_all().await;
    Ok(())
}
