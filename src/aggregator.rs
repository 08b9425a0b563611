//! Fan-out over several named MCP clients
//!
//! An [`Aggregator`] owns any number of [`Client`]s keyed by name. Bulk
//! operations run against every client concurrently and never stop at the
//! first failure: each server's outcome is logged and reported on its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::client::Client;
use crate::error::Error;
use crate::protocol::{CallToolResult, Tool};

/// Per-server outcome of a bulk operation, ordered by server name
pub type Outcomes<T> = BTreeMap<String, Result<T, Error>>;

/// A set of named clients
#[derive(Default)]
pub struct Aggregator {
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl Aggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` under `name`, returning the client it replaces
    pub async fn add(&self, name: impl Into<String>, client: Client) -> Option<Arc<Client>> {
        self.add_shared(name, Arc::new(client)).await
    }

    /// Add an already shared client under `name`
    pub async fn add_shared(
        &self,
        name: impl Into<String>,
        client: Arc<Client>,
    ) -> Option<Arc<Client>> {
        let name = name.into();
        debug!("Adding server {}", name);
        self.clients.write().await.insert(name, client)
    }

    /// Remove the client registered under `name`. The client is handed back
    /// as is; closing it is up to the caller.
    pub async fn remove(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.write().await.remove(name)
    }

    /// The client registered under `name`
    pub async fn get(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Every registered name, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered clients
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no clients are registered
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<(String, Arc<Client>)> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect()
    }

    /// Connect every client that is not connected yet
    pub async fn connect_all(&self) -> Outcomes<()> {
        let connects = self.snapshot().await.into_iter().map(|(name, client)| async move {
            let result = match client.connect().await {
                Err(Error::AlreadyConnected) => Ok(()),
                other => other,
            };
            match &result {
                Ok(()) => info!("Server {} connected", name),
                Err(e) => warn!("Server {} failed to connect: {}", name, e),
            }
            (name, result)
        });
        join_all(connects).await.into_iter().collect()
    }

    /// Close every client
    pub async fn close_all(&self) -> Outcomes<()> {
        let closes = self.snapshot().await.into_iter().map(|(name, client)| async move {
            let result = client.close().await;
            if let Err(e) = &result {
                warn!("Server {} did not close cleanly: {}", name, e);
            }
            (name, result)
        });
        join_all(closes).await.into_iter().collect()
    }

    /// Names of the clients that are currently connected, sorted
    pub async fn connected(&self) -> Vec<String> {
        let checks = self
            .snapshot()
            .await
            .into_iter()
            .map(|(name, client)| async move { (name, client.is_connected().await) });
        let mut names: Vec<_> = join_all(checks)
            .await
            .into_iter()
            .filter_map(|(name, up)| up.then_some(name))
            .collect();
        names.sort();
        names
    }

    /// List the tools of every connected server
    pub async fn list_all_tools(&self) -> Outcomes<Vec<Tool>> {
        let listings = self.snapshot().await.into_iter().map(|(name, client)| async move {
            let result = if client.is_connected().await {
                client.list_tools().await
            } else {
                Err(Error::NotConnected)
            };
            if let Err(e) = &result {
                warn!("Could not list tools of {}: {}", name, e);
            }
            (name, result)
        });
        join_all(listings).await.into_iter().collect()
    }

    /// Call tool `tool` on server `server`
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, Error> {
        let client = self
            .get(server)
            .await
            .ok_or_else(|| Error::ConfigError(format!("Unknown server: {}", server)))?;
        client.call_tool(tool, arguments).await
    }

    /// The first server, by name, offering a tool called `tool`
    pub async fn find_tool(&self, tool: &str) -> Option<(String, Tool)> {
        self.list_all_tools()
            .await
            .into_iter()
            .filter_map(|(name, tools)| tools.ok().map(|tools| (name, tools)))
            .find_map(|(name, tools)| {
                tools
                    .into_iter()
                    .find(|t| t.name == tool)
                    .map(|t| (name, t))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use crate::transport::testing::MockTransport;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn client(transport: &Arc<MockTransport>) -> Client {
        Client::new(transport.clone(), ClientOptions::default())
    }

    #[tokio::test]
    async fn test_registry_operations() {
        let aggregator = Aggregator::new();
        assert!(aggregator.is_empty().await);

        let first = MockTransport::with_tools(json!([]));
        let second = MockTransport::with_tools(json!([]));
        assert!(aggregator.add("b", client(&first)).await.is_none());
        assert!(aggregator.add("a", client(&second)).await.is_none());
        assert!(aggregator.add("a", client(&second)).await.is_some());

        assert_eq!(aggregator.names().await, vec!["a", "b"]);
        assert_eq!(aggregator.len().await, 2);
        assert!(aggregator.get("b").await.is_some());
        assert!(aggregator.get("zzz").await.is_none());

        assert!(aggregator.remove("b").await.is_some());
        assert!(aggregator.remove("b").await.is_none());
        assert_eq!(aggregator.names().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_connect_all_reports_each_server() {
        let aggregator = Aggregator::new();
        let good = MockTransport::with_tools(json!([]));
        let bad = MockTransport::with_tools(json!([]));
        bad.failing_connects.store(1, std::sync::atomic::Ordering::SeqCst);
        aggregator.add("good", client(&good)).await;
        aggregator.add("bad", client(&bad)).await;

        let outcomes = aggregator.connect_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_ok!(&outcomes["good"]);
        assert_err!(&outcomes["bad"]);
        assert_eq!(aggregator.connected().await, vec!["good"]);

        // Already connected servers are not an error the second time.
        let outcomes = aggregator.connect_all().await;
        assert_ok!(&outcomes["good"]);
        assert_ok!(&outcomes["bad"]);
        assert_eq!(aggregator.connected().await, vec!["bad", "good"]);

        let outcomes = aggregator.close_all().await;
        assert!(outcomes.values().all(Result::is_ok));
        assert!(aggregator.connected().await.is_empty());
    }

    #[tokio::test]
    async fn test_tools_across_servers() {
        let aggregator = Aggregator::new();
        let files = MockTransport::with_tools(json!([{"name": "read_file"}, {"name": "write_file"}]));
        let search = MockTransport::with_tools(json!([{"name": "search"}]));
        let offline = MockTransport::with_tools(json!([{"name": "search"}]));
        aggregator.add("files", client(&files)).await;
        aggregator.add("search", client(&search)).await;
        aggregator.connect_all().await;
        aggregator.add("offline", client(&offline)).await;

        let tools = aggregator.list_all_tools().await;
        assert_eq!(tools["files"].as_ref().unwrap().len(), 2);
        assert_eq!(tools["search"].as_ref().unwrap().len(), 1);
        assert!(matches!(tools["offline"], Err(Error::NotConnected)));

        let (server, tool) = aggregator.find_tool("search").await.unwrap();
        assert_eq!(server, "search");
        assert_eq!(tool.name, "search");
        assert!(aggregator.find_tool("missing").await.is_none());

        let result = assert_ok!(aggregator.call_tool("files", "read_file", json!({})).await);
        assert_eq!(result.text(), "read_file");
        let err = assert_err!(aggregator.call_tool("nowhere", "read_file", json!({})).await);
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_dropped_server_is_not_reported_connected() {
        let aggregator = Aggregator::new();
        let transport = MockTransport::with_tools(json!([]));
        aggregator.add("only", client(&transport)).await;
        aggregator.connect_all().await;
        assert_eq!(aggregator.connected().await, vec!["only"]);

        transport.drop_connection();
        assert!(aggregator.connected().await.is_empty());
    }
}
