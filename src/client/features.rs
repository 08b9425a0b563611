//! Typed call-throughs for tools, resources, prompts and logging

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use super::Client;
use crate::error::Error;
use crate::protocol::handler::decode;
use crate::protocol::notifications::methods;
use crate::protocol::prompts::ListPromptsResult;
use crate::protocol::resources::{ListResourcesResult, ReadResourceResult};
use crate::protocol::tools::ListToolsResult;
use crate::protocol::{
    CallToolResult, GetPromptResult, LoggingLevel, ProgressNotification, ProgressToken, Prompt,
    RequestId, Resource, ResourceContents, ServerCapabilities, Tool,
};

impl Client {
    fn require(
        &self,
        feature: &str,
        supported: impl FnOnce(&ServerCapabilities) -> bool,
    ) -> Result<(), Error> {
        let capabilities = self.server_capabilities().ok_or(Error::NotConnected)?;
        if supported(&capabilities) {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(format!(
                "Server does not support {}",
                feature
            )))
        }
    }

    fn cursor_params(cursor: &Option<String>) -> Option<Value> {
        cursor.as_ref().map(|c| json!({ "cursor": c }))
    }

    /// Check that the server is responsive
    pub async fn ping(&self) -> Result<(), Error> {
        self.request("ping", None).await.map(|_| ())
    }

    /// List every tool the server offers, following pagination
    pub async fn list_tools(&self) -> Result<Vec<Tool>, Error> {
        self.require("tools", ServerCapabilities::supports_tools)?;

        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListToolsResult =
                decode(self.request("tools/list", Self::cursor_params(&cursor)).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        self.require("tools", ServerCapabilities::supports_tools)?;

        let params = json!({ "name": name, "arguments": arguments });
        decode(self.request("tools/call", Some(params)).await?)
    }

    /// Call a tool, receiving its progress updates on `on_progress`.
    ///
    /// Progress for `token` (a fresh UUID when `None`) reaches `on_progress`
    /// only while this call is in flight.
    pub async fn call_tool_with_progress<F>(
        &self,
        name: &str,
        arguments: Value,
        token: Option<ProgressToken>,
        on_progress: F,
    ) -> Result<CallToolResult, Error>
    where
        F: Fn(&ProgressNotification) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.require("tools", ServerCapabilities::supports_tools)?;

        let token = token.unwrap_or_else(|| ProgressToken::String(Uuid::new_v4().to_string()));
        let _scope = self
            .registry
            .scope_progress(token.clone(), Arc::new(on_progress))?;

        let params = json!({
            "name": name,
            "arguments": arguments,
            "_meta": { "progressToken": token },
        });
        decode(self.request("tools/call", Some(params)).await?)
    }

    /// List every resource the server offers, following pagination
    pub async fn list_resources(&self) -> Result<Vec<Resource>, Error> {
        self.require("resources", ServerCapabilities::supports_resources)?;

        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListResourcesResult =
                decode(self.request("resources/list", Self::cursor_params(&cursor)).await?)?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    /// Read a resource
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, Error> {
        self.require("resources", ServerCapabilities::supports_resources)?;

        let result: ReadResourceResult =
            decode(self.request("resources/read", Some(json!({ "uri": uri }))).await?)?;
        Ok(result.contents)
    }

    /// Subscribe to updates of a resource. Pair with
    /// [`Client::on_resource_updated`] to receive them.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), Error> {
        self.require(
            "resource subscriptions",
            ServerCapabilities::supports_resource_subscribe,
        )?;
        self.request("resources/subscribe", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// Unsubscribe from updates of a resource
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), Error> {
        self.require(
            "resource subscriptions",
            ServerCapabilities::supports_resource_subscribe,
        )?;
        self.request("resources/unsubscribe", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// List every prompt the server offers, following pagination
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, Error> {
        self.require("prompts", ServerCapabilities::supports_prompts)?;

        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListPromptsResult =
                decode(self.request("prompts/list", Self::cursor_params(&cursor)).await?)?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    /// Render a prompt
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult, Error> {
        self.require("prompts", ServerCapabilities::supports_prompts)?;

        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = json!(arguments);
        }
        decode(self.request("prompts/get", Some(params)).await?)
    }

    /// Ask the server to send log messages at `level` and above
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), Error> {
        self.require("logging", ServerCapabilities::supports_logging)?;
        self.request("logging/setLevel", Some(json!({ "level": level })))
            .await
            .map(|_| ())
    }

    /// Tell the server the client's roots changed
    pub async fn notify_roots_changed(&self) -> Result<(), Error> {
        if !self.options.capabilities.roots_list_changed {
            return Err(Error::UnsupportedFeature(
                "Client did not announce roots.listChanged".to_string(),
            ));
        }
        self.send_notification(methods::ROOTS_LIST_CHANGED, None)
            .await
    }

    /// Tell the server to stop working on an in-flight request
    pub async fn cancel_request(&self, id: &RequestId, reason: Option<&str>) -> Result<(), Error> {
        let mut params = json!({ "requestId": id });
        if let Some(reason) = reason {
            params["reason"] = json!(reason);
        }
        self.send_notification(methods::CANCELLED, Some(params))
            .await
    }
}
