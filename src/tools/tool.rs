//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StrandError;
use crate::types::ToolContent;

/// JSON Schema describing a tool's arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameters {
    pub schema: serde_json::Value,
}

impl ToolParameters {
    pub fn from_schema(schema: serde_json::Value) -> Self {
        Self { schema }
    }

    /// An object schema with no properties.
    pub fn empty() -> Self {
        Self::object().build()
    }

    pub fn object() -> ParameterBuilder {
        ParameterBuilder {
            properties: serde_json::Map::new(),
            required: Vec::new(),
        }
    }
}

/// Builder for object parameter schemas.
pub struct ParameterBuilder {
    properties: serde_json::Map<String, serde_json::Value>,
    required: Vec<String>,
}

impl ParameterBuilder {
    /// Add a property with an arbitrary sub-schema.
    pub fn property(
        mut self,
        name: impl Into<String>,
        schema: serde_json::Value,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    pub fn string(self, name: impl Into<String>, description: &str, required: bool) -> Self {
        self.typed(name, "string", description, required)
    }

    pub fn integer(self, name: impl Into<String>, description: &str, required: bool) -> Self {
        self.typed(name, "integer", description, required)
    }

    pub fn boolean(self, name: impl Into<String>, description: &str, required: bool) -> Self {
        self.typed(name, "boolean", description, required)
    }

    fn typed(
        self,
        name: impl Into<String>,
        kind: &str,
        description: &str,
        required: bool,
    ) -> Self {
        self.property(
            name,
            serde_json::json!({ "type": kind, "description": description }),
            required,
        )
    }

    pub fn build(self) -> ToolParameters {
        ToolParameters {
            schema: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

/// Tool metadata sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Partial result reported while a tool is still running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUpdate {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Callback through which a tool reports progress.
pub type ToolUpdateCallback = Arc<dyn Fn(ToolUpdate) + Send + Sync>;

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    pub details: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            details: serde_json::Value::Null,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Pretty-printed JSON as text content, with the value kept in `details`.
    pub fn json(value: serde_json::Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Self {
            details: value,
            ..Self::text(text)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Display label for hosts; defaults to the name.
    fn label(&self) -> &str {
        self.name()
    }

    fn description(&self) -> &str;

    fn parameters(&self) -> &ToolParameters;

    /// Run one call. `cancel` fires when the run is aborted; tools should wind
    /// down promptly and may still return what they have.
    async fn execute(
        &self,
        call_id: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateCallback>,
    ) -> Result<ToolOutput, StrandError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().schema.clone(),
        }
    }
}

type ToolHandler = dyn Fn(
        ToolInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, StrandError>> + Send>>
    + Send
    + Sync;

/// Everything a closure-based tool receives for one call.
#[derive(Clone)]
pub struct ToolInvocation {
    pub call_id: String,
    pub args: serde_json::Value,
    pub cancel: CancellationToken,
    pub on_update: Option<ToolUpdateCallback>,
}

impl ToolInvocation {
    /// Report progress if the caller is listening.
    pub fn update(&self, update: ToolUpdate) {
        if let Some(on_update) = &self.on_update {
            on_update(update);
        }
    }
}

/// Closure-based tool for quick tool creation.
pub struct FnTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    handler: Arc<ToolHandler>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, StrandError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |invocation| Box::pin(handler(invocation))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(
        &self,
        call_id: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateCallback>,
    ) -> Result<ToolOutput, StrandError> {
        (self.handler)(ToolInvocation {
            call_id: call_id.to_string(),
            args,
            cancel,
            on_update,
        })
        .await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
