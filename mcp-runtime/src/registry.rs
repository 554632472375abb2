use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use sqlbridge_core::result::ToolResult;
use thiserror::Error;

use crate::offload::BlockingPool;
use crate::resource::ResourceContext;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Handler = Arc<dyn Fn(Map<String, Value>, ToolContext) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// What every handler gets besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub resource: Arc<ResourceContext>,
    pub pool: BlockingPool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("input schema of tool '{tool}' must be a JSON object")]
    NotAnObject { tool: String },
    #[error("'properties' in the input schema of tool '{tool}' must be an object")]
    PropertiesNotAnObject { tool: String },
}

pub struct ToolDefinition {
    name: String,
    description: String,
    input_schema: Value,
    handler: Handler,
}

impl ToolDefinition {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(
                move |args: Map<String, Value>, ctx: ToolContext| -> BoxFuture<'static, ToolResult> {
                    Box::pin(handler(args, ctx))
                },
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Keys of `input_schema.properties`. A schema without `properties`
    /// declares no parameters.
    pub fn declared_parameters(&self) -> Result<BTreeSet<String>, SchemaError> {
        let schema = self
            .input_schema
            .as_object()
            .ok_or_else(|| SchemaError::NotAnObject {
                tool: self.name.clone(),
            })?;
        match schema.get("properties") {
            None | Some(Value::Null) => Ok(BTreeSet::new()),
            Some(Value::Object(properties)) => Ok(properties.keys().cloned().collect()),
            Some(_) => Err(SchemaError::PropertiesNotAnObject {
                tool: self.name.clone(),
            }),
        }
    }

    pub fn invoke(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'static, ToolResult> {
        (self.handler)(args, ctx)
    }

    pub fn to_listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

/// Tools by name. Registering an existing name replaces the earlier
/// definition.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the definition that was replaced, if any.
    pub fn register(&mut self, definition: ToolDefinition) -> Option<Arc<ToolDefinition>> {
        self.tools
            .insert(definition.name.clone(), Arc::new(definition))
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    /// `None` when the tool is unknown.
    pub fn schema_of(&self, name: &str) -> Option<Result<BTreeSet<String>, SchemaError>> {
        self.tools.get(name).map(|tool| tool.declared_parameters())
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<Arc<ToolDefinition>> {
        let mut definitions: Vec<_> = self.tools.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
