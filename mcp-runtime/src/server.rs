use std::sync::Arc;

use serde_json::{Map, Value, json};
use sqlbridge_core::connection::{ConnectParams, ConnectionProvider};
use sqlbridge_core::result::ToolResult;
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::middleware::{CallRequest, CallTracing, ChainBuilder, ChainError, Pipeline};
use crate::offload::BlockingPool;
use crate::registry::{ToolContext, ToolRegistry};
use crate::resource::{LifecyclePhase, ResourceContext};
use crate::rpc::{
    FrameError, RpcError, error_response, parse_message, read_frame, success_response, write_framed_json,
};
use crate::strip::{ArgumentPolicy, StripUnknownArguments};
use crate::tools::register_database_tools;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "sqlbridge-mcp";

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub connect: ConnectParams,
    pub argument_policy: ArgumentPolicy,
    /// Upper bound on concurrently running blocking operations
    pub max_blocking_workers: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to read MCP frame: {0}")]
    Read(#[source] FrameError),
    #[error("Failed to write MCP response: {0}")]
    Write(#[source] std::io::Error),
    #[error("MCP writer task stopped unexpectedly: {0}")]
    Writer(String),
}

/// JSON-RPC front of the tool pipeline. One instance per process; transports
/// share it behind an `Arc`.
pub struct McpServer {
    pipeline: Pipeline,
    policy: ArgumentPolicy,
    session_id: String,
}

impl McpServer {
    /// Acquires the database resource and assembles the standard chain.
    /// Never fails: a connection fault leaves the server running degraded.
    pub async fn start(config: ServerConfig, provider: Arc<dyn ConnectionProvider>) -> Self {
        let pool = BlockingPool::new(config.max_blocking_workers);
        let resource = ResourceContext::acquire(provider, config.connect, &pool).await;

        let mut registry = ToolRegistry::new();
        register_database_tools(&mut registry);

        Self::assemble(registry, ToolContext { resource, pool }, config.argument_policy)
    }

    /// Tracing first, so logged latency includes argument stripping.
    pub fn assemble(registry: ToolRegistry, context: ToolContext, policy: ArgumentPolicy) -> Self {
        let registry = Arc::new(registry);
        let pipeline = ChainBuilder::new()
            .with(CallTracing)
            .with(StripUnknownArguments::new(registry.clone(), policy))
            .build(registry, context);
        Self::with_pipeline(pipeline, policy)
    }

    pub fn with_pipeline(pipeline: Pipeline, policy: ArgumentPolicy) -> Self {
        let session_id = format!("session-{}", Uuid::now_v7());
        tracing::info!(
            event = "mcp_server_ready",
            session_id = %session_id,
            tools = pipeline.registry().len(),
            interceptors = ?pipeline.interceptor_names(),
            argument_policy = ?policy,
            resource_phase = ?pipeline.context().resource.phase(),
            "MCP server assembled"
        );
        Self {
            pipeline,
            policy,
            session_id,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.pipeline.context().resource.phase()
    }

    pub fn status(&self) -> Value {
        let context = self.pipeline.context();
        json!({
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "session_id": self.session_id,
            "resource": context.resource.status(),
            "pool": context.pool.snapshot(),
            "interceptors": self.pipeline.interceptor_names(),
            "argument_policy": self.policy,
            "tools": self.pipeline.registry().len(),
        })
    }

    /// Startup report: `ready` when the connection is live, `degraded`
    /// otherwise.
    pub fn diagnose(&self) -> Value {
        let status = match self.phase() {
            LifecyclePhase::Ready => "ready",
            _ => "degraded",
        };
        let mut report = self.status();
        report["status"] = Value::String(status.to_string());
        report
    }

    /// Releases the shared resource. Later tool calls fail as unavailable.
    pub async fn shutdown(&self) {
        let context = self.pipeline.context();
        context.resource.release(&context.pool).await;
    }

    pub async fn serve_stdio(self: Arc<Self>) -> Result<(), ServeError> {
        let reader = BufReader::new(io::stdin());
        self.serve(reader, io::stdout()).await
    }

    /// Reads framed messages until EOF. Each message is handled on its own
    /// task, so a slow tool call does not hold up the ones behind it;
    /// responses go out through a single writer in completion order.
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, mut writer: W) -> Result<(), ServeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                write_framed_json(&mut writer, &response).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut in_flight = JoinSet::new();
        let read_result = loop {
            let body = match read_frame(&mut reader).await {
                Ok(Some(body)) => body,
                Ok(None) => break Ok(()),
                Err(err) => break Err(ServeError::Read(err)),
            };
            // The frame was consumed whole, so the stream is still aligned.
            let incoming = match parse_message(&body) {
                Ok(incoming) => incoming,
                Err(err) => {
                    tracing::warn!(
                        event = "mcp_parse_error",
                        bytes = body.len(),
                        "Discarding unparseable frame"
                    );
                    let _ = tx.send(error_response(Value::Null, err));
                    continue;
                }
            };

            let server = self.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                for response in server.handle_incoming_message(incoming).await {
                    // Only fails once the writer is gone; nothing left to tell.
                    let _ = tx.send(response);
                }
            });

            while let Some(finished) = in_flight.try_join_next() {
                log_task_outcome(finished);
            }
        };

        while let Some(finished) = in_flight.join_next().await {
            log_task_outcome(finished);
        }
        drop(tx);

        let write_result = match writer_task.await {
            Ok(result) => result.map_err(ServeError::Write),
            Err(err) => Err(ServeError::Writer(err.to_string())),
        };
        read_result.and(write_result)
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never sends requests of its own.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            tracing::debug!(event = "mcp_notification", method, "Notification ignored");
            None
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let mut instructions = String::from(
            "Use list_tables and describe_table to explore the schema, query_sql for reads and execute_nonquery for writes. Writes are committed on success and rolled back on failure.",
        );
        if self.phase() != LifecyclePhase::Ready {
            instructions
                .push_str(" The database connection is currently unavailable; tool calls will fail until the server is restarted.");
        }
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = self
            .pipeline
            .registry()
            .definitions()
            .iter()
            .map(|tool| tool.to_listing())
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        match self.pipeline.call(CallRequest::new(name, args)).await {
            Ok(result) => Ok(build_tool_call_response(name, &result)),
            Err(err) => {
                let ChainError::Interceptor { interceptor, .. } = &err;
                Err(RpcError::internal(err.to_string()).with_data(json!({
                    "tool": name,
                    "interceptor": interceptor
                })))
            }
        }
    }
}

fn build_tool_call_response(tool_name: &str, result: &ToolResult) -> Value {
    let envelope = result.to_envelope(tool_name);
    let text = result.text();

    if result.is_failure() {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn log_task_outcome(finished: Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        tracing::error!(
            event = "mcp_message_task_failed",
            error = %err,
            "Message handler task ended abnormally"
        );
    }
}
