use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use sqlbridge_core::error::FailureKind;
use sqlbridge_core::result::ToolResult;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{BoxFuture, ToolContext, ToolRegistry};

/// A tool call as it travels through the chain. Interceptors own it and may
/// rewrite it before forwarding; the handler only ever sees the arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

impl CallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Fault raised inside an interceptor. Ends the one request it happened in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("interceptor '{interceptor}' failed: {message}")]
    Interceptor {
        interceptor: &'static str,
        message: String,
    },
}

pub type ChainOutcome = Result<ToolResult, ChainError>;

/// Wraps every tool call. An implementation may forward the request as is,
/// rewrite it and forward, or answer without calling `next` at all.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_call_tool<'a>(&'a self, request: CallRequest, next: Next<'a>) -> BoxFuture<'a, ChainOutcome>;
}

/// Continuation over the rest of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Box<dyn Interceptor>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    pub fn run(self, request: CallRequest) -> BoxFuture<'a, ChainOutcome> {
        match self.rest.split_first() {
            Some((head, rest)) => head.on_call_tool(
                request,
                Next {
                    rest,
                    terminal: self.terminal,
                },
            ),
            None => {
                let terminal = self.terminal;
                Box::pin(async move { Ok(terminal.dispatch(request).await) })
            }
        }
    }
}

/// Last step: hand the arguments to the registered handler.
struct Terminal {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
}

impl Terminal {
    async fn dispatch(&self, request: CallRequest) -> ToolResult {
        match self.registry.lookup(&request.tool_name) {
            Some(tool) => tool.invoke(request.arguments, self.context.clone()).await,
            None => ToolResult::failure(
                FailureKind::UnknownTool,
                format!("Unknown tool '{}'", request.tool_name),
            ),
        }
    }
}

/// Collects interceptors in registration order. The first one added is the
/// outermost.
#[derive(Default)]
pub struct ChainBuilder {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    pub fn build(self, registry: Arc<ToolRegistry>, context: ToolContext) -> Pipeline {
        Pipeline {
            interceptors: self.interceptors.into_boxed_slice(),
            terminal: Terminal { registry, context },
        }
    }
}

/// The assembled chain. Built once; each call just walks the slice.
pub struct Pipeline {
    interceptors: Box<[Box<dyn Interceptor>]>,
    terminal: Terminal,
}

impl Pipeline {
    pub async fn call(&self, request: CallRequest) -> ChainOutcome {
        Next {
            rest: &self.interceptors,
            terminal: &self.terminal,
        }
        .run(request)
        .await
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.terminal.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.terminal.context
    }

    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

/// Logs one line per call with its outcome and latency.
pub struct CallTracing;

impl Interceptor for CallTracing {
    fn name(&self) -> &'static str {
        "call_tracing"
    }

    fn on_call_tool<'a>(&'a self, request: CallRequest, next: Next<'a>) -> BoxFuture<'a, ChainOutcome> {
        Box::pin(async move {
            let call_id = Uuid::now_v7();
            let tool = request.tool_name.clone();
            let argument_count = request.arguments.len();
            let started = Instant::now();

            tracing::debug!(
                event = "tool_call_started",
                call_id = %call_id,
                tool = %tool,
                argument_count,
                "Tool call started"
            );

            let outcome = next.run(request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                Ok(ToolResult::Success { .. }) => tracing::info!(
                    event = "tool_call_completed",
                    call_id = %call_id,
                    tool = %tool,
                    elapsed_ms,
                    "Tool call completed"
                ),
                Ok(ToolResult::Failure(failure)) => tracing::warn!(
                    event = "tool_call_failed",
                    call_id = %call_id,
                    tool = %tool,
                    error = failure.kind.code(),
                    message = %failure.message,
                    elapsed_ms,
                    "Tool call returned a failure"
                ),
                Err(err) => tracing::error!(
                    event = "tool_call_aborted",
                    call_id = %call_id,
                    tool = %tool,
                    error = %err,
                    elapsed_ms,
                    "Tool call aborted inside the middleware chain"
                ),
            }
            outcome
        })
    }
}
