use std::collections::BTreeSet;
use std::sync::Arc;

use clap::ValueEnum;
use serde::Serialize;
use sqlbridge_core::error::FailureKind;
use sqlbridge_core::result::ToolResult;
use thiserror::Error;

use crate::middleware::{CallRequest, ChainOutcome, Interceptor, Next};
use crate::registry::{BoxFuture, SchemaError, ToolRegistry};

/// What to do when the declared parameters of a tool cannot be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentPolicy {
    /// Forward the request untouched
    #[default]
    FailOpen,
    /// Answer with an `argument_inspection_failed` result
    FailClosed,
}

#[derive(Debug, Error)]
enum InspectionError {
    #[error("tool '{0}' is not registered")]
    UnknownTool(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Drops every argument the target tool does not declare.
///
/// Dropped keys are not reported anywhere. Inspection faults are handled
/// according to the configured [`ArgumentPolicy`].
pub struct StripUnknownArguments {
    registry: Arc<ToolRegistry>,
    policy: ArgumentPolicy,
}

impl StripUnknownArguments {
    pub fn new(registry: Arc<ToolRegistry>, policy: ArgumentPolicy) -> Self {
        Self { registry, policy }
    }

    fn declared_arguments(&self, tool: &str) -> Result<BTreeSet<String>, InspectionError> {
        let schema = self
            .registry
            .schema_of(tool)
            .ok_or_else(|| InspectionError::UnknownTool(tool.to_string()))?;
        Ok(schema?)
    }
}

impl Interceptor for StripUnknownArguments {
    fn name(&self) -> &'static str {
        "strip_unknown_arguments"
    }

    fn on_call_tool<'a>(&'a self, mut request: CallRequest, next: Next<'a>) -> BoxFuture<'a, ChainOutcome> {
        if request.arguments.is_empty() {
            return next.run(request);
        }

        match self.declared_arguments(&request.tool_name) {
            Ok(declared) => {
                request.arguments.retain(|key, _| declared.contains(key));
                next.run(request)
            }
            Err(err) => match self.policy {
                ArgumentPolicy::FailOpen => next.run(request),
                ArgumentPolicy::FailClosed => {
                    let message = err.to_string();
                    Box::pin(async move {
                        Ok(ToolResult::failure(FailureKind::ArgumentInspection, message))
                    })
                }
            },
        }
    }
}
