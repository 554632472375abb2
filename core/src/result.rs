use serde_json::{Value, json};

use crate::error::{DriverError, FailureKind};

/// Outcome of a single tool call. Handlers never raise past their boundary:
/// every internal fault is folded into `Failure`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success {
        /// Structured payload (rows, descriptors, counts)
        payload: Value,
        /// Human/agent-readable rendering of the payload
        text: String,
    },
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn success(payload: Value, text: impl Into<String>) -> Self {
        ToolResult::Success {
            payload,
            text: text.into(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ToolResult::Failure(ToolFailure::new(kind, message))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ToolResult::Failure(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ToolResult::Success { .. } => None,
            ToolResult::Failure(failure) => Some(failure.kind),
        }
    }

    pub fn text(&self) -> String {
        match self {
            ToolResult::Success { text, .. } => text.clone(),
            ToolResult::Failure(failure) => failure.text(),
        }
    }

    /// Structured envelope returned next to the text content.
    pub fn to_envelope(&self, tool: &str) -> Value {
        match self {
            ToolResult::Success { payload, .. } => json!({
                "status": "success",
                "tool": tool,
                "data": payload
            }),
            ToolResult::Failure(failure) => json!({
                "status": "error",
                "tool": tool,
                "error": failure.to_value()
            }),
        }
    }
}

impl From<ToolFailure> for ToolResult {
    fn from(failure: ToolFailure) -> Self {
        ToolResult::Failure(failure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    /// The underlying fault's description, verbatim
    pub message: String,
    /// Optional tool-specific lead-in used when rendering text ("Query error")
    pub headline: Option<String>,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            headline: None,
        }
    }

    pub fn with_headline(mut self, headline: impl Into<String>) -> Self {
        self.headline = Some(headline.into());
        self
    }

    pub fn resource_unavailable(reason: impl AsRef<str>) -> Self {
        Self::new(FailureKind::ResourceUnavailable, reason.as_ref())
            .with_headline("Database connection is not available")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message).with_headline("Invalid arguments")
    }

    /// Classifies a driver fault. A closed connection means the resource went
    /// away underneath the call, everything else is an operation fault.
    pub fn from_driver(err: &DriverError) -> Self {
        if err.is_closed() {
            Self::resource_unavailable(err.to_string())
        } else {
            Self::new(FailureKind::OperationFault, err.to_string())
        }
    }

    pub fn text(&self) -> String {
        match &self.headline {
            Some(headline) => format!("{headline}: {}", self.message),
            None => self.message.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "error": self.kind.code(),
            "message": self.message
        })
    }
}
