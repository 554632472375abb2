use serde::Serialize;
use thiserror::Error;

/// Fault raised by a database driver.
///
/// The `Display` output is the driver's own message, unmodified. Tool results
/// carry it verbatim so callers see exactly what the database reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Opening the connection failed (bad path, refused handshake, ...)
    #[error("{0}")]
    Connect(String),
    /// A statement failed to prepare or execute
    #[error("{0}")]
    Statement(String),
    /// Commit or rollback failed
    #[error("{0}")]
    Transaction(String),
    /// The connection was already released
    #[error("connection is closed")]
    Closed,
}

impl DriverError {
    pub fn is_closed(&self) -> bool {
        matches!(self, DriverError::Closed)
    }
}

/// Failure classes a tool call can end in. Serialized as the matching
/// machine-readable code from [`codes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The shared resource was never acquired or has been closed
    #[serde(rename = "resource_unavailable")]
    ResourceUnavailable,
    /// The database rejected the statement (syntax, constraints, ...)
    #[serde(rename = "operation_failed")]
    OperationFault,
    /// A declared argument had the wrong shape
    #[serde(rename = "validation_failed")]
    InvalidArguments,
    /// No tool is registered under the requested name
    #[serde(rename = "unknown_tool")]
    UnknownTool,
    /// The blocking worker died before producing a result
    #[serde(rename = "worker_failed")]
    WorkerFault,
    /// Argument inspection could not complete under a fail-closed policy
    #[serde(rename = "argument_inspection_failed")]
    ArgumentInspection,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::ResourceUnavailable => codes::RESOURCE_UNAVAILABLE,
            FailureKind::OperationFault => codes::OPERATION_FAILED,
            FailureKind::InvalidArguments => codes::VALIDATION_FAILED,
            FailureKind::UnknownTool => codes::UNKNOWN_TOOL,
            FailureKind::WorkerFault => codes::WORKER_FAILED,
            FailureKind::ArgumentInspection => codes::ARGUMENT_INSPECTION_FAILED,
        }
    }
}

/// Error codes used across the tool surface
pub mod codes {
    pub const RESOURCE_UNAVAILABLE: &str = "resource_unavailable";
    pub const OPERATION_FAILED: &str = "operation_failed";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const WORKER_FAILED: &str = "worker_failed";
    pub const ARGUMENT_INSPECTION_FAILED: &str = "argument_inspection_failed";
}
