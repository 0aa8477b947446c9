/// Typed error taxonomy for node execution
///
/// Node-level failures never cross node boundaries as Rust errors; the
/// traversal engine captures them into the node's result. These enums give
/// the executors a precise vocabulary before that flattening happens.

use thiserror::Error;

/// Failures produced by the script node executor
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The node's attributes did not yield a usable function id
    #[error("missing function id in node data")]
    MissingFunctionId,

    /// No stored function (or no code) for the resolved id
    #[error("function with ID {0} not found or has no code")]
    FunctionNotFound(i64),

    /// Static pre-check matched a denylisted substring
    #[error("potentially unsafe code pattern detected: {0}")]
    Denylisted(String),

    /// The script exceeded its wall-clock budget
    #[error("function execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: i64 },

    /// The Lua VM reported a runtime or load error
    #[error("error in Lua function: {0}")]
    Runtime(String),
}

impl ScriptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScriptError::Timeout { .. })
    }
}

/// Failures produced by the integration node executor
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// The node's attributes did not yield a usable integration id
    #[error("missing integration id in node data")]
    MissingIntegrationId,

    /// No stored integration for the resolved id
    #[error("integration with ID {0} not found")]
    IntegrationNotFound(i64),

    /// Unknown transport kind or a missing required config field
    #[error("invalid integration configuration: {0}")]
    ConfigInvalid(String),

    /// Network-level failure: transport error, timeout, or non-2xx response
    #[error("{0}")]
    Transport(String),
}
