//! Error types for the sandbox crate.
//!
//! These cover the sandbox's own machinery. A candidate that fails to parse,
//! trips the denylist or throws while rendering is not an error here; it is
//! reported as [`ExecutionResult::Failed`](crate::ExecutionResult::Failed).

use thiserror::Error;

/// Sandbox error type
#[derive(Error, Debug)]
pub enum SandboxError {
    /// JavaScript engine could not be created or primed
    #[error("engine error: {0}")]
    EngineError(String),

    /// Nested context could not be spawned or has gone away
    #[error("nested context error: {0}")]
    FrameError(String),

    /// Message channel failure between host and nested context
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Sandbox attribute or CSP combination that would break isolation
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Component name is not a plain JavaScript identifier
    #[error("invalid component name: {0:?}")]
    InvalidComponentName(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tier cannot be constructed in the current environment
    #[error("tier {0:?} not supported: {1}")]
    UnsupportedTier(super::Tier, String),
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
