//! Error types for the probe engine

use thiserror::Error;

/// Main error type for probe engine operations
#[derive(Debug, Error, Clone, serde::Serialize, serde::Deserialize)]
pub enum EngineError {
    #[error("Invalid payload configuration: {reason}")]
    InvalidPayloadConfig { reason: String },

    #[error("Request compilation failed: {reason}")]
    CompileFailed { reason: String },

    #[error("Reserved argument misuse: {argument} - {reason}")]
    ReservedArgument { argument: String, reason: String },

    #[error("Operator compilation failed: {reason}")]
    OperatorCompileFailed { reason: String },

    #[error("Payload generation failed: {reason}")]
    PayloadGenerationFailed { reason: String },

    #[error("Probe execution failed: {error}")]
    ExecutionFailed { error: String },

    #[error("Target resolution failed: {input} - {reason}")]
    TargetResolutionFailed { input: String, reason: String },

    #[error("Init script capability misuse: {reason}")]
    InitCapability { reason: String },
}

impl EngineError {
    /// Create a compile error with a reason
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::CompileFailed {
            reason: reason.into(),
        }
    }

    /// Create a reserved argument error
    pub fn reserved_argument(argument: &str, reason: &str) -> Self {
        Self::ReservedArgument {
            argument: argument.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a payload configuration error
    pub fn payload_config(reason: impl Into<String>) -> Self {
        Self::InvalidPayloadConfig {
            reason: reason.into(),
        }
    }

    /// Create a probe execution error
    pub fn execution(error: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            error: error.into(),
        }
    }

    /// Check whether the error halts the whole request before any probe is
    /// issued, as opposed to being recoverable per probe.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            EngineError::CompileFailed { .. }
                | EngineError::ReservedArgument { .. }
                | EngineError::OperatorCompileFailed { .. }
                | EngineError::InvalidPayloadConfig { .. }
                | EngineError::PayloadGenerationFailed { .. }
        )
    }
}

/// Result type alias for probe engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::reserved_argument("Port", "cannot contain expressions");
        assert!(err.to_string().contains("Port"));
        assert!(err.to_string().contains("cannot contain expressions"));
    }

    #[test]
    fn test_compile_error_classification() {
        assert!(EngineError::compile("bad operators").is_compile_error());
        assert!(EngineError::payload_config("empty list").is_compile_error());
        assert!(!EngineError::execution("connection refused").is_compile_error());
    }
}
