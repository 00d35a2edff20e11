use std::time::Duration;
use thiserror::Error;

use crate::runner::OutputStream;

/// A request rejected before any screening or process work happened.
///
/// The message is meant to be shown to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Security violation: {}", violations.join("; "))]
    SecurityViolation { violations: Vec<String> },
    #[error("Execution timed out after {}ms", limit.as_millis())]
    Timeout { limit: Duration },
    #[error("Output limit exceeded on {stream} ({limit} bytes)")]
    OutputLimit { stream: OutputStream, limit: usize },
    #[error("Memory limit exceeded ({limit_mb} MB)")]
    MemoryLimit { limit_mb: u64 },
    #[error("Process execution failed: {message}: {source}")]
    Process {
        message: String,
        source: std::io::Error,
    },
    #[error("Failed to prepare execution workspace: {message}")]
    Workspace { message: String },
}

impl ExecutionError {
    pub fn is_security_violation(&self) -> bool {
        matches!(self, ExecutionError::SecurityViolation { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    pub fn is_memory_limit(&self) -> bool {
        matches!(self, ExecutionError::MemoryLimit { .. })
    }

    pub fn is_output_limit(&self) -> bool {
        matches!(self, ExecutionError::OutputLimit { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::SecurityViolation { .. } => "EXECUTION_SECURITY_VIOLATION",
            ExecutionError::Timeout { .. } => "EXECUTION_TIMEOUT",
            ExecutionError::OutputLimit { .. } => "EXECUTION_OUTPUT_LIMIT",
            ExecutionError::MemoryLimit { .. } => "EXECUTION_MEMORY_LIMIT",
            ExecutionError::Process { .. } => "EXECUTION_PROCESS_ERROR",
            ExecutionError::Workspace { .. } => "EXECUTION_WORKSPACE_ERROR",
        }
    }

    /// Message safe to hand back to an untrusted caller: no OS error detail.
    pub fn public_message(&self) -> String {
        match self {
            ExecutionError::Process { message, .. } => {
                format!("Process execution failed: {}", message)
            }
            ExecutionError::Workspace { .. } => "Failed to prepare execution workspace".to_string(),
            other => other.to_string(),
        }
    }
}

/// Everything [`crate::CodeExecutor::execute`] can fail with.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::Validation(_) => "VALIDATION_ERROR",
            ExecutorError::Execution(err) => err.code(),
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            ExecutorError::Validation(err) => err.message.clone(),
            ExecutorError::Execution(err) => err.public_message(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ExecutorError::Validation(_))
    }

    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            ExecutorError::Execution(err) => Some(err),
            ExecutorError::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_violation_lists_every_cause() {
        let err = ExecutionError::SecurityViolation {
            violations: vec!["Blocked pattern 'open('".into(), "Import of 'os'".into()],
        };
        assert!(err.is_security_violation());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Security violation: Blocked pattern 'open('; Import of 'os'"
        );
    }

    #[test]
    fn public_message_hides_os_cause() {
        let err = ExecutionError::Process {
            message: "failed to spawn interpreter".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "/opt/secret/python3"),
        };
        assert!(err.to_string().contains("/opt/secret/python3"));
        assert!(!err.public_message().contains("/opt/secret"));
        assert_eq!(err.code(), "EXECUTION_PROCESS_ERROR");
    }

    #[test]
    fn validation_message_is_verbatim() {
        let err: ExecutorError = ValidationError::new("exerciseId is required").into();
        assert!(err.is_validation());
        assert_eq!(err.public_message(), "exerciseId is required");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
