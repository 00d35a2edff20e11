use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ExecutorConfig;
use crate::error::ValidationError;

static EXERCISE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("exercise id pattern"));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    pub exercise_id: String,
    #[serde(default)]
    pub run_tests: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_code: Option<String>,
    /// Milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Megabytes.
    #[serde(default, rename = "memoryLimit", skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, exercise_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            exercise_id: exercise_id.into(),
            ..Default::default()
        }
    }

    pub fn with_tests(mut self, test_code: impl Into<String>) -> Self {
        self.run_tests = true;
        self.test_code = Some(test_code.into());
        self
    }

    /// Test code only matters when tests were asked for.
    pub fn effective_test_code(&self) -> Option<&str> {
        if self.run_tests {
            self.test_code.as_deref()
        } else {
            None
        }
    }
}

/// Limits a validated request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_limit_mb: u64,
}

impl ExecutionLimits {
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Shape and bounds checks; no side effects.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_code_length: usize,
    default_timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
    default_memory_mb: u64,
    min_memory_mb: u64,
    max_memory_mb: u64,
}

impl RequestValidator {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            max_code_length: config.max_code_length,
            default_timeout: config.timeout,
            min_timeout: config.min_timeout,
            max_timeout: config.max_timeout,
            default_memory_mb: config.memory_limit_mb,
            min_memory_mb: config.min_memory_limit_mb,
            max_memory_mb: config.max_memory_limit_mb,
        }
    }

    pub fn validate(&self, request: &ExecutionRequest) -> Result<ExecutionLimits, ValidationError> {
        if request.code.trim().is_empty() {
            return Err(ValidationError::new("code is required"));
        }
        if request.exercise_id.is_empty() {
            return Err(ValidationError::new("exerciseId is required"));
        }
        if !EXERCISE_ID.is_match(&request.exercise_id) {
            return Err(ValidationError::new(
                "exerciseId may only contain letters, digits, '_' and '-'",
            ));
        }

        let code_len = request.code.chars().count();
        if code_len > self.max_code_length {
            return Err(ValidationError::new(format!(
                "code exceeds maximum length of {} characters (got {})",
                self.max_code_length, code_len
            )));
        }

        if let Some(test_code) = &request.test_code {
            let test_len = test_code.chars().count();
            if test_len > self.max_code_length {
                return Err(ValidationError::new(format!(
                    "testCode exceeds maximum length of {} characters (got {})",
                    self.max_code_length, test_len
                )));
            }
        }

        let timeout = match request.timeout_ms {
            Some(ms) => {
                let requested = Duration::from_millis(ms);
                if requested < self.min_timeout || requested > self.max_timeout {
                    return Err(ValidationError::new(format!(
                        "timeout must be between {} and {} ms",
                        self.min_timeout.as_millis(),
                        self.max_timeout.as_millis()
                    )));
                }
                requested
            }
            None => self.default_timeout,
        };

        let memory_limit_mb = match request.memory_limit_mb {
            Some(mb) => {
                if mb < self.min_memory_mb || mb > self.max_memory_mb {
                    return Err(ValidationError::new(format!(
                        "memoryLimit must be between {} and {} MB",
                        self.min_memory_mb, self.max_memory_mb
                    )));
                }
                mb
            }
            None => self.default_memory_mb,
        };

        Ok(ExecutionLimits {
            timeout,
            memory_limit_mb,
        })
    }
}
