//! Turns a finished process into an [`ExecutionResult`] or a classified error.
//!
//! Test parsing is deliberately coarse text matching over the captured
//! streams. There is no structured test protocol between the harness and
//! this module.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ExecutionError;
use crate::request::ExecutionLimits;
use crate::runner::{ExecutionState, ProcessOutcome};

/// Printed by the test harness once every test statement ran.
pub const TEST_SUCCESS_MARKER: &str = "All tests passed!";
pub const ASSERTION_MARKER: &str = "AssertionError";
const MEMORY_ERROR_MARKER: &str = "MemoryError";

const ALL_TESTS_CASE: &str = "All tests";
const ASSERTION_FALLBACK: &str = "Test assertion failed";
const GENERIC_CASE: &str = "Test execution";

static ASSERTION_MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"AssertionError: (.+)").expect("assertion pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub runtime_version: String,
    pub platform: String,
    pub sandboxed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub execution_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub passed: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(rename = "memoryUsed")]
    pub memory_used_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
    pub environment: EnvironmentInfo,
}

#[derive(Debug, Clone)]
pub struct ResultInterpreter {
    max_output_length: usize,
}

impl ResultInterpreter {
    pub fn new(max_output_length: usize) -> Self {
        Self { max_output_length }
    }

    pub fn interpret(
        &self,
        outcome: &ProcessOutcome,
        limits: &ExecutionLimits,
        tests_requested: bool,
        environment: EnvironmentInfo,
    ) -> Result<ExecutionResult, ExecutionError> {
        match outcome.state {
            ExecutionState::Completed => {}
            ExecutionState::TimedOut => {
                return Err(ExecutionError::Timeout {
                    limit: limits.timeout,
                })
            }
            ExecutionState::OutputLimitKilled(stream) => {
                return Err(ExecutionError::OutputLimit {
                    stream,
                    limit: self.max_output_length,
                })
            }
            state => {
                return Err(ExecutionError::Process {
                    message: format!("process ended in unexpected state {:?}", state),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no exit status"),
                })
            }
        }

        let clean_exit = outcome.exited_cleanly();
        if !clean_exit && outcome.stderr.contains(MEMORY_ERROR_MARKER) {
            return Err(ExecutionError::MemoryLimit {
                limit_mb: limits.memory_limit_mb,
            });
        }

        let test_result = tests_requested
            .then(|| parse_test_output(&outcome.stdout, &outcome.stderr, outcome.duration));
        let tests_passed = test_result.as_ref().map_or(true, |result| result.passed);

        Ok(ExecutionResult {
            success: clean_exit && tests_passed,
            output: outcome.stdout.trim_end().to_string(),
            errors: non_empty(&outcome.stderr),
            execution_time_ms: outcome.duration.as_millis() as u64,
            memory_used_bytes: outcome.peak_memory_bytes,
            test_result,
            environment,
        })
    }
}

/// Three tiers, first match wins: success marker on stdout, assertion
/// failure on stderr, then pass/fail by whether stderr is empty.
pub fn parse_test_output(stdout: &str, stderr: &str, duration: Duration) -> TestResult {
    let execution_time = duration.as_millis() as u64;
    let errors = non_empty(stderr);

    let (passed, case) = if stdout.contains(TEST_SUCCESS_MARKER) {
        (
            true,
            TestCase {
                name: ALL_TESTS_CASE.to_string(),
                passed: true,
                error: None,
                execution_time,
            },
        )
    } else if stderr.contains(ASSERTION_MARKER) {
        let message = ASSERTION_MESSAGE
            .captures(stderr)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| ASSERTION_FALLBACK.to_string());
        (
            false,
            TestCase {
                name: message.clone(),
                passed: false,
                error: Some(message),
                execution_time,
            },
        )
    } else {
        let passed = errors.is_none();
        (
            passed,
            TestCase {
                name: GENERIC_CASE.to_string(),
                passed,
                error: errors.clone(),
                execution_time,
            },
        )
    };

    TestResult {
        passed,
        output: stdout.trim_end().to_string(),
        errors,
        tests: vec![case],
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::OutputStream;

    fn environment() -> EnvironmentInfo {
        EnvironmentInfo {
            runtime_version: "Python 3.11.4".into(),
            platform: "linux-x86_64".into(),
            sandboxed: true,
        }
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_millis(1500),
            memory_limit_mb: 128,
        }
    }

    fn completed(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            state: ExecutionState::Completed,
            exit_code: Some(exit_code),
            signal: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            peak_memory_bytes: 4 * 1024 * 1024,
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn clean_exit_is_success() {
        let result = ResultInterpreter::new(1024)
            .interpret(&completed(0, "Hello, World!\n", ""), &limits(), false, environment())
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, "Hello, World!");
        assert_eq!(result.errors, None);
        assert_eq!(result.execution_time_ms, 42);
        assert_eq!(result.memory_used_bytes, 4 * 1024 * 1024);
        assert!(result.test_result.is_none());
    }

    #[test]
    fn nonzero_exit_is_a_failed_result_not_an_error() {
        let stderr = "Traceback (most recent call last):\n  File \"solution.py\", line 1\nZeroDivisionError: division by zero\n";
        let result = ResultInterpreter::new(1024)
            .interpret(&completed(1, "", stderr), &limits(), false, environment())
            .unwrap();

        assert!(!result.success);
        assert!(result.errors.unwrap().contains("ZeroDivisionError"));
    }

    #[test]
    fn killed_by_signal_is_failure() {
        let mut outcome = completed(0, "partial", "");
        outcome.exit_code = None;
        outcome.signal = Some(15);
        let result = ResultInterpreter::new(1024)
            .interpret(&outcome, &limits(), false, environment())
            .unwrap();
        assert!(!result.success);
    }

    #[test]
    fn terminal_kills_become_errors() {
        let interpreter = ResultInterpreter::new(2048);

        let mut timed_out = completed(0, "", "");
        timed_out.state = ExecutionState::TimedOut;
        let err = interpreter.interpret(&timed_out, &limits(), false, environment()).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Execution timed out after 1500ms");

        let mut flooded = completed(0, "", "");
        flooded.state = ExecutionState::OutputLimitKilled(OutputStream::Stderr);
        let err = interpreter.interpret(&flooded, &limits(), false, environment()).unwrap_err();
        assert!(err.is_output_limit());
        assert_eq!(err.to_string(), "Output limit exceeded on stderr (2048 bytes)");
    }

    #[test]
    fn memory_error_maps_to_memory_limit() {
        let outcome = completed(1, "", "Traceback ...\nMemoryError\n");
        let err = ResultInterpreter::new(1024)
            .interpret(&outcome, &limits(), false, environment())
            .unwrap_err();
        assert!(err.is_memory_limit());
    }

    #[test]
    fn memory_error_text_in_a_clean_run_is_ignored() {
        let outcome = completed(0, "", "warning: MemoryError handled\n");
        let result = ResultInterpreter::new(1024)
            .interpret(&outcome, &limits(), false, environment())
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn success_marker_passes_all_tests() {
        let parsed = parse_test_output("5\nAll tests passed!\n", "", Duration::from_millis(7));
        assert!(parsed.passed);
        assert_eq!(parsed.tests.len(), 1);
        assert_eq!(parsed.tests[0].name, "All tests");
        assert_eq!(parsed.tests[0].execution_time, 7);
    }

    #[test]
    fn assertion_message_names_the_failing_case() {
        let stderr = "Traceback (most recent call last):\n  File \"test_solution.py\", line 3\nAssertionError: expected 5 got -1\n";
        let parsed = parse_test_output("", stderr, Duration::ZERO);
        assert!(!parsed.passed);
        assert_eq!(parsed.tests[0].name, "expected 5 got -1");
        assert_eq!(parsed.tests[0].error.as_deref(), Some("expected 5 got -1"));
    }

    #[test]
    fn bare_assertion_uses_fallback_name() {
        let parsed = parse_test_output("", "Traceback ...\nAssertionError\n", Duration::ZERO);
        assert!(!parsed.passed);
        assert_eq!(parsed.tests[0].name, "Test assertion failed");
    }

    #[test]
    fn generic_case_mirrors_error_text() {
        let clean = parse_test_output("ok\n", "", Duration::ZERO);
        assert!(clean.passed);
        assert_eq!(clean.tests[0].name, "Test execution");

        let noisy = parse_test_output("ok\n", "NameError: name 'x' is not defined\n", Duration::ZERO);
        assert!(!noisy.passed);
        assert!(noisy.tests[0].error.as_deref().unwrap().contains("NameError"));
    }

    #[test]
    fn failed_tests_fail_the_result_even_on_clean_exit() {
        // stderr noise without the marker on a zero exit
        let outcome = completed(0, "", "DeprecationWarning: something\n");
        let result = ResultInterpreter::new(1024)
            .interpret(&outcome, &limits(), true, environment())
            .unwrap();
        assert!(!result.success);
        assert!(!result.test_result.unwrap().passed);
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let result = ResultInterpreter::new(1024)
            .interpret(&completed(0, "hi\n", ""), &limits(), true, environment())
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["executionTime"], 42);
        assert_eq!(json["memoryUsed"], 4 * 1024 * 1024);
        assert_eq!(json["environment"]["runtimeVersion"], "Python 3.11.4");
        assert_eq!(json["testResult"]["tests"][0]["name"], "Test execution");
        assert!(json.get("errors").is_none());
    }
}
