use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, ExecutorError};
use crate::interpreter::{EnvironmentInfo, ExecutionResult, ResultInterpreter};
use crate::metrics::{Metrics, MetricsAggregator};
use crate::registry::ExecutionRegistry;
use crate::request::{ExecutionRequest, RequestValidator};
use crate::runner::{ProcessRunner, ProcessSpec};
use crate::screener::SecurityScreener;
use crate::workspace::ExecutionWorkspace;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const UNKNOWN_VERSION: &str = "unknown";

/// What a failed attempt still contributes to the metrics.
#[derive(Debug, Default)]
struct AttemptStats {
    run_time: Option<Duration>,
    peak_memory_bytes: u64,
}

/// Entry point for running untrusted code.
///
/// Each instance owns its registry and metrics; two executors never share
/// process handles or counters.
#[derive(Debug)]
pub struct CodeExecutor {
    config: Arc<ExecutorConfig>,
    validator: RequestValidator,
    screener: SecurityScreener,
    interpreter: ResultInterpreter,
    runner: ProcessRunner,
    registry: ExecutionRegistry,
    metrics: Arc<MetricsAggregator>,
    runtime_version: OnceCell<String>,
}

impl CodeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let registry = ExecutionRegistry::new();
        let metrics = Arc::new(MetricsAggregator::new());
        let runner = ProcessRunner::new(
            registry.clone(),
            Arc::clone(&metrics),
            config.max_output_length,
            config.memory_sample_interval,
        );

        Self {
            validator: RequestValidator::new(&config),
            screener: SecurityScreener::from_config(&config),
            interpreter: ResultInterpreter::new(config.max_output_length),
            runner,
            registry,
            metrics,
            runtime_version: OnceCell::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Validate, screen, run and classify one request.
    ///
    /// Every call counts as one attempt in the metrics, whichever stage it
    /// fails at. Attempts that reached the interpreter are recorded with the
    /// process run time, the same figure reported as `executionTime`.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        let execution_id = Uuid::new_v4().to_string();
        let environment = self.environment().await;
        info!(
            execution = %execution_id,
            exercise = %request.exercise_id,
            run_tests = request.run_tests,
            "execution started"
        );

        let started = Instant::now();
        let mut attempt = AttemptStats::default();
        let result = self
            .run_pipeline(&execution_id, request, environment, &mut attempt)
            .await;

        match &result {
            Ok(outcome) => {
                let duration = Duration::from_millis(outcome.execution_time_ms);
                self.metrics
                    .record_attempt(outcome.success, duration, outcome.memory_used_bytes);
                info!(
                    execution = %execution_id,
                    exercise = %request.exercise_id,
                    success = outcome.success,
                    duration_ms = outcome.execution_time_ms,
                    "execution finished"
                );
            }
            Err(err) => {
                // no run time means nothing was spawned; count the checks instead
                let duration = attempt.run_time.unwrap_or_else(|| started.elapsed());
                self.metrics
                    .record_attempt(false, duration, attempt.peak_memory_bytes);
                info!(
                    execution = %execution_id,
                    exercise = %request.exercise_id,
                    code = err.code(),
                    duration_ms = duration.as_millis() as u64,
                    "execution failed"
                );
            }
        }

        result
    }

    async fn run_pipeline(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
        environment: EnvironmentInfo,
        attempt: &mut AttemptStats,
    ) -> Result<ExecutionResult, ExecutorError> {
        let limits = self.validator.validate(request)?;

        let test_code = request.effective_test_code();
        let mut violations = self.screener.scan(&request.code);
        if let Some(tests) = test_code {
            violations.extend(self.screener.scan(tests));
        }
        if !violations.is_empty() {
            self.metrics.record_security_violation();
            warn!(execution = %execution_id, ?violations, "code rejected by security screening");
            return Err(ExecutionError::SecurityViolation { violations }.into());
        }

        let workspace = ExecutionWorkspace::prepare(
            &self.config.workspace_root(),
            execution_id,
            &request.code,
            test_code,
        )?;
        let spec = ProcessSpec::interpreter(&self.config, workspace.path(), workspace.target(), &limits);

        let outcome = self.runner.run(execution_id, &spec, limits.timeout).await?;
        attempt.run_time = Some(outcome.duration);
        attempt.peak_memory_bytes = outcome.peak_memory_bytes;
        drop(workspace);

        let result = self
            .interpreter
            .interpret(&outcome, &limits, request.run_tests, environment)?;
        Ok(result)
    }

    /// Describes the runtime executions run under. The interpreter version is probed once.
    pub async fn environment(&self) -> EnvironmentInfo {
        let runtime_version = self
            .runtime_version
            .get_or_init(|| probe_runtime_version(&self.config.interpreter_path))
            .await
            .clone();

        EnvironmentInfo {
            runtime_version,
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            sandboxed: self.config.sandbox_enabled,
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    pub fn active_executions(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Terminate everything still running and empty the registry.
    pub async fn shutdown(&self) {
        info!(active = self.registry.len(), "shutting down executor");
        self.registry.shutdown(self.config.shutdown_grace).await;
    }
}

async fn probe_runtime_version(interpreter: &str) -> String {
    let probe = Command::new(interpreter)
        .arg("--version")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => {
            // older interpreters print the version on stderr
            let text = if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            let version = String::from_utf8_lossy(&text).trim().to_string();
            if version.is_empty() {
                UNKNOWN_VERSION.to_string()
            } else {
                version
            }
        }
        Ok(Err(err)) => {
            debug!(interpreter, error = %err, "runtime version probe failed");
            UNKNOWN_VERSION.to_string()
        }
        Err(_) => {
            debug!(interpreter, "runtime version probe timed out");
            UNKNOWN_VERSION.to_string()
        }
    }
}
