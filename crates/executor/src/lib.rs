//! Sandboxed execution of untrusted code submissions.
//!
//! A request is validated, screened, written to a scratch directory and run
//! by an interpreter subprocess under time, memory and output bounds. The
//! raw outcome is classified into an [`ExecutionResult`] or a typed error.

pub mod config;
pub mod error;
pub mod executor;
pub mod interpreter;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod runner;
pub mod screener;
pub mod workspace;

pub use config::ExecutorConfig;
pub use error::{ExecutionError, ExecutorError, ValidationError};
pub use executor::CodeExecutor;
pub use interpreter::{EnvironmentInfo, ExecutionResult, ResultInterpreter, TestCase, TestResult};
pub use metrics::{Metrics, MetricsAggregator};
pub use registry::{ExecutionHandle, ExecutionRegistry};
pub use request::{ExecutionLimits, ExecutionRequest, RequestValidator};
pub use runner::{OutputStream, ProcessOutcome, ProcessRunner, ProcessSpec};
pub use screener::SecurityScreener;
