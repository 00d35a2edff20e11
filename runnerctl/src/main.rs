use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use executor::{CodeExecutor, ExecutionRequest, ExecutorConfig, ExecutorError, SecurityScreener};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_FAILURE: i32 = 1;
const EXIT_INVALID: i32 = 2;

#[derive(Parser)]
#[command(name = "runnerctl", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a code file once and print the result as JSON
    Run {
        /// Path to the code file
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value = "cli")]
        exercise_id: String,
        /// Test code to run against the file
        #[arg(long, value_name = "FILE")]
        tests: Option<PathBuf>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        memory_mb: Option<u64>,
        /// JSON configuration file; EXECUTOR_* variables are used otherwise
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Screen a code file without running it
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run {
            file,
            exercise_id,
            tests,
            timeout_ms,
            memory_mb,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let mut request = ExecutionRequest::new(read_source(&file)?, exercise_id);
            if let Some(tests) = tests {
                request = request.with_tests(read_source(&tests)?);
            }
            request.timeout_ms = timeout_ms;
            request.memory_limit_mb = memory_mb;

            let code = run_once(CodeExecutor::new(config), &request).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Check { file, config } => {
            let config = load_config(config.as_deref())?;
            let violations = SecurityScreener::from_config(&config).scan(&read_source(&file)?);
            if violations.is_empty() {
                println!("✓ No violations in {}", file.display());
            } else {
                for violation in &violations {
                    println!("✗ {}", violation);
                }
                std::process::exit(EXIT_FAILURE);
            }
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ExecutorConfig> {
    match path {
        Some(path) => ExecutorConfig::from_file(path),
        None => ExecutorConfig::from_env().context("loading EXECUTOR_* configuration"),
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Execute, print the outcome and return the process exit code.
///
/// A finished run exits 0 even when the code itself failed; the JSON says so.
async fn run_once(executor: CodeExecutor, request: &ExecutionRequest) -> Result<i32> {
    let execution = executor.execute(request);
    tokio::pin!(execution);

    let outcome = tokio::select! {
        outcome = &mut execution => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down active executions");
            executor.shutdown().await;
            execution.await
        }
    };

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(0)
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&error_body(&err))?);
            Ok(if err.is_validation() { EXIT_INVALID } else { EXIT_FAILURE })
        }
    }
}

fn error_body(err: &ExecutorError) -> serde_json::Value {
    let execution = err.as_execution();
    json!({
        "error": err.code(),
        "message": err.public_message(),
        "securityViolation": execution.map_or(false, |e| e.is_security_violation()),
        "timeout": execution.map_or(false, |e| e.is_timeout()),
        "memoryLimit": execution.map_or(false, |e| e.is_memory_limit()),
        "outputLimit": execution.map_or(false, |e| e.is_output_limit()),
    })
}
