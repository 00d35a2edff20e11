use executor::{CodeExecutor, ExecutionRequest, ExecutorConfig};
use tempfile::TempDir;

// A missing interpreter turns any spawn into a process error, so a
// validation or security error proves nothing was started.
fn executor_without_interpreter(root: &TempDir) -> CodeExecutor {
    CodeExecutor::new(ExecutorConfig {
        interpreter_path: "/nonexistent/python3".into(),
        workspace_root: Some(root.path().to_path_buf()),
        ..Default::default()
    })
}

#[tokio::test]
async fn oversized_code_is_rejected_before_spawn() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);
    let code = "x = 1\n".repeat(5_000);

    let err = executor.execute(&ExecutionRequest::new(code, "big")).await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn malformed_exercise_id_is_rejected() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);

    let err = executor
        .execute(&ExecutionRequest::new("print(1)", "../etc/passwd"))
        .await
        .unwrap_err();

    assert!(err.is_validation());
}

#[tokio::test]
async fn out_of_range_timeout_is_rejected_not_clamped() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);
    let mut request = ExecutionRequest::new("print(1)", "slow");
    request.timeout_ms = Some(120_000);

    let err = executor.execute(&request).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn import_os_is_a_security_violation() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);

    let err = executor
        .execute(&ExecutionRequest::new("import os\nprint(os.getcwd())", "escape"))
        .await
        .unwrap_err();

    let execution = err.as_execution().expect("execution error");
    assert!(execution.is_security_violation());
    assert_eq!(err.code(), "EXECUTION_SECURITY_VIOLATION");
    assert!(err.to_string().contains("Import of module 'os' is not allowed"));

    let metrics = executor.metrics();
    assert_eq!(metrics.security_violations, 1);
    assert_eq!(metrics.failed_executions, 1);
    assert_eq!(executor.active_executions(), 0);
}

#[tokio::test]
async fn every_violation_is_reported_together() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);
    let code = "import subprocess\nexec('print(1)')\nbreakpoint()\n";

    let err = executor.execute(&ExecutionRequest::new(code, "many")).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("Blocked pattern 'subprocess'"));
    assert!(message.contains("Import of module 'subprocess' is not allowed"));
    assert!(message.contains("'exec('"));
    assert!(message.contains("Blocked pattern 'breakpoint('"));
    assert_eq!(executor.metrics().security_violations, 1);
}

#[tokio::test]
async fn allowlisted_imports_reach_the_interpreter() {
    let root = TempDir::new().unwrap();
    let executor = executor_without_interpreter(&root);

    let err = executor
        .execute(&ExecutionRequest::new("import math\nfrom collections import deque\n", "ok"))
        .await
        .unwrap_err();

    // screening passed; the spawn is what failed
    assert_eq!(err.code(), "EXECUTION_PROCESS_ERROR");
    assert!(!err.public_message().contains("No such file"));
}
