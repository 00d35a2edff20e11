use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::interpreter::TEST_SUCCESS_MARKER;

pub const SOLUTION_FILE: &str = "solution.py";
pub const TEST_FILE: &str = "test_solution.py";

/// Per-execution scratch directory, removed recursively when dropped.
#[derive(Debug)]
pub struct ExecutionWorkspace {
    dir: Option<TempDir>,
    target: PathBuf,
}

impl ExecutionWorkspace {
    /// Create the directory under `root` and write the files for one run.
    ///
    /// The submitted code always lands in [`SOLUTION_FILE`]. With test code,
    /// [`TEST_FILE`] imports the solution, runs the tests and prints the
    /// success marker, and becomes the file to execute.
    pub fn prepare(
        root: &Path,
        execution_id: &str,
        code: &str,
        test_code: Option<&str>,
    ) -> Result<Self, ExecutionError> {
        fs::create_dir_all(root).map_err(|err| ExecutionError::Workspace {
            message: format!("failed to create workspace root {}: {}", root.display(), err),
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("exec-{}-", execution_id))
            .tempdir_in(root)
            .map_err(|err| ExecutionError::Workspace {
                message: format!("failed to create execution directory: {}", err),
            })?;

        let solution = dir.path().join(SOLUTION_FILE);
        write_file(&solution, code)?;

        let target = match test_code {
            Some(tests) => {
                let test_path = dir.path().join(TEST_FILE);
                write_file(&test_path, &test_harness(tests))?;
                test_path
            }
            None => solution,
        };

        debug!(execution = %execution_id, dir = %dir.path().display(), "prepared workspace");
        Ok(Self {
            dir: Some(dir),
            target,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    /// The file the interpreter should run.
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for ExecutionWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                warn!(dir = %path.display(), error = %err, "failed to remove execution directory");
            }
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExecutionError> {
    fs::write(path, contents).map_err(|err| ExecutionError::Workspace {
        message: format!("failed to write {}: {}", path.display(), err),
    })
}

fn test_harness(tests: &str) -> String {
    format!(
        "from solution import *\n\n{}\n\nprint({:?})\n",
        tests.trim_end(),
        TEST_SUCCESS_MARKER
    )
}
