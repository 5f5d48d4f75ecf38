use std::path::Path;

use serde::Serialize;

use crate::error::SandboxError;

// Compile step limits
const COMPILE_TIME_LIMIT_MS: u64 = 30_000;
const COMPILE_MEMORY_LIMIT_KB: u64 = 524_288;
const COMPILE_PROCESSES: u32 = 32;
const COMPILE_OPEN_FILES: u32 = 512;
const COMPILE_FILE_SIZE_KB: u64 = 65_536;

const RUNTIME_PROCESSES: u32 = 64;
const RUNTIME_OPEN_FILES: u32 = 64;

/// How a sandboxed execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
}

/// Resource limits of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock limit, the process is killed once it is exceeded
    pub time_ms: u64,
    /// Resident memory ceiling
    pub memory_kb: u64,
    pub processes: u32,
    pub open_files: u32,
    /// Largest file the process may write, which also caps its stdout
    pub file_size_kb: u64,
}

impl RunLimits {
    pub fn compile() -> Self {
        Self {
            time_ms: COMPILE_TIME_LIMIT_MS,
            memory_kb: COMPILE_MEMORY_LIMIT_KB,
            processes: COMPILE_PROCESSES,
            open_files: COMPILE_OPEN_FILES,
            file_size_kb: COMPILE_FILE_SIZE_KB,
        }
    }

    pub fn test_case(time_ms: u64, memory_kb: u64, output_kb: u64) -> Self {
        Self {
            time_ms,
            memory_kb,
            processes: RUNTIME_PROCESSES,
            open_files: RUNTIME_OPEN_FILES,
            file_size_kb: output_kb,
        }
    }
}

/// One process to execute inside the scratch directory
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub command: &'a [String],
    pub stdin: &'a [u8],
    pub limits: RunLimits,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub time_used_ms: u64,
    pub memory_used_kb: u64,
    pub outcome: RunOutcome,
    /// Short explanation from the sandbox, e.g. the terminating signal
    pub message: Option<String>,
}

/// Trait for different sandbox execution implementations
///
/// A runner owns one scratch directory. Every call to [`SandboxRunner::run`]
/// starts a fresh process; the caller wipes the scratch directory between
/// test cases with [`SandboxRunner::reset`] so that no state leaks from one
/// execution into the next.
pub trait SandboxRunner: Send + Sync {
    /// Identifier of this runner, unique within the pool
    fn id(&self) -> u8;

    /// Host path of the only directory the sandboxed process may write to
    fn scratch_dir(&self) -> &Path;

    /// Host path where artifacts are staged between executions
    fn cache_dir(&self) -> &Path;

    /// Empties the scratch directory
    fn reset(&self) -> Result<(), SandboxError> {
        super::clear_dir(self.scratch_dir())?;
        Ok(())
    }

    /// Executes one process under the given limits
    ///
    /// Errors are reserved for failures of the sandbox itself; anything the
    /// judged program does is reported through [`RunOutput::outcome`].
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, SandboxError>;

    /// Writes a file into the scratch directory
    fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        std::fs::write(self.scratch_dir().join(name), contents)?;
        Ok(())
    }

    /// Wipes the scratch directory and fills it with the staged files
    fn restore(&self, staging: &Path) -> Result<(), SandboxError> {
        self.reset()?;
        super::copy_dir_contents(staging, self.scratch_dir())?;
        Ok(())
    }
}
