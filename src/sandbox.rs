mod isolate_runner;
mod process_runner;
mod runner;

// Re-export the trait and common types
pub use isolate_runner::IsolateRunner;
pub use process_runner::ProcessRunner;
pub use runner::{RunLimits, RunOutcome, RunOutput, RunRequest, SandboxRunner};

use std::fs;
use std::io;
use std::path::Path;

use anyhow::Result;

use crate::config::{JudgeConfig, SandboxBackend};

/// Creates a sandbox runner based on the configured backend
///
/// With [`SandboxBackend::Auto`], an `IsolateRunner` is created when the
/// `isolate` binary is available and a `ProcessRunner` otherwise.
pub fn create_sandbox_runner(id: u8, config: &JudgeConfig) -> Result<Box<dyn SandboxRunner>> {
    let use_isolate = match config.sandbox {
        SandboxBackend::Isolate => true,
        SandboxBackend::Process => false,
        SandboxBackend::Auto => isolate_available(),
    };

    if use_isolate {
        log::info!("Creating IsolateRunner {id} (full isolation mode)");
        Ok(Box::new(IsolateRunner::build(id)?))
    } else {
        log::info!("Creating ProcessRunner {id} (rlimit mode)");
        Ok(Box::new(ProcessRunner::build(id, config)?))
    }
}

fn isolate_available() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Removes everything inside `dir`, creating it if needed
pub(crate) fn clear_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Recursively copies the contents of `from` into `to`, keeping permissions
pub(crate) fn copy_dir_contents(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
