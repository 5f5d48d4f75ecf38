use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};

use crate::error::SandboxError;

use super::{RunLimits, RunOutcome, RunOutput, RunRequest, SandboxRunner};

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

const STDIN_FILE: &str = ".stdin";
const STDOUT_FILE: &str = ".stdout";
const STDERR_FILE: &str = ".stderr";

/// A sandbox environment for executing code using isolate
///
/// isolate gives every run a private network namespace, a read-only view of
/// the host with only the box directory writable, an unprivileged uid and a
/// cgroup with a memory ceiling.
pub struct IsolateRunner {
    /// Unique identifier for this sandbox instance, used as isolate box id
    id: u8,
    /// Path to the sandbox's working directory (inside isolate)
    box_dir: PathBuf,
    /// Path to the cache directory for meta files and staged artifacts
    cache_dir: PathBuf,
}

impl IsolateRunner {
    pub fn build(id: u8) -> Result<Self> {
        let cache_dir = Self::setup_cache_directory(id)?;
        let box_dir = Self::initialize_isolate_sandbox(id)?;

        log::info!("IsolateRunner {id} initialized successfully");
        Ok(Self {
            id,
            box_dir,
            cache_dir,
        })
    }

    /// Sets up the cache directory for the sandbox
    fn setup_cache_directory(id: u8) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "judge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_base_dir = proj_dirs.cache_dir();
        fs::create_dir_all(cache_base_dir)?;
        fs::set_permissions(
            cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join("isolate").join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Initializes the isolate sandbox and returns the box directory
    fn initialize_isolate_sandbox(id: u8) -> Result<PathBuf> {
        // A previous crash may have left the box initialized
        let _ = Command::new("isolate")
            .args(["-b", &id.to_string(), "--cg", "--cleanup"])
            .output();

        let output = Command::new("isolate")
            .args(["-b", &id.to_string(), "--cg", "--init"])
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(PathBuf::from(root_dir_absolute).join("box"))
    }

    /// Builds the isolate command line for one execution
    fn isolate_args(&self, request: &RunRequest<'_>, meta_path: &Path) -> Vec<String> {
        let limits = &request.limits;
        let wall_time = limits.time_ms as f64 / 1000.0;

        let mut args = vec![
            "-b".to_string(),
            self.id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--wall-time={wall_time:.3}"),
            // CPU limit is a backstop behind the wall-clock limit
            format!("--time={:.3}", wall_time + 1.0),
            format!("--cg-mem={}", limits.memory_kb),
            format!("--stack={}", limits.memory_kb),
            format!("--processes={}", limits.processes),
            format!("--open-files={}", limits.open_files),
            format!("--fsize={}", limits.file_size_kb),
            "-E".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "-E".to_string(),
            "HOME=/box".to_string(),
            "-M".to_string(),
            meta_path.to_string_lossy().into_owned(),
            format!("--stdin={STDIN_FILE}"),
            format!("--stdout={STDOUT_FILE}"),
            format!("--stderr={STDERR_FILE}"),
            "--silent".to_string(),
        ];
        if Path::new("/etc/alternatives").exists() {
            args.push("--dir=/etc/alternatives".to_string());
        }
        args.push("--".to_string());
        args.extend(request.command.iter().cloned());
        args
    }
}

impl SandboxRunner for IsolateRunner {
    fn id(&self) -> u8 {
        self.id
    }

    fn scratch_dir(&self) -> &Path {
        &self.box_dir
    }

    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, SandboxError> {
        if request.command.is_empty() {
            return Err(SandboxError::Spawn("empty command".to_string()));
        }

        fs::write(self.box_dir.join(STDIN_FILE), request.stdin)?;
        let meta_path = self.cache_dir.join(format!("{}.meta", self.id));
        let _ = fs::remove_file(&meta_path);

        let output = Command::new("isolate")
            .args(self.isolate_args(request, &meta_path))
            .output()
            .map_err(|e| SandboxError::Spawn(format!("isolate --run: {e}")))?;

        let meta_content = fs::read_to_string(&meta_path).map_err(|e| {
            SandboxError::Spawn(format!(
                "isolate left no meta file ({e}); stderr={}",
                String::from_utf8_lossy(&output.stderr)
            ))
        })?;
        let meta = Meta::parse(&meta_content);
        if meta.status.as_deref() == Some("XX") {
            return Err(SandboxError::Spawn(format!(
                "isolate internal error: {}",
                meta.message.unwrap_or_default()
            )));
        }

        let stdout = fs::read(self.box_dir.join(STDOUT_FILE)).unwrap_or_default();
        let stderr = fs::read(self.box_dir.join(STDERR_FILE)).unwrap_or_default();
        for name in [STDIN_FILE, STDOUT_FILE, STDERR_FILE] {
            let _ = fs::remove_file(self.box_dir.join(name));
        }

        let (outcome, message) = meta.classify(&request.limits);
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: meta.exit_code,
            time_used_ms: meta.time_ms,
            memory_used_kb: meta.memory_kb,
            outcome,
            message,
        })
    }
}

impl Drop for IsolateRunner {
    fn drop(&mut self) {
        let out = Command::new("isolate")
            .arg("-b")
            .arg(self.id.to_string())
            .arg("--cg")
            .arg("--cleanup")
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::info!("IsolateRunner {} cleaned up", self.id);
        } else {
            log::error!("IsolateRunner {} failed to clean up", self.id);
        }
    }
}

/// Parsed isolate meta file
#[derive(Debug, Default, PartialEq)]
struct Meta {
    status: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    oom_killed: bool,
    time_ms: u64,
    memory_kb: u64,
    message: Option<String>,
}

impl Meta {
    fn parse(content: &str) -> Self {
        let mut meta = Meta::default();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "status" => meta.status = Some(value.to_string()),
                    "exitcode" => meta.exit_code = value.parse().ok(),
                    "exitsig" => meta.exit_signal = value.parse().ok(),
                    "cg-oom-killed" => meta.oom_killed = true,
                    "cg-mem" | "max-rss" => {
                        if let Ok(memory) = value.parse::<u64>() {
                            meta.memory_kb = meta.memory_kb.max(memory);
                        }
                    }
                    "time-wall" => {
                        if let Ok(secs) = value.parse::<f64>() {
                            meta.time_ms = (secs * 1000.0).round() as u64;
                        }
                    }
                    "message" => meta.message = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        meta
    }

    fn classify(&self, limits: &RunLimits) -> (RunOutcome, Option<String>) {
        if self.oom_killed || self.memory_kb > limits.memory_kb {
            return (
                RunOutcome::MemoryLimitExceeded,
                Some("memory limit exceeded".to_string()),
            );
        }
        match self.status.as_deref() {
            None => (RunOutcome::Ok, None),
            Some("TO") => (RunOutcome::TimeLimitExceeded, self.message.clone()),
            Some(_) => (
                RunOutcome::RuntimeError,
                self.message.clone().or_else(|| {
                    self.exit_signal
                        .map(|sig| format!("killed by signal {sig}"))
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meta_file() {
        let meta = Meta::parse(
            "time:0.012\ntime-wall:0.034\nmax-rss:3120\ncg-mem:2888\nexitcode:0\n",
        );
        assert_eq!(meta.time_ms, 34);
        assert_eq!(meta.memory_kb, 3120);
        assert_eq!(meta.exit_code, Some(0));
        assert_eq!(
            meta.classify(&RunLimits::test_case(1000, 65536, 1024)).0,
            RunOutcome::Ok
        );
    }

    #[test]
    fn classifies_meta_status() {
        let limits = RunLimits::test_case(1000, 65536, 1024);

        let timeout = Meta::parse("status:TO\nmessage:Time limit exceeded (wall clock)\nkilled:1\n");
        assert_eq!(timeout.classify(&limits).0, RunOutcome::TimeLimitExceeded);

        let signal = Meta::parse("status:SG\nexitsig:11\n");
        assert_eq!(signal.classify(&limits).0, RunOutcome::RuntimeError);

        let nonzero = Meta::parse("status:RE\nexitcode:1\nmessage:Exited with error status 1\n");
        assert_eq!(nonzero.classify(&limits).0, RunOutcome::RuntimeError);

        let oom = Meta::parse("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        assert_eq!(oom.classify(&limits).0, RunOutcome::MemoryLimitExceeded);
    }
}
