use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::config::JudgeConfig;
use crate::error::SandboxError;

use super::{RunLimits, RunOutcome, RunOutput, RunRequest, SandboxRunner};

const POLL_INTERVAL: Duration = Duration::from_millis(2);
/// How long the pipes may stay open once the judged process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const DRAIN_POLL_MS: libc::c_int = 10;
/// Environment variable tagging every process spawned for one run
const RUN_MARKER: &str = "JUDGE_RUN";
const STDERR_CAP: usize = 64 * 1024;
const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Unprivileged identity the judged process switches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    uid: u32,
    gid: u32,
}

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// A runner that confines plain child processes with rlimits
///
/// Every execution gets its own session so that the whole process group can
/// be killed on overrun. Descendants that start a session of their own are
/// found through a per-run environment marker and killed as well; one that
/// also drops the marker cannot hold the runner longer than a short drain
/// grace period, and the run is then reported as over its time. Wall time is enforced by a watchdog loop that also
/// samples resident memory from procfs. When the judge runs as root, the
/// child additionally gets a private network namespace and drops to an
/// unprivileged uid/gid; otherwise these two properties are unavailable and
/// only the `isolate` backend provides them.
pub struct ProcessRunner {
    /// Unique identifier for this instance
    id: u8,
    /// Path to the working directory of the judged process
    scratch_dir: PathBuf,
    /// Path to the cache directory for staged artifacts
    cache_dir: PathBuf,
    identity: Option<Identity>,
}

impl ProcessRunner {
    pub fn build(id: u8, config: &JudgeConfig) -> Result<Self> {
        let scratch_dir = std::env::temp_dir()
            .join("judge-sandbox")
            .join(id.to_string());
        let cache_dir = Self::setup_cache_directory(id)?;

        let identity = if unsafe { libc::geteuid() } == 0 {
            Some(Identity {
                uid: config.run_as_uid,
                gid: config.run_as_gid,
            })
        } else {
            log::warn!(
                "ProcessRunner {id} is not running as root: no network namespace and no identity switch"
            );
            None
        };

        let runner = Self {
            id,
            scratch_dir,
            cache_dir,
            identity,
        };
        runner.reset()?;

        log::info!("ProcessRunner {id} initialized successfully");
        Ok(runner)
    }

    /// Builds a runner on explicit directories without privilege drop
    pub fn with_dirs(id: u8, scratch_dir: PathBuf, cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        let runner = Self {
            id,
            scratch_dir,
            cache_dir,
            identity: None,
        };
        runner.reset()?;
        Ok(runner)
    }

    /// Sets up the cache directory for the runner
    fn setup_cache_directory(id: u8) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "judge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_dir = proj_dirs.cache_dir().join("process").join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Resolves `./program` against the scratch directory
    fn resolve_program(&self, program: &str) -> PathBuf {
        match program.strip_prefix("./") {
            Some(relative) => self.scratch_dir.join(relative),
            None => PathBuf::from(program),
        }
    }
}

impl SandboxRunner for ProcessRunner {
    fn id(&self) -> u8 {
        self.id
    }

    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn reset(&self) -> Result<(), SandboxError> {
        super::clear_dir(&self.scratch_dir)?;
        if let Some(identity) = self.identity {
            std::os::unix::fs::chown(&self.scratch_dir, Some(identity.uid), Some(identity.gid))?;
        }
        Ok(())
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, SandboxError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Spawn("empty command".to_string()))?;
        let limits = request.limits;
        let identity = self.identity;
        let marker = format!(
            "{}-{}-{}",
            std::process::id(),
            self.id,
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let mut cmd = Command::new(self.resolve_program(program));
        cmd.args(args)
            .current_dir(&self.scratch_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &self.scratch_dir)
            .env("LANG", "C.UTF-8")
            .env(RUN_MARKER, &marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(move || apply_limits(&limits, identity));
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id() as libc::pid_t;

        let stdin = child.stdin.take();
        let input = request.stdin.to_vec();
        let stdin_thread = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading its input
                let _ = stdin.write_all(&input);
            }
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr not captured".to_string()))?;
        let stdout_cap = (limits.file_size_kb as usize).saturating_mul(1024);
        let stop = Arc::new(AtomicBool::new(false));
        let stdout_thread = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || drain_pipe(stdout, stdout_cap, &stop))
        };
        let stderr_thread = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || drain_pipe(stderr, STDERR_CAP, &stop))
        };

        let exit = watch_process(pid, start, &limits);

        // Leftover processes would keep the pipes open
        kill_group(pid);
        kill_marked(&marker);
        let exit = exit?;
        let elapsed = start.elapsed();

        let drain_deadline = Instant::now() + DRAIN_GRACE;
        while !(stdout_thread.is_finished() && stderr_thread.is_finished()) {
            if Instant::now() >= drain_deadline {
                stop.store(true, Ordering::Relaxed);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();
        // A writer stuck on a pipe held by an escaped process is left behind
        if stdin_thread.is_finished() {
            let _ = stdin_thread.join();
        }

        let drain_overrun = stdout.abandoned || stderr.abandoned;
        if drain_overrun {
            log::warn!(
                "ProcessRunner {}: pipes still open {}ms after {program} exited",
                self.id,
                DRAIN_GRACE.as_millis()
            );
        }
        let (outcome, message) = classify(&exit, &limits, stdout.truncated, drain_overrun);
        let elapsed = if drain_overrun {
            start.elapsed()
        } else {
            elapsed
        };
        log::debug!(
            "ProcessRunner {} ran {program}: {outcome:?} in {}ms",
            self.id,
            elapsed.as_millis()
        );

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout.data).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.data).into_owned(),
            exit_code: exit.exit_code(),
            time_used_ms: elapsed.as_millis() as u64,
            memory_used_kb: exit.memory_kb(),
            outcome,
            message,
        })
    }
}

/// Why the watchdog killed the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kill {
    Timeout,
    Memory,
}

#[derive(Debug)]
struct ProcessExit {
    /// Raw status as returned by `wait4`
    status: libc::c_int,
    max_rss_kb: u64,
    peak_rss_kb: u64,
    killed: Option<Kill>,
}

impl ProcessExit {
    fn exit_code(&self) -> Option<i32> {
        libc::WIFEXITED(self.status).then(|| libc::WEXITSTATUS(self.status))
    }

    fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.status).then(|| libc::WTERMSIG(self.status))
    }

    fn memory_kb(&self) -> u64 {
        self.max_rss_kb.max(self.peak_rss_kb)
    }
}

/// Runs in the forked child before exec; only async-signal-safe calls allowed
fn apply_limits(limits: &RunLimits, identity: Option<Identity>) -> io::Result<()> {
    let set_rlimit = |resource, value: u64| -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };

    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    // CPU limit is only a backstop behind the wall-clock watchdog
    set_rlimit(libc::RLIMIT_CPU, limits.time_ms.div_ceil(1000) + 1)?;
    set_rlimit(libc::RLIMIT_FSIZE, limits.file_size_kb * 1024)?;
    set_rlimit(libc::RLIMIT_NOFILE, limits.open_files as u64)?;
    set_rlimit(libc::RLIMIT_STACK, limits.memory_kb * 1024)?;
    set_rlimit(libc::RLIMIT_CORE, 0)?;

    if let Some(identity) = identity {
        // RLIMIT_NPROC counts per uid, so it is only meaningful for a dedicated one
        set_rlimit(libc::RLIMIT_NPROC, limits.processes as u64)?;
        unsafe {
            if libc::unshare(libc::CLONE_NEWNET) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(identity.gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(identity.uid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

/// Waits for the process while enforcing wall time and resident memory
fn watch_process(
    pid: libc::pid_t,
    start: Instant,
    limits: &RunLimits,
) -> Result<ProcessExit, SandboxError> {
    let deadline = start + Duration::from_millis(limits.time_ms);
    let mut peak_rss_kb = 0;
    let mut killed = None;

    loop {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let flags = if killed.is_some() { 0 } else { libc::WNOHANG };

        let ret = unsafe { libc::wait4(pid, &mut status, flags, &mut usage) };
        if ret == pid {
            return Ok(ProcessExit {
                status,
                max_rss_kb: usage.ru_maxrss.max(0) as u64,
                peak_rss_kb,
                killed,
            });
        }
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SandboxError::Io(err));
        }

        if killed.is_none() {
            if let Some(rss) = resident_kb(pid) {
                peak_rss_kb = peak_rss_kb.max(rss);
                if rss > limits.memory_kb {
                    kill_group(pid);
                    killed = Some(Kill::Memory);
                    continue;
                }
            }
            if Instant::now() >= deadline {
                kill_group(pid);
                killed = Some(Kill::Timeout);
                continue;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill_group(pid: libc::pid_t) {
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

/// Kills processes that left the group but still carry the run marker
///
/// Repeats while it finds any, so that children forked during a sweep are
/// caught by the next one.
fn kill_marked(marker: &str) {
    let needle = format!("{RUN_MARKER}={marker}");

    for _ in 0..3 {
        let Ok(entries) = fs::read_dir("/proc") else {
            return;
        };
        let mut killed = 0;
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<libc::pid_t>().ok())
            else {
                continue;
            };
            let Ok(environ) = fs::read(entry.path().join("environ")) else {
                continue;
            };
            if environ.split(|&b| b == 0).any(|var| var == needle.as_bytes()) {
                log::debug!("Killing escaped sandbox process {pid}");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                killed += 1;
            }
        }
        if killed == 0 {
            return;
        }
    }
}

/// Current resident set size of a live process
fn resident_kb(pid: libc::pid_t) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
}

/// What was read from one output pipe
#[derive(Debug, Default)]
struct Capture {
    data: Vec<u8>,
    /// More than the cap was written
    truncated: bool,
    /// The pipe was still open when reading was stopped
    abandoned: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Reads a pipe until every writer closed it or `stop` is raised
fn drain_pipe<P: Read + AsRawFd>(mut pipe: P, cap: usize, stop: &AtomicBool) -> Capture {
    let mut capture = Capture::default();
    let mut buf = [0u8; 8192];

    loop {
        if stop.load(Ordering::Relaxed) {
            capture.abandoned = true;
            break;
        }

        let mut fds = libc::pollfd {
            fd: pipe.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut fds, 1, DRAIN_POLL_MS) };
        if ready == 0 {
            continue;
        }
        if ready < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }

        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => capture.push(&buf[..n], cap),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    capture
}

fn classify(
    exit: &ProcessExit,
    limits: &RunLimits,
    stdout_truncated: bool,
    drain_overrun: bool,
) -> (RunOutcome, Option<String>) {
    match exit.killed {
        Some(Kill::Timeout) => {
            return (
                RunOutcome::TimeLimitExceeded,
                Some("wall time limit exceeded".to_string()),
            );
        }
        Some(Kill::Memory) => {
            return (
                RunOutcome::MemoryLimitExceeded,
                Some("memory limit exceeded".to_string()),
            );
        }
        None => {}
    }

    if drain_overrun {
        return (
            RunOutcome::TimeLimitExceeded,
            Some("process left running after exit".to_string()),
        );
    }
    if exit.memory_kb() > limits.memory_kb {
        return (
            RunOutcome::MemoryLimitExceeded,
            Some("memory limit exceeded".to_string()),
        );
    }
    if let Some(signal) = exit.signal() {
        if signal == libc::SIGXCPU {
            return (
                RunOutcome::TimeLimitExceeded,
                Some("cpu time limit exceeded".to_string()),
            );
        }
        return (
            RunOutcome::RuntimeError,
            Some(format!("killed by signal {signal}")),
        );
    }
    if stdout_truncated {
        return (
            RunOutcome::RuntimeError,
            Some("output limit exceeded".to_string()),
        );
    }
    match exit.exit_code() {
        Some(0) => (RunOutcome::Ok, None),
        Some(code) => (
            RunOutcome::RuntimeError,
            Some(format!("exited with code {code}")),
        ),
        None => (RunOutcome::RuntimeError, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> (ProcessRunner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::with_dirs(
            1,
            dir.path().join("scratch"),
            dir.path().join("cache"),
        )
        .unwrap();
        (runner, dir)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn exit(status: libc::c_int, killed: Option<Kill>) -> ProcessExit {
        ProcessExit {
            status,
            max_rss_kb: 1024,
            peak_rss_kb: 0,
            killed,
        }
    }

    #[test]
    fn echoes_stdin() {
        let (runner, _dir) = runner();
        let command = sh("read n; echo $((n * 2))");
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"21\n",
                limits: RunLimits::test_case(2000, 65536, 1024),
            })
            .unwrap();

        assert_eq!(output.outcome, RunOutcome::Ok);
        assert_eq!(output.stdout, "42\n");
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn nonzero_exit_is_runtime_error() {
        let (runner, _dir) = runner();
        let command = sh("echo oops >&2; exit 3");
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(2000, 65536, 1024),
            })
            .unwrap();

        assert_eq!(output.outcome, RunOutcome::RuntimeError);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }

    #[test]
    fn overrun_is_killed() {
        let (runner, _dir) = runner();
        let command = sh("sleep 10");
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(200, 65536, 1024),
            })
            .unwrap();

        assert_eq!(output.outcome, RunOutcome::TimeLimitExceeded);
        assert!(output.time_used_ms >= 200);
        assert!(output.time_used_ms < 5000, "took {}ms", output.time_used_ms);
    }

    #[test]
    fn runs_in_scratch_dir() {
        let (runner, _dir) = runner();
        runner.write_file("data.txt", b"hello").unwrap();
        let command = sh("cat data.txt; touch left-behind");
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(2000, 65536, 1024),
            })
            .unwrap();
        assert_eq!(output.stdout, "hello");

        runner.reset().unwrap();
        assert!(!runner.scratch_dir().join("left-behind").exists());
    }

    #[test]
    fn missing_program_is_a_sandbox_error() {
        let (runner, _dir) = runner();
        let command = vec!["./does-not-exist".to_string()];
        let result = runner.run(&RunRequest {
            command: &command,
            stdin: b"",
            limits: RunLimits::test_case(1000, 65536, 1024),
        });
        assert!(matches!(result, Err(SandboxError::Spawn(_))));
    }

    #[test]
    fn classification() {
        let limits = RunLimits::test_case(1000, 4096, 1024);

        assert_eq!(classify(&exit(0, None), &limits, false, false).0, RunOutcome::Ok);
        assert_eq!(
            classify(&exit(3 << 8, None), &limits, false, false).0,
            RunOutcome::RuntimeError
        );
        assert_eq!(
            classify(&exit(libc::SIGKILL, Some(Kill::Timeout)), &limits, false, false).0,
            RunOutcome::TimeLimitExceeded
        );
        assert_eq!(
            classify(&exit(libc::SIGKILL, Some(Kill::Memory)), &limits, false, false).0,
            RunOutcome::MemoryLimitExceeded
        );
        assert_eq!(
            classify(&exit(libc::SIGXCPU, None), &limits, false, false).0,
            RunOutcome::TimeLimitExceeded
        );
        assert_eq!(
            classify(&exit(libc::SIGSEGV, None), &limits, false, false).0,
            RunOutcome::RuntimeError
        );
        assert_eq!(
            classify(&exit(0, None), &limits, true, false).0,
            RunOutcome::RuntimeError
        );

        assert_eq!(
            classify(&exit(0, None), &limits, false, true).0,
            RunOutcome::TimeLimitExceeded
        );

        let mut heavy = exit(0, None);
        heavy.max_rss_kb = 8192;
        assert_eq!(
            classify(&heavy, &limits, false, false).0,
            RunOutcome::MemoryLimitExceeded
        );
    }

    #[test]
    fn capture_truncates() {
        let mut capture = Capture::default();
        capture.push(b"abc", 4);
        assert_eq!(capture.data, b"abc");
        assert!(!capture.truncated);

        capture.push(b"def", 4);
        assert_eq!(capture.data, b"abcd");
        assert!(capture.truncated);
    }

    #[test]
    fn escaped_session_does_not_hold_the_runner() {
        let (runner, _dir) = runner();
        let command = sh("setsid sleep 8 & echo done; sleep 0.1");
        let start = Instant::now();
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(200, 65536, 1024),
            })
            .unwrap();
        let wall = start.elapsed();

        assert!(wall < Duration::from_secs(3), "run blocked for {wall:?}");
        assert_eq!(output.outcome, RunOutcome::Ok);
        assert_eq!(output.stdout, "done\n");
    }

    #[test]
    fn unmarked_escapee_is_a_time_overrun() {
        let (runner, _dir) = runner();
        // Drops the environment marker too, so only the drain bound applies
        let command = sh("env -i setsid sleep 8 & echo done; sleep 0.1");
        let start = Instant::now();
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(200, 65536, 1024),
            })
            .unwrap();
        let wall = start.elapsed();

        assert!(wall < Duration::from_secs(3), "run blocked for {wall:?}");
        assert_eq!(output.outcome, RunOutcome::TimeLimitExceeded);
        assert_eq!(output.stdout, "done\n");
    }

    #[test]
    fn memory_hog_is_killed() {
        let (runner, _dir) = runner();
        // The shell keeps the whole substitution in memory
        let command = sh("x=$(head -c 100000000 /dev/zero | tr '\\0' a); echo ${#x}");
        let output = runner
            .run(&RunRequest {
                command: &command,
                stdin: b"",
                limits: RunLimits::test_case(10_000, 32768, 1024),
            })
            .unwrap();

        assert_eq!(output.outcome, RunOutcome::MemoryLimitExceeded);
        assert!(output.memory_used_kb > 32768, "peak {}KB", output.memory_used_kb);
        assert!(output.stdout.is_empty());
    }
}
