use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::catalog::Problem;

#[derive(Parser)]
#[command(name = "judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of sandbox workers, overriding `judge.workers`
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<u8>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        if let Some(workers) = self.workers {
            config.judge.workers = workers;
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    /// Size of the sandbox pool, i.e. the maximum number of concurrent executions
    pub workers: u8,
    /// Maximum number of submissions waiting in the queue
    pub queue_capacity: usize,
    /// Multiplier of the global ceiling `time_limit_ms * num_test_cases`
    pub safety_factor: f64,
    /// Maximum number of bytes kept from stderr/stdout and compiler output
    pub diagnostic_limit: usize,
    /// Maximum stdout a judged program may produce
    pub output_limit_kb: u64,
    /// How often a submission is retried after sandbox infrastructure failures
    pub max_attempts: u32,
    /// Pause before a retried submission re-enters the queue
    pub retry_delay_ms: u64,
    /// Minimum pause between two submissions of a user to one problem, 0 disables it
    pub submission_cooldown_ms: u64,
    pub sandbox: SandboxBackend,
    /// Identity used by the process sandbox when the judge runs as root
    pub run_as_uid: u32,
    pub run_as_gid: u32,
    /// Database location, defaults to the user's local data directory
    pub database: Option<PathBuf>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            safety_factor: 2.0,
            diagnostic_limit: 1024,
            output_limit_kb: 65536,
            max_attempts: 3,
            retry_delay_ms: 1000,
            submission_cooldown_ms: 0,
            sandbox: SandboxBackend::Auto,
            run_as_uid: 65534,
            run_as_gid: 65534,
            database: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// `isolate` when it is installed, plain processes otherwise
    #[default]
    Auto,
    Isolate,
    Process,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: String,
    /// Source file name, `%CLASS%` is replaced by the declared class name
    pub file_name: String,
    /// Compile command template, absent for interpreted languages
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command template
    pub run: Vec<String>,
    /// Extra memory granted on top of the problem limit, e.g. for a VM
    #[serde(default)]
    pub memory_overhead_kb: u64,
}
