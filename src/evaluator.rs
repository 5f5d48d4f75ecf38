use std::path::Path;
use std::time::{Duration, Instant};

use crate::catalog::{Problem, TestCase};
use crate::error::SandboxError;
use crate::sandbox::{RunLimits, RunOutcome, RunOutput, RunRequest, SandboxRunner};
use crate::submission::{SubmissionStatus, TestResult};
use crate::toolchain::Artifact;

/// Runs the test suite of one problem against a prepared artifact
pub struct Evaluator<'a> {
    pub problem: &'a Problem,
    pub artifact: &'a Artifact,
    /// Directory holding the compiled files, restored before every test
    pub staging: &'a Path,
    pub output_limit_kb: u64,
    pub diagnostic_limit: usize,
    /// Test cases not started by this instant are recorded as `timeout`
    pub deadline: Instant,
}

impl Evaluator<'_> {
    /// Evaluates every test case in problem order
    ///
    /// Failures of the judged program never stop the suite; only errors of
    /// the sandbox itself are returned.
    pub fn run(&self, sandbox: &dyn SandboxRunner) -> Result<Vec<TestResult>, SandboxError> {
        let memory_kb = self.problem.memory_limit_kb + self.artifact.memory_overhead_kb;
        let mut results = Vec::with_capacity(self.problem.test_cases.len());

        for tc in &self.problem.test_cases {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "Suite ceiling reached on problem {}, skipping test case {}",
                    self.problem.id,
                    tc.id
                );
                results.push(skipped(tc));
                continue;
            }

            let time_limit = Duration::from_millis(self.problem.time_limit_ms);
            let capped = remaining < time_limit;
            let time_ms = remaining.min(time_limit).as_millis().max(1) as u64;

            sandbox.restore(self.staging)?;
            let output = sandbox.run(&RunRequest {
                command: &self.artifact.run_command,
                stdin: tc.input.as_bytes(),
                limits: RunLimits::test_case(time_ms, memory_kb, self.output_limit_kb),
            })?;

            let mut result = classify_test(tc, &output, self.diagnostic_limit);
            if capped && result.status == SubmissionStatus::Tle {
                result.status = SubmissionStatus::Timeout;
            }
            log::debug!(
                "Test case {} of problem {}: {} in {} ms",
                tc.id,
                self.problem.id,
                result.status,
                result.time_ms
            );
            results.push(result);
        }

        Ok(results)
    }
}

fn skipped(tc: &TestCase) -> TestResult {
    TestResult {
        test_case_id: tc.id,
        passed: false,
        status: SubmissionStatus::Timeout,
        time_ms: 0,
        memory_kb: 0,
        diagnostic: Some("not run: judging time ceiling reached".to_string()),
    }
}

/// Turns one sandbox execution into a test result
///
/// A sandbox outcome other than `ok` always decides the status; output is
/// compared only for clean runs.
pub fn classify_test(tc: &TestCase, output: &RunOutput, diagnostic_limit: usize) -> TestResult {
    let status = match output.outcome {
        RunOutcome::Ok if outputs_match(&output.stdout, &tc.expected_output) => {
            SubmissionStatus::Accepted
        }
        RunOutcome::Ok => SubmissionStatus::WrongAnswer,
        RunOutcome::TimeLimitExceeded => SubmissionStatus::Tle,
        RunOutcome::MemoryLimitExceeded => SubmissionStatus::Mle,
        RunOutcome::RuntimeError => SubmissionStatus::RuntimeError,
    };

    let mut diagnostic = output.message.clone().unwrap_or_default();
    if !output.stderr.is_empty() {
        if !diagnostic.is_empty() {
            diagnostic.push('\n');
        }
        diagnostic.push_str(&output.stderr);
    }

    TestResult {
        test_case_id: tc.id,
        passed: status == SubmissionStatus::Accepted,
        status,
        time_ms: output.time_used_ms,
        memory_kb: output.memory_used_kb,
        diagnostic: (!diagnostic.is_empty())
            .then(|| truncate_diagnostic(&diagnostic, diagnostic_limit)),
    }
}

/// Compares program output with expected output
///
/// Trailing whitespace on every line and trailing empty lines are ignored.
/// Everything else, including inner spacing and line structure, must match
/// exactly.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}

fn normalize(s: &str) -> String {
    s.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Cuts `text` to at most `limit` bytes on a character boundary
pub fn truncate_diagnostic(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
