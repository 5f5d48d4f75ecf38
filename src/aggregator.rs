use crate::catalog::Problem;
use crate::submission::{SubmissionStatus, TestResult};

pub const NO_TEST_CASES: &str = "no test cases configured";

/// Final outcome of one judging cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub score: u32,
    pub execution_time_ms: u64,
    pub memory_used_kb: u64,
    pub compile_output: Option<String>,
    pub diagnostic: Option<String>,
    pub results: Vec<TestResult>,
}

impl Verdict {
    pub fn compile_error(diagnostics: String) -> Self {
        Self {
            status: SubmissionStatus::CompileError,
            score: 0,
            execution_time_ms: 0,
            memory_used_kb: 0,
            compile_output: Some(diagnostics),
            diagnostic: None,
            results: Vec::new(),
        }
    }

    /// A submission the judge could not grade
    pub fn error(diagnostic: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Error,
            score: 0,
            execution_time_ms: 0,
            memory_used_kb: 0,
            compile_output: None,
            diagnostic: Some(diagnostic.into()),
            results: Vec::new(),
        }
    }
}

/// Combines ordered test results into a verdict
///
/// The status is `accepted` when every test passed, otherwise the status of
/// the first failing test. Scores are the weighted share of passed tests,
/// rounded half-up; when every weight is zero all tests count equally.
pub fn aggregate(problem: &Problem, results: Vec<TestResult>) -> Verdict {
    if problem.test_cases.is_empty() {
        return Verdict::error(NO_TEST_CASES);
    }

    let weights: Vec<u64> = problem.test_cases.iter().map(|tc| tc.weight as u64).collect();
    let equal = weights.iter().all(|&w| w == 0);
    let weight_of = |idx: usize| if equal { 1 } else { weights[idx] };

    let total: u64 = (0..weights.len()).map(weight_of).sum();
    let passed: u64 = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.passed)
        .map(|(idx, _)| weight_of(idx))
        .sum();

    let status = results
        .iter()
        .find(|r| !r.passed)
        .map_or(SubmissionStatus::Accepted, |r| r.status);

    let diagnostic = (status == SubmissionStatus::Timeout)
        .then(|| "judging time ceiling reached before all test cases ran".to_string());

    Verdict {
        status,
        score: round_half_up_percent(passed, total),
        execution_time_ms: results.iter().map(|r| r.time_ms).max().unwrap_or(0),
        memory_used_kb: results.iter().map(|r| r.memory_kb).max().unwrap_or(0),
        compile_output: None,
        diagnostic,
        results,
    }
}

/// `100 * part / total` rounded half-up, computed in integers
fn round_half_up_percent(part: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((200 * part + total) / (2 * total)) as u32
}
