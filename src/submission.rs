use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a submission
///
/// The forward chain is `Pending -> Queued -> Running -> <terminal>`.
/// See [`SubmissionStatus::can_transition_to`] for the two explicit backward edges.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Queued,
    Running,
    Accepted,
    WrongAnswer,
    Tle,
    Mle,
    RuntimeError,
    CompileError,
    Error,
    Timeout,
    Cancelled,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 12] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Accepted,
        Self::WrongAnswer,
        Self::Tle,
        Self::Mle,
        Self::RuntimeError,
        Self::CompileError,
        Self::Error,
        Self::Timeout,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Accepted => "accepted",
            Self::WrongAnswer => "wrong_answer",
            Self::Tle => "tle",
            Self::Mle => "mle",
            Self::RuntimeError => "runtime_error",
            Self::CompileError => "compile_error",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether judging of this submission is over
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Queued | Self::Running)
    }

    /// Checks a single status transition.
    ///
    /// Besides the forward chain, two backward edges exist:
    /// `Running -> Queued` when the sandbox infrastructure failed and the
    /// submission is retried, and `<terminal> -> Pending` when a rejudge
    /// starts a new judging cycle.
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Queued) => true,
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Cancelled) => true,
            (Self::Running, Self::Queued) => true,
            (Self::Running, n) => n.is_terminal() && n != Self::Cancelled,
            (s, Self::Pending) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown submission status: {s}"))
    }
}

/// Queue priority of a submission
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Re-judge requests, served only when no live submission waits
    Rejudge,
    Normal,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rejudge => "rejudge",
            Self::Normal => "normal",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "rejudge" => Ok(Self::Rejudge),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

/// Body of `POST /submissions`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewSubmission {
    pub event_id: u32,
    pub problem_id: u32,
    pub user_id: u32,
    #[serde(default)]
    pub team_id: Option<u32>,
    pub language: String,
    pub source_code: String,
}

/// Outcome of one test case
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub test_case_id: u32,
    pub passed: bool,
    pub status: SubmissionStatus,
    pub time_ms: u64,
    pub memory_kb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Full persisted submission record
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Submission {
    pub id: u32,
    pub event_id: u32,
    pub problem_id: u32,
    pub user_id: u32,
    pub team_id: Option<u32>,
    pub language: String,
    pub source_code: String,
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub execution_time_ms: Option<u64>,
    pub memory_used_kb: Option<u64>,
    pub compile_output: Option<String>,
    pub diagnostic: Option<String>,
    pub attempts: u32,
    pub priority: Priority,
    pub results: Vec<TestResult>,
    pub submitted_at: String,
    pub judged_at: Option<String>,
}

/// Who is looking at a submission, as asserted by the trusted backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Student,
    Staff,
}

impl Viewer {
    pub fn from_role(role: Option<&str>) -> Self {
        match role.map(|r| r.trim().to_ascii_lowercase()) {
            Some(r) if r == "admin" || r == "faculty" => Self::Staff,
            _ => Self::Student,
        }
    }
}

/// Shape polled by the dashboard through `GET /submissions/{id}`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionView {
    pub id: u32,
    pub event_id: u32,
    pub problem_id: u32,
    pub user_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<u32>,
    pub language: String,
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub execution_time_ms: Option<u64>,
    pub memory_used_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub results: Vec<TestResult>,
    pub submitted_at: String,
    pub judged_at: Option<String>,
}

impl Submission {
    /// Projects the record for a viewer; students never see runtime diagnostics
    pub fn view(&self, viewer: Viewer) -> SubmissionView {
        let staff = viewer == Viewer::Staff;
        let results = self
            .results
            .iter()
            .map(|r| TestResult {
                diagnostic: if staff { r.diagnostic.clone() } else { None },
                ..r.clone()
            })
            .collect();

        SubmissionView {
            id: self.id,
            event_id: self.event_id,
            problem_id: self.problem_id,
            user_id: self.user_id,
            team_id: self.team_id,
            language: self.language.clone(),
            status: self.status,
            score: self.score,
            execution_time_ms: self.execution_time_ms,
            memory_used_kb: self.memory_used_kb,
            compile_output: self.compile_output.clone(),
            diagnostic: if staff { self.diagnostic.clone() } else { None },
            results,
            submitted_at: self.submitted_at.clone(),
            judged_at: self.judged_at.clone(),
        }
    }
}

/// Filters of the submission list, all optional
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub event_id: Option<u32>,
    pub problem_id: Option<u32>,
    pub user_id: Option<u32>,
    pub team_id: Option<u32>,
    pub status: Option<SubmissionStatus>,
    pub limit: Option<u32>,
}
