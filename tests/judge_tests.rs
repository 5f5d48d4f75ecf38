use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use judge::aggregator::{NO_TEST_CASES, aggregate};
use judge::catalog::{Problem, ProblemCatalog, TestCase};
use judge::config::{JudgeConfig, LanguageConfig};
use judge::database as db;
use judge::error::SandboxError;
use judge::evaluator::Evaluator;
use judge::sandbox::{ProcessRunner, RunOutput, RunRequest, SandboxRunner};
use judge::scheduler::Scheduler;
use judge::submission::{NewSubmission, Submission, SubmissionStatus};
use judge::toolchain::{Artifact, Toolchain};
use judge::worker::worker;

const SUM_SCRIPT: &str = "read n\nread a b c\necho $((a + b + c))";

/// Fails the first `failures` executions like an unavailable sandbox would
struct FlakyRunner {
    inner: ProcessRunner,
    failures: AtomicU32,
}

impl SandboxRunner for FlakyRunner {
    fn id(&self) -> u8 {
        self.inner.id()
    }

    fn scratch_dir(&self) -> &Path {
        self.inner.scratch_dir()
    }

    fn cache_dir(&self) -> &Path {
        self.inner.cache_dir()
    }

    fn reset(&self) -> Result<(), SandboxError> {
        self.inner.reset()
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, SandboxError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SandboxError::Spawn("simulated sandbox outage".to_string()));
        }
        self.inner.run(request)
    }
}

struct TestEnv {
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
    dir: tempfile::TempDir,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn sum_case(id: u32, numbers: [u32; 3]) -> TestCase {
    TestCase {
        id,
        input: format!("3\n{} {} {}\n", numbers[0], numbers[1], numbers[2]),
        expected_output: format!("{}\n", numbers.iter().sum::<u32>()),
        is_sample: id == 1,
        weight: 1,
    }
}

fn problems() -> Vec<Problem> {
    vec![
        Problem {
            id: 1,
            time_limit_ms: 1000,
            memory_limit_kb: 262144,
            allowed_languages: Default::default(),
            test_cases: vec![
                sum_case(1, [1, 2, 3]),
                sum_case(2, [4, 5, 6]),
                sum_case(3, [0, 0, 1]),
            ],
            revision: 0,
        },
        Problem {
            id: 2,
            time_limit_ms: 200,
            memory_limit_kb: 262144,
            allowed_languages: Default::default(),
            test_cases: vec![sum_case(1, [1, 1, 1])],
            revision: 0,
        },
        Problem {
            id: 3,
            time_limit_ms: 1000,
            memory_limit_kb: 262144,
            allowed_languages: Default::default(),
            test_cases: Vec::new(),
            revision: 0,
        },
        Problem {
            id: 4,
            time_limit_ms: 10_000,
            memory_limit_kb: 32768,
            allowed_languages: Default::default(),
            test_cases: vec![sum_case(1, [1, 2, 3])],
            revision: 0,
        },
    ]
}

fn languages() -> Vec<LanguageConfig> {
    let strings = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        LanguageConfig {
            name: "sh".to_string(),
            file_name: "main.sh".to_string(),
            compile: None,
            run: strings(&["/bin/sh", "%INPUT%"]),
            memory_overhead_kb: 0,
        },
        // Checked syntax first, like a compiler would
        LanguageConfig {
            name: "sh-checked".to_string(),
            file_name: "main.sh".to_string(),
            compile: Some(strings(&["/bin/sh", "-n", "%INPUT%"])),
            run: strings(&["/bin/sh", "%INPUT%"]),
            memory_overhead_kb: 0,
        },
    ]
}

fn process_runner(dir: &Path, id: u8) -> ProcessRunner {
    ProcessRunner::with_dirs(
        id,
        dir.join(format!("scratch-{id}")),
        dir.join(format!("cache-{id}")),
    )
    .unwrap()
}

async fn setup_with(
    config: JudgeConfig,
    sandbox: impl FnOnce(&Path) -> Arc<dyn SandboxRunner>,
) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::init_db(dir.path().join("judge.sqlite3")).await.unwrap();
    let scheduler = Arc::new(Scheduler::new(
        pool,
        Arc::new(ProblemCatalog::new(problems())),
        Arc::new(Toolchain::new(languages())),
        config,
    ));

    let token = CancellationToken::new();
    tokio::spawn(worker(
        1,
        sandbox(dir.path()),
        scheduler.clone(),
        token.clone(),
    ));

    TestEnv {
        scheduler,
        token,
        dir,
    }
}

async fn setup() -> TestEnv {
    setup_with(JudgeConfig::default(), |dir| Arc::new(process_runner(dir, 1))).await
}

fn new_submission(problem_id: u32, language: &str, source: &str) -> NewSubmission {
    NewSubmission {
        event_id: 1,
        problem_id,
        user_id: 1,
        team_id: None,
        language: language.to_string(),
        source_code: source.to_string(),
    }
}

async fn submit_and_wait(env: &TestEnv, body: NewSubmission) -> Submission {
    let admission = env.scheduler.enqueue(body).await.unwrap();
    wait_for_verdict(env, admission.id).await
}

async fn wait_for_verdict(env: &TestEnv, id: u32) -> Submission {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let submission = env.scheduler.get(id).await.unwrap();
        if submission.status.is_terminal() {
            return submission;
        }
        assert!(Instant::now() < deadline, "submission {id} never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correct_program_is_accepted() {
    let env = setup().await;
    let judged = submit_and_wait(&env, new_submission(1, "sh", SUM_SCRIPT)).await;

    assert_eq!(judged.status, SubmissionStatus::Accepted);
    assert_eq!(judged.score, Some(100));
    assert_eq!(judged.attempts, 1);
    assert_eq!(judged.results.len(), 3);
    assert!(judged.results.iter().all(|r| r.passed));
    let ids: Vec<u32> = judged.results.iter().map(|r| r.test_case_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(judged.judged_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_output_scores_proportionally() {
    let env = setup().await;
    // Right for the first test case only, and without a trailing newline
    let judged = submit_and_wait(&env, new_submission(1, "sh", "printf 6")).await;

    assert_eq!(judged.status, SubmissionStatus::WrongAnswer);
    assert_eq!(judged.score, Some(33));
    let passed: Vec<bool> = judged.results.iter().map(|r| r.passed).collect();
    assert_eq!(passed, vec![true, false, false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_error_runs_no_tests() {
    let env = setup().await;
    let judged = submit_and_wait(&env, new_submission(1, "sh-checked", "if then fi (")).await;

    assert_eq!(judged.status, SubmissionStatus::CompileError);
    assert_eq!(judged.score, Some(0));
    assert!(judged.results.is_empty());
    assert!(!judged.compile_output.unwrap_or_default().is_empty());

    let fine = submit_and_wait(&env, new_submission(1, "sh-checked", SUM_SCRIPT)).await;
    assert_eq!(fine.status, SubmissionStatus::Accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_error_and_time_limit() {
    let env = setup().await;

    let crashed = submit_and_wait(&env, new_submission(1, "sh", "echo oops >&2\nexit 3")).await;
    assert_eq!(crashed.status, SubmissionStatus::RuntimeError);
    assert_eq!(crashed.score, Some(0));
    assert_eq!(crashed.results.len(), 3);
    assert!(crashed.results[0].diagnostic.is_some());

    // Correct output, too late: never reported as a wrong answer
    let slow = submit_and_wait(&env, new_submission(2, "sh", "sleep 5\necho 3")).await;
    assert_eq!(slow.status, SubmissionStatus::Tle);
    assert!(slow.results[0].time_ms < 5000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_hog_exceeds_memory_limit() {
    let env = setup().await;
    // The shell holds the whole substitution in memory
    let source = "x=$(head -c 100000000 /dev/zero | tr '\\0' a)\necho 6";
    let judged = submit_and_wait(&env, new_submission(4, "sh", source)).await;

    assert_eq!(judged.status, SubmissionStatus::Mle);
    assert_eq!(judged.score, Some(0));
    assert!(judged.memory_used_kb.unwrap() > 32768);
    assert!(!judged.results[0].passed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_problem_without_tests_is_an_error() {
    let env = setup().await;
    let judged = submit_and_wait(&env, new_submission(3, "sh", SUM_SCRIPT)).await;

    assert_eq!(judged.status, SubmissionStatus::Error);
    assert_eq!(judged.score, Some(0));
    assert_eq!(judged.diagnostic.as_deref(), Some(NO_TEST_CASES));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejudge_is_idempotent() {
    let env = setup().await;
    let first = submit_and_wait(&env, new_submission(1, "sh", "printf 6")).await;

    env.scheduler.rejudge(first.id).await.unwrap();
    let second = wait_for_verdict(&env, first.id).await;

    assert_eq!(second.status, first.status);
    assert_eq!(second.score, first.score);
    let passed = |s: &Submission| s.results.iter().map(|r| r.passed).collect::<Vec<_>>();
    assert_eq!(passed(&second), passed(&first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_outage_is_retried() {
    let config = JudgeConfig {
        retry_delay_ms: 0,
        ..Default::default()
    };
    let env = setup_with(config, |dir| {
        Arc::new(FlakyRunner {
            inner: process_runner(dir, 1),
            failures: AtomicU32::new(1),
        })
    })
    .await;

    let judged = submit_and_wait(&env, new_submission(1, "sh", SUM_SCRIPT)).await;
    assert_eq!(judged.status, SubmissionStatus::Accepted);
    assert_eq!(judged.attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistent_outage_ends_in_error() {
    let config = JudgeConfig {
        retry_delay_ms: 0,
        max_attempts: 2,
        ..Default::default()
    };
    let env = setup_with(config, |dir| {
        Arc::new(FlakyRunner {
            inner: process_runner(dir, 1),
            failures: AtomicU32::new(u32::MAX),
        })
    })
    .await;

    let judged = submit_and_wait(&env, new_submission(1, "sh", SUM_SCRIPT)).await;
    assert_eq!(judged.status, SubmissionStatus::Error);
    assert_eq!(judged.attempts, 2);
    assert!(judged.diagnostic.unwrap().starts_with("sandbox unavailable"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_requeues_interrupted_work() {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::init_db(dir.path().join("judge.sqlite3")).await.unwrap();

    // State left behind by a crashed process
    let body = new_submission(1, "sh", SUM_SCRIPT);
    let interrupted = db::create_submission(&pool, &body).await.unwrap().id;
    db::transition_status(&pool, interrupted, SubmissionStatus::Pending, SubmissionStatus::Queued)
        .await
        .unwrap();
    db::start_running(&pool, interrupted).await.unwrap().unwrap();
    let never_queued = db::create_submission(&pool, &body).await.unwrap().id;

    let scheduler = Arc::new(Scheduler::new(
        pool,
        Arc::new(ProblemCatalog::new(problems())),
        Arc::new(Toolchain::new(languages())),
        JudgeConfig {
            queue_capacity: 1,
            ..Default::default()
        },
    ));
    assert_eq!(scheduler.recover().await.unwrap(), 2);
    assert_eq!(scheduler.queue.position(interrupted), Some(1));
    assert_eq!(scheduler.queue.position(never_queued), Some(2));

    let token = CancellationToken::new();
    let env = TestEnv {
        scheduler: scheduler.clone(),
        token: token.clone(),
        dir,
    };
    tokio::spawn(worker(
        1,
        Arc::new(process_runner(env.dir.path(), 1)),
        scheduler,
        token,
    ));

    assert_eq!(
        wait_for_verdict(&env, interrupted).await.status,
        SubmissionStatus::Accepted
    );
    assert_eq!(
        wait_for_verdict(&env, never_queued).await.status,
        SubmissionStatus::Accepted
    );
}

#[test]
fn test_suite_ceiling_skips_remaining_tests() {
    let dir = tempfile::tempdir().unwrap();
    let runner = process_runner(dir.path(), 2);
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join("main.sh"), "sleep 1\necho 6\n").unwrap();

    let problem = &problems()[0];
    let artifact = Artifact {
        run_command: vec!["/bin/sh".to_string(), "main.sh".to_string()],
        memory_overhead_kb: 0,
    };
    let results = Evaluator {
        problem,
        artifact: &artifact,
        staging: &staging,
        output_limit_kb: 1024,
        diagnostic_limit: 256,
        deadline: Instant::now() + Duration::from_millis(100),
    }
    .run(&runner)
    .unwrap();

    let statuses: Vec<SubmissionStatus> = results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![SubmissionStatus::Timeout; 3]);
    assert!(results.iter().all(|r| !r.passed));

    let verdict = aggregate(problem, results);
    assert_eq!(verdict.status, SubmissionStatus::Timeout);
    assert_eq!(verdict.score, 0);
}
