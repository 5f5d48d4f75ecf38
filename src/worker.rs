use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::aggregator::{Verdict, aggregate};
use crate::catalog::Problem;
use crate::config::{JudgeConfig, LanguageConfig};
use crate::database as db;
use crate::error::{JudgeError, SandboxError};
use crate::evaluator::Evaluator;
use crate::sandbox::{SandboxRunner, clear_dir, copy_dir_contents};
use crate::scheduler::Scheduler;
use crate::submission::Submission;
use crate::toolchain::Toolchain;

/// Pulls submissions from the queue and judges them on its own sandbox
pub async fn worker(
    id: u8,
    sandbox: Arc<dyn SandboxRunner>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            entry = scheduler.queue.pop() => {
                judge_submission(id, &sandbox, &scheduler, entry.submission_id).await;
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

async fn judge_submission(
    id: u8,
    sandbox: &Arc<dyn SandboxRunner>,
    scheduler: &Scheduler,
    submission_id: u32,
) {
    // 1. Claim the submission
    let submission = match db::start_running(&scheduler.pool, submission_id).await {
        Ok(Some(submission)) => submission,
        Ok(None) => {
            log::info!("Submission {submission_id} is no longer queued, skipped by worker {id}");
            return;
        }
        Err(e) => {
            log::error!("Failed to start submission {submission_id} on worker {id}: {e}");
            return;
        }
    };
    log::info!(
        "Worker {id} judging submission {submission_id} (attempt {})",
        submission.attempts
    );

    // 2. Take a problem snapshot and the language setup
    let outcome = match judging_inputs(scheduler, &submission) {
        Err(verdict) => Ok(verdict),
        Ok((problem, language)) => {
            let sandbox = Arc::clone(sandbox);
            let toolchain = Arc::clone(&scheduler.toolchain);
            let config = scheduler.config.clone();
            let source = submission.source_code.clone();
            let attempt = submission.attempts;

            // 3. Run the sandbox work off the async runtime
            let handle = tokio::task::spawn_blocking(move || {
                judge_blocking(
                    sandbox.as_ref(),
                    &toolchain,
                    &problem,
                    &language,
                    &source,
                    &config,
                    &format!("{submission_id}-{attempt}"),
                )
            });
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Judging submission {submission_id} panicked on worker {id}: {e}");
                    Ok(Verdict::error("internal judge error"))
                }
            }
        }
    };

    // 4. Persist, or hand the submission back after an infrastructure failure
    let saved = match outcome {
        Ok(verdict) => {
            log::info!(
                "Submission {submission_id} finished on worker {id}: {} ({})",
                verdict.status,
                verdict.score
            );
            db::save_verdict(&scheduler.pool, submission_id, &verdict)
                .await
                .map(|_| ())
                .map_err(JudgeError::from)
        }
        Err(e) => scheduler.retry_or_fail(&submission, &e).await,
    };
    if let Err(e) = saved {
        log::error!("Failed to save submission {submission_id} result: {e}");
    }
}

/// Resolves the problem snapshot and language of a running submission
///
/// Either can have disappeared since admission, e.g. after a restart with a
/// different configuration; that ends the submission as `error`.
fn judging_inputs(
    scheduler: &Scheduler,
    submission: &Submission,
) -> Result<(Arc<Problem>, LanguageConfig), Verdict> {
    let problem = scheduler.catalog.get(submission.problem_id).ok_or_else(|| {
        Verdict::error(
            JudgeError::Configuration(format!(
                "problem {} is not configured",
                submission.problem_id
            ))
            .to_string(),
        )
    })?;

    let language = scheduler
        .toolchain
        .get(&submission.language)
        .filter(|_| problem.allows_language(&submission.language))
        .cloned()
        .ok_or_else(|| {
            Verdict::error(
                JudgeError::Configuration(format!(
                    "language {} is not available for problem {}",
                    submission.language, problem.id
                ))
                .to_string(),
            )
        })?;

    Ok((problem, language))
}

/// Compiles and evaluates one submission on the given sandbox
///
/// Blocks for the whole test suite. Errors are sandbox infrastructure
/// failures only.
pub fn judge_blocking(
    sandbox: &dyn SandboxRunner,
    toolchain: &Toolchain,
    problem: &Problem,
    language: &LanguageConfig,
    source: &str,
    config: &JudgeConfig,
    staging_name: &str,
) -> Result<Verdict, SandboxError> {
    if problem.test_cases.is_empty() {
        return Ok(aggregate(problem, Vec::new()));
    }

    let compiled = toolchain.prepare(sandbox, language, source, config.diagnostic_limit)?;
    let Some(artifact) = compiled.artifact else {
        log::info!(
            "Compilation failed on sandbox {} after {}ms",
            sandbox.id(),
            compiled.time_ms
        );
        return Ok(Verdict::compile_error(compiled.diagnostics));
    };
    if language.compile.is_some() {
        log::debug!("Compiled on sandbox {} in {}ms", sandbox.id(), compiled.time_ms);
    }

    let staging = sandbox.cache_dir().join(staging_name);
    let results = stage(sandbox.scratch_dir(), &staging).and_then(|()| {
        let ceiling = Duration::from_millis(problem.suite_ceiling_ms(config.safety_factor));
        Evaluator {
            problem,
            artifact: &artifact,
            staging: &staging,
            output_limit_kb: config.output_limit_kb,
            diagnostic_limit: config.diagnostic_limit,
            deadline: Instant::now() + ceiling,
        }
        .run(sandbox)
    });

    if let Err(e) = fs::remove_dir_all(&staging) {
        log::warn!("Failed to remove staging dir {}: {e}", staging.display());
    }
    if let Err(e) = sandbox.reset() {
        log::warn!("Failed to wipe sandbox {}: {e}", sandbox.id());
    }

    Ok(aggregate(problem, results?))
}

/// Copies the prepared scratch directory out of the sandbox
fn stage(scratch: &Path, staging: &Path) -> Result<(), SandboxError> {
    clear_dir(staging)?;
    copy_dir_contents(scratch, staging)?;
    Ok(())
}
