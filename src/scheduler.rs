use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::aggregator::Verdict;
use crate::catalog::ProblemCatalog;
use crate::config::JudgeConfig;
use crate::database as db;
use crate::error::{JudgeError, JudgeResult, SandboxError};
use crate::queue::{QueueEntry, SubmissionQueue};
use crate::submission::{NewSubmission, Priority, Submission, SubmissionStatus};
use crate::toolchain::Toolchain;

/// Answer to an accepted submission or rejudge request
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub id: u32,
    pub status: SubmissionStatus,
    pub queue_position: usize,
    pub submitted_at: String,
}

/// Admission control and lifecycle of submissions
///
/// Shared by the HTTP handlers and the worker pool. Every status change goes
/// through a compare-and-set in the database, so handlers and workers racing
/// on the same submission cannot both win.
pub struct Scheduler {
    pub queue: Arc<SubmissionQueue>,
    pub pool: SqlitePool,
    pub catalog: Arc<ProblemCatalog>,
    pub toolchain: Arc<Toolchain>,
    pub config: JudgeConfig,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        catalog: Arc<ProblemCatalog>,
        toolchain: Arc<Toolchain>,
        config: JudgeConfig,
    ) -> Self {
        Self {
            queue: Arc::new(SubmissionQueue::new(config.queue_capacity)),
            pool,
            catalog,
            toolchain,
            config,
        }
    }

    /// Validates, persists and queues a new submission
    pub async fn enqueue(&self, body: NewSubmission) -> JudgeResult<Admission> {
        let problem = self
            .catalog
            .get(body.problem_id)
            .ok_or_else(|| JudgeError::NotFound(format!("problem {}", body.problem_id)))?;

        if self.toolchain.get(&body.language).is_none() {
            return Err(JudgeError::Configuration(format!(
                "language {} is not supported",
                body.language
            )));
        }
        if !problem.allows_language(&body.language) {
            return Err(JudgeError::Configuration(format!(
                "language {} is not allowed for problem {}",
                body.language, problem.id
            )));
        }

        self.check_cooldown(&body).await?;

        let reservation = self.queue.reserve()?;
        let submission = db::create_submission(&self.pool, &body).await?;

        let queued = db::transition_status(
            &self.pool,
            submission.id,
            SubmissionStatus::Pending,
            SubmissionStatus::Queued,
        )
        .await;
        if !matches!(queued, Ok(true)) {
            if let Err(e) = db::discard_submission(&self.pool, submission.id).await {
                log::error!("Failed to discard rejected submission {}: {e}", submission.id);
            }
            return Err(match queued {
                Err(e) => e.into(),
                _ => JudgeError::InvalidState {
                    id: submission.id,
                    status: SubmissionStatus::Pending,
                },
            });
        }

        let queue_position = reservation.commit(QueueEntry {
            submission_id: submission.id,
            priority: Priority::Normal,
            submitted_at: submission.submitted_at.clone(),
        });
        log::info!(
            "Submission {} queued at position {queue_position}",
            submission.id
        );

        Ok(Admission {
            id: submission.id,
            status: SubmissionStatus::Pending,
            queue_position,
            submitted_at: submission.submitted_at,
        })
    }

    /// Rejects a user's resubmission to a problem within the cooldown
    async fn check_cooldown(&self, body: &NewSubmission) -> JudgeResult<()> {
        let cooldown_ms = self.config.submission_cooldown_ms;
        if cooldown_ms == 0 {
            return Ok(());
        }
        let Some(last) = db::latest_submission_at(&self.pool, body.user_id, body.problem_id).await?
        else {
            return Ok(());
        };

        let elapsed_ms = DateTime::parse_from_rfc3339(&last)
            .map(|at| (Utc::now() - at.with_timezone(&Utc)).num_milliseconds().max(0) as u64)
            .unwrap_or(u64::MAX);
        if elapsed_ms < cooldown_ms {
            return Err(JudgeError::Cooldown {
                retry_after_ms: cooldown_ms - elapsed_ms,
            });
        }
        Ok(())
    }

    pub async fn get(&self, id: u32) -> JudgeResult<Submission> {
        db::fetch_submission(&self.pool, id)
            .await?
            .ok_or_else(|| JudgeError::NotFound(format!("submission {id}")))
    }

    /// Withdraws a submission that is still waiting in the queue
    pub async fn cancel(&self, id: u32) -> JudgeResult<Submission> {
        let submission = self.get(id).await?;
        if submission.status != SubmissionStatus::Queued {
            return Err(JudgeError::InvalidState {
                id,
                status: submission.status,
            });
        }

        // A worker may be claiming it right now; the status update decides
        if !db::cancel_submission(&self.pool, id).await? {
            let current = self.get(id).await?;
            return Err(JudgeError::InvalidState {
                id,
                status: current.status,
            });
        }
        self.queue.cancel(id);

        log::info!("Submission {id} cancelled");
        self.get(id).await
    }

    /// Starts a new judging cycle for a finished submission
    ///
    /// The submission goes back through the whole forward chain with
    /// rejudge priority, so live traffic is served first.
    pub async fn rejudge(&self, id: u32) -> JudgeResult<Admission> {
        let submission = self.get(id).await?;
        if !submission.status.is_terminal() {
            return Err(JudgeError::InvalidState {
                id,
                status: submission.status,
            });
        }

        let reservation = self.queue.reserve()?;
        if !db::reset_for_rejudge(&self.pool, id, submission.status).await? {
            let current = self.get(id).await?;
            return Err(JudgeError::InvalidState {
                id,
                status: current.status,
            });
        }
        if !db::transition_status(
            &self.pool,
            id,
            SubmissionStatus::Pending,
            SubmissionStatus::Queued,
        )
        .await?
        {
            return Err(JudgeError::InvalidState {
                id,
                status: SubmissionStatus::Pending,
            });
        }

        let queue_position = reservation.commit(QueueEntry {
            submission_id: id,
            priority: Priority::Rejudge,
            submitted_at: submission.submitted_at.clone(),
        });
        log::info!("Submission {id} requeued for rejudge at position {queue_position}");

        Ok(Admission {
            id,
            status: SubmissionStatus::Pending,
            queue_position,
            submitted_at: submission.submitted_at,
        })
    }

    /// Requeues everything a previous run left unfinished
    ///
    /// Runs once at startup, before any worker pops. Capacity is not checked:
    /// these submissions were admitted already.
    pub async fn recover(&self) -> JudgeResult<usize> {
        let unfinished = db::fetch_unfinished(&self.pool).await?;
        let mut recovered = 0;

        for (entry, status) in unfinished {
            let id = entry.submission_id;
            if status != SubmissionStatus::Queued
                && !db::transition_status(&self.pool, id, status, SubmissionStatus::Queued).await?
            {
                log::warn!("Submission {id} changed state during recovery, skipped");
                continue;
            }
            self.queue.requeue(entry);
            recovered += 1;
        }

        if recovered > 0 {
            log::info!("Recovered {recovered} unfinished submissions");
        }
        Ok(recovered)
    }

    /// Handles a sandbox infrastructure failure while judging `submission`
    ///
    /// The submission goes back to the queue after a pause, unless it has
    /// used up its attempts, in which case it is finished as `error`.
    pub async fn retry_or_fail(
        &self,
        submission: &Submission,
        error: &SandboxError,
    ) -> JudgeResult<()> {
        let id = submission.id;

        if submission.attempts >= self.config.max_attempts {
            log::error!(
                "Submission {id} failed {} times on sandbox errors, giving up: {error}",
                submission.attempts
            );
            let reason = JudgeError::SandboxUnavailable(error.to_string());
            db::save_verdict(&self.pool, id, &Verdict::error(reason.to_string())).await?;
            return Ok(());
        }

        log::warn!(
            "Submission {id} hit a sandbox error on attempt {}, retrying: {error}",
            submission.attempts
        );
        if !db::transition_status(
            &self.pool,
            id,
            SubmissionStatus::Running,
            SubmissionStatus::Queued,
        )
        .await?
        {
            return Ok(());
        }

        let entry = QueueEntry {
            submission_id: id,
            priority: submission.priority,
            submitted_at: submission.submitted_at.clone(),
        };
        let queue = Arc::clone(&self.queue);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.requeue(entry);
        });

        Ok(())
    }
}
