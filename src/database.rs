use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};

use crate::aggregator::Verdict;
use crate::create_timestamp;
use crate::leaderboard::{LeaderboardEntry, Participant};
use crate::queue::QueueEntry;
use crate::submission::{
    NewSubmission, Priority, Submission, SubmissionFilter, SubmissionStatus, TestResult,
};

const DATABASE_NAME: &str = "judge.sqlite3";

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS submissions (
        id                 INTEGER  PRIMARY KEY AUTOINCREMENT,
        event_id           INTEGER  NOT NULL,
        problem_id         INTEGER  NOT NULL,
        user_id            INTEGER  NOT NULL,
        team_id            INTEGER,
        language           TEXT     NOT NULL,
        source_code        TEXT     NOT NULL,
        status             TEXT     NOT NULL,
        score              INTEGER,
        execution_time_ms  INTEGER,
        memory_used_kb     INTEGER,
        compile_output     TEXT,
        diagnostic         TEXT,
        attempts           INTEGER  NOT NULL DEFAULT 0,
        priority           TEXT     NOT NULL,
        submitted_at       TEXT     NOT NULL,
        judged_at          TEXT,
        updated_at         TEXT     NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS submissions_event ON submissions (event_id, problem_id);",
    "CREATE INDEX IF NOT EXISTS submissions_status ON submissions (status);",
    r"
    CREATE TABLE IF NOT EXISTS submission_results (
        submission_id  INTEGER  NOT NULL,
        position       INTEGER  NOT NULL,
        test_case_id   INTEGER  NOT NULL,
        passed         INTEGER  NOT NULL,
        status         TEXT     NOT NULL,
        time_ms        INTEGER  NOT NULL,
        memory_kb      INTEGER  NOT NULL,
        diagnostic     TEXT,
        PRIMARY KEY (submission_id, position),
        FOREIGN KEY (submission_id) REFERENCES submissions (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS leaderboard_scores (
        event_id          INTEGER  NOT NULL,
        participant_kind  TEXT     NOT NULL,
        participant_id    INTEGER  NOT NULL,
        problem_id        INTEGER  NOT NULL,
        best_score        INTEGER  NOT NULL,
        last_submission   TEXT     NOT NULL,
        PRIMARY KEY (event_id, participant_kind, participant_id, problem_id)
    );",
];

const SUBMISSION_COLUMNS: &str = "id, event_id, problem_id, user_id, team_id, language, \
    source_code, status, score, execution_time_ms, memory_used_kb, compile_output, diagnostic, \
    attempts, priority, submitted_at, judged_at";

/// Statuses that take part in the leaderboard; judge-side failures do not
const JUDGED_CONDITION: &str =
    "score IS NOT NULL AND status NOT IN ('pending', 'queued', 'running', 'cancelled', 'error')";

pub fn get_db_path(custom: Option<&Path>) -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    if let Some(path) = custom {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        return Ok(path.to_path_buf());
    }

    let proj_dirs = ProjectDirs::from("", "", "judge")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();
    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    // Pragmas go through the connect options so every pooled connection gets them
    let options = SqliteConnectOptions::new()
        .filename(db_path.as_ref())
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(2))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect_with(options)
        .await?;

    let mut tx = db_pool.begin().await?;
    for sql in SCHEMA {
        sqlx::query(sql).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

#[derive(FromRow)]
struct SubmissionRow {
    id: i64,
    event_id: i64,
    problem_id: i64,
    user_id: i64,
    team_id: Option<i64>,
    language: String,
    source_code: String,
    status: String,
    score: Option<i64>,
    execution_time_ms: Option<i64>,
    memory_used_kb: Option<i64>,
    compile_output: Option<String>,
    diagnostic: Option<String>,
    attempts: i64,
    priority: String,
    submitted_at: String,
    judged_at: Option<String>,
}

impl SubmissionRow {
    fn into_submission(self, results: Vec<TestResult>) -> sqlx::Result<Submission> {
        Ok(Submission {
            id: self.id as u32,
            event_id: self.event_id as u32,
            problem_id: self.problem_id as u32,
            user_id: self.user_id as u32,
            team_id: self.team_id.map(|t| t as u32),
            language: self.language,
            source_code: self.source_code,
            status: self.status.parse().map_err(decode_error)?,
            score: self.score.map(|s| s as u32),
            execution_time_ms: self.execution_time_ms.map(|t| t as u64),
            memory_used_kb: self.memory_used_kb.map(|m| m as u64),
            compile_output: self.compile_output,
            diagnostic: self.diagnostic,
            attempts: self.attempts as u32,
            priority: self.priority.parse().map_err(decode_error)?,
            results,
            submitted_at: self.submitted_at,
            judged_at: self.judged_at,
        })
    }
}

#[derive(FromRow)]
struct ResultRow {
    submission_id: i64,
    test_case_id: i64,
    passed: bool,
    status: String,
    time_ms: i64,
    memory_kb: i64,
    diagnostic: Option<String>,
}

impl ResultRow {
    fn into_result(self) -> sqlx::Result<TestResult> {
        Ok(TestResult {
            test_case_id: self.test_case_id as u32,
            passed: self.passed,
            status: self.status.parse().map_err(decode_error)?,
            time_ms: self.time_ms as u64,
            memory_kb: self.memory_kb as u64,
            diagnostic: self.diagnostic,
        })
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// Inserts a new submission in `pending` and returns the stored record
pub async fn create_submission(
    pool: &SqlitePool,
    body: &NewSubmission,
) -> sqlx::Result<Submission> {
    let now = create_timestamp();

    let result = sqlx::query(
        r"
        INSERT INTO submissions (event_id, problem_id, user_id, team_id, language, source_code,
                                 status, priority, submitted_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(body.event_id as i64)
    .bind(body.problem_id as i64)
    .bind(body.user_id as i64)
    .bind(body.team_id.map(|t| t as i64))
    .bind(&body.language)
    .bind(&body.source_code)
    .bind(SubmissionStatus::Pending.as_str())
    .bind(Priority::Normal.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid() as u32;
    log::debug!("Created submission {id}");

    Ok(Submission {
        id,
        event_id: body.event_id,
        problem_id: body.problem_id,
        user_id: body.user_id,
        team_id: body.team_id,
        language: body.language.clone(),
        source_code: body.source_code.clone(),
        status: SubmissionStatus::Pending,
        score: None,
        execution_time_ms: None,
        memory_used_kb: None,
        compile_output: None,
        diagnostic: None,
        attempts: 0,
        priority: Priority::Normal,
        results: Vec::new(),
        submitted_at: now,
        judged_at: None,
    })
}

/// Deletes a submission that never made it into the queue
pub async fn discard_submission(pool: &SqlitePool, id: u32) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM submissions WHERE id = ? AND status = 'pending'")
        .bind(id as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// `submitted_at` of the user's latest submission to a problem
pub async fn latest_submission_at(
    pool: &SqlitePool,
    user_id: u32,
    problem_id: u32,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar("SELECT MAX(submitted_at) FROM submissions WHERE user_id = ? AND problem_id = ?")
        .bind(user_id as i64)
        .bind(problem_id as i64)
        .fetch_one(pool)
        .await
}

/// Compare-and-set of the status; returns whether the row changed
pub async fn transition_status(
    pool: &SqlitePool,
    id: u32,
    from: SubmissionStatus,
    to: SubmissionStatus,
) -> sqlx::Result<bool> {
    if !from.can_transition_to(to) {
        log::error!("Refusing illegal transition {from} -> {to} of submission {id}");
        return Ok(false);
    }

    let updated = sqlx::query(
        "UPDATE submissions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(create_timestamp())
    .bind(id as i64)
    .bind(from.as_str())
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

/// Moves a queued submission to `running` and counts the attempt
///
/// Returns `None` when the submission is no longer queued, e.g. cancelled
/// after it was popped.
pub async fn start_running(pool: &SqlitePool, id: u32) -> sqlx::Result<Option<Submission>> {
    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = 'running', attempts = attempts + 1, updated_at = ?
        WHERE id = ? AND status = 'queued'
        ",
    )
    .bind(create_timestamp())
    .bind(id as i64)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }
    fetch_submission(pool, id).await
}

pub async fn fetch_submission(pool: &SqlitePool, id: u32) -> sqlx::Result<Option<Submission>> {
    let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?");
    let Some(row) = sqlx::query_as::<_, SubmissionRow>(&sql)
        .bind(id as i64)
        .fetch_optional(pool)
        .await?
    else {
        return Ok(None);
    };

    let results = sqlx::query_as::<_, ResultRow>(
        r"
        SELECT submission_id, test_case_id, passed, status, time_ms, memory_kb, diagnostic
        FROM submission_results
        WHERE submission_id = ?
        ORDER BY position
        ",
    )
    .bind(id as i64)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(ResultRow::into_result)
    .collect::<sqlx::Result<Vec<_>>>()?;

    row.into_submission(results).map(Some)
}

/// Lists submissions matching the filter, newest first
pub async fn list_submissions(
    pool: &SqlitePool,
    filter: &SubmissionFilter,
) -> sqlx::Result<Vec<Submission>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE 1=1"
    ));

    if let Some(event_id) = filter.event_id {
        qb.push(" AND event_id = ").push_bind(event_id as i64);
    }
    if let Some(problem_id) = filter.problem_id {
        qb.push(" AND problem_id = ").push_bind(problem_id as i64);
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id as i64);
    }
    if let Some(team_id) = filter.team_id {
        qb.push(" AND team_id = ").push_bind(team_id as i64);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    qb.push(" ORDER BY submitted_at DESC, id DESC");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows = qb.build_query_as::<SubmissionRow>().fetch_all(pool).await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT submission_id, test_case_id, passed, status, time_ms, memory_kb, diagnostic \
         FROM submission_results WHERE submission_id IN (",
    );
    let mut ids = qb.separated(", ");
    for row in &rows {
        ids.push_bind(row.id);
    }
    ids.push_unseparated(") ORDER BY submission_id, position");

    let mut results: HashMap<i64, Vec<TestResult>> = HashMap::new();
    for row in qb.build_query_as::<ResultRow>().fetch_all(pool).await? {
        let submission_id = row.submission_id;
        results
            .entry(submission_id)
            .or_default()
            .push(row.into_result()?);
    }

    rows.into_iter()
        .map(|row| {
            let cases = results.remove(&row.id).unwrap_or_default();
            row.into_submission(cases)
        })
        .collect()
}

/// Persists a verdict, its ordered results and the leaderboard update at once
///
/// Returns `false` without writing anything when the submission is no longer
/// running.
pub async fn save_verdict(pool: &SqlitePool, id: u32, verdict: &Verdict) -> sqlx::Result<bool> {
    let now = create_timestamp();
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, score = ?, execution_time_ms = ?, memory_used_kb = ?,
            compile_output = ?, diagnostic = ?, judged_at = ?, updated_at = ?
        WHERE id = ? AND status = 'running'
        ",
    )
    .bind(verdict.status.as_str())
    .bind(verdict.score as i64)
    .bind(verdict.execution_time_ms as i64)
    .bind(verdict.memory_used_kb as i64)
    .bind(&verdict.compile_output)
    .bind(&verdict.diagnostic)
    .bind(&now)
    .bind(&now)
    .bind(id as i64)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query("DELETE FROM submission_results WHERE submission_id = ?")
        .bind(id as i64)
        .execute(&mut *tx)
        .await?;

    for (position, result) in verdict.results.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO submission_results
                (submission_id, position, test_case_id, passed, status, time_ms, memory_kb, diagnostic)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id as i64)
        .bind(position as i64)
        .bind(result.test_case_id as i64)
        .bind(result.passed)
        .bind(result.status.as_str())
        .bind(result.time_ms as i64)
        .bind(result.memory_kb as i64)
        .bind(&result.diagnostic)
        .execute(&mut *tx)
        .await?;
    }

    refresh_leaderboard(&mut tx, id).await?;

    tx.commit().await?;
    Ok(true)
}

/// Marks a queued submission as cancelled
pub async fn cancel_submission(pool: &SqlitePool, id: u32) -> sqlx::Result<bool> {
    let now = create_timestamp();
    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = 'cancelled', score = 0, judged_at = ?, updated_at = ?
        WHERE id = ? AND status = 'queued'
        ",
    )
    .bind(&now)
    .bind(&now)
    .bind(id as i64)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

/// Starts a new judging cycle for a terminal submission
///
/// Clears the previous outcome and results, and withdraws the old score from
/// the leaderboard. `current` must be the status the caller observed.
pub async fn reset_for_rejudge(
    pool: &SqlitePool,
    id: u32,
    current: SubmissionStatus,
) -> sqlx::Result<bool> {
    if !current.can_transition_to(SubmissionStatus::Pending) {
        return Ok(false);
    }

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = 'pending', score = NULL, execution_time_ms = NULL, memory_used_kb = NULL,
            compile_output = NULL, diagnostic = NULL, judged_at = NULL, attempts = 0,
            priority = ?, updated_at = ?
        WHERE id = ? AND status = ?
        ",
    )
    .bind(Priority::Rejudge.as_str())
    .bind(create_timestamp())
    .bind(id as i64)
    .bind(current.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query("DELETE FROM submission_results WHERE submission_id = ?")
        .bind(id as i64)
        .execute(&mut *tx)
        .await?;
    refresh_leaderboard(&mut tx, id).await?;

    tx.commit().await?;
    Ok(true)
}

/// Submissions a previous run left unfinished, oldest first
pub async fn fetch_unfinished(
    pool: &SqlitePool,
) -> sqlx::Result<Vec<(QueueEntry, SubmissionStatus)>> {
    let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
        r"
        SELECT id, status, priority, submitted_at
        FROM submissions
        WHERE status IN ('pending', 'queued', 'running')
        ORDER BY submitted_at, id
        ",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(id, status, priority, submitted_at)| {
            let entry = QueueEntry {
                submission_id: id as u32,
                priority: priority.parse().map_err(decode_error)?,
                submitted_at,
            };
            Ok((entry, status.parse().map_err(decode_error)?))
        })
        .collect()
}

/// Recomputes the best score of the submission's participant on its problem
async fn refresh_leaderboard(conn: &mut SqliteConnection, submission_id: u32) -> sqlx::Result<()> {
    let (event_id, problem_id, user_id, team_id): (i64, i64, i64, Option<i64>) = sqlx::query_as(
        "SELECT event_id, problem_id, user_id, team_id FROM submissions WHERE id = ?",
    )
    .bind(submission_id as i64)
    .fetch_one(&mut *conn)
    .await?;

    let participant = Participant::of(user_id as u32, team_id.map(|t| t as u32));
    let owner_condition = match participant {
        Participant::Team(_) => "team_id = ?",
        Participant::User(_) => "team_id IS NULL AND user_id = ?",
    };

    let sql = format!(
        "SELECT MAX(score), MAX(submitted_at) FROM submissions \
         WHERE event_id = ? AND problem_id = ? AND {owner_condition} AND {JUDGED_CONDITION}"
    );
    let (best_score, last_submission): (Option<i64>, Option<String>) = sqlx::query_as(&sql)
        .bind(event_id)
        .bind(problem_id)
        .bind(participant.id() as i64)
        .fetch_one(&mut *conn)
        .await?;

    match best_score.zip(last_submission) {
        Some((best_score, last_submission)) => {
            sqlx::query(
                r"
                INSERT INTO leaderboard_scores
                    (event_id, participant_kind, participant_id, problem_id, best_score, last_submission)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (event_id, participant_kind, participant_id, problem_id)
                DO UPDATE SET best_score = excluded.best_score,
                              last_submission = excluded.last_submission
                ",
            )
            .bind(event_id)
            .bind(participant.kind())
            .bind(participant.id() as i64)
            .bind(problem_id)
            .bind(best_score)
            .bind(last_submission)
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query(
                r"
                DELETE FROM leaderboard_scores
                WHERE event_id = ? AND participant_kind = ? AND participant_id = ? AND problem_id = ?
                ",
            )
            .bind(event_id)
            .bind(participant.kind())
            .bind(participant.id() as i64)
            .bind(problem_id)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// Per-participant totals of an event, unranked
pub async fn fetch_leaderboard(
    pool: &SqlitePool,
    event_id: u32,
) -> sqlx::Result<Vec<LeaderboardEntry>> {
    let rows: Vec<(String, i64, i64, i64, String)> = sqlx::query_as(
        r"
        SELECT participant_kind, participant_id, SUM(best_score),
               SUM(CASE WHEN best_score >= 100 THEN 1 ELSE 0 END), MAX(last_submission)
        FROM leaderboard_scores
        WHERE event_id = ?
        GROUP BY participant_kind, participant_id
        ",
    )
    .bind(event_id as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(kind, id, total_score, problems_solved, last_submission)| {
            let participant = match kind.as_str() {
                "team" => Participant::Team(id as u32),
                "user" => Participant::User(id as u32),
                other => return Err(decode_error(format!("unknown participant kind: {other}"))),
            };
            Ok(LeaderboardEntry {
                participant,
                total_score: total_score as u32,
                problems_solved: problems_solved as u32,
                last_submission,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Verdict;

    async fn pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("judge.sqlite3")).await.unwrap();
        (pool, dir)
    }

    fn body(user_id: u32, team_id: Option<u32>) -> NewSubmission {
        NewSubmission {
            event_id: 1,
            problem_id: 1,
            user_id,
            team_id,
            language: "python".to_string(),
            source_code: "print(6)".to_string(),
        }
    }

    async fn judged(pool: &SqlitePool, body: &NewSubmission, score: u32) -> u32 {
        let id = create_submission(pool, body).await.unwrap().id;
        assert!(transition_status(pool, id, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap());
        assert!(start_running(pool, id).await.unwrap().is_some());
        let mut verdict = Verdict::error("x");
        verdict.status = if score == 100 {
            SubmissionStatus::Accepted
        } else {
            SubmissionStatus::WrongAnswer
        };
        verdict.score = score;
        verdict.diagnostic = None;
        assert!(save_verdict(pool, id, &verdict).await.unwrap());
        id
    }

    #[tokio::test]
    async fn status_updates_are_compare_and_set() {
        let (pool, _dir) = pool().await;
        let id = create_submission(&pool, &body(1, None)).await.unwrap().id;

        // Skipping queued is refused
        assert!(start_running(&pool, id).await.unwrap().is_none());
        assert!(!transition_status(&pool, id, SubmissionStatus::Pending, SubmissionStatus::Running).await.unwrap());

        assert!(transition_status(&pool, id, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap());
        assert!(!transition_status(&pool, id, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap());

        let running = start_running(&pool, id).await.unwrap().unwrap();
        assert_eq!(running.status, SubmissionStatus::Running);
        assert_eq!(running.attempts, 1);
        assert!(!cancel_submission(&pool, id).await.unwrap());
    }

    #[tokio::test]
    async fn verdict_is_saved_with_ordered_results() {
        let (pool, _dir) = pool().await;
        let id = create_submission(&pool, &body(1, None)).await.unwrap().id;
        transition_status(&pool, id, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap();
        start_running(&pool, id).await.unwrap();

        let results: Vec<TestResult> = [3, 1, 2]
            .into_iter()
            .map(|tc| TestResult {
                test_case_id: tc,
                passed: tc != 2,
                status: if tc == 2 { SubmissionStatus::WrongAnswer } else { SubmissionStatus::Accepted },
                time_ms: tc as u64,
                memory_kb: 100,
                diagnostic: None,
            })
            .collect();
        let verdict = Verdict {
            status: SubmissionStatus::WrongAnswer,
            score: 67,
            execution_time_ms: 3,
            memory_used_kb: 100,
            compile_output: None,
            diagnostic: None,
            results: results.clone(),
        };
        assert!(save_verdict(&pool, id, &verdict).await.unwrap());
        // A second save finds the submission no longer running
        assert!(!save_verdict(&pool, id, &verdict).await.unwrap());

        let stored = fetch_submission(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::WrongAnswer);
        assert_eq!(stored.score, Some(67));
        assert_eq!(stored.results, results);
        assert!(stored.judged_at.is_some());
    }

    #[tokio::test]
    async fn leaderboard_keeps_best_score_per_participant() {
        let (pool, _dir) = pool().await;
        judged(&pool, &body(1, None), 40).await;
        let best = judged(&pool, &body(1, None), 100).await;
        judged(&pool, &body(1, None), 70).await;
        judged(&pool, &body(2, Some(9)), 50).await;

        let mut entries = fetch_leaderboard(&pool, 1).await.unwrap();
        entries.sort_by_key(|e| e.participant.id());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].participant, Participant::User(1));
        assert_eq!(entries[0].total_score, 100);
        assert_eq!(entries[0].problems_solved, 1);
        assert_eq!(entries[1].participant, Participant::Team(9));
        assert_eq!(entries[1].total_score, 50);

        // Rejudging the best submission withdraws its score
        assert!(reset_for_rejudge(&pool, best, SubmissionStatus::Accepted).await.unwrap());
        let entries = fetch_leaderboard(&pool, 1).await.unwrap();
        let user = entries
            .iter()
            .find(|e| e.participant == Participant::User(1))
            .unwrap();
        assert_eq!(user.total_score, 70);

        let reset = fetch_submission(&pool, best).await.unwrap().unwrap();
        assert_eq!(reset.status, SubmissionStatus::Pending);
        assert_eq!(reset.priority, Priority::Rejudge);
        assert_eq!(reset.score, None);
    }

    #[tokio::test]
    async fn unfinished_and_filters() {
        let (pool, _dir) = pool().await;
        let done = judged(&pool, &body(1, None), 100).await;
        let waiting = create_submission(&pool, &body(2, None)).await.unwrap().id;

        let unfinished = fetch_unfinished(&pool).await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].0.submission_id, waiting);
        assert_eq!(unfinished[0].1, SubmissionStatus::Pending);

        let filter = SubmissionFilter {
            status: Some(SubmissionStatus::Accepted),
            ..Default::default()
        };
        let accepted = list_submissions(&pool, &filter).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id, done);

        let all = list_submissions(&pool, &SubmissionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, waiting);
    }

    #[tokio::test]
    async fn judge_failures_stay_off_the_leaderboard() {
        let (pool, _dir) = pool().await;
        judged(&pool, &body(1, None), 100).await;
        let before = fetch_leaderboard(&pool, 1).await.unwrap();

        let failed = create_submission(&pool, &body(1, None)).await.unwrap().id;
        transition_status(&pool, failed, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap();
        start_running(&pool, failed).await.unwrap();
        assert!(save_verdict(&pool, failed, &Verdict::error("sandbox unavailable: gone")).await.unwrap());

        let after = fetch_leaderboard(&pool, 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].last_submission, before[0].last_submission);

        // Only a judge failure: no entry at all
        let lone = create_submission(&pool, &body(3, None)).await.unwrap().id;
        transition_status(&pool, lone, SubmissionStatus::Pending, SubmissionStatus::Queued).await.unwrap();
        start_running(&pool, lone).await.unwrap();
        save_verdict(&pool, lone, &Verdict::error("no test cases configured")).await.unwrap();
        let entries = fetch_leaderboard(&pool, 1).await.unwrap();
        assert!(entries.iter().all(|e| e.participant != Participant::User(3)));
    }

    #[tokio::test]
    async fn latest_submission_is_per_user_and_problem() {
        let (pool, _dir) = pool().await;
        assert_eq!(latest_submission_at(&pool, 1, 1).await.unwrap(), None);

        create_submission(&pool, &body(1, None)).await.unwrap();
        let last = create_submission(&pool, &body(1, None)).await.unwrap();
        create_submission(&pool, &body(2, None)).await.unwrap();

        assert_eq!(
            latest_submission_at(&pool, 1, 1).await.unwrap(),
            Some(last.submitted_at)
        );
        assert_eq!(latest_submission_at(&pool, 1, 2).await.unwrap(), None);
    }
}
