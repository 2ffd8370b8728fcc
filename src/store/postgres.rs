//! `sqlx`-backed `Store` implementation. Query shape follows the teacher's
//! `db/*.rs` modules (bind-by-position, `Row::get`, explicit `ON CONFLICT`
//! upserts) generalized from a single VM-trust table to the full FlakeGuard
//! schema. The relational store itself is an external collaborator per
//! `spec.md` §1 — this module is the thin adapter a deployment wires in;
//! nothing else in the crate depends on `sqlx` directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::domain::*;
use crate::error::{AppError, AppResult};

use super::{FlakeDetectionUpdate, RepositorySummary, RerunSlot, Store};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::InProgress => "in_progress",
        RunStatus::Completed => "completed",
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "queued" => RunStatus::Queued,
        "in_progress" => RunStatus::InProgress,
        _ => RunStatus::Completed,
    }
}

fn conclusion_str(c: Conclusion) -> &'static str {
    match c {
        Conclusion::Success => "success",
        Conclusion::Failure => "failure",
        Conclusion::Neutral => "neutral",
        Conclusion::Cancelled => "cancelled",
        Conclusion::TimedOut => "timed_out",
        Conclusion::ActionRequired => "action_required",
        Conclusion::Skipped => "skipped",
    }
}

fn parse_conclusion(s: &str) -> Option<Conclusion> {
    Some(match s {
        "success" => Conclusion::Success,
        "failure" => Conclusion::Failure,
        "neutral" => Conclusion::Neutral,
        "cancelled" => Conclusion::Cancelled,
        "timed_out" => Conclusion::TimedOut,
        "action_required" => Conclusion::ActionRequired,
        "skipped" => Conclusion::Skipped,
        _ => return None,
    })
}

fn detection_status_str(s: DetectionStatus) -> &'static str {
    match s {
        DetectionStatus::Pending => "pending",
        DetectionStatus::Quarantined => "quarantined",
        DetectionStatus::Dismissed => "dismissed",
        DetectionStatus::Stable => "stable",
    }
}

fn parse_detection_status(s: &str) -> DetectionStatus {
    match s {
        "quarantined" => DetectionStatus::Quarantined,
        "dismissed" => DetectionStatus::Dismissed,
        "stable" => DetectionStatus::Stable,
        _ => DetectionStatus::Pending,
    }
}

fn action_token_str(a: ActionToken) -> &'static str {
    a.as_str()
}

fn parse_action_token(s: &str) -> Option<ActionToken> {
    Some(match s {
        "quarantine" => ActionToken::Quarantine,
        "rerun_failed" => ActionToken::RerunFailed,
        "open_issue" => ActionToken::OpenIssue,
        "dismiss_flake" => ActionToken::DismissFlake,
        "mark_stable" => ActionToken::MarkStable,
        _ => return None,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_installation(&self, installation: Installation) -> AppResult<Installation> {
        let row = sqlx::query(
            r#"
            INSERT INTO installations
                (external_id, account_login, account_kind, repository_selection,
                 permissions, subscribed_events, created_at, updated_at, suspended_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8)
            ON CONFLICT (external_id) DO UPDATE SET
                account_login = EXCLUDED.account_login,
                account_kind = EXCLUDED.account_kind,
                repository_selection = EXCLUDED.repository_selection,
                permissions = EXCLUDED.permissions,
                subscribed_events = EXCLUDED.subscribed_events,
                updated_at = EXCLUDED.updated_at,
                suspended_at = EXCLUDED.suspended_at
            RETURNING id, external_id, account_login, account_kind, repository_selection,
                      permissions, subscribed_events, created_at, updated_at, suspended_at
            "#,
        )
        .bind(installation.external_id)
        .bind(&installation.account_login)
        .bind(&installation.account_kind)
        .bind(match installation.repository_selection {
            RepositorySelection::All => "all",
            RepositorySelection::Selected => "selected",
        })
        .bind(&installation.permissions)
        .bind(&installation.subscribed_events)
        .bind(Utc::now())
        .bind(installation.suspended_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(Installation {
            id: row.get("id"),
            external_id: row.get("external_id"),
            account_login: row.get("account_login"),
            account_kind: row.get("account_kind"),
            repository_selection: match row.get::<String, _>("repository_selection").as_str() {
                "selected" => RepositorySelection::Selected,
                _ => RepositorySelection::All,
            },
            permissions: row.get("permissions"),
            subscribed_events: row.get("subscribed_events"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            suspended_at: row.get("suspended_at"),
        })
    }

    async fn get_installation(&self, external_id: i64) -> AppResult<Option<Installation>> {
        let row = sqlx::query("SELECT * FROM installations WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(|row| Installation {
            id: row.get("id"),
            external_id: row.get("external_id"),
            account_login: row.get("account_login"),
            account_kind: row.get("account_kind"),
            repository_selection: match row.get::<String, _>("repository_selection").as_str() {
                "selected" => RepositorySelection::Selected,
                _ => RepositorySelection::All,
            },
            permissions: row.get("permissions"),
            subscribed_events: row.get("subscribed_events"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            suspended_at: row.get("suspended_at"),
        }))
    }

    async fn delete_installation(&self, external_id: i64) -> AppResult<()> {
        // Repositories (and everything they own, via FK ON DELETE CASCADE)
        // are removed by the database's cascade per the ownership rule in
        // spec §3; the installation row itself is the root of that cascade.
        sqlx::query("DELETE FROM installations WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn upsert_repository(&self, repository: Repository) -> AppResult<Repository> {
        let row = sqlx::query(
            r#"
            INSERT INTO repositories (external_id, owner, name, default_branch, installation_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                owner = EXCLUDED.owner,
                name = EXCLUDED.name,
                default_branch = EXCLUDED.default_branch,
                installation_id = EXCLUDED.installation_id
            RETURNING id, external_id, owner, name, default_branch, installation_id
            "#,
        )
        .bind(repository.external_id)
        .bind(&repository.owner)
        .bind(&repository.name)
        .bind(&repository.default_branch)
        .bind(repository.installation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(Repository {
            id: row.get("id"),
            external_id: row.get("external_id"),
            owner: row.get("owner"),
            name: row.get("name"),
            default_branch: row.get("default_branch"),
            installation_id: row.get("installation_id"),
        })
    }

    async fn get_repository(&self, external_id: i64) -> AppResult<Option<Repository>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(|row| Repository {
            id: row.get("id"),
            external_id: row.get("external_id"),
            owner: row.get("owner"),
            name: row.get("name"),
            default_branch: row.get("default_branch"),
            installation_id: row.get("installation_id"),
        }))
    }

    async fn get_repository_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> AppResult<Option<Repository>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE owner = $1 AND name = $2")
            .bind(owner)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(|row| Repository {
            id: row.get("id"),
            external_id: row.get("external_id"),
            owner: row.get("owner"),
            name: row.get("name"),
            default_branch: row.get("default_branch"),
            installation_id: row.get("installation_id"),
        }))
    }

    async fn list_repositories_for_installation(
        &self,
        installation_external_id: i64,
    ) -> AppResult<Vec<Repository>> {
        let rows = sqlx::query("SELECT * FROM repositories WHERE installation_id = $1")
            .bind(installation_external_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| Repository {
                id: row.get("id"),
                external_id: row.get("external_id"),
                owner: row.get("owner"),
                name: row.get("name"),
                default_branch: row.get("default_branch"),
                installation_id: row.get("installation_id"),
            })
            .collect())
    }

    async fn upsert_workflow_run(&self, run: WorkflowRun) -> AppResult<WorkflowRun> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs (external_id, repository_id, head_sha, branch, status, conclusion)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_id) DO UPDATE SET
                head_sha = EXCLUDED.head_sha,
                branch = EXCLUDED.branch,
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion
            RETURNING id, external_id, repository_id, head_sha, branch, status, conclusion
            "#,
        )
        .bind(run.external_id)
        .bind(run.repository_id)
        .bind(&run.head_sha)
        .bind(&run.branch)
        .bind(run_status_str(run.status))
        .bind(run.conclusion.map(conclusion_str))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(WorkflowRun {
            id: row.get("id"),
            external_id: row.get("external_id"),
            repository_id: row.get("repository_id"),
            head_sha: row.get("head_sha"),
            branch: row.get("branch"),
            status: parse_run_status(&row.get::<String, _>("status")),
            conclusion: row
                .get::<Option<String>, _>("conclusion")
                .and_then(|c| parse_conclusion(&c)),
        })
    }

    async fn get_workflow_run_by_external_id(&self, external_id: i64) -> AppResult<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(|row| WorkflowRun {
            id: row.get("id"),
            external_id: row.get("external_id"),
            repository_id: row.get("repository_id"),
            head_sha: row.get("head_sha"),
            branch: row.get("branch"),
            status: parse_run_status(&row.get::<String, _>("status")),
            conclusion: row
                .get::<Option<String>, _>("conclusion")
                .and_then(|c| parse_conclusion(&c)),
        }))
    }

    async fn get_workflow_run_by_head_sha(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT * FROM workflow_runs WHERE repository_id = $1 AND head_sha = $2 ORDER BY id DESC LIMIT 1",
        )
        .bind(repository_id)
        .bind(head_sha)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(|row| WorkflowRun {
            id: row.get("id"),
            external_id: row.get("external_id"),
            repository_id: row.get("repository_id"),
            head_sha: row.get("head_sha"),
            branch: row.get("branch"),
            status: parse_run_status(&row.get::<String, _>("status")),
            conclusion: row
                .get::<Option<String>, _>("conclusion")
                .and_then(|c| parse_conclusion(&c)),
        }))
    }

    async fn upsert_workflow_job(&self, job: WorkflowJob) -> AppResult<WorkflowJob> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_jobs
                (external_id, run_external_id, repository_id, name, status, conclusion, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_id) DO UPDATE SET
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            RETURNING id, external_id, run_external_id, repository_id, name, status, conclusion, started_at, completed_at
            "#,
        )
        .bind(job.external_id)
        .bind(job.run_external_id)
        .bind(job.repository_id)
        .bind(&job.name)
        .bind(run_status_str(job.status))
        .bind(job.conclusion.map(conclusion_str))
        .bind(job.started_at)
        .bind(job.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(WorkflowJob {
            id: row.get("id"),
            external_id: row.get("external_id"),
            run_external_id: row.get("run_external_id"),
            repository_id: row.get("repository_id"),
            name: row.get("name"),
            status: parse_run_status(&row.get::<String, _>("status")),
            conclusion: row
                .get::<Option<String>, _>("conclusion")
                .and_then(|c| parse_conclusion(&c)),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn list_jobs_for_run(&self, run_external_id: i64) -> AppResult<Vec<WorkflowJob>> {
        let rows = sqlx::query("SELECT * FROM workflow_jobs WHERE run_external_id = $1")
            .bind(run_external_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| WorkflowJob {
                id: row.get("id"),
                external_id: row.get("external_id"),
                run_external_id: row.get("run_external_id"),
                repository_id: row.get("repository_id"),
                name: row.get("name"),
                status: parse_run_status(&row.get::<String, _>("status")),
                conclusion: row
                    .get::<Option<String>, _>("conclusion")
                    .and_then(|c| parse_conclusion(&c)),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
            })
            .collect())
    }

    async fn upsert_check_run(&self, check_run: CheckRun) -> AppResult<CheckRun> {
        let actions = serde_json::to_value(&check_run.actions).unwrap_or(serde_json::Value::Null);
        let row = sqlx::query(
            r#"
            INSERT INTO check_runs
                (external_id, repository_id, name, head_sha, status, conclusion, title, summary, text, actions)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (external_id) DO UPDATE SET
                status = EXCLUDED.status,
                conclusion = EXCLUDED.conclusion,
                title = EXCLUDED.title,
                summary = EXCLUDED.summary,
                text = EXCLUDED.text,
                actions = EXCLUDED.actions
            RETURNING id, external_id, repository_id, name, head_sha, status, conclusion, title, summary, text, actions
            "#,
        )
        .bind(check_run.external_id)
        .bind(check_run.repository_id)
        .bind(&check_run.name)
        .bind(&check_run.head_sha)
        .bind(run_status_str(check_run.status))
        .bind(check_run.conclusion.map(conclusion_str))
        .bind(&check_run.output.title)
        .bind(&check_run.output.summary)
        .bind(&check_run.output.text)
        .bind(actions)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(map_check_run_row(row))
    }

    async fn get_check_run_by_external_id(&self, external_id: i64) -> AppResult<Option<CheckRun>> {
        let row = sqlx::query("SELECT * FROM check_runs WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(map_check_run_row))
    }

    async fn find_flakeguard_check_run(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<CheckRun>> {
        let row = sqlx::query(
            "SELECT * FROM check_runs WHERE repository_id = $1 AND head_sha = $2 AND name ILIKE 'flakeguard' ORDER BY id DESC LIMIT 1",
        )
        .bind(repository_id)
        .bind(head_sha)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(map_check_run_row))
    }

    async fn record_check_run_findings(
        &self,
        check_run_external_id: i64,
        repository_id: i64,
        identities: Vec<TestIdentity>,
    ) -> AppResult<()> {
        let payload = serde_json::to_value(&identities).unwrap_or(serde_json::Value::Null);
        sqlx::query(
            r#"
            INSERT INTO check_run_findings (check_run_external_id, repository_id, identities)
            VALUES ($1, $2, $3)
            ON CONFLICT (check_run_external_id) DO UPDATE SET identities = EXCLUDED.identities
            "#,
        )
        .bind(check_run_external_id)
        .bind(repository_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn findings_for_check_run(&self, check_run_external_id: i64) -> AppResult<Vec<TestIdentity>> {
        let row = sqlx::query(
            "SELECT identities FROM check_run_findings WHERE check_run_external_id = $1",
        )
        .bind(check_run_external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row
            .and_then(|row| serde_json::from_value(row.get("identities")).ok())
            .unwrap_or_default())
    }

    async fn insert_test_result(&self, result: TestResult) -> AppResult<TestResult> {
        let row = sqlx::query(
            r#"
            INSERT INTO test_results
                (repository_id, test_name, file_path, line, outcome, error_message, stack_trace,
                 duration_ms, timestamp, check_run_external_id, job_external_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, repository_id, test_name, file_path, line, outcome, error_message,
                      stack_trace, duration_ms, timestamp, check_run_external_id, job_external_id
            "#,
        )
        .bind(result.repository_id)
        .bind(&result.identity.name)
        .bind(&result.identity.file_path)
        .bind(result.identity.line.map(|l| l as i32))
        .bind(match result.outcome {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
        })
        .bind(&result.error_message)
        .bind(&result.stack_trace)
        .bind(result.duration_ms)
        .bind(result.timestamp)
        .bind(result.check_run_external_id)
        .bind(result.job_external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(map_test_result_row(row))
    }

    async fn list_test_results_in_window(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<TestResult>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM test_results
            WHERE repository_id = $1 AND test_name = $2 AND timestamp >= $3
            ORDER BY timestamp ASC
            "#,
        )
        .bind(repository_id)
        .bind(&identity.name)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(rows.into_iter().map(map_test_result_row).collect())
    }

    async fn upsert_flake_detection(
        &self,
        update: FlakeDetectionUpdate,
    ) -> AppResult<FlakeDetection> {
        // Serialized by the composite unique index on (repository_id,
        // test_name, COALESCE(file_path, '')): concurrent upserts for the
        // same key contend on the same row lock, satisfying the
        // last-writer-wins ordering in spec §5. The COALESCE in the index
        // expression is also the ON CONFLICT target here, so a NULL and a ''
        // file_path for the same test collide the same way MemoryStore's
        // DetectionKey does.
        let row = sqlx::query(
            r#"
            INSERT INTO flake_detections
                (repository_id, test_name, file_path, is_flaky, confidence, failure_pattern,
                 historical_failures, total_runs, last_failure_at, suggested_action, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', now(), now())
            ON CONFLICT (repository_id, test_name, (COALESCE(file_path, ''))) DO UPDATE SET
                is_flaky = EXCLUDED.is_flaky,
                confidence = EXCLUDED.confidence,
                failure_pattern = EXCLUDED.failure_pattern,
                historical_failures = EXCLUDED.historical_failures,
                total_runs = EXCLUDED.total_runs,
                last_failure_at = EXCLUDED.last_failure_at,
                suggested_action = EXCLUDED.suggested_action,
                updated_at = now()
            RETURNING id, repository_id, test_name, file_path, is_flaky, confidence, failure_pattern,
                      historical_failures, total_runs, last_failure_at, suggested_action, status,
                      created_at, updated_at
            "#,
        )
        .bind(update.repository_id)
        .bind(&update.identity.name)
        .bind(&update.identity.file_path)
        .bind(update.is_flaky)
        .bind(update.confidence)
        .bind(&update.failure_pattern)
        .bind(update.historical_failures)
        .bind(update.total_runs)
        .bind(update.last_failure_at)
        .bind(update.suggested_action.map(action_token_str))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(map_flake_detection_row(row))
    }

    async fn get_flake_detection(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
    ) -> AppResult<Option<FlakeDetection>> {
        let row = sqlx::query(
            "SELECT * FROM flake_detections WHERE repository_id = $1 AND test_name = $2 AND COALESCE(file_path, '') = COALESCE($3, '')",
        )
        .bind(repository_id)
        .bind(&identity.name)
        .bind(&identity.file_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.map(map_flake_detection_row))
    }

    async fn set_detection_status(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        status: DetectionStatus,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE flake_detections SET status = $1, updated_at = now() WHERE repository_id = $2 AND test_name = $3 AND COALESCE(file_path, '') = COALESCE($4, '')",
        )
        .bind(detection_status_str(status))
        .bind(repository_id)
        .bind(&identity.name)
        .bind(&identity.file_path)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(AppError::ResourceNotFound);
        }
        Ok(())
    }

    async fn summary_for_repository(&self, repository_id: i64) -> AppResult<RepositorySummary> {
        let totals = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE is_flaky) AS total_flaky,
                count(*) FILTER (WHERE status = 'quarantined') AS total_quarantined,
                count(*) FILTER (WHERE is_flaky AND created_at >= now() - interval '7 days') AS recently_detected
            FROM flake_detections WHERE repository_id = $1
            "#,
        )
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let top_rows = sqlx::query(
            r#"
            SELECT * FROM flake_detections
            WHERE repository_id = $1 AND is_flaky
            ORDER BY confidence DESC
            LIMIT 10
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(RepositorySummary {
            total_flaky: totals.get("total_flaky"),
            total_quarantined: totals.get("total_quarantined"),
            recently_detected: totals.get("recently_detected"),
            top_flaky: top_rows.into_iter().map(map_flake_detection_row).collect(),
        })
    }

    async fn append_rerun_attempt(&self, attempt: RerunAttempt) -> AppResult<RerunAttempt> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        // Lock the workflow run row for the duration of the transaction. On
        // its own this only guards the insert; the ceiling decision itself
        // is made in `append_rerun_attempt_if_under_ceiling`, which counts
        // under this same lock rather than trusting a count taken earlier.
        sqlx::query("SELECT id FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(attempt.workflow_run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO rerun_attempts
                (workflow_run_id, check_run_id, failed_job_count, total_job_count, mode, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            RETURNING id, workflow_run_id, check_run_id, failed_job_count, total_job_count, mode, created_at
            "#,
        )
        .bind(attempt.workflow_run_id)
        .bind(attempt.check_run_id)
        .bind(attempt.failed_job_count)
        .bind(attempt.total_job_count)
        .bind(match attempt.mode {
            RerunMode::Full => "full",
            RerunMode::FailedOnly => "failed_only",
        })
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        tx.commit().await.map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(RerunAttempt {
            id: row.get("id"),
            workflow_run_id: row.get("workflow_run_id"),
            check_run_id: row.get("check_run_id"),
            failed_job_count: row.get("failed_job_count"),
            total_job_count: row.get("total_job_count"),
            mode: match row.get::<String, _>("mode").as_str() {
                "full" => RerunMode::Full,
                _ => RerunMode::FailedOnly,
            },
            created_at: row.get("created_at"),
        })
    }

    async fn count_rerun_attempts(&self, workflow_run_id: i64) -> AppResult<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM rerun_attempts WHERE workflow_run_id = $1")
            .bind(workflow_run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(row.get("n"))
    }

    async fn append_rerun_attempt_if_under_ceiling(
        &self,
        attempt: RerunAttempt,
        ceiling: i64,
    ) -> AppResult<RerunSlot> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        // Lock the workflow run row first, then count and insert under that
        // same lock, so the ceiling check and the insert cannot straddle two
        // concurrent callers (spec §5, §8).
        sqlx::query("SELECT id FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(attempt.workflow_run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let count_row = sqlx::query("SELECT count(*) AS n FROM rerun_attempts WHERE workflow_run_id = $1")
            .bind(attempt.workflow_run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let attempts_so_far: i64 = count_row.get("n");
        if attempts_so_far >= ceiling {
            tx.commit().await.map_err(|e| AppError::Internal(e.to_string()))?;
            return Ok(RerunSlot::CeilingReached { attempts_so_far });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO rerun_attempts
                (workflow_run_id, check_run_id, failed_job_count, total_job_count, mode, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            RETURNING id, workflow_run_id, check_run_id, failed_job_count, total_job_count, mode, created_at
            "#,
        )
        .bind(attempt.workflow_run_id)
        .bind(attempt.check_run_id)
        .bind(attempt.failed_job_count)
        .bind(attempt.total_job_count)
        .bind(match attempt.mode {
            RerunMode::Full => "full",
            RerunMode::FailedOnly => "failed_only",
        })
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

        tx.commit().await.map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(RerunSlot::Inserted(RerunAttempt {
            id: row.get("id"),
            workflow_run_id: row.get("workflow_run_id"),
            check_run_id: row.get("check_run_id"),
            failed_job_count: row.get("failed_job_count"),
            total_job_count: row.get("total_job_count"),
            mode: match row.get::<String, _>("mode").as_str() {
                "full" => RerunMode::Full,
                _ => RerunMode::FailedOnly,
            },
            created_at: row.get("created_at"),
        }))
    }

    async fn record_delivery(&self, delivery_id: &str, event_kind: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_records (delivery_id, event_kind, received_at)
            VALUES ($1, $2, now())
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(delivery_id)
        .bind(event_kind)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }
}

fn map_check_run_row(row: sqlx::postgres::PgRow) -> CheckRun {
    let actions: serde_json::Value = row.get("actions");
    CheckRun {
        id: row.get("id"),
        external_id: row.get("external_id"),
        repository_id: row.get("repository_id"),
        name: row.get("name"),
        head_sha: row.get("head_sha"),
        status: parse_run_status(&row.get::<String, _>("status")),
        conclusion: row
            .get::<Option<String>, _>("conclusion")
            .and_then(|c| parse_conclusion(&c)),
        output: CheckRunOutput {
            title: row.get("title"),
            summary: row.get("summary"),
            text: row.get("text"),
        },
        actions: serde_json::from_value(actions).unwrap_or_default(),
    }
}

fn map_test_result_row(row: sqlx::postgres::PgRow) -> TestResult {
    TestResult {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        identity: TestIdentity {
            name: row.get("test_name"),
            file_path: row.get("file_path"),
            line: row.get::<Option<i32>, _>("line").map(|l| l as u32),
        },
        outcome: match row.get::<String, _>("outcome").as_str() {
            "failed" => TestOutcome::Failed,
            "skipped" => TestOutcome::Skipped,
            _ => TestOutcome::Passed,
        },
        error_message: row.get("error_message"),
        stack_trace: row.get("stack_trace"),
        duration_ms: row.get("duration_ms"),
        timestamp: row.get("timestamp"),
        check_run_external_id: row.get("check_run_external_id"),
        job_external_id: row.get("job_external_id"),
    }
}

fn map_flake_detection_row(row: sqlx::postgres::PgRow) -> FlakeDetection {
    FlakeDetection {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        identity: TestIdentity {
            name: row.get("test_name"),
            file_path: row.get("file_path"),
            line: None,
        },
        is_flaky: row.get("is_flaky"),
        confidence: row.get("confidence"),
        failure_pattern: row.get("failure_pattern"),
        historical_failures: row.get("historical_failures"),
        total_runs: row.get("total_runs"),
        last_failure_at: row.get("last_failure_at"),
        suggested_action: row
            .get::<Option<String>, _>("suggested_action")
            .and_then(|a| parse_action_token(&a)),
        status: parse_detection_status(&row.get::<String, _>("status")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
