//! Persistence boundary. `spec.md` treats the relational store as an
//! external collaborator; this module gives it a concrete shape as an
//! `async_trait` so every other component depends on the contract, not on
//! `sqlx` directly — the same separation the teacher draws between its
//! handlers and its `db/*.rs` query modules.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::*;
use crate::error::AppResult;

/// A test identity plus the repository it belongs to — the composite key
/// `(test identity, repository)` the spec requires to be unique for
/// `FlakeDetection` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectionKey {
    pub repository_id: i64,
    pub test_name: String,
    pub file_path: Option<String>,
}

impl DetectionKey {
    pub fn new(repository_id: i64, identity: &TestIdentity) -> Self {
        Self {
            repository_id,
            test_name: identity.name.clone(),
            file_path: identity.file_path.clone(),
        }
    }
}

/// Input to `upsert_flake_detection`; `is_flaky`/`confidence`/etc are
/// computed upstream by the analyzer (C5), the store only persists them.
#[derive(Debug, Clone)]
pub struct FlakeDetectionUpdate {
    pub repository_id: i64,
    pub identity: TestIdentity,
    pub is_flaky: bool,
    pub confidence: f64,
    pub failure_pattern: Option<String>,
    pub historical_failures: i64,
    pub total_runs: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub suggested_action: Option<ActionToken>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- Installations -------------------------------------------------
    async fn upsert_installation(&self, installation: Installation) -> AppResult<Installation>;
    async fn get_installation(&self, external_id: i64) -> AppResult<Option<Installation>>;
    /// Cascades to every repository (and transitively every entity they
    /// own) per the ownership rule in spec §3.
    async fn delete_installation(&self, external_id: i64) -> AppResult<()>;

    // -- Repositories ----------------------------------------------------
    async fn upsert_repository(&self, repository: Repository) -> AppResult<Repository>;
    async fn get_repository(&self, external_id: i64) -> AppResult<Option<Repository>>;
    async fn get_repository_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> AppResult<Option<Repository>>;
    async fn list_repositories_for_installation(
        &self,
        installation_external_id: i64,
    ) -> AppResult<Vec<Repository>>;

    // -- Workflow runs / jobs -------------------------------------------
    async fn upsert_workflow_run(&self, run: WorkflowRun) -> AppResult<WorkflowRun>;
    async fn get_workflow_run_by_external_id(&self, external_id: i64) -> AppResult<Option<WorkflowRun>>;
    async fn get_workflow_run_by_head_sha(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<WorkflowRun>>;
    async fn upsert_workflow_job(&self, job: WorkflowJob) -> AppResult<WorkflowJob>;
    async fn list_jobs_for_run(&self, run_external_id: i64) -> AppResult<Vec<WorkflowJob>>;

    // -- Check runs -------------------------------------------------------
    async fn upsert_check_run(&self, check_run: CheckRun) -> AppResult<CheckRun>;
    async fn get_check_run_by_external_id(&self, external_id: i64) -> AppResult<Option<CheckRun>>;
    /// Finds an existing FlakeGuard-named check run on the same head sha
    /// (spec §4.4, `workflow_run.completed`).
    async fn find_flakeguard_check_run(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<CheckRun>>;
    /// Remembers which tests a rendered check run surfaced, so the action
    /// dispatcher can "gather FlakeDetection rows keyed by the originating
    /// check-run id" (spec §4.7 step 1).
    async fn record_check_run_findings(
        &self,
        check_run_external_id: i64,
        repository_id: i64,
        identities: Vec<TestIdentity>,
    ) -> AppResult<()>;
    async fn findings_for_check_run(
        &self,
        check_run_external_id: i64,
    ) -> AppResult<Vec<TestIdentity>>;

    // -- Test results -----------------------------------------------------
    /// Append-only. Failure to persist is non-fatal to the caller (spec
    /// §4.5) — callers should log and continue rather than propagate.
    async fn insert_test_result(&self, result: TestResult) -> AppResult<TestResult>;
    async fn list_test_results_in_window(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<TestResult>>;

    // -- Flake detections --------------------------------------------------
    /// Upserts the `(test identity, repository)` row. Implementations must
    /// serialize concurrent writes for the same key (spec §5): last write
    /// wins, but two concurrent upserts for the same key never interleave.
    async fn upsert_flake_detection(&self, update: FlakeDetectionUpdate) -> AppResult<FlakeDetection>;
    async fn get_flake_detection(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
    ) -> AppResult<Option<FlakeDetection>>;
    async fn set_detection_status(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        status: DetectionStatus,
    ) -> AppResult<()>;
    async fn summary_for_repository(&self, repository_id: i64) -> AppResult<RepositorySummary>;

    // -- Rerun attempts ----------------------------------------------------
    /// Raw insert, no ceiling check. Kept for callers (and tests) that only
    /// need the append; C9's ceiling decision goes through
    /// `append_rerun_attempt_if_under_ceiling` instead, which performs the
    /// count and the insert under one lock.
    async fn append_rerun_attempt(&self, attempt: RerunAttempt) -> AppResult<RerunAttempt>;
    async fn count_rerun_attempts(&self, workflow_run_id: i64) -> AppResult<i64>;
    /// Counts existing attempts and inserts `attempt` in the same
    /// lock/transaction, so two concurrent callers for the same
    /// `workflow_run_id` can never both observe room under `ceiling` and
    /// both insert (spec §5, §8's `|RerunAttempts(run)| ≤ ceiling`).
    async fn append_rerun_attempt_if_under_ceiling(
        &self,
        attempt: RerunAttempt,
        ceiling: i64,
    ) -> AppResult<RerunSlot>;

    // -- Delivery dedup ------------------------------------------------------
    /// Returns `true` if this delivery id was newly recorded, `false` if it
    /// was already present (spec §3, §4.3, §8).
    async fn record_delivery(&self, delivery_id: &str, event_kind: &str) -> AppResult<bool>;
}

/// Outcome of `Store::append_rerun_attempt_if_under_ceiling`.
#[derive(Debug, Clone)]
pub enum RerunSlot {
    Inserted(RerunAttempt),
    CeilingReached { attempts_so_far: i64 },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RepositorySummary {
    pub total_flaky: i64,
    pub total_quarantined: i64,
    pub recently_detected: i64,
    pub top_flaky: Vec<FlakeDetection>,
}
