//! In-memory `Store` implementation backed by `dashmap`, used as the default
//! store for local development and every unit/integration test in this
//! crate. Mirrors the sharding/locking shape the teacher reaches for with
//! `DashMap` elsewhere (shared, read-mostly, process-wide caches).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::domain::*;
use crate::error::{AppError, AppResult};

use super::{DetectionKey, FlakeDetectionUpdate, RepositorySummary, RerunSlot, Store};

#[derive(Default)]
struct Sequences {
    installation: AtomicI64,
    repository: AtomicI64,
    workflow_run: AtomicI64,
    workflow_job: AtomicI64,
    check_run: AtomicI64,
    test_result: AtomicI64,
    flake_detection: AtomicI64,
    rerun_attempt: AtomicI64,
}

impl Sequences {
    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MemoryStore {
    seq: Sequences,
    installations: DashMap<i64, Installation>,
    repositories: DashMap<i64, Repository>,
    workflow_runs: DashMap<i64, WorkflowRun>,
    workflow_jobs_by_run: DashMap<i64, Vec<WorkflowJob>>,
    check_runs: DashMap<i64, CheckRun>,
    check_run_findings: DashMap<i64, Vec<TestIdentity>>,
    test_results: DashMap<DetectionKey, Vec<TestResult>>,
    flake_detections: DashMap<DetectionKey, FlakeDetection>,
    detection_locks: DashMap<DetectionKey, Arc<AsyncMutex<()>>>,
    rerun_attempts: DashMap<i64, Vec<RerunAttempt>>,
    rerun_locks: DashMap<i64, Arc<AsyncMutex<()>>>,
    deliveries: DashMap<String, DeliveryRecord>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            seq: Sequences::default(),
            installations: DashMap::new(),
            repositories: DashMap::new(),
            workflow_runs: DashMap::new(),
            workflow_jobs_by_run: DashMap::new(),
            check_runs: DashMap::new(),
            check_run_findings: DashMap::new(),
            test_results: DashMap::new(),
            flake_detections: DashMap::new(),
            detection_locks: DashMap::new(),
            rerun_attempts: DashMap::new(),
            rerun_locks: DashMap::new(),
            deliveries: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &DetectionKey) -> Arc<AsyncMutex<()>> {
        self.detection_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn lock_for_run(&self, workflow_run_id: i64) -> Arc<AsyncMutex<()>> {
        self.rerun_locks
            .entry(workflow_run_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_installation(&self, mut installation: Installation) -> AppResult<Installation> {
        if installation.id == 0 {
            installation.id = Sequences::next(&self.seq.installation);
        }
        self.installations
            .insert(installation.external_id, installation.clone());
        Ok(installation)
    }

    async fn get_installation(&self, external_id: i64) -> AppResult<Option<Installation>> {
        Ok(self.installations.get(&external_id).map(|r| r.clone()))
    }

    async fn delete_installation(&self, external_id: i64) -> AppResult<()> {
        self.installations.remove(&external_id);
        let repo_ids: Vec<i64> = self
            .repositories
            .iter()
            .filter(|r| r.installation_id == external_id)
            .map(|r| r.external_id)
            .collect();
        for repo_external_id in repo_ids {
            self.repositories.remove(&repo_external_id);
        }
        Ok(())
    }

    async fn upsert_repository(&self, mut repository: Repository) -> AppResult<Repository> {
        if repository.id == 0 {
            repository.id = Sequences::next(&self.seq.repository);
        }
        self.repositories
            .insert(repository.external_id, repository.clone());
        Ok(repository)
    }

    async fn get_repository(&self, external_id: i64) -> AppResult<Option<Repository>> {
        Ok(self.repositories.get(&external_id).map(|r| r.clone()))
    }

    async fn get_repository_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> AppResult<Option<Repository>> {
        Ok(self
            .repositories
            .iter()
            .find(|r| r.owner == owner && r.name == name)
            .map(|r| r.clone()))
    }

    async fn list_repositories_for_installation(
        &self,
        installation_external_id: i64,
    ) -> AppResult<Vec<Repository>> {
        Ok(self
            .repositories
            .iter()
            .filter(|r| r.installation_id == installation_external_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn upsert_workflow_run(&self, mut run: WorkflowRun) -> AppResult<WorkflowRun> {
        if run.id == 0 {
            run.id = Sequences::next(&self.seq.workflow_run);
        }
        self.workflow_runs.insert(run.external_id, run.clone());
        Ok(run)
    }

    async fn get_workflow_run_by_external_id(&self, external_id: i64) -> AppResult<Option<WorkflowRun>> {
        Ok(self.workflow_runs.get(&external_id).map(|r| r.clone()))
    }

    async fn get_workflow_run_by_head_sha(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<WorkflowRun>> {
        Ok(self
            .workflow_runs
            .iter()
            .filter(|r| r.repository_id == repository_id && r.head_sha == head_sha)
            .map(|r| r.clone())
            .max_by_key(|r| r.id))
    }

    async fn upsert_workflow_job(&self, mut job: WorkflowJob) -> AppResult<WorkflowJob> {
        if job.id == 0 {
            job.id = Sequences::next(&self.seq.workflow_job);
        }
        let mut jobs = self
            .workflow_jobs_by_run
            .entry(job.run_external_id)
            .or_default();
        if let Some(existing) = jobs.iter_mut().find(|j| j.external_id == job.external_id) {
            *existing = job.clone();
        } else {
            jobs.push(job.clone());
        }
        Ok(job)
    }

    async fn list_jobs_for_run(&self, run_external_id: i64) -> AppResult<Vec<WorkflowJob>> {
        Ok(self
            .workflow_jobs_by_run
            .get(&run_external_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn upsert_check_run(&self, mut check_run: CheckRun) -> AppResult<CheckRun> {
        if check_run.id == 0 {
            check_run.id = Sequences::next(&self.seq.check_run);
        }
        self.check_runs
            .insert(check_run.external_id, check_run.clone());
        Ok(check_run)
    }

    async fn get_check_run_by_external_id(&self, external_id: i64) -> AppResult<Option<CheckRun>> {
        Ok(self.check_runs.get(&external_id).map(|r| r.clone()))
    }

    async fn find_flakeguard_check_run(
        &self,
        repository_id: i64,
        head_sha: &str,
    ) -> AppResult<Option<CheckRun>> {
        Ok(self
            .check_runs
            .iter()
            .filter(|c| {
                c.repository_id == repository_id
                    && c.head_sha == head_sha
                    && c.name.eq_ignore_ascii_case("flakeguard")
            })
            .map(|c| c.clone())
            .max_by_key(|c| c.id))
    }

    async fn record_check_run_findings(
        &self,
        check_run_external_id: i64,
        _repository_id: i64,
        identities: Vec<TestIdentity>,
    ) -> AppResult<()> {
        self.check_run_findings
            .insert(check_run_external_id, identities);
        Ok(())
    }

    async fn findings_for_check_run(
        &self,
        check_run_external_id: i64,
    ) -> AppResult<Vec<TestIdentity>> {
        Ok(self
            .check_run_findings
            .get(&check_run_external_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn insert_test_result(&self, mut result: TestResult) -> AppResult<TestResult> {
        if result.id == 0 {
            result.id = Sequences::next(&self.seq.test_result);
        }
        let key = DetectionKey::new(result.repository_id, &result.identity);
        self.test_results.entry(key).or_default().push(result.clone());
        Ok(result)
    }

    async fn list_test_results_in_window(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<TestResult>> {
        let key = DetectionKey::new(repository_id, identity);
        Ok(self
            .test_results
            .get(&key)
            .map(|v| v.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_flake_detection(
        &self,
        update: FlakeDetectionUpdate,
    ) -> AppResult<FlakeDetection> {
        let key = DetectionKey::new(update.repository_id, &update.identity);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut entry = self
            .flake_detections
            .get(&key)
            .map(|r| r.clone())
            .unwrap_or_else(|| FlakeDetection {
                id: Sequences::next(&self.seq.flake_detection),
                repository_id: update.repository_id,
                identity: update.identity.clone(),
                is_flaky: false,
                confidence: 0.0,
                failure_pattern: None,
                historical_failures: 0,
                total_runs: 0,
                last_failure_at: None,
                suggested_action: None,
                status: DetectionStatus::Pending,
                created_at: now,
                updated_at: now,
            });

        entry.is_flaky = update.is_flaky;
        entry.confidence = update.confidence;
        entry.failure_pattern = update.failure_pattern;
        entry.historical_failures = update.historical_failures;
        entry.total_runs = update.total_runs;
        entry.last_failure_at = update.last_failure_at;
        entry.suggested_action = update.suggested_action;
        entry.updated_at = now;

        self.flake_detections.insert(key, entry.clone());
        Ok(entry)
    }

    async fn get_flake_detection(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
    ) -> AppResult<Option<FlakeDetection>> {
        let key = DetectionKey::new(repository_id, identity);
        Ok(self.flake_detections.get(&key).map(|r| r.clone()))
    }

    async fn set_detection_status(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        status: DetectionStatus,
    ) -> AppResult<()> {
        let key = DetectionKey::new(repository_id, identity);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        match self.flake_detections.get_mut(&key) {
            Some(mut entry) => {
                entry.status = status;
                entry.updated_at = Utc::now();
                Ok(())
            }
            None => Err(AppError::ResourceNotFound),
        }
    }

    async fn summary_for_repository(&self, repository_id: i64) -> AppResult<RepositorySummary> {
        let now = Utc::now();
        let recent_cutoff = now - chrono::Duration::days(7);
        let mut all: Vec<FlakeDetection> = self
            .flake_detections
            .iter()
            .filter(|d| d.repository_id == repository_id)
            .map(|d| d.clone())
            .collect();

        let total_flaky = all.iter().filter(|d| d.is_flaky).count() as i64;
        let total_quarantined = all
            .iter()
            .filter(|d| d.status == DetectionStatus::Quarantined)
            .count() as i64;
        let recently_detected = all
            .iter()
            .filter(|d| d.is_flaky && d.created_at >= recent_cutoff)
            .count() as i64;

        all.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_flaky = all.into_iter().filter(|d| d.is_flaky).take(10).collect();

        Ok(RepositorySummary {
            total_flaky,
            total_quarantined,
            recently_detected,
            top_flaky,
        })
    }

    async fn append_rerun_attempt(&self, mut attempt: RerunAttempt) -> AppResult<RerunAttempt> {
        let lock = self.lock_for_run(attempt.workflow_run_id);
        let _guard = lock.lock().await;
        if attempt.id == 0 {
            attempt.id = Sequences::next(&self.seq.rerun_attempt);
        }
        self.rerun_attempts
            .entry(attempt.workflow_run_id)
            .or_default()
            .push(attempt.clone());
        Ok(attempt)
    }

    async fn count_rerun_attempts(&self, workflow_run_id: i64) -> AppResult<i64> {
        Ok(self
            .rerun_attempts
            .get(&workflow_run_id)
            .map(|v| v.len() as i64)
            .unwrap_or(0))
    }

    async fn append_rerun_attempt_if_under_ceiling(
        &self,
        mut attempt: RerunAttempt,
        ceiling: i64,
    ) -> AppResult<RerunSlot> {
        let lock = self.lock_for_run(attempt.workflow_run_id);
        let _guard = lock.lock().await;

        let attempts_so_far = self
            .rerun_attempts
            .get(&attempt.workflow_run_id)
            .map(|v| v.len() as i64)
            .unwrap_or(0);
        if attempts_so_far >= ceiling {
            return Ok(RerunSlot::CeilingReached { attempts_so_far });
        }

        if attempt.id == 0 {
            attempt.id = Sequences::next(&self.seq.rerun_attempt);
        }
        self.rerun_attempts
            .entry(attempt.workflow_run_id)
            .or_default()
            .push(attempt.clone());
        Ok(RerunSlot::Inserted(attempt))
    }

    async fn record_delivery(&self, delivery_id: &str, event_kind: &str) -> AppResult<bool> {
        match self.deliveries.entry(delivery_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(DeliveryRecord {
                    delivery_id: delivery_id.to_string(),
                    event_kind: event_kind.to_string(),
                    received_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> TestIdentity {
        TestIdentity {
            name: name.to_string(),
            file_path: Some("tests/foo.rs".to_string()),
            line: None,
        }
    }

    #[tokio::test]
    async fn delivery_dedup_is_once_only() {
        let store = MemoryStore::new();
        assert!(store.record_delivery("d1", "push").await.unwrap());
        assert!(!store.record_delivery("d1", "push").await.unwrap());
    }

    #[tokio::test]
    async fn flake_detection_is_unique_per_repo_and_identity() {
        let store = MemoryStore::new();
        let update = FlakeDetectionUpdate {
            repository_id: 1,
            identity: identity("test_a"),
            is_flaky: true,
            confidence: 0.6,
            failure_pattern: None,
            historical_failures: 3,
            total_runs: 10,
            last_failure_at: None,
            suggested_action: Some(ActionToken::RerunFailed),
        };
        store.upsert_flake_detection(update.clone()).await.unwrap();
        store.upsert_flake_detection(update).await.unwrap();
        let summary = store.summary_for_repository(1).await.unwrap();
        assert_eq!(summary.total_flaky, 1);
    }

    #[tokio::test]
    async fn rerun_attempt_ceiling_is_observable_via_count() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .append_rerun_attempt(RerunAttempt {
                    id: 0,
                    workflow_run_id: 42,
                    check_run_id: None,
                    failed_job_count: 1,
                    total_job_count: 2,
                    mode: RerunMode::FailedOnly,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.count_rerun_attempts(42).await.unwrap(), 3);
    }
}
