//! Exercises the Action Dispatcher's rerun flow end to end against an
//! in-memory store and a recording upstream mock, covering the rerun-ceiling
//! escalation path: after the configured number of attempts, a rerun action
//! opens a tracking issue instead of calling the upstream rerun endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flakeguard::actions::{self, ActionContext};
use flakeguard::config::CredentialConfig;
use flakeguard::credentials::{CredentialBroker, InstallationToken, TokenMinter};
use flakeguard::domain::*;
use flakeguard::error::AppResult;
use flakeguard::rerun::RerunController;
use flakeguard::store::memory::MemoryStore;
use flakeguard::store::Store;
use flakeguard::upstream::*;

const TEST_PRIVATE_KEY: &str = include_str!("fixtures/test_app_key.pem");

struct StubMinter;

#[async_trait]
impl TokenMinter for StubMinter {
    async fn mint(&self, _installation_id: i64, _app_jwt: &str) -> AppResult<InstallationToken> {
        Ok(InstallationToken {
            token: "stub-token".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            permissions: serde_json::json!({}),
            repo_selection: "all".into(),
            repo_list: None,
        })
    }
}

#[derive(Default)]
struct RecordingUpstream {
    rerun_calls: AtomicUsize,
    issues_created: std::sync::Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl UpstreamClient for RecordingUpstream {
    async fn create_check_run(&self, _: &str, _: &str, _: &str, _: CreateCheckRunInput<'_>) -> AppResult<CheckRun> {
        unimplemented!()
    }
    async fn update_check_run(&self, _: &str, _: &str, _: &str, id: i64, input: UpdateCheckRunInput<'_>) -> AppResult<CheckRun> {
        Ok(CheckRun {
            id,
            external_id: id,
            repository_id: 1,
            name: "FlakeGuard".into(),
            head_sha: "deadbeef".into(),
            status: input.status.unwrap_or(RunStatus::Completed),
            conclusion: input.conclusion,
            output: input.output.cloned().unwrap_or(CheckRunOutput {
                title: String::new(),
                summary: String::new(),
                text: None,
            }),
            actions: vec![],
        })
    }
    async fn list_check_runs_for_ref(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<Vec<CheckRun>> {
        Ok(vec![])
    }
    async fn rerun_workflow(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<()> {
        self.rerun_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn rerun_failed_jobs(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<()> {
        self.rerun_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn cancel_workflow(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<()> {
        Ok(())
    }
    async fn list_jobs_for_run(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<Vec<WorkflowJob>> {
        Ok(vec![])
    }
    async fn list_artifacts(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<Vec<ArtifactMeta>> {
        Ok(vec![])
    }
    async fn artifact_download_url(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<String> {
        Ok("https://example.invalid/artifact.zip".into())
    }
    async fn create_issue(&self, _: &str, _: &str, _: &str, title: &str, _: &str, labels: &[String]) -> AppResult<IssueRef> {
        self.issues_created
            .lock()
            .unwrap()
            .push((title.to_string(), labels.to_vec()));
        Ok(IssueRef {
            number: 1,
            html_url: "https://example.invalid/issues/1".into(),
        })
    }
    async fn search_issues(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<Vec<IssueRef>> {
        Ok(vec![])
    }
    async fn get_ref(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<RefInfo> {
        Ok(RefInfo { sha: "deadbeef".into() })
    }
    async fn create_ref(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> AppResult<()> {
        Ok(())
    }
    async fn get_file_content(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> AppResult<Option<FileContent>> {
        Ok(None)
    }
    async fn put_file_content(&self, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str, _: Option<&str>) -> AppResult<()> {
        Ok(())
    }
    async fn create_pull_request(&self, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str) -> AppResult<PullRequestRef> {
        unimplemented!()
    }
    async fn add_labels(&self, _: &str, _: &str, _: &str, _: i64, _: &[String]) -> AppResult<()> {
        Ok(())
    }
    async fn create_issue_comment(&self, _: &str, _: &str, _: &str, _: i64, _: &str) -> AppResult<()> {
        Ok(())
    }
    async fn list_pull_requests(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<Vec<PullRequestRef>> {
        Ok(vec![])
    }
    async fn list_commits_for_pull(&self, _: &str, _: &str, _: &str, _: i64) -> AppResult<Vec<String>> {
        Ok(vec![])
    }
    async fn get_installation(&self, _: &str, _: i64) -> AppResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

async fn seed(store: &MemoryStore) -> (Repository, Installation, CheckRun, WorkflowRun) {
    let installation = store
        .upsert_installation(Installation {
            id: 0,
            external_id: 900,
            account_login: "acme".into(),
            account_kind: "Organization".into(),
            repository_selection: RepositorySelection::All,
            permissions: serde_json::json!({}),
            subscribed_events: vec!["workflow_run".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            suspended_at: None,
        })
        .await
        .unwrap();

    let repository = store
        .upsert_repository(Repository {
            id: 0,
            external_id: 42,
            owner: "acme".into(),
            name: "widgets".into(),
            default_branch: "main".into(),
            installation_id: installation.external_id,
        })
        .await
        .unwrap();

    let run = store
        .upsert_workflow_run(WorkflowRun {
            id: 0,
            external_id: 777,
            repository_id: repository.id,
            head_sha: "deadbeef".into(),
            branch: "main".into(),
            status: RunStatus::Completed,
            conclusion: Some(Conclusion::Failure),
        })
        .await
        .unwrap();

    let check_run = store
        .upsert_check_run(CheckRun {
            id: 0,
            external_id: 555,
            repository_id: repository.id,
            name: "FlakeGuard".into(),
            head_sha: "deadbeef".into(),
            status: RunStatus::Completed,
            conclusion: Some(Conclusion::Failure),
            output: CheckRunOutput {
                title: "FlakeGuard".into(),
                summary: String::new(),
                text: None,
            },
            actions: vec![],
        })
        .await
        .unwrap();

    (repository, installation, check_run, run)
}

fn context(store: Arc<MemoryStore>, upstream: Arc<dyn UpstreamClient>, ceiling: i64) -> ActionContext {
    let minter: Arc<dyn TokenMinter> = Arc::new(StubMinter);
    let credentials = Arc::new(CredentialBroker::new(
        CredentialConfig {
            app_id: 1,
            private_key_pem: TEST_PRIVATE_KEY.to_string(),
        },
        minter,
    ));
    ActionContext {
        store: store.clone(),
        upstream,
        credentials,
        rerun: Arc::new(RerunController::new(store, ceiling)),
    }
}

#[tokio::test]
async fn rerun_escalates_past_the_ceiling_with_the_documented_labels() {
    let store = Arc::new(MemoryStore::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let (repository, installation, check_run, run) = seed(&store).await;
    let ctx = context(store.clone(), upstream.clone(), 2);

    for _ in 0..2 {
        actions::dispatch(
            &ctx,
            ActionToken::RerunFailed,
            check_run.external_id,
            repository.clone(),
            installation.clone(),
        )
        .await
        .unwrap();
    }
    assert_eq!(upstream.rerun_calls.load(Ordering::SeqCst), 2);
    assert!(upstream.issues_created.lock().unwrap().is_empty());

    actions::dispatch(
        &ctx,
        ActionToken::RerunFailed,
        check_run.external_id,
        repository,
        installation,
    )
    .await
    .unwrap();

    assert_eq!(upstream.rerun_calls.load(Ordering::SeqCst), 2);
    let issues = upstream.issues_created.lock().unwrap();
    assert_eq!(issues.len(), 1);
    let (title, labels) = &issues[0];
    assert!(title.contains(&run.external_id.to_string()));
    assert_eq!(
        labels,
        &vec![
            "ci-failure".to_string(),
            "persistent-failure".to_string(),
            "investigation-needed".to_string(),
        ]
    );
}

#[tokio::test]
async fn dismiss_and_mark_stable_update_detection_status_without_touching_upstream() {
    let store = Arc::new(MemoryStore::new());
    let upstream = Arc::new(RecordingUpstream::default());
    let (repository, installation, check_run, _run) = seed(&store).await;
    let ctx = context(store.clone(), upstream.clone(), 3);

    let identity = TestIdentity {
        name: "tests::flaky_case".into(),
        file_path: Some("tests/it.rs".into()),
        line: None,
    };
    store
        .record_check_run_findings(check_run.external_id, repository.id, vec![identity.clone()])
        .await
        .unwrap();
    store
        .upsert_flake_detection(flakeguard::store::FlakeDetectionUpdate {
            repository_id: repository.id,
            identity: identity.clone(),
            is_flaky: true,
            confidence: 0.7,
            failure_pattern: None,
            historical_failures: 4,
            total_runs: 10,
            last_failure_at: Some(Utc::now()),
            suggested_action: Some(ActionToken::DismissFlake),
        })
        .await
        .unwrap();

    actions::dispatch(
        &ctx,
        ActionToken::DismissFlake,
        check_run.external_id,
        repository.clone(),
        installation.clone(),
    )
    .await
    .unwrap();

    let detection = store
        .get_flake_detection(repository.id, &identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detection.status, DetectionStatus::Dismissed);

    actions::dispatch(
        &ctx,
        ActionToken::MarkStable,
        check_run.external_id,
        repository,
        installation,
    )
    .await
    .unwrap();

    let detection = store
        .get_flake_detection(repository_id_of(&store).await, &identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detection.status, DetectionStatus::Stable);
    assert_eq!(upstream.rerun_calls.load(Ordering::SeqCst), 0);
}

async fn repository_id_of(store: &MemoryStore) -> i64 {
    store
        .get_repository_by_owner_name("acme", "widgets")
        .await
        .unwrap()
        .unwrap()
        .id
}
