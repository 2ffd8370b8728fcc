//! Event Processors (C4). One processor per event kind; all are
//! idempotent, upserting entities keyed by external ids (spec §4.4).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::analyzer::FlakeAnalyzer;
use crate::credentials::CredentialBroker;
use crate::domain::*;
use crate::error::AppResult;
use crate::renderer::{self, RepositoryRef};
use crate::rerun::RerunController;
use crate::store::Store;
use crate::upstream::{CreateCheckRunInput, UpdateCheckRunInput, UpstreamClient};

const TEST_NAME_HINTS: &[&str] = &["test", "unittest", "integration", "e2e", "spec", "junit"];
const CHECK_RUN_NAME: &str = "FlakeGuard";

/// Extracts candidate test identities from a job or check-run name. The
/// spec calls a real artifact parser an external collaborator and leaves
/// its wiring open; this default treats the name itself as the identity,
/// so callers can drop in a real JUnit/TAP parser without touching the
/// processors above it.
pub trait ExtractTestIdentities: Send + Sync {
    fn extract(&self, job_or_check_name: &str) -> Vec<TestIdentity>;
}

pub struct NameProxyExtractor;

impl ExtractTestIdentities for NameProxyExtractor {
    fn extract(&self, job_or_check_name: &str) -> Vec<TestIdentity> {
        vec![TestIdentity {
            name: job_or_check_name.to_string(),
            file_path: None,
            line: None,
        }]
    }
}

pub struct ProcessorContext {
    pub store: Arc<dyn Store>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub credentials: Arc<CredentialBroker>,
    pub analyzer: Arc<FlakeAnalyzer>,
    pub rerun: Arc<RerunController>,
    pub extractor: Arc<dyn ExtractTestIdentities>,
    pub host: String,
}

// -- Wire payload shapes (minimal GitHub webhook fields we need) -----------

#[derive(Debug, Deserialize)]
struct WireRepository {
    id: i64,
    name: String,
    full_name: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct WireInstallationRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireWorkflowRun {
    id: i64,
    head_sha: String,
    head_branch: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunCompletedPayload {
    repository: WireRepository,
    installation: Option<WireInstallationRef>,
    workflow_run: WireWorkflowRun,
}

#[derive(Debug, Deserialize)]
struct WireWorkflowJob {
    id: i64,
    run_id: i64,
    name: String,
    status: String,
    conclusion: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowJobCompletedPayload {
    repository: WireRepository,
    installation: Option<WireInstallationRef>,
    workflow_job: WireWorkflowJob,
}

#[derive(Debug, Deserialize)]
struct WireCheckRunOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCheckRun {
    id: i64,
    name: String,
    head_sha: String,
    status: String,
    conclusion: Option<String>,
    #[serde(default)]
    output: Option<WireCheckRunOutput>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunCompletedPayload {
    repository: WireRepository,
    installation: Option<WireInstallationRef>,
    check_run: WireCheckRun,
}

#[derive(Debug, Deserialize)]
struct WireRequestedAction {
    identifier: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunActionRequestedPayload {
    repository: WireRepository,
    installation: WireInstallationRef,
    check_run: WireCheckRun,
    requested_action: WireRequestedAction,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    login: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct WireInstallationFull {
    id: i64,
    account: WireAccount,
    #[serde(default)]
    repository_selection: Option<String>,
    #[serde(default)]
    permissions: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct InstallationPayload {
    action: String,
    installation: WireInstallationFull,
    #[serde(default)]
    repositories: Vec<WireRepository>,
}

pub enum ParsedEvent {
    WorkflowRunCompleted(WorkflowRunCompletedPayload),
    WorkflowJobCompleted(WorkflowJobCompletedPayload),
    CheckRunCompleted(CheckRunCompletedPayload),
    CheckRunActionRequested(CheckRunActionRequestedPayload),
    Installation(InstallationPayload),
    Acknowledged,
}

/// Validates and routes a raw payload by event kind (spec §4.3 step 5-6).
/// Event kinds this crate has no processor for (`check_suite`, `push`,
/// `pull_request`, `issues`) are accepted and acknowledged without action.
pub fn parse_event(event_kind: &str, payload: &serde_json::Value) -> Result<ParsedEvent, serde_json::Error> {
    let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("");
    match event_kind {
        "workflow_run" if action == "completed" => {
            Ok(ParsedEvent::WorkflowRunCompleted(serde_json::from_value(payload.clone())?))
        }
        "workflow_job" if action == "completed" => {
            Ok(ParsedEvent::WorkflowJobCompleted(serde_json::from_value(payload.clone())?))
        }
        "check_run" if action == "completed" => {
            Ok(ParsedEvent::CheckRunCompleted(serde_json::from_value(payload.clone())?))
        }
        "check_run" if action == "action_requested" => Ok(ParsedEvent::CheckRunActionRequested(
            serde_json::from_value(payload.clone())?,
        )),
        "installation" => Ok(ParsedEvent::Installation(serde_json::from_value(payload.clone())?)),
        _ => Ok(ParsedEvent::Acknowledged),
    }
}

pub async fn dispatch(ctx: &ProcessorContext, event: ParsedEvent) -> AppResult<()> {
    match event {
        ParsedEvent::Acknowledged => Ok(()),
        ParsedEvent::WorkflowRunCompleted(payload) => handle_workflow_run_completed(ctx, payload).await,
        ParsedEvent::WorkflowJobCompleted(payload) => handle_workflow_job_completed(ctx, payload).await,
        ParsedEvent::CheckRunCompleted(payload) => handle_check_run_completed(ctx, payload).await,
        ParsedEvent::CheckRunActionRequested(payload) => handle_action_requested(ctx, payload).await,
        ParsedEvent::Installation(payload) => handle_installation(ctx, payload).await,
    }
}

fn run_status_of(s: &str) -> RunStatus {
    match s {
        "queued" => RunStatus::Queued,
        "in_progress" => RunStatus::InProgress,
        _ => RunStatus::Completed,
    }
}

fn conclusion_of(s: Option<&str>) -> Option<Conclusion> {
    s.and_then(|s| {
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
    })
}

fn looks_like_test_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEST_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

async fn resolve_repository_and_installation(
    ctx: &ProcessorContext,
    wire_repo: &WireRepository,
    installation_external_id: Option<i64>,
) -> AppResult<(Repository, Option<Installation>)> {
    let repository = ctx
        .store
        .upsert_repository(Repository {
            id: 0,
            external_id: wire_repo.id,
            owner: wire_repo
                .full_name
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            name: wire_repo.name.clone(),
            default_branch: wire_repo.default_branch.clone(),
            installation_id: installation_external_id.unwrap_or_default(),
        })
        .await?;
    let installation = match installation_external_id {
        Some(id) => ctx.store.get_installation(id).await?,
        None => None,
    };
    Ok((repository, installation))
}

async fn handle_workflow_run_completed(ctx: &ProcessorContext, payload: WorkflowRunCompletedPayload) -> AppResult<()> {
    let (repository, _installation) = resolve_repository_and_installation(
        ctx,
        &payload.repository,
        payload.installation.as_ref().map(|i| i.id),
    )
    .await?;

    let run = ctx
        .store
        .upsert_workflow_run(WorkflowRun {
            id: 0,
            external_id: payload.workflow_run.id,
            repository_id: repository.id,
            head_sha: payload.workflow_run.head_sha.clone(),
            branch: payload.workflow_run.head_branch.clone(),
            status: run_status_of(&payload.workflow_run.status),
            conclusion: conclusion_of(payload.workflow_run.conclusion.as_deref()),
        })
        .await?;

    let Some(conclusion) = run.conclusion else { return Ok(()) };
    if !conclusion.is_failure() {
        return Ok(());
    }

    let Some(installation_id) = payload.installation.as_ref().map(|i| i.id) else {
        return Ok(());
    };
    let token = ctx.credentials.installation_token(installation_id).await?;

    let jobs = ctx
        .upstream
        .list_jobs_for_run(&token.token, &repository.owner, &repository.name, run.external_id)
        .await?;

    let mut flaky_detections = Vec::new();
    for job in &jobs {
        if !job.conclusion.map(|c| c.is_failure()).unwrap_or(false) {
            continue;
        }
        for identity in ctx.extractor.extract(&job.name) {
            let result = TestResult {
                id: 0,
                repository_id: repository.id,
                identity: identity.clone(),
                outcome: TestOutcome::Failed,
                error_message: None,
                stack_trace: None,
                duration_ms: None,
                timestamp: Utc::now(),
                check_run_external_id: None,
                job_external_id: Some(job.external_id),
            };
            let _ = ctx.store.insert_test_result(result.clone()).await;
            let outcome = ctx.analyzer.analyze(repository.id, &identity, &result).await?;
            if outcome.analysis.is_flaky {
                flaky_detections.push(identity);
            }
        }
    }

    if flaky_detections.is_empty() {
        return Ok(());
    }

    render_and_publish_check_run(ctx, &token.token, &repository, &run.head_sha, &flaky_detections).await
}

async fn render_and_publish_check_run(
    ctx: &ProcessorContext,
    token: &str,
    repository: &Repository,
    head_sha: &str,
    identities: &[TestIdentity],
) -> AppResult<()> {
    let mut detections = Vec::with_capacity(identities.len());
    for identity in identities {
        if let Some(detection) = ctx.store.get_flake_detection(repository.id, identity).await? {
            detections.push(detection);
        }
    }

    let repo_ref = RepositoryRef {
        host: &ctx.host,
        owner: &repository.owner,
        name: &repository.name,
        default_branch: &repository.default_branch,
    };
    let rendered = renderer::render(&detections, &repo_ref);

    let existing = ctx.store.find_flakeguard_check_run(repository.id, head_sha).await?;
    let check_run = match existing {
        Some(existing) => {
            ctx.upstream
                .update_check_run(
                    token,
                    &repository.owner,
                    &repository.name,
                    existing.external_id,
                    UpdateCheckRunInput {
                        status: Some(RunStatus::Completed),
                        conclusion: Some(Conclusion::Neutral),
                        output: Some(&rendered.output),
                        actions: Some(&rendered.actions),
                    },
                )
                .await?
        }
        None => {
            ctx.upstream
                .create_check_run(
                    token,
                    &repository.owner,
                    &repository.name,
                    CreateCheckRunInput {
                        name: CHECK_RUN_NAME,
                        head_sha,
                        status: RunStatus::Completed,
                        conclusion: Some(Conclusion::Neutral),
                        output: &rendered.output,
                        actions: &rendered.actions,
                    },
                )
                .await?
        }
    };

    ctx.store
        .upsert_check_run(check_run.clone())
        .await?;
    ctx.store
        .record_check_run_findings(check_run.external_id, repository.id, identities.to_vec())
        .await?;
    Ok(())
}

async fn handle_workflow_job_completed(ctx: &ProcessorContext, payload: WorkflowJobCompletedPayload) -> AppResult<()> {
    let (repository, _installation) = resolve_repository_and_installation(
        ctx,
        &payload.repository,
        payload.installation.as_ref().map(|i| i.id),
    )
    .await?;

    let job = ctx
        .store
        .upsert_workflow_job(WorkflowJob {
            id: 0,
            external_id: payload.workflow_job.id,
            run_external_id: payload.workflow_job.run_id,
            repository_id: repository.id,
            name: payload.workflow_job.name.clone(),
            status: run_status_of(&payload.workflow_job.status),
            conclusion: conclusion_of(payload.workflow_job.conclusion.as_deref()),
            started_at: payload.workflow_job.started_at,
            completed_at: payload.workflow_job.completed_at,
        })
        .await?;

    let is_failure = job.conclusion.map(|c| c.is_failure()).unwrap_or(false);
    if !looks_like_test_name(&job.name) || !is_failure {
        return Ok(());
    }

    for identity in ctx.extractor.extract(&job.name) {
        let result = TestResult {
            id: 0,
            repository_id: repository.id,
            identity: identity.clone(),
            outcome: TestOutcome::Failed,
            error_message: None,
            stack_trace: None,
            duration_ms: None,
            timestamp: Utc::now(),
            check_run_external_id: None,
            job_external_id: Some(job.external_id),
        };
        let _ = ctx.store.insert_test_result(result.clone()).await;
        // Early-hint analysis for faster feedback; the run-completed handler
        // performs the authoritative pass once all jobs have reported in.
        let _ = ctx.analyzer.analyze(repository.id, &identity, &result).await?;
    }
    Ok(())
}

async fn handle_check_run_completed(ctx: &ProcessorContext, payload: CheckRunCompletedPayload) -> AppResult<()> {
    let (repository, _installation) = resolve_repository_and_installation(
        ctx,
        &payload.repository,
        payload.installation.as_ref().map(|i| i.id),
    )
    .await?;

    let output = payload.check_run.output.as_ref();
    let check_run = ctx
        .store
        .upsert_check_run(CheckRun {
            id: 0,
            external_id: payload.check_run.id,
            repository_id: repository.id,
            name: payload.check_run.name.clone(),
            head_sha: payload.check_run.head_sha.clone(),
            status: run_status_of(&payload.check_run.status),
            conclusion: conclusion_of(payload.check_run.conclusion.as_deref()),
            output: CheckRunOutput {
                title: output.and_then(|o| o.title.clone()).unwrap_or_default(),
                summary: output.and_then(|o| o.summary.clone()).unwrap_or_default(),
                text: output.and_then(|o| o.text.clone()),
            },
            actions: Vec::new(),
        })
        .await?;

    let is_failure = check_run.conclusion.map(|c| c.is_failure()).unwrap_or(false);
    if !is_failure || !looks_like_test_name(&check_run.name) {
        return Ok(());
    }

    let identity = TestIdentity {
        name: check_run.name.clone(),
        file_path: None,
        line: None,
    };
    let result = TestResult {
        id: 0,
        repository_id: repository.id,
        identity: identity.clone(),
        outcome: TestOutcome::Failed,
        error_message: check_run.output.text.clone(),
        stack_trace: None,
        duration_ms: None,
        timestamp: Utc::now(),
        check_run_external_id: Some(check_run.external_id),
        job_external_id: None,
    };
    let _ = ctx.store.insert_test_result(result.clone()).await;
    ctx.analyzer.analyze(repository.id, &identity, &result).await?;
    Ok(())
}

async fn handle_action_requested(ctx: &ProcessorContext, payload: CheckRunActionRequestedPayload) -> AppResult<()> {
    let action = match payload.requested_action.identifier.as_str() {
        "quarantine" => ActionToken::Quarantine,
        "rerun_failed" => ActionToken::RerunFailed,
        "open_issue" => ActionToken::OpenIssue,
        "dismiss_flake" => ActionToken::DismissFlake,
        "mark_stable" => ActionToken::MarkStable,
        other => {
            return Err(crate::error::AppError::CheckRunActionNotSupported(other.to_string()));
        }
    };

    let (repository, installation) = resolve_repository_and_installation(
        ctx,
        &payload.repository,
        Some(payload.installation.id),
    )
    .await?;
    let installation = match installation {
        Some(installation) => installation,
        None => {
            return Err(crate::error::AppError::InstallationNotFound);
        }
    };

    let action_ctx = crate::actions::ActionContext {
        store: ctx.store.clone(),
        upstream: ctx.upstream.clone(),
        credentials: ctx.credentials.clone(),
        rerun: ctx.rerun.clone(),
    };
    crate::actions::dispatch(&action_ctx, action, payload.check_run.id, repository, installation).await
}

async fn handle_installation(ctx: &ProcessorContext, payload: InstallationPayload) -> AppResult<()> {
    if payload.action == "deleted" {
        return ctx.store.delete_installation(payload.installation.id).await;
    }

    let installation = ctx
        .store
        .upsert_installation(Installation {
            id: 0,
            external_id: payload.installation.id,
            account_login: payload.installation.account.login.clone(),
            account_kind: payload.installation.account.kind.clone(),
            repository_selection: match payload.installation.repository_selection.as_deref() {
                Some("selected") => RepositorySelection::Selected,
                _ => RepositorySelection::All,
            },
            permissions: payload.installation.permissions.clone(),
            subscribed_events: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            suspended_at: if payload.action == "suspend" { Some(Utc::now()) } else { None },
        })
        .await?;

    for repo in &payload.repositories {
        ctx.store
            .upsert_repository(Repository {
                id: 0,
                external_id: repo.id,
                owner: repo.full_name.split('/').next().unwrap_or_default().to_string(),
                name: repo.name.clone(),
                default_branch: repo.default_branch.clone(),
                installation_id: installation.external_id,
            })
            .await?;
    }
    Ok(())
}
