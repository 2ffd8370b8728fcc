//! Control API (spec §6). Thin REST passthrough onto the Upstream Client
//! Facade (C2) and the Flake Analyzer's (C5) summary queries, scoped by
//! `:owner/:repo` the way the teacher scopes its server routes by `:id`.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;

use crate::analyzer::FlakeAnalyzer;
use crate::credentials::CredentialBroker;
use crate::domain::*;
use crate::error::{ApiEnvelope, AppError, AppResult};
use crate::store::Store;
use crate::upstream::{ArtifactMeta, CreateCheckRunInput, RefInfo, UpdateCheckRunInput, UpstreamClient};

#[derive(Clone)]
pub struct ControlState {
    pub store: Arc<dyn Store>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub credentials: Arc<CredentialBroker>,
    pub analyzer: Arc<FlakeAnalyzer>,
}

async fn resolve(state: &ControlState, owner: &str, repo: &str) -> AppResult<(Repository, String)> {
    let repository = state
        .store
        .get_repository_by_owner_name(owner, repo)
        .await?
        .ok_or(AppError::ResourceNotFound)?;
    let token = state.credentials.installation_token(repository.installation_id).await?;
    Ok((repository, token.token))
}

fn parse_run_status(s: &str) -> AppResult<RunStatus> {
    match s {
        "queued" => Ok(RunStatus::Queued),
        "in_progress" => Ok(RunStatus::InProgress),
        "completed" => Ok(RunStatus::Completed),
        other => Err(AppError::ValidationError(format!("invalid status: {other}"))),
    }
}

fn parse_conclusion(s: &str) -> AppResult<Conclusion> {
    match s {
        "success" => Ok(Conclusion::Success),
        "failure" => Ok(Conclusion::Failure),
        "neutral" => Ok(Conclusion::Neutral),
        "cancelled" => Ok(Conclusion::Cancelled),
        "timed_out" => Ok(Conclusion::TimedOut),
        "action_required" => Ok(Conclusion::ActionRequired),
        "skipped" => Ok(Conclusion::Skipped),
        other => Err(AppError::ValidationError(format!("invalid conclusion: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckRunBody {
    pub name: String,
    pub head_sha: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub output: Option<CheckRunOutput>,
}

pub async fn create_check_run(
    Extension(state): Extension<ControlState>,
    Path((owner, repo)): Path<(String, String)>,
    Json(body): Json<CreateCheckRunBody>,
) -> AppResult<Json<ApiEnvelope<CheckRun>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    let status = parse_run_status(body.status.as_deref().unwrap_or("queued"))?;
    let conclusion = body.conclusion.as_deref().map(parse_conclusion).transpose()?;
    let output = body.output.clone().unwrap_or(CheckRunOutput {
        title: body.name.clone(),
        summary: String::new(),
        text: None,
    });
    let check_run = state
        .upstream
        .create_check_run(
            &token,
            &owner,
            &repo,
            CreateCheckRunInput {
                name: &body.name,
                head_sha: &body.head_sha,
                status,
                conclusion,
                output: &output,
                actions: &[],
            },
        )
        .await?;
    Ok(ApiEnvelope::ok(check_run))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCheckRunBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub output: Option<CheckRunOutput>,
}

pub async fn update_check_run(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, id)): Path<(String, String, i64)>,
    Json(body): Json<UpdateCheckRunBody>,
) -> AppResult<Json<ApiEnvelope<CheckRun>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    let status = body.status.as_deref().map(parse_run_status).transpose()?;
    let conclusion = body.conclusion.as_deref().map(parse_conclusion).transpose()?;
    let check_run = state
        .upstream
        .update_check_run(
            &token,
            &owner,
            &repo,
            id,
            UpdateCheckRunInput {
                status,
                conclusion,
                output: body.output.as_ref(),
                actions: None,
            },
        )
        .await?;
    Ok(ApiEnvelope::ok(check_run))
}

pub async fn list_check_runs_for_ref(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, git_ref)): Path<(String, String, String)>,
) -> AppResult<Json<ApiEnvelope<Vec<CheckRun>>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    let check_runs = state.upstream.list_check_runs_for_ref(&token, &owner, &repo, &git_ref).await?;
    Ok(ApiEnvelope::ok(check_runs))
}

#[derive(Debug, Default, Deserialize)]
pub struct RerunBody {
    #[serde(default, rename = "enableDebugLogging")]
    pub enable_debug_logging: bool,
    #[serde(default, rename = "rerunFailedJobsOnly")]
    pub rerun_failed_jobs_only: bool,
}

pub async fn rerun_workflow(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, id)): Path<(String, String, i64)>,
    Json(body): Json<RerunBody>,
) -> AppResult<Json<ApiEnvelope<()>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    if body.rerun_failed_jobs_only {
        state.upstream.rerun_failed_jobs(&token, &owner, &repo, id).await?;
    } else {
        state.upstream.rerun_workflow(&token, &owner, &repo, id).await?;
    }
    Ok(ApiEnvelope::ok(()))
}

pub async fn cancel_workflow(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, id)): Path<(String, String, i64)>,
) -> AppResult<Json<ApiEnvelope<()>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    state.upstream.cancel_workflow(&token, &owner, &repo, id).await?;
    Ok(ApiEnvelope::ok(()))
}

pub async fn list_artifacts(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, id)): Path<(String, String, i64)>,
) -> AppResult<Json<ApiEnvelope<Vec<ArtifactMeta>>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    let artifacts = state.upstream.list_artifacts(&token, &owner, &repo, id).await?;
    Ok(ApiEnvelope::ok(artifacts))
}

pub async fn artifact_download_url(
    Extension(state): Extension<ControlState>,
    Path((owner, repo, id)): Path<(String, String, i64)>,
) -> AppResult<Json<ApiEnvelope<RefInfo>>> {
    let (_repository, token) = resolve(&state, &owner, &repo).await?;
    let url = state.upstream.artifact_download_url(&token, &owner, &repo, id).await?;
    // `RefInfo` is reused purely as a one-field string carrier; the control
    // API has no dedicated download-url DTO in the data model.
    Ok(ApiEnvelope::ok(RefInfo { sha: url }))
}

#[derive(Debug, Deserialize)]
pub struct FlakeStatusQuery {
    #[serde(rename = "testName")]
    pub test_name: String,
}

pub async fn flakes_status(
    Extension(state): Extension<ControlState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<FlakeStatusQuery>,
) -> AppResult<Json<ApiEnvelope<Option<FlakeDetection>>>> {
    let (repository, _token) = resolve(&state, &owner, &repo).await?;
    let identity = TestIdentity {
        name: query.test_name,
        file_path: None,
        line: None,
    };
    let status = state.analyzer.status_of(repository.id, &identity).await?;
    Ok(ApiEnvelope::ok(status))
}

pub async fn flakes_summary(
    Extension(state): Extension<ControlState>,
    Path((owner, repo)): Path<(String, String)>,
) -> AppResult<Json<ApiEnvelope<crate::store::RepositorySummary>>> {
    let (repository, _token) = resolve(&state, &owner, &repo).await?;
    let summary = state.analyzer.summary_of(repository.id).await?;
    Ok(ApiEnvelope::ok(summary))
}
