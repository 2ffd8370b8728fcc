//! Action Dispatcher (C7). One entry point per user-initiated action
//! token (spec §4.7). Every dispatcher fetches an installation client
//! (C1/C2), does its work, updates the originating check run, and updates
//! `FlakeDetection` status where applicable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::credentials::CredentialBroker;
use crate::domain::*;
use crate::error::{AppError, AppResult};
use crate::quarantine;
use crate::rerun::{RerunController, RerunDecision};
use crate::store::Store;
use crate::upstream::{UpdateCheckRunInput, UpstreamClient};

pub struct ActionContext {
    pub store: Arc<dyn Store>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub credentials: Arc<CredentialBroker>,
    pub rerun: Arc<RerunController>,
}

struct Target {
    owner: String,
    repo: String,
    repository_id: i64,
    installation_id: i64,
    default_branch: String,
    check_run: CheckRun,
}

/// Dispatches `action` against the check run `check_run_external_id`,
/// owned by `repository`/`installation` (spec §4.4 `check_run.action_requested`).
pub async fn dispatch(
    ctx: &ActionContext,
    action: ActionToken,
    check_run_external_id: i64,
    repository: Repository,
    installation: Installation,
) -> AppResult<()> {
    let check_run = ctx
        .store
        .get_check_run_by_external_id(check_run_external_id)
        .await?
        .ok_or(AppError::ResourceNotFound)?;

    let target = Target {
        owner: repository.owner.clone(),
        repo: repository.name.clone(),
        repository_id: repository.id,
        installation_id: installation.external_id,
        default_branch: repository.default_branch.clone(),
        check_run,
    };

    let result = match action {
        ActionToken::Quarantine => quarantine_flow(ctx, &target).await,
        ActionToken::RerunFailed => rerun_flow(ctx, &target).await,
        ActionToken::OpenIssue => open_issue_flow(ctx, &target).await,
        ActionToken::DismissFlake => dismiss_flow(ctx, &target).await,
        ActionToken::MarkStable => mark_stable_flow(ctx, &target).await,
    };

    let token = ctx.credentials.installation_token(target.installation_id).await?;
    match &result {
        Ok(()) => {
            let _ = ctx
                .upstream
                .update_check_run(
                    &token.token,
                    &target.owner,
                    &target.repo,
                    target.check_run.external_id,
                    UpdateCheckRunInput {
                        status: Some(RunStatus::Completed),
                        conclusion: Some(Conclusion::Neutral),
                        output: Some(&CheckRunOutput {
                            title: "FlakeGuard action completed".into(),
                            summary: "Action Completed".into(),
                            text: None,
                        }),
                        actions: None,
                    },
                )
                .await;
        }
        Err(err) => {
            let _ = ctx
                .upstream
                .update_check_run(
                    &token.token,
                    &target.owner,
                    &target.repo,
                    target.check_run.external_id,
                    UpdateCheckRunInput {
                        status: Some(RunStatus::Completed),
                        conclusion: Some(Conclusion::Failure),
                        output: Some(&CheckRunOutput {
                            title: "FlakeGuard action failed".into(),
                            summary: err.to_string(),
                            text: None,
                        }),
                        actions: None,
                    },
                )
                .await;
        }
    }

    result
}

async fn quarantine_flow(ctx: &ActionContext, target: &Target) -> AppResult<()> {
    let token = ctx.credentials.installation_token(target.installation_id).await?;
    let findings = ctx.store.findings_for_check_run(target.check_run.external_id).await?;
    let mut detections = Vec::with_capacity(findings.len());
    for identity in &findings {
        if let Some(detection) = ctx.store.get_flake_detection(target.repository_id, identity).await? {
            detections.push(detection);
        }
    }

    if detections.is_empty() {
        return Err(AppError::ValidationError("no flake detections found for this check run".into()));
    }

    let head_sha = &target.check_run.head_sha;
    let short_sha = &head_sha[..head_sha.len().min(8)];
    let branch_name = format!(
        "flakeguard/quarantine/{}-{}",
        Utc::now().format("%Y-%m-%d"),
        short_sha
    );

    let default_ref = ctx
        .upstream
        .get_ref(
            &token.token,
            &target.owner,
            &target.repo,
            &format!("heads/{}", target.default_branch),
        )
        .await?;
    ctx.upstream
        .create_ref(
            &token.token,
            &target.owner,
            &target.repo,
            &format!("heads/{branch_name}"),
            &default_ref.sha,
        )
        .await?;

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for detection in &detections {
        let Some(file_path) = &detection.identity.file_path else {
            failed.push(detection.identity.name.clone());
            continue;
        };
        let content = ctx
            .upstream
            .get_file_content(&token.token, &target.owner, &target.repo, file_path, &branch_name)
            .await?;
        let Some(content) = content else {
            failed.push(detection.identity.name.clone());
            continue;
        };
        let mutation = quarantine::mutate(&content.content, &detection.identity.name, file_path);
        if !mutation.modified {
            failed.push(detection.identity.name.clone());
            continue;
        }
        ctx.upstream
            .put_file_content(
                &token.token,
                &target.owner,
                &target.repo,
                file_path,
                &branch_name,
                &mutation.text,
                &format!("flakeguard: quarantine {}", detection.identity.name),
                Some(&content.sha),
            )
            .await?;
        succeeded.push(detection.identity.name.clone());
    }

    if !succeeded.is_empty() {
        let body = format!(
            "FlakeGuard quarantined {} test(s) on this branch.\n\n## Quarantined\n{}\n\n## Could not quarantine\n{}\n\nReview and merge once you've confirmed these tests are safe to skip.",
            succeeded.len(),
            succeeded.iter().map(|n| format!("- {n}")).collect::<Vec<_>>().join("\n"),
            if failed.is_empty() { "(none)".to_string() } else { failed.iter().map(|n| format!("- {n}")).collect::<Vec<_>>().join("\n") },
        );
        let pr = ctx
            .upstream
            .create_pull_request(
                &token.token,
                &target.owner,
                &target.repo,
                "FlakeGuard: quarantine flaky tests",
                &body,
                &branch_name,
                &target.default_branch,
            )
            .await?;
        ctx.upstream
            .add_labels(
                &token.token,
                &target.owner,
                &target.repo,
                pr.number,
                &["flaky-test".into(), "quarantine".into(), "auto-generated".into()],
            )
            .await?;
    }

    for detection in &detections {
        ctx.store
            .set_detection_status(target.repository_id, &detection.identity, DetectionStatus::Quarantined)
            .await?;
    }

    Ok(())
}

async fn rerun_flow(ctx: &ActionContext, target: &Target) -> AppResult<()> {
    let token = ctx.credentials.installation_token(target.installation_id).await?;
    let run = ctx
        .store
        .get_workflow_run_by_head_sha(target.repository_id, &target.check_run.head_sha)
        .await?
        .ok_or(AppError::ResourceNotFound)?;

    if matches!(run.status, RunStatus::InProgress | RunStatus::Queued) {
        return Err(AppError::WorkflowCannotRerun("workflow run is still in progress".into()));
    }

    let jobs = ctx
        .store
        .list_jobs_for_run(run.external_id)
        .await
        .unwrap_or_default();
    let total = jobs.len() as i64;
    let failed = jobs.iter().filter(|j| j.conclusion.map(|c| c.is_failure()).unwrap_or(false)).count() as i64;

    let decision = ctx
        .rerun
        .decide(run.id, Some(target.check_run.id), failed, total)
        .await?;

    match decision {
        RerunDecision::Escalate { attempts_so_far } => {
            crate::telemetry::log_rerun_escalated(run.external_id, attempts_so_far);
            let body = format!(
                "FlakeGuard has reached the rerun ceiling ({attempts_so_far} attempts) for workflow run {}. \
                 Manual investigation is needed; the failing jobs keep failing after reruns.",
                run.external_id
            );
            ctx.upstream
                .create_issue(
                    &token.token,
                    &target.owner,
                    &target.repo,
                    &format!("[FlakeGuard] Persistent failures on run {}", run.external_id),
                    &body,
                    &["ci-failure".into(), "persistent-failure".into(), "investigation-needed".into()],
                )
                .await?;
        }
        RerunDecision::Proceed { mode, .. } => {
            match mode {
                RerunMode::Full => {
                    ctx.upstream
                        .rerun_workflow(&token.token, &target.owner, &target.repo, run.external_id)
                        .await?;
                }
                RerunMode::FailedOnly => {
                    ctx.upstream
                        .rerun_failed_jobs(&token.token, &target.owner, &target.repo, run.external_id)
                        .await?;
                }
            }
            if let Some(pr) = find_pull_request_for_sha(ctx, target, &token.token).await? {
                let comment = format!(
                    "FlakeGuard triggered a {} rerun for {} failing job(s).",
                    match mode {
                        RerunMode::Full => "full",
                        RerunMode::FailedOnly => "failed-only",
                    },
                    failed
                );
                ctx.upstream
                    .create_issue_comment(&token.token, &target.owner, &target.repo, pr.number, &comment)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn find_pull_request_for_sha(
    ctx: &ActionContext,
    target: &Target,
    token: &str,
) -> AppResult<Option<crate::upstream::PullRequestRef>> {
    let open_prs = ctx
        .upstream
        .list_pull_requests(token, &target.owner, &target.repo, "open")
        .await?;
    for pr in open_prs {
        let commits = ctx
            .upstream
            .list_commits_for_pull(token, &target.owner, &target.repo, pr.number)
            .await
            .unwrap_or_default();
        if commits.iter().any(|sha| sha == &target.check_run.head_sha) {
            return Ok(Some(pr));
        }
    }
    Ok(None)
}

async fn open_issue_flow(ctx: &ActionContext, target: &Target) -> AppResult<()> {
    let token = ctx.credentials.installation_token(target.installation_id).await?;
    let findings = ctx.store.findings_for_check_run(target.check_run.external_id).await?;
    let mut created = Vec::new();

    for identity in &findings {
        let detection = ctx
            .store
            .get_flake_detection(target.repository_id, identity)
            .await?;
        let Some(detection) = detection else { continue };

        let existing = ctx
            .upstream
            .search_issues(&token.token, &target.owner, &target.repo, &format!("label:flaky-test \"{}\"", identity.name))
            .await
            .unwrap_or_default();
        if !existing.is_empty() {
            continue;
        }

        let confidence_bucket = (detection.confidence * 100.0).round() as i64;
        let issue = ctx
            .upstream
            .create_issue(
                &token.token,
                &target.owner,
                &target.repo,
                &format!("[FlakeGuard] Flaky test detected: {}", identity.name),
                &format!(
                    "FlakeGuard detected intermittent failures in `{}` with confidence {:.2}.",
                    identity.name, detection.confidence
                ),
                &[
                    "flaky-test".into(),
                    "bug".into(),
                    "testing".into(),
                    "auto-generated".into(),
                    format!("confidence-{confidence_bucket}"),
                ],
            )
            .await?;
        created.push(issue);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if !created.is_empty() {
        if let Some(pr) = find_pull_request_for_sha(ctx, target, &token.token).await? {
            let links = created.iter().map(|i| format!("- {}", i.html_url)).collect::<Vec<_>>().join("\n");
            let comment = format!("FlakeGuard opened {} issue(s) for flaky tests:\n\n{links}", created.len());
            ctx.upstream
                .create_issue_comment(&token.token, &target.owner, &target.repo, pr.number, &comment)
                .await?;
        }
    }
    Ok(())
}

async fn dismiss_flow(ctx: &ActionContext, target: &Target) -> AppResult<()> {
    set_status_for_findings(ctx, target, DetectionStatus::Dismissed).await
}

async fn mark_stable_flow(ctx: &ActionContext, target: &Target) -> AppResult<()> {
    set_status_for_findings(ctx, target, DetectionStatus::Stable).await
}

async fn set_status_for_findings(ctx: &ActionContext, target: &Target, status: DetectionStatus) -> AppResult<()> {
    let findings = ctx.store.findings_for_check_run(target.check_run.external_id).await?;
    for identity in &findings {
        ctx.store.set_detection_status(target.repository_id, identity, status).await?;
    }
    Ok(())
}
