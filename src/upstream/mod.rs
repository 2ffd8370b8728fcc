//! Upstream Client Facade (C2). Abstracts the source platform's REST
//! surface behind a trait so the dispatcher and processors can be tested
//! against a mock, following the teacher's preference for a narrow trait
//! at integration seams. `GitHubUpstreamClient` is the concrete adapter;
//! its retry/rate-limit behavior lives in `retry.rs`.

pub mod retry;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::domain::*;
use crate::error::AppResult;

use retry::{with_retry, RetryableError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: i64,
    pub name: String,
    pub size_in_bytes: i64,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: i64,
    pub html_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: i64,
    pub html_url: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefInfo {
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCheckRunInput<'a> {
    pub name: &'a str,
    pub head_sha: &'a str,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub output: &'a CheckRunOutput,
    pub actions: &'a [CheckRunAction],
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheckRunInput<'a> {
    pub status: Option<RunStatus>,
    pub conclusion: Option<Conclusion>,
    pub output: Option<&'a CheckRunOutput>,
    pub actions: Option<&'a [CheckRunAction]>,
}

/// Every operation the dispatcher/processors need from the source
/// platform (spec §4.2). Object-safe via `async_trait` so callers can hold
/// a `dyn UpstreamClient` and tests can substitute a recording mock.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn create_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        input: CreateCheckRunInput<'_>,
    ) -> AppResult<CheckRun>;

    async fn update_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        check_run_id: i64,
        input: UpdateCheckRunInput<'_>,
    ) -> AppResult<CheckRun>;

    async fn list_check_runs_for_ref(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        head_sha: &str,
    ) -> AppResult<Vec<CheckRun>>;

    async fn rerun_workflow(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()>;
    async fn rerun_failed_jobs(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()>;
    async fn cancel_workflow(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()>;
    async fn list_jobs_for_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> AppResult<Vec<WorkflowJob>>;

    async fn list_artifacts(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> AppResult<Vec<ArtifactMeta>>;
    async fn artifact_download_url(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        artifact_id: i64,
    ) -> AppResult<String>;

    async fn create_issue(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> AppResult<IssueRef>;
    async fn search_issues(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        query: &str,
    ) -> AppResult<Vec<IssueRef>>;

    async fn get_ref(&self, token: &str, owner: &str, repo: &str, git_ref: &str) -> AppResult<RefInfo>;
    async fn create_ref(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        ref_name: &str,
        sha: &str,
    ) -> AppResult<()>;

    async fn get_file_content(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> AppResult<Option<FileContent>>;
    async fn put_file_content(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> AppResult<()>;

    async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> AppResult<PullRequestRef>;
    async fn add_labels(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        labels: &[String],
    ) -> AppResult<()>;
    async fn create_issue_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        body: &str,
    ) -> AppResult<()>;
    async fn list_pull_requests(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> AppResult<Vec<PullRequestRef>>;
    async fn list_commits_for_pull(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: i64,
    ) -> AppResult<Vec<String>>;

    async fn get_installation(&self, token: &str, installation_id: i64) -> AppResult<serde_json::Value>;
}

pub struct GitHubUpstreamClient {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubUpstreamClient {
    pub fn new(api_base: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Sends one logical request, retrying per spec §4.2, and deserializes
    /// the JSON body on success. `timeout` overrides the client default for
    /// the long-running artifact/upload endpoints.
    async fn request_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> AppResult<T> {
        with_retry(|| async {
            let mut builder = self
                .client
                .request(method.clone(), self.url(path))
                .timeout(timeout)
                .bearer_auth(token)
                .header("accept", "application/vnd.github+json")
                .header("user-agent", "flakeguard");
            if let Some(b) = body {
                builder = builder.json(b);
            }
            let response = builder.send().await.map_err(|e| RetryableError::Transient {
                status: 0,
                message: e.to_string(),
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            if status.is_success() {
                let value = response
                    .json::<T>()
                    .await
                    .map_err(|e| RetryableError::Transient {
                        status: status.as_u16(),
                        message: e.to_string(),
                    })?;
                return Ok(value);
            }
            let message = response.text().await.unwrap_or_default();
            Err(RetryableError::classify(status.as_u16(), &headers, message))
        })
        .await
    }

    /// Same as `request_json` but discards the body — for endpoints that
    /// reply 202/204 with nothing or nothing we need.
    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<&serde_json::Value>,
    ) -> AppResult<()> {
        with_retry(|| async {
            let mut builder = self
                .client
                .request(method.clone(), self.url(path))
                .timeout(DEFAULT_TIMEOUT)
                .bearer_auth(token)
                .header("accept", "application/vnd.github+json")
                .header("user-agent", "flakeguard");
            if let Some(b) = body {
                builder = builder.json(b);
            }
            let response = builder.send().await.map_err(|e| RetryableError::Transient {
                status: 0,
                message: e.to_string(),
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            if status.is_success() {
                return Ok(());
            }
            let message = response.text().await.unwrap_or_default();
            Err(RetryableError::classify(status.as_u16(), &headers, message))
        })
        .await
    }
}

fn check_run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::InProgress => "in_progress",
        RunStatus::Completed => "completed",
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

#[async_trait]
impl UpstreamClient for GitHubUpstreamClient {
    async fn create_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        input: CreateCheckRunInput<'_>,
    ) -> AppResult<CheckRun> {
        let body = json!({
            "name": input.name,
            "head_sha": input.head_sha,
            "status": check_run_status_str(input.status),
            "conclusion": input.conclusion.map(conclusion_str),
            "output": input.output,
            "actions": input.actions,
        });
        self.request_json(
            Method::POST,
            &format!("/repos/{owner}/{repo}/check-runs"),
            token,
            Some(&body),
            DEFAULT_TIMEOUT,
        )
        .await
    }

    async fn update_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        check_run_id: i64,
        input: UpdateCheckRunInput<'_>,
    ) -> AppResult<CheckRun> {
        let body = json!({
            "status": input.status.map(check_run_status_str),
            "conclusion": input.conclusion.map(conclusion_str),
            "output": input.output,
            "actions": input.actions,
        });
        self.request_json(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}/check-runs/{check_run_id}"),
            token,
            Some(&body),
            DEFAULT_TIMEOUT,
        )
        .await
    }

    async fn list_check_runs_for_ref(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        head_sha: &str,
    ) -> AppResult<Vec<CheckRun>> {
        #[derive(Deserialize)]
        struct Page {
            check_runs: Vec<CheckRun>,
        }
        let page: Page = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{head_sha}/check-runs"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(page.check_runs)
    }

    async fn rerun_workflow(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()> {
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/rerun"),
            token,
            None,
        )
        .await
    }

    async fn rerun_failed_jobs(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()> {
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/rerun-failed-jobs"),
            token,
            None,
        )
        .await
    }

    async fn cancel_workflow(&self, token: &str, owner: &str, repo: &str, run_id: i64) -> AppResult<()> {
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/cancel"),
            token,
            None,
        )
        .await
    }

    async fn list_jobs_for_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> AppResult<Vec<WorkflowJob>> {
        #[derive(Deserialize)]
        struct Page {
            jobs: Vec<WorkflowJob>,
        }
        let page: Page = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/jobs"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(page.jobs)
    }

    async fn list_artifacts(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> AppResult<Vec<ArtifactMeta>> {
        #[derive(Deserialize)]
        struct Page {
            artifacts: Vec<ArtifactMeta>,
        }
        let page: Page = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/artifacts"),
                token,
                None,
                ARTIFACT_TIMEOUT,
            )
            .await?;
        Ok(page.artifacts)
    }

    async fn artifact_download_url(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        artifact_id: i64,
    ) -> AppResult<String> {
        with_retry(|| async {
            let response = self
                .client
                .get(self.url(&format!(
                    "/repos/{owner}/{repo}/actions/artifacts/{artifact_id}/zip"
                )))
                .timeout(ARTIFACT_TIMEOUT)
                .bearer_auth(token)
                .header("user-agent", "flakeguard")
                .send()
                .await
                .map_err(|e| RetryableError::Transient {
                    status: 0,
                    message: e.to_string(),
                })?;
            let status = response.status();
            let headers = response.headers().clone();
            if status == StatusCode::FOUND || status == StatusCode::MOVED_PERMANENTLY {
                if let Some(location) = response.headers().get("location") {
                    return Ok(location.to_str().unwrap_or_default().to_string());
                }
            }
            if status.is_success() {
                return Ok(response.url().to_string());
            }
            let message = response.text().await.unwrap_or_default();
            Err(RetryableError::classify(status.as_u16(), &headers, message))
        })
        .await
    }

    async fn create_issue(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> AppResult<IssueRef> {
        let payload = json!({ "title": title, "body": body, "labels": labels });
        self.request_json(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues"),
            token,
            Some(&payload),
            DEFAULT_TIMEOUT,
        )
        .await
    }

    async fn search_issues(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        query: &str,
    ) -> AppResult<Vec<IssueRef>> {
        #[derive(Deserialize)]
        struct SearchResult {
            items: Vec<IssueRef>,
        }
        let q = format!("repo:{owner}/{repo} {query}");
        let encoded = url::form_urlencoded::byte_serialize(q.as_bytes()).collect::<String>();
        let result: SearchResult = self
            .request_json(
                Method::GET,
                &format!("/search/issues?q={encoded}"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(result.items)
    }

    async fn get_ref(&self, token: &str, owner: &str, repo: &str, git_ref: &str) -> AppResult<RefInfo> {
        #[derive(Deserialize)]
        struct RefObject {
            sha: String,
        }
        #[derive(Deserialize)]
        struct RefResponse {
            object: RefObject,
        }
        let response: RefResponse = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/git/ref/{git_ref}"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(RefInfo {
            sha: response.object.sha,
        })
    }

    async fn create_ref(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        ref_name: &str,
        sha: &str,
    ) -> AppResult<()> {
        let body = json!({ "ref": format!("refs/{ref_name}"), "sha": sha });
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/git/refs"),
            token,
            Some(&body),
        )
        .await
    }

    async fn get_file_content(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> AppResult<Option<FileContent>> {
        #[derive(Deserialize)]
        struct ContentResponse {
            content: String,
            sha: String,
        }
        let response = self
            .client
            .get(self.url(&format!("/repos/{owner}/{repo}/contents/{path}?ref={git_ref}")))
            .timeout(DEFAULT_TIMEOUT)
            .bearer_auth(token)
            .header("user-agent", "flakeguard")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: ContentResponse = response.json().await?;
        let decoded = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            parsed.content.replace('\n', ""),
        )
        .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;
        let text = String::from_utf8(decoded).map_err(|e| crate::error::AppError::Internal(e.to_string()))?;
        Ok(Some(FileContent {
            content: text,
            sha: parsed.sha,
        }))
    }

    async fn put_file_content(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> AppResult<()> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content);
        let body = json!({
            "message": message,
            "content": encoded,
            "branch": branch,
            "sha": sha,
        });
        with_retry(|| async {
            let response = self
                .client
                .put(self.url(&format!("/repos/{owner}/{repo}/contents/{path}")))
                .timeout(UPLOAD_TIMEOUT)
                .bearer_auth(token)
                .header("user-agent", "flakeguard")
                .json(&body)
                .send()
                .await
                .map_err(|e| RetryableError::Transient {
                    status: 0,
                    message: e.to_string(),
                })?;
            let status = response.status();
            let headers = response.headers().clone();
            if status.is_success() {
                return Ok(());
            }
            let message = response.text().await.unwrap_or_default();
            Err(RetryableError::classify(status.as_u16(), &headers, message))
        })
        .await
    }

    async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> AppResult<PullRequestRef> {
        #[derive(Deserialize)]
        struct PrResponse {
            number: i64,
            html_url: String,
            head: PrHead,
        }
        #[derive(Deserialize)]
        struct PrHead {
            sha: String,
        }
        let payload = json!({ "title": title, "body": body, "head": head, "base": base });
        let response: PrResponse = self
            .request_json(
                Method::POST,
                &format!("/repos/{owner}/{repo}/pulls"),
                token,
                Some(&payload),
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(PullRequestRef {
            number: response.number,
            html_url: response.html_url,
            head_sha: response.head.sha,
        })
    }

    async fn add_labels(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        labels: &[String],
    ) -> AppResult<()> {
        let body = json!({ "labels": labels });
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues/{issue_number}/labels"),
            token,
            Some(&body),
        )
        .await
    }

    async fn create_issue_comment(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        body: &str,
    ) -> AppResult<()> {
        let payload = json!({ "body": body });
        self.request_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues/{issue_number}/comments"),
            token,
            Some(&payload),
        )
        .await
    }

    async fn list_pull_requests(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> AppResult<Vec<PullRequestRef>> {
        #[derive(Deserialize)]
        struct PrResponse {
            number: i64,
            html_url: String,
            head: PrHead,
        }
        #[derive(Deserialize)]
        struct PrHead {
            sha: String,
        }
        let items: Vec<PrResponse> = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/pulls?state={state}"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(items
            .into_iter()
            .map(|p| PullRequestRef {
                number: p.number,
                html_url: p.html_url,
                head_sha: p.head.sha,
            })
            .collect())
    }

    async fn list_commits_for_pull(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: i64,
    ) -> AppResult<Vec<String>> {
        #[derive(Deserialize)]
        struct CommitResponse {
            sha: String,
        }
        let items: Vec<CommitResponse> = self
            .request_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/pulls/{pr_number}/commits"),
                token,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(items.into_iter().map(|c| c.sha).collect())
    }

    async fn get_installation(&self, token: &str, installation_id: i64) -> AppResult<serde_json::Value> {
        self.request_json(
            Method::GET,
            &format!("/app/installations/{installation_id}"),
            token,
            None,
            DEFAULT_TIMEOUT,
        )
        .await
    }
}
