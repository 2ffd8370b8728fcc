//! Core data model (spec §3). Plain types shared by the store, analyzer,
//! renderer and dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositorySelection {
    All,
    Selected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub external_id: i64,
    pub account_login: String,
    pub account_kind: String,
    pub repository_selection: RepositorySelection,
    pub permissions: serde_json::Value,
    pub subscribed_events: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub external_id: i64,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub installation_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    TimedOut,
    ActionRequired,
    Skipped,
}

impl Conclusion {
    pub fn is_failure(self) -> bool {
        matches!(self, Conclusion::Failure | Conclusion::TimedOut | Conclusion::ActionRequired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub external_id: i64,
    pub repository_id: i64,
    pub head_sha: String,
    pub branch: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub external_id: i64,
    /// Weak reference: dangling ids are tolerated and logged, never owned.
    pub run_external_id: i64,
    pub repository_id: i64,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionToken {
    Quarantine,
    RerunFailed,
    OpenIssue,
    DismissFlake,
    MarkStable,
}

impl ActionToken {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionToken::Quarantine => "quarantine",
            ActionToken::RerunFailed => "rerun_failed",
            ActionToken::OpenIssue => "open_issue",
            ActionToken::DismissFlake => "dismiss_flake",
            ActionToken::MarkStable => "mark_stable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunAction {
    pub identifier: ActionToken,
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: i64,
    pub external_id: i64,
    pub repository_id: i64,
    pub name: String,
    pub head_sha: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub output: CheckRunOutput,
    pub actions: Vec<CheckRunAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestIdentity {
    pub name: String,
    pub file_path: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: i64,
    pub repository_id: i64,
    pub identity: TestIdentity,
    pub outcome: TestOutcome,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub check_run_external_id: Option<i64>,
    pub job_external_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Pending,
    Quarantined,
    Dismissed,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakeDetection {
    pub id: i64,
    pub repository_id: i64,
    pub identity: TestIdentity,
    pub is_flaky: bool,
    pub confidence: f64,
    pub failure_pattern: Option<String>,
    pub historical_failures: i64,
    pub total_runs: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub suggested_action: Option<ActionToken>,
    pub status: DetectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlakeDetection {
    pub fn failure_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.historical_failures as f64 / self.total_runs as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunMode {
    Full,
    FailedOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerunAttempt {
    pub id: i64,
    pub workflow_run_id: i64,
    pub check_run_id: Option<i64>,
    pub failed_job_count: i64,
    pub total_job_count: i64,
    pub mode: RerunMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub event_kind: String,
    pub received_at: DateTime<Utc>,
}
