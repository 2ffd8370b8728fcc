//! Flake Analyzer (C5). A per-test statistical classifier: failure rate,
//! pattern extraction, confidence scoring, hysteresis (spec §4.5). Pure
//! computation over a window of `TestResult` rows; persistence is the
//! caller's job via the `Store` trait.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::AnalyzerConfig;
use crate::domain::*;
use crate::error::AppResult;
use crate::store::{FlakeDetectionUpdate, RepositorySummary, Store};

const COMMON_FLAKE_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "network error",
    "race condition",
    "timing",
    "intermittent",
    "flaky",
    "unstable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub identity: TestIdentity,
    pub is_flaky: bool,
    pub confidence: f64,
    pub failure_pattern: Option<String>,
    pub historical_failures: i64,
    pub total_runs: i64,
    pub failure_rate: f64,
    pub last_failure_at: Option<chrono::DateTime<Utc>>,
    pub suggested_action: Option<ActionToken>,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: Analysis,
    pub should_update_check: bool,
    pub suggested_actions: Vec<ActionToken>,
    pub confidence_level: ConfidenceLevel,
}

pub struct FlakeAnalyzer {
    store: Arc<dyn Store>,
    config: AnalyzerConfig,
}

impl FlakeAnalyzer {
    pub fn new(store: Arc<dyn Store>, config: AnalyzerConfig) -> Self {
        Self { store, config }
    }

    /// `analyze(execution)` — folds the new observation into the window,
    /// classifies, and upserts the `FlakeDetection` row. Failure to persist
    /// the raw `TestResult` beforehand is the caller's concern and must not
    /// block this (spec §4.5 "Persistence").
    pub async fn analyze(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
        latest: &TestResult,
    ) -> AppResult<AnalysisOutcome> {
        let since = Utc::now() - Duration::days(self.config.analysis_window_days);
        let window = self.store.list_test_results_in_window(repository_id, identity, since).await?;

        let n = window.len() as i64;
        let failures: Vec<&TestResult> = window.iter().filter(|r| r.outcome == TestOutcome::Failed).collect();
        let f = failures.len() as i64;
        let r = if n == 0 { 0.0 } else { f as f64 / n as f64 };

        let pattern = extract_pattern(&failures);
        let recent_since = Utc::now() - Duration::days(self.config.recent_failures_window_days);
        let has_recent_failure = failures.iter().any(|t| t.timestamp >= recent_since);

        let confidence = confidence_score(&self.config, n, f, r, pattern.as_deref(), latest, has_recent_failure);

        let is_flaky = n >= self.config.min_runs_for_analysis
            && r > 0.0
            && r < 1.0
            && r >= self.config.flake_threshold
            && confidence >= self.config.medium_confidence_threshold;

        let suggested_action = if !is_flaky {
            None
        } else if confidence >= self.config.high_confidence_threshold
            || (confidence >= self.config.medium_confidence_threshold && r > 0.3)
        {
            Some(ActionToken::Quarantine)
        } else if confidence >= self.config.medium_confidence_threshold && n >= 10 {
            Some(ActionToken::OpenIssue)
        } else {
            Some(ActionToken::RerunFailed)
        };

        let last_failure_at = failures.iter().map(|t| t.timestamp).max();

        let analysis = Analysis {
            identity: identity.clone(),
            is_flaky,
            confidence,
            failure_pattern: pattern,
            historical_failures: f,
            total_runs: n,
            failure_rate: r,
            last_failure_at,
            suggested_action,
        };

        let update = FlakeDetectionUpdate {
            repository_id,
            identity: identity.clone(),
            is_flaky: analysis.is_flaky,
            confidence: analysis.confidence,
            failure_pattern: analysis.failure_pattern.clone(),
            historical_failures: analysis.historical_failures,
            total_runs: analysis.total_runs,
            last_failure_at: analysis.last_failure_at,
            suggested_action: analysis.suggested_action,
        };
        self.store.upsert_flake_detection(update).await?;

        let confidence_level = if confidence >= self.config.high_confidence_threshold {
            ConfidenceLevel::High
        } else if confidence >= self.config.medium_confidence_threshold {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        };

        Ok(AnalysisOutcome {
            should_update_check: is_flaky,
            suggested_actions: generate_suggested_actions(is_flaky, &analysis),
            analysis,
            confidence_level,
        })
    }

    pub async fn batch_analyze(
        &self,
        repository_id: i64,
        results: &[TestResult],
    ) -> AppResult<Vec<AnalysisOutcome>> {
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(self.analyze(repository_id, &result.identity, result).await?);
        }
        Ok(outcomes)
    }

    pub async fn status_of(
        &self,
        repository_id: i64,
        identity: &TestIdentity,
    ) -> AppResult<Option<FlakeDetection>> {
        self.store.get_flake_detection(repository_id, identity).await
    }

    pub async fn summary_of(&self, repository_id: i64) -> AppResult<RepositorySummary> {
        self.store.summary_for_repository(repository_id).await
    }
}

/// Bounded sum in [0,1] per spec §4.5 "Confidence score".
fn confidence_score(
    config: &AnalyzerConfig,
    n: i64,
    f: i64,
    r: f64,
    pattern: Option<&str>,
    latest: &TestResult,
    has_recent_failure: bool,
) -> f64 {
    let mut score = 0.0;

    if n >= config.min_runs_for_analysis {
        score += (2.0 * r).min(0.4);
    }

    score += (0.01 * (n - config.min_runs_for_analysis) as f64).clamp(0.0, 0.2);

    if let Some(pattern) = pattern {
        let lower = pattern.to_lowercase();
        if COMMON_FLAKE_PATTERNS.iter().any(|p| lower.contains(p)) {
            score += 0.30;
        } else {
            score += 0.15;
        }
    }

    if latest.outcome == TestOutcome::Failed && has_recent_failure {
        score += 0.10;
    }

    if f > 0 && f < n {
        score += 0.15 * (1.0 - (r - 0.5).abs() * 2.0);
    }

    score.clamp(0.0, 1.0)
}

/// Scans failure error messages. First tries common-pattern containment
/// counts, then falls back to grouping by the first 100 chars of the
/// first line (spec §4.5 "Pattern extraction").
fn extract_pattern(failures: &[&TestResult]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let messages: Vec<&str> = failures.iter().filter_map(|t| t.error_message.as_deref()).collect();
    if messages.is_empty() {
        return None;
    }

    let threshold = (messages.len() as f64 / 2.0).ceil() as usize;
    let threshold = threshold.max(2);

    for pattern in COMMON_FLAKE_PATTERNS {
        let count = messages.iter().filter(|m| m.to_lowercase().contains(pattern)).count();
        if count >= threshold {
            return Some(pattern.to_string());
        }
    }

    let mut keyed: HashMap<String, usize> = HashMap::new();
    for message in &messages {
        let first_line = message.lines().next().unwrap_or("");
        let key: String = first_line.chars().take(100).collect();
        *keyed.entry(key).or_insert(0) += 1;
    }
    keyed
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .max_by_key(|(_, count)| *count)
        .map(|(key, _)| key)
}

/// Ordered subset of `{rerun_failed, quarantine, open_issue, dismiss_flake}`,
/// capped at four entries; neither `dismiss_flake` nor `quarantine` is ever
/// offered for a non-flaky test (spec §4.5).
fn generate_suggested_actions(is_flaky: bool, analysis: &Analysis) -> Vec<ActionToken> {
    if !is_flaky {
        return Vec::new();
    }
    let mut actions = Vec::with_capacity(4);
    if let Some(primary) = analysis.suggested_action {
        actions.push(primary);
    }
    for candidate in [
        ActionToken::RerunFailed,
        ActionToken::Quarantine,
        ActionToken::OpenIssue,
        ActionToken::DismissFlake,
    ] {
        if !actions.contains(&candidate) {
            actions.push(candidate);
        }
        if actions.len() == 4 {
            break;
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn make_result(repository_id: i64, outcome: TestOutcome, error_message: Option<&str>, days_ago: i64) -> TestResult {
        TestResult {
            id: 0,
            repository_id,
            identity: TestIdentity {
                name: "suite::flaky_test".into(),
                file_path: Some("tests/flaky_test.rs".into()),
                line: Some(10),
            },
            outcome,
            error_message: error_message.map(|s| s.to_string()),
            stack_trace: None,
            duration_ms: Some(100),
            timestamp: Utc::now() - Duration::days(days_ago),
            check_run_external_id: None,
            job_external_id: None,
        }
    }

    #[tokio::test]
    async fn classifies_intermittent_failures_as_flaky() {
        let store = Arc::new(MemoryStore::new());
        let identity = TestIdentity {
            name: "suite::flaky_test".into(),
            file_path: Some("tests/flaky_test.rs".into()),
            line: Some(10),
        };
        for i in 0..10 {
            let outcome = if i % 3 == 0 { TestOutcome::Failed } else { TestOutcome::Passed };
            let message = if outcome == TestOutcome::Failed { Some("connection timeout while polling") } else { None };
            let result = make_result(1, outcome, message, 1);
            store.insert_test_result(result).await.unwrap();
        }
        let analyzer = FlakeAnalyzer::new(store.clone(), AnalyzerConfig::default());
        let latest = make_result(1, TestOutcome::Failed, Some("connection timeout while polling"), 0);
        let outcome = analyzer.analyze(1, &identity, &latest).await.unwrap();
        assert!(outcome.analysis.is_flaky);
        assert!(outcome.analysis.confidence >= 0.5);
        assert_eq!(outcome.analysis.suggested_action, Some(ActionToken::Quarantine));
    }

    #[tokio::test]
    async fn always_failing_test_is_not_flaky() {
        let store = Arc::new(MemoryStore::new());
        let identity = TestIdentity {
            name: "suite::always_fails".into(),
            file_path: None,
            line: None,
        };
        for _ in 0..10 {
            store
                .insert_test_result(make_result(2, TestOutcome::Failed, Some("assert_eq failed"), 1))
                .await
                .unwrap();
        }
        let analyzer = FlakeAnalyzer::new(store.clone(), AnalyzerConfig::default());
        let latest = make_result(2, TestOutcome::Failed, Some("assert_eq failed"), 0);
        let outcome = analyzer.analyze(2, &identity, &latest).await.unwrap();
        assert!(!outcome.analysis.is_flaky);
        assert_eq!(outcome.analysis.suggested_action, None);
    }

    #[tokio::test]
    async fn below_min_runs_never_classified_as_flaky() {
        let store = Arc::new(MemoryStore::new());
        let identity = TestIdentity {
            name: "suite::new_test".into(),
            file_path: None,
            line: None,
        };
        store
            .insert_test_result(make_result(3, TestOutcome::Failed, Some("timeout"), 0))
            .await
            .unwrap();
        let analyzer = FlakeAnalyzer::new(store.clone(), AnalyzerConfig::default());
        let latest = make_result(3, TestOutcome::Failed, Some("timeout"), 0);
        let outcome = analyzer.analyze(3, &identity, &latest).await.unwrap();
        assert!(!outcome.analysis.is_flaky);
    }

    #[test]
    fn pattern_extraction_prefers_common_pattern_containment() {
        let failures = vec![
            make_result(1, TestOutcome::Failed, Some("request timeout after 30s"), 0),
            make_result(1, TestOutcome::Failed, Some("operation timeout exceeded"), 0),
            make_result(1, TestOutcome::Failed, Some("assert mismatch"), 0),
        ];
        let refs: Vec<&TestResult> = failures.iter().collect();
        assert_eq!(extract_pattern(&refs), Some("timeout".to_string()));
    }

    #[test]
    fn generate_suggested_actions_excludes_destructive_for_non_flaky() {
        let analysis = Analysis {
            identity: TestIdentity { name: "t".into(), file_path: None, line: None },
            is_flaky: false,
            confidence: 0.1,
            failure_pattern: None,
            historical_failures: 0,
            total_runs: 20,
            failure_rate: 0.0,
            last_failure_at: None,
            suggested_action: None,
        };
        assert!(generate_suggested_actions(false, &analysis).is_empty());
    }
}
