//! Check-Run Renderer (C6). Produces the title/summary/actions surface for
//! a set of flaky-test findings (spec §4.6). Pure formatting: no store or
//! upstream access.

use crate::domain::{ActionToken, CheckRunAction, CheckRunOutput, FlakeDetection};

const SUMMARY_BUDGET: usize = 65_535;
const MAX_ROWS: usize = 20;
const MAX_ACTIONS: usize = 3;
const RECENT_FAILURE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Warning,
    Stable,
}

impl Severity {
    fn of(score: f64) -> Self {
        if score >= 0.8 {
            Severity::Critical
        } else if score >= 0.5 {
            Severity::Warning
        } else {
            Severity::Stable
        }
    }

    fn label(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Stable => "stable",
        }
    }
}

pub struct RepositoryRef<'a> {
    pub host: &'a str,
    pub owner: &'a str,
    pub name: &'a str,
    pub default_branch: &'a str,
}

pub struct RenderedCheck {
    pub output: CheckRunOutput,
    pub actions: Vec<CheckRunAction>,
}

/// `score` is the finding's confidence, the only ranking signal the data
/// model carries; kept as a separate parameter from `confidence` in this
/// renderer's internal sort so a future distinct severity score can slot in
/// without changing the call sites in `processors.rs`.
pub fn render(tests: &[FlakeDetection], repository: &RepositoryRef<'_>) -> RenderedCheck {
    let mut sorted: Vec<&FlakeDetection> = tests.iter().collect();
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let total = sorted.len();
    let shown = &sorted[..sorted.len().min(MAX_ROWS)];
    let truncated = total > shown.len();

    let title = render_title(shown, total);
    let summary = render_summary(shown, total, truncated, repository);
    let actions = select_actions(shown);

    RenderedCheck {
        output: CheckRunOutput {
            title,
            summary,
            text: None,
        },
        actions,
    }
}

fn render_title(shown: &[&FlakeDetection], total: usize) -> String {
    let critical = shown.iter().filter(|d| Severity::of(d.confidence) == Severity::Critical).count();
    if total == 0 {
        "FlakeGuard: no flaky tests detected".to_string()
    } else if critical > 0 {
        format!("FlakeGuard: {critical} critical flaky test(s) of {total} detected")
    } else {
        format!("FlakeGuard: {total} flaky test(s) detected")
    }
}

struct Budget {
    remaining: usize,
    body: String,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: limit,
            body: String::new(),
        }
    }

    /// Appends `section` only if it fits; returns whether it was appended.
    fn push(&mut self, section: &str) -> bool {
        if section.len() > self.remaining {
            return false;
        }
        self.body.push_str(section);
        self.remaining -= section.len();
        true
    }
}

fn render_summary(
    shown: &[&FlakeDetection],
    total: usize,
    truncated: bool,
    repository: &RepositoryRef<'_>,
) -> String {
    let mut budget = Budget::new(SUMMARY_BUDGET);

    budget.push(&format!("## FlakeGuard Report\n\n{total} flaky test(s) found in this repository.\n\n"));

    let mut table = String::from("| Test | Severity | Confidence | Failure Rate | Link |\n|---|---|---|---|---|\n");
    for detection in shown {
        let severity = Severity::of(detection.confidence);
        let name = escape_and_truncate(&detection.identity.name);
        let link = match &detection.identity.file_path {
            Some(path) => format!(
                "[view](https://{}/{}/{}/blob/{}/{}{})",
                repository.host,
                repository.owner,
                repository.name,
                repository.default_branch,
                path,
                detection
                    .identity
                    .line
                    .map(|l| format!("#L{l}"))
                    .unwrap_or_default(),
            ),
            None => "-".to_string(),
        };
        table.push_str(&format!(
            "| {} | {} | {:.2} | {:.2} | {} |\n",
            name,
            severity.label(),
            detection.confidence,
            detection.failure_rate(),
            link
        ));
    }
    table.push('\n');
    budget.push(&table);

    budget.push(
        "### Severity legend\n\n- **critical**: confidence ≥ 0.8\n- **warning**: confidence ≥ 0.5\n- **stable**: below 0.5\n\n",
    );

    budget.push(
        "### What this means\n\nThese tests pass and fail intermittently across CI runs with no code change. \
         Quarantining removes them from the required gate while they're investigated.\n\n",
    );

    let actioned: Vec<&FlakeDetection> = shown
        .iter()
        .filter(|d| d.suggested_action.is_some())
        .copied()
        .collect();
    if !actioned.is_empty() {
        budget.push(&format!(
            "### Recommended actions\n\n{} test(s) have a suggested action attached to this check run.\n\n",
            actioned.len()
        ));
    }

    if truncated {
        budget.push(&format!("\n_Showing top {} of {} findings._\n", shown.len(), total));
    }

    budget.body
}

fn select_actions(shown: &[&FlakeDetection]) -> Vec<CheckRunAction> {
    let mut actions = Vec::with_capacity(MAX_ACTIONS);

    let critical_count = shown.iter().filter(|d| Severity::of(d.confidence) == Severity::Critical).count();
    if critical_count > 0 {
        actions.push(CheckRunAction {
            identifier: ActionToken::Quarantine,
            label: "Quarantine".into(),
            description: format!("Quarantine {critical_count} critical flaky test(s)"),
        });
    }

    let recent_cutoff = chrono::Utc::now() - chrono::Duration::days(RECENT_FAILURE_WINDOW_DAYS);
    let recent_failures = shown
        .iter()
        .filter(|d| d.last_failure_at.map(|t| t >= recent_cutoff).unwrap_or(false))
        .count();
    if actions.len() < MAX_ACTIONS && recent_failures > 0 {
        actions.push(CheckRunAction {
            identifier: ActionToken::RerunFailed,
            label: "Rerun failed jobs".into(),
            description: format!("Rerun {recent_failures} test(s) that failed in the last 7 days"),
        });
    }

    if actions.len() < MAX_ACTIONS && !actions.iter().any(|a| a.identifier == ActionToken::OpenIssue) {
        actions.push(CheckRunAction {
            identifier: ActionToken::OpenIssue,
            label: "Open issue".into(),
            description: format!("Open an issue tracking {} flaky test(s)", shown.len()),
        });
    }

    actions.truncate(MAX_ACTIONS);
    actions
}

fn escape_and_truncate(name: &str) -> String {
    let escaped = name
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('*', "\\*")
        .replace('_', "\\_")
        .replace('[', "\\[")
        .replace(']', "\\]");
    if escaped.chars().count() > 50 {
        let truncated: String = escaped.chars().take(50).collect();
        format!("{truncated}…")
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DetectionStatus, TestIdentity};
    use chrono::Utc;

    fn detection(name: &str, confidence: f64, failures: i64, runs: i64) -> FlakeDetection {
        FlakeDetection {
            id: 1,
            repository_id: 1,
            identity: TestIdentity {
                name: name.into(),
                file_path: Some("tests/foo.rs".into()),
                line: Some(12),
            },
            is_flaky: true,
            confidence,
            failure_pattern: None,
            historical_failures: failures,
            total_runs: runs,
            last_failure_at: Some(Utc::now()),
            suggested_action: Some(ActionToken::Quarantine),
            status: DetectionStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn repo() -> RepositoryRef<'static> {
        RepositoryRef {
            host: "github.com",
            owner: "acme",
            name: "widgets",
            default_branch: "main",
        }
    }

    #[test]
    fn renders_critical_title_when_any_critical_present() {
        let tests = vec![detection("suite::flaky", 0.9, 4, 10)];
        let rendered = render(&tests, &repo());
        assert!(rendered.output.title.contains("critical"));
        assert_eq!(rendered.actions[0].identifier, ActionToken::Quarantine);
    }

    #[test]
    fn caps_actions_at_three() {
        let tests = vec![detection("suite::flaky", 0.9, 4, 10)];
        let rendered = render(&tests, &repo());
        assert!(rendered.actions.len() <= 3);
    }

    #[test]
    fn summary_stays_within_budget() {
        let tests: Vec<FlakeDetection> = (0..50).map(|i| detection(&format!("suite::t{i}"), 0.6, 2, 10)).collect();
        let rendered = render(&tests, &repo());
        assert!(rendered.output.summary.len() <= SUMMARY_BUDGET);
        assert!(rendered.output.summary.contains("Showing top 20 of 50"));
    }

    #[test]
    fn escapes_markdown_and_truncates_long_names() {
        let long_name = "a".repeat(60);
        let escaped = escape_and_truncate(&long_name);
        assert_eq!(escaped.chars().count(), 51);
        assert!(escaped.ends_with('…'));
    }
}
