use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::{control, intake};

/// The signed webhook intake endpoint, mounted at the root (not under
/// `/api`) since it's addressed directly by the source platform.
pub fn webhook_routes() -> Router {
    Router::new().route("/webhooks/github", post(intake::github_webhook))
}

/// Control API (spec §6), nested under `/api` in `main`. Mirrors the
/// teacher's flat `api_routes()` shape: one `Router::new()` built up by
/// chained `.route(...)` calls.
pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/repos/:owner/:repo/check-runs",
            post(control::create_check_run),
        )
        .route(
            "/repos/:owner/:repo/check-runs/:id",
            patch(control::update_check_run),
        )
        .route(
            "/repos/:owner/:repo/commits/:git_ref/check-runs",
            get(control::list_check_runs_for_ref),
        )
        .route(
            "/repos/:owner/:repo/actions/runs/:id/rerun",
            post(control::rerun_workflow),
        )
        .route(
            "/repos/:owner/:repo/actions/runs/:id/cancel",
            post(control::cancel_workflow),
        )
        .route(
            "/repos/:owner/:repo/actions/runs/:id/artifacts",
            get(control::list_artifacts),
        )
        .route(
            "/repos/:owner/:repo/actions/artifacts/:id/download-url",
            get(control::artifact_download_url),
        )
        .route(
            "/repos/:owner/:repo/flakes/status",
            get(control::flakes_status),
        )
        .route(
            "/repos/:owner/:repo/flakes/summary",
            get(control::flakes_summary),
        )
}
