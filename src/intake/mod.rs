//! Webhook Intake (C3). The strict seven-step pipeline from spec §4.3,
//! mirroring the teacher's raw-body-plus-header HMAC handler in
//! `servers.rs::github_webhook`, generalized from a single stored secret
//! per server to the app-wide `FLAKEGUARD_WEBHOOK_SECRET` and a real
//! dispatch table instead of a single hardcoded `push` check.

pub mod ratelimit;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Extension};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config;
use crate::credentials::CredentialBroker;
use crate::error::{AppError, AppResult};
use crate::processors::{self, ParsedEvent};
use crate::store::Store;

use ratelimit::TokenBucketLimiter;

const SUPPORTED_EVENTS: &[&str] = &[
    "check_run",
    "check_suite",
    "workflow_run",
    "workflow_job",
    "push",
    "pull_request",
    "issues",
    "installation",
];

/// One accepted delivery, handed to the worker pool so the HTTP handler can
/// return before processing completes (spec §4.3 "Concurrency").
pub struct IntakeJob {
    pub event_kind: String,
    pub delivery_id: String,
    pub event: ParsedEvent,
}

/// Distinguishes the action-dispatch queue's `Extension` from the general
/// intake queue's — both carry `mpsc::Sender<IntakeJob>`, and axum's
/// `Extension` extractor resolves by type, not by name.
#[derive(Clone)]
pub struct ActionDispatchSender(pub mpsc::Sender<IntakeJob>);

#[tracing::instrument(skip(headers, body, store, limiter, worker_tx, action_tx, connect_info))]
pub async fn github_webhook(
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(limiter): Extension<Arc<TokenBucketLimiter>>,
    Extension(worker_tx): Extension<mpsc::Sender<IntakeJob>>,
    Extension(ActionDispatchSender(action_tx)): Extension<ActionDispatchSender>,
    ConnectInfo(connect_info): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<impl IntoResponse> {
    // 1. Header validation.
    let event_kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::InvalidPayload("missing x-github-event".into()))?
        .to_string();
    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidWebhookSignature)?;

    // 2. Constant-time signature verification.
    if !CredentialBroker::verify_webhook_signature(&body, signature, &config::WEBHOOK_SECRET) {
        return Err(AppError::InvalidWebhookSignature);
    }

    // 3. Token-bucket check per remote address, ahead of dedup recording —
    // a delivery that gets 429'd here must still look new to GitHub's
    // redelivery, so nothing is marked processed until past this gate.
    let remote_key = connect_info.ip().to_string();
    if !limiter.check(&remote_key) {
        return Err(AppError::UpstreamRateLimited {
            retry_after_secs: 60,
        });
    }

    // 4. Dedup lookup, folded into the same atomic call that records the
    // delivery — a plain lookup-then-insert would leave a race window
    // between the two steps that the distilled pipeline doesn't call out,
    // so this narrows it rather than widening it.
    let is_new = store.record_delivery(&delivery_id, &event_kind).await?;
    if !is_new {
        crate::telemetry::log_webhook_duplicate(&delivery_id);
        return Ok((
            StatusCode::OK,
            Json(json!({"success": true, "message": "already processed"})),
        ));
    }
    crate::telemetry::log_webhook_accepted(&event_kind, &delivery_id);

    if !SUPPORTED_EVENTS.contains(&event_kind.as_str()) {
        return Ok((
            StatusCode::OK,
            Json(json!({"success": true, "message": "event kind not supported"})),
        ));
    }

    // 5. Deserialize and structurally validate.
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return Ok((
                StatusCode::OK,
                Json(json!({"success": true, "message": "received but could not be processed"})),
            ))
        }
    };

    // 6. Route via the dispatch table.
    let event = match processors::parse_event(&event_kind, &payload) {
        Ok(event) => event,
        Err(_) => {
            return Ok((
                StatusCode::OK,
                Json(json!({"success": true, "message": "received but could not be processed"})),
            ))
        }
    };

    // 7. Record delivery (already done at step 4), dispatch asynchronously, respond 200.
    // Action-dispatch events (maintainer clicking a check-run button) go to
    // their own small high-priority pool so a backlog of routine intake
    // never delays an in-flight quarantine/rerun/escalate action.
    let is_action_dispatch = matches!(event, processors::ParsedEvent::CheckRunActionRequested(_));
    let job = IntakeJob {
        event_kind: event_kind.clone(),
        delivery_id: delivery_id.clone(),
        event,
    };
    let send_result = if is_action_dispatch {
        action_tx.send(job).await
    } else {
        worker_tx.send(job).await
    };
    if send_result.is_err() {
        tracing::error!(delivery_id, "intake worker pool is gone, dropping delivery");
    }

    Ok((
        StatusCode::OK,
        Json(json!({"success": true, "message": "accepted"})),
    ))
}

/// Spawns a fixed-size pool of workers draining `rx`, the same shape as the
/// teacher's `job_queue::start_worker` generalized from one task to `n`.
/// Used for both the general intake pool and the smaller action-dispatch
/// pool (spec §4.3 "Concurrency") — they differ only in queue and pool size.
pub fn spawn_intake_workers(
    n: usize,
    rx: mpsc::Receiver<IntakeJob>,
    ctx: Arc<processors::ProcessorContext>,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..n {
        let ctx = ctx.clone();
        let rx = Arc::clone(&rx);
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(job) = job else { break };
                tracing::info!(worker_id, event_kind = %job.event_kind, delivery_id = %job.delivery_id, "processing webhook delivery");
                if let Err(err) = processors::dispatch(&ctx, job.event).await {
                    tracing::error!(worker_id, delivery_id = %job.delivery_id, error = %err, "processing failed");
                }
            }
        });
    }
}
