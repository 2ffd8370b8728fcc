//! Structured logging conventions for the control plane's hot paths. Thin
//! wrappers over `tracing` so call sites share consistent field names
//! instead of ad hoc macros at each call site.

use tracing::{info, warn};

pub fn log_webhook_accepted(event_kind: &str, delivery_id: &str) {
    info!(event_kind, delivery_id, "webhook accepted");
}

pub fn log_webhook_duplicate(delivery_id: &str) {
    info!(delivery_id, "webhook delivery already processed");
}

pub fn log_action_dispatched(action: &str, check_run_id: i64, ok: bool) {
    if ok {
        info!(action, check_run_id, "action dispatched");
    } else {
        warn!(action, check_run_id, "action dispatch failed");
    }
}

pub fn log_rerun_escalated(workflow_run_id: i64, attempts_so_far: i64) {
    warn!(workflow_run_id, attempts_so_far, "rerun ceiling reached, escalating to issue");
}
