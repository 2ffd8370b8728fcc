//! Rerun Controller (C9). Encapsulated within the Action Dispatcher but
//! separable: maintains the append-only `RerunAttempt` log and decides
//! whether to rerun or escalate (spec §4.9). The per-workflow-run ceiling
//! check is race-free because `Store::append_rerun_attempt_if_under_ceiling`
//! counts and inserts under the same lock (memory store) or the same
//! `SELECT ... FOR UPDATE` transaction (Postgres store) — see spec §5
//! "Ordering guarantees".

use std::sync::Arc;

use crate::domain::{RerunAttempt, RerunMode};
use crate::error::AppResult;
use crate::store::{RerunSlot, Store};

pub enum RerunDecision {
    /// The rerun was recorded; dispatch the given mode upstream.
    Proceed { mode: RerunMode, attempt: RerunAttempt },
    /// The ceiling was reached before this attempt; escalate to a tracking
    /// issue instead of calling the upstream rerun endpoint.
    Escalate { attempts_so_far: i64 },
}

pub struct RerunController {
    store: Arc<dyn Store>,
    ceiling: i64,
}

impl RerunController {
    pub fn new(store: Arc<dyn Store>, ceiling: i64) -> Self {
        Self { store, ceiling }
    }

    /// `failed_job_count`/`total_job_count` describe the just-observed job
    /// set: if every job failed, the caller should use `RerunMode::Full`;
    /// otherwise `RerunMode::FailedOnly` (spec §4.7 step 4).
    pub async fn decide(
        &self,
        workflow_run_id: i64,
        check_run_id: Option<i64>,
        failed_job_count: i64,
        total_job_count: i64,
    ) -> AppResult<RerunDecision> {
        let mode = if failed_job_count == total_job_count && total_job_count > 0 {
            RerunMode::Full
        } else {
            RerunMode::FailedOnly
        };

        let slot = self
            .store
            .append_rerun_attempt_if_under_ceiling(
                RerunAttempt {
                    id: 0,
                    workflow_run_id,
                    check_run_id,
                    failed_job_count,
                    total_job_count,
                    mode,
                    created_at: chrono::Utc::now(),
                },
                self.ceiling,
            )
            .await?;

        Ok(match slot {
            RerunSlot::Inserted(attempt) => RerunDecision::Proceed { mode, attempt },
            RerunSlot::CeilingReached { attempts_so_far } => RerunDecision::Escalate { attempts_so_far },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn proceeds_under_ceiling_and_escalates_at_it() {
        let store = Arc::new(MemoryStore::new());
        let controller = RerunController::new(store, 3);

        for _ in 0..3 {
            let decision = controller.decide(1, None, 2, 5).await.unwrap();
            assert!(matches!(decision, RerunDecision::Proceed { .. }));
        }
        let decision = controller.decide(1, None, 2, 5).await.unwrap();
        assert!(matches!(decision, RerunDecision::Escalate { attempts_so_far: 3 }));
    }

    #[tokio::test]
    async fn chooses_full_mode_when_every_job_failed() {
        let store = Arc::new(MemoryStore::new());
        let controller = RerunController::new(store, 3);
        let decision = controller.decide(2, None, 5, 5).await.unwrap();
        match decision {
            RerunDecision::Proceed { mode, .. } => assert_eq!(mode, RerunMode::Full),
            _ => panic!("expected proceed"),
        }
    }

    #[tokio::test]
    async fn chooses_failed_only_mode_when_some_jobs_passed() {
        let store = Arc::new(MemoryStore::new());
        let controller = RerunController::new(store, 3);
        let decision = controller.decide(3, None, 2, 5).await.unwrap();
        match decision {
            RerunDecision::Proceed { mode, .. } => assert_eq!(mode, RerunMode::FailedOnly),
            _ => panic!("expected proceed"),
        }
    }

    #[tokio::test]
    async fn ceiling_is_scoped_per_workflow_run() {
        let store = Arc::new(MemoryStore::new());
        let controller = RerunController::new(store, 1);
        assert!(matches!(
            controller.decide(10, None, 1, 1).await.unwrap(),
            RerunDecision::Proceed { .. }
        ));
        assert!(matches!(
            controller.decide(11, None, 1, 1).await.unwrap(),
            RerunDecision::Proceed { .. }
        ));
    }
}
