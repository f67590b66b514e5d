use crate::errors::CoworkError;
use crate::store::{Approval, ApprovalStatus, TaskDb};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};


/// Resolution delivered to the waiting executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn status(self) -> ApprovalStatus {
        match self {
            ApprovalOutcome::Approved => ApprovalStatus::Approved,
            ApprovalOutcome::Denied => ApprovalStatus::Denied,
            ApprovalOutcome::TimedOut => ApprovalStatus::TimedOut,
        }
    }

    fn from_status(status: ApprovalStatus) -> Option<Self> {
        match status {
            ApprovalStatus::Approved => Some(ApprovalOutcome::Approved),
            ApprovalStatus::Denied => Some(ApprovalOutcome::Denied),
            ApprovalStatus::TimedOut => Some(ApprovalOutcome::TimedOut),
            ApprovalStatus::Pending => None,
        }
    }
}

struct PendingSlot {
    task_id: String,
    tx: oneshot::Sender<ApprovalOutcome>,
    requested_at: Instant,
}

/// Blocking request/response rendezvous for destructive operations.
///
/// Each `requireApproval` decision creates a pending record and suspends the
/// executor on a oneshot channel keyed by approval id. Resolution is
/// exactly-once: duplicate responses are no-ops returning the original
/// outcome. A sweeper resolves expired approvals as `timed_out`.
pub struct ApprovalGate {
    db: Arc<TaskDb>,
    pending: Mutex<HashMap<String, PendingSlot>>,
    ttl: Duration,
}

impl ApprovalGate {
    pub fn new(db: Arc<TaskDb>, ttl: Duration) -> Self {
        Self {
            db,
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a pending approval and return the record plus the receiver the
    /// executor suspends on. At most one pending approval per task is
    /// allowed; a second request while one is pending is a protocol error.
    pub async fn request(
        &self,
        task_id: &str,
        kind: &str,
        description: &str,
        details: Value,
    ) -> Result<(Approval, oneshot::Receiver<ApprovalOutcome>), CoworkError> {
        let mut pending = self.pending.lock().await;
        if pending.values().any(|slot| slot.task_id == task_id) {
            return Err(CoworkError::Validation(format!(
                "task {task_id} already has a pending approval"
            )));
        }

        let approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            description: description.to_string(),
            details,
            status: ApprovalStatus::Pending,
            requested_at: chrono::Utc::now(),
            resolved_at: None,
        };
        self.db
            .insert_approval(&approval)
            .map_err(CoworkError::Internal)?;

        let (tx, rx) = oneshot::channel();
        pending.insert(
            approval.id.clone(),
            PendingSlot {
                task_id: task_id.to_string(),
                tx,
                requested_at: Instant::now(),
            },
        );
        info!(
            approval_id = %approval.id,
            task_id,
            kind,
            "approval requested"
        );
        Ok((approval, rx))
    }

    /// Resolve an approval. Idempotent: the first call performs the
    /// transition and wakes the executor; later calls return the recorded
    /// outcome without side effects.
    pub async fn respond(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> Result<ApprovalOutcome, CoworkError> {
        let outcome = if approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied
        };
        self.resolve(approval_id, outcome).await
    }

    async fn resolve(
        &self,
        approval_id: &str,
        outcome: ApprovalOutcome,
    ) -> Result<ApprovalOutcome, CoworkError> {
        let transitioned = self
            .db
            .resolve_approval(approval_id, outcome.status())
            .map_err(CoworkError::Internal)?;

        if !transitioned {
            // Already resolved: return the original outcome, no side effects
            let stored = self
                .db
                .get_approval(approval_id)
                .map_err(CoworkError::Internal)?
                .ok_or_else(|| {
                    CoworkError::Validation(format!("unknown approval: {approval_id}"))
                })?;
            return ApprovalOutcome::from_status(stored.status).ok_or_else(|| {
                CoworkError::Internal(anyhow::anyhow!("approval still pending after no-op resolve"))
            });
        }

        let slot = self.pending.lock().await.remove(approval_id);
        if let Some(slot) = slot {
            // Receiver may have gone away with a cancelled task
            let _ = slot.tx.send(outcome);
        }
        info!(approval_id, outcome = ?outcome, "approval resolved");
        Ok(outcome)
    }

    /// Resolve every pending approval older than the TTL as `timed_out`.
    /// Returns the number of approvals expired.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, slot)| slot.requested_at.elapsed() >= self.ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut count = 0;
        for id in expired {
            match self.resolve(&id, ApprovalOutcome::TimedOut).await {
                Ok(ApprovalOutcome::TimedOut) => count += 1,
                Ok(_) => {}
                Err(e) => warn!("failed to expire approval {id}: {e}"),
            }
        }
        count
    }

    pub fn list_pending(&self) -> Result<Vec<Approval>> {
        self.db.list_pending_approvals()
    }

    /// Spawn the background TTL sweeper. Runs until the gate is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gate = Arc::downgrade(self);
        let interval = self.ttl.min(Duration::from_secs(30)).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(gate) = gate.upgrade() else {
                    break;
                };
                let expired = gate.sweep_expired().await;
                if expired > 0 {
                    info!("expired {expired} approval(s)");
                }
            }
        })
    }
}
