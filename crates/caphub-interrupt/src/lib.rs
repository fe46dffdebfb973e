//! Interrupt subsystem: create, notify, resolve, expire, and cancel
//! suspension points, and re-arm the owning run.
//!
//! Suspension uses an explicit resume channel: `create` registers a oneshot
//! sender keyed by interrupt id and hands the receiver to the run executor,
//! which awaits it inside the handler's suspension point. Resolution,
//! expiry, and cancellation each fire the channel exactly once; the
//! interrupt record and the signal are updated under one lock so competing
//! resolutions observe a consistent state.

mod sweeper;

use std::collections::HashMap;

use caphub_contract::bus::EventBus;
use caphub_contract::error::HubError;
use caphub_contract::event::HubEvent;
use caphub_contract::interrupt::{
    Interrupt, InterruptFilter, InterruptResponse, InterruptSpec, InterruptStatus,
};
use caphub_contract::time::current_unix_millis;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

pub use sweeper::InterruptSweeper;

/// How a suspension ended, delivered over the resume channel.
#[derive(Debug)]
pub enum InterruptOutcome {
    Resolved(InterruptResponse),
    Expired,
    Cancelled,
}

/// Receiver half of a suspension's resume channel.
pub type ResumeReceiver = oneshot::Receiver<InterruptOutcome>;

/// Interrupt service errors.
#[derive(Debug, thiserror::Error)]
pub enum InterruptServiceError {
    #[error("interrupt not found: {0}")]
    NotFound(String),

    #[error("interrupt {0} is already {1:?}")]
    AlreadyTerminal(String, InterruptStatus),

    #[error("run {0} already has a pending interrupt")]
    PendingExists(String),

    #[error("invalid interrupt status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: InterruptStatus,
        to: InterruptStatus,
    },
}

impl From<InterruptServiceError> for HubError {
    fn from(err: InterruptServiceError) -> Self {
        match &err {
            InterruptServiceError::NotFound(id) => HubError::interrupt_not_found(id),
            InterruptServiceError::AlreadyTerminal(..)
            | InterruptServiceError::PendingExists(_) => HubError::conflict(err.to_string()),
            InterruptServiceError::InvalidTransition { .. } => HubError::validation(err.to_string()),
        }
    }
}

struct Entry {
    interrupt: Interrupt,
    resume: Option<oneshot::Sender<InterruptOutcome>>,
}

/// The interrupt subsystem.
pub struct InterruptService {
    bus: EventBus,
    entries: RwLock<HashMap<String, Entry>>,
}

impl InterruptService {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a pending interrupt and return its resume channel.
    ///
    /// At most one interrupt per run may be non-terminal; a second create
    /// for the same run conflicts.
    pub async fn create(
        &self,
        spec: InterruptSpec,
    ) -> Result<(Interrupt, ResumeReceiver), InterruptServiceError> {
        let mut entries = self.entries.write().await;
        if entries
            .values()
            .any(|e| e.interrupt.run_id == spec.run_id && !e.interrupt.status.is_terminal())
        {
            return Err(InterruptServiceError::PendingExists(spec.run_id));
        }

        let interrupt = Interrupt::from_spec(spec);
        let (tx, rx) = oneshot::channel();
        entries.insert(
            interrupt.interrupt_id.clone(),
            Entry {
                interrupt: interrupt.clone(),
                resume: Some(tx),
            },
        );
        debug!(
            interrupt_id = %interrupt.interrupt_id,
            run_id = %interrupt.run_id,
            "interrupt created"
        );
        self.bus.publish(HubEvent::InterruptCreated {
            run_id: interrupt.run_id.clone(),
            interrupt: Box::new(interrupt.clone()),
        });
        Ok((interrupt, rx))
    }

    pub async fn get(&self, interrupt_id: &str) -> Result<Interrupt, InterruptServiceError> {
        let entries = self.entries.read().await;
        entries
            .get(interrupt_id)
            .map(|e| e.interrupt.clone())
            .ok_or_else(|| InterruptServiceError::NotFound(interrupt_id.to_string()))
    }

    /// List interrupts matching the filter, newest first.
    pub async fn list(&self, filter: &InterruptFilter) -> Vec<Interrupt> {
        let entries = self.entries.read().await;
        let mut matched: Vec<Interrupt> = entries
            .values()
            .map(|e| e.interrupt.clone())
            .filter(|i| filter.matches(i))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
    }

    /// Acknowledge notification delivery (`pending → notified`).
    pub async fn mark_notified(&self, interrupt_id: &str) -> Result<Interrupt, InterruptServiceError> {
        self.advance(interrupt_id, InterruptStatus::Notified).await
    }

    /// Acknowledge viewing (`notified → viewed`).
    pub async fn mark_viewed(&self, interrupt_id: &str) -> Result<Interrupt, InterruptServiceError> {
        self.advance(interrupt_id, InterruptStatus::Viewed).await
    }

    async fn advance(
        &self,
        interrupt_id: &str,
        next: InterruptStatus,
    ) -> Result<Interrupt, InterruptServiceError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(interrupt_id)
            .ok_or_else(|| InterruptServiceError::NotFound(interrupt_id.to_string()))?;
        if !entry.interrupt.status.can_transition_to(next) {
            return Err(InterruptServiceError::InvalidTransition {
                from: entry.interrupt.status,
                to: next,
            });
        }
        entry.interrupt.status = next;
        Ok(entry.interrupt.clone())
    }

    /// Resolve an interrupt with a response and signal the owning run.
    ///
    /// At most one resolution wins; competing resolutions conflict.
    pub async fn resolve(
        &self,
        interrupt_id: &str,
        response: InterruptResponse,
    ) -> Result<Interrupt, InterruptServiceError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(interrupt_id)
            .ok_or_else(|| InterruptServiceError::NotFound(interrupt_id.to_string()))?;
        if entry.interrupt.status.is_terminal() {
            return Err(InterruptServiceError::AlreadyTerminal(
                interrupt_id.to_string(),
                entry.interrupt.status,
            ));
        }
        entry.interrupt.status = InterruptStatus::Resolved;
        entry.interrupt.response = Some(response.clone());
        entry.interrupt.resolved_at = Some(current_unix_millis());
        if let Some(tx) = entry.resume.take() {
            let _ = tx.send(InterruptOutcome::Resolved(response));
        }
        debug!(interrupt_id, run_id = %entry.interrupt.run_id, "interrupt resolved");
        self.bus.publish(HubEvent::InterruptResolved {
            run_id: entry.interrupt.run_id.clone(),
            interrupt_id: interrupt_id.to_string(),
        });
        Ok(entry.interrupt.clone())
    }

    /// Expire an interrupt, signalling the owning run.
    pub async fn expire(&self, interrupt_id: &str) -> Result<Interrupt, InterruptServiceError> {
        self.finish(interrupt_id, InterruptStatus::Expired, InterruptOutcome::Expired)
            .await
    }

    /// Cancel an interrupt, signalling the owning run.
    pub async fn cancel(&self, interrupt_id: &str) -> Result<Interrupt, InterruptServiceError> {
        self.finish(
            interrupt_id,
            InterruptStatus::Cancelled,
            InterruptOutcome::Cancelled,
        )
        .await
    }

    /// Cancel the non-terminal interrupt owned by a run, if any. Used by run
    /// cancellation; a missing interrupt is not an error.
    pub async fn cancel_for_run(&self, run_id: &str) -> Option<Interrupt> {
        let id = {
            let entries = self.entries.read().await;
            entries
                .values()
                .find(|e| e.interrupt.run_id == run_id && !e.interrupt.status.is_terminal())
                .map(|e| e.interrupt.interrupt_id.clone())
        }?;
        self.cancel(&id).await.ok()
    }

    async fn finish(
        &self,
        interrupt_id: &str,
        status: InterruptStatus,
        outcome: InterruptOutcome,
    ) -> Result<Interrupt, InterruptServiceError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(interrupt_id)
            .ok_or_else(|| InterruptServiceError::NotFound(interrupt_id.to_string()))?;
        if entry.interrupt.status.is_terminal() {
            return Err(InterruptServiceError::AlreadyTerminal(
                interrupt_id.to_string(),
                entry.interrupt.status,
            ));
        }
        entry.interrupt.status = status;
        entry.interrupt.resolved_at = Some(current_unix_millis());
        if let Some(tx) = entry.resume.take() {
            let _ = tx.send(outcome);
        }
        debug!(interrupt_id, ?status, "interrupt finished");
        Ok(entry.interrupt.clone())
    }

    /// Ids of interrupts past their expiry, for the sweeper.
    pub(crate) async fn due_for_expiry(&self, now: u64) -> Vec<String> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.interrupt.is_expired_at(now))
            .map(|e| e.interrupt.interrupt_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caphub_contract::interrupt::{InterruptPayload, InterruptType};
    use serde_json::json;

    fn spec(run_id: &str) -> InterruptSpec {
        InterruptSpec::new(
            run_id,
            "agent-1",
            InterruptType::ApprovalRequired,
            InterruptPayload::new("approve?"),
            60_000,
        )
    }

    fn service() -> InterruptService {
        InterruptService::new(EventBus::default())
    }

    #[tokio::test]
    async fn test_create_then_resolve_signals_once() {
        let service = service();
        let (interrupt, rx) = service.create(spec("run-1")).await.unwrap();
        assert_eq!(interrupt.status, InterruptStatus::Pending);

        let resolved = service
            .resolve(&interrupt.interrupt_id, InterruptResponse::new(json!("approve")))
            .await
            .unwrap();
        assert_eq!(resolved.status, InterruptStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        match rx.await.unwrap() {
            InterruptOutcome::Resolved(response) => assert!(response.approved()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_competing_resolutions_conflict() {
        let service = service();
        let (interrupt, _rx) = service.create(spec("run-1")).await.unwrap();

        service
            .resolve(&interrupt.interrupt_id, InterruptResponse::new(json!(true)))
            .await
            .unwrap();
        let err = service
            .resolve(&interrupt.interrupt_id, InterruptResponse::new(json!(false)))
            .await
            .unwrap_err();
        assert!(matches!(err, InterruptServiceError::AlreadyTerminal(..)));

        // The stored response is the winner's.
        let stored = service.get(&interrupt.interrupt_id).await.unwrap();
        assert!(stored.response.unwrap().approved());
    }

    #[tokio::test]
    async fn test_one_pending_interrupt_per_run() {
        let service = service();
        let (first, _rx) = service.create(spec("run-1")).await.unwrap();
        let err = service.create(spec("run-1")).await.unwrap_err();
        assert!(matches!(err, InterruptServiceError::PendingExists(_)));

        // After the first terminates, a new one is allowed.
        service.cancel(&first.interrupt_id).await.unwrap();
        service.create(spec("run-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_transitions_are_optional() {
        let service = service();
        let (interrupt, _rx) = service.create(spec("run-1")).await.unwrap();

        let notified = service.mark_notified(&interrupt.interrupt_id).await.unwrap();
        assert_eq!(notified.status, InterruptStatus::Notified);
        let viewed = service.mark_viewed(&interrupt.interrupt_id).await.unwrap();
        assert_eq!(viewed.status, InterruptStatus::Viewed);

        // Viewed → notified would regress.
        let err = service.mark_notified(&interrupt.interrupt_id).await.unwrap_err();
        assert!(matches!(err, InterruptServiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_for_run() {
        let service = service();
        let (interrupt, rx) = service.create(spec("run-1")).await.unwrap();

        let cancelled = service.cancel_for_run("run-1").await.unwrap();
        assert_eq!(cancelled.interrupt_id, interrupt.interrupt_id);
        assert_eq!(cancelled.status, InterruptStatus::Cancelled);
        assert!(matches!(rx.await.unwrap(), InterruptOutcome::Cancelled));

        // No pending interrupt: no-op.
        assert!(service.cancel_for_run("run-2").await.is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let service = service();
        let (a, _rx_a) = service.create(spec("run-1")).await.unwrap();
        let (_b, _rx_b) = service.create(spec("run-2")).await.unwrap();
        service.cancel(&a.interrupt_id).await.unwrap();

        let pending = service
            .list(&InterruptFilter {
                status: Some(InterruptStatus::Pending),
                ..Default::default()
            })
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_id, "run-2");

        let for_run1 = service
            .list(&InterruptFilter {
                run_id: Some("run-1".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(for_run1.len(), 1);
    }
}
