//! Critical Alert Engine.
//!
//! Built entirely on the lab-result mirror; adds no storage of its own.
//! Every critical result stays queryable until it is acknowledged with a
//! clinical note, and the stored acknowledger/timestamp pair is written
//! exactly once no matter how many times the acknowledgment is retried.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::CoreError;
use crate::models::{LabResult, LabResultId, StaffId};
use crate::store::{EntityStore, ScopeFilter, StoreError};
use crate::sync::{MirrorHandle, SyncEngine};

/// Lifecycle of a single result on the alert surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Unseen,
    Viewed,
    UnacknowledgedCritical,
    Acknowledged,
}

pub fn alert_state(result: &LabResult) -> AlertState {
    if result.critical_acknowledged {
        AlertState::Acknowledged
    } else if result.abnormal_flag.is_critical() {
        AlertState::UnacknowledgedCritical
    } else if result.viewed_by.is_empty() {
        AlertState::Unseen
    } else {
        AlertState::Viewed
    }
}

pub struct CriticalAlertEngine {
    store: Arc<dyn EntityStore>,
    mirror: MirrorHandle<LabResult>,
}

impl CriticalAlertEngine {
    /// Attach to the sync engine with the caller's scope (use
    /// [`ScopeFilter::all`] for an administrative view).
    pub async fn attach(engine: &SyncEngine, filter: ScopeFilter) -> Result<Self, CoreError> {
        let mirror = engine.observe_lab_results(filter).await?;
        Ok(Self {
            store: engine.store(),
            mirror,
        })
    }

    pub fn mirror(&self) -> &MirrorHandle<LabResult> {
        &self.mirror
    }

    /// Every critical result not yet signed off, newest collection first.
    /// Never coalesced: a burst of criticals only grows this set.
    pub async fn unacknowledged(&self) -> Vec<LabResult> {
        let mut critical: Vec<LabResult> = self
            .mirror
            .snapshot()
            .await
            .into_iter()
            .filter(LabResult::needs_acknowledgment)
            .collect();
        critical.sort_by_key(|r| std::cmp::Reverse(r.collection_datetime));
        critical
    }

    /// Acknowledge a critical result with a clinical note.
    ///
    /// Idempotent: a repeat acknowledgment (sequential or racing) returns
    /// success with the original audit pair untouched.
    #[instrument(skip(self, note), fields(result_id = %result_id, staff_id = %staff))]
    pub async fn acknowledge(
        &self,
        result_id: &LabResultId,
        staff: &StaffId,
        note: &str,
    ) -> Result<LabResult, CoreError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(CoreError::Validation(
                "a clinical note is required to acknowledge a critical result".into(),
            ));
        }

        // Stage the acknowledgment locally so the alert clears without
        // waiting on the round trip; the feed echo lands on equal state.
        let now = Utc::now();
        if let Some(mut staged) = self.mirror.get(result_id).await {
            staged.critical_acknowledged = true;
            staged.acknowledged_by = Some(staff.clone());
            staged.acknowledged_at = Some(now);
            staged.acknowledgment_note = Some(note.to_string());
            self.mirror.stage(staged).await;
        }

        match self
            .store
            .acknowledge_lab_result(result_id, staff, note, now)
            .await
        {
            Ok(updated) => {
                info!("critical result acknowledged");
                self.mirror.apply_confirmed(updated.clone()).await;
                Ok(updated)
            }
            Err(StoreError::LabResultConflict(current)) if current.critical_acknowledged => {
                // Someone (possibly our own earlier retry) got there first;
                // keep their audit pair.
                self.mirror.apply_confirmed((*current).clone()).await;
                Ok(*current)
            }
            Err(err) => {
                self.mirror.rollback(result_id).await;
                Err(err.into())
            }
        }
    }

    /// Record that a staff member viewed a result. Set union, independent
    /// of acknowledgment.
    #[instrument(skip(self), fields(result_id = %result_id, viewer = %viewer))]
    pub async fn mark_viewed(
        &self,
        result_id: &LabResultId,
        viewer: &StaffId,
    ) -> Result<LabResult, CoreError> {
        if let Some(mut staged) = self.mirror.get(result_id).await {
            staged.viewed_by.insert(viewer.clone());
            self.mirror.stage(staged).await;
        }
        match self.store.mark_lab_result_viewed(result_id, viewer).await {
            Ok(updated) => {
                self.mirror.apply_confirmed(updated.clone()).await;
                Ok(updated)
            }
            Err(err) => {
                self.mirror.rollback(result_id).await;
                Err(err.into())
            }
        }
    }
}
