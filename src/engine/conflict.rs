use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::store::{CommitHook, QuotaGuard, ReservationStore, StoreError};

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Overlap queries and the atomic reserve-if-free write, both answered by the
/// store. Nothing here locks: two engine processes sharing a store get the
/// same guarantee as two tasks in one process.
#[derive(Clone)]
pub struct ConflictIndex {
    store: Arc<dyn ReservationStore>,
}

impl ConflictIndex {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    /// True iff a booked reservation on `machine_id` intersects `span`.
    /// Back-to-back slots do not intersect.
    pub async fn has_overlap(&self, machine_id: Ulid, span: Span) -> Result<bool, EngineError> {
        Ok(!self.overlapping(machine_id, span).await?.is_empty())
    }

    pub(super) async fn overlapping(&self, machine_id: Ulid, span: Span) -> Result<Vec<Reservation>, EngineError> {
        self.store
            .find_overlapping(machine_id, span)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => EngineError::MachineNotFound(id),
                other => other.into(),
            })
    }

    /// Insert `reservation` unless its slot is already booked. Losing a race
    /// surfaces as `SlotTaken`, never as a partial record.
    pub async fn reserve_if_free(
        &self,
        reservation: Reservation,
        quota: Option<QuotaGuard>,
        hook: &dyn CommitHook,
    ) -> Result<Reservation, StoreError> {
        self.store.insert_if_free(reservation, quota, hook).await
    }
}
