use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{CancelTransition, StoreError};

use super::conflict::now_ms;
use super::{Cancellation, Engine, EngineError, QuotaMode, Requester};

fn validate_requester(requester_id: &str) -> Result<(), EngineError> {
    if requester_id.is_empty() || requester_id.len() > MAX_REQUESTER_ID_LEN {
        return Err(EngineError::LimitExceeded("requester id length"));
    }
    Ok(())
}

fn record_rejection(err: &EngineError) {
    metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "kind" => err.kind()).increment(1);
}

impl Engine {
    /// Book from wall-clock input: normalize the local date and slot label,
    /// then [`Engine::create`].
    pub async fn book(
        &self,
        requester: &Requester,
        machine_id: Ulid,
        category: Category,
        date: NaiveDate,
        slot_label: &str,
    ) -> Result<Reservation, EngineError> {
        let span = self
            .config
            .facility
            .normalize(date, slot_label)
            .map_err(EngineError::from)
            .inspect_err(record_rejection)?;
        self.create(&requester.id, machine_id, category, span).await
    }

    /// Create a `booked` reservation for an already-normalized span.
    ///
    /// Order: validate → overlap read → quota read → atomic insert → event.
    /// In advisory quota mode the quota read is not atomic with the insert.
    pub async fn create(
        &self,
        requester_id: &str,
        machine_id: Ulid,
        category: Category,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        match self.try_create(requester_id, machine_id, category, span).await {
            Ok(reservation) => {
                metrics::counter!(
                    crate::observability::RESERVATIONS_CREATED_TOTAL,
                    "category" => category.as_str()
                )
                .increment(1);
                info!(
                    reservation_id = %reservation.id,
                    requester = requester_id,
                    %machine_id,
                    start = span.start,
                    "reservation booked"
                );
                Ok(reservation)
            }
            Err(e) => {
                record_rejection(&e);
                debug!(requester = requester_id, %machine_id, kind = e.kind(), "create refused: {e}");
                Err(e)
            }
        }
    }

    async fn try_create(
        &self,
        requester_id: &str,
        machine_id: Ulid,
        category: Category,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        validate_requester(requester_id)?;
        let facility = &self.config.facility;
        facility.validate_span(&span)?;

        let machine = self
            .machines
            .get_machine(machine_id)
            .await?
            .ok_or(EngineError::MachineNotFound(machine_id))?;
        if machine.category != category {
            return Err(EngineError::CategoryMismatch {
                machine_id,
                requested: category,
                actual: machine.category,
            });
        }

        // Cheap early answer; the insert below re-checks atomically.
        if let Some(existing) = self.conflicts.overlapping(machine_id, span).await?.first() {
            return Err(EngineError::SlotTaken {
                machine_id,
                existing: existing.id,
            });
        }

        let week = facility.week_of(span.start)?;
        let limit = self.config.max_per_category;
        let quota_exceeded = || EngineError::QuotaExceeded { category, week, limit };
        let guard = match self.config.quota_mode {
            QuotaMode::Advisory => {
                if self.quota.quota_remaining(requester_id, category, week).await? == 0 {
                    return Err(quota_exceeded());
                }
                Some(self.quota.ceiling(requester_id, category, week)?)
            }
            QuotaMode::Atomic => Some(self.quota.guard(requester_id, category, week)?),
        };

        let reservation = Reservation::booked(requester_id.to_string(), machine_id, category, span, now_ms());
        self.conflicts
            .reserve_if_free(reservation, guard, self.notify.as_ref())
            .await
            .map_err(|e| match e {
                StoreError::QuotaExceeded { .. } => quota_exceeded(),
                StoreError::NotFound(id) if id == machine_id => EngineError::MachineNotFound(id),
                other => other.into(),
            })
    }

    /// Cancel a reservation. Only its owner, or an admin, may cancel it.
    /// Cancelling twice is a successful no-op.
    pub async fn cancel(&self, reservation_id: Ulid, requester: &Requester) -> Result<Cancellation, EngineError> {
        let current = self
            .store
            .get(reservation_id)
            .await?
            .ok_or(EngineError::NotFound(reservation_id))?;
        if current.requester_id != requester.id && !requester.admin {
            return Err(EngineError::Forbidden(reservation_id));
        }
        if !current.is_booked() {
            debug!(%reservation_id, "already cancelled");
            return Ok(Cancellation::AlreadyCancelled(current));
        }

        match self
            .store
            .cancel(reservation_id, now_ms(), self.notify.as_ref())
            .await?
        {
            CancelTransition::Cancelled(reservation) => {
                metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
                info!(
                    %reservation_id,
                    by = %requester.id,
                    owner = %reservation.requester_id,
                    "reservation cancelled"
                );
                Ok(Cancellation::Cancelled(reservation))
            }
            // Lost a race with another cancel of the same reservation.
            CancelTransition::AlreadyCancelled(reservation) => Ok(Cancellation::AlreadyCancelled(reservation)),
        }
    }
}
