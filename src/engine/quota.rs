use std::sync::Arc;

use crate::clock::{Facility, WeekId};
use crate::model::*;
use crate::store::{QuotaGuard, ReservationStore};

use super::EngineError;

pub const DEFAULT_MAX_PER_CATEGORY: u32 = 2;

/// Weekly per-category reservation counts, always derived from the store at
/// call time. There is no cached counter to drift.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn ReservationStore>,
    facility: Facility,
    max_per_category: u32,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn ReservationStore>, facility: Facility, max_per_category: u32) -> Self {
        Self {
            store,
            facility,
            max_per_category,
        }
    }

    pub fn max_per_category(&self) -> u32 {
        self.max_per_category
    }

    pub async fn count_booked(&self, requester_id: &str, category: Category, week: WeekId) -> Result<u32, EngineError> {
        let window = self.facility.week_window(week)?;
        Ok(self.store.count_booked(requester_id, category, window).await?)
    }

    /// `max_per_category − count`, clamped at zero.
    pub async fn quota_remaining(&self, requester_id: &str, category: Category, week: WeekId) -> Result<u32, EngineError> {
        let used = self.count_booked(requester_id, category, week).await?;
        Ok(self.max_per_category.saturating_sub(used))
    }

    /// The same check, packaged for the store to run atomically with an insert.
    pub fn guard(&self, requester_id: &str, category: Category, week: WeekId) -> Result<QuotaGuard, EngineError> {
        Ok(QuotaGuard {
            requester_id: requester_id.to_string(),
            category,
            window: self.facility.week_window(week)?,
            limit: self.max_per_category,
        })
    }

    /// A guard one above the limit. Advisory bookings carry it so that a burst
    /// of concurrent callers can overshoot by one reservation and no more.
    pub fn ceiling(&self, requester_id: &str, category: Category, week: WeekId) -> Result<QuotaGuard, EngineError> {
        let mut guard = self.guard(requester_id, category, week)?;
        guard.limit = guard.limit.saturating_add(1);
        Ok(guard)
    }
}
