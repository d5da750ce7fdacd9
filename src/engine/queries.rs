use futures::stream::BoxStream;
use ulid::Ulid;

use crate::clock::WeekId;
use crate::model::*;

use super::{Engine, EngineError};

/// Quota position of one requester in one category and week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub week: WeekId,
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
}

impl Engine {
    /// Booked reservations ordered by start, optionally for one requester.
    pub async fn list_active(&self, requester_id: Option<&str>) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.list_booked(requester_id).await?)
    }

    /// Any reservation by id, cancelled ones included.
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn count_booked(&self, requester_id: &str, category: Category, week: WeekId) -> Result<u32, EngineError> {
        self.quota.count_booked(requester_id, category, week).await
    }

    pub async fn quota_remaining(&self, requester_id: &str, category: Category, week: WeekId) -> Result<u32, EngineError> {
        self.quota.quota_remaining(requester_id, category, week).await
    }

    pub async fn quota_status(&self, requester_id: &str, category: Category, week: WeekId) -> Result<QuotaStatus, EngineError> {
        let used = self.quota.count_booked(requester_id, category, week).await?;
        let limit = self.quota.max_per_category();
        Ok(QuotaStatus {
            week,
            used,
            remaining: limit.saturating_sub(used),
            limit,
        })
    }

    pub async fn machines(&self) -> Result<Vec<Machine>, EngineError> {
        Ok(self.machines.list_machines().await?)
    }

    pub async fn has_overlap(&self, machine_id: Ulid, span: Span) -> Result<bool, EngineError> {
        self.conflicts.has_overlap(machine_id, span).await
    }

    /// Every lifecycle event from now on, in emission order.
    pub fn events(&self) -> BoxStream<'static, LifecycleEvent> {
        self.notify.events()
    }

    /// One machine's lifecycle events from now on. The machine must exist.
    pub async fn machine_events(&self, machine_id: Ulid) -> Result<BoxStream<'static, LifecycleEvent>, EngineError> {
        self.machines
            .get_machine(machine_id)
            .await?
            .ok_or(EngineError::MachineNotFound(machine_id))?;
        Ok(self.notify.machine_events(machine_id))
    }
}
