//! Storage seam. The engine is stateless between calls; everything it knows
//! about reservations comes from a [`ReservationStore`], and every cross-request
//! invariant (no overlapping bookings, the atomic quota mode) is enforced here.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("machine {machine_id} already booked by reservation {existing}")]
    Conflict { machine_id: Ulid, existing: Ulid },
    #[error("quota of {limit} reached")]
    QuotaExceeded { limit: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Quota condition folded into [`ReservationStore::insert_if_free`] when the
/// quota check must be atomic with the insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaGuard {
    pub requester_id: String,
    pub category: Category,
    /// UTC window of the week being counted.
    pub window: Span,
    pub limit: u32,
}

/// Result of the conditional `booked → cancelled` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTransition {
    Cancelled(Reservation),
    AlreadyCancelled(Reservation),
}

/// Receives lifecycle events while the affected machine is still locked, so one
/// machine's events reach observers in commit order.
pub trait CommitHook: Send + Sync {
    fn committed(&self, event: LifecycleEvent);
}

/// Discards events. For callers that publish nothing.
pub struct NoopHook;

impl CommitHook for NoopHook {
    fn committed(&self, _event: LifecycleEvent) {}
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomic conditional insert: succeeds only if no `booked` reservation on the
    /// same machine overlaps, and, with a guard, only if the requester is still
    /// under quota. Check and write are one indivisible step.
    async fn insert_if_free(
        &self,
        reservation: Reservation,
        quota: Option<QuotaGuard>,
        hook: &dyn CommitHook,
    ) -> Result<Reservation, StoreError>;

    /// Booked reservations on `machine_id` intersecting `span`.
    async fn find_overlapping(&self, machine_id: Ulid, span: Span) -> Result<Vec<Reservation>, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Conditional write `booked → cancelled`. A second call observes
    /// `AlreadyCancelled` and changes nothing.
    async fn cancel(&self, id: Ulid, at: Ms, hook: &dyn CommitHook) -> Result<CancelTransition, StoreError>;

    /// Booked reservations of one requester in one category starting inside `window`.
    async fn count_booked(&self, requester_id: &str, category: Category, window: Span) -> Result<u32, StoreError>;

    /// Booked reservations, optionally for one requester, ordered by start.
    async fn list_booked(&self, requester_id: Option<&str>) -> Result<Vec<Reservation>, StoreError>;
}

/// Machine inventory collaborator.
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    async fn get_machine(&self, id: Ulid) -> Result<Option<Machine>, StoreError>;

    async fn list_machines(&self) -> Result<Vec<Machine>, StoreError>;
}
