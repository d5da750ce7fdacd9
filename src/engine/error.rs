use ulid::Ulid;

use crate::clock::{ClockError, WeekId};
use crate::model::Category;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid slot: {0}")]
    InvalidSlot(#[from] ClockError),
    #[error("weekly {category} quota of {limit} reached for {week}")]
    QuotaExceeded { category: Category, week: WeekId, limit: u32 },
    #[error("slot taken on machine {machine_id} (reservation {existing})")]
    SlotTaken { machine_id: Ulid, existing: Ulid },
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("reservation {0} belongs to another requester")]
    Forbidden(Ulid),
    #[error("machine not found: {0}")]
    MachineNotFound(Ulid),
    #[error("machine {machine_id} is a {actual}, not a {requested}")]
    CategoryMismatch {
        machine_id: Ulid,
        requested: Category,
        actual: Category,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable name used on the wire and as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidSlot(_) => "InvalidSlot",
            EngineError::QuotaExceeded { .. } => "QuotaExceeded",
            EngineError::SlotTaken { .. } => "SlotTaken",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Forbidden(_) => "Forbidden",
            EngineError::MachineNotFound(_) => "MachineNotFound",
            EngineError::CategoryMismatch { .. } => "CategoryMismatch",
            EngineError::LimitExceeded(_) => "LimitExceeded",
            EngineError::Unavailable(_) => "Unavailable",
        }
    }

    /// Only store outages are worth a transparent retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }
}

/// Context-free mapping. Conflict and quota results are mapped at their call
/// sites, where the machine and week are known.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Conflict { machine_id, existing } => EngineError::SlotTaken { machine_id, existing },
            StoreError::LimitExceeded(what) => EngineError::LimitExceeded(what),
            StoreError::Unavailable(msg) => EngineError::Unavailable(msg),
            StoreError::AlreadyExists(name) => EngineError::Unavailable(format!("unexpected duplicate: {name}")),
            StoreError::QuotaExceeded { limit } => EngineError::Unavailable(format!("unexpected quota refusal (limit {limit})")),
        }
    }
}
