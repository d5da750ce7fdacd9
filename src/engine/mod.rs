//! Slot allocation engine: the reservation lifecycle on top of a shared store.
//!
//! An `Engine` holds no reservation state of its own. Any number of engines may
//! share one store (and one notify hub); correctness comes from the store's
//! atomic conditional writes.

mod conflict;
mod error;
mod mutations;
mod queries;
mod quota;

pub use conflict::ConflictIndex;
pub use error::EngineError;
pub use queries::QuotaStatus;
pub use quota::{QuotaTracker, DEFAULT_MAX_PER_CATEGORY};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Facility;
use crate::model::Reservation;
use crate::notify::NotifyHub;
use crate::store::{MachineDirectory, ReservationStore};

/// Where the weekly quota is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaMode {
    /// Read the count, then insert against a ceiling of limit + 1. Concurrent
    /// callers at the boundary can end up one reservation over quota, never more.
    #[default]
    Advisory,
    /// The store re-counts inside the insert, serialized per requester.
    Atomic,
}

impl fmt::Display for QuotaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QuotaMode::Advisory => "advisory",
            QuotaMode::Atomic => "atomic",
        })
    }
}

impl FromStr for QuotaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(QuotaMode::Advisory),
            "atomic" => Ok(QuotaMode::Atomic),
            other => Err(format!("unknown quota mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub facility: Facility,
    pub max_per_category: u32,
    pub quota_mode: QuotaMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            facility: Facility::default(),
            max_per_category: DEFAULT_MAX_PER_CATEGORY,
            quota_mode: QuotaMode::default(),
        }
    }
}

/// A requester id already verified by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    /// May cancel other requesters' reservations.
    pub admin: bool,
}

impl Requester {
    pub fn member(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: true,
        }
    }
}

/// Outcome of a cancel. Both variants are successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled(Reservation),
    /// Nothing changed and no event was emitted.
    AlreadyCancelled(Reservation),
}

impl Cancellation {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Cancellation::Cancelled(r) | Cancellation::AlreadyCancelled(r) => r,
        }
    }

    pub fn into_reservation(self) -> Reservation {
        match self {
            Cancellation::Cancelled(r) | Cancellation::AlreadyCancelled(r) => r,
        }
    }

    pub fn was_noop(&self) -> bool {
        matches!(self, Cancellation::AlreadyCancelled(_))
    }
}

pub struct Engine {
    store: Arc<dyn ReservationStore>,
    machines: Arc<dyn MachineDirectory>,
    pub notify: Arc<NotifyHub>,
    quota: QuotaTracker,
    conflicts: ConflictIndex,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        machines: Arc<dyn MachineDirectory>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            quota: QuotaTracker::new(store.clone(), config.facility, config.max_per_category),
            conflicts: ConflictIndex::new(store.clone()),
            store,
            machines,
            notify,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn facility(&self) -> &Facility {
        &self.config.facility
    }
}
