use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only instant type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Machine category. Quotas are counted per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Washer,
    Dryer,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Washer => "washer",
            Category::Dryer => "dryer",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "washer" => Ok(Category::Washer),
            "dryer" => Ok(Category::Dryer),
            other => Err(format!("unknown machine category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Booked,
    /// Terminal. Cancelled reservations stay in the store for history.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Ulid,
    pub name: String,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: String,
    pub machine_id: Ulid,
    pub category: Category,
    pub span: Span,
    pub status: Status,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Reservation {
    /// A fresh `booked` reservation with a new id.
    pub fn booked(requester_id: String, machine_id: Ulid, category: Category, span: Span, now: Ms) -> Self {
        Self {
            id: Ulid::new(),
            requester_id,
            machine_id,
            category,
            span,
            status: Status::Booked,
            created_at: now,
            cancelled_at: None,
        }
    }

    pub fn is_booked(&self) -> bool {
        self.status == Status::Booked
    }
}

/// Per-machine slice of the store: the machine plus its full reservation history.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub machine: Machine,
    /// Booked and cancelled reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl MachineState {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Everything at index >= the partition point starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn booked_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.is_booked())
    }

    pub fn booked(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_booked())
    }
}

/// WAL record format. Flat, no nesting beyond the reservation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MachineRegistered {
        id: Ulid,
        name: String,
        category: Category,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        machine_id: Ulid,
        cancelled_at: Ms,
    },
}

/// What observers receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    Booked { reservation: Reservation },
    Cancelled { reservation_id: Ulid, machine_id: Ulid },
}

impl LifecycleEvent {
    pub fn machine_id(&self) -> Ulid {
        match self {
            LifecycleEvent::Booked { reservation } => reservation.machine_id,
            LifecycleEvent::Cancelled { machine_id, .. } => *machine_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine {
            id: Ulid::new(),
            name: "Washer 1".into(),
            category: Category::Washer,
        }
    }

    fn reservation(ms: &MachineState, start: Ms, end: Ms) -> Reservation {
        Reservation::booked("u1".into(), ms.machine.id, ms.machine.category, Span::new(start, end), 0)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn category_parse() {
        assert_eq!("Washer".parse::<Category>().unwrap(), Category::Washer);
        assert_eq!(" dryer ".parse::<Category>().unwrap(), Category::Dryer);
        assert!("ironing".parse::<Category>().is_err());
    }

    #[test]
    fn reservations_kept_sorted() {
        let mut ms = MachineState::new(machine());
        for start in [300, 100, 200] {
            let r = reservation(&ms, start, start + 100);
            ms.insert_reservation(r);
        }
        let starts: Vec<Ms> = ms.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ms = MachineState::new(machine());
        for start in [0, 500, 1000] {
            let r = reservation(&ms, start, start + 100);
            ms.insert_reservation(r);
        }
        let hits: Vec<_> = ms.overlapping(&Span::new(450, 600)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(500, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ms = MachineState::new(machine());
        let r = reservation(&ms, 100, 200);
        ms.insert_reservation(r);
        assert_eq!(ms.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(ms.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn booked_overlapping_ignores_cancelled() {
        let mut ms = MachineState::new(machine());
        let mut r = reservation(&ms, 100, 200);
        r.status = Status::Cancelled;
        ms.insert_reservation(r);
        assert_eq!(ms.overlapping(&Span::new(100, 200)).count(), 1);
        assert_eq!(ms.booked_overlapping(&Span::new(100, 200)).count(), 0);
    }

    #[test]
    fn get_mut_finds_by_id() {
        let mut ms = MachineState::new(machine());
        let r = reservation(&ms, 100, 200);
        let id = r.id;
        ms.insert_reservation(r);
        ms.get_mut(id).unwrap().status = Status::Cancelled;
        assert!(!ms.reservations[0].is_booked());
        assert!(ms.get_mut(Ulid::new()).is_none());
    }

    #[test]
    fn lifecycle_event_json_shape() {
        let id = Ulid::new();
        let mid = Ulid::new();
        let event = LifecycleEvent::Cancelled {
            reservation_id: id,
            machine_id: mid,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "CANCELLED");
        assert_eq!(json["reservation_id"], id.to_string());
        assert_eq!(event.machine_id(), mid);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: Reservation::booked("u1".into(), Ulid::new(), Category::Dryer, Span::new(0, 10), 5),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
