use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{CancelTransition, CommitHook, MachineDirectory, QuotaGuard, ReservationStore, StoreError};

pub type SharedMachineState = Arc<RwLock<MachineState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                // Non-append commands run after the batch they interrupted.
                if let Some(other) = deferred {
                    handle_command(&mut wal, other);
                }
            }
            other => handle_command(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes don't
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Apply a reservation event to its machine (caller holds the lock).
fn apply_to_machine(ms: &mut MachineState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.machine_id);
            ms.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, cancelled_at, .. } => {
            if let Some(r) = ms.get_mut(*id) {
                r.status = Status::Cancelled;
                r.cancelled_at = Some(*cancelled_at);
            }
        }
        // Registration is handled at the map level.
        Event::MachineRegistered { .. } => {}
    }
}

fn event_machine_id(event: &Event) -> Ulid {
    match event {
        Event::MachineRegistered { id, .. } => *id,
        Event::ReservationCreated { reservation } => reservation.machine_id,
        Event::ReservationCancelled { machine_id, .. } => *machine_id,
    }
}

/// The production store: per-machine state behind `RwLock`s, made durable by a
/// group-committed WAL.
///
/// The per-machine write lock is the atomic conditional-insert primitive: the
/// overlap check, the WAL append and the in-memory apply all happen under it.
/// Engine instances sharing one `WalStore` therefore cannot double-book.
pub struct WalStore {
    machines: DashMap<Ulid, SharedMachineState>,
    /// Reverse lookup: reservation id → machine id.
    reservation_to_machine: DashMap<Ulid, Ulid>,
    /// Serializes quota-guarded inserts of one requester.
    quota_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Held while the set of machines changes or is snapshotted.
    registry: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and spawn its writer task. Must run inside a
    /// tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_to_machine = DashMap::new();
        let mut states: HashMap<Ulid, MachineState> = HashMap::new();
        for event in &events {
            match event {
                Event::MachineRegistered { id, name, category } => {
                    states.insert(
                        *id,
                        MachineState::new(Machine {
                            id: *id,
                            name: name.clone(),
                            category: *category,
                        }),
                    );
                }
                other => {
                    if let Some(ms) = states.get_mut(&event_machine_id(other)) {
                        apply_to_machine(ms, other, &reservation_to_machine);
                    }
                }
            }
        }
        info!(
            events = events.len(),
            machines = states.len(),
            reservations = reservation_to_machine.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        let machines = states
            .into_iter()
            .map(|(id, ms)| (id, Arc::new(RwLock::new(ms))))
            .collect();

        Ok(Self {
            machines,
            reservation_to_machine,
            quota_locks: DashMap::new(),
            registry: Mutex::new(()),
            wal_tx,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn machine_state(&self, id: &Ulid) -> Option<SharedMachineState> {
        self.machines.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of the shared states, so no map guard is held across awaits.
    fn machine_states(&self) -> Vec<SharedMachineState> {
        self.machines.iter().map(|e| e.value().clone()).collect()
    }

    fn requester_lock(&self, requester_id: &str) -> Arc<Mutex<()>> {
        self.quota_locks
            .entry(requester_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    #[cfg(test)]
    fn quota_lock_count(&self) -> usize {
        self.quota_locks.len()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Add a machine to the inventory. Names are unique.
    pub async fn register_machine(&self, name: String, category: Category) -> Result<Machine, StoreError> {
        let name = name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("machine name length"));
        }
        let _registry = self.registry.lock().await;
        if self.machines.len() >= MAX_MACHINES {
            return Err(StoreError::LimitExceeded("too many machines"));
        }
        if self.find_by_name(&name).await.is_some() {
            return Err(StoreError::AlreadyExists(name));
        }
        self.insert_machine(name, category).await
    }

    /// Register `name` unless a machine with that name already exists.
    /// An existing machine of a different category is an error.
    pub async fn ensure_machine(&self, name: String, category: Category) -> Result<Machine, StoreError> {
        let name = name.trim().to_string();
        let _registry = self.registry.lock().await;
        match self.find_by_name(&name).await {
            Some(existing) if existing.category == category => Ok(existing),
            Some(_) => Err(StoreError::AlreadyExists(name)),
            None => {
                if name.is_empty() || name.len() > MAX_NAME_LEN {
                    return Err(StoreError::LimitExceeded("machine name length"));
                }
                if self.machines.len() >= MAX_MACHINES {
                    return Err(StoreError::LimitExceeded("too many machines"));
                }
                self.insert_machine(name, category).await
            }
        }
    }

    // Caller holds `registry`.
    async fn insert_machine(&self, name: String, category: Category) -> Result<Machine, StoreError> {
        let id = Ulid::new();
        let event = Event::MachineRegistered {
            id,
            name: name.clone(),
            category,
        };
        self.wal_append(&event).await?;
        let machine = Machine { id, name, category };
        self.machines
            .insert(id, Arc::new(RwLock::new(MachineState::new(machine.clone()))));
        info!(machine_id = %id, name = %machine.name, %category, "machine registered");
        Ok(machine)
    }

    async fn find_by_name(&self, name: &str) -> Option<Machine> {
        for state in self.machine_states() {
            let ms = state.read().await;
            if ms.machine.name == name {
                return Some(ms.machine.clone());
            }
        }
        None
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Cancelled reservations are kept: history is never dropped.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _registry = self.registry.lock().await;

        // Read-lock every machine (in id order) for the whole rewrite so no
        // commit can land in the old file after the snapshot was taken.
        let mut ids: Vec<Ulid> = self.machines.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.machine_state(&id) {
                guards.push(state.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for ms in &guards {
            events.push(Event::MachineRegistered {
                id: ms.machine.id,
                name: ms.machine.name.clone(),
                category: ms.machine.category,
            });
            for r in &ms.reservations {
                events.push(Event::ReservationCreated {
                    reservation: Reservation {
                        status: Status::Booked,
                        cancelled_at: None,
                        ..r.clone()
                    },
                });
                if r.status == Status::Cancelled {
                    events.push(Event::ReservationCancelled {
                        id: r.id,
                        machine_id: r.machine_id,
                        cancelled_at: r.cancelled_at.unwrap_or(r.created_at),
                    });
                }
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        drop(guards);
        debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn count_booked_in(&self, requester_id: &str, category: Category, window: Span) -> u32 {
        let mut count = 0u32;
        for state in self.machine_states() {
            let ms = state.read().await;
            if ms.machine.category != category {
                continue;
            }
            let mine = ms
                .booked()
                .filter(|r| r.requester_id == requester_id && window.contains_instant(r.span.start))
                .count();
            count += u32::try_from(mine).unwrap_or(u32::MAX);
        }
        count
    }
}

/// Drops a requester's quota lock from the map once the last holder is done,
/// so the map only ever holds requesters with an insert in flight.
struct RequesterLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    requester_id: &'a str,
}

impl Drop for RequesterLease<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(self.requester_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn insert_if_free(
        &self,
        reservation: Reservation,
        quota: Option<QuotaGuard>,
        hook: &dyn CommitHook,
    ) -> Result<Reservation, StoreError> {
        // Quota-guarded inserts of one requester are serialized, and the count
        // is taken inside that critical section. Cancellations only lower it.
        let _quota_lease;
        let _quota_permit = match &quota {
            Some(guard) => {
                _quota_lease = RequesterLease {
                    locks: &self.quota_locks,
                    requester_id: &guard.requester_id,
                };
                let permit = self.requester_lock(&guard.requester_id).lock_owned().await;
                let count = self
                    .count_booked_in(&guard.requester_id, guard.category, guard.window)
                    .await;
                if count >= guard.limit {
                    return Err(StoreError::QuotaExceeded { limit: guard.limit });
                }
                Some(permit)
            }
            None => None,
        };

        let machine_id = reservation.machine_id;
        let state = self
            .machine_state(&machine_id)
            .ok_or(StoreError::NotFound(machine_id))?;
        let mut ms = state.write().await;
        if ms.reservations.len() >= MAX_RESERVATIONS_PER_MACHINE {
            return Err(StoreError::LimitExceeded("too many reservations on machine"));
        }
        if let Some(existing) = ms.booked_overlapping(&reservation.span).next() {
            return Err(StoreError::Conflict {
                machine_id,
                existing: existing.id,
            });
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_machine(&mut ms, &event, &self.reservation_to_machine);
        hook.committed(LifecycleEvent::Booked {
            reservation: reservation.clone(),
        });
        Ok(reservation)
    }

    async fn find_overlapping(&self, machine_id: Ulid, span: Span) -> Result<Vec<Reservation>, StoreError> {
        let state = self
            .machine_state(&machine_id)
            .ok_or(StoreError::NotFound(machine_id))?;
        let ms = state.read().await;
        Ok(ms.booked_overlapping(&span).cloned().collect())
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(machine_id) = self.reservation_to_machine.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(state) = self.machine_state(&machine_id) else {
            return Ok(None);
        };
        let ms = state.read().await;
        Ok(ms.reservations.iter().find(|r| r.id == id).cloned())
    }

    async fn cancel(&self, id: Ulid, at: Ms, hook: &dyn CommitHook) -> Result<CancelTransition, StoreError> {
        let machine_id = self
            .reservation_to_machine
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let state = self
            .machine_state(&machine_id)
            .ok_or(StoreError::NotFound(machine_id))?;
        let mut ms = state.write().await;
        let current = ms
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if !current.is_booked() {
            return Ok(CancelTransition::AlreadyCancelled(current));
        }

        let event = Event::ReservationCancelled {
            id,
            machine_id,
            cancelled_at: at,
        };
        self.wal_append(&event).await?;
        apply_to_machine(&mut ms, &event, &self.reservation_to_machine);
        hook.committed(LifecycleEvent::Cancelled {
            reservation_id: id,
            machine_id,
        });
        Ok(CancelTransition::Cancelled(Reservation {
            status: Status::Cancelled,
            cancelled_at: Some(at),
            ..current
        }))
    }

    async fn count_booked(&self, requester_id: &str, category: Category, window: Span) -> Result<u32, StoreError> {
        Ok(self.count_booked_in(requester_id, category, window).await)
    }

    async fn list_booked(&self, requester_id: Option<&str>) -> Result<Vec<Reservation>, StoreError> {
        let mut out = Vec::new();
        for state in self.machine_states() {
            let ms = state.read().await;
            out.extend(
                ms.booked()
                    .filter(|r| requester_id.is_none_or(|rid| r.requester_id == rid))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.machine_id.cmp(&b.machine_id)));
        Ok(out)
    }
}

#[async_trait]
impl MachineDirectory for WalStore {
    async fn get_machine(&self, id: Ulid) -> Result<Option<Machine>, StoreError> {
        let Some(state) = self.machine_state(&id) else {
            return Ok(None);
        };
        let ms = state.read().await;
        Ok(Some(ms.machine.clone()))
    }

    async fn list_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let mut out = Vec::with_capacity(self.machines.len());
        for state in self.machine_states() {
            out.push(state.read().await.machine.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
