pub mod availability;
mod conflict;
mod directory;
mod error;
mod queries;
mod reservation;
mod store;
mod waitlist;

pub use availability::{ServicePlan, merge_overlapping, subtract_intervals};
pub(crate) use conflict::now_ms;
pub use error::{EngineError, ErrorClass};
pub use queries::SlotQuery;
pub use reservation::ReserveRequest;
pub use store::{ScheduleStore, SharedLedger, SharedWaitlist};
pub use waitlist::{JoinRequest, estimate_waits};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, RwLockReadGuard, mpsc, oneshot};

use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
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
    // Flush even after an append error so partial bytes never leak into the
    // next batch.
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

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub store: ScheduleStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Every mutation holds this shared for its whole duration, taken before
    /// any ledger or queue lock. Compaction holds it exclusively.
    commit_gate: RwLock<()>,
    /// Serializes read-validate-write of directory entries.
    directory_lock: Mutex<()>,
}

fn replay_contended() -> io::Error {
    io::Error::other("replay: lock unexpectedly contended")
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            tracing::warn!(
                "discarding {} damaged bytes at the end of {}",
                replay.discarded_bytes,
                wal_path.display()
            );
            Wal::truncate_to(&wal_path, replay.valid_len)?;
        }
        let events = replay.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: ScheduleStore::new(),
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
        };

        // We are the sole owner of every lock here, so try_write always
        // succeeds. Never block: this may run inside an async context.
        for event in &events {
            engine.replay_event(event)?;
        }
        tracing::info!(
            "replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let store = &self.store;
        match event {
            Event::LocationUpserted { .. }
            | Event::ServiceUpserted { .. }
            | Event::StaffUpserted { .. }
            | Event::TimeOffAdded { .. }
            | Event::TimeOffRemoved { .. } => store.apply_directory(event),
            Event::AppointmentBooked { appointment } => {
                let ledger = store.ledger(appointment.staff_id, appointment.date);
                let mut guard = ledger.try_write().map_err(|_| replay_contended())?;
                store.apply_booked(&mut guard, appointment);
            }
            Event::AppointmentMoved {
                id,
                staff_id,
                date,
                span,
                at,
            } => {
                let Some(current) = store.appointment(id) else {
                    return Ok(());
                };
                let from = store.ledger(current.staff_id, current.date);
                let mut from_guard = from.try_write().map_err(|_| replay_contended())?;
                if (current.staff_id, current.date) == (*staff_id, *date) {
                    store.apply_moved(&mut from_guard, None, *id, *span, *at);
                } else {
                    let to = store.ledger(*staff_id, *date);
                    let mut to_guard = to.try_write().map_err(|_| replay_contended())?;
                    store.apply_moved(&mut from_guard, Some(&mut to_guard), *id, *span, *at);
                }
            }
            Event::AppointmentStatusChanged { id, status, at } => {
                let Some(current) = store.appointment(id) else {
                    return Ok(());
                };
                let ledger = store.ledger(current.staff_id, current.date);
                let mut guard = ledger.try_write().map_err(|_| replay_contended())?;
                store.apply_status(&mut guard, *id, *status, *at);
            }
            Event::WaitlistJoined { entry } => {
                let queue = store.waitlist(entry.location_id);
                let mut guard = queue.try_write().map_err(|_| replay_contended())?;
                store.apply_waitlist(&mut guard, event);
            }
            Event::WaitlistStatusChanged { location_id, .. }
            | Event::WaitlistReordered { location_id, .. } => {
                let queue = store.waitlist(*location_id);
                let mut guard = queue.try_write().map_err(|_| replay_contended())?;
                store.apply_waitlist(&mut guard, event);
            }
            Event::WaitlistSeated {
                id,
                location_id,
                appointment,
                at,
            } => {
                let queue = store.waitlist(*location_id);
                let mut q = queue.try_write().map_err(|_| replay_contended())?;
                let ledger = store.ledger(appointment.staff_id, appointment.date);
                let mut l = ledger.try_write().map_err(|_| replay_contended())?;
                store.apply_seated(&mut q, &mut l, *id, appointment, *at);
            }
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    /// Must be taken before any ledger or queue lock.
    pub(super) async fn begin_write(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// WAL-append, then apply. Nothing is applied if the append fails.
    /// The caller holds the write gate and whatever locks `apply` touches.
    pub(super) async fn commit(
        &self,
        event: &Event,
        apply: impl FnOnce(&ScheduleStore),
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply(&self.store);
        Ok(())
    }

    /// Fire-and-forget; called only after a commit.
    pub(super) fn publish(&self, notification: Notification) {
        self.notify.publish(notification);
    }

    /// Rewrite the log as the minimal event set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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

    async fn snapshot_events(&self) -> Vec<Event> {
        let store = &self.store;
        let mut events = Vec::new();

        for id in store.location_ids() {
            if let Some(loc) = store.location(&id) {
                events.push(Event::LocationUpserted {
                    id,
                    name: loc.name,
                    timezone: loc.timezone.name().to_string(),
                });
            }
        }
        for id in store.service_ids() {
            if let Some(service) = store.service(&id) {
                events.push(Event::ServiceUpserted { service });
            }
        }
        for id in store.staff_ids() {
            if let Some(staff) = store.staff(&id) {
                events.push(Event::StaffUpserted { staff });
            }
        }

        let mut appointments = store.appointments();
        appointments.sort_by_key(|a| a.id);
        for appointment in appointments {
            events.push(Event::AppointmentBooked { appointment });
        }

        for location_id in store.waitlist_location_ids() {
            let queue = store.waitlist(location_id);
            let guard = queue.read().await;
            // Queued entries first, in position order, so replay rebuilds
            // the same order.
            for entry in guard.queued() {
                events.push(Event::WaitlistJoined {
                    entry: entry.clone(),
                });
            }
            let mut rest: Vec<&WaitlistEntry> = guard
                .entries
                .values()
                .filter(|e| !e.status.is_queued())
                .collect();
            rest.sort_by_key(|e| e.id);
            for entry in rest {
                events.push(Event::WaitlistJoined {
                    entry: entry.clone(),
                });
            }
        }
        events
    }
}
