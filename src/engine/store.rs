use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{RwLock, watch};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedLedger = Arc<RwLock<DayLedger>>;
pub type SharedWaitlist = Arc<RwLock<WaitlistQueue>>;
pub type LedgerKey = (Ulid, NaiveDate);

/// Persisted entities and their indexes. Pure data: callers hold the right
/// ledger/queue lock before calling any `apply_*`.
pub struct ScheduleStore {
    locations: DashMap<Ulid, Location>,
    services: DashMap<Ulid, Service>,
    staff: DashMap<Ulid, StaffMember>,
    /// Location → staff ids, sorted.
    staff_by_location: DashMap<Ulid, Vec<Ulid>>,
    ledgers: DashMap<LedgerKey, SharedLedger>,
    appointments: DashMap<Ulid, Appointment>,
    /// External call id → appointment id.
    external_refs: DashMap<String, Ulid>,
    /// Appointment ids claimed by bookings that have not committed yet.
    pending_ids: DashSet<Ulid>,
    /// External call ids claimed by uncommitted bookings. The receiver
    /// closes when the claim is released.
    pending_refs: DashMap<String, (Ulid, watch::Receiver<()>)>,
    waitlists: DashMap<Ulid, SharedWaitlist>,
    /// Waitlist entry id → location id.
    waitlist_index: DashMap<Ulid, Ulid>,
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self {
            locations: DashMap::new(),
            services: DashMap::new(),
            staff: DashMap::new(),
            staff_by_location: DashMap::new(),
            ledgers: DashMap::new(),
            appointments: DashMap::new(),
            external_refs: DashMap::new(),
            pending_ids: DashSet::new(),
            pending_refs: DashMap::new(),
            waitlists: DashMap::new(),
            waitlist_index: DashMap::new(),
        }
    }

    // ── Directory reads ──────────────────────────────────────

    pub fn location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    pub fn service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn staff(&self, id: &Ulid) -> Option<StaffMember> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn staff_at(&self, location_id: &Ulid) -> Vec<StaffMember> {
        let ids = self
            .staff_by_location
            .get(location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.staff(id)).collect()
    }

    pub fn location_ids(&self) -> Vec<Ulid> {
        self.locations.iter().map(|e| *e.key()).collect()
    }

    pub fn service_ids(&self) -> Vec<Ulid> {
        self.services.iter().map(|e| *e.key()).collect()
    }

    pub fn staff_ids(&self) -> Vec<Ulid> {
        self.staff.iter().map(|e| *e.key()).collect()
    }

    // ── Ledgers ──────────────────────────────────────────────

    /// The ledger for `(staff, date)`, created empty on first write.
    pub fn ledger(&self, staff_id: Ulid, date: NaiveDate) -> SharedLedger {
        self.ledgers
            .entry((staff_id, date))
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(staff_id, date))))
            .value()
            .clone()
    }

    /// The ledger if one exists; reads never create ledgers.
    pub fn existing_ledger(&self, staff_id: Ulid, date: NaiveDate) -> Option<SharedLedger> {
        self.ledgers.get(&(staff_id, date)).map(|e| e.value().clone())
    }

    pub fn ledger_keys(&self) -> Vec<LedgerKey> {
        self.ledgers.iter().map(|e| *e.key()).collect()
    }

    // ── Appointments ─────────────────────────────────────────

    pub fn appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    pub fn appointment_for_external_ref(&self, external_ref: &str) -> Option<Appointment> {
        let id = *self.external_refs.get(external_ref)?.value();
        self.appointment(&id)
    }

    /// Reserve `id` (and `external_ref`) for one booking until the returned
    /// claim drops. Ledger locks are per staff and date, so uniqueness across
    /// ledgers is enforced here. The reference is claimed first so a repeated
    /// request reports the reference, not its own id.
    pub fn claim_booking(
        &self,
        id: Ulid,
        external_ref: Option<&str>,
    ) -> Result<BookingClaim<'_>, EngineError> {
        let mut claim = BookingClaim {
            store: self,
            id,
            id_claimed: false,
            external_ref: None,
            _released: None,
        };
        if let Some(ext) = external_ref {
            match self.pending_refs.entry(ext.to_string()) {
                Entry::Occupied(e) => return Err(EngineError::DuplicateExternalRef(e.get().0)),
                Entry::Vacant(e) => {
                    let (tx, rx) = watch::channel(());
                    e.insert((id, rx));
                    claim.external_ref = Some(ext.to_string());
                    claim._released = Some(tx);
                }
            }
            let existing = self.external_refs.get(ext).map(|e| *e.value());
            if let Some(owner) = existing {
                return Err(EngineError::DuplicateExternalRef(owner));
            }
        }
        if !self.pending_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        claim.id_claimed = true;
        // Checked after claiming: a committed booking is applied before its
        // claim is released.
        if self.appointments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(claim)
    }

    /// The appointment booked under `external_ref`, after any booking still
    /// holding a claim on it has committed or failed.
    pub async fn settled_external_ref(&self, external_ref: &str) -> Option<Appointment> {
        let pending = self
            .pending_refs
            .get(external_ref)
            .map(|e| e.value().1.clone());
        if let Some(mut released) = pending {
            // Errors once the claim's sender is dropped.
            let _ = released.changed().await;
        }
        self.appointment_for_external_ref(external_ref)
    }

    /// Every appointment on a staff member's day, terminal ones included.
    pub fn appointments_for(&self, staff_id: Ulid, date: NaiveDate) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| e.staff_id == staff_id && e.date == date)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| (a.span.start, a.id));
        out
    }

    pub fn appointments(&self) -> Vec<Appointment> {
        self.appointments.iter().map(|e| e.value().clone()).collect()
    }

    // ── Waitlists ────────────────────────────────────────────

    pub fn waitlist(&self, location_id: Ulid) -> SharedWaitlist {
        self.waitlists
            .entry(location_id)
            .or_insert_with(|| Arc::new(RwLock::new(WaitlistQueue::new(location_id))))
            .value()
            .clone()
    }

    pub fn waitlist_location(&self, entry_id: &Ulid) -> Option<Ulid> {
        self.waitlist_index.get(entry_id).map(|e| *e.value())
    }

    pub fn waitlist_location_ids(&self) -> Vec<Ulid> {
        self.waitlists.iter().map(|e| *e.key()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Directory events touch no ledger or queue.
    pub fn apply_directory(&self, event: &Event) {
        match event {
            Event::LocationUpserted { id, name, timezone } => {
                let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
                self.locations.insert(
                    *id,
                    Location {
                        id: *id,
                        name: name.clone(),
                        timezone: tz,
                    },
                );
            }
            Event::ServiceUpserted { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::StaffUpserted { staff } => {
                if let Some(old) = self.staff.insert(staff.id, staff.clone())
                    && old.location_id != staff.location_id
                    && let Some(mut ids) = self.staff_by_location.get_mut(&old.location_id)
                {
                    ids.retain(|id| *id != staff.id);
                }
                let mut ids = self.staff_by_location.entry(staff.location_id).or_default();
                if let Err(pos) = ids.binary_search(&staff.id) {
                    ids.insert(pos, staff.id);
                }
            }
            Event::TimeOffAdded { staff_id, time_off } => {
                if let Some(mut s) = self.staff.get_mut(staff_id) {
                    s.time_off.push(time_off.clone());
                    s.time_off.sort_by_key(|t| t.start);
                }
            }
            Event::TimeOffRemoved { staff_id, id } => {
                if let Some(mut s) = self.staff.get_mut(staff_id) {
                    s.time_off.retain(|t| t.id != *id);
                }
            }
            _ => {}
        }
    }

    pub fn apply_booked(&self, ledger: &mut DayLedger, appointment: &Appointment) {
        if appointment.status.is_active() {
            ledger.insert(LedgerEntry {
                appointment_id: appointment.id,
                buffered: appointment.buffered_span(),
            });
        }
        if let Some(ext) = &appointment.external_ref {
            self.external_refs.insert(ext.clone(), appointment.id);
        }
        self.appointments.insert(appointment.id, appointment.clone());
    }

    /// `to` is `None` when the move stays on the same ledger.
    pub fn apply_moved(
        &self,
        from: &mut DayLedger,
        to: Option<&mut DayLedger>,
        id: Ulid,
        span: Span,
        at: Ms,
    ) {
        let Some(mut appt) = self.appointments.get_mut(&id) else {
            return;
        };
        from.remove(id);
        let target: &mut DayLedger = match to {
            Some(t) => t,
            None => from,
        };
        let from_staff = appt.staff_id;
        let from_span = appt.span;
        appt.staff_id = target.staff_id;
        appt.date = target.date;
        appt.span = span;
        appt.history.push(AuditEntry {
            at,
            change: AuditChange::Moved {
                from_staff,
                to_staff: target.staff_id,
                from: from_span,
                to: span,
            },
        });
        target.insert(LedgerEntry {
            appointment_id: id,
            buffered: appt.buffered_span(),
        });
    }

    pub fn apply_status(&self, ledger: &mut DayLedger, id: Ulid, status: AppointmentStatus, at: Ms) {
        let Some(mut appt) = self.appointments.get_mut(&id) else {
            return;
        };
        let from = appt.status;
        appt.status = status;
        appt.history.push(AuditEntry {
            at,
            change: AuditChange::Status { from, to: status },
        });
        if !status.is_active() {
            ledger.remove(id);
        }
    }

    pub fn apply_waitlist(&self, queue: &mut WaitlistQueue, event: &Event) {
        match event {
            Event::WaitlistJoined { entry } => {
                self.waitlist_index.insert(entry.id, entry.location_id);
                if entry.status.is_queued() && !queue.order.contains(&entry.id) {
                    queue.order.push(entry.id);
                }
                queue.entries.insert(entry.id, entry.clone());
            }
            Event::WaitlistStatusChanged { id, status, at, .. } => {
                if let Some(entry) = queue.entries.get_mut(id) {
                    entry.status = *status;
                    entry.status_changed_at = *at;
                }
                if !status.is_queued() {
                    queue.order.retain(|e| e != id);
                }
            }
            Event::WaitlistReordered { id, position, .. } => {
                if let Some(idx) = queue.order.iter().position(|e| e == id) {
                    queue.order.remove(idx);
                    let target = (*position as usize)
                        .saturating_sub(1)
                        .min(queue.order.len());
                    queue.order.insert(target, *id);
                }
            }
            _ => {}
        }
    }

    pub fn apply_seated(
        &self,
        queue: &mut WaitlistQueue,
        ledger: &mut DayLedger,
        id: Ulid,
        appointment: &Appointment,
        at: Ms,
    ) {
        self.apply_booked(ledger, appointment);
        if let Some(entry) = queue.entries.get_mut(&id) {
            entry.status = WaitlistStatus::Seated;
            entry.status_changed_at = at;
            entry.appointment_id = Some(appointment.id);
        }
        queue.order.retain(|e| *e != id);
    }
}

/// An appointment id, and optionally an external call id, held for one
/// in-flight booking.
pub struct BookingClaim<'a> {
    store: &'a ScheduleStore,
    id: Ulid,
    id_claimed: bool,
    external_ref: Option<String>,
    _released: Option<watch::Sender<()>>,
}

impl Drop for BookingClaim<'_> {
    fn drop(&mut self) {
        if self.id_claimed {
            self.store.pending_ids.remove(&self.id);
        }
        if let Some(ext) = &self.external_ref {
            self.store.pending_refs.remove(ext);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn appointment(staff_id: Ulid, date: NaiveDate, span: Span) -> Appointment {
        Appointment {
            id: Ulid::new(),
            location_id: Ulid::new(),
            staff_id,
            client: ClientRef::Known(Ulid::new()),
            service_ids: vec![Ulid::new()],
            span,
            date,
            buffer_before: 0,
            buffer_after: 10,
            status: AppointmentStatus::Booked,
            channel: Channel::Web,
            external_ref: Some("call-1".into()),
            created_at: 0,
            history: vec![],
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[tokio::test]
    async fn booked_then_cancelled_leaves_record_but_frees_ledger() {
        let store = ScheduleStore::new();
        let staff = Ulid::new();
        let appt = appointment(staff, date(), Span::new(100, 200));
        let ledger = store.ledger(staff, date());
        let mut guard = ledger.write().await;

        store.apply_booked(&mut guard, &appt);
        assert_eq!(guard.busy(), vec![Span::new(100, 210)]);
        assert_eq!(store.appointment_for_external_ref("call-1").unwrap().id, appt.id);

        store.apply_status(&mut guard, appt.id, AppointmentStatus::Cancelled, 50);
        assert!(guard.entries.is_empty());
        let kept = store.appointment(&appt.id).unwrap();
        assert_eq!(kept.status, AppointmentStatus::Cancelled);
        assert_eq!(kept.history.len(), 1);
    }

    #[tokio::test]
    async fn move_within_one_ledger_replaces_entry() {
        let store = ScheduleStore::new();
        let staff = Ulid::new();
        let appt = appointment(staff, date(), Span::new(100, 200));
        let ledger = store.ledger(staff, date());
        let mut guard = ledger.write().await;
        store.apply_booked(&mut guard, &appt);

        store.apply_moved(&mut guard, None, appt.id, Span::new(300, 400), 1);
        assert_eq!(guard.busy(), vec![Span::new(300, 410)]);
        let moved = store.appointment(&appt.id).unwrap();
        assert_eq!(moved.span, Span::new(300, 400));
        assert!(matches!(moved.history[0].change, AuditChange::Moved { .. }));
    }

    #[tokio::test]
    async fn move_across_ledgers() {
        let store = ScheduleStore::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let appt = appointment(a, date(), Span::new(100, 200));
        let la = store.ledger(a, date());
        let lb = store.ledger(b, date());
        let mut ga = la.write().await;
        let mut gb = lb.write().await;
        store.apply_booked(&mut ga, &appt);

        store.apply_moved(&mut ga, Some(&mut gb), appt.id, Span::new(100, 200), 1);
        assert!(ga.entries.is_empty());
        assert_eq!(gb.entries.len(), 1);
        assert_eq!(store.appointment(&appt.id).unwrap().staff_id, b);
    }

    #[test]
    fn staff_index_follows_location_changes() {
        let store = ScheduleStore::new();
        let (loc_a, loc_b) = (Ulid::new(), Ulid::new());
        let mut staff = StaffMember {
            id: Ulid::new(),
            location_id: loc_a,
            name: "A".into(),
            categories: BTreeSet::new(),
            week: WeekSchedule::closed(),
            time_off: vec![],
            takes_walk_ins: false,
        };
        store.apply_directory(&Event::StaffUpserted { staff: staff.clone() });
        assert_eq!(store.staff_at(&loc_a).len(), 1);

        staff.location_id = loc_b;
        store.apply_directory(&Event::StaffUpserted { staff });
        assert!(store.staff_at(&loc_a).is_empty());
        assert_eq!(store.staff_at(&loc_b).len(), 1);
    }

    #[tokio::test]
    async fn reorder_clamps_position() {
        let store = ScheduleStore::new();
        let loc = Ulid::new();
        let queue = store.waitlist(loc);
        let mut q = queue.write().await;
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            let entry = WaitlistEntry {
                id: *id,
                location_id: loc,
                client: ClientRef::Contact { name: Some(format!("c{i}")), phone: None },
                notes: None,
                service_ids: vec![],
                estimated_duration_min: 20,
                arrived_at: i as Ms,
                status: WaitlistStatus::Waiting,
                status_changed_at: i as Ms,
                appointment_id: None,
            };
            store.apply_waitlist(&mut q, &Event::WaitlistJoined { entry });
        }
        store.apply_waitlist(
            &mut q,
            &Event::WaitlistReordered { id: ids[0], location_id: loc, position: 99, at: 5 },
        );
        assert_eq!(q.order, vec![ids[1], ids[2], ids[0]]);
        store.apply_waitlist(
            &mut q,
            &Event::WaitlistReordered { id: ids[0], location_id: loc, position: 1, at: 6 },
        );
        assert_eq!(q.order, vec![ids[0], ids[1], ids[2]]);
        assert_eq!(store.waitlist_location(&ids[2]), Some(loc));
    }
}
