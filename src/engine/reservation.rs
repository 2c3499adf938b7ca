use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::availability::{ServicePlan, day_bounds, local_date, schedule_free_spans};
use super::conflict::{Placement, check_placement, validate_span};
use super::{Engine, EngineError};

/// How many times a write re-reads an appointment that moved under it.
const MAX_RELOCK_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub client: ClientRef,
    pub service_ids: Vec<Ulid>,
    pub start: Ms,
    pub channel: Channel,
    pub external_ref: Option<String>,
}

/// The source ledger and, for cross-ledger moves, the target.
struct LedgerPair {
    from: OwnedRwLockWriteGuard<DayLedger>,
    to: Option<OwnedRwLockWriteGuard<DayLedger>>,
}

impl LedgerPair {
    fn target(&self) -> &DayLedger {
        self.to.as_deref().unwrap_or(&self.from)
    }
}

impl Engine {
    pub async fn reserve(&self, req: ReserveRequest, now: Ms) -> Result<Appointment, EngineError> {
        if let Some(ext) = &req.external_ref
            && (ext.is_empty() || ext.len() > MAX_EXTERNAL_REF_LEN)
        {
            return Err(EngineError::LimitExceeded("external reference length"));
        }
        let staff = self.staff_member(&req.staff_id)?;
        let location = self.location(&staff.location_id)?;
        let services = self.resolve_services(&req.service_ids)?;
        if !staff.qualifies_for(&services) {
            return Err(EngineError::validation(format!(
                "staff {} is not qualified for the requested services",
                staff.id
            )));
        }
        let plan = ServicePlan::for_services(&services);
        let span = plan.service_span(req.start);
        validate_span(&span)?;
        let tz = location.timezone;
        let date = local_date(&tz, req.start)
            .ok_or_else(|| EngineError::validation("start is not a valid instant"))?;
        let schedule = schedule_free_spans(&staff, &tz, date);
        let placement = Placement {
            schedule: &schedule,
            day: day_bounds(&tz, date),
            service: span,
            buffered: plan.buffered_span(req.start),
            exclude: None,
        };

        let claim = self
            .store
            .claim_booking(req.id, req.external_ref.as_deref())?;
        let _gate = self.begin_write().await;
        let ledger = self.store.ledger(staff.id, date);
        let mut guard = ledger.write().await;

        if guard.entries.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }
        if let Err(e) = check_placement(&guard, &placement, now) {
            self.record_rejection("reserve", &e);
            return Err(e);
        }

        let appointment = Appointment {
            id: req.id,
            location_id: location.id,
            staff_id: staff.id,
            client: req.client,
            service_ids: req.service_ids,
            span,
            date,
            buffer_before: plan.buffer_before,
            buffer_after: plan.buffer_after,
            status: AppointmentStatus::Booked,
            channel: req.channel,
            external_ref: req.external_ref,
            created_at: now,
            history: Vec::new(),
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.commit(&event, |s| s.apply_booked(&mut guard, &appointment))
            .await?;
        drop(guard);
        drop(claim);

        metrics::counter!(crate::observability::RESERVATIONS_TOTAL,
            "channel" => appointment.channel.as_str())
        .increment(1);
        tracing::info!(
            "booked {} for staff {} at {} via {}",
            appointment.id,
            appointment.staff_id,
            appointment.span,
            appointment.channel.as_str()
        );
        self.publish(Notification::AppointmentBooked {
            appointment: appointment.clone(),
        });
        Ok(appointment)
    }

    /// Relocate in time and/or to another staff member at the same location.
    /// Same overlap predicate as `reserve`, ignoring the appointment itself.
    pub async fn move_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
        new_staff_id: Option<Ulid>,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.begin_write().await;
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let current = self.get_appointment(&id)?;
            if !current.status.is_movable() {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status.as_str(),
                    action: "move".into(),
                });
            }
            let staff = self.staff_member(&new_staff_id.unwrap_or(current.staff_id))?;
            if staff.location_id != current.location_id {
                return Err(EngineError::validation(format!(
                    "staff {} does not work at location {}",
                    staff.id, current.location_id
                )));
            }
            let services: Vec<Service> = current
                .service_ids
                .iter()
                .filter_map(|sid| self.store.service(sid))
                .collect();
            if !staff.qualifies_for(&services) {
                return Err(EngineError::validation(format!(
                    "staff {} is not qualified for appointment {id}",
                    staff.id
                )));
            }
            let location = self.location(&current.location_id)?;
            let tz = location.timezone;
            let plan = ServicePlan {
                total: current.span.duration_ms(),
                buffer_before: current.buffer_before,
                buffer_after: current.buffer_after,
            };
            let span = plan.service_span(new_start);
            validate_span(&span)?;
            let date = local_date(&tz, new_start)
                .ok_or_else(|| EngineError::validation("start is not a valid instant"))?;
            let schedule = schedule_free_spans(&staff, &tz, date);

            let mut pair = self
                .lock_pair((current.staff_id, current.date), (staff.id, date))
                .await;

            // Re-verify under the lock: a concurrent move or transition may
            // have changed where the appointment lives.
            let locked = self.get_appointment(&id)?;
            if (locked.staff_id, locked.date, locked.status) != (current.staff_id, current.date, current.status) {
                continue;
            }

            let placement = Placement {
                schedule: &schedule,
                day: day_bounds(&tz, date),
                service: span,
                buffered: plan.buffered_span(new_start),
                exclude: Some(id),
            };
            if let Err(e) = check_placement(pair.target(), &placement, now) {
                self.record_rejection("move", &e);
                return Err(e);
            }
            if pair.to.is_some() && pair.target().entries.len() >= MAX_APPOINTMENTS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many appointments on this day"));
            }

            let event = Event::AppointmentMoved {
                id,
                staff_id: staff.id,
                date,
                span,
                at: now,
            };
            self.commit(&event, |s| {
                s.apply_moved(&mut pair.from, pair.to.as_deref_mut(), id, span, now)
            })
            .await?;
            drop(pair);

            let moved = self.get_appointment(&id)?;
            metrics::counter!(crate::observability::MOVES_TOTAL).increment(1);
            tracing::info!(
                "moved {id} from {} {} to {} {}",
                current.staff_id,
                current.span,
                moved.staff_id,
                moved.span
            );
            self.publish(Notification::AppointmentMoved {
                appointment: moved.clone(),
            });
            return Ok(moved);
        }
        Err(EngineError::StoreUnavailable(format!(
            "appointment {id} kept moving while being relocated"
        )))
    }

    /// Drive the status machine by one event.
    pub async fn transition(&self, id: Ulid, event: StatusEvent, now: Ms) -> Result<Appointment, EngineError> {
        let _gate = self.begin_write().await;
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let current = self.get_appointment(&id)?;
            let ledger = self.store.ledger(current.staff_id, current.date);
            let mut guard = ledger.write().await;
            let locked = self.get_appointment(&id)?;
            if (locked.staff_id, locked.date) != (current.staff_id, current.date) {
                continue;
            }

            let Some(next) = locked.status.next(event) else {
                let e = EngineError::InvalidTransition {
                    id,
                    from: locked.status.as_str(),
                    action: event.as_str().into(),
                };
                self.record_rejection("transition", &e);
                return Err(e);
            };

            let wal_event = Event::AppointmentStatusChanged {
                id,
                status: next,
                at: now,
            };
            self.commit(&wal_event, |s| s.apply_status(&mut guard, id, next, now))
                .await?;
            drop(guard);

            let updated = self.get_appointment(&id)?;
            metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => next.as_str())
                .increment(1);
            tracing::info!("{id}: {} -> {}", locked.status.as_str(), next.as_str());
            self.publish(Notification::AppointmentStatusChanged {
                appointment: updated.clone(),
            });
            return Ok(updated);
        }
        Err(EngineError::StoreUnavailable(format!(
            "appointment {id} kept moving while changing status"
        )))
    }

    /// Write-lock one or two ledgers, always in key order.
    async fn lock_pair(&self, from: (Ulid, chrono::NaiveDate), to: (Ulid, chrono::NaiveDate)) -> LedgerPair {
        let from_ledger = self.store.ledger(from.0, from.1);
        if from == to {
            return LedgerPair {
                from: from_ledger.write_owned().await,
                to: None,
            };
        }
        let to_ledger = self.store.ledger(to.0, to.1);
        if from < to {
            let f = from_ledger.write_owned().await;
            let t = to_ledger.write_owned().await;
            LedgerPair { from: f, to: Some(t) }
        } else {
            let t = to_ledger.write_owned().await;
            let f = from_ledger.write_owned().await;
            LedgerPair { from: f, to: Some(t) }
        }
    }

    pub(super) fn record_rejection(&self, op: &'static str, e: &EngineError) {
        if matches!(e, EngineError::Conflict { .. }) {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "op" => op).increment(1);
        }
        tracing::debug!("{op} rejected: {e}");
    }
}
