use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::availability::{ServicePlan, day_bounds, local_date, schedule_free_spans};
use super::conflict::{Placement, check_placement};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: Ulid,
    pub location_id: Ulid,
    pub client: ClientRef,
    pub notes: Option<String>,
    pub service_ids: Vec<Ulid>,
    /// Derived from `service_ids` when absent.
    pub estimated_duration_min: Option<u32>,
}

/// Estimated wait in minutes for each queued entry, in position order.
///
/// `queued` holds the estimated durations of WAITING/NOTIFIED entries in
/// position order; `in_service` the remaining minutes of seated entries still
/// in service. Work ahead is shared across `walk_in_staff` (at least one).
/// When every walk-in staff member is busy, nobody starts before the first
/// of them frees up.
pub fn estimate_waits(queued: &[u32], in_service: &[u32], walk_in_staff: usize) -> Vec<u32> {
    let w = walk_in_staff.max(1) as u64;
    let busy_offset = if in_service.len() as u64 >= w {
        in_service.iter().copied().min().unwrap_or(0) as u64
    } else {
        0
    };
    let mut ahead: u64 = 0;
    queued
        .iter()
        .map(|&d| {
            let wait = ahead.div_ceil(w) + busy_offset;
            ahead += d as u64;
            u32::try_from(wait).unwrap_or(u32::MAX)
        })
        .collect()
}

impl Engine {
    pub async fn join_waitlist(&self, req: JoinRequest, now: Ms) -> Result<WaitlistView, EngineError> {
        let location = self.location(&req.location_id)?;
        if let Some(notes) = &req.notes
            && notes.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if let ClientRef::Contact { name, phone } = &req.client
            && name.as_deref().is_none_or(|n| n.trim().is_empty())
            && phone.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            return Err(EngineError::validation("walk-in needs a client, a name or a phone"));
        }
        let estimated = match (req.estimated_duration_min, req.service_ids.is_empty()) {
            (Some(d), _) => d,
            (None, false) => {
                let services = self.resolve_services(&req.service_ids)?;
                let total = ServicePlan::for_services(&services).total / MINUTE_MS;
                u32::try_from(total).unwrap_or(u32::MAX)
            }
            (None, true) => {
                return Err(EngineError::validation(
                    "estimated duration or services required",
                ));
            }
        };
        if estimated == 0 || estimated > MAX_SERVICE_MINUTES {
            return Err(EngineError::validation(format!(
                "estimated duration must be between 1 and {MAX_SERVICE_MINUTES} minutes"
            )));
        }
        if !req.service_ids.is_empty() {
            self.resolve_services(&req.service_ids)?;
        }

        let _gate = self.begin_write().await;
        let queue = self.store.waitlist(location.id);
        let mut guard = queue.write().await;
        if guard.entries.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if guard.order.len() >= MAX_WAITLIST_LEN {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }

        let entry = WaitlistEntry {
            id: req.id,
            location_id: location.id,
            client: req.client,
            notes: req.notes,
            service_ids: req.service_ids,
            estimated_duration_min: estimated,
            arrived_at: now,
            status: WaitlistStatus::Waiting,
            status_changed_at: now,
            appointment_id: None,
        };
        let event = Event::WaitlistJoined {
            entry: entry.clone(),
        };
        self.commit(&event, |s| s.apply_waitlist(&mut guard, &event))
            .await?;
        let view = self.view_of(&guard, entry.id, now);
        drop(guard);

        metrics::counter!(crate::observability::WAITLIST_MUTATIONS_TOTAL, "op" => "join")
            .increment(1);
        tracing::info!("waitlist {}: {} joined", location.id, entry.id);
        self.publish(Notification::WaitlistJoined { entry });
        view
    }

    /// Tell a queued client their turn is near. Re-notifying is allowed.
    pub async fn notify_waitlist(&self, id: Ulid, now: Ms) -> Result<WaitlistView, EngineError> {
        let view = self
            .set_waitlist_status(id, WaitlistStatus::Notified, "notify", now)
            .await?;
        self.publish(Notification::WaitlistNotified {
            entry: view.entry.clone(),
        });
        Ok(view)
    }

    /// Take an entry off the queue as LEFT or NO_SHOW.
    pub async fn remove_from_waitlist(
        &self,
        id: Ulid,
        status: WaitlistStatus,
        now: Ms,
    ) -> Result<WaitlistView, EngineError> {
        if !matches!(status, WaitlistStatus::Left | WaitlistStatus::NoShow) {
            return Err(EngineError::validation(format!(
                "cannot remove with status {}",
                status.as_str()
            )));
        }
        let view = self.set_waitlist_status(id, status, "remove", now).await?;
        self.publish(Notification::WaitlistRemoved {
            entry: view.entry.clone(),
        });
        Ok(view)
    }

    async fn set_waitlist_status(
        &self,
        id: Ulid,
        status: WaitlistStatus,
        action: &'static str,
        now: Ms,
    ) -> Result<WaitlistView, EngineError> {
        let location_id = self.waitlist_location(&id)?;
        let _gate = self.begin_write().await;
        let queue = self.store.waitlist(location_id);
        let mut guard = queue.write().await;
        queued_entry(&guard, id, action)?;

        let event = Event::WaitlistStatusChanged {
            id,
            location_id,
            status,
            at: now,
        };
        self.commit(&event, |s| s.apply_waitlist(&mut guard, &event))
            .await?;
        let view = self.view_of(&guard, id, now);
        drop(guard);

        metrics::counter!(crate::observability::WAITLIST_MUTATIONS_TOTAL, "op" => action)
            .increment(1);
        tracing::info!("waitlist {location_id}: {id} -> {}", status.as_str());
        view
    }

    /// Hand a queued entry to a staff member now: one atomic event creates the
    /// IN_SERVICE appointment and marks the entry SEATED.
    pub async fn seat(
        &self,
        id: Ulid,
        appointment_id: Ulid,
        staff_id: Ulid,
        service_ids: Option<Vec<Ulid>>,
        now: Ms,
    ) -> Result<(WaitlistView, Appointment), EngineError> {
        let location_id = self.waitlist_location(&id)?;
        let staff = self.staff_member(&staff_id)?;
        if staff.location_id != location_id {
            return Err(EngineError::validation(format!(
                "staff {staff_id} does not work at location {location_id}"
            )));
        }
        let location = self.location(&location_id)?;
        let tz = location.timezone;
        let date = local_date(&tz, now)
            .ok_or_else(|| EngineError::validation("now is not a valid instant"))?;
        let schedule = schedule_free_spans(&staff, &tz, date);

        let _gate = self.begin_write().await;
        let queue = self.store.waitlist(location_id);
        let mut q = queue.write().await;
        let entry = queued_entry(&q, id, "seat")?.clone();

        let service_ids = match service_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => entry.service_ids.clone(),
        };
        let services = self.resolve_services(&service_ids)?;
        if !staff.qualifies_for(&services) {
            return Err(EngineError::validation(format!(
                "staff {staff_id} is not qualified for the requested services"
            )));
        }
        let plan = ServicePlan::for_services(&services);
        let span = plan.service_span(now);

        let claim = self.store.claim_booking(appointment_id, None)?;
        let ledger = self.store.ledger(staff_id, date);
        let mut l = ledger.write().await;
        let placement = Placement {
            schedule: &schedule,
            day: day_bounds(&tz, date),
            service: span,
            buffered: plan.buffered_span(now),
            exclude: None,
        };
        if let Err(e) = check_placement(&l, &placement, now) {
            self.record_rejection("seat", &e);
            return Err(e);
        }

        let appointment = Appointment {
            id: appointment_id,
            location_id,
            staff_id,
            client: entry.client.clone(),
            service_ids,
            span,
            date,
            buffer_before: plan.buffer_before,
            buffer_after: plan.buffer_after,
            status: AppointmentStatus::InService,
            channel: Channel::WalkIn,
            external_ref: None,
            created_at: now,
            history: Vec::new(),
        };
        let event = Event::WaitlistSeated {
            id,
            location_id,
            appointment: appointment.clone(),
            at: now,
        };
        self.commit(&event, |s| {
            s.apply_seated(&mut q, &mut l, id, &appointment, now)
        })
        .await?;
        drop(l);
        drop(claim);
        let view = self.view_of(&q, id, now)?;
        drop(q);

        metrics::counter!(crate::observability::WAITLIST_MUTATIONS_TOTAL, "op" => "seat")
            .increment(1);
        tracing::info!(
            "waitlist {location_id}: {id} seated with {staff_id} as {}",
            appointment.id
        );
        self.publish(Notification::WaitlistSeated {
            entry: view.entry.clone(),
            appointment: appointment.clone(),
        });
        Ok((view, appointment))
    }

    /// Operator override: move a queued entry to a 1-based position. Positions
    /// past the end put the entry last.
    pub async fn reorder_waitlist(&self, id: Ulid, position: u32, now: Ms) -> Result<WaitlistView, EngineError> {
        if position == 0 {
            return Err(EngineError::validation("positions start at 1"));
        }
        let location_id = self.waitlist_location(&id)?;
        let _gate = self.begin_write().await;
        let queue = self.store.waitlist(location_id);
        let mut guard = queue.write().await;
        queued_entry(&guard, id, "reorder")?;
        let position = position.min(guard.order.len() as u32);

        let event = Event::WaitlistReordered {
            id,
            location_id,
            position,
            at: now,
        };
        self.commit(&event, |s| s.apply_waitlist(&mut guard, &event))
            .await?;
        let view = self.view_of(&guard, id, now);
        drop(guard);

        metrics::counter!(crate::observability::WAITLIST_MUTATIONS_TOTAL, "op" => "reorder")
            .increment(1);
        tracing::info!("waitlist {location_id}: {id} reordered to {position}");
        let view = view?;
        self.publish(Notification::WaitlistReordered {
            entry: view.entry.clone(),
        });
        Ok(view)
    }

    /// Fresh positions and waits for every queued entry. Pure read; safe to
    /// call any number of times.
    pub async fn recompute_waitlist(&self, location_id: &Ulid, now: Ms) -> Result<Vec<WaitlistView>, EngineError> {
        self.location(location_id)?;
        let queue = self.store.waitlist(*location_id);
        let guard = queue.read().await;
        Ok(self.views(&guard, now))
    }

    pub async fn waitlist_entry(&self, id: &Ulid, now: Ms) -> Result<WaitlistView, EngineError> {
        let location_id = self.waitlist_location(id)?;
        let queue = self.store.waitlist(location_id);
        let guard = queue.read().await;
        self.view_of(&guard, *id, now)
    }

    fn waitlist_location(&self, id: &Ulid) -> Result<Ulid, EngineError> {
        self.store
            .waitlist_location(id)
            .ok_or(EngineError::NotFound { kind: "waitlist entry", id: *id })
    }

    fn views(&self, queue: &WaitlistQueue, now: Ms) -> Vec<WaitlistView> {
        let durations: Vec<u32> = queue.queued().map(|e| e.estimated_duration_min).collect();
        let in_service: Vec<u32> = queue
            .seated()
            .filter_map(|e| e.appointment_id)
            .filter_map(|aid| self.store.appointment(&aid))
            .filter(|a| a.status == AppointmentStatus::InService && a.span.end > now)
            .map(|a| u32::try_from((a.span.end - now + MINUTE_MS - 1) / MINUTE_MS).unwrap_or(u32::MAX))
            .collect();
        let walk_in_staff = self
            .walk_in_staff_on_shift(&queue.location_id, now)
            .unwrap_or(0);
        let waits = estimate_waits(&durations, &in_service, walk_in_staff);

        queue
            .queued()
            .zip(waits)
            .enumerate()
            .map(|(i, (entry, wait))| WaitlistView {
                entry: entry.clone(),
                position: Some(i as u32 + 1),
                estimated_wait_min: Some(wait),
            })
            .collect()
    }

    fn view_of(&self, queue: &WaitlistQueue, id: Ulid, now: Ms) -> Result<WaitlistView, EngineError> {
        if let Some(view) = self.views(queue, now).into_iter().find(|v| v.entry.id == id) {
            return Ok(view);
        }
        let entry = queue
            .entries
            .get(&id)
            .ok_or(EngineError::NotFound { kind: "waitlist entry", id })?;
        Ok(WaitlistView {
            entry: entry.clone(),
            position: None,
            estimated_wait_min: None,
        })
    }
}

fn queued_entry<'a>(queue: &'a WaitlistQueue, id: Ulid, action: &str) -> Result<&'a WaitlistEntry, EngineError> {
    let entry = queue
        .entries
        .get(&id)
        .ok_or(EngineError::NotFound { kind: "waitlist entry", id })?;
    if !entry.status.is_queued() {
        return Err(EngineError::InvalidTransition {
            id,
            from: entry.status.as_str(),
            action: action.into(),
        });
    }
    Ok(entry)
}
