use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{ServicePlan, candidate_starts, day_bounds, local_date, merge_slots, schedule_free_spans};
use super::{Engine, EngineError};

/// Input to slot generation. `staff_id` narrows to one staff member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub location_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub date: NaiveDate,
    pub staff_id: Option<Ulid>,
    pub granularity_min: u32,
}

impl Engine {
    /// Bookable slots for a run of services on one local date. A read-only
    /// projection: ledgers are read-locked one at a time and never created.
    pub async fn get_slots(&self, query: &SlotQuery, now: Ms) -> Result<Vec<TimeSlot>, EngineError> {
        let start = std::time::Instant::now();
        let location = self.location(&query.location_id)?;
        let services = self.resolve_services(&query.service_ids)?;
        if !(MIN_GRANULARITY_MIN..=MAX_GRANULARITY_MIN).contains(&query.granularity_min) {
            return Err(EngineError::validation(format!(
                "granularity must be between {MIN_GRANULARITY_MIN} and {MAX_GRANULARITY_MIN} minutes"
            )));
        }
        let tz = location.timezone;
        if let Some(today) = local_date(&tz, now)
            && (query.date - today).num_days() > MAX_QUERY_HORIZON_DAYS
        {
            return Err(EngineError::LimitExceeded("date too far in the future"));
        }

        let candidates = match query.staff_id {
            Some(staff_id) => {
                let staff = self.staff_member(&staff_id)?;
                if staff.location_id != location.id {
                    return Err(EngineError::validation(format!(
                        "staff {staff_id} does not work at location {}",
                        location.id
                    )));
                }
                if !staff.qualifies_for(&services) {
                    return Err(EngineError::validation(format!(
                        "staff {staff_id} is not qualified for the requested services"
                    )));
                }
                vec![staff]
            }
            None => self
                .store
                .staff_at(&location.id)
                .into_iter()
                .filter(|s| s.qualifies_for(&services))
                .collect(),
        };

        let plan = ServicePlan::for_services(&services);
        let day = day_bounds(&tz, query.date);
        let granularity = minutes(query.granularity_min);
        let mut per_staff = Vec::with_capacity(candidates.len());
        if day.end > now {
            for staff in &candidates {
                let schedule = schedule_free_spans(staff, &tz, query.date);
                if schedule.is_empty() {
                    continue;
                }
                let starts = match self.store.existing_ledger(staff.id, query.date) {
                    Some(ledger) => {
                        let guard = ledger.read().await;
                        candidate_starts(&schedule, &day, &guard, &plan, granularity, now)
                    }
                    None => {
                        let empty = DayLedger::new(staff.id, query.date);
                        candidate_starts(&schedule, &day, &empty, &plan, granularity, now)
                    }
                };
                per_staff.push((staff.id, starts));
            }
        }

        let slots = merge_slots(per_staff, plan.total);
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        tracing::debug!(
            "get_slots {} on {}: {} slots over {} staff",
            location.id,
            query.date,
            slots.len(),
            candidates.len()
        );
        Ok(slots)
    }

    pub fn get_appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        self.store
            .appointment(id)
            .ok_or(EngineError::NotFound { kind: "appointment", id: *id })
    }

    /// A staff member's appointments on a local date, cancelled ones included.
    pub fn list_appointments(&self, staff_id: &Ulid, date: NaiveDate) -> Result<Vec<Appointment>, EngineError> {
        self.staff_member(staff_id)?;
        Ok(self.store.appointments_for(*staff_id, date))
    }

    /// Walk-in staff whose free schedule contains `now`.
    pub fn walk_in_staff_on_shift(&self, location_id: &Ulid, now: Ms) -> Result<usize, EngineError> {
        let location = self.location(location_id)?;
        let tz = location.timezone;
        let Some(today) = local_date(&tz, now) else {
            return Ok(0);
        };
        Ok(self
            .store
            .staff_at(location_id)
            .iter()
            .filter(|s| s.takes_walk_ins)
            .filter(|s| {
                schedule_free_spans(s, &tz, today)
                    .iter()
                    .any(|span| span.contains_instant(now))
            })
            .count())
    }
}
