use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

// ── Local time ────────────────────────────────────────────────────

/// Map a location-local wall-clock time to Unix ms. A time inside a DST gap
/// resolves to the first valid instant after it.
pub fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Ms {
    let mut local = naive;
    for _ in 0..8 {
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return dt.timestamp_millis();
        }
        local += TimeDelta::minutes(15);
    }
    naive.and_utc().timestamp_millis()
}

pub fn local_ms(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    resolve_local(tz, date.and_time(time))
}

/// `[local midnight, next local midnight)` for `date`.
pub fn day_bounds(tz: &Tz, date: NaiveDate) -> Span {
    let start = local_ms(tz, date, NaiveTime::MIN);
    let next = date.succ_opt().unwrap_or(date);
    let end = local_ms(tz, next, NaiveTime::MIN).max(start + 1);
    Span::new(start, end)
}

pub fn local_date(tz: &Tz, t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(tz).date_naive())
}

// ── Interval algebra ─────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Schedules ────────────────────────────────────────────────────

/// Working interval minus breaks minus time-off for one staff member on one
/// local date. Appointments are not subtracted here.
pub fn schedule_free_spans(staff: &StaffMember, tz: &Tz, date: NaiveDate) -> Vec<Span> {
    let day = staff.week.for_weekday(date.weekday());
    if !day.enabled {
        return Vec::new();
    }
    let open = local_ms(tz, date, day.start);
    let close = local_ms(tz, date, day.end);
    if open >= close {
        return Vec::new();
    }
    let base = [Span::new(open, close)];

    let mut blocked: Vec<Span> = Vec::new();
    for b in &day.breaks {
        let (s, e) = (local_ms(tz, date, b.start), local_ms(tz, date, b.end));
        if s < e {
            blocked.push(Span::new(s, e));
        }
    }
    let bounds = day_bounds(tz, date);
    for off in &staff.time_off {
        let (s, e) = (resolve_local(tz, off.start), resolve_local(tz, off.end));
        if s < e && Span::new(s, e).overlaps(&bounds) {
            blocked.push(Span::new(s, e));
        }
    }
    if blocked.is_empty() {
        return base.to_vec();
    }
    blocked.sort_by_key(|s| s.start);
    subtract_intervals(&base, &merge_overlapping(&blocked))
}

/// Duration and outer buffers of a run of services performed back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePlan {
    pub total: Ms,
    pub buffer_before: Ms,
    pub buffer_after: Ms,
}

impl ServicePlan {
    /// Inter-service gap is the larger of the adjoining buffers.
    pub fn for_services(services: &[Service]) -> Self {
        let mut total = 0;
        for (i, s) in services.iter().enumerate() {
            total += minutes(s.duration_min);
            if let Some(next) = services.get(i + 1) {
                total += minutes(s.buffer_after_min.max(next.buffer_before_min));
            }
        }
        Self {
            total,
            buffer_before: services.first().map_or(0, |s| minutes(s.buffer_before_min)),
            buffer_after: services.last().map_or(0, |s| minutes(s.buffer_after_min)),
        }
    }

    pub fn plain(total: Ms) -> Self {
        Self {
            total,
            buffer_before: 0,
            buffer_after: 0,
        }
    }

    pub fn service_span(&self, start: Ms) -> Span {
        Span::new(start, start + self.total)
    }

    pub fn buffered_span(&self, start: Ms) -> Span {
        self.service_span(start)
            .padded(self.buffer_before, self.buffer_after)
    }
}

/// Outcome of testing one placement against a staff member's day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Free,
    Past,
    OutsideSchedule,
    Busy(LedgerEntry),
}

/// The one overlap predicate shared by slot generation and commits.
///
/// The service span must sit inside a single schedule-free interval; the
/// buffered span must stay inside the local day and clear every other active
/// appointment's buffered span.
pub fn fit(
    schedule: &[Span],
    day: &Span,
    ledger: &DayLedger,
    exclude: Option<Ulid>,
    service: Span,
    buffered: Span,
    now: Ms,
) -> Fit {
    if service.start < now {
        return Fit::Past;
    }
    if !day.contains_span(&buffered) || !schedule.iter().any(|s| s.contains_span(&service)) {
        return Fit::OutsideSchedule;
    }
    match ledger
        .overlapping(&buffered)
        .find(|e| Some(e.appointment_id) != exclude)
    {
        Some(e) => Fit::Busy(*e),
        None => Fit::Free,
    }
}

/// Start times on `granularity` boundaries (counted from local midnight) at
/// which the plan fits for this staff member.
pub fn candidate_starts(
    schedule: &[Span],
    day: &Span,
    ledger: &DayLedger,
    plan: &ServicePlan,
    granularity: Ms,
    now: Ms,
) -> Vec<Ms> {
    let mut out = Vec::new();
    if granularity <= 0 || plan.total <= 0 {
        return out;
    }
    let anchor = day.start;
    for free in schedule {
        let earliest = free.start.max(now);
        let mut t = anchor + (earliest - anchor + granularity - 1).div_euclid(granularity) * granularity;
        while t + plan.total <= free.end {
            let f = fit(
                schedule,
                day,
                ledger,
                None,
                plan.service_span(t),
                plan.buffered_span(t),
                now,
            );
            if f == Fit::Free {
                out.push(t);
            }
            t += granularity;
        }
    }
    out
}

/// Merge per-staff start sets into ascending slots with staff sorted by id.
pub fn merge_slots(per_staff: Vec<(Ulid, Vec<Ms>)>, duration: Ms) -> Vec<TimeSlot> {
    let mut by_start: BTreeMap<Ms, Vec<Ulid>> = BTreeMap::new();
    for (staff_id, starts) in per_staff {
        for s in starts {
            by_start.entry(s).or_default().push(staff_id);
        }
    }
    by_start
        .into_iter()
        .map(|(start, mut staff)| {
            staff.sort();
            staff.dedup();
            TimeSlot {
                start,
                duration_ms: duration,
                available_staff: staff,
            }
        })
        .collect()
}
