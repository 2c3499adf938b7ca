use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unix milliseconds. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn minutes(n: u32) -> Ms {
    n as Ms * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The span widened by idle time on both sides.
    pub fn padded(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Schedules ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("interval {start}-{end} is empty or reversed")]
    EmptyInterval { start: NaiveTime, end: NaiveTime },
    #[error("{weekday}: break {start}-{end} lies outside working hours")]
    BreakOutsideHours {
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("{weekday}: breaks overlap at {at}")]
    BreaksOverlap { weekday: Weekday, at: NaiveTime },
    #[error("time off {0} is empty or reversed")]
    EmptyTimeOff(Ulid),
    #[error("time off {0} overlaps time off {1}")]
    TimeOffOverlap(Ulid, Ulid),
    #[error("service {0} must have a positive duration")]
    ZeroDuration(Ulid),
    #[error("{0} must not be empty")]
    Blank(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Break {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// One weekday of a staff member's working template, in location-local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub breaks: Vec<Break>,
}

impl DaySchedule {
    pub fn off() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            breaks: Vec::new(),
        }
    }

    pub fn working(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
            breaks: Vec::new(),
        }
    }

    pub fn with_break(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.breaks.push(Break { start, end });
        self.breaks.sort_by_key(|b| b.start);
        self
    }

    fn validate(&self, weekday: Weekday) -> Result<(), ModelError> {
        if !self.enabled {
            return Ok(());
        }
        if self.start >= self.end {
            return Err(ModelError::EmptyInterval {
                start: self.start,
                end: self.end,
            });
        }
        let mut sorted = self.breaks.clone();
        sorted.sort_by_key(|b| b.start);
        let mut prev_end: Option<NaiveTime> = None;
        for b in &sorted {
            if b.start >= b.end {
                return Err(ModelError::EmptyInterval {
                    start: b.start,
                    end: b.end,
                });
            }
            if b.start < self.start || b.end > self.end {
                return Err(ModelError::BreakOutsideHours {
                    weekday,
                    start: b.start,
                    end: b.end,
                });
            }
            if let Some(pe) = prev_end
                && b.start < pe
            {
                return Err(ModelError::BreaksOverlap {
                    weekday,
                    at: b.start,
                });
            }
            prev_end = Some(b.end);
        }
        Ok(())
    }
}

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Seven immutable day templates, Monday first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekSchedule {
    pub days: [DaySchedule; 7],
}

impl WeekSchedule {
    pub fn closed() -> Self {
        Self {
            days: std::array::from_fn(|_| DaySchedule::off()),
        }
    }

    /// Same template on every listed weekday; the rest are off.
    pub fn uniform(weekdays: &[Weekday], day: DaySchedule) -> Self {
        let mut week = Self::closed();
        for wd in weekdays {
            week.days[wd.num_days_from_monday() as usize] = day.clone();
        }
        week
    }

    pub fn for_weekday(&self, weekday: Weekday) -> &DaySchedule {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (day, weekday) in self.days.iter().zip(WEEKDAYS) {
            day.validate(weekday)?;
        }
        Ok(())
    }
}

/// A local-time range during which the staff member is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOff {
    pub id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub reason: Option<String>,
}

impl TimeOff {
    /// Whole days, `first..=last`.
    pub fn days(id: Ulid, first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            id,
            start: first.and_time(NaiveTime::MIN),
            end: last
                .succ_opt()
                .unwrap_or(last)
                .and_time(NaiveTime::MIN),
            reason: None,
        }
    }
}

// ── Directory entities ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    pub timezone: chrono_tz::Tz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub category: String,
    pub duration_min: u32,
    pub buffer_before_min: u32,
    pub buffer_after_min: u32,
}

impl Service {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.duration_min == 0 {
            return Err(ModelError::ZeroDuration(self.id));
        }
        if self.category.trim().is_empty() {
            return Err(ModelError::Blank("service category"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub categories: BTreeSet<String>,
    pub week: WeekSchedule,
    pub time_off: Vec<TimeOff>,
    pub takes_walk_ins: bool,
}

impl StaffMember {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.categories.iter().any(|c| c.trim().is_empty()) {
            return Err(ModelError::Blank("staff category"));
        }
        self.week.validate()?;
        let mut sorted: Vec<&TimeOff> = self.time_off.iter().collect();
        sorted.sort_by_key(|t| t.start);
        for (i, t) in sorted.iter().enumerate() {
            if t.start >= t.end {
                return Err(ModelError::EmptyTimeOff(t.id));
            }
            if i > 0 && sorted[i - 1].end > t.start {
                return Err(ModelError::TimeOffOverlap(sorted[i - 1].id, t.id));
            }
        }
        Ok(())
    }

    /// Qualified when every requested service's category is one of ours.
    pub fn qualifies_for(&self, services: &[Service]) -> bool {
        services.iter().all(|s| self.categories.contains(&s.category))
    }
}

// ── Appointments ─────────────────────────────────────────────────

/// Intake channel a request arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Web,
    Voice,
    Kiosk,
    WalkIn,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Voice => "voice",
            Channel::Kiosk => "kiosk",
            Channel::WalkIn => "walk_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Some(Channel::Web),
            "voice" | "phone" => Some(Channel::Voice),
            "kiosk" => Some(Channel::Kiosk),
            "walk_in" | "walkin" => Some(Channel::WalkIn),
            _ => None,
        }
    }
}

/// Who the appointment is for: a known client or a bare contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRef {
    Known(Ulid),
    Contact {
        name: Option<String>,
        phone: Option<String>,
    },
}

impl ClientRef {
    /// A ULID string is a client id; anything else is a contact name.
    pub fn parse(s: &str) -> Self {
        match Ulid::from_string(s.trim()) {
            Ok(id) => ClientRef::Known(id),
            Err(_) => ClientRef::Contact {
                name: Some(s.trim().to_string()),
                phone: None,
            },
        }
    }
}

impl std::fmt::Display for ClientRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRef::Known(id) => write!(f, "{id}"),
            ClientRef::Contact { name, phone } => {
                let name = name.as_deref().unwrap_or("");
                match phone {
                    Some(p) => write!(f, "{name} <{p}>"),
                    None => write!(f, "{name}"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Confirmed,
    CheckedIn,
    InService,
    Completed,
    Cancelled,
    NoShow,
}

/// Operator or client action driving the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    Confirm,
    CheckIn,
    Start,
    Complete,
    Cancel,
    MarkNoShow,
}

impl AppointmentStatus {
    /// Occupies staff-time for conflict purposes.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    pub fn is_movable(&self) -> bool {
        matches!(self, AppointmentStatus::Booked | AppointmentStatus::Confirmed)
    }

    /// Next status, or `None` when the event is not allowed from here.
    pub fn next(self, event: StatusEvent) -> Option<AppointmentStatus> {
        use AppointmentStatus::*;
        match (self, event) {
            (Booked, StatusEvent::Confirm) => Some(Confirmed),
            (Confirmed, StatusEvent::CheckIn) => Some(CheckedIn),
            (CheckedIn, StatusEvent::Start) => Some(InService),
            (InService, StatusEvent::Complete) => Some(Completed),
            (Booked | Confirmed | CheckedIn, StatusEvent::Cancel) => Some(Cancelled),
            (Booked | Confirmed, StatusEvent::MarkNoShow) => Some(NoShow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::CheckedIn => "checked_in",
            AppointmentStatus::InService => "in_service",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEvent::Confirm => "confirm",
            StatusEvent::CheckIn => "check_in",
            StatusEvent::Start => "start",
            StatusEvent::Complete => "complete",
            StatusEvent::Cancel => "cancel",
            StatusEvent::MarkNoShow => "no_show",
        }
    }

    /// Accepts either the event name or the status it leads to.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "confirm" | "confirmed" => Some(StatusEvent::Confirm),
            "check_in" | "checked_in" => Some(StatusEvent::CheckIn),
            "start" | "in_service" => Some(StatusEvent::Start),
            "complete" | "completed" => Some(StatusEvent::Complete),
            "cancel" | "cancelled" => Some(StatusEvent::Cancel),
            "no_show" => Some(StatusEvent::MarkNoShow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditChange {
    Status {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Moved {
        from_staff: Ulid,
        to_staff: Ulid,
        from: Span,
        to: Span,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: Ms,
    pub change: AuditChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub location_id: Ulid,
    pub staff_id: Ulid,
    pub client: ClientRef,
    pub service_ids: Vec<Ulid>,
    /// Service time, excluding buffers.
    pub span: Span,
    /// Location-local date of `span.start`; keys the day ledger.
    pub date: NaiveDate,
    pub buffer_before: Ms,
    pub buffer_after: Ms,
    pub status: AppointmentStatus,
    pub channel: Channel,
    pub external_ref: Option<String>,
    pub created_at: Ms,
    pub history: Vec<AuditEntry>,
}

impl Appointment {
    pub fn buffered_span(&self) -> Span {
        self.span.padded(self.buffer_before, self.buffer_after)
    }
}

// ── Day ledger ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub appointment_id: Ulid,
    pub buffered: Span,
}

/// Active appointments of one staff member on one local date.
/// This is the unit of write serialization.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub staff_id: Ulid,
    pub date: NaiveDate,
    /// Sorted by `buffered.start`; never overlapping.
    pub entries: Vec<LedgerEntry>,
}

impl DayLedger {
    pub fn new(staff_id: Ulid, date: NaiveDate) -> Self {
        Self {
            staff_id,
            date,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: LedgerEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.buffered.start, |e| e.buffered.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<LedgerEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.appointment_id == appointment_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose buffered span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &LedgerEntry> {
        let right_bound = self
            .entries
            .partition_point(|e| e.buffered.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.buffered.end > query.start)
    }

    pub fn busy(&self) -> Vec<Span> {
        self.entries.iter().map(|e| e.buffered).collect()
    }
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
    Notified,
    Seated,
    Left,
    NoShow,
}

impl WaitlistStatus {
    /// Counted for position and wait.
    pub fn is_queued(&self) -> bool {
        matches!(self, WaitlistStatus::Waiting | WaitlistStatus::Notified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Notified => "notified",
            WaitlistStatus::Seated => "seated",
            WaitlistStatus::Left => "left",
            WaitlistStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub location_id: Ulid,
    pub client: ClientRef,
    pub notes: Option<String>,
    pub service_ids: Vec<Ulid>,
    pub estimated_duration_min: u32,
    pub arrived_at: Ms,
    pub status: WaitlistStatus,
    pub status_changed_at: Ms,
    pub appointment_id: Option<Ulid>,
}

/// One location's walk-in queue. The unit of waitlist write serialization.
#[derive(Debug, Clone)]
pub struct WaitlistQueue {
    pub location_id: Ulid,
    /// WAITING/NOTIFIED entry ids in position order.
    pub order: Vec<Ulid>,
    /// Every entry ever joined, terminal ones included.
    pub entries: HashMap<Ulid, WaitlistEntry>,
}

impl WaitlistQueue {
    pub fn new(location_id: Ulid) -> Self {
        Self {
            location_id,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn queued(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn seated(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.entries
            .values()
            .filter(|e| e.status == WaitlistStatus::Seated)
    }
}

/// A waitlist entry with its derived queue fields. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistView {
    pub entry: WaitlistEntry,
    pub position: Option<u32>,
    pub estimated_wait_min: Option<u32>,
}

// ── Slots ────────────────────────────────────────────────────────

/// A bookable start time and the staff free for the whole duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: Ms,
    pub duration_ms: Ms,
    /// Sorted by id.
    pub available_staff: Vec<Ulid>,
}

impl TimeSlot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + self.duration_ms)
    }
}

/// WAL record format, one variant per committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationUpserted {
        id: Ulid,
        name: String,
        timezone: String,
    },
    ServiceUpserted {
        service: Service,
    },
    StaffUpserted {
        staff: StaffMember,
    },
    TimeOffAdded {
        staff_id: Ulid,
        time_off: TimeOff,
    },
    TimeOffRemoved {
        staff_id: Ulid,
        id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentMoved {
        id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        span: Span,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistStatusChanged {
        id: Ulid,
        location_id: Ulid,
        status: WaitlistStatus,
        at: Ms,
    },
    WaitlistSeated {
        id: Ulid,
        location_id: Ulid,
        appointment: Appointment,
        at: Ms,
    },
    WaitlistReordered {
        id: Ulid,
        location_id: Ulid,
        position: u32,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert_eq!(s.padded(10, 20), Span::new(90, 220));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(Span::new(0, 400).contains_span(&a));
        assert!(!a.contains_span(&b));
    }

    #[test]
    fn day_schedule_rejects_break_outside_hours() {
        let day = DaySchedule::working(t(9, 0), t(17, 0)).with_break(t(8, 0), t(9, 30));
        let week = WeekSchedule::uniform(&[Weekday::Tue], day);
        assert!(matches!(
            week.validate(),
            Err(ModelError::BreakOutsideHours { weekday: Weekday::Tue, .. })
        ));
    }

    #[test]
    fn day_schedule_rejects_overlapping_breaks() {
        let day = DaySchedule::working(t(9, 0), t(17, 0))
            .with_break(t(12, 0), t(13, 0))
            .with_break(t(12, 30), t(14, 0));
        let week = WeekSchedule::uniform(&[Weekday::Mon], day);
        assert!(matches!(week.validate(), Err(ModelError::BreaksOverlap { .. })));
    }

    #[test]
    fn disabled_day_is_always_valid() {
        let mut day = DaySchedule::off();
        day.breaks.push(Break { start: t(5, 0), end: t(4, 0) });
        assert!(WeekSchedule::uniform(&[Weekday::Sun], day).validate().is_ok());
    }

    #[test]
    fn time_off_overlap_rejected() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let staff = StaffMember {
            id: Ulid::new(),
            location_id: Ulid::new(),
            name: "A".into(),
            categories: BTreeSet::from(["hair".to_string()]),
            week: WeekSchedule::closed(),
            time_off: vec![
                TimeOff::days(Ulid::new(), d, d.succ_opt().unwrap()),
                TimeOff::days(Ulid::new(), d.succ_opt().unwrap(), d.succ_opt().unwrap()),
            ],
            takes_walk_ins: false,
        };
        assert!(matches!(staff.validate(), Err(ModelError::TimeOffOverlap(..))));
    }

    #[test]
    fn status_machine_happy_path() {
        use AppointmentStatus::*;
        let mut s = Booked;
        for ev in [
            StatusEvent::Confirm,
            StatusEvent::CheckIn,
            StatusEvent::Start,
            StatusEvent::Complete,
        ] {
            s = s.next(ev).unwrap();
        }
        assert_eq!(s, Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn status_machine_terminal_states_reject_everything() {
        use AppointmentStatus::*;
        let events = [
            StatusEvent::Confirm,
            StatusEvent::CheckIn,
            StatusEvent::Start,
            StatusEvent::Complete,
            StatusEvent::Cancel,
            StatusEvent::MarkNoShow,
        ];
        for terminal in [Completed, Cancelled, NoShow] {
            for ev in events {
                assert_eq!(terminal.next(ev), None, "{terminal:?} + {ev:?}");
            }
        }
        // No-show is not reachable once checked in.
        assert_eq!(CheckedIn.next(StatusEvent::MarkNoShow), None);
        assert_eq!(CheckedIn.next(StatusEvent::Cancel), Some(Cancelled));
        assert_eq!(InService.next(StatusEvent::Cancel), None);
    }

    #[test]
    fn ledger_keeps_order_and_finds_overlaps() {
        let mut ledger = DayLedger::new(Ulid::new(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        ledger.insert(LedgerEntry { appointment_id: ids[0], buffered: Span::new(300, 400) });
        ledger.insert(LedgerEntry { appointment_id: ids[1], buffered: Span::new(100, 200) });
        ledger.insert(LedgerEntry { appointment_id: ids[2], buffered: Span::new(500, 600) });
        assert_eq!(ledger.entries[0].appointment_id, ids[1]);

        let hits: Vec<_> = ledger.overlapping(&Span::new(150, 310)).collect();
        assert_eq!(hits.len(), 2);

        // Adjacent is not overlapping.
        assert_eq!(ledger.overlapping(&Span::new(400, 500)).count(), 0);

        assert!(ledger.remove(ids[0]).is_some());
        assert!(ledger.remove(ids[0]).is_none());
        assert_eq!(ledger.busy(), vec![Span::new(100, 200), Span::new(500, 600)]);
    }

    #[test]
    fn client_ref_parse() {
        let id = Ulid::new();
        assert_eq!(ClientRef::parse(&id.to_string()), ClientRef::Known(id));
        assert!(matches!(ClientRef::parse("Dana"), ClientRef::Contact { .. }));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let day = DaySchedule::working(t(9, 0), t(17, 0)).with_break(t(12, 0), t(13, 0));
        let event = Event::StaffUpserted {
            staff: StaffMember {
                id: Ulid::new(),
                location_id: Ulid::new(),
                name: "Test".into(),
                categories: BTreeSet::from(["hair".to_string()]),
                week: WeekSchedule::uniform(&[Weekday::Mon], day),
                time_off: vec![],
                takes_walk_ins: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
