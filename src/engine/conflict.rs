use ulid::Ulid;

use crate::model::*;

use super::availability::{Fit, fit};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Everything a commit needs to judge one placement on a locked ledger.
pub(crate) struct Placement<'a> {
    pub schedule: &'a [Span],
    pub day: Span,
    pub service: Span,
    pub buffered: Span,
    pub exclude: Option<Ulid>,
}

/// Write-path twin of slot generation: same predicate, typed errors.
pub(crate) fn check_placement(
    ledger: &DayLedger,
    placement: &Placement<'_>,
    now: Ms,
) -> Result<(), EngineError> {
    match fit(
        placement.schedule,
        &placement.day,
        ledger,
        placement.exclude,
        placement.service,
        placement.buffered,
        now,
    ) {
        Fit::Free => Ok(()),
        Fit::Past => Err(EngineError::validation(format!(
            "start {} is in the past",
            placement.service.start
        ))),
        Fit::OutsideSchedule => Err(EngineError::validation(format!(
            "{} is outside the staff member's working hours",
            placement.service
        ))),
        Fit::Busy(entry) => Err(EngineError::Conflict {
            appointment_id: entry.appointment_id,
            interval: entry.buffered,
        }),
    }
}
