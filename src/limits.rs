use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;
pub const MAX_EXTERNAL_REF_LEN: usize = 128;
pub const MAX_CATEGORIES_PER_STAFF: usize = 64;
pub const MAX_TIME_OFF_PER_STAFF: usize = 1024;
pub const MAX_SERVICES_PER_REQUEST: usize = 8;
pub const MAX_STAFF_PER_LOCATION: usize = 512;
pub const MAX_WAITLIST_LEN: usize = 500;
pub const MAX_APPOINTMENTS_PER_DAY: usize = 256;

pub const MIN_GRANULARITY_MIN: u32 = 5;
pub const MAX_GRANULARITY_MIN: u32 = 240;
pub const DEFAULT_GRANULARITY_MIN: u32 = 15;

/// Slot queries further out than this are rejected.
pub const MAX_QUERY_HORIZON_DAYS: i64 = 366;

/// Longest single service or walk-in estimate (12h).
pub const MAX_SERVICE_MINUTES: u32 = 720;

/// 2000-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
