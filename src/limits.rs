use crate::model::Ms;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// One appointment may not exceed a full day.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;
pub const MAX_GRANULARITY_MINUTES: i64 = 24 * 60;

/// Widest window accepted by ledger listings (~1 year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_CLINICS: usize = 10_000;
pub const MAX_PROFESSIONALS: usize = 100_000;
pub const MAX_HOURS_PER_CLINIC: usize = 7 * 24;
pub const MAX_CLOSURES_PER_CLINIC: usize = 3_650;
pub const MAX_APPOINTMENTS_PER_PROFESSIONAL: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_COLOR_LEN: usize = 32;
pub const MAX_BATCH_SIZE: usize = 1_000;
