use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
/// Pending plus approved; terminal rows are history and do not count.
pub const MAX_ACTIVE_RESERVATIONS_PER_RESOURCE: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 2_048;
pub const MAX_IDENTITY_LEN: usize = 64;
pub const MAX_QUANTITY: u32 = 1_000_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Free-window queries are capped at two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;
