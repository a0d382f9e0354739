use crate::model::Ms;

// ── Tenants ──────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Events ───────────────────────────────────────────────────

pub const MAX_EVENTS_PER_SUBJECT: usize = 50_000;
pub const MAX_SUBJECT_KEY_LEN: usize = 320;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 8 * 1024;
pub const MAX_REQUEST_TOKEN_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// An interview never runs longer than a day.
pub const MAX_EVENT_DURATION_MS: Ms = 24 * 3_600_000;

// ── Queries ──────────────────────────────────────────────────

pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
pub const MAX_AUDIT_ROWS: usize = 10_000;

/// Attempts at resolving an event's subject before giving up, when a
/// concurrent update keeps moving it between interviewers.
pub const MAX_RESOLVE_ATTEMPTS: usize = 4;
