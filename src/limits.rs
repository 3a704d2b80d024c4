// Hard caps on tenant state. Every limit is checked before any
// mutation, so hitting one never leaves partial state behind.

use crate::model::Ms;

pub const MAX_SESSIONS_PER_TENANT: usize = 4_096;
pub const MAX_USERS_PER_TENANT: usize = 65_536;

/// Display names and admin-supplied stub names.
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_CREDENTIAL_LEN: usize = 256;

/// Seats per session. The waitlist has no capacity semantics, but both
/// lists together still respect MAX_ROSTER_LEN.
pub const MAX_SLOTS: u32 = 10_000;

/// participants + waitlist per session.
pub const MAX_ROSTER_LEN: usize = 10_000;

/// Ids accepted in one reorder statement per list.
pub const MAX_REORDER_IDS: usize = 1_024;

/// Accepted session dates: 2000-01-01 through 2100-01-01.
pub const MIN_VALID_DATE_MS: Ms = 946_684_800_000;
pub const MAX_VALID_DATE_MS: Ms = 4_102_444_800_000;

pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_TENANTS: usize = 64;
