use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Voluntary leaves close at 20:00 the day before the session date.
/// Session dates are stored as the midnight of the session day, so the
/// cutoff sits 4 hours before that midnight.
pub const LOCK_LEAD_MS: Ms = 4 * HOUR_MS;

/// Which of a session's two lists a user occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seat {
    Confirmed,
    Waitlisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    /// Unique per tenant when present. Stub users created through the
    /// admin path carry none.
    pub email: Option<String>,
    /// Opaque to the engine; stored and returned, never interpreted.
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: Ulid,
    /// Midnight of the session day.
    pub date: Ms,
    pub slots: u32,
    /// Bookkeeping only, no roster logic reads it.
    pub shuttles_used: u32,
    /// Confirmed attendees, insertion-ordered, never longer than `slots`.
    pub participants: Vec<Ulid>,
    /// Overflow queue, insertion-ordered, unbounded.
    pub waitlist: Vec<Ulid>,
}

impl SessionState {
    pub fn new(id: Ulid, date: Ms, slots: u32) -> Self {
        Self {
            id,
            date,
            slots,
            shuttles_used: 0,
            participants: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.slots.saturating_sub(self.participants.len() as u32)
    }

    pub fn lock_at(&self) -> Ms {
        self.date - LOCK_LEAD_MS
    }

    pub fn is_locked(&self, now: Ms) -> bool {
        now >= self.lock_at()
    }

    /// Which list holds `user`, if any.
    pub fn seat_of(&self, user: Ulid) -> Option<Seat> {
        if self.participants.contains(&user) {
            Some(Seat::Confirmed)
        } else if self.waitlist.contains(&user) {
            Some(Seat::Waitlisted)
        } else {
            None
        }
    }

    /// Remove `user` from the named list, preserving order of the rest.
    pub fn remove_seat(&mut self, user: Ulid, seat: Seat) -> bool {
        let list = match seat {
            Seat::Confirmed => &mut self.participants,
            Seat::Waitlisted => &mut self.waitlist,
        };
        if let Some(pos) = list.iter().position(|&u| u == user) {
            list.remove(pos);
            true
        } else {
            false
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
/// Events record outcomes: a resize carries the exact ids it moved, so
/// replay applies each operation as one unit without re-running the
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: Option<String>,
        credential: Option<String>,
    },
    SessionCreated {
        id: Ulid,
        date: Ms,
        slots: u32,
    },
    SessionRescheduled {
        id: Ulid,
        date: Ms,
    },
    SessionResized {
        id: Ulid,
        slots: u32,
        /// Moved waitlist head to participants tail, in order.
        promoted: Vec<Ulid>,
        /// Moved participants tail to waitlist tail, in order.
        demoted: Vec<Ulid>,
    },
    SessionDeleted {
        id: Ulid,
    },
    MemberJoined {
        session_id: Ulid,
        user_id: Ulid,
        seat: Seat,
        /// Set when the admin path created a stub user as part of the
        /// same operation; replay registers the stub before seating it.
        stub_name: Option<String>,
    },
    MemberLeft {
        session_id: Ulid,
        user_id: Ulid,
        seat: Seat,
        /// Waitlist head promoted into the freed slot, if any.
        promoted: Option<Ulid>,
    },
    RosterReordered {
        session_id: Ulid,
        participants: Option<Vec<Ulid>>,
        waitlist: Option<Vec<Ulid>>,
    },
    ShuttlesRecorded {
        session_id: Ulid,
        count: u32,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Ulid,
    pub date: Ms,
    pub slots: u32,
    pub remaining: u32,
    pub waitlist_count: u32,
    pub shuttles_used: u32,
    pub locked: bool,
}

/// One roster row: a user resolved to its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterInfo {
    pub participants: Vec<MemberInfo>,
    pub waitlist: Vec<MemberInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

// ── Mutation result types ────────────────────────────────────────

/// Outcome of `join` / `admin_add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignupReceipt {
    pub user_id: Ulid,
    pub seat: Seat,
    pub remaining: u32,
    pub waitlist_count: u32,
}

/// Outcome of `leave` / `admin_remove`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveReceipt {
    pub promoted: Option<Ulid>,
    pub remaining: u32,
    pub waitlist_count: u32,
}

/// Outcome of `resize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeReport {
    pub promoted: u32,
    pub demoted: u32,
    pub remaining: u32,
    pub waitlist_count: u32,
}
