use ulid::Ulid;

use crate::model::SessionState;

// ── Roster reconciliation ─────────────────────────────────────────
//
// Pure planning functions. The engine computes a plan under the session
// lock, records it in the operation's event, then applies it with the
// mechanical movers below. Replay applies recorded plans only, so live
// and replayed state cannot diverge.

/// Ids to move from the waitlist head into free seats, earliest
/// waitlisted first. Empty when there is no fillable gap.
pub fn promotion_plan(slots: u32, confirmed: usize, waitlist: &[Ulid]) -> Vec<Ulid> {
    let free = (slots as usize).saturating_sub(confirmed);
    waitlist.iter().take(free).copied().collect()
}

/// Ids to demote when capacity shrinks: the last `excess` participants,
/// in their original relative order. Most-recently-joined lose their
/// seats first, the opposite tie-break from promotion.
pub fn demotion_plan(new_slots: u32, participants: &[Ulid]) -> Vec<Ulid> {
    let excess = participants.len().saturating_sub(new_slots as usize);
    participants[participants.len() - excess..].to_vec()
}

/// Move planned ids from the waitlist to the participants tail.
pub fn promote(state: &mut SessionState, ids: &[Ulid]) {
    for id in ids {
        if let Some(pos) = state.waitlist.iter().position(|u| u == id) {
            state.waitlist.remove(pos);
            state.participants.push(*id);
        }
    }
}

/// Move planned ids from the participants to the waitlist tail.
pub fn demote(state: &mut SessionState, ids: &[Ulid]) {
    for id in ids {
        if let Some(pos) = state.participants.iter().position(|u| u == id) {
            state.participants.remove(pos);
            state.waitlist.push(*id);
        }
    }
}

/// Rebuild one list from a submitted ordering. Submitted ids that are
/// not current members are dropped silently; current members missing
/// from the submission keep their relative order at the tail. The
/// result is always a permutation of `current`.
pub fn reorder_list(current: &[Ulid], submitted: &[Ulid]) -> Vec<Ulid> {
    let mut result: Vec<Ulid> = Vec::with_capacity(current.len());
    for id in submitted {
        if current.contains(id) && !result.contains(id) {
            result.push(*id);
        }
    }
    for id in current {
        if !result.contains(id) {
            result.push(*id);
        }
    }
    result
}

/// All four roster invariants at once: participants bounded by slots,
/// lists disjoint, no duplicates within a list, no fillable gap.
pub fn roster_consistent(state: &SessionState) -> bool {
    if state.participants.len() > state.slots as usize {
        return false;
    }
    for (i, u) in state.participants.iter().enumerate() {
        if state.participants[..i].contains(u) || state.waitlist.contains(u) {
            return false;
        }
    }
    for (i, u) in state.waitlist.iter().enumerate() {
        if state.waitlist[..i].contains(u) {
            return false;
        }
    }
    let gap = (state.slots as usize) > state.participants.len() && !state.waitlist.is_empty();
    !gap
}
