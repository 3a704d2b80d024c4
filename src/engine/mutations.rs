use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::roster::{demotion_plan, promotion_plan, reorder_list};
use super::{now_ms, Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: Option<String>,
        credential: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        if self.registry.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        validate_name(&name)?;
        if let Some(ref e) = email
            && e.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("email too long"));
            }
        if let Some(ref c) = credential
            && c.len() > MAX_CREDENTIAL_LEN {
                return Err(EngineError::LimitExceeded("credential too long"));
            }

        // Claim the email up front; two racing registrations of the same
        // address must not both reach the WAL.
        if let Some(ref e) = email
            && !self.registry.reserve_email(e, id) {
                return Err(EngineError::EmailTaken(e.clone()));
            }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
            credential: credential.clone(),
        };
        if let Err(err) = self.wal_append(&event).await {
            if let Some(ref e) = email {
                self.registry.release_email(e);
            }
            return Err(err);
        }
        self.registry.insert(User {
            id,
            name,
            email,
            credential,
        });
        Ok(())
    }

    pub async fn create_session(&self, id: Ulid, date: Ms, slots: u32) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        if self.sessions.len() >= MAX_SESSIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        validate_date(date)?;
        if slots > MAX_SLOTS {
            return Err(EngineError::LimitExceeded("slot count too large"));
        }

        let event = Event::SessionCreated { id, date, slots };
        self.wal_append(&event).await?;
        let s = SessionState::new(id, date, slots);
        self.sessions.insert(id, Arc::new(RwLock::new(s)));
        self.notify.send(id, &Notice::Change(event));
        Ok(())
    }

    pub async fn reschedule(&self, id: Ulid, date: Ms) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        validate_date(date)?;
        let mut guard = self.session_write(id).await?;
        let event = Event::SessionRescheduled { id, date };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Delete a session and its membership records. The write lock is
    /// held across the commit so no in-flight roster change can land
    /// after the deletion record.
    pub async fn delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        let _guard = self.session_write(id).await?;
        let event = Event::SessionDeleted { id };
        self.wal_append(&event).await?;
        self.sessions.remove(&id);
        self.notify.send(id, &Notice::Change(event));
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn record_shuttles(&self, id: Ulid, count: u32) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        let mut guard = self.session_write(id).await?;
        let event = Event::ShuttlesRecorded {
            session_id: id,
            count,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Voluntary signup. Fills a free seat when one exists, otherwise
    /// appends to the waitlist. Joining stays open after the lock
    /// cutoff; only leaving is closed.
    pub async fn join(&self, session_id: Ulid, user_id: Ulid) -> Result<SignupReceipt, EngineError> {
        let _gate = self.compact_gate.read().await;
        if !self.registry.contains(&user_id) {
            return Err(EngineError::UserNotFound(user_id));
        }
        let mut guard = self.session_write(session_id).await?;
        match guard.seat_of(user_id) {
            Some(Seat::Confirmed) => return Err(EngineError::AlreadyJoined(user_id)),
            Some(Seat::Waitlisted) => return Err(EngineError::AlreadyWaitlisted(user_id)),
            None => {}
        }
        if guard.participants.len() + guard.waitlist.len() >= MAX_ROSTER_LEN {
            return Err(EngineError::LimitExceeded("roster full"));
        }

        let seat = if guard.remaining() > 0 {
            Seat::Confirmed
        } else {
            Seat::Waitlisted
        };
        let event = Event::MemberJoined {
            session_id,
            user_id,
            seat,
            stub_name: None,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(SignupReceipt {
            user_id,
            seat,
            remaining: guard.remaining(),
            waitlist_count: guard.waitlist.len() as u32,
        })
    }

    /// Voluntary departure. Closed once the session is locked; freeing
    /// a confirmed seat promotes the waitlist head into it.
    pub async fn leave(&self, session_id: Ulid, user_id: Ulid) -> Result<LeaveReceipt, EngineError> {
        let _gate = self.compact_gate.read().await;
        let mut guard = self.session_write(session_id).await?;
        if guard.is_locked(now_ms()) {
            return Err(EngineError::SessionLocked(session_id));
        }
        let seat = guard
            .seat_of(user_id)
            .ok_or(EngineError::NotAMember(user_id))?;

        let promoted = match seat {
            Seat::Confirmed => {
                let plan = promotion_plan(guard.slots, guard.participants.len() - 1, &guard.waitlist);
                debug_assert!(plan.len() <= 1, "one freed seat admits at most one");
                plan.first().copied()
            }
            Seat::Waitlisted => None,
        };
        let event = Event::MemberLeft {
            session_id,
            user_id,
            seat,
            promoted,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(LeaveReceipt {
            promoted,
            remaining: guard.remaining(),
            waitlist_count: guard.waitlist.len() as u32,
        })
    }

    /// Privileged insertion by display name. Bypasses the lock; creates
    /// a stub user when the name matches nobody. The stub registration
    /// rides in the same WAL record as the seating, so a crash cannot
    /// persist one without the other. Re-adding someone already rostered
    /// reports the seat they hold and commits nothing, unlike the
    /// voluntary path, which rejects the duplicate.
    pub async fn admin_add(&self, session_id: Ulid, name: &str) -> Result<SignupReceipt, EngineError> {
        let _gate = self.compact_gate.read().await;
        validate_name(name)?;
        let (user_id, stub_name) = match self.registry.id_by_name(name) {
            Some(id) => (id, None),
            None => {
                if self.registry.len() >= MAX_USERS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many users"));
                }
                (Ulid::new(), Some(name.to_string()))
            }
        };

        let mut guard = self.session_write(session_id).await?;
        if let Some(seat) = guard.seat_of(user_id) {
            return Ok(SignupReceipt {
                user_id,
                seat,
                remaining: guard.remaining(),
                waitlist_count: guard.waitlist.len() as u32,
            });
        }
        if guard.participants.len() + guard.waitlist.len() >= MAX_ROSTER_LEN {
            return Err(EngineError::LimitExceeded("roster full"));
        }

        let seat = if guard.remaining() > 0 {
            Seat::Confirmed
        } else {
            Seat::Waitlisted
        };
        let event = Event::MemberJoined {
            session_id,
            user_id,
            seat,
            stub_name,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(SignupReceipt {
            user_id,
            seat,
            remaining: guard.remaining(),
            waitlist_count: guard.waitlist.len() as u32,
        })
    }

    /// Privileged removal from one named list. No lock check. Removal
    /// from the participants promotes the waitlist head; removal from
    /// the waitlist promotes nothing.
    pub async fn admin_remove(
        &self,
        session_id: Ulid,
        user_id: Ulid,
        from_waitlist: bool,
    ) -> Result<LeaveReceipt, EngineError> {
        let _gate = self.compact_gate.read().await;
        let mut guard = self.session_write(session_id).await?;
        let seat = if from_waitlist {
            Seat::Waitlisted
        } else {
            Seat::Confirmed
        };
        let present = match seat {
            Seat::Confirmed => guard.participants.contains(&user_id),
            Seat::Waitlisted => guard.waitlist.contains(&user_id),
        };
        if !present {
            return Err(EngineError::NotFound(user_id));
        }

        let promoted = match seat {
            Seat::Confirmed => {
                let plan = promotion_plan(guard.slots, guard.participants.len() - 1, &guard.waitlist);
                plan.first().copied()
            }
            Seat::Waitlisted => None,
        };
        let event = Event::MemberLeft {
            session_id,
            user_id,
            seat,
            promoted,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(LeaveReceipt {
            promoted,
            remaining: guard.remaining(),
            waitlist_count: guard.waitlist.len() as u32,
        })
    }

    /// Change a session's seat count and reconcile both lists. Growth
    /// promotes from the waitlist head, earliest first, until seats or
    /// the waitlist run out. Shrink demotes the most recently confirmed,
    /// appended to the waitlist tail in their original order. The moved
    /// ids are recorded in the event, making the whole reconciliation
    /// one atomic commit.
    pub async fn resize(&self, session_id: Ulid, new_slots: i64) -> Result<ResizeReport, EngineError> {
        let _gate = self.compact_gate.read().await;
        if new_slots < 0 {
            return Err(EngineError::InvalidSlotCount(new_slots));
        }
        if new_slots > MAX_SLOTS as i64 {
            return Err(EngineError::LimitExceeded("slot count too large"));
        }
        let slots = new_slots as u32;

        let mut guard = self.session_write(session_id).await?;
        let promoted = promotion_plan(slots, guard.participants.len(), &guard.waitlist);
        let demoted = demotion_plan(slots, &guard.participants);
        let event = Event::SessionResized {
            id: session_id,
            slots,
            promoted: promoted.clone(),
            demoted: demoted.clone(),
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(ResizeReport {
            promoted: promoted.len() as u32,
            demoted: demoted.len() as u32,
            remaining: guard.remaining(),
            waitlist_count: guard.waitlist.len() as u32,
        })
    }

    /// Replace the ordering of either list (or both) with a submitted
    /// permutation. Ids that are not current members of the target list
    /// are dropped; members missing from the submission keep their
    /// relative order at the tail. Membership never changes, so no
    /// promotion or demotion can follow.
    pub async fn reorder(
        &self,
        session_id: Ulid,
        participants: Option<Vec<Ulid>>,
        waitlist: Option<Vec<Ulid>>,
    ) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        for submitted in [&participants, &waitlist].into_iter().flatten() {
            if submitted.len() > MAX_REORDER_IDS {
                return Err(EngineError::LimitExceeded("too many ids in reorder"));
            }
        }

        let mut guard = self.session_write(session_id).await?;
        let new_participants = participants.map(|ids| reorder_list(&guard.participants, &ids));
        let new_waitlist = waitlist.map(|ids| reorder_list(&guard.waitlist, &ids));
        let event = Event::RosterReordered {
            session_id,
            participants: new_participants,
            waitlist: new_waitlist,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: every user, then every session with
    /// its roster replayed as seatings in list order. Mutations are held
    /// off for the whole snapshot-and-swap span, so every acknowledged
    /// commit lands either in the snapshot or in the log that survives
    /// the swap, never only in the discarded one.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compact_gate.write().await;
        let mut events = Vec::new();

        for user in self.registry.all() {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name,
                email: user.email,
                credential: user.credential,
            });
        }

        let session_arcs: Vec<super::SharedSessionState> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for arc in session_arcs {
            let guard = arc.read().await;
            events.push(Event::SessionCreated {
                id: guard.id,
                date: guard.date,
                slots: guard.slots,
            });
            for &user_id in &guard.participants {
                events.push(Event::MemberJoined {
                    session_id: guard.id,
                    user_id,
                    seat: Seat::Confirmed,
                    stub_name: None,
                });
            }
            for &user_id in &guard.waitlist {
                events.push(Event::MemberJoined {
                    session_id: guard.id,
                    user_id,
                    seat: Seat::Waitlisted,
                    stub_name: None,
                });
            }
            if guard.shuttles_used > 0 {
                events.push(Event::ShuttlesRecorded {
                    session_id: guard.id,
                    count: guard.shuttles_used,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_date(date: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_DATE_MS..=MAX_VALID_DATE_MS).contains(&date) {
        return Err(EngineError::LimitExceeded("session date out of range"));
    }
    Ok(())
}
