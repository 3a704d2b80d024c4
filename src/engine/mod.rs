mod error;
mod mutations;
mod queries;
mod roster;

pub use error::EngineError;
pub use roster::{demotion_plan, promotion_plan, reorder_list, roster_consistent};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::wal::Wal;

pub type SharedSessionState = Arc<RwLock<SessionState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── User registry ────────────────────────────────────────

/// Tenant-wide user store with email and display-name indexes.
/// Names are not unique; the name index keeps the first claimant, which
/// is who the admin add-by-name path resolves to.
pub(super) struct Registry {
    users: DashMap<Ulid, User>,
    by_email: DashMap<String, Ulid>,
    by_name: DashMap<String, Ulid>,
}

impl Registry {
    fn new() -> Self {
        Self {
            users: DashMap::new(),
            by_email: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    pub(super) fn insert(&self, user: User) {
        if let Some(email) = &user.email {
            self.by_email.insert(email.clone(), user.id);
        }
        self.by_name.entry(user.name.clone()).or_insert(user.id);
        self.users.insert(user.id, user);
    }

    /// Claim an email before committing the registration. Returns false
    /// if another user holds it; the claim serializes concurrent
    /// registrations of the same address.
    pub(super) fn reserve_email(&self, email: &str, id: Ulid) -> bool {
        match self.by_email.entry(email.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    /// Drop a claim after a failed commit.
    pub(super) fn release_email(&self, email: &str) {
        self.by_email.remove(email);
    }

    pub(super) fn contains(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub(super) fn get(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub(super) fn id_by_name(&self, name: &str) -> Option<Ulid> {
        self.by_name.get(name).map(|e| *e.value())
    }

    pub(super) fn name_of(&self, id: &Ulid) -> Option<String> {
        self.users.get(id).map(|u| u.name.clone())
    }

    pub(super) fn len(&self) -> usize {
        self.users.len()
    }

    pub(super) fn all(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub sessions: DashMap<Ulid, SharedSessionState>,
    pub(super) registry: Registry,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation across its commit and in-memory
    /// apply, exclusive by compaction across its snapshot and swap.
    /// Acquired before any session lock.
    pub(super) compact_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Apply an event directly to a SessionState (no locking — caller holds
/// the lock). Purely mechanical: every id it moves was planned and
/// recorded when the event was built, so live application and replay
/// take the same path.
fn apply_to_session(s: &mut SessionState, event: &Event, registry: &Registry) {
    match event {
        Event::MemberJoined {
            user_id,
            seat,
            stub_name,
            ..
        } => {
            if let Some(name) = stub_name {
                registry.insert(User {
                    id: *user_id,
                    name: name.clone(),
                    email: None,
                    credential: None,
                });
            }
            match seat {
                Seat::Confirmed => s.participants.push(*user_id),
                Seat::Waitlisted => s.waitlist.push(*user_id),
            }
        }
        Event::MemberLeft {
            user_id,
            seat,
            promoted,
            ..
        } => {
            s.remove_seat(*user_id, *seat);
            if let Some(p) = promoted {
                roster::promote(s, std::slice::from_ref(p));
            }
        }
        Event::SessionResized {
            slots,
            promoted,
            demoted,
            ..
        } => {
            s.slots = *slots;
            roster::promote(s, promoted);
            roster::demote(s, demoted);
        }
        Event::SessionRescheduled { date, .. } => {
            s.date = *date;
        }
        Event::RosterReordered {
            participants,
            waitlist,
            ..
        } => {
            if let Some(p) = participants {
                s.participants = p.clone();
            }
            if let Some(w) = waitlist {
                s.waitlist = w.clone();
            }
        }
        Event::ShuttlesRecorded { count, .. } => {
            s.shuttles_used = *count;
        }
        // Created/Deleted/Registered are handled at the map level, not here
        Event::SessionCreated { .. }
        | Event::SessionDeleted { .. }
        | Event::UserRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            sessions: DashMap::new(),
            registry: Registry::new(),
            wal_tx,
            compact_gate: RwLock::new(()),
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::UserRegistered {
                    id,
                    name,
                    email,
                    credential,
                } => {
                    engine.registry.insert(User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        credential: credential.clone(),
                    });
                }
                Event::SessionCreated { id, date, slots } => {
                    let s = SessionState::new(*id, *date, *slots);
                    engine.sessions.insert(*id, Arc::new(RwLock::new(s)));
                }
                Event::SessionDeleted { id } => {
                    engine.sessions.remove(id);
                }
                other => {
                    if let Some(session_id) = event_session_id(other)
                        && let Some(entry) = engine.sessions.get(&session_id) {
                            let s_arc = entry.clone();
                            let mut guard = s_arc.try_write().expect("replay: uncontended write");
                            apply_to_session(&mut guard, other, &engine.registry);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify in one call. The append is awaited
    /// while the caller holds the session's write lock, which is what
    /// makes the commit the atomicity boundary: nothing is applied or
    /// announced until the record is durable.
    pub(super) async fn persist_and_apply(
        &self,
        session_id: Ulid,
        s: &mut SessionState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_session(s, event, &self.registry);
        self.notify.send(session_id, &Notice::Change(event.clone()));
        Ok(())
    }

    /// Look up a session and acquire its write lock.
    pub(super) async fn session_write(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SessionState>, EngineError> {
        let s = self
            .get_session(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        Ok(s.write_owned().await)
    }
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Extract the session id from an event applied under the session lock.
fn event_session_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::MemberJoined { session_id, .. }
        | Event::MemberLeft { session_id, .. }
        | Event::RosterReordered { session_id, .. }
        | Event::ShuttlesRecorded { session_id, .. } => Some(*session_id),
        Event::SessionResized { id, .. } | Event::SessionRescheduled { id, .. } => Some(*id),
        Event::SessionCreated { .. }
        | Event::SessionDeleted { .. }
        | Event::UserRegistered { .. } => None,
    }
}
