use ulid::Ulid;

use crate::model::*;

use super::{now_ms, Engine, EngineError};

impl Engine {
    fn session_info(&self, s: &SessionState, now: Ms) -> SessionInfo {
        SessionInfo {
            id: s.id,
            date: s.date,
            slots: s.slots,
            remaining: s.remaining(),
            waitlist_count: s.waitlist.len() as u32,
            shuttles_used: s.shuttles_used,
            locked: s.is_locked(now),
        }
    }

    pub async fn get_session_info(&self, id: Ulid) -> Result<SessionInfo, EngineError> {
        let s = self
            .get_session(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        let guard = s.read().await;
        Ok(self.session_info(&guard, now_ms()))
    }

    /// All sessions ordered by date, then id.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let arcs: Vec<super::SharedSessionState> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let now = now_ms();
        let mut infos = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            infos.push(self.session_info(&guard, now));
        }
        infos.sort_by_key(|i| (i.date, i.id));
        infos
    }

    pub async fn list_participants(&self, session_id: Ulid) -> Result<Vec<MemberInfo>, EngineError> {
        let s = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = s.read().await;
        Ok(self.resolve_members(&guard.participants))
    }

    pub async fn list_waitlist(&self, session_id: Ulid) -> Result<Vec<MemberInfo>, EngineError> {
        let s = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = s.read().await;
        Ok(self.resolve_members(&guard.waitlist))
    }

    /// Both lists from one lock acquisition, so the pair is a consistent
    /// snapshot.
    pub async fn roster(&self, session_id: Ulid) -> Result<RosterInfo, EngineError> {
        let s = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = s.read().await;
        Ok(RosterInfo {
            participants: self.resolve_members(&guard.participants),
            waitlist: self.resolve_members(&guard.waitlist),
        })
    }

    pub async fn is_locked(&self, session_id: Ulid) -> Result<bool, EngineError> {
        let s = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = s.read().await;
        Ok(guard.is_locked(now_ms()))
    }

    pub fn get_user(&self, id: Ulid) -> Result<UserInfo, EngineError> {
        let user = self
            .registry
            .get(&id)
            .ok_or(EngineError::UserNotFound(id))?;
        Ok(UserInfo {
            id: user.id,
            name: user.name,
            email: user.email,
        })
    }

    pub fn list_users(&self) -> Vec<UserInfo> {
        self.registry
            .all()
            .into_iter()
            .map(|u| UserInfo {
                id: u.id,
                name: u.name,
                email: u.email,
            })
            .collect()
    }

    /// Sessions past their lock cutoff at `now`. Contended sessions are
    /// skipped; the caller polls, so the next pass picks them up.
    pub fn locked_session_ids(&self, now: Ms) -> Vec<Ulid> {
        let mut locked = Vec::new();
        for entry in self.sessions.iter() {
            let arc = entry.value().clone();
            if let Ok(guard) = arc.try_read()
                && guard.is_locked(now) {
                    locked.push(guard.id);
                }
        }
        locked
    }

    fn resolve_members(&self, ids: &[Ulid]) -> Vec<MemberInfo> {
        ids.iter()
            .map(|id| MemberInfo {
                id: *id,
                name: self.registry.name_of(id).unwrap_or_default(),
            })
            .collect()
    }
}
