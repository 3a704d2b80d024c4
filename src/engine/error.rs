use ulid::Ulid;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    SessionNotFound(Ulid),
    UserNotFound(Ulid),
    AlreadyJoined(Ulid),
    AlreadyWaitlisted(Ulid),
    NotAMember(Ulid),
    SessionLocked(Ulid),
    InvalidSlotCount(i64),
    /// Admin removal target absent from the specified list.
    NotFound(Ulid),
    EmailTaken(String),
    InvalidName(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::AlreadyJoined(id) => write!(f, "already a confirmed participant: {id}"),
            EngineError::AlreadyWaitlisted(id) => write!(f, "already on the waitlist: {id}"),
            EngineError::NotAMember(id) => write!(f, "not a member of this session: {id}"),
            EngineError::SessionLocked(id) => {
                write!(f, "session {id} is locked: leaving closed at 20:00 the day before")
            }
            EngineError::InvalidSlotCount(n) => write!(f, "invalid slot count: {n}"),
            EngineError::NotFound(id) => write!(f, "not on that list: {id}"),
            EngineError::EmailTaken(email) => write!(f, "email already registered: {email}"),
            EngineError::InvalidName(name) => write!(f, "invalid name: {name:?}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
