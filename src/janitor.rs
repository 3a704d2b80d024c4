use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use ulid::Ulid;

use crate::engine::{now_ms, Engine};
use crate::notify::Notice;

const LOCK_WATCH_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that announces lock cutoffs. Each session is
/// announced once; the set is seeded with everything already locked at
/// startup so a restart does not re-announce old sessions.
pub async fn run_lock_watch(engine: Arc<Engine>) {
    let mut announced: HashSet<Ulid> =
        engine.locked_session_ids(now_ms()).into_iter().collect();
    let mut interval = tokio::time::interval(LOCK_WATCH_INTERVAL);
    loop {
        interval.tick().await;
        for session_id in engine.locked_session_ids(now_ms()) {
            if announced.insert(session_id) {
                info!("session {session_id} locked, voluntary leaves closed");
                metrics::counter!(crate::observability::SESSIONS_LOCKED_TOTAL).increment(1);
                engine.notify.send(session_id, &Notice::Locked);
            }
        }
        announced.retain(|id| engine.sessions.contains_key(id));
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            info!("compacting WAL ({appends} appends since last compact)");
            if let Err(e) = engine.compact_wal().await {
                tracing::error!("WAL compaction failed: {e}");
            }
        }
    }
}
