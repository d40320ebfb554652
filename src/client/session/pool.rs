use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::sync::Mutex;

use super::ServerSession;
use crate::bson::Document;

/// A pool of server sessions, reused front-first so that the sessions most likely to still be
/// alive on the server are handed out first.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,

    /// Bumped by `reset`; sessions minted under an older epoch are never re-pooled. This is what
    /// makes the pool safe across process duplication: the child resets, and any session checked
    /// out by the parent is discarded on check-in rather than re-queued.
    epoch: AtomicU64,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Checks out a server session from the pool. Sessions that are about to expire within the
    /// next minute are discarded on the way; if none remain, a new session is minted under the
    /// current epoch.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new(self.epoch())
    }

    /// Checks a server session back into the pool. Dirty, expiring, and stale-epoch sessions are
    /// discarded; expiring sessions at the back of the pool are pruned as well.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;

        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if session.epoch == self.epoch()
            && !session.dirty
            && !session.is_about_to_expire(logical_session_timeout)
        {
            pool.push_front(session);
        }
    }

    /// Bump the epoch and drop all pooled sessions without notifying the server. Required after
    /// `fork`-style process duplication, where the child must not reuse (or end) the parent's
    /// sessions.
    pub(crate) async fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.pool.lock().await.clear();
    }

    /// Remove and return all pooled session ids, for use in `endSessions`.
    pub(crate) async fn drain_session_ids(&self) -> Vec<Document> {
        self.pool
            .lock()
            .await
            .drain(..)
            .map(|session| session.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_sessions_are_reused_lifo() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let first = pool.check_out(timeout).await;
        let second = pool.check_out(timeout).await;
        assert_ne!(first.id, second.id);

        let first_id = first.id.clone();
        let second_id = second.id.clone();
        pool.check_in(first, timeout).await;
        pool.check_in(second, timeout).await;

        // The most recently checked-in session comes back first.
        assert_eq!(pool.check_out(timeout).await.id, second_id);
        assert_eq!(pool.check_out(timeout).await.id, first_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let mut session = pool.check_out(timeout).await;
        session.dirty = true;
        let dirty_id = session.id.clone();
        pool.check_in(session, timeout).await;

        assert_ne!(pool.check_out(timeout).await.id, dirty_id);
    }

    #[tokio::test]
    async fn expiring_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        // With a 30 second timeout every session is within a minute of expiring.
        let timeout = Some(Duration::from_secs(30));

        let session = pool.check_out(timeout).await;
        let id = session.id.clone();
        pool.check_in(session, timeout).await;

        assert_ne!(pool.check_out(timeout).await.id, id);
    }

    #[tokio::test]
    async fn reset_discards_checked_out_sessions_on_check_in() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let session = pool.check_out(timeout).await;
        let stale_id = session.id.clone();

        pool.reset().await;
        pool.check_in(session, timeout).await;

        // The session minted before the reset was not re-queued.
        assert_ne!(pool.check_out(timeout).await.id, stale_id);
        assert!(pool.drain_session_ids().await.is_empty());
    }
}
