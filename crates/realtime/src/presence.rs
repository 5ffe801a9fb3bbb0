use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use shared::domain::{UserId, UserStatus};
use storage::Storage;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{cache::EphemeralCache, dispatch::Dispatcher, session::SessionRegistry};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3000);

struct PresenceInner {
    storage: Storage,
    cache: EphemeralCache,
    dispatcher: Dispatcher,
    registry: Arc<SessionRegistry>,
    /// Authoritative in-memory status; dispatch trusts this even when the
    /// durable write degrades.
    statuses: DashMap<UserId, UserStatus>,
    /// Pending offline transitions, one per user at most.
    pending_offline: DashMap<UserId, JoinHandle<()>>,
    debounce: Duration,
}

/// Derives online/offline/away from session registry transitions.
///
/// Going offline is debounced: the transition only commits if no new session
/// registers within the window, which absorbs page reloads and flaky
/// networks without flapping `user:status` broadcasts.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    pub fn new(
        storage: Storage,
        cache: EphemeralCache,
        dispatcher: Dispatcher,
        registry: Arc<SessionRegistry>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                storage,
                cache,
                dispatcher,
                registry,
                statuses: DashMap::new(),
                pending_offline: DashMap::new(),
                debounce,
            }),
        }
    }

    pub fn status_of(&self, user_id: UserId) -> UserStatus {
        self.inner
            .statuses
            .get(&user_id)
            .map(|s| *s)
            .unwrap_or(UserStatus::Offline)
    }

    /// Called when a session registers. Cancels any pending offline
    /// transition; broadcasts only on an actual status change.
    pub async fn mark_online(&self, user_id: UserId) {
        if let Some((_, pending)) = self.inner.pending_offline.remove(&user_id) {
            pending.abort();
        }
        let previous = self.inner.statuses.insert(user_id, UserStatus::Online);
        if previous != Some(UserStatus::Online) {
            info!(%user_id, "user online");
            self.persist_and_broadcast(user_id, UserStatus::Online).await;
        }
    }

    /// Called when a session unregisters. Only schedules the offline
    /// transition when no sessions remain, and even then waits out the
    /// debounce window before committing.
    pub fn handle_disconnect(&self, user_id: UserId, remaining_sessions: usize) {
        if remaining_sessions > 0 {
            return;
        }
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(tracker.inner.debounce).await;
            // Re-check: a reconnect may have raced the timer.
            if tracker.inner.registry.session_count(user_id) > 0 {
                return;
            }
            tracker.inner.pending_offline.remove(&user_id);
            let previous = tracker.inner.statuses.insert(user_id, UserStatus::Offline);
            if previous != Some(UserStatus::Offline) {
                info!(%user_id, "user offline");
                tracker
                    .persist_and_broadcast(user_id, UserStatus::Offline)
                    .await;
            }
        });
        // A new timer replaces any pending one for this user.
        if let Some(stale) = self.inner.pending_offline.insert(user_id, handle) {
            stale.abort();
        }
    }

    /// Explicit client-driven status change (away, do-not-disturb, back to
    /// online). Independent of session count.
    pub async fn set_status(&self, user_id: UserId, status: UserStatus) {
        let previous = self.inner.statuses.insert(user_id, status);
        if previous != Some(status) {
            self.persist_and_broadcast(user_id, status).await;
        }
    }

    /// Write-through persistence (durable store first, then cache), then
    /// `user:status` fan-out. The durable write is retried once; on repeat
    /// failure the in-memory status stays authoritative and we log the
    /// degraded write instead of failing the transition.
    async fn persist_and_broadcast(&self, user_id: UserId, status: UserStatus) {
        let last_seen = Utc::now();
        let mut attempt = self
            .inner
            .storage
            .update_user_status(user_id, status, last_seen)
            .await;
        if let Err(error) = &attempt {
            warn!(%user_id, %error, "status persist failed, retrying once");
            attempt = self
                .inner
                .storage
                .update_user_status(user_id, status, last_seen)
                .await;
        }
        if let Err(error) = attempt {
            warn!(%user_id, %error, "status persist degraded; in-memory status remains authoritative");
        }

        self.inner.cache.put_user_status(user_id, status, last_seen);
        self.inner.dispatcher.broadcast_status(user_id, status).await;
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
