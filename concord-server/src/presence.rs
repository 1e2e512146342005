//! Online-presence tracking with TTL eviction.
//!
//! An entry maps a user id to the last instant activity was observed.
//! Absence means offline. A background reaper sweeps at half the TTL so
//! stale entries don't pile up, but `is_online` re-checks the window itself
//! — the reaper may lag behind wall time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

const DEFAULT_TTL: Duration = Duration::from_secs(120);

pub struct PresenceTracker {
    seen: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    ttl: Duration,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl PresenceTracker {
    /// Create a tracker and spawn its reaper. A zero TTL coerces to the
    /// two-minute default.
    pub fn start(ttl: Duration) -> Arc<Self> {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        let seen: Arc<RwLock<HashMap<String, DateTime<Utc>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let sweep_every = Duration::from_secs((ttl.as_secs() / 2).max(1));
        let reaper_map = Arc::clone(&seen);
        let reaper_ttl = ttl;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(reaper_ttl).unwrap_or_default();
                        reaper_map.write().retain(|_, last| *last > cutoff);
                    }
                    changed = stop_rx.changed() => {
                        // A send of `true` or a dropped sender both stop us.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("presence reaper stopped");
        });

        Arc::new(Self {
            seen,
            ttl,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Record activity for `user` now.
    pub fn touch(&self, user: &str) {
        self.seen.write().insert(user.to_string(), Utc::now());
    }

    /// Drop the user's entry immediately.
    pub fn set_offline(&self, user: &str) {
        self.seen.write().remove(user);
    }

    /// True iff the user has an entry within the TTL window.
    pub fn is_online(&self, user: &str) -> bool {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or_default();
        self.seen
            .read()
            .get(user)
            .is_some_and(|last| *last > cutoff)
    }

    /// Users currently inside the TTL window.
    pub fn online_users(&self) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or_default();
        self.seen
            .read()
            .iter()
            .filter(|(_, last)| **last > cutoff)
            .map(|(user, _)| user.clone())
            .collect()
    }

    /// Signal the reaper to exit. Idempotent: the terminator is sent once
    /// and later calls find it already gone.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_marks_online() {
        let p = PresenceTracker::start(Duration::from_secs(60));
        assert!(!p.is_online("u1"));
        p.touch("u1");
        assert!(p.is_online("u1"));
        p.stop();
    }

    #[tokio::test]
    async fn set_offline_removes_entry() {
        let p = PresenceTracker::start(Duration::from_secs(60));
        p.touch("u1");
        p.set_offline("u1");
        assert!(!p.is_online("u1"));
        p.stop();
    }

    #[tokio::test]
    async fn expired_entry_reads_offline_before_reap() {
        // TTL so short the window closes between touch and check, while the
        // reaper (sweeping at 1s floor) has not run yet.
        let p = PresenceTracker::start(Duration::from_millis(50));
        p.touch("u1");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!p.is_online("u1"), "is_online double-checks the window");
        p.stop();
    }

    #[tokio::test]
    async fn reaper_expunges_stale_entries() {
        let p = PresenceTracker::start(Duration::from_secs(1));
        p.touch("u1");
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(p.seen.read().is_empty(), "reaper removed the stale entry");
        p.stop();
    }

    #[tokio::test]
    async fn stop_twice_is_safe() {
        let p = PresenceTracker::start(Duration::from_secs(60));
        p.stop();
        p.stop();
    }

    #[tokio::test]
    async fn online_users_lists_only_fresh() {
        let p = PresenceTracker::start(Duration::from_secs(60));
        p.touch("a");
        p.touch("b");
        p.set_offline("b");
        let online = p.online_users();
        assert_eq!(online, vec!["a".to_string()]);
        p.stop();
    }
}
