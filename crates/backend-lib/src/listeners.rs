// ============================
// pika-backend-lib/src/listeners.rs
// ============================
//! Per-session listener presence with a sticky grace window.
//!
//! "Connection closed" and "listener gone" are deliberately separate
//! events: a client that drops and reconnects inside the grace window
//! (phone sleep/wake, tab backgrounding) is never re-announced as a new
//! listener, and still counts as present. Memory is bounded by the
//! long-horizon `cleanup_stale` sweep, not by implicit expiry.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PresenceEntry {
    /// Number of concurrently open connections from this client
    refs: u32,
    last_seen: Instant,
}

/// Reference-counted per-(session, client) presence tracker
pub struct ListenerTracker {
    sessions: DashMap<String, HashMap<String, PresenceEntry>>,
    /// session -> (computed at, count)
    count_cache: DashMap<String, (Instant, usize)>,
    grace: Duration,
    cache_ttl: Duration,
    stale_after: Duration,
}

impl ListenerTracker {
    pub fn new(grace: Duration, cache_ttl: Duration, stale_after: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            count_cache: DashMap::new(),
            grace,
            cache_ttl,
            stale_after,
        }
    }

    /// Register one more open connection from `client_id` to the session.
    ///
    /// Returns true only for a genuinely new appearance: the client had no
    /// open connection and its last sighting is older than the grace
    /// window. A reconnect inside the window returns false so callers do
    /// not re-announce it.
    pub fn add(&self, session_id: &str, client_id: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.sessions.entry(session_id.to_string()).or_default();

        let is_new = match bucket.get(client_id) {
            None => true,
            Some(entry) => entry.refs == 0 && now.duration_since(entry.last_seen) > self.grace,
        };

        let entry = bucket.entry(client_id.to_string()).or_insert(PresenceEntry {
            refs: 0,
            last_seen: now,
        });
        entry.refs += 1;
        entry.last_seen = now;
        drop(bucket);

        self.count_cache.remove(session_id);
        is_new
    }

    /// Register a closed connection. Always returns false: the sticky
    /// window means the client may still count as present, so disconnects
    /// never trigger an immediate broadcast. Count changes surface via the
    /// cached count on the next read.
    pub fn remove(&self, session_id: &str, client_id: &str) -> bool {
        if let Some(mut bucket) = self.sessions.get_mut(session_id) {
            if let Some(entry) = bucket.get_mut(client_id) {
                entry.refs = entry.refs.saturating_sub(1);
                entry.last_seen = Instant::now();
            }
        }
        self.count_cache.remove(session_id);
        false
    }

    /// Unique listener count: entries with an open connection, plus
    /// entries still inside the grace window. Cached briefly to avoid
    /// recomputation on every fan-out tick.
    pub fn count(&self, session_id: &str) -> usize {
        let now = Instant::now();
        if let Some(cached) = self.count_cache.get(session_id) {
            let (at, count) = *cached;
            if now.duration_since(at) < self.cache_ttl {
                return count;
            }
        }

        let count = self
            .sessions
            .get(session_id)
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|e| e.refs > 0 || now.duration_since(e.last_seen) < self.grace)
                    .count()
            })
            .unwrap_or(0);

        self.count_cache.insert(session_id.to_string(), (now, count));
        count
    }

    /// Drop the whole bucket for an ended session
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.count_cache.remove(session_id);
    }

    /// Periodic sweep: drop entries with no open connection whose last
    /// sighting exceeds the stale horizon, and session buckets left empty.
    /// Invalidates the count cache for every session it touches. Returns
    /// the number of entries dropped.
    pub fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.sessions.retain(|session_id, bucket| {
            let before = bucket.len();
            bucket.retain(|_, entry| {
                !(entry.refs == 0 && now.duration_since(entry.last_seen) >= self.stale_after)
            });
            if bucket.len() != before || bucket.is_empty() {
                removed += before - bucket.len();
                self.count_cache.remove(session_id);
            }
            !bucket.is_empty()
        });
        removed
    }

    /// Number of tracked presence entries for a session, ignoring the
    /// grace window. Test and diagnostics helper.
    pub fn tracked_entries(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const MS: Duration = Duration::from_millis(1);

    fn tracker(grace_ms: u64, cache_ms: u64, stale_ms: u64) -> ListenerTracker {
        ListenerTracker::new(
            Duration::from_millis(grace_ms),
            Duration::from_millis(cache_ms),
            Duration::from_millis(stale_ms),
        )
    }

    #[test]
    fn test_add_twice_announces_once() {
        let t = tracker(50_000, 0, 100_000);
        assert!(t.add("s1", "c1"));
        assert!(!t.add("s1", "c1"));
    }

    #[test]
    fn test_reconnect_within_grace_is_not_new() {
        let t = tracker(50_000, 0, 100_000);
        assert!(t.add("s1", "c1"));
        assert!(!t.remove("s1", "c1"));
        // refs back to 0 but still inside the grace window
        assert!(!t.add("s1", "c1"));
    }

    #[test]
    fn test_reconnect_after_grace_is_new() {
        let t = tracker(10, 0, 100_000);
        assert!(t.add("s1", "c1"));
        t.remove("s1", "c1");
        sleep(20 * MS);
        assert!(t.add("s1", "c1"));
    }

    #[test]
    fn test_remove_always_returns_false() {
        let t = tracker(50_000, 0, 100_000);
        t.add("s1", "c1");
        assert!(!t.remove("s1", "c1"));
        // decrement floors at 0
        assert!(!t.remove("s1", "c1"));
        assert!(!t.remove("s1", "unknown"));
    }

    #[test]
    fn test_count_includes_grace_window() {
        let t = tracker(50_000, 0, 100_000);
        t.add("s1", "c1");
        t.add("s1", "c2");
        assert_eq!(t.count("s1"), 2);

        // disconnected but sticky
        t.remove("s1", "c2");
        assert_eq!(t.count("s1"), 2);

        assert_eq!(t.count("unknown"), 0);
    }

    #[test]
    fn test_count_excludes_expired_grace() {
        let t = tracker(10, 0, 100_000);
        t.add("s1", "c1");
        t.add("s1", "c2");
        t.remove("s1", "c2");
        sleep(20 * MS);
        assert_eq!(t.count("s1"), 1);
    }

    #[test]
    fn test_count_cache_is_invalidated_on_mutation() {
        let t = tracker(50_000, 60_000, 100_000);
        t.add("s1", "c1");
        assert_eq!(t.count("s1"), 1);
        // a fresh mutation must bust the long-lived cache
        t.add("s1", "c2");
        assert_eq!(t.count("s1"), 2);
    }

    #[test]
    fn test_cleanup_stale_drops_idle_entries_and_empty_buckets() {
        let t = tracker(0, 0, 10);
        t.add("s1", "c1");
        t.remove("s1", "c1");
        assert_eq!(t.tracked_entries("s1"), 1);

        sleep(20 * MS);
        t.cleanup_stale();
        assert_eq!(t.tracked_entries("s1"), 0);
        assert_eq!(t.count("s1"), 0);
    }

    #[test]
    fn test_cleanup_stale_keeps_connected_clients() {
        let t = tracker(0, 0, 10);
        t.add("s1", "c1");
        sleep(20 * MS);
        // refs > 0, so the entry stays no matter how old
        t.cleanup_stale();
        assert_eq!(t.tracked_entries("s1"), 1);
    }
}
