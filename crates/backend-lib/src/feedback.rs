// ============================
// pika-backend-lib/src/feedback.rs
// ============================
//! Crowd feedback aggregators: per-client like dedup and tempo votes.
//!
//! Both trackers are keyed by (session, client) and must be cleared
//! together with session end to bound memory.

use dashmap::DashMap;
use pika_common::{TempoCounts, TempoPreference, Track};
use std::collections::HashMap;

/// Tracks which tracks each client has already liked in a session
#[derive(Default)]
pub struct LikeTracker {
    /// (session_id, client_id) -> set of liked track keys
    likes: DashMap<(String, String), std::collections::HashSet<String>>,
}

impl LikeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, session_id: &str, client_id: &str, track: &Track) -> bool {
        self.likes
            .get(&(session_id.to_string(), client_id.to_string()))
            .is_some_and(|set| set.contains(&track.like_key()))
    }

    /// Record a like. Idempotent: recording the same track again is a no-op.
    pub fn record(&self, session_id: &str, client_id: &str, track: &Track) {
        self.likes
            .entry((session_id.to_string(), client_id.to_string()))
            .or_default()
            .insert(track.like_key());
    }

    pub fn clear_session(&self, session_id: &str) {
        self.likes.retain(|(sid, _), _| sid != session_id);
    }
}

#[derive(Default)]
struct TempoState {
    slower: u32,
    perfect: u32,
    faster: u32,
    /// Current choice per client, enabling idempotent re-votes
    choices: HashMap<String, TempoPreference>,
}

impl TempoState {
    fn bump(&mut self, preference: TempoPreference, delta: i32) {
        let counter = match preference {
            TempoPreference::Slower => &mut self.slower,
            TempoPreference::Perfect => &mut self.perfect,
            TempoPreference::Faster => &mut self.faster,
            TempoPreference::Clear => return,
        };
        *counter = counter.saturating_add_signed(delta);
    }
}

/// Per-session tempo vote aggregate for the currently-tracked track
#[derive(Default)]
pub struct TempoTracker {
    sessions: DashMap<String, TempoState>,
}

impl TempoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a vote: any prior choice from this client is removed first,
    /// then the new choice is recorded unless the preference is `Clear`.
    /// Changing a vote adjusts counters rather than double-counting.
    pub fn vote(&self, session_id: &str, client_id: &str, preference: TempoPreference) {
        let mut state = self.sessions.entry(session_id.to_string()).or_default();

        if let Some(prev) = state.choices.remove(client_id) {
            state.bump(prev, -1);
        }
        if preference != TempoPreference::Clear {
            state.choices.insert(client_id.to_string(), preference);
            state.bump(preference, 1);
        }
    }

    pub fn feedback(&self, session_id: &str) -> TempoCounts {
        self.sessions
            .get(session_id)
            .map(|s| TempoCounts {
                slower: s.slower,
                perfect: s.perfect,
                faster: s.faster,
                total: s.slower + s.perfect + s.faster,
            })
            .unwrap_or_default()
    }

    /// Drop all votes for the session, e.g. on track change
    pub fn reset(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
