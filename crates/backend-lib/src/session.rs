// ============================
// pika-backend-lib/src/session.rs
// ============================
//! Canonical in-memory record of each live session.
//!
//! A session exists only while its DJ connection is alive or until
//! explicitly ended; removal is always an explicit caller action, there
//! is no implicit expiry.

use dashmap::DashMap;
use pika_common::{now_millis, Announcement, Track};

/// One live DJ broadcast instance
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub dj_name: String,
    pub current_track: Option<Track>,
    pub announcement: Option<Announcement>,
    pub started_at: u64,
}

/// Registry of live sessions, keyed by caller-supplied session ID
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session if absent, otherwise return the existing entry
    /// unchanged. First writer wins. The flag tells the caller whether
    /// this call created the entry, so ownership is only ever granted to
    /// the first writer.
    pub fn register(&self, id: &str, dj_name: &str) -> (Session, bool) {
        let mut created = false;
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                created = true;
                Session {
                    id: id.to_string(),
                    dj_name: dj_name.to_string(),
                    current_track: None,
                    announcement: None,
                    started_at: now_millis(),
                }
            })
            .clone();
        (session, created)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns false if the session is absent
    pub fn set_current_track(&self, id: &str, track: Track) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.current_track = Some(track);
                true
            },
            None => false,
        }
    }

    /// Returns false if the session is absent
    pub fn set_announcement(&self, id: &str, announcement: Option<Announcement>) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.announcement = announcement;
                true
            },
            None => false,
        }
    }

    /// Remove the session. Returns false if it was not present.
    pub fn end(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
