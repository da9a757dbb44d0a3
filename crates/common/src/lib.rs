// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between Pika! clients and the live-session server.
//! This module defines the WebSocket protocol messages and supporting types.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric poll identifier assigned at creation
pub type PollId = u64;

/// Current time as Unix milliseconds, the timestamp unit used on the wire
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Track metadata broadcast by the DJ
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    pub artist: String,
    /// Beats per minute, when the DJ software reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    /// Musical key (e.g. "Am", "C")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Derived acoustic fingerprint from the analysis sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<AcousticFeatures>,
}

impl Track {
    /// Dedup identity for likes: a client may like a given artist+title
    /// once per session, regardless of casing or surrounding whitespace.
    pub fn like_key(&self) -> String {
        format!(
            "{}::{}",
            self.artist.trim().to_lowercase(),
            self.title.trim().to_lowercase()
        )
    }
}

/// Fingerprint metrics on a 0-100 scale, all optional
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcousticFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danceability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acousticness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groove: Option<f64>,
}

/// DJ announcement shown to the crowd
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub message: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Announcement {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A dancer's tempo request for the current track
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TempoPreference {
    Slower,
    Perfect,
    Faster,
    /// Withdraw a previous vote without casting a new one
    Clear,
}

/// Aggregated tempo votes for one session's current track
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TempoCounts {
    pub slower: u32,
    pub perfect: u32,
    pub faster: u32,
    pub total: u32,
}

/// Point-in-time view of an active poll, also used for late-joiner sync
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    pub poll_id: PollId,
    pub session_id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Index-aligned with `options`
    pub votes: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Register a live session. Idempotent: re-registering an existing ID
    /// returns the existing session unchanged.
    RegisterSession {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        dj_name: Option<String>,
    },
    /// Announce the track now playing; resets the tempo aggregate
    BroadcastTrack { session_id: String, track: Track },
    /// End the session, clearing all per-session state
    EndSession { session_id: String },
    /// Join a session as a listener; triggers late-joiner state sync
    Subscribe {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Like the given track (at most once per client per session)
    SendLike {
        #[serde(default)]
        session_id: Option<String>,
        track: Track,
        client_id: String,
    },
    /// Cast or withdraw a tempo vote
    SendTempoRequest {
        session_id: String,
        preference: TempoPreference,
    },
    /// Set or clear the session announcement (DJ only)
    SetAnnouncement {
        session_id: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        duration_seconds: Option<u64>,
    },
    /// Start a poll (DJ only; at most one active poll per session)
    StartPoll {
        session_id: String,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        duration_seconds: Option<u64>,
    },
    /// End the poll and broadcast real results (DJ only)
    EndPoll { session_id: String, poll_id: PollId },
    /// Cancel the poll: results broadcast all-zero with no winner (DJ only)
    CancelPoll { session_id: String, poll_id: PollId },
    /// Vote on an active poll (at most once per client)
    VoteOnPoll {
        poll_id: PollId,
        client_id: String,
        option_index: usize,
    },
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    SessionEnded {
        session_id: String,
    },
    NowPlaying {
        session_id: String,
        track: Track,
    },
    ListenerCount {
        session_id: String,
        count: usize,
    },
    TempoFeedback {
        session_id: String,
        feedback: TempoCounts,
    },
    Announcement {
        session_id: String,
        #[serde(default)]
        announcement: Option<Announcement>,
    },
    PollStarted {
        poll: PollSnapshot,
    },
    PollUpdate {
        poll: PollSnapshot,
    },
    /// Final poll results. `winner_index` is -1 for a cancelled poll.
    PollEnded {
        poll_id: PollId,
        session_id: String,
        question: String,
        options: Vec<String>,
        votes: Vec<u32>,
        winner_index: i32,
    },
    LikeReceived {
        session_id: String,
        track: Track,
        client_id: String,
    },
    Ack {
        #[serde(default)]
        correlation_id: Option<String>,
    },
    Nack {
        code: String,
        message: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },
}

/// Inbound frame: an optional correlation identifier plus the message body.
/// Faults on messages without a correlation ID are logged but not NACKed,
/// since there is no reply the client is waiting on.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let json = r#"{
            "type": "BROADCAST_TRACK",
            "correlationId": "abc-123",
            "sessionId": "s1",
            "track": {"title": "Y", "artist": "X", "bpm": 124.0}
        }"#;

        let inbound: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(inbound.correlation_id.as_deref(), Some("abc-123"));
        match inbound.message {
            ClientMessage::BroadcastTrack { session_id, track } => {
                assert_eq!(session_id, "s1");
                assert_eq!(track.artist, "X");
                assert_eq!(track.bpm, Some(124.0));
                assert!(track.features.is_none());
            },
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_server_message_tag() {
        let msg = ServerMessage::ListenerCount {
            session_id: "s1".to_string(),
            count: 42,
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed["type"], "LISTENER_COUNT");
        assert_eq!(parsed["sessionId"], "s1");
        assert_eq!(parsed["count"], 42);
    }

    #[test]
    fn test_tempo_preference_wire_format() {
        let json = r#"{"type": "SEND_TEMPO_REQUEST", "sessionId": "s1", "preference": "faster"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SendTempoRequest { preference, .. } => {
                assert_eq!(preference, TempoPreference::Faster);
            },
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_like_key_normalizes() {
        let a = Track {
            title: "Strasbourg St. Denis".to_string(),
            artist: "Roy Hargrove".to_string(),
            bpm: None,
            key: None,
            features: None,
        };
        let b = Track {
            title: "  strasbourg st. denis".to_string(),
            artist: "ROY HARGROVE ".to_string(),
            bpm: Some(104.0),
            key: Some("Gm".to_string()),
            features: None,
        };
        assert_eq!(a.like_key(), b.like_key());
    }

    #[test]
    fn test_announcement_expiry() {
        let ann = Announcement {
            message: "last song!".to_string(),
            created_at: 1_000,
            expires_at: Some(2_000),
        };
        assert!(!ann.is_expired(1_999));
        assert!(ann.is_expired(2_000));

        let open = Announcement {
            message: "welcome".to_string(),
            created_at: 1_000,
            expires_at: None,
        };
        assert!(!open.is_expired(u64::MAX));
    }
}
