// ============================
// pika-backend-lib/src/storage.rs
// ============================
//! Storage abstraction with flat-file implementation.
//!
//! Durable storage is a best-effort audit trail: every method is
//! idempotent or safely retryable, and is invoked only from inside
//! persistence-queue tasks. In-memory state stays the source of truth for
//! live behavior.
use crate::error::AppError;
use async_trait::async_trait;
use pika_common::{PollId, PollSnapshot, TempoCounts, Track};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};

/// Trait for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Record a track broadcast
    async fn persist_track(&self, session_id: &str, track: &Track) -> Result<(), AppError>;

    /// Record a like
    async fn persist_like(
        &self,
        session_id: &str,
        client_id: &str,
        track: &Track,
    ) -> Result<(), AppError>;

    /// Record the current tempo aggregate
    async fn persist_tempo_votes(
        &self,
        session_id: &str,
        feedback: &TempoCounts,
    ) -> Result<(), AppError>;

    /// Record poll creation
    async fn create_poll(&self, session_id: &str, poll: &PollSnapshot) -> Result<(), AppError>;

    /// Record a poll vote
    async fn record_vote(
        &self,
        session_id: &str,
        poll_id: PollId,
        client_id: &str,
        option_index: usize,
    ) -> Result<(), AppError>;

    /// Record poll closure with final counts
    async fn close_poll(
        &self,
        session_id: &str,
        poll_id: PollId,
        votes: &[u32],
    ) -> Result<(), AppError>;

    /// Archive an ended session
    async fn end_session(&self, session_id: &str) -> Result<(), AppError>;
}

/// Flat-file implementation of the Storage trait: JSON lines per session
/// under `current-sessions/`, moved to `ended-sessions/` on session end.
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("current-sessions"))?;
        fs::create_dir_all(root.join("ended-sessions"))?;
        Ok(Self { root })
    }

    fn session_file(&self, session_id: &str, file: &str) -> PathBuf {
        self.root
            .join("current-sessions")
            .join(session_id)
            .join(file)
    }

    /// Append a JSON line to one of the session's log files
    async fn append_line(
        &self,
        session_id: &str,
        file: &str,
        value: &serde_json::Value,
    ) -> Result<(), AppError> {
        let path = self.session_file(session_id, file);

        // ensure directory exists
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(AppError::from)?;

        file.write_all(serde_json::to_string(value)?.as_bytes())
            .await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FlatFileStorage {
    async fn persist_track(&self, session_id: &str, track: &Track) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "tracks.log",
            &json!({ "at": pika_common::now_millis(), "track": track }),
        )
        .await
    }

    async fn persist_like(
        &self,
        session_id: &str,
        client_id: &str,
        track: &Track,
    ) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "likes.log",
            &json!({
                "at": pika_common::now_millis(),
                "clientId": client_id,
                "track": track,
            }),
        )
        .await
    }

    async fn persist_tempo_votes(
        &self,
        session_id: &str,
        feedback: &TempoCounts,
    ) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "tempo.log",
            &json!({ "at": pika_common::now_millis(), "feedback": feedback }),
        )
        .await
    }

    async fn create_poll(&self, session_id: &str, poll: &PollSnapshot) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "polls.log",
            &json!({ "event": "created", "poll": poll }),
        )
        .await
    }

    async fn record_vote(
        &self,
        session_id: &str,
        poll_id: PollId,
        client_id: &str,
        option_index: usize,
    ) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "polls.log",
            &json!({
                "event": "vote",
                "pollId": poll_id,
                "clientId": client_id,
                "optionIndex": option_index,
            }),
        )
        .await
    }

    async fn close_poll(
        &self,
        session_id: &str,
        poll_id: PollId,
        votes: &[u32],
    ) -> Result<(), AppError> {
        self.append_line(
            session_id,
            "polls.log",
            &json!({ "event": "closed", "pollId": poll_id, "votes": votes }),
        )
        .await
    }

    /// Move the session directory from current to ended. A session that
    /// never persisted anything has no directory; that is not an error.
    async fn end_session(&self, session_id: &str) -> Result<(), AppError> {
        let src = self.root.join("current-sessions").join(session_id);
        let dst = self.root.join("ended-sessions").join(session_id);

        if src.exists() {
            tokio_fs::rename(src, dst).await?;
        }

        Ok(())
    }
}
