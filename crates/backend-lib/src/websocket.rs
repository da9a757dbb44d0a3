// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! Per-connection message handler.
//!
//! This module implements the session handler for the Pika! live-session
//! server. It provides functionality for:
//! - Session registration and ownership tracking
//! - Message handling for DJ and listener request types
//! - State fan-out to subscribed connections through the broadcast hub
//! - Durable-write ordering through the per-session persistence queue
//!
//! A `SessionHandler` is instantiated per-connection and manages the state
//! for a single client. It interacts with the shared application state to
//! coordinate between the DJ and all listeners of a session.
//!
//! # Fault boundary
//! `handle_message` returns `Err` for any fault; the router converts it to
//! a NACK for the originating connection (when the inbound frame carried a
//! correlation ID) and never tears the connection down. In-memory mutation
//! happens before the durability enqueue and the fan-out, so a storage
//! failure never rolls live state back.

use crate::broadcast::ConnectionHandle;
use crate::error::AppError;
use crate::metrics::{
    LIKE_RECORDED, POLL_CREATED, POLL_VOTE, SESSION_ENDED, SESSION_REGISTERED, TEMPO_VOTE,
    TRACK_BROADCAST,
};
use crate::poll::PollResult;
use crate::storage::Storage;
use crate::validation;
use crate::AppState;
use metrics::counter;
use pika_common::{
    now_millis, Announcement, ClientMessage, ServerMessage, TempoPreference, Track,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Per-connection handler mutating the shared registries
pub struct SessionHandler<S: Storage + Send + Sync + Clone + 'static> {
    state: Arc<AppState<S>>,
    conn: ConnectionHandle,
    /// Client identity: from SUBSCRIBE when provided, otherwise generated
    client_id: String,
    /// Session this connection registered as DJ
    owned_session: Option<String>,
    /// Session this connection subscribed to as a listener
    joined_session: Option<String>,
}

impl<S: Storage + Send + Sync + Clone + 'static> SessionHandler<S> {
    pub fn new(state: Arc<AppState<S>>, conn: ConnectionHandle) -> Self {
        Self {
            state,
            conn,
            client_id: Uuid::new_v4().to_string(),
            owned_session: None,
            joined_session: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn require_owner(&self, session_id: &str) -> Result<(), AppError> {
        if self.owned_session.as_deref() == Some(session_id) {
            Ok(())
        } else {
            Err(AppError::NotSessionOwner)
        }
    }

    /// Route one decoded inbound message to its handler.
    ///
    /// All registry reads and writes in here are synchronous; the only
    /// suspension points are durability completions that are explicitly
    /// awaited (session end) and the poll expiry timers spawned off this
    /// call.
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), AppError> {
        match msg {
            ClientMessage::RegisterSession {
                session_id,
                dj_name,
            } => self.handle_register(session_id, dj_name),
            ClientMessage::BroadcastTrack { session_id, track } => {
                self.handle_broadcast_track(&session_id, track)
            },
            ClientMessage::EndSession { session_id } => {
                self.require_owner(&session_id)?;
                self.end_session(&session_id).await?;
                self.owned_session = None;
                Ok(())
            },
            ClientMessage::Subscribe {
                session_id,
                client_id,
            } => self.handle_subscribe(session_id, client_id),
            ClientMessage::SendLike {
                session_id,
                track,
                client_id,
            } => self.handle_like(session_id, track, client_id),
            ClientMessage::SendTempoRequest {
                session_id,
                preference,
            } => self.handle_tempo(&session_id, preference),
            ClientMessage::SetAnnouncement {
                session_id,
                message,
                duration_seconds,
            } => self.handle_announcement(&session_id, message, duration_seconds),
            ClientMessage::StartPoll {
                session_id,
                question,
                options,
                duration_seconds,
            } => self.handle_start_poll(&session_id, &question, options, duration_seconds),
            ClientMessage::EndPoll {
                session_id,
                poll_id,
            } => self.handle_end_poll(&session_id, poll_id, PollClose::End),
            ClientMessage::CancelPoll {
                session_id,
                poll_id,
            } => self.handle_end_poll(&session_id, poll_id, PollClose::Cancel),
            ClientMessage::VoteOnPoll {
                poll_id,
                client_id,
                option_index,
            } => self.handle_poll_vote(poll_id, &client_id, option_index),
        }
    }

    fn handle_register(
        &mut self,
        session_id: Option<String>,
        dj_name: Option<String>,
    ) -> Result<(), AppError> {
        let session_id = match session_id {
            Some(id) => {
                validation::validate_session_id(&id)?;
                id
            },
            None => Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        let dj_name = dj_name.unwrap_or_else(|| "DJ".to_string());

        // one owned session per connection; re-registering it is a no-op
        if let Some(owned) = &self.owned_session {
            if *owned == session_id {
                return Ok(());
            }
            return Err(AppError::Conflict(
                "connection already owns a session".into(),
            ));
        }

        // ownership belongs to the connection that created the entry;
        // registering someone else's session ID grants nothing
        let (session, created) = self.state.sessions.register(&session_id, &dj_name);
        if !created {
            return Err(AppError::NotSessionOwner);
        }
        self.owned_session = Some(session.id.clone());
        self.state.hub.subscribe(&session.id, self.conn.clone());

        counter!(SESSION_REGISTERED).increment(1);
        tracing::info!(session = %session.id, dj = %session.dj_name, "session registered");
        Ok(())
    }

    fn handle_broadcast_track(&mut self, session_id: &str, track: Track) -> Result<(), AppError> {
        self.require_owner(session_id)?;
        if !self.state.sessions.set_current_track(session_id, track.clone()) {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        // a new track invalidates the crowd's tempo votes
        self.state.tempo.reset(session_id);

        let storage = self.state.storage.clone();
        let sid = session_id.to_string();
        let persisted = track.clone();
        let _ = self.state.persist.enqueue(session_id, async move {
            storage.persist_track(&sid, &persisted).await
        });

        self.state.hub.publish(
            session_id,
            &ServerMessage::NowPlaying {
                session_id: session_id.to_string(),
                track,
            },
        );
        counter!(TRACK_BROADCAST).increment(1);
        Ok(())
    }

    /// Tear down a session: fan out the final message, clear every
    /// aggregator, enqueue the archival write, then discard the queue.
    /// The archival task is awaited so it is not abandoned by cleanup.
    async fn end_session(&mut self, session_id: &str) -> Result<(), AppError> {
        if !self.state.sessions.end(session_id) {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        // active poll dies with the session, no results broadcast
        self.state.polls.end_for_session(session_id);
        self.state.likes.clear_session(session_id);
        self.state.tempo.reset(session_id);
        self.state.listeners.clear_session(session_id);

        self.state.hub.publish(
            session_id,
            &ServerMessage::SessionEnded {
                session_id: session_id.to_string(),
            },
        );
        self.state.hub.drop_channel(session_id);

        let storage = self.state.storage.clone();
        let sid = session_id.to_string();
        let done = self
            .state
            .persist
            .enqueue(session_id, async move { storage.end_session(&sid).await });
        // FIFO: everything enqueued earlier lands before the archive
        if let Ok(Err(e)) = done.await {
            tracing::warn!(session = session_id, error = %e, "session archive failed");
        }
        self.state.persist.cleanup(session_id);

        counter!(SESSION_ENDED).increment(1);
        tracing::info!(session = session_id, "session ended");
        Ok(())
    }

    fn handle_subscribe(
        &mut self,
        session_id: Option<String>,
        client_id: Option<String>,
    ) -> Result<(), AppError> {
        let session_id =
            session_id.ok_or_else(|| AppError::Validation("sessionId is required".into()))?;
        if let Some(id) = client_id {
            validation::validate_client_id(&id)?;
            self.client_id = id;
        }

        let session = self
            .state
            .sessions
            .get(&session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.clone()))?;

        // a repeat SUBSCRIBE on the same connection is a resync request,
        // not a second presence: the refcount must track open connections
        let resync = self.joined_session.as_deref() == Some(session_id.as_str());
        if !resync {
            if let Some(old) = self.joined_session.take() {
                self.state.listeners.remove(&old, &self.client_id);
                self.state.hub.unsubscribe(&old, self.conn.id());
            }
            self.state.hub.subscribe(&session_id, self.conn.clone());
            self.joined_session = Some(session_id.clone());

            let is_new = self.state.listeners.add(&session_id, &self.client_id);
            if is_new {
                let count = self.state.listeners.count(&session_id);
                self.state.hub.publish(
                    &session_id,
                    &ServerMessage::ListenerCount {
                        session_id: session_id.clone(),
                        count,
                    },
                );
            }
        }
        let count = self.state.listeners.count(&session_id);

        // late-joiner sync: unicast the state this listener missed
        if let Some(track) = session.current_track {
            self.conn.send(&ServerMessage::NowPlaying {
                session_id: session_id.clone(),
                track,
            });
        }
        if let Some(ann) = session.announcement {
            if !ann.is_expired(now_millis()) {
                self.conn.send(&ServerMessage::Announcement {
                    session_id: session_id.clone(),
                    announcement: Some(ann),
                });
            }
        }
        if let Some(poll) = self.state.polls.active_poll(&session_id) {
            self.conn.send(&ServerMessage::PollStarted {
                poll: poll.snapshot(),
            });
        }
        self.conn.send(&ServerMessage::ListenerCount {
            session_id,
            count,
        });
        Ok(())
    }

    fn handle_like(
        &mut self,
        session_id: Option<String>,
        track: Track,
        client_id: String,
    ) -> Result<(), AppError> {
        let session_id =
            session_id.ok_or_else(|| AppError::Validation("sessionId is required".into()))?;
        if !self.state.sessions.contains(&session_id) {
            return Err(AppError::SessionNotFound(session_id));
        }

        if self.state.likes.has(&session_id, &client_id, &track) {
            return Err(AppError::Conflict("track already liked".into()));
        }
        self.state.likes.record(&session_id, &client_id, &track);

        let storage = self.state.storage.clone();
        let sid = session_id.clone();
        let cid = client_id.clone();
        let persisted = track.clone();
        let _ = self.state.persist.enqueue(&session_id, async move {
            storage.persist_like(&sid, &cid, &persisted).await
        });

        self.state.hub.publish(
            &session_id,
            &ServerMessage::LikeReceived {
                session_id: session_id.clone(),
                track,
                client_id,
            },
        );
        counter!(LIKE_RECORDED).increment(1);
        Ok(())
    }

    fn handle_tempo(
        &mut self,
        session_id: &str,
        preference: TempoPreference,
    ) -> Result<(), AppError> {
        if !self.state.sessions.contains(session_id) {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        self.state.tempo.vote(session_id, &self.client_id, preference);
        let feedback = self.state.tempo.feedback(session_id);

        let storage = self.state.storage.clone();
        let sid = session_id.to_string();
        let _ = self.state.persist.enqueue(session_id, async move {
            storage.persist_tempo_votes(&sid, &feedback).await
        });

        self.state.hub.publish(
            session_id,
            &ServerMessage::TempoFeedback {
                session_id: session_id.to_string(),
                feedback,
            },
        );
        counter!(TEMPO_VOTE).increment(1);
        Ok(())
    }

    fn handle_announcement(
        &mut self,
        session_id: &str,
        message: Option<String>,
        duration_seconds: Option<u64>,
    ) -> Result<(), AppError> {
        self.require_owner(session_id)?;

        let announcement = match message {
            Some(text) => {
                if text.trim().is_empty() {
                    return Err(AppError::Validation("announcement must not be empty".into()));
                }
                if text.len() > 500 {
                    return Err(AppError::Validation(
                        "announcement exceeds 500 characters".into(),
                    ));
                }
                let now = now_millis();
                Some(Announcement {
                    message: text,
                    created_at: now,
                    // saturate: a huge duration means "never expires"
                    expires_at: duration_seconds
                        .map(|d| now.saturating_add(d.saturating_mul(1000))),
                })
            },
            None => None,
        };

        if !self
            .state
            .sessions
            .set_announcement(session_id, announcement.clone())
        {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        self.state.hub.publish(
            session_id,
            &ServerMessage::Announcement {
                session_id: session_id.to_string(),
                announcement,
            },
        );
        Ok(())
    }

    fn handle_start_poll(
        &mut self,
        session_id: &str,
        question: &str,
        options: Vec<String>,
        duration_seconds: Option<u64>,
    ) -> Result<(), AppError> {
        self.require_owner(session_id)?;
        if !self.state.sessions.contains(session_id) {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        let poll = self
            .state
            .polls
            .create(session_id, question, options, duration_seconds)?;

        self.state.hub.publish(
            session_id,
            &ServerMessage::PollStarted {
                poll: poll.snapshot(),
            },
        );

        let storage = self.state.storage.clone();
        let sid = session_id.to_string();
        let snapshot = poll.snapshot();
        let _ = self.state.persist.enqueue(session_id, async move {
            storage.create_poll(&sid, &snapshot).await
        });

        if let Some(secs) = duration_seconds.filter(|s| *s > 0) {
            let state = self.state.clone();
            let poll_id = poll.id;
            let sid = session_id.to_string();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                // the manual end path may have won; then there is nothing
                // left to report
                if let Some(result) = state.polls.end(poll_id) {
                    publish_poll_result(&state, &result);
                    enqueue_close_poll(&state, &sid, &result);
                }
            });
            self.state.polls.arm_expiry(poll.id, handle);
        }

        counter!(POLL_CREATED).increment(1);
        Ok(())
    }

    fn handle_end_poll(
        &mut self,
        session_id: &str,
        poll_id: u64,
        close: PollClose,
    ) -> Result<(), AppError> {
        self.require_owner(session_id)?;
        match self.state.polls.active_poll(session_id) {
            Some(active) if active.id == poll_id => {},
            _ => return Err(AppError::PollNotFound(poll_id)),
        }

        let result = match close {
            PollClose::End => self.state.polls.end(poll_id),
            PollClose::Cancel => self.state.polls.cancel(poll_id),
        }
        .ok_or(AppError::PollNotFound(poll_id))?;

        publish_poll_result(&self.state, &result);
        enqueue_close_poll(&self.state, session_id, &result);
        Ok(())
    }

    fn handle_poll_vote(
        &mut self,
        poll_id: u64,
        client_id: &str,
        option_index: usize,
    ) -> Result<(), AppError> {
        let poll = self.state.polls.vote(poll_id, client_id, option_index)?;

        let storage = self.state.storage.clone();
        let sid = poll.session_id.clone();
        let cid = client_id.to_string();
        let _ = self.state.persist.enqueue(&poll.session_id, async move {
            storage.record_vote(&sid, poll_id, &cid, option_index).await
        });

        self.state.hub.publish(
            &poll.session_id,
            &ServerMessage::PollUpdate {
                poll: poll.snapshot(),
            },
        );
        counter!(POLL_VOTE).increment(1);
        Ok(())
    }

    /// Connection teardown, driven by the socket loop. A listener drop is
    /// absorbed by the sticky window; an abrupt DJ drop ends the session.
    pub async fn handle_disconnect(&mut self) {
        if let Some(session_id) = self.joined_session.take() {
            self.state.listeners.remove(&session_id, &self.client_id);
            self.state.hub.unsubscribe(&session_id, self.conn.id());
        }
        if let Some(session_id) = self.owned_session.take() {
            if let Err(e) = self.end_session(&session_id).await {
                tracing::warn!(session = %session_id, error = %e, "teardown after DJ disconnect failed");
            }
        }
    }
}

/// Manual end reports real counts; cancel reports all-zero with no winner.
enum PollClose {
    End,
    Cancel,
}

fn publish_poll_result<S>(state: &AppState<S>, result: &PollResult) {
    state.hub.publish(
        &result.poll.session_id,
        &ServerMessage::PollEnded {
            poll_id: result.poll.id,
            session_id: result.poll.session_id.clone(),
            question: result.poll.question.clone(),
            options: result.poll.options.clone(),
            votes: result.poll.votes.clone(),
            winner_index: result.winner_index,
        },
    );
}

fn enqueue_close_poll<S: Storage + Send + Sync + Clone + 'static>(
    state: &AppState<S>,
    session_id: &str,
    result: &PollResult,
) {
    let storage = state.storage.clone();
    let sid = session_id.to_string();
    let poll_id = result.poll.id;
    let votes = result.poll.votes.clone();
    let _ = state.persist.enqueue(session_id, async move {
        storage.close_poll(&sid, poll_id, &votes).await
    });
}
