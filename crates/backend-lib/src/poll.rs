// ============================
// pika-backend-lib/src/poll.rs
// ============================
//! Poll lifecycle: at most one active poll per session, per-client vote
//! dedup, and auto-expiry timers.
//!
//! State machine per poll: absent -> active (create) -> ended (manual end,
//! cancel, or timer fire — mutually exclusive, because every terminal
//! transition aborts the pending timer first). No transition back to
//! active; a new poll requires the session to have no active poll.

use crate::config::PollLimits;
use crate::error::AppError;
use crate::validation;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pika_common::{now_millis, PollId, PollSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

/// An active poll
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: PollId,
    pub session_id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Index-aligned with `options`
    pub votes: Vec<u32>,
    /// client ID -> chosen option index
    pub voters: HashMap<String, usize>,
    pub expires_at: Option<u64>,
}

impl Poll {
    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            poll_id: self.id,
            session_id: self.session_id.clone(),
            question: self.question.clone(),
            options: self.options.clone(),
            votes: self.votes.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Index of the option with the maximum vote count, ties broken by
    /// first occurrence. With zero votes this is 0 by convention.
    pub fn winner_index(&self) -> usize {
        let mut winner = 0;
        for (i, &count) in self.votes.iter().enumerate() {
            // strictly greater keeps the earliest index on ties
            if count > self.votes[winner] {
                winner = i;
            }
        }
        winner
    }
}

/// Final snapshot of an ended poll, ready for a results broadcast
#[derive(Debug, Clone)]
pub struct PollResult {
    pub poll: Poll,
    /// -1 when the poll was cancelled rather than ended
    pub winner_index: i32,
}

/// Lifecycle manager for all polls in the process
pub struct PollEngine {
    polls: DashMap<PollId, Poll>,
    /// session ID -> active poll ID, enforcing one active poll per session
    by_session: DashMap<String, PollId>,
    /// pending expiry timers, aborted on any terminal transition
    timers: DashMap<PollId, JoinHandle<()>>,
    next_id: AtomicU64,
    limits: PollLimits,
}

impl PollEngine {
    pub fn new(limits: PollLimits) -> Self {
        Self {
            polls: DashMap::new(),
            by_session: DashMap::new(),
            timers: DashMap::new(),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    /// Create a poll for the session. Fails if validation fails or a poll
    /// is already active for that session.
    pub fn create(
        &self,
        session_id: &str,
        question: &str,
        options: Vec<String>,
        duration_seconds: Option<u64>,
    ) -> Result<Poll, AppError> {
        validation::validate_poll_question(question, &self.limits)?;
        validation::validate_poll_options(&options, &self.limits)?;

        match self.by_session.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(AppError::PollActive),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let votes = vec![0; options.len()];
                let poll = Poll {
                    id,
                    session_id: session_id.to_string(),
                    question: question.to_string(),
                    options,
                    votes,
                    voters: HashMap::new(),
                    // client-supplied durations may be absurd; saturate
                    // instead of overflowing
                    expires_at: duration_seconds
                        .map(|d| now_millis().saturating_add(d.saturating_mul(1000))),
                };
                self.polls.insert(id, poll.clone());
                slot.insert(id);
                Ok(poll)
            },
        }
    }

    /// Record a client's vote. Idempotent in the sense that a repeat call
    /// from the same client returns `AlreadyVoted` without mutating state.
    /// Returns the updated poll for a POLL_UPDATE broadcast.
    pub fn vote(
        &self,
        poll_id: PollId,
        client_id: &str,
        option_index: usize,
    ) -> Result<Poll, AppError> {
        let mut poll = self
            .polls
            .get_mut(&poll_id)
            .ok_or(AppError::PollNotFound(poll_id))?;

        if poll.voters.contains_key(client_id) {
            return Err(AppError::AlreadyVoted);
        }
        if option_index >= poll.options.len() {
            return Err(AppError::InvalidOption);
        }

        poll.votes[option_index] += 1;
        poll.voters.insert(client_id.to_string(), option_index);
        Ok(poll.clone())
    }

    /// The session's active poll, if any (late-joiner sync)
    pub fn active_poll(&self, session_id: &str) -> Option<Poll> {
        let id = *self.by_session.get(session_id)?;
        self.polls.get(&id).map(|p| p.clone())
    }

    /// End the poll: abort any pending expiry timer, remove the poll from
    /// the table and the session index, and return the final results.
    /// Safe to race against the expiry timer — whichever path removes the
    /// poll first wins, the loser sees `None`.
    pub fn end(&self, poll_id: PollId) -> Option<PollResult> {
        let poll = self.remove_poll(poll_id)?;
        let winner_index = poll.winner_index() as i32;
        Some(PollResult { poll, winner_index })
    }

    /// Cancel the poll: same terminal transition as `end`, but results are
    /// reported all-zero with winner -1, so "no one voted" is not mistaken
    /// for "option 0 won".
    pub fn cancel(&self, poll_id: PollId) -> Option<PollResult> {
        let mut poll = self.remove_poll(poll_id)?;
        poll.votes.iter_mut().for_each(|v| *v = 0);
        Some(PollResult {
            poll,
            winner_index: -1,
        })
    }

    /// Attach an expiry timer task. Any previously armed timer for this
    /// poll ID is aborted first, preventing a double-end race.
    pub fn arm_expiry(&self, poll_id: PollId, handle: JoinHandle<()>) {
        if let Some(old) = self.timers.insert(poll_id, handle) {
            old.abort();
        }
    }

    /// End whatever poll is active for the session (session teardown)
    pub fn end_for_session(&self, session_id: &str) -> Option<PollResult> {
        let id = *self.by_session.get(session_id)?;
        self.end(id)
    }

    fn remove_poll(&self, poll_id: PollId) -> Option<Poll> {
        if let Some((_, timer)) = self.timers.remove(&poll_id) {
            timer.abort();
        }
        let (_, poll) = self.polls.remove(&poll_id)?;
        self.by_session.remove(&poll.session_id);
        Some(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> PollEngine {
        PollEngine::new(PollLimits::default())
    }

    fn options(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_validates_options() {
        let polls = engine();
        assert!(matches!(
            polls.create("s1", "Next?", options(&["only"]), None),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            polls.create("s1", "", options(&["A", "B"]), None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_one_active_poll_per_session() {
        let polls = engine();
        polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();
        assert!(matches!(
            polls.create("s1", "Another?", options(&["A", "B"]), None),
            Err(AppError::PollActive)
        ));
        // other sessions are unaffected
        assert!(polls.create("s2", "Next?", options(&["A", "B"]), None).is_ok());
    }

    #[test]
    fn test_vote_and_dedup() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();

        let updated = polls.vote(poll.id, "c1", 0).unwrap();
        assert_eq!(updated.votes, vec![1, 0]);

        // second vote from the same client never changes counts
        assert!(matches!(polls.vote(poll.id, "c1", 1), Err(AppError::AlreadyVoted)));
        assert_eq!(polls.active_poll("s1").unwrap().votes, vec![1, 0]);
    }

    #[test]
    fn test_vote_errors() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();

        assert!(matches!(polls.vote(999, "c1", 0), Err(AppError::PollNotFound(999))));
        assert!(matches!(polls.vote(poll.id, "c1", 2), Err(AppError::InvalidOption)));
        // the failed attempts did not consume the client's vote
        assert!(polls.vote(poll.id, "c1", 1).is_ok());
    }

    #[test]
    fn test_end_reports_winner_first_occurrence_tie() {
        let polls = engine();
        let poll = polls
            .create("s1", "Next?", options(&["A", "B", "C"]), None)
            .unwrap();
        polls.vote(poll.id, "c1", 1).unwrap();
        polls.vote(poll.id, "c2", 2).unwrap();

        let result = polls.end(poll.id).unwrap();
        // tie between B and C resolves to the first occurrence
        assert_eq!(result.winner_index, 1);
        assert_eq!(result.poll.votes, vec![0, 1, 1]);

        // the session can host a new poll now
        assert!(polls.active_poll("s1").is_none());
        assert!(polls.create("s1", "Again?", options(&["A", "B"]), None).is_ok());
    }

    #[test]
    fn test_create_with_huge_duration_saturates() {
        let polls = engine();
        let poll = polls
            .create("s1", "Next?", options(&["A", "B"]), Some(u64::MAX))
            .unwrap();
        assert_eq!(poll.expires_at, Some(u64::MAX));
    }

    #[test]
    fn test_end_with_zero_votes_defaults_to_index_zero() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();
        let result = polls.end(poll.id).unwrap();
        assert_eq!(result.winner_index, 0);
    }

    #[test]
    fn test_scenario_two_to_one() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();
        polls.vote(poll.id, "c1", 0).unwrap();
        polls.vote(poll.id, "c2", 0).unwrap();
        polls.vote(poll.id, "c3", 1).unwrap();

        let result = polls.end(poll.id).unwrap();
        assert_eq!(result.poll.votes, vec![2, 1]);
        assert_eq!(result.winner_index, 0);
    }

    #[test]
    fn test_cancel_reports_all_zero_and_no_winner() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();
        polls.vote(poll.id, "c1", 0).unwrap();

        let result = polls.cancel(poll.id).unwrap();
        assert_eq!(result.winner_index, -1);
        assert_eq!(result.poll.votes, vec![0, 0]);
        assert!(polls.active_poll("s1").is_none());
    }

    #[test]
    fn test_end_is_terminal() {
        let polls = engine();
        let poll = polls.create("s1", "Next?", options(&["A", "B"]), None).unwrap();
        assert!(polls.end(poll.id).is_some());
        assert!(polls.end(poll.id).is_none());
        assert!(polls.cancel(poll.id).is_none());
    }

    #[tokio::test]
    async fn test_manual_end_beats_expiry_timer() {
        let polls = std::sync::Arc::new(engine());
        let poll = polls
            .create("s1", "Next?", options(&["A", "B"]), Some(1))
            .unwrap();

        // timer that would fire the end path after a short delay
        let engine_for_timer = polls.clone();
        let poll_id = poll.id;
        let (fired_tx, fired_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = engine_for_timer.end(poll_id);
            let _ = fired_tx.send(result.is_some());
        });
        polls.arm_expiry(poll.id, handle);

        // manual end wins and aborts the timer
        assert!(polls.end(poll.id).is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the timer was aborted, so its result channel is dropped unsent
        assert!(fired_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_expiry_timer_end_wins_when_unopposed() {
        let polls = std::sync::Arc::new(engine());
        let poll = polls
            .create("s1", "Next?", options(&["A", "B"]), Some(1))
            .unwrap();

        let engine_for_timer = polls.clone();
        let poll_id = poll.id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine_for_timer.end(poll_id);
        });
        polls.arm_expiry(poll.id, handle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the timer fired; a later manual end sees nothing to do
        assert!(polls.end(poll.id).is_none());
    }
}
