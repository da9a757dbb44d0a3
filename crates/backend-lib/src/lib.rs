// ============================
// pika-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the Pika! live-session server.
//!
//! Coordinates one publisher (the DJ) and many concurrent listeners over
//! persistent WebSocket connections: ephemeral session state, crowd
//! feedback aggregation, per-session serialized persistence, and gated
//! fan-out.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod feedback;
pub mod listeners;
pub mod metrics;
pub mod persist;
pub mod poll;
pub mod session;
pub mod storage;
pub mod validation;
pub mod websocket;
pub mod ws_router;

use crate::broadcast::BroadcastHub;
use crate::config::Settings;
use crate::feedback::{LikeTracker, TempoTracker};
use crate::listeners::ListenerTracker;
use crate::persist::PersistQueue;
use crate::poll::PollEngine;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
pub struct AppState<S> {
    /// Live session registry
    pub sessions: SessionRegistry,
    /// Sticky listener presence
    pub listeners: ListenerTracker,
    /// Per-client like dedup
    pub likes: LikeTracker,
    /// Tempo vote aggregates
    pub tempo: TempoTracker,
    /// Poll lifecycle manager
    pub polls: PollEngine,
    /// Per-session ordered durability queue
    pub persist: PersistQueue,
    /// Fan-out hub with backpressure gate
    pub hub: BroadcastHub,
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Storage backend
    pub storage: S,
}

impl<S> AppState<S> {
    /// Create a new application state
    pub fn new(storage: S, settings: &Settings) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            listeners: ListenerTracker::new(
                Duration::from_secs(settings.listener_grace_secs),
                Duration::from_millis(settings.count_cache_ms),
                Duration::from_secs(settings.listener_stale_secs),
            ),
            likes: LikeTracker::new(),
            tempo: TempoTracker::new(),
            polls: PollEngine::new(settings.poll.clone()),
            persist: PersistQueue::new(),
            hub: BroadcastHub::new(),
            settings: Arc::new(settings.clone()),
            storage,
        }
    }
}
