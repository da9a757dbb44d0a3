// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const SESSION_REGISTERED: &str = "session.registered";
pub const SESSION_ENDED: &str = "session.ended";
pub const TRACK_BROADCAST: &str = "track.broadcast";
pub const LIKE_RECORDED: &str = "like.recorded";
pub const TEMPO_VOTE: &str = "tempo.vote";
pub const POLL_CREATED: &str = "poll.created";
pub const POLL_VOTE: &str = "poll.vote";
pub const BROADCAST_SKIPPED: &str = "broadcast.skipped";
pub const PERSIST_FAILED: &str = "persist.failed";
