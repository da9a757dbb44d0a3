// ============================
// pika-backend-lib/src/broadcast.rs
// ============================
//! Fan-out hub and per-connection backpressure gate.
//!
//! Missed broadcasts are never buffered: a connection whose outstanding
//! bytes exceed the high-water mark is skipped, and that listener
//! reconciles on its next SUBSCRIBE resync. Liveness of the session wins
//! over completeness of any one client's history.

use crate::metrics::BROADCAST_SKIPPED;
use dashmap::DashMap;
use metrics::counter;
use pika_common::ServerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fan-out writes are skipped once a connection buffers more than this
pub const HIGH_WATER_MARK: usize = 64 * 1024;

pub type ConnId = u64;

/// Handle to one connected socket: the serialized-frame channel plus the
/// outstanding-byte counter maintained by the socket writer.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Outstanding bytes enqueued but not yet flushed to the socket
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// True unless the connection's outstanding buffered bytes exceed the
    /// high-water mark. Callers must check this immediately before any
    /// fan-out write and skip (not queue) the write when it is false.
    pub fn can_send(&self) -> bool {
        self.buffered_bytes() <= HIGH_WATER_MARK
    }

    /// Enqueue a serialized frame. Returns false if the connection's
    /// writer has gone away.
    pub fn enqueue(&self, payload: &str) -> bool {
        self.buffered.fetch_add(payload.len(), Ordering::AcqRel);
        if self.tx.send(payload.to_string()).is_err() {
            self.buffered.fetch_sub(payload.len(), Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Called by the socket writer after a frame reaches the socket
    pub fn mark_flushed(&self, bytes: usize) {
        self.buffered.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Serialize and enqueue a unicast message, ignoring the gate.
    /// Acknowledgments and sync replies must reach their one recipient.
    pub fn send(&self, msg: &ServerMessage) {
        if let Ok(payload) = serde_json::to_string(msg) {
            self.enqueue(&payload);
        }
    }
}

/// Maps a channel (session ID) to the connections subscribed to it
#[derive(Default)]
pub struct BroadcastHub {
    channels: DashMap<String, HashMap<ConnId, ConnectionHandle>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str, conn: ConnectionHandle) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn.id(), conn);
    }

    pub fn unsubscribe(&self, channel: &str, conn_id: ConnId) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.remove(&conn_id);
        }
    }

    /// Drop the whole channel (session end)
    pub fn drop_channel(&self, channel: &str) {
        self.channels.remove(channel);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Serialize once and fan out to every subscriber passing the gate.
    /// Returns the number of connections actually written to.
    pub fn publish(&self, channel: &str, msg: &ServerMessage) -> usize {
        let payload = match serde_json::to_string(msg) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize broadcast payload");
                return 0;
            },
        };

        let mut delivered = 0;
        if let Some(subs) = self.channels.get(channel) {
            for conn in subs.values() {
                if !conn.can_send() {
                    counter!(BROADCAST_SKIPPED).increment(1);
                    tracing::debug!(
                        channel,
                        conn_id = conn.id(),
                        buffered = conn.buffered_bytes(),
                        "skipping slow consumer"
                    );
                    continue;
                }
                if conn.enqueue(&payload) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnId) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(id, tx), rx)
    }

    #[test]
    fn test_can_send_threshold_is_inclusive() {
        let (conn, _rx) = handle(1);
        assert!(conn.can_send());

        // exactly at the high-water mark is still sendable
        conn.enqueue(&"x".repeat(HIGH_WATER_MARK));
        assert_eq!(conn.buffered_bytes(), 65536);
        assert!(conn.can_send());

        // one byte over trips the gate
        conn.enqueue("y");
        assert_eq!(conn.buffered_bytes(), 65537);
        assert!(!conn.can_send());

        // draining reopens it
        conn.mark_flushed(1);
        assert!(conn.can_send());
    }

    #[test]
    fn test_publish_skips_backpressured_connection() {
        let hub = BroadcastHub::new();
        let (fast, mut fast_rx) = handle(1);
        let (slow, mut slow_rx) = handle(2);
        slow.enqueue(&"x".repeat(HIGH_WATER_MARK + 1));
        let _ = slow_rx.try_recv(); // frame is queued, bytes still outstanding

        hub.subscribe("s1", fast.clone());
        hub.subscribe("s1", slow.clone());

        let msg = ServerMessage::ListenerCount {
            session_id: "s1".to_string(),
            count: 3,
        };
        let delivered = hub.publish("s1", &msg);

        assert_eq!(delivered, 1);
        assert!(fast_rx.try_recv().is_ok());
        // the slow consumer got nothing queued behind its backlog
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_and_drop_channel() {
        let hub = BroadcastHub::new();
        let (a, _rx_a) = handle(1);
        let (b, _rx_b) = handle(2);
        hub.subscribe("s1", a);
        hub.subscribe("s1", b);
        assert_eq!(hub.subscriber_count("s1"), 2);

        hub.unsubscribe("s1", 1);
        assert_eq!(hub.subscriber_count("s1"), 1);

        hub.drop_channel("s1");
        assert_eq!(hub.subscriber_count("s1"), 0);
    }

    #[test]
    fn test_publish_to_empty_channel() {
        let hub = BroadcastHub::new();
        let msg = ServerMessage::SessionEnded {
            session_id: "s1".to_string(),
        };
        assert_eq!(hub.publish("nobody", &msg), 0);
    }

    #[test]
    fn test_enqueue_to_closed_writer_rolls_back_bytes() {
        let (conn, rx) = handle(1);
        drop(rx);
        assert!(!conn.enqueue("hello"));
        assert_eq!(conn.buffered_bytes(), 0);
    }
}
