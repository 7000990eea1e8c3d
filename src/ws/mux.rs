//! Attachment list and event fan-out
//!
//! One session, N WebSocket clients. Each attachment owns a bounded
//! outbound queue consumed by a single writer task, which gives every
//! socket exactly one logical writer and lets the broadcaster enqueue
//! without ever blocking on a slow client. The attachment list itself is
//! snapshot-copied under a read lock before dispatch; registration and
//! removal take the write lock only to swap pointers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerEvent;
use crate::session::types::AccessLevel;

/// Outbound queue depth per socket. A client that falls this far behind
/// is treated as dead.
const OUT_QUEUE_CAPACITY: usize = 256;

/// Consecutive failed enqueues before a socket is force-detached.
const SEND_FAILURE_BUDGET: u32 = 3;

/// Message for the per-socket writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized wire frame
    Frame(Arc<str>),
    /// Keep-alive ping
    Ping,
    /// Close the socket and stop the writer
    Close,
}

/// One live WebSocket bound to a session.
pub struct Attachment {
    pub id: String,
    pub remote_addr: String,
    pub access: AccessLevel,
    pub attached_at: DateTime<Utc>,
    out_tx: mpsc::Sender<Outbound>,
    send_failures: AtomicU32,
}

impl Attachment {
    /// Create an attachment plus the receiver for its writer task.
    pub fn new(remote_addr: String, access: AccessLevel) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                id: uuid::Uuid::new_v4().to_string(),
                remote_addr,
                access,
                attached_at: Utc::now(),
                out_tx,
                send_failures: AtomicU32::new(0),
            }),
            out_rx,
        )
    }

    /// Enqueue a pre-serialized frame. Returns false once the socket has
    /// exhausted its failure budget or the writer is gone.
    pub fn send_frame(&self, frame: Arc<str>) -> bool {
        match self.out_tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => {
                self.send_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let failures = self.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Outbound queue full for client {} ({} consecutive)",
                    self.remote_addr, failures
                );
                failures < SEND_FAILURE_BUDGET
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize and enqueue a single event for this socket only.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        self.send_frame(Arc::from(event.to_wire()))
    }

    /// Enqueue a keep-alive ping.
    pub fn send_ping(&self) -> bool {
        self.out_tx.try_send(Outbound::Ping).is_ok()
    }

    /// Ask the writer task to close the socket.
    pub fn request_close(&self) {
        let _ = self.out_tx.try_send(Outbound::Close);
    }
}

/// The set of clients attached to one session.
#[derive(Default)]
pub struct Attachments {
    list: RwLock<Vec<Arc<Attachment>>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, attachment: Arc<Attachment>) {
        self.list.write().push(attachment);
    }

    /// Remove by attachment id. Idempotent: removing an id twice (or an
    /// id that never registered) is a no-op.
    pub fn unregister(&self, id: &str) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|a| a.id != id);
        before != list.len()
    }

    /// Copy of the current list; dispatch happens on the copy so no
    /// socket I/O runs under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Attachment>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Attachment>> {
        self.list.read().iter().find(|a| a.id == id).cloned()
    }

    /// Fan one event out to every attachment.
    pub fn broadcast(&self, event: &ServerEvent) {
        self.dispatch(event, None);
    }

    /// Fan out to everyone except `exclude` (typically the initiator,
    /// who receives its own confirmation instead).
    pub fn broadcast_except(&self, exclude: &str, event: &ServerEvent) {
        self.dispatch(event, Some(exclude));
    }

    fn dispatch(&self, event: &ServerEvent, exclude: Option<&str>) {
        let targets = self.snapshot();
        if targets.is_empty() {
            return;
        }

        // Serialize once, share across sockets
        let frame: Arc<str> = Arc::from(event.to_wire());
        let mut dead = Vec::new();

        for attachment in &targets {
            if exclude == Some(attachment.id.as_str()) {
                continue;
            }
            if !attachment.send_frame(frame.clone()) {
                dead.push(attachment.clone());
            }
        }

        // Slow or gone sockets are detached; peers are unaffected
        for attachment in dead {
            warn!(
                "Detaching unresponsive client {} ({})",
                attachment.remote_addr, attachment.id
            );
            self.unregister(&attachment.id);
            attachment.request_close();
        }
    }

    /// Detach every client, asking each writer to close its socket.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut list = self.list.write();
            std::mem::take(&mut *list)
        };
        for attachment in drained {
            attachment.request_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::StatusKind;

    fn make_attachment(access: AccessLevel) -> (Arc<Attachment>, mpsc::Receiver<Outbound>) {
        Attachment::new("10.0.0.1:50000".to_string(), access)
    }

    #[test]
    fn register_unregister_is_idempotent() {
        let attachments = Attachments::new();
        let (att, _rx) = make_attachment(AccessLevel::Owner);

        attachments.register(att.clone());
        assert_eq!(attachments.len(), 1);

        assert!(attachments.unregister(&att.id));
        assert!(!attachments.unregister(&att.id));
        assert!(attachments.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_attachments() {
        let attachments = Attachments::new();
        let (a, mut rx_a) = make_attachment(AccessLevel::Owner);
        let (b, mut rx_b) = make_attachment(AccessLevel::Collaborator);
        attachments.register(a);
        attachments.register(b);

        attachments.broadcast(&ServerEvent::status(StatusKind::Connected, "ready"));

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Outbound::Frame(frame) => assert!(frame.contains("connected")),
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_except_skips_initiator() {
        let attachments = Attachments::new();
        let (a, mut rx_a) = make_attachment(AccessLevel::Owner);
        let (b, mut rx_b) = make_attachment(AccessLevel::Collaborator);
        let a_id = a.id.clone();
        attachments.register(a);
        attachments.register(b);

        attachments.broadcast_except(
            &a_id,
            &ServerEvent::session_event("client_disconnected", "c1"),
        );

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv().unwrap(), Outbound::Frame(_)));
    }

    #[tokio::test]
    async fn slow_client_is_detached_without_affecting_peers() {
        let attachments = Attachments::new();
        let (slow, _slow_rx) = make_attachment(AccessLevel::Collaborator);
        let (fast, mut fast_rx) = make_attachment(AccessLevel::Owner);
        attachments.register(slow);
        attachments.register(fast.clone());

        // The slow client's queue is never drained; saturate it and then
        // exhaust its failure budget.
        let flood = OUT_QUEUE_CAPACITY + SEND_FAILURE_BUDGET as usize + 1;
        for _ in 0..flood {
            attachments.broadcast(&ServerEvent::TerminalOutput {
                data: "x".repeat(64),
            });
            // The fast client is being read; the slow one never is
            while fast_rx.try_recv().is_ok() {}
        }

        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments.snapshot()[0].id, fast.id);

        // The surviving client still receives frames
        attachments.broadcast(&ServerEvent::status(StatusKind::Connected, "still here"));
        assert!(matches!(fast_rx.try_recv().unwrap(), Outbound::Frame(_)));
    }
}
