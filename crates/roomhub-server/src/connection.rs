//! Per-connection state shared between the hub and the socket loops.

use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use roomhub_core::{ConnectionId, RoomId, UserSummary};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One serialized text frame. Cloning shares the underlying buffer, so the
/// hub encodes a broadcast once for all members.
pub type Frame = Utf8Bytes;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Producer side of a connection's bounded outbound queue.
///
/// Pushes never wait. Closing is idempotent and wakes the consumer, which
/// still drains frames that were queued before the close.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

/// Consumer side, owned by the connection's write loop.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

impl OutboundQueue {
    pub fn channel(capacity: usize) -> (OutboundQueue, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            OutboundQueue {
                tx,
                closed: closed.clone(),
            },
            OutboundReceiver { rx, closed },
        )
    }

    pub fn try_push(&self, frame: Frame) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Full),
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Frames currently waiting to be written.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboundReceiver {
    /// Next frame in FIFO order, or `None` once the queue is closed and empty.
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            () = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Next buffered frame without waiting.
    pub fn try_next(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// Last time the peer proved it was alive. Written by the read loop, read
/// by the heartbeat monitor.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// What the hub keeps per registered connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: UserSummary,
    pub room: RoomId,
    pub queue: OutboundQueue,
}

impl ConnectionHandle {
    pub fn new(user: UserSummary, room: RoomId, queue: OutboundQueue) -> Self {
        Self {
            id: ConnectionId::new(),
            user,
            room,
            queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Frame {
        Frame::from(s.to_string())
    }

    #[tokio::test]
    async fn frames_come_out_in_order() {
        let (queue, mut rx) = OutboundQueue::channel(4);
        queue.try_push(frame("a")).unwrap();
        queue.try_push(frame("b")).unwrap();
        assert_eq!(rx.next().await.unwrap().as_str(), "a");
        assert_eq!(rx.next().await.unwrap().as_str(), "b");
    }

    #[test]
    fn push_to_full_queue_fails_without_waiting() {
        let (queue, _rx) = OutboundQueue::channel(2);
        queue.try_push(frame("1")).unwrap();
        queue.try_push(frame("2")).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_push(frame("3")), Err(PushError::Full));
    }

    #[test]
    fn push_after_close_fails() {
        let (queue, _rx) = OutboundQueue::channel(2);
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.try_push(frame("x")), Err(PushError::Closed));
    }

    #[test]
    fn push_after_receiver_dropped_fails() {
        let (queue, rx) = OutboundQueue::channel(2);
        drop(rx);
        assert_eq!(queue.try_push(frame("x")), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn close_drains_buffered_then_ends() {
        let (queue, mut rx) = OutboundQueue::channel(4);
        queue.try_push(frame("last words")).unwrap();
        queue.close();
        assert_eq!(rx.next().await.unwrap().as_str(), "last words");
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiting_receiver() {
        let (queue, mut rx) = OutboundQueue::channel(4);
        let waiter = tokio::spawn(async move { rx.next().await });
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_tracks_elapsed_time() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(liveness.elapsed() >= Duration::from_secs(40));
        liveness.mark_alive();
        assert!(liveness.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn handles_get_distinct_ids() {
        let (queue, _rx) = OutboundQueue::channel(1);
        let user = UserSummary::new("u1".parse().unwrap(), "alice");
        let a = ConnectionHandle::new(user.clone(), RoomId::from_raw("r"), queue.clone());
        let b = ConnectionHandle::new(user, RoomId::from_raw("r"), queue);
        assert_ne!(a.id, b.id);
    }
}
