//! The hub: single owner of room membership and the only fan-out path.
//!
//! State lives inside one task. Everything else talks to it through
//! [`HubHandle`]. Register, unregister and broadcast share one bounded
//! request channel, so the hub applies them in the order they were sent; a
//! separate channel carries read-only queries. The loop handles one request
//! at a time, which gives every room a total order over joins, leaves and
//! broadcasts.

use std::collections::VecDeque;
use std::sync::Arc;

use roomhub_core::{
    ConnectionId, Envelope, Event, MessageStore, PresenceCache, RoomId, StoredMessage, UserSummary,
};
use roomhub_telemetry::MetricsRecorder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionHandle, Frame, PushError};
use crate::error::ServerError;
use crate::metrics as m;
use crate::presence::{presence_envelope, PresenceBridge, PresenceChange, PresenceTransition};
use crate::registry::{RoomRegistry, RoomSummary};

/// An envelope addressed to every member of one room.
#[derive(Clone, Debug)]
pub struct Broadcast {
    pub room: RoomId,
    pub envelope: Envelope,
}

/// Counts reported by [`HubHandle::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
}

/// Membership and fan-out requests, applied strictly in arrival order.
#[derive(Debug)]
enum HubRequest {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Broadcast(Broadcast),
}

/// Read-only questions answered from inside the loop.
#[derive(Debug)]
enum HubQuery {
    Rooms(oneshot::Sender<Vec<RoomSummary>>),
    OnlineUsers(RoomId, oneshot::Sender<Vec<UserSummary>>),
    Stats(oneshot::Sender<HubStats>),
}

/// External services the hub notifies. Both are optional.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub store: Option<Arc<dyn MessageStore>>,
    pub presence: Option<Arc<dyn PresenceCache>>,
}

/// Send-only capability for talking to the hub. Cheap to clone.
#[derive(Clone, Debug)]
pub struct HubHandle {
    request_tx: mpsc::Sender<HubRequest>,
    query_tx: mpsc::Sender<HubQuery>,
}

impl HubHandle {
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), ServerError> {
        self.send(HubRequest::Register(conn)).await
    }

    /// Never fails: if the hub is gone there is nothing left to leave.
    pub async fn unregister(&self, id: ConnectionId) {
        if self.send(HubRequest::Unregister(id)).await.is_err() {
            trace!("unregister after hub shutdown");
        }
    }

    pub async fn broadcast(&self, room: RoomId, envelope: Envelope) -> Result<(), ServerError> {
        self.send(HubRequest::Broadcast(Broadcast { room, envelope }))
            .await
    }

    async fn send(&self, request: HubRequest) -> Result<(), ServerError> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| ServerError::HubClosed)
    }

    pub async fn rooms(&self) -> Result<Vec<RoomSummary>, ServerError> {
        self.ask(HubQuery::Rooms).await
    }

    pub async fn online_users(&self, room: RoomId) -> Result<Vec<UserSummary>, ServerError> {
        self.ask(|tx| HubQuery::OnlineUsers(room, tx)).await
    }

    pub async fn stats(&self) -> Result<HubStats, ServerError> {
        self.ask(HubQuery::Stats).await
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HubQuery) -> Result<T, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(make(tx))
            .await
            .map_err(|_| ServerError::HubClosed)?;
        rx.await.map_err(|_| ServerError::HubClosed)
    }
}

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Departure {
    Disconnected,
    SlowConsumer,
}

impl Departure {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::SlowConsumer => "slow_consumer",
        }
    }
}

/// Result of pushing one envelope into every member queue of a room.
#[derive(Debug, Default)]
struct FanOut {
    delivered: usize,
    failed: Vec<ConnectionId>,
}

pub struct Hub {
    registry: RoomRegistry,
    request_rx: mpsc::Receiver<HubRequest>,
    query_rx: mpsc::Receiver<HubQuery>,
    collaborators: Collaborators,
    presence_tx: Option<mpsc::UnboundedSender<PresenceTransition>>,
    presence_rx: Option<mpsc::UnboundedReceiver<PresenceTransition>>,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
}

impl Hub {
    /// Create the hub and its handle. The request and query channels each
    /// hold up to `channel_capacity` pending messages.
    pub fn new(
        channel_capacity: usize,
        collaborators: Collaborators,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
    ) -> (Hub, HubHandle) {
        let capacity = channel_capacity.max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(capacity);
        let (presence_tx, presence_rx) = if collaborators.presence.is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let hub = Hub {
            registry: RoomRegistry::new(),
            request_rx,
            query_rx,
            collaborators,
            presence_tx,
            presence_rx,
            metrics,
            cancel,
        };
        let handle = HubHandle {
            request_tx,
            query_tx,
        };
        (hub, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process requests until cancelled or every handle is dropped. On exit
    /// all remaining outbound queues are closed.
    pub async fn run(mut self) {
        info!("hub started");
        if let (Some(cache), Some(rx)) =
            (self.collaborators.presence.clone(), self.presence_rx.take())
        {
            tokio::spawn(PresenceBridge::new(rx, cache).run());
        }
        loop {
            // Requests go before queries so a query observes every request
            // its sender issued earlier.
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                req = self.request_rx.recv() => match req {
                    Some(HubRequest::Register(conn)) => self.handle_register(conn),
                    Some(HubRequest::Unregister(id)) => self.handle_unregister(&id),
                    Some(HubRequest::Broadcast(b)) => self.handle_broadcast(b),
                    None => break,
                },
                req = self.query_rx.recv() => match req {
                    Some(q) => self.handle_query(q),
                    None => break,
                },
            }
        }

        let remaining = self.registry.drain();
        for conn in &remaining {
            conn.queue.close();
        }
        self.update_gauges();
        info!(closed = remaining.len(), "hub stopped");
    }

    fn handle_register(&mut self, conn: ConnectionHandle) {
        let id = conn.id.clone();
        let room = conn.room.clone();
        let user = conn.user.clone();

        if !self.registry.insert(conn) {
            warn!(conn_id = %id, "connection already registered, ignoring");
            return;
        }
        self.metrics.counter_inc(m::WS_CONNECTIONS_TOTAL, 1);
        self.update_gauges();
        info!(
            conn_id = %id,
            user_id = %user.id,
            room_id = %room,
            members = self.registry.room_size(&room),
            "joined room"
        );

        self.notify_presence(PresenceTransition::Online(room.clone(), user.clone()));

        let envelope = presence_envelope(&self.registry, PresenceChange::Joined, &room, user);
        self.deliver(room, envelope);
    }

    fn handle_unregister(&mut self, id: &ConnectionId) {
        if let Some(left) = self.remove_connection(id, Departure::Disconnected) {
            self.deliver(left.room, left.envelope);
        } else {
            trace!(conn_id = %id, "unregister of absent connection");
        }
    }

    fn handle_broadcast(&mut self, broadcast: Broadcast) {
        self.metrics.counter_inc(m::HUB_BROADCASTS_TOTAL, 1);
        let persist = match &broadcast.envelope.event {
            Event::Message(msg) if self.registry.contains_room(&broadcast.room) => {
                Some(StoredMessage::from_chat(msg, broadcast.envelope.timestamp))
            }
            _ => None,
        };

        self.deliver(broadcast.room, broadcast.envelope);

        if let (Some(message), Some(store)) = (persist, self.collaborators.store.clone()) {
            tokio::spawn(async move {
                if let Err(e) = store.save(message).await {
                    warn!(error = %e, "message persistence failed");
                }
            });
        }
    }

    fn handle_query(&self, query: HubQuery) {
        // A dropped receiver just means the asker gave up.
        match query {
            HubQuery::Rooms(reply) => {
                let _ = reply.send(self.registry.rooms());
            }
            HubQuery::OnlineUsers(room, reply) => {
                let _ = reply.send(self.registry.online_users(&room));
            }
            HubQuery::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.connection_count(),
            rooms: self.registry.room_count(),
        }
    }

    /// Fan out `envelope`, then keep going with the `user_left` notices of
    /// any member evicted along the way until nothing more is evicted.
    fn deliver(&mut self, room: RoomId, envelope: Envelope) {
        let mut pending = VecDeque::from([Broadcast { room, envelope }]);
        while let Some(next) = pending.pop_front() {
            let outcome = self.fan_out(&next.room, &next.envelope);
            for id in outcome.failed {
                if let Some(left) = self.remove_connection(&id, Departure::SlowConsumer) {
                    pending.push_back(left);
                }
            }
        }
    }

    /// Push one frame into each member queue without waiting. Members whose
    /// queue is full or closed are reported back, not removed here.
    fn fan_out(&self, room: &RoomId, envelope: &Envelope) -> FanOut {
        if !self.registry.contains_room(room) {
            debug!(room_id = %room, event = %envelope.kind(), "no such room, dropping broadcast");
            self.metrics.counter_inc(m::HUB_DROPPED_BROADCASTS_TOTAL, 1);
            return FanOut::default();
        }

        let frame = match envelope.encode() {
            Ok(text) => Frame::from(text),
            Err(e) => {
                warn!(room_id = %room, error = %e, "failed to encode envelope, dropping broadcast");
                self.metrics.counter_inc(m::HUB_DROPPED_BROADCASTS_TOTAL, 1);
                return FanOut::default();
            }
        };

        let mut outcome = FanOut::default();
        for member in self.registry.members(room) {
            match member.queue.try_push(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(PushError::Full) => {
                    warn!(conn_id = %member.id, room_id = %room, "outbound queue full, evicting");
                    outcome.failed.push(member.id.clone());
                }
                Err(PushError::Closed) => {
                    debug!(conn_id = %member.id, room_id = %room, "outbound queue closed, removing");
                    outcome.failed.push(member.id.clone());
                }
            }
        }
        self.metrics
            .counter_inc(m::HUB_FRAMES_DELIVERED_TOTAL, outcome.delivered as u64);
        trace!(
            room_id = %room,
            event = %envelope.kind(),
            delivered = outcome.delivered,
            failed = outcome.failed.len(),
            "fan-out"
        );
        outcome
    }

    /// Remove a connection and close its queue. Returns the `user_left`
    /// broadcast to send, or `None` if it was not registered.
    fn remove_connection(&mut self, id: &ConnectionId, why: Departure) -> Option<Broadcast> {
        let conn = self.registry.remove(id)?;
        conn.queue.close();

        self.metrics.counter_inc(m::WS_DISCONNECTIONS_TOTAL, 1);
        if why == Departure::SlowConsumer {
            self.metrics.counter_inc(m::HUB_EVICTIONS_TOTAL, 1);
        }
        self.update_gauges();
        info!(
            conn_id = %conn.id,
            user_id = %conn.user.id,
            room_id = %conn.room,
            reason = why.as_str(),
            members = self.registry.room_size(&conn.room),
            "left room"
        );

        if !self.registry.user_in_room(&conn.room, &conn.user.id) {
            self.notify_presence(PresenceTransition::Offline(conn.room.clone(), conn.user.id.clone()));
        }

        let envelope = presence_envelope(&self.registry, PresenceChange::Left, &conn.room, conn.user);
        Some(Broadcast {
            room: conn.room,
            envelope,
        })
    }

    /// Queue a transition for the presence bridge, which applies them one at
    /// a time in hub order.
    fn notify_presence(&self, transition: PresenceTransition) {
        if let Some(tx) = &self.presence_tx {
            if tx.send(transition).is_err() {
                warn!("presence bridge gone, dropping transition");
            }
        }
    }

    fn update_gauges(&self) {
        self.metrics
            .gauge_set(m::WS_CONNECTIONS_ACTIVE, self.registry.connection_count() as i64);
        self.metrics
            .gauge_set(m::HUB_ROOMS_ACTIVE, self.registry.room_count() as i64);
    }
}
