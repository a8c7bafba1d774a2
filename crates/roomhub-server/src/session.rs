//! One client connection: read loop, write loop and heartbeat, torn down
//! together.
//!
//! The loops are generic over `Stream`/`Sink` of WebSocket messages so they
//! run the same against an axum socket or an in-memory channel.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use roomhub_core::{ConnectionId, Envelope, Event, FrameError, RoomId, UserSummary};
use roomhub_settings::RoomhubSettings;
use roomhub_telemetry::MetricsRecorder;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionHandle, Frame, Liveness, OutboundQueue, OutboundReceiver};
use crate::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::hub::HubHandle;
use crate::metrics as m;

/// Per-connection tuning, derived from settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub check_interval: Duration,
    pub liveness_timeout: Duration,
    pub write_timeout: Duration,
    pub max_content_length: usize,
    pub max_message_size: usize,
}

impl SessionConfig {
    pub fn from_settings(settings: &RoomhubSettings) -> Self {
        Self {
            queue_capacity: settings.hub.outbound_queue_capacity,
            ping_interval: settings.heartbeat.ping_interval(),
            check_interval: settings.heartbeat.check_interval(),
            liveness_timeout: settings.heartbeat.liveness_timeout(),
            write_timeout: settings.server.write_timeout(),
            max_content_length: settings.hub.max_content_length,
            max_message_size: settings.server.max_message_size,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&RoomhubSettings::default())
    }
}

/// Who is connecting and where to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user: UserSummary,
    pub room: RoomId,
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    PeerClosed,
    QueueClosed,
    Transport(String),
    WriteTimeout,
    LivenessTimeout,
    HubClosed,
    Shutdown,
}

impl LoopExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::QueueClosed => "queue_closed",
            Self::Transport(_) => "transport_error",
            Self::WriteTimeout => "write_timeout",
            Self::LivenessTimeout => "liveness_timeout",
            Self::HubClosed => "hub_closed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a connection to completion: register with the hub, pump both
/// directions, watch liveness, then unregister. Whichever side stops first
/// ends the whole connection.
#[instrument(skip_all, fields(conn_id = tracing::field::Empty, user_id = %identity.user.id, room_id = %identity.room))]
pub async fn run_session<Si, St, E>(
    sink: Si,
    stream: St,
    identity: Identity,
    hub: HubHandle,
    config: SessionConfig,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
) -> LoopExit
where
    Si: Sink<Message> + Unpin + Send,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (queue, outbound) = OutboundQueue::channel(config.queue_capacity);
    let conn = ConnectionHandle::new(identity.user.clone(), identity.room.clone(), queue.clone());
    let conn_id = conn.id.clone();
    tracing::Span::current().record("conn_id", tracing::field::display(&conn_id));

    if hub.register(conn).await.is_err() {
        warn!("hub unavailable, dropping connection");
        return LoopExit::HubClosed;
    }
    info!("connection established");

    let liveness = Arc::new(Liveness::new());
    let reader = Reader {
        conn_id: conn_id.clone(),
        identity,
        hub: hub.clone(),
        queue: queue.clone(),
        liveness: Arc::clone(&liveness),
        max_content_length: config.max_content_length,
        metrics: Arc::clone(&metrics),
    };
    let cancel = shutdown.child_token();

    let exit = tokio::select! {
        exit = write_loop(sink, outbound, config.ping_interval, config.write_timeout) => exit,
        exit = read_loop(stream, &reader) => exit,
        hb = run_heartbeat(liveness, config.check_interval, config.liveness_timeout, cancel.clone()) => {
            match hb {
                HeartbeatResult::TimedOut => {
                    metrics.counter_inc(m::LIVENESS_TIMEOUTS_TOTAL, 1);
                    LoopExit::LivenessTimeout
                }
                HeartbeatResult::Cancelled => LoopExit::Shutdown,
            }
        }
    };

    cancel.cancel();
    queue.close();
    hub.unregister(conn_id).await;

    match &exit {
        LoopExit::Transport(e) => warn!(reason = exit.as_str(), error = %e, "connection closed"),
        LoopExit::LivenessTimeout | LoopExit::WriteTimeout => {
            warn!(reason = exit.as_str(), "connection closed")
        }
        _ => info!(reason = exit.as_str(), "connection closed"),
    }
    exit
}

/// Drain the outbound queue to the socket in FIFO order and send a
/// keepalive ping every `ping_interval`. When the queue is closed a Close
/// frame is sent and the loop ends.
pub async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: OutboundReceiver,
    ping_interval: Duration,
    write_timeout: Duration,
) -> LoopExit
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut pings = time::interval_at(Instant::now() + ping_interval, ping_interval);
    pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.next() => match frame {
                Some(text) => {
                    if let Err(exit) = send_with_deadline(&mut sink, Message::Text(text), write_timeout).await {
                        return exit;
                    }
                }
                None => {
                    // Best effort: the peer may already be gone.
                    let _ = send_with_deadline(&mut sink, Message::Close(None), write_timeout).await;
                    return LoopExit::QueueClosed;
                }
            },
            _ = pings.tick() => {
                if let Err(exit) = send_with_deadline(&mut sink, Message::Ping(Vec::<u8>::new().into()), write_timeout).await {
                    return exit;
                }
                debug!("sent ping");
            }
        }
    }
}

async fn send_with_deadline<Si>(sink: &mut Si, msg: Message, deadline: Duration) -> Result<(), LoopExit>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match time::timeout(deadline, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LoopExit::Transport(e.to_string())),
        Err(_) => Err(LoopExit::WriteTimeout),
    }
}

/// What the read loop does with one decoded frame.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Broadcast(Envelope),
    Reply(Envelope),
    Alive,
}

/// Everything the read loop needs to act on inbound frames.
pub struct Reader {
    pub conn_id: ConnectionId,
    pub identity: Identity,
    pub hub: HubHandle,
    pub queue: OutboundQueue,
    pub liveness: Arc<Liveness>,
    pub max_content_length: usize,
    pub metrics: Arc<MetricsRecorder>,
}

impl Reader {
    /// Decode and classify one text frame. Identity fields are always taken
    /// from the connection, never from the frame.
    fn interpret(&self, text: &str) -> Result<Action, FrameError> {
        let envelope = Envelope::decode(text)?;
        match envelope.event {
            Event::Message(mut msg) => {
                if msg.content.trim().is_empty() {
                    return Err(FrameError::InvalidPayload {
                        kind: "message",
                        reason: "content is empty".into(),
                    });
                }
                let len = msg.content.chars().count();
                if len > self.max_content_length {
                    return Err(FrameError::InvalidPayload {
                        kind: "message",
                        reason: format!("content is {len} characters, limit is {}", self.max_content_length),
                    });
                }
                msg.user_id = self.identity.user.id.clone();
                msg.username = self.identity.user.username.clone();
                msg.room_id = self.identity.room.clone();
                Ok(Action::Broadcast(Envelope::new(Event::Message(msg))))
            }
            Event::Typing(mut notice) => {
                notice.user_id = self.identity.user.id.clone();
                notice.username = self.identity.user.username.clone();
                Ok(Action::Broadcast(Envelope::new(Event::Typing(notice))))
            }
            Event::Ping => Ok(Action::Reply(Envelope::new(Event::Pong))),
            Event::Pong => Ok(Action::Alive),
            Event::UserJoined(_) | Event::UserLeft(_) => Err(FrameError::InvalidPayload {
                kind: envelope.event.kind().as_str(),
                reason: "server-originated event".into(),
            }),
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), LoopExit> {
        match self.interpret(text) {
            Ok(Action::Broadcast(envelope)) => self
                .hub
                .broadcast(self.identity.room.clone(), envelope)
                .await
                .map_err(|_| LoopExit::HubClosed),
            Ok(Action::Reply(envelope)) => {
                match envelope.encode() {
                    Ok(text) => {
                        if let Err(e) = self.queue.try_push(Frame::from(text)) {
                            warn!(error = %e, "could not queue pong");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode pong"),
                }
                Ok(())
            }
            Ok(Action::Alive) => {
                self.liveness.mark_alive();
                Ok(())
            }
            Err(e) => {
                self.metrics.counter_inc(m::FRAMES_REJECTED_TOTAL, 1);
                warn!(kind = e.error_kind(), error = %e, "ignoring inbound frame");
                Ok(())
            }
        }
    }
}

/// Read frames until the peer closes or the transport fails. Bad frames are
/// logged and skipped; they never end the connection.
pub async fn read_loop<St, E>(mut stream: St, reader: &Reader) -> LoopExit
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => return LoopExit::Transport(e.to_string()),
        };
        match msg {
            Message::Text(text) => {
                if let Err(exit) = reader.handle_text(text.as_str()).await {
                    return exit;
                }
            }
            Message::Pong(_) => reader.liveness.mark_alive(),
            // The transport answers pings itself.
            Message::Ping(_) => {}
            Message::Binary(data) => {
                reader.metrics.counter_inc(m::FRAMES_REJECTED_TOTAL, 1);
                debug!(len = data.len(), "ignoring binary frame");
            }
            Message::Close(_) => return LoopExit::PeerClosed,
        }
    }
    LoopExit::PeerClosed
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as fmpsc;
    use roomhub_core::{ChatMessage, EventKind, UserId};

    use super::*;
    use crate::hub::{Collaborators, Hub};

    fn identity(name: &str, room: &str) -> Identity {
        Identity {
            user: UserSummary::new(UserId::from_raw(name), name),
            room: RoomId::from_raw(room),
        }
    }

    fn spawn_hub() -> (HubHandle, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        let (hub, handle) = Hub::new(64, Collaborators::default(), Arc::clone(&metrics), CancellationToken::new());
        hub.spawn();
        (handle, metrics)
    }

    /// Register a passive member and return its receiver, to observe fan-out.
    async fn observer(hub: &HubHandle, room: &str) -> OutboundReceiver {
        let (queue, rx) = OutboundQueue::channel(64);
        let conn = ConnectionHandle::new(identity("observer", room).user, RoomId::from_raw(room), queue);
        hub.register(conn).await.unwrap();
        hub.stats().await.unwrap();
        rx
    }

    fn reader(hub: HubHandle, metrics: Arc<MetricsRecorder>) -> (Reader, OutboundReceiver) {
        let (queue, rx) = OutboundQueue::channel(8);
        let reader = Reader {
            conn_id: ConnectionId::new(),
            identity: identity("alice", "general"),
            hub,
            queue,
            liveness: Arc::new(Liveness::new()),
            max_content_length: 20,
            metrics,
        };
        (reader, rx)
    }

    fn text(s: &str) -> Result<Message, std::io::Error> {
        Ok(Message::Text(s.to_string().into()))
    }

    fn decode_all(rx: &mut OutboundReceiver) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(f) = rx.try_next() {
            out.push(Envelope::decode(f.as_str()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn interpret_stamps_identity_on_messages() {
        let (hub, metrics) = spawn_hub();
        let (reader, _rx) = reader(hub, metrics);
        let action = reader
            .interpret(r#"{"type":"message","data":{"content":"hi","user_id":"mallory","room_id":"elsewhere"}}"#)
            .unwrap();
        let Action::Broadcast(env) = action else { panic!("expected broadcast") };
        let Event::Message(ChatMessage { user_id, username, content, room_id }) = env.event else {
            panic!("expected message")
        };
        assert_eq!(user_id.as_str(), "alice");
        assert_eq!(username, "alice");
        assert_eq!(content, "hi");
        assert_eq!(room_id.as_str(), "general");
    }

    #[tokio::test]
    async fn interpret_rejects_empty_and_oversized_content() {
        let (hub, metrics) = spawn_hub();
        let (reader, _rx) = reader(hub, metrics);
        assert!(reader.interpret(r#"{"type":"message","data":{"content":"   "}}"#).is_err());
        let long = "x".repeat(21);
        let frame = format!(r#"{{"type":"message","data":{{"content":"{long}"}}}}"#);
        assert!(matches!(
            reader.interpret(&frame),
            Err(FrameError::InvalidPayload { kind: "message", .. })
        ));
    }

    #[tokio::test]
    async fn interpret_rejects_client_presence_events() {
        let (hub, metrics) = spawn_hub();
        let (reader, _rx) = reader(hub, metrics);
        let frame = r#"{"type":"user_left","data":{"user":{"id":"x","username":"x"},"online_users":[]}}"#;
        assert!(reader.interpret(frame).is_err());
    }

    #[tokio::test]
    async fn read_loop_routes_frames() {
        let (hub, metrics) = spawn_hub();
        let mut watch = observer(&hub, "general").await;
        decode_all(&mut watch);
        let (reader, mut own) = reader(hub.clone(), Arc::clone(&metrics));

        let frames = futures::stream::iter(vec![
            text(r#"{"type":"bogus","data":{}}"#),
            text("not json"),
            text(r#"{"type":"ping","data":{}}"#),
            text(r#"{"type":"typing"}"#),
            text(r#"{"type":"message","data":{"content":"hi"}}"#),
            Ok(Message::Close(None)),
            text(r#"{"type":"message","data":{"content":"never read"}}"#),
        ]);
        let exit = read_loop(frames, &reader).await;
        assert_eq!(exit, LoopExit::PeerClosed);
        hub.stats().await.unwrap();

        let seen: Vec<EventKind> = decode_all(&mut watch).iter().map(Envelope::kind).collect();
        assert_eq!(seen, vec![EventKind::Typing, EventKind::Message]);

        let replies = decode_all(&mut own);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind(), EventKind::Pong);

        assert_eq!(metrics.counter_get(m::FRAMES_REJECTED_TOTAL), 2);
    }

    #[tokio::test]
    async fn read_loop_stops_on_transport_error() {
        let (hub, metrics) = spawn_hub();
        let (reader, _rx) = reader(hub, metrics);
        let frames = futures::stream::iter(vec![Err(std::io::Error::other("reset"))]);
        let exit = read_loop(frames, &reader).await;
        assert_eq!(exit, LoopExit::Transport("reset".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_refresh_liveness() {
        let (hub, metrics) = spawn_hub();
        let (reader, _rx) = reader(hub, metrics);
        time::advance(Duration::from_secs(60)).await;
        let frames = futures::stream::iter(vec![Ok::<_, std::io::Error>(Message::Pong(Vec::<u8>::new().into()))]);
        read_loop(frames, &reader).await;
        assert!(reader.liveness.elapsed() < Duration::from_secs(1));

        time::advance(Duration::from_secs(60)).await;
        read_loop(futures::stream::iter(vec![text(r#"{"type":"pong"}"#)]), &reader).await;
        assert!(reader.liveness.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn write_loop_drains_then_closes() {
        let (queue, outbound) = OutboundQueue::channel(8);
        let (sink, socket) = fmpsc::unbounded::<Message>();
        queue.try_push(Frame::from("one".to_string())).unwrap();
        queue.try_push(Frame::from("two".to_string())).unwrap();
        queue.close();

        let exit = write_loop(sink, outbound, Duration::from_secs(54), Duration::from_secs(10)).await;
        assert_eq!(exit, LoopExit::QueueClosed);

        let sent: Vec<Message> = socket.collect().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Message::Text("one".into()));
        assert_eq!(sent[1], Message::Text("two".into()));
        assert!(matches!(sent[2], Message::Close(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_sends_keepalive_pings() {
        let (queue, outbound) = OutboundQueue::channel(8);
        let (sink, socket) = fmpsc::unbounded::<Message>();
        let task = tokio::spawn(write_loop(sink, outbound, Duration::from_secs(54), Duration::from_secs(10)));

        time::sleep(Duration::from_secs(110)).await;
        queue.close();
        task.await.unwrap();

        let sent: Vec<Message> = socket.collect().await;
        let pings = sent.iter().filter(|m| matches!(m, Message::Ping(_))).count();
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_gives_up_on_stalled_socket() {
        let (queue, outbound) = OutboundQueue::channel(8);
        // Capacity 0 plus one sender slot: the second send blocks forever.
        let (sink, _socket) = fmpsc::channel::<Message>(0);
        for i in 0..3 {
            queue.try_push(Frame::from(format!("frame {i}"))).unwrap();
        }
        let exit = write_loop(sink, outbound, Duration::from_secs(54), Duration::from_secs(10)).await;
        assert_eq!(exit, LoopExit::WriteTimeout);
    }

    #[tokio::test]
    async fn write_loop_reports_transport_error() {
        let (queue, outbound) = OutboundQueue::channel(8);
        let (sink, socket) = fmpsc::unbounded::<Message>();
        drop(socket);
        queue.try_push(Frame::from("lost".to_string())).unwrap();
        let exit = write_loop(sink, outbound, Duration::from_secs(54), Duration::from_secs(10)).await;
        assert!(matches!(exit, LoopExit::Transport(_)));
    }

    #[tokio::test]
    async fn session_registers_and_unregisters() {
        let (hub, metrics) = spawn_hub();
        let mut watch = observer(&hub, "general").await;
        decode_all(&mut watch);

        let (client_tx, client_rx) = fmpsc::unbounded::<Result<Message, std::io::Error>>();
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let session = tokio::spawn(run_session(
            sink,
            client_rx,
            identity("alice", "general"),
            hub.clone(),
            SessionConfig::default(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        ));

        // The joining client sees its own join notice.
        let first = socket.next().await.unwrap();
        let Message::Text(first) = first else { panic!("expected text") };
        assert_eq!(Envelope::decode(first.as_str()).unwrap().kind(), EventKind::UserJoined);

        client_tx.unbounded_send(text(r#"{"type":"message","data":{"content":"hello"}}"#)).unwrap();
        let echoed = socket.next().await.unwrap();
        let Message::Text(echoed) = echoed else { panic!("expected text") };
        assert_eq!(Envelope::decode(echoed.as_str()).unwrap().kind(), EventKind::Message);

        drop(client_tx);
        assert_eq!(session.await.unwrap(), LoopExit::PeerClosed);
        hub.stats().await.unwrap();

        let kinds: Vec<EventKind> = decode_all(&mut watch).iter().map(Envelope::kind).collect();
        assert_eq!(kinds, vec![EventKind::UserJoined, EventKind::Message, EventKind::UserLeft]);
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_is_evicted_by_heartbeat() {
        let (hub, metrics) = spawn_hub();
        let (_client_tx, client_rx) = fmpsc::unbounded::<Result<Message, std::io::Error>>();
        let (sink, _socket) = fmpsc::unbounded::<Message>();
        let config = SessionConfig::default();

        let started = Instant::now();
        let exit = run_session(
            sink,
            client_rx,
            identity("ghost", "general"),
            hub.clone(),
            config.clone(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, LoopExit::LivenessTimeout);
        assert!(started.elapsed() <= config.liveness_timeout + config.check_interval);
        assert_eq!(metrics.counter_get(m::LIVENESS_TIMEOUTS_TOTAL), 1);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn shutdown_token_ends_session() {
        let (hub, metrics) = spawn_hub();
        let (_client_tx, client_rx) = fmpsc::unbounded::<Result<Message, std::io::Error>>();
        let (sink, _socket) = fmpsc::unbounded::<Message>();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let exit = run_session(
            sink,
            client_rx,
            identity("a", "general"),
            hub,
            SessionConfig::default(),
            metrics,
            shutdown,
        )
        .await;
        assert_eq!(exit, LoopExit::Shutdown);
    }
}
