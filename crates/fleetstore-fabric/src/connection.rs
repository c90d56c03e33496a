//! A live channel to one peer
//!
//! ```text
//! INIT -> CONNECTING -> CONNECTED <-> STALE -> CLOSED
//!             |   ^                              |
//!             v   |                              |
//!            FAILED <------ (backoff) -----------+--> CONNECTING
//! ```
//!
//! A [`Connection`] outlives the links it runs on: the pool keeps one per
//! peer and re-attaches a fresh link after a close or failure. Requests are
//! multiplexed over the current link and matched to responses by id.

use crate::error::{FabricError, FabricResult};
use crate::event::{FabricEvent, FabricEventKind};
use crate::frame::{self, Envelope, FrameKind, Reassembler, split_message};
use crate::protocol::{self, NodeRequest, NodeResponse, RemoteError};
use crate::transport::{Link, TransportKind};
use fleetstore_common::types::NodeId;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    Stale,
    Closed,
    Failed,
}

impl ConnState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnState::{Closed, Connected, Connecting, Failed, Init, Stale};
        matches!(
            (self, next),
            (Init | Failed | Closed, Connecting)
                | (Connecting, Connected | Failed)
                | (Connected, Stale)
                | (Stale, Connected)
                | (Init | Connected | Stale | Failed, Closed)
        )
    }

    /// Requests may be sent in this state
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Stale)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Stale => "STALE",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

type Pending = HashMap<u64, oneshot::Sender<FabricResult<NodeResponse>>>;

/// One attached link and the tasks driving it
struct Channel {
    generation: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Connection {
    peer: NodeId,
    alive_delay: Duration,
    max_frame_payload: usize,
    state: Mutex<ConnState>,
    transport: Mutex<Option<TransportKind>>,
    last_activity: Mutex<Instant>,
    pending: Mutex<Pending>,
    channel: Mutex<Option<Channel>>,
    next_id: AtomicU64,
    generation: AtomicU64,
    connected_once: AtomicBool,
    /// Serializes handshakes for this peer
    pub(crate) handshake: tokio::sync::Mutex<()>,
    events: broadcast::Sender<FabricEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("transport", &self.transport())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        peer: NodeId,
        alive_delay: Duration,
        max_frame_payload: usize,
        events: broadcast::Sender<FabricEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            alive_delay,
            max_frame_payload,
            state: Mutex::new(ConnState::Init),
            transport: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            pending: Mutex::new(HashMap::new()),
            channel: Mutex::new(None),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            connected_once: AtomicBool::new(false),
            handshake: tokio::sync::Mutex::new(()),
            events,
        })
    }

    #[must_use]
    pub const fn peer(&self) -> NodeId {
        self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        *self.transport.lock()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state() == ConnState::Stale
    }

    /// Time since the last data frame was sent or received
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn emit(&self, kind: FabricEventKind) {
        let _ = self.events.send(FabricEvent { peer: self.peer, kind });
    }

    fn transition(&self, next: ConnState) -> FabricResult<ConnState> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(FabricError::InvalidTransition { from, to: next });
        }
        *state = next;
        trace!(peer = %self.peer, %from, to = %next, "connection transition");
        Ok(from)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn begin_connect(&self) -> FabricResult<()> {
        self.transition(ConnState::Connecting).map(|_| ())
    }

    pub(crate) fn mark_failed(&self) {
        if let Err(e) = self.transition(ConnState::Failed) {
            debug!(peer = %self.peer, error = %e, "failed transition ignored");
        }
    }

    /// Demote an idle connection. Returns whether the state changed.
    pub(crate) fn mark_stale(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnState::Connected {
            return false;
        }
        *state = ConnState::Stale;
        drop(state);
        info!(peer = %self.peer, idle_ms = self.idle_for().as_millis() as u64, "connection is stale");
        self.emit(FabricEventKind::Stale);
        true
    }

    /// Inbound data revives a stale connection
    fn revive(&self) {
        let mut state = self.state.lock();
        if *state == ConnState::Stale {
            *state = ConnState::Connected;
            drop(state);
            debug!(peer = %self.peer, "stale connection revived by traffic");
        }
    }

    /// Start serving a freshly dialled link
    pub(crate) fn attach(self: &Arc<Self>, link: Link, kind: TransportKind) -> FabricResult<()> {
        self.transition(ConnState::Connected)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.transport.lock() = Some(kind);
        self.touch();

        let (reader, writer) = tokio::io::split(link);
        let frames = FramedRead::new(reader, frame::codec(self.max_frame_payload));
        let mut sink = FramedWrite::new(writer, frame::codec(self.max_frame_payload));
        let (outbound, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let peer = self.peer;
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let encoded = match envelope.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(encoded).await {
                    debug!(peer = %peer, error = %e, "writer stopped");
                    break;
                }
            }
        });
        let reader_task = tokio::spawn(self.clone().read_loop(frames, outbound.clone(), generation));
        let keepalive_task = tokio::spawn(self.clone().keepalive(outbound.clone(), generation));

        *self.channel.lock() = Some(Channel {
            generation,
            outbound,
            tasks: vec![writer_task, reader_task, keepalive_task],
        });

        let kind_event = if self.connected_once.swap(true, Ordering::SeqCst) {
            info!(peer = %self.peer, transport = %kind, "reconnected");
            FabricEventKind::Reconnected { transport: kind }
        } else {
            info!(peer = %self.peer, transport = %kind, "connected");
            FabricEventKind::Connected { transport: kind }
        };
        self.emit(kind_event);
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut frames: FramedRead<tokio::io::ReadHalf<Link>, tokio_util::codec::LengthDelimitedCodec>,
        outbound: mpsc::UnboundedSender<Envelope>,
        generation: u64,
    ) {
        let mut reassembler = Reassembler::new();
        let reason = loop {
            let frame = match frames.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break format!("read failed: {e}"),
                None => break "peer closed the link".to_string(),
            };
            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => break format!("undecodable frame: {e}"),
            };
            match envelope.kind {
                FrameKind::Ping => {
                    let _ = outbound.send(Envelope::control(FrameKind::Pong, envelope.id));
                    continue;
                }
                FrameKind::Pong => continue,
                FrameKind::Close => break "peer sent close".to_string(),
                FrameKind::Request => {
                    let reply = RemoteError::bad_request("control plane does not serve requests");
                    if let Ok(body) = protocol::encode(&reply) {
                        for env in split_message(envelope.id, FrameKind::Error, body, self.max_frame_payload) {
                            let _ = outbound.send(env);
                        }
                    }
                    continue;
                }
                FrameKind::Response | FrameKind::Error => {}
            }
            self.touch();
            self.revive();
            match reassembler.push(envelope) {
                Ok(Some(message)) => self.complete(message.id, message.kind, &message.body),
                Ok(None) => {}
                Err(e) => warn!(peer = %self.peer, error = %e, "dropping malformed response"),
            }
        };
        self.link_lost(generation, &reason);
    }

    fn complete(&self, id: u64, kind: FrameKind, body: &[u8]) {
        let Some(waiter) = self.pending.lock().remove(&id) else {
            debug!(peer = %self.peer, id, "response for abandoned request");
            return;
        };
        let result = if kind == FrameKind::Error {
            protocol::decode::<RemoteError>(body).and_then(|e| Err(FabricError::Remote(e)))
        } else {
            protocol::decode::<NodeResponse>(body)
        };
        let _ = waiter.send(result);
    }

    async fn keepalive(self: Arc<Self>, outbound: mpsc::UnboundedSender<Envelope>, generation: u64) {
        let mut ticker = tokio::time::interval(self.alive_delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            if self.state() != ConnState::Connected {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            trace!(peer = %self.peer, id, "keepalive");
            if outbound.send(Envelope::control(FrameKind::Ping, id)).is_err() {
                break;
            }
        }
    }

    fn link_lost(&self, generation: u64, reason: &str) {
        let current = self.channel.lock().as_ref().map(|c| c.generation);
        if current != Some(generation) {
            return;
        }
        warn!(peer = %self.peer, reason, "link lost");
        self.shutdown(false);
    }

    /// Send a request and wait for its response
    pub async fn request(&self, request: NodeRequest, timeout: Duration) -> FabricResult<NodeResponse> {
        if !self.state().is_open() {
            return Err(FabricError::Closed(self.peer));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = protocol::encode(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = {
            let channel = self.channel.lock();
            channel.as_ref().is_some_and(|c| {
                split_message(id, FrameKind::Request, body, self.max_frame_payload)
                    .into_iter()
                    .all(|env| c.outbound.send(env).is_ok())
            })
        };
        if !sent {
            self.pending.lock().remove(&id);
            return Err(FabricError::Closed(self.peer));
        }
        self.touch();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FabricError::Closed(self.peer)),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(FabricError::Timeout {
                    peer: self.peer,
                    id,
                    after: timeout,
                })
            }
        }
    }

    /// Close the connection, failing every in-flight request
    pub fn close(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, notify_peer: bool) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if !previous.can_transition_to(ConnState::Closed) {
                return;
            }
            *state = ConnState::Closed;
            previous
        };

        if let Some(channel) = self.channel.lock().take() {
            if notify_peer {
                let _ = channel.outbound.send(Envelope::control(FrameKind::Close, 0));
            }
            // writer drains the close frame once every sender is gone
            for task in channel.tasks.iter().skip(1) {
                task.abort();
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(FabricError::Closed(self.peer)));
        }

        if previous.is_open() {
            info!(peer = %self.peer, "connection closed");
            self.emit(FabricEventKind::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{RequestHandler, serve_link};
    use async_trait::async_trait;
    use bytes::Bytes;
    use fleetstore_common::types::BlockId;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: NodeRequest) -> Result<NodeResponse, RemoteError> {
            match request {
                NodeRequest::ReadBlock { block } => Ok(NodeResponse::data(block, Bytes::from(vec![7u8; 100]))),
                NodeRequest::WriteBlock { block, data, .. } => Ok(NodeResponse::Written {
                    block,
                    size: data.len() as u64,
                }),
                _ => Err(RemoteError::not_found("nothing here")),
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _request: NodeRequest) -> Result<NodeResponse, RemoteError> {
            std::future::pending().await
        }
    }

    fn attached(handler: Arc<dyn RequestHandler>) -> (Arc<Connection>, broadcast::Receiver<FabricEvent>) {
        let (events, rx) = broadcast::channel(16);
        let conn = Connection::new(NodeId::new(), Duration::from_secs(10), 16, events);
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(serve_link(Box::new(server), handler, 16));
        conn.begin_connect().unwrap();
        conn.attach(Box::new(client), TransportKind::Direct).unwrap();
        (conn, rx)
    }

    #[test]
    fn test_state_machine_edges() {
        use ConnState::*;
        assert!(Init.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Connecting));
        assert!(!Init.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Stale));
        assert!(!Connecting.can_transition_to(Stale));
    }

    #[tokio::test]
    async fn test_multipart_request_and_response() {
        let (conn, mut events) = attached(Arc::new(Echo));
        assert_eq!(
            events.recv().await.unwrap().kind,
            FabricEventKind::Connected {
                transport: TransportKind::Direct
            }
        );

        let block = BlockId::new();
        let response = conn
            .request(NodeRequest::write(block, Bytes::from(vec![1u8; 50])), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, NodeResponse::Written { block, size: 50 });

        let data = conn
            .request(NodeRequest::ReadBlock { block }, Duration::from_secs(5))
            .await
            .unwrap()
            .into_data()
            .unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let (conn, _events) = attached(Arc::new(Echo));
        let err = conn
            .request(NodeRequest::DeleteBlocks { blocks: vec![] }, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Remote(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_request_slot() {
        let (conn, _events) = attached(Arc::new(Silent));
        let err = conn
            .request(NodeRequest::ReadBlock { block: BlockId::new() }, Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Timeout { .. }));
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_emits_once() {
        let (conn, mut events) = attached(Arc::new(Silent));
        let _ = events.recv().await;

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(NodeRequest::ReadBlock { block: BlockId::new() }, Duration::from_secs(60))
                    .await
            })
        };
        tokio::task::yield_now().await;
        while conn.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        conn.close();
        conn.close();

        assert!(matches!(waiting.await.unwrap(), Err(FabricError::Closed(_))));
        assert_eq!(events.recv().await.unwrap().kind, FabricEventKind::Closed);
        assert!(events.try_recv().is_err());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_connection() {
        let (events, mut rx) = broadcast::channel(16);
        let conn = Connection::new(NodeId::new(), Duration::from_secs(10), 16, events);
        let (client, server) = tokio::io::duplex(1024);
        conn.begin_connect().unwrap();
        conn.attach(Box::new(client), TransportKind::NatTraversed).unwrap();
        let _ = rx.recv().await;

        drop(server);
        assert_eq!(rx.recv().await.unwrap().kind, FabricEventKind::Closed);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_stale_revived_by_response() {
        let (conn, _events) = attached(Arc::new(Echo));
        assert!(conn.mark_stale());
        assert!(conn.is_stale());
        conn.request(NodeRequest::ReadBlock { block: BlockId::new() }, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnState::Connected);
    }
}
