//! One authenticated peer session.
//!
//! A session carries exactly one folder over one transport connection. The
//! actor drives the handshake, enforces the choke/interest state machine and
//! forwards everything else to its folder group. The transport is any
//! `AsyncRead + AsyncWrite` stream; TLS and websocket wrapping happen a layer
//! below, which is also where the remote node identity comes from.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{codec::Framed, task::AbortOnDropHandle};
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::{CtHash, NodeId, Secret};
use skiff_sync::{PathRevision, SignedMeta};

use crate::{
    bandwidth::BandwidthCounter,
    proto::{handshake_token, Bitfield, Frame, Handshake, Message, SessionCodec},
};

const COMMAND_CAP: usize = 64;

/// Default keepalive probe interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Default idle timeout; reset on every received frame.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Who initiated the transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed; we send the first handshake.
    Client,
    /// We accepted; we reply once the peer's handshake validates.
    Server,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer could not prove folder membership.
    Auth,
    /// The peer violated the protocol state machine.
    Protocol,
    /// No frame arrived within the idle timeout.
    Timeout,
    /// The transport failed or was closed by the peer.
    Transport,
    /// We closed it.
    Local,
}

/// Errors surfaced when accepting a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Handshake token mismatch.
    #[error("remote node could not verify its authenticity")]
    Auth,
    /// Protocol violation during setup.
    #[error("protocol error")]
    Protocol,
}

/// Parameters for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Any derivation of the folder secret.
    pub secret: Secret,
    /// Our node identity.
    pub local_node: NodeId,
    /// The transport-authenticated remote identity.
    pub remote_node: NodeId,
    /// Software name sent in the handshake.
    pub client_name: String,
    /// Software version sent in the handshake.
    pub user_agent: String,
    /// Keepalive probe interval.
    pub ping_interval: Duration,
    /// Close the session when nothing arrives for this long.
    pub idle_timeout: Duration,
}

impl SessionConfig {
    /// Config with default timers.
    pub fn new(secret: Secret, local_node: NodeId, remote_node: NodeId) -> Self {
        Self {
            secret,
            local_node,
            remote_node,
            client_name: "skiff".to_string(),
            user_agent: concat!("skiff/", env!("CARGO_PKG_VERSION")).to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// What a session reports to its folder group.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Both handshakes are done; the session may carry traffic.
    Ready {
        /// Peer software name.
        client_name: String,
        /// Peer software version.
        user_agent: String,
    },
    /// A protocol message arrived after Ready.
    Message(Message),
    /// The session ended. All outstanding requests toward the peer are void.
    Closed {
        /// Why.
        reason: CloseReason,
    },
}

enum ToSession {
    Send(Message),
    Close,
}

/// Handle to a running peer session.
#[derive(Debug, Clone)]
pub struct PeerSession {
    tx: mpsc::Sender<ToSession>,
    remote_node: NodeId,
    counter: Arc<BandwidthCounter>,
    rtt_ms: Arc<AtomicU64>,
    _task: Arc<AbortOnDropHandle<()>>,
}

impl PeerSession {
    /// Start the client side over a fresh stream. We send the first
    /// handshake.
    pub fn connect<S>(
        stream: S,
        config: SessionConfig,
        events: mpsc::Sender<(NodeId, SessionEvent)>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, SessionCodec);
        Self::spawn(framed, config, events, Role::Client, None)
    }

    /// Start the server side after the peer's handshake was read and routed.
    ///
    /// Validates the handshake against the folder secret before any task is
    /// spawned; a token mismatch is an [`SessionError::Auth`].
    pub fn accept<S>(
        framed: Framed<S, SessionCodec>,
        config: SessionConfig,
        events: mpsc::Sender<(NodeId, SessionEvent)>,
        handshake: Handshake,
    ) -> Result<Self, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        validate_handshake(&config, &handshake)?;
        Ok(Self::spawn(
            framed,
            config,
            events,
            Role::Server,
            Some(handshake),
        ))
    }

    fn spawn<S>(
        framed: Framed<S, SessionCodec>,
        config: SessionConfig,
        events: mpsc::Sender<(NodeId, SessionEvent)>,
        role: Role,
        received_handshake: Option<Handshake>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_CAP);
        let counter = Arc::new(BandwidthCounter::default());
        let rtt_ms = Arc::new(AtomicU64::new(0));
        let remote_node = config.remote_node;
        let span = error_span!(
            "session",
            folder = %config.secret.folder_id().fmt_short(),
            peer = %remote_node.fmt_short(),
        );
        let actor = Actor {
            framed,
            config,
            events: events.clone(),
            rx,
            role,
            handshake_sent: false,
            handshake_received: received_handshake.is_some(),
            ready_emitted: false,
            peer_client_name: received_handshake
                .as_ref()
                .map(|h| h.client_name.clone())
                .unwrap_or_default(),
            peer_user_agent: received_handshake
                .as_ref()
                .map(|h| h.user_agent.clone())
                .unwrap_or_default(),
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            counter: counter.clone(),
            rtt_ms: rtt_ms.clone(),
            last_ping: None,
        };
        let task = tokio::spawn(
            async move {
                let reason = actor.run().await;
                debug!(?reason, "session closed");
                events
                    .send((remote_node, SessionEvent::Closed { reason }))
                    .await
                    .ok();
            }
            .instrument(span),
        );
        Self {
            tx,
            remote_node,
            counter,
            rtt_ms,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        }
    }

    /// The transport-authenticated remote identity.
    pub fn remote_node(&self) -> NodeId {
        self.remote_node
    }

    /// Rolling byte counters for this peer.
    pub fn counter(&self) -> &Arc<BandwidthCounter> {
        &self.counter
    }

    /// Last measured keepalive round trip.
    pub fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms.load(Ordering::Relaxed))
    }

    /// Queue a message for sending.
    pub async fn send(&self, message: Message) {
        self.tx.send(ToSession::Send(message)).await.ok();
    }

    /// Stop serving block requests to this peer.
    pub async fn choke(&self) {
        self.send(Message::Choke).await
    }

    /// Resume serving block requests to this peer.
    pub async fn unchoke(&self) {
        self.send(Message::Unchoke).await
    }

    /// Tell the peer we want something from it.
    pub async fn interest(&self) {
        self.send(Message::Interested).await
    }

    /// Tell the peer we want nothing right now.
    pub async fn uninterest(&self) {
        self.send(Message::NotInterested).await
    }

    /// Announce a meta record and which chunks of it we hold.
    pub async fn post_have_meta(&self, revision: PathRevision, bitfield: Bitfield) {
        self.send(Message::HaveMeta { revision, bitfield }).await
    }

    /// Announce a newly assembled chunk.
    pub async fn post_have_chunk(&self, ct_hash: CtHash) {
        self.send(Message::HaveChunk { ct_hash }).await
    }

    /// Ask the peer for a signed meta record.
    pub async fn request_meta(&self, revision: PathRevision) {
        self.send(Message::MetaRequest { revision }).await
    }

    /// Answer a meta request.
    pub async fn post_meta(&self, meta: SignedMeta, bitfield: Bitfield) {
        self.send(Message::MetaReply { meta, bitfield }).await
    }

    /// Ask the peer for a ciphertext range.
    pub async fn request_block(&self, ct_hash: CtHash, offset: u32, size: u32) {
        self.send(Message::BlockRequest {
            ct_hash,
            offset,
            size,
        })
        .await
    }

    /// Answer a block request.
    pub async fn post_block(&self, ct_hash: CtHash, offset: u32, data: bytes::Bytes) {
        self.send(Message::BlockReply {
            ct_hash,
            offset,
            data,
        })
        .await
    }

    /// Close the session. Outstanding requests are cancelled, no drain.
    pub async fn close(&self) {
        self.tx.send(ToSession::Close).await.ok();
    }
}

/// Read the first frame of an accepted connection, which must be a
/// handshake. The caller routes it to the right folder and calls
/// [`PeerSession::accept`].
pub async fn read_handshake<S>(
    framed: &mut Framed<S, SessionCodec>,
) -> Result<Handshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    match framed.next().await {
        Some(Ok(Frame::Message(Message::Handshake(handshake)))) => Ok(handshake),
        _ => Err(SessionError::Protocol),
    }
}

fn validate_handshake(config: &SessionConfig, handshake: &Handshake) -> Result<(), SessionError> {
    if handshake.folder_id != config.secret.folder_id() {
        return Err(SessionError::Auth);
    }
    let expected = handshake_token(&config.secret, &config.remote_node.digest());
    if handshake.auth_token != expected {
        return Err(SessionError::Auth);
    }
    Ok(())
}

struct Actor<S> {
    framed: Framed<S, SessionCodec>,
    config: SessionConfig,
    events: mpsc::Sender<(NodeId, SessionEvent)>,
    rx: mpsc::Receiver<ToSession>,
    role: Role,
    handshake_sent: bool,
    handshake_received: bool,
    ready_emitted: bool,
    peer_client_name: String,
    peer_user_agent: String,
    am_choking: bool,
    peer_choking: bool,
    am_interested: bool,
    peer_interested: bool,
    counter: Arc<BandwidthCounter>,
    rtt_ms: Arc<AtomicU64>,
    last_ping: Option<Instant>,
}

impl<S> Actor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn ready(&self) -> bool {
        self.handshake_sent && self.handshake_received
    }

    async fn run(mut self) -> CloseReason {
        // the client speaks first; the server's handshake was validated
        // before spawn and is answered right away
        if let Err(reason) = self.send_handshake().await {
            return reason;
        }
        if let Some(reason) = self.maybe_emit_ready().await {
            return reason;
        }

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ToSession::Send(message)) => {
                        if let Err(reason) = self.send_message(message).await {
                            return reason;
                        }
                    }
                    Some(ToSession::Close) | None => return CloseReason::Local,
                },
                frame = self.framed.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => {
                            debug!("frame decode failed: {err:#}");
                            return CloseReason::Protocol;
                        }
                        None => return CloseReason::Transport,
                    };
                    idle.as_mut()
                        .reset(tokio::time::Instant::now() + self.config.idle_timeout);
                    if let Err(reason) = self.handle_frame(frame).await {
                        return reason;
                    }
                },
                _ = ping.tick() => {
                    if self.framed.send(Frame::Ping).await.is_err() {
                        return CloseReason::Transport;
                    }
                    self.last_ping = Some(Instant::now());
                },
                _ = &mut idle => {
                    debug!("idle timeout expired");
                    return CloseReason::Timeout;
                },
            }
        }
    }

    async fn send_handshake(&mut self) -> Result<(), CloseReason> {
        if self.role == Role::Client || self.handshake_received {
            let handshake = Handshake {
                auth_token: handshake_token(&self.config.secret, &self.config.local_node.digest()),
                client_name: self.config.client_name.clone(),
                user_agent: self.config.user_agent.clone(),
                folder_id: self.config.secret.folder_id(),
            };
            self.send_frame(Frame::Message(Message::Handshake(handshake)))
                .await?;
            self.handshake_sent = true;
        }
        Ok(())
    }

    async fn maybe_emit_ready(&mut self) -> Option<CloseReason> {
        if !self.ready() || self.ready_emitted {
            return None;
        }
        self.ready_emitted = true;
        trace!("session ready");
        let event = SessionEvent::Ready {
            client_name: self.peer_client_name.clone(),
            user_agent: self.peer_user_agent.clone(),
        };
        match self.emit(event).await {
            Ok(()) => None,
            Err(reason) => Some(reason),
        }
    }

    async fn emit(&mut self, event: SessionEvent) -> Result<(), CloseReason> {
        self.events
            .send((self.config.remote_node, event))
            .await
            .map_err(|_| CloseReason::Local)
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), CloseReason> {
        if let Frame::Message(message) = &frame {
            self.counter.add_up(encoded_size(message));
        }
        self.framed
            .send(frame)
            .await
            .map_err(|_| CloseReason::Transport)
    }

    async fn send_message(&mut self, message: Message) -> Result<(), CloseReason> {
        match &message {
            Message::Handshake(_) => {
                // only the actor itself sends handshakes
                warn!("dropping handshake submitted through the command channel");
                return Ok(());
            }
            Message::Choke => self.am_choking = true,
            Message::Unchoke => self.am_choking = false,
            Message::Interested => self.am_interested = true,
            Message::NotInterested => self.am_interested = false,
            Message::BlockRequest { .. } => {
                if self.peer_choking {
                    trace!("peer is choking us, dropping block request");
                    return Ok(());
                }
            }
            Message::BlockReply { .. } => {
                if self.am_choking {
                    trace!("choking, refusing to send block reply");
                    return Ok(());
                }
            }
            _ => {}
        }
        if !self.ready() {
            warn!("dropping message queued before ready");
            return Ok(());
        }
        self.send_frame(Frame::Message(message)).await
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let message = match frame {
            Frame::Ping => {
                return self.send_frame(Frame::Pong).await;
            }
            Frame::Pong => {
                if let Some(sent) = self.last_ping.take() {
                    self.rtt_ms
                        .store(sent.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
                return Ok(());
            }
            Frame::Message(message) => message,
        };
        self.counter.add_down(encoded_size(&message));

        if let Message::Handshake(handshake) = message {
            if self.handshake_received {
                debug!("duplicate handshake");
                return Err(CloseReason::Protocol);
            }
            if let Err(err) = validate_handshake(&self.config, &handshake) {
                debug!("handshake rejected: {err}");
                return Err(CloseReason::Auth);
            }
            self.handshake_received = true;
            self.peer_client_name = handshake.client_name;
            self.peer_user_agent = handshake.user_agent;
            self.send_handshake().await?;
            if let Some(reason) = self.maybe_emit_ready().await {
                return Err(reason);
            }
            return Ok(());
        }

        if !self.ready() {
            debug!("message before handshake completion");
            return Err(CloseReason::Protocol);
        }

        match &message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::BlockRequest { ct_hash, .. } => {
                if self.am_choking {
                    trace!(chunk = %ct_hash.fmt_short(), "choked peer sent block request, ignoring");
                    return Ok(());
                }
            }
            _ => {}
        }
        self.emit(SessionEvent::Message(message)).await
    }
}

fn encoded_size(message: &Message) -> u64 {
    postcard::serialize_with_flavor(message, postcard::ser_flavors::Size::default())
        .map(|size| size as u64)
        .unwrap_or(0)
}
