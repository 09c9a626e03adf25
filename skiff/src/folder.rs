//! The folder group.
//!
//! One folder group joins a folder's local state (index, indexer queue,
//! watcher, poller, staging area) to its remote peer sessions. It announces
//! local changes, routes incoming metas and blocks through verification into
//! the index, schedules block requests across unchoked peers, and assembles
//! finished chunks back into plaintext files.

use std::{
    collections::{HashMap, HashSet},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::{
    codec::{Framed, FramedParts},
    task::AbortOnDropHandle,
};
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::{Capability, CtHash, FolderId, NodeId, Secret};
use skiff_net::{
    bandwidth::{ChokeCandidate, Choker, RECHOKE_INTERVAL},
    proto::{Frame, SessionCodec},
    Bitfield, Handshake, Message, PeerSession, SessionConfig, SessionError, SessionEvent,
};
use skiff_sync::{
    chunker::ChunkCipher,
    indexer::{IndexerConfig, IndexerQueue},
    meta::MetaKind,
    watcher::{AssembleSuppressor, DirectoryPoller, DirectoryWatcher, DEFAULT_POLL_INTERVAL},
    Index, IndexEvent, PathRevision, SignedMeta,
};

const COMMAND_CAP: usize = 64;
const SESSION_EVENT_CAP: usize = 256;

/// Parameters for one folder group.
#[derive(Debug, Clone)]
pub struct FolderParams {
    /// The folder secret, any capability level.
    pub secret: Secret,
    /// Root of the synchronized tree.
    pub root: PathBuf,
    /// Directory holding the index database and staging area.
    pub system_dir: PathBuf,
    /// Our node identity.
    pub local_node: NodeId,
    /// Relative path prefixes to ignore when indexing.
    pub ignore: Vec<String>,
    /// Poller sweep interval.
    pub poll_interval: Duration,
    /// Choking re-evaluation interval.
    pub rechoke_interval: Duration,
    /// Request scheduler pump interval.
    pub pump_interval: Duration,
    /// Block requests in flight per peer.
    pub outstanding_per_peer: usize,
}

impl FolderParams {
    /// Defaults for a folder.
    pub fn new(secret: Secret, root: PathBuf, system_dir: PathBuf, local_node: NodeId) -> Self {
        Self {
            secret,
            root,
            system_dir,
            local_node,
            ignore: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            rechoke_interval: RECHOKE_INTERVAL,
            pump_interval: Duration::from_secs(1),
            outstanding_per_peer: 8,
        }
    }
}

/// Per-peer state snapshot for the control plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerInfo {
    /// Peer identity, hex.
    pub node: String,
    /// Peer software name.
    pub client_name: String,
    /// Peer software version.
    pub user_agent: String,
    /// Last keepalive round trip, milliseconds.
    pub rtt_ms: u64,
    /// Bytes sent to the peer.
    pub bytes_up: u64,
    /// Bytes received from the peer.
    pub bytes_down: u64,
}

/// Folder state snapshot for the control plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FolderState {
    /// The folder, hex.
    pub folder_id: String,
    /// Connected peers.
    pub peers: Vec<PeerInfo>,
}

/// Transport stream a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

type DynStream = Box<dyn SessionStream>;

enum ToFolder {
    /// Dial side: the stream is fresh, we send the first handshake.
    Connect { stream: DynStream, remote: NodeId },
    /// Accept side: the peer's handshake was already read and routed here.
    Accept {
        framed: Framed<DynStream, SessionCodec>,
        remote: NodeId,
        handshake: Handshake,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    CollectState(oneshot::Sender<FolderState>),
}

/// Handle to a running folder group.
#[derive(Debug, Clone)]
pub struct FolderGroup {
    tx: mpsc::Sender<ToFolder>,
    folder_id: FolderId,
    secret: Secret,
    local_node: NodeId,
    index: Arc<Index>,
    _task: Arc<AbortOnDropHandle<()>>,
}

impl FolderGroup {
    /// Open the folder state and start the group.
    ///
    /// Must run inside a tokio runtime. Folders below read-write capability
    /// get no indexer or watchers; folders below read-only capability never
    /// materialize plaintext.
    pub fn spawn(params: FolderParams) -> Result<Self> {
        let folder_id = params.secret.folder_id();
        std::fs::create_dir_all(&params.system_dir).context("failed to create system dir")?;
        let staging = params.system_dir.join(format!("{folder_id}.assembled"));
        std::fs::create_dir_all(&staging).context("failed to create staging dir")?;

        let db_path = params.system_dir.join(format!("{folder_id}.db"));
        let index = Arc::new(
            Index::persistent(&db_path, params.secret.clone()).context("failed to open index")?,
        );

        let cipher = params
            .secret
            .content_key()
            .ok()
            .map(ChunkCipher::new);
        let path_key = params.secret.path_key().ok();

        let suppressor = AssembleSuppressor::default();
        let mut indexer = None;
        let mut watcher = None;
        let mut poller = None;
        if params.secret.capability() >= Capability::ReadWrite {
            let mut config = IndexerConfig::new(params.root.clone());
            config.ignore = params.ignore.clone();
            let queue = IndexerQueue::spawn(config, params.secret.clone(), index.clone())?;
            watcher = Some(DirectoryWatcher::spawn(
                &params.root,
                queue.clone(),
                suppressor.clone(),
            )?);
            poller = Some(DirectoryPoller::spawn(
                params.root.clone(),
                params.poll_interval,
                queue.clone(),
                index.clone(),
                params.secret.clone(),
            )?);
            indexer = Some(queue);
        }

        let (tx, rx) = mpsc::channel(COMMAND_CAP);
        let (events_tx, session_events) = mpsc::channel(SESSION_EVENT_CAP);
        let index_events = index.subscribe();
        let actor = Actor {
            params: params.clone(),
            index: index.clone(),
            cipher,
            path_key,
            staging,
            suppressor,
            rx,
            events_tx,
            session_events,
            index_events,
            peers: HashMap::new(),
            partial: HashMap::new(),
            choker: Choker::default(),
            rr_cursor: 0,
            _indexer: indexer,
            _watcher: watcher,
            _poller: poller,
        };
        let task = tokio::spawn(
            actor
                .run()
                .instrument(error_span!("folder", folder = %folder_id.fmt_short())),
        );
        Ok(Self {
            tx,
            folder_id,
            secret: params.secret,
            local_node: params.local_node,
            index,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        })
    }

    /// The folder this group serves.
    pub fn folder_id(&self) -> FolderId {
        self.folder_id
    }

    /// The folder secret.
    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    /// The node identity this group runs under.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// The folder index.
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// Dial side: hand an established stream to the group, which starts the
    /// session and sends the first handshake. Dropped silently when the peer
    /// is already connected.
    pub async fn connect_session<S>(&self, stream: S, remote_node: NodeId)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.tx
            .send(ToFolder::Connect {
                stream: Box::new(stream),
                remote: remote_node,
            })
            .await
            .ok();
    }

    /// Accept side: take over a connection whose first handshake was already
    /// read and routed here.
    pub async fn accept_session<S>(
        &self,
        framed: Framed<S, SessionCodec>,
        remote_node: NodeId,
        handshake: Handshake,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let parts = framed.into_parts();
        let mut boxed = FramedParts::new::<Frame>(Box::new(parts.io) as DynStream, parts.codec);
        boxed.read_buf = parts.read_buf;
        boxed.write_buf = parts.write_buf;
        let framed = Framed::from_parts(boxed);

        let (reply, result) = oneshot::channel();
        self.tx
            .send(ToFolder::Accept {
                framed,
                remote: remote_node,
                handshake,
                reply,
            })
            .await
            .map_err(|_| SessionError::Protocol)?;
        result.await.map_err(|_| SessionError::Protocol)?
    }

    /// Snapshot of folder state for the control plane.
    pub async fn state(&self) -> Option<FolderState> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ToFolder::CollectState(reply)).await.ok()?;
        rx.await.ok()
    }
}

struct PeerState {
    session: PeerSession,
    ready: bool,
    client_name: String,
    user_agent: String,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Chunks the peer claims to hold.
    claimed: HashSet<CtHash>,
    /// Bitfields announced for metas we do not have yet.
    pending_bitfields: HashMap<PathRevision, Bitfield>,
    /// Meta requests in flight toward this peer.
    requested_metas: HashSet<PathRevision>,
    /// Block requests in flight toward this peer.
    outstanding: HashSet<CtHash>,
}

impl PeerState {
    fn new(session: PeerSession) -> Self {
        Self {
            session,
            ready: false,
            client_name: String::new(),
            user_agent: String::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            claimed: HashSet::new(),
            pending_bitfields: HashMap::new(),
            requested_metas: HashSet::new(),
            outstanding: HashSet::new(),
        }
    }
}

struct PartialChunk {
    expected: u32,
    buf: Vec<u8>,
}

struct Actor {
    params: FolderParams,
    index: Arc<Index>,
    cipher: Option<ChunkCipher>,
    path_key: Option<[u8; 32]>,
    staging: PathBuf,
    suppressor: AssembleSuppressor,
    rx: mpsc::Receiver<ToFolder>,
    events_tx: mpsc::Sender<(NodeId, SessionEvent)>,
    session_events: mpsc::Receiver<(NodeId, SessionEvent)>,
    index_events: broadcast::Receiver<IndexEvent>,
    peers: HashMap<NodeId, PeerState>,
    partial: HashMap<CtHash, PartialChunk>,
    choker: Choker,
    rr_cursor: usize,
    _indexer: Option<IndexerQueue>,
    _watcher: Option<DirectoryWatcher>,
    _poller: Option<DirectoryPoller>,
}

impl Actor {
    async fn run(mut self) {
        // bring the index up to date with the tree before talking to anyone
        if let Some(indexer) = &self._indexer {
            if let Err(err) =
                DirectoryPoller::scan_once(&self.params.root, indexer, &self.index, &self.params.secret)
                    .await
            {
                warn!("initial scan failed: {err:#}");
            }
        }

        let mut rechoke = tokio::time::interval(self.params.rechoke_interval);
        rechoke.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pump = tokio::time::interval(self.params.pump_interval);
        pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ToFolder::Connect { stream, remote }) => {
                        self.connect_peer(stream, remote);
                    }
                    Some(ToFolder::Accept { framed, remote, handshake, reply }) => {
                        reply.send(self.accept_peer(framed, remote, handshake)).ok();
                    }
                    Some(ToFolder::CollectState(reply)) => {
                        reply.send(self.collect_state()).ok();
                    }
                    None => break,
                },
                event = self.session_events.recv() => {
                    if let Some((node, event)) = event {
                        self.handle_session_event(node, event).await;
                    }
                },
                event = self.index_events.recv() => match event {
                    Ok(event) => self.handle_index_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dropped index events, reannouncing everything");
                        self.announce_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = rechoke.tick() => self.rechoke().await,
                _ = pump.tick() => self.pump().await,
            }
        }
        debug!("folder group closed");
    }

    /// A peer may hold exactly one session per folder; the session is
    /// registered before it can emit a single event.
    fn admit(&self, remote: NodeId) -> Result<(), SessionError> {
        if remote == self.params.local_node {
            debug!("refusing session to ourselves");
            return Err(SessionError::Protocol);
        }
        if self.peers.contains_key(&remote) {
            debug!(peer = %remote.fmt_short(), "peer already connected, rejecting");
            return Err(SessionError::Protocol);
        }
        Ok(())
    }

    fn connect_peer(&mut self, stream: DynStream, remote: NodeId) {
        if self.admit(remote).is_err() {
            return;
        }
        let config = SessionConfig::new(self.params.secret.clone(), self.params.local_node, remote);
        let session = PeerSession::connect(stream, config, self.events_tx.clone());
        trace!(peer = %remote.fmt_short(), "dialed peer registered");
        self.peers.insert(remote, PeerState::new(session));
    }

    fn accept_peer(
        &mut self,
        framed: Framed<DynStream, SessionCodec>,
        remote: NodeId,
        handshake: Handshake,
    ) -> Result<(), SessionError> {
        self.admit(remote)?;
        let config = SessionConfig::new(self.params.secret.clone(), self.params.local_node, remote);
        let session = PeerSession::accept(framed, config, self.events_tx.clone(), handshake)?;
        trace!(peer = %remote.fmt_short(), "accepted peer registered");
        self.peers.insert(remote, PeerState::new(session));
        Ok(())
    }

    fn collect_state(&self) -> FolderState {
        FolderState {
            folder_id: self.params.secret.folder_id().to_hex(),
            peers: self
                .peers
                .values()
                .filter(|peer| peer.ready)
                .map(|peer| PeerInfo {
                    node: peer.session.remote_node().to_string(),
                    client_name: peer.client_name.clone(),
                    user_agent: peer.user_agent.clone(),
                    rtt_ms: peer.session.rtt().as_millis() as u64,
                    bytes_up: peer.session.counter().total_up(),
                    bytes_down: peer.session.counter().total_down(),
                })
                .collect(),
        }
    }

    async fn handle_index_event(&mut self, event: IndexEvent) {
        let IndexEvent::MetaAdded { meta, external } = event;
        let revision = meta.path_revision();
        trace!(
            path = %revision.path_id.fmt_short(),
            revision = revision.revision,
            external,
            "announcing meta"
        );
        let bitfield = self.local_bitfield(&meta);
        for peer in self.peers.values() {
            if peer.ready {
                peer.session
                    .post_have_meta(revision, bitfield.clone())
                    .await;
            }
        }
        if external {
            // directories, symlinks, tombstones and empty files carry no
            // chunks; they materialize straight away
            if meta.meta().chunks.is_empty() {
                if let Err(err) = self.materialize(&meta).await {
                    warn!("failed to apply meta: {err:#}");
                }
            }
            self.pump().await;
        }
    }

    async fn handle_session_event(&mut self, node: NodeId, event: SessionEvent) {
        match event {
            SessionEvent::Ready {
                client_name,
                user_agent,
            } => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.ready = true;
                    peer.client_name = client_name;
                    peer.user_agent = user_agent;
                }
                self.announce_to(node).await;
            }
            SessionEvent::Message(message) => self.handle_message(node, message).await,
            SessionEvent::Closed { reason } => {
                debug!(peer = %node.fmt_short(), ?reason, "peer session closed");
                self.peers.remove(&node);
                // outstanding requests toward the peer die with it; the next
                // pump re-routes the chunks to other holders
                self.pump().await;
            }
        }
    }

    /// Baseline announcement: everything we currently know, with our local
    /// bitfields.
    async fn announce_to(&mut self, node: NodeId) {
        let metas = match self.index.current_metas() {
            Ok(metas) => metas,
            Err(err) => {
                warn!("failed to read index for announcements: {err:#}");
                return;
            }
        };
        let Some(peer) = self.peers.get(&node) else {
            return;
        };
        for meta in metas {
            let bitfield = self.local_bitfield(&meta);
            peer.session
                .post_have_meta(meta.path_revision(), bitfield)
                .await;
        }
    }

    async fn announce_all(&mut self) {
        let nodes: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.ready)
            .map(|(node, _)| *node)
            .collect();
        for node in nodes {
            self.announce_to(node).await;
        }
    }

    async fn handle_message(&mut self, node: NodeId, message: Message) {
        match message {
            Message::Handshake(_) => {
                // the session consumes handshakes; seeing one here is a bug
                warn!("handshake leaked through session layer");
            }
            Message::Choke => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.peer_choking = true;
                    // the remote considers our outstanding requests cancelled
                    peer.outstanding.clear();
                }
            }
            Message::Unchoke => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.peer_choking = false;
                }
                self.pump().await;
            }
            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.peer_interested = true;
                }
                // give a fresh leecher a chance without waiting a full cycle
                self.rechoke().await;
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.peer_interested = false;
                }
            }
            Message::HaveMeta { revision, bitfield } => {
                self.handle_have_meta(node, revision, bitfield).await;
            }
            Message::HaveChunk { ct_hash } => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    peer.claimed.insert(ct_hash);
                }
            }
            Message::MetaRequest { revision } => {
                match self.index.get_meta(&revision) {
                    Ok(meta) => {
                        let bitfield = self.local_bitfield(&meta);
                        if let Some(peer) = self.peers.get(&node) {
                            peer.session.post_meta(meta, bitfield).await;
                        }
                    }
                    Err(err) => debug!("meta request for unknown record: {err}"),
                }
            }
            Message::MetaReply { meta, bitfield } => {
                self.handle_meta_reply(node, meta, bitfield).await;
            }
            Message::BlockRequest {
                ct_hash,
                offset,
                size,
            } => {
                self.handle_block_request(node, ct_hash, offset, size).await;
            }
            Message::BlockReply {
                ct_hash,
                offset,
                data,
            } => {
                self.handle_block_reply(node, ct_hash, offset, data).await;
            }
        }
    }

    async fn handle_have_meta(&mut self, node: NodeId, revision: PathRevision, bitfield: Bitfield) {
        match self.index.get_meta(&revision) {
            Ok(meta) => {
                if let Some(peer) = self.peers.get_mut(&node) {
                    apply_bitfield(peer, &meta, &bitfield);
                }
                return;
            }
            Err(skiff_sync::IndexError::NotFound) => {}
            Err(err) => {
                warn!("index lookup failed: {err:#}");
                return;
            }
        }
        // unknown records are fetched even when we already hold a newer
        // revision: losers of a revision race stay available as history,
        // they just never become the current view
        if let Ok(false) = self.index.put_allowed(&revision) {
            trace!(
                path = %revision.path_id.fmt_short(),
                revision = revision.revision,
                "fetching superseded revision for history"
            );
        }
        if let Some(peer) = self.peers.get_mut(&node) {
            peer.pending_bitfields.insert(revision, bitfield);
            if peer.requested_metas.insert(revision) {
                peer.session.request_meta(revision).await;
            }
        }
    }

    async fn handle_meta_reply(&mut self, node: NodeId, meta: SignedMeta, bitfield: Bitfield) {
        let revision = meta.path_revision();
        let Some(peer) = self.peers.get_mut(&node) else {
            return;
        };
        // replies are strictly answers to our requests
        if !peer.requested_metas.remove(&revision) {
            debug!("unsolicited meta reply, ignoring");
            return;
        }
        peer.pending_bitfields.remove(&revision);
        apply_bitfield(peer, &meta, &bitfield);

        match self.index.put_meta(&meta, false) {
            Ok(()) => {}
            Err(skiff_sync::IndexError::StaleRevision) => {
                trace!("meta reply lost a revision race");
            }
            Err(skiff_sync::IndexError::BadSignature) => {
                // a member would never produce this; drop the session
                warn!(peer = %node.fmt_short(), "bad signature from peer, closing session");
                if let Some(peer) = self.peers.remove(&node) {
                    peer.session.close().await;
                }
            }
            Err(err) => warn!("failed to store meta: {err:#}"),
        }
    }

    async fn handle_block_request(&mut self, node: NodeId, ct_hash: CtHash, offset: u32, size: u32) {
        let ciphertext = match self.load_chunk(&ct_hash).await {
            Ok(ciphertext) => ciphertext,
            Err(err) => {
                debug!(chunk = %ct_hash.fmt_short(), "cannot serve block: {err:#}");
                return;
            }
        };
        let start = (offset as usize).min(ciphertext.len());
        let end = (offset as usize + size as usize).min(ciphertext.len());
        let Some(peer) = self.peers.get(&node) else {
            return;
        };
        peer.session
            .post_block(ct_hash, offset, ciphertext.slice(start..end))
            .await;
    }

    async fn handle_block_reply(&mut self, node: NodeId, ct_hash: CtHash, offset: u32, data: Bytes) {
        if let Some(peer) = self.peers.get_mut(&node) {
            peer.outstanding.remove(&ct_hash);
        }
        let expected = match self.index.get_chunk_size_iv(&ct_hash) {
            Ok((size, _)) => size,
            Err(_) => {
                debug!(chunk = %ct_hash.fmt_short(), "block reply for unknown chunk");
                return;
            }
        };
        let partial = self.partial.entry(ct_hash).or_insert_with(|| PartialChunk {
            expected,
            buf: Vec::with_capacity(expected as usize),
        });
        if offset as usize != partial.buf.len() {
            // out of order; drop and let the scheduler re-request
            debug!(chunk = %ct_hash.fmt_short(), "out of order block, discarding partial");
            self.partial.remove(&ct_hash);
            return;
        }
        partial.buf.extend_from_slice(&data);
        if (partial.buf.len() as u32) < partial.expected {
            return;
        }
        let assembled = self.partial.remove(&ct_hash).expect("present").buf;
        if CtHash::new(&assembled) != ct_hash {
            warn!(chunk = %ct_hash.fmt_short(), "block data fails verification, discarding");
            return;
        }
        if let Err(err) = self.store_chunk(ct_hash, &assembled).await {
            warn!("failed to store chunk: {err:#}");
            return;
        }
        trace!(chunk = %ct_hash.fmt_short(), "chunk assembled");
        for peer in self.peers.values() {
            if peer.ready {
                peer.session.post_have_chunk(ct_hash).await;
            }
        }
        self.try_assemble_files(&ct_hash).await;
        self.pump().await;
    }

    async fn store_chunk(&self, ct_hash: CtHash, ciphertext: &[u8]) -> Result<()> {
        let path = self.chunk_path(&ct_hash);
        tokio::fs::write(&path, ciphertext).await?;
        self.index
            .mark_chunk_assembled(&ct_hash, ciphertext.len() as u32)?;
        Ok(())
    }

    fn chunk_path(&self, ct_hash: &CtHash) -> PathBuf {
        self.staging.join(ct_hash.to_hex())
    }

    /// Fetch a chunk's ciphertext: from the staging cache, or re-derived
    /// from the assembled plaintext on disk (sealing is deterministic, so
    /// the bytes come out address-exact).
    async fn load_chunk(&self, ct_hash: &CtHash) -> Result<Bytes> {
        let cached = self.chunk_path(ct_hash);
        match tokio::fs::read(&cached).await {
            Ok(ciphertext) => {
                if CtHash::new(&ciphertext) == *ct_hash {
                    return Ok(Bytes::from(ciphertext));
                }
                debug!("staging file corrupt, removing");
                tokio::fs::remove_file(&cached).await.ok();
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let (Some(cipher), Some(path_key)) = (&self.cipher, &self.path_key) else {
            bail!("chunk not in staging and no read capability to re-derive it");
        };
        for signed in self.index.containing_chunk(ct_hash)? {
            let meta = signed.meta();
            if meta.kind != MetaKind::File || !self.index.is_assembled_path(&meta.path_id)? {
                continue;
            }
            let Some(idx) = meta.chunk_index(ct_hash) else {
                continue;
            };
            let rel = match meta.encrypted_path.open(path_key) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let Some(target) = safe_join(&self.params.root, &rel) else {
                continue;
            };
            let info = &meta.chunks[idx];
            let mut file = match tokio::fs::File::open(&target).await {
                Ok(file) => file,
                Err(_) => continue,
            };
            let mut plaintext = vec![0u8; info.plaintext_size() as usize];
            if file
                .seek(std::io::SeekFrom::Start(meta.chunk_plaintext_offset(idx)))
                .await
                .is_err()
                || file.read_exact(&mut plaintext).await.is_err()
            {
                continue;
            }
            let sealed = cipher.seal(&plaintext)?;
            if sealed.info.ct_hash == *ct_hash {
                return Ok(sealed.ciphertext);
            }
            // the file changed under us since that revision
        }
        bail!("chunk {} is not available locally", ct_hash.fmt_short())
    }

    /// Materialize every file that just became complete with this chunk.
    async fn try_assemble_files(&self, ct_hash: &CtHash) {
        let containing = match self.index.containing_chunk(ct_hash) {
            Ok(containing) => containing,
            Err(err) => {
                warn!("index lookup failed: {err:#}");
                return;
            }
        };
        for signed in containing {
            let meta = signed.meta();
            let current = match self.index.current_meta(&meta.path_id) {
                Ok(Some(current)) => current,
                _ => continue,
            };
            if current.meta().revision != meta.revision {
                continue;
            }
            if self
                .index
                .is_assembled_path(&meta.path_id)
                .unwrap_or(false)
            {
                continue;
            }
            let complete = meta.chunks.iter().all(|chunk| {
                self.index
                    .is_assembled_chunk(&chunk.ct_hash)
                    .unwrap_or(false)
            });
            if !complete {
                continue;
            }
            if let Err(err) = self.materialize(&signed).await {
                warn!(
                    path = %meta.path_id.fmt_short(),
                    "failed to assemble file: {err:#}"
                );
            }
        }
    }

    /// Write the object a meta record describes into the synchronized tree.
    async fn materialize(&self, signed: &SignedMeta) -> Result<()> {
        let meta = signed.meta();
        let (Some(cipher), Some(path_key)) = (&self.cipher, &self.path_key) else {
            // download-only folders route ciphertext, nothing else
            return Ok(());
        };
        let rel = meta
            .encrypted_path
            .open(path_key)
            .context("cannot decrypt path")?;
        let target =
            safe_join(&self.params.root, &rel).context("announced path escapes the folder")?;

        match meta.kind {
            MetaKind::Directory => {
                self.suppressor
                    .prepare_assemble(&target, meta.kind, false);
                tokio::fs::create_dir_all(&target).await?;
            }
            MetaKind::Deleted => {
                match tokio::fs::symlink_metadata(&target).await {
                    Ok(stat) => {
                        self.suppressor.prepare_assemble(&target, meta.kind, true);
                        if stat.is_dir() {
                            tokio::fs::remove_dir_all(&target).await?;
                        } else {
                            tokio::fs::remove_file(&target).await?;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            MetaKind::Symlink => {
                let link_target = meta
                    .symlink_target
                    .as_ref()
                    .context("symlink meta without target")?
                    .open(path_key)
                    .context("cannot decrypt symlink target")?;
                let link_target = String::from_utf8(link_target)?;
                self.suppressor
                    .prepare_assemble(&target, meta.kind, target.exists());
                if tokio::fs::symlink_metadata(&target).await.is_ok() {
                    tokio::fs::remove_file(&target).await.ok();
                }
                #[cfg(unix)]
                tokio::fs::symlink(link_target, &target).await?;
                #[cfg(not(unix))]
                debug!(link = %link_target, "symlinks unsupported on this platform");
            }
            MetaKind::File => {
                let mut plaintext = Vec::with_capacity(meta.size as usize);
                for info in &meta.chunks {
                    let ciphertext = self.load_chunk(&info.ct_hash).await?;
                    let decrypted = cipher
                        .open(info, &ciphertext)
                        .context("chunk failed to decrypt")?;
                    plaintext.extend_from_slice(&decrypted);
                }
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.suppressor
                    .prepare_assemble(&target, meta.kind, target.exists());
                tokio::fs::write(&target, &plaintext).await?;
                // keep the on-disk mtime aligned with the record so the
                // indexer's change detection sees the file as clean
                let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(meta.mtime.max(0) as u64);
                let file = std::fs::File::options().write(true).open(&target)?;
                file.set_modified(mtime).ok();
            }
        }
        self.index.set_assembled(&meta.path_id)?;
        trace!(path = %meta.path_id.fmt_short(), "assembled");
        Ok(())
    }

    fn local_bitfield(&self, meta: &SignedMeta) -> Bitfield {
        let chunks = &meta.meta().chunks;
        let mut bitfield = Bitfield::new(chunks.len());
        for (idx, chunk) in chunks.iter().enumerate() {
            if self
                .index
                .is_assembled_chunk(&chunk.ct_hash)
                .unwrap_or(false)
            {
                bitfield.set(idx, true);
            }
        }
        bitfield
    }

    /// The request scheduler: route every missing chunk to an unchoked peer
    /// claiming it, round-robin, within the per-peer outstanding cap.
    async fn pump(&mut self) {
        let incomplete = match self.index.incomplete_meta() {
            Ok(incomplete) => incomplete,
            Err(err) => {
                warn!("failed to list incomplete metas: {err:#}");
                return;
            }
        };
        let mut wanted: Vec<(CtHash, u32)> = Vec::new();
        let mut seen = HashSet::new();
        for signed in &incomplete {
            for chunk in &signed.meta().chunks {
                if !seen.insert(chunk.ct_hash) {
                    continue;
                }
                if self
                    .index
                    .is_assembled_chunk(&chunk.ct_hash)
                    .unwrap_or(false)
                {
                    continue;
                }
                if self
                    .peers
                    .values()
                    .any(|peer| peer.outstanding.contains(&chunk.ct_hash))
                {
                    continue;
                }
                if self.partial.contains_key(&chunk.ct_hash) {
                    continue;
                }
                wanted.push((chunk.ct_hash, chunk.size));
            }
        }

        self.update_interest(&wanted).await;

        if wanted.is_empty() || self.peers.is_empty() {
            return;
        }
        let nodes: Vec<NodeId> = self.peers.keys().copied().collect();
        for (ct_hash, size) in wanted {
            let start = self.rr_cursor;
            self.rr_cursor = self.rr_cursor.wrapping_add(1);
            let picked = (0..nodes.len())
                .map(|i| nodes[(start + i) % nodes.len()])
                .find(|node| {
                    self.peers
                        .get(node)
                        .map(|peer| {
                            peer.ready
                                && !peer.peer_choking
                                && peer.claimed.contains(&ct_hash)
                                && peer.outstanding.len() < self.params.outstanding_per_peer
                        })
                        .unwrap_or(false)
                });
            if let Some(node) = picked {
                let peer = self.peers.get_mut(&node).expect("picked from keys");
                peer.outstanding.insert(ct_hash);
                trace!(chunk = %ct_hash.fmt_short(), peer = %node.fmt_short(), "requesting block");
                peer.session.request_block(ct_hash, 0, size).await;
            }
        }
    }

    /// Keep the interest flags in line with what each peer can give us.
    async fn update_interest(&mut self, wanted: &[(CtHash, u32)]) {
        for peer in self.peers.values_mut() {
            if !peer.ready {
                continue;
            }
            let useful = wanted
                .iter()
                .any(|(ct_hash, _)| peer.claimed.contains(ct_hash))
                || !peer.pending_bitfields.is_empty();
            if useful && !peer.am_interested {
                peer.am_interested = true;
                peer.session.interest().await;
            } else if !useful && peer.am_interested {
                peer.am_interested = false;
                peer.session.uninterest().await;
            }
        }
    }

    /// Re-rank peers by recent upload contribution and apply the choke diff.
    async fn rechoke(&mut self) {
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.ready)
            .map(|(node, peer)| ChokeCandidate {
                node: *node,
                recent_download: peer.session.counter().recent_down(),
                interested: peer.peer_interested,
            })
            .collect();
        let unchoked: HashSet<NodeId> = self.choker.rechoke(candidates).into_iter().collect();
        for (node, peer) in self.peers.iter_mut() {
            if !peer.ready {
                continue;
            }
            let should_unchoke = unchoked.contains(node);
            if should_unchoke && peer.am_choking {
                peer.am_choking = false;
                peer.session.unchoke().await;
            } else if !should_unchoke && !peer.am_choking {
                peer.am_choking = true;
                peer.session.choke().await;
            }
        }
    }
}

fn apply_bitfield(peer: &mut PeerState, meta: &SignedMeta, bitfield: &Bitfield) {
    for (idx, chunk) in meta.meta().chunks.iter().enumerate() {
        if bitfield.get(idx) {
            peer.claimed.insert(chunk.ct_hash);
        }
    }
}

/// Join a folder-relative path onto the root, refusing anything that could
/// escape it.
fn safe_join(root: &Path, rel: &[u8]) -> Option<PathBuf> {
    let rel = std::str::from_utf8(rel).ok()?;
    let rel = Path::new(rel);
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out == root {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_blocks_escapes() {
        let root = Path::new("/sync");
        assert_eq!(
            safe_join(root, b"a/b.txt"),
            Some(PathBuf::from("/sync/a/b.txt"))
        );
        assert_eq!(safe_join(root, b"../etc/passwd"), None);
        assert_eq!(safe_join(root, b"/etc/passwd"), None);
        assert_eq!(safe_join(root, b""), None);
        assert_eq!(safe_join(root, b"./ok.txt"), Some(PathBuf::from("/sync/ok.txt")));
    }
}
