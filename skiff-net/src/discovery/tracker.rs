//! BitTorrent UDP tracker discovery.
//!
//! Folders are announced to a standard UDP tracker (BEP 15): connect,
//! announce, collect the returned peer list. The `info_hash` is the first 20
//! bytes of the folder id and the `peer_id` is an azureus-style client tag
//! followed by the node digest, so other skiff nodes are recognizable in the
//! swarm.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::FolderId;

use super::{Discovery, PeerCandidate};

const PROVENANCE: &str = "tracker";

const PROTOCOL_MAGIC: u64 = 0x417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const EVENT_NONE: u32 = 0;
const EVENT_STARTED: u32 = 2;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_REANNOUNCE: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Default azureus-style client tag in the peer id.
pub const DEFAULT_AZUREUS_ID: &str = "-SK0001-";

/// Tracker endpoint and identity configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Tracker address, `udp://host:port`.
    pub url: String,
    /// Eight byte client tag prefixed to the peer id.
    pub azureus_id: String,
    /// Peer-connection port carried in announcements.
    pub listen_port: u16,
}

impl TrackerConfig {
    /// Config with the default client tag.
    pub fn new(url: String, listen_port: u16) -> Self {
        Self {
            url,
            azureus_id: DEFAULT_AZUREUS_ID.to_string(),
            listen_port,
        }
    }
}

enum ToActor {
    AddFolder(FolderId),
    RemoveFolder(FolderId),
    Subscribe(mpsc::Sender<PeerCandidate>),
    Candidates(Vec<PeerCandidate>),
}

/// Announce loop against one UDP tracker.
#[derive(Debug)]
pub struct TrackerDiscovery {
    tx: mpsc::Sender<ToActor>,
    _task: AbortOnDropHandle<()>,
}

impl TrackerDiscovery {
    /// Start the announcer for one tracker.
    pub fn spawn(config: TrackerConfig, node_digest: [u8; 32]) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = Actor {
            config: config.clone(),
            node_digest,
            tx: tx.clone(),
            rx,
            folders: HashMap::new(),
            subscribers: Vec::new(),
        };
        let task = tokio::spawn(
            actor
                .run()
                .instrument(error_span!("tracker", url = %config.url)),
        );
        Self {
            tx,
            _task: AbortOnDropHandle::new(task),
        }
    }
}

impl Discovery for TrackerDiscovery {
    fn add_folder(&self, folder_id: FolderId) {
        self.tx.try_send(ToActor::AddFolder(folder_id)).ok();
    }

    fn remove_folder(&self, folder_id: FolderId) {
        self.tx.try_send(ToActor::RemoveFolder(folder_id)).ok();
    }

    fn subscribe(&self) -> mpsc::Receiver<PeerCandidate> {
        let (tx, rx) = mpsc::channel(64);
        self.tx.try_send(ToActor::Subscribe(tx)).ok();
        rx
    }
}

struct Actor {
    config: TrackerConfig,
    node_digest: [u8; 32],
    tx: mpsc::Sender<ToActor>,
    rx: mpsc::Receiver<ToActor>,
    folders: HashMap<FolderId, AbortOnDropHandle<()>>,
    subscribers: Vec<mpsc::Sender<PeerCandidate>>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ToActor::AddFolder(folder) => {
                    if self.folders.contains_key(&folder) {
                        continue;
                    }
                    let loop_task = AnnounceLoop {
                        config: self.config.clone(),
                        node_digest: self.node_digest,
                        folder,
                        out: self.tx.clone(),
                    };
                    let span = error_span!("announce", folder = %folder.fmt_short());
                    let handle =
                        AbortOnDropHandle::new(tokio::spawn(loop_task.run().instrument(span)));
                    self.folders.insert(folder, handle);
                }
                ToActor::RemoveFolder(folder) => {
                    self.folders.remove(&folder);
                }
                ToActor::Subscribe(tx) => self.subscribers.push(tx),
                ToActor::Candidates(candidates) => {
                    for candidate in candidates {
                        self.subscribers
                            .retain(|tx| tx.try_send(candidate.clone()).is_ok() || !tx.is_closed());
                    }
                }
            }
        }
    }
}

struct AnnounceLoop {
    config: TrackerConfig,
    node_digest: [u8; 32],
    folder: FolderId,
    out: mpsc::Sender<ToActor>,
}

impl AnnounceLoop {
    async fn run(self) {
        let mut event = EVENT_STARTED;
        let mut failures = 0u32;
        loop {
            match self.announce_once(event).await {
                Ok((candidates, interval)) => {
                    failures = 0;
                    event = EVENT_NONE;
                    debug!(
                        peers = candidates.len(),
                        ?interval,
                        "tracker announce succeeded"
                    );
                    if !candidates.is_empty()
                        && self.out.send(ToActor::Candidates(candidates)).await.is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(interval.max(MIN_REANNOUNCE)).await;
                }
                Err(err) => {
                    // per BEP 15: 15s * 2^n, capped
                    let backoff = Duration::from_secs(15)
                        .saturating_mul(1 << failures.min(8))
                        .min(MAX_BACKOFF);
                    failures += 1;
                    warn!("tracker announce failed, retrying in {backoff:?}: {err:#}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn announce_once(&self, event: u32) -> Result<(Vec<PeerCandidate>, Duration)> {
        let target = resolve_tracker(&self.config.url).await?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to bind tracker socket")?;
        socket.connect(target).await.context("tracker connect")?;

        let connection_id = self.handshake(&socket).await?;
        self.announce(&socket, connection_id, event).await
    }

    /// The connect round trip establishing a connection id.
    async fn handshake(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut request = BytesMut::with_capacity(16);
        request.put_u64(PROTOCOL_MAGIC);
        request.put_u32(ACTION_CONNECT);
        request.put_u32(transaction_id);
        socket.send(&request).await?;

        let mut buf = [0u8; 16];
        let len = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("tracker connect timed out")??;
        if len < 16 {
            bail!("short connect response: {len} bytes");
        }
        let mut response = &buf[..len];
        let action = response.get_u32();
        let txid = response.get_u32();
        if action != ACTION_CONNECT || txid != transaction_id {
            bail!("unexpected connect response (action {action})");
        }
        Ok(response.get_u64())
    }

    async fn announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        event: u32,
    ) -> Result<(Vec<PeerCandidate>, Duration)> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut request = BytesMut::with_capacity(98);
        request.put_u64(connection_id);
        request.put_u32(ACTION_ANNOUNCE);
        request.put_u32(transaction_id);
        request.put_slice(&info_hash(&self.folder));
        request.put_slice(&peer_id(&self.config.azureus_id, &self.node_digest));
        request.put_u64(0); // downloaded
        request.put_u64(0); // left
        request.put_u64(0); // uploaded
        request.put_u32(event);
        request.put_u32(0); // ip: let the tracker use the source address
        request.put_u32(rand::thread_rng().gen()); // key
        request.put_i32(-1); // num_want
        request.put_u16(self.config.listen_port);
        socket.send(&request).await?;

        let mut buf = vec![0u8; 1500];
        let len = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("tracker announce timed out")??;
        if len < 20 {
            bail!("short announce response: {len} bytes");
        }
        let mut response = &buf[..len];
        let action = response.get_u32();
        let txid = response.get_u32();
        if action != ACTION_ANNOUNCE || txid != transaction_id {
            bail!("unexpected announce response (action {action})");
        }
        let interval = Duration::from_secs(response.get_u32() as u64);
        let _leechers = response.get_u32();
        let _seeders = response.get_u32();

        let mut candidates = Vec::new();
        while response.remaining() >= 6 {
            let ip = Ipv4Addr::from(response.get_u32());
            let port = response.get_u16();
            if port == 0 {
                continue;
            }
            let candidate = PeerCandidate {
                folder_id: self.folder,
                endpoint: SocketAddr::new(IpAddr::V4(ip), port),
                source: PROVENANCE,
            };
            trace!(?candidate, "tracker returned peer");
            candidates.push(candidate);
        }
        Ok((candidates, interval))
    }
}

/// `info_hash` for a folder: the first 20 bytes of its id.
pub fn info_hash(folder: &FolderId) -> [u8; 20] {
    folder.as_bytes()[..20].try_into().expect("id is 32 bytes")
}

/// Azureus-style peer id: eight byte client tag plus twelve digest bytes.
pub fn peer_id(azureus_id: &str, node_digest: &[u8; 32]) -> [u8; 20] {
    let mut id = [0u8; 20];
    let tag = if azureus_id.len() == 8 {
        azureus_id.as_bytes()
    } else {
        DEFAULT_AZUREUS_ID.as_bytes()
    };
    id[..8].copy_from_slice(tag);
    id[8..].copy_from_slice(&node_digest[..12]);
    id
}

async fn resolve_tracker(url: &str) -> Result<SocketAddr> {
    let rest = url
        .strip_prefix("udp://")
        .with_context(|| format!("unsupported tracker url: {url}"))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    tokio::net::lookup_host(authority)
        .await
        .with_context(|| format!("failed to resolve tracker {authority}"))?
        .next()
        .with_context(|| format!("tracker {authority} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_layout() {
        let digest = [0xabu8; 32];
        let id = peer_id("-SK0001-", &digest);
        assert_eq!(&id[..8], b"-SK0001-");
        assert_eq!(&id[8..], &digest[..12]);
        // malformed tags fall back to the default
        let id = peer_id("oops", &digest);
        assert_eq!(&id[..8], DEFAULT_AZUREUS_ID.as_bytes());
    }

    #[test]
    fn info_hash_is_folder_prefix() {
        let folder = FolderId::from_bytes([3u8; 32]);
        assert_eq!(info_hash(&folder), [3u8; 20]);
    }

    /// Minimal in-process tracker speaking enough of BEP 15 for one
    /// connect/announce round.
    async fn fake_tracker(peers: Vec<(Ipv4Addr, u16)>) -> SocketAddr {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut request = &buf[..len];
                if len >= 16 && request.get_u64() == PROTOCOL_MAGIC {
                    // connect
                    let _action = request.get_u32();
                    let txid = request.get_u32();
                    let mut response = BytesMut::new();
                    response.put_u32(ACTION_CONNECT);
                    response.put_u32(txid);
                    response.put_u64(0x1122334455667788);
                    socket.send_to(&response, from).await.ok();
                } else if len >= 98 {
                    // announce
                    let mut request = &buf[..len];
                    let _connection_id = request.get_u64();
                    let _action = request.get_u32();
                    let txid = request.get_u32();
                    let mut response = BytesMut::new();
                    response.put_u32(ACTION_ANNOUNCE);
                    response.put_u32(txid);
                    response.put_u32(1800); // interval
                    response.put_u32(1); // leechers
                    response.put_u32(1); // seeders
                    for (ip, port) in &peers {
                        response.put_u32(u32::from(*ip));
                        response.put_u16(*port);
                    }
                    socket.send_to(&response, from).await.ok();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn announce_roundtrip_against_fake_tracker() {
        let tracker_addr = fake_tracker(vec![(Ipv4Addr::new(10, 0, 0, 7), 31337)]).await;
        let config = TrackerConfig::new(format!("udp://{tracker_addr}"), 4242);
        let discovery = TrackerDiscovery::spawn(config, [6u8; 32]);

        let mut candidates = discovery.subscribe();
        let folder = FolderId::from_bytes([8u8; 32]);
        discovery.add_folder(folder);

        let candidate = tokio::time::timeout(Duration::from_secs(10), candidates.recv())
            .await
            .expect("timed out waiting for tracker candidate")
            .expect("discovery closed");
        assert_eq!(candidate.folder_id, folder);
        assert_eq!(
            candidate.endpoint,
            SocketAddr::from(([10, 0, 0, 7], 31337))
        );
        assert_eq!(candidate.source, "tracker");
    }
}
