//! Local multicast discovery.
//!
//! Periodically announces `{port, peer_id, community_id}` for every
//! registered folder to a configured IPv4 and IPv6 group, and turns received
//! announcements into peer candidates. Own announcements are recognized by
//! the node digest and skipped.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::FolderId;

use super::{Discovery, PeerCandidate};

const PROVENANCE: &str = "multicast";
const MAX_ANNOUNCEMENT_SIZE: usize = 512;

/// Multicast group and cadence configuration.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// IPv4 group address.
    pub group_v4: Ipv4Addr,
    /// IPv6 group address.
    pub group_v6: Ipv6Addr,
    /// UDP port the groups use.
    pub port: u16,
    /// How often each folder is announced.
    pub repeat_interval: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group_v4: Ipv4Addr::new(239, 51, 38, 65),
            group_v6: "ff08::bd02".parse().expect("valid group"),
            port: 28914,
            repeat_interval: Duration::from_secs(30),
        }
    }
}

/// One announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Announcement {
    /// Where the sender accepts peer connections.
    port: u16,
    /// The sender's node digest.
    peer_id: [u8; 32],
    /// The announced folder.
    community_id: FolderId,
}

enum ToActor {
    AddFolder(FolderId),
    RemoveFolder(FolderId),
    Subscribe(mpsc::Sender<PeerCandidate>),
}

/// Multicast announcer and listener.
#[derive(Debug)]
pub struct MulticastDiscovery {
    tx: mpsc::Sender<ToActor>,
    _task: AbortOnDropHandle<()>,
}

impl MulticastDiscovery {
    /// Join the groups and start announcing.
    ///
    /// `node_digest` identifies our own datagrams, `listen_port` is the
    /// peer-connection port carried in the announcement.
    pub async fn spawn(
        config: MulticastConfig,
        node_digest: [u8; 32],
        listen_port: u16,
    ) -> Result<Self> {
        let socket_v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .context("failed to bind multicast socket")?;
        socket_v4
            .join_multicast_v4(config.group_v4, Ipv4Addr::UNSPECIFIED)
            .context("failed to join IPv4 multicast group")?;

        // v6 is best effort; plenty of hosts have no usable v6 interface
        let socket_v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, config.port + 1)).await {
            Ok(socket) => match socket.join_multicast_v6(&config.group_v6, 0) {
                Ok(()) => Some(Arc::new(socket)),
                Err(err) => {
                    debug!("IPv6 multicast unavailable: {err}");
                    None
                }
            },
            Err(err) => {
                debug!("IPv6 multicast bind failed: {err}");
                None
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let actor = Actor {
            config,
            node_digest,
            listen_port,
            socket_v4: Arc::new(socket_v4),
            socket_v6,
            rx,
            folders: HashSet::new(),
            subscribers: Vec::new(),
        };
        let task = tokio::spawn(actor.run().instrument(error_span!("multicast")));
        Ok(Self {
            tx,
            _task: AbortOnDropHandle::new(task),
        })
    }
}

impl Discovery for MulticastDiscovery {
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
    config: MulticastConfig,
    node_digest: [u8; 32],
    listen_port: u16,
    socket_v4: Arc<UdpSocket>,
    socket_v6: Option<Arc<UdpSocket>>,
    rx: mpsc::Receiver<ToActor>,
    folders: HashSet<FolderId>,
    subscribers: Vec<mpsc::Sender<PeerCandidate>>,
}

impl Actor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.repeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf_v4 = [0u8; MAX_ANNOUNCEMENT_SIZE];
        let mut buf_v6 = [0u8; MAX_ANNOUNCEMENT_SIZE];
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ToActor::AddFolder(folder)) => {
                        if self.folders.insert(folder) {
                            self.announce_folder(&folder).await;
                        }
                    }
                    Some(ToActor::RemoveFolder(folder)) => {
                        self.folders.remove(&folder);
                    }
                    Some(ToActor::Subscribe(tx)) => self.subscribers.push(tx),
                    None => break,
                },
                _ = ticker.tick() => {
                    let folders: Vec<FolderId> = self.folders.iter().copied().collect();
                    for folder in &folders {
                        self.announce_folder(folder).await;
                    }
                },
                recv = self.socket_v4.recv_from(&mut buf_v4) => {
                    match recv {
                        Ok((len, from)) => self.handle_datagram(&buf_v4[..len], from).await,
                        Err(err) => {
                            warn!("multicast receive failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                },
                recv = recv_optional(&self.socket_v6, &mut buf_v6) => {
                    if let Ok((len, from)) = recv {
                        let datagram = buf_v6[..len].to_vec();
                        self.handle_datagram(&datagram, from).await;
                    }
                },
            }
        }
    }

    async fn announce_folder(&self, folder: &FolderId) {
        let announcement = Announcement {
            port: self.listen_port,
            peer_id: self.node_digest,
            community_id: *folder,
        };
        let payload = match postcard::to_stdvec(&announcement) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode announcement: {err}");
                return;
            }
        };
        let target_v4 = SocketAddr::from((self.config.group_v4, self.config.port));
        match self.socket_v4.send_to(&payload, target_v4).await {
            Ok(_) => trace!(folder = %folder.fmt_short(), "announced on IPv4 group"),
            Err(err) => debug!("IPv4 announcement failed: {err}"),
        }
        if let Some(socket_v6) = &self.socket_v6 {
            let target_v6 = SocketAddr::from((self.config.group_v6, self.config.port + 1));
            if let Err(err) = socket_v6.send_to(&payload, target_v6).await {
                debug!("IPv6 announcement failed: {err}");
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let announcement: Announcement = match postcard::from_bytes(datagram) {
            Ok(announcement) => announcement,
            Err(err) => {
                trace!(%from, "undecodable announcement: {err}");
                return;
            }
        };
        if announcement.peer_id == self.node_digest {
            return;
        }
        let candidate = PeerCandidate {
            folder_id: announcement.community_id,
            endpoint: SocketAddr::new(from.ip(), announcement.port),
            source: PROVENANCE,
        };
        trace!(?candidate, "received announcement");
        self.subscribers
            .retain(|tx| tx.try_send(candidate.clone()).is_ok() || !tx.is_closed());
    }
}

async fn recv_optional(
    socket: &Option<Arc<UdpSocket>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_roundtrip() {
        let announcement = Announcement {
            port: 32021,
            peer_id: [7u8; 32],
            community_id: FolderId::from_bytes([9u8; 32]),
        };
        let bytes = postcard::to_stdvec(&announcement).unwrap();
        assert!(bytes.len() <= MAX_ANNOUNCEMENT_SIZE);
        let back: Announcement = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, announcement);
    }

    #[tokio::test]
    async fn two_nodes_find_each_other() {
        // both ends share one group on localhost; loopback multicast may be
        // unavailable in some sandboxes, so treat setup failure as a skip
        let config = MulticastConfig {
            repeat_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let folder = FolderId::from_bytes([5u8; 32]);

        let Ok(a) = MulticastDiscovery::spawn(config.clone(), [1u8; 32], 10001).await else {
            eprintln!("skipping: multicast unavailable");
            return;
        };
        let Ok(b) = MulticastDiscovery::spawn(config, [2u8; 32], 10002).await else {
            eprintln!("skipping: multicast unavailable");
            return;
        };

        let mut candidates = a.subscribe();
        b.add_folder(folder);

        match tokio::time::timeout(Duration::from_secs(5), candidates.recv()).await {
            Ok(Some(candidate)) => {
                assert_eq!(candidate.folder_id, folder);
                assert_eq!(candidate.endpoint.port(), 10002);
                assert_eq!(candidate.source, "multicast");
            }
            _ => eprintln!("skipping: no loopback multicast delivery"),
        }
    }
}
