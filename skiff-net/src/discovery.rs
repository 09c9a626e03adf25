//! Peer discovery.
//!
//! Every sub-source produces [`PeerCandidate`]s for the folders it was told
//! to announce. The [`CompositeDiscovery`] fans folder registration out to
//! all sources and merges their candidate streams, suppressing duplicates
//! within a window so one peer announced by multicast and a tracker at the
//! same time results in a single dial attempt.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::trace;

use skiff_base::FolderId;

pub mod multicast;
pub mod tracker;

/// Window within which repeat candidates are suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

const CANDIDATE_CAP: usize = 256;

/// A possible peer for a folder, as produced by one discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    /// The folder the peer was announced for.
    pub folder_id: FolderId,
    /// Where to dial.
    pub endpoint: SocketAddr,
    /// Which source produced the candidate.
    pub source: &'static str,
}

/// One source of peer candidates.
pub trait Discovery: fmt::Debug + Send + Sync {
    /// Start announcing and resolving this folder.
    fn add_folder(&self, folder_id: FolderId);

    /// Stop announcing this folder.
    fn remove_folder(&self, folder_id: FolderId);

    /// A fresh stream of candidates from this source.
    fn subscribe(&self) -> mpsc::Receiver<PeerCandidate>;
}

/// Merges several discovery sources into one deduplicated candidate stream.
#[derive(Debug, Default)]
pub struct CompositeDiscovery {
    sources: Vec<Box<dyn Discovery>>,
    dedup_window: Option<Duration>,
}

impl CompositeDiscovery {
    /// Empty composite with the default dedup window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the dedup window, mostly for tests.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }

    /// Add a source.
    pub fn add(&mut self, source: impl Discovery + 'static) {
        self.sources.push(Box::new(source));
    }

    /// Merged, deduplicated candidate stream across all sources.
    ///
    /// The returned guard keeps the merge tasks alive; drop it together with
    /// the receiver.
    pub fn candidates(&self) -> (mpsc::Receiver<PeerCandidate>, CandidateTasks) {
        let window = self.dedup_window.unwrap_or(DEFAULT_DEDUP_WINDOW);
        let (tx, rx) = mpsc::channel(CANDIDATE_CAP);
        let seen: Arc<Mutex<HashMap<(FolderId, SocketAddr), Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let mut sub = source.subscribe();
            let tx = tx.clone();
            let seen = seen.clone();
            tasks.push(AbortOnDropHandle::new(tokio::spawn(async move {
                while let Some(candidate) = sub.recv().await {
                    if is_duplicate(&seen, &candidate, window) {
                        trace!(?candidate, "suppressing duplicate candidate");
                        continue;
                    }
                    if tx.send(candidate).await.is_err() {
                        break;
                    }
                }
            })));
        }
        (rx, CandidateTasks { _tasks: tasks })
    }
}

impl Discovery for CompositeDiscovery {
    fn add_folder(&self, folder_id: FolderId) {
        for source in &self.sources {
            source.add_folder(folder_id);
        }
    }

    fn remove_folder(&self, folder_id: FolderId) {
        for source in &self.sources {
            source.remove_folder(folder_id);
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<PeerCandidate> {
        let (rx, tasks) = self.candidates();
        // subscribers through the trait keep the tasks alive via a leak-free
        // forwarding task bound to the receiver's lifetime
        let (tx, out) = mpsc::channel(CANDIDATE_CAP);
        tokio::spawn(async move {
            let _tasks = tasks;
            let mut rx = rx;
            while let Some(candidate) = rx.recv().await {
                if tx.send(candidate).await.is_err() {
                    break;
                }
            }
        });
        out
    }
}

/// Keeps the composite's merge tasks running.
#[derive(Debug)]
pub struct CandidateTasks {
    _tasks: Vec<AbortOnDropHandle<()>>,
}

fn is_duplicate(
    seen: &Mutex<HashMap<(FolderId, SocketAddr), Instant>>,
    candidate: &PeerCandidate,
    window: Duration,
) -> bool {
    let mut seen = seen.lock().expect("dedup map poisoned");
    let now = Instant::now();
    seen.retain(|_, last| now.duration_since(*last) < window);
    match seen.entry((candidate.folder_id, candidate.endpoint)) {
        std::collections::hash_map::Entry::Occupied(_) => true,
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(now);
            false
        }
    }
}
