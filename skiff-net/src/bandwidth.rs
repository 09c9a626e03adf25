//! Per-peer bandwidth accounting and the choking policy.
//!
//! Each session owns a [`BandwidthCounter`] with a rolling window of recent
//! ingress and egress bytes. The folder group feeds the per-peer numbers into
//! the [`Choker`] every rechoke interval: the best recent uploaders keep
//! their unchoked slots, one additional slot rotates optimistically so new
//! peers get a chance to prove themselves.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use skiff_base::NodeId;

/// Rolling window length for rate accounting.
pub const WINDOW: Duration = Duration::from_secs(10);

/// How often the folder group re-evaluates choking.
pub const RECHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Regular unchoke slots, the optimistic one excluded.
pub const DEFAULT_UNCHOKE_SLOTS: usize = 4;

#[derive(Debug, Default)]
struct Direction {
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Direction {
    fn add(&mut self, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((Instant::now(), bytes));
        self.prune();
    }

    fn prune(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(WINDOW) else {
            return;
        };
        while let Some((when, _)) = self.samples.front() {
            if *when < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent(&mut self) -> u64 {
        self.prune();
        self.samples.iter().map(|(_, bytes)| bytes).sum()
    }
}

/// Rolling ingress/egress byte counters for one peer.
#[derive(Debug, Default)]
pub struct BandwidthCounter {
    up: Mutex<Direction>,
    down: Mutex<Direction>,
}

impl BandwidthCounter {
    /// Record sent bytes.
    pub fn add_up(&self, bytes: u64) {
        self.up.lock().expect("counter poisoned").add(bytes);
    }

    /// Record received bytes.
    pub fn add_down(&self, bytes: u64) {
        self.down.lock().expect("counter poisoned").add(bytes);
    }

    /// Bytes sent within the rolling window.
    pub fn recent_up(&self) -> u64 {
        self.up.lock().expect("counter poisoned").recent()
    }

    /// Bytes received within the rolling window.
    pub fn recent_down(&self) -> u64 {
        self.down.lock().expect("counter poisoned").recent()
    }

    /// Total bytes sent over the session lifetime.
    pub fn total_up(&self) -> u64 {
        self.up.lock().expect("counter poisoned").total
    }

    /// Total bytes received over the session lifetime.
    pub fn total_down(&self) -> u64 {
        self.down.lock().expect("counter poisoned").total
    }
}

/// Input to one rechoke round.
#[derive(Debug, Clone)]
pub struct ChokeCandidate {
    /// The peer.
    pub node: NodeId,
    /// Bytes this peer uploaded to us within the window.
    pub recent_download: u64,
    /// Whether the peer declared interest in our data.
    pub interested: bool,
}

/// Tit-for-tat choking policy: top uploaders plus one optimistic slot.
#[derive(Debug)]
pub struct Choker {
    slots: usize,
    optimistic: Option<NodeId>,
}

impl Default for Choker {
    fn default() -> Self {
        Self::new(DEFAULT_UNCHOKE_SLOTS)
    }
}

impl Choker {
    /// Policy with `slots` regular unchoke slots.
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            optimistic: None,
        }
    }

    /// Decide which peers to unchoke for the next interval.
    pub fn rechoke(&mut self, mut candidates: Vec<ChokeCandidate>) -> Vec<NodeId> {
        candidates.retain(|c| c.interested);
        candidates.sort_by(|a, b| b.recent_download.cmp(&a.recent_download));

        let mut unchoked: Vec<NodeId> =
            candidates.iter().take(self.slots).map(|c| c.node).collect();

        let rest: Vec<NodeId> = candidates
            .iter()
            .skip(self.slots)
            .map(|c| c.node)
            .collect();
        // keep the previous optimistic pick if it is still waiting, otherwise
        // rotate to a random choked peer
        let keep = self
            .optimistic
            .filter(|node| rest.contains(node));
        let pick = keep.or_else(|| rest.choose(&mut rand::thread_rng()).copied());
        if let Some(node) = pick {
            unchoked.push(node);
        }
        self.optimistic = pick;
        unchoked
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use skiff_base::SecretKey;

    use super::*;

    fn node(seed: u64) -> NodeId {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        SecretKey::generate(&mut rng).public()
    }

    #[test]
    fn counter_accumulates() {
        let counter = BandwidthCounter::default();
        counter.add_up(100);
        counter.add_up(50);
        counter.add_down(10);
        assert_eq!(counter.total_up(), 150);
        assert_eq!(counter.total_down(), 10);
        assert_eq!(counter.recent_up(), 150);
        assert_eq!(counter.recent_down(), 10);
    }

    #[test]
    fn top_uploaders_get_unchoked() {
        let mut choker = Choker::new(2);
        let best = node(1);
        let good = node(2);
        let poor = node(3);
        let candidates = vec![
            ChokeCandidate {
                node: poor,
                recent_download: 10,
                interested: true,
            },
            ChokeCandidate {
                node: best,
                recent_download: 1000,
                interested: true,
            },
            ChokeCandidate {
                node: good,
                recent_download: 100,
                interested: true,
            },
        ];
        let unchoked = choker.rechoke(candidates);
        assert!(unchoked.contains(&best));
        assert!(unchoked.contains(&good));
        // the poor peer can only hold the optimistic slot
        assert_eq!(unchoked.len(), 3);
        assert!(unchoked.contains(&poor));
    }

    #[test]
    fn uninterested_peers_stay_choked() {
        let mut choker = Choker::new(2);
        let silent = node(4);
        let unchoked = choker.rechoke(vec![ChokeCandidate {
            node: silent,
            recent_download: 10_000,
            interested: false,
        }]);
        assert!(unchoked.is_empty());
    }

    #[test]
    fn optimistic_slot_is_sticky_while_waiting() {
        let mut choker = Choker::new(1);
        let top = node(5);
        let a = node(6);
        let b = node(7);
        let candidates = |n: u64| {
            vec![
                ChokeCandidate {
                    node: top,
                    recent_download: 1000 + n,
                    interested: true,
                },
                ChokeCandidate {
                    node: a,
                    recent_download: 1,
                    interested: true,
                },
                ChokeCandidate {
                    node: b,
                    recent_download: 0,
                    interested: true,
                },
            ]
        };
        let first = choker.rechoke(candidates(0));
        let second = choker.rechoke(candidates(1));
        assert_eq!(first, second);
    }
}
