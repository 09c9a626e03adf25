//! Filesystem change sources.
//!
//! Two producers feed the indexer queue: the [`DirectoryWatcher`] bridges OS
//! change notifications, and the [`DirectoryPoller`] walks the whole tree on
//! a timer as a safety net for anything the watcher missed. Before the folder
//! group writes assembled content to disk it registers a suppression entry,
//! so the write does not bounce back through the watcher as a re-index.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::Secret;

use crate::{
    index::Index,
    indexer::IndexerQueue,
    meta::{MetaKind, PathId},
};

/// Default interval between full-tree scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);

/// How long a suppression entry stays valid if its event never arrives.
const SUPPRESS_WINDOW: Duration = Duration::from_secs(30);

struct SuppressEntry {
    remaining: u32,
    expires: Instant,
}

/// Registry of paths whose next watch events are self-inflicted and must not
/// trigger a re-index.
#[derive(Clone, Default)]
pub struct AssembleSuppressor {
    inner: Arc<Mutex<HashMap<PathBuf, SuppressEntry>>>,
}

impl std::fmt::Debug for AssembleSuppressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssembleSuppressor(..)")
    }
}

impl AssembleSuppressor {
    /// Announce an upcoming assemble write to `path`.
    ///
    /// With `with_removal` the assembler will replace an existing entry, which
    /// fires two events instead of one. Entries are one-shot per event and
    /// expire after a window; a genuinely external modification afterwards
    /// re-indexes normally.
    pub fn prepare_assemble(&self, path: &Path, _kind: MetaKind, with_removal: bool) {
        let mut inner = self.inner.lock().expect("suppressor poisoned");
        let entry = inner.entry(path.to_path_buf()).or_insert(SuppressEntry {
            remaining: 0,
            expires: Instant::now(),
        });
        entry.remaining += if with_removal { 2 } else { 1 };
        entry.expires = Instant::now() + SUPPRESS_WINDOW;
    }

    /// Consume one suppression for `path`. Returns true when the event must
    /// be dropped.
    pub fn consume(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock().expect("suppressor poisoned");
        let Some(entry) = inner.get_mut(path) else {
            return false;
        };
        if entry.expires < Instant::now() {
            inner.remove(path);
            return false;
        }
        entry.remaining -= 1;
        if entry.remaining == 0 {
            inner.remove(path);
        }
        true
    }
}

/// Bridges OS change notifications into the indexer queue.
#[derive(Debug)]
pub struct DirectoryWatcher {
    // kept alive for the watch registration
    _watcher: notify::RecommendedWatcher,
    _task: AbortOnDropHandle<()>,
}

impl DirectoryWatcher {
    /// Watch `root` recursively, forwarding changed paths to `indexer`.
    pub fn spawn(
        root: &Path,
        indexer: IndexerQueue,
        suppressor: AssembleSuppressor,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(1024);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for path in event.paths {
                        // blocking_send: we are on notify's own thread here
                        if tx.blocking_send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!("watch error: {err}"),
            }
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        let root_span = error_span!("watcher", root = %root.display());
        let task = tokio::spawn(
            async move {
                while let Some(path) = rx.recv().await {
                    if suppressor.consume(&path) {
                        trace!(path = %path.display(), "suppressed self-triggered event");
                        continue;
                    }
                    indexer.enqueue(path).await;
                }
            }
            .instrument(root_span),
        );

        Ok(Self {
            _watcher: watcher,
            _task: AbortOnDropHandle::new(task),
        })
    }
}

/// Periodic full-tree scan feeding the same indexer queue.
#[derive(Debug)]
pub struct DirectoryPoller {
    _task: AbortOnDropHandle<()>,
}

impl DirectoryPoller {
    /// Scan `root` every `interval`.
    ///
    /// Besides walking the tree, the poller enqueues tracked paths that have
    /// vanished from disk so deletions are caught even without a watch event.
    pub fn spawn(
        root: PathBuf,
        interval: Duration,
        indexer: IndexerQueue,
        index: Arc<Index>,
        secret: Secret,
    ) -> Result<Self> {
        let path_key = secret.path_key().context("poller needs path key")?;
        let span = error_span!("poller", root = %root.display());
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // skip the immediate first tick; the initial scan is explicit
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = sweep(&root, &indexer, &index, &path_key).await {
                        warn!("poll sweep failed: {err:#}");
                    }
                }
            }
            .instrument(span),
        );
        Ok(Self {
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// One immediate sweep, used at folder startup.
    pub async fn scan_once(
        root: &Path,
        indexer: &IndexerQueue,
        index: &Index,
        secret: &Secret,
    ) -> Result<()> {
        let path_key = secret.path_key().context("poller needs path key")?;
        sweep(root, indexer, index, &path_key).await
    }
}

async fn sweep(
    root: &Path,
    indexer: &IndexerQueue,
    index: &Index,
    path_key: &[u8; 32],
) -> Result<()> {
    let walk_root = root.to_path_buf();
    let found: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(&walk_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.path() != walk_root => Some(entry.into_path()),
                Ok(_) => None,
                Err(err) => {
                    debug!("walk error: {err}");
                    None
                }
            })
            .collect()
    })
    .await
    .context("walk task panicked")?;

    let mut found_ids = std::collections::HashSet::new();
    for path in &found {
        if let Some(rel) = crate::indexer::normalize(root, path) {
            found_ids.insert(PathId::compute(path_key, rel.as_bytes()));
        }
        indexer.enqueue(path.clone()).await;
    }

    // tracked but missing on disk: enqueue so the indexer records deletions
    for signed in index.current_metas()? {
        let meta = signed.meta();
        if meta.kind == MetaKind::Deleted || found_ids.contains(&meta.path_id) {
            continue;
        }
        if let Ok(rel) = meta.encrypted_path.open(path_key) {
            if let Ok(rel) = String::from_utf8(rel) {
                indexer.enqueue(root.join(rel)).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::indexer::IndexerConfig;

    use super::*;

    fn secret() -> Secret {
        let mut rng = ChaCha8Rng::seed_from_u64(41);
        Secret::generate(&mut rng)
    }

    #[test]
    fn suppressor_consumes_once() {
        let suppressor = AssembleSuppressor::default();
        let path = Path::new("/f/a.txt");
        assert!(!suppressor.consume(path));

        suppressor.prepare_assemble(path, MetaKind::File, false);
        assert!(suppressor.consume(path));
        assert!(!suppressor.consume(path));
    }

    #[test]
    fn suppressor_with_removal_consumes_twice() {
        let suppressor = AssembleSuppressor::default();
        let path = Path::new("/f/a.txt");
        suppressor.prepare_assemble(path, MetaKind::File, true);
        assert!(suppressor.consume(path));
        assert!(suppressor.consume(path));
        assert!(!suppressor.consume(path));
    }

    #[tokio::test]
    async fn initial_scan_indexes_tree() {
        let secret = secret();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/file.txt"), b"content")
            .await
            .unwrap();

        let index = Arc::new(Index::memory(secret.clone()).unwrap());
        let indexer = IndexerQueue::spawn(
            IndexerConfig::new(dir.path().to_path_buf()),
            secret.clone(),
            index.clone(),
        )
        .unwrap();

        DirectoryPoller::scan_once(dir.path(), &indexer, &index, &secret)
            .await
            .unwrap();

        let path_key = secret.path_key().unwrap();
        let file_id = PathId::compute(&path_key, b"sub/file.txt");
        let dir_id = PathId::compute(&path_key, b"sub");
        for _ in 0..200 {
            if index.current_meta(&file_id).unwrap().is_some()
                && index.current_meta(&dir_id).unwrap().is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("poller scan did not index the tree");
    }

    #[tokio::test]
    async fn watcher_picks_up_new_file() {
        let secret = secret();
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::memory(secret.clone()).unwrap());
        let indexer = IndexerQueue::spawn(
            IndexerConfig::new(dir.path().to_path_buf()),
            secret.clone(),
            index.clone(),
        )
        .unwrap();
        let _watcher = DirectoryWatcher::spawn(
            dir.path(),
            indexer.clone(),
            AssembleSuppressor::default(),
        )
        .unwrap();

        // give the watch registration a moment on slow platforms
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::fs::write(dir.path().join("new.txt"), b"fresh").await.unwrap();

        let path_key = secret.path_key().unwrap();
        let path_id = PathId::compute(&path_key, b"new.txt");
        for _ in 0..200 {
            if index.current_meta(&path_id).unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("watcher did not deliver the create event");
    }
}
