//! The indexing pipeline.
//!
//! One queue per folder serializes all local indexing work: a changed path is
//! normalized, checked against the ignore list, chunked and encrypted, built
//! into a meta record, signed, and committed to the index. Duplicate pending
//! entries for the same path coalesce; transient IO failures retry with
//! exponential backoff.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use skiff_base::Secret;

use crate::{
    chunker::{index_chunks, ChunkCipher, Chunker},
    index::{Index, IndexError},
    meta::{EncryptedPath, Meta, MetaKind, PathId, SignedMeta},
};

const QUEUE_CAP: usize = 1024;

/// Tuning for the indexing pipeline.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Root of the synchronized tree.
    pub root: PathBuf,
    /// Relative path prefixes to skip.
    pub ignore: Vec<String>,
    /// Retry attempts for transient IO failures.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_cap: Duration,
}

impl IndexerConfig {
    /// Defaults for a folder rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ignore: Vec::new(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Pipeline position of the item currently being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    Queued,
    Hashing,
    Signing,
    Committed,
    Failed,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Queued => "queued",
            ItemState::Hashing => "hashing",
            ItemState::Signing => "signing",
            ItemState::Committed => "committed",
            ItemState::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum ToIndexer {
    Enqueue(PathBuf),
}

/// Handle to a folder's indexing queue.
///
/// Dropping every handle stops the queue.
#[derive(Debug, Clone)]
pub struct IndexerQueue {
    tx: mpsc::Sender<ToIndexer>,
    _task: Arc<AbortOnDropHandle<()>>,
}

impl IndexerQueue {
    /// Spawn the queue for one folder.
    ///
    /// `secret` must carry read-write capability; the queue signs every
    /// record it produces.
    pub fn spawn(config: IndexerConfig, secret: Secret, index: Arc<Index>) -> Result<Self> {
        let cipher = ChunkCipher::new(secret.content_key().context("indexer needs content key")?);
        let path_key = secret.path_key().context("indexer needs path key")?;
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        let folder = secret.folder_id();
        let actor = Actor {
            config,
            secret,
            path_key,
            cipher,
            chunker: Chunker::default(),
            index,
            rx,
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
        };
        let task = tokio::spawn(
            actor
                .run()
                .instrument(error_span!("indexer", folder = %folder.fmt_short())),
        );
        Ok(Self {
            tx,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        })
    }

    /// Queue a path for (re-)indexing. Idempotent while pending.
    pub async fn enqueue(&self, path: PathBuf) {
        self.tx.send(ToIndexer::Enqueue(path)).await.ok();
    }
}

struct Actor {
    config: IndexerConfig,
    secret: Secret,
    path_key: [u8; 32],
    cipher: ChunkCipher,
    chunker: Chunker,
    index: Arc<Index>,
    rx: mpsc::Receiver<ToIndexer>,
    pending: VecDeque<PathBuf>,
    pending_set: HashSet<PathBuf>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                self.accept(msg);
            }
            if let Some(path) = self.pending.pop_front() {
                self.pending_set.remove(&path);
                self.process(path).await;
                continue;
            }
            match self.rx.recv().await {
                Some(msg) => self.accept(msg),
                None => break,
            }
        }
        debug!("indexer queue closed");
    }

    fn accept(&mut self, msg: ToIndexer) {
        match msg {
            ToIndexer::Enqueue(path) => {
                if self.pending_set.insert(path.clone()) {
                    trace!(path = %path.display(), state = %ItemState::Queued, "enqueued");
                    self.pending.push_back(path);
                }
            }
        }
    }

    async fn process(&mut self, path: PathBuf) {
        let Some(rel) = normalize(&self.config.root, &path) else {
            debug!(path = %path.display(), "outside folder root, dropping");
            return;
        };
        if self.is_ignored(&rel) {
            trace!(path = rel, "ignored");
            return;
        }

        let mut attempt = 0u32;
        loop {
            match self.index_one(&path, &rel).await {
                Ok(Some(state)) => {
                    trace!(path = rel, state = %state, "indexing done");
                    return;
                }
                Ok(None) => return,
                Err(err) if is_transient(&err) && attempt + 1 < self.config.max_attempts => {
                    let delay = self
                        .config
                        .backoff_base
                        .saturating_mul(1 << attempt)
                        .min(self.config.backoff_cap);
                    attempt += 1;
                    debug!(path = rel, attempt, ?delay, "transient failure, retrying: {err:#}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(path = rel, state = %ItemState::Failed, "indexing failed: {err:#}");
                    return;
                }
            }
        }
    }

    /// Index a single path. `Ok(None)` means there was nothing to do.
    async fn index_one(&mut self, path: &Path, rel: &str) -> Result<Option<ItemState>> {
        let current = self.index.current_meta(&self.path_id(rel))?;

        let stat = match tokio::fs::symlink_metadata(path).await {
            Ok(stat) => stat,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return self.record_deletion(rel, current);
            }
            Err(err) => return Err(err.into()),
        };

        let kind = if stat.is_file() {
            MetaKind::File
        } else if stat.is_dir() {
            MetaKind::Directory
        } else if stat.is_symlink() {
            MetaKind::Symlink
        } else {
            debug!(path = rel, "unsupported file type, dropping");
            return Ok(None);
        };

        let mtime = unix_seconds(stat.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        if let Some(ref current) = current {
            let m = current.meta();
            if m.kind == kind && m.mtime == mtime && (kind != MetaKind::File || m.size == stat.len())
            {
                trace!(path = rel, "unchanged, skipping");
                return Ok(None);
            }
        }

        trace!(path = rel, state = %ItemState::Hashing, "hashing");
        let (chunks, size) = match kind {
            MetaKind::File => {
                let chunker = self.chunker.clone();
                let cipher = self.cipher.clone();
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    let file = std::fs::File::open(&path)?;
                    index_chunks(&chunker, &cipher, std::io::BufReader::new(file))
                })
                .await
                .context("chunker task panicked")??
            }
            _ => (Vec::new(), 0),
        };

        let symlink_target = if kind == MetaKind::Symlink {
            let target = tokio::fs::read_link(path).await?;
            let target = target.to_string_lossy().into_owned();
            Some(EncryptedPath::seal(&self.path_key, target.as_bytes())?)
        } else {
            None
        };

        let meta = Meta {
            path_id: self.path_id(rel),
            revision: self.next_revision(current.as_ref()),
            kind,
            encrypted_path: EncryptedPath::seal(&self.path_key, rel.as_bytes())?,
            size,
            mtime,
            chunks,
            symlink_target,
        };
        self.commit(meta, rel)
    }

    fn record_deletion(
        &self,
        rel: &str,
        current: Option<SignedMeta>,
    ) -> Result<Option<ItemState>> {
        let Some(current) = current else {
            return Ok(None);
        };
        if current.meta().kind == MetaKind::Deleted {
            return Ok(None);
        }
        let meta = Meta {
            path_id: current.meta().path_id,
            revision: self.next_revision(Some(&current)),
            kind: MetaKind::Deleted,
            encrypted_path: current.meta().encrypted_path.clone(),
            size: 0,
            mtime: unix_seconds(SystemTime::now()),
            chunks: Vec::new(),
            symlink_target: None,
        };
        self.commit(meta, rel)
    }

    fn commit(&self, meta: Meta, rel: &str) -> Result<Option<ItemState>> {
        trace!(path = rel, state = %ItemState::Signing, "signing");
        let signed = SignedMeta::sign(meta, &self.secret)?;
        match self.index.put_meta(&signed, true) {
            Ok(()) => Ok(Some(ItemState::Committed)),
            // lost a race against a record we already hold; harmless
            Err(IndexError::StaleRevision) => Ok(Some(ItemState::Committed)),
            Err(err) => Err(err.into()),
        }
    }

    fn path_id(&self, rel: &str) -> PathId {
        PathId::compute(&self.path_key, rel.as_bytes())
    }

    fn next_revision(&self, current: Option<&SignedMeta>) -> u64 {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        match current {
            Some(signed) => now.max(signed.meta().revision + 1),
            None => now,
        }
    }

    fn is_ignored(&self, rel: &str) -> bool {
        self.config
            .ignore
            .iter()
            .any(|pattern| rel == pattern || rel.starts_with(&format!("{pattern}/")))
    }
}

/// Normalize an absolute path into the folder-relative form used for path
/// ids: forward slashes, no leading separator, no traversal components.
pub fn normalize(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(positive) => positive.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return !matches!(
            io.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidData
        );
    }
    false
}
