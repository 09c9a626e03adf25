//! The persistent per-folder index.
//!
//! One redb database file per folder holds every signed meta record this node
//! has seen, a reverse map from chunk addresses to the records referencing
//! them, and the local assembly state. All mutation goes through write
//! transactions, so a crash mid-`put_meta` leaves the previous consistent
//! state behind.

use std::collections::HashMap;
use std::path::Path;

use redb::{Database, ReadableMultimapTable, ReadableTable, ReadableTableMetadata};
use tokio::sync::broadcast;
use tracing::trace;

use skiff_base::{CtHash, Secret};

use crate::meta::{MetaKind, PathId, PathRevision, SignedMeta};

mod tables;

use tables::{ASSEMBLED_CHUNKS_TABLE, ASSEMBLED_PATHS_TABLE, CHUNK_METAS_TABLE, METAS_TABLE};

const EVENT_CAP: usize = 64;

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The record's signature does not verify against the folder secret.
    #[error("bad signature on meta record")]
    BadSignature,
    /// A record with this `(path, revision)` already exists.
    #[error("stale revision")]
    StaleRevision,
    /// No such record.
    #[error("meta record not found")]
    NotFound,
    /// Database failure.
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    /// Transaction failure.
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    /// Table failure.
    #[error(transparent)]
    Table(#[from] redb::TableError),
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    /// Commit failure.
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    /// A stored record failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] postcard::Error),
}

/// Notification emitted when a record lands in the index.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    /// A meta record was inserted.
    MetaAdded {
        /// The inserted record.
        meta: SignedMeta,
        /// True when the record came from a peer and its content is not yet
        /// assembled locally.
        external: bool,
    },
}

/// Persistent store of signed meta records and chunk state for one folder.
#[derive(derive_more::Debug)]
pub struct Index {
    #[debug(skip)]
    db: Database,
    secret: Secret,
    #[debug(skip)]
    events: broadcast::Sender<IndexEvent>,
}

impl Index {
    /// Open or create the index database at `path`.
    pub fn persistent(path: impl AsRef<Path>, secret: Secret) -> Result<Self, IndexError> {
        let db = Database::create(path)?;
        Self::new_impl(db, secret)
    }

    /// Create an in-memory index, for tests.
    pub fn memory(secret: Secret) -> Result<Self, IndexError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::new_impl(db, secret)
    }

    fn new_impl(db: Database, secret: Secret) -> Result<Self, IndexError> {
        let tx = db.begin_write()?;
        {
            tx.open_table(METAS_TABLE)?;
            tx.open_multimap_table(CHUNK_METAS_TABLE)?;
            tx.open_table(ASSEMBLED_CHUNKS_TABLE)?;
            tx.open_table(ASSEMBLED_PATHS_TABLE)?;
        }
        tx.commit()?;
        let (events, _) = broadcast::channel(EVENT_CAP);
        Ok(Self { db, secret, events })
    }

    /// Subscribe to insert notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// The folder secret this index verifies against.
    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    /// Whether the record for `rev` is present.
    pub fn have_meta(&self, rev: &PathRevision) -> Result<bool, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(METAS_TABLE)?;
        Ok(table
            .get((rev.path_id.as_bytes(), rev.revision))?
            .is_some())
    }

    /// Fetch the record for `rev`.
    pub fn get_meta(&self, rev: &PathRevision) -> Result<SignedMeta, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(METAS_TABLE)?;
        let value = table
            .get((rev.path_id.as_bytes(), rev.revision))?
            .ok_or(IndexError::NotFound)?;
        Ok(postcard::from_bytes(value.value())?)
    }

    /// The highest-revision record for a path, if any.
    pub fn current_meta(&self, path_id: &PathId) -> Result<Option<SignedMeta>, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(METAS_TABLE)?;
        let mut range = table.range((path_id.as_bytes(), 0)..=(path_id.as_bytes(), u64::MAX))?;
        match range.next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(postcard::from_bytes(value.value())?))
            }
            None => Ok(None),
        }
    }

    /// Insert a signed record.
    ///
    /// Verifies the signature, stores the record and its chunk references in
    /// one transaction, and emits [`IndexEvent::MetaAdded`]. Set
    /// `fully_assembled` when the described content is already on disk (a
    /// local write); the record's chunks are then marked assembled too.
    pub fn put_meta(&self, signed: &SignedMeta, fully_assembled: bool) -> Result<(), IndexError> {
        signed
            .verify(&self.secret)
            .map_err(|_| IndexError::BadSignature)?;

        let meta = signed.meta();
        let encoded = postcard::to_stdvec(signed)?;
        let tx = self.db.begin_write()?;
        {
            let mut metas = tx.open_table(METAS_TABLE)?;
            let key = (meta.path_id.as_bytes(), meta.revision);
            if metas.get(key)?.is_some() {
                return Err(IndexError::StaleRevision);
            }
            metas.insert(key, encoded.as_slice())?;

            let mut chunk_metas = tx.open_multimap_table(CHUNK_METAS_TABLE)?;
            for chunk in &meta.chunks {
                chunk_metas.insert(
                    chunk.ct_hash.as_bytes(),
                    (meta.path_id.as_bytes(), meta.revision),
                )?;
            }

            if fully_assembled {
                let mut assembled_chunks = tx.open_table(ASSEMBLED_CHUNKS_TABLE)?;
                for chunk in &meta.chunks {
                    assembled_chunks.insert(chunk.ct_hash.as_bytes(), chunk.size)?;
                }
                let mut assembled_paths = tx.open_table(ASSEMBLED_PATHS_TABLE)?;
                assembled_paths.insert(meta.path_id.as_bytes(), meta.revision)?;
            }
        }
        tx.commit()?;

        trace!(
            path = %meta.path_id.fmt_short(),
            revision = meta.revision,
            fully_assembled,
            "meta stored"
        );
        self.events
            .send(IndexEvent::MetaAdded {
                meta: signed.clone(),
                external: !fully_assembled,
            })
            .ok();
        Ok(())
    }

    /// Whether a record at `rev` would still be news.
    ///
    /// False iff a record for the same path with an equal or newer revision
    /// already exists.
    pub fn put_allowed(&self, rev: &PathRevision) -> Result<bool, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(METAS_TABLE)?;
        let mut range =
            table.range((rev.path_id.as_bytes(), rev.revision)..=(rev.path_id.as_bytes(), u64::MAX))?;
        Ok(range.next().is_none())
    }

    /// All records referencing a chunk.
    pub fn containing_chunk(&self, ct_hash: &CtHash) -> Result<Vec<SignedMeta>, IndexError> {
        let tx = self.db.begin_read()?;
        let chunk_metas = tx.open_multimap_table(CHUNK_METAS_TABLE)?;
        let metas = tx.open_table(METAS_TABLE)?;
        let mut out = Vec::new();
        for entry in chunk_metas.get(ct_hash.as_bytes())? {
            let entry = entry?;
            let (path_id, revision) = entry.value();
            if let Some(value) = metas.get((path_id, revision))? {
                out.push(postcard::from_bytes(value.value())?);
            }
        }
        Ok(out)
    }

    /// The `(size, iv)` pair needed to fetch and decrypt a chunk.
    pub fn get_chunk_size_iv(&self, ct_hash: &CtHash) -> Result<(u32, [u8; 12]), IndexError> {
        for signed in self.containing_chunk(ct_hash)? {
            if let Some(idx) = signed.meta().chunk_index(ct_hash) {
                let info = &signed.meta().chunks[idx];
                return Ok((info.size, info.iv));
            }
        }
        Err(IndexError::NotFound)
    }

    /// Record that a chunk's bytes are locally present and verified.
    pub fn mark_chunk_assembled(&self, ct_hash: &CtHash, size: u32) -> Result<(), IndexError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(ASSEMBLED_CHUNKS_TABLE)?;
            table.insert(ct_hash.as_bytes(), size)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether a chunk is locally present and verified.
    pub fn is_assembled_chunk(&self, ct_hash: &CtHash) -> Result<bool, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ASSEMBLED_CHUNKS_TABLE)?;
        Ok(table.get(ct_hash.as_bytes())?.is_some())
    }

    /// Record that the current revision of a path is fully assembled on disk.
    pub fn set_assembled(&self, path_id: &PathId) -> Result<(), IndexError> {
        let Some(current) = self.current_meta(path_id)? else {
            return Err(IndexError::NotFound);
        };
        let tx = self.db.begin_write()?;
        {
            let mut chunks = tx.open_table(ASSEMBLED_CHUNKS_TABLE)?;
            for chunk in &current.meta().chunks {
                chunks.insert(chunk.ct_hash.as_bytes(), chunk.size)?;
            }
            let mut paths = tx.open_table(ASSEMBLED_PATHS_TABLE)?;
            paths.insert(path_id.as_bytes(), current.meta().revision)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether the current revision of a path is fully assembled.
    pub fn is_assembled_path(&self, path_id: &PathId) -> Result<bool, IndexError> {
        let Some(current) = self.current_meta(path_id)? else {
            return Ok(false);
        };
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ASSEMBLED_PATHS_TABLE)?;
        match table.get(path_id.as_bytes())? {
            Some(rev) => Ok(rev.value() >= current.meta().revision),
            None => Ok(false),
        }
    }

    /// Every stored record, historical revisions included.
    pub fn all_meta(&self) -> Result<Vec<SignedMeta>, IndexError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(METAS_TABLE)?;
        let mut out = Vec::with_capacity(table.len()? as usize);
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(postcard::from_bytes(value.value())?);
        }
        Ok(out)
    }

    /// The current (highest-revision) record per path.
    pub fn current_metas(&self) -> Result<Vec<SignedMeta>, IndexError> {
        let mut current: HashMap<PathId, SignedMeta> = HashMap::new();
        for signed in self.all_meta()? {
            let entry = current.entry(signed.meta().path_id);
            match entry {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if slot.get().meta().revision < signed.meta().revision {
                        slot.insert(signed);
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(signed);
                }
            }
        }
        Ok(current.into_values().collect())
    }

    /// Current file records whose content is not yet fully assembled.
    pub fn incomplete_meta(&self) -> Result<Vec<SignedMeta>, IndexError> {
        let mut out = Vec::new();
        for signed in self.current_metas()? {
            if signed.meta().kind == MetaKind::File && !self.is_assembled_path(&signed.meta().path_id)? {
                out.push(signed);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use skiff_base::Capability;

    use crate::meta::{ChunkInfo, EncryptedPath, Meta};

    use super::*;

    fn secret() -> Secret {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        Secret::generate(&mut rng)
    }

    fn file_meta(secret: &Secret, name: &[u8], revision: u64, chunk_seed: u8) -> SignedMeta {
        let path_key = secret.path_key().unwrap();
        let meta = Meta {
            path_id: PathId::compute(&path_key, name),
            revision,
            kind: MetaKind::File,
            encrypted_path: EncryptedPath::seal(&path_key, name).unwrap(),
            size: 100,
            mtime: 1_700_000_000,
            chunks: vec![ChunkInfo {
                ct_hash: CtHash::new([chunk_seed; 8]),
                size: 116,
                iv: [chunk_seed; 12],
            }],
            symlink_target: None,
        };
        SignedMeta::sign(meta, secret).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 1);
        let rev = signed.path_revision();

        assert!(!index.have_meta(&rev).unwrap());
        index.put_meta(&signed, true).unwrap();
        assert!(index.have_meta(&rev).unwrap());
        assert_eq!(index.get_meta(&rev).unwrap(), signed);
    }

    #[test]
    fn duplicate_put_is_stale() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 1);
        index.put_meta(&signed, true).unwrap();
        assert!(matches!(
            index.put_meta(&signed, true),
            Err(IndexError::StaleRevision)
        ));
        assert_eq!(index.all_meta().unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_foreign_signature() {
        let secret = secret();
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let other = Secret::generate(&mut rng);
        let index = Index::memory(secret).unwrap();
        let signed = file_meta(&other, b"a.txt", 1, 1);
        assert!(matches!(
            index.put_meta(&signed, false),
            Err(IndexError::BadSignature)
        ));
        assert!(index.all_meta().unwrap().is_empty());
    }

    #[test]
    fn put_allowed_tracks_newest_revision() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 5, 1);
        let path_id = signed.meta().path_id;
        index.put_meta(&signed, true).unwrap();

        let newer = PathRevision {
            path_id,
            revision: 6,
        };
        let same = PathRevision {
            path_id,
            revision: 5,
        };
        let older = PathRevision {
            path_id,
            revision: 4,
        };
        assert!(index.put_allowed(&newer).unwrap());
        assert!(!index.put_allowed(&same).unwrap());
        assert!(!index.put_allowed(&older).unwrap());
    }

    #[test]
    fn lower_revision_kept_as_history() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let newer = file_meta(&secret, b"a.txt", 10, 2);
        let older = file_meta(&secret, b"a.txt", 9, 1);
        index.put_meta(&newer, true).unwrap();
        index.put_meta(&older, false).unwrap();

        let current = index.current_meta(&newer.meta().path_id).unwrap().unwrap();
        assert_eq!(current.meta().revision, 10);
        assert_eq!(index.all_meta().unwrap().len(), 2);
    }

    #[test]
    fn containing_chunk_and_size_iv() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 3);
        let ct = signed.meta().chunks[0].ct_hash;
        index.put_meta(&signed, false).unwrap();

        let containing = index.containing_chunk(&ct).unwrap();
        assert_eq!(containing.len(), 1);
        assert_eq!(containing[0].path_revision(), signed.path_revision());

        let (size, iv) = index.get_chunk_size_iv(&ct).unwrap();
        assert_eq!(size, 116);
        assert_eq!(iv, [3u8; 12]);

        assert!(matches!(
            index.get_chunk_size_iv(&CtHash::new(b"unknown")),
            Err(IndexError::NotFound)
        ));
    }

    #[test]
    fn assembly_tracking() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 4);
        let path_id = signed.meta().path_id;
        let ct = signed.meta().chunks[0].ct_hash;

        index.put_meta(&signed, false).unwrap();
        assert!(!index.is_assembled_chunk(&ct).unwrap());
        assert!(!index.is_assembled_path(&path_id).unwrap());
        assert_eq!(index.incomplete_meta().unwrap().len(), 1);

        index.mark_chunk_assembled(&ct, 116).unwrap();
        assert!(index.is_assembled_chunk(&ct).unwrap());

        index.set_assembled(&path_id).unwrap();
        assert!(index.is_assembled_path(&path_id).unwrap());
        assert!(index.incomplete_meta().unwrap().is_empty());
    }

    #[test]
    fn assembled_flag_on_put() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 5);
        index.put_meta(&signed, true).unwrap();
        assert!(index.is_assembled_path(&signed.meta().path_id).unwrap());
        assert!(index
            .is_assembled_chunk(&signed.meta().chunks[0].ct_hash)
            .unwrap());
    }

    #[test]
    fn events_follow_origin() {
        let secret = secret();
        let index = Index::memory(secret.clone()).unwrap();
        let mut events = index.subscribe();

        index.put_meta(&file_meta(&secret, b"a.txt", 1, 1), true).unwrap();
        index.put_meta(&file_meta(&secret, b"b.txt", 1, 2), false).unwrap();

        let IndexEvent::MetaAdded { external, .. } = events.try_recv().unwrap();
        assert!(!external);
        let IndexEvent::MetaAdded { external, .. } = events.try_recv().unwrap();
        assert!(external);
    }

    #[test]
    fn persists_across_reopen() {
        let secret = secret();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("folder.db");
        let signed = file_meta(&secret, b"a.txt", 1, 1);

        {
            let index = Index::persistent(&db_path, secret.clone()).unwrap();
            index.put_meta(&signed, true).unwrap();
        }
        let index = Index::persistent(&db_path, secret.clone()).unwrap();
        assert_eq!(index.get_meta(&signed.path_revision()).unwrap(), signed);
        assert!(index.is_assembled_path(&signed.meta().path_id).unwrap());
    }

    #[test]
    fn readonly_secret_can_verify_inserts() {
        let secret = secret();
        let ro = secret.derive(Capability::ReadOnly).unwrap();
        let index = Index::memory(ro).unwrap();
        let signed = file_meta(&secret, b"a.txt", 1, 1);
        index.put_meta(&signed, false).unwrap();
        assert!(index.have_meta(&signed.path_revision()).unwrap());
    }
}
