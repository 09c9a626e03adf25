//! Table definitions for the folder index.

use redb::{MultimapTableDefinition, TableDefinition};

/// Signed meta records.
///
/// Key: `(path_id, revision)`. Value: postcard-encoded [`crate::SignedMeta`].
pub const METAS_TABLE: TableDefinition<(&[u8; 32], u64), &[u8]> = TableDefinition::new("metas-1");

/// Which meta records reference a chunk.
///
/// Key: ct_hash. Values: `(path_id, revision)` of every referencing record.
pub const CHUNK_METAS_TABLE: MultimapTableDefinition<&[u8; 32], (&[u8; 32], u64)> =
    MultimapTableDefinition::new("chunk-metas-1");

/// Chunks whose bytes are locally present and verified.
///
/// Key: ct_hash. Value: ciphertext length.
pub const ASSEMBLED_CHUNKS_TABLE: TableDefinition<&[u8; 32], u32> =
    TableDefinition::new("assembled-chunks-1");

/// Revision up to which each path has been fully assembled on disk.
///
/// Key: path_id. Value: revision.
pub const ASSEMBLED_PATHS_TABLE: TableDefinition<&[u8; 32], u64> =
    TableDefinition::new("assembled-paths-1");
