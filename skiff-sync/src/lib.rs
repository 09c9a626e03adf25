//! Folder state for skiff: signed meta records, content-defined chunking and
//! encryption, the persistent per-folder index, and the indexing pipeline
//! that turns filesystem events into signed records.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod chunker;
pub mod index;
pub mod indexer;
pub mod meta;
pub mod watcher;

pub use chunker::{ChunkCipher, Chunker};
pub use index::{Index, IndexError, IndexEvent};
pub use indexer::IndexerQueue;
pub use meta::{ChunkInfo, Meta, MetaKind, PathId, PathRevision, SignedMeta};
