//! Base types for skiff: capability secrets, folder identifiers, content
//! addresses and the node identity key.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod hash;
pub mod node_key;
pub mod secret;

pub use hash::CtHash;
pub use node_key::{NodeId, PublicKey, SecretKey};
pub use secret::{Capability, FolderId, Secret, SecretError};
