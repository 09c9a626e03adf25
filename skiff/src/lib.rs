//! The skiff daemon: folder groups, peer wiring, discovery and the control
//! plane, assembled around the skiff-base / skiff-sync / skiff-net crates.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod control;
pub mod daemon;
pub mod folder;
pub mod registry;
pub mod transport;

pub use config::Config;
pub use daemon::Daemon;
pub use folder::{FolderGroup, FolderParams};
pub use registry::Registry;
