//! memvol core — an in-memory, size-bounded volume engine with Windows
//! file semantics.
//!
//! This crate contains the whole engine with zero host-driver
//! dependencies: the consumer is expected to be a filesystem-driver shim
//! that resolves paths, serializes conflicting operations per handle, and
//! maps [`error::FsError`] values onto host status codes.
//!
//! # Modules
//!
//! - [`model`] — Node records, the per-directory child index, and the
//!   segmented content store.
//! - [`volume`] — The engine facade: every public operation, plus the
//!   structural self-check.
//! - [`path`] — Name comparison and path walking helpers.
//! - [`options`] — Volume configuration and size parsing.
//! - [`loader`] — Background seeding of a volume from a host directory.
pub mod error;
pub mod loader;
pub mod model;
pub mod options;
pub mod path;
pub mod volume;

pub use error::FsError;
pub use model::node::{FileAttributes, Node, NodeIndex, Timestamps};
pub use options::VolumeOptions;
pub use volume::{DirEntry, Volume, VolumeStats, NODE_OVERHEAD};
