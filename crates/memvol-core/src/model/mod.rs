//! Data model for the volume engine.
//!
//! Re-exports the node records, the per-directory child index, and the
//! segmented content store.
pub mod children;
pub mod comb;
pub mod node;

pub use children::{Child, ChildIndex, CHILD_OVERHEAD, TOOTH_CAPACITY};
pub use comb::{SegmentedBuffer, SEGMENT_SIZE};
pub use node::{FileAttributes, Node, NodeAux, NodeIndex, NodeLink, Timestamps};
