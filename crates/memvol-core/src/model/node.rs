//! Node records — the fixed-size per-file metadata and its parallel
//! auxiliary record.
//!
//! Nodes are identified by a stable `u64` index into the store's slot
//! array; relationships use indices rather than references, so nothing in
//! the tree forms an ownership cycle and snapshots are plain copies.

use std::time::SystemTime;

use bitflags::bitflags;

use super::children::ChildIndex;
use super::comb::SegmentedBuffer;

/// Index of a node in the store.
///
/// Index 0 is always the root directory. Indices are stable for the life
/// of the volume; slots are recycled through the free list, never moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u64);

impl NodeIndex {
    /// The root directory.
    pub const ROOT: NodeIndex = NodeIndex(0);

    /// Return the index as a `usize` for slot addressing.
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// NT file attributes, as delivered by the host driver.
    ///
    /// An empty set is never stored on a live node — it marks a free slot.
    /// [`FileAttributes::canonical`] maps empty to `NORMAL` at every entry
    /// point that accepts caller attributes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const READONLY            = 0x0000_0001;
        const HIDDEN              = 0x0000_0002;
        const SYSTEM              = 0x0000_0004;
        const DIRECTORY           = 0x0000_0010;
        const ARCHIVE             = 0x0000_0020;
        const NORMAL              = 0x0000_0080;
        const TEMPORARY           = 0x0000_0100;
        const SPARSE_FILE         = 0x0000_0200;
        const REPARSE_POINT       = 0x0000_0400;
        const COMPRESSED          = 0x0000_0800;
        const OFFLINE             = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
    }
}

impl FileAttributes {
    /// Canonical stored form: all meaningful bits clear becomes `NORMAL`.
    pub fn canonical(self) -> Self {
        if self.is_empty() {
            FileAttributes::NORMAL
        } else {
            self
        }
    }
}

/// Ticks per second in a Windows FILETIME (100 ns resolution).
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// FILETIME ticks at the Unix epoch (1601-01-01 → 1970-01-01).
const UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;

/// Current wall-clock time as FILETIME ticks.
pub fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let seconds = now.timestamp().max(0) as u64;
    let sub_ticks = u64::from(now.timestamp_subsec_nanos() / 100);
    UNIX_EPOCH_TICKS + seconds * TICKS_PER_SECOND + sub_ticks
}

/// Convert a host timestamp to FILETIME ticks. Times before 1601 clamp
/// to zero.
pub fn filetime_from_system_time(time: SystemTime) -> u64 {
    let utc: chrono::DateTime<chrono::Utc> = time.into();
    let seconds = utc.timestamp();
    let sub_ticks = u64::from(utc.timestamp_subsec_nanos() / 100);
    if seconds >= 0 {
        UNIX_EPOCH_TICKS + seconds as u64 * TICKS_PER_SECOND + sub_ticks
    } else {
        UNIX_EPOCH_TICKS
            .saturating_sub(seconds.unsigned_abs() * TICKS_PER_SECOND)
            .saturating_add(sub_ticks)
    }
}

/// The four FILETIME stamps every node carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub creation: u64,
    pub last_access: u64,
    pub last_write: u64,
    pub change: u64,
}

impl Timestamps {
    /// All four stamps set to the same tick value.
    pub fn all(ticks: u64) -> Self {
        Self {
            creation: ticks,
            last_access: ticks,
            last_write: ticks,
            change: ticks,
        }
    }

    /// All four stamps set to the current wall-clock time.
    pub fn now() -> Self {
        Self::all(filetime_now())
    }
}

/// Sentinel parent index of a directory that was unlinked while open.
/// The node survives until its last handle closes.
pub const DETACHED: u64 = u64::MAX;

/// State-tagged view of a node's link word, see [`Node::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLink {
    /// Slot is on the free list; `next_free` is the next slot (0 = none).
    Free { next_free: u64 },
    /// Directory; `parent` is `None` when the directory is detached.
    Directory { parent: Option<NodeIndex> },
    /// Regular file; 0 links means unlinked.
    File { link_count: u64 },
}

/// Fixed-size node record.
///
/// The `link` word is a union interpreted by the attribute state: next
/// free index for free slots, parent index for directories, link count for
/// regular files. It stays a single machine word; the typed accessors
/// assert the state in debug builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub attributes: FileAttributes,
    pub reparse_tag: u32,
    pub file_size: u64,
    pub times: Timestamps,
    link: u64,
}

impl Node {
    /// A free-list record pointing at `next_free` (0 = end of list).
    pub(crate) fn free_slot(next_free: u64) -> Self {
        Self {
            attributes: FileAttributes::empty(),
            reparse_tag: 0,
            file_size: 0,
            times: Timestamps::default(),
            link: next_free,
        }
    }

    /// A live directory node under `parent`.
    pub(crate) fn new_directory(
        attributes: FileAttributes,
        reparse_tag: u32,
        times: Timestamps,
        parent: NodeIndex,
    ) -> Self {
        Self {
            attributes: (attributes | FileAttributes::DIRECTORY).canonical(),
            reparse_tag,
            file_size: 0,
            times,
            link: parent.0,
        }
    }

    /// A live regular file node with one link.
    pub(crate) fn new_file(attributes: FileAttributes, reparse_tag: u32, times: Timestamps) -> Self {
        debug_assert!(!attributes.contains(FileAttributes::DIRECTORY));
        Self {
            attributes: attributes.canonical(),
            reparse_tag,
            file_size: 0,
            times,
            link: 1,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.attributes.is_empty()
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    #[inline]
    pub fn is_reparse_point(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
    }

    /// The link word interpreted by the attribute state.
    pub fn state(&self) -> NodeLink {
        if self.is_free() {
            NodeLink::Free {
                next_free: self.link,
            }
        } else if self.is_directory() {
            NodeLink::Directory {
                parent: (self.link != DETACHED).then_some(NodeIndex(self.link)),
            }
        } else {
            NodeLink::File {
                link_count: self.link,
            }
        }
    }

    /// Parent of a directory node; `None` when detached.
    pub fn parent(&self) -> Option<NodeIndex> {
        debug_assert!(self.is_directory());
        (self.link != DETACHED).then_some(NodeIndex(self.link))
    }

    /// Whether a node no longer has a place in the tree. Such a node is
    /// freed as soon as its open count drops to zero.
    pub fn is_unlinked(&self) -> bool {
        debug_assert!(!self.is_free());
        self.link == if self.is_directory() { DETACHED } else { 0 }
    }

    pub(crate) fn set_parent(&mut self, parent: NodeIndex) {
        debug_assert!(self.is_directory());
        self.link = parent.0;
    }

    pub(crate) fn detach(&mut self) {
        debug_assert!(self.is_directory());
        self.link = DETACHED;
    }

    /// Link count of a regular file node.
    pub fn link_count(&self) -> u64 {
        debug_assert!(!self.is_free() && !self.is_directory());
        self.link
    }

    pub(crate) fn decrement_link(&mut self) {
        debug_assert!(!self.is_directory() && self.link > 0);
        self.link -= 1;
    }

    pub(crate) fn next_free(&self) -> u64 {
        debug_assert!(self.is_free());
        self.link
    }

    pub(crate) fn set_next_free(&mut self, next: u64) {
        debug_assert!(self.is_free());
        self.link = next;
    }
}

/// Per-node auxiliary record, kept parallel to [`Node`] so the fixed-size
/// record stays small and copyable.
#[derive(Debug, Default)]
pub struct NodeAux {
    /// Opaque security descriptor blob; the engine never parses it.
    pub security: Option<Vec<u8>>,
    /// Opaque extra-data blob; carries reparse-point payloads.
    pub extra_data: Option<Vec<u8>>,
    /// File contents (empty for directories).
    pub data: SegmentedBuffer,
    /// Child entries (empty for regular files).
    pub children: ChildIndex,
}

impl NodeAux {
    /// Budget bytes held by this record: blobs plus content allocation.
    /// Child entries are charged individually as they are added.
    pub fn byte_cost(&self) -> u64 {
        blob_cost(&self.security) + blob_cost(&self.extra_data) + self.data.len()
    }
}

/// Budget cost of an optional blob.
#[inline]
pub fn blob_cost(blob: &Option<Vec<u8>>) -> u64 {
    blob.as_ref().map(|b| b.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_attributes() {
        assert_eq!(
            FileAttributes::empty().canonical(),
            FileAttributes::NORMAL
        );
        assert_eq!(
            FileAttributes::HIDDEN.canonical(),
            FileAttributes::HIDDEN
        );
    }

    #[test]
    fn test_link_word_by_state() {
        let free = Node::free_slot(42);
        assert_eq!(free.state(), NodeLink::Free { next_free: 42 });

        let dir = Node::new_directory(
            FileAttributes::empty(),
            0,
            Timestamps::default(),
            NodeIndex(7),
        );
        assert!(dir.is_directory());
        assert_eq!(dir.parent(), Some(NodeIndex(7)));
        assert!(!dir.is_unlinked());

        let mut file = Node::new_file(FileAttributes::ARCHIVE, 0, Timestamps::default());
        assert_eq!(file.link_count(), 1);
        file.decrement_link();
        assert!(file.is_unlinked());
    }

    #[test]
    fn test_detached_directory_is_unlinked() {
        let mut dir = Node::new_directory(
            FileAttributes::empty(),
            0,
            Timestamps::default(),
            NodeIndex::ROOT,
        );
        dir.detach();
        assert_eq!(dir.parent(), None);
        assert!(dir.is_unlinked());
        assert_eq!(dir.state(), NodeLink::Directory { parent: None });
    }

    #[test]
    fn test_filetime_is_after_2020() {
        // 2020-01-01 in FILETIME ticks.
        const TICKS_2020: u64 = 132_223_104_000_000_000;
        assert!(filetime_now() > TICKS_2020);
    }

    #[test]
    fn test_filetime_from_unix_epoch() {
        let ticks = filetime_from_system_time(SystemTime::UNIX_EPOCH);
        assert_eq!(ticks, 116_444_736_000_000_000);
    }
}
