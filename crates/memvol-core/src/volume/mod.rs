//! The volume facade: every public engine operation.
//!
//! Callers address nodes by index or by `(parent, leaf name)`; path
//! resolution lives in [`crate::path`]. Each operation acquires the store
//! lock in the cheapest sufficient mode (see [`store`]), then locks the
//! individual slots it touches. Snapshots are returned by value — no
//! reference escapes the store lock, so growing the slot array can never
//! invalidate anything a caller holds.
//!
//! Byte-budget discipline: charges happen before the mutation they pay
//! for, and every failure path releases exactly what it charged. The two
//! documented exceptions that keep partial progress are [`Volume::write`]
//! (short write) and a growing [`Volume::set_allocation_size`].

pub mod check;
mod store;

pub use store::NODE_OVERHEAD;

use std::sync::atomic;

use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::FsError;
use crate::model::children::{name_cost, Child, CHILD_OVERHEAD};
use crate::model::comb;
use crate::model::node::{blob_cost, FileAttributes, Node, NodeAux, NodeIndex, Timestamps};
use crate::options::VolumeOptions;

use store::{NodeStore, Slot};

/// A child entry as returned by enumeration: the stored name and the node
/// it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: CompactString,
    pub node: NodeIndex,
}

/// Point-in-time usage summary of a volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub label: String,
    pub file_system_name: String,
    pub case_sensitive: bool,
    pub total_size: u64,
    pub free_size: u64,
    pub used_size: u64,
    pub node_count: u64,
    pub directory_count: u64,
    pub file_count: u64,
}

/// An in-memory volume: a size-bounded tree of nodes rooted at
/// [`NodeIndex::ROOT`].
pub struct Volume {
    store: NodeStore,
    ignore_case: bool,
    label: Mutex<CompactString>,
    file_system_name: CompactString,
}

impl Volume {
    /// Create a volume containing only the root directory.
    ///
    /// Fails with [`FsError::Full`] when the configured size cannot even
    /// cover the root node and its security blob.
    pub fn new(options: &VolumeOptions) -> Result<Self, FsError> {
        let root = Node::new_directory(
            FileAttributes::DIRECTORY,
            0,
            Timestamps::now(),
            NodeIndex::ROOT,
        );
        let root_aux = NodeAux {
            security: options.root_security.clone(),
            ..NodeAux::default()
        };
        let store = NodeStore::new(options.total_size, root, root_aux)?;
        debug!(
            total_size = options.total_size,
            case_sensitive = options.case_sensitive,
            "volume created"
        );
        Ok(Self {
            store,
            ignore_case: !options.case_sensitive,
            label: Mutex::new(CompactString::new(&options.label)),
            file_system_name: CompactString::new(&options.file_system_name),
        })
    }

    /// Whether name comparison folds case.
    #[inline]
    pub fn is_case_insensitive(&self) -> bool {
        self.ignore_case
    }

    /// Total byte budget of the volume.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.store.total_size()
    }

    /// Remaining byte budget.
    #[inline]
    pub fn free_size(&self) -> u64 {
        self.store.free_size()
    }

    /// The volume label.
    pub fn label(&self) -> CompactString {
        self.label.lock().clone()
    }

    /// Replace the volume label.
    pub fn set_label(&self, label: &str) {
        *self.label.lock() = CompactString::new(label);
    }

    /// The filesystem name reported to the host.
    pub fn file_system_name(&self) -> &str {
        &self.file_system_name
    }

    // ── Node lifecycle ───────────────────────────────────────────────────

    /// Create a node named `name` under `parent`.
    ///
    /// Directories get their parent back-pointer; regular files start with
    /// one link. The attribute set is stored in canonical form.
    pub fn create(
        &self,
        parent: NodeIndex,
        name: &str,
        attributes: FileAttributes,
        reparse_tag: u32,
        times: Timestamps,
    ) -> Result<NodeIndex, FsError> {
        let guard = self.store.upgradable();
        {
            let parent_slot = slot(&guard, parent);
            if !parent_slot.node.lock().is_directory() {
                return Err(FsError::NotADirectory);
            }
            if parent_slot
                .aux
                .lock()
                .children
                .find(name, self.ignore_case)
                .is_some()
            {
                return Err(FsError::AlreadyExists);
            }
        }

        let entry_cost = CHILD_OVERHEAD + name_cost(name);
        self.store.charge(entry_cost)?;
        if let Err(err) = self.store.charge(NODE_OVERHEAD) {
            self.store.release(entry_cost);
            return Err(err);
        }

        // No slot mutex may be held across a grow: the upgrade waits for
        // every shared holder, and a shared holder blocked on one of our
        // mutexes would never leave.
        let (guard, index) = match self.store.pop_free(&guard) {
            Some(index) => (guard, index),
            None => {
                let (guard, grown) = self.store.grow(guard);
                match grown {
                    Ok(index) => (guard, index),
                    Err(err) => {
                        self.store.release(entry_cost + NODE_OVERHEAD);
                        return Err(err);
                    }
                }
            }
        };

        let node = if attributes.contains(FileAttributes::DIRECTORY) {
            Node::new_directory(attributes, reparse_tag, times, parent)
        } else {
            Node::new_file(attributes, reparse_tag, times)
        };
        {
            let new_slot = slot(&guard, NodeIndex(index));
            *new_slot.node.lock() = node;
            debug_assert_eq!(new_slot.aux.lock().byte_cost(), 0);
        }

        {
            let mut parent_aux = slot(&guard, parent).aux.lock();
            // The duplicate check ran before the slot was acquired; nothing
            // can have raced it (creates serialize on the upgradable lock
            // and the caller serializes renames under this parent), but the
            // re-check is cheap and keeps the container honest.
            if parent_aux.children.find(name, self.ignore_case).is_some() {
                drop(parent_aux);
                self.retire_unlinked(&guard, index);
                self.store.release(entry_cost);
                return Err(FsError::AlreadyExists);
            }
            let child = Child {
                name: CompactString::new(name),
                node: NodeIndex(index),
            };
            if let Err(err) = parent_aux.children.add(child, self.ignore_case) {
                drop(parent_aux);
                self.retire_unlinked(&guard, index);
                self.store.release(entry_cost);
                return Err(err);
            }
        }

        trace!(parent = parent.0, name, index, "node created");
        Ok(NodeIndex(index))
    }

    /// Unlink and free a freshly initialized node that never made it into
    /// its parent's child index.
    fn retire_unlinked(&self, slots: &[Slot], index: u64) {
        {
            let mut node = slot(slots, NodeIndex(index)).node.lock();
            if node.is_directory() {
                node.detach();
            } else {
                node.decrement_link();
            }
        }
        self.store.free_slot(slots, index);
    }

    /// Look up `name` under `parent`.
    ///
    /// Under case-insensitive comparison the stored (canonical) spelling is
    /// returned alongside the index; under case-sensitive comparison the
    /// caller's input is already canonical and the second element is `None`.
    pub fn lookup(
        &self,
        parent: NodeIndex,
        name: &str,
    ) -> Option<(NodeIndex, Option<CompactString>)> {
        let slots = self.store.read();
        let parent_slot = slot(&slots, parent);
        if !parent_slot.node.lock().is_directory() {
            return None;
        }
        let aux = parent_slot.aux.lock();
        let (_, child) = aux.children.find(name, self.ignore_case)?;
        let normalized = self.ignore_case.then(|| child.name.clone());
        Some((child.node, normalized))
    }

    /// Snapshot of a node record.
    pub fn get(&self, node: NodeIndex) -> Node {
        let slots = self.store.read();
        let snapshot = *slot(&slots, node).node.lock();
        debug_assert!(!snapshot.is_free(), "get on a free slot");
        snapshot
    }

    /// Open a handle: atomically increment the open count and return a
    /// snapshot.
    pub fn open(&self, node: NodeIndex) -> Node {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        node_slot.open_count.fetch_add(1, atomic::Ordering::AcqRel);
        let snapshot = *node_slot.node.lock();
        debug_assert!(!snapshot.is_free(), "open on a free slot");
        snapshot
    }

    /// Close a handle. When the last handle on an unlinked node closes,
    /// the node is freed and its bytes return to the budget.
    pub fn close(&self, node: NodeIndex) {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let previous = node_slot.open_count.fetch_sub(1, atomic::Ordering::AcqRel);
        assert!(previous > 0, "close without a matching open");
        if previous == 1 {
            let unlinked = {
                let record = node_slot.node.lock();
                !record.is_free() && record.is_unlinked()
            };
            if unlinked {
                self.free_node(&slots, node.0);
            }
        }
    }

    /// Outstanding handle count.
    pub fn open_count(&self, node: NodeIndex) -> u64 {
        let slots = self.store.read();
        slot(&slots, node).open_count.load(atomic::Ordering::Acquire)
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    /// Replace a node's attributes and reparse tag. The Directory bit is
    /// immutable and kept from the stored record.
    pub fn set_attributes(&self, node: NodeIndex, attributes: FileAttributes, reparse_tag: u32) {
        let slots = self.store.read();
        let mut record = slot(&slots, node).node.lock();
        debug_assert!(!record.is_free());
        let dir_bit = record.attributes & FileAttributes::DIRECTORY;
        record.attributes = ((attributes - FileAttributes::DIRECTORY) | dir_bit).canonical();
        record.reparse_tag = reparse_tag;
    }

    /// In-place update of attributes and any subset of the four
    /// timestamps. `None` leaves a field untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn set_times_and_attributes(
        &self,
        node: NodeIndex,
        attributes: Option<FileAttributes>,
        creation: Option<u64>,
        last_access: Option<u64>,
        last_write: Option<u64>,
        change: Option<u64>,
    ) {
        let slots = self.store.read();
        let mut record = slot(&slots, node).node.lock();
        debug_assert!(!record.is_free());
        if let Some(attributes) = attributes {
            let dir_bit = record.attributes & FileAttributes::DIRECTORY;
            record.attributes = ((attributes - FileAttributes::DIRECTORY) | dir_bit).canonical();
        }
        if let Some(ticks) = creation {
            record.times.creation = ticks;
        }
        if let Some(ticks) = last_access {
            record.times.last_access = ticks;
        }
        if let Some(ticks) = last_write {
            record.times.last_write = ticks;
        }
        if let Some(ticks) = change {
            record.times.change = ticks;
        }
    }

    /// Overwrite-style reset: drop the content (size and allocation),
    /// install fresh attributes, tag, and times, and return the resulting
    /// snapshot. Link count and parent are preserved.
    pub fn reset(
        &self,
        node: NodeIndex,
        attributes: FileAttributes,
        reparse_tag: u32,
        times: Timestamps,
    ) -> Node {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let mut record = node_slot.node.lock();
        {
            let mut aux = node_slot.aux.lock();
            let released = aux.data.len();
            aux.data.set_length(0).expect("shrink cannot fail");
            if released > 0 {
                self.store.release(released);
            }
        }
        debug_assert!(!record.is_free());
        let dir_bit = record.attributes & FileAttributes::DIRECTORY;
        record.attributes = ((attributes - FileAttributes::DIRECTORY) | dir_bit).canonical();
        record.reparse_tag = reparse_tag;
        record.file_size = 0;
        record.times = times;
        *record
    }

    // ── Rename ───────────────────────────────────────────────────────────

    /// Rename `src_name` under `src_parent` to `dst_name` under
    /// `dst_parent`, replacing an existing destination entry if there is
    /// one. The replaced node is unlinked and survives only as long as
    /// open handles keep it alive.
    pub fn rename(
        &self,
        src_parent: NodeIndex,
        src_name: &str,
        dst_parent: NodeIndex,
        dst_name: &str,
    ) -> Result<(), FsError> {
        if src_parent == dst_parent {
            self.rename_within(src_parent, src_name, dst_name)
        } else {
            self.rename_across(src_parent, src_name, dst_parent, dst_name)
        }
    }

    fn rename_within(
        &self,
        parent: NodeIndex,
        src_name: &str,
        dst_name: &str,
    ) -> Result<(), FsError> {
        let slots = self.store.read();
        let parent_slot = slot(&slots, parent);
        let mut aux = parent_slot.aux.lock();

        let (src_index, src_node, src_stored) = {
            let (index, child) = aux
                .children
                .find(src_name, self.ignore_case)
                .ok_or(FsError::PathNotFound)?;
            (index, child.node, child.name.clone())
        };
        let existing = aux
            .children
            .find(dst_name, self.ignore_case)
            .map(|(index, child)| (index, child.node));

        match existing {
            Some((dst_index, old_node)) if dst_index != src_index => {
                // Replace: the destination entry keeps its stored spelling
                // and is repointed at the source node; the source entry
                // disappears; the old destination node is unlinked.
                aux.children.set_node(dst_index, src_node);
                aux.children.remove(src_index, self.ignore_case);
                drop(aux);
                self.store.release(CHILD_OVERHEAD + name_cost(&src_stored));
                self.unlink_node(&slots, old_node.0);
                debug!(
                    parent = parent.0,
                    src_name, dst_name, "rename replaced existing entry"
                );
            }
            _ => {
                // Fresh name (or a pure case change of the same entry):
                // rename in place and re-sort within the tooth.
                let old_cost = name_cost(&src_stored);
                let new_cost = name_cost(dst_name);
                if new_cost > old_cost {
                    self.store.charge(new_cost - old_cost)?;
                } else if old_cost > new_cost {
                    self.store.release(old_cost - new_cost);
                }
                aux.children.rename(src_index, dst_name, self.ignore_case);
            }
        }
        Ok(())
    }

    fn rename_across(
        &self,
        src_parent: NodeIndex,
        src_name: &str,
        dst_parent: NodeIndex,
        dst_name: &str,
    ) -> Result<(), FsError> {
        let slots = self.store.read();
        let src_slot = slot(&slots, src_parent);
        let dst_slot = slot(&slots, dst_parent);

        // Both child indexes are locked for the whole move; index order
        // keeps concurrent cross-directory renames deadlock-free.
        let (mut src_aux, mut dst_aux) = if src_parent < dst_parent {
            let src = src_slot.aux.lock();
            let dst = dst_slot.aux.lock();
            (src, dst)
        } else {
            let dst = dst_slot.aux.lock();
            let src = src_slot.aux.lock();
            (src, dst)
        };

        let (src_index, src_node, src_stored) = {
            let (index, child) = src_aux
                .children
                .find(src_name, self.ignore_case)
                .ok_or(FsError::PathNotFound)?;
            (index, child.node, child.name.clone())
        };

        let replaced = match dst_aux
            .children
            .find(dst_name, self.ignore_case)
            .map(|(index, child)| (index, child.node))
        {
            Some((dst_index, old_node)) => {
                dst_aux.children.set_node(dst_index, src_node);
                Some(old_node)
            }
            None => {
                let entry_cost = CHILD_OVERHEAD + name_cost(dst_name);
                self.store.charge(entry_cost)?;
                let child = Child {
                    name: CompactString::new(dst_name),
                    node: src_node,
                };
                if let Err(err) = dst_aux.children.add(child, self.ignore_case) {
                    self.store.release(entry_cost);
                    return Err(err);
                }
                None
            }
        };

        src_aux.children.remove(src_index, self.ignore_case);
        self.store.release(CHILD_OVERHEAD + name_cost(&src_stored));

        {
            let mut moved = slot(&slots, src_node).node.lock();
            if moved.is_directory() {
                moved.set_parent(dst_parent);
            }
        }

        drop(src_aux);
        drop(dst_aux);
        if let Some(old_node) = replaced {
            self.unlink_node(&slots, old_node.0);
        }
        debug!(
            src = src_parent.0,
            dst = dst_parent.0,
            src_name,
            dst_name,
            "cross-directory rename"
        );
        Ok(())
    }

    // ── Remove ───────────────────────────────────────────────────────────

    /// Remove the child entry `name` under `parent` and unlink its node.
    /// Returns `false` when no such entry exists.
    pub fn remove(&self, parent: NodeIndex, name: &str) -> bool {
        let slots = self.store.read();
        let parent_slot = slot(&slots, parent);
        let (child_node, stored_name) = {
            let mut aux = parent_slot.aux.lock();
            let Some((index, child)) = aux.children.find(name, self.ignore_case) else {
                return false;
            };
            let node = child.node;
            let removed = aux.children.remove(index, self.ignore_case);
            (node, removed.name)
        };
        self.store
            .release(CHILD_OVERHEAD + name_cost(&stored_name));
        self.unlink_node(&slots, child_node.0);
        trace!(parent = parent.0, name, "child removed");
        true
    }

    /// Unlink every child of `parent` in one pass.
    pub fn remove_children(&self, parent: NodeIndex) {
        let slots = self.store.read();
        let drained = {
            let mut aux = slot(&slots, parent).aux.lock();
            aux.children.drain_all()
        };
        for child in &drained {
            self.store.release(CHILD_OVERHEAD + name_cost(&child.name));
        }
        for child in drained {
            self.unlink_node(&slots, child.node.0);
        }
    }

    /// Drop a node's place in the tree: directories detach from their
    /// parent, files lose a link. Nodes that end up unreachable with no
    /// open handles are freed immediately; the rest wait for their last
    /// close.
    fn unlink_node(&self, slots: &[Slot], index: u64) {
        let node_slot = &slots[index as usize];
        let unreachable = {
            let mut record = node_slot.node.lock();
            if record.is_directory() {
                record.detach();
            } else {
                record.decrement_link();
            }
            record.is_unlinked()
        };
        if unreachable && node_slot.open_count.load(atomic::Ordering::Acquire) == 0 {
            self.free_node(slots, index);
        }
    }

    /// Free an unreachable, closed node, recursively unlinking any
    /// children it still carries.
    fn free_node(&self, slots: &[Slot], index: u64) {
        let drained = {
            let mut aux = slots[index as usize].aux.lock();
            aux.children.drain_all()
        };
        for child in &drained {
            self.store.release(CHILD_OVERHEAD + name_cost(&child.name));
        }
        for child in drained {
            self.unlink_node(slots, child.node.0);
        }
        self.store.free_slot(slots, index);
    }

    // ── Blobs ────────────────────────────────────────────────────────────

    /// Copy of the node's security descriptor blob.
    pub fn security(&self, node: NodeIndex) -> Option<Vec<u8>> {
        let slots = self.store.read();
        let result = slot(&slots, node).aux.lock().security.clone();
        result
    }

    /// Replace the security descriptor blob, accounting the size delta.
    pub fn set_security(&self, node: NodeIndex, blob: Option<&[u8]>) -> Result<(), FsError> {
        let slots = self.store.read();
        let copied = copy_blob(blob)?;
        let mut aux = slot(&slots, node).aux.lock();
        self.recharge_blob(blob_cost(&aux.security), blob_cost(&copied))?;
        aux.security = copied;
        Ok(())
    }

    /// Read-modify-write of the security blob under the shared lock.
    ///
    /// The closure sees the current blob and returns `Some(replacement)`
    /// to install a new one or `None` to leave it unchanged. The size
    /// delta is accounted; on [`FsError::Full`] nothing is applied.
    pub fn modify_security(
        &self,
        node: NodeIndex,
        f: impl FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>, FsError>,
    ) -> Result<(), FsError> {
        let slots = self.store.read();
        let mut aux = slot(&slots, node).aux.lock();
        if let Some(replacement) = f(aux.security.as_deref())? {
            self.recharge_blob(blob_cost(&aux.security), replacement.len() as u64)?;
            aux.security = Some(replacement);
        }
        Ok(())
    }

    /// Copy of the node's extra-data blob.
    pub fn extra_data(&self, node: NodeIndex) -> Option<Vec<u8>> {
        let slots = self.store.read();
        let result = slot(&slots, node).aux.lock().extra_data.clone();
        result
    }

    /// Replace the extra-data blob, accounting the size delta.
    pub fn set_extra_data(&self, node: NodeIndex, blob: Option<&[u8]>) -> Result<(), FsError> {
        let slots = self.store.read();
        let copied = copy_blob(blob)?;
        let mut aux = slot(&slots, node).aux.lock();
        self.recharge_blob(blob_cost(&aux.extra_data), blob_cost(&copied))?;
        aux.extra_data = copied;
        Ok(())
    }

    /// The reparse payload of a reparse-point node.
    pub fn reparse_data(&self, node: NodeIndex) -> Result<Vec<u8>, FsError> {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        if !node_slot.node.lock().is_reparse_point() {
            return Err(FsError::NotAReparsePoint);
        }
        let result = node_slot.aux.lock().extra_data.clone().unwrap_or_default();
        Ok(result)
    }

    /// Charge or release the difference between two blob sizes.
    fn recharge_blob(&self, old_cost: u64, new_cost: u64) -> Result<(), FsError> {
        if new_cost > old_cost {
            self.store.charge(new_cost - old_cost)
        } else {
            self.store.release(old_cost - new_cost);
            Ok(())
        }
    }

    // ── Content ──────────────────────────────────────────────────────────

    /// Allocated content size (may exceed the logical file size).
    pub fn allocation_size(&self, node: NodeIndex) -> u64 {
        let slots = self.store.read();
        let result = slot(&slots, node).aux.lock().data.len();
        result
    }

    /// Resize the backing allocation.
    ///
    /// Shrinking cannot fail and clamps the file size. Growing charges the
    /// delta up front; if the allocator refuses part-way, the acquired
    /// part is kept, the over-charge is released, and the call reports
    /// [`FsError::OutOfMemory`] with `allocation_size` reflecting reality.
    pub fn set_allocation_size(&self, node: NodeIndex, new_size: u64) -> Result<(), FsError> {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let mut record = node_slot.node.lock();
        let mut aux = node_slot.aux.lock();
        let old_size = aux.data.len();
        if new_size == old_size {
            return Ok(());
        }
        if new_size < old_size {
            aux.data.set_length(new_size).expect("shrink cannot fail");
            self.store.release(old_size - new_size);
            if record.file_size > new_size {
                record.file_size = new_size;
            }
            return Ok(());
        }
        self.store.charge(new_size - old_size)?;
        match aux.data.set_length(new_size) {
            Ok(()) => Ok(()),
            Err(err) => {
                let reached = aux.data.len();
                self.store.release(new_size - reached);
                Err(err)
            }
        }
    }

    /// Set the logical file size, growing the allocation (to segment
    /// granularity) when needed. Bytes exposed by growth read as zero.
    pub fn set_file_size(&self, node: NodeIndex, new_size: u64) -> Result<(), FsError> {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let mut record = node_slot.node.lock();
        let mut aux = node_slot.aux.lock();
        let old_alloc = aux.data.len();
        if new_size > old_alloc {
            let target = comb::rounded_length(new_size);
            self.store.charge(target - old_alloc)?;
            if let Err(err) = aux.data.set_length(target) {
                let reached = aux.data.len();
                self.store.release(target - reached);
                return Err(err);
            }
        }
        if new_size > record.file_size {
            aux.data.zero(record.file_size, new_size - record.file_size);
        }
        record.file_size = new_size;
        Ok(())
    }

    /// Read at `offset`, clamped to the file size. Returns the byte count
    /// actually read; 0 at or past end of file.
    pub fn read(&self, node: NodeIndex, offset: u64, dst: &mut [u8]) -> usize {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let file_size = node_slot.node.lock().file_size;
        if offset >= file_size {
            return 0;
        }
        let count = (dst.len() as u64).min(file_size - offset) as usize;
        node_slot.aux.lock().data.read(offset, &mut dst[..count]);
        count
    }

    /// Write at `offset`, extending the file and its allocation as needed.
    ///
    /// Growth charges the budget through a fallback ladder: the
    /// segment-rounded target first, then the exact target, then halfway
    /// steps toward the current allocation. A partial allocator failure
    /// keeps the reached allocation and completes a short write. The
    /// returned count is what actually landed; [`FsError::Full`] /
    /// [`FsError::OutOfMemory`] are reported only when not a single byte
    /// could be written.
    pub fn write(&self, node: NodeIndex, offset: u64, src: &[u8]) -> Result<usize, FsError> {
        let slots = self.store.read();
        let node_slot = slot(&slots, node);
        let mut record = node_slot.node.lock();
        let mut aux = node_slot.aux.lock();
        debug_assert!(!record.is_directory(), "write to a directory");

        // Clamp at the address-space ceiling; the shim rejects offsets
        // this large before they get here.
        let len = (src.len() as u64).min(u64::MAX - offset);
        if len == 0 {
            return Ok(0);
        }
        let end = offset + len;
        let old_alloc = aux.data.len();
        let mut achieved = old_alloc;
        let mut oom_partial = false;

        if end > old_alloc {
            let mut target = comb::rounded_length(end);
            loop {
                if self.store.charge(target - old_alloc).is_ok() {
                    match aux.data.set_length(target) {
                        Ok(()) => achieved = target,
                        Err(_) => {
                            achieved = aux.data.len();
                            self.store.release(target - achieved);
                            oom_partial = true;
                        }
                    }
                    break;
                }
                let next = if target > end {
                    end
                } else {
                    old_alloc + (target - old_alloc) / 2
                };
                if next == old_alloc || next == target {
                    break;
                }
                target = next;
            }
        }

        let writable_end = achieved.min(end);
        let writable = writable_end.saturating_sub(offset);
        if writable == 0 {
            // Growth that still does not reach the write offset is useless;
            // roll it back so a failed write leaves no trace.
            if achieved > old_alloc {
                aux.data.set_length(old_alloc).expect("shrink cannot fail");
                self.store.release(achieved - old_alloc);
            }
            return Err(if oom_partial {
                FsError::OutOfMemory
            } else {
                FsError::Full
            });
        }

        // Bytes between the old end of file and the write offset must read
        // as zero even where the allocation already held stale data.
        if offset > record.file_size {
            aux.data.zero(record.file_size, offset - record.file_size);
        }
        aux.data.write(offset, &src[..writable as usize]);
        if offset + writable > record.file_size {
            record.file_size = offset + writable;
        }
        Ok(writable as usize)
    }

    // ── Enumeration ──────────────────────────────────────────────────────

    /// Whether a directory has any children.
    pub fn has_children(&self, node: NodeIndex) -> bool {
        let slots = self.store.read();
        let result = !slot(&slots, node).aux.lock().children.is_empty();
        result
    }

    /// Visit children of `parent` in sorted order, starting strictly after
    /// `marker` (all children for `None`). The visitor returns `false` to
    /// stop. The shared lock is held for the duration of the walk.
    pub fn read_children(
        &self,
        parent: NodeIndex,
        marker: Option<&str>,
        mut visit: impl FnMut(&str, NodeIndex) -> bool,
    ) {
        let slots = self.store.read();
        let aux = slot(&slots, parent).aux.lock();
        for child in aux.children.iter_from(marker, self.ignore_case) {
            if !visit(&child.name, child.node) {
                break;
            }
        }
    }

    /// Collect children of `parent` in sorted order, starting strictly
    /// after `marker`.
    pub fn children_from(&self, parent: NodeIndex, marker: Option<&str>) -> Vec<DirEntry> {
        let mut entries = Vec::new();
        self.read_children(parent, marker, |name, node| {
            entries.push(DirEntry {
                name: CompactString::new(name),
                node,
            });
            true
        });
        entries
    }

    /// Usage summary. Walks every slot under the shared lock.
    pub fn stats(&self) -> VolumeStats {
        let slots = self.store.read();
        let mut node_count = 0;
        let mut directory_count = 0;
        let mut file_count = 0;
        for node_slot in slots.iter() {
            let record = node_slot.node.lock();
            if record.is_free() {
                continue;
            }
            node_count += 1;
            if record.is_directory() {
                directory_count += 1;
            } else {
                file_count += 1;
            }
        }
        let free_size = self.store.free_size();
        VolumeStats {
            label: self.label.lock().to_string(),
            file_system_name: self.file_system_name.to_string(),
            case_sensitive: !self.ignore_case,
            total_size: self.store.total_size(),
            free_size,
            used_size: self.store.total_size() - free_size,
            node_count,
            directory_count,
            file_count,
        }
    }
}

/// Address a slot, panicking on an impossible index (caller bug).
fn slot<'a>(slots: &'a [Slot], node: NodeIndex) -> &'a Slot {
    &slots[node.idx()]
}

/// Fallibly copy a caller-supplied blob.
fn copy_blob(blob: Option<&[u8]>) -> Result<Option<Vec<u8>>, FsError> {
    match blob {
        None => Ok(None),
        Some(bytes) => {
            let mut copied = Vec::new();
            copied
                .try_reserve_exact(bytes.len())
                .map_err(|_| FsError::OutOfMemory)?;
            copied.extend_from_slice(bytes);
            Ok(Some(copied))
        }
    }
}
