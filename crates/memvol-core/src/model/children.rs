//! Per-directory child index: a segmented array of sorted "teeth".
//!
//! Entries live in fixed-capacity teeth of 128 children. Every tooth is an
//! independently sorted run; teeth are not sorted relative to one another.
//! Adding a child only ever touches the tail tooth, so insertion cost is
//! bounded by the tooth capacity no matter how large the directory grows,
//! and no add or remove ever relocates more than one tooth's worth of
//! entries. In-order enumeration is a k-way merge across the runs.
//!
//! Layout invariant: every tooth except the last holds exactly
//! [`TOOTH_CAPACITY`] children and the last holds at least one, so a global
//! slot index maps to `(index / capacity, index % capacity)`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::mem::size_of;

use compact_str::CompactString;

use crate::error::FsError;
use crate::path::compare_names;

use super::node::NodeIndex;

/// Children per tooth (2^7).
pub const TOOTH_CAPACITY: usize = 1 << 7;

/// Budget bytes charged per child entry, on top of the name charge.
pub const CHILD_OVERHEAD: u64 = size_of::<Child>() as u64;

/// Budget bytes charged for a child name: two bytes per UTF-16 code unit,
/// the host driver's wire encoding, independent of the internal UTF-8
/// representation.
pub fn name_cost(name: &str) -> u64 {
    2 * name.encode_utf16().count() as u64
}

/// A directory entry: the stored (canonical-case) name and the node it
/// refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Child {
    pub name: CompactString,
    pub node: NodeIndex,
}

/// Ordered set of a directory's children.
#[derive(Debug, Default)]
pub struct ChildIndex {
    teeth: Vec<Vec<Child>>,
}

impl ChildIndex {
    /// Number of children.
    pub fn len(&self) -> usize {
        match self.teeth.last() {
            None => 0,
            Some(tail) => (self.teeth.len() - 1) * TOOTH_CAPACITY + tail.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.teeth.is_empty()
    }

    /// The child at a global slot index.
    pub fn get(&self, index: usize) -> &Child {
        &self.teeth[index / TOOTH_CAPACITY][index % TOOTH_CAPACITY]
    }

    /// Look up a name under the given case policy.
    ///
    /// Binary-searches every tooth; names are unique under the policy, so
    /// the first hit is the only one. Returns the global slot index and the
    /// entry (whose `name` carries the stored spelling).
    pub fn find(&self, name: &str, ignore_case: bool) -> Option<(usize, &Child)> {
        for (ti, tooth) in self.teeth.iter().enumerate() {
            if let Ok(pos) =
                tooth.binary_search_by(|c| compare_names(&c.name, name, ignore_case))
            {
                return Some((ti * TOOTH_CAPACITY + pos, &tooth[pos]));
            }
        }
        None
    }

    /// Insert a child, keeping its tooth sorted.
    ///
    /// The caller has already checked for duplicates under its case policy.
    /// Fails with [`FsError::OutOfMemory`] only when a new tooth cannot be
    /// allocated; an insert into an existing tooth cannot fail.
    pub fn add(&mut self, child: Child, ignore_case: bool) -> Result<(), FsError> {
        let needs_tooth = self
            .teeth
            .last()
            .map(|tail| tail.len() == TOOTH_CAPACITY)
            .unwrap_or(true);
        if needs_tooth {
            self.teeth
                .try_reserve(1)
                .map_err(|_| FsError::OutOfMemory)?;
            let mut tooth = Vec::new();
            tooth
                .try_reserve_exact(TOOTH_CAPACITY)
                .map_err(|_| FsError::OutOfMemory)?;
            self.teeth.push(tooth);
        }
        let tail = self.teeth.last_mut().unwrap();
        let pos = tail.partition_point(|c| {
            compare_names(&c.name, &child.name, ignore_case) == Ordering::Less
        });
        tail.insert(pos, child);
        Ok(())
    }

    /// Remove the child at a global slot index.
    ///
    /// The vacated slot is backfilled with the globally last child, which
    /// is then sifted into its sorted position within the tooth it landed
    /// in; an empty tail tooth is dropped.
    pub fn remove(&mut self, index: usize, ignore_case: bool) -> Child {
        let (ti, si) = (index / TOOTH_CAPACITY, index % TOOTH_CAPACITY);
        let last = self
            .teeth
            .last_mut()
            .expect("remove from empty ChildIndex")
            .pop()
            .expect("teeth are never empty");
        let removed = if ti == self.teeth.len() - 1 && si == self.teeth[ti].len() {
            // The removed child was the globally last one.
            last
        } else {
            let removed = std::mem::replace(&mut self.teeth[ti][si], last);
            self.sift(ti, si, ignore_case);
            removed
        };
        if self.teeth.last().is_some_and(|tail| tail.is_empty()) {
            self.teeth.pop();
        }
        removed
    }

    /// Rename the child at a global slot index in place, then restore its
    /// tooth's sort order.
    pub fn rename(&mut self, index: usize, new_name: &str, ignore_case: bool) {
        let (ti, si) = (index / TOOTH_CAPACITY, index % TOOTH_CAPACITY);
        self.teeth[ti][si].name = CompactString::new(new_name);
        self.sift(ti, si, ignore_case);
    }

    /// Repoint the child at a global slot index at a different node. The
    /// name is untouched, so no re-sort is needed.
    pub fn set_node(&mut self, index: usize, node: NodeIndex) {
        let (ti, si) = (index / TOOTH_CAPACITY, index % TOOTH_CAPACITY);
        self.teeth[ti][si].node = node;
    }

    /// Move the entry at `(ti, si)` to its sorted position within its
    /// tooth.
    fn sift(&mut self, ti: usize, si: usize, ignore_case: bool) {
        let tooth = &mut self.teeth[ti];
        let child = tooth.remove(si);
        let pos = tooth.partition_point(|c| {
            compare_names(&c.name, &child.name, ignore_case) == Ordering::Less
        });
        tooth.insert(pos, child);
    }

    /// All children in storage order. O(1) per step.
    pub fn iter_unordered(&self) -> impl Iterator<Item = &Child> {
        self.teeth.iter().flatten()
    }

    /// Drain every child, in storage order.
    pub fn drain_all(&mut self) -> Vec<Child> {
        let mut out = Vec::new();
        for mut tooth in self.teeth.drain(..) {
            out.append(&mut tooth);
        }
        out
    }

    /// Children whose names compare strictly greater than `marker`, in
    /// sorted order; all children for a `None` marker.
    ///
    /// A k-way merge: each tooth contributes a cursor positioned (by binary
    /// search) at its first name past the marker, and a min-heap of the
    /// cursors yields the global order. Exhausted cursors leave the heap.
    pub fn iter_from<'a>(
        &'a self,
        marker: Option<&str>,
        ignore_case: bool,
    ) -> SortedChildren<'a> {
        let mut heap = BinaryHeap::with_capacity(self.teeth.len());
        for tooth in &self.teeth {
            let pos = match marker {
                None => 0,
                Some(marker) => tooth.partition_point(|c| {
                    compare_names(&c.name, marker, ignore_case) != Ordering::Greater
                }),
            };
            if pos < tooth.len() {
                heap.push(ToothCursor {
                    run: tooth.as_slice(),
                    pos,
                    ignore_case,
                });
            }
        }
        SortedChildren { heap }
    }
}

/// Cursor into one tooth's sorted run, ordered by its current name
/// (reversed, so `BinaryHeap`'s max-heap pops the smallest name first).
struct ToothCursor<'a> {
    run: &'a [Child],
    pos: usize,
    ignore_case: bool,
}

impl<'a> ToothCursor<'a> {
    fn current(&self) -> &'a Child {
        &self.run[self.pos]
    }
}

impl PartialEq for ToothCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ToothCursor<'_> {}

impl PartialOrd for ToothCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ToothCursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_names(
            &other.current().name,
            &self.current().name,
            self.ignore_case,
        )
        // Names are unique across a directory; the address tie-break only
        // keeps the order total for identical cursors.
        .then_with(|| (other.run.as_ptr(), other.pos).cmp(&(self.run.as_ptr(), self.pos)))
    }
}

/// In-order child enumeration, see [`ChildIndex::iter_from`].
pub struct SortedChildren<'a> {
    heap: BinaryHeap<ToothCursor<'a>>,
}

impl<'a> Iterator for SortedChildren<'a> {
    type Item = &'a Child;

    fn next(&mut self) -> Option<&'a Child> {
        let mut cursor = self.heap.pop()?;
        let child = cursor.current();
        cursor.pos += 1;
        if cursor.pos < cursor.run.len() {
            self.heap.push(cursor);
        }
        Some(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str, node: u64) -> Child {
        Child {
            name: CompactString::new(name),
            node: NodeIndex(node),
        }
    }

    /// Deterministic pseudo-random 8-hex-char names (xorshift; no RNG dep).
    fn hex_names(count: usize) -> Vec<String> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut names = Vec::with_capacity(count);
        while names.len() < count {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let name = format!("{:08x}", (state >> 32) as u32);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    #[test]
    fn test_find_on_empty_index() {
        let index = ChildIndex::default();
        assert!(index.find("anything", false).is_none());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_add_then_find() {
        let mut index = ChildIndex::default();
        index.add(child("beta", 2), false).unwrap();
        index.add(child("alpha", 1), false).unwrap();
        index.add(child("gamma", 3), false).unwrap();

        let (_, found) = index.find("beta", false).unwrap();
        assert_eq!(found.node, NodeIndex(2));
        assert!(index.find("delta", false).is_none());
    }

    #[test]
    fn test_ignore_case_find_returns_stored_spelling() {
        let mut index = ChildIndex::default();
        index.add(child("Foo", 1), true).unwrap();

        let (_, found) = index.find("FOO", true).unwrap();
        assert_eq!(found.name, "Foo");
        assert!(index.find("FOO", false).is_none());
    }

    #[test]
    fn test_grows_across_teeth() {
        let mut index = ChildIndex::default();
        let names = hex_names(TOOTH_CAPACITY + 1);
        for (i, name) in names.iter().enumerate() {
            index.add(child(name, i as u64), false).unwrap();
        }
        assert_eq!(index.len(), TOOTH_CAPACITY + 1);
        for name in &names {
            assert!(index.find(name, false).is_some(), "lost {name}");
        }
    }

    #[test]
    fn test_remove_backfills_and_stays_searchable() {
        let mut index = ChildIndex::default();
        let names = hex_names(3 * TOOTH_CAPACITY + 17);
        for (i, name) in names.iter().enumerate() {
            index.add(child(name, i as u64), false).unwrap();
        }
        // Remove every third name (by fresh lookup, since indices shift).
        for name in names.iter().step_by(3) {
            let (slot, _) = index.find(name, false).unwrap();
            let removed = index.remove(slot, false);
            assert_eq!(&removed.name, name);
        }
        for (i, name) in names.iter().enumerate() {
            let found = index.find(name, false);
            if i % 3 == 0 {
                assert!(found.is_none(), "{name} should be gone");
            } else {
                assert!(found.is_some(), "{name} should remain");
            }
        }
        assert_eq!(index.len(), names.len() - names.len().div_ceil(3));
    }

    #[test]
    fn test_rename_resorts_within_tooth() {
        let mut index = ChildIndex::default();
        for name in ["a", "m", "z"] {
            index.add(child(name, 1), false).unwrap();
        }
        let (slot, _) = index.find("a", false).unwrap();
        index.rename(slot, "q", false);

        let ordered: Vec<&str> = index
            .iter_from(None, false)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(ordered, vec!["m", "q", "z"]);
    }

    #[test]
    fn test_iter_from_merges_teeth_in_order() {
        let mut index = ChildIndex::default();
        let mut names = hex_names(1000);
        for (i, name) in names.iter().enumerate() {
            index.add(child(name, i as u64), false).unwrap();
        }
        names.sort();

        // Full enumeration matches the sorted reference.
        let all: Vec<String> = index
            .iter_from(None, false)
            .map(|c| c.name.to_string())
            .collect();
        assert_eq!(all, names);

        // Marker at the 500th name: exactly the strictly-greater tail.
        let marker = &names[499];
        let tail: Vec<String> = index
            .iter_from(Some(marker), false)
            .map(|c| c.name.to_string())
            .collect();
        assert_eq!(tail.len(), 500);
        assert_eq!(tail, names[500..]);
        assert!(tail.iter().all(|n| n.as_str() > marker.as_str()));
    }

    #[test]
    fn test_iter_from_marker_past_everything() {
        let mut index = ChildIndex::default();
        index.add(child("alpha", 1), false).unwrap();
        index.add(child("beta", 2), false).unwrap();
        assert_eq!(index.iter_from(Some("zzz"), false).count(), 0);
    }

    #[test]
    fn test_name_cost_counts_utf16_units() {
        assert_eq!(name_cost("abc"), 6);
        // U+1F4C1 encodes as a surrogate pair: two UTF-16 units.
        assert_eq!(name_cost("\u{1F4C1}"), 4);
    }
}
