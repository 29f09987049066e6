//! Structural self-check.
//!
//! Re-walks the whole store under the exclusive lock and asserts every
//! structural invariant: the slot partition (reachable, free-listed, or
//! unlinked-but-open), parent back-pointers, link counts, per-directory
//! ordering, and the byte accounting (`free_size` must equal the volume
//! size minus independently recomputed usage). Panics on any violation;
//! meant for tests and debug tooling, cheap enough to run after every
//! scenario step.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic;

use crate::model::children::{name_cost, CHILD_OVERHEAD};
use crate::model::node::NodeIndex;
use crate::path::compare_names;

use super::store::NODE_OVERHEAD;
use super::Volume;

impl Volume {
    /// Validate the full tree structure and accounting, panicking on the
    /// first violation.
    pub fn check_consistency(&self) {
        let slots = self.store.write();
        let slot_count = slots.len();
        let mut visited = vec![false; slot_count];
        let mut used: u64 = 0;

        // Everything reachable from the root.
        used += self.walk_subtree(&slots, NodeIndex::ROOT.0, &mut visited);

        // The free list.
        let mut free = vec![false; slot_count];
        let mut cursor = self.store.free_head();
        while cursor != 0 {
            let index = cursor as usize;
            assert!(index < slot_count, "free list points past the array");
            assert!(!free[index], "free list cycles through slot {index}");
            assert!(!visited[index], "reachable slot {index} is on the free list");
            free[index] = true;
            let node = slots[index].node.lock();
            assert!(node.is_free(), "slot {index} on the free list is not free");
            cursor = node.next_free();
        }

        // Unlinked-but-open nodes root their own subtrees. Collect the
        // roots first: a root's descendants are linked (to the root) and
        // must not be mistaken for stray slots, whatever their index order.
        let detached_roots: Vec<usize> = (0..slot_count)
            .filter(|&index| {
                if visited[index] || free[index] {
                    return false;
                }
                let node = slots[index].node.lock();
                !node.is_free() && node.is_unlinked()
            })
            .collect();
        for &index in &detached_roots {
            assert!(
                slots[index].open_count.load(atomic::Ordering::Acquire) > 0,
                "unlinked slot {index} has no open handles and was not freed"
            );
            used += self.walk_subtree(&slots, index as u64, &mut visited);
        }

        // Every slot is now accounted for in exactly one category.
        for index in 0..slot_count {
            assert!(
                visited[index] ^ free[index],
                "slot {index} is neither reachable, free, nor unlinked-open"
            );
        }

        let free_size = self.free_size();
        assert_eq!(
            free_size,
            self.total_size() - used,
            "free_size diverges from recomputed usage"
        );
    }

    /// Walk one subtree, marking visited slots, validating each node, and
    /// returning the byte usage of everything in it.
    fn walk_subtree(
        &self,
        slots: &[super::store::Slot],
        root: u64,
        visited: &mut [bool],
    ) -> u64 {
        let mut used = 0u64;
        let mut queue = VecDeque::from([root]);
        assert!(
            !visited[root as usize],
            "subtree root {root} was already visited"
        );
        visited[root as usize] = true;

        while let Some(index) = queue.pop_front() {
            let slot = &slots[index as usize];
            let node = slot.node.lock();
            let aux = slot.aux.lock();
            assert!(!node.is_free(), "free slot {index} inside a subtree");
            assert!(
                node.file_size <= aux.data.len(),
                "file size exceeds allocation on slot {index}"
            );
            used += NODE_OVERHEAD + aux.byte_cost();

            if !node.is_directory() {
                assert!(
                    aux.children.is_empty(),
                    "regular file {index} carries children"
                );
                continue;
            }

            assert_eq!(
                aux.children.iter_from(None, self.ignore_case).count(),
                aux.children.len(),
                "enumeration disagrees with the child count on {index}"
            );

            let mut previous: Option<&str> = None;
            for child in aux.children.iter_from(None, self.ignore_case) {
                if let Some(previous) = previous {
                    assert_eq!(
                        compare_names(previous, &child.name, self.ignore_case),
                        Ordering::Less,
                        "children of {index} are not strictly ordered"
                    );
                }
                previous = Some(&child.name);

                used += CHILD_OVERHEAD + name_cost(&child.name);
                let child_index = child.node.idx();
                assert!(child_index < slots.len(), "child index out of range");
                assert!(
                    !visited[child_index],
                    "slot {child_index} is linked more than once"
                );
                visited[child_index] = true;

                let child_record = slots[child_index].node.lock();
                assert!(!child_record.is_free(), "linked child is a free slot");
                if child_record.is_directory() {
                    assert_eq!(
                        child_record.parent(),
                        Some(NodeIndex(index)),
                        "directory {child_index} has a stale parent pointer"
                    );
                } else {
                    assert!(
                        child_record.link_count() >= 1,
                        "linked file {child_index} has no links"
                    );
                }
                queue.push_back(child.node.0);
            }
        }
        used
    }
}
