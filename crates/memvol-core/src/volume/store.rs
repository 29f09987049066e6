//! Node storage: the slot array, the free list, and the byte budget.
//!
//! All slots live in one vector behind a reader-writer lock. Shared mode
//! pins the vector in place (no relocation) and is enough for every
//! operation except growing it; growth takes the exclusive mode, reached
//! by upgrading the upgradable-shared mode the create path holds. Each
//! slot carries its own cheap mutexes for the node and aux records, so
//! concurrent shared-mode holders can mutate distinct nodes; `open_count`,
//! the free-list head, and the byte budget are atomics updated by CAS and
//! need no mutex at all.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{
    Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use tracing::{debug, trace};

use crate::error::FsError;
use crate::model::node::{Node, NodeAux};

/// Budget bytes charged per live node, covering both the fixed-size record
/// and its auxiliary record. Charged on allocate, released on free.
pub const NODE_OVERHEAD: u64 = (size_of::<Node>() + size_of::<NodeAux>()) as u64;

/// One slot of the parallel node/aux arrays.
pub(crate) struct Slot {
    pub(crate) node: Mutex<Node>,
    pub(crate) aux: Mutex<NodeAux>,
    pub(crate) open_count: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            node: Mutex::new(Node::free_slot(0)),
            aux: Mutex::new(NodeAux::default()),
            open_count: AtomicU64::new(0),
        }
    }

    fn with(node: Node, aux: NodeAux) -> Self {
        Self {
            node: Mutex::new(node),
            aux: Mutex::new(aux),
            open_count: AtomicU64::new(0),
        }
    }
}

pub(crate) struct NodeStore {
    slots: RwLock<Vec<Slot>>,
    /// Head of the LIFO free list, threaded through the free nodes' link
    /// word. 0 means empty — slot 0 is the root and is never free.
    free_head: AtomicU64,
    /// Remaining byte budget.
    free_size: AtomicU64,
    total_size: u64,
}

impl NodeStore {
    /// Build a store holding only the root node, charging the root's
    /// overhead and blob bytes against the budget.
    pub(crate) fn new(total_size: u64, root: Node, root_aux: NodeAux) -> Result<Self, FsError> {
        let initial_cost = NODE_OVERHEAD + root_aux.byte_cost();
        let free = total_size.checked_sub(initial_cost).ok_or(FsError::Full)?;
        let mut slots = Vec::new();
        slots.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;
        slots.push(Slot::with(root, root_aux));
        Ok(Self {
            slots: RwLock::new(slots),
            free_head: AtomicU64::new(0),
            free_size: AtomicU64::new(free),
            total_size,
        })
    }

    #[inline]
    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub(crate) fn free_size(&self) -> u64 {
        self.free_size.load(Ordering::Acquire)
    }

    /// Subtract `cost` from the budget, failing with [`FsError::Full`]
    /// when it does not fit. Never underflows.
    pub(crate) fn charge(&self, cost: u64) -> Result<(), FsError> {
        let mut current = self.free_size.load(Ordering::Acquire);
        loop {
            if current < cost {
                debug!(cost, free = current, "byte budget exhausted");
                return Err(FsError::Full);
            }
            match self.free_size.compare_exchange_weak(
                current,
                current - cost,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return `cost` bytes to the budget. Every release must match a
    /// prior charge; the sum can never exceed the volume size.
    pub(crate) fn release(&self, cost: u64) {
        let prev = self.free_size.fetch_add(cost, Ordering::AcqRel);
        debug_assert!(prev + cost <= self.total_size, "budget release overshoot");
    }

    /// Shared access to the slot array.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read()
    }

    /// Upgradable-shared access, held by operations that may need to grow
    /// the array (create). Only one such guard exists at a time.
    pub(crate) fn upgradable(&self) -> RwLockUpgradableReadGuard<'_, Vec<Slot>> {
        self.slots.upgradable_read()
    }

    /// Exclusive access; used by the structural validator to get a quiesced
    /// view.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write()
    }

    /// Pop a slot off the free list, if any.
    ///
    /// Concurrent pushes (frees) are handled by the CAS retry. Pops are
    /// serialized by construction: only the create path pops, and it holds
    /// the upgradable guard, of which there is exactly one.
    pub(crate) fn pop_free(&self, slots: &[Slot]) -> Option<u64> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            if head == 0 {
                return None;
            }
            let next = slots[head as usize].node.lock().next_free();
            match self.free_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(observed) => head = observed,
            }
        }
    }

    /// Extend the array by one empty slot, upgrading to the exclusive lock
    /// for the duration of the push. Returns the guard in upgradable mode
    /// again together with the new slot's index.
    pub(crate) fn grow<'a>(
        &'a self,
        guard: RwLockUpgradableReadGuard<'a, Vec<Slot>>,
    ) -> (
        RwLockUpgradableReadGuard<'a, Vec<Slot>>,
        Result<u64, FsError>,
    ) {
        let mut slots = RwLockUpgradableReadGuard::upgrade(guard);
        let result = match slots.try_reserve(1) {
            Ok(()) => {
                slots.push(Slot::empty());
                Ok((slots.len() - 1) as u64)
            }
            Err(_) => Err(FsError::OutOfMemory),
        };
        (RwLockWriteGuard::downgrade_to_upgradable(slots), result)
    }

    /// Release a node's budget charges, zero its records, and push the
    /// slot onto the free list.
    ///
    /// Preconditions (asserted in debug builds): the node is unlinked, no
    /// handles remain open, and its children have already been drained.
    pub(crate) fn free_slot(&self, slots: &[Slot], index: u64) {
        debug_assert_ne!(index, 0, "the root cannot be freed");
        let slot = &slots[index as usize];
        debug_assert_eq!(slot.open_count.load(Ordering::Acquire), 0);

        let aux_cost = {
            let mut aux = slot.aux.lock();
            debug_assert!(aux.children.is_empty(), "freed node still has children");
            let cost = aux.byte_cost();
            *aux = NodeAux::default();
            cost
        };
        {
            let mut node = slot.node.lock();
            debug_assert!(node.is_unlinked());
            *node = Node::free_slot(0);
            let mut head = self.free_head.load(Ordering::Acquire);
            loop {
                node.set_next_free(head);
                match self.free_head.compare_exchange_weak(
                    head,
                    index,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => head = observed,
                }
            }
        }
        self.release(NODE_OVERHEAD + aux_cost);
        trace!(index, "node slot freed");
    }

    /// Snapshot of the free-list head, for the structural validator.
    pub(crate) fn free_head(&self) -> u64 {
        self.free_head.load(Ordering::Acquire)
    }
}
