// SPDX-License-Identifier: MPL-2.0

//! Block allocation.
//!
//! Allocations and frees are recorded as intents in a bounded ring queue
//! and applied to the per-transaction block sets by the top-level caller
//! only. A B+ tree update that allocates or frees blocks (copy-on-write,
//! splits, merges) therefore never recursively mutates the set that is
//! already being updated; the queued intents drain once the outer update
//! finishes.

use crate::{
    layers::{
        bio::BlockNum,
        cache::DevId,
        fs::{Fs, TxId},
        tree::{SetId, MAX_TREE_DEPTH},
    },
    prelude::*,
};

/// Queue length large enough for a worst case tree update, e.g. an update
/// of a tree where each entry needs to be copied then split.
const QUEUE_LEN: usize = MAX_TREE_DEPTH * 2 * MAX_TREE_DEPTH * 2;

/// A pending block allocation set update.
#[derive(Clone, Copy, Debug, Default)]
struct QueueEntry {
    block: BlockNum,
    tmp: bool,
    free: bool,
    removed: bool,
}

/// Ring buffer of pending set updates.
pub(crate) struct AllocQueue {
    entries: [QueueEntry; QUEUE_LEN],
    head: usize,
    tail: usize,
    updating: bool,
}

impl AllocQueue {
    pub fn new() -> Self {
        Self {
            entries: [QueueEntry::default(); QUEUE_LEN],
            head: 0,
            tail: 0,
            updating: false,
        }
    }

    fn is_empty(&self) -> bool {
        assert!(self.head < QUEUE_LEN);
        assert!(self.tail < QUEUE_LEN);
        self.head == self.tail
    }

    fn find(&self, block: BlockNum) -> Option<usize> {
        let mut i = self.head;
        while i != self.tail {
            if !self.entries[i].removed && self.entries[i].block == block {
                return Some(i);
            }
            i = (i + 1) % QUEUE_LEN;
        }
        None
    }

    /// Add a dummy entry to make the queue non-empty, deferring set
    /// updates to an explicit `process_queue` call.
    fn add_dummy(&mut self) {
        assert!(self.is_empty());
        self.entries[self.tail].removed = true;
        self.tail = (self.tail + 1) % QUEUE_LEN;
    }

    /// Queue an allocate or free intent. An opposing intent for the same
    /// block already in the queue is cancelled instead, unless it is the
    /// head entry currently being applied.
    fn add(&mut self, block: BlockNum, is_tmp: bool, is_free: bool) {
        if let Some(index) = self.find(block) {
            assert_eq!(self.entries[index].tmp, is_tmp);
            assert_ne!(self.entries[index].free, is_free);
            self.entries[index].removed = true;
            if index != self.head || !self.updating {
                return;
            }
            warn!(
                "block {}, tmp {}, free {}, removed head during update",
                block, is_tmp, is_free
            );
        }

        let new_tail = (self.tail + 1) % QUEUE_LEN;
        assert_ne!(new_tail, self.head, "allocator queue overflow");
        self.entries[self.tail] = QueueEntry {
            block,
            tmp: is_tmp,
            free: is_free,
            removed: false,
        };
        self.tail = new_tail;
    }

    fn peek_head(&self) -> QueueEntry {
        assert!(!self.is_empty());
        self.entries[self.head]
    }

    fn remove_head(&mut self, entry: QueueEntry) {
        assert_eq!(self.peek_head().block, entry.block);
        self.head = (self.head + 1) % QUEUE_LEN;
    }

    /// First block at or after `block` that is not queued for allocation.
    fn find_free_block(&self, mut block: BlockNum) -> BlockNum {
        loop {
            match self.find(block) {
                None => return block,
                Some(index) if self.entries[index].free => return block,
                Some(_) => block += 1,
            }
        }
    }
}

impl Fs {
    /// Search for a block that is in the committed free set and not
    /// already allocated by any transaction or queued for allocation.
    fn find_free_block(&mut self, tx: TxId, min_block_in: BlockNum) -> BlockNum {
        assert!(self.tx(tx).active);

        let mut min_block = min_block_in;
        let mut block = min_block;
        loop {
            block = self.block_set_find_next_block(tx, SetId::Free, block, true);
            if self.tx(tx).failed {
                return 0;
            }
            if block < min_block {
                assert_eq!(block, 0);
                debug!("no space at or after {}", min_block_in);
                return 0;
            }
            min_block = block;

            let active = self.active_tx_ids();
            assert!(!active.is_empty());
            for other in active {
                for set in [SetId::Allocated(other), SetId::TmpAllocated(other)] {
                    block = self.block_set_find_next_block(tx, set, block, false);
                    if self.tx(tx).failed {
                        return 0;
                    }
                    assert!(block >= min_block);
                }
            }
            block = self.alloc_queue.find_free_block(block);
            if block == min_block {
                return block;
            }
        }
    }

    /// Allocate a block: find a free candidate and queue a set update.
    ///
    /// With `is_tmp` the block is automatically freed when the transaction
    /// completes; otherwise it is removed from the free set at commit.
    /// Returns 0 and fails the transaction when no space is left.
    pub(crate) fn block_allocate_etc(&mut self, tx: TxId, is_tmp: bool) -> BlockNum {
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return 0;
        }
        assert!(self.tx(tx).active);

        let update_sets = self.alloc_queue.is_empty();
        if update_sets {
            let tmp_start = self.dev.config().block_count / 4 * 3;
            let t = self.tx_mut(tx);
            t.last_tmp_free_block = tmp_start;
            t.last_free_block = 0;
        }
        let min_block = if is_tmp {
            self.tx(tx).last_tmp_free_block
        } else {
            self.tx(tx).last_free_block
        };

        let mut block = self.find_free_block(tx, min_block);
        if block == 0 {
            block = self.find_free_block(tx, 0);
            if block == 0 {
                if !self.tx(tx).failed {
                    error!("no space");
                    self.transaction_fail(tx);
                }
                return 0;
            }
        }

        self.alloc_queue.add(block, is_tmp, false);
        if update_sets {
            self.block_allocator_process_queue(tx);
        }

        if self.tx(tx).failed {
            return 0;
        }
        block
    }

    pub(crate) fn block_allocate(&mut self, tx: TxId) -> BlockNum {
        self.block_allocate_etc(tx, false)
    }

    /// Free a block. `is_tmp` must match the value the block was allocated
    /// with (always false for blocks this transaction did not allocate).
    pub(crate) fn block_free_etc(&mut self, tx: TxId, block: BlockNum, is_tmp: bool) {
        let update_sets = self.alloc_queue.is_empty();
        assert!(self.block_is_clean(DevId::Main, block));

        self.alloc_queue.add(block, is_tmp, true);
        if update_sets {
            self.block_allocator_process_queue(tx);
        }
    }

    pub(crate) fn block_free(&mut self, tx: TxId, block: BlockNum) {
        self.block_free_etc(tx, block, false);
    }

    /// Whether a matching allocation intent is queued for `block`.
    pub(crate) fn block_allocator_allocation_queued(
        &mut self,
        _tx: TxId,
        block: BlockNum,
        is_tmp: bool,
    ) -> bool {
        match self.alloc_queue.find(block) {
            Some(index) => {
                let entry = self.alloc_queue.entries[index];
                entry.tmp == is_tmp && !entry.free
            }
            None => false,
        }
    }

    /// Prevent queued intents from updating sets until the next explicit
    /// `process_queue` call.
    pub(crate) fn block_allocator_suspend_set_updates(&mut self, _tx: TxId) {
        self.alloc_queue.add_dummy();
    }

    /// Apply all queued intents to the transaction's block sets.
    pub(crate) fn block_allocator_process_queue(&mut self, tx: TxId) {
        let mut loop_limit =
            MAX_TREE_DEPTH * MAX_TREE_DEPTH * MAX_TREE_DEPTH + self.dev.config().block_count as usize;

        assert!(!self.alloc_queue.updating);
        self.alloc_queue.updating = true;
        while !self.alloc_queue.is_empty() {
            assert!(loop_limit > 0, "allocator queue did not drain");
            loop_limit -= 1;
            let entry = self.alloc_queue.peek_head();
            if entry.removed {
            } else if entry.free {
                self.block_allocator_add_free(tx, entry.block, entry.tmp);
            } else {
                self.block_allocator_add_allocated(tx, entry.block, entry.tmp);
            }
            self.alloc_queue.remove_head(entry);
        }
        self.alloc_queue.updating = false;
    }

    /// Apply one allocation to the sets. During commit, blocks below the
    /// merge frontier are removed from the new free set directly.
    fn block_allocator_add_allocated(&mut self, tx: TxId, block: BlockNum, is_tmp: bool) {
        if is_tmp {
            debug!("add {} to tmp_allocated", block);
            self.block_set_add_block(tx, SetId::TmpAllocated(tx), block);
            self.tx_mut(tx).last_tmp_free_block = block + 1;
        } else {
            debug!("add {} to allocated", block);
            self.block_set_add_block(tx, SetId::Allocated(tx), block);
            if block < self.tx(tx).min_free_block {
                debug!("remove {} from new free set", block);
                assert!(self.tx(tx).new_free.is_some());
                self.block_set_remove_block(tx, SetId::NewFree(tx), block);
                self.tx_mut(tx).last_free_block = block + 1;
            }
        }
    }

    /// Apply one free to the sets. A block allocated earlier by this
    /// transaction just leaves the allocated set; otherwise it is recorded
    /// in the freed set (or returned to the new free set during commit).
    fn block_allocator_add_free(&mut self, tx: TxId, block: BlockNum, is_tmp: bool) {
        assert!(self.block_is_clean(DevId::Main, block));
        if is_tmp {
            debug_assert!(!self.block_set_block_in_set(tx, SetId::Allocated(tx), block));
            debug_assert!(!self.block_set_block_in_set(tx, SetId::Freed(tx), block));
            debug!("remove {} from tmp_allocated", block);
            self.block_set_remove_block(tx, SetId::TmpAllocated(tx), block);
            return;
        }

        debug_assert!(!self.block_set_block_in_set(tx, SetId::TmpAllocated(tx), block));
        if self.block_set_block_in_set(tx, SetId::Allocated(tx), block) {
            debug!("remove {} from allocated", block);
            self.block_set_remove_block(tx, SetId::Allocated(tx), block);
            if block < self.tx(tx).min_free_block {
                debug!("add {} back to new free set", block);
                assert!(self.tx(tx).new_free.is_some());
                self.block_set_add_block(tx, SetId::NewFree(tx), block);
            }
        } else if block < self.tx(tx).min_free_block {
            debug!("add {} to new free set", block);
            assert!(self.tx(tx).new_free.is_some());
            self.block_set_add_block(tx, SetId::NewFree(tx), block);
        } else {
            debug!("add {} to freed", block);
            self.block_set_add_block(tx, SetId::Freed(tx), block);
        }
    }
}
