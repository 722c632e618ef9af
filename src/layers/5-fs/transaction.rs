// SPDX-License-Identifier: MPL-2.0

//! Transaction lifecycle, commit-time free-set merging, and conflict
//! detection between optimistic transactions.

use crate::{
    layers::{
        bio::BlockNum,
        fs::{FileId, Fs, TxId},
        tree::{BlockRange, BlockSet, BlockTree, SetId, TreeId},
    },
    prelude::*,
};

/// In-memory state of one transaction.
///
/// A transaction accumulates allocations, frees, and file changes in its
/// own sets and trees, and applies them to copies of the committed state
/// when it completes. Between `complete` (or `fail`) and the next
/// `activate` it is inactive and all its per-batch state is stale.
pub(crate) struct Transaction {
    pub active: bool,
    /// Sticky failure flag; once set, operations early-return until the
    /// transaction is reactivated.
    pub failed: bool,
    /// Transaction has been written to disk.
    pub complete: bool,
    /// Commit-time merge frontier: the new free set is authoritative for
    /// blocks below this number.
    pub min_free_block: BlockNum,
    pub last_free_block: BlockNum,
    pub last_tmp_free_block: BlockNum,
    /// Blocks used only while the transaction is pending.
    pub tmp_allocated: BlockSet,
    /// Blocks allocated by the transaction.
    pub allocated: BlockSet,
    /// Blocks freed by the transaction.
    pub freed: BlockSet,
    /// The free set being rebuilt while this transaction commits.
    pub new_free: Option<BlockSet>,
    /// Files created by the transaction, keyed by path hash.
    pub files_added: BlockTree,
    /// Files modified by the transaction, keyed by committed block number.
    pub files_updated: BlockTree,
    /// Files deleted by the transaction, keyed by committed block number.
    pub files_removed: BlockTree,
    /// Handles opened under this transaction, most recently touched first.
    pub open_files: Vec<FileId>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            active: false,
            failed: false,
            complete: false,
            min_free_block: 0,
            last_free_block: 0,
            last_tmp_free_block: 0,
            tmp_allocated: BlockSet {
                tree: BlockTree::default(),
                initial_range: BlockRange::default(),
                updating: false,
            },
            allocated: BlockSet {
                tree: BlockTree::default(),
                initial_range: BlockRange::default(),
                updating: false,
            },
            freed: BlockSet {
                tree: BlockTree::default(),
                initial_range: BlockRange::default(),
                updating: false,
            },
            new_free: None,
            files_added: BlockTree::default(),
            files_updated: BlockTree::default(),
            files_removed: BlockTree::default(),
            open_files: Vec::new(),
        }
    }
}

impl Fs {
    /// Create and activate a new transaction.
    pub fn begin_transaction(&mut self) -> TxId {
        let tx = TxId(self.txs.insert(Transaction::new()));
        self.transaction_activate(tx);
        tx
    }

    /// Reactivate an inactive transaction for its next batch of work.
    pub(crate) fn ensure_tx_active(&mut self, tx: TxId) {
        if !self.tx(tx).active {
            self.transaction_activate(tx);
        }
    }

    /// Whether the transaction carries the sticky failed flag.
    pub fn tx_failed(&self, tx: TxId) -> bool {
        self.tx(tx).failed
    }

    pub(crate) fn transaction_activate(&mut self, tx: TxId) {
        assert!(!self.tx(tx).active);

        let block_size = self.dev.config().block_size;
        let block_num_size = self.block_num_size;
        let block_mac_size = block_num_size + self.mac_size;

        let tmp_allocated = self.block_set_new();
        let allocated = self.block_set_new();
        let freed = self.block_set_new();

        let t = self.tx_mut(tx);
        t.failed = false;
        t.complete = false;
        t.min_free_block = 0;
        t.last_free_block = 0;
        t.last_tmp_free_block = 0;
        t.new_free = None;
        t.tmp_allocated = tmp_allocated;
        t.allocated = allocated;
        t.freed = freed;
        t.files_added = BlockTree::new(block_size, block_num_size, block_mac_size, block_mac_size);
        t.files_updated = BlockTree::new(block_size, block_num_size, block_mac_size, block_mac_size);
        t.files_removed = BlockTree::new(block_size, block_num_size, block_mac_size, block_mac_size);
        t.active = true;
    }

    fn transaction_delete_active(&mut self, tx: TxId) {
        assert!(self.tx(tx).active);
        self.tx_mut(tx).active = false;
    }

    /// Fail a transaction: discard its dirty cache entries and restore its
    /// open files to the last committed state.
    pub(crate) fn transaction_fail(&mut self, tx: TxId) {
        assert!(!self.tx(tx).failed);

        self.tx_mut(tx).failed = true;

        if self.tx(tx).complete {
            return;
        }

        self.block_cache_discard_transaction(tx, true);
        self.transaction_delete_active(tx);
        self.file_transaction_failed(tx);
    }

    /// Abandon the current batch of a transaction and clear its sticky
    /// failed flag.
    pub fn discard_transaction(&mut self, tx: TxId) {
        if self.tx(tx).active {
            self.transaction_fail(tx);
        }
        self.tx_mut(tx).failed = false;
    }

    /// Tear down a transaction, closing any handles still open under it.
    pub fn end_transaction(&mut self, tx: TxId) {
        let open: Vec<FileId> = self.tx(tx).open_files.clone();
        for file in open {
            self.close_file(file);
        }
        if self.tx(tx).active {
            self.transaction_fail(tx);
        }
        assert!(self.tx(tx).open_files.is_empty());
        self.txs.remove(tx.0);
    }

    /// Whether `block` must be relocated before this transaction may write
    /// it, i.e. it is not a block the transaction allocated itself.
    pub(crate) fn transaction_block_need_copy(&mut self, tx: TxId, block: BlockNum) -> bool {
        assert!(block != 0);
        debug_assert!(!self.block_set_block_in_set(tx, SetId::TmpAllocated(tx), block));
        debug_assert!(!self.block_allocator_allocation_queued(tx, block, true));

        !self.block_set_block_in_set(tx, SetId::Allocated(tx), block)
            && !self.block_allocator_allocation_queued(tx, block, false)
    }

    /// Commit a transaction.
    ///
    /// On success every change becomes durable atomically through the
    /// superblock swap and conflicting transactions are failed. On failure
    /// the transaction is rolled back and `TxAborted` is returned; the
    /// next operation on the transaction starts a fresh batch.
    pub fn complete_transaction(&mut self, tx: TxId) -> Result<()> {
        if self.tx(tx).active {
            self.transaction_complete_internal(tx);
        }
        if self.tx(tx).failed {
            self.tx_mut(tx).failed = false;
            return_errno_with_msg!(TxAborted, "transaction failed to commit");
        }
        Ok(())
    }

    pub(crate) fn transaction_complete_internal(&mut self, tx: TxId) {
        assert!(!self.tx(tx).complete);

        // Build a writable copy-on-write derivative of the committed free
        // set, promoting the initial range of a freshly created fs.
        {
            let src = &self.free;
            assert!(src.tree.copy_on_write);
            assert!(!src.tree.allow_copy_on_write);
            let mut new_free = self.block_set_new();
            new_free.tree = BlockTree::copy_of(&src.tree);
            let initial = src.initial_range;
            let root_valid = self.block_mac_valid(&new_free.tree.root);
            self.tx_mut(tx).new_free = Some(new_free);
            if !root_valid {
                assert!(!initial.is_empty());
                self.block_set_add_range(tx, SetId::NewFree(tx), initial);
            } else {
                assert!(initial.is_empty());
            }
        }

        self.transaction_complete_body(tx);

        if self.tx(tx).failed {
            self.file_transaction_complete_failed(tx);
        }
        assert_eq!(self.block_cache_ref_count(), 0);
        self.tx_mut(tx).new_free = None;
    }

    fn transaction_complete_body(&mut self, tx: TxId) {
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }
        assert!(self.tx(tx).active);

        let Some(new_files) = self.file_transaction_complete(tx) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        self.transaction_merge_free_sets(tx);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        let reserved = self.reserved_count;
        if !self.transaction_check_free(tx, SetId::NewFree(tx), reserved) {
            if !self.tx(tx).failed {
                self.transaction_fail(tx);
            }
            warn!("transaction would leave fs too full, abort");
            return;
        }
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        self.block_cache_clean_transaction(tx);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        assert!(self
            .tx(tx)
            .new_free
            .as_ref()
            .unwrap()
            .initial_range
            .is_empty());
        self.check_free_tree(tx, SetId::NewFree(tx));

        let new_free_root = self.set(SetId::NewFree(tx)).tree.root;
        if !self.update_super_block(tx, &new_free_root, &new_files) {
            assert!(self.tx(tx).failed);
            warn!("failed to update super block, abort");
            return;
        }
        self.block_cache_clean_transaction(tx);

        // If an error was detected writing the super block, it is not safe
        // to continue as we do not know if the write completed.
        assert!(!self.tx(tx).failed);

        self.free.tree.root = new_free_root;
        // Clear for the initial file-system state.
        self.free.initial_range.clear();
        self.files.root = new_files;
        self.super_block_version = self.written_super_block_version;

        self.transaction_delete_active(tx);
        self.tx_mut(tx).complete = true;

        self.file_transaction_success(tx);
        assert!(!self.tx(tx).failed);

        self.check_free_tree(tx, SetId::Free);

        for other in self.all_tx_ids() {
            if self.tx(tx).failed {
                break;
            }
            if !self.tx(other).active {
                continue;
            }
            if self.block_set_overlap(tx, SetId::Freed(tx), SetId::Freed(other)) {
                warn!("fail conflicting transaction {:?}", other);
                self.transaction_fail(other);
            }
        }
        if self.tx(tx).failed {
            warn!("transaction failed while failing conflicting transactions");
            self.tx_mut(tx).failed = false;
            for other in self.all_tx_ids() {
                if !self.tx(other).active {
                    continue;
                }
                warn!("fail possibly conflicting transaction {:?}", other);
                self.transaction_fail(other);
            }
        }
        assert!(!self.tx(tx).failed);
        self.block_cache_discard_transaction(tx, false);
    }

    /// Update the new free set for a committing transaction:
    /// `new = committed - allocated + freed`, where blocks the merge has
    /// already passed are additionally patched by the allocator as nested
    /// allocations and frees occur.
    fn transaction_merge_free_sets(&mut self, tx: TxId) {
        debug_assert!(self.block_set_check(tx, SetId::Free));
        debug_assert!(self.block_set_check(tx, SetId::Allocated(tx)));
        debug_assert!(self.block_set_check(tx, SetId::Freed(tx)));
        {
            let root = self.free.tree.root;
            debug_assert!(
                !self.block_mac_valid(&root)
                    || self.transaction_block_need_copy(tx, self.block_mac_to_block(&root))
            );
        }

        let mut next_block: BlockNum = 1;
        while next_block != 0 {
            self.tx_mut(tx).min_free_block = next_block;
            let delete_range = self.block_set_find_next_range(tx, SetId::Allocated(tx), next_block);
            let add_range = self.block_set_find_next_range(tx, SetId::Freed(tx), next_block);
            debug!(
                "merge free sets: add {}-{} or delete {}-{}",
                add_range.start, add_range.end, delete_range.start, delete_range.end
            );
            assert!(!delete_range.overlaps(&add_range));
            if delete_range.before(&add_range) {
                assert!(delete_range.start >= next_block);
                self.tx_mut(tx).min_free_block = delete_range.end;
                self.block_allocator_suspend_set_updates(tx);
                self.block_set_remove_range(tx, SetId::NewFree(tx), delete_range);
                self.block_allocator_process_queue(tx);
                next_block = delete_range.end;
            } else if !add_range.is_empty() {
                assert!(add_range.start >= next_block);
                self.tx_mut(tx).min_free_block = add_range.end;
                self.block_allocator_suspend_set_updates(tx);
                self.block_set_add_range(tx, SetId::NewFree(tx), add_range);
                self.block_allocator_process_queue(tx);
                next_block = add_range.end;
            } else {
                assert!(delete_range.is_empty());
                assert!(add_range.is_empty());
                next_block = 0;
            }
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
        }
        debug_assert!(self.block_set_check(tx, SetId::NewFree(tx)));
    }

    /// Whether `set` contains at least `min_free` blocks.
    fn transaction_check_free(&mut self, tx: TxId, set: SetId, mut min_free: u64) -> bool {
        let mut next_block = 0;
        loop {
            let free_range = self.block_set_find_next_range(tx, set, next_block);
            if free_range.is_empty() {
                return false;
            }
            let count = free_range.end - free_range.start;
            if count >= min_free {
                return true;
            }
            min_free -= count;
            next_block = free_range.end;
        }
    }

    /// Check that the blocks storing the tree of a free set are not
    /// themselves in the set.
    fn check_free_tree(&mut self, tx: TxId, set: SetId) {
        let mut path = self.tree_walk(tx, TreeId::Set(set), 0, true);
        while path.key() != 0 {
            for i in 0..path.count {
                let node_block = self.block_mac_to_block(&path.entries[i].block_mac);
                assert!(!self.block_set_block_in_set(tx, set, node_block));
            }
            self.tree_path_next(&mut path);
        }
    }
}
