// SPDX-License-Identifier: MPL-2.0

//! B+ tree backed block sets.
//!
//! Blocks in a set are tracked as ranges: a range is stored in the tree
//! with its start as the key and its end as the data. Outside an update
//! window all ranges are non-overlapping and non-adjacent, so adding block
//! 2 to a set holding 1 and 3 collapses the three ranges into one.

use crate::{
    layers::{
        bio::BlockNum,
        fs::{Fs, TxId},
        tree::{BlockRange, BlockTree, TreeId, TreePath},
    },
    prelude::*,
};

/// Locates a block set inside the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SetId {
    /// The committed free set.
    Free,
    /// Blocks a transaction holds only until it completes.
    TmpAllocated(TxId),
    /// Blocks allocated by a transaction.
    Allocated(TxId),
    /// Blocks freed by a transaction.
    Freed(TxId),
    /// The free set being built while a transaction commits.
    NewFree(TxId),
}

/// In-memory state of a B+ tree backed block set.
pub(crate) struct BlockSet {
    pub tree: BlockTree,
    /// Range belonging to the set but not yet stored in the tree. Only a
    /// freshly initialized set may carry one.
    pub initial_range: BlockRange,
    /// Detects reentrant add/remove on the same set.
    pub updating: bool,
}

impl Fs {
    /// Initialize an empty block set with this filesystem's entry sizes.
    pub(crate) fn block_set_new(&self) -> BlockSet {
        BlockSet {
            tree: BlockTree::new(
                self.dev.config().block_size,
                self.block_num_size,
                self.block_num_size + self.mac_size,
                self.block_num_size,
            ),
            initial_range: BlockRange::default(),
            updating: false,
        }
    }

    fn range_from_path(&self, path: &TreePath) -> BlockRange {
        if path.count == 0 {
            return BlockRange::default();
        }
        let start = path.key();
        let end = self.block_mac_to_block(&path.data);
        assert_eq!(start == 0, end == 0);
        BlockRange { start, end }
    }

    /// First block at or after `min_block` that is in (or not in) `set`.
    /// Returns 0 if there is no match.
    pub(crate) fn block_set_find_next_block(
        &mut self,
        tx: TxId,
        set: SetId,
        min_block: BlockNum,
        in_set: bool,
    ) -> BlockNum {
        let tree = TreeId::Set(set);
        let mut path = self.tree_walk(tx, tree, min_block, true);
        let mut range = self.range_from_path(&path);
        if !range.is_empty() && range.end <= min_block {
            self.tree_path_next(&mut path);
            range = self.range_from_path(&path);
        }
        if range.is_empty() {
            range = self.set(set).initial_range;
            if range.end <= min_block {
                range.clear();
            }
        }

        // The walk should not find an empty range that is not 0..0.
        assert!(!range.is_empty() || range.start == 0);

        if range.contains(min_block) == in_set {
            min_block
        } else if !in_set {
            assert!(!range.is_empty());
            range.end
        } else {
            range.start
        }
    }

    /// First in-set range intersecting `[min_block, inf)`, truncated to
    /// start at `min_block`. Empty when there is none.
    pub(crate) fn block_set_find_next_range(
        &mut self,
        tx: TxId,
        set: SetId,
        min_block: BlockNum,
    ) -> BlockRange {
        let start = self.block_set_find_next_block(tx, set, min_block, true);
        let end = if start != 0 {
            self.block_set_find_next_block(tx, set, start, false)
        } else {
            0
        };
        BlockRange { start, end }
    }

    pub(crate) fn block_set_block_in_set(&mut self, tx: TxId, set: SetId, block: BlockNum) -> bool {
        self.block_set_find_next_block(tx, set, block, true) == block
    }

    pub(crate) fn block_set_range_in_set(&mut self, tx: TxId, set: SetId, range: BlockRange) -> bool {
        self.block_set_find_next_block(tx, set, range.start, true) == range.start
            && self.block_set_find_next_block(tx, set, range.start, false) >= range.end
    }

    pub(crate) fn block_set_range_not_in_set(
        &mut self,
        tx: TxId,
        set: SetId,
        range: BlockRange,
    ) -> bool {
        let block = self.block_set_find_next_block(tx, set, range.start, true);
        block == 0 || block >= range.end
    }

    /// Whether any block is in both sets.
    pub(crate) fn block_set_overlap(&mut self, tx: TxId, set_a: SetId, set_b: SetId) -> bool {
        let mut range_b = BlockRange::default();
        loop {
            let range_a = self.block_set_find_next_range(tx, set_a, range_b.start);
            if range_a.is_empty() {
                return false;
            }
            if range_b.contains(range_a.start) {
                return true;
            }
            assert!(range_a.start >= range_b.start);

            range_b = self.block_set_find_next_range(tx, set_b, range_a.start);
            if range_b.is_empty() {
                return false;
            }
            if range_a.contains(range_b.start) {
                return true;
            }
            assert!(range_b.start > range_a.start);
        }
    }

    /// Add `range` to a set, either extending an existing range in the
    /// tree or inserting a new one. If an existing entry was extended,
    /// also merge it with its new neighbor when they became adjacent.
    pub(crate) fn block_set_add_range(&mut self, tx: TxId, set: SetId, range: BlockRange) {
        assert!(!range.is_empty());
        assert!(self.set(set).initial_range.is_empty());

        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return;
        }

        debug!(
            "set {}, add {}-{}",
            self.block_mac_to_block(&self.set(set).tree.root),
            range.start,
            range.end - 1
        );

        assert!(!self.set(set).updating);
        self.set_mut(set).updating = true;
        debug_assert!(self.block_set_range_not_in_set(tx, set, range));

        let tree = TreeId::Set(set);
        let mut path = self.tree_walk(tx, tree, range.start - 1, true);
        let mut tree_range = self.range_from_path(&path);
        let mut extend_left = false;

        if !tree_range.is_empty() && tree_range.end < range.start {
            self.tree_path_next(&mut path);
            tree_range = self.range_from_path(&path);
            if tree_range.start == range.end {
                extend_left = true;
            } else {
                // Rewind.
                path = self.tree_walk(tx, tree, range.start - 1, true);
                tree_range = self.range_from_path(&path);
            }
        }
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        assert!(tree_range.end == 0 || !tree_range.overlaps(&range));
        let mut new_tree_range = tree_range;
        let extended = new_tree_range.extend(&range);
        if !extended {
            assert!(!extend_left);
            self.tree_insert(tx, tree, range.start, range.end);
        } else {
            self.tree_path_next(&mut path);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
            let neighbor_key = path.key();
            let neighbor_end = self.block_mac_to_block(&path.data);
            let merge = neighbor_key == new_tree_range.end;
            if merge {
                assert!(neighbor_end > new_tree_range.end);
                new_tree_range.end = neighbor_end;
            }
            self.tree_update(
                tx,
                tree,
                tree_range.start,
                tree_range.end,
                new_tree_range.start,
                new_tree_range.end,
            );
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
            if merge {
                // The set briefly holds overlapping ranges until the
                // absorbed neighbor is removed.
                self.tree_remove(tx, tree, neighbor_key, neighbor_end);
            }
        }

        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        assert!(self.set(set).updating);
        self.set_mut(set).updating = false;
    }

    /// Remove `range` from a set, shrinking or splitting the containing
    /// range.
    pub(crate) fn block_set_remove_range(&mut self, tx: TxId, set: SetId, range: BlockRange) {
        assert!(!range.is_empty());
        assert!(self.set(set).initial_range.is_empty());

        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return;
        }

        debug!(
            "set {}, remove {}-{}",
            self.block_mac_to_block(&self.set(set).tree.root),
            range.start,
            range.end - 1
        );

        debug_assert!(self.block_set_range_in_set(tx, set, range) || self.tx(tx).failed);

        assert!(!self.set(set).updating);
        self.set_mut(set).updating = true;

        let tree = TreeId::Set(set);
        let path = self.tree_walk(tx, tree, range.start, true);
        let tree_range = self.range_from_path(&path);

        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        assert!(path.count > 0);
        assert!(tree_range.is_sub_range(&range));
        let mut new_tree_range = tree_range;
        let shrunk = new_tree_range.shrink(&range);
        if !shrunk {
            // The removed range splits the containing range in two.
            self.tree_insert(tx, tree, range.end, tree_range.end);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
            new_tree_range.end = range.start;
        }
        if new_tree_range.is_empty() {
            self.tree_remove(tx, tree, tree_range.start, tree_range.end);
        } else {
            self.tree_update(
                tx,
                tree,
                tree_range.start,
                tree_range.end,
                new_tree_range.start,
                new_tree_range.end,
            );
        }

        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        assert!(self.set(set).updating);
        self.set_mut(set).updating = false;
    }

    pub(crate) fn block_set_add_block(&mut self, tx: TxId, set: SetId, block: BlockNum) {
        self.block_set_add_range(tx, set, BlockRange::single(block));
    }

    pub(crate) fn block_set_remove_block(&mut self, tx: TxId, set: SetId, block: BlockNum) {
        self.block_set_remove_range(tx, set, BlockRange::single(block));
    }

    /// Record a range in an empty set without touching the tree.
    pub(crate) fn block_set_add_initial_range(set: &mut BlockSet, range: BlockRange) {
        assert!(set.initial_range.is_empty());
        set.initial_range = range;
    }

    /// Check tree structure and range ordering of a set.
    pub(crate) fn block_set_check(&mut self, tx: TxId, set: SetId) -> bool {
        if !self.tree_check(tx, TreeId::Set(set)) {
            return false;
        }
        let mut min = self.min_block_num;
        let max = self.dev.config().block_count;
        let mut path = self.tree_walk(tx, TreeId::Set(set), 0, true);
        let mut range = self.range_from_path(&path);
        while !range.is_empty() {
            if range.start < min {
                error!("bad range start {} < {}", range.start, min);
                return false;
            }
            if range.end <= range.start {
                error!("bad range end {} <= start {}", range.end, range.start);
                return false;
            }
            if range.end > max {
                error!("bad range end {} > max {}", range.end, max);
                return false;
            }
            min = range.end + 1;
            self.tree_path_next(&mut path);
            range = self.range_from_path(&path);
        }
        true
    }

    /// Render the ranges of a set for diagnostics.
    #[cfg(test)]
    pub(crate) fn block_set_dump(&mut self, tx: TxId, set: SetId) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        let mut path = self.tree_walk(tx, TreeId::Set(set), 0, true);
        let mut range = self.range_from_path(&path);
        while !range.is_empty() {
            let _ = write!(out, " {}-{}", range.start, range.end - 1);
            self.tree_path_next(&mut path);
            range = self.range_from_path(&path);
        }
        if !self.set(set).initial_range.is_empty() {
            let r = self.set(set).initial_range;
            let _ = write!(out, " initial {}-{}", r.start, r.end - 1);
        }
        out
    }
}
