// SPDX-License-Identifier: MPL-2.0

//! Sparse `file block index -> block_mac` maps, one per file, stored as a
//! copy-on-write B+ tree keyed by `index + 1` (0 is not a valid key).

use crate::{
    layers::{
        bio::BlockNum,
        cache::{BlockRef, DevId},
        fs::{Fs, TxId},
        tree::{BlockMac, TreeId},
    },
    prelude::*,
};

impl Fs {
    /// Look up the block backing file block `index`.
    pub(crate) fn block_map_get(
        &mut self,
        tx: TxId,
        map: TreeId,
        index: BlockNum,
    ) -> Option<BlockMac> {
        let key = index + 1;
        let path = self.tree_walk(tx, map, key, false);
        if path.key() != key {
            return None;
        }
        Some(path.data)
    }

    /// Map file block `index` to `block_mac`, or clear the mapping when
    /// `block_mac` is `None`.
    pub(crate) fn block_map_set(
        &mut self,
        tx: TxId,
        map: TreeId,
        index: BlockNum,
        block_mac: Option<&BlockMac>,
    ) {
        let key = index + 1;

        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return;
        }

        let path = self.tree_walk(tx, map, key, false);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }
        if path.key() == key {
            let old_data = self.block_mac_to_block(&path.data);
            self.tree_remove(tx, map, key, old_data);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
        }
        if let Some(block_mac) = block_mac {
            if self.block_mac_valid(block_mac) {
                let block = self.block_mac_to_block(block_mac);
                self.tree_insert(tx, map, key, block);
            }
        }
    }

    /// Release a data block stored in the map and push its new mac up
    /// through the map tree.
    pub(crate) fn block_map_put_dirty(
        &mut self,
        tx: TxId,
        map: TreeId,
        index: BlockNum,
        data_ref: BlockRef,
    ) {
        let key = index + 1;
        let mut path = self.tree_walk(tx, map, key, false);
        if self.tx(tx).failed {
            warn!("transaction failed");
            self.block_put_dirty_discard(data_ref);
            return;
        }
        assert_eq!(path.key(), key);
        let count = path.count;
        self.tree_path_put_dirty(tx, &mut path, count as isize, data_ref);
    }

    /// Remove and free all mapped blocks starting at `index`.
    pub(crate) fn block_map_truncate(&mut self, tx: TxId, map: TreeId, index: BlockNum) {
        let mut curr_index = index + 1;
        let mut last_count;

        loop {
            let path = self.tree_walk(tx, map, curr_index, false);
            last_count = path.count;
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
            let key = path.key();
            if key == 0 {
                break;
            }
            assert!(key >= curr_index);
            let data = self.block_mac_to_block(&path.data);
            if data == 0 {
                // The walk stopped at an empty insert slot; skip to the
                // key it found.
                assert_ne!(key, curr_index);
                curr_index = key;
                continue;
            }
            self.tree_remove(tx, map, key, data);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
            self.block_discard_dirty_by_block(DevId::Main, data);
            self.block_free(tx, data);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return;
            }
        }

        // Only a root leaf node should remain when truncating to 0.
        assert!(index != 0 || last_count == 1);
    }

    /// Free the map tree and every block stored in it.
    pub(crate) fn block_map_free(&mut self, tx: TxId, map: TreeId) {
        if !self.block_mac_valid(&self.tree(map).root) {
            return;
        }
        self.block_map_truncate(tx, map, 0);
        if self.tx(tx).failed {
            warn!("transaction failed");
            return;
        }
        let root_block = self.block_mac_to_block(&self.tree(map).root);
        self.block_discard_dirty_by_block(DevId::Main, root_block);
        self.block_free(tx, root_block);
    }
}
