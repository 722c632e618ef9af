// SPDX-License-Identifier: MPL-2.0

//! Block-backed copy-on-write B+ trees and the structures layered on them.
//!
//! A tree node occupies one block: `IV || is_leaf(8) || keys || children`.
//! Internal nodes store `n` keys and `n + 1` child block-macs; leaf nodes
//! store `n` keys and `n` data entries. A key value of 0 marks an empty
//! slot, so 0 is not a valid key. While an insertion splits a full node,
//! one extra entry is staged in the in-memory `inserting` slot of the tree
//! so concurrent readers observe a consistent tree.

mod block_mac;
mod map;
mod range;
mod set;

pub(crate) use self::range::BlockRange;
pub(crate) use self::set::{BlockSet, SetId};
pub use self::block_mac::BlockMac;
pub(crate) use self::block_mac::BLOCK_MAC_SIZE;

use crate::{
    layers::{
        bio::BlockNum,
        cache::BlockRef,
        crypto::IV_SIZE,
        fs::{Fs, TxId},
    },
    prelude::*,
    util::is_zero,
};

/// Maximum supported tree depth.
pub(crate) const MAX_TREE_DEPTH: usize = 9;

/// Bytes before the key area of a node: IV plus the 8-byte leaf flag.
const NODE_HEADER_SIZE: usize = IV_SIZE + 8;

const SHIFT_LEAF_OR_LEFT_CHILD: u8 = 0;
const SHIFT_RIGHT_CHILD: u8 = 1;
const SHIFT_LEFT_CHILD: u8 = 2;
const SHIFT_BOTH: u8 = SHIFT_RIGHT_CHILD | SHIFT_LEFT_CHILD;

/// Index value meaning "no source"; shifts clear instead of moving.
const NO_INDEX: usize = usize::MAX;

/// Entry sizes and derived fanout of one tree.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeGeom {
    pub block_size: usize,
    pub key_size: usize,
    /// 0: internal/child entry size, 1: leaf/data entry size.
    pub child_data_size: [usize; 2],
    /// 0: internal max keys, 1: leaf max keys.
    pub key_count: [usize; 2],
}

/// In-memory staging for an entry that does not fit its on-disk node yet.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TreeInserting {
    pub block: BlockNum,
    pub key: u64,
    pub child: BlockMac,
    pub data: BlockMac,
}

/// In-memory state of a block-backed B+ tree.
pub(crate) struct BlockTree {
    pub geom: TreeGeom,
    pub root: BlockMac,
    pub inserting: TreeInserting,
    pub update_count: u32,
    /// Root block was allocated or copied after this struct was
    /// initialized.
    pub root_block_changed: bool,
    /// Relaxes some checks while the tree is mid-update and detects
    /// reentrant updates.
    pub updating: bool,
    /// Tree is persistent; nodes are allocated from the persistent set and
    /// copy-on-write applies when enabled.
    pub copy_on_write: bool,
    /// False for read-only snapshots of a copy-on-write tree.
    pub allow_copy_on_write: bool,
}

impl Default for BlockTree {
    fn default() -> Self {
        Self {
            geom: TreeGeom {
                block_size: 0,
                key_size: 0,
                child_data_size: [0; 2],
                key_count: [0; 2],
            },
            root: BlockMac::zero(),
            inserting: TreeInserting::default(),
            update_count: 0,
            root_block_changed: false,
            updating: false,
            copy_on_write: false,
            allow_copy_on_write: false,
        }
    }
}

impl BlockTree {
    /// Initialize tree entry sizes and calculate key counts.
    pub fn new(block_size: usize, key_size: usize, child_size: usize, data_size: usize) -> Self {
        let payload_size = block_size - NODE_HEADER_SIZE;
        assert!(payload_size < block_size);
        assert!(key_size > 0 && key_size <= 8);
        assert!(child_size >= key_size && child_size <= BLOCK_MAC_SIZE);
        assert!(data_size > 0 && data_size <= BLOCK_MAC_SIZE);

        let internal_keys = (payload_size - child_size) / (key_size + child_size);
        let leaf_keys = payload_size / (key_size + data_size);
        assert!(internal_keys >= 2);
        assert!(leaf_keys >= 2);

        Self {
            geom: TreeGeom {
                block_size,
                key_size,
                child_data_size: [child_size, data_size],
                key_count: [internal_keys, leaf_keys],
            },
            ..Self::default()
        }
    }

    /// Initialize a writable copy-on-write view of a committed tree.
    pub fn copy_of(src: &BlockTree) -> Self {
        assert!(src.copy_on_write);
        Self {
            geom: src.geom,
            root: src.root,
            inserting: TreeInserting::default(),
            update_count: 0,
            root_block_changed: false,
            updating: false,
            copy_on_write: true,
            allow_copy_on_write: true,
        }
    }
}

/// Locates a tree inside the engine so operations can reach it while the
/// allocator or other reentrant readers reach it too.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TreeId {
    Files,
    Set(SetId),
    FilesAdded(TxId),
    FilesUpdated(TxId),
    FilesRemoved(TxId),
    /// A transient tree pushed onto the engine scratch stack.
    Scratch(usize),
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TreePathEntry {
    pub block_mac: BlockMac,
    pub index: usize,
    /// Key at `index - 1`, or left key in parent when `index == 0`.
    pub prev_key: u64,
    /// Key at `index`, or right key in parent if the slot is empty.
    pub next_key: u64,
}

/// A recorded root-to-leaf descent.
pub(crate) struct TreePath {
    pub entries: [TreePathEntry; MAX_TREE_DEPTH],
    pub count: usize,
    pub data: BlockMac,
    pub tree: TreeId,
    pub tx: TxId,
    pub tree_update_count: u32,
}

impl TreePath {
    fn new(tree: TreeId, tx: TxId, update_count: u32) -> Self {
        Self {
            entries: [TreePathEntry::default(); MAX_TREE_DEPTH],
            count: 0,
            data: BlockMac::zero(),
            tree,
            tx,
            tree_update_count: update_count,
        }
    }

    /// Key of the entry the path points at, 0 when past the end.
    pub fn key(&self) -> u64 {
        if self.count > 0 {
            self.entries[self.count - 1].next_key
        } else {
            0
        }
    }
}

fn node_is_leaf(node: &[u8]) -> bool {
    let flag = u64::from_le_bytes(node[IV_SIZE..IV_SIZE + 8].try_into().unwrap());
    assert!(flag <= 1, "bad node header {:#x}", flag);
    flag == 1
}

fn node_set_leaf(node: &mut [u8], leaf: bool) {
    node[IV_SIZE..IV_SIZE + 8].copy_from_slice(&(leaf as u64).to_le_bytes());
}

fn node_max_key_count(g: &TreeGeom, is_leaf: bool) -> usize {
    let count = g.key_count[is_leaf as usize];
    assert!(count > 0);
    count
}

fn node_min_key_count(g: &TreeGeom, is_leaf: bool) -> usize {
    node_max_key_count(g, is_leaf) / 2
}

/// Index of the last key in a node holding exactly the minimum entry
/// count.
fn node_min_full_index(g: &TreeGeom, is_leaf: bool) -> usize {
    node_min_key_count(g, is_leaf).wrapping_sub(1)
}

/// Raw key read; 0 when out of range or the slot is empty. Does not
/// consult the in-memory `inserting` slot.
fn node_get_key_raw(g: &TreeGeom, node: &[u8], index: usize) -> u64 {
    let is_leaf = node_is_leaf(node);
    let count = node_max_key_count(g, is_leaf);
    if index >= count {
        return 0;
    }
    let off = NODE_HEADER_SIZE + index * g.key_size;
    let mut bytes = [0u8; 8];
    bytes[..g.key_size].copy_from_slice(&node[off..off + g.key_size]);
    u64::from_le_bytes(bytes)
}

fn node_set_key(g: &TreeGeom, node: &mut [u8], index: usize, new_key: u64) {
    let is_leaf = node_is_leaf(node);
    assert!(index < node_max_key_count(g, is_leaf));
    let off = NODE_HEADER_SIZE + index * g.key_size;
    node[off..off + g.key_size].copy_from_slice(&new_key.to_le_bytes()[..g.key_size]);
}

/// Byte range of child/data entry `index`.
fn node_child_data_range(g: &TreeGeom, is_leaf: bool, index: usize) -> core::ops::Range<usize> {
    let max_key_count = node_max_key_count(g, is_leaf);
    let entry_size = g.child_data_size[is_leaf as usize];
    assert!(index < max_key_count + !is_leaf as usize);
    let off = NODE_HEADER_SIZE + g.key_size * max_key_count + entry_size * index;
    off..off + entry_size
}

fn node_get_child_data(g: &TreeGeom, node: &[u8], index: usize) -> BlockMac {
    let range = node_child_data_range(g, node_is_leaf(node), index);
    let mut bm = BlockMac::zero();
    bm.data[..range.len()].copy_from_slice(&node[range]);
    bm
}

fn node_full(g: &TreeGeom, node: &[u8]) -> bool {
    let count = node_max_key_count(g, node_is_leaf(node));
    node_get_key_raw(g, node, count - 1) != 0
}

fn node_above_min_full(g: &TreeGeom, node: &[u8]) -> bool {
    let min_full = node_min_full_index(g, node_is_leaf(node));
    node_get_key_raw(g, node, min_full.wrapping_add(1)) != 0
}

fn node_below_min_full(g: &TreeGeom, node: &[u8]) -> bool {
    let min_full = node_min_full_index(g, node_is_leaf(node));
    if min_full == NO_INDEX {
        return false;
    }
    node_get_key_raw(g, node, min_full) == 0
}

fn node_get_key_count(g: &TreeGeom, node: &[u8]) -> usize {
    let max = node_max_key_count(g, node_is_leaf(node));
    (0..max)
        .find(|&i| node_get_key_raw(g, node, i) == 0)
        .unwrap_or(max)
}

/// Insert or remove entries in a node by shifting.
///
/// When `dest_index > src_index` entries shift up to make room: entries
/// pushed past the end are copied to `overflow_key`/`overflow_data` (or
/// asserted zero), and `new_key`/`new_data` fill the gap. When
/// `dest_index < src_index` entries shift down and the vacated tail is
/// cleared. `shift_mode` selects which child accompanies a key for
/// internal nodes.
#[allow(clippy::too_many_arguments)]
fn node_shift(
    g: &TreeGeom,
    node: &mut [u8],
    dest_index: usize,
    src_index: usize,
    shift_mode: u8,
    new_key: Option<&[u8]>,
    new_data: Option<&[u8]>,
    mut overflow_key: Option<&mut [u8; 8]>,
    mut overflow_data: Option<&mut [u8; BLOCK_MAC_SIZE]>,
) {
    let is_leaf = node_is_leaf(node);
    let keys_count = g.key_count[is_leaf as usize];

    for pass in 0..2 {
        let (base, entry_size, max_count, src, dest, new_entry) = if pass == 0 {
            (
                NODE_HEADER_SIZE,
                g.key_size,
                keys_count,
                src_index,
                dest_index,
                new_key,
            )
        } else {
            let base = NODE_HEADER_SIZE + g.key_size * keys_count;
            let entry_size = g.child_data_size[is_leaf as usize];
            let max_count = keys_count + !is_leaf as usize;
            let mut src = src_index;
            let mut dest = dest_index;
            if shift_mode & SHIFT_RIGHT_CHILD != 0 {
                assert!(!is_leaf);
                if shift_mode & SHIFT_LEFT_CHILD == 0 && src != NO_INDEX {
                    src += 1;
                }
                dest += 1;
            }
            (base, entry_size, max_count, src, dest, new_data)
        };

        if src < dest {
            // Inserting: save entries that shift out of range.
            let size = (dest - src) * entry_size;
            let saved: Vec<u8> = if src == max_count {
                new_entry.expect("insert at end needs a new entry")[..size].to_vec()
            } else {
                node[base + max_count * entry_size - size..base + max_count * entry_size].to_vec()
            };
            let overflow: Option<&mut [u8]> = if pass == 0 {
                overflow_key.as_deref_mut().map(|o| &mut o[..])
            } else {
                overflow_data.as_deref_mut().map(|o| &mut o[..])
            };
            match overflow {
                Some(out) => out[..size].copy_from_slice(&saved),
                None => assert!(is_zero(&saved)),
            }
        }

        let clear_index;
        if src < max_count {
            // Inserting or deleting: shift up or down.
            let size = (max_count - src.max(dest)) * entry_size;
            node.copy_within(
                base + src * entry_size..base + src * entry_size + size,
                base + dest * entry_size,
            );
            clear_index = if src >= dest {
                max_count + dest - src
            } else {
                NO_INDEX
            };
        } else {
            clear_index = dest;
        }

        if src < dest {
            // Inserting: copy the new entries in, unless they already went
            // to the overflow buffers above.
            if src != max_count {
                let size = (dest - src) * entry_size;
                let new_entry = new_entry.expect("insert needs a new entry");
                node[base + src * entry_size..base + src * entry_size + size]
                    .copy_from_slice(&new_entry[..size]);
            }
        } else {
            // Deleting: clear the vacated tail.
            assert!(dest <= max_count);
            let clear_index = clear_index.min(max_count);
            node[base + clear_index * entry_size..base + max_count * entry_size].fill(0);
        }
    }
}

fn node_shift_down(g: &TreeGeom, node: &mut [u8], dest_index: usize, src_index: usize, shift_mode: u8) {
    assert!(dest_index < src_index);
    node_shift(g, node, dest_index, src_index, shift_mode, None, None, None, None);
}

/// Remove key `start_index` and everything after it. For internal nodes
/// the right child goes with each key, so child `start_index` stays.
fn node_clear_end(g: &TreeGeom, node: &mut [u8], start_index: usize) {
    let mode = if node_is_leaf(node) {
        SHIFT_LEAF_OR_LEFT_CHILD
    } else {
        SHIFT_RIGHT_CHILD
    };
    node_shift(g, node, start_index, NO_INDEX, mode, None, None, None, None);
}

#[allow(clippy::too_many_arguments)]
fn node_insert(
    g: &TreeGeom,
    node: &mut [u8],
    index: usize,
    shift_mode: u8,
    new_key: &[u8],
    new_data: &[u8],
    overflow_key: Option<&mut [u8; 8]>,
    overflow_data: Option<&mut [u8; BLOCK_MAC_SIZE]>,
) {
    node_shift(
        g,
        node,
        index + 1,
        index,
        shift_mode,
        Some(new_key),
        Some(new_data),
        overflow_key,
        overflow_data,
    );
}

/// Merge `count` leading entries of `src_node` into `node` at
/// `dest_index`, inserting `merge_key` between them for internal nodes.
fn node_merge_entries(
    g: &TreeGeom,
    node: &mut [u8],
    src_node: &[u8],
    mut dest_index: usize,
    count: usize,
    merge_key: Option<u64>,
) {
    let is_leaf = node_is_leaf(node);
    let max_count = node_max_key_count(g, is_leaf);
    let mut shift_mode = SHIFT_LEAF_OR_LEFT_CHILD;
    if !is_leaf {
        let key = merge_key.expect("internal merge needs a separator key");
        let off = NODE_HEADER_SIZE + g.key_size * dest_index;
        assert!(is_zero(&node[off..off + g.key_size]));
        node[off..off + g.key_size].copy_from_slice(&key.to_le_bytes()[..g.key_size]);
        dest_index += 1;
        shift_mode = SHIFT_BOTH;
    }
    let src_keys = &src_node[NODE_HEADER_SIZE..NODE_HEADER_SIZE + g.key_size * max_count];
    let cd_base = NODE_HEADER_SIZE + g.key_size * max_count;
    let cd_len = g.child_data_size[is_leaf as usize] * (max_count + !is_leaf as usize);
    let src_children = &src_node[cd_base..cd_base + cd_len];
    node_shift(
        g,
        node,
        dest_index + count,
        dest_index,
        shift_mode,
        Some(src_keys),
        Some(src_children),
        None,
        None,
    );
}

impl Fs {
    pub(crate) fn tree_geom(&self, tree: TreeId) -> TreeGeom {
        self.tree(tree).geom
    }

    /// Key read that also sees the staged `inserting` entry of the tree.
    fn tnode_get_key(&self, tree: TreeId, node_block: BlockNum, node: &[u8], index: usize) -> u64 {
        let t = self.tree(tree);
        let mut key = node_get_key_raw(&t.geom, node, index);
        let key_count = node_max_key_count(&t.geom, node_is_leaf(node));
        if key == 0 && node_block == t.inserting.block {
            assert!(index >= key_count);
            if index <= key_count {
                key = t.inserting.key;
            }
        }
        key
    }

    /// Child read that also sees the staged `inserting` entry.
    fn tnode_get_child(
        &self,
        tree: TreeId,
        node_block: BlockNum,
        node: &[u8],
        index: usize,
    ) -> Option<BlockMac> {
        let t = self.tree(tree);
        assert!(!node_is_leaf(node));
        let key_count = node_max_key_count(&t.geom, false);
        let mut child = None;
        if index <= key_count {
            let bm = node_get_child_data(&t.geom, node, index);
            if self.block_mac_valid(&bm) {
                child = Some(bm);
            }
        }
        if child.is_none() && node_block == t.inserting.block {
            assert!(index > key_count);
            if index <= key_count + 1 {
                child = Some(t.inserting.child);
            }
        }
        child
    }

    /// Data read that also sees the staged `inserting` entry.
    fn tnode_get_data(&self, tree: TreeId, node_block: BlockNum, node: &[u8], index: usize) -> BlockMac {
        let t = self.tree(tree);
        assert!(node_is_leaf(node));
        let key_count = node_max_key_count(&t.geom, true);
        let mut data = None;
        if index < key_count {
            let bm = node_get_child_data(&t.geom, node, index);
            if self.block_mac_valid(&bm) {
                data = Some(bm);
            }
        }
        if data.is_none() && node_block == t.inserting.block {
            assert!(index >= key_count);
            if index <= key_count {
                data = Some(t.inserting.data);
            }
        }
        data.unwrap_or_else(BlockMac::zero)
    }

    /// Find the descend index for `key` in one node.
    #[allow(clippy::type_complexity)]
    fn tnode_find_block(
        &self,
        tree: TreeId,
        node_block: BlockNum,
        node: &[u8],
        key: u64,
        key_is_max: bool,
    ) -> (usize, Option<BlockMac>, u64, u64) {
        let is_leaf = node_is_leaf(node);
        let geom = self.tree_geom(tree);
        let keys_count = node_max_key_count(&geom, is_leaf);

        let mut curr_key = 0;
        let mut i = 0;
        while i < keys_count + 1 {
            curr_key = self.tnode_get_key(tree, node_block, node, i);
            if curr_key == 0 || key <= curr_key - !is_leaf as u64 {
                break;
            }
            curr_key = 0;
            i += 1;
        }
        if i == keys_count && curr_key != 0 {
            assert_eq!(self.tree(tree).inserting.block, node_block);
        }
        if key_is_max && is_leaf && i > 0 && (curr_key == 0 || curr_key > key) {
            i -= 1;
            curr_key = self.tnode_get_key(tree, node_block, node, i);
        }

        let next_key = curr_key;
        let prev_key = if i > 0 {
            self.tnode_get_key(tree, node_block, node, i - 1)
        } else {
            0
        };

        let child = if is_leaf {
            None
        } else {
            let child = self.tnode_get_child(tree, node_block, node, i);
            assert!(child.is_some());
            child
        };
        (i, child, prev_key, next_key)
    }

    /// Walk a tree to find the path to `key` or the insert point for
    /// `key`.
    ///
    /// With `key_is_max` true the largest leaf entry with a key at most
    /// `key` is chosen when `key` is absent; otherwise the path may point
    /// at an empty insert slot and callers looking for the closest match
    /// must call [`Fs::tree_path_next`].
    pub(crate) fn tree_walk(&mut self, tx: TxId, tree: TreeId, key: u64, key_is_max: bool) -> TreePath {
        let mut path = TreePath::new(tree, tx, self.tree(tree).update_count);
        assert!(self.tree(tree).geom.block_size <= self.dev.config().block_size);

        let mut block_mac = self.tree(tree).root;
        while self.block_mac_valid(&block_mac) {
            assert!(path.count < MAX_TREE_DEPTH);
            let Some(node_ref) = self.block_get(tx, &block_mac) else {
                assert!(self.tx(tx).failed);
                warn!("tree walk failed, abort");
                path.count = 0;
                return path;
            };
            let node_block = self.block_mac_to_block(&block_mac);
            let (index, child, prev_key, next_key) = {
                let node = self.block_data(&node_ref);
                self.tnode_find_block(tree, node_block, node, key, key_is_max)
            };
            if path.count > 0 {
                let up = &path.entries[path.count - 1];
                assert!(up.next_key == 0 || next_key != 0);
                assert!(up.next_key == 0 || next_key <= up.next_key);
                assert!(up.prev_key == 0 || prev_key != 0);
                assert!(up.prev_key == 0 || prev_key >= up.prev_key);
            }
            path.entries[path.count] = TreePathEntry {
                block_mac,
                index,
                prev_key,
                next_key,
            };
            if child.is_none() {
                let node = self.block_data(&node_ref);
                assert!(node_is_leaf(node));
                path.data = self.tnode_get_data(tree, node_block, node, index);
                assert!(
                    !key_is_max || self.block_mac_valid(&path.data) || path.count == 0
                );
            }
            self.block_put(node_ref);
            path.count += 1;
            match child {
                Some(c) => block_mac = c,
                None => break,
            }
        }
        path
    }

    /// Advance a path to the next entry.
    pub(crate) fn tree_path_next(&mut self, path: &mut TreePath) {
        assert_eq!(path.tree_update_count, self.tree(path.tree).update_count);
        assert!(path.count > 0);

        let mut depth = path.count - 1;
        assert!(path.entries[depth].next_key != 0);

        // Fast path: the next entry lives in the same leaf.
        let leaf_bm = path.entries[depth].block_mac;
        let mut index = path.entries[depth].index;
        let parent_next_key = if depth > 0 {
            path.entries[depth - 1].next_key
        } else {
            0
        };

        let Some(node_ref) = self.block_get(path.tx, &leaf_bm) else {
            assert!(self.tx(path.tx).failed);
            path.count = 0;
            return;
        };
        let node_block = self.block_mac_to_block(&leaf_bm);
        let (prev_key, next_key, next_data) = {
            let node = self.block_data(&node_ref);
            assert!(node_is_leaf(node));
            let prev_key = self.tnode_get_key(path.tree, node_block, node, index);
            let next_key = self.tnode_get_key(path.tree, node_block, node, index + 1);
            let next_data = self.tnode_get_data(path.tree, node_block, node, index + 1);
            (prev_key, next_key, next_data)
        };
        self.block_put(node_ref);
        index += 1;

        assert!(path.entries[depth].next_key == prev_key || prev_key == 0);

        if next_key != 0 || parent_next_key == 0 {
            assert!(next_key == 0 || next_key >= prev_key);
            path.entries[depth].index = index;
            path.entries[depth].prev_key = prev_key;
            path.entries[depth].next_key = next_key;
            path.data = next_data;
            return;
        }

        assert!(depth > 0);

        // Climb until a parent has a next child, then descend its leftmost
        // edge.
        let mut next_child: Option<BlockMac> = None;
        let mut prev_key = prev_key;
        while depth > 0 {
            depth -= 1;
            if path.entries[depth].next_key == 0 {
                continue;
            }
            let bm = path.entries[depth].block_mac;
            let index = path.entries[depth].index;
            let Some(node_ref) = self.block_get(path.tx, &bm) else {
                assert!(self.tx(path.tx).failed);
                path.count = 0;
                return;
            };
            let node_block = self.block_mac_to_block(&bm);
            let parent_next_key = if depth > 0 {
                path.entries[depth - 1].next_key
            } else {
                0
            };
            let (this_key, next_key, child) = {
                let node = self.block_data(&node_ref);
                assert!(!node_is_leaf(node));
                let this_key = self.tnode_get_key(path.tree, node_block, node, index);
                let next_key = self.tnode_get_key(path.tree, node_block, node, index + 1);
                let child = self.tnode_get_child(path.tree, node_block, node, index + 1);
                (this_key, next_key, child)
            };
            self.block_put(node_ref);
            if let Some(child) = child {
                assert!(this_key != 0 && this_key == path.entries[depth].next_key);
                path.entries[depth].index = index + 1;
                path.entries[depth].prev_key = this_key;
                path.entries[depth].next_key = if next_key != 0 {
                    next_key
                } else {
                    parent_next_key
                };
                prev_key = this_key;
                next_child = Some(child);
                break;
            }
        }
        let mut next_child = next_child.expect("next entry must exist");

        depth += 1;
        while depth < path.count - 1 {
            let Some(node_ref) = self.block_get(path.tx, &next_child) else {
                assert!(self.tx(path.tx).failed);
                path.count = 0;
                return;
            };
            let (first_key, child) = {
                let node = self.block_data(&node_ref);
                assert!(!node_is_leaf(node));
                let first_key = self.tnode_get_key(path.tree, !0, node, 0);
                let child = self.tnode_get_child(path.tree, !0, node, 0);
                (first_key, child)
            };
            self.block_put(node_ref);
            path.entries[depth] = TreePathEntry {
                block_mac: next_child,
                index: 0,
                prev_key,
                next_key: first_key,
            };
            assert!(path.entries[depth].next_key != 0);
            next_child = child.expect("internal node without children");
            depth += 1;
        }

        let Some(node_ref) = self.block_get(path.tx, &next_child) else {
            assert!(self.tx(path.tx).failed);
            path.count = 0;
            return;
        };
        let (first_key, first_data) = {
            let node = self.block_data(&node_ref);
            assert!(node_is_leaf(node));
            (
                self.tnode_get_key(path.tree, !0, node, 0),
                self.tnode_get_data(path.tree, !0, node, 0),
            )
        };
        self.block_put(node_ref);
        path.entries[depth] = TreePathEntry {
            block_mac: next_child,
            index: 0,
            prev_key,
            next_key: first_key,
        };
        path.data = first_data;
        assert!(path.entries[depth].next_key != 0);
    }

    /// Whether the node at `block_mac` must be relocated before it can be
    /// written in this transaction.
    fn tree_node_need_copy(&mut self, tx: TxId, tree: TreeId, block_mac: &BlockMac) -> bool {
        let block = self.block_mac_to_block(block_mac);
        self.tree(tree).copy_on_write
            && !self.tx(tx).failed
            && self.transaction_block_need_copy(tx, block)
    }

    /// Make the node at `path[path_index]` writable, relocating it first
    /// when copy-on-write requires it. Consumes (and on failure releases)
    /// `node_ref`.
    fn tree_block_dirty(
        &mut self,
        tx: TxId,
        path: &mut TreePath,
        path_index: usize,
        node_ref: BlockRef,
    ) -> Option<BlockRef> {
        let tree = path.tree;
        let block_mac = path.entries[path_index].block_mac;
        assert!(
            path_index != 0 || self.block_mac_same_block(&block_mac, &self.tree(tree).root)
        );

        if !self.tree_node_need_copy(tx, tree, &block_mac) {
            if self.tx(tx).failed {
                self.block_put(node_ref);
                return None;
            }
            let is_tmp = !self.tree(tree).allow_copy_on_write;
            self.block_dirty(tx, &node_ref, is_tmp);
            return Some(node_ref);
        }
        assert!(self.tree(tree).allow_copy_on_write);
        let is_tmp = !self.tree(tree).allow_copy_on_write;
        let new_block = self.block_allocate_etc(tx, is_tmp);
        if new_block == 0 {
            self.block_put(node_ref);
            return None;
        }
        let old_block = self.block_mac_to_block(&block_mac);
        assert_ne!(new_block, old_block);
        assert!(!self.tx(tx).failed);
        debug!("tree copy on write {} -> {}", old_block, new_block);
        self.block_free(tx, old_block);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.block_put(node_ref);
            return None;
        }
        self.block_mac_set_block(&mut path.entries[path_index].block_mac, new_block);
        if path_index == 0 {
            let mut root = self.tree(tree).root;
            self.block_mac_set_block(&mut root, new_block);
            let t = self.tree_mut(tree);
            t.root = root;
            t.root_block_changed = true;
        }
        Some(self.block_move(tx, node_ref, new_block, is_tmp))
    }

    /// Get the node at `path[path_index]` for write.
    fn tree_block_get_write(&mut self, tx: TxId, path: &mut TreePath, path_index: usize) -> Option<BlockRef> {
        let block_mac = path.entries[path_index].block_mac;
        let node_ref = self.block_get(tx, &block_mac)?;
        self.tree_block_dirty(tx, path, path_index, node_ref)
    }

    /// Release a dirty node (or external data block when `path_index ==
    /// path.count`) and propagate new macs and copied block numbers up to
    /// the root.
    pub(crate) fn tree_path_put_dirty(
        &mut self,
        tx: TxId,
        path: &mut TreePath,
        path_index: isize,
        data_ref: BlockRef,
    ) {
        let tree = path.tree;
        let mut path_index = path_index;
        let mut data_ref = data_ref;

        if path_index == path.count as isize {
            assert!((path_index as usize) < MAX_TREE_DEPTH);
            path.entries[path_index as usize].block_mac = path.data;
        }

        while path_index > 0 {
            let pi = (path_index - 1) as usize;
            let Some(parent_ref) = self.tree_block_get_write(tx, path, pi) else {
                assert!(self.tx(tx).failed);
                self.block_put_dirty_discard(data_ref);
                warn!("transaction failed, abort");
                return;
            };
            let geom = self.tree_geom(tree);
            let index = path.entries[pi].index;
            let child_level = pi + 1;
            let (range, stored) = {
                let node = self.block_data(&parent_ref);
                let parent_is_leaf = node_is_leaf(node);
                assert!(pi == path.count - 1 || !parent_is_leaf);
                assert!(
                    geom.child_data_size[parent_is_leaf as usize]
                        >= self.block_num_size + self.mac_size
                );
                let range = node_child_data_range(&geom, parent_is_leaf, index);
                let mut stored = BlockMac::zero();
                stored.data[..range.len()].copy_from_slice(&node[range.clone()]);
                (range, stored)
            };

            let child_bm = path.entries[child_level].block_mac;
            // The child must have been copied exactly when required.
            assert!(
                !self.tree_node_need_copy(tx, tree, &stored)
                    || !self.block_mac_same_block(&stored, &child_bm)
            );
            assert!(
                self.tree_node_need_copy(tx, tree, &stored)
                    || self.block_mac_same_block(&stored, &child_bm)
                    || self.tx(tx).failed
            );
            if !self.block_mac_same_block(&stored, &child_bm) {
                let mut updated = stored;
                self.block_mac_set_block(&mut updated, self.block_mac_to_block(&child_bm));
                let node = self.block_data_mut(&parent_ref);
                node[range.clone()].copy_from_slice(&updated.data[..range.len()]);
            }

            if self.tx(tx).failed {
                self.block_put_dirty_discard(data_ref);
                self.block_put_dirty_discard(parent_ref);
                warn!("transaction failed, abort");
                return;
            }

            let mac = self.block_put_dirty(data_ref);
            {
                let mac_start = range.start + self.block_num_size;
                let mac_len = self.mac_size;
                let node = self.block_data_mut(&parent_ref);
                node[mac_start..mac_start + mac_len].copy_from_slice(&mac[..mac_len]);
            }
            self.block_mac_set_mac(&mut path.entries[child_level].block_mac, &mac);

            data_ref = parent_ref;
            path_index -= 1;
        }

        assert!(self.block_mac_same_block(&self.tree(tree).root, &path.entries[0].block_mac));
        let mac = self.block_put_dirty(data_ref);
        {
            let mut root = self.tree(tree).root;
            self.block_mac_set_mac(&mut root, &mac);
            self.tree_mut(tree).root = root;
        }
        self.block_mac_set_mac(&mut path.entries[0].block_mac, &mac);
    }

    /// Update the separating key for the path's leaf in the closest parent
    /// where it appears.
    fn tree_update_key(&mut self, tx: TxId, path: &mut TreePath, path_index: isize, new_key: u64) {
        assert!(new_key != 0);
        let tree = path.tree;
        let mut path_index = path_index;
        while path_index >= 0 {
            let pi = path_index as usize;
            let index = path.entries[pi].index;
            if index == 0 {
                path_index -= 1;
                continue;
            }
            let Some(node_ref) = self.tree_block_get_write(tx, path, pi) else {
                assert!(self.tx(tx).failed);
                warn!("transaction failed, abort");
                return;
            };
            let geom = self.tree_geom(tree);
            {
                let node = self.block_data(&node_ref);
                assert!(!node_is_leaf(node));
                assert!(index == 1 || new_key >= node_get_key_raw(&geom, node, index - 2));
                let next = node_get_key_raw(&geom, node, index);
                assert!(next == 0 || new_key <= next);
                assert_eq!(path.entries[pi].prev_key, node_get_key_raw(&geom, node, index - 1));
            }
            {
                let node = self.block_data_mut(&node_ref);
                node_set_key(&geom, node, index - 1, new_key);
            }
            path.entries[pi].prev_key = new_key;
            self.tree_path_put_dirty(tx, path, path_index, node_ref);
            return;
        }
        // Root reached; the leftmost key has no separator to update.
    }

    /// Insert `key -> data` into a B+ tree, splitting as needed.
    pub(crate) fn tree_insert_block_mac(&mut self, tx: TxId, tree: TreeId, key: u64, data: BlockMac) {
        assert!(!self.tx(tx).failed);
        assert!(!self.tree(tree).updating);
        assert!(key != 0);
        assert!(self.block_mac_valid(&data));

        self.tree_mut(tree).updating = true;

        if !self.block_mac_valid(&self.tree(tree).root) {
            assert!(!self.tree(tree).copy_on_write || self.tree(tree).allow_copy_on_write);
            let is_tmp = !self.tree(tree).allow_copy_on_write;
            let root_block = self.block_allocate_etc(tx, is_tmp);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                self.tree_insert_done(tree);
                return;
            }
            let mut root = BlockMac::zero();
            self.block_mac_set_block(&mut root, root_block);
            self.tree_mut(tree).root = root;
            debug!("new root block {}", root_block);
            let node_ref = self.block_get_cleared(tx, root_block, is_tmp);
            {
                let node = self.block_data_mut(&node_ref);
                node_set_leaf(node, true);
            }
            let mac = self.block_put_dirty(node_ref);
            let mut root = self.tree(tree).root;
            self.block_mac_set_mac(&mut root, &mac);
            let t = self.tree_mut(tree);
            t.root = root;
            t.root_block_changed = true;
        }

        let mut path = self.tree_walk(tx, tree, key, false);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        }
        assert!(path.count > 0);

        let index = path.entries[path.count - 1].index;
        let leaf_bm = path.entries[path.count - 1].block_mac;
        let Some(node_ref) = self.block_get(tx, &leaf_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };
        {
            let node = self.block_data(&node_ref);
            let geom = self.tree_geom(tree);
            assert!(node_is_leaf(node));
            assert!(
                index != 0
                    || path.entries[path.count - 1].prev_key == 0
                    || node_get_key_raw(&geom, node, index) == key
            );
        }
        let path_count = path.count;
        let Some(node_ref) = self.tree_block_dirty(tx, &mut path, path_count - 1, node_ref) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };

        let geom = self.tree_geom(tree);
        let mut overflow_key_bytes = [0u8; 8];
        let mut overflow_data = [0u8; BLOCK_MAC_SIZE];
        {
            let node = self.block_data_mut(&node_ref);
            node_insert(
                &geom,
                node,
                index,
                SHIFT_LEAF_OR_LEFT_CHILD,
                &key.to_le_bytes(),
                &data.data,
                Some(&mut overflow_key_bytes),
                Some(&mut overflow_data),
            );
        }
        let leaf_index = path.count - 1;
        self.tree_path_put_dirty(tx, &mut path, leaf_index as isize, node_ref);

        let overflow_key = u64::from_le_bytes(overflow_key_bytes);
        if overflow_key != 0 {
            let mut overflow = BlockMac::zero();
            overflow.data.copy_from_slice(&overflow_data);
            assert!(self.block_mac_valid(&overflow));
            self.tree_node_split(tx, &mut path, overflow_key, None, Some(overflow));
        }

        self.tree_insert_done(tree);
    }

    fn tree_insert_done(&mut self, tree: TreeId) {
        let t = self.tree_mut(tree);
        t.update_count = t.update_count.wrapping_add(1);
        t.updating = false;
    }

    /// Insert `key -> data_block` (block number only, no mac).
    pub(crate) fn tree_insert(&mut self, tx: TxId, tree: TreeId, key: u64, data_block: BlockNum) {
        let mut data = BlockMac::zero();
        self.block_mac_set_block(&mut data, data_block);
        self.tree_insert_block_mac(tx, tree, key, data);
    }

    /// Split a full node and add `append_key` with `append_child` or
    /// `append_data` past its end. Splits chain upward when the parent
    /// overflows too; a new root is created when the old root splits.
    fn tree_node_split(
        &mut self,
        tx: TxId,
        path: &mut TreePath,
        append_key: u64,
        append_child: Option<BlockMac>,
        append_data: Option<BlockMac>,
    ) {
        let tree = path.tree;
        assert!(path.count > 0);
        path.count -= 1;
        let node_level = path.count;
        let block_mac = path.entries[node_level].block_mac;

        assert!(append_key != 0);
        // Only one staged entry at a time.
        assert_eq!(self.tree(tree).inserting.block, 0);
        {
            let node_block = self.block_mac_to_block(&block_mac);
            let t = self.tree_mut(tree);
            t.inserting.block = node_block;
            t.inserting.key = append_key;
            t.inserting.child = append_child.unwrap_or_else(BlockMac::zero);
            t.inserting.data = append_data.unwrap_or_else(BlockMac::zero);
        }
        assert!(append_child.is_none() || append_data.is_none());
        assert!(!self.tree(tree).copy_on_write || self.tree(tree).allow_copy_on_write);

        let is_tmp = !self.tree(tree).allow_copy_on_write;
        let mut right = BlockMac::zero();
        let right_block = self.block_allocate_etc(tx, is_tmp);
        self.block_mac_set_block(&mut right, right_block);
        let left_block_num = if path.count == 0 {
            // The old block stays the root; the left half moves out.
            self.block_allocate_etc(tx, is_tmp)
        } else {
            self.block_mac_to_block(&block_mac)
        };
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }
        self.tree_mut(tree).inserting = TreeInserting::default();

        debug!(
            "split {} -> {} {}",
            self.block_mac_to_block(&block_mac),
            left_block_num,
            right_block
        );

        let Some(mut node_left_ref) = self.tree_block_get_write(tx, path, node_level) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        let geom = self.tree_geom(tree);
        let is_leaf = node_is_leaf(self.block_data(&node_left_ref));

        let parent_ref;
        let parent_index;
        let left_range_index;
        if path.count == 0 {
            assert_ne!(left_block_num, self.block_mac_to_block(&block_mac));
            parent_ref = node_left_ref;
            node_left_ref = self.block_get_copy(tx, &parent_ref, left_block_num, is_tmp);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                self.block_put_dirty_discard(node_left_ref);
                self.block_put_dirty_discard(parent_ref);
                return;
            }
            // The old root block becomes the new internal root.
            {
                let node = self.block_data_mut(&parent_ref);
                node.fill(0);
            }
            parent_index = 0;
            left_range_index = 0;
            let range = node_child_data_range(&geom, false, 0);
            let mut left_bm = BlockMac::zero();
            self.block_mac_set_block(&mut left_bm, left_block_num);
            let node = self.block_data_mut(&parent_ref);
            node[range.clone()].copy_from_slice(&left_bm.data[..range.len()]);
        } else {
            assert_eq!(left_block_num, self.block_mac_to_block(&block_mac));
            parent_index = path.entries[path.count - 1].index;
            left_range_index = parent_index;
            let Some(p) = self.tree_block_get_write(tx, path, path.count - 1) else {
                warn!("transaction failed, abort");
                self.block_put_dirty_discard(node_left_ref);
                return;
            };
            assert!(!node_is_leaf(self.block_data(&p)));
            parent_ref = p;
        }
        assert!(!self.tx(tx).failed);
        let node_right_ref = self.block_get_copy(tx, &node_left_ref, right_block, is_tmp);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.block_put_dirty_discard(node_right_ref);
            self.block_put_dirty_discard(parent_ref);
            self.block_put_dirty_discard(node_left_ref);
            return;
        }
        assert_eq!(node_is_leaf(self.block_data(&node_right_ref)), is_leaf);
        assert!(node_full(&geom, self.block_data(&node_left_ref)));

        let max_key_count = node_max_key_count(&geom, is_leaf);
        let split_index = (max_key_count + 1) / 2;

        // Left node keeps the low half.
        {
            let node = self.block_data_mut(&node_left_ref);
            node_clear_end(&geom, node, split_index);
        }

        // Right node keeps the high half. For internal nodes the key at
        // the split moves to the parent; for leaf nodes it is duplicated.
        let parent_key = node_get_key_raw(&geom, self.block_data(&node_right_ref), split_index);
        {
            let node = self.block_data_mut(&node_right_ref);
            node_shift_down(
                &geom,
                node,
                0,
                split_index + !is_leaf as usize,
                SHIFT_LEAF_OR_LEFT_CHILD,
            );
            let append = if is_leaf {
                append_data.unwrap()
            } else {
                append_child.unwrap()
            };
            node_insert(
                &geom,
                node,
                max_key_count - split_index - !is_leaf as usize,
                if is_leaf {
                    SHIFT_LEAF_OR_LEFT_CHILD
                } else {
                    SHIFT_RIGHT_CHILD
                },
                &append_key.to_le_bytes(),
                &append.data,
                None,
                None,
            );
        }

        // Add the right node to the parent.
        let mut overflow_key_bytes = [0u8; 8];
        let mut overflow_child_bytes = [0u8; BLOCK_MAC_SIZE];
        {
            let node = self.block_data_mut(&parent_ref);
            assert!(!node_is_leaf(node));
            node_insert(
                &geom,
                node,
                parent_index,
                SHIFT_RIGHT_CHILD,
                &parent_key.to_le_bytes(),
                &right.data,
                Some(&mut overflow_key_bytes),
                Some(&mut overflow_child_bytes),
            );
        }
        let overflow_key = u64::from_le_bytes(overflow_key_bytes);
        let mut overflow_child = BlockMac::zero();
        overflow_child.data.copy_from_slice(&overflow_child_bytes);
        assert_eq!(overflow_key == 0, !self.block_mac_valid(&overflow_child));
        // If overflow_key is set the tree must not be re-entered until the
        // overflow child is published in tree.inserting by the recursive
        // split below.

        let parent_max = node_max_key_count(&geom, false);
        let right_in_parent = parent_index < parent_max;

        // Seal children and write their macs into the parent.
        let left_mac = self.block_put_dirty(node_left_ref);
        {
            let range = node_child_data_range(&geom, false, left_range_index);
            let mac_start = range.start + self.block_num_size;
            let mac_size = self.mac_size;
            let node = self.block_data_mut(&parent_ref);
            node[mac_start..mac_start + mac_size].copy_from_slice(&left_mac[..mac_size]);
        }
        let right_mac = self.block_put_dirty(node_right_ref);
        if right_in_parent {
            let range = node_child_data_range(&geom, false, parent_index + 1);
            let mac_start = range.start + self.block_num_size;
            let mac_size = self.mac_size;
            let node = self.block_data_mut(&parent_ref);
            node[mac_start..mac_start + mac_size].copy_from_slice(&right_mac[..mac_size]);
        } else {
            assert!(self.block_mac_valid(&overflow_child));
            self.block_mac_set_mac(&mut overflow_child, &right_mac);
        }
        self.tree_path_put_dirty(tx, path, path.count as isize - 1, parent_ref);

        if overflow_key != 0 {
            // A new root never overflows.
            assert!(path.count > 0);
            self.tree_node_split(tx, path, overflow_key, Some(overflow_child), None);
        }
    }

    /// Remove the entry `key -> data` from a B+ tree, rebalancing as
    /// needed.
    pub(crate) fn tree_remove(&mut self, tx: TxId, tree: TreeId, key: u64, data: BlockNum) {
        assert!(!self.tx(tx).failed);
        assert!(!self.tree(tree).updating);
        assert!(self.block_mac_valid(&self.tree(tree).root));
        assert!(key != 0);
        assert!(data != 0);

        self.tree_mut(tree).updating = true;

        let mut path = self.tree_walk(tx, tree, key, false);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        }
        assert!(path.count > 0);

        if self.block_mac_to_block(&path.data) != data {
            // Several entries share this key; scan for the matching data.
            path = self.tree_walk(tx, tree, key - 1, true);
            while self.block_mac_to_block(&path.data) != data || path.key() != key {
                assert!(path.key() != 0);
                self.tree_path_next(&mut path);
            }
        }

        let index = path.entries[path.count - 1].index;
        let leaf_bm = path.entries[path.count - 1].block_mac;
        let Some(node_ref) = self.block_get(tx, &leaf_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };
        let geom = self.tree_geom(tree);
        {
            let node = self.block_data(&node_ref);
            assert!(node_is_leaf(node));
            assert_eq!(node_get_key_raw(&geom, node, index), key);
            let stored = node_get_child_data(&geom, node, index);
            assert_eq!(self.block_mac_to_block(&stored), data);
        }
        let leaf_level = path.count - 1;
        let Some(node_ref) = self.tree_block_dirty(tx, &mut path, leaf_level, node_ref) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };
        {
            let node = self.block_data_mut(&node_ref);
            assert!(index < node_max_key_count(&geom, true));
            node_shift_down(&geom, node, index, index + 1, SHIFT_LEAF_OR_LEFT_CHILD);
        }
        let mut need_merge = false;
        if path.count > 1 {
            if index == 0 {
                let new_parent_key = node_get_key_raw(&geom, self.block_data(&node_ref), 0);
                assert!(new_parent_key != 0 || node_min_full_index(&geom, true) == 0);
                if new_parent_key != 0 {
                    let path_count = path.count;
                    self.tree_update_key(tx, &mut path, path_count as isize - 2, new_parent_key);
                }
            }
            need_merge = node_below_min_full(&geom, self.block_data(&node_ref));
        }
        self.tree_path_put_dirty(tx, &mut path, leaf_level as isize, node_ref);
        if need_merge {
            self.tree_node_merge(tx, &mut path);
        }

        self.tree_insert_done(tree);
    }

    /// Block-mac of the sibling to merge with: the left sibling when one
    /// exists, otherwise the right. This avoids picking an empty sibling
    /// when a non-empty one exists.
    fn tree_get_sibling_block(&mut self, tx: TxId, path: &TreePath) -> BlockMac {
        assert!(path.count > 1);
        let parent_bm = path.entries[path.count - 2].block_mac;
        let parent_index = path.entries[path.count - 2].index;
        let sibling_index = if parent_index == 0 { 1 } else { parent_index - 1 };

        let Some(node_ref) = self.block_get(tx, &parent_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return BlockMac::zero();
        };
        let geom = self.tree_geom(path.tree);
        let bm = node_get_child_data(&geom, self.block_data(&node_ref), sibling_index);
        assert!(self.block_mac_valid(&bm));
        self.block_put(node_ref);
        bm
    }

    /// Swap the path's tail between two sibling nodes without re-reading
    /// the parent. Does not preserve the prev/next key that is not shared
    /// between the siblings.
    fn tree_path_set_sibling_block(&self, path: &mut TreePath, block_mac: &mut BlockMac, left: bool) {
        assert!(path.count > 1);
        let pi = path.count - 2;
        let mut parent_index = path.entries[pi].index;
        assert!(!left || parent_index > 0);

        if left {
            parent_index -= 1;
            path.entries[pi].next_key = path.entries[pi].prev_key;
            path.entries[pi].prev_key = 0; // unknown
        } else {
            parent_index += 1;
            path.entries[pi].prev_key = path.entries[pi].next_key;
            path.entries[pi].next_key = 0; // unknown
        }
        path.entries[pi].index = parent_index;

        core::mem::swap(block_mac, &mut path.entries[path.count - 1].block_mac);
    }

    /// Rebalance the below-minimum node at the path's tail: borrow an
    /// entry from a sibling that has entries to spare, or merge into the
    /// left node and free the right block.
    fn tree_node_merge(&mut self, tx: TxId, path: &mut TreePath) {
        let tree = path.tree;
        assert!(path.count > 1);

        let node_is_left = path.entries[path.count - 2].index == 0;
        let mut merge_block = self.tree_get_sibling_block(tx, path);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        let node_bm = path.entries[path.count - 1].block_mac;
        let Some(mut node_ref) = self.block_get(tx, &node_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        let is_leaf = node_is_leaf(self.block_data(&node_ref));
        let Some(mut merge_ref) = self.block_get(tx, &merge_block) else {
            assert!(self.tx(tx).failed);
            self.block_put(node_ref);
            warn!("transaction failed, abort");
            return;
        };
        assert_eq!(is_leaf, node_is_leaf(self.block_data(&merge_ref)));

        let geom = self.tree_geom(tree);
        assert!(node_below_min_full(&geom, self.block_data(&node_ref)));
        assert!(!node_below_min_full(&geom, self.block_data(&merge_ref)));

        if node_above_min_full(&geom, self.block_data(&merge_ref)) {
            // Borrow an entry from the sibling.
            self.tree_path_set_sibling_block(path, &mut merge_block, !node_is_left);
            assert!(!self.tx(tx).failed);
            let level = path.count - 1;
            let Some(merge_rw) = self.tree_block_dirty(tx, path, level, merge_ref) else {
                assert!(self.tx(tx).failed);
                self.tree_path_set_sibling_block(path, &mut merge_block, node_is_left);
                self.block_put(node_ref);
                warn!("transaction failed, abort");
                return;
            };
            merge_ref = merge_rw;
            self.tree_path_set_sibling_block(path, &mut merge_block, node_is_left);
            assert!(!self.tree_node_need_copy(tx, tree, &merge_block));

            let is_tmp = !self.tree(tree).copy_on_write;
            self.block_dirty(tx, &node_ref, is_tmp);

            let (src_index, dest_index) = if node_is_left {
                (0, node_min_full_index(&geom, is_leaf))
            } else {
                (
                    node_get_key_count(&geom, self.block_data(&merge_ref)) - 1,
                    0,
                )
            };

            let mut key = node_get_key_raw(&geom, self.block_data(&merge_ref), src_index);
            let parent_key = if node_is_left && is_leaf {
                node_get_key_raw(&geom, self.block_data(&merge_ref), 1)
            } else {
                key
            };
            if !is_leaf {
                key = if node_is_left {
                    path.entries[path.count - 2].next_key
                } else {
                    path.entries[path.count - 2].prev_key
                };
            }
            let moved = node_get_child_data(
                &geom,
                self.block_data(&merge_ref),
                src_index + (!node_is_left && !is_leaf) as usize,
            );
            {
                let node = self.block_data_mut(&node_ref);
                node_insert(
                    &geom,
                    node,
                    dest_index,
                    if node_is_left && !is_leaf {
                        SHIFT_RIGHT_CHILD
                    } else {
                        SHIFT_LEAF_OR_LEFT_CHILD
                    },
                    &key.to_le_bytes(),
                    &moved.data,
                    None,
                    None,
                );
            }
            {
                let node = self.block_data_mut(&merge_ref);
                node_shift_down(
                    &geom,
                    node,
                    src_index,
                    src_index + 1,
                    if node_is_left || is_leaf {
                        SHIFT_LEAF_OR_LEFT_CHILD
                    } else {
                        SHIFT_RIGHT_CHILD
                    },
                );
            }

            if node_is_left {
                if dest_index == 0 && is_leaf {
                    let key0 = node_get_key_raw(&geom, self.block_data(&node_ref), 0);
                    assert!(key0 != 0);
                    self.tree_update_key(tx, path, path.count as isize - 2, key0);
                }
                self.tree_path_set_sibling_block(path, &mut merge_block, !node_is_left);
            }
            self.tree_update_key(tx, path, path.count as isize - 2, parent_key);
            if node_is_left {
                self.tree_path_set_sibling_block(path, &mut merge_block, node_is_left);
            }

            let level = path.count - 1;
            self.tree_path_put_dirty(tx, path, level as isize, node_ref);
            self.tree_path_set_sibling_block(path, &mut merge_block, !node_is_left);
            self.tree_path_put_dirty(tx, path, level as isize, merge_ref);
            self.tree_path_set_sibling_block(path, &mut merge_block, node_is_left);
        } else {
            // Merge into the left node and free the right block.
            if !node_is_left {
                core::mem::swap(&mut node_ref, &mut merge_ref);
                self.tree_path_set_sibling_block(path, &mut merge_block, true);
            }
            let level = path.count - 1;
            let Some(node_rw) = self.tree_block_dirty(tx, path, level, node_ref) else {
                assert!(self.tx(tx).failed);
                self.block_put(merge_ref);
                warn!("transaction failed, abort");
                return;
            };
            let node_ref = node_rw;
            assert!(!self.tree_node_need_copy(tx, tree, &path.entries[level].block_mac));

            let index = node_get_key_count(&geom, self.block_data(&node_ref));
            let merge_key = if is_leaf {
                None
            } else {
                let key = path.entries[path.count - 2].next_key;
                assert!(key != 0);
                Some(key)
            };
            let merge_count = node_get_key_count(&geom, self.block_data(&merge_ref));
            let merge_data = self.block_data(&merge_ref).to_vec();
            {
                let node = self.block_data_mut(&node_ref);
                node_merge_entries(&geom, node, &merge_data, index, merge_count, merge_key);
            }

            if is_leaf && node_min_full_index(&geom, true) == 0 && index == 0 {
                // Special case for order <= 4 trees: the left node was
                // empty, so the separator key must be refreshed.
                let key0 = node_get_key_raw(&geom, self.block_data(&node_ref), 0);
                assert!(key0 != 0);
                self.tree_update_key(tx, path, path.count as isize - 2, key0);
            }

            self.tree_path_put_dirty(tx, path, level as isize, node_ref);
            self.block_discard_dirty(&merge_ref);
            self.block_put(merge_ref);
            self.tree_path_set_sibling_block(path, &mut merge_block, false);
            let right_block = self.block_mac_to_block(&path.entries[path.count - 1].block_mac);
            path.count -= 1;
            self.tree_remove_internal(tx, path);
            let is_tmp = !self.tree(tree).allow_copy_on_write;
            self.block_free_etc(tx, right_block, is_tmp);
        }
    }

    /// Remove the separating key and right child at the path's tail from
    /// an internal node. Collapses an emptied root; merges a node that
    /// falls below minimum.
    fn tree_remove_internal(&mut self, tx: TxId, path: &mut TreePath) {
        let tree = path.tree;
        assert!(path.count > 0);

        let level = path.count - 1;
        let block_mac = path.entries[level].block_mac;
        let index = path.entries[level].index;
        let Some(node_ref) = self.block_get(tx, &block_mac) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        let geom = self.tree_geom(tree);
        assert!(!node_is_leaf(self.block_data(&node_ref)));
        assert!(index > 0);

        if path.count == 1 && node_get_key_raw(&geom, self.block_data(&node_ref), 1) == 0 {
            // The root is down to a single child; that child becomes the
            // new root.
            assert_eq!(index, 1);
            let new_root = node_get_child_data(&geom, self.block_data(&node_ref), 0);
            assert!(self.block_mac_valid(&new_root));
            debug!(
                "root emptied, new root {}",
                self.block_mac_to_block(&new_root)
            );
            self.tree_mut(tree).root = new_root;
            self.block_discard_dirty(&node_ref);
            self.block_put(node_ref);
            assert!(!self.tree(tree).copy_on_write || self.tree(tree).allow_copy_on_write);
            let is_tmp = !self.tree(tree).allow_copy_on_write;
            self.block_free_etc(tx, self.block_mac_to_block(&block_mac), is_tmp);
            return;
        }

        let Some(node_ref) = self.tree_block_dirty(tx, path, level, node_ref) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        {
            let node = self.block_data_mut(&node_ref);
            node_shift_down(&geom, node, index - 1, index, SHIFT_RIGHT_CHILD);
        }
        let need_merge = path.count > 1 && node_below_min_full(&geom, self.block_data(&node_ref));
        self.tree_path_put_dirty(tx, path, level as isize, node_ref);
        if need_merge {
            self.tree_node_merge(tx, path);
        }
    }

    /// Update the key or data of an existing entry. A key update must not
    /// move the entry relative to its neighbors.
    pub(crate) fn tree_update_block_mac(
        &mut self,
        tx: TxId,
        tree: TreeId,
        old_key: u64,
        old_data: BlockMac,
        new_key: u64,
        new_data: BlockMac,
    ) {
        assert!(!self.tx(tx).failed);
        assert!(!self.tree(tree).updating);
        assert!(self.block_mac_valid(&self.tree(tree).root));
        assert!(old_key != 0);
        assert!(self.block_mac_valid(&old_data));
        assert!(new_key != 0);
        assert!(self.block_mac_valid(&new_data));
        assert!(old_key == new_key || self.block_mac_same_block(&old_data, &new_data));
        assert!(old_key != new_key || !self.block_mac_same_block(&old_data, &new_data));

        self.tree_mut(tree).updating = true;

        let probe = self.tree_walk(tx, tree, old_key - 1, true);
        let mut prev_key = probe.key();
        if prev_key == old_key && self.block_mac_same_block(&probe.data, &old_data) {
            // Modifying the leftmost entry with this key.
            prev_key = 0;
        }

        let mut path = self.tree_walk(tx, tree, old_key, false);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        }
        assert!(path.count > 0);

        if !self.block_mac_same_block(&path.data, &old_data) {
            path = self.tree_walk(tx, tree, old_key - 1, true);
            while !self.block_mac_same_block(&path.data, &old_data) || path.key() != old_key {
                assert!(path.key() != 0);
                self.tree_path_next(&mut path);
            }
        }

        let level = path.count - 1;
        let index = path.entries[level].index;
        let leaf_bm = path.entries[level].block_mac;
        let Some(node_ref) = self.block_get(tx, &leaf_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };
        let geom = self.tree_geom(tree);
        let max_key_count = node_max_key_count(&geom, true);
        let next_key = {
            let node = self.block_data(&node_ref);
            assert!(node_is_leaf(node));
            assert_eq!(node_get_key_raw(&geom, node, index), old_key);
            assert!(self.block_mac_same_block(&node_get_child_data(&geom, node, index), &old_data));
            let mut next_key = if index + 1 < max_key_count {
                node_get_key_raw(&geom, node, index + 1)
            } else {
                0
            };
            if path.count > 1 && next_key == 0 {
                next_key = path.entries[path.count - 2].next_key;
            }
            next_key
        };

        let Some(node_ref) = self.tree_block_dirty(tx, &mut path, level, node_ref) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            self.tree_insert_done(tree);
            return;
        };

        if old_key == new_key {
            let range = node_child_data_range(&geom, true, index);
            let node = self.block_data_mut(&node_ref);
            node[range.clone()].copy_from_slice(&new_data.data[..range.len()]);
        } else if new_key >= prev_key && (new_key <= next_key || next_key == 0) {
            {
                let node = self.block_data_mut(&node_ref);
                node_set_key(&geom, node, index, new_key);
            }
            if index == 0 {
                let path_count = path.count;
                self.tree_update_key(tx, &mut path, path_count as isize - 2, new_key);
            }
        } else {
            // Moving entries is not supported.
            unreachable!("key update would move the entry");
        }
        self.tree_path_put_dirty(tx, &mut path, level as isize, node_ref);

        self.tree_insert_done(tree);
    }

    /// Update with block-number-only data.
    pub(crate) fn tree_update(
        &mut self,
        tx: TxId,
        tree: TreeId,
        old_key: u64,
        old_data: BlockNum,
        new_key: u64,
        new_data: BlockNum,
    ) {
        let mut old_bm = BlockMac::zero();
        let mut new_bm = BlockMac::zero();
        self.block_mac_set_block(&mut old_bm, old_data);
        self.block_mac_set_block(&mut new_bm, new_data);
        self.tree_update_block_mac(tx, tree, old_key, old_bm, new_key, new_bm);
    }

    /// Validate a whole tree: key ordering, key bounds, fill limits, and
    /// uniform depth. Returns false if an inconsistency was found.
    pub(crate) fn tree_check(&mut self, tx: TxId, tree: TreeId) -> bool {
        let root = self.tree(tree).root;
        let updating = self.tree(tree).updating;
        match self.tree_check_sub_tree(tx, tree, &root, true, 0, u64::MAX, updating) {
            depth if depth >= 0 => true,
            -2 => {
                warn!("tree not fully readable");
                if !self.tx(tx).failed {
                    self.transaction_fail(tx);
                }
                true
            }
            _ => {
                error!("invalid tree:\n{}", self.tree_dump(tx, tree));
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn tree_check_sub_tree(
        &mut self,
        tx: TxId,
        tree: TreeId,
        block_mac: &BlockMac,
        is_root: bool,
        min_key: u64,
        max_key: u64,
        updating: bool,
    ) -> i32 {
        if !self.block_mac_valid(block_mac) {
            return if is_root { 0 } else { -1 };
        }
        let Some(node_ref) = self.block_get_no_tr_fail(block_mac) else {
            return -2;
        };
        let geom = self.tree_geom(tree);
        let node_block = self.block_mac_to_block(block_mac);
        let node = self.block_data(&node_ref).to_vec();
        self.block_put(node_ref);

        let is_leaf = node_is_leaf(&node);
        let key_count = node_max_key_count(&geom, is_leaf);

        // Keys must be increasing, within bounds, and empty slots must be
        // clustered at the end with zeroed data.
        let mut prev = 0u64;
        let mut used = 0usize;
        let mut seen_empty = false;
        for i in 0..key_count {
            let key = node_get_key_raw(&geom, &node, i);
            if key == 0 {
                seen_empty = true;
                let range = node_child_data_range(&geom, is_leaf, i + !is_leaf as usize);
                if !is_zero(&node[range]) {
                    error!("{}: non-zero entry after empty key at {}", node_block, i);
                    return -1;
                }
                continue;
            }
            if seen_empty {
                error!("{}: key at {} follows an empty slot", node_block, i);
                return -1;
            }
            if key < prev || key < min_key || key > max_key {
                error!(
                    "{}: bad key at {}, {} not in [{}/{} - {}]",
                    node_block, i, key, min_key, prev, max_key
                );
                return -1;
            }
            prev = key;
            used += 1;
        }

        if !is_root && !updating && used < node_min_key_count(&geom, is_leaf) {
            error!("{}: node below minimum fill, {} keys", node_block, used);
            return -1;
        }
        if is_leaf {
            return 1;
        }
        if used == 0 && !updating {
            error!("{}: internal node without keys", node_block);
            return -1;
        }

        // Child subtree keys fall between the surrounding parent keys.
        let mut depth = -1i32;
        for i in 0..=used {
            let child = node_get_child_data(&geom, &node, i);
            if !self.block_mac_valid(&child) {
                error!("{}: missing child {}", node_block, i);
                return -1;
            }
            let child_min = if i == 0 {
                min_key
            } else {
                node_get_key_raw(&geom, &node, i - 1)
            };
            let child_max = if i == used {
                max_key
            } else {
                node_get_key_raw(&geom, &node, i).saturating_sub(1)
            };
            let child_depth =
                self.tree_check_sub_tree(tx, tree, &child, false, child_min, child_max, updating);
            if child_depth < 0 {
                return child_depth;
            }
            if depth >= 0 && depth != child_depth {
                error!("{}: depth mismatch at child {}", node_block, i);
                return -1;
            }
            depth = child_depth;
        }
        depth + 1
    }

    /// Render a tree for diagnostics.
    pub(crate) fn tree_dump(&mut self, tx: TxId, tree: TreeId) -> String {
        let mut out = String::new();
        let root = self.tree(tree).root;
        self.tree_dump_sub_tree(tx, tree, &root, &mut out);
        out
    }

    fn tree_dump_sub_tree(&mut self, tx: TxId, tree: TreeId, block_mac: &BlockMac, out: &mut String) {
        use core::fmt::Write;

        if !self.block_mac_valid(block_mac) {
            out.push_str("empty\n");
            return;
        }
        let node_block = self.block_mac_to_block(block_mac);
        let Some(node_ref) = self.block_get_no_tr_fail(block_mac) else {
            let _ = writeln!(out, "  {:>3}: unreadable", node_block);
            return;
        };
        let geom = self.tree_geom(tree);
        let node = self.block_data(&node_ref).to_vec();
        self.block_put(node_ref);

        let is_leaf = node_is_leaf(&node);
        let _ = write!(out, "  {:>3}:", node_block);
        let key_count = node_max_key_count(&geom, is_leaf);
        let mut children = Vec::new();
        if is_leaf {
            for i in 0..=key_count {
                let key = self.tnode_get_key(tree, node_block, &node, i);
                let data = self.tnode_get_data(tree, node_block, &node, i);
                if key != 0 || self.block_mac_valid(&data) {
                    if i == key_count {
                        out.push_str(" inserting");
                    }
                    let _ = write!(out, " [{}: {}]", key, self.block_mac_to_block(&data));
                } else if i < key_count {
                    out.push_str(" .");
                }
            }
        } else {
            for i in 0..=key_count + 1 {
                if let Some(child) = self.tnode_get_child(tree, node_block, &node, i) {
                    let _ = write!(out, " {}", self.block_mac_to_block(&child));
                    children.push(child);
                } else if i < key_count + 1 {
                    out.push_str(" .");
                }
                let key = self.tnode_get_key(tree, node_block, &node, i);
                if key != 0 {
                    if i == key_count {
                        out.push_str(" inserting");
                    }
                    let _ = write!(out, " [{}-]", key);
                }
            }
        }
        out.push('\n');
        for child in &children {
            self.tree_dump_sub_tree(tx, tree, child, out);
        }
    }
}
