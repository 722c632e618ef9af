// SPDX-License-Identifier: MPL-2.0

//! Named files.
//!
//! A file is one on-disk entry block (magic, block-map root, size, path)
//! plus a per-file block map for its payload blocks. File lookups hash the
//! path into the files tree; transactions stage creations, updates, and
//! deletions in their own trees until commit. Open handles track three
//! states of a file: the last committed entry, the transaction-local
//! entry, and the entry staged to become committed.

use crate::{
    layers::{
        bio::BlockNum,
        cache::BlockRef,
        crypto::{path_hash, IV_SIZE},
        fs::{Fs, TxId},
        tree::{BlockMac, BlockTree, TreeId, BLOCK_MAC_SIZE},
    },
    prelude::*,
    util::div_round_up,
};

/// Maximum path length: a fixed-size prefix (client identity) plus the
/// client's file name.
pub(crate) const FS_PATH_MAX: usize = 64 + 128;

const FILE_ENTRY_MAGIC: u64 = 0x0066797473757274; // "trustyf\0"

// On-disk file entry layout.
const FE_MAGIC: usize = IV_SIZE;
const FE_BLOCK_MAP: usize = FE_MAGIC + 8;
const FE_SIZE: usize = FE_BLOCK_MAP + BLOCK_MAC_SIZE;
const FE_RESERVED: usize = FE_SIZE + 8;
const FE_PATH: usize = FE_RESERVED + 8;
const FILE_ENTRY_SIZE: usize = FE_PATH + FS_PATH_MAX;

fn fe_magic(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[FE_MAGIC..FE_MAGIC + 8].try_into().unwrap())
}

fn fe_block_map(data: &[u8]) -> BlockMac {
    let mut bm = BlockMac::zero();
    bm.data
        .copy_from_slice(&data[FE_BLOCK_MAP..FE_BLOCK_MAP + BLOCK_MAC_SIZE]);
    bm
}

fn fe_size(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[FE_SIZE..FE_SIZE + 8].try_into().unwrap())
}

fn fe_path(data: &[u8]) -> &str {
    let path = &data[FE_PATH..FE_PATH + FS_PATH_MAX];
    let len = path.iter().position(|&b| b == 0).unwrap_or(FS_PATH_MAX);
    core::str::from_utf8(&path[..len]).unwrap_or("")
}

fn fe_init(data: &mut [u8], path: &str) {
    data[FE_MAGIC..FE_MAGIC + 8].copy_from_slice(&FILE_ENTRY_MAGIC.to_le_bytes());
    data[FE_PATH..FE_PATH + path.len()].copy_from_slice(path.as_bytes());
}

fn fe_set_block_map(data: &mut [u8], root: &BlockMac) {
    data[FE_BLOCK_MAP..FE_BLOCK_MAP + BLOCK_MAC_SIZE].copy_from_slice(&root.data);
}

fn fe_set_size(data: &mut [u8], size: u64) {
    data[FE_SIZE..FE_SIZE + 8].copy_from_slice(&size.to_le_bytes());
}

/// How `open_file` treats a missing or existing path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CreateMode {
    NoCreate,
    Create,
    CreateExclusive,
}

/// Handle to an open file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FileId(pub(crate) usize);

/// In-memory state of an open file.
pub(crate) struct FileHandle {
    /// Transaction whose open-file list owns this handle.
    pub tx: TxId,
    /// Entry staged to become committed by an in-flight commit.
    pub to_commit_block_mac: BlockMac,
    /// Entry as of the last successful commit.
    pub committed_block_mac: BlockMac,
    /// Current entry, following transaction-local rewrites.
    pub block_mac: BlockMac,
    pub to_commit_size: u64,
    pub size: u64,
    /// Handle was used since the owning transaction activated; a commit
    /// replacing the file fails the owner.
    pub used_by_tr: bool,
}

/// Legal path bytes: `[a-zA-Z0-9._-]`, non-empty, bounded length.
fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.len() < FS_PATH_MAX
        && path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}

impl Fs {
    /// Usable payload bytes per file block; the first 16 bytes of every
    /// block hold the IV.
    pub fn file_block_size(&self) -> usize {
        self.dev.config().block_size - IV_SIZE
    }

    fn path_hash_of(&self, path: &str) -> u64 {
        path_hash(self.block_num_size, path)
    }

    pub(crate) fn file_handle(&self, file: FileId) -> &FileHandle {
        self.file_handles.get(file.0)
    }

    pub(crate) fn file_handle_mut(&mut self, file: FileId) -> &mut FileHandle {
        self.file_handles.get_mut(file.0)
    }

    fn file_handle_checked(&self, tx: TxId, file: FileId) -> Result<()> {
        if !self.file_handles.contains(file.0) || self.file_handle(file).tx != tx {
            return_errno_with_msg!(InvalidArgs, "invalid file handle");
        }
        Ok(())
    }

    /// Load the block map of the file entry at `file` as a scratch tree.
    fn file_block_map_load(&mut self, tx: TxId, file: &BlockMac) -> Option<TreeId> {
        let entry_ref = if self.block_mac_valid(file) {
            self.block_get(tx, file)
        } else {
            None
        };
        let Some(entry_ref) = entry_ref else {
            if self.tx(tx).failed {
                warn!(
                    "can't read file entry at {}, transaction failed",
                    self.block_mac_to_block(file)
                );
            } else {
                error!("can't read file entry at {}", self.block_mac_to_block(file));
                self.transaction_fail(tx);
            }
            return None;
        };
        let root = fe_block_map(self.block_data(&entry_ref));
        self.block_put(entry_ref);

        let config = self.dev.config();
        let block_mac_size = self.block_num_size + self.mac_size;
        let mut tree = BlockTree::new(
            config.block_size,
            self.block_num_size,
            block_mac_size,
            block_mac_size,
        );
        tree.copy_on_write = true;
        tree.allow_copy_on_write = true;
        tree.root = root;
        Some(self.scratch_push(tree))
    }

    /// Write block-map and size changes back to the file entry, rewriting
    /// the entry to a new block the first time a committed file is
    /// modified in this transaction.
    fn file_block_map_update(&mut self, tx: TxId, map: TreeId, file: FileId) {
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return;
        }

        let file_bm = self.file_handle(file).block_mac;
        assert!(self.block_mac_valid(&file_bm));

        let Some(entry_ref) = self.block_get(tx, &file_bm) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return;
        };
        let entry_path = fe_path(self.block_data(&entry_ref)).to_string();
        let entry_size = fe_size(self.block_data(&entry_ref));

        let mut entry_ref = entry_ref;
        let mut entry_dirty = false;
        let mut tree_path;
        match self.file_tree_lookup(tx, TreeId::FilesAdded(tx), &entry_path, false) {
            Some((_, path)) => {
                tree_path = path;
            }
            None => {
                let found = self.file_tree_lookup(tx, TreeId::Files, &entry_path, false);
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    self.block_put(entry_ref);
                    return;
                }
                let (mut block_mac, _) = found.expect("modified file must exist");
                let old_block = self.block_mac_to_block(&block_mac);
                let file_block = self.block_mac_to_block(&file_bm);
                if self.transaction_block_need_copy(tx, file_block) {
                    if self.tx(tx).failed {
                        warn!("transaction failed, abort");
                        self.block_put(entry_ref);
                        return;
                    }
                    assert!(
                        self.tree(map).root_block_changed
                            || self.file_handle(file).size != entry_size
                    );
                    assert_eq!(old_block, file_block);
                    let new_block = self.block_allocate(tx);
                    if self.tx(tx).failed {
                        warn!("transaction failed, abort");
                        self.block_put(entry_ref);
                        return;
                    }
                    assert!(new_block != 0);
                    self.block_mac_set_block(&mut block_mac, new_block);

                    debug!("copy file block {} -> {}", file_block, new_block);

                    // Copy instead of move: fs.files still references the
                    // old entry until the transaction completes.
                    let copy_ref = self.block_get_copy(tx, &entry_ref, new_block, false);
                    self.block_put(entry_ref);
                    entry_ref = copy_ref;
                    entry_dirty = true;
                    if self.tx(tx).failed {
                        warn!("transaction failed, abort");
                        self.block_put_dirty_discard(entry_ref);
                        return;
                    }
                    self.tree_insert(tx, TreeId::FilesUpdated(tx), file_block, new_block);
                    self.block_free(tx, file_block);
                    self.file_handle_mut(file).block_mac = block_mac;
                }
                debug_assert!(self
                    .file_tree_lookup(tx, TreeId::FilesAdded(tx), &entry_path, false)
                    .is_none());

                tree_path = self.tree_walk(tx, TreeId::FilesUpdated(tx), old_block, false);
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    if entry_dirty {
                        self.block_put_dirty_discard(entry_ref);
                    } else {
                        self.block_put(entry_ref);
                    }
                    return;
                }
                assert_eq!(tree_path.key(), old_block);
                let updated = tree_path.data;
                assert!(self.block_mac_same_block(&updated, &self.file_handle(file).block_mac));
            }
        }
        if !entry_dirty {
            self.block_dirty(tx, &entry_ref, false);
        }

        let map_root = self.tree(map).root;
        let new_size = self.file_handle(file).size;
        {
            let data = self.block_data_mut(&entry_ref);
            fe_set_block_map(data, &map_root);
            fe_set_size(data, new_size);
        }
        let count = tree_path.count;
        self.tree_path_put_dirty(tx, &mut tree_path, count as isize, entry_ref);
        self.file_handle_mut(file).block_mac = tree_path.entries[count].block_mac;

        // Move to the head of the open-file list so opening the same file
        // twice in a transaction commits the handle that was modified.
        let t = self.tx_mut(tx);
        let pos = t.open_files.iter().position(|&f| f == file).unwrap();
        t.open_files.remove(pos);
        t.open_files.insert(0, file);
    }

    /// Get a file block for read or write. Copy-on-write applies to the
    /// data block, the block map, and the file entry on the first write.
    fn file_get_block_etc(
        &mut self,
        tx: TxId,
        file: FileId,
        file_block: BlockNum,
        read: bool,
        write: bool,
    ) -> Option<BlockRef> {
        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return None;
        }

        let file_bm = self.file_handle(file).block_mac;
        let map = self.file_block_map_load(tx, &file_bm)?;

        let mut data: Option<BlockRef> = None;
        let mut dirty = false;
        let result = 'body: {
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                break 'body None;
            }
            self.file_handle_mut(file).used_by_tr = true;

            let found = self.block_map_get(tx, map, file_block);
            let mut block_mac = found.unwrap_or_else(BlockMac::zero);
            if found.is_some() {
                data = if read {
                    self.block_get(tx, &block_mac)
                } else {
                    Some(self.block_get_no_read(self.block_mac_to_block(&block_mac)))
                };
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    break 'body None;
                }
            }

            let old_disk_block = found
                .map(|bm| self.block_mac_to_block(&bm))
                .unwrap_or(0);
            if write
                && (found.is_none() || self.transaction_block_need_copy(tx, old_disk_block))
            {
                let new_block = self.block_allocate(tx);
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    break 'body None;
                }
                assert!(new_block != 0);
                self.block_mac_set_block(&mut block_mac, new_block);

                if found.is_some() {
                    let moved = self.block_move(tx, data.take().unwrap(), new_block, false);
                    data = Some(moved);
                    dirty = true;
                    assert!(!self.tx(tx).failed);
                    self.block_free(tx, old_disk_block);
                } else if read {
                    data = Some(self.block_get_cleared(tx, new_block, false));
                    dirty = true;
                } else {
                    data = Some(self.block_get_no_read(new_block));
                }
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    break 'body None;
                }
                self.block_map_set(tx, map, file_block, Some(&block_mac));
                self.file_block_map_update(tx, map, file);
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    break 'body None;
                }
            }
            if write && !dirty {
                match &data {
                    Some(d) => self.block_dirty(tx, d, false),
                    None => break 'body None,
                }
            }
            data.take()
        };

        if result.is_none() {
            if let Some(d) = data.take() {
                if dirty {
                    self.block_put_dirty_discard(d);
                } else {
                    self.block_put(d);
                }
            }
        }
        self.scratch_pop(map);
        result
    }

    /// Get a file block for read. `None` for holes or on failure.
    pub(crate) fn file_get_block(
        &mut self,
        tx: TxId,
        file: FileId,
        file_block: BlockNum,
    ) -> Option<BlockRef> {
        self.file_get_block_etc(tx, file, file_block, true, false)
    }

    /// Get a file block for write; with `read` false the previous content
    /// is not loaded.
    pub(crate) fn file_get_block_write(
        &mut self,
        tx: TxId,
        file: FileId,
        file_block: BlockNum,
        read: bool,
    ) -> Option<BlockRef> {
        self.file_get_block_etc(tx, file, file_block, read, true)
    }

    /// Release a file block acquired for read.
    pub(crate) fn file_block_put(&mut self, data_ref: BlockRef) {
        self.block_put(data_ref);
    }

    /// Release a file block acquired for write and propagate its new mac
    /// through the block map into the file entry.
    pub(crate) fn file_block_put_dirty(
        &mut self,
        tx: TxId,
        file: FileId,
        file_block: BlockNum,
        data_ref: BlockRef,
    ) {
        let file_bm = self.file_handle(file).block_mac;
        let Some(map) = self.file_block_map_load(tx, &file_bm) else {
            self.block_put_dirty_discard(data_ref);
            return;
        };
        self.block_map_put_dirty(tx, map, file_block, data_ref);
        self.file_block_map_update(tx, map, file);
        self.scratch_pop(map);
    }

    /// Current size of an open file, or `None` for an invalidated handle.
    pub(crate) fn file_get_size(&mut self, tx: TxId, file: FileId) -> Option<u64> {
        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return None;
        }
        let handle = self.file_handle(file);
        let block_mac = handle.block_mac;
        if !self.block_mac_valid(&block_mac) {
            warn!("invalid file handle");
            return None;
        }
        self.file_handle_mut(file).used_by_tr = true;
        Some(self.file_handle(file).size)
    }

    /// Set the file size, freeing blocks past the end on shrink. Does not
    /// clear partial block data.
    pub(crate) fn file_set_size(&mut self, tx: TxId, file: FileId, size: u64) {
        if self.tx(tx).failed {
            warn!("transaction failed, ignore");
            return;
        }
        let file_block_size = self.file_block_size() as u64;
        let file_bm = self.file_handle(file).block_mac;
        let Some(map) = self.file_block_map_load(tx, &file_bm) else {
            return;
        };
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            self.scratch_pop(map);
            return;
        }
        let old_size = self.file_handle(file).size;
        if size == old_size {
            self.scratch_pop(map);
            return;
        }
        if size < old_size {
            let file_block = div_round_up(size, file_block_size);
            self.block_map_truncate(tx, map, file_block);
        }
        self.file_handle_mut(file).size = size;
        self.file_block_map_update(tx, map, file);
        self.scratch_pop(map);
    }

    /// Search `tree` for a file entry matching `file_path`, optionally
    /// removing the matching tree entry.
    fn file_tree_lookup(
        &mut self,
        tx: TxId,
        tree: TreeId,
        file_path: &str,
        remove: bool,
    ) -> Option<(BlockMac, crate::layers::tree::TreePath)> {
        let hash = self.path_hash_of(file_path);

        assert!(file_path.len() < FS_PATH_MAX);
        assert!(FILE_ENTRY_SIZE <= self.dev.config().block_size);

        let mut path = self.tree_walk(tx, tree, hash - 1, false);
        while path.key() != 0 && path.key() < hash {
            self.tree_path_next(&mut path);
        }
        while path.key() == hash {
            let mut block_mac = path.data;
            if !self.block_mac_valid(&block_mac) {
                warn!(
                    "got 0 block pointer for hash {:#x} while looking for {}",
                    hash, file_path
                );
                self.tree_path_next(&mut path);
                block_mac = path.data;
            }
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return None;
            }
            assert!(self.block_mac_valid(&block_mac));
            let entry_ref = self.block_get(tx, &block_mac)?;
            let found = {
                let data = self.block_data(&entry_ref);
                assert_eq!(fe_magic(data), FILE_ENTRY_MAGIC);
                fe_path(data) == file_path
            };
            self.block_put(entry_ref);
            if found {
                if remove {
                    let data_block = self.block_mac_to_block(&block_mac);
                    self.tree_remove(tx, tree, hash, data_block);
                }
                return Some((block_mac, path));
            }
            self.tree_path_next(&mut path);
        }
        None
    }

    /// Create a new file entry and stage it in the transaction's added
    /// tree. The caller must have checked that the path does not exist.
    fn file_create(&mut self, tx: TxId, path: &str) -> Option<BlockMac> {
        let hash = self.path_hash_of(path);
        let block = self.block_allocate(tx);

        debug!("create file {}, hash {:#x}, at block {}", path, hash, block);

        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return None;
        }
        assert!(block != 0);
        let mut block_mac = BlockMac::zero();
        self.block_mac_set_block(&mut block_mac, block);

        let entry_ref = self.block_get_cleared(tx, block, false);
        fe_init(self.block_data_mut(&entry_ref), path);
        let mac = self.block_put_dirty(entry_ref);
        self.block_mac_set_mac(&mut block_mac, &mac);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return None;
        }
        self.tree_insert_block_mac(tx, TreeId::FilesAdded(tx), hash, block_mac);
        if self.tx(tx).failed {
            warn!("transaction failed, abort");
            return None;
        }
        Some(block_mac)
    }

    /// Whether this transaction deletes the committed file at `block`.
    fn file_is_removed(&mut self, tx: TxId, block: BlockNum) -> bool {
        let path = self.tree_walk(tx, TreeId::FilesRemoved(tx), block, false);
        path.key() == block
    }

    /// Search for a file that existed before this transaction activated,
    /// following any transaction-local rewrite of its entry.
    fn file_lookup_not_removed(
        &mut self,
        tx: TxId,
        file_path: &str,
    ) -> Option<(BlockMac, BlockMac)> {
        let (block_mac, _) = self.file_tree_lookup(tx, TreeId::Files, file_path, false)?;
        let committed_block = self.block_mac_to_block(&block_mac);
        if self.file_is_removed(tx, committed_block) {
            debug!("file {}, {} in removed", file_path, committed_block);
            return None;
        }
        let committed = block_mac;

        let mut current = block_mac;
        let path = self.tree_walk(tx, TreeId::FilesUpdated(tx), committed_block, false);
        if path.key() == committed_block {
            debug!(
                "file {}, {} already updated in this transaction, use new copy {}",
                file_path,
                committed_block,
                self.block_mac_to_block(&path.data)
            );
            current = path.data;
        }
        Some((current, committed))
    }

    /// Handle open under `tx` whose current entry lives at `block_mac`.
    fn file_find_open(&self, tx: TxId, block_mac: &BlockMac) -> Option<FileId> {
        self.tx(tx)
            .open_files
            .iter()
            .copied()
            .find(|&f| self.block_mac_same_block(&self.file_handle(f).block_mac, block_mac))
    }

    /// Open a file.
    pub fn open_file(&mut self, tx: TxId, path: &str, create: CreateMode) -> Result<FileId> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        if !is_valid_path(path) {
            return_errno_with_msg!(InvalidArgs, "invalid path");
        }
        self.ensure_tx_active(tx);

        let mut committed = BlockMac::zero();
        let mut found = self
            .file_tree_lookup(tx, TreeId::FilesAdded(tx), path, false)
            .map(|(bm, _)| bm);
        if found.is_none() {
            if let Some((bm, committed_bm)) = self.file_lookup_not_removed(tx, path) {
                found = Some(bm);
                committed = committed_bm;
            }
        }

        let block_mac = match found {
            Some(block_mac) => {
                if create == CreateMode::CreateExclusive {
                    return_errno_with_msg!(Exists, "file exists");
                }
                if self.file_find_open(tx, &block_mac).is_some() {
                    warn!("{} already open", path);
                    return_errno_with_msg!(InvalidArgs, "file already open in transaction");
                }
                block_mac
            }
            None => {
                if self.tx(tx).failed {
                    return_errno!(TxAborted);
                }
                if create == CreateMode::NoCreate {
                    return_errno_with_msg!(NotFound, "no such file");
                }
                match self.file_create(tx, path) {
                    Some(bm) => bm,
                    None => return_errno!(TxAborted),
                }
            }
        };

        let Some(entry_ref) = self.block_get(tx, &block_mac) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return_errno!(TxAborted);
        };
        let size = fe_size(self.block_data(&entry_ref));
        self.block_put(entry_ref);

        let handle = FileHandle {
            tx,
            to_commit_block_mac: committed,
            committed_block_mac: committed,
            block_mac,
            to_commit_size: 0,
            size,
            used_by_tr: false,
        };
        let id = FileId(self.file_handles.insert(handle));
        self.tx_mut(tx).open_files.insert(0, id);
        Ok(id)
    }

    /// Close an open file handle.
    pub fn close_file(&mut self, file: FileId) {
        let tx = self.file_handle(file).tx;
        let t = self.tx_mut(tx);
        let pos = t
            .open_files
            .iter()
            .position(|&f| f == file)
            .expect("handle not open");
        t.open_files.remove(pos);
        self.file_handles.remove(file.0);
    }

    /// Delete a file.
    pub fn delete_file(&mut self, tx: TxId, path: &str) -> Result<()> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        if !is_valid_path(path) {
            return_errno_with_msg!(InvalidArgs, "invalid path");
        }
        self.ensure_tx_active(tx);
        if self.file_delete(tx, path) {
            Ok(())
        } else if self.tx(tx).failed {
            return_errno!(TxAborted);
        } else {
            return_errno_with_msg!(NotFound, "no such file");
        }
    }

    fn file_delete(&mut self, tx: TxId, path: &str) -> bool {
        let mut in_files = false;
        let mut old_block_mac = BlockMac::zero();
        let block_mac;
        if let Some((bm, _)) = self.file_tree_lookup(tx, TreeId::FilesAdded(tx), path, true) {
            block_mac = bm;
        } else {
            debug!("file {} not in files_added", path);
            match self.file_lookup_not_removed(tx, path) {
                Some((bm, committed)) => {
                    block_mac = bm;
                    old_block_mac = committed;
                    in_files = true;
                }
                None => {
                    warn!("file {} not found", path);
                    return false;
                }
            }
        }

        debug!(
            "delete file {}, at block {}",
            path,
            self.block_mac_to_block(&block_mac)
        );

        let Some(entry_ref) = self.block_get(tx, &block_mac) else {
            assert!(self.tx(tx).failed);
            warn!("transaction failed, abort");
            return false;
        };
        assert_eq!(fe_path(self.block_data(&entry_ref)), path);
        let map_root = fe_block_map(self.block_data(&entry_ref));
        if !in_files || !self.block_mac_same_block(&block_mac, &old_block_mac) {
            self.block_discard_dirty(&entry_ref);
        }
        self.block_put(entry_ref);

        if in_files {
            if !self.block_mac_same_block(&block_mac, &old_block_mac) {
                // Cancel the pending copy-forward of the entry.
                self.tree_remove(
                    tx,
                    TreeId::FilesUpdated(tx),
                    self.block_mac_to_block(&old_block_mac),
                    self.block_mac_to_block(&block_mac),
                );
                if self.tx(tx).failed {
                    warn!("transaction failed, abort");
                    return false;
                }
            }
            self.tree_insert_block_mac(
                tx,
                TreeId::FilesRemoved(tx),
                self.block_mac_to_block(&old_block_mac),
                old_block_mac,
            );
        }
        self.block_free(tx, self.block_mac_to_block(&block_mac));

        let config = self.dev.config();
        let block_mac_size = self.block_num_size + self.mac_size;
        let mut map_tree = BlockTree::new(
            config.block_size,
            self.block_num_size,
            block_mac_size,
            block_mac_size,
        );
        map_tree.copy_on_write = true;
        map_tree.allow_copy_on_write = true;
        map_tree.root = map_root;
        let map = self.scratch_push(map_tree);
        self.block_map_free(tx, map);
        self.scratch_pop(map);

        if let Some(open_file) = self.file_find_open(tx, &block_mac) {
            self.file_handle_mut(open_file).block_mac = BlockMac::zero();
        }
        true
    }

    // Commit and rollback staging for open handles.

    fn all_open_files(&self) -> Vec<FileId> {
        let mut files = Vec::new();
        for tx in self.all_tx_ids() {
            files.extend(self.tx(tx).open_files.iter().copied());
        }
        files
    }

    /// Stage `new_block_mac`/`new_size` on every handle (in any
    /// transaction) whose committed entry is `old_block_mac`.
    fn file_update_block_mac_tr(
        &mut self,
        tx: TxId,
        other_tx: TxId,
        old_block_mac: &BlockMac,
        old_block_no_mac: bool,
        new_block_mac: &BlockMac,
        new_size: u64,
    ) {
        assert!(self.block_mac_valid(old_block_mac) || other_tx == tx);
        for file in self.tx(other_tx).open_files.clone() {
            let handle = self.file_handle(file);
            let committed = handle.committed_block_mac;
            let current = handle.block_mac;
            if !self.block_mac_same_block(&committed, old_block_mac)
                || (!self.block_mac_valid(&committed)
                    && !self.block_mac_same_block(&current, new_block_mac))
            {
                continue; // unrelated file
            }
            assert!(old_block_no_mac || self.block_mac_eq(&committed, old_block_mac));

            debug!(
                "file handle {:?}, stage block {}/{} -> {}, size {} -> {}",
                file,
                self.block_mac_to_block(&committed),
                self.block_mac_to_block(&current),
                self.block_mac_to_block(new_block_mac),
                handle.size,
                new_size
            );

            let handle = self.file_handle_mut(file);
            handle.to_commit_block_mac = *new_block_mac;
            handle.to_commit_size = new_size;
        }
    }

    fn file_update_block_mac_all(
        &mut self,
        tx: TxId,
        old_block_mac: &BlockMac,
        old_block_no_mac: bool,
        new_block_mac: &BlockMac,
        new_size: u64,
    ) {
        for other_tx in self.all_tx_ids() {
            self.file_update_block_mac_tr(
                tx,
                other_tx,
                old_block_mac,
                old_block_no_mac,
                new_block_mac,
                new_size,
            );
        }
    }

    /// Apply this transaction's file changes to a copy-on-write copy of
    /// the committed files tree and stage handle updates. Returns the new
    /// tree root, or `None` when the transaction failed.
    pub(crate) fn file_transaction_complete(&mut self, tx: TxId) -> Option<BlockMac> {
        let new_files = self.scratch_push(BlockTree::copy_of(&self.files));
        let ok = self.file_transaction_complete_body(tx, new_files);
        let tree = self.scratch_pop(new_files);
        if ok {
            Some(tree.root)
        } else {
            assert!(self.tx(tx).failed);
            None
        }
    }

    fn file_transaction_complete_body(&mut self, tx: TxId, new_files: TreeId) -> bool {
        // Updated files: swap the committed entry for the rewritten one.
        let mut path = self.tree_walk(tx, TreeId::FilesUpdated(tx), 0, true);
        loop {
            let file = path.data;
            if !self.block_mac_valid(&file) {
                break;
            }
            let Some(entry_ref) = self.block_get(tx, &file) else {
                warn!("transaction failed, abort");
                return false;
            };
            let entry_path = fe_path(self.block_data(&entry_ref)).to_string();
            let entry_size = fe_size(self.block_data(&entry_ref));
            self.block_put(entry_ref);

            let mut old_file = BlockMac::zero();
            self.block_mac_set_block(&mut old_file, path.key());

            debug!(
                "update file at {} -> {}, {}",
                self.block_mac_to_block(&old_file),
                self.block_mac_to_block(&file),
                entry_path
            );

            self.file_update_block_mac_all(tx, &old_file, true, &file, entry_size);

            let hash = self.path_hash_of(&entry_path);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return false;
            }
            self.tree_update_block_mac(tx, new_files, hash, old_file, hash, file);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return false;
            }
            assert_ne!(
                self.block_mac_to_block(&old_file),
                self.block_mac_to_block(&file)
            );
            self.tree_path_next(&mut path);
        }

        // Removed files: drop the entry and invalidate staged handles.
        let mut path = self.tree_walk(tx, TreeId::FilesRemoved(tx), 0, true);
        loop {
            let file = path.data;
            if !self.block_mac_valid(&file) {
                break;
            }
            let Some(entry_ref) = self.block_get(tx, &file) else {
                warn!("transaction failed, abort");
                return false;
            };
            let entry_path = fe_path(self.block_data(&entry_ref)).to_string();
            self.block_put(entry_ref);

            debug!("delete file at {}, {}", self.block_mac_to_block(&file), entry_path);

            let clear = BlockMac::zero();
            self.file_update_block_mac_all(tx, &file, false, &clear, 0);

            let found = self.file_tree_lookup(tx, new_files, &entry_path, true);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return false;
            }
            let (old_file, _) = found.expect("removed file must be in the files tree");
            assert_eq!(
                self.block_mac_to_block(&old_file),
                self.block_mac_to_block(&file)
            );
            self.tree_path_next(&mut path);
        }

        // Added files: insert, detecting duplicate adds from concurrent
        // transactions.
        let mut path = self.tree_walk(tx, TreeId::FilesAdded(tx), 0, true);
        loop {
            let file = path.data;
            if !self.block_mac_valid(&file) {
                break;
            }
            let Some(entry_ref) = self.block_get(tx, &file) else {
                warn!("transaction failed, abort");
                return false;
            };
            let entry_path = fe_path(self.block_data(&entry_ref)).to_string();
            let entry_size = fe_size(self.block_data(&entry_ref));
            self.block_put(entry_ref);

            debug!("add file at {}, {}", self.block_mac_to_block(&file), entry_path);

            if let Some((conflict, _)) = self.file_tree_lookup(tx, new_files, &entry_path, false) {
                error!(
                    "add file at {}, {}, failed, conflicts with {}",
                    self.block_mac_to_block(&file),
                    entry_path,
                    self.block_mac_to_block(&conflict)
                );
                self.transaction_fail(tx);
                return false;
            }

            let clear = BlockMac::zero();
            self.file_update_block_mac_tr(tx, tx, &clear, false, &file, entry_size);

            let hash = self.path_hash_of(&entry_path);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return false;
            }
            self.tree_insert_block_mac(tx, new_files, hash, file);
            if self.tx(tx).failed {
                warn!("transaction failed, abort");
                return false;
            }
            self.tree_path_next(&mut path);
        }
        true
    }

    fn transaction_changed_file(&self, file: FileId) -> bool {
        let handle = self.file_handle(file);
        !self.block_mac_same_block(&handle.committed_block_mac, &handle.block_mac)
    }

    /// Revert the staged `to_commit` state of every open handle after a
    /// failed commit.
    pub(crate) fn file_transaction_complete_failed(&mut self, tx: TxId) {
        let _ = tx;
        for file in self.all_open_files() {
            let handle = self.file_handle(file);
            let src = handle.committed_block_mac;
            let dest = handle.to_commit_block_mac;
            if self.block_mac_same_block(&src, &dest) {
                assert!(self.block_mac_eq(&src, &dest));
                continue;
            }
            self.file_handle_mut(file).to_commit_block_mac = src;
        }
    }

    /// Apply the staged state to every open handle after a successful
    /// commit, failing other transactions that used a replaced file.
    pub(crate) fn file_transaction_success(&mut self, tx: TxId) {
        for file in self.all_open_files() {
            let file_tx = self.file_handle(file).tx;
            if tx == file_tx {
                self.file_handle_mut(file).used_by_tr = false;
            }
            let handle = self.file_handle(file);
            let src = handle.to_commit_block_mac;
            let dest = handle.committed_block_mac;

            if self.block_mac_same_block(&src, &dest) {
                assert!(self.block_mac_eq(&src, &dest));
                continue;
            }

            if file_tx != tx {
                if self.file_handle(file).used_by_tr {
                    warn!(
                        "file handle {:?}, conflict, fail transaction {:?}",
                        file, file_tx
                    );
                    assert!(!self.tx(file_tx).failed);
                    self.transaction_fail(file_tx);
                }
                let handle = self.file_handle(file);
                assert!(self.block_mac_same_block(&handle.committed_block_mac, &handle.block_mac));
            }

            debug!(
                "file handle {:?}, apply block {} -> {}",
                file,
                self.block_mac_to_block(&dest),
                self.block_mac_to_block(&src)
            );

            self.file_handle_mut(file).committed_block_mac = src;
            if tx == file_tx {
                let handle = self.file_handle(file);
                assert!(self.block_mac_eq(&handle.block_mac, &src));
                assert_eq!(handle.size, handle.to_commit_size);
            } else {
                let handle = self.file_handle_mut(file);
                handle.block_mac = src;
                handle.size = handle.to_commit_size;
            }
        }
    }

    /// Read a file entry to get the file size.
    fn file_read_size(&mut self, block_mac: &BlockMac) -> Option<u64> {
        if !self.block_mac_valid(block_mac) {
            return Some(0);
        }
        let entry_ref = self.block_get_no_tr_fail(block_mac)?;
        let size = fe_size(self.block_data(&entry_ref));
        self.block_put(entry_ref);
        Some(size)
    }

    /// Restore this transaction's open handles to the committed state
    /// after the transaction failed. Handles for files it created become
    /// invalid.
    pub(crate) fn file_transaction_failed(&mut self, tx: TxId) {
        for file in self.tx(tx).open_files.clone() {
            self.file_handle_mut(file).used_by_tr = false;
            if self.transaction_changed_file(file) {
                let committed = self.file_handle(file).committed_block_mac;
                self.file_handle_mut(file).block_mac = committed;
                match self.file_read_size(&committed) {
                    Some(size) => self.file_handle_mut(file).size = size,
                    None => {
                        warn!(
                            "failed to read block {}, clear file handle",
                            self.block_mac_to_block(&committed)
                        );
                        let handle = self.file_handle_mut(file);
                        handle.block_mac = BlockMac::zero();
                        handle.committed_block_mac = BlockMac::zero();
                        handle.size = 0;
                    }
                }
            }
        }
    }

    // Byte-granularity file access.

    /// Read up to `buf.len()` bytes at `offset`, clamped at end of file.
    pub fn read_file(&mut self, tx: TxId, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        self.ensure_tx_active(tx);
        self.file_handle_checked(tx, file)?;

        let size = self.file_handle(file).size;
        if offset > size {
            return_errno_with_msg!(InvalidArgs, "read past end of file");
        }
        let block_size = self.file_block_size() as u64;
        let mut bytes_left = (buf.len() as u64).min(size - offset);
        let total = bytes_left as usize;
        let mut offset = offset;
        let mut out = 0usize;
        while bytes_left > 0 {
            let block_num = offset / block_size;
            let block_offset = (offset % block_size) as usize;
            let len = ((block_size as usize - block_offset) as u64).min(bytes_left) as usize;

            let Some(data_ref) = self.file_get_block(tx, file, block_num) else {
                if self.tx(tx).failed {
                    return_errno!(TxAborted);
                }
                return_errno_with_msg!(IoFailed, "unreadable file block");
            };
            buf[out..out + len].copy_from_slice(
                &self.block_data(&data_ref)[IV_SIZE + block_offset..IV_SIZE + block_offset + len],
            );
            self.file_block_put(data_ref);

            offset += len as u64;
            out += len;
            bytes_left -= len as u64;
        }
        Ok(total)
    }

    /// Write `data` at `offset`, extending the file when writing past the
    /// current end. `offset` must not exceed the current size.
    pub fn write_file(&mut self, tx: TxId, file: FileId, offset: u64, data: &[u8]) -> Result<()> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        self.ensure_tx_active(tx);
        self.file_handle_checked(tx, file)?;

        let size = self.file_handle(file).size;
        if offset > size {
            return_errno_with_msg!(InvalidArgs, "write past end of file");
        }
        let block_size = self.file_block_size() as u64;
        let mut offset = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block_num = offset / block_size;
            let block_offset = (offset % block_size) as usize;
            let len = (block_size as usize - block_offset).min(remaining.len());

            // Partial blocks are read first; whole blocks are overwritten.
            let read = len != block_size as usize;
            let Some(data_ref) = self.file_get_block_write(tx, file, block_num, read) else {
                error!("error getting block {}", block_num);
                if !self.tx(tx).failed {
                    self.transaction_fail(tx);
                }
                return_errno!(TxAborted);
            };
            self.block_data_mut(&data_ref)
                [IV_SIZE + block_offset..IV_SIZE + block_offset + len]
                .copy_from_slice(&remaining[..len]);
            self.file_block_put_dirty(tx, file, block_num, data_ref);

            offset += len as u64;
            remaining = &remaining[len..];
        }

        if offset > self.file_handle(file).size {
            self.file_set_size(tx, file, offset);
        }
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        Ok(())
    }

    /// Current file size.
    pub fn file_size(&mut self, tx: TxId, file: FileId) -> Result<u64> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        self.ensure_tx_active(tx);
        self.file_handle_checked(tx, file)?;
        match self.file_get_size(tx, file) {
            Some(size) => Ok(size),
            None => return_errno_with_msg!(InvalidArgs, "invalid file handle"),
        }
    }

    /// Shrink a file to `size`. Growing is not supported.
    pub fn set_file_size(&mut self, tx: TxId, file: FileId, size: u64) -> Result<()> {
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        self.ensure_tx_active(tx);
        self.file_handle_checked(tx, file)?;

        if size > self.file_handle(file).size {
            return_errno_with_msg!(InvalidArgs, "only shrinking is supported");
        }
        if size != self.file_handle(file).size {
            self.file_set_size(tx, file, size);
        }
        if self.tx(tx).failed {
            return_errno!(TxAborted);
        }
        Ok(())
    }
}
