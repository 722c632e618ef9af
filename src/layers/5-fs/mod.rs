// SPDX-License-Identifier: MPL-2.0

//! Filesystem state, mount, and the versioned dual-slot superblock.

mod file;
#[cfg(test)]
mod tests;
mod transaction;

pub use self::file::{CreateMode, FileId};
pub(crate) use self::file::FileHandle;
pub(crate) use self::transaction::Transaction;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    layers::{
        alloc::AllocQueue,
        bio::{BlockDevice, BlockNum},
        cache::BlockCache,
        crypto::Key,
        tree::{BlockMac, BlockRange, BlockSet, BlockTree, SetId, TreeId, BLOCK_MAC_SIZE},
    },
    prelude::*,
    util::Pool,
};

const SUPER_BLOCK_MAGIC: u64 = 0x0073797473757274; // "trustys\0"
const SUPER_BLOCK_FLAGS_VERSION_MASK: u32 = 0x3;
const SUPER_BLOCK_FLAGS_BLOCK_INDEX_MASK: u32 = 0x1;
const SUPER_BLOCK_FS_VERSION: u32 = 0;

/// On-disk root block for filesystem state.
///
/// The version lives in the bottom two bits of `flags` and is duplicated
/// in `flags2` at the end of the struct, so a torn write of the record on
/// a device without atomic block writes is detectable. The `free` and
/// `files` roots are packed with the configured sizes but always occupy
/// the full 24-byte field, which lets `flags2` be validated before
/// `block_num_size` and `mac_size` are known.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
struct RawSuperBlock {
    iv: [u8; 16],
    magic: u64,
    flags: u32,
    fs_version: u32,
    block_size: u32,
    block_num_size: u8,
    mac_size: u8,
    res1: u8,
    res2: u8,
    block_count: u64,
    free: [u8; BLOCK_MAC_SIZE],
    free_count: u64,
    files: [u8; BLOCK_MAC_SIZE],
    res3: [u32; 5],
    flags2: u32,
}

const _: () = assert!(core::mem::size_of::<RawSuperBlock>() == 128);
const _: () = assert!(core::mem::offset_of!(RawSuperBlock, flags2) == 124);

/// Handle to a transaction owned by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TxId(pub(crate) usize);

/// A mounted filesystem engine.
///
/// Owns every piece of engine state: the devices, the block cache, the
/// allocator queue, the committed roots, and the arenas for transactions
/// and open file handles. All operations go through `&mut Fs`.
pub struct Fs {
    pub(crate) dev: Box<dyn BlockDevice>,
    /// Separate superblock device; `None` when the main device holds the
    /// superblock slots too.
    pub(crate) super_dev: Option<Box<dyn BlockDevice>>,
    pub(crate) key: Key,
    pub(crate) cache: BlockCache,
    pub(crate) alloc_queue: AllocQueue,
    /// Committed free set. Read-only between commits.
    pub(crate) free: BlockSet,
    /// Committed files tree. Read-only between commits.
    pub(crate) files: BlockTree,
    pub(crate) txs: Pool<Transaction>,
    pub(crate) file_handles: Pool<FileHandle>,
    /// Stack of transient trees (block maps, commit-time copies).
    pub(crate) scratch: Vec<BlockTree>,
    pub(crate) super_block: [BlockNum; 2],
    pub(crate) super_block_version: u32,
    pub(crate) written_super_block_version: u32,
    /// First block number that can store non-super blocks.
    pub(crate) min_block_num: BlockNum,
    pub(crate) block_num_size: usize,
    pub(crate) mac_size: usize,
    /// Free blocks a commit must leave behind for active transactions.
    pub(crate) reserved_count: u64,
}

impl Fs {
    /// Mount a filesystem from `dev`, storing superblocks on `super_dev`
    /// (or in the first two blocks of `dev` when `super_dev` is `None`).
    /// With `clear` the stored state is discarded and an empty filesystem
    /// is created, unless the stored superblock is from a future version.
    pub fn mount(
        dev: Box<dyn BlockDevice>,
        super_dev: Option<Box<dyn BlockDevice>>,
        key: Key,
        clear: bool,
    ) -> Result<Fs> {
        let config = dev.config();
        config.validate()?;
        let super_config = super_dev.as_ref().map(|d| d.config()).unwrap_or(config);
        super_config.validate()?;
        if super_config.block_size < core::mem::size_of::<RawSuperBlock>() {
            error!(
                "unsupported block size for super device, {} < {}",
                super_config.block_size,
                core::mem::size_of::<RawSuperBlock>()
            );
            return_errno_with_msg!(InvalidArgs, "super device blocks too small");
        }
        if super_config.block_count < 2 {
            error!(
                "unsupported block count for super device, {}",
                super_config.block_count
            );
            return_errno_with_msg!(InvalidArgs, "super device too small");
        }
        if !super_config.tamper_detecting {
            return_errno_with_msg!(InvalidArgs, "super device must detect tampering");
        }

        let min_block_num: BlockNum = if super_dev.is_none() { 2 } else { 1 };
        let mut fs = Fs {
            dev,
            super_dev,
            key,
            cache: BlockCache::new(),
            alloc_queue: AllocQueue::new(),
            free: BlockSet {
                tree: BlockTree::default(),
                initial_range: BlockRange::default(),
                updating: false,
            },
            files: BlockTree::default(),
            txs: Pool::new(),
            file_handles: Pool::new(),
            scratch: Vec::new(),
            super_block: [0, 1],
            super_block_version: 0,
            written_super_block_version: 0,
            min_block_num,
            block_num_size: config.block_num_size,
            mac_size: config.mac_size,
            reserved_count: 0,
        };
        fs.load_super_block(clear)?;
        Ok(fs)
    }

    /// Tear down the engine and hand the devices back, e.g. to remount.
    pub fn unmount(self) -> (Box<dyn BlockDevice>, Option<Box<dyn BlockDevice>>) {
        (self.dev, self.super_dev)
    }

    // Arena and locator resolution.

    pub(crate) fn tx(&self, tx: TxId) -> &Transaction {
        self.txs.get(tx.0)
    }

    pub(crate) fn tx_mut(&mut self, tx: TxId) -> &mut Transaction {
        self.txs.get_mut(tx.0)
    }

    pub(crate) fn all_tx_ids(&self) -> Vec<TxId> {
        self.txs.ids().into_iter().map(TxId).collect()
    }

    pub(crate) fn active_tx_ids(&self) -> Vec<TxId> {
        self.txs
            .ids()
            .into_iter()
            .map(TxId)
            .filter(|&id| self.tx(id).active)
            .collect()
    }

    pub(crate) fn set(&self, id: SetId) -> &BlockSet {
        match id {
            SetId::Free => &self.free,
            SetId::TmpAllocated(tx) => &self.tx(tx).tmp_allocated,
            SetId::Allocated(tx) => &self.tx(tx).allocated,
            SetId::Freed(tx) => &self.tx(tx).freed,
            SetId::NewFree(tx) => self.tx(tx).new_free.as_ref().expect("no commit in progress"),
        }
    }

    pub(crate) fn set_mut(&mut self, id: SetId) -> &mut BlockSet {
        match id {
            SetId::Free => &mut self.free,
            SetId::TmpAllocated(tx) => &mut self.tx_mut(tx).tmp_allocated,
            SetId::Allocated(tx) => &mut self.tx_mut(tx).allocated,
            SetId::Freed(tx) => &mut self.tx_mut(tx).freed,
            SetId::NewFree(tx) => self
                .tx_mut(tx)
                .new_free
                .as_mut()
                .expect("no commit in progress"),
        }
    }

    pub(crate) fn tree(&self, id: TreeId) -> &BlockTree {
        match id {
            TreeId::Files => &self.files,
            TreeId::Set(set) => &self.set(set).tree,
            TreeId::FilesAdded(tx) => &self.tx(tx).files_added,
            TreeId::FilesUpdated(tx) => &self.tx(tx).files_updated,
            TreeId::FilesRemoved(tx) => &self.tx(tx).files_removed,
            TreeId::Scratch(i) => &self.scratch[i],
        }
    }

    pub(crate) fn tree_mut(&mut self, id: TreeId) -> &mut BlockTree {
        match id {
            TreeId::Files => &mut self.files,
            TreeId::Set(set) => &mut self.set_mut(set).tree,
            TreeId::FilesAdded(tx) => &mut self.tx_mut(tx).files_added,
            TreeId::FilesUpdated(tx) => &mut self.tx_mut(tx).files_updated,
            TreeId::FilesRemoved(tx) => &mut self.tx_mut(tx).files_removed,
            TreeId::Scratch(i) => &mut self.scratch[i],
        }
    }

    /// Register a transient tree for the duration of an operation.
    pub(crate) fn scratch_push(&mut self, tree: BlockTree) -> TreeId {
        self.scratch.push(tree);
        TreeId::Scratch(self.scratch.len() - 1)
    }

    pub(crate) fn scratch_pop(&mut self, id: TreeId) -> BlockTree {
        match id {
            TreeId::Scratch(i) => {
                assert_eq!(i, self.scratch.len() - 1, "scratch trees pop in LIFO order");
                self.scratch.pop().unwrap()
            }
            _ => panic!("not a scratch tree"),
        }
    }

    // Superblock handling.

    fn super_block_valid(&self, raw: &RawSuperBlock) -> bool {
        let config = self.dev.config();
        if raw.magic != SUPER_BLOCK_MAGIC {
            info!("bad magic, {:#x}", raw.magic);
            return false;
        }
        if raw.flags != raw.flags2 {
            warn!("flags, {:#x}, does not match flags2, {:#x}", raw.flags, raw.flags2);
            return false;
        }
        if raw.fs_version > SUPER_BLOCK_FS_VERSION {
            warn!("super block is from the future: {:#x}", raw.fs_version);
            // Still "valid" so it wins slot selection and mount refuses.
            return true;
        }
        if raw.flags & !SUPER_BLOCK_FLAGS_VERSION_MASK != 0 {
            warn!("unknown flags set, {:#x}", raw.flags);
            return false;
        }
        if raw.block_size as usize != config.block_size {
            warn!(
                "bad block size {:#x}, expected {:#x}",
                raw.block_size, config.block_size
            );
            return false;
        }
        if (raw.block_num_size as usize) < config.block_num_size || raw.block_num_size > 8 {
            warn!(
                "invalid block_num_size {} not in [{}, 8]",
                raw.block_num_size, config.block_num_size
            );
            return false;
        }
        if (raw.mac_size as usize) < config.mac_size || raw.mac_size > 16 {
            warn!(
                "invalid mac_size {} not in [{}, 16]",
                raw.mac_size, config.mac_size
            );
            return false;
        }
        if !config.tamper_detecting && raw.mac_size != 16 {
            warn!("invalid mac_size {} != 16", raw.mac_size);
            return false;
        }
        if raw.block_count > config.block_count {
            warn!(
                "bad block count {:#x}, expected <= {:#x}",
                raw.block_count, config.block_count
            );
            return false;
        }
        true
    }

    /// Whether `new` is valid and more recent than `old`. Versions are
    /// compared modulo 4: a delta of 1 means newer, 3 means older.
    fn use_new_super(&self, new: &RawSuperBlock, new_index: u32, old: Option<&RawSuperBlock>) -> bool {
        if !self.super_block_valid(new) {
            return false;
        }
        if new.flags & SUPER_BLOCK_FLAGS_BLOCK_INDEX_MASK != new_index {
            warn!(
                "block index, {:#x}, does not match flags, {:#x}",
                new_index, new.flags
            );
            return false;
        }
        let Some(old) = old else {
            return true;
        };
        let dv = new.flags.wrapping_sub(old.flags) & SUPER_BLOCK_FLAGS_VERSION_MASK;
        match dv {
            1 => true,
            3 => false,
            _ => {
                warn!(
                    "bad version delta, {} (new flags {:#x}, old flags {:#x})",
                    dv, new.flags, old.flags
                );
                false
            }
        }
    }

    /// Initialize the free set for an empty filesystem.
    fn fs_init_empty(&mut self) {
        let range = BlockRange {
            start: self.min_block_num,
            end: self.dev.config().block_count,
        };
        Self::block_set_add_initial_range(&mut self.free, range);
    }

    fn fs_init_from_super(&mut self, raw: Option<&RawSuperBlock>, clear: bool) -> Result<()> {
        if let Some(raw) = raw {
            if raw.fs_version > SUPER_BLOCK_FS_VERSION {
                error!("super block is from the future {:#x}", raw.fs_version);
                return_errno_with_msg!(Unsupported, "filesystem from a future version");
            }
        }
        let raw = if clear { None } else { raw };
        let config = self.dev.config();
        match raw {
            Some(raw) => {
                self.block_num_size = raw.block_num_size as usize;
                self.mac_size = raw.mac_size as usize;
            }
            None => {
                self.block_num_size = config.block_num_size;
                self.mac_size = config.mac_size;
            }
        }
        let block_mac_size = self.block_num_size + self.mac_size;
        self.free = self.block_set_new();
        self.free.tree.copy_on_write = true;
        self.files = BlockTree::new(
            config.block_size,
            self.block_num_size,
            block_mac_size,
            block_mac_size,
        );
        self.files.copy_on_write = true;
        self.files.allow_copy_on_write = true;

        // Reserve 1/4 for tmp blocks plus half of the remaining space.
        self.reserved_count = config.block_count / 8 * 5;

        match raw {
            Some(raw) => {
                self.free.tree.root = BlockMac { data: raw.free };
                self.files.root = BlockMac { data: raw.files };
                self.super_block_version = raw.flags & SUPER_BLOCK_FLAGS_VERSION_MASK;
                info!("loaded super block version {}", self.super_block_version);
            }
            None => {
                if clear {
                    info!("clear requested, create empty");
                } else {
                    info!("no valid super-block found, create empty");
                }
                self.fs_init_empty();
            }
        }
        assert!(self.block_num_size >= config.block_num_size);
        assert!(self.block_num_size <= 8);
        assert!(self.mac_size >= config.mac_size);
        assert!(self.mac_size <= 16);
        assert!(self.mac_size == 16 || config.tamper_detecting);
        Ok(())
    }

    /// Read both superblock slots and initialize from the newest valid
    /// one, or create an empty filesystem when neither is usable.
    fn load_super_block(&mut self, clear: bool) -> Result<()> {
        let mut newest: Option<RawSuperBlock> = None;
        for i in 0..2 {
            let Some(r) = self.block_get_super(self.super_block[i]) else {
                error!("failed to read super-block");
                return_errno_with_msg!(IoFailed, "superblock unreadable");
            };
            let raw =
                RawSuperBlock::read_from_bytes(&self.block_data(&r)[..core::mem::size_of::<RawSuperBlock>()])
                    .expect("sized read");
            self.block_put(r);
            if self.use_new_super(&raw, i as u32, newest.as_ref()) {
                newest = Some(raw);
            }
        }
        self.fs_init_from_super(newest.as_ref(), clear)
    }

    /// Generate and write a new superblock into the non-current slot.
    ///
    /// Returns false if the transaction failed before the superblock was
    /// staged. The write itself is flushed by the caller; only a
    /// successful flush advances the in-memory roots.
    pub(crate) fn update_super_block(
        &mut self,
        tx: TxId,
        free: &BlockMac,
        files: &BlockMac,
    ) -> bool {
        let super_config = self.dev_config(crate::layers::cache::DevId::Super);
        assert!(super_config.block_size >= core::mem::size_of::<RawSuperBlock>());

        let ver = (self.super_block_version + 1) & SUPER_BLOCK_FLAGS_VERSION_MASK;
        let index = (ver & SUPER_BLOCK_FLAGS_BLOCK_INDEX_MASK) as usize;

        debug!("write super block {}, ver {}", self.super_block[index], ver);

        let config = self.dev.config();
        let raw = RawSuperBlock {
            // The IV is generated when the dirty block is released.
            iv: [0; 16],
            magic: SUPER_BLOCK_MAGIC,
            flags: ver,
            fs_version: SUPER_BLOCK_FS_VERSION,
            block_size: config.block_size as u32,
            block_num_size: self.block_num_size as u8,
            mac_size: self.mac_size as u8,
            res1: 0,
            res2: 0,
            block_count: config.block_count,
            free: free.data,
            free_count: 0,
            files: files.data,
            res3: [0; 5],
            flags2: ver,
        };

        let r = self.block_get_cleared_super(tx, self.super_block[index]);
        if self.tx(tx).failed {
            self.block_put_dirty_discard(r);
            return false;
        }
        let bytes = raw.as_bytes();
        self.block_data_mut(&r)[..bytes.len()].copy_from_slice(bytes);
        self.written_super_block_version = ver;
        self.block_put_dirty_no_mac(r);
        true
    }
}
