// SPDX-License-Identifier: MPL-2.0

//! The block cache.
//!
//! All device I/O goes through a fixed pool of cache entries. An entry owns
//! a full-size buffer that holds either ciphertext (as read from or written
//! to disk, `IV || payload`) or the decrypted payload. Entries are never
//! freed; the pool is reused under a scored LRU policy.
//!
//! Every acquisition returns a [`BlockRef`] that pins the entry until it is
//! released with one of the `block_put*` operations. An entry acquired for
//! mutation carries `dirty_ref` and must be the only outstanding reference.

use crate::{
    layers::{
        bio::{BlockNum, DeviceConfig, IoCompletion},
        crypto::{calculate_mac, decrypt, encrypt, generate_iv, mac_eq, Mac, IV_SIZE, MAC_SIZE},
        fs::{Fs, TxId},
        tree::BlockMac,
    },
    prelude::*,
};

/// Number of entries in the block cache pool.
pub(crate) const BLOCK_CACHE_SIZE: usize = 64;
/// Largest supported device block size.
pub(crate) const MAX_BLOCK_SIZE: usize = 2048;

/// Selects one of the two devices a filesystem can use.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum DevId {
    Main = 0,
    Super = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IoOp {
    None,
    Read,
    Write,
}

pub(crate) struct CacheEntry {
    data: [u8; MAX_BLOCK_SIZE],
    dev: Option<DevId>,
    block: BlockNum,
    block_size: usize,
    mac: Mac,
    loaded: bool,
    encrypted: bool,
    dirty: bool,
    dirty_ref: bool,
    dirty_mac: bool,
    dirty_tmp: bool,
    dirty_tx: Option<TxId>,
    refs: u32,
    io_op: IoOp,
}

impl CacheEntry {
    fn unused() -> Self {
        Self {
            data: [0; MAX_BLOCK_SIZE],
            dev: None,
            block: !0,
            block_size: 0,
            mac: Mac::default(),
            loaded: false,
            encrypted: false,
            dirty: false,
            dirty_ref: false,
            dirty_mac: false,
            dirty_tmp: false,
            dirty_tx: None,
            refs: 0,
            io_op: IoOp::None,
        }
    }
}

/// A pinned reference to a cache entry.
///
/// Must be released through exactly one `block_put*` call; dropping it on
/// the floor leaks a pin that the end-of-commit reference check will catch.
#[must_use]
#[derive(Debug)]
pub(crate) struct BlockRef {
    idx: usize,
}

pub(crate) struct BlockCache {
    entries: Vec<CacheEntry>,
    /// Entry indices ordered most-recently-released first.
    lru: Vec<usize>,
    /// Per-device FIFO of entries with an operation in flight.
    io_ops: [Vec<usize>; 2],
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            entries: (0..BLOCK_CACHE_SIZE).map(|_| CacheEntry::unused()).collect(),
            lru: (0..BLOCK_CACHE_SIZE).collect(),
            io_ops: [Vec::new(), Vec::new()],
        }
    }

    fn lru_move_to_head(&mut self, idx: usize) {
        let pos = self.lru.iter().position(|&i| i == idx).unwrap();
        self.lru.remove(pos);
        self.lru.insert(0, idx);
    }
}

/// Replacement preference weight; higher weights are evicted sooner at the
/// same LRU position.
fn entry_score(entry: &CacheEntry, index: u64) -> u64 {
    if entry.dev.is_none() {
        return u64::MAX;
    }
    let weight = if entry.dirty {
        if entry.dirty_tmp {
            1
        } else {
            2
        }
    } else {
        4
    };
    weight * index
}

impl Fs {
    pub(crate) fn dev_config(&self, dev: DevId) -> DeviceConfig {
        match dev {
            DevId::Main => self.dev.config(),
            DevId::Super => match &self.super_dev {
                Some(d) => d.config(),
                None => self.dev.config(),
            },
        }
    }

    /// Resolve `Super` to `Main` when both roles share one device, so a
    /// block has a single cache identity.
    pub(crate) fn dev_canonical(&self, dev: DevId) -> DevId {
        match dev {
            DevId::Super if self.super_dev.is_none() => DevId::Main,
            other => other,
        }
    }

    fn dev_cache_mut(&mut self, dev: DevId) -> (&mut dyn crate::layers::bio::BlockDevice, &mut BlockCache) {
        match dev {
            DevId::Main => (self.dev.as_mut(), &mut self.cache),
            DevId::Super => (
                self.super_dev
                    .as_mut()
                    .expect("canonical device id")
                    .as_mut(),
                &mut self.cache,
            ),
        }
    }

    /// Wait until every in-flight operation on `dev` has completed.
    pub(crate) fn block_cache_complete_io(&mut self, dev: DevId) {
        while !self.cache.io_ops[dev as usize].is_empty() {
            let completion = {
                let (d, _) = self.dev_cache_mut(dev);
                d.wait_for_io()
            };
            match completion {
                Some(IoCompletion::Read { block, data, failed }) => {
                    self.block_cache_complete_read(dev, block, &data, failed)
                }
                Some(IoCompletion::Write { block, failed }) => {
                    self.block_cache_complete_write(dev, block, failed)
                }
                None => panic!("device dropped an in-flight operation"),
            }
        }
    }

    fn pop_io_op(&mut self, dev: DevId, block: BlockNum, io_op: IoOp) -> usize {
        let queue = &mut self.cache.io_ops[dev as usize];
        assert!(!queue.is_empty(), "completion without matching operation");
        // Out of order completion is not expected.
        let idx = queue.remove(0);
        let entry = &mut self.cache.entries[idx];
        assert_eq!(entry.block, block);
        assert_eq!(entry.dev, Some(dev));
        assert_eq!(entry.io_op, io_op);
        entry.io_op = IoOp::None;
        idx
    }

    /// Read-complete callback. Computes the mac of the ciphertext and
    /// stores it; does not validate or decrypt.
    fn block_cache_complete_read(&mut self, dev: DevId, block: BlockNum, data: &[u8], failed: bool) {
        let idx = self.pop_io_op(dev, block, IoOp::Read);
        let key = self.key;
        let entry = &mut self.cache.entries[idx];
        assert!(!entry.loaded);
        if failed {
            warn!("load block {} failed", block);
            return;
        }
        assert_eq!(data.len(), entry.block_size);
        entry.data[..data.len()].copy_from_slice(data);
        entry.mac = calculate_mac(&key, &entry.data[..entry.block_size]).expect("mac failure");
        entry.encrypted = true;
        entry.loaded = true;
    }

    /// Write-complete callback. A failed write fails the owning
    /// transaction.
    fn block_cache_complete_write(&mut self, dev: DevId, block: BlockNum, failed: bool) {
        let idx = self.pop_io_op(dev, block, IoOp::Write);
        let entry = &mut self.cache.entries[idx];
        let tx = entry.dirty_tx.take();
        if failed {
            error!("write block {} failed, fail transaction", block);
            if let Some(tx) = tx {
                if !self.tx(tx).failed {
                    self.transaction_fail(tx);
                }
            }
        }
    }

    fn block_cache_entry_decrypt(&mut self, idx: usize) {
        let key = self.key;
        let entry = &mut self.cache.entries[idx];
        assert!(entry.loaded);
        assert!(entry.encrypted);
        let (iv_bytes, payload) = entry.data[..entry.block_size].split_at_mut(IV_SIZE);
        let iv = crate::layers::crypto::Iv::from(<[u8; IV_SIZE]>::try_from(&*iv_bytes).unwrap());
        decrypt(&key, payload, &iv).expect("block cipher failure");
        entry.encrypted = false;
    }

    /// Encrypt a dirty entry in place and recompute its mac.
    ///
    /// An entry whose data and IV are unchanged since load must produce the
    /// stored mac again; this self-check only holds for full-width macs
    /// since truncation may collide.
    fn block_cache_entry_encrypt(&mut self, idx: usize) {
        let key = self.key;
        let mac_size = self.mac_size;
        let entry = &mut self.cache.entries[idx];
        assert!(entry.dirty);
        assert!(!entry.encrypted);
        assert_eq!(entry.refs, 0);
        let (iv_bytes, payload) = entry.data[..entry.block_size].split_at_mut(IV_SIZE);
        let iv = crate::layers::crypto::Iv::from(<[u8; IV_SIZE]>::try_from(&*iv_bytes).unwrap());
        encrypt(&key, payload, &iv).expect("block cipher failure");
        entry.encrypted = true;

        let old_mac = entry.mac;
        entry.mac = calculate_mac(&key, &entry.data[..entry.block_size]).expect("mac failure");
        if !entry.dirty_mac && mac_size == MAC_SIZE {
            assert!(mac_eq(&old_mac, &entry.mac));
        }
        entry.dirty_mac = false;
    }

    /// Write a dirty entry to disk. Does not wait for completion.
    fn block_cache_entry_clean(&mut self, idx: usize) {
        if !self.cache.entries[idx].dirty {
            return;
        }
        if !self.cache.entries[idx].encrypted {
            self.block_cache_entry_encrypt(idx);
        }
        let dev = self.cache.entries[idx].dev.expect("dirty entry without device");
        let (device, cache) = self.dev_cache_mut(dev);
        let entry = &mut cache.entries[idx];
        assert_eq!(entry.io_op, IoOp::None);
        entry.io_op = IoOp::Write;
        entry.dirty = false;
        let block = entry.block;
        let len = entry.block_size;
        cache.io_ops[dev as usize].push(idx);
        device.start_write(block, &cache.entries[idx].data[..len]);
    }

    /// Find the cache entry for `(dev, block)`, optionally reassigning the
    /// best unused entry when there is no match.
    fn block_cache_lookup(&mut self, dev: DevId, block: BlockNum, allocate: bool) -> Option<usize> {
        let dev = self.dev_canonical(dev);
        let mut victim: Option<usize> = None;
        let mut victim_score = 0u64;
        let mut available = 0u64;

        for pos in 0..self.cache.lru.len() {
            let idx = self.cache.lru[pos];
            let entry = &self.cache.entries[idx];
            if entry.dev == Some(dev) && entry.block == block {
                return Some(idx);
            }
            if entry.refs == 0 {
                let score = entry_score(entry, available);
                available += 1;
                if score >= victim_score {
                    victim = Some(idx);
                    victim_score = score;
                }
            }
        }

        if !allocate {
            return None;
        }
        let idx = victim?;

        assert!(!self.cache.entries[idx].dirty_ref);
        if self.cache.entries[idx].dirty {
            let old_dev = self.cache.entries[idx].dev.unwrap();
            debug!(
                "evict dirty block {} for {}",
                self.cache.entries[idx].block, block
            );
            self.block_cache_entry_clean(idx);
            self.block_cache_complete_io(old_dev);
        }
        let block_size = self.dev_config(dev).block_size;
        let entry = &mut self.cache.entries[idx];
        assert!(!entry.dirty);
        assert!(!entry.dirty_mac);
        assert!(entry.dirty_tx.is_none());
        entry.dev = Some(dev);
        entry.block = block;
        assert!(block_size <= MAX_BLOCK_SIZE);
        entry.block_size = block_size;
        entry.loaded = false;
        entry.encrypted = false;
        Some(idx)
    }

    /// Load an entry from disk if needed and verify `mac` when provided.
    ///
    /// A mac mismatch does not clear the cached state; the caller decides
    /// whether to fail the transaction.
    fn block_cache_load_entry(&mut self, idx: usize, mac: Option<&[u8]>) -> bool {
        if !self.cache.entries[idx].loaded {
            assert_eq!(self.cache.entries[idx].refs, 0);
            let dev = self.cache.entries[idx].dev.unwrap();
            {
                let (device, cache) = self.dev_cache_mut(dev);
                let entry = &mut cache.entries[idx];
                assert_eq!(entry.io_op, IoOp::None);
                entry.io_op = IoOp::Read;
                let block = entry.block;
                cache.io_ops[dev as usize].push(idx);
                device.start_read(block);
            }
            self.block_cache_complete_io(dev);
        }
        let entry = &self.cache.entries[idx];
        if !entry.loaded {
            warn!("failed to load block {}", entry.block);
            return false;
        }
        if let Some(mac) = mac {
            if !mac_eq(&entry.mac[..mac.len()], mac) {
                warn!("block {}, mac mismatch", entry.block);
                return false;
            }
        }
        if self.cache.entries[idx].encrypted {
            self.block_cache_entry_decrypt(idx);
        }
        true
    }

    fn block_cache_get(
        &mut self,
        dev: DevId,
        block: BlockNum,
        load: bool,
        mac: Option<&[u8]>,
    ) -> Option<BlockRef> {
        let config = self.dev_config(dev);
        if block >= config.block_count {
            warn!("bad block num {} >= {}", block, config.block_count);
            return None;
        }
        let idx = self
            .block_cache_lookup(dev, block, true)
            .expect("no reusable cache entry");
        if load && !self.block_cache_load_entry(idx, mac) {
            return None;
        }
        let entry = &mut self.cache.entries[idx];
        assert!(!entry.dirty_ref);
        entry.refs += 1;
        Some(BlockRef { idx })
    }

    /// Decrypted payload of a pinned entry.
    pub(crate) fn block_data(&self, r: &BlockRef) -> &[u8] {
        let entry = &self.cache.entries[r.idx];
        assert!(entry.refs > 0);
        &entry.data[..entry.block_size]
    }

    /// Mutable payload; the entry must be held for mutation.
    pub(crate) fn block_data_mut(&mut self, r: &BlockRef) -> &mut [u8] {
        let entry = &mut self.cache.entries[r.idx];
        assert!(entry.dirty_ref);
        &mut entry.data[..entry.block_size]
    }

    pub(crate) fn block_num_of(&self, r: &BlockRef) -> BlockNum {
        self.cache.entries[r.idx].block
    }

    /// Get block data without reading from disk. Only useful if followed
    /// by [`Fs::block_dirty`].
    pub(crate) fn block_get_no_read(&mut self, block: BlockNum) -> BlockRef {
        self.block_cache_get(DevId::Main, block, false, None)
            .expect("in-range block")
    }

    /// Get super-device block data without checking a mac. Only valid
    /// because the super device performs tamper detection.
    pub(crate) fn block_get_super(&mut self, block: BlockNum) -> Option<BlockRef> {
        assert!(self.dev_config(DevId::Super).tamper_detecting);
        self.block_cache_get(DevId::Super, block, true, None)
    }

    /// Get block data, verifying it against `block_mac`, without failing
    /// the transaction on error.
    pub(crate) fn block_get_no_tr_fail(&mut self, block_mac: &BlockMac) -> Option<BlockRef> {
        let block = self.block_mac_to_block(block_mac);
        assert!(block != 0);
        let mac_size = self.mac_size;
        let mac: Vec<u8> = self.block_mac_to_mac(block_mac)[..mac_size].to_vec();
        self.block_cache_get(DevId::Main, block, true, Some(&mac))
    }

    /// Get block data, verifying it against `block_mac`. A read failure or
    /// mac mismatch fails the transaction.
    pub(crate) fn block_get(&mut self, tx: TxId, block_mac: &BlockMac) -> Option<BlockRef> {
        if self.tx(tx).failed {
            warn!("transaction already failed");
            return None;
        }
        let data = self.block_get_no_tr_fail(block_mac);
        if data.is_none() && !self.tx(tx).failed {
            warn!("block {} unreadable, fail transaction", self.block_mac_to_block(block_mac));
            self.transaction_fail(tx);
        }
        data
    }

    /// Mark a pinned entry dirty for mutation by `tx`.
    pub(crate) fn block_dirty(&mut self, tx: TxId, r: &BlockRef, is_tmp: bool) {
        let entry = &mut self.cache.entries[r.idx];
        assert!(entry.dirty_tx.is_none() || entry.dirty_tx == Some(tx));
        assert!(!entry.dirty_ref);
        if !entry.loaded || entry.encrypted {
            entry.loaded = true;
            entry.encrypted = false;
        }
        assert_eq!(entry.refs, 1);
        entry.dirty = true;
        entry.dirty_ref = true;
        entry.dirty_tmp = is_tmp;
        entry.dirty_tx = Some(tx);
    }

    pub(crate) fn block_is_clean(&mut self, dev: DevId, block: BlockNum) -> bool {
        match self.block_cache_lookup(dev, block, false) {
            Some(idx) => !self.cache.entries[idx].dirty,
            None => true,
        }
    }

    fn entry_discard_dirty(&mut self, idx: usize) {
        let entry = &mut self.cache.entries[idx];
        if entry.dirty {
            assert!(entry.dev.is_some());
            assert_eq!(entry.io_op, IoOp::None);
            entry.loaded = false;
            entry.dev = None;
            entry.block = !0;
            entry.dirty = false;
            entry.dirty_tx = None;
        }
    }

    /// Drop the dirty state of a pinned entry without writing it.
    pub(crate) fn block_discard_dirty(&mut self, r: &BlockRef) {
        self.entry_discard_dirty(r.idx);
    }

    /// Drop the dirty state of `(dev, block)` if it is cached dirty.
    pub(crate) fn block_discard_dirty_by_block(&mut self, dev: DevId, block: BlockNum) {
        let Some(idx) = self.block_cache_lookup(dev, block, false) else {
            return;
        };
        let entry = &self.cache.entries[idx];
        assert!(!entry.dirty_ref);
        assert_eq!(entry.refs, 0);
        self.entry_discard_dirty(idx);
    }

    fn block_put_internal(&mut self, r: BlockRef) {
        let idx = r.idx;
        let entry = &mut self.cache.entries[idx];
        assert!(!entry.dirty_ref);
        assert!(entry.refs > 0);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.cache.lru_move_to_head(idx);
            if self.cache.entries[idx].dirty_mac {
                // Encrypt now so the stored mac matches the ciphertext
                // that will eventually be flushed.
                self.block_cache_entry_encrypt(idx);
            }
        }
        // BlockRef consumed.
        let _ = r;
    }

    /// Release a reference acquired with one of the `block_get*` calls.
    pub(crate) fn block_put(&mut self, r: BlockRef) {
        self.block_put_internal(r);
    }

    fn block_put_dirty_etc(&mut self, r: BlockRef) {
        let entry = &mut self.cache.entries[r.idx];
        entry.dirty_ref = false;
        if entry.dirty {
            entry.dirty_mac = true;
            let iv = generate_iv().expect("iv generation failure");
            entry.data[..IV_SIZE].copy_from_slice(&iv);
        } else {
            assert!(entry.dirty_tx.is_none());
        }
        self.block_put_internal(r);
    }

    /// Release a mutation reference. Generates a fresh IV, encrypts the
    /// entry and returns the recomputed mac for the parent to store.
    pub(crate) fn block_put_dirty(&mut self, r: BlockRef) -> Mac {
        let idx = r.idx;
        {
            let entry = &self.cache.entries[idx];
            assert!(entry.loaded);
            assert!(!entry.encrypted);
            assert!(entry.dirty);
            assert!(entry.dirty_ref);
        }
        self.block_put_dirty_etc(r);
        let entry = &self.cache.entries[idx];
        assert!(entry.encrypted);
        assert!(!entry.dirty_mac);
        entry.mac
    }

    /// Release a mutation reference to a super-device block; the mac is
    /// implicit at the device layer.
    pub(crate) fn block_put_dirty_no_mac(&mut self, r: BlockRef) {
        let entry = &self.cache.entries[r.idx];
        let dev = entry.dev.expect("entry without device");
        assert!(self.dev_config(dev).tamper_detecting);
        self.block_put_dirty_etc(r);
    }

    /// Release a mutation reference, discarding the dirty data.
    pub(crate) fn block_put_dirty_discard(&mut self, r: BlockRef) {
        self.block_discard_dirty(&r);
        self.block_put_dirty_etc(r);
    }

    /// Get block data for write without reading it first.
    pub(crate) fn block_get_write_no_read(&mut self, tx: TxId, block: BlockNum, is_tmp: bool) -> BlockRef {
        let r = self.block_get_no_read(block);
        self.block_dirty(tx, &r, is_tmp);
        r
    }

    /// Get block data for write, verifying it against `block_mac`.
    pub(crate) fn block_get_write(
        &mut self,
        tx: TxId,
        block_mac: &BlockMac,
        is_tmp: bool,
    ) -> Option<BlockRef> {
        let r = self.block_get(tx, block_mac)?;
        self.block_dirty(tx, &r, is_tmp);
        Some(r)
    }

    /// Get zeroed block data for write.
    pub(crate) fn block_get_cleared(&mut self, tx: TxId, block: BlockNum, is_tmp: bool) -> BlockRef {
        let r = self.block_get_write_no_read(tx, block, is_tmp);
        self.cache.entries[r.idx].data.fill(0);
        r
    }

    /// Get zeroed super-device block data for write.
    pub(crate) fn block_get_cleared_super(&mut self, tx: TxId, block: BlockNum) -> BlockRef {
        let r = self
            .block_cache_get(DevId::Super, block, false, None)
            .expect("in-range super block");
        self.block_dirty(tx, &r, false);
        let len = self.cache.entries[r.idx].block_size;
        self.cache.entries[r.idx].data[..len].fill(0);
        r
    }

    /// Get a new block for write with data copied from `src`.
    pub(crate) fn block_get_copy(
        &mut self,
        tx: TxId,
        src: &BlockRef,
        block: BlockNum,
        is_tmp: bool,
    ) -> BlockRef {
        assert!(block != 0);
        assert!(block < self.dev_config(DevId::Main).block_count);
        let src_len = self.cache.entries[src.idx].block_size;
        let data = self.cache.entries[src.idx].data[..src_len].to_vec();
        let dst = self.block_get_write_no_read(tx, block, is_tmp);
        self.cache.entries[dst.idx].data[..src_len].copy_from_slice(&data);
        dst
    }

    /// Re-key a clean pinned entry to a new block number and mark it
    /// dirty. Used for copy-on-write relocation.
    pub(crate) fn block_move(&mut self, tx: TxId, r: BlockRef, block: BlockNum, is_tmp: bool) -> BlockRef {
        {
            let entry = &self.cache.entries[r.idx];
            assert_eq!(entry.refs, 1);
            assert!(!entry.dirty);
            assert_eq!(entry.dev, Some(DevId::Main));
        }
        if let Some(dest) = self.block_cache_lookup(DevId::Main, block, false) {
            if dest != r.idx {
                let entry = &mut self.cache.entries[dest];
                assert_eq!(entry.refs, 0);
                assert!(!entry.dirty_ref);
                assert!(entry.dirty_tx.is_none() || entry.dirty_tx == Some(tx));
                assert_eq!(entry.io_op, IoOp::None);
                assert_eq!(entry.block, block);
                entry.loaded = false;
                entry.dev = None;
                entry.block = !0;
                entry.dirty = false;
                entry.dirty_tx = None;
            }
        }
        self.cache.entries[r.idx].block = block;
        self.block_dirty(tx, &r, is_tmp);
        r
    }

    /// Write out every non-tmp block dirtied by `tx` and wait for the
    /// writes to complete.
    pub(crate) fn block_cache_clean_transaction(&mut self, tx: TxId) {
        let mut dev: Option<DevId> = None;
        let order = self.cache.lru.clone();
        for idx in order {
            let entry = &self.cache.entries[idx];
            if entry.dirty_tx != Some(tx) || !entry.dirty {
                continue;
            }
            assert!(!entry.dirty_ref);
            if entry.dirty_tmp {
                continue;
            }
            let entry_dev = entry.dev.unwrap();
            match dev {
                None => dev = Some(entry_dev),
                Some(d) => assert_eq!(d, entry_dev),
            }
            assert_eq!(entry.refs, 0);
            self.block_cache_entry_clean(idx);
        }
        if let Some(dev) = dev {
            self.block_cache_complete_io(dev);
        }
    }

    /// Drop dirty state for blocks modified by `tx` without writing them.
    ///
    /// With `discard_all` false only tmp blocks are expected; the flag only
    /// strengthens the error checks.
    pub(crate) fn block_cache_discard_transaction(&mut self, tx: TxId, discard_all: bool) {
        for idx in 0..self.cache.entries.len() {
            let entry = &mut self.cache.entries[idx];
            if entry.dirty_tx != Some(tx) {
                continue;
            }
            if entry.io_op == IoOp::Write {
                // Already on its way to disk; the completion no longer has
                // an owner to fail.
                entry.dirty_tx = None;
                continue;
            }
            assert!(entry.dirty);
            if entry.refs > 0 {
                warn!("block {} still referenced while discarded", entry.block);
            } else {
                assert!(!entry.dirty_ref);
            }
            if !discard_all {
                assert_eq!(entry.refs, 0);
                assert!(entry.dirty_tmp);
            }
            entry.dirty = false;
            entry.dirty_tx = None;
            entry.loaded = false;
        }
    }

    /// Number of entries with outstanding references.
    pub(crate) fn block_cache_ref_count(&self) -> usize {
        self.cache.entries.iter().filter(|e| e.refs > 0).count()
    }
}
