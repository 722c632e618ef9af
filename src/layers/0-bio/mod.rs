// SPDX-License-Identifier: MPL-2.0

//! The layer of untrusted block I/O.
//!
//! Devices expose asynchronous-style reads and writes: `start_read` and
//! `start_write` only initiate an operation, and the caller collects
//! [`IoCompletion`]s through `wait_for_io` until its in-flight list drains.
//! Completions must be delivered in issue order.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::prelude::*;

/// Identifies a physical block on a device. 0 is reserved as "no block".
pub type BlockNum = u64;

/// Geometry and integrity properties of a block device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    /// Number of blocks in the device.
    pub block_count: u64,
    /// Number of bytes per block.
    pub block_size: usize,
    /// Number of bytes used to store block numbers on disk, in [2, 8].
    pub block_num_size: usize,
    /// Number of bytes used to store mac values on disk. Must be 16 if the
    /// device is not tamper detecting.
    pub mac_size: usize,
    /// Whether a completed write cannot be silently rolled back by
    /// non-secure code.
    pub tamper_detecting: bool,
}

impl DeviceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(2..=8).contains(&self.block_num_size) {
            return_errno_with_msg!(InvalidArgs, "block_num_size out of range");
        }
        if self.mac_size == 0 || self.mac_size > 16 {
            return_errno_with_msg!(InvalidArgs, "mac_size out of range");
        }
        if !self.tamper_detecting && self.mac_size != 16 {
            return_errno_with_msg!(InvalidArgs, "full mac required without tamper detection");
        }
        Ok(())
    }
}

/// A completed read or write operation, reported through `wait_for_io`.
#[derive(Debug)]
pub enum IoCompletion {
    Read {
        block: BlockNum,
        data: Vec<u8>,
        failed: bool,
    },
    Write {
        block: BlockNum,
        failed: bool,
    },
}

/// A block device consumed by the engine.
///
/// Once an operation is started the device owns it until it is reported
/// back from `wait_for_io`. The block cache tracks the set of in-flight
/// operations and drains completions after every start.
pub trait BlockDevice {
    fn config(&self) -> DeviceConfig;

    /// Start reading `block`. Non-blocking.
    fn start_read(&mut self, block: BlockNum);

    /// Start writing `data` to `block`. Non-blocking.
    fn start_write(&mut self, block: BlockNum, data: &[u8]);

    /// Block until at least one in-flight operation completes and return
    /// it. Returns `None` only when nothing is in flight.
    fn wait_for_io(&mut self) -> Option<IoCompletion>;
}

#[derive(Default)]
struct MemDeviceFaults {
    fail_reads: Vec<BlockNum>,
    fail_writes: Vec<BlockNum>,
}

/// A memory-backed block device.
///
/// Stands in for the physical transports (RPMB, non-secure file) behind the
/// same contract. Reads and writes complete synchronously but are still
/// reported through the completion queue. Clones share the stored blocks,
/// so a handle kept outside the engine can inspect, tamper with, or remount
/// the same storage; tests can also inject read or write failures for
/// specific blocks.
#[derive(Clone)]
pub struct MemDevice {
    config: DeviceConfig,
    disk: Arc<Mutex<Vec<Vec<u8>>>>,
    faults: Arc<Mutex<MemDeviceFaults>>,
    completions: Arc<Mutex<VecDeque<IoCompletion>>>,
}

impl MemDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let blocks = (0..config.block_count)
            .map(|_| vec![0u8; config.block_size])
            .collect();
        Self {
            config,
            disk: Arc::new(Mutex::new(blocks)),
            faults: Arc::new(Mutex::new(MemDeviceFaults::default())),
            completions: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Make reads of `block` report failure until cleared.
    pub fn fail_reads_of(&self, block: BlockNum) {
        self.faults.lock().unwrap().fail_reads.push(block);
    }

    /// Make writes of `block` report failure until cleared.
    pub fn fail_writes_of(&self, block: BlockNum) {
        self.faults.lock().unwrap().fail_writes.push(block);
    }

    pub fn clear_failures(&self) {
        let mut faults = self.faults.lock().unwrap();
        faults.fail_reads.clear();
        faults.fail_writes.clear();
    }

    /// Copy of the stored (encrypted) contents of `block`.
    pub fn raw_block(&self, block: BlockNum) -> Vec<u8> {
        self.disk.lock().unwrap()[block as usize].clone()
    }

    /// Overwrite the stored contents of `block`, for tamper tests.
    pub fn corrupt_block(&self, block: BlockNum, byte: usize) {
        self.disk.lock().unwrap()[block as usize][byte] ^= 0x01;
    }
}

impl BlockDevice for MemDevice {
    fn config(&self) -> DeviceConfig {
        self.config
    }

    fn start_read(&mut self, block: BlockNum) {
        assert!(block < self.config.block_count);
        let failed = self.faults.lock().unwrap().fail_reads.contains(&block);
        let data = if failed {
            Vec::new()
        } else {
            self.disk.lock().unwrap()[block as usize].clone()
        };
        self.completions
            .lock()
            .unwrap()
            .push_back(IoCompletion::Read { block, data, failed });
    }

    fn start_write(&mut self, block: BlockNum, data: &[u8]) {
        assert!(block < self.config.block_count);
        assert_eq!(data.len(), self.config.block_size);
        let failed = self.faults.lock().unwrap().fail_writes.contains(&block);
        if !failed {
            self.disk.lock().unwrap()[block as usize].copy_from_slice(data);
        }
        self.completions
            .lock()
            .unwrap()
            .push_back(IoCompletion::Write { block, failed });
    }

    fn wait_for_io(&mut self) -> Option<IoCompletion> {
        self.completions.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig {
            block_count: 4,
            block_size: 64,
            block_num_size: 8,
            mac_size: 16,
            tamper_detecting: true,
        }
    }

    #[test]
    fn mem_device_round_trip() {
        let mut dev = MemDevice::new(config());
        dev.start_write(2, &[0xabu8; 64]);
        match dev.wait_for_io() {
            Some(IoCompletion::Write { block: 2, failed: false }) => {}
            other => panic!("unexpected completion {:?}", other),
        }
        dev.start_read(2);
        match dev.wait_for_io() {
            Some(IoCompletion::Read { block: 2, data, failed: false }) => {
                assert_eq!(data, vec![0xabu8; 64]);
            }
            other => panic!("unexpected completion {:?}", other),
        }
        assert!(dev.wait_for_io().is_none());
    }

    #[test]
    fn completions_in_issue_order() {
        let mut dev = MemDevice::new(config());
        dev.start_read(0);
        dev.start_read(1);
        let first = dev.wait_for_io().unwrap();
        let second = dev.wait_for_io().unwrap();
        match (first, second) {
            (IoCompletion::Read { block: 0, .. }, IoCompletion::Read { block: 1, .. }) => {}
            other => panic!("out of order: {:?}", other),
        }
    }

    #[test]
    fn injected_read_failure() {
        let mut dev = MemDevice::new(config());
        dev.fail_reads_of(3);
        dev.start_read(3);
        match dev.wait_for_io() {
            Some(IoCompletion::Read { failed: true, .. }) => {}
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn config_requires_full_mac_without_tamper_detection() {
        let mut cfg = config();
        cfg.tamper_detecting = false;
        cfg.mac_size = 2;
        assert!(cfg.validate().is_err());
        cfg.mac_size = 16;
        assert!(cfg.validate().is_ok());
    }
}
