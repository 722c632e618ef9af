// SPDX-License-Identifier: MPL-2.0

//! An encrypted, tamper-evident transactional block storage engine.
//!
//! `sealfs` stores named files on an untrusted block device. Every block is
//! encrypted with AES-CTR and authenticated with a (possibly truncated)
//! HMAC-SHA256 that chains up through copy-on-write B+ trees to a versioned,
//! dual-slot superblock on a tamper-detecting device. Multiple optimistic
//! transactions can run at once; conflicts are detected at commit time.

#![deny(unsafe_code)]
#![allow(dead_code, unused_imports)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;

pub use self::{
    error::{Errno, Error},
    layers::{
        bio::{BlockDevice, BlockNum, DeviceConfig, IoCompletion, MemDevice},
        crypto::Key,
        fs::{CreateMode, FileId, Fs, TxId},
    },
};
