// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "1-crypto/mod.rs"]
pub mod crypto;
#[path = "2-cache/mod.rs"]
pub mod cache;
#[path = "3-tree/mod.rs"]
pub mod tree;
#[path = "4-alloc/mod.rs"]
pub mod alloc;
#[path = "5-fs/mod.rs"]
pub mod fs;
