// SPDX-License-Identifier: MPL-2.0

//! The layer of crypto primitives.
//!
//! Every payload block on disk is `IV(16) || ciphertext`. The MAC of a block
//! is computed over the full ciphertext including the embedded IV, so a
//! block's authenticity and its freshness (through the parent chain up to
//! the superblock) are verified together.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::{
    os,
    prelude::*,
    util::{self, bit_mask, MacAlgo as _, Rng as _, Skcipher as _},
};

/// Number of bytes in an initialization vector.
pub const IV_SIZE: usize = 16;
/// Number of bytes in a full authentication tag.
pub const MAC_SIZE: usize = 16;
/// Number of bytes in a storage key.
pub const KEY_SIZE: usize = 32;

/// A macro to define the fixed byte-array types used by the crypto layer.
macro_rules! new_byte_array_type {
    ($(#[$attr:meta])* $name:ident, $n:expr) => {
        $(#[$attr])*
        #[repr(C)]
        #[derive(Copy, Clone, Debug, Default)]
        pub struct $name([u8; $n]);

        impl core::ops::Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                self.0.as_slice()
            }
        }

        impl core::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                self.0.as_mut_slice()
            }
        }

        impl From<[u8; $n]> for $name {
            fn from(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }
        }

        impl util::RandomInit for $name {
            fn random() -> Result<Self> {
                use crate::util::Rng;

                let mut result = Self::default();
                let rng = os::Rng::new(&[]);
                rng.fill_bytes(&mut result)?;
                Ok(result)
            }
        }
    };
}

new_byte_array_type!(
    /// A symmetric storage key. Lives as long as the mounted filesystem.
    Key,
    KEY_SIZE
);
new_byte_array_type!(
    /// A per-write random initialization vector.
    Iv,
    IV_SIZE
);
new_byte_array_type!(
    /// A (full-width) authentication tag.
    Mac,
    MAC_SIZE
);

/// Encrypt `data` in place using AES-128-CTR.
pub(crate) fn encrypt(key: &Key, data: &mut [u8], iv: &Iv) -> Result<()> {
    os::Skcipher::new().encrypt(data, key, iv)
}

/// Decrypt `data` in place using AES-128-CTR.
pub(crate) fn decrypt(key: &Key, data: &mut [u8], iv: &Iv) -> Result<()> {
    os::Skcipher::new().decrypt(data, key, iv)
}

/// Compute the HMAC-SHA256 tag of `data`, truncated to [`MAC_SIZE`] bytes.
pub(crate) fn calculate_mac(key: &Key, data: &[u8]) -> Result<Mac> {
    os::HmacSha256Mac::new().calculate(data, key)
}

/// Generate a random IV.
pub(crate) fn generate_iv() -> Result<Iv> {
    use crate::util::RandomInit;
    Iv::random()
}

/// Compare two authentication tags in constant time.
pub(crate) fn mac_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Calculate a 64-bit hash for a string.
///
/// Returns the low 8 bytes of the SHA-1 hash as a little-endian value.
pub(crate) fn str_hash(s: &str) -> u64 {
    let digest = Sha1::digest(s.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Convert a path string to a non-zero B+ tree key that fits in
/// `block_num_size` bytes.
pub(crate) fn path_hash(block_num_size: usize, path: &str) -> u64 {
    let hash = str_hash(path) & bit_mask(block_num_size * 8);
    if hash == 0 {
        // 0 key is not supported by the block tree
        1
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = Key::from([7u8; KEY_SIZE]);
        let iv = Iv::from([3u8; IV_SIZE]);
        let plain = b"neither block nor cipher aligned".to_vec();
        let mut data = plain.clone();

        encrypt(&key, &mut data, &iv).unwrap();
        assert_ne!(data, plain);
        decrypt(&key, &mut data, &iv).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn unaligned_length_supported() {
        // CTR mode must handle lengths that are not multiples of 16.
        let key = Key::from([1u8; KEY_SIZE]);
        let iv = Iv::from([2u8; IV_SIZE]);
        let mut data = vec![0x55u8; 33];
        encrypt(&key, &mut data, &iv).unwrap();
        decrypt(&key, &mut data, &iv).unwrap();
        assert_eq!(data, vec![0x55u8; 33]);
    }

    #[test]
    fn mac_depends_on_key_and_data() {
        let key_a = Key::from([0u8; KEY_SIZE]);
        let key_b = Key::from([1u8; KEY_SIZE]);
        let mac_a = calculate_mac(&key_a, b"data").unwrap();
        let mac_b = calculate_mac(&key_b, b"data").unwrap();
        let mac_c = calculate_mac(&key_a, b"datb").unwrap();
        assert!(mac_eq(&mac_a, &calculate_mac(&key_a, b"data").unwrap()));
        assert!(!mac_eq(&mac_a, &mac_b));
        assert!(!mac_eq(&mac_a, &mac_c));
    }

    #[test]
    fn path_hash_masked_and_non_zero() {
        let h = path_hash(2, "some-file");
        assert!(h != 0);
        assert!(h <= 0xffff);
        // The full-width hash is the masked prefix of str_hash.
        assert_eq!(path_hash(8, "some-file"), str_hash("some-file"));
    }

    #[test]
    fn generated_ivs_differ() {
        let a = generate_iv().unwrap();
        let b = generate_iv().unwrap();
        assert_ne!(&a[..], &b[..]);
    }
}
