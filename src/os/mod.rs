// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.

use aes::Aes128;
use ctr::cipher::{NewCipher, StreamCipher};
use hmac::{Hmac, Mac as _};
use rand::TryRngCore;
use sha2::Sha256;

use crate::{
    error::{Errno, Error},
    layers::crypto::{Iv, Key, Mac, MAC_SIZE},
    prelude::Result,
    util,
};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const AES_CTR_KEY_SIZE: usize = 16;

/// A random number generator backed by the OS entropy source.
pub(crate) struct Rng;

impl util::Rng for Rng {
    fn new(_seed: &[u8]) -> Self {
        Self
    }

    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        rand::rngs::OsRng
            .try_fill_bytes(dest)
            .map_err(|_| Error::with_msg(Errno::EncryptFailed, "os entropy source failed"))
    }
}

/// AES-128-CTR stream cipher.
///
/// Only the first 16 bytes of the 32-byte storage key feed the cipher; the
/// full key feeds the MAC.
#[derive(Debug, Default)]
pub(crate) struct Skcipher;

impl Skcipher {
    pub fn new() -> Self {
        Self
    }

    fn apply(&self, data: &mut [u8], key: &Key, iv: &Iv) -> Result<()> {
        let mut cipher = Aes128Ctr::new_from_slices(&key[..AES_CTR_KEY_SIZE], iv)
            .map_err(|_| Error::with_msg(Errno::EncryptFailed, "aes-128-ctr init failed"))?;
        cipher.apply_keystream(data);
        Ok(())
    }
}

impl util::Skcipher for Skcipher {
    type Key = Key;
    type Iv = Iv;

    fn encrypt(&self, data: &mut [u8], key: &Key, iv: &Iv) -> Result<()> {
        self.apply(data, key, iv)
    }

    fn decrypt(&self, data: &mut [u8], key: &Key, iv: &Iv) -> Result<()> {
        self.apply(data, key, iv)
    }
}

/// HMAC-SHA256 truncated to [`MAC_SIZE`] bytes.
#[derive(Debug, Default)]
pub(crate) struct HmacSha256Mac;

impl HmacSha256Mac {
    pub fn new() -> Self {
        Self
    }
}

impl util::MacAlgo for HmacSha256Mac {
    type Key = Key;
    type Mac = Mac;

    fn calculate(&self, data: &[u8], key: &Key) -> Result<Mac> {
        let mut hmac = HmacSha256::new_from_slice(&key[..])
            .map_err(|_| Error::with_msg(Errno::EncryptFailed, "hmac-sha256 init failed"))?;
        hmac.update(data);
        let tag = hmac.finalize().into_bytes();
        let mut mac = Mac::default();
        mac.copy_from_slice(&tag[..MAC_SIZE]);
        Ok(mac)
    }
}
