// SPDX-License-Identifier: MPL-2.0

use core::ops::Deref;

use crate::prelude::Result;

/// Random initialization for Key, Iv and Mac.
pub(crate) trait RandomInit: Default {
    fn random() -> Result<Self>;
}

/// Symmetric key cipher algorithm.
pub(crate) trait Skcipher {
    type Key: Deref<Target = [u8]>;
    type Iv: Deref<Target = [u8]>;

    /// Encrypt `data` in place with a secret `Key` and initialization
    /// vector `Iv`. `data` need not be cipher-block aligned.
    fn encrypt(&self, data: &mut [u8], key: &Self::Key, iv: &Self::Iv) -> Result<()>;

    /// Decrypt `data` in place with a secret `Key` and initialization
    /// vector `Iv`.
    fn decrypt(&self, data: &mut [u8], key: &Self::Key, iv: &Self::Iv) -> Result<()>;
}

/// Keyed message authentication algorithm.
pub(crate) trait MacAlgo {
    type Key: Deref<Target = [u8]>;
    type Mac: Deref<Target = [u8]>;

    /// Compute the authentication tag of `data` under `key`.
    fn calculate(&self, data: &[u8], key: &Self::Key) -> Result<Self::Mac>;
}

/// Random number generator.
pub(crate) trait Rng {
    /// Create an instance, with `seed` to provide secure entropy.
    fn new(seed: &[u8]) -> Self;

    /// Fill `dest` with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;
}
