//! Trait seam between archive readers and entry ciphers

use std::fmt;

use crate::error::CryptoError;

/// Position-addressable cipher applied to archive entry contents.
///
/// Implementations must be pure functions of `(hash, offset, bytes)` so
/// that any sub-range of an entry can be processed independently, provided
/// `offset` is the true logical offset of `buf[0]` within the entry.
pub trait EntryCipher: Send + Sync + fmt::Debug {
    /// Decrypt `buf` in place.
    fn decrypt(&self, hash: u32, offset: u64, buf: &mut [u8]) -> Result<(), CryptoError>;

    /// Encrypt `buf` in place.
    ///
    /// The default assumes a self-inverse cipher.
    fn encrypt(&self, hash: u32, offset: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.decrypt(hash, offset, buf)
    }

    /// Decrypt a single byte at `offset`.
    fn decrypt_byte(&self, hash: u32, offset: u64, value: u8) -> Result<u8, CryptoError> {
        let mut buf = [value];
        self.decrypt(hash, offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Whether `startup.tjs` is stored unencrypted
    fn startup_tjs_not_encrypted(&self) -> bool {
        false
    }

    /// Whether index names carry `dir/../` obfuscation
    fn obfuscated_index(&self) -> bool {
        false
    }
}
