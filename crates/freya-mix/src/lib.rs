//! # freya-mix
//!
//! Macroblock mixing codec for FreyaFS.
//!
//! A macroblock is a fixed 256 KiB unit made of 16-byte minis. The codec
//! diffuses every input mini into every output mini, so withholding any
//! fragment of a ciphertext macroblock makes the rest undecryptable. This
//! is the property the kept-prefix split builds on: keep the first KiB
//! locally, disperse the rest, and destroying the local KiB revokes the
//! whole block.
//!
//! The transform is size-preserving and deterministic for a given
//! `(key, iv)` pair. Padding to the macroblock size is a separate,
//! reversible step (see [`padder`]).

mod mix;
pub mod padder;

pub use mix::{mix_decrypt, mix_decrypt_pool, mix_encrypt, mix_encrypt_pool};

use thiserror::Error;

/// Size of one macroblock in bytes (256 KiB).
pub const MACRO_SIZE: usize = 262_144;

/// Size of one mini in bytes (one AES block).
pub const MINI_SIZE: usize = 16;

/// Number of minis per macroblock.
pub const MINI_PER_BLOCK: usize = MACRO_SIZE / MINI_SIZE;

/// AES-128 key length in bytes.
pub const KEY_SIZE: usize = 16;

/// IV length in bytes.
pub const IV_SIZE: usize = 16;

/// Errors from the mixing codec and the padder.
#[derive(Error, Debug)]
pub enum MixError {
    #[error("buffer length {len} is not a multiple of the macroblock size")]
    UnalignedBuffer { len: usize },

    #[error("key must be {KEY_SIZE} bytes, got {0}")]
    BadKeyLength(usize),

    #[error("iv must be {IV_SIZE} bytes, got {0}")]
    BadIvLength(usize),

    #[error("padding trailer is corrupt (declared {declared} of {len} bytes)")]
    BadPadding { declared: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, MixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(MACRO_SIZE, MINI_SIZE * MINI_PER_BLOCK);
        assert_eq!(MINI_PER_BLOCK, 16_384);
    }
}
