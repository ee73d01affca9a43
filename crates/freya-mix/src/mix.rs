//! The macroblock transform.
//!
//! Two chained AES-128 passes over the 16-byte minis of each macroblock:
//! a forward pass (first mini to last) followed by a backward pass (last
//! mini to first). The forward pass makes mini `i` depend on minis
//! `0..=i`; the backward pass then folds the fully-diffused tail back
//! over the head, so every output mini depends on every input mini.
//!
//! Both passes chain like CBC: each mini is XORed with the previous
//! output before the block encryption, seeded with the IV. Inversion
//! undoes the backward pass first, then the forward pass.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rayon::prelude::*;

use crate::{MixError, Result, IV_SIZE, KEY_SIZE, MACRO_SIZE, MINI_SIZE};

fn check_args(data: &[u8], key: &[u8], iv: &[u8]) -> Result<()> {
    if data.len() % MACRO_SIZE != 0 {
        return Err(MixError::UnalignedBuffer { len: data.len() });
    }
    if key.len() != KEY_SIZE {
        return Err(MixError::BadKeyLength(key.len()));
    }
    if iv.len() != IV_SIZE {
        return Err(MixError::BadIvLength(iv.len()));
    }
    Ok(())
}

fn encrypt_macroblock(cipher: &Aes128, iv: &[u8], block: &mut [u8]) {
    debug_assert_eq!(block.len(), MACRO_SIZE);

    // Forward pass.
    let mut prev = [0u8; MINI_SIZE];
    prev.copy_from_slice(iv);
    for mini in block.chunks_exact_mut(MINI_SIZE) {
        for (b, p) in mini.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(mini));
        prev.copy_from_slice(mini);
    }

    // Backward pass.
    prev.copy_from_slice(iv);
    for mini in block.chunks_exact_mut(MINI_SIZE).rev() {
        for (b, p) in mini.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(mini));
        prev.copy_from_slice(mini);
    }
}

fn decrypt_macroblock(cipher: &Aes128, iv: &[u8], block: &mut [u8]) {
    debug_assert_eq!(block.len(), MACRO_SIZE);

    // Undo the backward pass. The chain value for mini `i` is the
    // ciphertext of mini `i + 1` (still intact while walking forward),
    // seeded with the IV at the last mini.
    let n = block.len() / MINI_SIZE;
    for i in 0..n {
        let mut prev = [0u8; MINI_SIZE];
        if i + 1 < n {
            prev.copy_from_slice(&block[(i + 1) * MINI_SIZE..(i + 2) * MINI_SIZE]);
        } else {
            prev.copy_from_slice(iv);
        }
        let mini = &mut block[i * MINI_SIZE..(i + 1) * MINI_SIZE];
        cipher.decrypt_block(GenericArray::from_mut_slice(mini));
        for (b, p) in mini.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
    }

    // Undo the forward pass, walking backward so the chain value (the
    // ciphertext of mini `i - 1`) is still intact.
    for i in (0..n).rev() {
        let mut prev = [0u8; MINI_SIZE];
        if i > 0 {
            prev.copy_from_slice(&block[(i - 1) * MINI_SIZE..i * MINI_SIZE]);
        } else {
            prev.copy_from_slice(iv);
        }
        let mini = &mut block[i * MINI_SIZE..(i + 1) * MINI_SIZE];
        cipher.decrypt_block(GenericArray::from_mut_slice(mini));
        for (b, p) in mini.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
    }
}

/// Encrypt `data` in place, one macroblock at a time.
///
/// `data` must be a multiple of [`MACRO_SIZE`](crate::MACRO_SIZE) bytes.
pub fn mix_encrypt(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<()> {
    check_args(data, key, iv)?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(MACRO_SIZE) {
        encrypt_macroblock(&cipher, iv, block);
    }
    Ok(())
}

/// Decrypt `data` in place, one macroblock at a time.
pub fn mix_decrypt(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<()> {
    check_args(data, key, iv)?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(MACRO_SIZE) {
        decrypt_macroblock(&cipher, iv, block);
    }
    Ok(())
}

/// Worker-pool variant of [`mix_encrypt`]: macroblocks are independent,
/// so they are fanned out over the rayon pool.
pub fn mix_encrypt_pool(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<()> {
    check_args(data, key, iv)?;
    data.par_chunks_exact_mut(MACRO_SIZE).for_each(|block| {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        encrypt_macroblock(&cipher, iv, block);
    });
    Ok(())
}

/// Worker-pool variant of [`mix_decrypt`].
pub fn mix_decrypt_pool(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<()> {
    check_args(data, key, iv)?;
    data.par_chunks_exact_mut(MACRO_SIZE).for_each(|block| {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        decrypt_macroblock(&cipher, iv, block);
    });
    Ok(())
}
