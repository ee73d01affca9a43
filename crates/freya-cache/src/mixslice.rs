//! The file-level Mix&Slice codec.
//!
//! Encrypting a file pads the plaintext to whole macroblocks, mixes each
//! macroblock, and splits the ciphertext at the 1024-byte boundary: the
//! kept prefixes are concatenated into the local sidecar, the tails go
//! to the block store, one CID per macroblock. The kept KiB is the
//! policy-bearing fragment: destroy it and the remote tails are
//! permanently useless, while the tails alone reveal nothing.
//!
//! Macroblocks are independent, so both directions fan out over the
//! rayon pool. The sidecar is written only after every tail has been
//! stored, so a block-store failure never leaves a sidecar pointing at
//! CIDs that were never returned.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use freya_mix::{mix_decrypt, mix_encrypt, padder, MACRO_SIZE};
use freya_store::{BlockStore, Cid};

use crate::{CacheError, Result};

/// Bytes of each encrypted macroblock kept on local disk.
pub const SIZE_TO_KEEP: usize = 1024;

/// Encrypt `data` and persist it: kept prefixes to the `sidecar` path,
/// tails to `store`. Returns the ordered CID list, one per macroblock.
pub fn encrypt_file(
    store: &dyn BlockStore,
    mut data: Vec<u8>,
    sidecar: &Path,
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<Cid>> {
    padder::pad(&mut data);

    let pieces: Vec<(Vec<u8>, Cid)> = data
        .par_chunks_exact_mut(MACRO_SIZE)
        .map(|block| -> Result<(Vec<u8>, Cid)> {
            mix_encrypt(block, key, iv)?;
            let kept = block[..SIZE_TO_KEEP].to_vec();
            let cid = store.put(&block[SIZE_TO_KEEP..])?;
            Ok((kept, cid))
        })
        .collect::<Result<_>>()?;

    let mut kept_all = Vec::with_capacity(pieces.len() * SIZE_TO_KEEP);
    let mut cids = Vec::with_capacity(pieces.len());
    for (kept, cid) in pieces {
        kept_all.extend_from_slice(&kept);
        cids.push(cid);
    }

    // Atomic replace: a crash mid-flush must not tear the sidecar.
    let temp = sidecar.with_extension("tmp");
    let mut file = File::create(&temp)?;
    file.write_all(&kept_all)?;
    file.sync_all()?;
    fs::rename(&temp, sidecar)?;

    debug!(
        sidecar = %sidecar.display(),
        macroblocks = cids.len(),
        "encrypted file"
    );
    Ok(cids)
}

/// Decrypt the file persisted at `sidecar` + `cids` back to plaintext.
pub fn decrypt_file(
    store: &dyn BlockStore,
    sidecar: &Path,
    key: &[u8],
    iv: &[u8],
    cids: &[Cid],
) -> Result<Vec<u8>> {
    let kept = fs::read(sidecar)?;
    if kept.len() != cids.len() * SIZE_TO_KEEP {
        return Err(CacheError::Corruption {
            sidecar: kept.len() as u64,
            cids: cids.len(),
        });
    }

    let blocks: Vec<Vec<u8>> = cids
        .par_iter()
        .enumerate()
        .map(|(i, cid)| -> Result<Vec<u8>> {
            let tail = store.get(cid)?;
            let mut block = Vec::with_capacity(SIZE_TO_KEEP + tail.len());
            block.extend_from_slice(&kept[i * SIZE_TO_KEEP..(i + 1) * SIZE_TO_KEEP]);
            block.extend_from_slice(&tail);
            if block.len() != MACRO_SIZE {
                return Err(CacheError::Corruption {
                    sidecar: kept.len() as u64,
                    cids: cids.len(),
                });
            }
            mix_decrypt(&mut block, key, iv)?;
            Ok(block)
        })
        .collect::<Result<_>>()?;

    let mut data = blocks.concat();
    padder::unpad(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use freya_store::DiskBlockStore;
    use tempfile::tempdir;

    fn key_iv() -> (Vec<u8>, Vec<u8>) {
        ((0..16).collect(), (100..116).collect())
    }

    fn round_trip(len: usize) {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path().join("blocks")).unwrap();
        let sidecar = dir.path().join("sidecar");
        let (key, iv) = key_iv();

        let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        let cids = encrypt_file(&store, data.clone(), &sidecar, &key, &iv).unwrap();

        // Sidecar holds exactly one kept prefix per macroblock.
        let sidecar_len = fs::metadata(&sidecar).unwrap().len();
        assert_eq!(sidecar_len, (cids.len() * SIZE_TO_KEEP) as u64);

        let back = decrypt_file(&store, &sidecar, &key, &iv, &cids).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn round_trips_assorted_lengths() {
        for len in [0, 1, 5, 1024, MACRO_SIZE - 9, MACRO_SIZE, 2 * MACRO_SIZE + MACRO_SIZE / 2] {
            round_trip(len);
        }
    }

    #[test]
    fn empty_file_occupies_one_macroblock() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path().join("blocks")).unwrap();
        let sidecar = dir.path().join("sidecar");
        let (key, iv) = key_iv();

        let cids = encrypt_file(&store, Vec::new(), &sidecar, &key, &iv).unwrap();
        assert_eq!(cids.len(), 1);
        assert_eq!(
            fs::metadata(&sidecar).unwrap().len(),
            SIZE_TO_KEEP as u64
        );
    }

    #[test]
    fn sidecar_cid_count_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path().join("blocks")).unwrap();
        let sidecar = dir.path().join("sidecar");
        let (key, iv) = key_iv();

        let cids = encrypt_file(&store, vec![1, 2, 3], &sidecar, &key, &iv).unwrap();
        // Drop the last kept prefix.
        let kept = fs::read(&sidecar).unwrap();
        fs::write(&sidecar, &kept[..kept.len() - SIZE_TO_KEEP]).unwrap();

        assert!(matches!(
            decrypt_file(&store, &sidecar, &key, &iv, &cids),
            Err(CacheError::Corruption { .. })
        ));
    }

    #[test]
    fn missing_remote_block_fails_decrypt() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path().join("blocks")).unwrap();
        let sidecar = dir.path().join("sidecar");
        let (key, iv) = key_iv();

        let mut cids = encrypt_file(&store, vec![9; 10], &sidecar, &key, &iv).unwrap();
        cids[0] = Cid("0123456789abcdef".repeat(4));

        assert!(matches!(
            decrypt_file(&store, &sidecar, &key, &iv, &cids),
            Err(CacheError::Store(_))
        ));
    }

    #[test]
    fn encrypt_overwrites_previous_sidecar() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path().join("blocks")).unwrap();
        let sidecar = dir.path().join("sidecar");
        let (key, iv) = key_iv();

        let big = vec![1u8; 2 * MACRO_SIZE];
        encrypt_file(&store, big, &sidecar, &key, &iv).unwrap();

        let cids = encrypt_file(&store, vec![2u8; 4], &sidecar, &key, &iv).unwrap();
        assert_eq!(cids.len(), 1);
        assert_eq!(
            fs::metadata(&sidecar).unwrap().len(),
            SIZE_TO_KEEP as u64
        );
    }
}
