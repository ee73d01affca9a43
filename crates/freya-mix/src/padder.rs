//! Reversible padding to the macroblock size.
//!
//! Layout after padding: `data ++ zeros ++ trailer`, where the trailer is
//! a fixed-width big-endian count of the total pad bytes (zeros plus the
//! trailer itself). The padded length is always a positive multiple of
//! [`MACRO_SIZE`]. Both operations mutate the buffer in place; payloads
//! run to many megabytes and must not be reallocated per call.

use crate::{MixError, Result, MACRO_SIZE};

/// Width of the trailing pad-size field in bytes.
pub const PAD_INFO_SIZE: usize = 4;

/// Pad `data` in place to a multiple of the macroblock size.
///
/// An empty buffer pads to exactly one macroblock.
pub fn pad(data: &mut Vec<u8>) {
    let mut padsize = PAD_INFO_SIZE;
    let new_len = data.len() + padsize;
    if new_len % MACRO_SIZE != 0 {
        let zeros = MACRO_SIZE - (new_len % MACRO_SIZE);
        data.resize(data.len() + zeros, 0);
        padsize += zeros;
    }
    data.extend_from_slice(&(padsize as u32).to_be_bytes());
    debug_assert_eq!(data.len() % MACRO_SIZE, 0);
}

/// Remove the padding appended by [`pad`], in place.
pub fn unpad(data: &mut Vec<u8>) -> Result<()> {
    if data.len() < PAD_INFO_SIZE || data.len() % MACRO_SIZE != 0 {
        return Err(MixError::BadPadding {
            declared: 0,
            len: data.len(),
        });
    }
    let trailer = &data[data.len() - PAD_INFO_SIZE..];
    let padsize = u32::from_be_bytes(trailer.try_into().unwrap()) as usize;
    if padsize < PAD_INFO_SIZE || padsize > data.len() {
        return Err(MixError::BadPadding {
            declared: padsize,
            len: data.len(),
        });
    }
    data.truncate(data.len() - padsize);
    Ok(())
}
