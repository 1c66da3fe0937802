//! Pair-wise run-length coding of alpha planes: each `(value, count)` pair expands
//! to `count` copies of `value`. A trailing odd byte is ignored.

use crate::error::{Result, VcsError};

const RLE_TAG: i32 = 2;

/// Expands `src` into `dst`, returning the number of bytes written.
pub fn decode(dst: &mut [u8], src: &[u8]) -> Result<usize> {
    let plane = dst.len();
    let mut written = 0usize;
    for pair in src.chunks_exact(2) {
        let (value, count) = (pair[0], pair[1] as usize);
        let end = written + count;
        let run = dst.get_mut(written..end).ok_or_else(|| {
            VcsError::decompression_error(
                RLE_TAG,
                format!("run of {} at {} overflows {} byte plane", count, written, plane),
            )
        })?;
        run.fill(value);
        written = end;
    }
    Ok(written)
}

/// Run-length encodes `src` with runs of at most 255.
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 4 + 2);
    let mut iter = src.iter().copied().peekable();
    while let Some(value) = iter.next() {
        let mut count = 1u8;
        while count < u8::MAX && iter.peek() == Some(&value) {
            iter.next();
            count += 1;
        }
        out.push(value);
        out.push(count);
    }
    out
}
