//! Byte codec for the VCS wire format.
//!
//! Command words and outbound lengths are big-endian. Streaming headers and ES
//! container fields are "reversed", i.e. little-endian. Readers are bounds-checked
//! and return [`VcsError::Parse`] instead of panicking on short input.

use crate::error::{Result, VcsError};

fn field<const N: usize>(data: &[u8], offset: usize, what: &str) -> Result<[u8; N]> {
    let end = offset.checked_add(N).ok_or_else(|| VcsError::parse_error(what, "offset overflow"))?;
    if end > data.len() {
        return Err(VcsError::parse_error(
            what,
            format!("need {} bytes at offset {}, have {}", N, offset, data.len()),
        ));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..end]);
    Ok(out)
}

pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset).copied().ok_or_else(|| {
        VcsError::parse_error("u8 field", format!("offset {} beyond length {}", offset, data.len()))
    })
}

pub fn read_i32_be(data: &[u8], offset: usize) -> Result<i32> {
    field::<4>(data, offset, "i32 (big-endian)").map(i32::from_be_bytes)
}

pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    field::<4>(data, offset, "i32 (reversed)").map(i32::from_le_bytes)
}

pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    field::<2>(data, offset, "u16 (reversed)").map(u16::from_le_bytes)
}

pub fn read_i64_le(data: &[u8], offset: usize) -> Result<i64> {
    field::<8>(data, offset, "i64 (reversed)").map(i64::from_le_bytes)
}

/// Reads a length-prefixed string: big-endian `i32` length followed by UTF-8 bytes.
///
/// Returns the string and the offset just past it. A zero length is the empty string.
pub fn read_string(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let len = read_i32_be(data, offset)?;
    if len < 0 {
        return Err(VcsError::parse_error("string length", format!("negative length {}", len)));
    }
    let start = offset + 4;
    let end = start + len as usize;
    let bytes = data.get(start..end).ok_or_else(|| {
        VcsError::parse_error("string body", format!("need {} bytes at offset {}", len, start))
    })?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), end))
}

/// Builder for outbound command packets.
///
/// ```rust
/// use vcs_client::wire::CommandWriter;
///
/// let packet = CommandWriter::command(900).int(72).finish();
/// assert_eq!(packet, vec![0, 0, 3, 132, 0, 0, 0, 72]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    buf: Vec<u8>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    /// Starts a packet with its command word.
    pub fn command(code: i32) -> Self {
        Self::new().int(code)
    }

    pub fn int(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn byte(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    /// Appends a length-prefixed string. Empty strings are encoded as a zero length.
    pub fn string(mut self, value: &str) -> Self {
        self.buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn int_le(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn short_le(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn long_le(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn big_endian_ints_round_trip(value in any::<i32>()) {
            let bytes = CommandWriter::new().int(value).finish();
            prop_assert_eq!(read_i32_be(&bytes, 0).unwrap(), value);
        }

        #[test]
        fn reversed_ints_round_trip(value in any::<i32>(), short in any::<u16>(), long in any::<i64>()) {
            let bytes = CommandWriter::new().int_le(value).short_le(short).long_le(long).finish();
            prop_assert_eq!(read_i32_le(&bytes, 0).unwrap(), value);
            prop_assert_eq!(read_u16_le(&bytes, 4).unwrap(), short);
            prop_assert_eq!(read_i64_le(&bytes, 6).unwrap(), long);
        }

        #[test]
        fn strings_round_trip(value in ".{0,64}") {
            let bytes = CommandWriter::new().string(&value).int(7).finish();
            let (decoded, next) = read_string(&bytes, 0).unwrap();
            prop_assert_eq!(&decoded, &value);
            prop_assert_eq!(read_i32_be(&bytes, next).unwrap(), 7);
        }
    }

    #[test]
    fn boundary_values_keep_their_encoding() {
        for value in [0, -1, i32::MAX, i32::MIN] {
            let be = CommandWriter::new().int(value).finish();
            assert_eq!(be, value.to_be_bytes());
            assert_eq!(read_i32_be(&be, 0).unwrap(), value);
            let le = CommandWriter::new().int_le(value).finish();
            assert_eq!(read_i32_le(&le, 0).unwrap(), value);
        }
    }

    #[test]
    fn empty_string_is_zero_length() {
        assert_eq!(CommandWriter::new().string("").finish(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn short_input_is_a_parse_error() {
        let data = [1u8, 2, 3];
        assert!(matches!(read_i32_be(&data, 0), Err(VcsError::Parse { .. })));
        assert!(matches!(read_i64_le(&data, 0), Err(VcsError::Parse { .. })));
        assert!(matches!(read_u8(&data, 3), Err(VcsError::Parse { .. })));
        assert!(read_u16_le(&data, 1).is_ok());
        assert!(read_i32_le(&data, usize::MAX).is_err());
    }

    #[test]
    fn truncated_string_body_is_rejected() {
        let mut bytes = CommandWriter::new().string("hello").finish();
        bytes.truncate(6);
        assert!(read_string(&bytes, 0).is_err());
    }
}
