//! Byte codec: fixed-width little-endian fields at explicit offsets.
//!
//! Writers never grow the buffer; the caller sizes it to the exact encoded
//! length up front. Every function returns the offset just past the field.

/// Error reading or writing a fixed-width field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated buffer: need {needed} bytes at offset {offset}, {remaining} remain")]
    TruncatedBuffer {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("buffer overflow: {needed} bytes at offset {offset} exceed buffer of {len}")]
    Overflow {
        offset: usize,
        needed: usize,
        len: usize,
    },
    #[error("length {0} does not fit a 4-byte length field")]
    LengthOverflow(usize),
    #[error("value of {len} bytes does not fit a {width}-byte field")]
    FieldTooLong { len: usize, width: usize },
}

fn slot(buf: &mut [u8], offset: usize, needed: usize) -> Result<&mut [u8], CodecError> {
    let len = buf.len();
    match offset.checked_add(needed) {
        Some(end) if end <= len => Ok(&mut buf[offset..end]),
        _ => Err(CodecError::Overflow {
            offset,
            needed,
            len,
        }),
    }
}

fn take(buf: &[u8], offset: usize, needed: usize) -> Result<&[u8], CodecError> {
    let remaining = buf.len().saturating_sub(offset);
    if remaining < needed {
        return Err(CodecError::TruncatedBuffer {
            offset,
            needed,
            remaining,
        });
    }
    Ok(&buf[offset..offset + needed])
}

pub fn write_u8(buf: &mut [u8], offset: usize, value: u8) -> Result<usize, CodecError> {
    write_bytes(buf, offset, &[value])
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<usize, CodecError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<usize, CodecError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

/// Copy raw bytes verbatim.
pub fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<usize, CodecError> {
    slot(buf, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(offset + bytes.len())
}

/// Write `bytes` into a `width`-byte field, zero-filling the remainder.
pub fn write_padded(
    buf: &mut [u8],
    offset: usize,
    bytes: &[u8],
    width: usize,
) -> Result<usize, CodecError> {
    if bytes.len() > width {
        return Err(CodecError::FieldTooLong {
            len: bytes.len(),
            width,
        });
    }
    let field = slot(buf, offset, width)?;
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(offset + width)
}

pub fn read_u8(buf: &[u8], offset: usize) -> Result<(u8, usize), CodecError> {
    let b = take(buf, offset, 1)?;
    Ok((b[0], offset + 1))
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<(u16, usize), CodecError> {
    let (arr, next) = read_array::<2>(buf, offset)?;
    Ok((u16::from_le_bytes(arr), next))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<(u32, usize), CodecError> {
    let (arr, next) = read_array::<4>(buf, offset)?;
    Ok((u32::from_le_bytes(arr), next))
}

/// Read a fixed-size array.
pub fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<([u8; N], usize), CodecError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, offset, N)?);
    Ok((out, offset + N))
}

/// Borrow `len` bytes starting at `offset`.
pub fn read_bytes(buf: &[u8], offset: usize, len: usize) -> Result<(&[u8], usize), CodecError> {
    let b = take(buf, offset, len)?;
    Ok((b, offset + len))
}

/// Read a zero-padded `width`-byte field, truncated at the first zero byte.
pub fn read_padded(buf: &[u8], offset: usize, width: usize) -> Result<(&[u8], usize), CodecError> {
    let (field, next) = read_bytes(buf, offset, width)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    Ok((&field[..end], next))
}
