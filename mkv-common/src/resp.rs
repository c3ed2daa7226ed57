//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands/replies and incrementally parse frames out of a
//! socket read buffer, for both the client driver and the ephemeral server.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: A partial frame returns `Ok(None)` and leaves the
//!    buffer untouched; the caller reads more bytes and retries.
//! 2. **Buffer Reuse**: Callers own the `BytesMut` read buffers; complete
//!    frames are consumed from the front and the allocation is reused.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Bounded**: Array and bulk lengths are capped to reject hostile peers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MkvError, MkvResult};

/// Largest bulk payload accepted (512 MiB, the Redis proto-max-bulk-len).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest array accepted in a single frame.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1024 * 1024;

/// RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(String),
    /// -ERR ... responses.
    Error(String),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Bytes>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Bulk string from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    /// Array of values.
    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    /// Short type name used in error messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "simple",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Bulk(_) => "bulk",
            RespValue::Array(_) => "array",
        }
    }

    /// Returns the payload of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(Some(data)) => Some(data),
            RespValue::Simple(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Serializes this value onto `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            RespValue::Simple(text) => {
                out.put_u8(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.put_u8(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(value) => {
                out.put_u8(b':');
                push_i64(out, *value);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(data)) => {
                out.put_u8(b'$');
                push_i64(out, data.len() as i64);
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                out.put_u8(b'*');
                push_i64(out, items.len() as i64);
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// Encodes a RESP2 array-of-bulk-strings command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_i64(out, args.len() as i64);
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_i64(out, arg.len() as i64);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Incremental RESP2 frame decoder.
#[derive(Debug, Clone, Copy)]
pub struct RespDecoder {
    max_bulk_len: usize,
    max_array_len: usize,
}

impl Default for RespDecoder {
    fn default() -> Self {
        RespDecoder {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

impl RespDecoder {
    /// Creates a decoder with custom length limits.
    pub fn with_limits(max_bulk_len: usize, max_array_len: usize) -> Self {
        RespDecoder {
            max_bulk_len,
            max_array_len,
        }
    }

    /// Splits one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only a partial frame; the buffer is
    /// not modified in that case.
    pub fn decode(&self, buf: &mut BytesMut) -> MkvResult<Option<RespValue>> {
        match self.parse(&buf[..], 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn parse(&self, data: &[u8], pos: usize) -> MkvResult<Option<(RespValue, usize)>> {
        let Some((line, next)) = read_line(data, pos)? else {
            return Ok(None);
        };
        let Some((&tag, body)) = line.split_first() else {
            return Err(MkvError::Protocol("empty frame header"));
        };

        match tag {
            b'+' => Ok(Some((RespValue::Simple(utf8(body)?), next))),
            b'-' => Ok(Some((RespValue::Error(utf8(body)?), next))),
            b':' => Ok(Some((RespValue::Integer(parse_i64(body)?), next))),
            b'$' => self.parse_bulk(data, parse_i64(body)?, next),
            b'*' => self.parse_array(data, parse_i64(body)?, next),
            _ => Err(MkvError::Protocol("unknown frame type")),
        }
    }

    fn parse_bulk(&self, data: &[u8], len: i64, pos: usize) -> MkvResult<Option<(RespValue, usize)>> {
        if len < 0 {
            return Ok(Some((RespValue::Bulk(None), pos)));
        }
        let len = len as usize;
        if len > self.max_bulk_len {
            return Err(MkvError::Protocol("bulk string too long"));
        }
        let end = pos + len;
        if data.len() < end + 2 {
            return Ok(None);
        }
        if &data[end..end + 2] != b"\r\n" {
            return Err(MkvError::Protocol("missing bulk terminator"));
        }
        let payload = Bytes::copy_from_slice(&data[pos..end]);
        Ok(Some((RespValue::Bulk(Some(payload)), end + 2)))
    }

    fn parse_array(&self, data: &[u8], len: i64, pos: usize) -> MkvResult<Option<(RespValue, usize)>> {
        if len < 0 {
            return Ok(Some((RespValue::Array(None), pos)));
        }
        let len = len as usize;
        if len > self.max_array_len {
            return Err(MkvError::Protocol("array too long"));
        }

        let mut items = Vec::with_capacity(len.min(64));
        let mut cursor = pos;
        for _ in 0..len {
            match self.parse(data, cursor)? {
                Some((item, next)) => {
                    items.push(item);
                    cursor = next;
                }
                None => return Ok(None),
            }
        }
        Ok(Some((RespValue::Array(Some(items)), cursor)))
    }
}

fn read_line(data: &[u8], pos: usize) -> MkvResult<Option<(&[u8], usize)>> {
    let rest = &data[pos..];
    let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if newline == 0 || rest[newline - 1] != b'\r' {
        return Err(MkvError::Protocol("line not terminated by CRLF"));
    }
    Ok(Some((&rest[..newline - 1], pos + newline + 1)))
}

fn utf8(data: &[u8]) -> MkvResult<String> {
    String::from_utf8(data.to_vec()).map_err(|_| MkvError::Protocol("invalid utf-8 in status line"))
}

fn parse_i64(data: &[u8]) -> MkvResult<i64> {
    if data.is_empty() {
        return Err(MkvError::Protocol("empty integer"));
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(MkvError::Protocol("empty integer"));
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(MkvError::Protocol("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_i64(out: &mut BytesMut, value: i64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut rest = value.unsigned_abs();
    if rest == 0 {
        buf[0] = b'0';
        len = 1;
    }
    while rest > 0 {
        buf[len] = b'0' + (rest % 10) as u8;
        rest /= 10;
        len += 1;
    }
    if value < 0 {
        out.put_u8(b'-');
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
