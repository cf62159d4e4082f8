use bytes::{BufMut, BytesMut};
use thiserror::Error;

const TERMINATOR: &[u8] = b"\r\n";
/// Same limit as Redis' default `proto-max-bulk-len`.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// More bytes are needed before the frame can be decoded.
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),
    #[error("invalid RESP tag {0:#04x}")]
    UnknownTag(u8),
    #[error("arrays nested too deeply")]
    TooDeep,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RespValue<'data> {
    SimpleString(&'data str),
    SimpleError(&'data str),
    Integer(i64),
    OwnedBulkString(String),
    BulkString(&'data str),
    NullBulkString,
    Array(Vec<RespValue<'data>>),
    NullArray,
}

impl<'data> RespValue<'data> {
    fn tag(&self) -> u8 {
        match self {
            RespValue::SimpleString(_) => b'+',
            RespValue::SimpleError(_) => b'-',
            RespValue::Integer(_) => b':',
            RespValue::OwnedBulkString(_) | RespValue::BulkString(_) => b'$',
            RespValue::NullBulkString => b'$',
            RespValue::Array(_) | RespValue::NullArray => b'*',
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            RespValue::SimpleString(s) | RespValue::SimpleError(s) => {
                buf.put(s.as_bytes());
            }
            RespValue::Integer(n) => {
                buf.put(n.to_string().as_bytes());
            }
            RespValue::OwnedBulkString(s) => put_bulk(buf, s),
            RespValue::BulkString(s) => put_bulk(buf, s),
            RespValue::NullBulkString | RespValue::NullArray => {
                buf.put(&b"-1"[..]);
            }
            RespValue::Array(elements) => {
                buf.put(elements.len().to_string().as_bytes());
                buf.put(TERMINATOR);
                for e in elements.iter() {
                    e.serialize(buf);
                }
                return;
            }
        }
        buf.put(TERMINATOR);
    }

    /// Decode one value from the front of `data`, returning it together with
    /// the bytes that follow it.
    pub fn deserialize(data: &'data [u8]) -> Result<(Self, &'data [u8]), FrameError> {
        Self::deserialize_nested(data, 0)
    }

    fn deserialize_nested(
        data: &'data [u8],
        depth: usize,
    ) -> Result<(Self, &'data [u8]), FrameError> {
        let Some(&tag) = data.first() else {
            return Err(FrameError::Incomplete);
        };
        let terminator_index = find_terminator(data).ok_or(FrameError::Incomplete)?;
        let header = &data[1..terminator_index];
        let rest = &data[terminator_index + 2..];

        match tag {
            b'+' => {
                // Simple string: "+OK\r\n"
                let s = std::str::from_utf8(header).map_err(|_| FrameError::Utf8("simple string"))?;
                Ok((RespValue::SimpleString(s), rest))
            }
            b'-' => {
                // Simple error: "-ERR message\r\n"
                let s = std::str::from_utf8(header).map_err(|_| FrameError::Utf8("simple error"))?;
                Ok((RespValue::SimpleError(s), rest))
            }
            b':' => {
                // Integer: ":[<+|->]<value>\r\n"
                let n = std::str::from_utf8(header)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(FrameError::Invalid("integer"))?;
                Ok((RespValue::Integer(n), rest))
            }
            b'$' => {
                // Bulk string: "$<length>\r\n<data>\r\n"
                if header == b"-1" {
                    return Ok((RespValue::NullBulkString, rest));
                }
                let len = parse_length(header, "bulk string length")?;
                if len > MAX_BULK_LEN {
                    return Err(FrameError::Invalid("bulk string length"));
                }
                let end = len + TERMINATOR.len();
                let Some(body) = rest.get(..end) else {
                    return Err(FrameError::Incomplete);
                };
                if &body[len..] != TERMINATOR {
                    return Err(FrameError::Invalid("bulk string terminator"));
                }
                let s = std::str::from_utf8(&body[..len])
                    .map_err(|_| FrameError::Utf8("bulk string"))?;
                Ok((RespValue::BulkString(s), &rest[end..]))
            }
            b'*' => {
                // Array: "*<number-of-elements>\r\n<element-1>...<element-n>"
                if header == b"-1" {
                    return Ok((RespValue::NullArray, rest));
                }
                if depth >= MAX_DEPTH {
                    return Err(FrameError::TooDeep);
                }
                let num_elements = parse_length(header, "array length")?;
                let mut rest = rest;
                let mut elements = Vec::with_capacity(num_elements.min(64));
                for _ in 0..num_elements {
                    let (element, remaining) = RespValue::deserialize_nested(rest, depth + 1)?;
                    elements.push(element);
                    rest = remaining;
                }
                Ok((RespValue::Array(elements), rest))
            }
            tag => Err(FrameError::UnknownTag(tag)),
        }
    }
}

fn put_bulk(buf: &mut BytesMut, s: &str) {
    buf.put(s.len().to_string().as_bytes());
    buf.put(TERMINATOR);
    buf.put(s.as_bytes());
}

fn parse_length(digits: &[u8], what: &'static str) -> Result<usize, FrameError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(FrameError::Invalid(what))
}

/// Find `Some(index)` of the first occurence of b'\r\n' in the slice,
/// or `None` if the slice doesn't contain a terminator.
fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
}
