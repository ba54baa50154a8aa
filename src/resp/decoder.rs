//! Resumable RESP2/RESP3 decoder.
//!
//! [`Decoder`] owns a growable buffer. Bytes are appended with
//! [`Decoder::feed`] in chunks of any size and complete top-level values are
//! pulled out with [`Decoder::try_take`]:
//!
//! - `Ok(Some(value))`: one complete value was consumed from the buffer,
//! - `Ok(None)`: more bytes are needed,
//! - `Err(Protocol(…))`: the stream is malformed. The decoder stays failed.
//!
//! Partially received aggregates live on an explicit frame stack and a bulk
//! header is remembered until its payload arrives, so nothing is re-parsed
//! when the next chunk comes in. Server error replies (`-ERR …`, `!…`) are
//! ordinary values here, never `Err`.

use bytes::{Buf, BytesMut};
use memchr::memchr;

use crate::error::{MuxredisError, Result};
use crate::resp::encoding::Encoding;
use crate::resp::types::RespValue;

/// Upper bound on buffered, not yet decoded bytes.
pub const DEFAULT_MAX_BUFFER: usize = 512 * 1024 * 1024;

/// Incremental RESP decoder with explicit resumable state.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    /// Bytes of the current line already searched for `\r`.
    scanned: usize,
    /// Bulk header consumed, payload not yet complete.
    pending: Option<Bulk>,
    /// Open aggregates, innermost last.
    stack: Vec<Frame>,
    encoding: Option<Encoding>,
    max_buffer: usize,
    failure: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Bulk {
    kind: BulkKind,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkKind {
    String,
    Error,
    Verbatim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Array,
    Set,
    Push,
    Map,
    Attribute,
}

#[derive(Debug)]
struct Frame {
    kind: Aggregate,
    remaining: usize,
    items: Vec<RespValue>,
}

enum Step {
    Value(RespValue),
    Open(Frame),
    NeedMore,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            scanned: 0,
            pending: None,
            stack: Vec::new(),
            encoding: None,
            max_buffer: DEFAULT_MAX_BUFFER,
            failure: None,
        }
    }

    /// Decode bulk strings to [`RespValue::Text`] with `encoding`. Leaves
    /// that are not valid in that encoding stay raw bytes.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The receive buffer, for transports that read straight into it.
    /// Only append to it.
    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed by a complete value.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// True when no partial value is held.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty() && self.stack.is_empty() && self.pending.is_none()
    }

    /// Take the next complete top-level value, if one is buffered.
    pub fn try_take(&mut self) -> Result<Option<RespValue>> {
        if let Some(reason) = &self.failure {
            return Err(MuxredisError::Protocol(reason.clone()));
        }
        match self.advance() {
            Ok(value) => Ok(value),
            Err(err) => {
                self.failure = Some(match &err {
                    MuxredisError::Protocol(msg) => msg.clone(),
                    other => other.to_string(),
                });
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<RespValue>> {
        loop {
            let value = match self.next_step()? {
                Step::Value(value) => value,
                Step::Open(frame) => {
                    self.stack.push(frame);
                    continue;
                }
                Step::NeedMore => {
                    if self.buf.len() > self.max_buffer {
                        return Err(protocol(format!(
                            "buffer exceeded {} bytes without a complete value",
                            self.max_buffer
                        )));
                    }
                    return Ok(None);
                }
            };
            if let Some(done) = self.complete(value)? {
                return Ok(Some(done));
            }
        }
    }

    /// Attach `value` to the innermost open aggregate, closing every frame
    /// that becomes full. Returns the top-level value once the stack empties.
    fn complete(&mut self, mut value: RespValue) -> Result<Option<RespValue>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(Some(value));
            };
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return Ok(None);
            }
            value = match self.stack.pop() {
                Some(frame) => frame.finish()?,
                None => return Ok(None),
            };
        }
    }

    fn next_step(&mut self) -> Result<Step> {
        if let Some(bulk) = self.pending {
            return self.take_bulk(bulk);
        }
        let Some(&tag) = self.buf.first() else {
            return Ok(Step::NeedMore);
        };
        if !is_type_byte(tag) {
            return Err(protocol(format!("unknown RESP type byte: 0x{tag:02x}")));
        }
        let Some(cr) = self.find_crlf()? else {
            return Ok(Step::NeedMore);
        };
        let line = self.buf.split_to(cr + 2);
        self.scanned = 0;
        let body = &line[1..cr];

        let value = match tag {
            b'+' => RespValue::SimpleString(self.line_text(body)),
            b'-' => RespValue::Error(lossy(body)),
            b':' => RespValue::Integer(parse_int(body)?),
            b'_' => {
                if !body.is_empty() {
                    return Err(protocol("null type not terminated by \\r\\n"));
                }
                RespValue::Null
            }
            b'#' => match body {
                b"t" => RespValue::Boolean(true),
                b"f" => RespValue::Boolean(false),
                other => {
                    return Err(protocol(format!(
                        "invalid boolean value: {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            b',' => RespValue::Double(parse_double(body)?),
            b'(' => RespValue::BigNumber(parse_big_number(body)?),
            b'$' | b'!' | b'=' => {
                let kind = match tag {
                    b'$' => BulkKind::String,
                    b'!' => BulkKind::Error,
                    _ => BulkKind::Verbatim,
                };
                let len = parse_int(body)?;
                if len == -1 && kind == BulkKind::String {
                    return Ok(Step::Value(RespValue::Null));
                }
                let len = usize::try_from(len)
                    .map_err(|_| protocol(format!("invalid bulk length: {len}")))?;
                return self.take_bulk(Bulk { kind, len });
            }
            _ => return open_aggregate(tag, parse_int(body)?),
        };
        Ok(Step::Value(value))
    }

    /// Locate the `\r\n` ending the current line. Returns the index of `\r`,
    /// or `None` after remembering how far the search got.
    fn find_crlf(&mut self) -> Result<Option<usize>> {
        let start = self.scanned.max(1);
        if start >= self.buf.len() {
            return Ok(None);
        }
        match memchr(b'\r', &self.buf[start..]) {
            Some(pos) => {
                let cr = start + pos;
                match self.buf.get(cr + 1) {
                    Some(b'\n') => Ok(Some(cr)),
                    Some(_) => Err(protocol("expected \\n after \\r")),
                    None => {
                        self.scanned = cr;
                        Ok(None)
                    }
                }
            }
            None => {
                self.scanned = self.buf.len();
                Ok(None)
            }
        }
    }

    fn take_bulk(&mut self, bulk: Bulk) -> Result<Step> {
        let need = bulk
            .len
            .checked_add(2)
            .ok_or_else(|| protocol("bulk length overflow"))?;
        if self.buf.len() < need {
            self.pending = Some(bulk);
            return Ok(Step::NeedMore);
        }
        self.pending = None;
        if &self.buf[bulk.len..need] != b"\r\n" {
            return Err(protocol("bulk string not terminated by \\r\\n"));
        }
        let data = self.buf.split_to(bulk.len).freeze();
        self.buf.advance(2);

        let value = match bulk.kind {
            BulkKind::String => match self.encoding {
                Some(encoding) => match encoding.decode(&data) {
                    Ok(text) => RespValue::Text(text),
                    Err(_) => RespValue::BulkString(data),
                },
                None => RespValue::BulkString(data),
            },
            BulkKind::Error => RespValue::BulkError(lossy(&data)),
            BulkKind::Verbatim => {
                if data.len() < 4 || data[3] != b':' {
                    return Err(protocol("verbatim string missing encoding prefix"));
                }
                RespValue::VerbatimString {
                    encoding: lossy(&data[..3]),
                    data: self.line_text(&data[4..]),
                }
            }
        };
        Ok(Step::Value(value))
    }

    /// Text of a status, error or verbatim leaf. Servers echo raw argument
    /// bytes in these, so undecodable bytes are replaced rather than fatal.
    fn line_text(&self, bytes: &[u8]) -> String {
        match self.encoding {
            Some(encoding) => encoding.decode(bytes).unwrap_or_else(|_| lossy(bytes)),
            None => lossy(bytes),
        }
    }
}

impl Frame {
    fn new(kind: Aggregate, remaining: usize) -> Self {
        Self {
            kind,
            remaining,
            // Never trust a length header for a large preallocation.
            items: Vec::with_capacity(remaining.min(1024)),
        }
    }

    fn finish(self) -> Result<RespValue> {
        let Frame { kind, mut items, .. } = self;
        Ok(match kind {
            Aggregate::Array => RespValue::Array(items),
            Aggregate::Set => RespValue::Set(items),
            Aggregate::Map => RespValue::Map(into_pairs(items)),
            Aggregate::Push => {
                let mut items = items.into_iter();
                let kind = match items.next() {
                    Some(RespValue::SimpleString(s)) | Some(RespValue::Text(s)) => s,
                    Some(RespValue::BulkString(b)) => utf8(&b, "push kind")?,
                    Some(other) => {
                        return Err(protocol(format!(
                            "push kind must be a string, got {}",
                            other.type_name()
                        )))
                    }
                    None => return Err(protocol("push message without kind")),
                };
                RespValue::Push {
                    kind,
                    data: items.collect(),
                }
            }
            Aggregate::Attribute => {
                let data = items
                    .pop()
                    .ok_or_else(|| protocol("attribute without data"))?;
                RespValue::Attribute {
                    data: Box::new(data),
                    attributes: into_pairs(items),
                }
            }
        })
    }
}

// ── Helpers ────────────────────────────────────────────────────────

#[inline]
fn is_type_byte(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b':' | b'$' | b'*' | b'_' | b'#' | b',' | b'(' | b'!' | b'=' | b'%'
            | b'~' | b'>' | b'|'
    )
}

fn protocol(msg: impl Into<String>) -> MuxredisError {
    MuxredisError::Protocol(msg.into())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| protocol(format!("invalid UTF-8 in {what}: {e}")))
}

fn into_pairs(items: Vec<RespValue>) -> Vec<(RespValue, RespValue)> {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        pairs.push((key, value));
    }
    pairs
}

fn open_aggregate(tag: u8, count: i64) -> Result<Step> {
    let kind = match tag {
        b'*' => Aggregate::Array,
        b'~' => Aggregate::Set,
        b'>' => Aggregate::Push,
        b'%' => Aggregate::Map,
        _ => Aggregate::Attribute,
    };
    if count == -1 && kind == Aggregate::Array {
        return Ok(Step::Value(RespValue::Null));
    }
    let count =
        usize::try_from(count).map_err(|_| protocol(format!("invalid aggregate length: {count}")))?;
    let remaining = match kind {
        Aggregate::Map => count.checked_mul(2),
        Aggregate::Attribute => count.checked_mul(2).and_then(|n| n.checked_add(1)),
        _ => Some(count),
    }
    .ok_or_else(|| protocol("aggregate length overflow"))?;

    if remaining == 0 {
        return match kind {
            Aggregate::Array => Ok(Step::Value(RespValue::Array(Vec::new()))),
            Aggregate::Set => Ok(Step::Value(RespValue::Set(Vec::new()))),
            Aggregate::Map => Ok(Step::Value(RespValue::Map(Vec::new()))),
            _ => Err(protocol(
                "push message must have at least one element (kind)",
            )),
        };
    }
    Ok(Step::Open(Frame::new(kind, remaining)))
}

/// Parse an integer from a byte slice (no allocations).
fn parse_int(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(protocol("empty integer"));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return Err(protocol("integer has no digits"));
    }

    // Accumulate as negative so i64::MIN parses without overflow.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(protocol(format!("invalid byte in integer: 0x{b:02x}")));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| protocol("integer overflow"))?;
    }
    if negative {
        Ok(n)
    } else {
        n.checked_neg().ok_or_else(|| protocol("integer overflow"))
    }
}

fn parse_double(bytes: &[u8]) -> Result<f64> {
    let s = utf8(bytes, "double")?;
    match s.as_str() {
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        _ => s
            .parse::<f64>()
            .map_err(|e| protocol(format!("invalid double: {e}"))),
    }
}

fn parse_big_number(bytes: &[u8]) -> Result<String> {
    let s = utf8(bytes, "big number")?;
    let digits = s.strip_prefix(['+', '-']).unwrap_or(&s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(protocol(format!("invalid big number: {s}")));
    }
    Ok(s)
}

// ── Tests ──────────────────────────────────────────────────────────
