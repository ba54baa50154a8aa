//! RESP command serializer.
//!
//! Encodes command arguments into the RESP bulk string array wire format:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`

use bytes::Bytes;
use itoa::Buffer;

use crate::error::{MuxredisError, Result};

/// One command argument.
///
/// Every variant is sent as a binary-safe bulk string. `Nil` exists so that
/// `Option::None` can be passed through generic code and rejected at encode
/// time instead of being silently dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Nil,
}

impl Arg {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Textual form, when the argument is text or a number.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Bytes(b) => std::str::from_utf8(b).ok().map(str::to_owned),
            Self::Int(i) => Some(i.to_string()),
            Self::UInt(u) => Some(u.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Nil => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(b: &[u8; N]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<&Bytes> for Arg {
    fn from(b: &Bytes) -> Self {
        Self::Bytes(b.clone())
    }
}

macro_rules! arg_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Arg {
            fn from(n: $t) -> Self {
                Self::Int(n as i64)
            }
        }
    )*};
}

macro_rules! arg_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Arg {
            fn from(n: $t) -> Self {
                Self::UInt(n as u64)
            }
        }
    )*};
}

arg_from_signed!(i8, i16, i32, i64, isize);
arg_from_unsigned!(u8, u16, u32, u64, usize);

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<f32> for Arg {
    fn from(f: f32) -> Self {
        Self::Float(f as f64)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

/// Append `name` followed by `args` to `out` as one RESP command.
///
/// Nothing is written when an argument is [`Arg::Nil`].
pub fn encode_args(name: &[u8], args: &[Arg], out: &mut Vec<u8>) -> Result<()> {
    if args.iter().any(Arg::is_nil) {
        return Err(MuxredisError::InvalidArgument(
            "command arguments must not be nil".into(),
        ));
    }

    let mut itoa_buf = Buffer::new();
    let mut num_buf = Buffer::new();
    out.reserve(16 + name.len() + args.len() * 16);
    write_header(out, b'*', args.len() + 1, &mut itoa_buf);
    write_bulk(out, name, &mut itoa_buf);
    for arg in args {
        match arg {
            Arg::Bytes(b) => write_bulk(out, b, &mut itoa_buf),
            Arg::Str(s) => write_bulk(out, s.as_bytes(), &mut itoa_buf),
            Arg::Int(i) => write_bulk(out, num_buf.format(*i).as_bytes(), &mut itoa_buf),
            Arg::UInt(u) => write_bulk(out, num_buf.format(*u).as_bytes(), &mut itoa_buf),
            Arg::Float(f) => write_bulk(out, f.to_string().as_bytes(), &mut itoa_buf),
            Arg::Nil => {}
        }
    }
    Ok(())
}

#[inline]
fn write_header(buf: &mut Vec<u8>, tag: u8, len: usize, itoa_buf: &mut Buffer) {
    buf.push(tag);
    buf.extend_from_slice(itoa_buf.format(len).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn write_bulk(buf: &mut Vec<u8>, data: &[u8], itoa_buf: &mut Buffer) {
    write_header(buf, b'$', data.len(), itoa_buf);
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

// ── Tests ──────────────────────────────────────────────────────────
