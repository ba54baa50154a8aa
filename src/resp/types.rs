use bytes::Bytes;

use crate::error::{MuxredisError, Result};
use crate::resp::encoding::Encoding;

/// RESP protocol value types (RESP2 + full RESP3).
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n  (RESP2 simple error)
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// A bulk string decoded with a text encoding.
    Text(String),
    /// *2\r\n…
    Array(Vec<RespValue>),
    /// $-1\r\n  or  *-1\r\n  (RESP2), or _\r\n (RESP3)
    Null,
    /// ,3.14\r\n (RESP3)
    Double(f64),
    /// #t\r\n or #f\r\n (RESP3)
    Boolean(bool),
    /// %N\r\n (RESP3 map)
    Map(Vec<(RespValue, RespValue)>),
    /// ~N\r\n (RESP3 set)
    Set(Vec<RespValue>),
    /// =15\r\ntxt:Some string\r\n (RESP3)
    VerbatimString { encoding: String, data: String },
    /// (3492890328409238509324850943850943825024385\r\n (RESP3)
    BigNumber(String),
    /// !21\r\nSYNTAX invalid syntax\r\n (RESP3 bulk error)
    BulkError(String),
    /// >N\r\n… (RESP3 push message)
    Push { kind: String, data: Vec<RespValue> },
    /// |N\r\n… (RESP3 attribute / out-of-band metadata)
    Attribute {
        data: Box<RespValue>,
        attributes: Vec<(RespValue, RespValue)>,
    },
}

// ── Convenience accessors ──────────────────────────────────────────

impl RespValue {
    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) | Self::Text(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            Self::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) | Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Take the payload of a string-like leaf as `Bytes`.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) | Self::Text(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    /// True for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == "OK")
    }

    /// Try to interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns true when this value represents null / nil.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the error message if this is an error value.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            Self::BulkError(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns true if this is a push message.
    pub fn is_push(&self) -> bool {
        matches!(self, Self::Push { .. })
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Text(_) => "text",
            Self::Array(_) => "array",
            Self::Null => "null",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::VerbatimString { .. } => "verbatim_string",
            Self::BigNumber(_) => "big_number",
            Self::BulkError(_) => "bulk_error",
            Self::Push { .. } => "push",
            Self::Attribute { .. } => "attribute",
        }
    }

    /// Turn an error reply into `Err`, pass every other value through.
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            Self::Error(msg) | Self::BulkError(msg) => Err(MuxredisError::reply(msg)),
            other => Ok(other),
        }
    }

    /// Decode every bulk string leaf with `encoding`, recursing into
    /// aggregates. Fails on the first leaf that is not valid text.
    pub fn decode_with(self, encoding: Encoding) -> Result<RespValue> {
        Ok(match self {
            Self::BulkString(b) => Self::Text(encoding.decode(&b)?),
            Self::Array(items) => Self::Array(decode_all(items, encoding)?),
            Self::Set(items) => Self::Set(decode_all(items, encoding)?),
            Self::Map(pairs) => Self::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok::<_, MuxredisError>((k.decode_with(encoding)?, v.decode_with(encoding)?)))
                    .collect::<Result<_>>()?,
            ),
            Self::Push { kind, data } => Self::Push {
                kind,
                data: decode_all(data, encoding)?,
            },
            Self::Attribute { data, attributes } => Self::Attribute {
                data: Box::new(data.decode_with(encoding)?),
                attributes,
            },
            other => other,
        })
    }
}

fn decode_all(items: Vec<RespValue>, encoding: Encoding) -> Result<Vec<RespValue>> {
    items.into_iter().map(|v| v.decode_with(encoding)).collect()
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &'static [u8]) -> RespValue {
        RespValue::BulkString(Bytes::from_static(s))
    }

    #[test]
    fn string_views() {
        assert_eq!(bulk(b"abc").as_str(), Some("abc"));
        assert_eq!(bulk(b"\xff").as_str(), None);
        assert_eq!(bulk(b"\xff").as_bytes(), Some(&b"\xff"[..]));
        assert_eq!(RespValue::Text("t".into()).as_bytes(), Some(&b"t"[..]));
        assert_eq!(RespValue::Integer(1).as_bytes(), None);
        assert_eq!(
            RespValue::SimpleString("OK".into()).into_bytes(),
            Some(Bytes::from_static(b"OK"))
        );
        assert_eq!(RespValue::Null.into_bytes(), None);
    }

    #[test]
    fn status_and_scalars() {
        assert!(RespValue::SimpleString("OK".into()).is_ok());
        assert!(!RespValue::SimpleString("QUEUED".into()).is_ok());
        assert!(!bulk(b"OK").is_ok());
        assert_eq!(RespValue::Integer(-3).as_int(), Some(-3));
        assert!(RespValue::Null.is_null());
        assert_eq!(
            RespValue::Array(vec![RespValue::Null]).into_array(),
            Some(vec![RespValue::Null])
        );
    }

    #[test]
    fn errors_become_err() {
        let err = RespValue::Error("WRONGTYPE bad".into()).into_result().unwrap_err();
        assert!(matches!(err, MuxredisError::Reply { .. }));
        assert!(RespValue::BulkError("ERR x".into()).into_result().is_err());
        assert_eq!(RespValue::Integer(1).into_result().unwrap(), RespValue::Integer(1));
        assert_eq!(RespValue::BulkError("ERR x".into()).as_error_msg(), Some("ERR x"));
    }

    #[test]
    fn decode_with_converts_nested_leaves() {
        let value = RespValue::Array(vec![
            bulk(b"caf\xc3\xa9"),
            RespValue::Integer(7),
            RespValue::Map(vec![(bulk(b"k"), bulk(b"v"))]),
            RespValue::Push {
                kind: "message".into(),
                data: vec![bulk(b"x")],
            },
        ]);
        assert_eq!(
            value.decode_with(Encoding::Utf8).unwrap(),
            RespValue::Array(vec![
                RespValue::Text("café".into()),
                RespValue::Integer(7),
                RespValue::Map(vec![(RespValue::Text("k".into()), RespValue::Text("v".into()))]),
                RespValue::Push {
                    kind: "message".into(),
                    data: vec![RespValue::Text("x".into())],
                },
            ])
        );
    }

    #[test]
    fn decode_with_reports_bad_leaf() {
        let value = RespValue::Array(vec![bulk(b"ok"), bulk(b"\xff")]);
        assert!(matches!(
            value.decode_with(Encoding::Utf8),
            Err(MuxredisError::Encoding(_))
        ));
        assert_eq!(
            bulk(b"\xff").decode_with(Encoding::Latin1).unwrap(),
            RespValue::Text("ÿ".into())
        );
    }

    #[test]
    fn type_names() {
        assert_eq!(RespValue::Null.type_name(), "null");
        assert_eq!(bulk(b"").type_name(), "bulk_string");
        assert_eq!(RespValue::Text(String::new()).type_name(), "text");
        assert!(RespValue::Push {
            kind: "pong".into(),
            data: vec![]
        }
        .is_push());
    }
}
