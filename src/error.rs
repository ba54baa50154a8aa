use std::io;
use std::sync::Arc;

use thiserror::Error;

// ── Error hierarchy ────────────────────────────────────────────────
//
//  MuxredisError
//  ├── Io                     transport failure (shared, cloneable)
//  ├── Protocol               malformed RESP data, fatal for the connection
//  ├── Reply                  server returned an error reply
//  │   └── kind: ReplyKind    ERR / WRONGTYPE / READONLY / NOAUTH / ...
//  ├── ConnectionClosed
//  │   └── ConnectionForcedClose
//  ├── PoolClosed
//  ├── WatchChanged
//  ├── ChannelClosed
//  ├── InvalidArgument / PubSubMode / Encoding
//  └── Timeout / Config

/// Structured server error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// NOAUTH Authentication required, or ERR invalid password
    Auth,
    /// ERR max number of clients reached
    MaxClients,
    /// EXECABORT Transaction discarded because of previous errors
    ExecAbort,
    /// Any other error prefix
    Other(String),
}

impl ReplyKind {
    /// Parse from a server error message (e.g. "WRONGTYPE Operation against…").
    pub fn from_error_msg(msg: &str) -> Self {
        if msg.starts_with("NOAUTH ") || msg.starts_with("ERR invalid password") {
            Self::Auth
        } else if msg.starts_with("ERR max number of clients reached") {
            Self::MaxClients
        } else if msg.starts_with("WRONGTYPE") {
            Self::WrongType
        } else if msg.starts_with("READONLY") {
            Self::ReadOnly
        } else if msg.starts_with("NOSCRIPT") {
            Self::NoScript
        } else if msg.starts_with("BUSY") {
            Self::Busy
        } else if msg.starts_with("LOADING") {
            Self::Loading
        } else if msg.starts_with("EXECABORT") {
            Self::ExecAbort
        } else if msg.starts_with("ERR") {
            Self::Err
        } else {
            let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
            Self::Other(prefix.to_string())
        }
    }
}

/// All error variants for muxredis.
///
/// Cloneable so one failure can be fanned out to every pending caller of a
/// connection.
#[derive(Debug, Clone, Error)]
pub enum MuxredisError {
    /// TCP / Unix socket / TLS level errors
    #[error("connection error: {0}")]
    Io(Arc<io::Error>),
    /// Malformed RESP data. Fatal: the connection is closed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server answered with an error reply.
    #[error("redis error: {message}")]
    Reply { kind: ReplyKind, message: String },
    #[error("connection closed")]
    ConnectionClosed,
    /// Closed locally through `close()` while work was pending.
    #[error("connection was closed forcibly")]
    ConnectionForcedClose,
    #[error("pool is closed")]
    PoolClosed,
    /// A WATCHed key changed and EXEC returned null.
    #[error("WATCH variable has changed")]
    WatchChanged,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection in SUBSCRIBE mode: {0}")]
    PubSubMode(String),
    /// Reply text could not be decoded with the requested encoding.
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("config error: {0}")]
    Config(String),
}

impl MuxredisError {
    /// Create a reply error from a raw error message, auto-parsing the kind.
    pub fn reply(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = ReplyKind::from_error_msg(&message);
        Self::Reply { kind, message }
    }

    /// The server error kind, when this is a reply error.
    pub fn reply_kind(&self) -> Option<&ReplyKind> {
        match self {
            Self::Reply { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Check if this is a READONLY reply (write against a replica).
    pub fn is_read_only(&self) -> bool {
        matches!(self.reply_kind(), Some(ReplyKind::ReadOnly))
    }

    /// True for both a remote close and a local forced close.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::ConnectionForcedClose)
    }
}

impl From<io::Error> for MuxredisError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, MuxredisError>;

// ── Tests ──────────────────────────────────────────────────────────
