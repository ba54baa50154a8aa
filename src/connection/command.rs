use std::sync::Arc;

use crate::error::{MuxredisError, Result};
use crate::pubsub::Subscription;
use crate::resp::encoding::Encoding;
use crate::resp::types::RespValue;
use crate::resp::writer::{encode_args, Arg};

/// How the reply of a command is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyEncoding {
    /// Use the connection's default encoding.
    #[default]
    Inherit,
    /// Leave bulk strings as bytes.
    Raw,
    Text(Encoding),
}

impl ReplyEncoding {
    pub(crate) fn resolve(self, default: Option<Encoding>) -> Option<Encoding> {
        match self {
            Self::Inherit => default,
            Self::Raw => None,
            Self::Text(encoding) => Some(encoding),
        }
    }
}

/// A command ready to be sent.
///
/// ```ignore
/// let set = Command::new("set").arg("key").arg(42);
/// let get = cmd!("GET", "key").raw();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
    encoding: ReplyEncoding,
}

impl Command {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_ascii_uppercase(),
            args: Vec::new(),
            encoding: ReplyEncoding::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn push_arg(&mut self, arg: impl Into<Arg>) {
        self.args.push(arg.into());
    }

    /// Decode the reply with `encoding` instead of the connection default.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = ReplyEncoding::Text(encoding);
        self
    }

    /// Keep the reply as raw bytes.
    pub fn raw(mut self) -> Self {
        self.encoding = ReplyEncoding::Raw;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    pub fn reply_encoding(&self) -> ReplyEncoding {
        self.encoding
    }

    /// Append the wire form to `out`. Nothing is appended on error.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.name.is_empty() {
            return Err(MuxredisError::InvalidArgument(
                "command name must not be empty".into(),
            ));
        }
        encode_args(self.name.as_bytes(), &self.args, out)
    }
}

/// Build a [`Command`] from a name and arguments.
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {
        $crate::connection::Command::new($name)$(.arg($arg))*
    };
}

/// Resolved reply of one command.
#[derive(Debug, Clone)]
pub enum Response {
    Value(RespValue),
    /// EXEC result: one entry per command queued in the transaction.
    Exec(Vec<Result<RespValue>>),
}

impl Response {
    pub fn into_value(self) -> Option<RespValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Exec(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&RespValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Exec(_) => None,
        }
    }

    pub fn into_exec(self) -> Option<Vec<Result<RespValue>>> {
        match self {
            Self::Exec(items) => Some(items),
            Self::Value(_) => None,
        }
    }
}

/// Post-processing attached to a waiter, picked from the command name.
#[derive(Debug, Clone)]
pub(crate) enum Callback {
    Plain,
    Select(i64),
    Multi,
    Exec,
    Discard,
    PubSub(Arc<dyn Subscription>),
}

/// Commands that change per-connection server state.
pub(crate) fn is_stateful(name: &str) -> bool {
    matches!(
        name,
        "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "UNWATCH" | "SELECT"
    )
}

/// Parse the index argument of SELECT.
pub(crate) fn select_index(command: &Command) -> Result<i64> {
    let invalid = || {
        MuxredisError::InvalidArgument("SELECT expects one non-negative integer db index".into())
    };
    let [arg] = command.arguments() else {
        return Err(invalid());
    };
    let db = match arg {
        Arg::Int(i) => *i,
        Arg::UInt(u) => i64::try_from(*u).map_err(|_| invalid())?,
        other => other
            .to_text()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(invalid)?,
    };
    if db < 0 {
        return Err(invalid());
    }
    Ok(db)
}
