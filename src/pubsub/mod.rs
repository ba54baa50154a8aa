//! Publish/subscribe delivery.
//!
//! A connection in subscribe mode routes every `message`/`pmessage` frame to
//! the [`Subscription`] registered under the channel (or pattern) name.
//! Two implementations ship with the crate: [`Channel`], one queue per
//! subscription, and [`Receiver`], which fans many subscriptions into one
//! queue through its [`Sender`]s.

pub mod channel;
pub mod receiver;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{MuxredisError, Result};
use crate::resp::encoding::Encoding;
use crate::resp::types::RespValue;

pub use channel::Channel;
pub use receiver::{ClosePolicy, KeepRunning, Receiver, Sender, StopWhenIdle};

/// One published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: Bytes,
    /// Matching pattern, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
        }
    }

    /// Payload decoded as text.
    pub fn text(&self, encoding: Encoding) -> Result<String> {
        encoding.decode(&self.payload)
    }
}

/// The connection-facing side of a subscription.
///
/// The connection only ever calls these methods; anything that implements
/// them can be subscribed.
pub trait Subscription: Send + Sync + fmt::Debug {
    /// Channel name or pattern.
    fn name(&self) -> &Bytes;
    fn is_pattern(&self) -> bool;
    /// False once closed and fully drained.
    fn is_active(&self) -> bool;
    /// Deliver one message. Messages put after close are dropped.
    fn put(&self, message: Message);
    /// Mark the subscription finished, optionally with the error that ended it.
    fn close(&self, error: Option<MuxredisError>);
    /// Recover the concrete type behind an `Arc<dyn Subscription>`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// What to (un)subscribe: a bare name, or an existing subscription object.
#[derive(Debug, Clone)]
pub enum PubSubTarget {
    Name(Bytes),
    Handle(Arc<dyn Subscription>),
}

impl From<&str> for PubSubTarget {
    fn from(name: &str) -> Self {
        Self::Name(Bytes::copy_from_slice(name.as_bytes()))
    }
}

impl From<String> for PubSubTarget {
    fn from(name: String) -> Self {
        Self::Name(Bytes::from(name))
    }
}

impl From<&[u8]> for PubSubTarget {
    fn from(name: &[u8]) -> Self {
        Self::Name(Bytes::copy_from_slice(name))
    }
}

impl From<Bytes> for PubSubTarget {
    fn from(name: Bytes) -> Self {
        Self::Name(name)
    }
}

impl From<Arc<dyn Subscription>> for PubSubTarget {
    fn from(handle: Arc<dyn Subscription>) -> Self {
        Self::Handle(handle)
    }
}

impl From<Arc<Channel>> for PubSubTarget {
    fn from(channel: Arc<Channel>) -> Self {
        Self::Handle(channel)
    }
}

impl From<Arc<Sender>> for PubSubTarget {
    fn from(sender: Arc<Sender>) -> Self {
        Self::Handle(sender)
    }
}

/// The four subscription management verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubKind {
    /// Match a command name or acknowledgement kind, ignoring case.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        if name.eq_ignore_ascii_case(b"subscribe") {
            Some(Self::Subscribe)
        } else if name.eq_ignore_ascii_case(b"unsubscribe") {
            Some(Self::Unsubscribe)
        } else if name.eq_ignore_ascii_case(b"psubscribe") {
            Some(Self::PSubscribe)
        } else if name.eq_ignore_ascii_case(b"punsubscribe") {
            Some(Self::PUnsubscribe)
        } else {
            None
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::PSubscribe => "PSUBSCRIBE",
            Self::PUnsubscribe => "PUNSUBSCRIBE",
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::PSubscribe | Self::PUnsubscribe)
    }

    pub fn is_subscribe(&self) -> bool {
        matches!(self, Self::Subscribe | Self::PSubscribe)
    }
}

/// A decoded pub/sub frame, either an RESP2 array in subscribe mode or an
/// RESP3 push.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PubSubEvent {
    Ack {
        kind: SubKind,
        channel: Bytes,
        count: i64,
    },
    Message(Message),
    Pong(Bytes),
}

impl PubSubEvent {
    pub(crate) fn parse(value: &RespValue) -> Option<Self> {
        let (kind, items): (&[u8], &[RespValue]) = match value {
            RespValue::Array(items) => {
                let (first, rest) = items.split_first()?;
                (first.as_bytes()?, rest)
            }
            RespValue::Push { kind, data } => (kind.as_bytes(), data.as_slice()),
            _ => return None,
        };

        if kind.eq_ignore_ascii_case(b"message") {
            match items {
                [channel, payload] => Some(Self::Message(Message {
                    channel: leaf(channel)?,
                    pattern: None,
                    payload: leaf(payload)?,
                })),
                _ => None,
            }
        } else if kind.eq_ignore_ascii_case(b"pmessage") {
            match items {
                [pattern, channel, payload] => Some(Self::Message(Message {
                    channel: leaf(channel)?,
                    pattern: Some(leaf(pattern)?),
                    payload: leaf(payload)?,
                })),
                _ => None,
            }
        } else if kind.eq_ignore_ascii_case(b"pong") {
            Some(Self::Pong(items.first().and_then(leaf).unwrap_or_default()))
        } else {
            let kind = SubKind::from_name(kind)?;
            let channel = match items.first()? {
                RespValue::Null => Bytes::new(),
                other => leaf(other)?,
            };
            let count = items.get(1)?.as_int()?;
            Some(Self::Ack {
                kind,
                channel,
                count,
            })
        }
    }
}

fn leaf(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(b) => Some(b.clone()),
        RespValue::SimpleString(s) | RespValue::Text(s) => {
            Some(Bytes::copy_from_slice(s.as_bytes()))
        }
        _ => None,
    }
}
