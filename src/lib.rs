//! muxredis: a multiplexing Redis client core for tokio.
//!
//! - [`resp`]: resumable RESP2/RESP3 decoder and command encoder,
//! - [`connection`]: multiplexed connections and a bounded pool,
//! - [`pubsub`]: channel queues and fan-in receivers for subscriptions.
//!
//! ```ignore
//! use muxredis::{cmd, ConnectionConfig, ConnectionPool};
//!
//! let pool = ConnectionPool::create(ConnectionConfig::from_url("redis://localhost/0")?).await?;
//! pool.execute(cmd!("SET", "greeting", "hello")).await?;
//! let value = pool.query(cmd!("GET", "greeting")).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pubsub;
pub mod resp;

pub use config::{Address, ConnectionConfig};
pub use connection::{
    Command, ConnectionFactory, ConnectionPool, Pipeline, PooledConnection, RedisConnection,
    ReplyEncoding, ReplyHandle, Response, Transaction,
};
pub use error::{MuxredisError, ReplyKind, Result};
pub use pubsub::{
    Channel, ClosePolicy, KeepRunning, Message, PubSubTarget, Receiver, Sender, StopWhenIdle,
    Subscription,
};
pub use resp::{Arg, Decoder, Encoding, RespValue};
