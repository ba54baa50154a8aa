//! Connections to a Redis server: a single multiplexed connection, the
//! transport it runs over, and a bounded pool of them.

pub mod command;
pub mod pipeline;
pub mod pool;
pub mod redis;
pub mod transport;

pub use command::{Command, ReplyEncoding, Response};
pub use pipeline::{Pipeline, Transaction};
pub use pool::{ConnectionFactory, ConnectionPool, DefaultFactory, PooledConnection};
pub use redis::{RedisConnection, ReplyHandle};
