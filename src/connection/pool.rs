//! Bounded pool of multiplexed connections.
//!
//! Connections are either free (in the deque, also usable as shared
//! multiplexed connections), checked out through [`PooledConnection`], or
//! being opened. Their sum never exceeds `maxsize`. Pool state sits behind a
//! `parking_lot::Mutex` held very briefly, so a [`PooledConnection`] can
//! return its connection from `Drop` without needing async.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::cmd;
use crate::config::{Address, ConnectionConfig};
use crate::connection::command::{is_stateful, Command, Response};
use crate::connection::redis::RedisConnection;
use crate::error::{MuxredisError, Result};
use crate::pubsub::{PubSubTarget, SubKind, Subscription};
use crate::resp::encoding::Encoding;
use crate::resp::types::RespValue;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens connections for a pool.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open one connection. `config.db` is the pool's current db.
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BoxFuture<'a, Result<RedisConnection>>;
}

/// Opens connections with [`RedisConnection::connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFactory;

impl ConnectionFactory for DefaultFactory {
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BoxFuture<'a, Result<RedisConnection>> {
        Box::pin(RedisConnection::connect(config))
    }
}

impl<F: ConnectionFactory + ?Sized> ConnectionFactory for Arc<F> {
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BoxFuture<'a, Result<RedisConnection>> {
        (**self).connect(config)
    }
}

/// A bounded pool of Redis connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ConnectionConfig,
    factory: Box<dyn ConnectionFactory>,
    state: SyncMutex<PoolState>,
    /// Woken when a connection is released or the pool closes.
    notify: Notify,
    /// Serializes pool growth.
    fill_lock: AsyncMutex<()>,
    /// Serializes pinning of the pub/sub connection.
    pubsub_lock: AsyncMutex<()>,
    closing_tx: watch::Sender<bool>,
}

struct PoolState {
    free: VecDeque<RedisConnection>,
    used: Vec<RedisConnection>,
    acquiring: usize,
    db: i64,
    pubsub: Option<RedisConnection>,
    closing: bool,
    /// Connections closed by `close()`, awaited by `wait_closed()`.
    closed_conns: Vec<RedisConnection>,
}

impl PoolState {
    fn size(&self) -> usize {
        self.free.len() + self.used.len() + self.acquiring
    }

    fn drop_closed(&mut self) {
        self.free.retain(|c| !c.closed());
    }
}

/// Holds one unit of `acquiring` capacity while a connection is opened.
struct AcquiringSlot<'a> {
    pool: &'a PoolInner,
}

impl AcquiringSlot<'_> {
    /// Put the opened connection on the free list and give up the slot in
    /// the same critical section, so `size()` never counts it twice.
    fn commit(self, state: &mut PoolState, conn: RedisConnection) {
        state.acquiring -= 1;
        state.free.push_back(conn);
        std::mem::forget(self);
    }
}

impl Drop for AcquiringSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.acquiring -= 1;
    }
}

impl ConnectionPool {
    /// Create a pool and open `minsize` connections.
    pub async fn create(config: ConnectionConfig) -> Result<Self> {
        Self::with_factory(config, DefaultFactory).await
    }

    /// Create a pool that opens connections through `factory`.
    pub async fn with_factory(
        config: ConnectionConfig,
        factory: impl ConnectionFactory,
    ) -> Result<Self> {
        config.validate()?;
        let (closing_tx, _) = watch::channel(false);
        let pool = Self {
            inner: Arc::new(PoolInner {
                state: SyncMutex::new(PoolState {
                    free: VecDeque::with_capacity(config.maxsize),
                    used: Vec::new(),
                    acquiring: 0,
                    db: config.db,
                    pubsub: None,
                    closing: false,
                    closed_conns: Vec::new(),
                }),
                config,
                factory: Box::new(factory),
                notify: Notify::new(),
                fill_lock: AsyncMutex::new(()),
                pubsub_lock: AsyncMutex::new(()),
                closing_tx,
            }),
        };

        let filled = {
            let _fill = pool.inner.fill_lock.lock().await;
            pool.fill_free(false).await
        };
        if let Err(e) = filled {
            debug!(error = %e, "pool fill failed");
            pool.close();
            pool.wait_closed().await;
            return Err(e);
        }
        debug!(
            address = %pool.address(),
            minsize = pool.minsize(),
            maxsize = pool.maxsize(),
            "pool created"
        );
        Ok(pool)
    }

    // ── Checkout ───────────────────────────────────────────────────

    /// Check a connection out of the pool, waiting while it is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let _fill = self.inner.fill_lock.lock().await;
                self.fill_free(true).await?;
            }
            if let Some(conn) = self.take_free()? {
                return Ok(PooledConnection {
                    pool: self.clone(),
                    conn,
                    detached: false,
                });
            }
            notified.await;
        }
    }

    /// Return a checked-out connection.
    ///
    /// The connection goes back to the free list only if it is clean:
    /// open, outside MULTI and subscribe mode, with no pending replies and
    /// on the pool's db. Anything else is closed.
    pub fn release(&self, conn: RedisConnection) {
        {
            let mut state = self.inner.state.lock();
            // Shared connections from get_connection stay on the free list;
            // pushing them again would count them twice.
            let Some(i) = state.used.iter().position(|c| c.same_as(&conn)) else {
                if state.closing {
                    conn.close();
                } else {
                    warn!(id = conn.id(), "released connection was not checked out, ignoring");
                }
                return;
            };
            state.used.swap_remove(i);

            if !conn.closed() {
                let dirty = if conn.in_transaction() {
                    Some("is in a transaction")
                } else if conn.in_pubsub() > 0 {
                    Some("is in subscribe mode")
                } else if conn.pending() > 0 {
                    Some("has pending commands")
                } else if conn.db() != state.db {
                    Some("has a different db selected")
                } else {
                    None
                };

                match dirty {
                    Some(reason) => {
                        warn!(id = conn.id(), "connection {reason}, closing it");
                        conn.close();
                    }
                    None if state.closing || state.free.len() >= self.inner.config.maxsize => {
                        conn.close();
                    }
                    None => state.free.push_back(conn),
                }
            }
        }
        self.inner.notify.notify_one();
    }

    fn take_free(&self) -> Result<Option<RedisConnection>> {
        let mut state = self.inner.state.lock();
        if state.closing {
            return Err(MuxredisError::PoolClosed);
        }
        while let Some(conn) = state.free.pop_front() {
            if conn.closed() {
                continue;
            }
            state.used.push(conn.clone());
            return Ok(Some(conn));
        }
        Ok(None)
    }

    /// Grow the free list: up to `minsize`, and with `override_min` by one
    /// more connection whenever the free list is empty and there is room.
    /// Callers hold `fill_lock`.
    async fn fill_free(&self, override_min: bool) -> Result<()> {
        loop {
            let (slot, db) = {
                let mut state = self.inner.state.lock();
                if state.closing {
                    return Err(MuxredisError::PoolClosed);
                }
                state.drop_closed();
                let size = state.size();
                let grow = size < self.inner.config.minsize
                    || (override_min && state.free.is_empty() && size < self.inner.config.maxsize);
                if !grow {
                    return Ok(());
                }
                state.acquiring += 1;
                (AcquiringSlot { pool: &self.inner }, state.db)
            };

            let conn = self.open_connection(db).await?;
            let mut state = self.inner.state.lock();
            if state.closing {
                drop(state);
                conn.close();
                return Err(MuxredisError::PoolClosed);
            }
            slot.commit(&mut state, conn);
        }
    }

    async fn open_connection(&self, db: i64) -> Result<RedisConnection> {
        let mut config = self.inner.config.clone();
        config.db = db;
        let conn = self.inner.factory.connect(&config).await?;
        if let Err(e) = conn.execute(cmd!("PING")).await {
            conn.close();
            return Err(e);
        }
        debug!(id = conn.id(), db, "pool opened connection");
        Ok(conn)
    }

    /// A free connection to share for a multiplexed command, rotating the
    /// free list. For pub/sub commands this is the pinned pub/sub
    /// connection, pinning a free one if needed.
    pub fn get_connection(&self, command: &str) -> Option<RedisConnection> {
        let is_pubsub = SubKind::from_name(command.trim().as_bytes()).is_some();
        let mut state = self.inner.state.lock();
        if state.closing {
            return None;
        }

        if is_pubsub {
            if let Some(conn) = &state.pubsub {
                if !conn.closed() {
                    return Some(conn.clone());
                }
                let stale = conn.clone();
                state.used.retain(|c| !c.same_as(&stale));
                state.pubsub = None;
            }
        }

        for _ in 0..state.free.len() {
            let conn = state.free.pop_front()?;
            let usable = !conn.closed() && conn.in_pubsub() == 0;
            if usable && is_pubsub {
                state.used.push(conn.clone());
                state.pubsub = Some(conn.clone());
                return Some(conn);
            }
            state.free.push_back(conn.clone());
            if usable {
                return Some(conn);
            }
        }
        None
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Run a command on a shared free connection, or on an acquired one
    /// when none is free.
    ///
    /// Commands that change connection state (MULTI/EXEC/DISCARD/WATCH/
    /// UNWATCH/SELECT) are rejected: use [`acquire`](Self::acquire) or
    /// [`select`](Self::select).
    pub async fn execute(&self, command: Command) -> Result<Response> {
        self.ensure_open()?;
        let name = command.name();
        if is_stateful(name) {
            return Err(MuxredisError::InvalidArgument(format!(
                "{name} can not be run on a pool, acquire a connection first"
            )));
        }
        if SubKind::from_name(name.as_bytes()).is_some() {
            return Err(MuxredisError::InvalidArgument(format!(
                "{name} must be sent with execute_pubsub"
            )));
        }

        if let Some(conn) = self.get_connection(name) {
            return conn.execute(command).await;
        }
        let conn = self.acquire().await?;
        conn.execute(command).await
    }

    /// [`execute`](Self::execute) returning the plain reply value.
    pub async fn query(&self, command: Command) -> Result<RespValue> {
        match self.execute(command).await? {
            Response::Value(v) => Ok(v),
            Response::Exec(_) => Err(MuxredisError::Protocol(
                "transaction result outside MULTI".into(),
            )),
        }
    }

    /// Run a pub/sub command on the pool's pinned pub/sub connection.
    pub async fn execute_pubsub<I, T>(&self, command: &str, targets: I) -> Result<Vec<RespValue>>
    where
        I: IntoIterator<Item = T>,
        T: Into<PubSubTarget>,
    {
        let conn = self.pubsub_connection().await?;
        conn.execute_pubsub(command, targets).await
    }

    async fn pubsub_connection(&self) -> Result<RedisConnection> {
        self.ensure_open()?;
        let _pin = self.inner.pubsub_lock.lock().await;
        if let Some(conn) = self.get_connection("SUBSCRIBE") {
            return Ok(conn);
        }

        let mut pooled = self.acquire().await?;
        pooled.detached = true;
        let conn = pooled.conn.clone();
        let mut state = self.inner.state.lock();
        if state.closing {
            conn.close();
            return Err(MuxredisError::PoolClosed);
        }
        state.pubsub = Some(conn.clone());
        debug!(id = conn.id(), "pinned pub/sub connection");
        Ok(conn)
    }

    /// Switch the db of every free connection, and of connections opened
    /// from now on.
    pub async fn select(&self, db: i64) -> Result<()> {
        self.ensure_open()?;
        let _fill = self.inner.fill_lock.lock().await;
        let free: Vec<RedisConnection> = self.inner.state.lock().free.iter().cloned().collect();
        for conn in free {
            conn.execute(cmd!("SELECT", db)).await?;
        }
        self.inner.state.lock().db = db;
        Ok(())
    }

    /// Close every free connection and wait for them to finish.
    pub async fn clear(&self) {
        let _fill = self.inner.fill_lock.lock().await;
        let free: Vec<RedisConnection> = self.inner.state.lock().free.drain(..).collect();
        for conn in &free {
            conn.close();
        }
        for conn in &free {
            conn.wait_closed().await;
        }
        self.inner.notify.notify_waiters();
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Close the pool and every connection it owns. Safe to call
    /// repeatedly; later operations fail with [`MuxredisError::PoolClosed`].
    pub fn close(&self) {
        let conns = {
            let mut state = self.inner.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            let mut conns: Vec<RedisConnection> = state.free.drain(..).collect();
            conns.extend(state.used.drain(..));
            conns.extend(state.pubsub.take());
            state.closed_conns = conns.clone();
            conns
        };
        debug!(connections = conns.len(), "closing pool");
        for conn in &conns {
            conn.close();
        }
        self.inner.closing_tx.send_replace(true);
        self.inner.notify.notify_waiters();
    }

    /// Wait until [`close`](Self::close) was called and every connection
    /// has finished closing.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closing_tx.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
        let conns = self.inner.state.lock().closed_conns.clone();
        for conn in conns {
            conn.wait_closed().await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.state.lock().closing {
            return Err(MuxredisError::PoolClosed);
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn minsize(&self) -> usize {
        self.inner.config.minsize
    }

    pub fn maxsize(&self) -> usize {
        self.inner.config.maxsize
    }

    /// Free, checked-out and opening connections.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size()
    }

    pub fn freesize(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn db(&self) -> i64 {
        self.inner.state.lock().db
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.inner.config.encoding
    }

    pub fn address(&self) -> &Address {
        &self.inner.config.address
    }

    pub fn closed(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Subscription count of the pinned pub/sub connection.
    pub fn in_pubsub(&self) -> i64 {
        self.pinned().map_or(0, |c| c.in_pubsub())
    }

    pub fn pubsub_channels(&self) -> HashMap<Bytes, Arc<dyn Subscription>> {
        self.pinned()
            .map(|c| c.pubsub_channels())
            .unwrap_or_default()
    }

    pub fn pubsub_patterns(&self) -> HashMap<Bytes, Arc<dyn Subscription>> {
        self.pinned()
            .map(|c| c.pubsub_patterns())
            .unwrap_or_default()
    }

    fn pinned(&self) -> Option<RedisConnection> {
        self.inner.state.lock().pubsub.clone()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.config.address)
            .field("db", &state.db)
            .field("size", &state.size())
            .field("freesize", &state.free.len())
            .field("closing", &state.closing)
            .finish()
    }
}

/// RAII guard for a checked-out connection. Dropping it releases the
/// connection back to the pool.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: RedisConnection,
    detached: bool,
}

impl PooledConnection {
    /// Take the connection out of the pool for good. It no longer counts
    /// towards the pool size.
    pub fn detach(mut self) -> RedisConnection {
        self.detached = true;
        {
            let mut state = self.pool.inner.state.lock();
            state.used.retain(|c| !c.same_as(&self.conn));
        }
        self.pool.inner.notify.notify_one();
        self.conn.clone()
    }
}

impl Deref for PooledConnection {
    type Target = RedisConnection;

    fn deref(&self) -> &RedisConnection {
        &self.conn
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.release(self.conn.clone());
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
