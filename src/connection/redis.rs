//! Multiplexed connection to a Redis server.
//!
//! A [`RedisConnection`] is shared by any number of concurrent callers. Each
//! command is written and its waiter queued under one lock, so the reader
//! task can resolve waiters strictly in write order. Two background tasks
//! own the stream halves:
//!
//! - the writer drains an unbounded queue of encoded frames,
//! - the reader decodes replies and dispatches them to waiters, or straight
//!   into subscription queues while the connection is in subscribe mode.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cmd;
use crate::config::{Address, ConnectionConfig};
use crate::connection::command::{select_index, Callback, Command, Response};
use crate::connection::pipeline::{Pipeline, Transaction};
use crate::connection::transport;
use crate::error::{MuxredisError, Result};
use crate::pubsub::{Channel, Message, PubSubEvent, PubSubTarget, SubKind, Subscription};
use crate::resp::decoder::Decoder;
use crate::resp::encoding::Encoding;
use crate::resp::types::RespValue;
use crate::resp::writer::{encode_args, Arg};

/// Free space kept in the read buffer before each socket read.
const READ_RESERVE: usize = 16 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type ReplySender = oneshot::Sender<Result<Response>>;

/// Handle to one multiplexed connection. Cheap to clone.
///
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct RedisConnection {
    inner: Arc<Inner>,
    _close_guard: Arc<CloseOnDrop>,
}

struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close(None);
    }
}

struct Inner {
    id: u64,
    address: Address,
    encoding: Option<Encoding>,
    state: SyncMutex<State>,
    shutdown: Notify,
    closed: watch::Sender<bool>,
}

struct Waiter {
    tx: ReplySender,
    encoding: Option<Encoding>,
    callback: Callback,
}

/// Post-processing remembered for a command queued inside MULTI.
struct Recorded {
    encoding: Option<Encoding>,
    callback: Callback,
}

struct State {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    waiters: VecDeque<Waiter>,
    encoding: Option<Encoding>,
    db: i64,
    closing: bool,
    close_reason: Option<MuxredisError>,
    /// MULTI written and not yet matched by EXEC/DISCARD.
    multi_written: bool,
    /// `Some` between the MULTI and EXEC/DISCARD replies.
    transaction: Option<Vec<Recorded>>,
    in_pubsub: i64,
    channels: HashMap<Bytes, Arc<dyn Subscription>>,
    patterns: HashMap<Bytes, Arc<dyn Subscription>>,
}

/// Resolves to the reply of one sent command.
///
/// Dropping the handle does not cancel the command: the reply is still
/// read in order and then discarded.
#[derive(Debug)]
pub struct ReplyHandle {
    rx: oneshot::Receiver<Result<Response>>,
}

impl Future for ReplyHandle {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(MuxredisError::ConnectionClosed)))
    }
}

impl RedisConnection {
    /// Open a connection: transport, then AUTH and SELECT as configured.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let stream = transport::open(config).await?;
        let conn = Self::from_stream(stream, config);
        if let Err(e) = conn.handshake(config).await {
            debug!(id = conn.id(), error = %e, "handshake failed");
            conn.close();
            conn.wait_closed().await;
            return Err(e);
        }
        debug!(id = conn.id(), address = %conn.address(), db = conn.db(), "connected");
        Ok(conn)
    }

    /// Run a connection over an already open stream. Only the address,
    /// encoding and buffer limit of `config` are used.
    pub fn from_stream<S>(stream: S, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            address: config.address.clone(),
            encoding: config.encoding,
            state: SyncMutex::new(State {
                outbound: Some(tx),
                waiters: VecDeque::new(),
                encoding: config.encoding,
                db: 0,
                closing: false,
                close_reason: None,
                multi_written: false,
                transaction: None,
                in_pubsub: 0,
                channels: HashMap::new(),
                patterns: HashMap::new(),
            }),
            shutdown: Notify::new(),
            closed,
        });

        let decoder = Decoder::new().with_max_buffer(config.max_buffer_size);
        let writer = tokio::spawn(write_loop(inner.clone(), write_half, rx));
        tokio::spawn(read_loop(inner.clone(), read_half, decoder, writer));

        Self {
            _close_guard: Arc::new(CloseOnDrop(inner.clone())),
            inner,
        }
    }

    async fn handshake(&self, config: &ConnectionConfig) -> Result<()> {
        if let Some(password) = &config.password {
            let auth = match &config.username {
                Some(user) => cmd!("AUTH", user, password),
                None => cmd!("AUTH", password),
            };
            self.execute(auth).await?;
        }
        if config.db != 0 {
            self.execute(cmd!("SELECT", config.db)).await?;
        }
        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Write `command` and queue its waiter. The write happens before this
    /// returns; the handle resolves when the reply is read.
    pub fn send(&self, command: Command) -> Result<ReplyHandle> {
        let mut state = self.inner.state.lock();
        let mut frame = Vec::new();
        let rx = state.enqueue(&command, &mut frame)?;
        state.write(frame, 1)?;
        Ok(ReplyHandle { rx })
    }

    /// Send `command` and wait for its reply.
    pub async fn execute(&self, command: Command) -> Result<Response> {
        self.send(command)?.await
    }

    /// Send `command` and return its plain reply value.
    pub async fn query(&self, command: Command) -> Result<RespValue> {
        match self.execute(command).await? {
            Response::Value(v) => Ok(v),
            Response::Exec(items) => Ok(RespValue::Array(
                items
                    .into_iter()
                    .map(|item| item.unwrap_or_else(|e| RespValue::Error(e.to_string())))
                    .collect(),
            )),
        }
    }

    /// Buffer commands and write them in one go.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Buffer commands and run them inside MULTI/EXEC.
    pub fn multi_exec(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Write several commands as one buffer.
    ///
    /// With `atomic` set, any command failing validation aborts the whole
    /// batch before anything is written. Otherwise rejected commands get an
    /// error slot and the rest are still sent.
    pub(crate) fn send_batch(
        &self,
        commands: Vec<Command>,
        atomic: bool,
    ) -> Result<Vec<Result<ReplyHandle>>> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;

        let queued_before = state.waiters.len();
        let multi_before = state.multi_written;
        let mut frame = Vec::new();
        let mut handles = Vec::with_capacity(commands.len());
        let mut sent = 0;

        for command in &commands {
            match state.enqueue(command, &mut frame) {
                Ok(rx) => {
                    sent += 1;
                    handles.push(Ok(ReplyHandle { rx }));
                }
                Err(e) if atomic => {
                    state.waiters.truncate(queued_before);
                    state.multi_written = multi_before;
                    return Err(e);
                }
                Err(e) => handles.push(Err(e)),
            }
        }

        if sent > 0 {
            state.write(frame, sent)?;
        }
        Ok(handles)
    }

    // ── Pub/Sub ────────────────────────────────────────────────────

    /// Write one (P)SUBSCRIBE/(P)UNSUBSCRIBE command for `targets`.
    ///
    /// Returns one handle per target, resolved by that target's
    /// acknowledgement.
    pub fn send_pubsub<I, T>(&self, command: &str, targets: I) -> Result<Vec<ReplyHandle>>
    where
        I: IntoIterator<Item = T>,
        T: Into<PubSubTarget>,
    {
        let kind = SubKind::from_name(command.as_bytes()).ok_or_else(|| {
            MuxredisError::InvalidArgument(format!("{command} is not a pub/sub command"))
        })?;
        let targets: Vec<PubSubTarget> = targets.into_iter().map(Into::into).collect();
        if targets.is_empty() {
            return Err(MuxredisError::InvalidArgument(
                "no channels or patterns given".into(),
            ));
        }

        let mut state = self.inner.state.lock();
        state.ensure_open()?;

        let is_pattern = kind.is_pattern();
        let mut subs = Vec::with_capacity(targets.len());
        for target in targets {
            let sub = match target {
                PubSubTarget::Name(name) => state
                    .registered(&name, is_pattern)
                    .unwrap_or_else(|| Arc::new(Channel::new(name, is_pattern))),
                PubSubTarget::Handle(handle) => handle,
            };
            if sub.is_pattern() != is_pattern {
                return Err(MuxredisError::InvalidArgument(format!(
                    "{} does not match the kind of {}",
                    String::from_utf8_lossy(sub.name()),
                    kind.command()
                )));
            }
            subs.push(sub);
        }

        let args: Vec<Arg> = subs.iter().map(|s| Arg::Bytes(s.name().clone())).collect();
        let mut frame = Vec::new();
        encode_args(kind.command().as_bytes(), &args, &mut frame)?;

        let queued_before = state.waiters.len();
        let mut handles = Vec::with_capacity(subs.len());
        for sub in subs {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                tx,
                encoding: None,
                callback: Callback::PubSub(sub),
            });
            handles.push(ReplyHandle { rx });
        }
        if let Err(e) = state.write(frame, 0) {
            state.waiters.truncate(queued_before);
            return Err(e);
        }
        Ok(handles)
    }

    /// Run a pub/sub command and wait for every acknowledgement.
    pub async fn execute_pubsub<I, T>(&self, command: &str, targets: I) -> Result<Vec<RespValue>>
    where
        I: IntoIterator<Item = T>,
        T: Into<PubSubTarget>,
    {
        let handles = self.send_pubsub(command, targets)?;
        let mut acks = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await? {
                Response::Value(v) => acks.push(v),
                Response::Exec(_) => {
                    return Err(MuxredisError::Protocol(
                        "transaction result for a pub/sub acknowledgement".into(),
                    ))
                }
            }
        }
        Ok(acks)
    }

    /// Subscribe to channels and return their message queues.
    pub async fn subscribe<I, N>(&self, channels: I) -> Result<Vec<Arc<Channel>>>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<[u8]>,
    {
        self.subscribe_kind(SubKind::Subscribe, channels).await
    }

    /// Subscribe to patterns and return their message queues.
    pub async fn psubscribe<I, N>(&self, patterns: I) -> Result<Vec<Arc<Channel>>>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<[u8]>,
    {
        self.subscribe_kind(SubKind::PSubscribe, patterns).await
    }

    async fn subscribe_kind<I, N>(&self, kind: SubKind, names: I) -> Result<Vec<Arc<Channel>>>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<[u8]>,
    {
        let is_pattern = kind.is_pattern();
        let channels: Vec<Arc<Channel>> = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                self.subscribed_channel(name, is_pattern)
                    .unwrap_or_else(|| Arc::new(Channel::new(Bytes::copy_from_slice(name), is_pattern)))
            })
            .collect();
        self.execute_pubsub(kind.command(), channels.iter().cloned().map(PubSubTarget::from))
            .await?;
        Ok(channels)
    }

    fn subscribed_channel(&self, name: &[u8], is_pattern: bool) -> Option<Arc<Channel>> {
        let sub = self.inner.state.lock().registered(name, is_pattern)?;
        sub.into_any().downcast::<Channel>().ok()
    }

    /// Active channel subscriptions.
    pub fn pubsub_channels(&self) -> HashMap<Bytes, Arc<dyn Subscription>> {
        self.inner.state.lock().channels.clone()
    }

    /// Active pattern subscriptions.
    pub fn pubsub_patterns(&self) -> HashMap<Bytes, Arc<dyn Subscription>> {
        self.inner.state.lock().patterns.clone()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start closing. Pending waiters fail with
    /// [`MuxredisError::ConnectionForcedClose`]. Safe to call repeatedly.
    pub fn close(&self) {
        self.inner.close(None);
    }

    /// Wait until the background tasks have finished.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Currently selected database.
    pub fn db(&self) -> i64 {
        self.inner.state.lock().db
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.inner.encoding
    }

    /// True once closing has started.
    pub fn closed(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// True from the MULTI write until the EXEC/DISCARD reply.
    pub fn in_transaction(&self) -> bool {
        let state = self.inner.state.lock();
        state.multi_written || state.transaction.is_some()
    }

    /// Number of active subscriptions, as last reported by the server.
    pub fn in_pubsub(&self) -> i64 {
        self.inner.state.lock().in_pubsub
    }

    /// Commands written and not yet answered.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub(crate) fn same_as(&self, other: &RedisConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("db", &self.db())
            .field("closed", &self.closed())
            .finish()
    }
}

impl Inner {
    fn close(&self, reason: Option<MuxredisError>) {
        {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            state.close_reason = reason;
        }
        self.shutdown.notify_one();
    }

    /// Fail everything still pending. Runs once, from the reader task.
    fn teardown(&self, failure: Option<MuxredisError>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let error = state
            .close_reason
            .take()
            .or(failure)
            .unwrap_or(MuxredisError::ConnectionForcedClose);
        debug!(
            id = self.id,
            error = %error,
            pending = state.waiters.len(),
            "connection closed"
        );

        state.closing = true;
        state.outbound = None;
        state.multi_written = false;
        state.transaction = None;
        state.in_pubsub = 0;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        for (_, sub) in state.channels.drain().chain(state.patterns.drain()) {
            sub.close(Some(error.clone()));
        }
    }
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closing || self.outbound.is_none() {
            return Err(MuxredisError::ConnectionClosed);
        }
        Ok(())
    }

    /// Validate and encode `command`, then queue its waiter.
    ///
    /// On error neither `out` nor the waiter queue is touched.
    fn enqueue(
        &mut self,
        command: &Command,
        out: &mut Vec<u8>,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        self.ensure_open()?;
        let name = command.name();
        if name.is_empty() {
            return Err(MuxredisError::InvalidArgument(
                "command name must not be empty".into(),
            ));
        }
        if SubKind::from_name(name.as_bytes()).is_some() {
            return Err(MuxredisError::InvalidArgument(format!(
                "{name} must be sent with execute_pubsub"
            )));
        }
        if self.in_pubsub > 0 && name != "PING" {
            return Err(MuxredisError::PubSubMode(format!("{name} is not allowed")));
        }

        let callback = match name {
            "SELECT" => Callback::Select(select_index(command)?),
            "MULTI" if self.multi_written => {
                return Err(MuxredisError::InvalidArgument(
                    "MULTI calls can not be nested".into(),
                ))
            }
            "MULTI" => Callback::Multi,
            "EXEC" | "DISCARD" if !self.multi_written => {
                return Err(MuxredisError::InvalidArgument(format!(
                    "{name} without MULTI"
                )))
            }
            "EXEC" => Callback::Exec,
            "DISCARD" => Callback::Discard,
            _ => Callback::Plain,
        };

        command.encode(out)?;
        match callback {
            Callback::Multi => self.multi_written = true,
            Callback::Exec | Callback::Discard => self.multi_written = false,
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter {
            tx,
            encoding: command.reply_encoding().resolve(self.encoding),
            callback,
        });
        Ok(rx)
    }

    /// Hand an encoded frame to the writer. On failure the last `queued`
    /// waiters are dropped again.
    fn write(&mut self, frame: Vec<u8>, queued: usize) -> Result<()> {
        let sent = match &self.outbound {
            Some(tx) => tx.send(Bytes::from(frame)).is_ok(),
            None => false,
        };
        if !sent {
            let keep = self.waiters.len().saturating_sub(queued);
            self.waiters.truncate(keep);
            return Err(MuxredisError::ConnectionClosed);
        }
        Ok(())
    }

    fn registered(&self, name: &[u8], is_pattern: bool) -> Option<Arc<dyn Subscription>> {
        let registry = if is_pattern {
            &self.patterns
        } else {
            &self.channels
        };
        registry.get(name).cloned()
    }

    // ── Dispatch ───────────────────────────────────────────────────

    fn on_value(&mut self, value: RespValue) -> Result<()> {
        let is_push = value.is_push();
        if self.in_pubsub > 0 || is_push {
            if let Some(event) = PubSubEvent::parse(&value) {
                return self.on_pubsub(event, value);
            }
            if is_push {
                debug!(kind = value.type_name(), "dropping unhandled push");
                return Ok(());
            }
        }
        self.resolve_head(value)
    }

    fn on_pubsub(&mut self, event: PubSubEvent, raw: RespValue) -> Result<()> {
        match event {
            PubSubEvent::Ack {
                kind,
                channel,
                count,
            } => {
                let head_is_pubsub = matches!(
                    self.waiters.front(),
                    Some(Waiter {
                        callback: Callback::PubSub(_),
                        ..
                    })
                );
                if head_is_pubsub {
                    self.resolve_head(raw)?;
                }
                self.apply_ack(kind, &channel, count);
            }
            PubSubEvent::Message(message) => self.deliver(message),
            PubSubEvent::Pong(payload) => {
                if self.waiters.is_empty() {
                    warn!("pong without a pending PING");
                    return Ok(());
                }
                let reply = if payload.is_empty() {
                    RespValue::SimpleString("PONG".into())
                } else {
                    RespValue::BulkString(payload)
                };
                self.resolve_head(reply)?;
            }
        }
        Ok(())
    }

    fn apply_ack(&mut self, kind: SubKind, channel: &[u8], count: i64) {
        if !kind.is_subscribe() {
            let registry = if kind.is_pattern() {
                &mut self.patterns
            } else {
                &mut self.channels
            };
            if let Some(sub) = registry.remove(channel) {
                sub.close(None);
            }
        }
        self.in_pubsub = count;
    }

    fn deliver(&mut self, message: Message) {
        let target = match &message.pattern {
            Some(pattern) => self.patterns.get(pattern),
            None => self.channels.get(&message.channel),
        };
        match target {
            Some(sub) => sub.put(message),
            None => warn!(
                channel = %String::from_utf8_lossy(&message.channel),
                "pub/sub message without a subscriber"
            ),
        }
    }

    /// Hand `value` to the oldest waiter.
    fn resolve_head(&mut self, value: RespValue) -> Result<()> {
        let Some(Waiter {
            tx,
            encoding,
            callback,
        }) = self.waiters.pop_front()
        else {
            return Err(MuxredisError::Protocol(format!(
                "{} reply with no command pending",
                value.type_name()
            )));
        };
        trace!(kind = value.type_name(), "reply");
        let result = self.process(value, encoding, callback);
        if tx.send(result).is_err() {
            trace!("reply for a dropped caller discarded");
        }
        Ok(())
    }

    fn process(
        &mut self,
        value: RespValue,
        encoding: Option<Encoding>,
        callback: Callback,
    ) -> Result<Response> {
        if let Some(message) = value.as_error_msg() {
            let error = MuxredisError::reply(message);
            match callback {
                Callback::Exec | Callback::Discard => self.transaction = None,
                // A refused MULTI opened nothing on the server. A later MULTI
                // already queued owns the flag from here on.
                Callback::Multi => {
                    let later_multi = self
                        .waiters
                        .iter()
                        .any(|w| matches!(w.callback, Callback::Multi));
                    if !later_multi {
                        self.multi_written = false;
                    }
                    self.transaction = None;
                }
                _ => {}
            }
            return Err(error);
        }

        match callback {
            Callback::Exec => return self.finish_exec(value),
            Callback::Discard => self.transaction = None,
            Callback::Multi => self.transaction = Some(Vec::new()),
            Callback::PubSub(target) => self.register_ack(&value, target),
            other => match self.transaction.as_mut() {
                // QUEUED: decoding happens when EXEC replies
                Some(recorded) => {
                    recorded.push(Recorded {
                        encoding,
                        callback: other,
                    });
                    return Ok(Response::Value(value));
                }
                None => {
                    if let Callback::Select(db) = other {
                        if value.is_ok() {
                            self.db = db;
                        }
                    }
                }
            },
        }
        decode(value, encoding).map(Response::Value)
    }

    /// Acknowledgement for one subscription waiter.
    fn register_ack(&mut self, value: &RespValue, target: Arc<dyn Subscription>) {
        let Some(PubSubEvent::Ack {
            kind,
            channel,
            count,
        }) = PubSubEvent::parse(value)
        else {
            return;
        };
        let was_subscribed = self.in_pubsub > 0;
        self.in_pubsub = count;

        if kind.is_subscribe() {
            let registry = if kind.is_pattern() {
                &mut self.patterns
            } else {
                &mut self.channels
            };
            registry.entry(channel.clone()).or_insert(target);
        }
        // acks read outside subscribe mode do not pass through on_pubsub
        if !was_subscribed {
            self.apply_ack(kind, &channel, count);
        }
    }

    fn finish_exec(&mut self, value: RespValue) -> Result<Response> {
        let recorded = self.transaction.take().unwrap_or_default();
        let items = match value {
            RespValue::Null => {
                return Ok(Response::Exec(
                    recorded
                        .iter()
                        .map(|_| Err(MuxredisError::WatchChanged))
                        .collect(),
                ))
            }
            RespValue::Array(items) => items,
            other => {
                return Err(MuxredisError::Protocol(format!(
                    "unexpected {} reply to EXEC",
                    other.type_name()
                )))
            }
        };
        if items.len() != recorded.len() {
            return Err(MuxredisError::Protocol(format!(
                "EXEC returned {} results for {} queued commands",
                items.len(),
                recorded.len()
            )));
        }

        let mut results = Vec::with_capacity(items.len());
        for (item, Recorded { encoding, callback }) in items.into_iter().zip(recorded) {
            let result = item.into_result().and_then(|item| {
                if let Callback::Select(db) = callback {
                    if item.is_ok() {
                        self.db = db;
                    }
                }
                decode(item, encoding)
            });
            results.push(result);
        }
        Ok(Response::Exec(results))
    }
}

fn decode(value: RespValue, encoding: Option<Encoding>) -> Result<RespValue> {
    match encoding {
        Some(encoding) => value.decode_with(encoding),
        None => Ok(value),
    }
}

// ── Background tasks ───────────────────────────────────────────────

async fn write_loop<W>(inner: Arc<Inner>, mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut result = writer.write_all(&frame).await;
        // coalesce whatever queued up meanwhile into one flush
        while result.is_ok() {
            match rx.try_recv() {
                Ok(next) => result = writer.write_all(&next).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }
        if let Err(e) = result {
            warn!(id = inner.id, error = %e, "write failed");
            inner.close(Some(e.into()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, mut decoder: Decoder, writer: JoinHandle<()>)
where
    R: AsyncRead + Unpin,
{
    let failure = loop {
        if let Err(e) = dispatch(&inner, &mut decoder) {
            warn!(id = inner.id, error = %e, "closing on protocol error");
            break Some(e);
        }

        let buf = decoder.read_buf_mut();
        if buf.capacity() - buf.len() < READ_RESERVE {
            buf.reserve(READ_RESERVE);
        }
        tokio::select! {
            biased;
            _ = inner.shutdown.notified() => break None,
            read = reader.read_buf(decoder.read_buf_mut()) => match read {
                Ok(0) => break Some(MuxredisError::ConnectionClosed),
                Ok(_) => {}
                Err(e) => break Some(e.into()),
            },
        }
    };

    inner.teardown(failure);
    writer.abort();
    let _ = writer.await;
    inner.closed.send_replace(true);
}

/// Dispatch every complete value currently buffered.
fn dispatch(inner: &Inner, decoder: &mut Decoder) -> Result<()> {
    while let Some(value) = decoder.try_take()? {
        inner.state.lock().on_value(value)?;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
