//! Shared helpers for integration tests.
//!
//! [`MockServer`] is an in-process RESP server on an ephemeral TCP port. It
//! understands enough of Redis for the client to be exercised end to end:
//! strings, db selection, AUTH, MULTI/EXEC/WATCH and pub/sub.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use muxredis::resp::{encode_args, Arg};
use muxredis::{Address, ConnectionConfig, Decoder, RedisConnection, RespValue};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Key = (i64, Bytes);

#[derive(Default)]
struct Shared {
    password: Option<String>,
    data: Mutex<HashMap<Key, Bytes>>,
    versions: Mutex<HashMap<Key, u64>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    clients: Mutex<Vec<JoinHandle<()>>>,
    accepted: AtomicUsize,
    next_client: AtomicU64,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

impl Shared {
    fn version(&self, key: &Key) -> u64 {
        self.versions.lock().get(key).copied().unwrap_or(0)
    }

    fn touch(&self, key: &Key) {
        *self.versions.lock().entry(key.clone()).or_insert(0) += 1;
    }

    fn subscription_count(&self, client: u64) -> usize {
        self.subscribers
            .lock()
            .get(&client)
            .map_or(0, |s| s.channels.len() + s.patterns.len())
    }
}

/// In-process Redis stand-in.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// A server that requires `AUTH password` before anything else.
    pub async fn with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_owned())).await
    }

    async fn spawn(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            password,
            ..Shared::default()
        });

        let accept = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    let id = shared.next_client.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(serve(shared.clone(), id, socket));
                    shared.clients.lock().push(handle);
                }
            }
        });

        Self {
            addr,
            shared,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port())
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_ms: 1000,
            ..ConnectionConfig::new(Address::tcp("127.0.0.1", self.port()))
        }
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Drop every client socket.
    pub fn disconnect_all(&self) {
        for handle in self.shared.clients.lock().drain(..) {
            handle.abort();
        }
        self.shared.subscribers.lock().clear();
    }

    /// Write a key behind the clients' backs, as another client would.
    pub fn set(&self, db: i64, key: &str, value: &str) {
        let key = (db, Bytes::copy_from_slice(key.as_bytes()));
        self.shared
            .data
            .lock()
            .insert(key.clone(), Bytes::copy_from_slice(value.as_bytes()));
        self.shared.touch(&key);
    }

    pub fn get(&self, db: i64, key: &str) -> Option<Bytes> {
        self.shared
            .data
            .lock()
            .get(&(db, Bytes::copy_from_slice(key.as_bytes())))
            .cloned()
    }

    /// Deliver a message to every subscriber, as PUBLISH would.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        publish(&self.shared, channel.as_bytes(), payload.as_bytes())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.disconnect_all();
    }
}

pub async fn connect(server: &MockServer) -> RedisConnection {
    RedisConnection::connect(&server.config()).await.unwrap()
}

pub fn bulk(s: &str) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

pub fn ok() -> RespValue {
    RespValue::SimpleString("OK".into())
}

// ── Server side ────────────────────────────────────────────────────

struct Client {
    id: u64,
    db: i64,
    authed: bool,
    multi: Option<Vec<(String, Vec<Bytes>)>>,
    multi_aborted: bool,
    watched: Vec<(Key, u64)>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    quit: bool,
}

async fn serve(shared: Arc<Shared>, id: u64, mut socket: TcpStream) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut client = Client {
        id,
        db: 0,
        authed: shared.password.is_none(),
        multi: None,
        multi_aborted: false,
        watched: Vec::new(),
        tx,
        quit: false,
    };
    let mut decoder = Decoder::new();

    'conn: loop {
        loop {
            match decoder.try_take() {
                Ok(Some(RespValue::Array(items))) => {
                    let args: Vec<Bytes> = items.into_iter().filter_map(RespValue::into_bytes).collect();
                    let reply = client.handle(&shared, args);
                    if socket.write_all(&reply).await.is_err() || client.quit {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Ok(Some(_)) | Err(_) => break 'conn,
            }
        }

        tokio::select! {
            read = socket.read_buf(decoder.read_buf_mut()) => match read {
                Ok(0) | Err(_) => break 'conn,
                Ok(_) => {}
            },
            Some(frame) = rx.recv() => {
                if socket.write_all(&frame).await.is_err() {
                    break 'conn;
                }
            }
        }
    }
    shared.subscribers.lock().remove(&id);
}

const DATA_COMMANDS: &[&str] = &[
    "PING", "ECHO", "GET", "SET", "INCR", "DEL", "EXISTS", "SELECT", "PUBLISH",
];

impl Client {
    fn handle(&mut self, shared: &Shared, args: Vec<Bytes>) -> Vec<u8> {
        let Some((name, args)) = args.split_first() else {
            return error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        if !self.authed && name != "AUTH" {
            return error("NOAUTH Authentication required.");
        }
        let subscribed = shared.subscription_count(self.id) > 0;
        if subscribed
            && !matches!(
                name.as_str(),
                "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "PING" | "QUIT"
            )
        {
            return error(&format!(
                "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
                name.to_ascii_lowercase()
            ));
        }

        if let Some(queue) = self.multi.as_mut() {
            if !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
                if !DATA_COMMANDS.contains(&name.as_str()) {
                    self.multi_aborted = true;
                    return unknown(&name);
                }
                queue.push((name, args.to_vec()));
                return simple("QUEUED");
            }
        }

        match name.as_str() {
            "PING" if subscribed => {
                push_frame(b"pong", &[args.first().map_or(&b""[..], |a| &a[..])])
            }
            "MULTI" => {
                if self.multi.is_some() {
                    return error("ERR MULTI calls can not be nested");
                }
                self.multi = Some(Vec::new());
                simple("OK")
            }
            "EXEC" => {
                let Some(queue) = self.multi.take() else {
                    return error("ERR EXEC without MULTI");
                };
                let aborted = std::mem::take(&mut self.multi_aborted);
                let watched = std::mem::take(&mut self.watched);
                if aborted {
                    return error("EXECABORT Transaction discarded because of previous errors.");
                }
                if watched.iter().any(|(key, seen)| shared.version(key) != *seen) {
                    return b"*-1\r\n".to_vec();
                }
                let mut out = format!("*{}\r\n", queue.len()).into_bytes();
                for (name, args) in queue {
                    out.extend(self.run(shared, &name, &args));
                }
                out
            }
            "DISCARD" => {
                if self.multi.take().is_none() {
                    return error("ERR DISCARD without MULTI");
                }
                self.multi_aborted = false;
                self.watched.clear();
                simple("OK")
            }
            "WATCH" => {
                if self.multi.is_some() {
                    return error("ERR WATCH inside MULTI is not allowed");
                }
                for key in args {
                    let key = (self.db, key.clone());
                    let version = shared.version(&key);
                    self.watched.push((key, version));
                }
                simple("OK")
            }
            "UNWATCH" => {
                self.watched.clear();
                simple("OK")
            }
            "AUTH" => {
                let password = match args {
                    [password] | [_, password] => password,
                    _ => return wrong_arity("auth"),
                };
                match &shared.password {
                    None => error("ERR AUTH called without any password configured"),
                    Some(expected) if expected.as_bytes() == &password[..] => {
                        self.authed = true;
                        simple("OK")
                    }
                    Some(_) => error("ERR invalid password"),
                }
            }
            "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                self.pubsub(shared, &name, args)
            }
            "QUIT" => {
                self.quit = true;
                simple("OK")
            }
            _ => self.run(shared, &name, args),
        }
    }

    fn run(&mut self, shared: &Shared, name: &str, args: &[Bytes]) -> Vec<u8> {
        match (name, args) {
            ("PING", []) => simple("PONG"),
            ("PING", [message]) | ("ECHO", [message]) => bulk_reply(message),
            ("GET", [key]) => match shared.data.lock().get(&(self.db, key.clone())) {
                Some(value) => bulk_reply(value),
                None => b"$-1\r\n".to_vec(),
            },
            ("SET", [key, value]) => {
                let key = (self.db, key.clone());
                shared.data.lock().insert(key.clone(), value.clone());
                shared.touch(&key);
                simple("OK")
            }
            ("INCR", [key]) => {
                let key = (self.db, key.clone());
                let mut data = shared.data.lock();
                let current = match data.get(&key) {
                    None => 0,
                    Some(raw) => match std::str::from_utf8(raw).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => n,
                        None => return error("ERR value is not an integer or out of range"),
                    },
                };
                data.insert(key.clone(), Bytes::from((current + 1).to_string()));
                drop(data);
                shared.touch(&key);
                integer(current + 1)
            }
            ("DEL", keys) if !keys.is_empty() => {
                let mut removed = 0;
                for key in keys {
                    let key = (self.db, key.clone());
                    if shared.data.lock().remove(&key).is_some() {
                        shared.touch(&key);
                        removed += 1;
                    }
                }
                integer(removed)
            }
            ("EXISTS", keys) if !keys.is_empty() => {
                let data = shared.data.lock();
                let found = keys
                    .iter()
                    .filter(|key| data.contains_key(&(self.db, (*key).clone())))
                    .count();
                integer(found as i64)
            }
            ("SELECT", [index]) => {
                match std::str::from_utf8(index).ok().and_then(|s| s.parse::<i64>().ok()) {
                    Some(db) if (0..16).contains(&db) => {
                        self.db = db;
                        simple("OK")
                    }
                    Some(_) => error("ERR DB index is out of range"),
                    None => error("ERR value is not an integer or out of range"),
                }
            }
            ("PUBLISH", [channel, payload]) => integer(publish(shared, channel, payload) as i64),
            (name, _) if DATA_COMMANDS.contains(&name) => wrong_arity(&name.to_ascii_lowercase()),
            (name, _) => unknown(name),
        }
    }

    fn pubsub(&mut self, shared: &Shared, name: &str, args: &[Bytes]) -> Vec<u8> {
        let kind = name.to_ascii_lowercase();
        let is_pattern = name.starts_with('P');
        let subscribe = !name.contains("UNSUB");

        let mut subscribers = shared.subscribers.lock();
        let entry = subscribers.entry(self.id).or_insert_with(|| Subscriber {
            tx: self.tx.clone(),
            channels: HashSet::new(),
            patterns: HashSet::new(),
        });

        let targets: Vec<Bytes> = if args.is_empty() && !subscribe {
            let current = if is_pattern {
                &entry.patterns
            } else {
                &entry.channels
            };
            current.iter().cloned().collect()
        } else {
            args.to_vec()
        };

        let mut out = Vec::new();
        if targets.is_empty() {
            let count = entry.channels.len() + entry.patterns.len();
            out.extend(format!("*3\r\n${}\r\n{kind}\r\n$-1\r\n:{count}\r\n", kind.len()).into_bytes());
        }
        for target in targets {
            let set = if is_pattern {
                &mut entry.patterns
            } else {
                &mut entry.channels
            };
            if subscribe {
                set.insert(target.clone());
            } else {
                set.remove(&target);
            }
            let count = entry.channels.len() + entry.patterns.len();
            out.extend(format!("*3\r\n${}\r\n{kind}\r\n${}\r\n", kind.len(), target.len()).into_bytes());
            out.extend_from_slice(&target);
            out.extend(format!("\r\n:{count}\r\n").into_bytes());
        }
        out
    }
}

fn publish(shared: &Shared, channel: &[u8], payload: &[u8]) -> usize {
    let subscribers = shared.subscribers.lock();
    let mut receivers = 0;
    for sub in subscribers.values() {
        if sub.channels.contains(channel) {
            let _ = sub.tx.send(push_frame(b"message", &[channel, payload]));
            receivers += 1;
        }
        for pattern in &sub.patterns {
            if glob_match(pattern, channel) {
                let _ = sub
                    .tx
                    .send(push_frame(b"pmessage", &[pattern, channel, payload]));
                receivers += 1;
            }
        }
    }
    receivers
}

/// `*` and `?` globbing, enough for channel patterns.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Out-of-band array frame: a kind followed by binary-safe items.
fn push_frame(kind: &[u8], items: &[&[u8]]) -> Vec<u8> {
    let args: Vec<Arg> = items.iter().map(|i| Arg::Bytes(Bytes::copy_from_slice(i))).collect();
    let mut out = Vec::new();
    encode_args(kind, &args, &mut out).unwrap();
    out
}

fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

fn bulk_reply(b: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", b.len()).into_bytes();
    out.extend_from_slice(b);
    out.extend_from_slice(b"\r\n");
    out
}

fn unknown(name: &str) -> Vec<u8> {
    error(&format!("ERR unknown command '{name}'"))
}

fn wrong_arity(name: &str) -> Vec<u8> {
    error(&format!("ERR wrong number of arguments for '{name}' command"))
}
