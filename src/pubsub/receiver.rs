//! Many subscriptions, one queue.
//!
//! A [`Receiver`] hands out one [`Sender`] per channel or pattern. Each
//! sender is a [`Subscription`] that can be passed to `execute_pubsub`;
//! messages from all of them land in the receiver's single queue, tagged
//! with the sender they came through.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{MuxredisError, Result};
use crate::pubsub::{Message, Subscription};

/// Decides whether a receiver stops once one of its senders closes.
pub trait ClosePolicy: Send + Sync + fmt::Debug {
    /// Called after `sender` was closed and deregistered. `remaining` is the
    /// number of senders still registered.
    fn should_stop(&self, sender: &Sender, remaining: usize) -> bool;
}

/// Stop when the last registered sender closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopWhenIdle;

impl ClosePolicy for StopWhenIdle {
    fn should_stop(&self, _sender: &Sender, remaining: usize) -> bool {
        remaining == 0
    }
}

/// Never stop on sender close; only [`Receiver::stop`] ends the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepRunning;

impl ClosePolicy for KeepRunning {
    fn should_stop(&self, _sender: &Sender, _remaining: usize) -> bool {
        false
    }
}

/// Fan-in queue over any number of subscriptions.
#[derive(Debug, Clone)]
pub struct Receiver {
    inner: Arc<ReceiverInner>,
}

#[derive(Debug)]
struct ReceiverInner {
    state: SyncMutex<ReceiverState>,
    notify: Notify,
    policy: Box<dyn ClosePolicy>,
}

#[derive(Debug)]
struct ReceiverState {
    queue: VecDeque<(Arc<Sender>, Message)>,
    channels: HashMap<Bytes, Arc<Sender>>,
    patterns: HashMap<Bytes, Arc<Sender>>,
    running: bool,
    end_delivered: bool,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self::with_policy(StopWhenIdle)
    }

    pub fn with_policy(policy: impl ClosePolicy + 'static) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                state: SyncMutex::new(ReceiverState {
                    queue: VecDeque::new(),
                    channels: HashMap::new(),
                    patterns: HashMap::new(),
                    running: true,
                    end_delivered: false,
                }),
                notify: Notify::new(),
                policy: Box::new(policy),
            }),
        }
    }

    /// Sender for a channel name. An open sender for the same name is reused.
    pub fn channel(&self, name: impl AsRef<[u8]>) -> Arc<Sender> {
        self.sender(name.as_ref(), false)
    }

    /// Sender for a pattern. An open sender for the same pattern is reused.
    pub fn pattern(&self, pattern: impl AsRef<[u8]>) -> Arc<Sender> {
        self.sender(pattern.as_ref(), true)
    }

    fn sender(&self, name: &[u8], is_pattern: bool) -> Arc<Sender> {
        let mut state = self.inner.state.lock();
        state.running = true;
        state.end_delivered = false;

        let registry = if is_pattern {
            &mut state.patterns
        } else {
            &mut state.channels
        };
        if let Some(existing) = registry.get(name) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let name = Bytes::copy_from_slice(name);
        let receiver = Arc::downgrade(&self.inner);
        let sender = Arc::new_cyclic(|me| Sender {
            name: name.clone(),
            is_pattern,
            closed: AtomicBool::new(false),
            receiver,
            me: me.clone(),
        });
        registry.insert(name, sender.clone());
        sender
    }

    /// Registered channel senders.
    pub fn channels(&self) -> HashMap<Bytes, Arc<Sender>> {
        self.inner.state.lock().channels.clone()
    }

    /// Registered pattern senders.
    pub fn patterns(&self) -> HashMap<Bytes, Arc<Sender>> {
        self.inner.state.lock().patterns.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// True while messages are queued or any registered sender is open.
    pub fn is_active(&self) -> bool {
        let state = self.inner.state.lock();
        !state.queue.is_empty()
            || state
                .channels
                .values()
                .chain(state.patterns.values())
                .any(|s| !s.is_closed())
    }

    /// Next message with the sender it arrived through.
    ///
    /// After the receiver stops and its queue drains, returns `Ok(None)` once
    /// and [`MuxredisError::ChannelClosed`] afterwards.
    pub async fn get(&self) -> Result<Option<(Arc<Sender>, Message)>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    return Ok(Some(item));
                }
                if !state.running {
                    if state.end_delivered {
                        return Err(MuxredisError::ChannelClosed);
                    }
                    state.end_delivered = true;
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Wait until a message is queued. Returns `false` once stopped and empty.
    pub async fn wait_message(&self) -> bool {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if !state.running {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting messages. Already queued messages stay readable.
    pub fn stop(&self) {
        self.inner.state.lock().running = false;
        self.inner.notify.notify_waiters();
    }
}

impl ReceiverInner {
    fn push(&self, sender: Arc<Sender>, message: Message) {
        {
            let mut state = self.state.lock();
            if !state.running {
                debug!(
                    channel = %String::from_utf8_lossy(&message.channel),
                    "message after receiver stop dropped"
                );
                return;
            }
            state.queue.push_back((sender, message));
        }
        self.notify.notify_waiters();
    }

    fn sender_closed(&self, sender: &Sender) {
        {
            let mut state = self.state.lock();
            let registry = if sender.is_pattern {
                &mut state.patterns
            } else {
                &mut state.channels
            };
            let registered = registry
                .get(&sender.name)
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), sender));
            if registered {
                registry.remove(&sender.name);
            }
            let remaining = state.channels.len() + state.patterns.len();
            if self.policy.should_stop(sender, remaining) {
                state.running = false;
            }
        }
        self.notify.notify_waiters();
    }
}

/// One channel or pattern feeding a [`Receiver`].
pub struct Sender {
    name: Bytes,
    is_pattern: bool,
    closed: AtomicBool,
    receiver: Weak<ReceiverInner>,
    me: Weak<Sender>,
}

impl Sender {
    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The receiver this sender feeds, if it is still alive.
    pub fn receiver(&self) -> Option<Receiver> {
        self.receiver.upgrade().map(|inner| Receiver { inner })
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("is_pattern", &self.is_pattern)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription for Sender {
    fn name(&self) -> &Bytes {
        &self.name
    }

    fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    fn is_active(&self) -> bool {
        !self.is_closed()
    }

    fn put(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        let (Some(receiver), Some(me)) = (self.receiver.upgrade(), self.me.upgrade()) else {
            return;
        };
        receiver.push(me, message);
    }

    fn close(&self, _error: Option<MuxredisError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.sender_closed(self);
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_in_keeps_sender_identity() {
        let mpsc = Receiver::new();
        let news = mpsc.channel("news");
        let sports = mpsc.pattern("sport.*");

        news.put(Message::new("news", "a"));
        sports.put(Message {
            channel: Bytes::from_static(b"sport.f1"),
            pattern: Some(Bytes::from_static(b"sport.*")),
            payload: Bytes::from_static(b"b"),
        });

        let (sender, message) = mpsc.get().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&sender, &news));
        assert_eq!(message.payload, Bytes::from_static(b"a"));

        let (sender, message) = mpsc.get().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&sender, &sports));
        assert_eq!(message.pattern.as_deref(), Some(&b"sport.*"[..]));
    }

    #[test]
    fn open_senders_are_reused() {
        let mpsc = Receiver::new();
        let a = mpsc.channel("news");
        let b = mpsc.channel("news");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mpsc.channels().len(), 1);

        Subscription::close(a.as_ref(), None);
        let c = mpsc.channel("news");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn stops_when_last_sender_closes() {
        let mpsc = Receiver::new();
        let a = mpsc.channel("a");
        let b = mpsc.channel("b");
        a.put(Message::new("a", "1"));

        Subscription::close(a.as_ref(), None);
        assert!(mpsc.is_running());
        assert!(mpsc.channels().get(&b"a"[..]).is_none());

        Subscription::close(b.as_ref(), None);
        assert!(!mpsc.is_running());

        // queued message survives the stop
        assert!(mpsc.is_active());
        assert!(mpsc.get().await.unwrap().is_some());
        assert!(mpsc.get().await.unwrap().is_none());
        assert!(matches!(mpsc.get().await, Err(MuxredisError::ChannelClosed)));
        assert!(!mpsc.is_active());
    }

    #[tokio::test]
    async fn keep_running_ignores_closed_senders() {
        let mpsc = Receiver::with_policy(KeepRunning);
        let a = mpsc.channel("a");
        Subscription::close(a.as_ref(), None);
        assert!(mpsc.is_running());

        mpsc.stop();
        assert!(!mpsc.wait_message().await);
    }

    #[tokio::test]
    async fn messages_after_stop_are_dropped() {
        let mpsc = Receiver::with_policy(KeepRunning);
        let a = mpsc.channel("a");
        mpsc.stop();
        a.put(Message::new("a", "late"));
        assert!(mpsc.is_empty());
    }

    #[tokio::test]
    async fn wait_message_wakes_on_put() {
        let mpsc = Receiver::new();
        let a = mpsc.channel("a");
        let waiter = {
            let mpsc = mpsc.clone();
            tokio::spawn(async move { mpsc.wait_message().await })
        };
        tokio::task::yield_now().await;
        a.put(Message::new("a", "x"));
        assert!(waiter.await.unwrap());
        assert_eq!(mpsc.len(), 1);
    }
}
