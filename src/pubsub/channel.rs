use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;

use crate::error::{MuxredisError, Result};
use crate::pubsub::{Message, Subscription};

/// Message queue for one channel or pattern subscription.
///
/// Reading follows a fixed shape: messages while any are queued, then a
/// single `Ok(None)` once the channel is closed and drained, then an error
/// on every later call.
#[derive(Debug)]
pub struct Channel {
    name: Bytes,
    is_pattern: bool,
    state: SyncMutex<ChannelState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<Message>,
    closed: bool,
    end_delivered: bool,
    error: Option<MuxredisError>,
}

impl Channel {
    pub fn new(name: impl Into<Bytes>, is_pattern: bool) -> Self {
        Self {
            name: name.into(),
            is_pattern,
            state: SyncMutex::new(ChannelState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True while messages are queued or more may still arrive.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        !(state.closed && state.queue.is_empty())
    }

    /// Next message, waiting if none is queued.
    ///
    /// Returns `Ok(None)` exactly once after the channel is closed and empty.
    pub async fn get(&self) -> Result<Option<Message>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.poll_state() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait until a message is queued. Returns `false` once the channel is
    /// closed and empty, without consuming the end-of-stream signal.
    pub async fn wait_message(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if state.closed {
                    return false;
                }
            }
            notified.await;
        }
    }

    fn poll_state(&self) -> Option<Result<Option<Message>>> {
        let mut state = self.state.lock();
        if let Some(message) = state.queue.pop_front() {
            return Some(Ok(Some(message)));
        }
        if !state.closed {
            return None;
        }
        if !state.end_delivered {
            state.end_delivered = true;
            return Some(Ok(None));
        }
        Some(Err(state
            .error
            .clone()
            .unwrap_or(MuxredisError::ChannelClosed)))
    }
}

impl Subscription for Channel {
    fn name(&self) -> &Bytes {
        &self.name
    }

    fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    fn is_active(&self) -> bool {
        Channel::is_active(self)
    }

    fn put(&self, message: Message) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.queue.push_back(message);
        }
        self.notify.notify_waiters();
    }

    fn close(&self, error: Option<MuxredisError>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.error = error;
        }
        self.notify.notify_waiters();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ── Tests ──────────────────────────────────────────────────────────
