//! C1 — Event Queue: a bounded, ordered, multi-subscriber fan-out for the
//! events of a single execution.
//!
//! Generalized from a buffer/multiplexer pair feeding one filtered output
//! channel, to "one buffer per subscriber, no filtering" — this queue fans
//! the same ordered stream out to however many subscribers have attached.
//!
//! # Backpressure policy
//!
//! This implementation chooses **drop-oldest-non-terminal**: each subscriber owns
//! a bounded ring buffer (default capacity in [`EventQueue::new`]). When a
//! non-terminal event arrives and a subscriber's buffer is full, the oldest
//! non-terminal event in that buffer is evicted to make room. Terminal
//! lifecycle events (`FlowCompleted`/`FlowFailed`/`FlowCancelled`) are never
//! evicted and are never subject to eviction themselves — they are always
//! appended, growing the buffer past capacity if necessary, since by
//! definition at most a handful of terminal events are ever published to one
//! queue.

use crate::events::{ExecutionEvent, ExecutionEventType};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn is_terminal(event_type: ExecutionEventType) -> bool {
    matches!(
        event_type,
        ExecutionEventType::FlowCompleted
            | ExecutionEventType::FlowFailed
            | ExecutionEventType::FlowCancelled
    )
}

struct Subscriber {
    events: Mutex<VecDeque<ExecutionEvent>>,
    notify: Notify,
}

impl Subscriber {
    fn push(&self, event: ExecutionEvent, capacity: usize) {
        let mut buf = self.events.lock();
        if !is_terminal(event.event_type) && buf.len() >= capacity {
            if let Some(pos) = buf.iter().position(|e| !is_terminal(e.event_type)) {
                buf.remove(pos);
            }
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }
}

struct Inner {
    capacity: usize,
    next_index: AtomicI64,
    closed: AtomicBool,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    on_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// A bounded, ordered, multi-subscriber fan-out for the events of one
/// execution. Cheap to clone — all clones share the same underlying state.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    /// `capacity` bounds each subscriber's buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                next_index: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                on_close: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Append an event to the queue, stamping its monotonic `index`, and
    /// fan it out to every currently-registered subscriber. Returns once
    /// the event has been accepted into every subscriber's buffer — it does
    /// not wait for subscribers to consume it.
    pub fn publish(&self, mut event: ExecutionEvent) -> ExecutionEvent {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst);
        event.index = index;
        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber.push(event.clone(), self.inner.capacity);
        }
        event
    }

    /// Attach a new subscriber. It observes every event from
    /// this moment forward, with no gap relative to later events, and no
    /// history from before it subscribed.
    pub fn subscribe(&self) -> EventIterator {
        let subscriber = Arc::new(Subscriber {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.inner.subscribers.lock().push(subscriber.clone());
        EventIterator {
            queue: self.inner.clone(),
            subscriber,
        }
    }

    /// Register a handler invoked exactly once, after `close()`.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) {
        if self.inner.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.inner.on_close.lock().push(Box::new(callback));
    }

    /// Idempotent. After close, subscriber iterators drain what is already
    /// buffered and then signal end-of-stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<_> = std::mem::take(&mut *self.inner.on_close.lock());
        for callback in callbacks {
            callback();
        }
        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A lazy, per-subscriber sequence of events in publish order.
pub struct EventIterator {
    queue: Arc<Inner>,
    subscriber: Arc<Subscriber>,
}

impl EventIterator {
    /// Await the next event. Returns `None` once the queue is closed and
    /// every buffered event has been drained.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        loop {
            if let Some(event) = self.subscriber.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }
}
