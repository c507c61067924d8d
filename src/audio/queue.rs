// Bounded outbound fragment queue
//
// Capture pushes without ever waiting on the network. When the queue is full
// the oldest fragment is dropped so the newest speech always gets through.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

use super::backend::AudioFragment;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

struct Inner {
    items: Mutex<VecDeque<AudioFragment>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Drop-oldest queue shared between the capture task and the network forwarder
#[derive(Clone)]
pub struct FragmentQueue {
    inner: Arc<Inner>,
}

impl FragmentQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue without blocking. Returns the fragment evicted to make room, if any.
    pub fn push(&self, fragment: AudioFragment) -> Option<AudioFragment> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }

        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.inner.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(fragment);
            evicted
        };

        if evicted.is_some() {
            let total = self.inner.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "Outbound audio queue full ({}), dropped oldest fragment ({} dropped total)",
                self.inner.capacity, total
            );
        }

        self.inner.notify.notify_one();
        evicted
    }

    /// Wait for the next fragment. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<AudioFragment> {
        loop {
            let notified = self.inner.notify.notified();

            if let Some(fragment) = self.lock().pop_front() {
                return Some(fragment);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }

    /// Stop accepting fragments and wake the consumer
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Drop everything still queued
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let n = items.len();
        items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AudioFragment>> {
        // A poisoned queue still holds valid fragments
        self.inner
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
