//! Deduplicating work queue for reconcile keys.
//!
//! A key is held at most once while queued, and a key being processed is
//! never handed to a second worker: re-adds during processing are parked in
//! a dirty set and re-queued when [`WorkQueue::done`] is called. Distinct
//! keys run in parallel, same-key reconciles are serialised.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

struct Inner<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key. Returns false when the key was already queued or is
    /// parked behind an in-flight reconcile.
    pub fn add(&self, key: K) -> bool {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return false;
        }
        if !inner.queued.insert(key.clone()) {
            return false;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Enqueue a key after at least `delay`.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Mark a popped key finished. A key re-added while it was processing
    /// goes back onto the queue now.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.processing.remove(key);
        if inner.dirty.remove(key) && inner.queued.insert(key.clone()) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    fn try_pop(&self) -> Option<K> {
        let mut inner = self.inner.lock().expect("queue lock");
        let key = inner.queue.pop_front()?;
        inner.queued.remove(&key);
        inner.processing.insert(key.clone());
        Some(key)
    }

    /// Wait for the next key. The caller owns the key until [`Self::done`].
    pub async fn pop(&self) -> K {
        loop {
            let notified = self.notify.notified();
            if let Some(key) = self.try_pop() {
                // wake the next waiter in case more keys are queued
                self.notify.notify_one();
                return key;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
