//! In-process realtime store.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use super::{push_key, tree, RealtimeStore, Snapshot, StorePath, Subscription};
use crate::Result;

/// Realtime store holding one JSON tree in memory
///
/// Mutations and their notifications happen under one lock, so every
/// subscriber observes snapshots in mutation order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    watchers: Vec<Watcher>,
}

struct Watcher {
    path: StorePath,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Snapshot>,
}

fn segments(path: &StorePath) -> Vec<&str> {
    path.segments().collect()
}

impl Inner {
    fn read(&self, path: &StorePath) -> Option<Value> {
        tree::get(&self.root, &segments(path)).cloned()
    }

    fn write(&mut self, path: &StorePath, value: Value) {
        tree::set(&mut self.root, &segments(path), value);
        self.notify(path);
    }

    /// Deliver a snapshot to every watcher whose value may have changed
    fn notify(&mut self, changed: &StorePath) {
        let root = &self.root;
        self.watchers.retain_mut(|watcher| {
            if watcher.tx.is_closed() {
                return false;
            }
            if !watcher.path.overlaps(changed) {
                return true;
            }
            let current = tree::get(root, &segments(&watcher.path)).cloned();
            if current == watcher.last {
                return true;
            }
            watcher.last.clone_from(&current);
            watcher
                .tx
                .send(Snapshot {
                    path: watcher.path.clone(),
                    value: current,
                })
                .is_ok()
        });
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions (closed ones are pruned on the next write)
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        trace!(path = %path, "memory store set");
        self.inner.lock().write(path, value);
        Ok(())
    }

    async fn set_if_absent(&self, path: &StorePath, value: Value) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.read(path).is_some() {
            return Ok(false);
        }
        inner.write(path, value);
        Ok(true)
    }

    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        Ok(self.inner.lock().read(path))
    }

    async fn push(&self, path: &StorePath, value: Value) -> Result<String> {
        let key = push_key();
        let child = path.child(&key)?;
        self.inner.lock().write(&child, value);
        Ok(key)
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        trace!(path = %path, "memory store remove");
        let mut inner = self.inner.lock();
        if tree::remove(&mut inner.root, &segments(path)) {
            inner.notify(path);
        }
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let current = inner.read(path);
        // Receiver is alive, the initial send cannot fail
        let _ = tx.send(Snapshot {
            path: path.clone(),
            value: current.clone(),
        });
        inner.watchers.push(Watcher {
            path: path.clone(),
            last: current,
            tx,
        });
        Ok(Subscription::new(path.clone(), rx, None))
    }
}
