//! Realtime key-value store.
//!
//! The store is a tree of JSON values addressed by [`StorePath`]. It is
//! handed to every service as `Arc<dyn RealtimeStore>`, so tests run against
//! [`MemoryStore`] and deployments against [`RedisStore`].

pub mod memory;
pub mod path;
pub mod redis_store;
pub(crate) mod tree;

pub use memory::MemoryStore;
pub use path::{StorePath, StorePaths};
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::{
    config::{StoreBackend, StoreConfig},
    models::now_millis,
    Result,
};

/// Key prefix of every Redis key and channel
pub const REDIS_KEY_PREFIX: &str = "livecast";

/// Tree-structured realtime key-value store
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Replace the subtree at `path`; writing `null` removes it
    async fn set(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Write only when nothing exists at `path`; returns whether the write happened
    async fn set_if_absent(&self, path: &StorePath, value: Value) -> Result<bool>;

    /// One-shot read of the subtree at `path`
    async fn get(&self, path: &StorePath) -> Result<Option<Value>>;

    /// Append a child with a generated, time-ordered key and return the key
    async fn push(&self, path: &StorePath, value: Value) -> Result<String>;

    /// Delete the subtree at `path`; deleting an absent path is a no-op
    async fn remove(&self, path: &StorePath) -> Result<()>;

    /// Listen to `path`. The current value is delivered first, then a fresh
    /// snapshot after every change at, above, or below `path`.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription>;
}

/// Typed helpers over any [`RealtimeStore`]
#[async_trait]
pub trait RealtimeStoreExt: RealtimeStore {
    async fn get_as<T: DeserializeOwned>(&self, path: &StorePath) -> Result<Option<T>> {
        match self.get(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(&self, path: &StorePath, value: &T) -> Result<()> {
        self.set(path, serde_json::to_value(value)?).await
    }

    async fn push_as<T: Serialize + Sync>(&self, path: &StorePath, value: &T) -> Result<String> {
        self.push(path, serde_json::to_value(value)?).await
    }
}

impl<S: RealtimeStore + ?Sized> RealtimeStoreExt for S {}

/// Value observed at a path
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: StorePath,
    pub value: Option<Value>,
}

impl Snapshot {
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Decode the value; absent values decode to `None`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.value {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Children of an object value, sorted by key
    #[must_use]
    pub fn children(&self) -> Vec<(&str, &Value)> {
        self.value.as_ref().map(tree::children).unwrap_or_default()
    }
}

/// Live feed of snapshots for one path
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    path: StorePath,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    _guard: Option<DropGuard>,
}

impl Subscription {
    pub(crate) const fn new(
        path: StorePath,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        guard: Option<DropGuard>,
    ) -> Self {
        Self {
            path,
            rx,
            _guard: guard,
        }
    }

    #[must_use]
    pub const fn path(&self) -> &StorePath {
        &self.path
    }

    /// Next snapshot, `None` once the store stops delivering
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

impl futures::Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("path", &self.path).finish()
    }
}

static LAST_PUSH_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Generate a push key: 13-digit millisecond timestamp plus 8 random chars.
///
/// Timestamps are strictly increasing within the process, so keys sort in
/// creation order.
#[must_use]
pub fn push_key() -> String {
    let now = now_millis();
    let previous = LAST_PUSH_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    let millis = now.max(previous + 1);
    format!("{millis:013}{}", nanoid::nanoid!(8, &PUSH_KEY_ALPHABET))
}

const PUSH_KEY_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Build the store backend selected in configuration
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn RealtimeStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let store = RedisStore::connect(
                &config.redis_url,
                REDIS_KEY_PREFIX,
                Duration::from_secs(config.operation_timeout_secs),
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
