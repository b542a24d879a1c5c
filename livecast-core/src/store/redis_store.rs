//! Redis-backed realtime store.
//!
//! Every written path is one Redis string key `{prefix}:{path}` holding JSON.
//! Writes keep keys disjoint: writing a path strips its content from ancestor
//! keys and deletes descendant keys. Reads assemble the subtree from the
//! ancestors, the key itself and its descendants. Each mutation publishes
//! the path on `{prefix}:changes`; subscribers re-read their path whenever an
//! overlapping path changes.
//!
//! Multi-key writes are not atomic against concurrent writers of overlapping
//! paths. The application only overlaps writes on a session's own subtree.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{push_key, tree, RealtimeStore, Snapshot, StorePath, Subscription};
use crate::{Error, Result};

/// Keys fetched per SCAN iteration
const SCAN_COUNT: usize = 100;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(url: &str, prefix: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = timeout(op_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Store("Timed out connecting to Redis".to_string()))??;

        info!(prefix = %prefix, "Connected to Redis realtime store");

        Ok(Self {
            client,
            conn,
            prefix: prefix.to_string(),
            op_timeout,
        })
    }

    fn key(&self, path: &StorePath) -> String {
        format!("{}:{}", self.prefix, path)
    }

    fn path_of(&self, key: &str) -> Option<StorePath> {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|raw| StorePath::parse(raw).ok())
    }

    fn changes_channel(&self) -> String {
        format!("{}:changes", self.prefix)
    }

    async fn run<T>(
        &self,
        what: &str,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T> {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Store(format!("Redis {what} timed out")))?
            .map_err(Error::from)
    }

    /// Keys of every path strictly below `path`
    async fn descendant_keys(&self, path: &StorePath) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}/*", escape_glob(&self.key(path)));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;

            keys.extend(batch);
            cursor = next;
            // cursor 0 means iteration complete
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let raw: Vec<Option<String>> = self.run("GET", pipe.query_async(&mut conn)).await?;

        raw.into_iter()
            .map(|json| json.map(|s| serde_json::from_str::<Value>(&s)).transpose())
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        let ancestors = path.ancestors();
        let descendants = self.descendant_keys(path).await?;

        let mut keys: Vec<String> = ancestors.iter().map(|a| self.key(a)).collect();
        keys.push(self.key(path));
        keys.extend(descendants.iter().cloned());
        let values = self.get_many(&keys).await?;

        let mut result = Value::Null;
        for (key, value) in keys.iter().zip(values) {
            let Some(value) = value else { continue };
            let Some(key_path) = self.path_of(key) else {
                continue;
            };
            if let Some(rel) = path.relative_to(&key_path) {
                // Ancestor or the key itself
                if let Some(sub) = tree::get(&value, &rel) {
                    tree::merge(&mut result, sub.clone());
                }
            } else if let Some(rel) = key_path.relative_to(path) {
                let mut node = Value::Null;
                tree::set(&mut node, &rel, value);
                tree::merge(&mut result, node);
            }
        }

        Ok((!result.is_null()).then_some(result))
    }

    /// Strip `path` out of every ancestor key that covers it
    async fn detach_from_ancestors(&self, path: &StorePath) -> Result<()> {
        let ancestors = path.ancestors();
        if ancestors.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = ancestors.iter().map(|a| self.key(a)).collect();
        let values = self.get_many(&keys).await?;
        let mut conn = self.conn.clone();

        for ((ancestor, key), value) in ancestors.iter().zip(&keys).zip(values) {
            let Some(mut value) = value else { continue };
            let Some(rel) = path.relative_to(ancestor) else {
                continue;
            };
            if !tree::remove(&mut value, &rel) {
                continue;
            }
            if value.is_null() {
                let _: () = self
                    .run("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
                    .await?;
            } else {
                let json = serde_json::to_string(&value)?;
                let _: () = self
                    .run("SET", redis::cmd("SET").arg(key).arg(json).query_async(&mut conn))
                    .await?;
            }
        }
        Ok(())
    }

    /// Replace (`Some`) or delete (`None`) the subtree at `path`
    async fn write(&self, path: &StorePath, value: Option<Value>) -> Result<()> {
        self.detach_from_ancestors(path).await?;
        let descendants = self.descendant_keys(path).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &descendants {
            pipe.del(key).ignore();
        }
        match value.filter(|v| !tree::is_absent(v)) {
            Some(value) => {
                pipe.set(self.key(path), serde_json::to_string(&value)?).ignore();
            }
            None => {
                pipe.del(self.key(path)).ignore();
            }
        }

        let mut conn = self.conn.clone();
        let _: () = self.run("write", pipe.query_async(&mut conn)).await?;
        self.announce(path).await
    }

    async fn announce(&self, path: &StorePath) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = self
            .run(
                "PUBLISH",
                redis::cmd("PUBLISH")
                    .arg(self.changes_channel())
                    .arg(path.as_str())
                    .query_async(&mut conn),
            )
            .await?;
        debug!(path = %path, receivers, "Announced store change");
        Ok(())
    }
}

#[async_trait]
impl RealtimeStore for RedisStore {
    async fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        self.write(path, Some(value)).await
    }

    async fn set_if_absent(&self, path: &StorePath, value: Value) -> Result<bool> {
        if self.read(path).await?.is_some() {
            return Ok(false);
        }
        if tree::is_absent(&value) {
            return Ok(true);
        }
        let mut conn = self.conn.clone();
        let written: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(self.key(path))
                    .arg(serde_json::to_string(&value)?)
                    .arg("NX")
                    .query_async(&mut conn),
            )
            .await?;
        if written.is_none() {
            return Ok(false);
        }
        self.announce(path).await?;
        Ok(true)
    }

    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        self.read(path).await
    }

    async fn push(&self, path: &StorePath, value: Value) -> Result<String> {
        let key = push_key();
        self.write(&path.child(&key)?, Some(value)).await?;
        Ok(key)
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        self.write(path, None).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let mut pubsub = timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| Error::Store("Timed out getting Redis Pub/Sub connection".to_string()))??;
        let channel = self.changes_channel();
        timeout(self.op_timeout, pubsub.subscribe(&channel))
            .await
            .map_err(|_| Error::Store(format!("Timed out subscribing to {channel}")))??;

        // Read after subscribing so no change between the two is lost
        let initial = self.read(path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Snapshot {
            path: path.clone(),
            value: initial.clone(),
        });

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let store = self.clone();
        let watched = path.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            let mut last = initial;

            loop {
                let msg = tokio::select! {
                    () = cancel.cancelled() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!(path = %watched, "Redis change feed closed");
                    break;
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "Invalid change payload");
                        continue;
                    }
                };
                let Ok(changed) = StorePath::parse(&payload) else {
                    continue;
                };
                if !watched.overlaps(&changed) {
                    continue;
                }

                match store.read(&watched).await {
                    Ok(value) => {
                        if value == last {
                            continue;
                        }
                        last.clone_from(&value);
                        if tx
                            .send(Snapshot {
                                path: watched.clone(),
                                value,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(path = %watched, error = %e, "Failed to refresh subscription, waiting for the next change");
                    }
                    Err(e) => {
                        error!(path = %watched, error = %e, "Unreadable value at subscribed path");
                    }
                }
            }

            debug!(path = %watched, "Redis subscription stopped");
        });

        Ok(Subscription::new(path.clone(), rx, Some(guard)))
    }
}

/// Escape Redis glob metacharacters
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
