//! Bounded in-memory cache owned by a single actor task.
//!
//! All reads and writes are messages on one queue, so operations are
//! linearizable without a lock. Entries carry a logical access tick; once the
//! cache grows past its limit the least recently touched entries are trimmed
//! in a batch, which keeps eviction rare under steady growth.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use tokio::sync::oneshot;

use super::messages::{CacheOp, CacheRequest};
use super::post::{Post, PostNo};
use super::ThreadDescriptor;
use crate::config::CacheConfig;
use crate::error::CacheError;

struct CacheEntry<V> {
    value: V,
    last_access: u64,
}

struct CacheActor<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    clock: u64,
    max_size: usize,
    trim_batch: usize,
    requests: Receiver<CacheRequest<K, V>>,
}

impl<K, V> CacheActor<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    async fn run(mut self) {
        while let Ok(request) = self.requests.recv().await {
            let op = request.op();
            tracing::trace!(%op, size = self.entries.len(), "Cache request");
            self.handle(request);

            if op.is_mutating() && self.entries.len() > self.max_size {
                self.evict();
            }
        }
        tracing::debug!("Cache handles dropped, actor stopping");
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn read(&mut self, key: &K) -> Option<V> {
        let tick = self.tick();
        self.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            entry.value.clone()
        })
    }

    fn write(&mut self, key: K, value: V) {
        let last_access = self.tick();
        self.entries.insert(key, CacheEntry { value, last_access });
    }

    fn handle(&mut self, request: CacheRequest<K, V>) {
        match request {
            CacheRequest::Get { key, response } => {
                let _ = response.send(self.read(&key));
            }
            CacheRequest::GetMany { keys, response } => {
                let found = keys
                    .into_iter()
                    .filter_map(|key| self.read(&key).map(|value| (key, value)))
                    .collect();
                let _ = response.send(found);
            }
            CacheRequest::GetAll { response } => {
                let all = self
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect();
                let _ = response.send(all);
            }
            CacheRequest::FilterValues { filter, response } => {
                let values = self
                    .entries
                    .values()
                    .filter(|e| filter(&e.value))
                    .map(|e| e.value.clone())
                    .collect();
                let _ = response.send(values);
            }
            CacheRequest::FirstWhere { predicate, response } => {
                let found = self
                    .entries
                    .values()
                    .find(|e| predicate(&e.value))
                    .map(|e| e.value.clone());
                let _ = response.send(found);
            }
            CacheRequest::IterateWhile { mut visitor, response } => {
                for (key, entry) in &self.entries {
                    if !visitor(key, &entry.value) {
                        break;
                    }
                }
                let _ = response.send(());
            }
            CacheRequest::Store { key, value, response } => {
                self.write(key, value);
                let _ = response.send(());
            }
            CacheRequest::StoreMany { entries, response } => {
                for (key, value) in entries {
                    self.write(key, value);
                }
                let _ = response.send(());
            }
            CacheRequest::UpdateMany {
                keys,
                mut update,
                response,
            } => {
                let mut updated = 0;
                for key in keys {
                    let tick = self.tick();
                    if let Some(entry) = self.entries.get_mut(&key) {
                        update(&mut entry.value);
                        entry.last_access = tick;
                        updated += 1;
                    }
                }
                let _ = response.send(updated);
            }
            CacheRequest::Contains { key, response } => {
                let _ = response.send(self.entries.contains_key(&key));
            }
            CacheRequest::Size { response } => {
                let _ = response.send(self.entries.len());
            }
            CacheRequest::Delete { key, response } => {
                let _ = response.send(self.entries.remove(&key).map(|e| e.value));
            }
            CacheRequest::DeleteMany { keys, response } => {
                let removed = keys
                    .iter()
                    .filter(|key| self.entries.remove(key).is_some())
                    .count();
                let _ = response.send(removed);
            }
            CacheRequest::Clear { response } => {
                self.entries.clear();
                let _ = response.send(());
            }
        }
    }

    /// Drop the least recently touched entries, at least a full trim batch
    fn evict(&mut self) {
        let size = self.entries.len();
        let count = (size - self.max_size).max(self.trim_batch).min(size);

        let mut by_age: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_access, k.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(tick, _)| *tick);

        for (_, key) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
        }

        tracing::debug!(
            evicted = count,
            remaining = self.entries.len(),
            max_size = self.max_size,
            "Cache trimmed"
        );
    }
}

/// Handle to a bounded cache actor. Cheap to clone; all clones share the actor.
pub struct BoundedCache<K, V> {
    requests: Sender<CacheRequest<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn the actor. Must be called from within a Tokio runtime.
    pub fn spawn(max_size: usize, trim_batch: usize) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let actor = CacheActor {
            entries: HashMap::new(),
            clock: 0,
            max_size: max_size.max(1),
            trim_batch: trim_batch.max(1),
            requests: rx,
        };
        tokio::spawn(actor.run());
        Self { requests: tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CacheRequest<K, V>,
    ) -> Result<T, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| CacheError::Closed)?;
        rx.await.map_err(|_| CacheError::Closed)
    }

    pub async fn get(&self, key: K) -> Result<Option<V>, CacheError> {
        self.call(|response| CacheRequest::Get { key, response })
            .await
    }

    pub async fn get_many(&self, keys: Vec<K>) -> Result<HashMap<K, V>, CacheError> {
        self.call(|response| CacheRequest::GetMany { keys, response })
            .await
    }

    pub async fn get_all(&self) -> Result<HashMap<K, V>, CacheError> {
        self.call(|response| CacheRequest::GetAll { response }).await
    }

    pub async fn filter_values<F>(&self, filter: F) -> Result<Vec<V>, CacheError>
    where
        F: Fn(&V) -> bool + Send + 'static,
    {
        self.call(|response| CacheRequest::FilterValues {
            filter: Box::new(filter),
            response,
        })
        .await
    }

    pub async fn first_where<F>(&self, predicate: F) -> Result<Option<V>, CacheError>
    where
        F: Fn(&V) -> bool + Send + 'static,
    {
        self.call(|response| CacheRequest::FirstWhere {
            predicate: Box::new(predicate),
            response,
        })
        .await
    }

    /// Visit entries until the visitor returns `false`.
    pub async fn iterate_while<F>(&self, visitor: F) -> Result<(), CacheError>
    where
        F: FnMut(&K, &V) -> bool + Send + 'static,
    {
        self.call(|response| CacheRequest::IterateWhile {
            visitor: Box::new(visitor),
            response,
        })
        .await
    }

    pub async fn store(&self, key: K, value: V) -> Result<(), CacheError> {
        self.call(|response| CacheRequest::Store {
            key,
            value,
            response,
        })
        .await
    }

    pub async fn store_many(&self, entries: Vec<(K, V)>) -> Result<(), CacheError> {
        self.call(|response| CacheRequest::StoreMany { entries, response })
            .await
    }

    /// Update the values stored under `keys` in place; returns how many existed.
    pub async fn update_many<F>(&self, keys: Vec<K>, update: F) -> Result<usize, CacheError>
    where
        F: FnMut(&mut V) + Send + 'static,
    {
        self.call(|response| CacheRequest::UpdateMany {
            keys,
            update: Box::new(update),
            response,
        })
        .await
    }

    pub async fn contains(&self, key: K) -> Result<bool, CacheError> {
        self.call(|response| CacheRequest::Contains { key, response })
            .await
    }

    pub async fn size(&self) -> Result<usize, CacheError> {
        self.call(|response| CacheRequest::Size { response }).await
    }

    pub async fn delete(&self, key: K) -> Result<Option<V>, CacheError> {
        self.call(|response| CacheRequest::Delete { key, response })
            .await
    }

    pub async fn delete_many(&self, keys: Vec<K>) -> Result<usize, CacheError> {
        self.call(|response| CacheRequest::DeleteMany { keys, response })
            .await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.call(|response| CacheRequest::Clear { response }).await
    }
}

/// Posts of one thread keyed by number
pub type ThreadPosts = BTreeMap<PostNo, Post>;

/// Process-wide cache of thread posts shared by all engines.
#[derive(Clone)]
pub struct PostCache {
    inner: BoundedCache<ThreadDescriptor, ThreadPosts>,
}

impl PostCache {
    pub fn spawn(config: &CacheConfig) -> Self {
        Self {
            inner: BoundedCache::spawn(config.max_threads, config.trim_batch()),
        }
    }

    /// Posts of a thread in ascending order; empty when not cached
    pub async fn thread_posts(&self, thread: &ThreadDescriptor) -> Result<Vec<Post>, CacheError> {
        Ok(self
            .inner
            .get(thread.clone())
            .await?
            .map(|posts| posts.into_values().collect())
            .unwrap_or_default())
    }

    pub async fn original_post(&self, thread: &ThreadDescriptor) -> Result<Option<Post>, CacheError> {
        Ok(self
            .inner
            .get(thread.clone())
            .await?
            .and_then(|posts| posts.into_values().find(|p| p.is_op)))
    }

    /// Replace the cached posts of a thread
    pub async fn put_thread(&self, thread: ThreadDescriptor, posts: &[Post]) -> Result<(), CacheError> {
        let posts: ThreadPosts = posts.iter().map(|p| (p.no, p.clone())).collect();
        self.inner.store(thread, posts).await
    }

    pub async fn contains_thread(&self, thread: &ThreadDescriptor) -> Result<bool, CacheError> {
        self.inner.contains(thread.clone()).await
    }

    pub async fn forget_thread(&self, thread: &ThreadDescriptor) -> Result<bool, CacheError> {
        Ok(self.inner.delete(thread.clone()).await?.is_some())
    }

    pub async fn thread_count(&self) -> Result<usize, CacheError> {
        self.inner.size().await
    }

    /// Number of posts across every cached thread
    pub async fn total_post_count(&self) -> Result<usize, CacheError> {
        let total = Arc::new(AtomicUsize::new(0));
        let counter = total.clone();
        self.inner
            .iterate_while(move |_, posts| {
                counter.fetch_add(posts.len(), Ordering::Relaxed);
                true
            })
            .await?;
        Ok(total.load(Ordering::Relaxed))
    }
}
