//! Query cache
//!
//! Process-wide cache manager keyed by `(namespace, params...)`.
//!
//! - Values are replaced whole (`Arc<T>`), so readers never observe a
//!   partially appended page list.
//! - At most one fetch is in flight per key; concurrent callers join it.
//! - Every entry carries a generation. Cancelling or removing a key moves it
//!   to a new generation, and a fetch that completes under an older
//!   generation drops its result instead of writing it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::RwLock;

use crate::error::XrpcError;
use crate::metrics::{
    QUERY_CACHE_DEDUPLICATED_TOTAL, QUERY_CACHE_DISCARDED_TOTAL, QUERY_CACHE_HITS_TOTAL,
    QUERY_CACHE_MISSES_TOTAL, QUERY_CACHE_SIZE,
};

/// Generations are unique across all caches so a removed and re-created
/// key never reuses one.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Keys
// =============================================================================

/// Cache key: a namespace plus ordered parameters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey {
    namespace: String,
    params: Vec<String>,
}

impl QueryKey {
    pub fn new<I, S>(namespace: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.to_string(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Key with no parameters
    pub fn root(namespace: &str) -> Self {
        Self::new(namespace, Vec::<String>::new())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)?;
        for param in &self.params {
            write!(f, "/{}", param)?;
        }
        Ok(())
    }
}

// =============================================================================
// Entries
// =============================================================================

type InFlight<T> = Shared<BoxFuture<'static, Result<Arc<T>, XrpcError>>>;

struct Entry<T> {
    data: Option<Arc<T>>,
    updated_at: Option<Instant>,
    invalidated: bool,
    generation: u64,
    /// Fetch id and the shared future of the request in flight
    in_flight: Option<(u64, InFlight<T>)>,
}

impl<T> Entry<T> {
    fn new() -> Self {
        Self {
            data: None,
            updated_at: None,
            invalidated: false,
            generation: next_generation(),
            in_flight: None,
        }
    }

    fn is_fresh(&self, stale_time: Duration) -> bool {
        match (&self.data, self.updated_at) {
            (Some(_), Some(updated_at)) => !self.invalidated && updated_at.elapsed() < stale_time,
            _ => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of keys
    pub total_entries: usize,
    /// Keys holding data
    pub populated_entries: usize,
    /// Keys with a fetch in flight
    pub in_flight: usize,
    /// Keys explicitly invalidated
    pub invalidated: usize,
}

// =============================================================================
// Query Cache
// =============================================================================

/// Cache manager for one value type
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct QueryCache<T> {
    entries: Arc<RwLock<BTreeMap<QueryKey, Entry<T>>>>,
    next_fetch_id: Arc<AtomicU64>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_fetch_id: Arc::clone(&self.next_fetch_id),
        }
    }
}

impl<T> Default for QueryCache<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueryCache<T>
where
    T: Send + Sync + 'static,
{
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            next_fetch_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Current value for a key
    pub async fn get(&self, key: &QueryKey) -> Option<Arc<T>> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| entry.data.clone())
    }

    /// Whether a fetch is in flight for a key
    pub async fn is_fetching(&self, key: &QueryKey) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|entry| entry.in_flight.is_some())
    }

    /// Whether the value is missing, invalidated or older than `stale_time`
    pub async fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| !entry.is_fresh(stale_time))
            .unwrap_or(true)
    }

    /// Replace the value for a key
    pub async fn set(&self, key: &QueryKey, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.data = Some(Arc::clone(&value));
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        Self::report_size(&entries, key.namespace());
        value
    }

    /// Copy-on-write patch of an existing value
    ///
    /// `f` returns `None` to leave the value as is. Returns whether the
    /// value was replaced.
    pub async fn update<F>(&self, key: &QueryKey, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let Some(current) = entry.data.as_deref() else {
            return false;
        };
        match f(current) {
            Some(next) => {
                entry.data = Some(Arc::new(next));
                true
            }
            None => false,
        }
    }

    /// Mark a key stale; the next `get_or_fetch` refetches
    pub async fn invalidate(&self, key: &QueryKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.invalidated = true;
            tracing::debug!(key = %key, "Invalidated query");
        }
    }

    /// Mark every key of a namespace stale
    pub async fn invalidate_namespace(&self, namespace: &str) {
        let mut entries = self.entries.write().await;
        let mut count = 0usize;
        for (_, entry) in entries
            .iter_mut()
            .filter(|(key, _)| key.namespace() == namespace)
        {
            entry.invalidated = true;
            count += 1;
        }
        tracing::debug!(namespace = %namespace, count, "Invalidated namespace");
    }

    /// Abandon the fetch in flight for a key
    ///
    /// The request's eventual result is discarded.
    pub async fn cancel(&self, key: &QueryKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.generation = next_generation();
            if entry.in_flight.take().is_some() {
                tracing::debug!(key = %key, "Cancelled in-flight query");
            }
        }
    }

    /// Drop a key, its value and any fetch in flight
    pub async fn remove(&self, key: &QueryKey) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Self::report_size(&entries, key.namespace());
    }

    /// Drop every key
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let namespaces: Vec<String> = entries
            .keys()
            .map(|key| key.namespace().to_string())
            .collect();
        entries.clear();
        for namespace in namespaces {
            QUERY_CACHE_SIZE.with_label_values(&[&namespace]).set(0);
        }
    }

    /// Run `fetcher` for a key, or join the fetch already in flight
    ///
    /// The fetcher receives the current value and produces the complete new
    /// value. On success the value is stored unless the key was cancelled or
    /// removed meanwhile; on failure the cached value is left untouched.
    pub async fn fetch<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<Arc<T>, XrpcError>
    where
        F: FnOnce(Option<Arc<T>>) -> Fut,
        Fut: Future<Output = Result<T, XrpcError>> + Send + 'static,
    {
        let shared = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);

            if let Some((_, in_flight)) = &entry.in_flight {
                QUERY_CACHE_DEDUPLICATED_TOTAL
                    .with_label_values(&[key.namespace()])
                    .inc();
                tracing::debug!(key = %key, "Joining in-flight query");
                in_flight.clone()
            } else {
                let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let request = fetcher(entry.data.clone());
                let task = Self::complete(
                    Arc::clone(&self.entries),
                    key.clone(),
                    entry.generation,
                    fetch_id,
                    request,
                )
                .boxed()
                .shared();
                entry.in_flight = Some((fetch_id, task.clone()));
                task
            }
        };

        shared.await
    }

    /// Return a fresh cached value, or fetch
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &QueryKey,
        stale_time: Duration,
        fetcher: F,
    ) -> Result<Arc<T>, XrpcError>
    where
        F: FnOnce(Option<Arc<T>>) -> Fut,
        Fut: Future<Output = Result<T, XrpcError>> + Send + 'static,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.is_fresh(stale_time) {
                    if let Some(data) = &entry.data {
                        QUERY_CACHE_HITS_TOTAL
                            .with_label_values(&[key.namespace()])
                            .inc();
                        return Ok(Arc::clone(data));
                    }
                }
            }
        }

        QUERY_CACHE_MISSES_TOTAL
            .with_label_values(&[key.namespace()])
            .inc();
        self.fetch(key, fetcher).await
    }

    /// Values of every key in the given namespaces
    ///
    /// Grouped by namespace in the order given, then by key order.
    pub async fn snapshot_namespaces(&self, namespaces: &[&str]) -> Vec<(QueryKey, Arc<T>)> {
        let entries = self.entries.read().await;
        namespaces
            .iter()
            .flat_map(|namespace| {
                entries
                    .iter()
                    .filter(move |(key, _)| key.namespace() == *namespace)
                    .filter_map(|(key, entry)| {
                        entry.data.as_ref().map(|data| (key.clone(), Arc::clone(data)))
                    })
            })
            .collect()
    }

    /// Keys currently holding data in a namespace
    pub async fn keys_in_namespace(&self, namespace: &str) -> Vec<QueryKey> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(key, entry)| key.namespace() == namespace && entry.data.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            total_entries: entries.len(),
            populated_entries: entries.values().filter(|e| e.data.is_some()).count(),
            in_flight: entries.values().filter(|e| e.in_flight.is_some()).count(),
            invalidated: entries.values().filter(|e| e.invalidated).count(),
        }
    }

    async fn complete<Fut>(
        entries: Arc<RwLock<BTreeMap<QueryKey, Entry<T>>>>,
        key: QueryKey,
        generation: u64,
        fetch_id: u64,
        request: Fut,
    ) -> Result<Arc<T>, XrpcError>
    where
        Fut: Future<Output = Result<T, XrpcError>> + Send + 'static,
    {
        let result = request.await.map(Arc::new);

        let mut entries = entries.write().await;
        let Some(entry) = entries.get_mut(&key) else {
            QUERY_CACHE_DISCARDED_TOTAL
                .with_label_values(&[key.namespace()])
                .inc();
            tracing::debug!(key = %key, "Discarding result of removed query");
            return result;
        };

        if entry
            .in_flight
            .as_ref()
            .is_some_and(|(id, _)| *id == fetch_id)
        {
            entry.in_flight = None;
        }

        match &result {
            Ok(value) if entry.generation == generation => {
                entry.data = Some(Arc::clone(value));
                entry.updated_at = Some(Instant::now());
                entry.invalidated = false;
                Self::report_size(&entries, key.namespace());
            }
            Ok(_) => {
                QUERY_CACHE_DISCARDED_TOTAL
                    .with_label_values(&[key.namespace()])
                    .inc();
                tracing::debug!(key = %key, "Discarding result of cancelled query");
            }
            Err(error) => {
                tracing::debug!(key = %key, %error, "Query failed");
            }
        }

        result
    }

    fn report_size(entries: &BTreeMap<QueryKey, Entry<T>>, namespace: &str) {
        let size = entries
            .iter()
            .filter(|(key, entry)| key.namespace() == namespace && entry.data.is_some())
            .count();
        QUERY_CACHE_SIZE
            .with_label_values(&[namespace])
            .set(size as i64);
    }
}
