use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use moka::future::Cache;

pub(crate) trait KeyType: Clone + fmt::Debug + Hash + Eq + Send + Sync + 'static {}
pub(crate) trait ValueType: Clone + Send + Sync + 'static {}

// Blanket implementation which satisfies the compiler
impl<K> KeyType for K
where
    K: Clone + fmt::Debug + Hash + Eq + Send + Sync + 'static,
{
    // Nothing to implement, since K already supports the other traits.
    // It has the functions it needs already
}

// Blanket implementation which satisfies the compiler
impl<V> ValueType for V
where
    V: Clone + Send + Sync + 'static,
{
    // Nothing to implement, since V already supports the other traits.
    // It has the functions it needs already
}

/// Bounded in-memory storage whose entries expire a fixed time after insertion.
#[derive(Clone)]
pub(crate) struct InMemoryCache<K: KeyType, V: ValueType> {
    inner: Cache<K, V>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: KeyType,
    V: ValueType,
{
    pub(crate) fn new(max_capacity: u64, time_to_live: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(time_to_live)
                .build(),
        }
    }

    pub(crate) async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    pub(crate) async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

impl<K, V> fmt::Debug for InMemoryCache<K, V>
where
    K: KeyType,
    V: ValueType,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}
