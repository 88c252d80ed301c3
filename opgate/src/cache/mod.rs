use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use self::storage::InMemoryCache;
use self::storage::KeyType;
use self::storage::ValueType;

pub(crate) mod storage;

type WaitMap<K, V, E> = Arc<Mutex<HashMap<K, (u64, broadcast::Sender<Result<V, E>>)>>>;

/// TTL cache where concurrent lookups of a missing key share one computation.
///
/// The first caller for a missing key gets an [`Entry`] it must fill with
/// [`Entry::insert`] or fail with [`Entry::send`]. Every other caller for that key waits
/// on the same entry until then.
#[derive(Clone)]
pub(crate) struct DeduplicatingCache<K: KeyType, V: ValueType, E> {
    wait_map: WaitMap<K, V, E>,
    storage: InMemoryCache<K, V>,
    next_id: Arc<AtomicU64>,
}

impl<K, V, E> DeduplicatingCache<K, V, E>
where
    K: KeyType,
    V: ValueType,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(capacity: u64, time_to_live: Duration) -> Self {
        Self {
            wait_map: Arc::new(Mutex::new(HashMap::new())),
            storage: InMemoryCache::new(capacity, time_to_live),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) async fn get(&self, key: &K) -> Entry<K, V, E> {
        if let Some(value) = self.storage.get(key).await {
            return Entry {
                inner: EntryInner::Value(value),
            };
        }

        let (id, sender) = {
            let mut locked_wait_map = self.wait_map.lock();
            if let Some((_, waiter)) = locked_wait_map.get(key) {
                // Register interest in key
                return Entry {
                    inner: EntryInner::Receiver {
                        receiver: waiter.subscribe(),
                    },
                };
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (sender, _receiver) = broadcast::channel(1);
            locked_wait_map.insert(key.clone(), (id, sender.clone()));
            (id, sender)
        };
        let guard = WaitGuard {
            key: key.clone(),
            id,
            wait_map: self.wait_map.clone(),
        };

        // the previous computation may have finished between the lookup and the registration
        if let Some(value) = self.storage.get(key).await {
            drop(guard);
            let _ = sender.send(Ok(value.clone()));
            return Entry {
                inner: EntryInner::Value(value),
            };
        }

        Entry {
            inner: EntryInner::First {
                key: key.clone(),
                sender,
                storage: self.storage.clone(),
                _guard: guard,
            },
        }
    }
}

/// Removes the wait map registration of a computation when it ends, whether it completed,
/// failed or was dropped.
struct WaitGuard<K: KeyType, V: ValueType, E> {
    key: K,
    id: u64,
    wait_map: WaitMap<K, V, E>,
}

impl<K: KeyType, V: ValueType, E> Drop for WaitGuard<K, V, E> {
    fn drop(&mut self) {
        let mut locked_wait_map = self.wait_map.lock();
        if locked_wait_map
            .get(&self.key)
            .is_some_and(|(id, _)| *id == self.id)
        {
            locked_wait_map.remove(&self.key);
        }
    }
}

pub(crate) struct Entry<K: KeyType, V: ValueType, E> {
    inner: EntryInner<K, V, E>,
}

enum EntryInner<K: KeyType, V: ValueType, E> {
    First {
        key: K,
        sender: broadcast::Sender<Result<V, E>>,
        storage: InMemoryCache<K, V>,
        _guard: WaitGuard<K, V, E>,
    },
    Receiver {
        receiver: broadcast::Receiver<Result<V, E>>,
    },
    Value(V),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryError<E> {
    /// The computation failed
    Failed(E),
    /// The first caller must compute the value instead of waiting for it
    IsFirst,
    /// The computation was dropped before sending a value
    RecvError,
}

impl<K, V, E> Entry<K, V, E>
where
    K: KeyType,
    V: ValueType,
    E: Clone + Send + 'static,
{
    pub(crate) fn is_first(&self) -> bool {
        matches!(self.inner, EntryInner::First { .. })
    }

    pub(crate) async fn get(self) -> Result<V, EntryError<E>> {
        match self.inner {
            // there was already a value in cache
            EntryInner::Value(v) => Ok(v),
            EntryInner::Receiver { mut receiver } => receiver
                .recv()
                .await
                .map_err(|_| EntryError::RecvError)?
                .map_err(EntryError::Failed),
            EntryInner::First { .. } => Err(EntryError::IsFirst),
        }
    }

    /// Stores the value then hands it to every waiter.
    pub(crate) async fn insert(self, value: V) {
        if let EntryInner::First {
            key,
            sender,
            storage,
            _guard,
        } = self.inner
        {
            storage.insert(key, value.clone()).await;
            drop(_guard);
            let _ = sender.send(Ok(value));
        }
    }

    /// Hands `error` to every waiter without storing anything.
    pub(crate) fn send(self, error: E) {
        if let EntryInner::First { sender, _guard, .. } = self.inner {
            drop(_guard);
            let _ = sender.send(Err(error));
        }
    }
}
