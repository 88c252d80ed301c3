use std::sync::Arc;

use tracing::Instrument;

use super::PreparedPlan;
use super::QueryPlanner;
use crate::cache::DeduplicatingCache;
use crate::cache::EntryError;
use crate::configuration::PlanCache;
use crate::error::CacheResolverError;
use crate::error::PlanError;

/// A query planner wrapper that caches prepared plans.
///
/// Concurrent requests for the same operation shape share a single planning task.
/// Failures reach every waiter and are never cached.
pub struct CachingQueryPlanner<T: QueryPlanner> {
    cache: DeduplicatingCache<u64, Arc<PreparedPlan<T::Plan>>, Arc<PlanError>>,
    delegate: Arc<T>,
}

impl<T: QueryPlanner> Clone for CachingQueryPlanner<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            delegate: self.delegate.clone(),
        }
    }
}

impl<T: QueryPlanner> CachingQueryPlanner<T> {
    pub fn new(delegate: Arc<T>, config: &PlanCache) -> Self {
        Self {
            cache: DeduplicatingCache::new(config.capacity, config.ttl),
            delegate,
        }
    }

    pub async fn plan(
        &self,
        query: &str,
        operation_name: Option<&str>,
    ) -> Result<Arc<PreparedPlan<T::Plan>>, CacheResolverError> {
        let normalized = self.delegate.normalize(query, operation_name)?;
        let key = normalized.operation_id();

        let entry = self.cache.get(&key).await;
        if !entry.is_first() {
            return entry.get().await.map_err(|e| match e {
                EntryError::Failed(error) => CacheResolverError::RetrievalError(error),
                // IsFirst should be unreachable
                EntryError::IsFirst | EntryError::RecvError => CacheResolverError::WaiterDropped,
            });
        }

        tracing::debug!(operation.id = key, "planning operation");
        let delegate = self.delegate.clone();
        // the planning task outlives a cancelled caller so that waiters still get a result
        let task = tokio::spawn(
            async move {
                let planned = tokio::task::spawn_blocking(move || {
                    let plan = delegate.plan(&normalized)?;
                    Ok::<_, PlanError>(PreparedPlan {
                        plan,
                        kind: normalized.kind,
                        extracted_variables: normalized.extracted_variables,
                    })
                })
                .await
                .map_err(PlanError::from)
                .and_then(|planned| planned);

                match planned {
                    Ok(prepared) => {
                        let prepared = Arc::new(prepared);
                        entry.insert(prepared.clone()).await;
                        Ok(prepared)
                    }
                    Err(error) => {
                        tracing::debug!(operation.id = key, %error, "planning failed");
                        let error = Arc::new(error);
                        entry.send(error.clone());
                        Err(CacheResolverError::RetrievalError(error))
                    }
                }
            }
            .in_current_span(),
        );
        task.await
            .map_err(|e| CacheResolverError::from(PlanError::from(e)))?
    }
}
