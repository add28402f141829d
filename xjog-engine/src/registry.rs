//! Per-machine chart cache. Each registered machine carries an LRU of live
//! chart executors; misses rehydrate from the persisted snapshot. Eviction
//! waits for the evicted executor's chart mutex to go idle so a live
//! transition is never torn down under its feet.

use crate::{
    engine::EngineInner,
    error::{EngineError, Result},
    executor::ChartExecutor,
    repository,
    types::{ChartReference, MachineDefinition, MachineOptions},
};
use lru::LruCache;
use std::{num::NonZeroUsize, sync::Arc};
use tokio::sync::Mutex;

pub(crate) struct MachineHandle {
    pub(crate) def: Arc<dyn MachineDefinition>,
    pub(crate) options: MachineOptions,
    charts: Mutex<LruCache<String, Arc<ChartExecutor>>>,
}

impl MachineHandle {
    pub(crate) fn new(
        def: Arc<dyn MachineDefinition>,
        options: MachineOptions,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("non-zero cache size");
        Self {
            def,
            options,
            charts: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) async fn cached_count(&self) -> usize {
        self.charts.lock().await.len()
    }
}

impl EngineInner {
    /// Looks the chart up in the machine cache, loading and rehydrating it
    /// from the store on a miss. `Ok(None)` means no such chart row exists.
    pub(crate) async fn chart_executor(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<Arc<ChartExecutor>>> {
        let machine = self.machine(&reference.machine_id)?;

        // the cache mutex gets twice the chart mutex timeout so a slow
        // executor under eviction does not read as a cache liveness failure
        let cache_timeout = self.settings.chart_mutex_timeout * 2;
        let mut cache = match tokio::time::timeout(cache_timeout, machine.charts.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.spawn_shutdown();
                return Err(EngineError::MutexTimeout(reference.clone()));
            }
        };

        if let Some(executor) = cache.get(&reference.chart_id) {
            return Ok(Some(executor.clone()));
        }

        let Some(record) = repository::charts::read(self.db.as_ref(), reference).await? else {
            return Ok(None);
        };
        let executor = Arc::new(ChartExecutor::from_record(
            self.weak.clone(),
            machine.clone(),
            record,
        ));
        let evicted = cache.push(reference.chart_id.clone(), executor.clone());
        drop(cache);

        if let Some((evicted_id, evicted_executor)) = evicted {
            if evicted_id != reference.chart_id {
                evicted_executor.wait_idle().await;
            }
        }
        Ok(Some(executor))
    }

    /// Inserts a freshly created executor, evicting the oldest entry if the
    /// cache is over capacity.
    pub(crate) async fn cache_chart(&self, machine: &MachineHandle, executor: Arc<ChartExecutor>) {
        let chart_id = executor.reference().chart_id.clone();
        let evicted = {
            let mut cache = machine.charts.lock().await;
            cache.push(chart_id.clone(), executor)
        };
        if let Some((evicted_id, evicted_executor)) = evicted {
            if evicted_id != chart_id {
                evicted_executor.wait_idle().await;
            }
        }
    }

    /// Promotes the chart to most-recently-used. Contention is tolerated:
    /// a missed promotion only costs cache ordering, never correctness.
    pub(crate) async fn touch_chart(&self, machine: &MachineHandle, chart_id: &str) {
        if let Ok(mut cache) =
            tokio::time::timeout(self.settings.chart_mutex_timeout, machine.charts.lock()).await
        {
            cache.get(chart_id);
        }
    }

    pub(crate) async fn remove_cached_chart(&self, reference: &ChartReference) {
        if let Ok(machine) = self.machine(&reference.machine_id) {
            machine.charts.lock().await.pop(&reference.chart_id);
        }
    }

    pub(crate) fn machine(&self, machine_id: &str) -> Result<Arc<MachineHandle>> {
        self.machines
            .read()
            .expect("machine registry lock poisoned")
            .get(machine_id)
            .cloned()
            .ok_or_else(|| EngineError::MachineNotFound(machine_id.to_string()))
    }
}
