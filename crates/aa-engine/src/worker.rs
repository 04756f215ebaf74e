//! Remote task dispatch.
//!
//! Tasks are fire-and-forget from the coordinator's side: `submit` returns a
//! handle immediately and the work runs on the blocking pool once a worker
//! slot is free. Handles are only consumed by a bulk [`gather`].

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use aa_optimizer::WorkerResources;
use aa_types::{AaError, AaResult, ClusterConfig};

/// A bounded pool of worker slots sized from the cluster description.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(cluster: &ClusterConfig, per_task: &WorkerResources) -> Self {
        let capacity = per_task.slots_in(cluster);
        debug!(capacity, address = ?cluster.address, "worker pool ready");
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `task` for execution on a worker.
    pub fn submit<T, F>(&self, label: impl Into<String>, task: F) -> RemoteHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AaResult<T> + Send + 'static,
    {
        let label = label.into();
        let slots = self.slots.clone();
        let task_label = label.clone();
        let inner = tokio::spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|e| AaError::WorkerLost(format!("{task_label}: {e}")))?;
            debug!(task = %task_label, "task started");
            tokio::task::spawn_blocking(task)
                .await
                .map_err(|e| AaError::WorkerLost(format!("{task_label}: {e}")))?
        });
        RemoteHandle { label, inner }
    }
}

/// Handle to one submitted task.
#[derive(Debug)]
pub struct RemoteHandle<T> {
    label: String,
    inner: JoinHandle<AaResult<T>>,
}

impl<T> RemoteHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn join(self) -> AaResult<T> {
        self.inner
            .await
            .map_err(|e| AaError::WorkerLost(format!("{}: {e}", self.label)))?
    }
}

/// Await every handle, keeping results in submission order.
///
/// A failed task only fails its own slot in the output.
pub async fn gather<T>(handles: Vec<RemoteHandle<T>>) -> Vec<(String, AaResult<T>)> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let label = handle.label.clone();
        let result = handle.join().await;
        if let Err(e) = &result {
            warn!(task = %label, error = %e, "remote task failed");
        }
        results.push((label, result));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool(gpus: f64, share: f64) -> WorkerPool {
        let cluster = ClusterConfig {
            num_gpus: gpus,
            ..ClusterConfig::default()
        };
        WorkerPool::new(&cluster, &WorkerResources::gpu_share(share))
    }

    #[tokio::test]
    async fn gather_preserves_submission_order() {
        let pool = pool(4.0, 1.0);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                pool.submit(format!("task{i}"), move || {
                    std::thread::sleep(Duration::from_millis(20 * (4 - i)));
                    Ok(i)
                })
            })
            .collect();

        let results = gather(handles).await;
        let values: Vec<u64> = results.into_iter().map(|(_, r)| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failures_stay_local() {
        let pool = pool(2.0, 1.0);
        let handles = vec![
            pool.submit("ok", || Ok(1)),
            pool.submit("diverged", || {
                Err(AaError::TrainingDivergence {
                    tag: "fold0".into(),
                    epoch: 3,
                    loss: f64::NAN,
                })
            }),
            pool.submit("panicked", || -> AaResult<i32> { panic!("worker died") }),
        ];

        let results = gather(handles).await;
        assert_eq!(results[0].1.as_ref().unwrap(), &1);
        assert!(matches!(results[1].1, Err(AaError::TrainingDivergence { .. })));
        assert!(matches!(results[2].1, Err(AaError::WorkerLost(_))));
        assert_eq!(results[2].0, "panicked");
    }

    #[tokio::test]
    async fn capacity_bounds_parallelism() {
        let pool = pool(1.0, 0.5);
        assert_eq!(pool.capacity(), 2);

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let (live, peak) = (live.clone(), peak.clone());
                pool.submit(format!("t{i}"), move || {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        assert!(gather(handles).await.iter().all(|(_, r)| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
