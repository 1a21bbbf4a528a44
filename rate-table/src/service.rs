use crate::synchronizer::{CycleReport, SyncError, Synchronizer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub enum Command {
    // Run a cycle now instead of waiting for the next interval.
    // The worker answers with the cycle result.
    Refresh(oneshot::Sender<Result<CycleReport, SyncError>>),
    // Stop the worker after the current cycle.
    Shutdown,
}

struct RateTableServiceInner {
    synchronizer: Arc<Synchronizer>,
    // Used by the readiness probe. Set once any cycle has published successfully.
    ready: Arc<AtomicBool>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Runs the singleton synchronizer in a background task: one cycle at start,
/// then one per interval, plus on-demand refreshes.
#[derive(Clone)]
pub struct RateTableService {
    inner: Arc<RateTableServiceInner>,
}

impl RateTableService {
    pub fn new(synchronizer: Arc<Synchronizer>, interval: Duration) -> Self {
        // Channel to send commands to the worker task.
        let (tx, rx) = mpsc::channel::<Command>(16);
        let ready = Arc::new(AtomicBool::new(false));

        // All synchronization happens from this task.
        let handle = tokio::spawn(run_worker(
            synchronizer.clone(),
            ready.clone(),
            rx,
            interval,
        ));

        RateTableService {
            inner: Arc::new(RateTableServiceInner {
                synchronizer,
                ready,
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.inner.synchronizer
    }

    pub async fn refresh(&self) -> Result<CycleReport, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh(tx))
            .await
            .map_err(|_| SyncError::WorkerStopped)?;
        rx.await.map_err(|_| SyncError::WorkerStopped)?
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown).await;
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "synchronizer worker panicked");
        }
    }
}

async fn run_worker(
    synchronizer: Arc<Synchronizer>,
    ready: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<Command>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // The first tick completes immediately
            _ = ticker.tick() => {
                if synchronizer.run_cycle().await.is_ok() {
                    ready.store(true, Ordering::Relaxed);
                }
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Refresh(reply)) => {
                    let result = synchronizer.run_cycle().await;
                    if result.is_ok() {
                        ready.store(true, Ordering::Relaxed);
                    }
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown) | None => {
                    tracing::info!("synchronizer worker shutting down");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::StaticAnalyticsSource;
    use crate::store::{CACHE_NAMESPACE, FastCache, MemoryStore, MokaCache, STORE_NAMESPACE};
    use crate::testutils::{FailingSource, row};
    use crate::types::EntryKey;

    #[tokio::test]
    async fn test_service_ready_after_first_cycle() {
        let source = Arc::new(StaticAnalyticsSource::new(vec![row(
            "ndt_ssl",
            "geo_options",
            "127.0.0.1",
        )]));
        let cache = Arc::new(MokaCache::new(CACHE_NAMESPACE));
        let synchronizer = Arc::new(Synchronizer::new(
            source.clone(),
            Arc::new(MemoryStore::new(STORE_NAMESPACE)),
            cache.clone(),
            Duration::from_secs(5),
        ));
        let service = RateTableService::new(synchronizer, Duration::from_secs(3600));

        for _ in 0..50 {
            if service.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.is_ready());

        // Refresh picks up the new rows without waiting for the interval
        source.set_rows(vec![row("ndt_ssl", "geo_options", "127.0.0.2")]);
        let report = service.refresh().await.unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(report.evicted, 1);

        let evicted = EntryKey::new("", "ndt_ssl", "geo_options", "127.0.0.1").to_string();
        assert_eq!(cache.get(&evicted).await.unwrap(), None);

        service.shutdown().await;
        assert!(matches!(
            service.refresh().await,
            Err(SyncError::WorkerStopped)
        ));
    }

    #[tokio::test]
    async fn test_service_not_ready_while_failing() {
        let source = Arc::new(FailingSource::new(vec![row(
            "ndt_ssl",
            "geo_options",
            "127.0.0.1",
        )]));
        source.set_failing(true);
        let synchronizer = Arc::new(Synchronizer::new(
            source.clone(),
            Arc::new(MemoryStore::new(STORE_NAMESPACE)),
            Arc::new(MokaCache::new(CACHE_NAMESPACE)),
            Duration::from_secs(5),
        ));
        let service = RateTableService::new(synchronizer, Duration::from_secs(3600));

        assert!(matches!(service.refresh().await, Err(SyncError::Fetch(_))));
        assert!(!service.is_ready());

        source.set_failing(false);
        service.refresh().await.unwrap();
        assert!(service.is_ready());
        service.shutdown().await;
    }
}
