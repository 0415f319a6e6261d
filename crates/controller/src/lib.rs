//! Vigil controller: owns the cache synchronizer, the work queue, and the
//! reconciler worker pool, and implements the cancellation protocol.
//!
//! Ownership is explicit: the controller constructs every moving part and
//! passes references down; there is no package-level shared state. All
//! cross-task communication goes through the work queue and the lister.

#![forbid(unsafe_code)]

mod reconcile;

pub use reconcile::desired_update;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{anno, prelude::*};
use vigil_queue::{BackoffConfig, WorkQueue};
use vigil_remote::ResourceService;
use vigil_store::{CacheStore, Lister, SyncConfig, Synchronizer};

fn notification_cap() -> usize {
    std::env::var("VIGIL_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// Terminal signal a worker sends the queue for a dequeued key.
#[derive(Debug, PartialEq)]
enum Outcome {
    Forget,
    Retry,
}

/// One task through the per-key state machine: resolve the snapshot from
/// the cache, compute the corrective action, apply it remotely.
async fn reconcile_key(
    service: &Arc<dyn ResourceService>,
    lister: &Lister,
    key: &ProjectKey,
    worker: usize,
) -> Outcome {
    let Some(snapshot) = lister.get(key) else {
        // deleted between notification and dequeue; nothing to correct
        info!(worker, key = %key, "not in cache; deleted upstream");
        return Outcome::Forget;
    };
    let Some(update) = desired_update(&snapshot) else {
        debug!(worker, key = %key, phase = %snapshot.phase, "already converged");
        return Outcome::Forget;
    };
    match service.update(update).await {
        Ok(applied) => {
            counter!("reconcile_ok", 1u64);
            info!(
                worker,
                key = %key,
                display_name = applied.annotation(anno::DISPLAY_NAME).unwrap_or(""),
                "display name set"
            );
            Outcome::Forget
        }
        Err(ServiceError::NotFound { .. }) => {
            debug!(worker, key = %key, "vanished mid-reconcile");
            Outcome::Forget
        }
        Err(e) if e.is_retryable() => {
            counter!("reconcile_err", 1u64);
            warn!(worker, key = %key, error = %e, "reconcile failed; will retry");
            Outcome::Retry
        }
        Err(e) => {
            counter!("reconcile_err", 1u64);
            error!(worker, key = %key, error = %e, "permanent reconcile failure; dropping key");
            Outcome::Forget
        }
    }
}

async fn worker_loop(
    worker: usize,
    service: Arc<dyn ResourceService>,
    lister: Lister,
    queue: Arc<WorkQueue>,
) {
    while let Some(key) = queue.get().await {
        let t0 = Instant::now();
        match reconcile_key(&service, &lister, &key, worker).await {
            Outcome::Forget => queue.forget(&key),
            Outcome::Retry => queue.add_rate_limited(key.clone()),
        }
        // release the in-flight hold exactly once per dequeue, whatever
        // the outcome was
        queue.done(&key);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    }
    debug!(worker, "worker exiting on queue shutdown");
}

/// Wires synchronizer → dispatcher → queue → workers and owns their
/// lifecycles.
pub struct Controller {
    service: Arc<dyn ResourceService>,
    store: Arc<CacheStore>,
    queue: Arc<WorkQueue>,
    sync_cfg: SyncConfig,
}

impl Controller {
    pub fn new(
        service: Arc<dyn ResourceService>,
        sync_cfg: SyncConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            service,
            store: Arc::new(CacheStore::new()),
            queue: WorkQueue::new(backoff),
            sync_cfg,
        }
    }

    pub fn lister(&self) -> Lister {
        Lister::new(self.store.clone())
    }

    /// Run until `cancel` fires. Blocks on the initial cache sync first and
    /// fails fast if it cannot complete; afterwards the only fatal exit is
    /// the synchronizer exhausting its relist budget. On cancellation every
    /// worker finishes its current task, observes the queue shutdown, and
    /// exits before this returns.
    pub async fn run(self, cancel: CancellationToken, workers: usize) -> Result<()> {
        let workers_n = workers.max(1);
        let (notif_tx, mut notif_rx) = mpsc::channel(notification_cap());
        let (sync, mut synced) = Synchronizer::new(
            self.service.clone(),
            self.store.clone(),
            notif_tx,
            self.sync_cfg.clone(),
        );
        let mut sync_task = tokio::spawn(sync.run(cancel.child_token()));

        info!("waiting for initial cache sync");
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancelled before cache sync completed");
                if (&mut sync_task).await.is_err() {
                    warn!("synchronizer task aborted");
                }
                return Ok(());
            }
            res = &mut sync_task => {
                // the synchronizer never survives to this point unless it
                // failed or lost a race with cancellation
                return match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e).context("initial cache sync failed"),
                    Err(e) => Err(anyhow!("synchronizer panicked: {e}")),
                };
            }
            changed = async { synced.wait_for(|s| *s).await.map(|_| ()) } => {
                if changed.is_err() {
                    return match sync_task.await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e).context("initial cache sync failed"),
                        Err(e) => Err(anyhow!("synchronizer panicked: {e}")),
                    };
                }
            }
        }

        info!(workers = workers_n, "cache synced; starting workers");
        let dispatcher = tokio::spawn({
            let queue = Arc::clone(&self.queue);
            async move {
                while let Some(n) = notif_rx.recv().await {
                    debug!(kind = n.kind(), key = %n.key(), "dispatching notification");
                    queue.add(n.into_key());
                }
                debug!("notification channel closed; dispatcher exiting");
            }
        });

        let lister = self.lister();
        let mut worker_tasks = Vec::with_capacity(workers_n);
        for i in 0..workers_n {
            worker_tasks.push(tokio::spawn(worker_loop(
                i,
                self.service.clone(),
                lister.clone(),
                Arc::clone(&self.queue),
            )));
        }

        // Supervise until cancellation or a fatal synchronizer exit.
        let mut fatal: Option<anyhow::Error> = None;
        let mut sync_finished = false;
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
            }
            res = &mut sync_task => {
                sync_finished = true;
                match res {
                    Ok(Ok(())) => warn!("synchronizer exited"),
                    Ok(Err(e)) => {
                        error!(error = %e, "fatal synchronization error");
                        fatal = Some(e.into());
                    }
                    Err(e) => fatal = Some(anyhow!("synchronizer panicked: {e}")),
                }
            }
        }

        // Stop feeding the queue, let outstanding work drain, and wait for
        // every worker to observe the shutdown.
        self.queue.shut_down();
        for (i, h) in worker_tasks.into_iter().enumerate() {
            if h.await.is_err() {
                warn!(worker = i, "worker task aborted");
            }
        }
        if !sync_finished {
            match (&mut sync_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e.into());
                    }
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(anyhow!("synchronizer panicked: {e}"));
                    }
                }
            }
        }
        if dispatcher.await.is_err() {
            warn!("dispatcher task aborted");
        }
        info!("controller stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
