//! Cache synchronizer: list, seed, watch, resync.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::prelude::*;
use vigil_remote::{ResourceService, StreamHandle};

use crate::CacheStore;

/// Knobs for the list/watch/resync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period for synthesized re-reconciliation of every cached entry.
    /// `None` disables resync.
    pub resync: Option<Duration>,
    /// Consecutive failed List attempts tolerated before the synchronizer
    /// gives up with a fatal error.
    pub list_retries: u32,
    /// Backoff base between failed List attempts (doubles per attempt).
    pub list_backoff_base: Duration,
    /// Ceiling for the delay between watch restarts.
    pub watch_backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync: None,
            list_retries: 5,
            list_backoff_base: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Fatal synchronization failures; everything else is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("initial list failed after {attempts} attempts: {last}")]
    InitialList { attempts: u32, last: String },
    #[error("relist failed after {attempts} attempts: {last}")]
    Relist { attempts: u32, last: String },
}

enum WatchExit {
    Cancelled,
    Disrupted,
}

/// Replicates remote state into the [`CacheStore`] and fans out
/// [`ChangeNotification`]s over a single channel.
///
/// On start, performs one full List (with retries), seeds the store, flips
/// the synced signal, then consumes the watch stream. A disrupted watch is
/// healed by going back to a fresh List, with capped exponential backoff
/// between restarts; only an exhausted List retry budget surfaces as an
/// error.
pub struct Synchronizer {
    service: Arc<dyn ResourceService>,
    store: Arc<CacheStore>,
    notif_tx: mpsc::Sender<ChangeNotification>,
    synced_tx: watch::Sender<bool>,
    cfg: SyncConfig,
}

impl Synchronizer {
    /// Returns the synchronizer and the `HasSynced` signal: the receiver
    /// reads `false` until the initial List has been applied.
    pub fn new(
        service: Arc<dyn ResourceService>,
        store: Arc<CacheStore>,
        notif_tx: mpsc::Sender<ChangeNotification>,
        cfg: SyncConfig,
    ) -> (Self, watch::Receiver<bool>) {
        let (synced_tx, synced_rx) = watch::channel(false);
        (Self { service, store, notif_tx, synced_tx, cfg }, synced_rx)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), SyncError> {
        let mut restart_backoff = self.cfg.list_backoff_base;
        loop {
            let items = match self.list_with_retry(&cancel).await? {
                Some(items) => items,
                None => return Ok(()),
            };
            counter!("sync_relists", 1u64);
            let notifs = self.store.reconcile_list(items);
            debug!(changes = notifs.len(), "list reconciled into cache");
            // The store is seeded: flip the synced signal before fanning
            // out, so a large initial list cannot fill the channel while
            // the consumer is still waiting on HasSynced.
            if !*self.synced_tx.borrow() {
                info!(cached = self.store.len(), "initial cache sync complete");
                let _ = self.synced_tx.send(true);
            }
            for n in notifs {
                if !self.forward(&cancel, n).await {
                    return Ok(());
                }
            }

            let watch_started = tokio::time::Instant::now();
            match self.watch_until_disrupted(&cancel).await {
                WatchExit::Cancelled => return Ok(()),
                WatchExit::Disrupted => {
                    // a watch that stayed up for a while earns a fresh
                    // backoff; rapid-fire disruptions keep escalating
                    if watch_started.elapsed() >= self.cfg.watch_backoff_max {
                        restart_backoff = self.cfg.list_backoff_base;
                    }
                    counter!("watch_restarts", 1u64);
                    warn!(backoff_ms = %restart_backoff.as_millis(), "watch disrupted; relisting");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(restart_backoff) => {}
                    }
                    restart_backoff = (restart_backoff * 2).min(self.cfg.watch_backoff_max);
                }
            }
        }
    }

    /// Deliver one notification; `false` means stop (cancelled or the
    /// consumer went away). A full channel must not outlive cancellation.
    async fn forward(&self, cancel: &CancellationToken, n: ChangeNotification) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            res = self.notif_tx.send(n) => res.is_ok(),
        }
    }

    /// `Ok(None)` means cancelled. The retry budget is consecutive: any
    /// successful List resets it by returning.
    async fn list_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ProjectSnapshot>>, SyncError> {
        let mut last = String::new();
        for attempt in 1..=self.cfg.list_retries.max(1) {
            let listed = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                r = self.service.list() => r,
            };
            match listed {
                Ok(items) => return Ok(Some(items)),
                Err(e) => {
                    last = e.to_string();
                    warn!(attempt, error = %e, "list attempt failed");
                }
            }
            let delay = self
                .cfg
                .list_backoff_base
                .saturating_mul(1u32 << (attempt - 1).min(10));
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let attempts = self.cfg.list_retries.max(1);
        Err(if *self.synced_tx.borrow() {
            SyncError::Relist { attempts, last }
        } else {
            SyncError::InitialList { attempts, last }
        })
    }

    async fn watch_until_disrupted(&self, cancel: &CancellationToken) -> WatchExit {
        let StreamHandle { mut rx, cancel: watch_cancel } = match self.service.watch().await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "opening watch failed");
                return WatchExit::Disrupted;
            }
        };
        let mut ticker = self.cfg.resync.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    watch_cancel.cancel();
                    return WatchExit::Cancelled;
                }
                ev = rx.recv() => match ev {
                    Some(ev) => match self.store.apply_event(ev) {
                        Some(n) => {
                            if !self.forward(cancel, n).await {
                                watch_cancel.cancel();
                                return WatchExit::Cancelled;
                            }
                        }
                        None => {
                            counter!("sync_stale_events", 1u64);
                            debug!("stale event discarded");
                        }
                    },
                    None => return WatchExit::Disrupted,
                },
                _ = resync_tick(&mut ticker) => {
                    let notifs = self.store.resync_notifications();
                    counter!("sync_resyncs", 1u64);
                    debug!(count = notifs.len(), "resync re-emitting cached entries");
                    for n in notifs {
                        if !self.forward(cancel, n).await {
                            watch_cancel.cancel();
                            return WatchExit::Cancelled;
                        }
                    }
                }
            }
        }
    }
}

async fn resync_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
