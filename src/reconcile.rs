use crate::config::TillConfig;
use crate::connectivity::{ConnectivityProbe, ConnectivitySignal};
use crate::error::TillError;
use crate::remote::{LedgerPublisher, bounded};
use crate::store::LocalStore;
use crate::store::queue::QueueItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exponential retry delay with down-jitter, applied between automatic
/// attempts on a failed queue item: `base * 2^(retry_count - 1)`, capped,
/// then scaled by a random factor in `[1 - jitter, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &TillConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
            jitter: config.backoff_jitter,
        }
    }

    pub fn delay_micros(&self, retry_count: u32) -> u64 {
        let step = retry_count.saturating_sub(1).min(16);
        let exp = self.base_ms.saturating_mul(1u64 << step);
        let capped = exp.min(self.cap_ms);
        let jittered = capped as f64 * (1.0 - rand::random::<f64>() * self.jitter);
        (jittered as u64).saturating_mul(1_000)
    }
}

/// Outcome counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: u32,
    pub completed: u32,
    pub failed: u32,
    /// Items put back to pending because connectivity was lost mid-pass.
    pub deferred: u32,
}

enum SyncOutcome {
    Completed,
    Failed,
}

/// Drains the sync queue against the external ledger while the node is
/// online.
///
/// Per entity, items are published strictly in creation order; an entity
/// whose earliest unresolved item cannot proceed blocks its later items. The
/// background task wakes on connectivity changes and on a periodic timer,
/// and is cancellable; interrupted publishes rely on the ledger's idempotent
/// semantics when they are re-attempted.
pub(crate) struct Reconciler {
    store: Arc<LocalStore>,
    ledger: Arc<dyn LedgerPublisher>,
    connectivity: Arc<ConnectivitySignal>,
    remote_timeout: Duration,
    backoff: BackoffPolicy,
}

pub(crate) struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

impl Reconciler {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        ledger: Arc<dyn LedgerPublisher>,
        connectivity: Arc<ConnectivitySignal>,
        remote_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            connectivity,
            remote_timeout,
            backoff,
        }
    }

    pub(crate) fn spawn(self: Arc<Self>, interval_ms: u64) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut online_rx = self.connectivity.subscribe();
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow() {
                            let report = self.drain().await;
                            debug!(?report, "connectivity-triggered drain finished");
                        }
                    }
                    _ = ticker.tick() => {
                        if self.connectivity.is_online() {
                            let report = self.drain().await;
                            if report.attempted > 0 {
                                debug!(?report, "periodic drain finished");
                            }
                        }
                    }
                }
            }
            info!("reconciler stopped");
        });
        ReconcilerHandle { shutdown_tx, join }
    }

    /// One full pass over the queue. Publishes at most one item per entity;
    /// repeated passes move each entity forward one item at a time, which
    /// keeps ordering intact even across failures and restarts.
    pub(crate) async fn drain(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let now = crate::now_micros();
        let batch = match self
            .store
            .next_sync_batch(now, |retry_count| self.backoff.delay_micros(retry_count))
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "could not assemble sync batch");
                return report;
            }
        };
        for item in batch {
            if !self.connectivity.is_online() {
                break;
            }
            report.attempted += 1;
            match self.sync_one(&item).await {
                Ok(SyncOutcome::Completed) => report.completed += 1,
                Ok(SyncOutcome::Failed) => report.failed += 1,
                Err(_) => {
                    // Timeout: indistinguishable from going offline. The item
                    // is already back in pending; end the pass.
                    report.deferred += 1;
                    break;
                }
            }
        }
        report
    }

    async fn sync_one(&self, item: &QueueItem) -> Result<SyncOutcome, TillError> {
        self.store.mark_syncing(&item.id)?;
        match bounded(self.remote_timeout, self.ledger.publish(&item.payload)).await {
            Ok(content_ref) => {
                self.store.mark_completed(&item.id, content_ref)?;
                Ok(SyncOutcome::Completed)
            }
            Err(TillError::NetworkUnavailable) => {
                self.store.revert_to_pending(&item.id)?;
                Err(TillError::NetworkUnavailable)
            }
            Err(err) => {
                let failed = self.store.mark_failed(&item.id, err.to_string())?;
                if failed.exhausted() {
                    let exhausted = TillError::SyncExhausted {
                        item_id: failed.id.clone(),
                        retries: failed.retry_count,
                    };
                    warn!(
                        item_id = %failed.id,
                        entity = %failed.entity_type,
                        entity_key = %failed.entity_key,
                        code = exhausted.code_str(),
                        "queue item requires operator retry"
                    );
                } else {
                    debug!(item_id = %failed.id, error = %err, "publish failed; will back off");
                }
                Ok(SyncOutcome::Failed)
            }
        }
    }
}
