//! Reconciliation loop
//!
//! Every poll interval the loop walks the whole ledger with the scan cursor.
//! Each reserved entry is handed to a [`SettlementWorker`] running on its own
//! task, so a slow transfer never delays the next sweep. Reservations keep
//! overlapping sweeps from picking up the same balance twice.

use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use crate::types::ScanCursor;
use crate::worker::{SettlementOutcome, SettlementWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of one full pass over the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Scan calls issued
    pub batches: usize,
    /// Entries reserved and dispatched
    pub dispatched: usize,
}

/// Periodic sweep driver
pub struct ReconciliationLoop {
    ledger: Arc<dyn LedgerStore>,
    worker: Arc<SettlementWorker>,
    metrics: Metrics,
    min_amount: u64,
    poll_interval: Duration,
}

impl std::fmt::Debug for ReconciliationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("worker", &self.worker)
            .field("min_amount", &self.min_amount)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ReconciliationLoop {
    /// Create a loop
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        worker: Arc<SettlementWorker>,
        metrics: Metrics,
        min_amount: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            worker,
            metrics,
            min_amount,
            poll_interval,
        }
    }

    /// Walk the ledger once and dispatch a worker per reserved entry.
    ///
    /// A scan error aborts the rest of the sweep. Entries reserved before the
    /// error are already dispatched and settle normally.
    pub async fn sweep(&self, workers: &mut JoinSet<SettlementOutcome>) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        let mut cursor = ScanCursor::start();

        loop {
            let (next, entries) = match self
                .ledger
                .scan_for_settlement(&cursor, self.min_amount)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.metrics.sweep_failures.inc();
                    error!(
                        cursor = %cursor,
                        dispatched = summary.dispatched,
                        "Error scanning ledger for settlement, aborting sweep: {}",
                        e
                    );
                    return Err(e.into());
                }
            };
            summary.batches += 1;

            for entry in entries {
                debug!(account = %entry.account, amount = entry.amount, "Reserved for settlement");
                self.metrics.reservations.inc();
                summary.dispatched += 1;

                let worker = self.worker.clone();
                workers.spawn(async move { worker.settle(entry).await });
            }

            if next.is_terminal() {
                break;
            }
            cursor = next;
        }

        self.metrics.sweeps.inc();
        if summary.dispatched > 0 {
            info!(
                "Sweep dispatched {} settlements over {} scan batches",
                summary.dispatched, summary.batches
            );
        } else {
            debug!(batches = summary.batches, "Sweep found nothing to settle");
        }
        Ok(summary)
    }

    /// Sweep every poll interval until `shutdown` flips to `true`.
    ///
    /// The first sweep runs immediately. On shutdown no new sweep starts and
    /// in-flight workers get `grace` to finish before they are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        info!(
            "Starting reconciliation loop (poll interval: {:?})",
            self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    reap(&mut workers);
                    // Errors are logged inside; the next tick retries from the start
                    let _ = self.sweep(&mut workers).await;
                }
            }
        }

        drain(workers, grace).await;
        info!("Reconciliation loop stopped");
    }
}

fn reap(workers: &mut JoinSet<SettlementOutcome>) {
    while let Some(joined) = workers.try_join_next() {
        log_joined(joined);
    }
}

async fn drain(mut workers: JoinSet<SettlementOutcome>, grace: Duration) {
    if workers.is_empty() {
        return;
    }
    info!(
        "Waiting up to {:?} for {} in-flight settlements",
        grace,
        workers.len()
    );

    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = workers.join_next().await {
            log_joined(joined);
        }
    })
    .await;

    if finished.is_err() {
        error!(
            "{} settlements still in flight after {:?}, aborting; their reservations stay open",
            workers.len(),
            grace
        );
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}

fn log_joined(joined: std::result::Result<SettlementOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!(?outcome, "Settlement worker finished"),
        Err(e) if e.is_panic() => error!("Settlement worker panicked: {}", e),
        Err(e) => warn!("Settlement worker cancelled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, MockOutcome};
    use crate::ledger::InMemoryLedgerStore;
    use crate::types::{Account, AccountId};

    fn setup(
        chain: MockChainClient,
        batch_size: usize,
        accounts: &[(&str, i64)],
    ) -> (Arc<InMemoryLedgerStore>, Arc<MockChainClient>, ReconciliationLoop) {
        let ledger = Arc::new(InMemoryLedgerStore::new(9, batch_size));
        for (id, balance) in accounts {
            ledger.insert_account(
                Account::new(*id, format!("0x{}", id), 9).with_balance(*balance),
            );
        }
        let chain = Arc::new(chain);
        let metrics = Metrics::new().unwrap();
        let worker = Arc::new(SettlementWorker::new(
            ledger.clone(),
            chain.clone(),
            metrics.clone(),
            Some(Duration::from_secs(5)),
        ));
        let reconciliation = ReconciliationLoop::new(
            ledger.clone(),
            worker,
            metrics,
            1_000_000,
            Duration::from_millis(50),
        );
        (ledger, chain, reconciliation)
    }

    async fn settle_all(workers: &mut JoinSet<SettlementOutcome>) -> Vec<SettlementOutcome> {
        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            outcomes.push(joined.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn test_sweep_spans_batches() {
        let accounts = [
            ("a", 2_000_000),
            ("b", 3_000_000),
            ("c", 10),
            ("d", 4_000_000),
            ("e", 1_000_000),
        ];
        let (ledger, chain, reconciliation) = setup(MockChainClient::new("0xengine"), 2, &accounts);

        let mut workers = JoinSet::new();
        let summary = reconciliation.sweep(&mut workers).await.unwrap();
        assert_eq!(summary.dispatched, 4);
        assert!(summary.batches >= 3);

        let outcomes = settle_all(&mut workers).await;
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SettlementOutcome::Confirmed { .. })));
        assert_eq!(chain.sent().len(), 4);
        assert_eq!(ledger.total_balance(), 10);
    }

    #[tokio::test]
    async fn test_inflight_reservation_not_swept_twice() {
        let chain = MockChainClient::new("0xengine").with_latency(Duration::from_millis(100));
        let (_, chain, reconciliation) = setup(chain, 10, &[("a", 2_000_000)]);

        let mut workers = JoinSet::new();
        assert_eq!(reconciliation.sweep(&mut workers).await.unwrap().dispatched, 1);
        // Worker still sending
        assert_eq!(reconciliation.sweep(&mut workers).await.unwrap().dispatched, 0);

        settle_all(&mut workers).await;
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_released_amount_retried_next_sweep() {
        let chain = MockChainClient::new("0xengine");
        chain.push_outcomes([MockOutcome::TransportError]);
        let (ledger, chain, reconciliation) = setup(chain, 10, &[("a", 2_000_000)]);

        let mut workers = JoinSet::new();
        reconciliation.sweep(&mut workers).await.unwrap();
        let outcomes = settle_all(&mut workers).await;
        assert!(matches!(outcomes[0], SettlementOutcome::Released { .. }));

        reconciliation.sweep(&mut workers).await.unwrap();
        let outcomes = settle_all(&mut workers).await;
        assert!(matches!(outcomes[0], SettlementOutcome::Confirmed { .. }));

        assert_eq!(chain.sent().len(), 2);
        assert_eq!(ledger.snapshot(&AccountId::new("a")).unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_hung_send_does_not_block_others() {
        let chain = MockChainClient::new("0xengine");
        chain.push_outcomes([MockOutcome::Hang]);
        let (ledger, _, reconciliation) =
            setup(chain, 10, &[("a", 2_000_000), ("b", 3_000_000)]);

        let mut workers = JoinSet::new();
        reconciliation.sweep(&mut workers).await.unwrap();

        // The non-hung account settles while the other worker is stuck
        let joined = tokio::time::timeout(Duration::from_secs(1), workers.join_next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(joined, SettlementOutcome::Confirmed { .. }));
        assert_eq!(ledger.snapshot(&AccountId::new("b")).unwrap().balance, 0);
        assert!(ledger
            .snapshot(&AccountId::new("a"))
            .unwrap()
            .reservation
            .is_some());
        workers.abort_all();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (ledger, chain, reconciliation) = setup(
            MockChainClient::new("0xengine"),
            10,
            &[("a", 2_000_000)],
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(reconciliation.run(shutdown_rx, Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chain.sent().len(), 1);
        assert_eq!(ledger.total_balance(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let chain = MockChainClient::new("0xengine").with_default_outcome(MockOutcome::Hang);
        let (ledger, _, reconciliation) = setup(chain, 10, &[("a", 2_000_000)]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(reconciliation.run(shutdown_rx, Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        // Aborted worker leaves its reservation for the startup audit
        assert!(ledger
            .snapshot(&AccountId::new("a"))
            .unwrap()
            .reservation
            .is_some());
    }
}
