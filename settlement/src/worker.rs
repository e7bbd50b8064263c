//! Settlement worker
//!
//! Drives one reserved entry through `Reserved → Sending → {Confirmed | Released}`.
//! The worker never retries: a released amount becomes eligible again on the next
//! sweep, which bounds retry latency to the poll interval.
//!
//! When the outcome on chain is unknown (send timed out, or the transfer was
//! broadcast but its receipt never arrived) the entry ends `Unresolved` and the
//! reservation stays open for the restart audit.

use crate::chain::ChainClient;
use crate::error::{ChainError, LedgerError};
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use crate::types::{Receipt, SettlementEntry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stage of a settlement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    /// Scan reserved the amount
    Reserved,
    /// Transfer submitted, waiting for the receipt
    Sending,
    /// Transfer succeeded and the ledger was debited
    Confirmed,
    /// Transfer failed and the reservation was released
    Released,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementState::Reserved => write!(f, "reserved"),
            SettlementState::Sending => write!(f, "sending"),
            SettlementState::Confirmed => write!(f, "confirmed"),
            SettlementState::Released => write!(f, "released"),
        }
    }
}

/// How a settlement attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Ledger debited after a successful transfer
    Confirmed {
        /// Network transaction id
        tx_id: String,
        /// Available balance after confirmation
        available: i64,
    },

    /// Reservation released after a failed transfer
    Released {
        /// Why the transfer failed
        reason: String,
        /// Available balance after release
        available: i64,
    },

    /// The reservation is still open and needs an operator
    Unresolved {
        /// State the attempt was stuck in
        state: SettlementState,
        /// What went wrong
        reason: String,
    },
}

/// Settles reserved entries
pub struct SettlementWorker {
    ledger: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    metrics: Metrics,
    send_timeout: Option<Duration>,
}

impl fmt::Debug for SettlementWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementWorker")
            .field("chain_address", &self.chain.address())
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl SettlementWorker {
    /// Create a worker
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        metrics: Metrics,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            ledger,
            chain,
            metrics,
            send_timeout,
        }
    }

    /// Settle one reserved entry
    pub async fn settle(&self, entry: SettlementEntry) -> SettlementOutcome {
        let SettlementEntry {
            account,
            settlement_address,
            amount,
        } = &entry;
        debug!(%account, amount, state = %SettlementState::Reserved, "Settlement attempt started");

        info!(
            "Sending settlement of {} to account {} (address: {})",
            amount, account, settlement_address
        );
        debug!(%account, state = %SettlementState::Sending, "Settlement state changed");

        let sent = match self.send_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.chain.send(settlement_address, *amount)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        return self.unresolved(
                            &entry,
                            SettlementState::Sending,
                            format!("no receipt after {:?}", limit),
                        )
                    }
                }
            }
            None => self.chain.send(settlement_address, *amount).await,
        };

        match sent {
            Ok(Receipt { tx_id, status: true }) => self.confirm(&entry, tx_id).await,
            Ok(Receipt {
                tx_id,
                status: false,
            }) => {
                error!(
                    "Transfer {} to account {} (address: {}) was rejected by the network",
                    tx_id, account, settlement_address
                );
                self.release(&entry, format!("transfer {} rejected", tx_id))
                    .await
            }
            Err(ChainError::ReceiptUnavailable { tx_id, reason }) => self.unresolved(
                &entry,
                SettlementState::Sending,
                format!("transfer {} broadcast but receipt unavailable: {}", tx_id, reason),
            ),
            Err(e) => {
                error!(
                    "Error sending transfer to account {} (address: {}): {}",
                    account, settlement_address, e
                );
                self.release(&entry, transfer_failure(&e)).await
            }
        }
    }

    async fn confirm(&self, entry: &SettlementEntry, tx_id: String) -> SettlementOutcome {
        info!(
            "Sent {} to account {} in transfer {}",
            entry.amount, entry.account, tx_id
        );

        match self
            .ledger
            .confirm_settlement(&entry.account, entry.amount)
            .await
        {
            Ok(available) => {
                self.metrics.confirmed.inc();
                info!(
                    account = %entry.account,
                    state = %SettlementState::Confirmed,
                    "Account {} now has available balance {}",
                    entry.account,
                    available
                );
                SettlementOutcome::Confirmed { tx_id, available }
            }
            Err(e) => self.ledger_failure(entry, SettlementState::Confirmed, e),
        }
    }

    async fn release(&self, entry: &SettlementEntry, reason: String) -> SettlementOutcome {
        match self
            .ledger
            .release_reservation(&entry.account, entry.amount)
            .await
        {
            Ok(available) => {
                self.metrics.released.inc();
                warn!(
                    account = %entry.account,
                    state = %SettlementState::Released,
                    "Released reservation of {} for account {}: {}",
                    entry.amount,
                    entry.account,
                    reason
                );
                SettlementOutcome::Released { reason, available }
            }
            Err(e) => self.ledger_failure(entry, SettlementState::Released, e),
        }
    }

    fn ledger_failure(
        &self,
        entry: &SettlementEntry,
        state: SettlementState,
        err: LedgerError,
    ) -> SettlementOutcome {
        if err.is_integrity_violation() {
            self.metrics.integrity_violations.inc();
            error!(
                account = %entry.account,
                amount = entry.amount,
                %state,
                "LEDGER INTEGRITY VIOLATION: {}",
                err
            );
        }
        self.unresolved(entry, state, err.to_string())
    }

    fn unresolved(
        &self,
        entry: &SettlementEntry,
        state: SettlementState,
        reason: String,
    ) -> SettlementOutcome {
        self.metrics.unresolved.inc();
        error!(
            account = %entry.account,
            amount = entry.amount,
            %state,
            "Settlement unresolved, reservation left open: {}",
            reason
        );
        SettlementOutcome::Unresolved { state, reason }
    }
}

fn transfer_failure(err: &ChainError) -> String {
    match err {
        ChainError::TransferFailed(reason) => format!("transport failure: {}", reason),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, MockOutcome};
    use crate::ledger::InMemoryLedgerStore;
    use crate::types::{Account, AccountId, ScanCursor};

    struct Fixture {
        ledger: Arc<InMemoryLedgerStore>,
        chain: Arc<MockChainClient>,
        metrics: Metrics,
    }

    impl Fixture {
        fn new(chain: MockChainClient) -> Self {
            let ledger = Arc::new(InMemoryLedgerStore::new(9, 10));
            ledger.insert_account(Account::new("alice", "0xA11CE", 9).with_balance(5_000_000));
            Self {
                ledger,
                chain: Arc::new(chain),
                metrics: Metrics::new().unwrap(),
            }
        }

        fn worker(&self, send_timeout: Option<Duration>) -> SettlementWorker {
            SettlementWorker::new(
                self.ledger.clone(),
                self.chain.clone(),
                self.metrics.clone(),
                send_timeout,
            )
        }

        async fn reserve(&self) -> SettlementEntry {
            let (_, mut entries) = self
                .ledger
                .scan_for_settlement(&ScanCursor::start(), 1_000_000)
                .await
                .unwrap();
            entries.remove(0)
        }
    }

    fn alice() -> AccountId {
        AccountId::new("alice")
    }

    #[tokio::test]
    async fn test_successful_transfer_confirms() {
        let fixture = Fixture::new(MockChainClient::new("0xengine"));
        let entry = fixture.reserve().await;

        let outcome = fixture.worker(None).settle(entry).await;
        assert!(matches!(outcome, SettlementOutcome::Confirmed { available: 0, .. }));

        let snapshot = fixture.ledger.snapshot(&alice()).unwrap();
        assert_eq!(snapshot.balance, 0);
        assert!(snapshot.reservation.is_none());
        assert_eq!(fixture.metrics.confirmed.get(), 1);

        let sent = fixture.chain.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "0xA11CE");
        assert_eq!(sent[0].amount, 5_000_000);
    }

    #[tokio::test]
    async fn test_rejected_transfer_releases() {
        let chain = MockChainClient::new("0xengine").with_default_outcome(MockOutcome::Rejected);
        let fixture = Fixture::new(chain);
        let entry = fixture.reserve().await;

        let outcome = fixture.worker(None).settle(entry).await;
        match outcome {
            SettlementOutcome::Released { reason, available } => {
                assert!(reason.contains("rejected"));
                assert_eq!(available, 5_000_000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fixture.metrics.released.get(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_releases() {
        let chain =
            MockChainClient::new("0xengine").with_default_outcome(MockOutcome::TransportError);
        let fixture = Fixture::new(chain);
        let entry = fixture.reserve().await;

        let outcome = fixture.worker(None).settle(entry).await;
        match outcome {
            SettlementOutcome::Released { reason, .. } => {
                assert!(reason.starts_with("transport failure"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let snapshot = fixture.ledger.snapshot(&alice()).unwrap();
        assert_eq!(snapshot.available, 5_000_000);
        assert!(snapshot.reservation.is_none());
    }

    #[tokio::test]
    async fn test_lost_receipt_leaves_reservation_open() {
        let chain = MockChainClient::new("0xengine").with_default_outcome(MockOutcome::ReceiptLost);
        let fixture = Fixture::new(chain);
        let entry = fixture.reserve().await;

        let outcome = fixture.worker(None).settle(entry).await;
        match outcome {
            SettlementOutcome::Unresolved { state, reason } => {
                assert_eq!(state, SettlementState::Sending);
                assert!(reason.contains("0xmock"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let snapshot = fixture.ledger.snapshot(&alice()).unwrap();
        assert_eq!(snapshot.balance, 5_000_000);
        assert_eq!(snapshot.available, 0);
        assert_eq!(fixture.metrics.released.get(), 0);
        assert_eq!(fixture.metrics.unresolved.get(), 1);

        // The open reservation keeps the next sweep from paying again
        let (_, entries) = fixture
            .ledger
            .scan_for_settlement(&ScanCursor::start(), 1)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_leaves_reservation_open() {
        let chain = MockChainClient::new("0xengine").with_default_outcome(MockOutcome::Hang);
        let fixture = Fixture::new(chain);
        let entry = fixture.reserve().await;

        let outcome = fixture
            .worker(Some(Duration::from_millis(20)))
            .settle(entry)
            .await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Unresolved {
                state: SettlementState::Sending,
                ..
            }
        ));
        assert!(fixture.ledger.snapshot(&alice()).unwrap().reservation.is_some());
        assert_eq!(fixture.metrics.unresolved.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_reservation_is_escalated() {
        let fixture = Fixture::new(MockChainClient::new("0xengine"));
        // Entry that was never reserved in the ledger
        let entry = SettlementEntry {
            account: alice(),
            settlement_address: "0xA11CE".to_string(),
            amount: 5_000_000,
        };

        let outcome = fixture.worker(None).settle(entry).await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Unresolved {
                state: SettlementState::Confirmed,
                ..
            }
        ));
        assert_eq!(fixture.metrics.integrity_violations.get(), 1);
        // Balance untouched
        assert_eq!(fixture.ledger.snapshot(&alice()).unwrap().balance, 5_000_000);
    }
}
