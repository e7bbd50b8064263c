//! Inbound credit handler
//!
//! Credits value received by the engine address to the account mapped to the
//! sender. Transfers are not deduplicated: a transfer delivered twice is
//! credited twice.

use crate::chain::IncomingTransfers;
use crate::error::LedgerError;
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use crate::types::{Credit, InboundTransfer};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What happened to one inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Balance credited
    Credited(Credit),
    /// Sender is not mapped to any account
    UnknownSender,
    /// Transfer was not addressed to the engine
    Ignored,
    /// Store failed; the credit was not applied
    Failed,
}

/// Applies inbound transfers to the ledger
pub struct InboundCreditHandler {
    ledger: Arc<dyn LedgerStore>,
    metrics: Metrics,
    engine_address: String,
}

impl std::fmt::Debug for InboundCreditHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCreditHandler")
            .field("engine_address", &self.engine_address)
            .finish_non_exhaustive()
    }
}

impl InboundCreditHandler {
    /// Create a handler for transfers received by `engine_address`
    pub fn new(ledger: Arc<dyn LedgerStore>, metrics: Metrics, engine_address: &str) -> Self {
        Self {
            ledger,
            metrics,
            engine_address: engine_address.to_lowercase(),
        }
    }

    /// Credit one transfer
    pub async fn handle(&self, transfer: &InboundTransfer) -> CreditOutcome {
        if transfer.to.to_lowercase() != self.engine_address {
            warn!(
                tx_id = %transfer.tx_id,
                to = %transfer.to,
                "Ignoring transfer not addressed to the engine"
            );
            return CreditOutcome::Ignored;
        }

        match self
            .ledger
            .credit_incoming(&transfer.from, transfer.amount)
            .await
        {
            Ok(credit) => {
                self.metrics.inbound_credited.inc();
                info!(
                    tx_id = %transfer.tx_id,
                    "Credited {} from {} to account {}, balance now {}",
                    transfer.amount, transfer.from, credit.account, credit.balance
                );
                CreditOutcome::Credited(credit)
            }
            Err(LedgerError::UnknownAddress(address)) => {
                self.metrics.inbound_unknown.inc();
                warn!(
                    tx_id = %transfer.tx_id,
                    amount = transfer.amount,
                    "Received transfer from unknown address {}, not credited",
                    address
                );
                CreditOutcome::UnknownSender
            }
            Err(e) => {
                error!(
                    tx_id = %transfer.tx_id,
                    from = %transfer.from,
                    amount = transfer.amount,
                    "Failed to credit incoming transfer: {}",
                    e
                );
                CreditOutcome::Failed
            }
        }
    }

    /// Consume `transfers` until the stream ends or `shutdown` flips to `true`
    pub async fn run(self, mut transfers: IncomingTransfers, mut shutdown: watch::Receiver<bool>) {
        info!("Listening for incoming transfers to {}", self.engine_address);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = transfers.next() => match next {
                    Some(transfer) => {
                        self.handle(&transfer).await;
                    }
                    None => {
                        warn!("Incoming transfer stream ended");
                        break;
                    }
                },
            }
        }

        info!("Inbound credit handler stopped");
    }
}
