//! Scripted chain client for tests and local runs

use super::{ChainClient, IncomingTransfers};
use crate::error::ChainError;
use crate::types::{InboundTransfer, Receipt};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

/// Scripted result of one `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Mined with a successful receipt
    Success,
    /// Mined but rejected by the network
    Rejected,
    /// Never reached the network
    TransportError,
    /// Broadcast, but the receipt was lost
    ReceiptLost,
    /// Never resolves
    Hang,
}

/// Transfer recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    /// Destination address
    pub to: String,
    /// Amount in ledger units
    pub amount: u64,
    /// Outcome that was played back
    pub outcome: MockOutcome,
}

/// Chain client that plays back scripted outcomes
#[derive(Debug)]
pub struct MockChainClient {
    address: String,
    latency: Duration,
    default_outcome: MockOutcome,
    script: Mutex<VecDeque<MockOutcome>>,
    sent: Mutex<Vec<SentTransfer>>,
    incoming_tx: mpsc::UnboundedSender<InboundTransfer>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundTransfer>>>,
}

impl MockChainClient {
    /// Create a mock whose sends succeed unless scripted otherwise
    pub fn new(address: impl Into<String>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            address: address.into(),
            latency: Duration::ZERO,
            default_outcome: MockOutcome::Success,
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Simulated network latency per send
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcome used once the script is exhausted
    pub fn with_default_outcome(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Queue outcomes for the next sends, in order
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Deliver a transfer to the incoming subscription
    pub fn deliver(&self, transfer: InboundTransfer) {
        if self.incoming_tx.send(transfer).is_err() {
            warn!("Mock chain: incoming subscription dropped");
        }
    }

    /// Every send attempted so far
    pub fn sent(&self) -> Vec<SentTransfer> {
        self.sent.lock().clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn subscribe_incoming(&self, address: &str) -> Result<IncomingTransfers, ChainError> {
        let rx = self
            .incoming_rx
            .lock()
            .take()
            .ok_or(ChainError::SubscriptionTaken)?;
        let address = address.to_lowercase();
        Ok(UnboundedReceiverStream::new(rx)
            .filter(move |transfer| {
                futures::future::ready(transfer.to.to_lowercase() == address)
            })
            .boxed())
    }

    async fn send(&self, to: &str, amount: u64) -> Result<Receipt, ChainError> {
        let outcome = self.next_outcome();
        info!("Mock chain: sending {} to {} ({:?})", amount, to, outcome);

        self.sent.lock().push(SentTransfer {
            to: to.to_string(),
            amount,
            outcome: outcome.clone(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let tx_id = format!("0xmock{:08x}", self.sent.lock().len());
        match outcome {
            MockOutcome::Success => Ok(Receipt { tx_id, status: true }),
            MockOutcome::Rejected => Ok(Receipt {
                tx_id,
                status: false,
            }),
            MockOutcome::TransportError => Err(ChainError::TransferFailed(
                "Simulated provider failure".to_string(),
            )),
            MockOutcome::ReceiptLost => Err(ChainError::ReceiptUnavailable {
                tx_id,
                reason: "Simulated connection drop".to_string(),
            }),
            MockOutcome::Hang => futures::future::pending().await,
        }
    }
}
