//! Payment network client

pub mod eth;
pub mod mock;

use crate::error::ChainError;
use crate::types::{InboundTransfer, Receipt};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use eth::EthChainClient;
pub use mock::{MockChainClient, MockOutcome};

/// Stream of transfers addressed to the engine
pub type IncomingTransfers = BoxStream<'static, InboundTransfer>;

/// Access to the external payment network
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The engine's own address, derived from its signing credential
    fn address(&self) -> &str;

    /// Watch for transfers sent to `address`.
    ///
    /// The stream is lazy, infinite and cannot be restarted. It may deliver a
    /// transfer twice and in any order.
    fn subscribe_incoming(&self, address: &str) -> Result<IncomingTransfers, ChainError>;

    /// Send `amount` ledger units to `to` and wait for the network's verdict.
    ///
    /// `Err` means the transfer never got a receipt; a receipt with
    /// `status == false` means the network rejected it.
    async fn send(&self, to: &str, amount: u64) -> Result<Receipt, ChainError>;
}
