//! Ethereum chain client
//!
//! Outbound transfers are plain value transfers signed by a local private key.
//! Inbound transfers are found by polling new blocks for transactions whose
//! recipient is the engine address.
//!
//! Ledger amounts are in units of `10^-asset_scale` ETH; the default scale of 9
//! makes one ledger unit one gwei.

use super::{ChainClient, IncomingTransfers};
use crate::error::ChainError;
use crate::types::{InboundTransfer, Receipt};
use alloy::{
    consensus::Transaction as ConsensusTransaction,
    eips::BlockNumberOrTag,
    network::{EthereumWallet, TransactionBuilder, TransactionResponse},
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

/// Decimals of ETH's smallest unit (wei)
const WEI_SCALE: u8 = 18;

/// Buffered inbound transfers before the block watcher waits on the consumer
const INCOMING_BUFFER: usize = 256;

/// Chain client for Ethereum-compatible networks
#[derive(Clone)]
pub struct EthChainClient {
    provider: DynProvider,
    address: Address,
    address_str: String,
    asset_scale: u8,
    block_poll_interval: Duration,
}

impl std::fmt::Debug for EthChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthChainClient")
            .field("address", &self.address)
            .field("asset_scale", &self.asset_scale)
            .finish_non_exhaustive()
    }
}

impl EthChainClient {
    /// Connect to `endpoint` (http, ws or ipc) and sign with `private_key`
    pub async fn connect(
        endpoint: &str,
        private_key: &str,
        asset_scale: u8,
        block_poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        if asset_scale > WEI_SCALE {
            return Err(ChainError::InvalidAmount(format!(
                "asset scale {} exceeds wei precision",
                asset_scale
            )));
        }

        let signer: PrivateKeySigner = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| ChainError::InvalidCredential(format!("{}", e)))?;
        let address = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect(endpoint)
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?
            .erased();

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;

        info!(%address, chain_id, "Connected to Ethereum provider");

        Ok(Self {
            provider,
            address,
            address_str: address.to_string(),
            asset_scale,
            block_poll_interval,
        })
    }

    fn parse_address(address: &str) -> Result<Address, ChainError> {
        address
            .parse()
            .map_err(|_| ChainError::InvalidAddress(address.to_string()))
    }
}

/// Wei per ledger unit at `asset_scale`
pub fn wei_per_unit(asset_scale: u8) -> U256 {
    U256::from(10u64).pow(U256::from(WEI_SCALE - asset_scale.min(WEI_SCALE)))
}

/// Ledger units to wei
pub fn to_wei(amount: u64, asset_scale: u8) -> U256 {
    U256::from(amount) * wei_per_unit(asset_scale)
}

/// Wei to ledger units, truncating dust below one unit.
///
/// Returns `None` when the value does not fit a ledger amount.
pub fn from_wei(value: U256, asset_scale: u8) -> Option<(u64, U256)> {
    let per_unit = wei_per_unit(asset_scale);
    let units = value / per_unit;
    let dust = value % per_unit;
    if units > U256::from(u64::MAX) {
        return None;
    }
    Some((units.to::<u64>(), dust))
}

#[async_trait]
impl ChainClient for EthChainClient {
    fn address(&self) -> &str {
        &self.address_str
    }

    fn subscribe_incoming(&self, address: &str) -> Result<IncomingTransfers, ChainError> {
        let target = Self::parse_address(address)?;
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);

        tokio::spawn(watch_blocks(
            self.provider.clone(),
            target,
            self.asset_scale,
            self.block_poll_interval,
            tx,
        ));

        Ok(ReceiverStream::new(rx).boxed())
    }

    #[instrument(skip(self), fields(from = %self.address))]
    async fn send(&self, to: &str, amount: u64) -> Result<Receipt, ChainError> {
        let to = Self::parse_address(to)?;
        let value = to_wei(amount, self.asset_scale);

        let request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(to)
            .with_value(value);

        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|e| ChainError::TransferFailed(e.to_string()))?;
        let tx_id = pending.tx_hash().to_string();
        debug!(%tx_id, "Transfer submitted");

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::ReceiptUnavailable {
                tx_id,
                reason: e.to_string(),
            })?;

        Ok(Receipt {
            tx_id: receipt.transaction_hash.to_string(),
            status: receipt.status(),
        })
    }
}

/// Poll new blocks and forward value transfers to `target`.
///
/// Starts at the head block seen on the first poll. Stops when the receiver
/// is dropped.
async fn watch_blocks(
    provider: DynProvider,
    target: Address,
    asset_scale: u8,
    poll_interval: Duration,
    tx: mpsc::Sender<InboundTransfer>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut next_block: Option<u64> = None;

    info!(%target, "Watching blocks for incoming transfers");

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            debug!("Incoming transfer receiver dropped, stopping block watcher");
            return;
        }

        let head = match provider.get_block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Failed to fetch block number: {}", e);
                continue;
            }
        };

        let from = next_block.unwrap_or(head);
        for number in from..=head {
            let block = match provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
            {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!(number, "Block not available yet");
                    break;
                }
                Err(e) => {
                    warn!(number, "Failed to fetch block: {}", e);
                    break;
                }
            };

            for transaction in block.transactions.txns() {
                if ConsensusTransaction::to(transaction) != Some(target) {
                    continue;
                }
                let value = ConsensusTransaction::value(transaction);
                if value.is_zero() {
                    continue;
                }

                let tx_id = TransactionResponse::tx_hash(transaction).to_string();
                let Some((amount, dust)) = from_wei(value, asset_scale) else {
                    warn!(%tx_id, %value, "Incoming transfer exceeds ledger range, skipping");
                    continue;
                };
                if !dust.is_zero() {
                    debug!(%tx_id, %dust, "Ignoring sub-unit dust of incoming transfer");
                }
                if amount == 0 {
                    continue;
                }

                let transfer = InboundTransfer {
                    from: TransactionResponse::from(transaction).to_string(),
                    to: target.to_string(),
                    amount,
                    tx_id,
                };
                if tx.send(transfer).await.is_err() {
                    return;
                }
            }

            next_block = Some(number + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gwei_conversion() {
        assert_eq!(to_wei(1, 9), U256::from(1_000_000_000u64));
        assert_eq!(to_wei(5_000_000, 9), U256::from(5_000_000_000_000_000u64));
        assert_eq!(to_wei(3, 18), U256::from(3u64));
    }

    #[test]
    fn test_from_wei_truncates_dust() {
        let (units, dust) = from_wei(U256::from(2_000_000_000_123u64), 9).unwrap();
        assert_eq!(units, 2_000);
        assert_eq!(dust, U256::from(123u64));
    }

    #[test]
    fn test_from_wei_overflow() {
        assert!(from_wei(U256::MAX, 9).is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credential() {
        let err = EthChainClient::connect("http://localhost:8545", "not-a-key", 9, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_scale() {
        let err = EthChainClient::connect("http://localhost:8545", "00", 19, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidAmount(_)));
    }
}
