//! Ethereum Settlement Engine
//!
//! Keeps a Redis ledger of per-peer balances in step with an Ethereum account.
//!
//! # Architecture
//!
//! The engine runs two independent tasks:
//!
//! 1. **Reconciliation**: every poll interval, sweep the ledger and reserve each
//!    balance that is large enough to settle, then send it on-chain from its own
//!    worker task. A successful transfer debits the ledger; a failed one
//!    releases the reservation so the next sweep retries it.
//! 2. **Inbound credit**: watch the network for transfers to the engine address
//!    and credit them to the account mapped to the sender.
//!
//! Balances and reservations live only in the ledger store, which applies every
//! change atomically. At most one reservation is open per account, so two
//! workers never settle the same balance.
//!
//! # Example
//!
//! ```no_run
//! use eth_settlement_engine::{Config, SettlementEngine};
//!
//! #[tokio::main]
//! async fn main() -> eth_settlement_engine::Result<()> {
//!     let config = Config::from_env()?;
//!     let mut engine = SettlementEngine::connect(config).await?;
//!
//!     engine.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod ledger;
pub mod metrics;
pub mod reconciliation;
pub mod recovery;
pub mod types;
pub mod worker;

// Re-exports
pub use chain::ChainClient;
pub use config::Config;
pub use engine::SettlementEngine;
pub use error::{Error, Result};
pub use ledger::LedgerStore;
pub use metrics::Metrics;
pub use types::*;
