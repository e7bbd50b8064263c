//! Ledger store client
//!
//! The engine never reads and then writes a balance. Every mutation goes through one
//! of the operations below, each evaluated atomically by the store, so concurrent
//! scans, settlements and inbound credits cannot lose updates or double-reserve.

pub mod memory;
pub mod redis_store;

use crate::error::LedgerError;
use crate::types::{AccountId, Credit, Reservation, ScanCursor, SettlementEntry};
use async_trait::async_trait;

pub use self::memory::InMemoryLedgerStore;
pub use self::redis_store::RedisLedgerStore;

/// Result type for ledger store operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Atomic balance operations consumed by the settlement core
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Continue a sweep from `cursor`, reserving every eligible account in the batch.
    ///
    /// An account is eligible when it has no open reservation and its available
    /// balance is at least `min_amount` (and its own threshold, if set). The full
    /// available balance is reserved in the same atomic step that reads it.
    async fn scan_for_settlement(
        &self,
        cursor: &ScanCursor,
        min_amount: u64,
    ) -> LedgerResult<(ScanCursor, Vec<SettlementEntry>)>;

    /// Close the open reservation and debit `amount` from the real balance.
    ///
    /// Returns the new available balance.
    async fn confirm_settlement(&self, account: &AccountId, amount: u64) -> LedgerResult<i64>;

    /// Close the open reservation and return `amount` to the available balance.
    ///
    /// Returns the new available balance.
    async fn release_reservation(&self, account: &AccountId, amount: u64) -> LedgerResult<i64>;

    /// Credit `amount` to the account mapped to `address`.
    async fn credit_incoming(&self, address: &str, amount: u64) -> LedgerResult<Credit>;

    /// List every open reservation
    async fn open_reservations(&self) -> LedgerResult<Vec<Reservation>>;
}
