//! Core types shared by the ledger store, the chain client and the workers
//!
//! Amounts are integers in the smallest denomination of the settlement asset.
//! Balances are signed, transfer and reservation amounts are unsigned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal ledger account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position within a sweep over all accounts.
///
/// `"0"` is both the first and the last cursor of a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanCursor(String);

impl ScanCursor {
    const TERMINAL: &'static str = "0";

    /// Cursor that starts a sweep
    pub fn start() -> Self {
        Self(Self::TERMINAL.to_string())
    }

    /// Wrap a cursor returned by the store
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// Whether the sweep has wrapped around
    pub fn is_terminal(&self) -> bool {
        self.0 == Self::TERMINAL
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScanCursor {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account as provisioned in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Ledger identity
    pub id: AccountId,

    /// Address on the payment network that settlements are sent to
    pub settlement_address: String,

    /// Real balance (what the engine owes the peer when positive)
    pub balance: i64,

    /// Decimal exponent of the balance denomination
    pub asset_scale: u8,

    /// Minimum available balance before this account is settled
    pub settle_threshold: Option<u64>,
}

impl Account {
    /// Create an account with no balance and no threshold
    pub fn new(id: impl Into<String>, settlement_address: impl Into<String>, asset_scale: u8) -> Self {
        Self {
            id: AccountId::new(id),
            settlement_address: settlement_address.into(),
            balance: 0,
            asset_scale,
            settle_threshold: None,
        }
    }

    /// Set the starting balance
    pub fn with_balance(mut self, balance: i64) -> Self {
        self.balance = balance;
        self
    }

    /// Set the per-account settlement threshold
    pub fn with_settle_threshold(mut self, threshold: u64) -> Self {
        self.settle_threshold = Some(threshold);
        self
    }
}

/// An account reserved by a scan and waiting to be settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEntry {
    /// Reserved account
    pub account: AccountId,

    /// Destination on the payment network
    pub settlement_address: String,

    /// Reserved amount, equal to the amount to send
    pub amount: u64,
}

/// An open hold on an account's balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Account holding the reservation
    pub account: AccountId,

    /// Reserved amount
    pub amount: u64,

    /// When the scan opened the reservation
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// How long the reservation has been open at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Result of crediting an inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    /// Account the address maps to
    pub account: AccountId,

    /// Real balance after the credit
    pub balance: i64,
}

/// Transfer observed on the payment network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTransfer {
    /// Sender address
    pub from: String,

    /// Recipient address, expected to be the engine's own
    pub to: String,

    /// Amount in ledger units
    pub amount: u64,

    /// Network transaction id
    pub tx_id: String,
}

/// Outcome of an outbound transfer that reached the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Network transaction id
    pub tx_id: String,

    /// `false` when the network rejected or reverted the transfer
    pub status: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_terminal() {
        assert!(ScanCursor::start().is_terminal());
        assert!(ScanCursor::default().is_terminal());
        assert!(!ScanCursor::new("17").is_terminal());
        assert!(ScanCursor::new("0").is_terminal());
    }

    #[test]
    fn test_account_builder() {
        let account = Account::new("alice", "0xAb", 9)
            .with_balance(5_000_000)
            .with_settle_threshold(1_000_000);
        assert_eq!(account.id.as_str(), "alice");
        assert_eq!(account.balance, 5_000_000);
        assert_eq!(account.settle_threshold, Some(1_000_000));
    }

    #[test]
    fn test_reservation_age() {
        let created_at = Utc::now();
        let reservation = Reservation {
            account: AccountId::new("alice"),
            amount: 10,
            created_at,
        };
        let later = created_at + chrono::Duration::seconds(90);
        assert_eq!(reservation.age(later).num_seconds(), 90);
    }
}
