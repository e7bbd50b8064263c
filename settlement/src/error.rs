//! Error types for the settlement engine

use crate::types::AccountId;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by a [`LedgerStore`](crate::ledger::LedgerStore)
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Store unreachable or command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Confirm or release called while the account has no open reservation
    #[error("No open reservation for account {0}")]
    NoOpenReservation(AccountId),

    /// Confirm or release amount disagrees with the open reservation
    #[error("Amount mismatch for account {account}: reserved {reserved}, requested {requested}")]
    AmountMismatch {
        /// Account holding the reservation
        account: AccountId,
        /// Amount held by the open reservation
        reserved: u64,
        /// Amount passed by the caller
        requested: u64,
    },

    /// No account is mapped to the external address
    #[error("No account mapped to address {0}")]
    UnknownAddress(String),

    /// Amount would push the balance outside the ledger's range
    #[error("Amount {amount} out of range for account {account}")]
    AmountOutOfRange {
        /// Account being credited
        account: AccountId,
        /// Rejected amount
        amount: u64,
    },

        /// A script returned something the client does not understand
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

impl LedgerError {
    /// Whether the error points at corrupted ledger state rather than a transient fault.
    ///
    /// Integrity violations are escalated and never auto-corrected.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::NoOpenReservation(_) | LedgerError::AmountMismatch { .. }
        )
    }
}

/// Errors returned by a [`ChainClient`](crate::chain::ChainClient)
#[derive(Error, Debug)]
pub enum ChainError {
    /// Network or provider failure before the transfer was submitted
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Transfer was broadcast but its receipt could not be fetched; it may still be mined
    #[error("Receipt unavailable for transfer {tx_id}: {reason}")]
    ReceiptUnavailable {
        /// Hash of the broadcast transaction
        tx_id: String,
        /// Why the receipt could not be fetched
        reason: String,
    },

    /// Address could not be parsed for the network
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Signing credential could not be loaded
    #[error("Invalid signing credential: {0}")]
    InvalidCredential(String),

    /// Amount cannot be represented on the network
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Provider connection failed
    #[error("Provider connection failed: {0}")]
    Connection(String),

    /// Incoming transfers were already subscribed to
    #[error("Incoming transfer subscription already taken")]
    SubscriptionTaken,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger store error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Payment network error
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine lifecycle misuse
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Ledger(LedgerError::Redis(err))
    }
}
