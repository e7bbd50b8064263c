//! Redis-backed ledger store
//!
//! Each operation is a Lua script evaluated by Redis in a single round trip, which
//! makes it atomic with respect to every other client of the same server. Scripts are
//! invoked by SHA and loaded on demand.
//!
//! Key layout:
//! - `accounts:<id>`: hash with `id`, `settlement_address`, `balance`, `asset_scale`,
//!   optional `settle_threshold`, and `reserved` / `reserved_at` while a reservation
//!   is open
//! - `settlement_addresses`: hash from lower-cased settlement address to account id
//!
//! The scan script writes after `SCAN`, which needs script effects replication
//! (the default from Redis 5) and a non-clustered deployment.

use super::{LedgerResult, LedgerStore};
use crate::error::LedgerError;
use crate::types::{AccountId, Credit, Reservation, ScanCursor, SettlementEntry};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

/// Key prefixes
pub mod keys {
    /// Account hash prefix
    pub const ACCOUNT: &str = "accounts";
    /// Settlement address to account id mapping
    pub const SETTLEMENT_ADDRESSES: &str = "settlement_addresses";
}

const OK: &str = "OK";
const NO_OPEN_RESERVATION: &str = "NO_OPEN_RESERVATION";
const AMOUNT_MISMATCH: &str = "AMOUNT_MISMATCH";
const UNKNOWN_ADDRESS: &str = "UNKNOWN_ADDRESS";

struct Scripts {
    scan_for_settlement: Script,
    confirm_settlement: Script,
    release_reservation: Script,
    credit_incoming: Script,
    open_reservations: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            scan_for_settlement: Script::new(include_str!("scripts/scan_for_settlement.lua")),
            confirm_settlement: Script::new(include_str!("scripts/confirm_settlement.lua")),
            release_reservation: Script::new(include_str!("scripts/release_reservation.lua")),
            credit_incoming: Script::new(include_str!("scripts/credit_incoming.lua")),
            open_reservations: Script::new(include_str!("scripts/open_reservations.lua")),
        }
    }
}

/// Ledger store backed by a Redis server
#[derive(Clone)]
pub struct RedisLedgerStore {
    redis: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
    asset_scale: u8,
    batch_size: u32,
}

impl std::fmt::Debug for RedisLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLedgerStore")
            .field("asset_scale", &self.asset_scale)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl RedisLedgerStore {
    /// Wrap an existing connection
    pub fn new(redis: ConnectionManager, asset_scale: u8, batch_size: u32) -> Self {
        Self {
            redis,
            scripts: std::sync::Arc::new(Scripts::load()),
            asset_scale,
            batch_size,
        }
    }

    /// Connect to `url` and check the server answers
    pub async fn connect(url: &str, asset_scale: u8, batch_size: u32) -> LedgerResult<Self> {
        let client = redis::Client::open(url)?;
        let mut redis = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut redis).await?;
        debug!("Redis answered {}", pong);
        info!("Connected to ledger store at {}", url);
        Ok(Self::new(redis, asset_scale, batch_size))
    }

    /// Write an account hash and its address mapping.
    ///
    /// Provisioning helper for local setups and tests; it is not atomic with
    /// respect to the settlement scripts and must not be used on live accounts.
    pub async fn put_account(&self, account: &crate::types::Account) -> LedgerResult<()> {
        let key = format!("{}:{}", keys::ACCOUNT, account.id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &key,
                &[
                    ("id", account.id.to_string()),
                    ("settlement_address", account.settlement_address.clone()),
                    ("balance", account.balance.to_string()),
                    ("asset_scale", account.asset_scale.to_string()),
                ],
            )
            .ignore();
        if let Some(threshold) = account.settle_threshold {
            pipe.hset(&key, "settle_threshold", threshold).ignore();
        }
        pipe.hset(
            keys::SETTLEMENT_ADDRESSES,
            account.settlement_address.to_lowercase(),
            account.id.as_str(),
        )
        .ignore();
        let _: () = pipe.query_async(&mut self.redis.clone()).await?;
        Ok(())
    }

    fn resolve(account: &AccountId, amount: u64, status: &str, value: i64) -> LedgerResult<i64> {
        match status {
            OK => Ok(value),
            NO_OPEN_RESERVATION => Err(LedgerError::NoOpenReservation(account.clone())),
            AMOUNT_MISMATCH => Err(LedgerError::AmountMismatch {
                account: account.clone(),
                reserved: value.max(0) as u64,
                requested: amount,
            }),
            other => Err(LedgerError::UnexpectedReply(format!(
                "status {} for account {}",
                other, account
            ))),
        }
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn scan_for_settlement(
        &self,
        cursor: &ScanCursor,
        min_amount: u64,
    ) -> LedgerResult<(ScanCursor, Vec<SettlementEntry>)> {
        let (next, records): (String, Vec<(String, String, i64)>) = self
            .scripts
            .scan_for_settlement
            .arg(cursor.as_str())
            .arg(min_amount)
            .arg(u32::from(self.asset_scale))
            .arg(self.batch_size)
            .invoke_async(&mut self.redis.clone())
            .await?;

        let entries = records
            .into_iter()
            .map(|(account, settlement_address, amount)| {
                let amount = u64::try_from(amount).map_err(|_| {
                    LedgerError::UnexpectedReply(format!(
                        "negative reservation {} for account {}",
                        amount, account
                    ))
                })?;
                Ok(SettlementEntry {
                    account: AccountId::new(account),
                    settlement_address,
                    amount,
                })
            })
            .collect::<LedgerResult<Vec<_>>>()?;

        Ok((ScanCursor::new(next), entries))
    }

    async fn confirm_settlement(&self, account: &AccountId, amount: u64) -> LedgerResult<i64> {
        let (status, value): (String, i64) = self
            .scripts
            .confirm_settlement
            .arg(account.as_str())
            .arg(amount)
            .invoke_async(&mut self.redis.clone())
            .await?;
        Self::resolve(account, amount, &status, value)
    }

    async fn release_reservation(&self, account: &AccountId, amount: u64) -> LedgerResult<i64> {
        let (status, value): (String, i64) = self
            .scripts
            .release_reservation
            .arg(account.as_str())
            .arg(amount)
            .invoke_async(&mut self.redis.clone())
            .await?;
        Self::resolve(account, amount, &status, value)
    }

    async fn credit_incoming(&self, address: &str, amount: u64) -> LedgerResult<Credit> {
        let (status, balance, account): (String, i64, String) = self
            .scripts
            .credit_incoming
            .arg(address)
            .arg(amount)
            .invoke_async(&mut self.redis.clone())
            .await?;

        match status.as_str() {
            OK => Ok(Credit {
                account: AccountId::new(account),
                balance,
            }),
            UNKNOWN_ADDRESS => Err(LedgerError::UnknownAddress(address.to_string())),
            other => Err(LedgerError::UnexpectedReply(format!(
                "status {} crediting {}",
                other, address
            ))),
        }
    }

    async fn open_reservations(&self) -> LedgerResult<Vec<Reservation>> {
        let mut cursor = ScanCursor::start();
        let mut reservations = Vec::new();

        loop {
            let (next, records): (String, Vec<(String, i64, i64)>) = self
                .scripts
                .open_reservations
                .arg(cursor.as_str())
                .arg(self.batch_size)
                .invoke_async(&mut self.redis.clone())
                .await?;

            for (account, amount, reserved_at) in records {
                let created_at = Utc
                    .timestamp_opt(reserved_at, 0)
                    .single()
                    .ok_or_else(|| {
                        LedgerError::UnexpectedReply(format!(
                            "reservation timestamp {} for account {}",
                            reserved_at, account
                        ))
                    })?;
                reservations.push(Reservation {
                    account: AccountId::new(account),
                    amount: amount.max(0) as u64,
                    created_at,
                });
            }

            cursor = ScanCursor::new(next);
            if cursor.is_terminal() {
                break;
            }
        }

        Ok(reservations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_statuses() {
        let account = AccountId::new("alice");
        assert_eq!(RedisLedgerStore::resolve(&account, 5, OK, 42).unwrap(), 42);

        let err = RedisLedgerStore::resolve(&account, 5, NO_OPEN_RESERVATION, 0).unwrap_err();
        assert!(matches!(err, LedgerError::NoOpenReservation(_)));

        let err = RedisLedgerStore::resolve(&account, 5, AMOUNT_MISMATCH, 7).unwrap_err();
        match err {
            LedgerError::AmountMismatch {
                reserved, requested, ..
            } => {
                assert_eq!(reserved, 7);
                assert_eq!(requested, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = RedisLedgerStore::resolve(&account, 5, "WAT", 0).unwrap_err();
        assert!(matches!(err, LedgerError::UnexpectedReply(_)));
    }

    #[test]
    fn test_scripts_keep_amounts_as_strings() {
        for script in [
            include_str!("scripts/confirm_settlement.lua"),
            include_str!("scripts/release_reservation.lua"),
        ] {
            assert!(!script.contains("tonumber"));
            assert!(script.contains("reserved ~= amount"));
        }
        let scan = include_str!("scripts/scan_for_settlement.lua");
        assert!(scan.contains("'reserved', raw_balance"));
    }

    #[test]
    fn test_scripts_reference_layout() {
        assert!(include_str!("scripts/scan_for_settlement.lua").contains("accounts:*"));
        assert!(include_str!("scripts/credit_incoming.lua").contains(keys::SETTLEMENT_ADDRESSES));
    }
}
