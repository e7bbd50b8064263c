//! In-process ledger store
//!
//! Every operation runs under one mutex, which gives the same all-or-nothing
//! semantics as the Redis scripts. Used by tests and local runs.

use super::{LedgerResult, LedgerStore};
use crate::error::LedgerError;
use crate::types::{Account, AccountId, Credit, Reservation, ScanCursor, SettlementEntry};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Prefix of non-terminal cursors, so an account id never reads as the terminal cursor
const CURSOR_PREFIX: &str = "k:";

/// Point-in-time view of one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// Real balance
    pub balance: i64,

    /// Real balance minus the open reservation
    pub available: i64,

    /// Open reservation, if any
    pub reservation: Option<Reservation>,
}

#[derive(Debug)]
struct AccountState {
    account: Account,
    reservation: Option<Reservation>,
}

impl AccountState {
    fn available(&self) -> i64 {
        let reserved = self.reservation.as_ref().map_or(0, |r| r.amount as i64);
        self.account.balance - reserved
    }
}

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, AccountState>,
    addresses: HashMap<String, AccountId>,
}

/// Ledger store held in memory
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
    asset_scale: u8,
    batch_size: usize,
}

impl InMemoryLedgerStore {
    /// Create an empty store
    pub fn new(asset_scale: u8, batch_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            asset_scale,
            batch_size: batch_size.max(1),
        }
    }

    /// Add or replace an account and map its settlement address to it
    pub fn insert_account(&self, account: Account) {
        let mut state = self.state.lock();
        state
            .addresses
            .insert(account.settlement_address.to_lowercase(), account.id.clone());
        state.accounts.insert(
            account.id.clone(),
            AccountState {
                account,
                reservation: None,
            },
        );
    }

    /// Read an account's balances
    pub fn snapshot(&self, account: &AccountId) -> Option<AccountSnapshot> {
        let state = self.state.lock();
        state.accounts.get(account).map(|entry| AccountSnapshot {
            balance: entry.account.balance,
            available: entry.available(),
            reservation: entry.reservation.clone(),
        })
    }

    /// Sum of all real balances
    pub fn total_balance(&self) -> i64 {
        let state = self.state.lock();
        state.accounts.values().map(|entry| entry.account.balance).sum()
    }

    fn close_reservation<'a>(
        state: &'a mut State,
        account: &AccountId,
        amount: u64,
    ) -> LedgerResult<&'a mut AccountState> {
        let entry = state
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::NoOpenReservation(account.clone()))?;
        let reserved = entry
            .reservation
            .as_ref()
            .map(|r| r.amount)
            .ok_or_else(|| LedgerError::NoOpenReservation(account.clone()))?;
        if reserved != amount {
            return Err(LedgerError::AmountMismatch {
                account: account.clone(),
                reserved,
                requested: amount,
            });
        }
        entry.reservation = None;
        Ok(entry)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn scan_for_settlement(
        &self,
        cursor: &ScanCursor,
        min_amount: u64,
    ) -> LedgerResult<(ScanCursor, Vec<SettlementEntry>)> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let lower = if cursor.is_terminal() {
            Bound::Unbounded
        } else {
            let last = cursor.as_str().strip_prefix(CURSOR_PREFIX).ok_or_else(|| {
                LedgerError::UnexpectedReply(format!("cursor {} not issued by this store", cursor))
            })?;
            Bound::Excluded(AccountId::new(last))
        };

        let mut entries = Vec::new();
        let mut last = None;
        let mut visited = 0;
        for (id, entry) in state.accounts.range_mut((lower, Bound::Unbounded)) {
            if visited == self.batch_size {
                break;
            }
            visited += 1;
            last = Some(id.clone());

            if entry.reservation.is_some() || entry.account.asset_scale != self.asset_scale {
                continue;
            }
            let required = min_amount.max(entry.account.settle_threshold.unwrap_or(0));
            let available = entry.available();
            if available <= 0 || (available as u64) < required {
                continue;
            }

            let amount = available as u64;
            entry.reservation = Some(Reservation {
                account: id.clone(),
                amount,
                created_at: now,
            });
            entries.push(SettlementEntry {
                account: id.clone(),
                settlement_address: entry.account.settlement_address.clone(),
                amount,
            });
        }

        let has_more = match &last {
            Some(last) => state
                .accounts
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next()
                .is_some(),
            None => false,
        };
        let next = match last {
            Some(last) if has_more => ScanCursor::new(format!("{}{}", CURSOR_PREFIX, last)),
            _ => ScanCursor::start(),
        };

        Ok((next, entries))
    }

    async fn confirm_settlement(&self, account: &AccountId, amount: u64) -> LedgerResult<i64> {
        let mut state = self.state.lock();
        let entry = Self::close_reservation(&mut state, account, amount)?;
        entry.account.balance -= amount as i64;
        Ok(entry.available())
    }

    async fn release_reservation(&self, account: &AccountId, amount: u64) -> LedgerResult<i64> {
        let mut state = self.state.lock();
        let entry = Self::close_reservation(&mut state, account, amount)?;
        Ok(entry.available())
    }

    async fn credit_incoming(&self, address: &str, amount: u64) -> LedgerResult<Credit> {
        let mut state = self.state.lock();
        let account = state
            .addresses
            .get(&address.to_lowercase())
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAddress(address.to_string()))?;
        let entry = state
            .accounts
            .get_mut(&account)
            .ok_or_else(|| LedgerError::UnknownAddress(address.to_string()))?;
        entry.account.balance = i64::try_from(amount)
            .ok()
            .and_then(|amount| entry.account.balance.checked_add(amount))
            .ok_or_else(|| LedgerError::AmountOutOfRange {
                account: account.clone(),
                amount,
            })?;
        Ok(Credit {
            account,
            balance: entry.account.balance,
        })
    }

    async fn open_reservations(&self) -> LedgerResult<Vec<Reservation>> {
        let state = self.state.lock();
        Ok(state
            .accounts
            .values()
            .filter_map(|entry| entry.reservation.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: u8 = 9;

    fn store_with(accounts: Vec<Account>) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new(SCALE, 2);
        for account in accounts {
            store.insert_account(account);
        }
        store
    }

    async fn sweep(store: &InMemoryLedgerStore, min_amount: u64) -> Vec<SettlementEntry> {
        let mut cursor = ScanCursor::start();
        let mut all = Vec::new();
        loop {
            let (next, entries) = store.scan_for_settlement(&cursor, min_amount).await.unwrap();
            all.extend(entries);
            if next.is_terminal() {
                break;
            }
            cursor = next;
        }
        all
    }

    #[tokio::test]
    async fn test_sweep_reserves_eligible_accounts() {
        let store = store_with(vec![
            Account::new("a", "0xA", SCALE).with_balance(5_000_000),
            Account::new("b", "0xB", SCALE).with_balance(999_999),
            Account::new("c", "0xC", SCALE).with_balance(-10),
            Account::new("d", "0xD", SCALE).with_balance(2_000_000),
            Account::new("e", "0xE", SCALE).with_balance(3_000_000),
        ]);

        let entries = sweep(&store, 1_000_000).await;
        let ids: Vec<_> = entries.iter().map(|e| e.account.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "e"]);

        let a = store.snapshot(&AccountId::new("a")).unwrap();
        assert_eq!(a.balance, 5_000_000);
        assert_eq!(a.available, 0);
        assert_eq!(a.reservation.unwrap().amount, 5_000_000);

        // Reserved accounts are excluded from the next sweep
        assert!(sweep(&store, 1_000_000).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_respects_account_threshold_and_scale() {
        let store = store_with(vec![
            Account::new("a", "0xA", SCALE)
                .with_balance(5_000_000)
                .with_settle_threshold(6_000_000),
            Account::new("b", "0xB", 6).with_balance(5_000_000),
        ]);
        assert!(sweep(&store, 1_000_000).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_above_every_balance_is_empty() {
        let store = store_with(vec![Account::new("a", "0xA", SCALE).with_balance(5)]);
        let (next, entries) = store
            .scan_for_settlement(&ScanCursor::start(), 1_000)
            .await
            .unwrap();
        assert!(next.is_terminal());
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_terminates_immediately() {
        let store = InMemoryLedgerStore::new(SCALE, 10);
        let (next, entries) = store.scan_for_settlement(&ScanCursor::start(), 0).await.unwrap();
        assert!(next.is_terminal());
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_and_release() {
        let store = store_with(vec![
            Account::new("a", "0xA", SCALE).with_balance(5_000_000),
            Account::new("b", "0xB", SCALE).with_balance(7_000_000),
        ]);
        sweep(&store, 1).await;

        let available = store
            .confirm_settlement(&AccountId::new("a"), 5_000_000)
            .await
            .unwrap();
        assert_eq!(available, 0);
        let a = store.snapshot(&AccountId::new("a")).unwrap();
        assert_eq!(a.balance, 0);
        assert!(a.reservation.is_none());

        let available = store
            .release_reservation(&AccountId::new("b"), 7_000_000)
            .await
            .unwrap();
        assert_eq!(available, 7_000_000);
        let b = store.snapshot(&AccountId::new("b")).unwrap();
        assert_eq!(b.balance, 7_000_000);
        assert!(b.reservation.is_none());
    }

    #[tokio::test]
    async fn test_integrity_violations() {
        let store = store_with(vec![Account::new("a", "0xA", SCALE).with_balance(5_000_000)]);
        let account = AccountId::new("a");

        let err = store.confirm_settlement(&account, 5_000_000).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoOpenReservation(_)));

        sweep(&store, 1).await;
        let err = store.release_reservation(&account, 1).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AmountMismatch {
                reserved: 5_000_000,
                requested: 1,
                ..
            }
        ));
        // A rejected close leaves the reservation untouched
        assert!(store.snapshot(&account).unwrap().reservation.is_some());

        store.confirm_settlement(&account, 5_000_000).await.unwrap();
        let err = store.confirm_settlement(&account, 5_000_000).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoOpenReservation(_)));
        assert_eq!(store.snapshot(&account).unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_credit_incoming() {
        let store = store_with(vec![Account::new("b", "0xBeEf", SCALE).with_balance(100)]);

        let credit = store.credit_incoming("0xbeef", 2_000_000).await.unwrap();
        assert_eq!(credit.account, AccountId::new("b"));
        assert_eq!(credit.balance, 2_000_100);

        let err = store.credit_incoming("0xdead", 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAddress(_)));
    }

    #[tokio::test]
    async fn test_sweep_visits_account_named_like_terminal_cursor() {
        let store = InMemoryLedgerStore::new(SCALE, 1);
        store.insert_account(Account::new("0", "0xA", SCALE).with_balance(5_000_000));
        store.insert_account(Account::new("1", "0xB", SCALE).with_balance(5_000_000));

        let (next, entries) = store
            .scan_for_settlement(&ScanCursor::start(), 1_000_000)
            .await
            .unwrap();
        assert!(!next.is_terminal());
        assert_eq!(entries[0].account, AccountId::new("0"));

        let ids: Vec<_> = sweep(&store, 0).await.into_iter().map(|e| e.account).collect();
        assert_eq!(ids, vec![AccountId::new("1")]);
    }

    #[tokio::test]
    async fn test_scan_rejects_foreign_cursor() {
        let store = store_with(vec![Account::new("a", "0xA", SCALE).with_balance(5)]);
        let err = store
            .scan_for_settlement(&ScanCursor::new("17"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnexpectedReply(_)));
    }

    #[tokio::test]
    async fn test_credit_out_of_range_is_rejected() {
        let store = store_with(vec![Account::new("b", "0xB", SCALE).with_balance(100)]);

        let err = store.credit_incoming("0xB", u64::MAX).await.unwrap_err();
        assert!(matches!(err, LedgerError::AmountOutOfRange { amount: u64::MAX, .. }));

        store.credit_incoming("0xB", i64::MAX as u64 - 150).await.unwrap();
        let err = store.credit_incoming("0xB", 100).await.unwrap_err();
        assert!(matches!(err, LedgerError::AmountOutOfRange { .. }));
        // Rejected credits leave the balance untouched
        assert_eq!(store.snapshot(&AccountId::new("b")).unwrap().balance, i64::MAX - 50);
    }

    #[tokio::test]
    async fn test_credit_during_reservation_raises_available() {
        let store = store_with(vec![Account::new("b", "0xB", SCALE).with_balance(5_000_000)]);
        sweep(&store, 1).await;
        store.credit_incoming("0xB", 2_000_000).await.unwrap();

        let b = store.snapshot(&AccountId::new("b")).unwrap();
        assert_eq!(b.balance, 7_000_000);
        assert_eq!(b.available, 2_000_000);
        assert_eq!(b.reservation.unwrap().amount, 5_000_000);
    }

    #[tokio::test]
    async fn test_open_reservations() {
        let store = store_with(vec![
            Account::new("a", "0xA", SCALE).with_balance(5),
            Account::new("b", "0xB", SCALE).with_balance(0),
        ]);
        assert!(store.open_reservations().await.unwrap().is_empty());
        sweep(&store, 1).await;
        let open = store.open_reservations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].account, AccountId::new("a"));
        assert_eq!(open[0].amount, 5);
    }
}
