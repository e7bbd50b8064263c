//! Startup audit of open reservations
//!
//! A reservation that outlives its worker (crash, abort on shutdown, send
//! timeout) holds the account's balance until an operator decides whether the
//! transfer went out. The transaction id is not persisted, so the audit cannot
//! tell and only reports: old reservations are escalated, young ones are left
//! for workers that may still be running elsewhere.

use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use crate::types::Reservation;
use chrono::{Duration, Utc};
use tracing::{error, info};

/// Report every open reservation older than `safety_margin`.
///
/// Returns the stale reservations and sets the stale reservation gauge.
pub async fn audit_open_reservations(
    ledger: &dyn LedgerStore,
    metrics: &Metrics,
    safety_margin: Duration,
) -> Result<Vec<Reservation>> {
    let now = Utc::now();
    let open = ledger.open_reservations().await?;
    let total = open.len();

    let stale: Vec<Reservation> = open
        .into_iter()
        .filter(|reservation| reservation.age(now) > safety_margin)
        .collect();

    for reservation in &stale {
        error!(
            account = %reservation.account,
            amount = reservation.amount,
            created_at = %reservation.created_at,
            "Stale reservation needs manual resolution: check the network for a transfer of {} to account {}",
            reservation.amount,
            reservation.account
        );
    }

    metrics.stale_reservations.set(stale.len() as i64);
    info!(
        "Startup audit found {} open reservations, {} stale",
        total,
        stale.len()
    );
    Ok(stale)
}
