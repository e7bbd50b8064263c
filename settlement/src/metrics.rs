//! Metrics collection for observability
//!
//! Prometheus metrics for the reconciliation loop, settlement workers and
//! inbound credits. Each [`Metrics`] owns its registry, so several engines
//! (or tests) can live in one process.
//!
//! # Metrics
//!
//! - `settlement_sweeps_total` - Sweeps completed
//! - `settlement_sweep_failures_total` - Sweeps aborted by a scan error
//! - `settlement_reservations_total` - Reservations opened by scans
//! - `settlement_confirmed_total` - Settlements confirmed in the ledger
//! - `settlement_released_total` - Reservations released after a failed transfer
//! - `settlement_unresolved_total` - Settlements whose outcome is unknown
//! - `settlement_integrity_violations_total` - Ledger integrity violations
//! - `settlement_inbound_credited_total` - Inbound transfers credited
//! - `settlement_inbound_unknown_total` - Inbound transfers from unmapped addresses
//! - `settlement_stale_reservations` - Stale reservations found at startup

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Sweeps completed
    pub sweeps: IntCounter,

    /// Sweeps aborted
    pub sweep_failures: IntCounter,

    /// Reservations opened
    pub reservations: IntCounter,

    /// Settlements confirmed
    pub confirmed: IntCounter,

    /// Reservations released
    pub released: IntCounter,

    /// Settlements left unresolved
    pub unresolved: IntCounter,

    /// Integrity violations
    pub integrity_violations: IntCounter,

    /// Inbound transfers credited
    pub inbound_credited: IntCounter,

    /// Inbound transfers from unknown addresses
    pub inbound_unknown: IntCounter,

    /// Stale reservations found by the startup audit
    pub stale_reservations: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let sweeps = counter("settlement_sweeps_total", "Sweeps completed")?;
        let sweep_failures = counter(
            "settlement_sweep_failures_total",
            "Sweeps aborted by a scan error",
        )?;
        let reservations = counter(
            "settlement_reservations_total",
            "Reservations opened by scans",
        )?;
        let confirmed = counter(
            "settlement_confirmed_total",
            "Settlements confirmed in the ledger",
        )?;
        let released = counter(
            "settlement_released_total",
            "Reservations released after a failed transfer",
        )?;
        let unresolved = counter(
            "settlement_unresolved_total",
            "Settlements whose outcome is unknown",
        )?;
        let integrity_violations = counter(
            "settlement_integrity_violations_total",
            "Ledger integrity violations",
        )?;
        let inbound_credited = counter(
            "settlement_inbound_credited_total",
            "Inbound transfers credited",
        )?;
        let inbound_unknown = counter(
            "settlement_inbound_unknown_total",
            "Inbound transfers from unmapped addresses",
        )?;

        let stale_reservations = IntGauge::new(
            "settlement_stale_reservations",
            "Stale reservations found at startup",
        )?;
        registry.register(Box::new(stale_reservations.clone()))?;

        Ok(Self {
            sweeps,
            sweep_failures,
            reservations,
            confirmed,
            released,
            unresolved,
            integrity_violations,
            inbound_credited,
            inbound_unknown,
            stale_reservations,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
