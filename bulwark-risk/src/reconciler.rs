//! Periodic internal-vs-venue position reconciliation.
//!
//! Drift within the tolerance is auto-corrected by adopting the venue's
//! quantity. Drift beyond it publishes a critical mismatch event, cancels
//! outstanding orders for the symbol and trips the breaker; a streak of
//! failing cycles forces the breaker OPEN outright.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bulwark_account::PositionBook;
use bulwark_bus::EventBus;
use bulwark_core::{Quantity, Symbol};
use bulwark_exchange::ExchangeClient;
use bulwark_journal::OrderStore;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{CircuitBreaker, RiskResult};

/// Reconciler tuning.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Maximum relative difference that is auto-corrected (0.01 = 1%).
    pub tolerance: Decimal,
    /// Cadence of the periodic cycle.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(1, 2),
            interval: Duration::from_secs(30),
        }
    }
}

/// Per-symbol comparison produced by one cycle.
#[derive(Clone, Debug)]
pub struct SymbolDiff {
    pub symbol: Symbol,
    pub internal: Quantity,
    pub venue: Quantity,
    pub within_tolerance: bool,
}

/// Outcome of one reconciliation cycle.
#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub synced: Vec<SymbolDiff>,
    pub mismatched: Vec<SymbolDiff>,
}

impl ReconcileReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Compares the internal position book against the venue.
pub struct PositionReconciler {
    exchange: Arc<dyn ExchangeClient>,
    positions: Arc<PositionBook>,
    store: Arc<OrderStore>,
    breaker: Arc<CircuitBreaker>,
    bus: Arc<EventBus>,
    config: ReconcilerConfig,
}

impl PositionReconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        positions: Arc<PositionBook>,
        store: Arc<OrderStore>,
        breaker: Arc<CircuitBreaker>,
        bus: Arc<EventBus>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            exchange,
            positions,
            store,
            breaker,
            bus,
            config,
        }
    }

    /// Run one cycle over the union of internal and venue symbols.
    pub async fn run_once(&self) -> RiskResult<ReconcileReport> {
        let venue_positions = self.exchange.fetch_positions(None).await?;
        let mut symbols: BTreeSet<Symbol> = venue_positions
            .iter()
            .map(|position| position.symbol.clone())
            .collect();
        symbols.extend(
            self.positions
                .all()
                .into_iter()
                .map(|position| position.symbol),
        );

        let mut report = ReconcileReport::default();
        for symbol in symbols {
            let internal = self
                .positions
                .get(&symbol)
                .map(|position| position.quantity)
                .unwrap_or(Decimal::ZERO);
            let venue = venue_positions
                .iter()
                .find(|position| position.symbol == symbol)
                .map(|position| position.quantity)
                .unwrap_or(Decimal::ZERO);

            let denom = Decimal::ONE.max(venue.abs());
            let drift = (internal - venue).abs() / denom;
            let within = drift <= self.config.tolerance;
            let diff = SymbolDiff {
                symbol: symbol.clone(),
                internal,
                venue,
                within_tolerance: within,
            };
            report.checked += 1;

            if within {
                if internal != venue {
                    debug!(%symbol, %internal, %venue, "drift within tolerance, adopting venue quantity");
                    self.positions.set_quantity(&symbol, venue);
                }
                report.synced.push(diff);
            } else {
                warn!(%symbol, %internal, %venue, "position mismatch beyond tolerance");
                report.mismatched.push(diff);
            }
        }

        if report.passed() {
            self.breaker.record_reconcile_success()?;
            self.bus
                .publish(
                    "reconcile:ok",
                    json!({ "checked": report.checked }),
                    "position_reconciler",
                )
                .await?;
        } else {
            self.escalate(&report).await?;
        }
        Ok(report)
    }

    async fn escalate(&self, report: &ReconcileReport) -> RiskResult<()> {
        for diff in &report.mismatched {
            self.bus
                .publish(
                    "risk:position_mismatch",
                    json!({
                        "symbol": diff.symbol,
                        "internal": diff.internal,
                        "venue": diff.venue,
                        "tolerance": self.config.tolerance,
                    }),
                    "position_reconciler",
                )
                .await?;
            self.cancel_outstanding(&diff.symbol).await;
        }
        let failures = self.breaker.record_reconcile_failure()?;
        self.breaker.trip("position mismatch beyond tolerance")?;
        warn!(
            failures,
            mismatched = report.mismatched.len(),
            "reconciliation failed, breaker tripped"
        );
        Ok(())
    }

    /// Best-effort cancellation of every non-terminal order on a symbol.
    async fn cancel_outstanding(&self, symbol: &str) {
        let records = match self.store.list_for_symbol(symbol) {
            Ok(records) => records,
            Err(err) => {
                error!(symbol, error = %err, "could not list orders for cancellation");
                return;
            }
        };
        for record in records {
            if record.is_terminal() {
                continue;
            }
            let Some(venue_id) = record.venue_order_id.as_deref() else {
                continue;
            };
            match self.exchange.cancel(venue_id).await {
                Ok(outcome) => {
                    debug!(symbol, venue_id, ?outcome, "cancelled outstanding order")
                }
                Err(err) => warn!(symbol, venue_id, error = %err, "cancel failed"),
            }
        }
    }

    /// Launch the periodic loop. The handle stops with the runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => {
                        info!(
                            checked = report.checked,
                            mismatched = report.mismatched.len(),
                            "reconciliation cycle complete"
                        );
                    }
                    Err(err) => {
                        error!(error = %err, "reconciliation cycle failed");
                        if let Err(trip_err) = self.breaker.trip("reconciliation cycle error") {
                            error!(error = %trip_err, "failed to trip breaker");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_bus::EventBusConfig;
    use bulwark_core::{Money, Side};
    use bulwark_paper::{MockExchange, MockExchangeConfig};
    use crate::{BreakerConfig, BreakerState};

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    async fn setup() -> (
        Arc<MockExchange>,
        Arc<PositionBook>,
        Arc<CircuitBreaker>,
        PositionReconciler,
        Arc<EventBus>,
    ) {
        let exchange = Arc::new(
            MockExchange::new(MockExchangeConfig::btc_usdt(Money::from_units(
                1_000_000, "USDT",
            )))
            .await,
        );
        exchange.set_price("BTC/USDT", dec("50000")).await;
        let positions = Arc::new(PositionBook::new());
        let breaker = Arc::new(CircuitBreaker::load(BreakerConfig::default()).unwrap());
        let bus = EventBus::new(EventBusConfig::default(), None);
        let store = Arc::new(OrderStore::open_in_memory().unwrap());
        let reconciler = PositionReconciler::new(
            Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
            Arc::clone(&positions),
            store,
            Arc::clone(&breaker),
            Arc::clone(&bus),
            ReconcilerConfig::default(),
        );
        (exchange, positions, breaker, reconciler, bus)
    }

    #[tokio::test]
    async fn drift_within_tolerance_adopts_venue_quantity() {
        let (exchange, positions, breaker, reconciler, _bus) = setup().await;
        positions.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        exchange.set_position("BTC/USDT", dec("0.1005"));

        let report = reconciler.run_once().await.unwrap();
        assert!(report.passed());
        assert_eq!(positions.get("BTC/USDT").unwrap().quantity, dec("0.1005"));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn drift_beyond_tolerance_trips_the_breaker() {
        let (exchange, positions, breaker, reconciler, bus) = setup().await;
        let mut mismatches = bus.subscribe("risk:position_mismatch").await;
        bus.start();
        positions.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        exchange.set_position("BTC/USDT", dec("0.15"));

        let report = reconciler.run_once().await.unwrap();
        assert!(!report.passed());
        assert_eq!(breaker.state(), BreakerState::Open);
        let event = mismatches.recv().await.unwrap();
        assert_eq!(event.topic, "risk:position_mismatch");
        assert!(event.critical);
    }

    #[tokio::test]
    async fn three_failing_cycles_force_open_via_fail_limit() {
        let (exchange, positions, breaker, reconciler, _bus) = setup().await;
        positions.apply_fill("BTC/USDT", Side::Buy, dec("1"), dec("50000"));
        exchange.set_position("BTC/USDT", dec("2"));

        for _ in 0..3 {
            reconciler.run_once().await.unwrap();
        }
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.consecutive_reconcile_failures, 3);
    }

    #[tokio::test]
    async fn passing_cycle_resets_the_failure_streak() {
        let (exchange, positions, breaker, reconciler, _bus) = setup().await;
        positions.apply_fill("BTC/USDT", Side::Buy, dec("1"), dec("50000"));
        exchange.set_position("BTC/USDT", dec("2"));
        reconciler.run_once().await.unwrap();
        assert_eq!(breaker.snapshot().consecutive_reconcile_failures, 1);

        exchange.set_position("BTC/USDT", dec("1"));
        // The breaker is already tripped; the cycle itself still passes
        // and clears the streak.
        let report = reconciler.run_once().await.unwrap();
        assert!(report.passed());
        assert_eq!(breaker.snapshot().consecutive_reconcile_failures, 0);
    }
}
