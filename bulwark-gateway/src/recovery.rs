//! Startup recovery: rebuild in-flight state before trading resumes.
//!
//! The sequence is ordered and blocking. Until every step has run, the
//! gateway refuses submissions.

use std::collections::HashSet;
use std::sync::Arc;

use bulwark_account::{AccountError, BalanceManager};
use bulwark_bus::EventBus;
use bulwark_core::{OrderStatus, OrderTransition};
use bulwark_exchange::{ExchangeClient, ExchangeError, OrderLookup};
use bulwark_journal::OrderStore;
use bulwark_risk::{BreakerState, CircuitBreaker, PositionReconciler};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{GatewayError, GatewayResult, OrderGateway};

/// What recovery found and did.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub in_flight_found: usize,
    pub resolved: usize,
    pub still_open: usize,
    pub expired: usize,
    pub orphans_released: usize,
    pub reconcile_passed: bool,
}

/// Runs the recovery sequence against an assembled system.
pub struct StartupRecovery {
    gateway: Arc<OrderGateway>,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<OrderStore>,
    balances: Arc<BalanceManager>,
    breaker: Arc<CircuitBreaker>,
    reconciler: Arc<PositionReconciler>,
    bus: Arc<EventBus>,
}

impl StartupRecovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<OrderGateway>,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<OrderStore>,
        balances: Arc<BalanceManager>,
        breaker: Arc<CircuitBreaker>,
        reconciler: Arc<PositionReconciler>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            gateway,
            exchange,
            store,
            balances,
            breaker,
            reconciler,
            bus,
        }
    }

    /// Run the full sequence. Only on success is the gateway marked
    /// ready; any error leaves trading refused.
    pub async fn run(&self) -> GatewayResult<RecoveryReport> {
        info!("startup recovery: begin");
        let mut report = RecoveryReport::default();

        // 1. Breaker state was loaded when the breaker was constructed; a
        //    tripped breaker stays tripped until an operator resets it.
        if self.breaker.state() == BreakerState::Open {
            warn!("breaker is OPEN; trading stays halted until manual reset");
        }

        // 2 & 3. Resolve every non-terminal order against the venue.
        let in_flight = self.store.list_in_flight()?;
        report.in_flight_found = in_flight.len();
        for mut record in in_flight {
            let lookup = match &record.venue_order_id {
                Some(venue_id) => OrderLookup::Venue(venue_id.clone()),
                None => OrderLookup::Client(record.client_order_id.clone()),
            };
            match self.exchange.fetch(&lookup).await {
                Ok(snapshot) if snapshot.status.is_terminal() => {
                    info!(
                        client_order_id = %record.client_order_id,
                        status = ?snapshot.status,
                        "recovered terminal outcome from venue"
                    );
                    self.gateway.settle(&mut record, &snapshot).await?;
                    report.resolved += 1;
                }
                Ok(snapshot) => {
                    info!(
                        client_order_id = %record.client_order_id,
                        status = ?snapshot.status,
                        "order still open on venue; blocking its symbol"
                    );
                    record.venue_order_id = Some(snapshot.venue_order_id.clone());
                    record.status = snapshot.status;
                    self.store.put(&record)?;
                    self.breaker.register(&record.client_order_id)?;
                    self.gateway
                        .note_pending(&record.symbol, &record.client_order_id);
                    report.still_open += 1;
                }
                Err(ExchangeError::UnknownOrder(_)) => {
                    warn!(
                        client_order_id = %record.client_order_id,
                        "order never reached the venue; expiring it"
                    );
                    self.expire(&mut record).await?;
                    report.expired += 1;
                }
                Err(err) => {
                    error!(
                        client_order_id = %record.client_order_id,
                        error = %err,
                        "could not verify order with venue; refusing to start"
                    );
                    return Err(GatewayError::Exchange(err));
                }
            }
        }

        // 4. One reconciliation cycle; a failure trips the breaker.
        report.reconcile_passed = match self.reconciler.run_once().await {
            Ok(cycle) => cycle.passed(),
            Err(err) => {
                error!(error = %err, "startup reconciliation errored");
                self.breaker.trip("startup reconciliation error")?;
                false
            }
        };

        // 5. Reservations no longer referenced by a live order are
        //    orphans; refund them.
        let keep: HashSet<_> = self
            .store
            .list_in_flight()?
            .iter()
            .filter_map(|record| record.reservation_id)
            .collect();
        report.orphans_released = self.balances.release_orphans(&keep).await?.len();

        // 6. Trading may begin.
        self.gateway.mark_ready();
        self.bus
            .publish(
                "recovery:complete",
                json!({
                    "in_flight_found": report.in_flight_found,
                    "resolved": report.resolved,
                    "still_open": report.still_open,
                    "expired": report.expired,
                    "orphans_released": report.orphans_released,
                    "reconcile_passed": report.reconcile_passed,
                }),
                "startup_recovery",
            )
            .await?;
        info!(?report, "startup recovery: complete");
        Ok(report)
    }

    /// An order the venue has never heard of cannot fill; close it out
    /// and refund its reservation.
    async fn expire(&self, record: &mut bulwark_core::OrderRecord) -> GatewayResult<()> {
        if let Some(reservation_id) = record.reservation_id {
            match self.balances.release_by_id(reservation_id).await {
                Ok(()) | Err(AccountError::UnknownReservation(_)) => {}
                Err(other) => return Err(GatewayError::Account(other)),
            }
        }
        record.status = OrderStatus::Expired;
        record.terminal_at = Some(Utc::now());
        self.store.put(record)?;
        self.store.append_transition(
            &record.client_order_id,
            &OrderTransition::with_note(OrderStatus::Expired, "not found on venue during recovery"),
        )?;
        self.breaker.complete(&record.client_order_id)?;
        self.bus
            .publish(
                "order:terminal",
                json!({
                    "client_order_id": record.client_order_id,
                    "symbol": record.symbol,
                    "status": record.status,
                }),
                "startup_recovery",
            )
            .await?;
        Ok(())
    }
}
