//! The transactional submission pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_account::{AccountError, BalanceManager, PositionBook, SymbolGuard, SymbolLocker};
use bulwark_bus::EventBus;
use bulwark_core::{
    ClientOrderId, Currency, Instrument, Money, OrderRecord, OrderRequest, OrderStatus,
    OrderTransition, OrderType, Price, Quantity, RoundingPolicy, Side, Symbol,
};
use bulwark_exchange::{
    ExchangeClient, ExchangeError, OrderLookup, OrderSnapshot, RejectReason, SubmitOutcome,
    Validation,
};
use bulwark_journal::OrderStore;
use bulwark_risk::{BreakerState, CircuitBreaker, Verdict};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{GatewayError, GatewayResult};

/// Gateway tuning. Every suspension point carries one of these deadlines.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub reporting_currency: Currency,
    /// Fee estimate reserved on top of notional (0.001 = 0.1%). Must
    /// cover the venue's taker fee.
    pub fee_buffer_rate: Decimal,
    pub symbol_lock_timeout: Duration,
    pub submit_timeout: Duration,
    pub fetch_poll_interval: Duration,
    pub fetch_poll_deadline: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reporting_currency: "USDT".into(),
            fee_buffer_rate: Decimal::new(1, 3),
            symbol_lock_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(30),
            fetch_poll_interval: Duration::from_millis(100),
            fetch_poll_deadline: Duration::from_secs(30),
        }
    }
}

/// An agent's request to trade. The nonce makes retries idempotent: the
/// same inputs always derive the same client order id.
#[derive(Clone, Debug)]
pub struct SubmitIntent {
    pub agent_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Quantity,
    pub price: Option<Price>,
    pub nonce: u64,
}

impl SubmitIntent {
    /// Deterministic client order id from the intent's identity fields.
    #[must_use]
    pub fn client_order_id(&self) -> ClientOrderId {
        let mut hasher = Sha256::new();
        hasher.update(self.agent_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(match self.side {
            Side::Buy => b"buy".as_slice(),
            Side::Sell => b"sell".as_slice(),
        });
        hasher.update(b"|");
        hasher.update(self.amount.normalize().to_string().as_bytes());
        hasher.update(b"|");
        if let Some(price) = self.price {
            hasher.update(price.normalize().to_string().as_bytes());
        }
        hasher.update(b"|");
        hasher.update(match self.order_type {
            OrderType::Market => b"market".as_slice(),
            OrderType::Limit => b"limit".as_slice(),
        });
        hasher.update(b"|");
        hasher.update(self.nonce.to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest
            .iter()
            .take(12)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("blw-{hex}")
    }
}

/// The chokepoint. Composed once at startup; shared by reference.
pub struct OrderGateway {
    exchange: Arc<dyn ExchangeClient>,
    breaker: Arc<CircuitBreaker>,
    locker: Arc<SymbolLocker>,
    balances: Arc<BalanceManager>,
    positions: Arc<PositionBook>,
    store: Arc<OrderStore>,
    bus: Arc<EventBus>,
    config: GatewayConfig,
    instruments: RwLock<HashMap<Symbol, Instrument>>,
    pending: Mutex<HashMap<Symbol, ClientOrderId>>,
    ready: AtomicBool,
}

impl OrderGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        breaker: Arc<CircuitBreaker>,
        locker: Arc<SymbolLocker>,
        balances: Arc<BalanceManager>,
        positions: Arc<PositionBook>,
        store: Arc<OrderStore>,
        bus: Arc<EventBus>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            exchange,
            breaker,
            locker,
            balances,
            positions,
            store,
            bus,
            config,
            instruments: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// Refresh the instrument table from the venue.
    pub async fn refresh_instruments(&self) -> GatewayResult<()> {
        let instruments = self.exchange.instruments().await?;
        let mut table = self.instruments.write();
        table.clear();
        for instrument in instruments {
            table.insert(instrument.symbol.clone(), instrument);
        }
        Ok(())
    }

    /// Recovery flips this once its sequence has completed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        info!("gateway ready, accepting orders");
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Orders whose venue outcome is still unknown, per symbol.
    #[must_use]
    pub fn pending_verifications(&self) -> HashMap<Symbol, ClientOrderId> {
        self.pending.lock().clone()
    }

    pub(crate) fn note_pending(&self, symbol: &str, client_order_id: &str) {
        self.pending
            .lock()
            .insert(symbol.to_string(), client_order_id.to_string());
    }

    /// Account value in the reporting currency: cash plus marked
    /// positions.
    pub async fn portfolio_value(&self) -> GatewayResult<Decimal> {
        let cash = self.balances.balance(&self.config.reporting_currency).await;
        let mut value = cash.total.amount();
        for position in self.positions.all() {
            if position.quantity.is_zero() {
                continue;
            }
            match self.exchange.reference_price(&position.symbol).await {
                Ok(price) => value += position.quantity * price,
                Err(err) => {
                    warn!(symbol = %position.symbol, error = %err, "no mark price for position")
                }
            }
        }
        Ok(value)
    }

    /// Submit an order through the full safety sequence.
    pub async fn submit(&self, intent: SubmitIntent) -> GatewayResult<OrderRecord> {
        if !self.is_ready() {
            return Err(GatewayError::NotReady);
        }
        let client_order_id = intent.client_order_id();

        // Breaker first, before any state changes.
        let probing = self.breaker.state() == BreakerState::HalfOpen;
        let value = self.portfolio_value().await?;
        match self.breaker.check(value)? {
            Verdict::Allow => {}
            Verdict::Deny(reason) => {
                if reason == bulwark_risk::DenyReason::LossThreshold {
                    self.bus
                        .publish(
                            "risk:circuit_breaker",
                            json!({
                                "state": format!("{:?}", self.breaker.state()),
                                "portfolio_value": value,
                            }),
                            "order_gateway",
                        )
                        .await?;
                }
                debug!(%client_order_id, %reason, "breaker denied order");
                return Err(GatewayError::CircuitBreaker(reason));
            }
        }

        let result = self.submit_inner(&intent, &client_order_id).await;

        if probing {
            match &result {
                Ok(record) if record.status == OrderStatus::Filled => {
                    self.breaker.probe_succeeded()?;
                }
                Ok(record) => {
                    self.breaker
                        .probe_failed(&format!("probe ended {:?}", record.status))?;
                }
                Err(err) => {
                    self.breaker.probe_failed(&err.to_string())?;
                }
            }
        }
        result
    }

    async fn submit_inner(
        &self,
        intent: &SubmitIntent,
        client_order_id: &str,
    ) -> GatewayResult<OrderRecord> {
        // A symbol with an unverified order accepts nothing new.
        if let Some(pending) = self.pending.lock().get(&intent.symbol).cloned() {
            return Err(GatewayError::PendingVerificationOutstanding {
                symbol: intent.symbol.clone(),
                client_order_id: pending,
            });
        }

        let guard = self
            .locker
            .acquire(
                &intent.symbol,
                &intent.agent_id,
                self.config.symbol_lock_timeout,
            )
            .await
            .map_err(|err| match err {
                AccountError::SymbolBusy { symbol, .. } => GatewayError::SymbolBusy(symbol),
                other => GatewayError::Account(other),
            })?;

        let request = OrderRequest {
            client_order_id: client_order_id.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            amount: intent.amount,
            price: intent.price,
        };

        match self.exchange.validate(&request).await? {
            Validation::Ok => {}
            Validation::Reject(reason) => {
                self.record_rejection(intent, client_order_id, format!("validation: {reason}"))
                    .await?;
                return Err(GatewayError::Validation(reason));
            }
        }

        // Idempotency: an existing record short-circuits resubmission.
        if let Some(existing) = self.store.get_by_client_id(client_order_id)? {
            if existing.is_terminal() {
                info!(client_order_id, "terminal record exists, returning it unchanged");
                return Ok(existing);
            }
            info!(client_order_id, "adopting in-flight record");
            return self.poll_to_terminal(existing, guard).await;
        }

        let instrument = self.instrument(&intent.symbol)?;
        let reference = self.exchange.reference_price(&intent.symbol).await?;
        let reservation = match intent.side {
            Side::Buy => {
                let basis = match (intent.order_type, intent.price) {
                    (OrderType::Limit, Some(limit)) => limit,
                    _ => reference,
                };
                // Notional plus fee buffer rounds up; the surplus comes
                // back on commit.
                let total = Money::rounded(
                    basis * intent.amount * (Decimal::ONE + self.config.fee_buffer_rate),
                    &instrument.quote,
                    RoundingPolicy::Up,
                );
                self.balances.reserve(&total, &intent.agent_id).await
            }
            Side::Sell => {
                let base = Money::rounded(intent.amount, &instrument.base, RoundingPolicy::Up);
                self.balances.reserve(&base, &intent.agent_id).await
            }
        }
        .map_err(|err| match err {
            AccountError::InsufficientFunds { .. } => {
                GatewayError::InsufficientFunds(err.to_string())
            }
            other => GatewayError::Account(other),
        });
        let reservation = match reservation {
            Ok(reservation) => reservation,
            Err(err) => {
                self.record_rejection(intent, client_order_id, err.to_string())
                    .await?;
                return Err(err);
            }
        };

        let mut record = OrderRecord {
            client_order_id: client_order_id.to_string(),
            venue_order_id: None,
            agent_id: intent.agent_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            amount: intent.amount,
            price: intent.price,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            fees_paid: Money::zero(&instrument.quote),
            status: OrderStatus::Reserved,
            reservation_id: Some(reservation.id),
            submitted_at: Utc::now(),
            terminal_at: None,
            transitions: Vec::new(),
        };
        self.persist(&record, None)?;
        self.breaker.register(client_order_id)?;
        self.bus
            .publish(
                "order:submitted",
                json!({
                    "client_order_id": client_order_id,
                    "symbol": record.symbol,
                    "side": record.side,
                    "amount": record.amount,
                    "agent_id": record.agent_id,
                }),
                "order_gateway",
            )
            .await?;

        record.status = OrderStatus::Submitted;
        self.persist(&record, None)?;

        let submitted =
            tokio::time::timeout(self.config.submit_timeout, self.exchange.submit(&request))
                .await;
        match submitted {
            Ok(Ok(SubmitOutcome::Accepted { venue_order_id })) => {
                record.venue_order_id = Some(venue_order_id);
                record.status = OrderStatus::Accepted;
                self.persist(&record, None)?;
                self.poll_to_terminal(record, guard).await
            }
            Ok(Ok(SubmitOutcome::Rejected(reason))) => {
                self.balances.release_by_id(reservation.id).await?;
                record.status = OrderStatus::Rejected;
                record.terminal_at = Some(Utc::now());
                self.persist(&record, Some(format!("venue rejected: {reason}")))?;
                self.breaker.complete(client_order_id)?;
                self.publish_terminal(&record).await?;
                Err(GatewayError::SubmissionRejected(reason))
            }
            Ok(Err(ExchangeError::Timeout(detail))) => {
                self.mark_pending(record, &format!("venue timeout: {detail}"))
                    .await?;
                Err(GatewayError::SubmissionTimeout {
                    client_order_id: client_order_id.to_string(),
                })
            }
            Err(_elapsed) => {
                self.mark_pending(record, "submission deadline elapsed")
                    .await?;
                Err(GatewayError::SubmissionTimeout {
                    client_order_id: client_order_id.to_string(),
                })
            }
            Ok(Err(other)) => {
                self.balances.release_by_id(reservation.id).await?;
                record.status = OrderStatus::Rejected;
                record.terminal_at = Some(Utc::now());
                self.persist(&record, Some(format!("venue error: {other}")))?;
                self.breaker.complete(client_order_id)?;
                self.publish_terminal(&record).await?;
                Err(GatewayError::Exchange(other))
            }
        }
    }

    /// Poll the venue with bounded backoff until the order is terminal or
    /// the deadline elapses.
    async fn poll_to_terminal(
        &self,
        mut record: OrderRecord,
        guard: SymbolGuard,
    ) -> GatewayResult<OrderRecord> {
        let deadline = Instant::now() + self.config.fetch_poll_deadline;
        let mut interval = self.config.fetch_poll_interval;
        let lookup = match &record.venue_order_id {
            Some(venue_id) => OrderLookup::Venue(venue_id.clone()),
            None => OrderLookup::Client(record.client_order_id.clone()),
        };
        loop {
            let snapshot = self.exchange.fetch(&lookup).await?;
            if snapshot.status.is_terminal() {
                self.settle(&mut record, &snapshot).await?;
                drop(guard);
                return Ok(record);
            }
            if snapshot.status == OrderStatus::PartiallyFilled
                && record.status != OrderStatus::PartiallyFilled
            {
                record.status = OrderStatus::PartiallyFilled;
                record.filled = snapshot.filled;
                self.persist(&record, None)?;
            }
            if Instant::now() >= deadline {
                let client_order_id = record.client_order_id.clone();
                self.mark_pending(record, "fill deadline elapsed")
                    .await?;
                return Err(GatewayError::SubmissionTimeout { client_order_id });
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(Duration::from_secs(2));
        }
    }

    /// Apply a terminal venue snapshot: positions, balances, audit record,
    /// breaker bookkeeping and the terminal event. Also used by startup
    /// recovery, so every step tolerates having already happened.
    pub(crate) async fn settle(
        &self,
        record: &mut OrderRecord,
        snapshot: &OrderSnapshot,
    ) -> GatewayResult<()> {
        let instrument = self.instrument(&record.symbol)?;
        record.venue_order_id = Some(snapshot.venue_order_id.clone());
        record.filled = snapshot.filled;
        record.avg_fill_price = snapshot.avg_fill_price;
        record.fees_paid =
            Money::rounded(snapshot.fees_paid, &instrument.quote, RoundingPolicy::Up);
        record.status = snapshot.status;
        record.terminal_at = Some(Utc::now());

        if snapshot.status == OrderStatus::Filled && !snapshot.filled.is_zero() {
            let fill_price = snapshot.avg_fill_price.unwrap_or(Decimal::ZERO);
            self.positions
                .apply_fill(&record.symbol, record.side, snapshot.filled, fill_price);

            // Spend legs round up, receive legs round down: the ledger
            // never understates a cost or overstates a receipt.
            let notional = fill_price * snapshot.filled;
            let (spend, receive) = match record.side {
                Side::Buy => (
                    Money::rounded(
                        notional + snapshot.fees_paid,
                        &instrument.quote,
                        RoundingPolicy::Up,
                    ),
                    Money::rounded(snapshot.filled, &instrument.base, RoundingPolicy::Down),
                ),
                Side::Sell => (
                    Money::rounded(snapshot.filled, &instrument.base, RoundingPolicy::Up),
                    Money::rounded(
                        notional - snapshot.fees_paid,
                        &instrument.quote,
                        RoundingPolicy::Down,
                    ),
                ),
            };

            let live_reservation = match record.reservation_id {
                Some(id) => self.balances.reservation(id).await.map(|found| (id, found)),
                None => None,
            };
            match live_reservation {
                Some((id, reservation)) => {
                    let mut used = spend;
                    if used.amount() > reservation.amount.amount() {
                        warn!(
                            client_order_id = %record.client_order_id,
                            used = %used.amount(),
                            reserved = %reservation.amount.amount(),
                            "fill cost exceeds reservation, committing the full reservation"
                        );
                        used = reservation.amount.clone();
                    }
                    self.balances.commit_by_id(id, &used).await?;
                }
                None => {
                    // The reservation did not survive a restart; settle the
                    // spend leg directly.
                    if let Err(err) = self.balances.debit(&spend, "recovered fill").await {
                        warn!(
                            client_order_id = %record.client_order_id,
                            error = %err,
                            "could not debit recovered fill"
                        );
                    }
                }
            }
            self.balances.credit(&receive, "fill receive leg").await?;
        } else if let Some(reservation_id) = record.reservation_id {
            match self.balances.release_by_id(reservation_id).await {
                Ok(()) | Err(AccountError::UnknownReservation(_)) => {}
                Err(other) => return Err(GatewayError::Account(other)),
            }
        }

        self.persist(record, Some(format!("terminal: {:?}", record.status)))?;
        self.breaker.complete(&record.client_order_id)?;
        self.clear_pending(&record.symbol, &record.client_order_id);
        self.publish_terminal(record).await?;
        Ok(())
    }

    async fn mark_pending(&self, mut record: OrderRecord, reason: &str) -> GatewayResult<()> {
        warn!(
            client_order_id = %record.client_order_id,
            symbol = %record.symbol,
            reason,
            "outcome unknown; retaining reservation pending verification"
        );
        record.status = OrderStatus::PendingVerification;
        self.persist(&record, Some(reason.to_string()))?;
        self.note_pending(&record.symbol, &record.client_order_id);
        self.bus
            .publish(
                "risk:alert",
                json!({
                    "kind": "submission_timeout",
                    "client_order_id": record.client_order_id,
                    "symbol": record.symbol,
                    "reason": reason,
                }),
                "order_gateway",
            )
            .await?;
        Ok(())
    }

    async fn record_rejection(
        &self,
        intent: &SubmitIntent,
        client_order_id: &str,
        note: String,
    ) -> GatewayResult<()> {
        let quote = self
            .instrument(&intent.symbol)
            .map(|instrument| instrument.quote)
            .unwrap_or_else(|_| self.config.reporting_currency.clone());
        let record = OrderRecord {
            client_order_id: client_order_id.to_string(),
            venue_order_id: None,
            agent_id: intent.agent_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            amount: intent.amount,
            price: intent.price,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            fees_paid: Money::zero(&quote),
            status: OrderStatus::Rejected,
            reservation_id: None,
            submitted_at: Utc::now(),
            terminal_at: Some(Utc::now()),
            transitions: Vec::new(),
        };
        self.persist(&record, Some(note.clone()))?;
        self.bus
            .publish(
                "order:rejected",
                json!({
                    "client_order_id": client_order_id,
                    "symbol": intent.symbol,
                    "reason": note,
                }),
                "order_gateway",
            )
            .await?;
        Ok(())
    }

    fn persist(&self, record: &OrderRecord, note: Option<String>) -> GatewayResult<()> {
        self.store.put(record)?;
        let transition = match note {
            Some(note) => OrderTransition::with_note(record.status, note),
            None => OrderTransition::new(record.status),
        };
        self.store
            .append_transition(&record.client_order_id, &transition)?;
        Ok(())
    }

    async fn publish_terminal(&self, record: &OrderRecord) -> GatewayResult<()> {
        self.bus
            .publish(
                "order:terminal",
                json!({
                    "client_order_id": record.client_order_id,
                    "venue_order_id": record.venue_order_id,
                    "symbol": record.symbol,
                    "status": record.status,
                    "filled": record.filled,
                    "avg_fill_price": record.avg_fill_price,
                }),
                "order_gateway",
            )
            .await?;
        Ok(())
    }

    pub(crate) fn clear_pending(&self, symbol: &str, client_order_id: &str) {
        let mut pending = self.pending.lock();
        if pending.get(symbol).map(String::as_str) == Some(client_order_id) {
            pending.remove(symbol);
        }
    }

    pub(crate) fn instrument(&self, symbol: &str) -> GatewayResult<Instrument> {
        self.instruments
            .read()
            .get(symbol)
            .cloned()
            .ok_or(GatewayError::Validation(RejectReason::UnknownSymbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(nonce: u64) -> SubmitIntent {
        SubmitIntent {
            agent_id: "agent-a".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: Decimal::new(1, 1),
            price: None,
            nonce,
        }
    }

    #[test]
    fn client_order_id_is_deterministic() {
        assert_eq!(intent(42).client_order_id(), intent(42).client_order_id());
        assert_ne!(intent(42).client_order_id(), intent(43).client_order_id());
        let mut other = intent(42);
        other.amount = Decimal::new(2, 1);
        assert_ne!(intent(42).client_order_id(), other.client_order_id());
    }

    #[test]
    fn client_order_id_normalizes_trailing_zeroes() {
        let mut a = intent(7);
        a.amount = "0.10".parse().unwrap();
        let mut b = intent(7);
        b.amount = "0.1".parse().unwrap();
        assert_eq!(a.client_order_id(), b.client_order_id());
    }
}
