//! Deterministic in-memory venue.
//!
//! The mock exchange is the reference implementation of the exchange
//! contract: it enforces the same validation rules as a real venue,
//! honours client-order-id idempotency identically, and keeps its own
//! balance ledger and position book for the venue side of every trade.
//! Given the same price tape and submission sequence it produces
//! identical outputs; there is no randomness anywhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bulwark_account::{AccountError, BalanceManager, PositionBook};
use bulwark_core::{
    BalanceSnapshot, ClientOrderId, Instrument, Money, OrderRequest, OrderStatus, OrderType,
    PositionSnapshot, Price, Quantity, Reservation, RoundingPolicy, Side, Symbol, VenueOrderId,
};
use bulwark_exchange::{
    CancelOutcome, ExchangeClient, ExchangeError, ExchangeResult, OrderLookup, OrderSnapshot,
    RejectReason, SubmitOutcome, Validation, VenueInfo,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Static venue parameters.
#[derive(Clone, Debug)]
pub struct MockExchangeConfig {
    pub name: String,
    /// Quote funds credited to the venue-side account at startup.
    pub starting_balance: Money,
    /// Taker fee applied to executed notional (0.001 = 0.1%).
    pub fee_rate: Decimal,
    /// Symmetric slippage applied to market fills, in basis points.
    pub slippage_bps: Decimal,
    /// Limit prices further than this fraction from the reference price
    /// are rejected as out of band.
    pub price_band: Decimal,
    pub instruments: Vec<Instrument>,
}

impl MockExchangeConfig {
    /// Single-market BTC/USDT venue with the given starting balance.
    #[must_use]
    pub fn btc_usdt(starting_balance: Money) -> Self {
        Self {
            name: "mock".into(),
            starting_balance,
            fee_rate: Decimal::new(1, 3),
            slippage_bps: Decimal::ZERO,
            price_band: Decimal::new(5, 1),
            instruments: vec![Instrument {
                symbol: "BTC/USDT".into(),
                base: "BTC".into(),
                quote: "USDT".into(),
                tick_size: Decimal::new(1, 2),
                lot_size: Decimal::new(1, 8),
                min_notional: Decimal::from(10),
            }],
        }
    }
}

struct RestingOrder {
    snapshot: OrderSnapshot,
    request: OrderRequest,
    limit_price: Price,
    reservation: Option<Reservation>,
}

/// The venue. Shared by reference between the gateway and the reconciler.
pub struct MockExchange {
    config: MockExchangeConfig,
    balances: BalanceManager,
    positions: PositionBook,
    prices: Mutex<HashMap<Symbol, Price>>,
    orders: AsyncMutex<HashMap<VenueOrderId, OrderSnapshot>>,
    outcomes: AsyncMutex<HashMap<ClientOrderId, SubmitOutcome>>,
    resting: AsyncMutex<Vec<RestingOrder>>,
    counter: AtomicU64,
    submit_delay: Mutex<Option<Duration>>,
}

impl MockExchange {
    /// Build a venue and fund its quote ledger.
    pub async fn new(config: MockExchangeConfig) -> Self {
        let balances = BalanceManager::new(None);
        balances
            .credit(&config.starting_balance, "venue seed")
            .await
            .expect("seeding a fresh ledger cannot fail");
        let exchange = Self {
            config,
            balances,
            positions: PositionBook::new(),
            prices: Mutex::new(HashMap::new()),
            orders: AsyncMutex::new(HashMap::new()),
            outcomes: AsyncMutex::new(HashMap::new()),
            resting: AsyncMutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            submit_delay: Mutex::new(None),
        };
        info!(
            venue = %exchange.config.name,
            balance = %exchange.config.starting_balance,
            "mock exchange initialized"
        );
        exchange
    }

    /// Update the reference price and cross any resting limit orders.
    pub async fn set_price(&self, symbol: &str, price: Price) {
        self.prices.lock().insert(symbol.to_string(), price);
        self.cross_resting(symbol, price).await;
    }

    /// Inject a delay before every submission answer; used to reproduce
    /// submission-timeout scenarios.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        *self.submit_delay.lock() = delay;
    }

    /// Force the venue-side position for a symbol; used to reproduce
    /// reconciliation drift.
    pub fn set_position(&self, symbol: &str, quantity: Quantity) {
        self.positions.set_quantity(symbol, quantity);
    }

    fn instrument(&self, symbol: &str) -> Option<&Instrument> {
        self.config
            .instruments
            .iter()
            .find(|instrument| instrument.symbol == symbol)
    }

    fn price_of(&self, symbol: &str) -> Option<Price> {
        self.prices.lock().get(symbol).copied()
    }

    fn next_venue_id(&self) -> VenueOrderId {
        format!("PX-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Slippage-adjusted execution price, aligned to the instrument tick
    /// the way a venue quotes computed fill prices.
    fn execution_price(&self, side: Side, reference: Price, instrument: &Instrument) -> Price {
        let rate = self.config.slippage_bps / Decimal::from(10_000);
        let raw = match side {
            Side::Buy => reference * (Decimal::ONE + rate),
            Side::Sell => reference * (Decimal::ONE - rate),
        };
        Money::rounded(raw, &instrument.quote, RoundingPolicy::NearestEven)
            .round_to_tick(instrument.tick_size, RoundingPolicy::NearestEven)
            .map(|aligned| aligned.amount())
            .unwrap_or(raw)
    }

    fn check(&self, request: &OrderRequest) -> Validation {
        let Some(instrument) = self.instrument(&request.symbol) else {
            return Validation::Reject(RejectReason::UnknownSymbol);
        };
        if request.amount <= Decimal::ZERO || request.amount < instrument.lot_size {
            return Validation::Reject(RejectReason::AmountBelowMinimum);
        }
        if !aligned(request.amount, &instrument.base, instrument.lot_size) {
            return Validation::Reject(RejectReason::AmountNotOnLot);
        }
        let reference = match self.price_of(&request.symbol) {
            Some(price) => price,
            None => return Validation::Reject(RejectReason::UnknownSymbol),
        };
        let effective = match (request.order_type, request.price) {
            (OrderType::Limit, Some(limit)) => {
                if !aligned(limit, &instrument.quote, instrument.tick_size) {
                    return Validation::Reject(RejectReason::PriceNotOnTick);
                }
                let band = reference * self.config.price_band;
                if (limit - reference).abs() > band {
                    return Validation::Reject(RejectReason::PriceOutOfBand);
                }
                limit
            }
            (OrderType::Limit, None) => {
                return Validation::Reject(RejectReason::Other("limit order without price".into()))
            }
            (OrderType::Market, _) => reference,
        };
        if effective * request.amount < instrument.min_notional {
            return Validation::Reject(RejectReason::NotionalBelowMinimum);
        }
        Validation::Ok
    }

    /// Execute a fill against the venue ledger and position book.
    async fn execute(
        &self,
        request: &OrderRequest,
        fill_price: Price,
        reservation: Option<Reservation>,
    ) -> Result<OrderSnapshot, RejectReason> {
        let instrument = self
            .instrument(&request.symbol)
            .ok_or(RejectReason::UnknownSymbol)?;
        let notional = fill_price * request.amount;
        let fee = notional * self.config.fee_rate;
        let quote = instrument.quote.clone();

        match request.side {
            Side::Buy => {
                // The venue never undercharges: costs round up.
                let total = Money::rounded(notional + fee, &quote, RoundingPolicy::Up);
                let reservation = match reservation {
                    Some(reservation) => reservation,
                    None => self
                        .balances
                        .reserve(&total, &request.client_order_id)
                        .await
                        .map_err(|err| match err {
                            AccountError::InsufficientFunds { .. } => {
                                RejectReason::InsufficientVenueBalance
                            }
                            other => RejectReason::Other(other.to_string()),
                        })?,
                };
                self.balances
                    .commit(reservation, &total)
                    .await
                    .map_err(|err| RejectReason::Other(err.to_string()))?;
            }
            Side::Sell => {
                let held = self
                    .positions
                    .get(&request.symbol)
                    .map(|position| position.quantity)
                    .unwrap_or(Decimal::ZERO);
                if held < request.amount {
                    if let Some(reservation) = reservation {
                        let _ = self.balances.release(reservation).await;
                    }
                    return Err(RejectReason::InsufficientPosition);
                }
                let proceeds = Money::rounded(notional - fee, &quote, RoundingPolicy::Down);
                self.balances
                    .credit(&proceeds, "sell proceeds")
                    .await
                    .map_err(|err| RejectReason::Other(err.to_string()))?;
            }
        }

        self.positions
            .apply_fill(&request.symbol, request.side, request.amount, fill_price);

        let snapshot = OrderSnapshot {
            venue_order_id: self.next_venue_id(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            status: OrderStatus::Filled,
            filled: request.amount,
            avg_fill_price: Some(fill_price),
            fees_paid: fee,
            updated_at: Utc::now(),
        };
        debug!(
            venue_id = %snapshot.venue_order_id,
            symbol = %request.symbol,
            side = ?request.side,
            price = %fill_price,
            fee = %fee,
            "mock order filled"
        );
        Ok(snapshot)
    }

    async fn cross_resting(&self, symbol: &str, price: Price) {
        let crossed: Vec<RestingOrder> = {
            let mut resting = self.resting.lock().await;
            let mut keep = Vec::new();
            let mut hit = Vec::new();
            for order in resting.drain(..) {
                let crossing = order.request.symbol == symbol
                    && match order.request.side {
                        Side::Buy => price <= order.limit_price,
                        Side::Sell => price >= order.limit_price,
                    };
                if crossing {
                    hit.push(order);
                } else {
                    keep.push(order);
                }
            }
            *resting = keep;
            hit
        };
        for order in crossed {
            let venue_id = order.snapshot.venue_order_id.clone();
            match self
                .execute(&order.request, order.limit_price, order.reservation)
                .await
            {
                Ok(mut filled) => {
                    filled.venue_order_id = venue_id.clone();
                    self.orders.lock().await.insert(venue_id, filled);
                }
                Err(reason) => {
                    let mut snapshot = order.snapshot;
                    snapshot.status = OrderStatus::Rejected;
                    snapshot.updated_at = Utc::now();
                    debug!(venue_id = %snapshot.venue_order_id, %reason, "resting order rejected on cross");
                    self.orders
                        .lock()
                        .await
                        .insert(snapshot.venue_order_id.clone(), snapshot);
                }
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn info(&self) -> VenueInfo {
        VenueInfo {
            name: self.config.name.clone(),
            markets: self
                .config
                .instruments
                .iter()
                .map(|instrument| instrument.symbol.clone())
                .collect(),
            paper: true,
        }
    }

    async fn validate(&self, request: &OrderRequest) -> ExchangeResult<Validation> {
        Ok(self.check(request))
    }

    async fn submit(&self, request: &OrderRequest) -> ExchangeResult<SubmitOutcome> {
        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Idempotency: a replayed client id returns the earlier outcome.
        if let Some(existing) = self.outcomes.lock().await.get(&request.client_order_id) {
            debug!(
                client_id = %request.client_order_id,
                "duplicate submission, returning recorded outcome"
            );
            return Ok(existing.clone());
        }

        if let Validation::Reject(reason) = self.check(request) {
            let outcome = SubmitOutcome::Rejected(reason);
            self.outcomes
                .lock()
                .await
                .insert(request.client_order_id.clone(), outcome.clone());
            return Ok(outcome);
        }

        let reference = self
            .price_of(&request.symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(request.symbol.clone()))?;
        let instrument = self
            .instrument(&request.symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(request.symbol.clone()))?
            .clone();

        let outcome = match request.order_type {
            OrderType::Market => {
                let price = self.execution_price(request.side, reference, &instrument);
                match self.execute(request, price, None).await {
                    Ok(snapshot) => {
                        let venue_id = snapshot.venue_order_id.clone();
                        self.orders.lock().await.insert(venue_id.clone(), snapshot);
                        SubmitOutcome::Accepted {
                            venue_order_id: venue_id,
                        }
                    }
                    Err(reason) => SubmitOutcome::Rejected(reason),
                }
            }
            OrderType::Limit => {
                let limit = request.price.expect("validated limit order carries a price");
                let crossing = match request.side {
                    Side::Buy => reference <= limit,
                    Side::Sell => reference >= limit,
                };
                if crossing {
                    match self.execute(request, limit, None).await {
                        Ok(snapshot) => {
                            let venue_id = snapshot.venue_order_id.clone();
                            self.orders.lock().await.insert(venue_id.clone(), snapshot);
                            SubmitOutcome::Accepted {
                                venue_order_id: venue_id,
                            }
                        }
                        Err(reason) => SubmitOutcome::Rejected(reason),
                    }
                } else {
                    // Rest on the synthetic book; buys earmark venue funds.
                    let reservation = if request.side == Side::Buy {
                        let notional = limit * request.amount;
                        let total = Money::rounded(
                            notional * (Decimal::ONE + self.config.fee_rate),
                            &instrument.quote,
                            RoundingPolicy::Up,
                        );
                        match self.balances.reserve(&total, &request.client_order_id).await {
                            Ok(reservation) => Some(reservation),
                            Err(AccountError::InsufficientFunds { .. }) => {
                                let outcome =
                                    SubmitOutcome::Rejected(RejectReason::InsufficientVenueBalance);
                                self.outcomes
                                    .lock()
                                    .await
                                    .insert(request.client_order_id.clone(), outcome.clone());
                                return Ok(outcome);
                            }
                            Err(other) => return Err(ExchangeError::Venue(other.to_string())),
                        }
                    } else {
                        None
                    };
                    let snapshot = OrderSnapshot {
                        venue_order_id: self.next_venue_id(),
                        client_order_id: request.client_order_id.clone(),
                        symbol: request.symbol.clone(),
                        status: OrderStatus::Accepted,
                        filled: Decimal::ZERO,
                        avg_fill_price: None,
                        fees_paid: Decimal::ZERO,
                        updated_at: Utc::now(),
                    };
                    let venue_id = snapshot.venue_order_id.clone();
                    self.orders
                        .lock()
                        .await
                        .insert(venue_id.clone(), snapshot.clone());
                    self.resting.lock().await.push(RestingOrder {
                        snapshot,
                        request: request.clone(),
                        limit_price: limit,
                        reservation,
                    });
                    SubmitOutcome::Accepted {
                        venue_order_id: venue_id,
                    }
                }
            }
        };

        self.outcomes
            .lock()
            .await
            .insert(request.client_order_id.clone(), outcome.clone());
        Ok(outcome)
    }

    async fn fetch(&self, lookup: &OrderLookup) -> ExchangeResult<OrderSnapshot> {
        let orders = self.orders.lock().await;
        let snapshot = match lookup {
            OrderLookup::Venue(venue_id) => orders.get(venue_id),
            OrderLookup::Client(client_id) => orders
                .values()
                .find(|snapshot| &snapshot.client_order_id == client_id),
        };
        snapshot.cloned().ok_or_else(|| {
            ExchangeError::UnknownOrder(match lookup {
                OrderLookup::Venue(id) | OrderLookup::Client(id) => id.clone(),
            })
        })
    }

    async fn cancel(&self, venue_order_id: &str) -> ExchangeResult<CancelOutcome> {
        let resting = {
            let mut resting = self.resting.lock().await;
            let idx = resting
                .iter()
                .position(|order| order.snapshot.venue_order_id == venue_order_id);
            idx.map(|idx| resting.remove(idx))
        };
        match resting {
            Some(order) => {
                if let Some(reservation) = order.reservation {
                    let _ = self.balances.release(reservation).await;
                }
                let mut orders = self.orders.lock().await;
                if let Some(snapshot) = orders.get_mut(venue_order_id) {
                    snapshot.status = OrderStatus::Cancelled;
                    snapshot.updated_at = Utc::now();
                }
                Ok(CancelOutcome::Accepted)
            }
            None => {
                let orders = self.orders.lock().await;
                match orders.get(venue_order_id) {
                    Some(snapshot) => Ok(CancelOutcome::Rejected(format!(
                        "order is {:?}",
                        snapshot.status
                    ))),
                    None => Err(ExchangeError::UnknownOrder(venue_order_id.to_string())),
                }
            }
        }
    }

    async fn fetch_positions(
        &self,
        symbol: Option<&str>,
    ) -> ExchangeResult<Vec<PositionSnapshot>> {
        let positions = self.positions.all();
        Ok(match symbol {
            Some(symbol) => positions
                .into_iter()
                .filter(|position| position.symbol == symbol)
                .collect(),
            None => positions,
        })
    }

    async fn fetch_balances(&self) -> ExchangeResult<Vec<BalanceSnapshot>> {
        Ok(self.balances.snapshot().await)
    }

    async fn reference_price(&self, symbol: &str) -> ExchangeResult<Price> {
        self.price_of(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn instruments(&self) -> ExchangeResult<Vec<Instrument>> {
        Ok(self.config.instruments.clone())
    }
}

/// A value is aligned to a step when rounding it down to that step
/// changes nothing.
fn aligned(value: Decimal, currency: &str, step: Decimal) -> bool {
    Money::rounded(value, currency, RoundingPolicy::Down)
        .round_to_tick(step, RoundingPolicy::Down)
        .map(|rounded| rounded.amount() == value)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    async fn venue() -> MockExchange {
        let exchange =
            MockExchange::new(MockExchangeConfig::btc_usdt(Money::from_units(1_000_000, "USDT")))
                .await;
        exchange.set_price("BTC/USDT", dec("50000")).await;
        exchange
    }

    fn market_buy(client_id: &str, amount: &str) -> OrderRequest {
        OrderRequest {
            client_order_id: client_id.into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: dec(amount),
            price: None,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_at_reference_with_fees() {
        let exchange = venue().await;
        let outcome = exchange.submit(&market_buy("cid-1", "0.1")).await.unwrap();
        let SubmitOutcome::Accepted { venue_order_id } = outcome else {
            panic!("expected acceptance");
        };
        let snapshot = exchange
            .fetch(&OrderLookup::Venue(venue_order_id))
            .await
            .unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.avg_fill_price, Some(dec("50000")));
        assert_eq!(snapshot.fees_paid, dec("5"));

        let positions = exchange.fetch_positions(Some("BTC/USDT")).await.unwrap();
        assert_eq!(positions[0].quantity, dec("0.1"));
    }

    #[tokio::test]
    async fn duplicate_client_id_returns_recorded_outcome() {
        let exchange = venue().await;
        let request = market_buy("cid-dup", "0.1");
        let first = exchange.submit(&request).await.unwrap();
        let second = exchange.submit(&request).await.unwrap();
        assert_eq!(first, second);
        let positions = exchange.fetch_positions(Some("BTC/USDT")).await.unwrap();
        assert_eq!(positions[0].quantity, dec("0.1"));
    }

    #[tokio::test]
    async fn validation_rejects_unknown_symbol_and_small_notional() {
        let exchange = venue().await;
        let mut request = market_buy("cid-v", "0.1");
        request.symbol = "DOGE/USDT".into();
        assert_eq!(
            exchange.validate(&request).await.unwrap(),
            Validation::Reject(RejectReason::UnknownSymbol)
        );

        let request = market_buy("cid-v2", "0.0001");
        assert_eq!(
            exchange.validate(&request).await.unwrap(),
            Validation::Reject(RejectReason::NotionalBelowMinimum)
        );
    }

    #[tokio::test]
    async fn resting_limit_crosses_when_price_reaches_it() {
        let exchange = venue().await;
        let request = OrderRequest {
            client_order_id: "cid-limit".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount: dec("0.1"),
            price: Some(dec("49000")),
        };
        let outcome = exchange.submit(&request).await.unwrap();
        let SubmitOutcome::Accepted { venue_order_id } = outcome else {
            panic!("expected acceptance");
        };
        let snapshot = exchange
            .fetch(&OrderLookup::Venue(venue_order_id.clone()))
            .await
            .unwrap();
        assert_eq!(snapshot.status, OrderStatus::Accepted);

        exchange.set_price("BTC/USDT", dec("48900")).await;
        let snapshot = exchange
            .fetch(&OrderLookup::Venue(venue_order_id))
            .await
            .unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.avg_fill_price, Some(dec("49000")));
    }

    #[tokio::test]
    async fn cancelling_a_resting_order_releases_venue_funds() {
        let exchange = venue().await;
        let before = exchange.fetch_balances().await.unwrap();
        let request = OrderRequest {
            client_order_id: "cid-cancel".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount: dec("0.1"),
            price: Some(dec("40000")),
        };
        let SubmitOutcome::Accepted { venue_order_id } = exchange.submit(&request).await.unwrap()
        else {
            panic!("expected acceptance");
        };
        assert_eq!(
            exchange.cancel(&venue_order_id).await.unwrap(),
            CancelOutcome::Accepted
        );
        let after = exchange.fetch_balances().await.unwrap();
        assert_eq!(before[0].available, after[0].available);
        let snapshot = exchange
            .fetch(&OrderLookup::Venue(venue_order_id))
            .await
            .unwrap();
        assert_eq!(snapshot.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn sell_without_position_is_rejected() {
        let exchange = venue().await;
        let request = OrderRequest {
            client_order_id: "cid-sell".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Sell,
            order_type: OrderType::Market,
            amount: dec("0.1"),
            price: None,
        };
        let outcome = exchange.submit(&request).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(RejectReason::InsufficientPosition)
        );
    }

    #[tokio::test]
    async fn same_tape_produces_identical_outputs() {
        let run = || async {
            let exchange = venue().await;
            exchange.submit(&market_buy("cid-a", "0.1")).await.unwrap();
            exchange.set_price("BTC/USDT", dec("51000")).await;
            exchange.submit(&market_buy("cid-b", "0.2")).await.unwrap();
            let balances = exchange.fetch_balances().await.unwrap();
            let positions = exchange.fetch_positions(None).await.unwrap();
            (
                balances[0].available.amount(),
                positions[0].quantity,
                positions[0].entry_price,
            )
        };
        assert_eq!(run().await, run().await);
    }
}
