//! End-to-end submission scenarios against the deterministic mock venue.

use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{Money, OrderStatus, OrderType, Side};
use bulwark_exchange::ExchangeClient;
use bulwark_gateway::{GatewayError, SubmitIntent, System, SystemSettings};
use bulwark_paper::{MockExchange, MockExchangeConfig};
use bulwark_risk::{BreakerState, DenyReason};
use rust_decimal::Decimal;
use tempfile::TempDir;

fn dec(raw: &str) -> Decimal {
    raw.parse().unwrap()
}

fn usdt(raw: &str) -> Money {
    Money::parse(raw, "USDT").unwrap()
}

fn fast_settings(capital: i64) -> SystemSettings {
    let mut settings = SystemSettings::ephemeral(Money::from_units(capital, "USDT"));
    settings.gateway.submit_timeout = Duration::from_millis(250);
    settings.gateway.fetch_poll_interval = Duration::from_millis(10);
    settings.gateway.fetch_poll_deadline = Duration::from_millis(500);
    settings
}

async fn paper_system(capital: i64) -> (Arc<MockExchange>, System) {
    paper_system_with(fast_settings(capital)).await
}

async fn paper_system_with(settings: SystemSettings) -> (Arc<MockExchange>, System) {
    let exchange = Arc::new(
        MockExchange::new(MockExchangeConfig::btc_usdt(Money::from_units(
            1_000_000, "USDT",
        )))
        .await,
    );
    exchange.set_price("BTC/USDT", dec("50000")).await;
    let system = System::assemble(
        Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
        settings,
    )
    .await
    .unwrap();
    system.recover().await.unwrap();
    (exchange, system)
}

fn market_buy(nonce: u64, amount: &str) -> SubmitIntent {
    SubmitIntent {
        agent_id: "agent-a".into(),
        symbol: "BTC/USDT".into(),
        side: Side::Buy,
        order_type: OrderType::Market,
        amount: dec(amount),
        price: None,
        nonce,
    }
}

#[tokio::test]
async fn happy_path_market_buy_settles_everything() {
    let (_exchange, system) = paper_system(10_000).await;

    let record = system.gateway.submit(market_buy(1, "0.1")).await.unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
    assert_eq!(record.filled, dec("0.1"));
    assert_eq!(record.avg_fill_price, Some(dec("50000")));
    assert_eq!(record.fees_paid, usdt("5"));
    assert!(record.venue_order_id.is_some());

    let cash = system.balances.balance("USDT").await;
    assert_eq!(cash.total, usdt("4995"));
    assert_eq!(cash.available, usdt("4995"));
    assert_eq!(cash.reserved, usdt("0"));
    let base = system.balances.balance("BTC").await;
    assert_eq!(base.total.amount(), dec("0.1"));

    let position = system.positions.get("BTC/USDT").unwrap();
    assert_eq!(position.quantity, dec("0.1"));
    assert_eq!(position.entry_price, Some(dec("50000")));

    // The audit trail walks the full lifecycle.
    let trail = system.store.transitions(&record.client_order_id).unwrap();
    let states: Vec<OrderStatus> = trail.iter().map(|t| t.status).collect();
    assert_eq!(
        states,
        vec![
            OrderStatus::Reserved,
            OrderStatus::Submitted,
            OrderStatus::Accepted,
            OrderStatus::Filled
        ]
    );
    assert!(system.balances.open_reservations().await.is_empty());
}

#[tokio::test]
async fn insufficient_funds_leaves_only_a_rejected_audit_entry() {
    let (_exchange, system) = paper_system(100).await;

    let err = system
        .gateway
        .submit(market_buy(2, "0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InsufficientFunds(_)));

    let cash = system.balances.balance("USDT").await;
    assert_eq!(cash.total, usdt("100"));
    assert_eq!(cash.available, usdt("100"));
    assert!(system.balances.open_reservations().await.is_empty());

    let records = system.store.list_by_status(OrderStatus::Rejected).unwrap();
    assert_eq!(records.len(), 1);
    assert!(system.store.list_in_flight().unwrap().is_empty());
}

#[tokio::test]
async fn identical_retry_returns_the_existing_record() {
    let (exchange, system) = paper_system(10_000).await;

    let first = system.gateway.submit(market_buy(42, "0.1")).await.unwrap();
    assert_eq!(first.status, OrderStatus::Filled);
    let cash_after_first = system.balances.balance("USDT").await;

    let second = system.gateway.submit(market_buy(42, "0.1")).await.unwrap();
    assert_eq!(second.client_order_id, first.client_order_id);
    assert_eq!(second.status, OrderStatus::Filled);

    // No second reservation, no second fill, no new record.
    let cash_after_second = system.balances.balance("USDT").await;
    assert_eq!(cash_after_first.total, cash_after_second.total);
    assert_eq!(system.store.count().unwrap(), 1);
    let venue_positions = exchange.fetch_positions(Some("BTC/USDT")).await.unwrap();
    assert_eq!(venue_positions[0].quantity, dec("0.1"));
}

#[tokio::test]
async fn breaker_drain_halts_new_orders_and_survives_restart() {
    let state_dir = TempDir::new().unwrap();
    let breaker_path = state_dir.path().join("breaker.json");

    let mut settings = fast_settings(10_000);
    settings.breaker.state_path = Some(breaker_path.clone());
    let (exchange, system) = paper_system_with(settings).await;

    // Establish the peak, then mark the portfolio down 11% with one
    // order in flight.
    system.breaker.check(dec("10000")).unwrap();
    system.breaker.register("in-flight-1").unwrap();
    system.breaker.check(dec("8900")).unwrap();
    assert_eq!(system.breaker.state(), BreakerState::Draining);

    let err = system
        .gateway
        .submit(market_buy(3, "0.1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::CircuitBreaker(DenyReason::Draining)
    ));

    // The in-flight order completes; the drain finishes OPEN.
    system.breaker.complete("in-flight-1").unwrap();
    assert_eq!(system.breaker.state(), BreakerState::Open);

    // Restart: the persisted state keeps trading halted.
    drop(system);
    let mut settings = fast_settings(10_000);
    settings.breaker.state_path = Some(breaker_path);
    let restarted = System::assemble(exchange as Arc<dyn ExchangeClient>, settings)
        .await
        .unwrap();
    restarted.recover().await.unwrap();
    assert_eq!(restarted.breaker.state(), BreakerState::Open);
    let err = restarted
        .gateway
        .submit(market_buy(4, "0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CircuitBreaker(DenyReason::Open)));
}

#[tokio::test]
async fn half_open_probe_closes_the_breaker_on_success() {
    let mut settings = fast_settings(10_000);
    settings.breaker.cooldown = Duration::from_secs(0);
    let (_exchange, system) = paper_system_with(settings).await;

    system.breaker.trip("manual").unwrap();
    system.breaker.reset("operator reset").unwrap();
    assert_eq!(system.breaker.state(), BreakerState::HalfOpen);

    let record = system.gateway.submit(market_buy(5, "0.1")).await.unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
    assert_eq!(system.breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn probe_failure_reopens_the_breaker() {
    let mut settings = fast_settings(50);
    settings.breaker.cooldown = Duration::from_secs(0);
    let (_exchange, system) = paper_system_with(settings).await;

    system.breaker.trip("manual").unwrap();
    system.breaker.reset("operator reset").unwrap();

    // The probe dies on insufficient funds; the breaker re-opens.
    let err = system
        .gateway
        .submit(market_buy(6, "0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InsufficientFunds(_)));
    assert_eq!(system.breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn gateway_refuses_orders_before_recovery() {
    let exchange = Arc::new(
        MockExchange::new(MockExchangeConfig::btc_usdt(Money::from_units(
            1_000_000, "USDT",
        )))
        .await,
    );
    exchange.set_price("BTC/USDT", dec("50000")).await;
    let system = System::assemble(exchange as Arc<dyn ExchangeClient>, fast_settings(10_000))
        .await
        .unwrap();

    let err = system
        .gateway
        .submit(market_buy(7, "0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotReady));
}

#[tokio::test]
async fn validation_reject_releases_the_symbol_and_reserves_nothing() {
    let (_exchange, system) = paper_system(10_000).await;

    let mut intent = market_buy(8, "0.0001");
    intent.symbol = "BTC/USDT".into();
    let err = system.gateway.submit(intent).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
    assert!(system.balances.open_reservations().await.is_empty());
    assert!(system.locker.locked_symbols().is_empty());

    // The symbol is immediately usable again.
    let record = system.gateway.submit(market_buy(9, "0.1")).await.unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
}

#[tokio::test]
async fn concurrent_submissions_on_one_symbol_are_serialized() {
    let (_exchange, system) = paper_system(100_000).await;
    let gateway = Arc::clone(&system.gateway);

    let mut handles = Vec::new();
    for nonce in 0..4u64 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway.submit(market_buy(100 + nonce, "0.1")).await
        }));
    }
    for handle in handles {
        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Filled);
    }

    // Serialization means every fill landed and the ledger invariant
    // held throughout.
    let position = system.positions.get("BTC/USDT").unwrap();
    assert_eq!(position.quantity, dec("0.4"));
    assert_eq!(system.store.count().unwrap(), 4);
    let cash = system.balances.balance("USDT").await;
    assert_eq!(
        cash.total.amount(),
        cash.available.amount() + cash.reserved.amount()
    );
    assert_eq!(cash.reserved, usdt("0"));
}
