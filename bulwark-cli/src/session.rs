//! Builds a paper trading system from the application configuration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_bus::EventBusConfig;
use bulwark_config::AppConfig;
use bulwark_core::{Instrument, Money};
use bulwark_exchange::ExchangeClient;
use bulwark_gateway::{GatewayConfig, System, SystemSettings};
use bulwark_paper::{MockExchange, MockExchangeConfig};
use bulwark_risk::{BreakerConfig, ReconcilerConfig};
use rust_decimal::Decimal;

/// Markets the paper venue lists by default.
fn paper_instruments(quote: &str) -> Vec<Instrument> {
    ["BTC", "ETH", "SOL"]
        .iter()
        .map(|base| Instrument {
            symbol: format!("{base}/{quote}"),
            base: (*base).to_string(),
            quote: quote.to_string(),
            tick_size: Decimal::new(1, 2),
            lot_size: Decimal::new(1, 8),
            min_notional: Decimal::from(10),
        })
        .collect()
}

fn reference_price(base: &str) -> Decimal {
    match base {
        "BTC" => Decimal::from(60_000),
        "ETH" => Decimal::from(3_000),
        _ => Decimal::from(180),
    }
}

/// Map the layered configuration onto system settings.
pub fn settings_from(config: &AppConfig) -> Result<SystemSettings> {
    let starting_capital = Money::new(config.starting_capital, &config.reporting_currency)
        .context("starting_capital does not fit the money scale")?;
    Ok(SystemSettings {
        starting_capital,
        gateway: GatewayConfig {
            reporting_currency: config.reporting_currency.clone(),
            fee_buffer_rate: config.risk.fee_buffer_percent,
            symbol_lock_timeout: Duration::from_millis(config.timeouts.symbol_lock_timeout_ms),
            submit_timeout: Duration::from_millis(config.timeouts.submit_timeout_ms),
            fetch_poll_interval: Duration::from_millis(config.timeouts.fetch_poll_interval_ms),
            fetch_poll_deadline: Duration::from_millis(config.timeouts.fetch_poll_deadline_ms),
        },
        breaker: BreakerConfig {
            loss_threshold: config.risk.loss_threshold_percent,
            cooldown: Duration::from_secs(config.risk.breaker_cooldown_seconds),
            reconcile_fail_limit: config.reconcile.fail_limit,
            state_path: Some(config.paths.circuit_breaker_state_path.clone()),
        },
        reconciler: ReconcilerConfig {
            tolerance: config.reconcile.tolerance_percent,
            interval: Duration::from_secs(config.reconcile.interval_seconds),
        },
        bus: EventBusConfig {
            max_queue_size: config.event_bus.max_queue_size,
            critical_topics: config
                .event_bus
                .critical_topics
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
        },
        wal_dir: Some(config.paths.wal_dir.clone()),
        persistence_path: Some(config.paths.persistence_path.clone()),
    })
}

/// Assemble a system against the mock venue. `paper_trading` is enforced
/// by configuration validation before this is called.
pub async fn build_system(config: &AppConfig) -> Result<System> {
    let quote = config.reporting_currency.clone();
    let venue_config = MockExchangeConfig {
        name: "paper".into(),
        starting_balance: Money::from_units(1_000_000, quote.clone()),
        fee_rate: Decimal::new(1, 3),
        slippage_bps: Decimal::ZERO,
        price_band: Decimal::new(5, 1),
        instruments: paper_instruments(&quote),
    };
    let exchange = Arc::new(MockExchange::new(venue_config).await);
    for instrument in paper_instruments(&quote) {
        exchange
            .set_price(&instrument.symbol, reference_price(&instrument.base))
            .await;
    }
    let settings = settings_from(config)?;
    System::assemble(exchange as Arc<dyn ExchangeClient>, settings).await
}
