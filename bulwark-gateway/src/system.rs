//! Composition root: every component is constructed once here and shared
//! by reference. There are no process-wide singletons; the event bus is
//! the only reverse channel between components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_account::{BalanceManager, PositionBook, SymbolLocker};
use bulwark_bus::{EventBus, EventBusConfig};
use bulwark_core::Money;
use bulwark_exchange::ExchangeClient;
use bulwark_journal::{OrderStore, WalWriter, WalWriterConfig};
use bulwark_risk::{
    BreakerConfig, CircuitBreaker, PositionReconciler, ReconcilerConfig,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{GatewayConfig, GatewayResult, OrderGateway, RecoveryReport, StartupRecovery};

/// Everything needed to assemble a system.
#[derive(Clone, Debug)]
pub struct SystemSettings {
    pub starting_capital: Money,
    pub gateway: GatewayConfig,
    pub breaker: BreakerConfig,
    pub reconciler: ReconcilerConfig,
    pub bus: EventBusConfig,
    /// WAL directory; `None` disables durable critical events (tests).
    pub wal_dir: Option<PathBuf>,
    /// Order store path; `None` uses an in-memory store (tests).
    pub persistence_path: Option<PathBuf>,
}

impl SystemSettings {
    /// In-memory settings around a starting balance, used by tests and
    /// ephemeral paper sessions.
    #[must_use]
    pub fn ephemeral(starting_capital: Money) -> Self {
        Self {
            starting_capital,
            gateway: GatewayConfig::default(),
            breaker: BreakerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            bus: EventBusConfig::default(),
            wal_dir: None,
            persistence_path: None,
        }
    }
}

/// The assembled trading system.
pub struct System {
    pub bus: Arc<EventBus>,
    pub balances: Arc<BalanceManager>,
    pub positions: Arc<PositionBook>,
    pub locker: Arc<SymbolLocker>,
    pub breaker: Arc<CircuitBreaker>,
    pub store: Arc<OrderStore>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub gateway: Arc<OrderGateway>,
    pub reconciler: Arc<PositionReconciler>,
    bus_task: JoinHandle<()>,
}

impl System {
    /// Wire every component around the given venue. The gateway is not
    /// ready until [`System::recover`] has completed.
    pub async fn assemble(
        exchange: Arc<dyn ExchangeClient>,
        settings: SystemSettings,
    ) -> Result<Self> {
        let wal = match &settings.wal_dir {
            Some(dir) => Some(
                WalWriter::open(WalWriterConfig::new(dir))
                    .with_context(|| format!("failed to open WAL at {}", dir.display()))?,
            ),
            None => None,
        };
        let bus = EventBus::new(settings.bus.clone(), wal);
        let bus_task = bus.start();

        let balances = Arc::new(BalanceManager::new(Some(Arc::clone(&bus))));
        balances
            .credit(&settings.starting_capital, "starting capital")
            .await
            .context("failed to fund the account ledger")?;
        let positions = Arc::new(PositionBook::new());
        let locker = Arc::new(SymbolLocker::new());
        let breaker = Arc::new(
            CircuitBreaker::load(settings.breaker.clone())
                .context("failed to load circuit breaker state")?,
        );
        let store = Arc::new(match &settings.persistence_path {
            Some(path) => OrderStore::open(path)
                .with_context(|| format!("failed to open order store at {}", path.display()))?,
            None => OrderStore::open_in_memory().context("failed to open in-memory store")?,
        });

        let gateway = Arc::new(OrderGateway::new(
            Arc::clone(&exchange),
            Arc::clone(&breaker),
            Arc::clone(&locker),
            Arc::clone(&balances),
            Arc::clone(&positions),
            Arc::clone(&store),
            Arc::clone(&bus),
            settings.gateway.clone(),
        ));
        gateway
            .refresh_instruments()
            .await
            .context("failed to load instruments from venue")?;

        let reconciler = Arc::new(PositionReconciler::new(
            Arc::clone(&exchange),
            Arc::clone(&positions),
            Arc::clone(&store),
            Arc::clone(&breaker),
            Arc::clone(&bus),
            settings.reconciler.clone(),
        ));

        info!(venue = %exchange.info().name, "system assembled");
        Ok(Self {
            bus,
            balances,
            positions,
            locker,
            breaker,
            store,
            exchange,
            gateway,
            reconciler,
            bus_task,
        })
    }

    /// Run the startup recovery sequence, marking the gateway ready on
    /// success.
    pub async fn recover(&self) -> GatewayResult<RecoveryReport> {
        StartupRecovery::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.exchange),
            Arc::clone(&self.store),
            Arc::clone(&self.balances),
            Arc::clone(&self.breaker),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.bus),
        )
        .run()
        .await
    }

    /// Launch the periodic reconciliation loop.
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        Arc::clone(&self.reconciler).spawn()
    }

    /// Two-phase shutdown: drain the bus, then stop its dispatcher.
    pub async fn shutdown(self, deadline: Duration) {
        self.bus.shutdown(deadline).await;
        self.bus_task.abort();
    }
}
