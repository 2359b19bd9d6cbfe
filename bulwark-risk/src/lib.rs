//! Risk controls: the circuit breaker and the position reconciler.

use bulwark_bus::BusError;
use bulwark_exchange::ExchangeError;
use bulwark_journal::JournalError;
use thiserror::Error;

mod breaker;
mod reconciler;

pub use breaker::{
    BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, DenyReason, DrainOutcome,
    ResetRecord, Verdict,
};
pub use reconciler::{PositionReconciler, ReconcileReport, ReconcilerConfig, SymbolDiff};

/// Result alias for risk operations.
pub type RiskResult<T> = Result<T, RiskError>;

/// Errors surfaced by the risk layer.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("illegal transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
