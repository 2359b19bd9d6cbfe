//! The order gateway: the only path to venue order submission.
//!
//! Every order passes the same transactional sequence — breaker check,
//! symbol lock, validation, idempotency, balance reservation, submission,
//! settlement — so that a crash at any point leaves either no trace or a
//! durable record startup recovery can resolve.

use bulwark_account::AccountError;
use bulwark_bus::BusError;
use bulwark_core::{ClientOrderId, Symbol};
use bulwark_exchange::{ExchangeError, RejectReason};
use bulwark_journal::JournalError;
use bulwark_risk::{DenyReason, RiskError};
use thiserror::Error;

mod gateway;
mod recovery;
mod system;

pub use gateway::{GatewayConfig, OrderGateway, SubmitIntent};
pub use recovery::{RecoveryReport, StartupRecovery};
pub use system::{System, SystemSettings};

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The error taxonomy agents see. Local rejections leave no state behind
/// (beyond an audit entry); critical outcomes retain their resources for
/// recovery.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Startup recovery has not completed; trading is refused.
    #[error("gateway is not ready")]
    NotReady,
    /// The circuit breaker refused the order.
    #[error("rejected by circuit breaker: {0}")]
    CircuitBreaker(DenyReason),
    /// The symbol lock could not be acquired in time.
    #[error("symbol busy: {0}")]
    SymbolBusy(Symbol),
    /// An earlier order on this symbol is awaiting verification.
    #[error("symbol {symbol} has an order pending verification: {client_order_id}")]
    PendingVerificationOutstanding {
        symbol: Symbol,
        client_order_id: ClientOrderId,
    },
    /// The venue's predictive validation refused the order.
    #[error("validation rejected: {0}")]
    Validation(RejectReason),
    /// The balance manager could not reserve the required funds.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// The venue rejected the submission; the reservation was released.
    #[error("submission rejected: {0}")]
    SubmissionRejected(RejectReason),
    /// The venue did not answer before the deadline. The reservation is
    /// retained and the order is recorded as PENDING_VERIFICATION.
    #[error("submission timed out; order {client_order_id} pending verification")]
    SubmissionTimeout { client_order_id: ClientOrderId },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
