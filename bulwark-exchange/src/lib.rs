//! Venue-agnostic traits used by the order gateway.
//!
//! The gateway depends only on this contract; venues (the deterministic
//! mock included) implement it. Outcomes that the gateway must branch on
//! (validation verdicts, submit results, cancels) are typed variants, not
//! errors — [`ExchangeError`] is reserved for transport- and venue-level
//! failures.

use async_trait::async_trait;
use bulwark_core::{
    BalanceSnapshot, ClientOrderId, Instrument, OrderRequest, OrderStatus, PositionSnapshot,
    Price, Quantity, Symbol, VenueOrderId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for exchange results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Common error type returned by venue implementations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport-level failures (network, timeouts at the wire).
    #[error("transport error: {0}")]
    Transport(String),
    /// The venue did not answer before the deadline; the request may or
    /// may not have taken effect.
    #[error("venue timed out: {0}")]
    Timeout(String),
    /// The referenced order is unknown to the venue.
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    /// The referenced symbol is not listed.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),
    /// The venue answered with a business-level error.
    #[error("venue error: {0}")]
    Venue(String),
}

/// Metadata describing a venue implementation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueInfo {
    pub name: String,
    pub markets: Vec<Symbol>,
    pub paper: bool,
}

/// Enumerated reasons a venue refuses an order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AmountBelowMinimum,
    NotionalBelowMinimum,
    PriceOutOfBand,
    PriceNotOnTick,
    AmountNotOnLot,
    UnknownSymbol,
    LeverageUnsupported,
    InsufficientVenueBalance,
    InsufficientPosition,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmountBelowMinimum => write!(f, "amount below minimum"),
            Self::NotionalBelowMinimum => write!(f, "notional below minimum"),
            Self::PriceOutOfBand => write!(f, "price out of band"),
            Self::PriceNotOnTick => write!(f, "price not aligned to tick"),
            Self::AmountNotOnLot => write!(f, "amount not aligned to lot"),
            Self::UnknownSymbol => write!(f, "symbol unknown"),
            Self::LeverageUnsupported => write!(f, "leverage unsupported"),
            Self::InsufficientVenueBalance => write!(f, "insufficient venue balance"),
            Self::InsufficientPosition => write!(f, "insufficient position"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// Verdict of a purely predictive validation; no side effects.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Validation {
    Ok,
    Reject(RejectReason),
}

/// Outcome of a submission attempt. Idempotent per client order id: a
/// second call with the same id returns the earlier outcome.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum SubmitOutcome {
    Accepted { venue_order_id: VenueOrderId },
    Rejected(RejectReason),
}

/// Outcome of a cancel request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum CancelOutcome {
    Accepted,
    Rejected(String),
}

/// Point-in-time view of an order as the venue knows it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderSnapshot {
    pub venue_order_id: VenueOrderId,
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub status: OrderStatus,
    pub filled: Quantity,
    pub avg_fill_price: Option<Price>,
    pub fees_paid: Price,
    pub updated_at: DateTime<Utc>,
}

/// How to look an order up on the venue.
#[derive(Clone, Debug)]
pub enum OrderLookup {
    Venue(VenueOrderId),
    Client(ClientOrderId),
}

/// Trait describing the execution interface of a venue.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Metadata about the venue for telemetry.
    fn info(&self) -> VenueInfo;

    /// Predict whether the venue would accept the order. No side effects.
    async fn validate(&self, request: &OrderRequest) -> ExchangeResult<Validation>;

    /// Submit an order. Must be idempotent on the client order id.
    async fn submit(&self, request: &OrderRequest) -> ExchangeResult<SubmitOutcome>;

    /// Fetch the current snapshot of an order.
    async fn fetch(&self, lookup: &OrderLookup) -> ExchangeResult<OrderSnapshot>;

    /// Request cancellation of a resting order.
    async fn cancel(&self, venue_order_id: &str) -> ExchangeResult<CancelOutcome>;

    /// Current venue-side positions, optionally narrowed to one symbol.
    async fn fetch_positions(&self, symbol: Option<&str>)
        -> ExchangeResult<Vec<PositionSnapshot>>;

    /// Current venue-side balances.
    async fn fetch_balances(&self) -> ExchangeResult<Vec<BalanceSnapshot>>;

    /// Latest reference price for a symbol.
    async fn reference_price(&self, symbol: &str) -> ExchangeResult<Price>;

    /// Instrument metadata for every listed market.
    async fn instruments(&self) -> ExchangeResult<Vec<Instrument>>;
}
