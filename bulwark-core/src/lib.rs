//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod money;

pub use money::{Money, MoneyError, MoneyResult, RoundingPolicy, MONEY_SCALE};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTC/USDT`).
pub type Symbol = String;
/// Alias for currency codes (e.g., `USDT`).
pub type Currency = String;
/// Caller-generated identifier used for idempotent submission.
pub type ClientOrderId = String;
/// Identifier assigned by the venue upon acceptance.
pub type VenueOrderId = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed direction multiplier (buy positive, sell negative).
    #[must_use]
    pub fn direction(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price or better.
    Limit,
}

/// Lifecycle state of an order inside the gateway.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Validating,
    Reserved,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    /// Submission deadline elapsed before the venue answered; resources are
    /// retained until recovery resolves the true outcome.
    PendingVerification,
}

impl OrderStatus {
    /// Whether the order can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

/// Venue-facing order placement parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Quantity,
    pub price: Option<Price>,
}

/// One recorded state change of an order. The audit trail is append-only.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderTransition {
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

impl OrderTransition {
    #[must_use]
    pub fn new(status: OrderStatus) -> Self {
        Self {
            status,
            at: Utc::now(),
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(status: OrderStatus, note: impl Into<String>) -> Self {
        Self {
            status,
            at: Utc::now(),
            note: Some(note.into()),
        }
    }
}

/// Durable record of an order and its full audit trail.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRecord {
    pub client_order_id: ClientOrderId,
    #[serde(default)]
    pub venue_order_id: Option<VenueOrderId>,
    pub agent_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Quantity,
    #[serde(default)]
    pub price: Option<Price>,
    pub filled: Quantity,
    #[serde(default)]
    pub avg_fill_price: Option<Price>,
    pub fees_paid: Money,
    pub status: OrderStatus,
    #[serde(default)]
    pub reservation_id: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<OrderTransition>,
}

impl OrderRecord {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Immutable metadata describing a tradable market.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub base: Currency,
    pub quote: Currency,
    pub tick_size: Price,
    pub lot_size: Quantity,
    pub min_notional: Price,
}

/// Snapshot of a net position for one symbol.
///
/// `quantity` is signed: positive long, negative short. A zero-quantity
/// position is retained until explicitly removed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub quantity: Quantity,
    #[serde(default)]
    pub entry_price: Option<Price>,
    pub realized_pnl: Price,
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    /// Flat position for a symbol.
    #[must_use]
    pub fn flat(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            entry_price: None,
            realized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Mark-to-market unrealized P&L at the given price.
    #[must_use]
    pub fn unrealized_pnl(&self, mark: Price) -> Price {
        match self.entry_price {
            Some(entry) => (mark - entry) * self.quantity,
            None => Decimal::ZERO,
        }
    }
}

/// Per-currency balance view with the `total == available + reserved`
/// invariant.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BalanceSnapshot {
    pub currency: Currency,
    pub total: Money,
    pub available: Money,
    pub reserved: Money,
}

/// Earmarked funds locked against a prospective order.
///
/// Produced by `reserve` and consumed exactly once by `commit` or
/// `release`. Reservations that outlive their order are reclaimed by
/// startup recovery.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Reservation {
    pub id: Uuid,
    pub currency: Currency,
    pub amount: Money,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// A single event published on the bus.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Event {
    pub sequence: u64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_closed() {
        for status in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            OrderStatus::New,
            OrderStatus::Accepted,
            OrderStatus::PartiallyFilled,
            OrderStatus::PendingVerification,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn position_unrealized_pnl_is_signed() {
        let mut position = PositionSnapshot::flat("BTC/USDT");
        position.quantity = "0.5".parse().unwrap();
        position.entry_price = Some(Decimal::from(60_000));
        assert_eq!(
            position.unrealized_pnl(Decimal::from(60_500)),
            Decimal::from(250)
        );
        position.quantity = "-0.5".parse().unwrap();
        assert_eq!(
            position.unrealized_pnl(Decimal::from(60_500)),
            Decimal::from(-250)
        );
    }

    #[test]
    fn side_direction_matches_sign() {
        assert_eq!(Side::Buy.direction(), Decimal::ONE);
        assert_eq!(Side::Sell.direction(), Decimal::NEGATIVE_ONE);
        assert_eq!(Side::Buy.inverse(), Side::Sell);
    }
}
