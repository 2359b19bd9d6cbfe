//! Account-side state: balances, positions and per-symbol exclusion.
//!
//! The balance manager is the sole writer of balances, the position book
//! the sole writer of positions. Nothing in this crate reaches into
//! another component's state; cross-component signals travel over the
//! event bus.

use bulwark_core::{Currency, MoneyError, Symbol};
use rust_decimal::Decimal;
use thiserror::Error;

mod balance;
mod locker;
mod positions;

pub use balance::BalanceManager;
pub use locker::{SymbolGuard, SymbolLocker};
pub use positions::PositionBook;

/// Result alias for account operations.
pub type AccountResult<T> = Result<T, AccountError>;

/// Errors produced by account-side state changes.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Not enough available funds to honor a reservation.
    #[error("insufficient {currency}: available={available}, requested={requested}")]
    InsufficientFunds {
        currency: Currency,
        available: Decimal,
        requested: Decimal,
    },
    /// The reservation id is unknown or was already consumed.
    #[error("unknown reservation {0}")]
    UnknownReservation(uuid::Uuid),
    /// A commit tried to spend more than was reserved.
    #[error("commit of {used} exceeds reserved {reserved}")]
    OverCommit { reserved: Decimal, used: Decimal },
    /// The per-symbol lock could not be acquired before the deadline.
    #[error("symbol {symbol} is busy (held by {held_by:?})")]
    SymbolBusy {
        symbol: Symbol,
        held_by: Option<String>,
    },
    #[error(transparent)]
    Money(#[from] MoneyError),
}
