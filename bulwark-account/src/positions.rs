//! Signed position accounting per symbol.

use std::collections::HashMap;

use bulwark_core::{PositionSnapshot, Price, Quantity, Side, Symbol};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;

/// The sole writer of account-side positions.
///
/// Quantities are signed: buys add, sells subtract. Crossing through zero
/// realizes P&L on the closed quantity and re-opens at the fill price.
#[derive(Default)]
pub struct PositionBook {
    inner: Mutex<HashMap<Symbol, PositionSnapshot>>,
}

impl PositionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fill and return the updated snapshot.
    pub fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> PositionSnapshot {
        let mut inner = self.inner.lock();
        let position = inner
            .entry(symbol.to_string())
            .or_insert_with(|| PositionSnapshot::flat(symbol));
        let delta = quantity * side.direction();
        let prior = position.quantity;

        if prior.is_zero() || prior.signum() == delta.signum() {
            // Extending (or opening): average the entry price by size.
            let total = prior + delta;
            let prior_cost = position.entry_price.unwrap_or(Decimal::ZERO) * prior.abs();
            let new_cost = price * delta.abs();
            position.entry_price = if total.is_zero() {
                None
            } else {
                Some((prior_cost + new_cost) / total.abs())
            };
            position.quantity = total;
        } else {
            let closing = prior.abs().min(delta.abs());
            if let Some(entry) = position.entry_price {
                position.realized_pnl += (price - entry) * closing * prior.signum();
            }
            let remaining = prior + delta;
            if remaining.is_zero() {
                position.quantity = Decimal::ZERO;
                position.entry_price = None;
            } else if remaining.signum() == prior.signum() {
                position.quantity = remaining;
            } else {
                // Flipped through zero: the residual opens at the fill price.
                position.quantity = remaining;
                position.entry_price = Some(price);
            }
        }
        position.updated_at = Utc::now();
        position.clone()
    }

    /// Overwrite the net quantity, keeping realized P&L. Used when the
    /// reconciler adopts the venue's view.
    pub fn set_quantity(&self, symbol: &str, quantity: Quantity) -> PositionSnapshot {
        let mut inner = self.inner.lock();
        let position = inner
            .entry(symbol.to_string())
            .or_insert_with(|| PositionSnapshot::flat(symbol));
        position.quantity = quantity;
        if quantity.is_zero() {
            position.entry_price = None;
        }
        position.updated_at = Utc::now();
        position.clone()
    }

    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<PositionSnapshot> {
        self.inner.lock().get(symbol).cloned()
    }

    /// Snapshot of every tracked position, zero-quantity ones included.
    #[must_use]
    pub fn all(&self) -> Vec<PositionSnapshot> {
        let mut positions: Vec<_> = self.inner.lock().values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Explicitly drop a tracked symbol.
    pub fn remove(&self, symbol: &str) -> Option<PositionSnapshot> {
        self.inner.lock().remove(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    #[test]
    fn buys_extend_and_average_the_entry() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        let position = book.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("60000"));
        assert_eq!(position.quantity, dec("0.2"));
        assert_eq!(position.entry_price, Some(dec("55000")));
    }

    #[test]
    fn sells_realize_pnl_against_the_entry() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", Side::Buy, dec("0.2"), dec("50000"));
        let position = book.apply_fill("BTC/USDT", Side::Sell, dec("0.1"), dec("51000"));
        assert_eq!(position.quantity, dec("0.1"));
        assert_eq!(position.realized_pnl, dec("100"));
        assert_eq!(position.entry_price, Some(dec("50000")));
    }

    #[test]
    fn closing_to_zero_retains_the_position() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        let position = book.apply_fill("BTC/USDT", Side::Sell, dec("0.1"), dec("49000"));
        assert_eq!(position.quantity, Decimal::ZERO);
        assert_eq!(position.entry_price, None);
        assert_eq!(position.realized_pnl, dec("-100"));
        // Retained until explicit removal.
        assert!(book.get("BTC/USDT").is_some());
        book.remove("BTC/USDT");
        assert!(book.get("BTC/USDT").is_none());
    }

    #[test]
    fn crossing_zero_flips_the_side() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        let position = book.apply_fill("BTC/USDT", Side::Sell, dec("0.3"), dec("52000"));
        assert_eq!(position.quantity, dec("-0.2"));
        assert_eq!(position.entry_price, Some(dec("52000")));
        assert_eq!(position.realized_pnl, dec("200"));
    }

    #[test]
    fn reconciler_sync_overwrites_quantity() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", Side::Buy, dec("0.1"), dec("50000"));
        let position = book.set_quantity("BTC/USDT", dec("0.15"));
        assert_eq!(position.quantity, dec("0.15"));
        assert_eq!(position.entry_price, Some(dec("50000")));
    }
}
