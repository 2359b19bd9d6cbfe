//! Currency-tagged fixed-point monetary scalar.
//!
//! Every balance, fee, notional and P&L figure in the workspace is a
//! [`Money`] value. The type carries its currency and is quantized to a
//! fixed 8-decimal scale on construction; mixing currencies or feeding it
//! floating point is rejected at compile time (no float constructors
//! exist) or at runtime (`CurrencyMismatch`, `PrecisionLoss`).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Currency;

/// Number of fractional digits every [`Money`] value is quantized to.
pub const MONEY_SCALE: u32 = 8;

/// Result alias for monetary arithmetic.
pub type MoneyResult<T> = Result<T, MoneyError>;

/// Errors produced by monetary arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    /// Two operands carry different currency tags.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    /// The input carries more precision than the fixed scale can hold.
    #[error("precision loss: '{0}' does not fit {MONEY_SCALE} decimal places")]
    PrecisionLoss(String),
    /// Division by a zero divisor.
    #[error("division by zero")]
    DivisionByZero,
    /// The amount string could not be parsed as a decimal.
    #[error("invalid amount: '{0}'")]
    InvalidAmount(String),
}

/// Named rounding policies for aligning an amount to a venue tick.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Round toward zero.
    Down,
    /// Round away from zero.
    Up,
    /// Banker's rounding.
    NearestEven,
}

impl RoundingPolicy {
    fn strategy(self) -> RoundingStrategy {
        match self {
            Self::Down => RoundingStrategy::ToZero,
            Self::Up => RoundingStrategy::AwayFromZero,
            Self::NearestEven => RoundingStrategy::MidpointNearestEven,
        }
    }
}

/// An immutable amount of a single currency at fixed scale.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Build a value from an exact decimal amount.
    ///
    /// Fails with [`MoneyError::PrecisionLoss`] when the amount carries
    /// non-zero digits beyond the fixed scale.
    pub fn new(amount: Decimal, currency: impl Into<Currency>) -> MoneyResult<Self> {
        let quantized = amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero);
        if quantized != amount {
            return Err(MoneyError::PrecisionLoss(amount.to_string()));
        }
        Ok(Self {
            amount: quantized.normalize(),
            currency: currency.into(),
        })
    }

    /// Parse a decimal string into a value of the given currency.
    pub fn parse(raw: &str, currency: impl Into<Currency>) -> MoneyResult<Self> {
        let amount =
            Decimal::from_str(raw).map_err(|_| MoneyError::InvalidAmount(raw.to_string()))?;
        Self::new(amount, currency)
    }

    /// Build a value from a raw amount, quantizing to the fixed scale
    /// under an explicit policy.
    ///
    /// This is the only sanctioned way to bring arithmetic that may carry
    /// more precision than the scale holds (fee buffers, proceeds) back
    /// into the ledger; the caller names which way the boundary rounds.
    #[must_use]
    pub fn rounded(amount: Decimal, currency: impl Into<Currency>, policy: RoundingPolicy) -> Self {
        Self {
            amount: amount
                .round_dp_with_strategy(MONEY_SCALE, policy.strategy())
                .normalize(),
            currency: currency.into(),
        }
    }

    /// Build a value from a whole number of currency units.
    #[must_use]
    pub fn from_units(units: i64, currency: impl Into<Currency>) -> Self {
        Self {
            amount: Decimal::from(units),
            currency: currency.into(),
        }
    }

    /// The zero value for a currency.
    #[must_use]
    pub fn zero(currency: impl Into<Currency>) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency: currency.into(),
        }
    }

    #[must_use]
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    fn require_same_currency(&self, other: &Self) -> MoneyResult<()> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            })
        }
    }

    /// Add a value of the same currency.
    pub fn add(&self, other: &Self) -> MoneyResult<Self> {
        self.require_same_currency(other)?;
        Ok(Self {
            amount: self.amount + other.amount,
            currency: self.currency.clone(),
        })
    }

    /// Subtract a value of the same currency.
    pub fn sub(&self, other: &Self) -> MoneyResult<Self> {
        self.require_same_currency(other)?;
        Ok(Self {
            amount: self.amount - other.amount,
            currency: self.currency.clone(),
        })
    }

    /// Scale by a unit-less exact rational, truncating to the fixed scale.
    #[must_use]
    pub fn mul(&self, factor: Decimal) -> Self {
        Self {
            amount: (self.amount * factor)
                .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero),
            currency: self.currency.clone(),
        }
    }

    /// Divide by a unit-less exact rational, truncating to the fixed scale.
    pub fn div(&self, divisor: Decimal) -> MoneyResult<Self> {
        if divisor.is_zero() {
            return Err(MoneyError::DivisionByZero);
        }
        Ok(Self {
            amount: (self.amount / divisor)
                .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero),
            currency: self.currency.clone(),
        })
    }

    /// Negated copy of the value.
    #[must_use]
    pub fn neg(&self) -> Self {
        Self {
            amount: -self.amount,
            currency: self.currency.clone(),
        }
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(&self) -> Self {
        Self {
            amount: self.amount.abs(),
            currency: self.currency.clone(),
        }
    }

    /// Compare against a value of the same currency.
    pub fn cmp_same(&self, other: &Self) -> MoneyResult<Ordering> {
        self.require_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    /// Align the amount to a venue tick under an explicit rounding policy.
    pub fn round_to_tick(&self, tick: Decimal, policy: RoundingPolicy) -> MoneyResult<Self> {
        if tick <= Decimal::ZERO {
            return Err(MoneyError::InvalidAmount(format!("tick {tick}")));
        }
        let steps = (self.amount / tick).round_dp_with_strategy(0, policy.strategy());
        Ok(Self {
            amount: steps * tick,
            currency: self.currency.clone(),
        })
    }
}

/// Values of the same currency order normally; mixed currencies do not order.
impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.currency == other.currency {
            Some(self.amount.cmp(&other.amount))
        } else {
            None
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
