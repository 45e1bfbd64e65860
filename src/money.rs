//! Fixed-point monetary amounts.
//!
//! Wraps `rust_decimal` at a fixed scale. Parsing refuses inputs that would
//! need rounding, so every stored amount is exact and balance arithmetic
//! never drifts.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a [`Money`] value.
#[derive(Debug, Error, PartialEq)]
pub enum ParseMoneyError {
    /// Not a decimal number.
    #[error("invalid amount: {0}")]
    Invalid(#[from] rust_decimal::Error),

    /// More fractional digits than [`Money::SCALE`] can hold without rounding.
    #[error("amount {0} has more than {scale} decimal places", scale = Money::SCALE)]
    TooPrecise(String),
}

/// A monetary amount with exactly [`Money::SCALE`] decimal places.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use usage_ledger::Money;
///
/// let price = Money::from_str("0.25").unwrap();
/// assert_eq!(price.to_string(), "0.250000");
/// assert!(Money::from_str("0.0000001").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    /// Fractional digits carried by every amount.
    pub const SCALE: u32 = 6;

    /// Zero value.
    pub const ZERO: Self = Money(Decimal::ZERO);

    /// Creates a `Money` from a `Decimal`, returning `None` if the value
    /// cannot be represented at [`Money::SCALE`] without rounding.
    pub fn new(value: Decimal) -> Option<Self> {
        if value.normalize().scale() > Self::SCALE {
            return None;
        }
        Some(Self::rescaled(value))
    }

    /// Creates a whole-unit amount.
    pub fn from_units(units: i64) -> Self {
        Self::rescaled(Decimal::from(units))
    }

    fn rescaled(mut value: Decimal) -> Self {
        value.rescale(Self::SCALE);
        Money(value)
    }

    /// The underlying decimal.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Addition that reports overflow instead of panicking.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self::rescaled)
    }

    /// Subtraction that reports overflow instead of panicking.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self::rescaled)
    }
}

impl FromStr for Money {
    type Err = ParseMoneyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)?;
        Money::new(decimal).ok_or_else(|| ParseMoneyError::TooPrecise(trimmed.to_string()))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::rescaled(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::rescaled(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(s: &str) -> Money {
        Money::from_str(s).unwrap()
    }

    #[test]
    fn test_from_str_normalizes_scale() {
        assert_eq!(money("1").to_string(), "1.000000");
        assert_eq!(money("  2.5  ").to_string(), "2.500000");
        assert_eq!(money("0.000001").to_string(), "0.000001");
        // Trailing zeros beyond the scale are not real precision.
        assert_eq!(money("3.1000000000").to_string(), "3.100000");
    }

    #[test]
    fn test_from_str_rejects_excess_precision() {
        assert_eq!(
            Money::from_str("0.0000001"),
            Err(ParseMoneyError::TooPrecise("0.0000001".to_string()))
        );
        assert!(matches!(
            Money::from_str("ten"),
            Err(ParseMoneyError::Invalid(_))
        ));
    }

    #[test]
    fn test_decimal_sums_do_not_drift() {
        let mut total = Money::ZERO;
        for _ in 0..10 {
            total = total.checked_add(money("0.1")).unwrap();
        }
        assert_eq!(total, Money::from_units(1));
    }

    #[test]
    fn test_negative_values() {
        let balance = Money::ZERO - money("10");
        assert!(balance.is_negative());
        assert_eq!(balance.to_string(), "-10.000000");
        assert_eq!((balance + money("15")).to_string(), "5.000000");
        assert_eq!(-balance, money("10"));
        assert!(!Money::ZERO.is_negative());
    }

    #[test]
    fn test_checked_add_reports_overflow() {
        let max = Money(Decimal::MAX);
        assert!(max.checked_add(Money::from_units(1)).is_none());
        assert!(Money::ZERO.checked_sub(Money::from_units(1)).is_some());
    }
}
