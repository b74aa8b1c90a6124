//! Fixed-point monetary amounts
//!
//! Amounts are parsed once at the edge into a two-fractional-digit decimal
//! and stay fixed-point through summation and comparison. Serialization is
//! always a string with two fractional digits ("1234.50"), never a float.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A monetary amount with exactly two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Parse an amount string. Rejects more than two fractional digits and
    /// non-numeric input; "12", "12.5" and "12.50" all normalize to "12.50".
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let dec = Decimal::from_str(trimmed)
            .map_err(|_| Error::Validation(format!("Invalid amount: '{}'", s)))?;
        if dec.scale() > 2 {
            return Err(Error::Validation(format!(
                "Amount '{}' has more than two fractional digits",
                s
            )));
        }
        let mut dec = dec;
        dec.rescale(2);
        Ok(Money(dec))
    }

    /// Build from a whole number of cents.
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::new(cents, 2))
    }

    pub fn cents(&self) -> i64 {
        (self.0 * Decimal::from(100)).try_into().unwrap_or(i64::MAX)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn abs_diff(&self, other: Money) -> Money {
        Money((self.0 - other.0).abs())
    }

    /// Whether two amounts agree within the configured tolerance: the
    /// greater of an absolute band and a relative fraction of the larger.
    pub fn within_tolerance(&self, other: Money, abs_cents: i64, rel_pct: f64) -> bool {
        let diff = self.abs_diff(other);
        let larger = self.0.max(other.0).abs();
        let rel_band = larger * Decimal::try_from(rel_pct).unwrap_or(Decimal::ZERO);
        let abs_band = Decimal::new(abs_cents, 2);
        diff.0 <= abs_band.max(rel_band)
    }

    /// This amount's proportional share of `total` applied to `whole`, in
    /// exact integer cents, truncated toward zero. Callers hand the
    /// truncation remainder to their final slice.
    pub fn prorate(&self, whole: Money, total: Money) -> Money {
        if total.is_zero() {
            return Money::ZERO;
        }
        let cents =
            whole.cents() as i128 * self.cents() as i128 / total.cents() as i128;
        Money::from_cents(cents as i64)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // scale is fixed at 2, so Decimal's formatting carries the digits
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Money::parse(s)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Money::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_round_trip() {
        for s in ["0.00", "12.50", "1234.56", "199.00", "0.05"] {
            let m = Money::parse(s).unwrap();
            assert_eq!(m.to_string(), s);
            assert_eq!(Money::parse(&m.to_string()).unwrap(), m);
        }
    }

    #[test]
    fn test_parse_normalizes_scale() {
        assert_eq!(Money::parse("12").unwrap().to_string(), "12.00");
        assert_eq!(Money::parse("12.5").unwrap().to_string(), "12.50");
    }

    #[test]
    fn test_parse_rejects_extra_digits() {
        assert!(Money::parse("12.505").is_err());
        assert!(Money::parse("abc").is_err());
        assert!(Money::parse("").is_err());
    }

    #[test]
    fn test_sum_is_exact() {
        // 0.10 summed ten times is exactly 1.00 in fixed-point
        let total: Money = (0..10).map(|_| Money::parse("0.10").unwrap()).sum();
        assert_eq!(total, Money::parse("1.00").unwrap());
    }

    #[test]
    fn test_within_tolerance() {
        let a = Money::parse("100.00").unwrap();
        // absolute band: 5 cents
        assert!(a.within_tolerance(Money::parse("100.05").unwrap(), 5, 0.005));
        assert!(!a.within_tolerance(Money::parse("100.06").unwrap(), 5, 0.0));
        // relative band: 0.5% of 1000 = 5.00
        let b = Money::parse("1000.00").unwrap();
        assert!(b.within_tolerance(Money::parse("1004.00").unwrap(), 5, 0.005));
        assert!(!b.within_tolerance(Money::parse("1006.00").unwrap(), 5, 0.005));
    }

    #[test]
    fn test_cents() {
        assert_eq!(Money::parse("12.34").unwrap().cents(), 1234);
        assert_eq!(Money::from_cents(1999).to_string(), "19.99");
    }

    #[test]
    fn test_prorate_is_integer_cents() {
        let tax = Money::parse("8.00").unwrap();
        let subtotal = Money::parse("100.00").unwrap();
        assert_eq!(
            Money::parse("60.00").unwrap().prorate(tax, subtotal),
            Money::parse("4.80").unwrap()
        );
        // truncates toward zero; callers give the remainder to the last slice
        assert_eq!(
            Money::parse("33.33")
                .unwrap()
                .prorate(Money::parse("10.00").unwrap(), subtotal),
            Money::parse("3.33").unwrap()
        );
        // zero total never divides
        assert_eq!(
            Money::parse("1.00").unwrap().prorate(tax, Money::ZERO),
            Money::ZERO
        );
    }

    #[test]
    fn test_serde_as_string() {
        let m = Money::parse("1234.50").unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"1234.50\"");
        let back: Money = serde_json::from_str("\"1234.50\"").unwrap();
        assert_eq!(back, m);
    }
}
