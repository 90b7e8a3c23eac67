//! Fixed-point money in minor currency units.
//!
//! Amounts are an `i64` count of minor units (1/100 of the major unit).
//! Arithmetic is checked and overflow surfaces as an error instead of
//! wrapping. Decimal text and rounding go through `rust_decimal`.

use core::fmt;
use core::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Minor units per major unit.
pub const MINOR_PER_MAJOR: i64 = 100;

/// Decimal places of the minor unit.
pub const MINOR_SCALE: u32 = 2;

/// Signed monetary amount in minor units (e.g. ngwee, cents).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Whole major units, e.g. `Money::from_major(50)` is `50.00`.
    pub const fn from_major(major: i64) -> Self {
        Self(major * MINOR_PER_MAJOR)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    pub fn checked_neg(self) -> Option<Money> {
        self.0.checked_neg().map(Money)
    }

    /// `checked_add` that reports overflow as an invariant violation.
    pub fn try_add(self, rhs: Money) -> DomainResult<Money> {
        self.checked_add(rhs)
            .ok_or_else(|| DomainError::invariant("money overflow"))
    }

    /// `checked_sub` that reports overflow as an invariant violation.
    pub fn try_sub(self, rhs: Money) -> DomainResult<Money> {
        self.checked_sub(rhs)
            .ok_or_else(|| DomainError::invariant("money overflow"))
    }

    /// Sum an iterator of amounts, failing on overflow.
    pub fn try_sum<I>(amounts: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.try_add(m))
    }

    /// `self × numerator / denominator`, rounded half away from zero.
    pub fn mul_div_round(self, numerator: i64, denominator: i64) -> DomainResult<Money> {
        let overflow = || DomainError::invariant("money overflow");
        if denominator == 0 {
            return Err(DomainError::invariant("division by zero"));
        }
        let exact = Decimal::from(self.0)
            .checked_mul(Decimal::from(numerator))
            .and_then(|p| p.checked_div(Decimal::from(denominator)))
            .ok_or_else(overflow)?;
        exact
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Money)
            .ok_or_else(overflow)
    }

    /// The amount in major units, e.g. `12.50`.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, MINOR_SCALE)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_decimal(), f)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = DomainError;

    /// Exact conversion; more than two fractional digits is rejected rather
    /// than rounded.
    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        let value = value.normalize();
        if value.scale() > MINOR_SCALE {
            return Err(DomainError::validation(format!(
                "amount {value} has more than {MINOR_SCALE} decimal places"
            )));
        }
        let mut scaled = value;
        scaled.rescale(MINOR_SCALE);
        i64::try_from(scaled.mantissa())
            .map(Money)
            .map_err(|_| DomainError::validation(format!("amount {value} out of range")))
    }
}

impl FromStr for Money {
    type Err = DomainError;

    /// Parses `"12"`, `"12.5"`, `"12.50"`, `"-0.05"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = Decimal::from_str_exact(s)
            .map_err(|e| DomainError::validation(format!("invalid money amount {s:?}: {e}")))?;
        Money::try_from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn display_pads_minor_units() {
        assert_eq!(Money::from_minor(1250).to_string(), "12.50");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(-5).to_string(), "-0.05");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn parse_accepts_common_forms() {
        assert_eq!("12".parse::<Money>().unwrap(), Money::from_minor(1200));
        assert_eq!("12.5".parse::<Money>().unwrap(), Money::from_minor(1250));
        assert_eq!("12.05".parse::<Money>().unwrap(), Money::from_minor(1205));
        assert_eq!("-3.10".parse::<Money>().unwrap(), Money::from_minor(-310));
    }

    #[test]
    fn parse_rejects_sub_minor_precision() {
        assert!("1.005".parse::<Money>().is_err());
        assert!("1e3".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        // Trailing zeros beyond the minor unit carry no extra precision.
        assert_eq!("1.500".parse::<Money>().unwrap(), Money::from_minor(150));
        assert!("".parse::<Money>().is_err());
    }

    #[test]
    fn overflow_is_reported() {
        let max = Money::from_minor(i64::MAX);
        assert!(max.try_add(Money::from_minor(1)).is_err());
        assert!(Money::try_sum([max, Money::from_minor(1)]).is_err());
    }

    #[test]
    fn mul_div_rounds_half_away_from_zero() {
        // 1000 * 250 / 10000 = 25
        assert_eq!(Money::from_minor(1000).mul_div_round(250, 10_000).unwrap(), Money::from_minor(25));
        // 333 * 5 / 100 = 16.65 -> 17
        assert_eq!(Money::from_minor(333).mul_div_round(5, 100).unwrap(), Money::from_minor(17));
        // 330 * 5 / 100 = 16.5 -> 17
        assert_eq!(Money::from_minor(330).mul_div_round(5, 100).unwrap(), Money::from_minor(17));
        // 329 * 5 / 100 = 16.45 -> 16
        assert_eq!(Money::from_minor(329).mul_div_round(5, 100).unwrap(), Money::from_minor(16));
        assert_eq!(Money::from_minor(-330).mul_div_round(5, 100).unwrap(), Money::from_minor(-17));
    }

    #[test]
    fn decimal_conversion_is_exact() {
        assert_eq!(Money::from_minor(1250).to_decimal(), Decimal::new(1250, 2));
        assert_eq!(Money::try_from(Decimal::new(-305, 2)).unwrap(), Money::from_minor(-305));
        assert!(Money::try_from(Decimal::new(1, 3)).is_err());
    }

    proptest! {
        #[test]
        fn display_then_parse_is_identity(minor in -1_000_000_000i64..1_000_000_000i64) {
            let m = Money::from_minor(minor);
            prop_assert_eq!(m.to_string().parse::<Money>().unwrap(), m);
        }
    }
}
