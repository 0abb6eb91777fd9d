//! Native-currency amounts.

use core::fmt;
use core::str::FromStr;

use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AmountError;

/// Smallest units per whole native coin (lamports per SOL).
pub const UNITS_PER_COIN: u64 = 1_000_000_000;

const MAX_SCALE: u32 = 9;

/// Native amount in the smallest indivisible unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lamports(pub u64);

impl Lamports {
    pub const ZERO: Self = Self(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parses a decimal amount of whole coins, e.g. `"2.5"`.
    ///
    /// # Errors
    ///
    /// Rejects negative, non-numeric, over-precise or overflowing input.
    pub fn from_coins(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        let coins =
            Decimal::from_str(s).map_err(|_| AmountError::Malformed(s.to_string()))?;
        if coins.is_sign_negative() && !coins.is_zero() {
            return Err(AmountError::Negative(s.to_string()));
        }
        let coins = coins.normalize();
        if coins.scale() > MAX_SCALE {
            return Err(AmountError::Precision(s.to_string()));
        }
        coins
            .checked_mul(Decimal::from(UNITS_PER_COIN))
            .and_then(|units| units.to_u64())
            .map(Self)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }
}

impl FromStr for Lamports {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_coins(s)
    }
}

impl From<u64> for Lamports {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Formats as whole coins without trailing zeros (`2500000000` -> `2.5`).
impl fmt::Display for Lamports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_COIN;
        let frac = self.0 % UNITS_PER_COIN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:09}", frac);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_coins() {
        assert_eq!(Lamports::from_coins("2.5"), Ok(Lamports(2_500_000_000)));
        assert_eq!(Lamports::from_coins("0"), Ok(Lamports::ZERO));
        assert_eq!(Lamports::from_coins("-0"), Ok(Lamports::ZERO));
        assert_eq!(Lamports::from_coins("0.000000001"), Ok(Lamports(1)));
        assert_eq!(Lamports::from_coins("1.500000000"), Ok(Lamports(1_500_000_000)));
    }

    #[test]
    fn rejects_invalid_amounts() {
        assert!(matches!(
            Lamports::from_coins("-1"),
            Err(AmountError::Negative(_))
        ));
        assert!(matches!(
            Lamports::from_coins("abc"),
            Err(AmountError::Malformed(_))
        ));
        assert!(matches!(
            Lamports::from_coins("NaN"),
            Err(AmountError::Malformed(_))
        ));
        assert!(matches!(
            Lamports::from_coins("0.0000000001"),
            Err(AmountError::Precision(_))
        ));
        assert!(matches!(
            Lamports::from_coins("20000000000"),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn displays_whole_coins() {
        assert_eq!(Lamports(2_500_000_000).to_string(), "2.5");
        assert_eq!(Lamports(3 * UNITS_PER_COIN).to_string(), "3");
        assert_eq!(Lamports(1).to_string(), "0.000000001");
    }
}
