use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Decimal currency amount with 4 decimal places, stored as a scaled integer.
///
/// All internal state uses this representation. Provider minor units (pence)
/// only appear at the gateway boundary through [`Amount::to_minor_units`] and
/// [`Amount::from_minor_units`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseAmountError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount '{0}'")]
    Invalid(String),
    #[error("amount '{0}' has more than 4 decimal places")]
    TooPrecise(String),
}

impl Amount {
    const SCALE: i64 = 10_000;
    /// Scaled units per provider minor unit (1 penny = 100 scaled units).
    const MINOR: i64 = 100;

    pub const ZERO: Amount = Amount(0);

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Whole currency units, e.g. `Amount::from_major(75)` is 75.00.
    pub fn from_major(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub fn from_minor_units(value: i64) -> Self {
        Amount(value * Self::MINOR)
    }

    /// Convert to provider minor units, rounding half away from zero.
    pub fn to_minor_units(self) -> i64 {
        let half = Self::MINOR / 2;
        if self.0 >= 0 {
            (self.0 + half) / Self::MINOR
        } else {
            (self.0 - half) / Self::MINOR
        }
    }

    pub fn scaled(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs_diff(self, other: Amount) -> Amount {
        Amount((self.0 - other.0).abs())
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount((self.0 - other.0).max(0))
    }

    pub fn times(self, count: u32) -> Amount {
        Amount(self.0 * i64::from(count))
    }

    /// Lossless decimal form: two places, or up to four when the value
    /// carries sub-penny digits.
    pub fn to_exact_string(self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        let (whole, frac) = (abs / scale, abs % scale);
        let mut frac = format!("{frac:04}");
        while frac.len() > 2 && frac.ends_with('0') {
            frac.pop();
        }
        format!("{sign}{whole}.{frac}")
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('£');
        if s.is_empty() {
            return Err(ParseAmountError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));

        let valid_part = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if whole.is_empty() || !valid_part(whole) || !valid_part(frac) {
            return Err(ParseAmountError::Invalid(s.to_string()));
        }
        if frac.len() > 4 {
            return Err(ParseAmountError::TooPrecise(s.to_string()));
        }

        let whole: i64 = whole
            .parse()
            .map_err(|_| ParseAmountError::Invalid(s.to_string()))?;
        let frac: i64 = if frac.is_empty() {
            0
        } else {
            // right-pad to 4 digits: "5" -> 5000
            let padded = format!("{frac:0<4}");
            padded
                .parse()
                .map_err(|_| ParseAmountError::Invalid(s.to_string()))?
        };

        let value = whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| ParseAmountError::Invalid(s.to_string()))?;
        Ok(Amount(if negative { -value } else { value }))
    }
}

impl fmt::Display for Amount {
    /// Currency display with two decimals, rounding half away from zero.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minor = self.to_minor_units();
        let sign = if minor < 0 { "-" } else { "" };
        let abs = minor.abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_exact_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}
