//! Fixed-point currency amounts used for bid ceilings.
//!
//! Provider price points arrive as decimal strings (for example `0.0350`).
//! They are held as whole millionths of a currency unit so that ceiling
//! computation never touches floating point.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const MICROS_PER_UNIT: u64 = 1_000_000;
const FRACTION_DIGITS: usize = 6;

/// Default safety margin added on top of the highest observed price.
pub const DEFAULT_PRICE_MARGIN: Price = Price::from_micros(200_000);

/// Currency amount expressed in millionths of a unit.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Price(u64);

impl Price {
    /// Zero currency units.
    pub const ZERO: Self = Self(0);

    /// Builds a price from millionths of a currency unit.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the amount in millionths of a currency unit.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Adds two prices, clamping at the representable maximum.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

/// Errors raised when a provider price string cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PriceParseError {
    /// Raised when the input is empty after trimming.
    #[error("price value is empty")]
    Empty,
    /// Raised when the input contains anything other than digits and a
    /// single decimal point.
    #[error("invalid price value `{0}`")]
    Invalid(String),
    /// Raised when the whole part does not fit the fixed-point range.
    #[error("price value `{0}` is out of range")]
    Overflow(String),
}

impl FromStr for Price {
    type Err = PriceParseError;

    /// Parses a non-negative decimal. Digits beyond the sixth decimal place
    /// are truncated.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(PriceParseError::Empty);
        }

        let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
        let all_digits = |part: &str| part.chars().all(|ch| ch.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction)
        {
            return Err(PriceParseError::Invalid(value.to_owned()));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| PriceParseError::Overflow(value.to_owned()))?
        };

        let mut padded: String = fraction.chars().take(FRACTION_DIGITS).collect();
        while padded.len() < FRACTION_DIGITS {
            padded.push('0');
        }
        let fraction_micros = padded
            .parse::<u64>()
            .map_err(|_| PriceParseError::Invalid(value.to_owned()))?;

        whole_units
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|micros| micros.checked_add(fraction_micros))
            .map(Self)
            .ok_or_else(|| PriceParseError::Overflow(value.to_owned()))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0.div_euclid(MICROS_PER_UNIT);
        let fraction = format!("{:06}", self.0.rem_euclid(MICROS_PER_UNIT));
        let trimmed = fraction.trim_end_matches('0');
        if trimmed.is_empty() {
            write!(f, "{whole}.0")
        } else {
            write!(f, "{whole}.{trimmed}")
        }
    }
}

/// How the bid ceiling is derived from observed market prices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PriceCeilingPolicy {
    /// Amount added to the highest price seen across partitions.
    pub margin: Price,
}

impl Default for PriceCeilingPolicy {
    fn default() -> Self {
        Self {
            margin: DEFAULT_PRICE_MARGIN,
        }
    }
}

impl PriceCeilingPolicy {
    /// Computes the ceiling for a set of observed prices, returning `None`
    /// when no price points are available.
    #[must_use]
    pub fn ceiling(&self, observed: &[Price]) -> Option<Price> {
        observed
            .iter()
            .copied()
            .max()
            .map(|highest| highest.saturating_add(self.margin))
    }
}
