//! Token amounts in the smallest on-chain unit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decimals of the USD settlement token.
pub const USD_DECIMALS: u32 = 6;

const USD_SCALE: u64 = 10u64.pow(USD_DECIMALS);

/// An amount in raw token units. Serialized as a decimal string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Parse a human-readable USD string such as `"1.50"`.
    pub fn parse_usd(s: &str) -> Result<Self, AmountParseError> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));

        if whole.is_empty() && frac.is_empty() {
            return Err(AmountParseError::Empty);
        }
        if frac.len() > USD_DECIMALS as usize {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }
        let digits_ok = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !digits_ok(whole) || !digits_ok(frac) {
            return Err(AmountParseError::Invalid(s.to_string()));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| AmountParseError::Invalid(s.to_string()))?
        };
        let frac: u64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac, width = USD_DECIMALS as usize);
            padded
                .parse()
                .map_err(|_| AmountParseError::Invalid(s.to_string()))?
        };

        whole
            .checked_mul(USD_SCALE)
            .and_then(|w| w.checked_add(frac))
            .map(Self)
            .ok_or(AmountParseError::Overflow)
    }

    /// Format as a human-readable USD string with trailing zeros trimmed.
    pub fn format_usd(self) -> String {
        let whole = self.0 / USD_SCALE;
        let frac = self.0 % USD_SCALE;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{:0width$}", frac, width = USD_DECIMALS as usize);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Multiply by a factor expressed in hundredths (150 = 1.5x).
    pub fn scale_hundredths(self, hundredths: u64) -> Option<Amount> {
        self.0
            .checked_mul(hundredths)
            .map(|v| v / 100)
            .map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| AmountParseError::Invalid(s.to_string()))
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Amount> for String {
    fn from(a: Amount) -> Self {
        a.0.to_string()
    }
}

/// Error parsing an amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("invalid amount: {0}")]
    Invalid(String),
    #[error("amount has more than {USD_DECIMALS} decimals: {0}")]
    TooPrecise(String),
    #[error("amount overflows")]
    Overflow,
}
