use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fixed decimal precision of the reward token.
pub const TOKEN_DECIMALS: u32 = 18;

const UNIT: u128 = 10_u128.pow(TOKEN_DECIMALS);

/// Token amount in base units (18 decimals). Serialized as its decimal string, e.g.
/// `"100.005"`, since JSON numbers cannot hold most u128 base-unit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn from_whole_tokens(tokens: u64) -> Self {
        Self(u128::from(tokens) * UNIT)
    }

    #[must_use]
    pub fn as_base_units(self) -> u128 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Underflow)
    }

    pub fn checked_mul(self, factor: u128) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(factor)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Share of this amount in basis points, rounded down.
    pub fn bps_share(self, bps: u16) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(u128::from(bps))
            .map(|v| Self(v / 10_000))
            .ok_or(MoneyError::Overflow)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNIT;
        let frac = self.0 % UNIT;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:018}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for TokenAmount {
    type Err = MoneyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let s = value.trim();
        if s.is_empty() {
            return Err(MoneyError::Parse(value.to_string()));
        }
        let (whole_str, frac_str) = s.split_once('.').unwrap_or((s, ""));
        if frac_str.len() > TOKEN_DECIMALS as usize
            || !whole_str.chars().all(|c| c.is_ascii_digit())
            || !frac_str.chars().all(|c| c.is_ascii_digit())
            || (whole_str.is_empty() && frac_str.is_empty())
        {
            return Err(MoneyError::Parse(value.to_string()));
        }
        let whole: u128 = if whole_str.is_empty() {
            0
        } else {
            whole_str
                .parse()
                .map_err(|_| MoneyError::Parse(value.to_string()))?
        };
        let frac: u128 = if frac_str.is_empty() {
            0
        } else {
            let padded = format!("{frac_str:0<18}");
            padded
                .parse()
                .map_err(|_| MoneyError::Parse(value.to_string()))?
        };
        whole
            .checked_mul(UNIT)
            .and_then(|w| w.checked_add(frac))
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
    #[error("invalid token amount: {0}")]
    Parse(String),
}
