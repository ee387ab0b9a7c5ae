//! Fixed-point amounts.
//!
//! USDC is held at 6 decimals, ETH at 18 (wei) and the price feed at 8. Each
//! scale gets its own newtype over `U256` so that amounts of different scales
//! cannot be mixed by accident. Parsing and formatting are exact integer
//! operations; no floating point is involved anywhere.

use crate::error::{Result, SahakariError};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places of the USDC token
pub const USDC_DECIMALS: u32 = 6;
/// Decimal places of ETH (wei)
pub const ETH_DECIMALS: u32 = 18;
/// Decimal places of the ETH/USD price feed
pub const PRICE_DECIMALS: u32 = 8;

/// Parse a decimal string into an integer scaled by `10^decimals`.
///
/// Rejects more fractional digits than the scale can hold instead of
/// truncating them.
pub fn parse_fixed(input: &str, decimals: u32) -> Result<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SahakariError::InsufficientInput(
            "amount is empty".to_string(),
        ));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(SahakariError::InsufficientInput(format!(
            "'{}' is not a number",
            input
        )));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(SahakariError::InsufficientInput(format!(
            "'{}' is not a non-negative decimal number",
            input
        )));
    }
    if fraction.len() > decimals as usize {
        return Err(SahakariError::InsufficientInput(format!(
            "'{}' has more than {} decimal places",
            input, decimals
        )));
    }

    let padded = format!("{:0<width$}", fraction, width = decimals as usize);
    let digits = format!("{}{}", whole, padded);
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::zero());
    }

    U256::from_dec_str(digits).map_err(|e| SahakariError::ArithmeticOverflow(e.to_string()))
}

/// Render a scaled integer as a decimal string without trailing zeros.
pub fn format_fixed(value: U256, decimals: u32) -> String {
    let scale = U256::exp10(decimals as usize);
    let whole = value / scale;
    let fraction = value % scale;

    if fraction.is_zero() {
        return whole.to_string();
    }

    let fraction = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

macro_rules! fixed_point {
    ($(#[$meta:meta])* $name:ident, $decimals:expr, $unit:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub U256);

        impl $name {
            /// Number of decimal places
            pub const DECIMALS: u32 = $decimals;

            /// Wrap a raw scaled integer
            pub fn from_raw(raw: U256) -> Self {
                Self(raw)
            }

            /// The raw scaled integer
            pub fn raw(&self) -> U256 {
                self.0
            }

            /// Zero amount
            pub fn zero() -> Self {
                Self(U256::zero())
            }

            /// Whether the amount is zero
            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            /// Parse an exact decimal string, e.g. `"1000.5"`
            pub fn parse(input: &str) -> Result<Self> {
                parse_fixed(input, Self::DECIMALS).map(Self)
            }

            /// Decimal rendering with the unit suffix
            pub fn display_with_unit(&self) -> String {
                format!("{} {}", self, $unit)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", format_fixed(self.0, Self::DECIMALS))
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(U256::from(raw))
            }
        }
    };
}

fixed_point!(
    /// USDC amount at 6 decimals
    Usdc,
    USDC_DECIMALS,
    "USDC"
);

fixed_point!(
    /// ETH amount in wei (18 decimals)
    Wei,
    ETH_DECIMALS,
    "ETH"
);

fixed_point!(
    /// ETH/USD price at 8 decimals
    EthPrice,
    PRICE_DECIMALS,
    "USD"
);
