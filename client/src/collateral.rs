//! Collateral requirement for a USDC loan.
//!
//! `collateral_wei = usdc × 10^(18 + 8 − 6) × ratio / (price × 100)`
//!
//! The `10^(18 + 8 − 6)` factor lifts the 6-decimal USDC amount to the price
//! feed's 8-decimal scale and then to wei. All arithmetic is on `U256` with
//! overflow checks.

use crate::amount::{EthPrice, Usdc, Wei, ETH_DECIMALS, PRICE_DECIMALS, USDC_DECIMALS};
use crate::error::{Result, SahakariError};
use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Rounding applied to the final division
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundingMode {
    /// Ceiling; the ratio is never undershot
    #[default]
    Up,
    /// Floor, as the deployed contracts compute it. Can leave a loan a few wei
    /// below the ratio.
    Down,
}

/// Collateral requirement computed against a specific price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralQuote {
    /// Requested principal
    pub usdc: Usdc,
    /// ETH/USD price used
    pub price: EthPrice,
    /// Ratio in percent
    pub ratio_percent: u64,
    /// Required collateral
    pub collateral: Wei,
}

/// Required ETH collateral for `usdc` at `price` and `ratio_percent`.
///
/// Zero principal needs zero collateral. A zero price fails with
/// [`SahakariError::InvalidPrice`].
pub fn required_eth_collateral(
    usdc: Usdc,
    price: EthPrice,
    ratio_percent: u64,
    rounding: RoundingMode,
) -> Result<Wei> {
    if price.is_zero() {
        return Err(SahakariError::InvalidPrice(
            "ETH price must be greater than zero".to_string(),
        ));
    }
    if usdc.is_zero() {
        return Ok(Wei::zero());
    }

    let scale = U256::exp10((ETH_DECIMALS + PRICE_DECIMALS - USDC_DECIMALS) as usize);
    let numerator = usdc
        .raw()
        .checked_mul(scale)
        .and_then(|v| v.checked_mul(U256::from(ratio_percent)))
        .ok_or_else(|| {
            SahakariError::ArithmeticOverflow(format!("collateral for {} USDC", usdc))
        })?;
    let denominator = price
        .raw()
        .checked_mul(U256::from(100u64))
        .ok_or_else(|| SahakariError::ArithmeticOverflow(format!("price {}", price)))?;

    let (quotient, remainder) = numerator.div_mod(denominator);
    let collateral = match rounding {
        RoundingMode::Down => quotient,
        RoundingMode::Up if remainder.is_zero() => quotient,
        RoundingMode::Up => quotient + U256::one(),
    };

    Ok(Wei::from_raw(collateral))
}

/// Whether `collateral` covers `usdc` at `price` and `ratio_percent`
pub fn meets_ratio(collateral: Wei, usdc: Usdc, price: EthPrice, ratio_percent: u64) -> bool {
    let scale = U256::exp10((ETH_DECIMALS + PRICE_DECIMALS - USDC_DECIMALS) as usize);
    let lhs = collateral
        .raw()
        .checked_mul(price.raw())
        .and_then(|v| v.checked_mul(U256::from(100u64)));
    let rhs = usdc
        .raw()
        .checked_mul(scale)
        .and_then(|v| v.checked_mul(U256::from(ratio_percent)));

    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs >= rhs,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    #[test]
    fn test_reference_scenario() {
        // 1,000 USDC at $2,000 with 150% needs 0.75 ETH
        let collateral = required_eth_collateral(
            Usdc::from(1_000_000_000),
            EthPrice::from(200_000_000_000),
            150,
            RoundingMode::Up,
        )
        .unwrap();
        assert_eq!(collateral, Wei::from(750_000_000_000_000_000));
    }

    #[test]
    fn test_zero_amount() {
        let collateral = required_eth_collateral(
            Usdc::zero(),
            EthPrice::from(123_456_789),
            150,
            RoundingMode::Up,
        )
        .unwrap();
        assert!(collateral.is_zero());
    }

    #[test]
    fn test_zero_price_is_invalid() {
        assert_matches!(
            required_eth_collateral(
                Usdc::from(1_000_000),
                EthPrice::zero(),
                150,
                RoundingMode::Up
            ),
            Err(SahakariError::InvalidPrice(_))
        );
        assert_matches!(
            required_eth_collateral(Usdc::zero(), EthPrice::zero(), 150, RoundingMode::Up),
            Err(SahakariError::InvalidPrice(_))
        );
    }

    #[test_case(1, 300_000_000_000 ; "one micro usdc at 3000")]
    #[test_case(1_000_000, 333_333_333_333 ; "one usdc at a repeating price")]
    #[test_case(123_456_789, 187_654_321_987 ; "odd amount and price")]
    #[test_case(999_999_999_999, 7 ; "tiny price")]
    #[test_case(5_000_000_000_000, 412_345_678_901 ; "five million usdc")]
    fn test_round_up_never_undershoots(usdc: u64, price: u64) {
        let usdc = Usdc::from(usdc);
        let price = EthPrice::from(price);
        let collateral = required_eth_collateral(usdc, price, 150, RoundingMode::Up).unwrap();
        assert!(meets_ratio(collateral, usdc, price, 150));

        // one wei less must fall short unless the division was exact
        let floor = required_eth_collateral(usdc, price, 150, RoundingMode::Down).unwrap();
        if floor != collateral {
            assert_eq!(collateral.raw() - floor.raw(), U256::one());
            assert!(!meets_ratio(floor, usdc, price, 150));
        }
    }

    #[test]
    fn test_round_down_can_undershoot() {
        let usdc = Usdc::from(1_000_000);
        let price = EthPrice::from(333_333_333_333);
        let floor = required_eth_collateral(usdc, price, 150, RoundingMode::Down).unwrap();
        assert!(!meets_ratio(floor, usdc, price, 150));
    }

    #[test]
    fn test_ratio_scales_linearly() {
        let usdc = Usdc::from(1_000_000_000);
        let price = EthPrice::from(200_000_000_000);
        let at_200 = required_eth_collateral(usdc, price, 200, RoundingMode::Up).unwrap();
        assert_eq!(at_200, Wei::from(1_000_000_000_000_000_000));
    }

    #[test]
    fn test_overflow_is_reported() {
        let usdc = Usdc::from_raw(U256::MAX / U256::from(10u64));
        assert_matches!(
            required_eth_collateral(usdc, EthPrice::from(1), 150, RoundingMode::Up),
            Err(SahakariError::ArithmeticOverflow(_))
        );
    }
}
