use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;
use crate::models::{Position, Side};

// ============================================================================
// PARIMUTUEL POOL CONSTANTS
// ============================================================================

/// Pool-based (parimutuel) pricing shared by both chains.
///
/// Every stake lands in the YES or NO pool of a market. On resolution the
/// whole pot (both pools) is split between winning stakers pro rata, minus
/// the protocol fee:
///
///   payout = stake × (winning_pool + losing_pool) × (1 − fee) / winning_pool
///
/// All arithmetic is integer, in USDC base units, with u128 intermediates.

/// USDC uses 6 decimals on both chains
pub const USDC_DECIMALS: u32 = 6;

/// One whole USDC in base units
pub const USDC_UNIT: u64 = 1_000_000;

const USDC_UNIT_DECIMAL: Decimal = dec!(1_000_000);

pub const BPS_DENOMINATOR: u32 = 10_000;

/// Protocol fee taken from winning payouts (2%)
pub const DEFAULT_FEE_BPS: u32 = 200;

/// Fee rate in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate(u32);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub fn from_bps(bps: u32) -> Result<Self, ValidationError> {
        if bps > BPS_DENOMINATOR {
            return Err(ValidationError::InvalidFeeRate(bps));
        }
        Ok(FeeRate(bps))
    }

    pub fn bps(&self) -> u32 {
        self.0
    }

    /// Share of the pot kept by winners, in basis points
    fn retained_bps(&self) -> u128 {
        (BPS_DENOMINATOR - self.0) as u128
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        FeeRate(DEFAULT_FEE_BPS)
    }
}

// ============================================================================
// ODDS
// ============================================================================

/// Implied probabilities in whole percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Odds {
    pub yes: u8,
    pub no: u8,
}

impl Odds {
    pub const EVEN: Odds = Odds { yes: 50, no: 50 };

    pub fn for_side(&self, side: Side) -> u8 {
        match side {
            Side::Yes => self.yes,
            Side::No => self.no,
        }
    }
}

/// Calculate implied odds from the two pools
///
/// Each side is floor(pool × 100 / total), so the two values sum to 99 or 100.
/// An empty market is quoted at 50/50.
pub fn odds(yes_pool: u64, no_pool: u64) -> Odds {
    let total = yes_pool as u128 + no_pool as u128;
    if total == 0 {
        return Odds::EVEN;
    }
    Odds {
        yes: (yes_pool as u128 * 100 / total) as u8,
        no: (no_pool as u128 * 100 / total) as u8,
    }
}

// ============================================================================
// PAYOUTS
// ============================================================================

/// Payout for a winning stake once the market is resolved
///
/// # Arguments
/// * `winning_stake` - The account's stake on the winning side
/// * `winning_pool` - Final winning pool (includes `winning_stake`)
/// * `losing_pool` - Final losing pool
/// * `fee` - Protocol fee rate
pub fn settled_payout(
    winning_stake: u64,
    winning_pool: u64,
    losing_pool: u64,
    fee: FeeRate,
) -> Result<u64, ValidationError> {
    if winning_stake == 0 {
        return Ok(0);
    }
    if winning_stake > winning_pool {
        return Err(ValidationError::StakeExceedsPool {
            stake: winning_stake,
            pool: winning_pool,
        });
    }

    let pot = winning_pool as u128 + losing_pool as u128;
    let numerator = (winning_stake as u128)
        .checked_mul(pot)
        .and_then(|v| v.checked_mul(fee.retained_bps()))
        .ok_or(ValidationError::Overflow)?;
    let denominator = winning_pool as u128 * BPS_DENOMINATOR as u128;

    u64::try_from(numerator / denominator).map_err(|_| ValidationError::Overflow)
}

/// Quote the payout a new stake would receive if its side wins
///
/// The stake is added to its own pool before pricing, so a lone staker on an
/// empty side gets their stake back minus the fee plus the whole opposing pool.
///
/// # Arguments
/// * `same_side_pool` - Current pool of the side being staked
/// * `opposite_pool` - Current pool of the other side
/// * `stake_amount` - Prospective stake in USDC base units
pub fn payout(
    same_side_pool: u64,
    opposite_pool: u64,
    stake_amount: u64,
    fee: FeeRate,
) -> Result<u64, ValidationError> {
    if stake_amount == 0 {
        return Err(ValidationError::NonPositiveAmount);
    }
    let winning_pool = same_side_pool
        .checked_add(stake_amount)
        .ok_or(ValidationError::Overflow)?;
    settled_payout(stake_amount, winning_pool, opposite_pool, fee)
}

/// What a position would pay if `winner` wins, given the current pools
pub fn position_payout(
    position: &Position,
    winner: Side,
    yes_pool: u64,
    no_pool: u64,
    fee: FeeRate,
) -> Result<u64, ValidationError> {
    let (winning_pool, losing_pool) = match winner {
        Side::Yes => (yes_pool, no_pool),
        Side::No => (no_pool, yes_pool),
    };
    settled_payout(position.amount(winner), winning_pool, losing_pool, fee)
}

/// Probability-weighted value of an open position, using the pool odds as
/// the probability of each outcome
pub fn expected_value(
    position: &Position,
    yes_pool: u64,
    no_pool: u64,
    fee: FeeRate,
) -> Result<u64, ValidationError> {
    let implied = odds(yes_pool, no_pool);
    let mut weighted: u128 = 0;
    for side in [Side::Yes, Side::No] {
        let value = position_payout(position, side, yes_pool, no_pool, fee)? as u128;
        weighted += value * implied.for_side(side) as u128;
    }
    u64::try_from(weighted / 100).map_err(|_| ValidationError::Overflow)
}

// ============================================================================
// AMOUNT FORMATTING
// ============================================================================

/// Parse a human USDC amount ("12.5") into base units
pub fn parse_amount(input: &str) -> Result<u64, ValidationError> {
    let value = Decimal::from_str(input.trim())
        .map_err(|_| ValidationError::InvalidAmount(input.to_string()))?;
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount);
    }
    if value.scale() > USDC_DECIMALS {
        return Err(ValidationError::InvalidAmount(format!(
            "{} has more than {} decimals",
            input, USDC_DECIMALS
        )));
    }
    value
        .checked_mul(USDC_UNIT_DECIMAL)
        .and_then(|v| v.to_u64())
        .ok_or(ValidationError::Overflow)
}

/// Format base units as whole USDC with two decimals
pub fn format_amount(amount: u64) -> String {
    format!("{:.2}", Decimal::from_i128_with_scale(amount as i128, USDC_DECIMALS))
}

/// Format a signed base-unit delta (profit/loss) with two decimals
pub fn format_signed(delta: i128) -> String {
    format!("{:.2}", Decimal::from_i128_with_scale(delta, USDC_DECIMALS))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, MarketKey};

    fn usdc(whole: u64) -> u64 {
        whole * USDC_UNIT
    }

    fn position(yes: u64, no: u64) -> Position {
        Position {
            key: MarketKey::new(Chain::Polygon, 1),
            account: "0xabc".into(),
            yes_amount: yes,
            no_amount: no,
            claimed: false,
        }
    }

    #[test]
    fn test_odds_empty_pool_is_even() {
        assert_eq!(odds(0, 0), Odds::EVEN);
    }

    #[test]
    fn test_odds_floor_rounding() {
        let o = odds(usdc(10), usdc(20));
        assert_eq!(o, Odds { yes: 33, no: 66 });

        let o = odds(usdc(1), 0);
        assert_eq!(o, Odds { yes: 100, no: 0 });
    }

    #[test]
    fn test_odds_always_sum_to_99_or_100() {
        for yes in [0u64, 1, 3, 7, 10, 333, 1_000_001, u64::MAX / 2] {
            for no in [1u64, 2, 9, 20, 667, 999_999, u64::MAX / 2] {
                let o = odds(yes, no);
                let sum = o.yes as u32 + o.no as u32;
                assert!(sum == 99 || sum == 100, "{}/{} gave {:?}", yes, no, o);
            }
        }
    }

    #[test]
    fn test_payout_lone_staker_on_empty_side() {
        // 50 staked on YES against 100 NO: pot 150, 2% fee
        let p = payout(0, usdc(100), usdc(50), FeeRate::default()).unwrap();
        assert_eq!(p, usdc(147));
    }

    #[test]
    fn test_payout_matches_settlement_of_same_pools() {
        let fee = FeeRate::default();
        let quoted = payout(usdc(100), usdc(50), usdc(50), fee).unwrap();
        // after staking: YES 150, NO 50, stake 50 → 50 × 200 × 0.98 / 150
        assert_eq!(quoted, 65_333_333);
        assert_eq!(quoted, settled_payout(usdc(50), usdc(150), usdc(50), fee).unwrap());
    }

    #[test]
    fn test_payout_joining_a_one_sided_market() {
        // YES 100, NO 0, new 50 on YES: 50/150 × 150 × 0.98
        let p = payout(usdc(100), 0, usdc(50), FeeRate::default()).unwrap();
        assert_eq!(p, usdc(49));
    }

    #[test]
    fn test_payout_alone_in_pool_is_not_diluted() {
        let fee = FeeRate::default();
        for stake in [1u64, 7, usdc(1), usdc(250), 123_456_789] {
            let p = payout(0, 0, stake, fee).unwrap();
            assert!(p >= stake * 98 / 100, "stake {} paid {}", stake, p);
        }
    }

    #[test]
    fn test_payout_monotonic_in_opposite_pool() {
        let fee = FeeRate::default();
        let stake = usdc(25);
        let mut previous = 0;
        for opposite in [0u64, 1, 10, usdc(1), usdc(10), usdc(100), usdc(10_000)] {
            let p = payout(usdc(40), opposite, stake, fee).unwrap();
            assert!(p >= previous);
            previous = p;
        }
    }

    #[test]
    fn test_payout_rejects_zero_stake() {
        assert_eq!(
            payout(10, 10, 0, FeeRate::default()),
            Err(ValidationError::NonPositiveAmount)
        );
    }

    #[test]
    fn test_settled_payout_whole_winning_side_takes_pot_minus_fee() {
        let fee = FeeRate::default();
        // resolution scenario: YES 50, NO 100, sole YES staker
        let p = settled_payout(usdc(50), usdc(50), usdc(100), fee).unwrap();
        assert_eq!(p, usdc(147));
        assert_eq!(format_amount(p), "147.00");
    }

    #[test]
    fn test_settled_payout_never_exceeds_pot() {
        let fee = FeeRate::default();
        let (win_pool, lose_pool) = (usdc(300), usdc(700));
        let stakes = [usdc(100), usdc(150), usdc(50)];
        let total: u64 = stakes
            .iter()
            .map(|s| settled_payout(*s, win_pool, lose_pool, fee).unwrap())
            .sum();
        assert!(total <= win_pool + lose_pool);
        assert!(total >= (win_pool + lose_pool) * 98 / 100 - 3);
    }

    #[test]
    fn test_settled_payout_rejects_stake_larger_than_pool() {
        assert!(matches!(
            settled_payout(10, 5, 5, FeeRate::ZERO),
            Err(ValidationError::StakeExceedsPool { .. })
        ));
    }

    #[test]
    fn test_zero_fee_returns_full_share() {
        let p = settled_payout(usdc(10), usdc(40), usdc(60), FeeRate::ZERO).unwrap();
        assert_eq!(p, usdc(25));
    }

    #[test]
    fn test_fee_rate_bounds() {
        assert!(FeeRate::from_bps(10_000).is_ok());
        assert_eq!(FeeRate::from_bps(10_001), Err(ValidationError::InvalidFeeRate(10_001)));
        assert_eq!(FeeRate::default().bps(), 200);
    }

    #[test]
    fn test_expected_value_weights_by_odds() {
        let fee = FeeRate::ZERO;
        // YES 30, NO 70; position holds all of YES → pays 100 if YES (30%)
        let ev = expected_value(&position(usdc(30), 0), usdc(30), usdc(70), fee).unwrap();
        assert_eq!(ev, usdc(30));

        // a hedged position holding both whole pools always receives the pot
        let ev = expected_value(&position(usdc(30), usdc(70)), usdc(30), usdc(70), fee).unwrap();
        assert_eq!(ev, usdc(100));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("12.5").unwrap(), 12_500_000);
        assert_eq!(parse_amount(" 1 ").unwrap(), USDC_UNIT);
        assert_eq!(parse_amount("0.000001").unwrap(), 1);
        assert_eq!(parse_amount("0"), Err(ValidationError::NonPositiveAmount));
        assert_eq!(parse_amount("-3"), Err(ValidationError::NonPositiveAmount));
        assert!(matches!(parse_amount("0.0000001"), Err(ValidationError::InvalidAmount(_))));
        assert!(matches!(parse_amount("ten"), Err(ValidationError::InvalidAmount(_))));
        assert_eq!(parse_amount("79228162514264337593543950335"), Err(ValidationError::Overflow));
        assert_eq!(parse_amount("18446744073709.551616"), Err(ValidationError::Overflow));
    }

    #[test]
    fn test_format_amounts() {
        assert_eq!(format_amount(49_000_000), "49.00");
        assert_eq!(format_amount(1), "0.00");
        assert_eq!(format_amount(65_333_333), "65.33");
        assert_eq!(format_signed(-2_500_000), "-2.50");
    }
}
