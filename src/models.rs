// Data models shared by the facade, the chain adapters, the bridge and the reconciler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// ============================================================================
// CHAINS
// ============================================================================

/// The two ledgers the engine settles across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// EVM-style chain (market contract + ERC-20 USDC)
    Polygon,
    /// Account-model chain (market program + SPL USDC)
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Polygon, Chain::Solana];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Polygon => "polygon",
            Chain::Solana => "solana",
        }
    }

    /// Chain id used by the attestation network
    pub fn wormhole_id(&self) -> u16 {
        match self {
            Chain::Solana => 1,
            Chain::Polygon => 5,
        }
    }

    pub fn from_wormhole_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Chain::Solana),
            5 => Some(Chain::Polygon),
            _ => None,
        }
    }

    /// The other chain (there are exactly two)
    pub fn counterpart(&self) -> Chain {
        match self {
            Chain::Polygon => Chain::Solana,
            Chain::Solana => Chain::Polygon,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polygon" => Ok(Chain::Polygon),
            "solana" => Ok(Chain::Solana),
            other => Err(ValidationError::UnknownChain(other.to_string())),
        }
    }
}

/// Structured market identifier. Dispatch always goes through `chain`,
/// the Display form exists for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketKey {
    pub chain: Chain,
    pub market_id: u64,
}

impl MarketKey {
    pub fn new(chain: Chain, market_id: u64) -> Self {
        Self { chain, market_id }
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.chain, self.market_id)
    }
}

/// Transaction reference: EVM tx hash or account-model signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn new(value: impl Into<String>) -> Self {
        TxRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// MARKETS & POSITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn from_is_yes(is_yes: bool) -> Self {
        if is_yes {
            Side::Yes
        } else {
            Side::No
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Side::Yes)
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_yes() { "yes" } else { "no" })
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" | "true" => Ok(Side::Yes),
            "no" | "false" => Ok(Side::No),
            other => Err(ValidationError::InvalidSide(other.to_string())),
        }
    }
}

/// YES wins when the oracle price reaches the threshold
pub fn outcome_for(threshold_price: u64, actual_price: u64) -> Side {
    Side::from_is_yes(actual_price >= threshold_price)
}

/// Binary commodity-price market, normalized across both chains.
/// Prices are in cents, pools in USDC base units (6 decimals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub key: MarketKey,
    pub commodity: String,
    pub threshold_price: u64,
    pub current_price: Option<u64>,
    pub target_date: i64,
    pub yes_pool: u64,
    pub no_pool: u64,
    pub resolved: bool,
    pub outcome: Option<Side>,
    pub oracle_price: Option<u64>,
    /// Model confidence 0-100, only published by the EVM contract
    pub confidence: Option<u8>,
}

impl Market {
    pub fn pool(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_pool,
            Side::No => self.no_pool,
        }
    }

    pub fn total_pool(&self) -> u128 {
        self.yes_pool as u128 + self.no_pool as u128
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.target_date
    }

    pub fn accepts_stakes(&self, now: i64) -> bool {
        !self.resolved && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub key: MarketKey,
    pub account: String,
    pub yes_amount: u64,
    pub no_amount: u64,
    pub claimed: bool,
}

impl Position {
    pub fn empty(key: MarketKey, account: &str) -> Self {
        Self {
            key,
            account: account.to_string(),
            yes_amount: 0,
            no_amount: 0,
            claimed: false,
        }
    }

    pub fn amount(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_amount,
            Side::No => self.no_amount,
        }
    }

    pub fn total_staked(&self) -> u64 {
        self.yes_amount.saturating_add(self.no_amount)
    }

    pub fn is_empty(&self) -> bool {
        self.yes_amount == 0 && self.no_amount == 0
    }
}

// ============================================================================
// WRITE RECEIPTS
// ============================================================================

/// Append-only stake record, produced once the stake is confirmed on-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub key: MarketKey,
    pub account: String,
    pub side: Side,
    pub amount: u64,
    pub timestamp: i64,
    pub tx_ref: TxRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub key: MarketKey,
    pub account: String,
    pub payout: u64,
    pub tx_ref: TxRef,
}

/// Oracle price input as published by the prediction service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OraclePrice {
    pub commodity: String,
    /// Cents
    pub actual_price: u64,
    pub resolved_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleResolution {
    pub key: MarketKey,
    pub actual_price: u64,
    pub resolved_at: i64,
    pub resolver: String,
    pub outcome: Side,
    pub tx_ref: TxRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_parse_and_wormhole_ids() {
        assert_eq!("Polygon".parse::<Chain>().unwrap(), Chain::Polygon);
        assert_eq!("solana".parse::<Chain>().unwrap(), Chain::Solana);
        assert!(matches!("eth".parse::<Chain>(), Err(ValidationError::UnknownChain(_))));

        for chain in Chain::ALL {
            assert_eq!(Chain::from_wormhole_id(chain.wormhole_id()), Some(chain));
            assert_ne!(chain.counterpart(), chain);
        }
    }

    #[test]
    fn test_outcome_threshold_is_inclusive() {
        assert_eq!(outcome_for(250_00, 250_00), Side::Yes);
        assert_eq!(outcome_for(250_00, 250_01), Side::Yes);
        assert_eq!(outcome_for(250_00, 249_99), Side::No);
    }

    #[test]
    fn test_market_expiry() {
        let market = Market {
            key: MarketKey::new(Chain::Solana, 7),
            commodity: "COCOA".into(),
            threshold_price: 100,
            current_price: None,
            target_date: 1_000,
            yes_pool: 0,
            no_pool: 0,
            resolved: false,
            outcome: None,
            oracle_price: None,
            confidence: None,
        };
        assert!(market.accepts_stakes(999));
        assert!(!market.accepts_stakes(1_000));
        assert!(market.is_expired(1_000));
    }
}
