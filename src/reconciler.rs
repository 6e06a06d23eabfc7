// ============================================================================
// Settlement Reconciler - read-only portfolio classification
// ============================================================================
//
// Scans every market on each chain the account is known on, concurrently,
// and sorts each non-empty position into one category:
//
//   Active             - open for stakes
//   AwaitingResolution - past target date, no oracle price yet
//   ResolvedUnclaimed  - won, payout not collected
//   ResolvedClaimed    - won and collected
//   ResolvedLost       - only staked on the losing side
//
// A chain that cannot be listed is reported as unavailable, a single
// position that cannot be read as a failed market; the rest of the report
// is still returned.
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::amm::{self, FeeRate};
use crate::clock::Clock;
use crate::error::Result;
use crate::facade::MarketFacade;
use crate::models::{Chain, Market, MarketKey, Position};

// ============================================================================
// ACCOUNTS
// ============================================================================

/// One address per chain; the two chains use different address formats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSet {
    accounts: BTreeMap<Chain, String>,
}

impl AccountSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, chain: Chain, address: impl Into<String>) -> Self {
        self.accounts.insert(chain, address.into());
        self
    }

    pub fn get(&self, chain: Chain) -> Option<&str> {
        self.accounts.get(&chain).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Chain, &str)> {
        self.accounts.iter().map(|(c, a)| (*c, a.as_str()))
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionCategory {
    Active,
    AwaitingResolution,
    ResolvedUnclaimed,
    ResolvedClaimed,
    ResolvedLost,
}

impl PositionCategory {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            PositionCategory::ResolvedUnclaimed | PositionCategory::ResolvedClaimed | PositionCategory::ResolvedLost
        )
    }
}

impl fmt::Display for PositionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionCategory::Active => "active",
            PositionCategory::AwaitingResolution => "awaiting_resolution",
            PositionCategory::ResolvedUnclaimed => "resolved_unclaimed",
            PositionCategory::ResolvedClaimed => "resolved_claimed",
            PositionCategory::ResolvedLost => "resolved_lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionReport {
    pub market: Market,
    pub position: Position,
    pub category: PositionCategory,
    /// Both sides, base units
    pub staked: u64,
    /// Mark-to-market value while open, payout once resolved
    pub value: u64,
    /// `value - staked`
    pub pnl: i128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFailure {
    pub chain: Chain,
    pub error: String,
}

/// A market whose position could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketFailure {
    pub key: MarketKey,
    pub error: String,
}

#[derive(Debug, Default)]
struct ChainScan {
    positions: Vec<PositionReport>,
    failed: Vec<MarketFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioReport {
    pub generated_at: i64,
    pub positions: Vec<PositionReport>,
    /// Open positions (active and awaiting resolution)
    pub unrealized_pnl: i128,
    /// Resolved positions, claimed or not
    pub realized_pnl: i128,
    pub unavailable: Vec<ChainFailure>,
    pub failed_markets: Vec<MarketFailure>,
}

impl PortfolioReport {
    pub fn in_category(&self, category: PositionCategory) -> impl Iterator<Item = &PositionReport> {
        self.positions.iter().filter(move |p| p.category == category)
    }

    pub fn is_partial(&self) -> bool {
        !self.unavailable.is_empty() || !self.failed_markets.is_empty()
    }

    pub fn total_staked(&self) -> u64 {
        self.positions.iter().map(|p| p.staked).sum()
    }

    /// Winnings that can be claimed right now
    pub fn claimable(&self) -> u64 {
        self.in_category(PositionCategory::ResolvedUnclaimed).map(|p| p.value).sum()
    }
}

/// Classify one position. Pure; `now` decides whether an unresolved market is still open.
pub fn classify(market: &Market, position: &Position, now: i64, fee: FeeRate) -> Result<PositionReport> {
    let staked = position.total_staked();
    let (category, value) = match (market.resolved, market.outcome) {
        (true, Some(winner)) => {
            let payout = amm::position_payout(position, winner, market.yes_pool, market.no_pool, fee)?;
            let category = if position.amount(winner) == 0 {
                PositionCategory::ResolvedLost
            } else if position.claimed {
                PositionCategory::ResolvedClaimed
            } else {
                PositionCategory::ResolvedUnclaimed
            };
            (category, payout)
        }
        _ => {
            let value = amm::expected_value(position, market.yes_pool, market.no_pool, fee)?;
            let category = if market.is_expired(now) {
                PositionCategory::AwaitingResolution
            } else {
                PositionCategory::Active
            };
            (category, value)
        }
    };

    Ok(PositionReport {
        market: market.clone(),
        position: position.clone(),
        category,
        staked,
        value,
        pnl: value as i128 - staked as i128,
    })
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct SettlementReconciler {
    facade: Arc<MarketFacade>,
    clock: Arc<dyn Clock>,
}

impl SettlementReconciler {
    pub fn new(facade: Arc<MarketFacade>, clock: Arc<dyn Clock>) -> Self {
        Self { facade, clock }
    }

    /// Build a portfolio report. Never writes; safe to call repeatedly.
    pub async fn portfolio(&self, accounts: &AccountSet) -> PortfolioReport {
        let now = self.clock.now();
        let fee = self.facade.fee();
        let mut pending: BTreeSet<Chain> = BTreeSet::new();
        let mut scans = JoinSet::new();

        for (chain, account) in accounts.iter() {
            pending.insert(chain);
            let facade = self.facade.clone();
            let account = account.to_string();
            scans.spawn(async move {
                let result = scan_chain(&facade, chain, &account, now, fee).await;
                (chain, result)
            });
        }

        let mut positions = Vec::new();
        let mut unavailable = Vec::new();
        let mut failed_markets = Vec::new();
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok((chain, Ok(scan))) => {
                    pending.remove(&chain);
                    debug!(chain = %chain, positions = scan.positions.len(), failed = scan.failed.len(), "chain scanned");
                    positions.extend(scan.positions);
                    failed_markets.extend(scan.failed);
                }
                Ok((chain, Err(err))) => {
                    pending.remove(&chain);
                    warn!(chain = %chain, error = %err, "chain unavailable for reconciliation");
                    unavailable.push(ChainFailure {
                        chain,
                        error: err.to_string(),
                    });
                }
                // chain unknown here; whatever is still pending afterwards failed
                Err(err) => warn!(error = %err, "reconciliation task aborted"),
            }
        }
        for chain in pending {
            unavailable.push(ChainFailure {
                chain,
                error: "scan aborted".into(),
            });
        }

        positions.sort_by_key(|p| (p.position.key.chain, p.position.key.market_id));
        unavailable.sort_by_key(|f| f.chain);
        failed_markets.sort_by_key(|f| (f.key.chain, f.key.market_id));

        let (mut unrealized_pnl, mut realized_pnl) = (0i128, 0i128);
        for p in &positions {
            if p.category.is_resolved() {
                realized_pnl += p.pnl;
            } else {
                unrealized_pnl += p.pnl;
            }
        }

        PortfolioReport {
            generated_at: now,
            positions,
            unrealized_pnl,
            realized_pnl,
            unavailable,
            failed_markets,
        }
    }
}

async fn scan_chain(
    facade: &MarketFacade,
    chain: Chain,
    account: &str,
    now: i64,
    fee: FeeRate,
) -> Result<ChainScan> {
    let adapter = facade.adapter(chain)?;
    let mut scan = ChainScan::default();
    for market in facade.list_markets(chain).await? {
        let report = match adapter.position(market.key.market_id, account).await {
            Ok(position) if position.is_empty() => continue,
            Ok(position) => classify(&market, &position, now, fee),
            Err(err) => Err(err),
        };
        match report {
            Ok(report) => scan.positions.push(report),
            Err(err) => {
                warn!(market = %market.key, error = %err, "position unreadable");
                scan.failed.push(MarketFailure {
                    key: market.key,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::USDC_UNIT;
    use crate::chain::simulated::{SimulatedNetwork, SimulatedWallet};
    use crate::chain::{ChainAdapter, Confirmation, ConfirmationPolicy, Signer};
    use crate::clock::ManualClock;
    use crate::error::{ChainError, EngineError};
    use crate::models::Side;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;

    /// Delegates to a real adapter but cannot read positions in one market
    struct UnreadableMarket {
        inner: Arc<dyn ChainAdapter>,
        market_id: u64,
    }

    #[async_trait]
    impl ChainAdapter for UnreadableMarket {
        fn chain(&self) -> Chain {
            self.inner.chain()
        }

        async fn market_ids(&self) -> Result<Vec<u64>> {
            self.inner.market_ids().await
        }

        async fn market(&self, market_id: u64) -> Result<Option<Market>> {
            self.inner.market(market_id).await
        }

        async fn position(&self, market_id: u64, account: &str) -> Result<Position> {
            if market_id == self.market_id {
                return Err(EngineError::chain(Chain::Polygon, ChainError::Rpc("connection reset".into())));
            }
            self.inner.position(market_id, account).await
        }

        async fn stake(&self, market_id: u64, side: Side, amount: u64, signer: &dyn Signer) -> Result<Confirmation> {
            self.inner.stake(market_id, side, amount, signer).await
        }

        async fn claim(&self, market_id: u64, signer: &dyn Signer) -> Result<Confirmation> {
            self.inner.claim(market_id, signer).await
        }

        async fn resolve(&self, market_id: u64, actual_price: u64, signer: &dyn Signer) -> Result<Confirmation> {
            self.inner.resolve(market_id, actual_price, signer).await
        }

        async fn collateral_balance(&self, account: &str) -> Result<u64> {
            self.inner.collateral_balance(account).await
        }

        fn validate_address(&self, address: &str) -> bool {
            self.inner.validate_address(address)
        }
    }

    fn market(resolved: Option<Side>, target_date: i64, yes_pool: u64, no_pool: u64) -> Market {
        Market {
            key: MarketKey::new(Chain::Polygon, 1),
            commodity: "COCOA".into(),
            threshold_price: 100_00,
            current_price: None,
            target_date,
            yes_pool,
            no_pool,
            resolved: resolved.is_some(),
            outcome: resolved,
            oracle_price: resolved.map(|_| 100_00),
            confidence: None,
        }
    }

    fn position(yes: u64, no: u64, claimed: bool) -> Position {
        Position {
            key: MarketKey::new(Chain::Polygon, 1),
            account: "0xabc".into(),
            yes_amount: yes,
            no_amount: no,
            claimed,
        }
    }

    #[test]
    fn test_categories() {
        let fee = FeeRate::ZERO;
        let open = market(None, 1_000, 10 * USDC_UNIT, 10 * USDC_UNIT);
        let p = position(10 * USDC_UNIT, 0, false);
        assert_eq!(classify(&open, &p, 999, fee).unwrap().category, PositionCategory::Active);
        assert_eq!(
            classify(&open, &p, 1_000, fee).unwrap().category,
            PositionCategory::AwaitingResolution
        );

        let won = market(Some(Side::Yes), 1_000, 10 * USDC_UNIT, 10 * USDC_UNIT);
        let report = classify(&won, &p, 2_000, fee).unwrap();
        assert_eq!(report.category, PositionCategory::ResolvedUnclaimed);
        assert_eq!(report.value, 20 * USDC_UNIT);
        assert_eq!(report.pnl, 10 * USDC_UNIT as i128);

        let claimed = position(10 * USDC_UNIT, 0, true);
        assert_eq!(
            classify(&won, &claimed, 2_000, fee).unwrap().category,
            PositionCategory::ResolvedClaimed
        );

        let lost = market(Some(Side::No), 1_000, 10 * USDC_UNIT, 10 * USDC_UNIT);
        let report = classify(&lost, &p, 2_000, fee).unwrap();
        assert_eq!(report.category, PositionCategory::ResolvedLost);
        assert_eq!(report.pnl, -(10 * USDC_UNIT as i128));
    }

    #[test]
    fn test_hedged_position_counts_winning_leg() {
        let won = market(Some(Side::No), 1_000, 30 * USDC_UNIT, 10 * USDC_UNIT);
        let hedged = position(20 * USDC_UNIT, 5 * USDC_UNIT, false);
        let report = classify(&won, &hedged, 2_000, FeeRate::ZERO).unwrap();
        assert_eq!(report.category, PositionCategory::ResolvedUnclaimed);
        // 5 of the 10 NO pool takes half of the 40 pot
        assert_eq!(report.value, 20 * USDC_UNIT);
        assert_eq!(report.pnl, -(5 * USDC_UNIT as i128));
    }

    #[tokio::test]
    async fn test_unreadable_position_keeps_the_rest() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let network = SimulatedNetwork::new(clock.clone(), FeeRate::default());
        let polygon = Arc::new(network.polygon_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(1)));
        let cocoa = network.evm.create_market("COCOA", 300_00, 1_800_000_000);
        let coffee = network.evm.create_market("COFFEE", 200_00, 1_800_000_000);
        let tea = network.evm.create_market("TEA", 150_00, 1_800_000_000);

        let alice = SimulatedWallet::evm("alice");
        network.evm.mint(&alice.address(), 10 * USDC_UNIT);
        for id in [cocoa, coffee, tea] {
            polygon.stake(id, Side::Yes, USDC_UNIT, &alice).await.unwrap();
        }

        let facade = MarketFacade::new(FeeRate::default())
            .with_clock(clock.clone())
            .with_adapter(Arc::new(UnreadableMarket {
                inner: polygon,
                market_id: coffee,
            }));
        let reconciler = SettlementReconciler::new(Arc::new(facade), clock);
        let report = reconciler
            .portfolio(&AccountSet::new().with(Chain::Polygon, alice.address()))
            .await;

        assert!(report.is_partial());
        assert!(report.unavailable.is_empty());
        let read: Vec<u64> = report.positions.iter().map(|p| p.market.key.market_id).collect();
        assert_eq!(read, vec![cocoa, tea]);
        assert_eq!(report.failed_markets.len(), 1);
        assert_eq!(report.failed_markets[0].key, MarketKey::new(Chain::Polygon, coffee));
        assert!(report.failed_markets[0].error.contains("connection reset"));
        assert_eq!(report.total_staked(), 2 * USDC_UNIT);
    }

    #[test]
    fn test_account_set() {
        let accounts = AccountSet::new().with(Chain::Solana, "So1").with(Chain::Polygon, "0xabc");
        assert_eq!(accounts.get(Chain::Polygon), Some("0xabc"));
        let chains: Vec<Chain> = accounts.iter().map(|(c, _)| c).collect();
        assert_eq!(chains, vec![Chain::Polygon, Chain::Solana]);
    }
}
