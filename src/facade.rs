//! Chain-agnostic market API.
//!
//! Every call is dispatched by `MarketKey.chain` to the registered
//! `ChainAdapter`. All validation and state checks run against a fresh read of
//! the market before anything is signed, so a rejected call never costs gas.
//! Writes return only once the adapter reports the transaction confirmed.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::amm::{self, FeeRate, Odds};
use crate::chain::{ensure_signer_chain, ChainAdapter, Signer};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StateError, ValidationError};
use crate::models::{outcome_for, Chain, Claim, Market, MarketKey, OraclePrice, OracleResolution, Position, Side, Stake};

pub struct MarketFacade {
    adapters: BTreeMap<Chain, Arc<dyn ChainAdapter>>,
    clock: Arc<dyn Clock>,
    fee: FeeRate,
}

impl MarketFacade {
    pub fn new(fee: FeeRate) -> Self {
        Self {
            adapters: BTreeMap::new(),
            clock: Arc::new(SystemClock),
            fee,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.adapters.insert(adapter.chain(), adapter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fee(&self) -> FeeRate {
        self.fee
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.adapters.keys().copied().collect()
    }

    pub fn adapter(&self, chain: Chain) -> Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedChain(chain).into())
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn get_market(&self, key: &MarketKey) -> Result<Market> {
        self.adapter(key.chain)?
            .market(key.market_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownMarket(*key).into())
    }

    pub async fn get_odds(&self, key: &MarketKey) -> Result<Odds> {
        let market = self.get_market(key).await?;
        Ok(amm::odds(market.yes_pool, market.no_pool))
    }

    pub async fn get_user_position(&self, key: &MarketKey, account: &str) -> Result<Position> {
        let adapter = self.adapter(key.chain)?;
        self.check_address(adapter.as_ref(), account)?;
        if adapter.market(key.market_id).await?.is_none() {
            return Err(ValidationError::UnknownMarket(*key).into());
        }
        adapter.position(key.market_id, account).await
    }

    /// Every market on `chain`, in id order
    pub async fn list_markets(&self, chain: Chain) -> Result<Vec<Market>> {
        let adapter = self.adapter(chain)?;
        let mut markets = Vec::new();
        for id in adapter.market_ids().await? {
            if let Some(market) = adapter.market(id).await? {
                markets.push(market);
            }
        }
        Ok(markets)
    }

    /// What `amount` staked on `side` now would pay if `side` wins
    pub async fn quote_payout(&self, key: &MarketKey, side: Side, amount: u64) -> Result<u64> {
        let market = self.get_market(key).await?;
        let same = market.pool(side);
        let opposite = market.pool(side.opposite());
        Ok(amm::payout(same, opposite, amount, self.fee)?)
    }

    pub async fn collateral_balance(&self, chain: Chain, account: &str) -> Result<u64> {
        let adapter = self.adapter(chain)?;
        self.check_address(adapter.as_ref(), account)?;
        adapter.collateral_balance(account).await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn stake(&self, key: &MarketKey, side: Side, amount: u64, signer: &dyn Signer) -> Result<Stake> {
        if amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        ensure_signer_chain(signer, key.chain)?;
        let adapter = self.adapter(key.chain)?;

        let market = self.get_market(key).await?;
        if market.resolved {
            return Err(StateError::MarketResolved(*key).into());
        }
        let now = self.clock.now();
        if market.is_expired(now) {
            return Err(StateError::MarketExpired(*key).into());
        }

        let confirmation = adapter.stake(key.market_id, side, amount, signer).await?;
        info!(
            market = %key,
            side = %side,
            amount,
            tx = %confirmation.tx_ref,
            "stake confirmed"
        );

        Ok(Stake {
            key: *key,
            account: signer.address(),
            side,
            amount,
            timestamp: now,
            tx_ref: confirmation.tx_ref,
        })
    }

    /// Claim winnings. The payout is computed from the resolved pools before
    /// sending; nothing is reported claimed until the chain confirms it.
    pub async fn claim(&self, key: &MarketKey, signer: &dyn Signer) -> Result<Claim> {
        ensure_signer_chain(signer, key.chain)?;
        let adapter = self.adapter(key.chain)?;
        let account = signer.address();

        let market = self.get_market(key).await?;
        let winner = match (market.resolved, market.outcome) {
            (true, Some(winner)) => winner,
            _ => return Err(StateError::NotResolved(*key).into()),
        };

        let position = adapter.position(key.market_id, &account).await?;
        if position.claimed {
            return Err(StateError::AlreadyClaimed(*key).into());
        }
        if position.is_empty() {
            return Err(StateError::NoPosition(*key).into());
        }
        if position.amount(winner) == 0 {
            return Err(StateError::WrongSide(*key).into());
        }
        let payout = amm::position_payout(&position, winner, market.yes_pool, market.no_pool, self.fee)?;

        let confirmation = adapter.claim(key.market_id, signer).await?;
        info!(market = %key, account = %account, payout, tx = %confirmation.tx_ref, "claim confirmed");

        Ok(Claim {
            key: *key,
            account,
            payout,
            tx_ref: confirmation.tx_ref,
        })
    }

    /// Record the oracle price on-chain. Only the market's resolver may sign,
    /// and only once the target date has passed.
    pub async fn resolve(&self, key: &MarketKey, price: &OraclePrice, signer: &dyn Signer) -> Result<OracleResolution> {
        if price.actual_price == 0 {
            return Err(ValidationError::NonPositivePrice.into());
        }
        ensure_signer_chain(signer, key.chain)?;
        let adapter = self.adapter(key.chain)?;

        let market = self.get_market(key).await?;
        if !market.commodity.eq_ignore_ascii_case(&price.commodity) {
            return Err(ValidationError::CommodityMismatch {
                expected: market.commodity.clone(),
                got: price.commodity.clone(),
            }
            .into());
        }
        if market.resolved {
            return Err(StateError::MarketResolved(*key).into());
        }
        if !market.is_expired(self.clock.now()) {
            return Err(StateError::ResolutionTooEarly {
                key: *key,
                target_date: market.target_date,
            }
            .into());
        }

        let confirmation = adapter.resolve(key.market_id, price.actual_price, signer).await?;
        let outcome = outcome_for(market.threshold_price, price.actual_price);
        info!(
            market = %key,
            commodity = %market.commodity,
            threshold = market.threshold_price,
            actual = price.actual_price,
            outcome = %outcome,
            tx = %confirmation.tx_ref,
            "market resolved"
        );

        Ok(OracleResolution {
            key: *key,
            actual_price: price.actual_price,
            resolved_at: price.resolved_at,
            resolver: signer.address(),
            outcome,
            tx_ref: confirmation.tx_ref,
        })
    }

    fn check_address(&self, adapter: &dyn ChainAdapter, account: &str) -> Result<()> {
        if !adapter.validate_address(account) {
            return Err(ValidationError::InvalidAddress {
                chain: adapter.chain(),
                address: account.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::USDC_UNIT;
    use crate::chain::simulated::{SimulatedNetwork, SimulatedWallet};
    use crate::chain::ConfirmationPolicy;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use crate::retry::RetryPolicy;

    const NOW: i64 = 1_700_000_000;
    const TARGET: i64 = NOW + 86_400;

    fn setup() -> (SimulatedNetwork, MarketFacade, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let network = SimulatedNetwork::new(clock.clone(), FeeRate::default());
        let polygon = network.polygon_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
        let solana = network.solana_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
        let facade = MarketFacade::new(FeeRate::default())
            .with_adapter(Arc::new(polygon))
            .with_adapter(Arc::new(solana))
            .with_clock(clock.clone());
        network.create_market_pair("COFFEE", 300_00, TARGET);
        (network, facade, clock)
    }

    #[tokio::test]
    async fn test_unknown_market() {
        let (_network, facade, _clock) = setup();
        let key = MarketKey::new(Chain::Solana, 42);
        assert_eq!(
            facade.get_market(&key).await.unwrap_err(),
            EngineError::Validation(ValidationError::UnknownMarket(key))
        );
    }

    #[tokio::test]
    async fn test_stake_moves_odds_on_both_chains() {
        let (network, facade, _clock) = setup();
        for chain in Chain::ALL {
            let key = MarketKey::new(chain, 1);
            let (alice, bob) = match chain {
                Chain::Polygon => (SimulatedWallet::evm("alice"), SimulatedWallet::evm("bob")),
                Chain::Solana => (SimulatedWallet::solana("alice"), SimulatedWallet::solana("bob")),
            };
            match chain {
                Chain::Polygon => {
                    network.evm.mint(&alice.address(), 100 * USDC_UNIT);
                    network.evm.mint(&bob.address(), 100 * USDC_UNIT);
                }
                Chain::Solana => {
                    network.solana.mint(&alice.pubkey(), 100 * USDC_UNIT);
                    network.solana.mint(&bob.pubkey(), 100 * USDC_UNIT);
                }
            }

            assert_eq!(facade.get_odds(&key).await.unwrap(), Odds::EVEN);
            let stake = facade.stake(&key, Side::Yes, 10 * USDC_UNIT, &alice).await.unwrap();
            assert_eq!(stake.account, alice.address());
            facade.stake(&key, Side::No, 20 * USDC_UNIT, &bob).await.unwrap();

            assert_eq!(facade.get_odds(&key).await.unwrap(), Odds { yes: 33, no: 66 });
            let position = facade.get_user_position(&key, &bob.address()).await.unwrap();
            assert_eq!(position.no_amount, 20 * USDC_UNIT);
        }
    }

    #[tokio::test]
    async fn test_stake_rejected_after_target_date_without_chain_call() {
        let (network, facade, clock) = setup();
        let alice = SimulatedWallet::evm("alice");
        network.evm.mint(&alice.address(), 10 * USDC_UNIT);
        clock.set(TARGET);

        let key = MarketKey::new(Chain::Polygon, 1);
        assert_eq!(
            facade.stake(&key, Side::Yes, USDC_UNIT, &alice).await.unwrap_err(),
            EngineError::State(StateError::MarketExpired(key))
        );
        assert_eq!(network.evm.successful_transactions(), 0);
    }

    #[tokio::test]
    async fn test_signer_must_match_chain() {
        let (_network, facade, _clock) = setup();
        let wallet = SimulatedWallet::solana("alice");
        let err = facade
            .stake(&MarketKey::new(Chain::Polygon, 1), Side::Yes, USDC_UNIT, &wallet)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::SignerChainMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_preconditions() {
        let (network, facade, clock) = setup();
        let key = MarketKey::new(Chain::Solana, 1);
        let authority = network.authority(Chain::Solana);
        let price = |cents| OraclePrice {
            commodity: "COFFEE".into(),
            actual_price: cents,
            resolved_at: TARGET,
        };

        assert!(matches!(
            facade.resolve(&key, &price(310_00), &authority).await.unwrap_err(),
            EngineError::State(StateError::ResolutionTooEarly { .. })
        ));

        clock.set(TARGET);
        let wrong = OraclePrice {
            commodity: "COCOA".into(),
            ..price(310_00)
        };
        assert!(matches!(
            facade.resolve(&key, &wrong, &authority).await.unwrap_err(),
            EngineError::Validation(ValidationError::CommodityMismatch { .. })
        ));
        assert_eq!(
            facade.resolve(&key, &price(0), &authority).await.unwrap_err(),
            EngineError::Validation(ValidationError::NonPositivePrice)
        );

        let resolution = facade.resolve(&key, &price(310_00), &authority).await.unwrap();
        assert_eq!(resolution.outcome, Side::Yes);
        assert_eq!(resolution.resolver, authority.address());

        assert_eq!(
            facade.resolve(&key, &price(290_00), &authority).await.unwrap_err(),
            EngineError::State(StateError::MarketResolved(key))
        );
        let market = facade.get_market(&key).await.unwrap();
        assert_eq!(market.outcome, Some(Side::Yes));
        assert_eq!(market.oracle_price, Some(310_00));
    }

    #[tokio::test]
    async fn test_quote_uses_shared_pricing() {
        let (network, facade, _clock) = setup();
        let alice = SimulatedWallet::evm("alice");
        network.evm.mint(&alice.address(), 100 * USDC_UNIT);
        let key = MarketKey::new(Chain::Polygon, 1);
        facade.stake(&key, Side::Yes, 100 * USDC_UNIT, &alice).await.unwrap();

        // yes=100, no=0, 50 more on yes at 2% fee
        assert_eq!(facade.quote_payout(&key, Side::Yes, 50 * USDC_UNIT).await.unwrap(), 49 * USDC_UNIT);
        assert!(facade.quote_payout(&key, Side::Yes, 0).await.is_err());
    }
}
