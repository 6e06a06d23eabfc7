//! In-memory chains and guardian network ("mock mode").
//!
//! `SimulatedEvm` and `SimulatedSolana` implement the same RPC traits the
//! live transports do, so the real adapters run unchanged on top of them.
//! Signed transactions are decoded from their raw bytes and executed
//! atomically: a reverting transaction leaves no trace but its receipt.
//! `Faults` injects outages, lost broadcast responses and slow confirmation.

pub mod evm;
pub mod guardians;
pub mod solana;
pub mod wallet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{ConfirmationPolicy, TxRequest};
use crate::amm::{self, FeeRate};
use crate::bridge::attestation::Attestation;
use crate::clock::Clock;
use crate::error::ChainError;
use crate::models::{outcome_for, Chain, Side};
use crate::retry::RetryPolicy;

pub use evm::SimulatedEvm;
pub use guardians::SimulatedGuardians;
pub use solana::SimulatedSolana;
pub use wallet::SimulatedWallet;

use super::polygon::PolygonAdapter;
use super::solana::SolanaAdapter;

/// Guardians in the default simulated network (quorum 4)
pub const DEFAULT_GUARDIANS: usize = 5;

/// Wallet label of the market resolver on both chains
pub const AUTHORITY_LABEL: &str = "resolver";

// ============================================================================
// FAULT INJECTION
// ============================================================================

#[derive(Debug, Default)]
pub struct Faults {
    offline: AtomicBool,
    fail_next_calls: AtomicU32,
    lose_next_broadcasts: AtomicU32,
    pending_polls: AtomicU32,
    stalled: AtomicBool,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Faults {
    /// Every RPC call fails with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` RPC calls fail with a transport error
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_next_calls.store(n, Ordering::SeqCst);
    }

    /// The next `n` broadcasts execute but the response is lost
    pub fn lose_next_broadcasts(&self, n: u32) {
        self.lose_next_broadcasts.store(n, Ordering::SeqCst);
    }

    /// Status polls a new transaction reports pending before it lands
    pub fn set_pending_polls(&self, n: u32) {
        self.pending_polls.store(n, Ordering::SeqCst);
    }

    /// Transactions are accepted but never confirm
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub(crate) fn check(&self, method: &str) -> Result<(), ChainError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc(format!("{}: node unreachable", method)));
        }
        if take_one(&self.fail_next_calls) {
            return Err(ChainError::Rpc(format!("{}: connection reset", method)));
        }
        Ok(())
    }

    pub(crate) fn take_lost_broadcast(&self) -> bool {
        take_one(&self.lose_next_broadcasts)
    }

    pub(crate) fn pending_polls(&self) -> u32 {
        self.pending_polls.load(Ordering::SeqCst)
    }

    pub(crate) fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// BLOCKS & RECEIPTS
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Blocks {
    pub height: u64,
    pub finalized: u64,
    pub auto_finalize: bool,
}

impl Blocks {
    pub fn new() -> Self {
        Self {
            height: 0,
            finalized: 0,
            auto_finalize: true,
        }
    }

    pub fn next(&mut self) -> u64 {
        self.height += 1;
        if self.auto_finalize {
            self.finalized = self.height;
        }
        self.height
    }

    pub fn finalize(&mut self) {
        self.finalized = self.height;
    }

    pub fn is_final(&self, block: u64) -> bool {
        block <= self.finalized
    }
}

/// Outcome of an executed transaction
#[derive(Debug, Clone)]
pub(crate) struct TxRecord {
    pub block: u64,
    pub error: Option<String>,
    pub pending_polls: u32,
}

// ============================================================================
// SIGNED ENVELOPE
// ============================================================================

/// What a simulated wallet signs. `counter` plays the role of the account
/// nonce so two signatures over the same request differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub signer: String,
    pub counter: u64,
    pub request: TxRequest,
}

impl Envelope {
    pub fn encode(&self, chain: Chain) -> Result<String, ChainError> {
        let bytes = serde_json::to_vec(self).map_err(|e| ChainError::Signer(e.to_string()))?;
        Ok(match chain {
            Chain::Polygon => format!("0x{}", hex::encode(bytes)),
            Chain::Solana => BASE64.encode(bytes),
        })
    }

    pub fn decode(chain: Chain, raw: &str) -> Result<Self, ChainError> {
        let bytes = match chain {
            Chain::Polygon => hex::decode(raw.trim_start_matches("0x")).map_err(|e| e.to_string()),
            Chain::Solana => BASE64.decode(raw.as_bytes()).map_err(|e| e.to_string()),
        }
        .map_err(|e| ChainError::InvalidResponse(format!("malformed transaction: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| ChainError::InvalidResponse(format!("malformed transaction: {}", e)))
    }
}

// ============================================================================
// MARKET CONTRACT LOGIC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMarket {
    pub id: u64,
    pub commodity: String,
    pub threshold_price: u64,
    pub current_price: u64,
    pub target_date: i64,
    pub created_at: i64,
    pub yes_pool: u64,
    pub no_pool: u64,
    pub resolved: bool,
    pub actual_price: u64,
    pub resolved_at: i64,
    pub confidence: u8,
}

impl SimMarket {
    pub fn outcome(&self) -> Option<Side> {
        self.resolved.then(|| outcome_for(self.threshold_price, self.actual_price))
    }

    fn pool(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_pool,
            Side::No => self.no_pool,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimPosition {
    pub yes_amount: u64,
    pub no_amount: u64,
    pub claimed: bool,
}

/// Contract rules shared by both simulated chains. Errors are revert reasons.
#[derive(Debug, Clone)]
pub struct MarketBook {
    pub markets: BTreeMap<u64, SimMarket>,
    pub positions: HashMap<(u64, String), SimPosition>,
    pub fee: FeeRate,
    pub authority: String,
}

impl MarketBook {
    pub fn new(authority: String, fee: FeeRate) -> Self {
        Self {
            markets: BTreeMap::new(),
            positions: HashMap::new(),
            fee,
            authority,
        }
    }

    pub fn create(&mut self, commodity: &str, threshold_price: u64, target_date: i64, now: i64) -> u64 {
        let id = self.markets.len() as u64 + 1;
        self.markets.insert(
            id,
            SimMarket {
                id,
                commodity: commodity.to_string(),
                threshold_price,
                current_price: threshold_price,
                target_date,
                created_at: now,
                yes_pool: 0,
                no_pool: 0,
                resolved: false,
                actual_price: 0,
                resolved_at: 0,
                confidence: 70,
            },
        );
        id
    }

    pub fn position(&self, id: u64, user: &str) -> Option<&SimPosition> {
        self.positions.get(&(id, user.to_string()))
    }

    pub fn stake(&mut self, id: u64, user: &str, side: Side, amount: u64, now: i64) -> Result<(), String> {
        if amount == 0 {
            return Err("amount must be positive".into());
        }
        let market = self.markets.get_mut(&id).ok_or("market does not exist")?;
        if market.resolved {
            return Err("market already resolved".into());
        }
        if now >= market.target_date {
            return Err("market expired".into());
        }
        let pool = match side {
            Side::Yes => &mut market.yes_pool,
            Side::No => &mut market.no_pool,
        };
        *pool = pool.checked_add(amount).ok_or("pool overflow")?;

        let position = self.positions.entry((id, user.to_string())).or_default();
        match side {
            Side::Yes => position.yes_amount += amount,
            Side::No => position.no_amount += amount,
        }
        Ok(())
    }

    pub fn resolve(&mut self, id: u64, caller: &str, actual_price: u64, now: i64) -> Result<Side, String> {
        if caller != self.authority {
            return Err("caller is not the resolver".into());
        }
        let market = self.markets.get_mut(&id).ok_or("market does not exist")?;
        if market.resolved {
            return Err("market already resolved".into());
        }
        if now < market.target_date {
            return Err("target date not reached".into());
        }
        market.resolved = true;
        market.actual_price = actual_price;
        market.resolved_at = now;
        Ok(outcome_for(market.threshold_price, actual_price))
    }

    /// Mark the position claimed and return its payout
    pub fn claim(&mut self, id: u64, user: &str) -> Result<u64, String> {
        let market = self.markets.get(&id).ok_or("market does not exist")?;
        let winner = market.outcome().ok_or("market not resolved")?;
        let position = self
            .positions
            .get_mut(&(id, user.to_string()))
            .ok_or("no position")?;
        if position.claimed {
            return Err("already claimed".into());
        }
        let stake = match winner {
            Side::Yes => position.yes_amount,
            Side::No => position.no_amount,
        };
        if stake == 0 {
            return Err("no winning stake".into());
        }
        let payout = amm::settled_payout(stake, market.pool(winner), market.pool(winner.opposite()), self.fee)
            .map_err(|e| e.to_string())?;
        position.claimed = true;
        Ok(payout)
    }
}

// ============================================================================
// BRIDGE MESSAGES
// ============================================================================

/// A lock recorded by a simulated bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub sequence: u64,
    pub nonce: u32,
    pub timestamp: u32,
    pub amount: u64,
    pub token_address: [u8; 32],
    pub recipient: [u8; 32],
    pub recipient_chain: u16,
    pub block: u64,
}

/// Chain whose bridge messages the guardians observe
pub trait MessageSource: Send + Sync {
    fn chain(&self) -> Chain;

    fn emitter(&self) -> [u8; 32];

    /// The message and whether its block is final
    fn message(&self, sequence: u64) -> Option<(PostedMessage, bool)>;
}

/// Bridge contracts only redeem messages from the counterpart bridge they were registered with
fn check_registered(emitters: &HashMap<u16, [u8; 32]>, attestation: &Attestation) -> Result<(), String> {
    let body = &attestation.body;
    match emitters.get(&body.emitter_chain) {
        Some(emitter) if *emitter == body.emitter_address => Ok(()),
        _ => Err(format!("unregistered emitter {} on chain {}", hex::encode(body.emitter_address), body.emitter_chain)),
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Both simulated chains wired to one guardian network
pub struct SimulatedNetwork {
    pub evm: Arc<SimulatedEvm>,
    pub solana: Arc<SimulatedSolana>,
    pub guardians: Arc<SimulatedGuardians>,
}

impl SimulatedNetwork {
    pub fn new(clock: Arc<dyn Clock>, fee: FeeRate) -> Self {
        let guardians = Arc::new(SimulatedGuardians::new(DEFAULT_GUARDIANS, 0));
        let set = guardians.guardian_set();

        let evm = Arc::new(SimulatedEvm::new(
            evm::default_config(),
            clock.clone(),
            set.clone(),
            SimulatedWallet::evm(AUTHORITY_LABEL).address_string(),
            fee,
        ));
        let solana = Arc::new(SimulatedSolana::new(
            solana::default_config(),
            clock,
            set,
            SimulatedWallet::solana(AUTHORITY_LABEL).pubkey(),
            fee,
        ));

        evm.register_emitter(Chain::Solana, MessageSource::emitter(&*solana));
        solana.register_emitter(Chain::Polygon, MessageSource::emitter(&*evm));
        guardians.add_source(evm.clone());
        guardians.add_source(solana.clone());

        Self { evm, solana, guardians }
    }

    pub fn polygon_adapter(&self, confirmation: ConfirmationPolicy, retry: RetryPolicy) -> PolygonAdapter {
        PolygonAdapter::new(self.evm.clone(), self.evm.config().clone(), confirmation, retry)
    }

    pub fn solana_adapter(&self, confirmation: ConfirmationPolicy, retry: RetryPolicy) -> SolanaAdapter {
        SolanaAdapter::new(self.solana.clone(), self.solana.config().clone(), confirmation, retry)
    }

    /// Resolver wallet for `chain`
    pub fn authority(&self, chain: Chain) -> SimulatedWallet {
        match chain {
            Chain::Polygon => SimulatedWallet::evm(AUTHORITY_LABEL),
            Chain::Solana => SimulatedWallet::solana(AUTHORITY_LABEL),
        }
    }

    /// Seed a market with the same terms on both chains
    pub fn create_market_pair(&self, commodity: &str, threshold_price: u64, target_date: i64) -> (u64, u64) {
        (
            self.evm.create_market(commodity, threshold_price, target_date),
            self.solana.create_market(commodity, threshold_price, target_date),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> MarketBook {
        let mut book = MarketBook::new("resolver".into(), FeeRate::default());
        book.create("COFFEE", 300_00, 1_000, 0);
        book
    }

    #[test]
    fn test_book_rejects_stake_after_target_date() {
        let mut book = book();
        assert_eq!(book.stake(1, "alice", Side::Yes, 5, 1_000), Err("market expired".into()));
        assert!(book.stake(1, "alice", Side::Yes, 5, 999).is_ok());
    }

    #[test]
    fn test_book_claim_once() {
        let mut book = book();
        book.stake(1, "alice", Side::Yes, 100, 10).unwrap();
        book.stake(1, "bob", Side::No, 100, 10).unwrap();
        assert_eq!(book.resolve(1, "mallory", 310_00, 1_000), Err("caller is not the resolver".into()));
        assert_eq!(book.resolve(1, "resolver", 310_00, 1_000), Ok(Side::Yes));

        assert_eq!(book.claim(1, "alice"), Ok(196));
        assert_eq!(book.claim(1, "alice"), Err("already claimed".into()));
        assert_eq!(book.claim(1, "bob"), Err("no winning stake".into()));
    }

    #[test]
    fn test_faults_count_down() {
        let faults = Faults::default();
        faults.fail_next_calls(1);
        assert!(faults.check("eth_call").is_err());
        assert!(faults.check("eth_call").is_ok());
        faults.set_offline(true);
        assert!(faults.check("eth_call").unwrap_err().is_retryable());
    }

    #[test]
    fn test_redeem_requires_registered_emitter() {
        let clock = Arc::new(crate::clock::ManualClock::new(0));
        let network = SimulatedNetwork::new(clock, FeeRate::default());
        let body = |emitter_address| crate::bridge::attestation::AttestationBody {
            timestamp: 0,
            nonce: 1,
            emitter_chain: Chain::Solana.wormhole_id(),
            emitter_address,
            sequence: 0,
            consistency_level: 1,
            payload: Vec::new(),
        };
        let attested = |emitter| Attestation::parse(&crate::bridge::attestation::sign(&body(emitter), 0, &[])).unwrap();

        let mut emitters = HashMap::new();
        assert!(check_registered(&emitters, &attested(network.solana.emitter())).is_err());
        emitters.insert(Chain::Solana.wormhole_id(), network.solana.emitter());
        assert!(check_registered(&emitters, &attested(network.solana.emitter())).is_ok());

        let err = check_registered(&emitters, &attested([0xff; 32])).unwrap_err();
        assert!(err.contains("unregistered emitter"));
    }
}
