use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::wallet::tx_ref_for;
use super::{check_registered, Blocks, Envelope, Faults, MarketBook, MessageSource, PostedMessage, SimMarket, TxRecord};
use crate::amm::FeeRate;
use crate::bridge::attestation::{Attestation, GuardianSet};
use crate::chain::abi::{self, Decoder, Token};
use crate::chain::polygon::{self, EvmLog, EvmReceipt, EvmRpc, PolygonConfig};
use crate::chain::{SignedTx, TxRequest};
use crate::clock::Clock;
use crate::error::ChainError;
use crate::models::{Chain, Side, TxRef};

/// Amoy testnet chain id
pub const SIM_CHAIN_ID: u64 = 80002;

fn contract_address(label: &str) -> String {
    let hash = abi::keccak256(format!("contract:{}", label).as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    abi::format_address(&address)
}

pub fn default_config() -> PolygonConfig {
    PolygonConfig {
        chain_id: SIM_CHAIN_ID,
        market_contract: contract_address("prediction-market"),
        usdc: contract_address("usdc"),
        bridge_contract: contract_address("token-bridge"),
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Contract storage; cloned per transaction and committed only on success
#[derive(Debug, Clone)]
struct Ledger {
    book: MarketBook,
    balances: HashMap<String, u64>,
    allowances: HashMap<(String, String), u64>,
    messages: BTreeMap<u64, PostedMessage>,
    next_sequence: u64,
    completed: HashSet<[u8; 32]>,
    /// Foreign bridge emitters by wormhole chain id
    emitters: HashMap<u16, [u8; 32]>,
    /// Tokens that silently clamp approvals
    approval_cap: Option<u64>,
}

#[derive(Debug, Clone)]
struct SimTx {
    record: TxRecord,
    logs: Vec<EvmLog>,
}

struct EvmState {
    blocks: Blocks,
    ledger: Ledger,
    txs: HashMap<String, SimTx>,
}

/// Simulated EVM node running the prediction, USDC and bridge contracts
pub struct SimulatedEvm {
    config: PolygonConfig,
    clock: Arc<dyn Clock>,
    guardian_set: GuardianSet,
    pub faults: Faults,
    state: Mutex<EvmState>,
}

impl SimulatedEvm {
    pub fn new(
        config: PolygonConfig,
        clock: Arc<dyn Clock>,
        guardian_set: GuardianSet,
        authority: String,
        fee: FeeRate,
    ) -> Self {
        Self {
            config,
            clock,
            guardian_set,
            faults: Faults::default(),
            state: Mutex::new(EvmState {
                blocks: Blocks::new(),
                ledger: Ledger {
                    book: MarketBook::new(authority.to_lowercase(), fee),
                    balances: HashMap::new(),
                    allowances: HashMap::new(),
                    messages: BTreeMap::new(),
                    next_sequence: 0,
                    completed: HashSet::new(),
                    emitters: HashMap::new(),
                    approval_cap: None,
                },
                txs: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &PolygonConfig {
        &self.config
    }

    /// Trust attestations emitted by `emitter` on `chain`
    pub fn register_emitter(&self, chain: Chain, emitter: [u8; 32]) {
        self.state().ledger.emitters.insert(chain.wormhole_id(), emitter);
    }

    /// Approvals succeed but never grant more than `cap`
    pub fn cap_approvals(&self, cap: Option<u64>) {
        self.state().ledger.approval_cap = cap;
    }

    fn state(&self) -> MutexGuard<'_, EvmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_market(&self, commodity: &str, threshold_price: u64, target_date: i64) -> u64 {
        let now = self.clock.now();
        self.state().ledger.book.create(commodity, threshold_price, target_date, now)
    }

    pub fn mint(&self, address: &str, amount: u64) {
        let mut state = self.state();
        *state.ledger.balances.entry(address.to_lowercase()).or_default() += amount;
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.state()
            .ledger
            .balances
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn market_state(&self, market_id: u64) -> Option<SimMarket> {
        self.state().ledger.book.markets.get(&market_id).cloned()
    }

    /// Transactions executed successfully so far
    pub fn successful_transactions(&self) -> usize {
        self.state()
            .txs
            .values()
            .filter(|tx| tx.record.error.is_none())
            .count()
    }

    /// Stop finalizing blocks as they are produced
    pub fn set_auto_finalize(&self, auto_finalize: bool) {
        let mut state = self.state();
        state.blocks.auto_finalize = auto_finalize;
        if auto_finalize {
            state.blocks.finalize();
        }
    }

    pub fn finalize(&self) {
        self.state().blocks.finalize();
    }

    fn bridge_bytes(&self) -> [u8; 20] {
        abi::parse_address(&self.config.bridge_contract).unwrap_or_default()
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

fn arg<T>(value: Result<T, ChainError>) -> Result<T, String> {
    value.map_err(|e| e.to_string())
}

fn small_uint<T: TryFrom<u64>>(d: &Decoder<'_>, index: usize) -> Result<T, String> {
    T::try_from(arg(d.u64(index))?).map_err(|_| format!("argument {} out of range", index))
}

impl Ledger {
    fn balance_mut(&mut self, address: &str) -> &mut u64 {
        self.balances.entry(address.to_string()).or_default()
    }

    /// `transferFrom(owner, spender, amount)` on behalf of `spender`
    fn pull(&mut self, owner: &str, spender: &str, amount: u64) -> Result<(), String> {
        let allowance = self
            .allowances
            .get(&(owner.to_string(), spender.to_string()))
            .copied()
            .unwrap_or(0);
        if allowance < amount {
            return Err("ERC20: insufficient allowance".into());
        }
        let balance = self.balance_mut(owner);
        if *balance < amount {
            return Err("ERC20: transfer amount exceeds balance".into());
        }
        *balance -= amount;
        *self.balance_mut(spender) += amount;
        self.allowances
            .insert((owner.to_string(), spender.to_string()), allowance - amount);
        Ok(())
    }

    fn transfer(&mut self, from: &str, to: &str, amount: u64) -> Result<(), String> {
        let balance = self.balance_mut(from);
        if *balance < amount {
            return Err("ERC20: transfer amount exceeds balance".into());
        }
        *balance -= amount;
        *self.balance_mut(to) += amount;
        Ok(())
    }
}

impl SimulatedEvm {
    fn execute(&self, ledger: &mut Ledger, envelope: &Envelope, block: u64) -> Result<Vec<EvmLog>, String> {
        let request = match &envelope.request {
            TxRequest::Evm(request) => request,
            TxRequest::Solana(_) => return Err("not an EVM transaction".into()),
        };
        if request.chain_id != self.config.chain_id {
            return Err(format!("wrong chain id {}", request.chain_id));
        }
        let from = envelope.signer.to_lowercase();
        if request.from.to_lowercase() != from {
            return Err("sender does not match signature".into());
        }

        let (selector, args) = abi::split_call(&request.data).ok_or("empty calldata")?;
        let d = Decoder::new(args, "calldata");
        let to = request.to.to_lowercase();
        let market = self.config.market_contract.to_lowercase();
        let usdc = self.config.usdc.to_lowercase();
        let bridge = self.config.bridge_contract.to_lowercase();
        let now = self.clock.now();

        if to == usdc && selector == abi::selector(polygon::FN_APPROVE) {
            let spender = abi::format_address(&arg(d.address(0))?);
            let amount = u64::try_from(arg(d.uint(1))?).unwrap_or(u64::MAX);
            let amount = ledger.approval_cap.map_or(amount, |cap| amount.min(cap));
            ledger.allowances.insert((from, spender), amount);
            return Ok(Vec::new());
        }

        if to == market && selector == abi::selector(polygon::FN_STAKE) {
            let id = arg(d.u64(0))?;
            let side = Side::from_is_yes(arg(d.bool(1))?);
            let amount = arg(d.u64(2))?;
            ledger.pull(&from, &market, amount)?;
            ledger.book.stake(id, &from, side, amount, now)?;
            return Ok(Vec::new());
        }

        if to == market && selector == abi::selector(polygon::FN_CLAIM_WINNINGS) {
            let id = arg(d.u64(0))?;
            let payout = ledger.book.claim(id, &from)?;
            ledger.transfer(&market, &from, payout)?;
            return Ok(Vec::new());
        }

        if to == market && selector == abi::selector(polygon::FN_RESOLVE_PREDICTION) {
            let id = arg(d.u64(0))?;
            let price = arg(d.u64(1))?;
            ledger.book.resolve(id, &from, price, now)?;
            return Ok(Vec::new());
        }

        if to == bridge && selector == abi::selector(polygon::FN_BRIDGE_USDC) {
            let amount = arg(d.u64(0))?;
            let recipient = arg(d.bytes32(1))?;
            let recipient_chain: u16 = small_uint(&d, 2)?;
            let nonce: u32 = small_uint(&d, 3)?;
            if amount == 0 {
                return Err("amount must be positive".into());
            }
            ledger.pull(&from, &bridge, amount)?;

            let sequence = ledger.next_sequence;
            ledger.next_sequence += 1;
            let usdc_bytes = abi::parse_address(&usdc).map(|a| abi::address_to_bytes32(&a)).unwrap_or_default();
            ledger.messages.insert(
                sequence,
                PostedMessage {
                    sequence,
                    nonce,
                    timestamp: u32::try_from(now).unwrap_or(u32::MAX),
                    amount,
                    token_address: usdc_bytes,
                    recipient,
                    recipient_chain,
                    block,
                },
            );

            let sender = abi::parse_address(&from).ok_or("bad sender")?;
            let mut sequence_word = [0u8; 32];
            sequence_word[24..].copy_from_slice(&sequence.to_be_bytes());
            return Ok(vec![EvmLog {
                address: self.bridge_bytes(),
                topics: vec![
                    abi::event_topic(polygon::EVENT_TRANSFER_LOCKED),
                    sequence_word,
                    abi::address_to_bytes32(&sender),
                ],
                data: abi::encode(&[Token::Uint(amount as u128), Token::Bytes32(recipient)]),
            }]);
        }

        if to == bridge && selector == abi::selector(polygon::FN_COMPLETE_TRANSFER) {
            let vaa = arg(d.bytes(0))?;
            let attestation = Attestation::parse(&vaa).map_err(|e| e.to_string())?;
            attestation.verify(&self.guardian_set).map_err(|e| e.to_string())?;
            check_registered(&ledger.emitters, &attestation)?;
            let payload = attestation.transfer_payload().map_err(|e| e.to_string())?;
            if payload.recipient_chain != Chain::Polygon.wormhole_id() {
                return Err("transfer is not for this chain".into());
            }
            if !ledger.completed.insert(attestation.digest()) {
                return Err("transfer already completed".into());
            }
            let recipient = abi::bytes32_to_address(&payload.recipient).ok_or("recipient is not an EVM address")?;
            // wrapped USDC is minted on redemption
            *ledger.balance_mut(&abi::format_address(&recipient)) += payload.amount;
            return Ok(Vec::new());
        }

        Err(format!("unknown call to {}", to))
    }

    fn read(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, ChainError> {
        let (selector, args) = abi::split_call(data).ok_or_else(|| ChainError::InvalidResponse("empty calldata".into()))?;
        let d = Decoder::new(args, "calldata");
        let to = to.to_lowercase();
        let state = self.state();
        let ledger = &state.ledger;

        if to == self.config.market_contract.to_lowercase() {
            if selector == abi::selector(polygon::FN_PREDICTION_COUNT) {
                return Ok(abi::encode(&[Token::Uint(ledger.book.markets.len() as u128)]));
            }
            if selector == abi::selector(polygon::FN_GET_PREDICTION) {
                let id = d.u64(0)?;
                let m = ledger.book.markets.get(&id);
                return Ok(abi::encode(&[
                    Token::String(m.map(|m| m.commodity.clone()).unwrap_or_default()),
                    Token::Uint(m.map_or(0, |m| m.current_price) as u128),
                    Token::Uint(m.map_or(0, |m| m.threshold_price) as u128),
                    Token::Uint(m.map_or(0, |m| m.target_date.max(0) as u64) as u128),
                    Token::Uint(m.map_or(0, |m| m.confidence as u64) as u128),
                    Token::Uint(m.map_or(0, |m| m.yes_pool) as u128),
                    Token::Uint(m.map_or(0, |m| m.no_pool) as u128),
                    Token::Bool(m.map_or(false, |m| m.resolved)),
                    Token::Uint(m.map_or(0, |m| m.actual_price) as u128),
                ]));
            }
            if selector == abi::selector(polygon::FN_GET_POSITION) {
                let id = d.u64(0)?;
                let user = abi::format_address(&d.address(1)?);
                let p = ledger.book.position(id, &user).cloned().unwrap_or_default();
                return Ok(abi::encode(&[
                    Token::Uint(p.yes_amount as u128),
                    Token::Uint(p.no_amount as u128),
                    Token::Bool(p.claimed),
                ]));
            }
        }

        if to == self.config.usdc.to_lowercase() {
            if selector == abi::selector(polygon::FN_ALLOWANCE) {
                let owner = abi::format_address(&d.address(0)?);
                let spender = abi::format_address(&d.address(1)?);
                let allowance = ledger.allowances.get(&(owner, spender)).copied().unwrap_or(0);
                return Ok(abi::encode(&[Token::Uint(allowance as u128)]));
            }
            if selector == abi::selector(polygon::FN_BALANCE_OF) {
                let owner = abi::format_address(&d.address(0)?);
                let balance = ledger.balances.get(&owner).copied().unwrap_or(0);
                return Ok(abi::encode(&[Token::Uint(balance as u128)]));
            }
        }

        if to == self.config.bridge_contract.to_lowercase() && selector == abi::selector(polygon::FN_IS_TRANSFER_COMPLETED) {
            let digest = d.bytes32(0)?;
            return Ok(abi::encode(&[Token::Bool(ledger.completed.contains(&digest))]));
        }

        Err(ChainError::InvalidResponse(format!("execution reverted: unknown call to {}", to)))
    }
}

// ============================================================================
// RPC SURFACE
// ============================================================================

#[async_trait]
impl EvmRpc for SimulatedEvm {
    async fn call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, ChainError> {
        self.faults.check("eth_call")?;
        self.read(to, data)
    }

    async fn send_raw_transaction(&self, signed: &SignedTx) -> Result<TxRef, ChainError> {
        self.faults.check("eth_sendRawTransaction")?;
        let envelope = Envelope::decode(Chain::Polygon, &signed.raw)?;
        let tx_ref = tx_ref_for(Chain::Polygon, &signed.raw);

        {
            let mut state = self.state();
            if state.txs.contains_key(tx_ref.as_str()) {
                return Err(ChainError::InvalidResponse("already known".into()));
            }
            let block = state.blocks.next();
            let mut ledger = state.ledger.clone();
            let (error, logs) = match self.execute(&mut ledger, &envelope, block) {
                Ok(logs) => {
                    state.ledger = ledger;
                    (None, logs)
                }
                Err(reason) => (Some(reason), Vec::new()),
            };
            debug!(tx = %tx_ref, block, reverted = ?error, "simulated evm executed transaction");
            state.txs.insert(
                tx_ref.as_str().to_string(),
                SimTx {
                    record: TxRecord {
                        block,
                        error,
                        pending_polls: self.faults.pending_polls(),
                    },
                    logs,
                },
            );
        }

        if self.faults.take_lost_broadcast() {
            return Err(ChainError::Rpc("eth_sendRawTransaction: connection reset".into()));
        }
        Ok(tx_ref)
    }

    async fn transaction_known(&self, tx_ref: &TxRef) -> Result<bool, ChainError> {
        self.faults.check("eth_getTransactionByHash")?;
        Ok(self.state().txs.contains_key(tx_ref.as_str()))
    }

    async fn receipt(&self, tx_ref: &TxRef) -> Result<Option<EvmReceipt>, ChainError> {
        self.faults.check("eth_getTransactionReceipt")?;
        if self.faults.stalled() {
            return Ok(None);
        }
        let mut state = self.state();
        let tx = match state.txs.get_mut(tx_ref.as_str()) {
            Some(tx) => tx,
            None => return Ok(None),
        };
        if tx.record.pending_polls > 0 {
            tx.record.pending_polls -= 1;
            return Ok(None);
        }
        Ok(Some(EvmReceipt {
            block_number: tx.record.block,
            success: tx.record.error.is_none(),
            logs: tx.logs.clone(),
        }))
    }

    async fn finalized_block(&self) -> Result<u64, ChainError> {
        self.faults.check("eth_getBlockByNumber")?;
        Ok(self.state().blocks.finalized)
    }
}

impl MessageSource for SimulatedEvm {
    fn chain(&self) -> Chain {
        Chain::Polygon
    }

    fn emitter(&self) -> [u8; 32] {
        abi::address_to_bytes32(&self.bridge_bytes())
    }

    fn message(&self, sequence: u64) -> Option<(PostedMessage, bool)> {
        let state = self.state();
        let message = state.ledger.messages.get(&sequence)?.clone();
        let is_final = state.blocks.is_final(message.block);
        Some((message, is_final))
    }
}
