use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::wallet::tx_ref_for;
use super::{check_registered, Blocks, Envelope, Faults, MarketBook, MessageSource, PostedMessage, SimMarket, TxRecord};
use crate::amm::FeeRate;
use crate::bridge::attestation::{Attestation, GuardianSet};
use crate::chain::solana::{
    self as sol, associated_token_address, encode_token_account, instruction_discriminator, Commitment, ConfigAccount,
    MarketAccount, MessageAccount, PositionAccount, Pubkey, SolanaConfig, SolanaRpc, ASSOCIATED_TOKEN_PROGRAM_ID,
};
use crate::chain::{Instruction, SignedTx, TxRequest, TxStatus};
use crate::clock::Clock;
use crate::error::ChainError;
use crate::models::{Chain, Side, TxRef};

fn program_id(label: &str) -> Pubkey {
    Pubkey::new(Sha256::digest(format!("program:{}", label).as_bytes()).into())
}

pub fn default_config() -> SolanaConfig {
    SolanaConfig {
        market_program: program_id("prediction-market"),
        bridge_program: program_id("token-bridge"),
        usdc_mint: program_id("usdc-mint"),
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TokenAccount {
    owner: Pubkey,
    amount: u64,
}

/// Program-owned accounts by address
#[derive(Debug, Clone)]
enum Owned {
    Config,
    Market(u64),
    Position(u64, Pubkey),
}

#[derive(Debug, Clone)]
struct Ledger {
    book: MarketBook,
    authority: Pubkey,
    index: HashMap<Pubkey, Owned>,
    tokens: HashMap<Pubkey, TokenAccount>,
    messages: HashMap<Pubkey, (MessageAccount, PostedMessage)>,
    by_sequence: BTreeMap<u64, Pubkey>,
    next_sequence: u64,
    claims: HashSet<Pubkey>,
    /// Foreign bridge emitters by wormhole chain id
    emitters: HashMap<u16, [u8; 32]>,
}

struct SolanaState {
    blocks: Blocks,
    ledger: Ledger,
    signatures: HashMap<String, TxRecord>,
}

/// Simulated validator running the market and bridge programs
pub struct SimulatedSolana {
    config: SolanaConfig,
    clock: Arc<dyn Clock>,
    guardian_set: GuardianSet,
    pub faults: Faults,
    state: Mutex<SolanaState>,
}

impl SimulatedSolana {
    pub fn new(
        config: SolanaConfig,
        clock: Arc<dyn Clock>,
        guardian_set: GuardianSet,
        authority: Pubkey,
        fee: FeeRate,
    ) -> Self {
        let mut ledger = Ledger {
            book: MarketBook::new(authority.to_string(), fee),
            authority,
            index: HashMap::new(),
            tokens: HashMap::new(),
            messages: HashMap::new(),
            by_sequence: BTreeMap::new(),
            next_sequence: 0,
            claims: HashSet::new(),
            emitters: HashMap::new(),
        };
        ledger.index.insert(config.config_address().unwrap_or_default(), Owned::Config);
        for (owner, ata) in [
            (config.config_address(), config.vault_address()),
            (config.emitter_address(), config.custody_address()),
        ] {
            ledger.tokens.insert(
                ata.unwrap_or_default(),
                TokenAccount {
                    owner: owner.unwrap_or_default(),
                    amount: 0,
                },
            );
        }

        Self {
            config,
            clock,
            guardian_set,
            faults: Faults::default(),
            state: Mutex::new(SolanaState {
                blocks: Blocks::new(),
                ledger,
                signatures: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SolanaConfig {
        &self.config
    }

    /// Trust attestations emitted by `emitter` on `chain`
    pub fn register_emitter(&self, chain: Chain, emitter: [u8; 32]) {
        self.state().ledger.emitters.insert(chain.wormhole_id(), emitter);
    }

    fn state(&self) -> MutexGuard<'_, SolanaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_market(&self, commodity: &str, threshold_price: u64, target_date: i64) -> u64 {
        let now = self.clock.now();
        let mut state = self.state();
        let id = state.ledger.book.create(commodity, threshold_price, target_date, now);
        let address = self.config.market_address(id).unwrap_or_default();
        state.ledger.index.insert(address, Owned::Market(id));
        id
    }

    /// Credit `owner`'s USDC account, creating it if needed
    pub fn mint(&self, owner: &Pubkey, amount: u64) {
        let ata = self.config.user_token_address(owner).unwrap_or_default();
        let mut state = self.state();
        state
            .ledger
            .tokens
            .entry(ata)
            .or_insert(TokenAccount {
                owner: *owner,
                amount: 0,
            })
            .amount += amount;
    }

    /// `None` while the owner has no USDC account
    pub fn token_balance(&self, owner: &Pubkey) -> Option<u64> {
        let ata = self.config.user_token_address(owner).ok()?;
        self.state().ledger.tokens.get(&ata).map(|t| t.amount)
    }

    pub fn market_state(&self, market_id: u64) -> Option<SimMarket> {
        self.state().ledger.book.markets.get(&market_id).cloned()
    }

    pub fn successful_transactions(&self) -> usize {
        self.state()
            .signatures
            .values()
            .filter(|tx| tx.error.is_none())
            .count()
    }

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
}

// ============================================================================
// INSTRUCTION EXECUTION
// ============================================================================

fn account(ix: &Instruction, index: usize) -> Result<Pubkey, String> {
    ix.accounts
        .get(index)
        .map(|meta| meta.pubkey)
        .ok_or_else(|| format!("missing account {}", index))
}

fn le<const N: usize>(data: &[u8], at: usize) -> Result<[u8; N], String> {
    let slice = data.get(at..at + N).ok_or("instruction data too short")?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn expect_address(actual: Pubkey, expected: Result<Pubkey, crate::error::EngineError>, what: &str) -> Result<(), String> {
    match expected {
        Ok(expected) if expected == actual => Ok(()),
        _ => Err(format!("{}: address constraint violated", what)),
    }
}

impl Ledger {
    fn market_id(&self, address: &Pubkey) -> Result<u64, String> {
        match self.index.get(address) {
            Some(Owned::Market(id)) => Ok(*id),
            _ => Err("AccountNotInitialized: market".into()),
        }
    }

    fn move_tokens(&mut self, from: &Pubkey, to: &Pubkey, amount: u64) -> Result<(), String> {
        if !self.tokens.contains_key(to) {
            return Err("AccountNotInitialized: destination token account".into());
        }
        let source = self
            .tokens
            .get_mut(from)
            .ok_or("AccountNotInitialized: source token account")?;
        if source.amount < amount {
            return Err("insufficient funds".into());
        }
        source.amount -= amount;
        if let Some(dest) = self.tokens.get_mut(to) {
            dest.amount += amount;
        }
        Ok(())
    }
}

impl SimulatedSolana {
    fn execute(&self, ledger: &mut Ledger, ix: &Instruction, signer: &Pubkey, block: u64) -> Result<(), String> {
        for meta in ix.accounts.iter().filter(|m| m.is_signer) {
            if meta.pubkey != *signer {
                return Err(format!("missing signature for {}", meta.pubkey));
            }
        }

        if ix.program_id == ASSOCIATED_TOKEN_PROGRAM_ID {
            let ata = account(ix, 1)?;
            let owner = account(ix, 2)?;
            let mint = account(ix, 3)?;
            if mint != self.config.usdc_mint {
                return Err("unknown mint".into());
            }
            expect_address(ata, associated_token_address(&owner, &mint), "associated token account")?;
            ledger.tokens.entry(ata).or_insert(TokenAccount { owner, amount: 0 });
            return Ok(());
        }

        let discriminator: [u8; 8] = le(&ix.data, 0)?;
        let now = self.clock.now();

        if ix.program_id == self.config.market_program {
            if discriminator == instruction_discriminator(sol::IX_PLACE_STAKE) {
                let market = account(ix, 0)?;
                let position = account(ix, 1)?;
                let user_tokens = account(ix, 2)?;
                let vault = account(ix, 3)?;
                let user = account(ix, 4)?;
                let id = ledger.market_id(&market)?;
                expect_address(position, self.config.position_address(&market, &user), "position")?;
                expect_address(user_tokens, self.config.user_token_address(&user), "user token account")?;
                expect_address(vault, self.config.vault_address(), "vault")?;

                let amount = u64::from_le_bytes(le(&ix.data, 8)?);
                let side = Side::from_is_yes(le::<1>(&ix.data, 16)?[0] != 0);
                ledger.book.stake(id, &user.to_string(), side, amount, now)?;
                ledger.move_tokens(&user_tokens, &vault, amount)?;
                ledger.index.insert(position, Owned::Position(id, user));
                return Ok(());
            }

            if discriminator == instruction_discriminator(sol::IX_CLAIM_WINNINGS) {
                let market = account(ix, 0)?;
                let vault = account(ix, 2)?;
                let user_tokens = account(ix, 3)?;
                let user = account(ix, 5)?;
                let id = ledger.market_id(&market)?;
                expect_address(user_tokens, self.config.user_token_address(&user), "user token account")?;
                if !ledger.tokens.contains_key(&user_tokens) {
                    return Err("AccountNotInitialized: user token account".into());
                }
                let payout = ledger.book.claim(id, &user.to_string())?;
                ledger.move_tokens(&vault, &user_tokens, payout)?;
                return Ok(());
            }

            if discriminator == instruction_discriminator(sol::IX_RESOLVE_MARKET) {
                let market = account(ix, 0)?;
                let authority = account(ix, 3)?;
                let id = ledger.market_id(&market)?;
                if authority != ledger.authority {
                    return Err("ConstraintHasOne: authority".into());
                }
                let price = u64::from_le_bytes(le(&ix.data, 8)?);
                ledger.book.resolve(id, &authority.to_string(), price, now)?;
                return Ok(());
            }
        }

        if ix.program_id == self.config.bridge_program {
            if discriminator == instruction_discriminator(sol::IX_TRANSFER_TOKENS) {
                let sender = account(ix, 0)?;
                let sender_tokens = account(ix, 1)?;
                let custody = account(ix, 2)?;
                let message = account(ix, 4)?;
                let amount = u64::from_le_bytes(le(&ix.data, 8)?);
                let recipient: [u8; 32] = le(&ix.data, 16)?;
                let recipient_chain = u16::from_le_bytes(le(&ix.data, 48)?);
                let nonce = u32::from_le_bytes(le(&ix.data, 50)?);

                expect_address(message, self.config.message_address(&sender, nonce), "message")?;
                expect_address(custody, self.config.custody_address(), "custody")?;
                if ledger.messages.contains_key(&message) {
                    return Err("message account already in use".into());
                }
                if amount == 0 {
                    return Err("amount must be positive".into());
                }
                ledger.move_tokens(&sender_tokens, &custody, amount)?;

                let sequence = ledger.next_sequence;
                ledger.next_sequence += 1;
                let emitter = self.config.emitter_address().map_err(|e| e.to_string())?;
                let message_account = MessageAccount {
                    sequence,
                    emitter: emitter.to_bytes(),
                    sender,
                    amount,
                    recipient,
                    recipient_chain,
                    nonce,
                };
                let posted = PostedMessage {
                    sequence,
                    nonce,
                    timestamp: u32::try_from(now).unwrap_or(u32::MAX),
                    amount,
                    token_address: self.config.usdc_mint.to_bytes(),
                    recipient,
                    recipient_chain,
                    block,
                };
                ledger.messages.insert(message, (message_account, posted));
                ledger.by_sequence.insert(sequence, message);
                return Ok(());
            }

            if discriminator == instruction_discriminator(sol::IX_COMPLETE_TRANSFER) {
                let claim = account(ix, 1)?;
                let recipient_tokens = account(ix, 4)?;
                let recipient = account(ix, 5)?;
                let len = u32::from_le_bytes(le(&ix.data, 8)?) as usize;
                let vaa = ix.data.get(12..12 + len).ok_or("instruction data too short")?;

                let attestation = Attestation::parse(vaa).map_err(|e| e.to_string())?;
                attestation.verify(&self.guardian_set).map_err(|e| e.to_string())?;
                check_registered(&ledger.emitters, &attestation)?;
                let payload = attestation.transfer_payload().map_err(|e| e.to_string())?;
                if payload.recipient_chain != Chain::Solana.wormhole_id() {
                    return Err("transfer is not for this chain".into());
                }
                if Pubkey::new(payload.recipient) != recipient {
                    return Err("recipient does not match payload".into());
                }
                expect_address(claim, self.config.claim_address(&attestation.digest()), "claim")?;
                expect_address(recipient_tokens, self.config.user_token_address(&recipient), "recipient token account")?;
                if !ledger.claims.insert(claim) {
                    return Err("transfer already completed".into());
                }
                // wrapped USDC is minted on redemption
                ledger
                    .tokens
                    .get_mut(&recipient_tokens)
                    .ok_or("AccountNotInitialized: recipient token account")?
                    .amount += payload.amount;
                return Ok(());
            }
        }

        Err(format!("unknown instruction for program {}", ix.program_id))
    }

    fn encode_account(&self, state: &SolanaState, address: &Pubkey, commitment: Commitment) -> Option<Vec<u8>> {
        let ledger = &state.ledger;
        match ledger.index.get(address) {
            Some(Owned::Config) => {
                return Some(
                    ConfigAccount {
                        authority: ledger.authority,
                        market_count: ledger.book.markets.len() as u64,
                        fee_bps: ledger.book.fee.bps() as u16,
                    }
                    .encode(),
                )
            }
            Some(Owned::Market(id)) => {
                let m = ledger.book.markets.get(id)?;
                let outcome = match m.outcome() {
                    None => 0,
                    Some(Side::Yes) => 1,
                    Some(Side::No) => 2,
                };
                return Some(
                    MarketAccount {
                        market_id: m.id,
                        commodity: m.commodity.clone(),
                        threshold_price: m.threshold_price,
                        target_date: m.target_date,
                        created_at: m.created_at,
                        yes_pool: m.yes_pool,
                        no_pool: m.no_pool,
                        resolved: m.resolved,
                        outcome,
                        resolved_at: m.resolved_at,
                        oracle_price: m.actual_price,
                    }
                    .encode(),
                );
            }
            Some(Owned::Position(id, user)) => {
                let p = ledger.book.position(*id, &user.to_string())?;
                return Some(
                    PositionAccount {
                        user: *user,
                        market_id: *id,
                        yes_amount: p.yes_amount,
                        no_amount: p.no_amount,
                        claimed: p.claimed,
                    }
                    .encode(),
                );
            }
            None => {}
        }

        if let Some(token) = ledger.tokens.get(address) {
            return Some(encode_token_account(&self.config.usdc_mint, &token.owner, token.amount));
        }
        if let Some((message, posted)) = ledger.messages.get(address) {
            if commitment == Commitment::Finalized && !state.blocks.is_final(posted.block) {
                return None;
            }
            return Some(message.encode());
        }
        if ledger.claims.contains(address) {
            return Some(vec![1]);
        }
        None
    }
}

// ============================================================================
// RPC SURFACE
// ============================================================================

#[async_trait]
impl SolanaRpc for SimulatedSolana {
    async fn account_data(&self, address: &Pubkey, commitment: Commitment) -> Result<Option<Vec<u8>>, ChainError> {
        self.faults.check("getAccountInfo")?;
        let state = self.state();
        Ok(self.encode_account(&state, address, commitment))
    }

    async fn latest_blockhash(&self) -> Result<String, ChainError> {
        self.faults.check("getLatestBlockhash")?;
        let height = self.state().blocks.height;
        Ok(bs58::encode(Sha256::digest(format!("blockhash:{}", height).as_bytes())).into_string())
    }

    async fn send_transaction(&self, signed: &SignedTx) -> Result<TxRef, ChainError> {
        self.faults.check("sendTransaction")?;
        let envelope = Envelope::decode(Chain::Solana, &signed.raw)?;
        let signature = tx_ref_for(Chain::Solana, &signed.raw);
        let request = match &envelope.request {
            TxRequest::Solana(request) => request,
            TxRequest::Evm(_) => return Err(ChainError::InvalidResponse("not a Solana transaction".into())),
        };
        let signer: Pubkey = envelope
            .signer
            .parse()
            .map_err(|_| ChainError::InvalidResponse("invalid signer".into()))?;
        if request.fee_payer != signer {
            return Err(ChainError::InvalidResponse("fee payer did not sign".into()));
        }

        {
            let mut state = self.state();
            if state.signatures.contains_key(signature.as_str()) {
                return Err(ChainError::InvalidResponse("This transaction has already been processed".into()));
            }
            let block = state.blocks.next();
            let mut ledger = state.ledger.clone();
            let mut error = None;
            for ix in &request.instructions {
                if let Err(reason) = self.execute(&mut ledger, ix, &signer, block) {
                    error = Some(reason);
                    break;
                }
            }
            if error.is_none() {
                state.ledger = ledger;
            }
            debug!(signature = %signature, slot = block, failed = ?error, "simulated validator executed transaction");
            state.signatures.insert(
                signature.as_str().to_string(),
                TxRecord {
                    block,
                    error,
                    pending_polls: self.faults.pending_polls(),
                },
            );
        }

        if self.faults.take_lost_broadcast() {
            return Err(ChainError::Rpc("sendTransaction: connection reset".into()));
        }
        Ok(signature)
    }

    async fn signature_status(&self, signature: &TxRef) -> Result<TxStatus, ChainError> {
        self.faults.check("getSignatureStatuses")?;
        let mut state = self.state();
        let finalized = state.blocks.finalized;
        let record = match state.signatures.get_mut(signature.as_str()) {
            Some(record) => record,
            None => return Ok(TxStatus::Unknown),
        };
        if self.faults.stalled() {
            return Ok(TxStatus::Pending);
        }
        if record.pending_polls > 0 {
            record.pending_polls -= 1;
            return Ok(TxStatus::Pending);
        }
        if let Some(reason) = &record.error {
            return Ok(TxStatus::Failed { reason: reason.clone() });
        }
        Ok(if record.block <= finalized {
            TxStatus::Finalized { block: record.block }
        } else {
            TxStatus::Confirmed { block: record.block }
        })
    }
}

impl MessageSource for SimulatedSolana {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn emitter(&self) -> [u8; 32] {
        self.config.emitter_address().unwrap_or_default().to_bytes()
    }

    fn message(&self, sequence: u64) -> Option<(PostedMessage, bool)> {
        let state = self.state();
        let address = state.ledger.by_sequence.get(&sequence)?;
        let (_, posted) = state.ledger.messages.get(address)?;
        Some((posted.clone(), state.blocks.is_final(posted.block)))
    }
}
