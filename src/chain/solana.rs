//! Account-model chain adapter.
//!
//! Markets, positions and bridge messages live in program-derived accounts
//! (PDAs). Instructions carry Anchor-style 8-byte discriminators
//! (`sha256("global:<name>")[..8]`), account data starts with
//! `sha256("account:<Name>")[..8]` followed by little-endian fields.
//! USDC moves through associated token accounts (ATAs), created lazily for
//! recipients.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::rpc::{is_already_known, JsonRpcClient};
use super::{
    ensure_signer_chain, submit_and_confirm, AccountMeta, ChainAdapter, Confirmation, ConfirmationPolicy, Finality,
    Instruction, SignedTx, Signer, SolanaTxRequest, TxRequest, TxStatus, TxTransport,
};
use crate::bridge::attestation::Attestation;
use crate::bridge::{BridgeEndpoint, BridgeRequest, SourceState};
use crate::error::{AttestationError, ChainError, EngineError, Result, ValidationError};
use crate::models::{Chain, Market, MarketKey, Position, Side, TxRef};
use crate::retry::RetryPolicy;

// ============================================================================
// PUBKEY & PROGRAM-DERIVED ADDRESSES
// ============================================================================

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
pub const MAX_SEED_LEN: usize = 32;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pubkey([u8; 32]);

/// System program (all zeroes, "111…1")
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey([0u8; 32]);

/// SPL token program, TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA
pub const TOKEN_PROGRAM_ID: Pubkey = Pubkey([
    6, 221, 246, 225, 215, 101, 161, 147, 217, 203, 225, 70, 206, 235, 121, 172, 28, 180, 133, 237, 95, 91, 55, 145, 58,
    140, 245, 133, 126, 255, 0, 169,
]);

/// Associated token account program, ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey = Pubkey([
    140, 151, 37, 143, 78, 36, 137, 241, 187, 61, 16, 41, 20, 142, 13, 131, 11, 90, 19, 153, 218, 255, 16, 132, 4, 142,
    123, 216, 219, 233, 248, 89,
]);

impl Pubkey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Pubkey(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes decompress to an ed25519 point (PDAs must not)
    pub fn is_on_curve(&self) -> bool {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).is_ok()
    }

    pub fn create_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Option<Pubkey> {
        if seeds.iter().any(|s| s.len() > MAX_SEED_LEN) {
            return None;
        }
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update(program_id.0);
        hasher.update(PDA_MARKER);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());

        let candidate = Pubkey(bytes);
        if candidate.is_on_curve() {
            None
        } else {
            Some(candidate)
        }
    }

    /// First off-curve address searching bump seeds from 255 down
    pub fn find_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Option<(Pubkey, u8)> {
        for bump in (0..=u8::MAX).rev() {
            let bump_seed = [bump];
            let mut with_bump = seeds.to_vec();
            with_bump.push(&bump_seed);
            if let Some(address) = Self::create_program_address(&with_bump, program_id) {
                return Some((address, bump));
            }
        }
        None
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidAddress {
            chain: Chain::Solana,
            address: s.to_string(),
        };
        let bytes = bs58::decode(s).into_vec().map_err(|_| invalid())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Pubkey(bytes))
    }
}

fn pda(seeds: &[&[u8]], program_id: &Pubkey) -> Result<Pubkey> {
    Pubkey::find_program_address(seeds, program_id)
        .map(|(address, _)| address)
        .ok_or_else(|| EngineError::chain(Chain::Solana, ChainError::decode("pda", "no viable bump seed")))
}

/// Deployed program and mint addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolanaConfig {
    pub market_program: Pubkey,
    pub bridge_program: Pubkey,
    pub usdc_mint: Pubkey,
}

impl SolanaConfig {
    pub fn market_address(&self, market_id: u64) -> Result<Pubkey> {
        pda(&[b"market", &market_id.to_le_bytes()], &self.market_program)
    }

    pub fn position_address(&self, market: &Pubkey, user: &Pubkey) -> Result<Pubkey> {
        pda(&[b"position", market.as_bytes(), user.as_bytes()], &self.market_program)
    }

    pub fn config_address(&self) -> Result<Pubkey> {
        pda(&[b"config"], &self.market_program)
    }

    pub fn price_address(&self, commodity: &str) -> Result<Pubkey> {
        pda(&[b"price", &commodity_bytes(commodity)], &self.market_program)
    }

    /// Market vault: the config PDA's USDC account
    pub fn vault_address(&self) -> Result<Pubkey> {
        associated_token_address(&self.config_address()?, &self.usdc_mint)
    }

    pub fn emitter_address(&self) -> Result<Pubkey> {
        pda(&[b"emitter"], &self.bridge_program)
    }

    pub fn custody_address(&self) -> Result<Pubkey> {
        associated_token_address(&self.emitter_address()?, &self.usdc_mint)
    }

    pub fn message_address(&self, sender: &Pubkey, nonce: u32) -> Result<Pubkey> {
        pda(&[b"message", sender.as_bytes(), &nonce.to_le_bytes()], &self.bridge_program)
    }

    /// Exists once an attestation with this digest has been redeemed
    pub fn claim_address(&self, digest: &[u8; 32]) -> Result<Pubkey> {
        pda(&[b"claim", digest], &self.bridge_program)
    }

    pub fn user_token_address(&self, owner: &Pubkey) -> Result<Pubkey> {
        associated_token_address(owner, &self.usdc_mint)
    }
}

pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Result<Pubkey> {
    pda(
        &[owner.as_bytes(), TOKEN_PROGRAM_ID.as_bytes(), mint.as_bytes()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
}

// ============================================================================
// DISCRIMINATORS & INSTRUCTIONS
// ============================================================================

fn sha256_prefix(preimage: &str) -> [u8; 8] {
    let hash = Sha256::digest(preimage.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    sha256_prefix(&format!("global:{}", name))
}

pub fn account_discriminator(name: &str) -> [u8; 8] {
    sha256_prefix(&format!("account:{}", name))
}

pub const IX_PLACE_STAKE: &str = "place_stake";
pub const IX_CLAIM_WINNINGS: &str = "claim_winnings";
pub const IX_RESOLVE_MARKET: &str = "resolve_market";
pub const IX_TRANSFER_TOKENS: &str = "transfer_tokens";
pub const IX_COMPLETE_TRANSFER: &str = "complete_transfer";

/// CreateIdempotent: succeeds when the account already exists
const ATA_CREATE_IDEMPOTENT: u8 = 1;

pub fn commodity_bytes(commodity: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = commodity.as_bytes();
    let len = bytes.len().min(32);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn commodity_string(bytes: &[u8; 32]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn create_token_account_ix(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Result<Instruction> {
    Ok(Instruction {
        program_id: ASSOCIATED_TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::writable(*payer, true),
            AccountMeta::writable(associated_token_address(owner, mint)?, false),
            AccountMeta::readonly(*owner, false),
            AccountMeta::readonly(*mint, false),
            AccountMeta::readonly(SYSTEM_PROGRAM_ID, false),
            AccountMeta::readonly(TOKEN_PROGRAM_ID, false),
        ],
        data: vec![ATA_CREATE_IDEMPOTENT],
    })
}

impl SolanaConfig {
    pub fn place_stake_ix(&self, market_id: u64, user: &Pubkey, side: Side, amount: u64) -> Result<Instruction> {
        let market = self.market_address(market_id)?;
        let mut data = instruction_discriminator(IX_PLACE_STAKE).to_vec();
        data.extend_from_slice(&amount.to_le_bytes());
        data.push(side.is_yes() as u8);

        Ok(Instruction {
            program_id: self.market_program,
            accounts: vec![
                AccountMeta::writable(market, false),
                AccountMeta::writable(self.position_address(&market, user)?, false),
                AccountMeta::writable(self.user_token_address(user)?, false),
                AccountMeta::writable(self.vault_address()?, false),
                AccountMeta::writable(*user, true),
                AccountMeta::readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::readonly(SYSTEM_PROGRAM_ID, false),
            ],
            data,
        })
    }

    pub fn claim_ix(&self, market_id: u64, user: &Pubkey) -> Result<Instruction> {
        let market = self.market_address(market_id)?;
        Ok(Instruction {
            program_id: self.market_program,
            accounts: vec![
                AccountMeta::writable(market, false),
                AccountMeta::writable(self.position_address(&market, user)?, false),
                AccountMeta::writable(self.vault_address()?, false),
                AccountMeta::writable(self.user_token_address(user)?, false),
                AccountMeta::readonly(self.config_address()?, false),
                AccountMeta::writable(*user, true),
                AccountMeta::readonly(TOKEN_PROGRAM_ID, false),
            ],
            data: instruction_discriminator(IX_CLAIM_WINNINGS).to_vec(),
        })
    }

    pub fn resolve_ix(&self, market_id: u64, commodity: &str, authority: &Pubkey, actual_price: u64) -> Result<Instruction> {
        let mut data = instruction_discriminator(IX_RESOLVE_MARKET).to_vec();
        data.extend_from_slice(&actual_price.to_le_bytes());
        Ok(Instruction {
            program_id: self.market_program,
            accounts: vec![
                AccountMeta::writable(self.market_address(market_id)?, false),
                AccountMeta::readonly(self.price_address(commodity)?, false),
                AccountMeta::readonly(self.config_address()?, false),
                AccountMeta::readonly(*authority, true),
            ],
            data,
        })
    }

    pub fn transfer_tokens_ix(
        &self,
        sender: &Pubkey,
        amount: u64,
        recipient: [u8; 32],
        recipient_chain: u16,
        nonce: u32,
    ) -> Result<Instruction> {
        let mut data = instruction_discriminator(IX_TRANSFER_TOKENS).to_vec();
        data.extend_from_slice(&amount.to_le_bytes());
        data.extend_from_slice(&recipient);
        data.extend_from_slice(&recipient_chain.to_le_bytes());
        data.extend_from_slice(&nonce.to_le_bytes());

        Ok(Instruction {
            program_id: self.bridge_program,
            accounts: vec![
                AccountMeta::writable(*sender, true),
                AccountMeta::writable(self.user_token_address(sender)?, false),
                AccountMeta::writable(self.custody_address()?, false),
                AccountMeta::readonly(self.emitter_address()?, false),
                AccountMeta::writable(self.message_address(sender, nonce)?, false),
                AccountMeta::readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::readonly(SYSTEM_PROGRAM_ID, false),
            ],
            data,
        })
    }

    pub fn complete_transfer_ix(&self, payer: &Pubkey, recipient: &Pubkey, vaa: &[u8], digest: &[u8; 32]) -> Result<Instruction> {
        let mut data = instruction_discriminator(IX_COMPLETE_TRANSFER).to_vec();
        data.extend_from_slice(&(vaa.len() as u32).to_le_bytes());
        data.extend_from_slice(vaa);

        Ok(Instruction {
            program_id: self.bridge_program,
            accounts: vec![
                AccountMeta::writable(*payer, true),
                AccountMeta::writable(self.claim_address(digest)?, false),
                AccountMeta::writable(self.custody_address()?, false),
                AccountMeta::readonly(self.emitter_address()?, false),
                AccountMeta::writable(self.user_token_address(recipient)?, false),
                AccountMeta::readonly(*recipient, false),
                AccountMeta::readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::readonly(SYSTEM_PROGRAM_ID, false),
            ],
            data,
        })
    }
}

// ============================================================================
// ACCOUNT LAYOUTS
// ============================================================================

struct LayoutReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> LayoutReader<'a> {
    fn new(data: &'a [u8], what: &'static str, discriminator: [u8; 8]) -> std::result::Result<Self, ChainError> {
        if data.len() < 8 || data[..8] != discriminator {
            return Err(ChainError::decode(what, "discriminator mismatch"));
        }
        Ok(Self { data, pos: 8, what })
    }

    fn bytes<const N: usize>(&mut self) -> std::result::Result<[u8; N], ChainError> {
        let slice = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| ChainError::decode(self.what, format!("truncated at offset {}", self.pos)))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, ChainError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, ChainError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> std::result::Result<u32, ChainError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> std::result::Result<u64, ChainError> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn i64(&mut self) -> std::result::Result<i64, ChainError> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    fn pubkey(&mut self) -> std::result::Result<Pubkey, ChainError> {
        Ok(Pubkey(self.bytes()?))
    }
}

/// `Market` account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketAccount {
    pub market_id: u64,
    pub commodity: String,
    pub threshold_price: u64,
    pub target_date: i64,
    pub created_at: i64,
    pub yes_pool: u64,
    pub no_pool: u64,
    pub resolved: bool,
    /// 0 = unresolved, 1 = yes, 2 = no
    pub outcome: u8,
    pub resolved_at: i64,
    pub oracle_price: u64,
}

impl MarketAccount {
    pub const NAME: &'static str = "Market";

    pub fn decode(data: &[u8]) -> std::result::Result<Self, ChainError> {
        let mut r = LayoutReader::new(data, "market account", account_discriminator(Self::NAME))?;
        Ok(Self {
            market_id: r.u64()?,
            commodity: commodity_string(&r.bytes()?),
            threshold_price: r.u64()?,
            target_date: r.i64()?,
            created_at: r.i64()?,
            yes_pool: r.u64()?,
            no_pool: r.u64()?,
            resolved: r.u8()? != 0,
            outcome: r.u8()?,
            resolved_at: r.i64()?,
            oracle_price: r.u64()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = account_discriminator(Self::NAME).to_vec();
        out.extend_from_slice(&self.market_id.to_le_bytes());
        out.extend_from_slice(&commodity_bytes(&self.commodity));
        out.extend_from_slice(&self.threshold_price.to_le_bytes());
        out.extend_from_slice(&self.target_date.to_le_bytes());
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&self.yes_pool.to_le_bytes());
        out.extend_from_slice(&self.no_pool.to_le_bytes());
        out.push(self.resolved as u8);
        out.push(self.outcome);
        out.extend_from_slice(&self.resolved_at.to_le_bytes());
        out.extend_from_slice(&self.oracle_price.to_le_bytes());
        out
    }

    pub fn into_market(self, key: MarketKey) -> Market {
        let outcome = match (self.resolved, self.outcome) {
            (true, 1) => Some(Side::Yes),
            (true, 2) => Some(Side::No),
            _ => None,
        };
        Market {
            key,
            commodity: self.commodity,
            threshold_price: self.threshold_price,
            current_price: None,
            target_date: self.target_date,
            yes_pool: self.yes_pool,
            no_pool: self.no_pool,
            resolved: self.resolved,
            outcome,
            oracle_price: self.resolved.then_some(self.oracle_price),
            confidence: None,
        }
    }
}

/// `Position` account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionAccount {
    pub user: Pubkey,
    pub market_id: u64,
    pub yes_amount: u64,
    pub no_amount: u64,
    pub claimed: bool,
}

impl PositionAccount {
    pub const NAME: &'static str = "Position";

    pub fn decode(data: &[u8]) -> std::result::Result<Self, ChainError> {
        let mut r = LayoutReader::new(data, "position account", account_discriminator(Self::NAME))?;
        Ok(Self {
            user: r.pubkey()?,
            market_id: r.u64()?,
            yes_amount: r.u64()?,
            no_amount: r.u64()?,
            claimed: r.u8()? != 0,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = account_discriminator(Self::NAME).to_vec();
        out.extend_from_slice(self.user.as_bytes());
        out.extend_from_slice(&self.market_id.to_le_bytes());
        out.extend_from_slice(&self.yes_amount.to_le_bytes());
        out.extend_from_slice(&self.no_amount.to_le_bytes());
        out.push(self.claimed as u8);
        out
    }
}

/// `Config` account: program authority and market counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAccount {
    pub authority: Pubkey,
    pub market_count: u64,
    pub fee_bps: u16,
}

impl ConfigAccount {
    pub const NAME: &'static str = "Config";

    pub fn decode(data: &[u8]) -> std::result::Result<Self, ChainError> {
        let mut r = LayoutReader::new(data, "config account", account_discriminator(Self::NAME))?;
        Ok(Self {
            authority: r.pubkey()?,
            market_count: r.u64()?,
            fee_bps: r.u16()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = account_discriminator(Self::NAME).to_vec();
        out.extend_from_slice(self.authority.as_bytes());
        out.extend_from_slice(&self.market_count.to_le_bytes());
        out.extend_from_slice(&self.fee_bps.to_le_bytes());
        out
    }
}

/// Bridge `PostedMessage` account written by `transfer_tokens`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAccount {
    pub sequence: u64,
    pub emitter: [u8; 32],
    pub sender: Pubkey,
    pub amount: u64,
    pub recipient: [u8; 32],
    pub recipient_chain: u16,
    pub nonce: u32,
}

impl MessageAccount {
    pub const NAME: &'static str = "PostedMessage";

    pub fn decode(data: &[u8]) -> std::result::Result<Self, ChainError> {
        let mut r = LayoutReader::new(data, "message account", account_discriminator(Self::NAME))?;
        Ok(Self {
            sequence: r.u64()?,
            emitter: r.bytes()?,
            sender: r.pubkey()?,
            amount: r.u64()?,
            recipient: r.bytes()?,
            recipient_chain: r.u16()?,
            nonce: r.u32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = account_discriminator(Self::NAME).to_vec();
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.emitter);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.recipient_chain.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }
}

/// SPL token account: mint 32 | owner 32 | amount u64 | ... (165 bytes)
pub const TOKEN_ACCOUNT_LEN: usize = 165;

pub fn encode_token_account(mint: &Pubkey, owner: &Pubkey, amount: u64) -> Vec<u8> {
    let mut out = vec![0u8; TOKEN_ACCOUNT_LEN];
    out[..32].copy_from_slice(mint.as_bytes());
    out[32..64].copy_from_slice(owner.as_bytes());
    out[64..72].copy_from_slice(&amount.to_le_bytes());
    out[108] = 1; // initialized
    out
}

pub fn token_account_amount(data: &[u8]) -> std::result::Result<u64, ChainError> {
    let bytes = data
        .get(64..72)
        .ok_or_else(|| ChainError::decode("token account", "shorter than 72 bytes"))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

// ============================================================================
// RPC
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

#[async_trait]
pub trait SolanaRpc: Send + Sync {
    async fn account_data(&self, address: &Pubkey, commitment: Commitment) -> std::result::Result<Option<Vec<u8>>, ChainError>;

    async fn latest_blockhash(&self) -> std::result::Result<String, ChainError>;

    async fn send_transaction(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError>;

    async fn signature_status(&self, signature: &TxRef) -> std::result::Result<TxStatus, ChainError>;
}

#[derive(Debug, Deserialize)]
struct RpcContextValue<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct UiAccount {
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    confirmation_status: Option<Commitment>,
}

/// JSON-RPC transport for a live validator
pub struct HttpSolanaRpc {
    rpc: JsonRpcClient,
}

impl HttpSolanaRpc {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            rpc: JsonRpcClient::new(endpoint_url),
        }
    }
}

#[async_trait]
impl SolanaRpc for HttpSolanaRpc {
    async fn account_data(&self, address: &Pubkey, commitment: Commitment) -> std::result::Result<Option<Vec<u8>>, ChainError> {
        let response: RpcContextValue<Option<UiAccount>> = self
            .rpc
            .call(
                "getAccountInfo",
                json!([address.to_string(), {"encoding": "base64", "commitment": commitment.as_str()}]),
            )
            .await?;

        match response.value {
            None => Ok(None),
            Some(account) => {
                let encoded = account
                    .data
                    .first()
                    .ok_or_else(|| ChainError::decode("getAccountInfo", "missing data"))?;
                BASE64
                    .decode(encoded.as_bytes())
                    .map(Some)
                    .map_err(|e| ChainError::decode("getAccountInfo", e.to_string()))
            }
        }
    }

    async fn latest_blockhash(&self) -> std::result::Result<String, ChainError> {
        let response: RpcContextValue<BlockhashValue> = self
            .rpc
            .call("getLatestBlockhash", json!([{"commitment": "finalized"}]))
            .await?;
        Ok(response.value.blockhash)
    }

    async fn send_transaction(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError> {
        let signature: String = self
            .rpc
            .call(
                "sendTransaction",
                json!([signed.raw, {"encoding": "base64", "preflightCommitment": "confirmed"}]),
            )
            .await?;
        Ok(TxRef::new(signature))
    }

    async fn signature_status(&self, signature: &TxRef) -> std::result::Result<TxStatus, ChainError> {
        let response: RpcContextValue<Vec<Option<SignatureStatus>>> = self
            .rpc
            .call(
                "getSignatureStatuses",
                json!([[signature.as_str()], {"searchTransactionHistory": true}]),
            )
            .await?;

        let status = match response.value.into_iter().next().flatten() {
            None => return Ok(TxStatus::Unknown),
            Some(status) => status,
        };
        if let Some(err) = status.err.filter(|e| !e.is_null()) {
            return Ok(TxStatus::Failed { reason: err.to_string() });
        }
        Ok(match status.confirmation_status {
            Some(Commitment::Finalized) => TxStatus::Finalized { block: status.slot },
            Some(Commitment::Confirmed) => TxStatus::Confirmed { block: status.slot },
            _ => TxStatus::Pending,
        })
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct SolanaAdapter {
    rpc: Arc<dyn SolanaRpc>,
    config: SolanaConfig,
    confirmation: ConfirmationPolicy,
    retry: RetryPolicy,
}

impl SolanaAdapter {
    pub fn new(rpc: Arc<dyn SolanaRpc>, config: SolanaConfig, confirmation: ConfirmationPolicy, retry: RetryPolicy) -> Self {
        Self {
            rpc,
            config,
            confirmation,
            retry,
        }
    }

    pub fn config(&self) -> &SolanaConfig {
        &self.config
    }

    fn parse_key(address: &str) -> Result<Pubkey> {
        Ok(address.parse::<Pubkey>()?)
    }

    async fn read(&self, address: &Pubkey, commitment: Commitment) -> Result<Option<Vec<u8>>> {
        self.retry
            .run("getAccountInfo", |_| async move {
                self.rpc
                    .account_data(address, commitment)
                    .await
                    .map_err(|e| EngineError::chain(Chain::Solana, e))
            })
            .await
    }

    async fn read_market(&self, market_id: u64) -> Result<Option<MarketAccount>> {
        let address = self.config.market_address(market_id)?;
        match self.read(&address, Commitment::Confirmed).await? {
            Some(data) => Ok(Some(
                MarketAccount::decode(&data).map_err(|e| EngineError::chain(Chain::Solana, e))?,
            )),
            None => Ok(None),
        }
    }

    /// Sign a transaction carrying `instructions` with `signer` as fee payer
    async fn sign(&self, signer: &dyn Signer, instructions: Vec<Instruction>) -> Result<SignedTx> {
        ensure_signer_chain(signer, Chain::Solana)?;
        let fee_payer = Self::parse_key(&signer.address())?;
        let recent_blockhash = self
            .retry
            .run("getLatestBlockhash", |_| async {
                self.rpc
                    .latest_blockhash()
                    .await
                    .map_err(|e| EngineError::chain(Chain::Solana, e))
            })
            .await?;

        let signed = signer
            .sign(TxRequest::Solana(SolanaTxRequest {
                fee_payer,
                recent_blockhash,
                instructions,
            }))
            .await?;
        if signed.chain != Chain::Solana {
            return Err(EngineError::chain(
                Chain::Solana,
                ChainError::Signer(format!("signer returned a {} transaction", signed.chain)),
            ));
        }
        Ok(signed)
    }

    async fn send(&self, signer: &dyn Signer, instructions: Vec<Instruction>, finality: Finality) -> Result<Confirmation> {
        let signed = self.sign(signer, instructions).await?;
        submit_and_confirm(self, &signed, finality, &self.confirmation, &self.retry).await
    }

    /// ATA creation instruction when `owner` has no USDC account yet
    async fn token_account_ix(&self, payer: &Pubkey, owner: &Pubkey) -> Result<Option<Instruction>> {
        let ata = self.config.user_token_address(owner)?;
        if self.read(&ata, Commitment::Confirmed).await?.is_some() {
            return Ok(None);
        }
        debug!(owner = %owner, ata = %ata, "creating associated token account");
        Ok(Some(create_token_account_ix(payer, owner, &self.config.usdc_mint)?))
    }
}

#[async_trait]
impl TxTransport for SolanaAdapter {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    async fn broadcast(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError> {
        self.rpc.send_transaction(signed).await
    }

    async fn tx_status(&self, tx_ref: &TxRef) -> std::result::Result<TxStatus, ChainError> {
        self.rpc.signature_status(tx_ref).await
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    async fn market_ids(&self) -> Result<Vec<u64>> {
        let address = self.config.config_address()?;
        match self.read(&address, Commitment::Confirmed).await? {
            Some(data) => {
                let config = ConfigAccount::decode(&data).map_err(|e| EngineError::chain(Chain::Solana, e))?;
                Ok((1..=config.market_count).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn market(&self, market_id: u64) -> Result<Option<Market>> {
        Ok(self
            .read_market(market_id)
            .await?
            .map(|account| account.into_market(MarketKey::new(Chain::Solana, market_id))))
    }

    async fn position(&self, market_id: u64, account: &str) -> Result<Position> {
        let key = MarketKey::new(Chain::Solana, market_id);
        let user = Self::parse_key(account)?;
        let market = self.config.market_address(market_id)?;
        let address = self.config.position_address(&market, &user)?;

        match self.read(&address, Commitment::Confirmed).await? {
            Some(data) => {
                let p = PositionAccount::decode(&data).map_err(|e| EngineError::chain(Chain::Solana, e))?;
                Ok(Position {
                    key,
                    account: account.to_string(),
                    yes_amount: p.yes_amount,
                    no_amount: p.no_amount,
                    claimed: p.claimed,
                })
            }
            None => Ok(Position::empty(key, account)),
        }
    }

    async fn stake(&self, market_id: u64, side: Side, amount: u64, signer: &dyn Signer) -> Result<Confirmation> {
        let user = Self::parse_key(&signer.address())?;
        let ix = self.config.place_stake_ix(market_id, &user, side, amount)?;
        info!(chain = "solana", market_id, %side, amount, user = %user, "placing stake");
        self.send(signer, vec![ix], Finality::Confirmed).await
    }

    async fn claim(&self, market_id: u64, signer: &dyn Signer) -> Result<Confirmation> {
        let user = Self::parse_key(&signer.address())?;
        let mut instructions = Vec::with_capacity(2);
        if let Some(create) = self.token_account_ix(&user, &user).await? {
            instructions.push(create);
        }
        instructions.push(self.config.claim_ix(market_id, &user)?);
        info!(chain = "solana", market_id, user = %user, "claiming winnings");
        self.send(signer, instructions, Finality::Confirmed).await
    }

    async fn resolve(&self, market_id: u64, actual_price: u64, signer: &dyn Signer) -> Result<Confirmation> {
        let authority = Self::parse_key(&signer.address())?;
        let market = self
            .read_market(market_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownMarket(MarketKey::new(Chain::Solana, market_id)))?;
        let ix = self
            .config
            .resolve_ix(market_id, &market.commodity, &authority, actual_price)?;
        info!(chain = "solana", market_id, actual_price, "resolving market");
        self.send(signer, vec![ix], Finality::Confirmed).await
    }

    async fn collateral_balance(&self, account: &str) -> Result<u64> {
        let owner = Self::parse_key(account)?;
        let ata = self.config.user_token_address(&owner)?;
        match self.read(&ata, Commitment::Confirmed).await? {
            Some(data) => token_account_amount(&data).map_err(|e| EngineError::chain(Chain::Solana, e)),
            None => Ok(0),
        }
    }

    fn validate_address(&self, address: &str) -> bool {
        address.parse::<Pubkey>().is_ok()
    }
}

// ============================================================================
// BRIDGE ENDPOINT
// ============================================================================

/// Index of the message PDA in `transfer_tokens` accounts
const MESSAGE_ACCOUNT_INDEX: usize = 4;

impl SolanaAdapter {
    fn message_account_of(&self, signed: &SignedTx) -> Result<Pubkey> {
        let lock_ix = match &signed.request {
            TxRequest::Solana(request) => request
                .instructions
                .iter()
                .find(|ix| ix.program_id == self.config.bridge_program),
            TxRequest::Evm(_) => None,
        };
        lock_ix
            .and_then(|ix| ix.accounts.get(MESSAGE_ACCOUNT_INDEX))
            .map(|meta| meta.pubkey)
            .ok_or_else(|| {
                EngineError::chain(
                    Chain::Solana,
                    ChainError::decode("lock transaction", "no bridge instruction"),
                )
            })
    }
}

#[async_trait]
impl BridgeEndpoint for SolanaAdapter {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn emitter_address(&self) -> String {
        self.config
            .emitter_address()
            .map(|e| hex::encode(e.as_bytes()))
            .unwrap_or_default()
    }

    async fn prepare_lock(&self, request: &BridgeRequest, signer: &dyn Signer) -> Result<SignedTx> {
        let sender = Self::parse_key(&signer.address())?;
        let recipient = super::encode_address(request.destination, &request.recipient).ok_or_else(|| {
            ValidationError::InvalidAddress {
                chain: request.destination,
                address: request.recipient.clone(),
            }
        })?;
        let ix = self.config.transfer_tokens_ix(
            &sender,
            request.amount,
            recipient,
            request.destination.wormhole_id(),
            request.nonce,
        )?;
        self.sign(signer, vec![ix]).await
    }

    async fn broadcast_lock(&self, signed: &SignedTx) -> Result<()> {
        self.retry
            .run("broadcast_lock", |_| async {
                match self.rpc.send_transaction(signed).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_already_known(&e) => Ok(()),
                    Err(e) => Err(EngineError::chain_tx(Chain::Solana, e, &signed.tx_ref)),
                }
            })
            .await
    }

    async fn source_state(&self, signed: &SignedTx) -> Result<SourceState> {
        let status = self
            .retry
            .run("getSignatureStatuses", |_| async {
                self.rpc
                    .signature_status(&signed.tx_ref)
                    .await
                    .map_err(|e| EngineError::chain_tx(Chain::Solana, e, &signed.tx_ref))
            })
            .await?;

        match status {
            TxStatus::Unknown => Ok(SourceState::Unknown),
            TxStatus::Failed { reason } => Ok(SourceState::Reverted(reason)),
            TxStatus::Pending | TxStatus::Confirmed { .. } => Ok(SourceState::Pending),
            TxStatus::Finalized { .. } => {
                let address = self.message_account_of(signed)?;
                let data = self.read(&address, Commitment::Finalized).await?.ok_or_else(|| {
                    EngineError::chain_tx(
                        Chain::Solana,
                        ChainError::InvalidResponse(format!("message account {} missing", address)),
                        &signed.tx_ref,
                    )
                })?;
                let message = MessageAccount::decode(&data).map_err(|e| EngineError::chain(Chain::Solana, e))?;
                Ok(SourceState::Emitted {
                    emitter: hex::encode(message.emitter),
                    sequence: message.sequence,
                })
            }
        }
    }

    async fn is_redeemed(&self, attestation: &Attestation) -> Result<bool> {
        let claim = self.config.claim_address(&attestation.digest())?;
        Ok(self.read(&claim, Commitment::Confirmed).await?.is_some())
    }

    async fn redeem(&self, attestation: &Attestation, signer: &dyn Signer) -> Result<Confirmation> {
        let payload = attestation.transfer_payload()?;
        if payload.destination()? != Chain::Solana {
            return Err(AttestationError::PayloadMismatch(format!(
                "payload targets chain {}",
                payload.recipient_chain
            ))
            .into());
        }
        let payer = Self::parse_key(&signer.address())?;
        let recipient = Pubkey::new(payload.recipient);

        let mut instructions = Vec::with_capacity(2);
        if let Some(create) = self.token_account_ix(&payer, &recipient).await? {
            instructions.push(create);
        }
        instructions.push(self.config.complete_transfer_ix(
            &payer,
            &recipient,
            attestation.raw(),
            &attestation.digest(),
        )?);

        info!(chain = "solana", recipient = %recipient, amount = payload.amount, "redeeming transfer");
        self.send(signer, instructions, Finality::Finalized).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SolanaConfig {
        SolanaConfig {
            market_program: Pubkey::new([11u8; 32]),
            bridge_program: Pubkey::new([22u8; 32]),
            usdc_mint: Pubkey::new([33u8; 32]),
        }
    }

    #[test]
    fn test_well_known_program_ids() {
        assert_eq!(TOKEN_PROGRAM_ID.to_string(), "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
        assert_eq!(
            ASSOCIATED_TOKEN_PROGRAM_ID.to_string(),
            "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL"
        );
        assert_eq!(SYSTEM_PROGRAM_ID.to_string(), "11111111111111111111111111111111");
    }

    #[test]
    fn test_pubkey_parse_rejects_bad_input() {
        assert!("not base58 0OIl".parse::<Pubkey>().is_err());
        assert!("3yZe7d".parse::<Pubkey>().is_err());
        let key = Pubkey::new([5u8; 32]);
        assert_eq!(key.to_string().parse::<Pubkey>().unwrap(), key);
    }

    #[test]
    fn test_program_addresses_are_off_curve_and_stable() {
        let config = config();
        let a = config.market_address(1).unwrap();
        let b = config.market_address(1).unwrap();
        let c = config.market_address(2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_on_curve());

        let user = Pubkey::new([7u8; 32]);
        let position = config.position_address(&a, &user).unwrap();
        assert!(!position.is_on_curve());
        assert_ne!(config.user_token_address(&user).unwrap(), config.vault_address().unwrap());
    }

    #[test]
    fn test_seed_length_limit() {
        let long = [0u8; 33];
        assert!(Pubkey::create_program_address(&[&long], &Pubkey::new([1u8; 32])).is_none());
    }

    #[test]
    fn test_discriminators_differ_by_namespace() {
        assert_ne!(instruction_discriminator("place_stake"), account_discriminator("place_stake"));
        assert_eq!(instruction_discriminator(IX_PLACE_STAKE).len(), 8);
    }

    #[test]
    fn test_market_account_layout() {
        let account = MarketAccount {
            market_id: 4,
            commodity: "COFFEE".into(),
            threshold_price: 310_00,
            target_date: 1_800_000_000,
            created_at: 1_700_000_000,
            yes_pool: 10,
            no_pool: 20,
            resolved: true,
            outcome: 2,
            resolved_at: 1_800_000_100,
            oracle_price: 290_00,
        };
        let data = account.encode();
        assert_eq!(data.len(), 106);
        let decoded = MarketAccount::decode(&data).unwrap();
        let market = decoded.into_market(MarketKey::new(Chain::Solana, 4));
        assert_eq!(market.commodity, "COFFEE");
        assert_eq!(market.outcome, Some(Side::No));
        assert_eq!(market.oracle_price, Some(290_00));
    }

    #[test]
    fn test_decode_rejects_wrong_account_type() {
        let position = PositionAccount {
            user: Pubkey::new([1u8; 32]),
            market_id: 1,
            yes_amount: 1,
            no_amount: 0,
            claimed: false,
        };
        assert!(MarketAccount::decode(&position.encode()).is_err());
        assert!(PositionAccount::decode(&position.encode()[..20]).is_err());
    }

    #[test]
    fn test_token_account_amount() {
        let data = encode_token_account(&Pubkey::new([1u8; 32]), &Pubkey::new([2u8; 32]), 42_000_000);
        assert_eq!(token_account_amount(&data).unwrap(), 42_000_000);
    }
}
