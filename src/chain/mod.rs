//! Chain adapters.
//!
//! Each chain implements `ChainAdapter` (market reads/writes) and
//! `TxTransport` (raw broadcast + status polling). Writes are only reported
//! once the transaction reaches the requested finality; the submit loop
//! rebroadcasts the *same* signed bytes on transient failure so a retry can
//! never produce a second on-chain effect.

pub mod abi;
pub mod polygon;
pub mod rpc;
pub mod simulated;
pub mod solana;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ChainError, EngineError, Result};
use crate::models::{Chain, Market, Position, Side, TxRef};
use crate::retry::{sleep_or_yield, RetryPolicy};
use solana::Pubkey;

// ============================================================================
// TRANSACTION REQUESTS
// ============================================================================

/// Unsigned EVM call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmTxRequest {
    pub chain_id: u64,
    pub from: String,
    pub to: String,
    pub data: Vec<u8>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

/// Unsigned account-model transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaTxRequest {
    pub fee_payer: Pubkey,
    pub recent_blockhash: String,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRequest {
    Evm(EvmTxRequest),
    Solana(SolanaTxRequest),
}

impl TxRequest {
    pub fn chain(&self) -> Chain {
        match self {
            TxRequest::Evm(_) => Chain::Polygon,
            TxRequest::Solana(_) => Chain::Solana,
        }
    }
}

/// Signed, serialized transaction. `raw` is what gets broadcast, and is the
/// only thing rebroadcast on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub chain: Chain,
    pub tx_ref: TxRef,
    pub raw: String,
    pub request: TxRequest,
}

/// Signing capability. The engine never holds keys; wallets and relayers
/// implement this.
#[async_trait]
pub trait Signer: Send + Sync {
    fn chain(&self) -> Chain;

    /// Address in the chain's native form (0x hex or base58)
    fn address(&self) -> String;

    async fn sign(&self, request: TxRequest) -> Result<SignedTx>;
}

// ============================================================================
// CONFIRMATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    Confirmed,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Node has never seen the transaction
    Unknown,
    Pending,
    Confirmed { block: u64 },
    Finalized { block: u64 },
    Failed { reason: String },
}

impl TxStatus {
    pub fn reached(&self, finality: Finality) -> Option<u64> {
        match (self, finality) {
            (TxStatus::Confirmed { block }, Finality::Confirmed) => Some(*block),
            (TxStatus::Finalized { block }, _) => Some(*block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub tx_ref: TxRef,
    pub block: u64,
}

/// Bounded poll-until-confirmed budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ConfirmationPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Poll without sleeping; used by tests against simulated chains
    pub fn immediate() -> Self {
        Self::new(Duration::from_millis(250), Duration::ZERO)
    }
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(90), Duration::from_secs(2))
    }
}

/// Raw broadcast and status lookup for one chain
#[async_trait]
pub trait TxTransport: Send + Sync {
    fn chain(&self) -> Chain;

    async fn broadcast(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError>;

    async fn tx_status(&self, tx_ref: &TxRef) -> std::result::Result<TxStatus, ChainError>;
}

/// Poll until `tx_ref` reaches `finality`, fails, or the budget runs out
pub async fn wait_for_confirmation<T: TxTransport + ?Sized>(
    transport: &T,
    tx_ref: &TxRef,
    finality: Finality,
    policy: &ConfirmationPolicy,
) -> Result<Confirmation> {
    let chain = transport.chain();
    let started = Instant::now();

    loop {
        match transport.tx_status(tx_ref).await {
            Ok(TxStatus::Failed { reason }) => {
                return Err(EngineError::chain_tx(
                    chain,
                    ChainError::Reverted {
                        tx_ref: tx_ref.clone(),
                        reason,
                    },
                    tx_ref,
                ));
            }
            Ok(status) => {
                if let Some(block) = status.reached(finality) {
                    debug!(%chain, %tx_ref, block, ?finality, "transaction confirmed");
                    return Ok(Confirmation {
                        tx_ref: tx_ref.clone(),
                        block,
                    });
                }
            }
            Err(e) if e.is_retryable() => {
                debug!(%chain, %tx_ref, error = %e, "status poll failed, polling again");
            }
            Err(e) => return Err(EngineError::chain_tx(chain, e, tx_ref)),
        }

        if started.elapsed() >= policy.timeout {
            return Err(EngineError::ConfirmationTimeout {
                chain,
                tx_ref: tx_ref.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        sleep_or_yield(policy.poll_interval).await;
    }
}

/// Broadcast a signed transaction and wait for it, rebroadcasting the same
/// bytes when a broadcast or confirmation attempt fails transiently.
pub async fn submit_and_confirm<T: TxTransport + ?Sized>(
    transport: &T,
    signed: &SignedTx,
    finality: Finality,
    confirmation: &ConfirmationPolicy,
    retry: &RetryPolicy,
) -> Result<Confirmation> {
    let chain = transport.chain();
    info!(%chain, tx_ref = %signed.tx_ref, "submitting transaction");

    retry
        .run("submit_and_confirm", |attempt| async move {
            if let Err(e) = transport.broadcast(signed).await {
                if attempt > 1 || rpc::is_already_known(&e) {
                    // the node may already hold it from an earlier attempt
                    warn!(%chain, tx_ref = %signed.tx_ref, error = %e, "rebroadcast rejected, polling anyway");
                } else {
                    return Err(EngineError::chain_tx(chain, e, &signed.tx_ref));
                }
            }
            wait_for_confirmation(transport, &signed.tx_ref, finality, confirmation).await
        })
        .await
}

// ============================================================================
// ADAPTER CAPABILITY
// ============================================================================

/// Market operations one chain exposes. Selected by `MarketKey.chain`.
///
/// Implementations must never report a write as successful before the
/// transaction is confirmed on-chain.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    async fn market_ids(&self) -> Result<Vec<u64>>;

    /// `None` when no market with this id exists
    async fn market(&self, market_id: u64) -> Result<Option<Market>>;

    async fn position(&self, market_id: u64, account: &str) -> Result<Position>;

    async fn stake(&self, market_id: u64, side: Side, amount: u64, signer: &dyn Signer) -> Result<Confirmation>;

    async fn claim(&self, market_id: u64, signer: &dyn Signer) -> Result<Confirmation>;

    async fn resolve(&self, market_id: u64, actual_price: u64, signer: &dyn Signer) -> Result<Confirmation>;

    /// USDC balance in base units
    async fn collateral_balance(&self, account: &str) -> Result<u64>;

    /// Whether `address` is well-formed for this chain
    fn validate_address(&self, address: &str) -> bool;
}

pub(crate) fn ensure_signer_chain(signer: &dyn Signer, chain: Chain) -> Result<()> {
    if signer.chain() != chain {
        return Err(crate::error::ValidationError::SignerChainMismatch {
            signer: signer.chain(),
            target: chain,
        }
        .into());
    }
    Ok(())
}

/// Recipient address in the 32-byte universal form used by bridge payloads
pub fn encode_address(chain: Chain, address: &str) -> Option<[u8; 32]> {
    match chain {
        Chain::Polygon => abi::parse_address(address).map(|a| abi::address_to_bytes32(&a)),
        Chain::Solana => address.parse::<Pubkey>().ok().map(|p| p.to_bytes()),
    }
}

pub fn decode_address(chain: Chain, bytes: &[u8; 32]) -> Option<String> {
    match chain {
        Chain::Polygon => abi::bytes32_to_address(bytes).map(|a| abi::format_address(&a)),
        Chain::Solana => Some(Pubkey::new(*bytes).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Transport that reports Pending for `pending_polls` polls, then Confirmed
    struct ScriptedTransport {
        pending_polls: AtomicU32,
        broadcasts: AtomicU32,
        fail_broadcasts: AtomicU32,
        statuses: Mutex<Vec<TxStatus>>,
    }

    impl ScriptedTransport {
        fn new(pending_polls: u32) -> Self {
            Self {
                pending_polls: AtomicU32::new(pending_polls),
                broadcasts: AtomicU32::new(0),
                fail_broadcasts: AtomicU32::new(0),
                statuses: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TxTransport for ScriptedTransport {
        fn chain(&self) -> Chain {
            Chain::Polygon
        }

        async fn broadcast(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError> {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
            if self.fail_broadcasts.load(Ordering::SeqCst) > 0 {
                self.fail_broadcasts.fetch_sub(1, Ordering::SeqCst);
                return Err(ChainError::Rpc("connection reset".into()));
            }
            Ok(signed.tx_ref.clone())
        }

        async fn tx_status(&self, _tx_ref: &TxRef) -> std::result::Result<TxStatus, ChainError> {
            if let Some(status) = self.statuses.lock().unwrap().pop() {
                return Ok(status);
            }
            if self.pending_polls.load(Ordering::SeqCst) > 0 {
                self.pending_polls.fetch_sub(1, Ordering::SeqCst);
                return Ok(TxStatus::Pending);
            }
            Ok(TxStatus::Confirmed { block: 12 })
        }
    }

    fn signed() -> SignedTx {
        SignedTx {
            chain: Chain::Polygon,
            tx_ref: TxRef::new("0x01"),
            raw: "0xdead".into(),
            request: TxRequest::Evm(EvmTxRequest {
                chain_id: 137,
                from: "0x01".into(),
                to: "0x02".into(),
                data: vec![],
                value: 0,
            }),
        }
    }

    #[tokio::test]
    async fn test_waits_through_pending_polls() {
        let transport = ScriptedTransport::new(3);
        let conf = wait_for_confirmation(&transport, &TxRef::new("0x01"), Finality::Confirmed, &ConfirmationPolicy::immediate())
            .await
            .unwrap();
        assert_eq!(conf.block, 12);
    }

    #[tokio::test]
    async fn test_confirmed_is_not_finalized() {
        let transport = ScriptedTransport::new(0);
        let policy = ConfirmationPolicy::new(Duration::from_millis(20), Duration::from_millis(1));
        let err = wait_for_confirmation(&transport, &TxRef::new("0x01"), Finality::Finalized, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfirmationTimeout { .. }));
        assert_eq!(err.tx_ref().unwrap().as_str(), "0x01");
    }

    #[tokio::test]
    async fn test_reverted_transaction_surfaces_chain_error() {
        let transport = ScriptedTransport::new(0);
        transport.statuses.lock().unwrap().push(TxStatus::Failed {
            reason: "market resolved".into(),
        });
        let err = wait_for_confirmation(&transport, &TxRef::new("0x01"), Finality::Confirmed, &ConfirmationPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Chain {
                error: ChainError::Reverted { .. },
                ..
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_broadcast_failure_rebroadcasts_same_bytes() {
        let transport = ScriptedTransport::new(0);
        transport.fail_broadcasts.store(2, Ordering::SeqCst);
        let conf = submit_and_confirm(
            &transport,
            &signed(),
            Finality::Confirmed,
            &ConfirmationPolicy::immediate(),
            &RetryPolicy::immediate(5),
        )
        .await
        .unwrap();
        assert_eq!(conf.tx_ref, TxRef::new("0x01"));
        // second attempt's broadcast also failed but the poll found the tx
        assert_eq!(transport.broadcasts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_universal_address_encoding() {
        let evm = "0x00000000000000000000000000000000000000aa";
        let bytes = encode_address(Chain::Polygon, evm).unwrap();
        assert_eq!(decode_address(Chain::Polygon, &bytes).unwrap(), evm);
        assert!(encode_address(Chain::Polygon, "not-an-address").is_none());

        let key = Pubkey::new([7u8; 32]).to_string();
        let bytes = encode_address(Chain::Solana, &key).unwrap();
        assert_eq!(decode_address(Chain::Solana, &bytes).unwrap(), key);
    }
}
