//! Error taxonomy for the settlement engine.
//!
//! Validation and state errors are raised before any chain write. Chain
//! failures and confirmation timeouts are retryable at the adapter layer,
//! attestation failures at the bridge layer.

use thiserror::Error;

use crate::models::{Chain, MarketKey, TxRef};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Malformed input, rejected before any network round-trip
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("invalid amount '{0}'")]
    InvalidAmount(String),

    #[error("stake {stake} exceeds pool {pool}")]
    StakeExceedsPool { stake: u64, pool: u64 },

    #[error("amount overflows pool arithmetic")]
    Overflow,

    #[error("fee rate {0} bps exceeds 10000")]
    InvalidFeeRate(u32),

    #[error("unknown chain '{0}'")]
    UnknownChain(String),

    #[error("unknown side '{0}'")]
    InvalidSide(String),

    #[error("no adapter registered for {0}")]
    UnsupportedChain(Chain),

    #[error("market {0} not found")]
    UnknownMarket(MarketKey),

    #[error("invalid {chain} address '{address}'")]
    InvalidAddress { chain: Chain, address: String },

    #[error("signer is for {signer}, operation targets {target}")]
    SignerChainMismatch { signer: Chain, target: Chain },

    #[error("oracle price for {got} cannot resolve a {expected} market")]
    CommodityMismatch { expected: String, got: String },

    #[error("oracle price must be positive")]
    NonPositivePrice,

    #[error("source and destination are both {0}")]
    SameChainTransfer(Chain),
}

/// Operation is well-formed but not allowed in the current market/transfer state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("market {0} is already resolved")]
    MarketResolved(MarketKey),

    #[error("market {0} is past its target date")]
    MarketExpired(MarketKey),

    #[error("market {0} is not resolved yet")]
    NotResolved(MarketKey),

    #[error("market {key} cannot be resolved before {target_date}")]
    ResolutionTooEarly { key: MarketKey, target_date: i64 },

    #[error("position in {0} was already claimed")]
    AlreadyClaimed(MarketKey),

    #[error("account staked on the losing side of {0}")]
    WrongSide(MarketKey),

    #[error("account has no position in {0}")]
    NoPosition(MarketKey),

    #[error("sender {sender} already used nonce {nonce} for transfer {existing}")]
    DuplicateTransfer { sender: String, nonce: u32, existing: String },

    #[error("transfer {0} not found")]
    TransferNotFound(String),

    #[error("transfer {transfer_id} cannot continue: {reason}")]
    TransferStuck { transfer_id: String, reason: String },

    #[error("no signer available to redeem on {0}")]
    MissingSigner(Chain),
}

/// RPC or on-chain execution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    #[error("transaction {tx_ref} reverted: {reason}")]
    Reverted { tx_ref: TxRef, reason: String },

    #[error("could not decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("signer refused: {0}")]
    Signer(String),
}

impl ChainError {
    pub fn decode(what: impl Into<String>, reason: impl Into<String>) -> Self {
        ChainError::Decode {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Only transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Rpc(_))
    }
}

/// Guardian attestation (VAA) failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    #[error("attestation for {emitter_chain}/{emitter}/{sequence} not available yet")]
    NotAvailable {
        emitter_chain: u16,
        emitter: String,
        sequence: u64,
    },

    #[error("guardian network unreachable: {0}")]
    Unreachable(String),

    #[error("quorum not reached: {valid} valid signatures, {required} required")]
    QuorumNotReached { valid: usize, required: usize },

    #[error("malformed attestation: {0}")]
    Malformed(String),

    #[error("guardian set {got} does not match expected set {expected}")]
    GuardianSetMismatch { expected: u32, got: u32 },

    #[error("invalid emitter: {0}")]
    InvalidEmitter(String),

    #[error("payload does not match transfer: {0}")]
    PayloadMismatch(String),
}

impl AttestationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttestationError::NotAvailable { .. }
                | AttestationError::Unreachable(_)
                | AttestationError::QuorumNotReached { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{chain}: {error}")]
    Chain {
        chain: Chain,
        error: ChainError,
        tx_ref: Option<TxRef>,
    },

    #[error("{chain} transaction {tx_ref} not confirmed within {waited_ms}ms")]
    ConfirmationTimeout {
        chain: Chain,
        tx_ref: TxRef,
        waited_ms: u64,
    },

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("insufficient allowance on {chain}: {allowance} approved, {required} required")]
    InsufficientAllowance {
        chain: Chain,
        allowance: u64,
        required: u64,
    },

    #[error("transfer journal: {0}")]
    Journal(String),

    #[error("oracle: {0}")]
    Oracle(String),
}

impl EngineError {
    pub fn chain(chain: Chain, error: ChainError) -> Self {
        EngineError::Chain {
            chain,
            error,
            tx_ref: None,
        }
    }

    pub fn chain_tx(chain: Chain, error: ChainError, tx_ref: &TxRef) -> Self {
        EngineError::Chain {
            chain,
            error,
            tx_ref: Some(tx_ref.clone()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Chain { error, .. } => error.is_retryable(),
            EngineError::ConfirmationTimeout { .. } => true,
            EngineError::Attestation(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Transaction the caller can use for manual recovery, if one was submitted
    pub fn tx_ref(&self) -> Option<&TxRef> {
        match self {
            EngineError::Chain { tx_ref, .. } => tx_ref.as_ref(),
            EngineError::ConfirmationTimeout { tx_ref, .. } => Some(tx_ref),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::State(_) => "state_error",
            EngineError::Chain { .. } => "chain_error",
            EngineError::ConfirmationTimeout { .. } => "confirmation_timeout",
            EngineError::Attestation(_) => "attestation_error",
            EngineError::InsufficientAllowance { .. } => "insufficient_allowance",
            EngineError::Journal(_) => "journal_error",
            EngineError::Oracle(_) => "oracle_error",
        }
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Journal(err.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Journal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::chain(Chain::Polygon, ChainError::Rpc("503".into())).is_retryable());
        assert!(!EngineError::chain(
            Chain::Polygon,
            ChainError::Reverted {
                tx_ref: TxRef::new("0xabc"),
                reason: "execution reverted".into()
            }
        )
        .is_retryable());
        assert!(EngineError::ConfirmationTimeout {
            chain: Chain::Solana,
            tx_ref: TxRef::new("sig"),
            waited_ms: 10
        }
        .is_retryable());
        assert!(!EngineError::from(AttestationError::Malformed("short".into())).is_retryable());
        assert!(EngineError::from(AttestationError::QuorumNotReached { valid: 1, required: 3 }).is_retryable());
        assert!(!EngineError::from(StateError::AlreadyClaimed(MarketKey::new(Chain::Polygon, 1))).is_retryable());
    }

    #[test]
    fn test_tx_ref_survives_for_manual_recovery() {
        let err = EngineError::ConfirmationTimeout {
            chain: Chain::Polygon,
            tx_ref: TxRef::new("0xfeed"),
            waited_ms: 90_000,
        };
        assert_eq!(err.tx_ref().map(|t| t.as_str()), Some("0xfeed"));
        assert_eq!(err.kind(), "confirmation_timeout");
        assert!(err.to_string().contains("0xfeed"));
    }
}
