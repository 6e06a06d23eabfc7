//! Cross-chain USDC bridge.
//!
//! Transfer Flow:
//! 1. Lock on the source chain (signed tx persisted before broadcast)
//! 2. Source tx finalized → message emitted with (emitter, sequence)
//! 3. Guardians sign the message → attestation (VAA) collected and verified
//! 4. Attestation redeemed on the destination chain
//!
//! Submitted → AttestationPending → Attested → Redeemed, with Failed reachable
//! from any non-terminal state and resumable afterwards.

pub mod attestation;
pub mod coordinator;
pub mod journal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::chain::{Confirmation, SignedTx, Signer};
use crate::error::Result;
use crate::models::{Chain, TxRef};
use attestation::Attestation;

pub use coordinator::{BridgeCoordinator, CoordinatorConfig};
pub use journal::{MemoryJournal, SledJournal, TransferJournal};

// ============================================================================
// TRANSFER STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Source lock signed and broadcast, not yet finalized
    Submitted,
    /// Source finalized, waiting for guardian quorum
    AttestationPending,
    /// Verified attestation in hand, not yet redeemed
    Attested,
    /// Funds released on the destination chain
    Redeemed,
    /// Retry budget exhausted or unrecoverable error; may be resumed
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Submitted => "submitted",
            TransferStatus::AttestationPending => "attestation_pending",
            TransferStatus::Attested => "attested",
            TransferStatus::Redeemed => "redeemed",
            TransferStatus::Failed => "failed",
        }
    }

    /// No further progress without outside action
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Redeemed | TransferStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Submitted, AttestationPending) | (AttestationPending, Attested) | (Attested, Redeemed) => true,
            // redemption observed before we saw the attestation (another relayer)
            (AttestationPending, Redeemed) => true,
            (Redeemed, _) => false,
            (_, Failed) => true,
            (Failed, Submitted) | (Failed, AttestationPending) | (Failed, Attested) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TRANSFER KEY & REQUEST
// ============================================================================

/// Identity of an emitted bridge message, enough to rediscover a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferKey {
    pub chain: Chain,
    /// 32-byte emitter address, lowercase hex without prefix
    pub emitter: String,
    pub sequence: u64,
}

impl TransferKey {
    pub fn new(chain: Chain, emitter: impl Into<String>, sequence: u64) -> Self {
        Self {
            chain,
            emitter: normalize_emitter(&emitter.into()),
            sequence,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.chain, self.emitter, self.sequence)
    }
}

pub fn normalize_emitter(emitter: &str) -> String {
    emitter.trim_start_matches("0x").to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub source: Chain,
    pub destination: Chain,
    /// USDC base units
    pub amount: u64,
    /// Recipient address on the destination chain
    pub recipient: String,
    /// Caller-chosen nonce, unique per sender
    pub nonce: u32,
}

// ============================================================================
// BRIDGE TRANSFER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTransfer {
    /// Unique transfer identifier
    pub transfer_id: String,
    pub source_chain: Chain,
    pub dest_chain: Chain,
    /// Zero until known (rediscovered transfers learn it from the attestation)
    pub amount: u64,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub nonce: Option<u32>,
    pub status: TransferStatus,
    /// Signed lock, persisted before first broadcast so it can be rebroadcast verbatim
    pub signed_source_tx: Option<SignedTx>,
    pub source_tx: Option<TxRef>,
    pub emitter: Option<String>,
    pub sequence: Option<u64>,
    /// Raw attestation bytes once verified
    pub attestation: Option<Vec<u8>>,
    pub dest_tx: Option<TxRef>,
    /// Steps attempted across all runs
    pub attempts: u32,
    pub last_error: Option<String>,
    /// False once an unrecoverable error was hit; sweeps skip these
    pub recoverable: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BridgeTransfer {
    pub fn new(request: &BridgeRequest, sender: String, now: i64) -> Self {
        BridgeTransfer {
            transfer_id: new_transfer_id(now),
            source_chain: request.source,
            dest_chain: request.destination,
            amount: request.amount,
            sender: Some(sender),
            recipient: Some(request.recipient.clone()),
            nonce: Some(request.nonce),
            status: TransferStatus::Submitted,
            signed_source_tx: None,
            source_tx: None,
            emitter: None,
            sequence: None,
            attestation: None,
            dest_tx: None,
            attempts: 0,
            last_error: None,
            recoverable: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for a transfer known only by its emitted message
    pub fn rediscovered(key: &TransferKey, now: i64) -> Self {
        BridgeTransfer {
            transfer_id: new_transfer_id(now),
            source_chain: key.chain,
            dest_chain: key.chain.counterpart(),
            amount: 0,
            sender: None,
            recipient: None,
            nonce: None,
            status: TransferStatus::AttestationPending,
            signed_source_tx: None,
            source_tx: None,
            emitter: Some(key.emitter.clone()),
            sequence: Some(key.sequence),
            attestation: None,
            dest_tx: None,
            attempts: 0,
            last_error: None,
            recoverable: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> Option<TransferKey> {
        match (&self.emitter, self.sequence) {
            (Some(emitter), Some(sequence)) => Some(TransferKey::new(self.source_chain, emitter.clone(), sequence)),
            _ => None,
        }
    }

    /// Move to `next`; returns false (and changes nothing) for an illegal transition
    pub fn advance(&mut self, next: TransferStatus, now: i64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        if next != TransferStatus::Failed {
            self.last_error = None;
        }
        true
    }

    pub fn fail(&mut self, error: String, recoverable: bool, now: i64) {
        self.status = TransferStatus::Failed;
        self.last_error = Some(error);
        self.recoverable = recoverable;
        self.updated_at = now;
    }

    /// Stage a failed transfer restarts from, based on what it already holds
    pub fn resume_stage(&self) -> TransferStatus {
        if self.attestation.is_some() {
            TransferStatus::Attested
        } else if self.sequence.is_some() {
            TransferStatus::AttestationPending
        } else {
            TransferStatus::Submitted
        }
    }

    pub fn age_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }
}

fn new_transfer_id(now: i64) -> String {
    format!(
        "xfer_{}_{}",
        &Uuid::new_v4().simple().to_string()[..12],
        now
    )
}

// ============================================================================
// CHAIN ENDPOINT
// ============================================================================

/// What the source chain reports about a lock transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// Node has never seen the transaction
    Unknown,
    /// Seen but not yet finalized
    Pending,
    Reverted(String),
    Emitted { emitter: String, sequence: u64 },
}

/// Bridge contract/program operations on one chain
#[async_trait]
pub trait BridgeEndpoint: Send + Sync {
    fn chain(&self) -> Chain;

    /// This chain's bridge emitter, 32-byte lowercase hex
    fn emitter_address(&self) -> String;

    /// Build and sign (but do not broadcast) the lock transaction,
    /// including any token approval it depends on
    async fn prepare_lock(&self, request: &BridgeRequest, signer: &dyn Signer) -> Result<SignedTx>;

    /// Broadcast previously signed lock bytes; safe to repeat
    async fn broadcast_lock(&self, signed: &SignedTx) -> Result<()>;

    async fn source_state(&self, signed: &SignedTx) -> Result<SourceState>;

    /// Whether the attestation's digest was already consumed on this chain
    async fn is_redeemed(&self, attestation: &Attestation) -> Result<bool>;

    async fn redeem(&self, attestation: &Attestation, signer: &dyn Signer) -> Result<Confirmation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TransferStatus::*;
        assert!(Submitted.can_transition_to(AttestationPending));
        assert!(AttestationPending.can_transition_to(Attested));
        assert!(Attested.can_transition_to(Redeemed));
        assert!(Attested.can_transition_to(Failed));
        assert!(Failed.can_transition_to(AttestationPending));

        assert!(!Submitted.can_transition_to(Redeemed));
        assert!(!Redeemed.can_transition_to(Failed));
        assert!(!Attested.can_transition_to(Submitted));
    }

    #[test]
    fn test_illegal_advance_is_ignored() {
        let request = BridgeRequest {
            source: Chain::Polygon,
            destination: Chain::Solana,
            amount: 5_000_000,
            recipient: "recipient".into(),
            nonce: 1,
        };
        let mut transfer = BridgeTransfer::new(&request, "0xsender".into(), 100);
        assert!(!transfer.advance(TransferStatus::Redeemed, 101));
        assert_eq!(transfer.status, TransferStatus::Submitted);
        assert!(transfer.transfer_id.starts_with("xfer_"));
    }

    #[test]
    fn test_resume_stage_follows_collected_evidence() {
        let key = TransferKey::new(Chain::Solana, "0xAB", 9);
        assert_eq!(key.emitter, "ab");

        let mut transfer = BridgeTransfer::rediscovered(&key, 0);
        transfer.fail("guardians offline".into(), true, 1);
        assert_eq!(transfer.resume_stage(), TransferStatus::AttestationPending);

        transfer.attestation = Some(vec![1]);
        assert_eq!(transfer.resume_stage(), TransferStatus::Attested);
        assert_eq!(transfer.dest_chain, Chain::Polygon);
    }
}
