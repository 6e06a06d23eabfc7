//! Guardian attestations (VAA v1).
//!
//! Layout (big-endian):
//!
//! ```text
//! version u8 | guardian_set_index u32 | n u8 | n × (index u8, r 32, s 32, v u8)
//! body: timestamp u32 | nonce u32 | emitter_chain u16 | emitter 32 | sequence u64
//!       | consistency u8 | payload
//! ```
//!
//! Guardians sign keccak256(keccak256(body)). A VAA is valid when at least
//! ⌊2n/3⌋+1 distinct guardians of the expected set signed it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::chain::abi::keccak256;
use crate::error::{AttestationError, Result};
use crate::models::Chain;

use super::TransferKey;

pub const VAA_VERSION: u8 = 1;
const SIGNATURE_LEN: usize = 66;
const BODY_HEADER_LEN: usize = 4 + 4 + 2 + 32 + 8 + 1;

/// Token-transfer payload id
pub const PAYLOAD_TRANSFER: u8 = 1;
const TRANSFER_PAYLOAD_LEN: usize = 1 + 32 + 32 + 2 + 32 + 2 + 32;

// ============================================================================
// GUARDIAN SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSet {
    pub index: u32,
    /// Ethereum-style addresses (last 20 bytes of keccak of the public key)
    pub addresses: Vec<[u8; 20]>,
}

impl GuardianSet {
    pub fn new(index: u32, addresses: Vec<[u8; 20]>) -> Self {
        Self { index, addresses }
    }

    /// Signatures needed: ⌊2n/3⌋ + 1
    pub fn quorum(&self) -> usize {
        self.addresses.len() * 2 / 3 + 1
    }

    pub fn from_secret_keys(index: u32, keys: &[SecretKey]) -> Self {
        let secp = Secp256k1::signing_only();
        let addresses = keys
            .iter()
            .map(|k| guardian_address(&PublicKey::from_secret_key(&secp, k)))
            .collect();
        Self::new(index, addresses)
    }
}

pub fn guardian_address(key: &PublicKey) -> [u8; 20] {
    let uncompressed = key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    out
}

// ============================================================================
// PARSING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSignature {
    pub guardian_index: u8,
    /// r ‖ s ‖ v
    pub signature: [u8; 65],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationBody {
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: u16,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl AttestationBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BODY_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.emitter_chain.to_be_bytes());
        out.extend_from_slice(&self.emitter_address);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.push(self.consistency_level);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn digest(&self) -> [u8; 32] {
        keccak256(&keccak256(&self.encode()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signatures: Vec<GuardianSignature>,
    pub body: AttestationBody,
    raw: Vec<u8>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, field: &str) -> std::result::Result<&'a [u8], AttestationError> {
        let end = self.pos + len;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| AttestationError::Malformed(format!("truncated at {}", field)))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &str) -> std::result::Result<[u8; N], AttestationError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u8(&mut self, field: &str) -> std::result::Result<u8, AttestationError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &str) -> std::result::Result<u16, AttestationError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: &str) -> std::result::Result<u32, AttestationError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    fn u64(&mut self, field: &str) -> std::result::Result<u64, AttestationError> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

impl Attestation {
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, AttestationError> {
        let mut r = Reader { data: bytes, pos: 0 };

        let version = r.u8("version")?;
        if version != VAA_VERSION {
            return Err(AttestationError::Malformed(format!("unsupported version {}", version)));
        }
        let guardian_set_index = r.u32("guardian set index")?;
        let count = r.u8("signature count")? as usize;

        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            let guardian_index = r.u8("guardian index")?;
            let signature: [u8; 65] = r.array("signature")?;
            signatures.push(GuardianSignature {
                guardian_index,
                signature,
            });
        }
        debug_assert_eq!(r.pos, 6 + count * SIGNATURE_LEN);

        let body = AttestationBody {
            timestamp: r.u32("timestamp")?,
            nonce: r.u32("nonce")?,
            emitter_chain: r.u16("emitter chain")?,
            emitter_address: r.array("emitter address")?,
            sequence: r.u64("sequence")?,
            consistency_level: r.u8("consistency level")?,
            payload: r.rest().to_vec(),
        };

        Ok(Self {
            version,
            guardian_set_index,
            signatures,
            body,
            raw: bytes.to_vec(),
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn digest(&self) -> [u8; 32] {
        self.body.digest()
    }

    pub fn emitter_hex(&self) -> String {
        hex::encode(self.body.emitter_address)
    }

    /// Check guardian set, signature validity and quorum
    pub fn verify(&self, set: &GuardianSet) -> std::result::Result<(), AttestationError> {
        if self.guardian_set_index != set.index {
            return Err(AttestationError::GuardianSetMismatch {
                expected: set.index,
                got: self.guardian_set_index,
            });
        }

        let secp = Secp256k1::verification_only();
        let message = Message::from_digest_slice(&self.digest())
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;

        let mut last_index: Option<u8> = None;
        let mut valid = 0;
        for sig in &self.signatures {
            if let Some(prev) = last_index {
                if sig.guardian_index <= prev {
                    return Err(AttestationError::Malformed(
                        "guardian indices must be strictly increasing".into(),
                    ));
                }
            }
            last_index = Some(sig.guardian_index);

            let expected = set
                .addresses
                .get(sig.guardian_index as usize)
                .ok_or_else(|| AttestationError::Malformed(format!("guardian index {} out of range", sig.guardian_index)))?;

            match recover_address(&secp, &message, &sig.signature) {
                Some(address) if &address == expected => valid += 1,
                _ => debug!(guardian = sig.guardian_index, "signature does not match guardian"),
            }
        }

        let required = set.quorum();
        if valid < required {
            return Err(AttestationError::QuorumNotReached { valid, required });
        }
        Ok(())
    }

    /// Check the attestation belongs to the message identified by `key`
    pub fn check_source(&self, key: &TransferKey) -> std::result::Result<(), AttestationError> {
        if self.body.emitter_chain != key.chain.wormhole_id() {
            return Err(AttestationError::InvalidEmitter(format!(
                "emitter chain {} is not {}",
                self.body.emitter_chain, key.chain
            )));
        }
        if self.emitter_hex() != key.emitter {
            return Err(AttestationError::InvalidEmitter(format!(
                "emitter {} is not {}",
                self.emitter_hex(),
                key.emitter
            )));
        }
        if self.body.sequence != key.sequence {
            return Err(AttestationError::InvalidEmitter(format!(
                "sequence {} is not {}",
                self.body.sequence, key.sequence
            )));
        }
        Ok(())
    }

    pub fn transfer_payload(&self) -> std::result::Result<TransferPayload, AttestationError> {
        TransferPayload::parse(&self.body.payload)
    }
}

fn recover_address(
    secp: &Secp256k1<secp256k1::VerifyOnly>,
    message: &Message,
    signature: &[u8; 65],
) -> Option<[u8; 20]> {
    let v = signature[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(v as i32).ok()?;
    let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id).ok()?;
    let key = secp.recover_ecdsa(message, &sig).ok()?;
    Some(guardian_address(&key))
}

/// Assemble and sign an attestation with `(guardian_index, key)` pairs
pub fn sign(body: &AttestationBody, set_index: u32, guardians: &[(u8, SecretKey)]) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let digest = body.digest();
    let mut out = vec![VAA_VERSION];
    out.extend_from_slice(&set_index.to_be_bytes());
    out.push(guardians.len() as u8);

    for (index, key) in guardians {
        out.push(*index);
        match Message::from_digest_slice(&digest) {
            Ok(message) => {
                let (recovery_id, compact) = secp.sign_ecdsa_recoverable(&message, key).serialize_compact();
                out.extend_from_slice(&compact);
                out.push(recovery_id.to_i32() as u8);
            }
            Err(_) => out.extend_from_slice(&[0u8; 65]),
        }
    }
    out.extend_from_slice(&body.encode());
    out
}

// ============================================================================
// TRANSFER PAYLOAD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPayload {
    pub amount: u64,
    pub token_address: [u8; 32],
    pub token_chain: u16,
    pub recipient: [u8; 32],
    pub recipient_chain: u16,
    pub fee: u64,
}

fn u256_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn word_to_u64(word: &[u8; 32], field: &str) -> std::result::Result<u64, AttestationError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(AttestationError::Malformed(format!("{} exceeds 64 bits", field)));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

impl TransferPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TRANSFER_PAYLOAD_LEN);
        out.push(PAYLOAD_TRANSFER);
        out.extend_from_slice(&u256_word(self.amount));
        out.extend_from_slice(&self.token_address);
        out.extend_from_slice(&self.token_chain.to_be_bytes());
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.recipient_chain.to_be_bytes());
        out.extend_from_slice(&u256_word(self.fee));
        out
    }

    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, AttestationError> {
        if bytes.len() != TRANSFER_PAYLOAD_LEN {
            return Err(AttestationError::Malformed(format!(
                "transfer payload is {} bytes, expected {}",
                bytes.len(),
                TRANSFER_PAYLOAD_LEN
            )));
        }
        let mut r = Reader { data: bytes, pos: 0 };
        let id = r.u8("payload id")?;
        if id != PAYLOAD_TRANSFER {
            return Err(AttestationError::Malformed(format!("unexpected payload id {}", id)));
        }
        let amount = word_to_u64(&r.array("amount")?, "amount")?;
        let token_address = r.array("token address")?;
        let token_chain = r.u16("token chain")?;
        let recipient = r.array("recipient")?;
        let recipient_chain = r.u16("recipient chain")?;
        let fee = word_to_u64(&r.array("fee")?, "fee")?;

        Ok(Self {
            amount,
            token_address,
            token_chain,
            recipient,
            recipient_chain,
            fee,
        })
    }

    pub fn destination(&self) -> std::result::Result<Chain, AttestationError> {
        Chain::from_wormhole_id(self.recipient_chain).ok_or_else(|| {
            AttestationError::PayloadMismatch(format!("unknown recipient chain {}", self.recipient_chain))
        })
    }
}

// ============================================================================
// GUARDIAN NETWORK CLIENT
// ============================================================================

/// Source of signed attestations
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// `Ok(None)` while the guardians have not published a signed attestation
    async fn fetch(&self, emitter_chain: u16, emitter: &str, sequence: u64) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// HTTP client for the guardian network's signed-VAA endpoint
pub struct GuardianClient {
    base_url: String,
    client: Client,
}

impl GuardianClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl AttestationSource for GuardianClient {
    async fn fetch(&self, emitter_chain: u16, emitter: &str, sequence: u64) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/v1/signed_vaa/{}/{}/{}", self.base_url, emitter_chain, emitter, sequence);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AttestationError::Unreachable(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AttestationError::Unreachable(format!("guardian api returned {}", response.status())).into());
        }

        let body: SignedVaaResponse = response
            .json()
            .await
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;

        let bytes = BASE64
            .decode(body.vaa_bytes.as_bytes())
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        Ok(Some(bytes))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u8) -> Vec<SecretKey> {
        (1..=n)
            .map(|i| SecretKey::from_slice(&keccak256(&[i])).unwrap())
            .collect()
    }

    fn body() -> AttestationBody {
        let payload = TransferPayload {
            amount: 25_000_000,
            token_address: [9u8; 32],
            token_chain: Chain::Polygon.wormhole_id(),
            recipient: [4u8; 32],
            recipient_chain: Chain::Solana.wormhole_id(),
            fee: 0,
        };
        AttestationBody {
            timestamp: 1_700_000_000,
            nonce: 7,
            emitter_chain: Chain::Polygon.wormhole_id(),
            emitter_address: [1u8; 32],
            sequence: 42,
            consistency_level: 1,
            payload: payload.encode(),
        }
    }

    fn signed_by(keys: &[SecretKey], count: usize) -> Vec<u8> {
        let signers: Vec<(u8, SecretKey)> = keys.iter().take(count).enumerate().map(|(i, k)| (i as u8, *k)).collect();
        sign(&body(), 0, &signers)
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(GuardianSet::new(0, vec![[0; 20]; 1]).quorum(), 1);
        assert_eq!(GuardianSet::new(0, vec![[0; 20]; 3]).quorum(), 3);
        assert_eq!(GuardianSet::new(0, vec![[0; 20]; 19]).quorum(), 13);
    }

    #[test]
    fn test_quorum_signed_attestation_verifies() {
        let keys = keys(4);
        let set = GuardianSet::from_secret_keys(0, &keys);
        let vaa = Attestation::parse(&signed_by(&keys, 3)).unwrap();

        vaa.verify(&set).unwrap();
        assert_eq!(vaa.body, body());
        let payload = vaa.transfer_payload().unwrap();
        assert_eq!(payload.amount, 25_000_000);
        assert_eq!(payload.destination().unwrap(), Chain::Solana);
    }

    #[test]
    fn test_below_quorum_is_retryable() {
        let keys = keys(4);
        let set = GuardianSet::from_secret_keys(0, &keys);
        let vaa = Attestation::parse(&signed_by(&keys, 2)).unwrap();
        let err = vaa.verify(&set).unwrap_err();
        assert_eq!(err, AttestationError::QuorumNotReached { valid: 2, required: 3 });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_tampered_body_fails_verification() {
        let keys = keys(4);
        let set = GuardianSet::from_secret_keys(0, &keys);
        let mut bytes = signed_by(&keys, 4);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let vaa = Attestation::parse(&bytes).unwrap();
        assert!(matches!(vaa.verify(&set), Err(AttestationError::QuorumNotReached { valid: 0, .. })));
    }

    #[test]
    fn test_truncated_attestation_is_malformed() {
        let keys = keys(4);
        let bytes = signed_by(&keys, 3);
        let err = Attestation::parse(&bytes[..20]).unwrap_err();
        assert!(matches!(err, AttestationError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_wrong_guardian_set_rejected() {
        let keys = keys(4);
        let set = GuardianSet::from_secret_keys(1, &keys);
        let vaa = Attestation::parse(&signed_by(&keys, 4)).unwrap();
        assert_eq!(
            vaa.verify(&set),
            Err(AttestationError::GuardianSetMismatch { expected: 1, got: 0 })
        );
    }

    #[test]
    fn test_source_mismatch_is_invalid_emitter() {
        let keys = keys(1);
        let vaa = Attestation::parse(&signed_by(&keys, 1)).unwrap();
        let key = TransferKey::new(Chain::Polygon, hex::encode([1u8; 32]), 42);
        vaa.check_source(&key).unwrap();

        let other = TransferKey::new(Chain::Polygon, hex::encode([2u8; 32]), 42);
        assert!(matches!(vaa.check_source(&other), Err(AttestationError::InvalidEmitter(_))));
    }
}
