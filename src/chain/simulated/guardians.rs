use async_trait::async_trait;
use secp256k1::SecretKey;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::MessageSource;
use crate::bridge::attestation::{self, AttestationBody, AttestationSource, GuardianSet, TransferPayload};
use crate::chain::abi::keccak256;
use crate::error::{AttestationError, Result};

/// Consistency level stamped on simulated attestations (finalized)
const CONSISTENCY_FINALIZED: u8 = 1;

/// Guardian network that observes the simulated bridges and signs their
/// finalized messages.
pub struct SimulatedGuardians {
    set_index: u32,
    keys: Vec<SecretKey>,
    sources: RwLock<Vec<Arc<dyn MessageSource>>>,
    signing: AtomicUsize,
    withheld: AtomicBool,
    offline: AtomicBool,
}

fn guardian_key(index: usize) -> SecretKey {
    let mut salt = 0u32;
    loop {
        let seed = keccak256(format!("guardian:{}:{}", index, salt).as_bytes());
        if let Ok(key) = SecretKey::from_slice(&seed) {
            return key;
        }
        salt += 1;
    }
}

impl SimulatedGuardians {
    pub fn new(count: usize, set_index: u32) -> Self {
        let keys: Vec<SecretKey> = (0..count).map(guardian_key).collect();
        Self {
            set_index,
            signing: AtomicUsize::new(keys.len()),
            keys,
            sources: RwLock::new(Vec::new()),
            withheld: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        }
    }

    pub fn guardian_set(&self) -> GuardianSet {
        GuardianSet::from_secret_keys(self.set_index, &self.keys)
    }

    pub fn add_source(&self, source: Arc<dyn MessageSource>) {
        if let Ok(mut sources) = self.sources.write() {
            sources.push(source);
        }
    }

    /// How many guardians sign each attestation
    pub fn set_signing(&self, count: usize) {
        self.signing.store(count.min(self.keys.len()), Ordering::SeqCst);
    }

    /// Guardians observe but do not publish
    pub fn set_withheld(&self, withheld: bool) {
        self.withheld.store(withheld, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn source_for(&self, emitter_chain: u16, emitter: &str) -> Option<Arc<dyn MessageSource>> {
        let sources = self.sources.read().ok()?;
        sources
            .iter()
            .find(|s| s.chain().wormhole_id() == emitter_chain && hex::encode(s.emitter()) == emitter)
            .cloned()
    }
}

#[async_trait]
impl AttestationSource for SimulatedGuardians {
    async fn fetch(&self, emitter_chain: u16, emitter: &str, sequence: u64) -> Result<Option<Vec<u8>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AttestationError::Unreachable("guardian network offline".into()).into());
        }
        if self.withheld.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let emitter = emitter.trim_start_matches("0x").to_lowercase();
        let source = match self.source_for(emitter_chain, &emitter) {
            Some(source) => source,
            None => return Ok(None),
        };
        let message = match source.message(sequence) {
            Some((message, true)) => message,
            // not observed, or not final yet
            _ => return Ok(None),
        };

        let payload = TransferPayload {
            amount: message.amount,
            token_address: message.token_address,
            token_chain: emitter_chain,
            recipient: message.recipient,
            recipient_chain: message.recipient_chain,
            fee: 0,
        };
        let body = AttestationBody {
            timestamp: message.timestamp,
            nonce: message.nonce,
            emitter_chain,
            emitter_address: source.emitter(),
            sequence,
            consistency_level: CONSISTENCY_FINALIZED,
            payload: payload.encode(),
        };

        let signing = self.signing.load(Ordering::SeqCst);
        let signers: Vec<(u8, SecretKey)> = self
            .keys
            .iter()
            .take(signing)
            .enumerate()
            .map(|(i, k)| (i as u8, *k))
            .collect();
        debug!(emitter_chain, sequence, signers = signers.len(), "guardians signed message");
        Ok(Some(attestation::sign(&body, self.set_index, &signers)))
    }
}
