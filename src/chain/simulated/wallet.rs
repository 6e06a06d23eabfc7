use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use super::Envelope;
use crate::chain::abi::{format_address, keccak256};
use crate::chain::solana::Pubkey;
use crate::chain::{SignedTx, Signer, TxRequest};
use crate::error::{ChainError, EngineError, Result};
use crate::models::{Chain, TxRef};

/// Deterministic wallet derived from a label, for mock mode and tests.
/// Never use outside simulated chains: the key is derived from public data.
#[derive(Debug)]
pub struct SimulatedWallet {
    chain: Chain,
    label: String,
    address: String,
    counter: AtomicU64,
}

impl SimulatedWallet {
    pub fn evm(label: &str) -> Self {
        let hash = keccak256(format!("evm-wallet:{}", label).as_bytes());
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        Self::with_address(Chain::Polygon, label, format_address(&address))
    }

    pub fn solana(label: &str) -> Self {
        let seed: [u8; 32] = Sha256::digest(format!("solana-wallet:{}", label).as_bytes()).into();
        let key = SigningKey::from_bytes(&seed).verifying_key();
        Self::with_address(Chain::Solana, label, Pubkey::new(key.to_bytes()).to_string())
    }

    fn with_address(chain: Chain, label: &str, address: String) -> Self {
        Self {
            chain,
            label: label.to_string(),
            address,
            counter: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address_string(&self) -> String {
        self.address.clone()
    }

    /// Account-model key; the zero key for EVM wallets
    pub fn pubkey(&self) -> Pubkey {
        self.address.parse().unwrap_or_default()
    }
}

pub(crate) fn tx_ref_for(chain: Chain, raw: &str) -> TxRef {
    match chain {
        Chain::Polygon => TxRef::new(format!("0x{}", hex::encode(keccak256(raw.as_bytes())))),
        Chain::Solana => {
            let digest = Sha256::digest(raw.as_bytes());
            let mut signature = digest.to_vec();
            signature.extend_from_slice(&Sha256::digest(&digest));
            TxRef::new(bs58::encode(signature).into_string())
        }
    }
}

#[async_trait]
impl Signer for SimulatedWallet {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign(&self, request: TxRequest) -> Result<SignedTx> {
        if request.chain() != self.chain {
            return Err(EngineError::chain(
                self.chain,
                ChainError::Signer(format!("{} wallet cannot sign a {} transaction", self.chain, request.chain())),
            ));
        }
        let envelope = Envelope {
            signer: self.address.clone(),
            counter: self.counter.fetch_add(1, Ordering::SeqCst),
            request: request.clone(),
        };
        let raw = envelope
            .encode(self.chain)
            .map_err(|e| EngineError::chain(self.chain, e))?;

        Ok(SignedTx {
            chain: self.chain,
            tx_ref: tx_ref_for(self.chain, &raw),
            raw,
            request,
        })
    }
}
