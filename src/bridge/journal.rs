// Durable record of bridge transfers, so a restart can resume every in-flight transfer

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{EngineError, Result};

use super::{BridgeTransfer, TransferKey, TransferStatus};

pub trait TransferJournal: Send + Sync {
    fn save(&self, transfer: &BridgeTransfer) -> Result<()>;

    fn load(&self, transfer_id: &str) -> Result<Option<BridgeTransfer>>;

    fn find_by_key(&self, key: &TransferKey) -> Result<Option<BridgeTransfer>>;

    /// Atomically claim `(sender, nonce)` for `transfer_id`.
    /// Returns the id already holding the pair, if any.
    fn reserve_nonce(&self, sender: &str, nonce: u32, transfer_id: &str) -> Result<Option<String>>;

    /// Every transfer not yet redeemed
    fn unfinished(&self) -> Result<Vec<BridgeTransfer>>;
}

fn nonce_key(sender: &str, nonce: u32) -> String {
    format!("{}:{}", sender.to_lowercase(), nonce)
}

fn source_key(key: &TransferKey) -> String {
    key.to_string()
}

// ============================================================================
// SLED
// ============================================================================

pub struct SledJournal {
    db: sled::Db,
    transfers: sled::Tree,
    by_key: sled::Tree,
    by_nonce: sled::Tree,
}

impl SledJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            transfers: db.open_tree("transfers")?,
            by_key: db.open_tree("transfers_by_key")?,
            by_nonce: db.open_tree("transfers_by_nonce")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl TransferJournal for SledJournal {
    fn save(&self, transfer: &BridgeTransfer) -> Result<()> {
        let bytes = bincode::serialize(transfer)?;
        self.transfers.insert(transfer.transfer_id.as_bytes(), bytes)?;
        if let Some(key) = transfer.key() {
            self.by_key
                .insert(source_key(&key).as_bytes(), transfer.transfer_id.as_bytes())?;
        }
        self.transfers.flush()?;
        Ok(())
    }

    fn load(&self, transfer_id: &str) -> Result<Option<BridgeTransfer>> {
        match self.transfers.get(transfer_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_key(&self, key: &TransferKey) -> Result<Option<BridgeTransfer>> {
        match self.by_key.get(source_key(key).as_bytes())? {
            Some(id) => {
                let id = String::from_utf8(id.to_vec()).map_err(|e| EngineError::Journal(e.to_string()))?;
                self.load(&id)
            }
            None => Ok(None),
        }
    }

    fn reserve_nonce(&self, sender: &str, nonce: u32, transfer_id: &str) -> Result<Option<String>> {
        let key = nonce_key(sender, nonce);
        let outcome = self
            .by_nonce
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(transfer_id.as_bytes()))?;
        match outcome {
            Ok(()) => {
                self.by_nonce.flush()?;
                Ok(None)
            }
            Err(conflict) => {
                let existing = conflict
                    .current
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                Ok(Some(existing))
            }
        }
    }

    fn unfinished(&self) -> Result<Vec<BridgeTransfer>> {
        let mut out = Vec::new();
        for entry in self.transfers.iter() {
            let (_, bytes) = entry?;
            let transfer: BridgeTransfer = bincode::deserialize(&bytes)?;
            if transfer.status != TransferStatus::Redeemed {
                out.push(transfer);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

#[derive(Default)]
struct MemoryState {
    transfers: HashMap<String, BridgeTransfer>,
    by_key: HashMap<String, String>,
    by_nonce: HashMap<String, String>,
}

/// Journal for tests and mock mode. Shared via `Arc` it survives a coordinator restart.
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<MemoryState>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Journal("journal lock poisoned".into()))
    }
}

impl TransferJournal for MemoryJournal {
    fn save(&self, transfer: &BridgeTransfer) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(key) = transfer.key() {
            state
                .by_key
                .insert(source_key(&key), transfer.transfer_id.clone());
        }
        state
            .transfers
            .insert(transfer.transfer_id.clone(), transfer.clone());
        Ok(())
    }

    fn load(&self, transfer_id: &str) -> Result<Option<BridgeTransfer>> {
        Ok(self.lock()?.transfers.get(transfer_id).cloned())
    }

    fn find_by_key(&self, key: &TransferKey) -> Result<Option<BridgeTransfer>> {
        let state = self.lock()?;
        Ok(state
            .by_key
            .get(&source_key(key))
            .and_then(|id| state.transfers.get(id))
            .cloned())
    }

    fn reserve_nonce(&self, sender: &str, nonce: u32, transfer_id: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        let key = nonce_key(sender, nonce);
        if let Some(existing) = state.by_nonce.get(&key) {
            return Ok(Some(existing.clone()));
        }
        state.by_nonce.insert(key, transfer_id.to_string());
        Ok(None)
    }

    fn unfinished(&self) -> Result<Vec<BridgeTransfer>> {
        Ok(self
            .lock()?
            .transfers
            .values()
            .filter(|t| t.status != TransferStatus::Redeemed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeRequest;
    use crate::models::Chain;

    fn transfer() -> BridgeTransfer {
        let request = BridgeRequest {
            source: Chain::Solana,
            destination: Chain::Polygon,
            amount: 10_000_000,
            recipient: "0x00000000000000000000000000000000000000aa".into(),
            nonce: 3,
        };
        BridgeTransfer::new(&request, "Sender111".into(), 1_000)
    }

    fn exercise(journal: &dyn TransferJournal) {
        let mut t = transfer();
        assert_eq!(journal.reserve_nonce("Sender111", 3, &t.transfer_id).unwrap(), None);
        assert_eq!(
            journal.reserve_nonce("Sender111", 3, "other").unwrap(),
            Some(t.transfer_id.clone())
        );
        assert_eq!(journal.reserve_nonce("Sender111", 4, "other").unwrap(), None);

        journal.save(&t).unwrap();
        assert_eq!(journal.load(&t.transfer_id).unwrap(), Some(t.clone()));

        t.emitter = Some("ee".into());
        t.sequence = Some(5);
        t.advance(TransferStatus::AttestationPending, 1_001);
        journal.save(&t).unwrap();

        let key = TransferKey::new(Chain::Solana, "ee", 5);
        assert_eq!(journal.find_by_key(&key).unwrap().unwrap().transfer_id, t.transfer_id);
        assert_eq!(journal.unfinished().unwrap().len(), 1);

        t.advance(TransferStatus::Attested, 1_002);
        t.advance(TransferStatus::Redeemed, 1_003);
        journal.save(&t).unwrap();
        assert!(journal.unfinished().unwrap().is_empty());
    }

    #[test]
    fn test_memory_journal() {
        exercise(&MemoryJournal::new());
    }

    #[test]
    fn test_sled_journal() {
        exercise(&SledJournal::temporary().unwrap());
    }

    #[test]
    fn test_sled_journal_survives_reopen() {
        let path = std::env::temp_dir().join(format!("journal-{}", uuid::Uuid::new_v4()));
        let t = transfer();
        {
            let journal = SledJournal::open(&path).unwrap();
            journal.reserve_nonce("Sender111", 3, &t.transfer_id).unwrap();
            journal.save(&t).unwrap();
            journal.flush().unwrap();
        }
        {
            let journal = SledJournal::open(&path).unwrap();
            assert_eq!(journal.load(&t.transfer_id).unwrap(), Some(t.clone()));
            assert!(journal.reserve_nonce("Sender111", 3, "again").unwrap().is_some());
        }
        let _ = std::fs::remove_dir_all(&path);
    }
}
