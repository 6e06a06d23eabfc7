//! Drives bridge transfers through their lifecycle.
//!
//! One driver task runs per in-flight transfer. Every transition is written
//! to the journal before the next step starts, so a crash at any point can be
//! picked up again with `resume` / `resume_pending`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::attestation::{Attestation, AttestationSource, GuardianSet};
use super::journal::TransferJournal;
use super::{normalize_emitter, BridgeEndpoint, BridgeRequest, BridgeTransfer, SourceState, TransferKey, TransferStatus};
use crate::chain::{decode_address, encode_address, ensure_signer_chain, SignedTx, Signer};
use crate::clock::{Clock, SystemClock};
use crate::error::{AttestationError, ChainError, EngineError, Result, StateError, ValidationError};
use crate::models::Chain;
use crate::retry::RetryPolicy;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Polling budget while the source lock reaches finality
    pub finality_retry: RetryPolicy,
    /// Polling budget while guardians assemble a quorum
    pub attestation_retry: RetryPolicy,
    /// Budget for individual chain calls made by the driver (redeem, lookups)
    pub step_retry: RetryPolicy,
    /// How long `status` answers from memory before re-reading the journal
    pub status_ttl: Duration,
}

impl CoordinatorConfig {
    /// Zero-wait budgets for tests
    pub fn immediate(attempts: u32) -> Self {
        Self {
            finality_retry: RetryPolicy::immediate(attempts),
            attestation_retry: RetryPolicy::immediate(attempts),
            step_retry: RetryPolicy::immediate(attempts),
            status_ttl: Duration::from_secs(10),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // Polygon checkpoints take minutes
            finality_retry: RetryPolicy::new(120, Duration::from_secs(2), Duration::from_secs(30))
                .with_jitter(Duration::from_millis(500)),
            attestation_retry: RetryPolicy::new(60, Duration::from_secs(2), Duration::from_secs(60))
                .with_jitter(Duration::from_millis(500)),
            step_retry: RetryPolicy::default(),
            status_ttl: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Cheap to clone; all clones share the same driver tasks and caches.
#[derive(Clone)]
pub struct BridgeCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: HashMap<Chain, Arc<dyn BridgeEndpoint>>,
    attestations: Arc<dyn AttestationSource>,
    guardian_set: GuardianSet,
    journal: Arc<dyn TransferJournal>,
    relayers: HashMap<Chain, Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    /// Latest state of every transfer with a live driver
    running: Mutex<HashMap<String, watch::Receiver<BridgeTransfer>>>,
    status_cache: Mutex<HashMap<TransferKey, (Instant, BridgeTransfer)>>,
}

pub struct BridgeCoordinatorBuilder {
    endpoints: HashMap<Chain, Arc<dyn BridgeEndpoint>>,
    attestations: Arc<dyn AttestationSource>,
    guardian_set: GuardianSet,
    journal: Arc<dyn TransferJournal>,
    relayers: HashMap<Chain, Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl BridgeCoordinatorBuilder {
    pub fn endpoint(mut self, endpoint: Arc<dyn BridgeEndpoint>) -> Self {
        self.endpoints.insert(endpoint.chain(), endpoint);
        self
    }

    /// Signer that pays for redemptions on its chain
    pub fn relayer(mut self, relayer: Arc<dyn Signer>) -> Self {
        self.relayers.insert(relayer.chain(), relayer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> BridgeCoordinator {
        BridgeCoordinator {
            inner: Arc::new(Inner {
                endpoints: self.endpoints,
                attestations: self.attestations,
                guardian_set: self.guardian_set,
                journal: self.journal,
                relayers: self.relayers,
                clock: self.clock,
                config: self.config,
                running: Mutex::new(HashMap::new()),
                status_cache: Mutex::new(HashMap::new()),
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BridgeCoordinator {
    pub fn builder(
        attestations: Arc<dyn AttestationSource>,
        guardian_set: GuardianSet,
        journal: Arc<dyn TransferJournal>,
    ) -> BridgeCoordinatorBuilder {
        BridgeCoordinatorBuilder {
            endpoints: HashMap::new(),
            attestations,
            guardian_set,
            journal,
            relayers: HashMap::new(),
            clock: Arc::new(SystemClock),
            config: CoordinatorConfig::default(),
        }
    }

    pub fn supports(&self, chain: Chain) -> bool {
        self.inner.endpoints.contains_key(&chain)
    }

    /// Validate, sign and persist the source lock, then hand the transfer to a
    /// background driver. Returns the freshly persisted record (status `Submitted`).
    pub async fn submit(&self, request: BridgeRequest, signer: &dyn Signer) -> Result<BridgeTransfer> {
        let inner = &self.inner;
        if request.amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        if request.source == request.destination {
            return Err(ValidationError::SameChainTransfer(request.source).into());
        }
        ensure_signer_chain(signer, request.source)?;
        let source = inner.endpoint(request.source)?;
        inner.endpoint(request.destination)?;
        if encode_address(request.destination, &request.recipient).is_none() {
            return Err(ValidationError::InvalidAddress {
                chain: request.destination,
                address: request.recipient.clone(),
            }
            .into());
        }

        let sender = signer.address();
        let mut transfer = BridgeTransfer::new(&request, sender.clone(), inner.clock.now());
        if let Some(existing) = inner.journal.reserve_nonce(&sender, request.nonce, &transfer.transfer_id)? {
            return Err(StateError::DuplicateTransfer {
                sender,
                nonce: request.nonce,
                existing,
            }
            .into());
        }

        let signed = match source.prepare_lock(&request, signer).await {
            Ok(signed) => signed,
            Err(err) => {
                // nonce stays reserved; the record explains why it was burned
                transfer.fail(err.to_string(), false, inner.clock.now());
                inner.journal.save(&transfer)?;
                return Err(err);
            }
        };

        // Persist the exact bytes before anything reaches the network
        transfer.source_tx = Some(signed.tx_ref.clone());
        transfer.signed_source_tx = Some(signed);
        inner.journal.save(&transfer)?;

        info!(
            transfer_id = %transfer.transfer_id,
            source = %request.source,
            destination = %request.destination,
            amount = request.amount,
            "bridge transfer submitted"
        );

        let mut running = lock(&inner.running);
        self.spawn_locked(&mut running, transfer.clone());
        Ok(transfer)
    }

    /// Submit and block until the transfer is redeemed or fails
    pub async fn submit_and_wait(&self, request: BridgeRequest, signer: &dyn Signer) -> Result<BridgeTransfer> {
        let transfer = self.submit(request, signer).await?;
        self.wait(&transfer.transfer_id).await
    }

    /// Pick a transfer back up knowing only its emitted message. Works with an
    /// empty journal: the record is rebuilt from the attestation payload.
    pub async fn resume(&self, key: &TransferKey) -> Result<BridgeTransfer> {
        let key = TransferKey::new(key.chain, normalize_emitter(&key.emitter), key.sequence);
        self.inner.endpoint(key.chain)?;
        let transfer = match self.inner.journal.find_by_key(&key)? {
            Some(transfer) => transfer,
            None => {
                self.inner.check_emitter(&key)?;
                let transfer = BridgeTransfer::rediscovered(&key, self.inner.clock.now());
                info!(transfer_id = %transfer.transfer_id, key = %key, "rediscovered transfer");
                self.inner.journal.save(&transfer)?;
                transfer
            }
        };
        self.restart(transfer).await
    }

    pub async fn resume_transfer(&self, transfer_id: &str) -> Result<BridgeTransfer> {
        let transfer = self
            .inner
            .journal
            .load(transfer_id)?
            .ok_or_else(|| StateError::TransferNotFound(transfer_id.to_string()))?;
        self.restart(transfer).await
    }

    /// Restart drivers for every unfinished, recoverable transfer in the journal.
    /// Does not wait; returns the ids that were started.
    pub fn resume_pending(&self) -> Result<Vec<String>> {
        let mut started = Vec::new();
        for transfer in self.inner.journal.unfinished()? {
            if transfer.status == TransferStatus::Failed && !transfer.recoverable {
                continue;
            }
            let mut running = lock(&self.inner.running);
            if running.contains_key(&transfer.transfer_id) {
                continue;
            }
            let mut transfer = transfer;
            if let Err(err) = self.inner.reopen(&mut transfer) {
                debug!(transfer_id = %transfer.transfer_id, error = %err, "skipping transfer");
                continue;
            }
            started.push(transfer.transfer_id.clone());
            self.spawn_locked(&mut running, transfer);
        }
        if !started.is_empty() {
            info!(count = started.len(), "resumed pending transfers");
        }
        Ok(started)
    }

    /// Wait for a transfer to reach Redeemed or Failed
    pub async fn wait(&self, transfer_id: &str) -> Result<BridgeTransfer> {
        let receiver = lock(&self.inner.running).get(transfer_id).cloned();
        match receiver {
            Some(receiver) => Ok(wait_terminal(receiver).await),
            None => self
                .inner
                .journal
                .load(transfer_id)?
                .ok_or_else(|| StateError::TransferNotFound(transfer_id.to_string()).into()),
        }
    }

    /// Latest known state, live drivers first
    pub fn transfer(&self, transfer_id: &str) -> Result<Option<BridgeTransfer>> {
        if let Some(receiver) = lock(&self.inner.running).get(transfer_id) {
            return Ok(Some(receiver.borrow().clone()));
        }
        self.inner.journal.load(transfer_id)
    }

    /// Status lookup by message identity, answered from a short-lived cache
    pub fn status(&self, key: &TransferKey) -> Result<Option<BridgeTransfer>> {
        let key = TransferKey::new(key.chain, normalize_emitter(&key.emitter), key.sequence);
        let ttl = self.inner.config.status_ttl;
        if let Some((cached_at, transfer)) = lock(&self.inner.status_cache).get(&key) {
            if cached_at.elapsed() < ttl {
                return Ok(Some(transfer.clone()));
            }
        }

        let found = self.inner.journal.find_by_key(&key)?;
        if let Some(transfer) = &found {
            lock(&self.inner.status_cache).insert(key, (Instant::now(), transfer.clone()));
        }
        Ok(found)
    }

    pub fn unfinished(&self) -> Result<Vec<BridgeTransfer>> {
        self.inner.journal.unfinished()
    }

    async fn restart(&self, mut transfer: BridgeTransfer) -> Result<BridgeTransfer> {
        if transfer.status == TransferStatus::Redeemed {
            return Ok(transfer);
        }
        let receiver = {
            let mut running = lock(&self.inner.running);
            match running.get(&transfer.transfer_id) {
                Some(receiver) => receiver.clone(),
                None => {
                    self.inner.reopen(&mut transfer)?;
                    self.spawn_locked(&mut running, transfer)
                }
            }
        };
        Ok(wait_terminal(receiver).await)
    }

    fn spawn_locked(
        &self,
        running: &mut HashMap<String, watch::Receiver<BridgeTransfer>>,
        transfer: BridgeTransfer,
    ) -> watch::Receiver<BridgeTransfer> {
        let transfer_id = transfer.transfer_id.clone();
        let (sender, receiver) = watch::channel(transfer.clone());
        running.insert(transfer_id.clone(), receiver.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let done = inner.drive(transfer, &sender).await;
            debug!(transfer_id = %transfer_id, status = %done.status, "driver finished");
            lock(&inner.running).remove(&transfer_id);
        });
        receiver
    }
}

async fn wait_terminal(mut receiver: watch::Receiver<BridgeTransfer>) -> BridgeTransfer {
    let done = receiver
        .wait_for(|t| t.status.is_terminal())
        .await
        .map(|t| (*t).clone());
    match done {
        Ok(transfer) => transfer,
        // driver exited without a terminal state (journal unavailable)
        Err(_) => receiver.borrow().clone(),
    }
}

/// Errors that no amount of waiting will fix
fn is_recoverable(err: &EngineError) -> bool {
    match err {
        EngineError::Validation(_) => false,
        EngineError::Attestation(
            AttestationError::Malformed(_)
            | AttestationError::InvalidEmitter(_)
            | AttestationError::PayloadMismatch(_)
            | AttestationError::GuardianSetMismatch { .. },
        ) => false,
        EngineError::Chain {
            error: ChainError::Reverted { .. },
            ..
        } => false,
        _ => true,
    }
}

// ============================================================================
// DRIVER
// ============================================================================

impl Inner {
    fn endpoint(&self, chain: Chain) -> Result<Arc<dyn BridgeEndpoint>> {
        self.endpoints
            .get(&chain)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedChain(chain).into())
    }

    /// Only messages from the bridge's own emitter on each chain can be attested
    fn check_emitter(&self, key: &TransferKey) -> Result<()> {
        let expected = normalize_emitter(&self.endpoint(key.chain)?.emitter_address());
        if key.emitter != expected {
            return Err(AttestationError::InvalidEmitter(format!(
                "{} is not the {} bridge emitter {}",
                key.emitter, key.chain, expected
            ))
            .into());
        }
        Ok(())
    }

    /// Move a failed transfer back to the stage its evidence supports.
    /// A record with a foreign emitter is failed for good instead.
    fn reopen(&self, transfer: &mut BridgeTransfer) -> Result<()> {
        if let Some(key) = transfer.key() {
            if let Err(err) = self.check_emitter(&key) {
                warn!(transfer_id = %transfer.transfer_id, error = %err, "transfer cannot be resumed");
                transfer.fail(err.to_string(), false, self.clock.now());
                self.journal.save(transfer)?;
                return Err(err);
            }
        }
        if transfer.status != TransferStatus::Failed {
            return Ok(());
        }
        let stage = transfer.resume_stage();
        if stage == TransferStatus::Submitted && transfer.signed_source_tx.is_none() {
            return Err(StateError::TransferStuck {
                transfer_id: transfer.transfer_id.clone(),
                reason: "source lock was never signed".into(),
            }
            .into());
        }
        transfer.advance(stage, self.clock.now());
        transfer.recoverable = true;
        self.journal.save(transfer)?;
        info!(transfer_id = %transfer.transfer_id, stage = %stage, "reopened failed transfer");
        Ok(())
    }

    fn persist(&self, transfer: &BridgeTransfer, updates: &watch::Sender<BridgeTransfer>) -> Result<()> {
        self.journal.save(transfer)?;
        if let Some(key) = transfer.key() {
            lock(&self.status_cache).insert(key, (Instant::now(), transfer.clone()));
        }
        updates.send_replace(transfer.clone());
        Ok(())
    }

    async fn drive(&self, mut transfer: BridgeTransfer, updates: &watch::Sender<BridgeTransfer>) -> BridgeTransfer {
        loop {
            let step = match transfer.status {
                TransferStatus::Submitted => self.await_source(&mut transfer).await,
                TransferStatus::AttestationPending => self.collect_attestation(&mut transfer).await,
                TransferStatus::Attested => self.redeem(&mut transfer).await,
                TransferStatus::Redeemed | TransferStatus::Failed => return transfer,
            };
            transfer.attempts = transfer.attempts.saturating_add(1);
            let now = self.clock.now();

            match step {
                Ok(next) => {
                    let from = transfer.status;
                    if transfer.advance(next, now) {
                        info!(transfer_id = %transfer.transfer_id, from = %from, to = %next, "transfer advanced");
                    } else {
                        transfer.fail(format!("illegal transition {} -> {}", from, next), false, now);
                    }
                }
                Err(err) => {
                    let recoverable = is_recoverable(&err);
                    error!(
                        transfer_id = %transfer.transfer_id,
                        status = %transfer.status,
                        recoverable,
                        error = %err,
                        "transfer failed"
                    );
                    transfer.fail(err.to_string(), recoverable, now);
                }
            }

            if let Err(err) = self.persist(&transfer, updates) {
                error!(transfer_id = %transfer.transfer_id, error = %err, "journal write failed, stopping driver");
                transfer.fail(err.to_string(), true, self.clock.now());
                updates.send_replace(transfer.clone());
                return transfer;
            }
        }
    }

    /// Submitted -> AttestationPending: (re)broadcast the stored lock and wait for finality
    async fn await_source(&self, transfer: &mut BridgeTransfer) -> Result<TransferStatus> {
        let source = self.endpoint(transfer.source_chain)?;
        let signed = transfer
            .signed_source_tx
            .clone()
            .ok_or_else(|| StateError::TransferStuck {
                transfer_id: transfer.transfer_id.clone(),
                reason: "no signed source transaction".into(),
            })?;

        source.broadcast_lock(&signed).await?;

        let started = Instant::now();
        let (emitter, sequence) = self
            .config
            .finality_retry
            .run("source_finality", |_| poll_source(source.as_ref(), &signed, started))
            .await?;

        debug!(transfer_id = %transfer.transfer_id, emitter = %emitter, sequence, "source message emitted");
        transfer.emitter = Some(normalize_emitter(&emitter));
        transfer.sequence = Some(sequence);
        Ok(TransferStatus::AttestationPending)
    }

    /// AttestationPending -> Attested (or straight to Redeemed if someone beat us to it)
    async fn collect_attestation(&self, transfer: &mut BridgeTransfer) -> Result<TransferStatus> {
        let key = transfer.key().ok_or_else(|| StateError::TransferStuck {
            transfer_id: transfer.transfer_id.clone(),
            reason: "no emitted message to attest".into(),
        })?;
        self.check_emitter(&key)?;

        let attestation = self
            .config
            .attestation_retry
            .run("fetch_attestation", |_| self.fetch_verified(&key))
            .await?;

        let payload = attestation.transfer_payload()?;
        let destination = payload.destination()?;
        if transfer.amount == 0 {
            // rediscovered: the payload is the only record of the request
            transfer.amount = payload.amount;
            transfer.dest_chain = destination;
            transfer.recipient = decode_address(destination, &payload.recipient);
        } else if payload.amount != transfer.amount || destination != transfer.dest_chain {
            return Err(AttestationError::PayloadMismatch(format!(
                "attested {} to {}, expected {} to {}",
                payload.amount, destination, transfer.amount, transfer.dest_chain
            ))
            .into());
        }

        transfer.attestation = Some(attestation.raw().to_vec());

        let dest = self.endpoint(transfer.dest_chain)?;
        let redeemed = self
            .config
            .step_retry
            .run("is_redeemed", |_| dest.is_redeemed(&attestation))
            .await?;
        if redeemed {
            info!(transfer_id = %transfer.transfer_id, "attestation already redeemed");
            return Ok(TransferStatus::Redeemed);
        }
        Ok(TransferStatus::Attested)
    }

    async fn fetch_verified(&self, key: &TransferKey) -> Result<Attestation> {
        let emitter_chain = key.chain.wormhole_id();
        let bytes = self
            .attestations
            .fetch(emitter_chain, &key.emitter, key.sequence)
            .await?
            .ok_or_else(|| AttestationError::NotAvailable {
                emitter_chain,
                emitter: key.emitter.clone(),
                sequence: key.sequence,
            })?;
        let attestation = Attestation::parse(&bytes)?;
        attestation.check_source(key)?;
        attestation.verify(&self.guardian_set)?;
        Ok(attestation)
    }

    /// Attested -> Redeemed. Checks the consumed flag first so a transfer is
    /// never redeemed twice, even across crashes.
    async fn redeem(&self, transfer: &mut BridgeTransfer) -> Result<TransferStatus> {
        let bytes = transfer.attestation.clone().ok_or_else(|| StateError::TransferStuck {
            transfer_id: transfer.transfer_id.clone(),
            reason: "no attestation stored".into(),
        })?;
        let attestation = Attestation::parse(&bytes)?;
        let dest = self.endpoint(transfer.dest_chain)?;
        let relayer = self
            .relayers
            .get(&transfer.dest_chain)
            .cloned()
            .ok_or(StateError::MissingSigner(transfer.dest_chain))?;

        let outcome = self
            .config
            .step_retry
            .run("redeem", |_| async {
                if dest.is_redeemed(&attestation).await? {
                    return Ok(None);
                }
                dest.redeem(&attestation, relayer.as_ref()).await.map(Some)
            })
            .await;

        match outcome {
            Ok(Some(confirmation)) => {
                info!(
                    transfer_id = %transfer.transfer_id,
                    dest_tx = %confirmation.tx_ref,
                    amount = transfer.amount,
                    "transfer redeemed"
                );
                transfer.dest_tx = Some(confirmation.tx_ref);
            }
            Ok(None) => info!(transfer_id = %transfer.transfer_id, "already redeemed on destination"),
            Err(err) => {
                // a competing relayer may have consumed it between our check and send
                if dest.is_redeemed(&attestation).await.unwrap_or(false) {
                    warn!(transfer_id = %transfer.transfer_id, error = %err, "redeem lost race, already redeemed");
                } else {
                    return Err(err);
                }
            }
        }
        Ok(TransferStatus::Redeemed)
    }
}

async fn poll_source(source: &dyn BridgeEndpoint, signed: &SignedTx, started: Instant) -> Result<(String, u64)> {
    let pending = || EngineError::ConfirmationTimeout {
        chain: signed.chain,
        tx_ref: signed.tx_ref.clone(),
        waited_ms: started.elapsed().as_millis() as u64,
    };
    match source.source_state(signed).await? {
        SourceState::Emitted { emitter, sequence } => Ok((emitter, sequence)),
        SourceState::Pending => Err(pending()),
        SourceState::Unknown => {
            // dropped from the mempool; the same bytes keep the same hash
            source.broadcast_lock(signed).await?;
            Err(pending())
        }
        SourceState::Reverted(reason) => Err(EngineError::chain_tx(
            signed.chain,
            ChainError::Reverted {
                tx_ref: signed.tx_ref.clone(),
                reason,
            },
            &signed.tx_ref,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::{FeeRate, USDC_UNIT};
    use crate::bridge::MemoryJournal;
    use crate::chain::simulated::{SimulatedNetwork, SimulatedWallet};
    use crate::chain::ConfirmationPolicy;
    use crate::clock::ManualClock;

    struct Harness {
        network: SimulatedNetwork,
        coordinator: BridgeCoordinator,
        journal: Arc<MemoryJournal>,
    }

    fn harness(attempts: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let network = SimulatedNetwork::new(clock.clone(), FeeRate::default());
        let polygon = network.polygon_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
        let solana = network.solana_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
        let journal = Arc::new(MemoryJournal::new());
        let coordinator = BridgeCoordinator::builder(
            network.guardians.clone(),
            network.guardians.guardian_set(),
            journal.clone(),
        )
        .endpoint(Arc::new(polygon))
        .endpoint(Arc::new(solana))
        .relayer(Arc::new(SimulatedWallet::evm("relayer")))
        .relayer(Arc::new(SimulatedWallet::solana("relayer")))
        .clock(clock)
        .config(CoordinatorConfig::immediate(attempts))
        .build();
        Harness {
            network,
            coordinator,
            journal,
        }
    }

    fn to_solana(amount: u64, nonce: u32, recipient: &SimulatedWallet) -> BridgeRequest {
        BridgeRequest {
            source: Chain::Polygon,
            destination: Chain::Solana,
            amount,
            recipient: recipient.address(),
            nonce,
        }
    }

    #[tokio::test]
    async fn test_polygon_to_solana_redeems() {
        let h = harness(5);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 50 * USDC_UNIT);

        let done = h
            .coordinator
            .submit_and_wait(to_solana(20 * USDC_UNIT, 1, &bob), &alice)
            .await
            .unwrap();

        assert_eq!(done.status, TransferStatus::Redeemed);
        assert!(done.dest_tx.is_some());
        assert_eq!(h.network.evm.balance(&alice.address()), 30 * USDC_UNIT);
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), Some(20 * USDC_UNIT));

        let stored = h.journal.load(&done.transfer_id).unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Redeemed);
        let key = stored.key().unwrap();
        assert_eq!(h.coordinator.status(&key).unwrap().unwrap().status, TransferStatus::Redeemed);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests_before_signing() {
        let h = harness(2);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");

        let zero = h.coordinator.submit(to_solana(0, 1, &bob), &alice).await.unwrap_err();
        assert_eq!(zero, EngineError::Validation(ValidationError::NonPositiveAmount));

        let mut same = to_solana(5, 2, &bob);
        same.destination = Chain::Polygon;
        assert!(matches!(
            h.coordinator.submit(same, &alice).await.unwrap_err(),
            EngineError::Validation(ValidationError::SameChainTransfer(Chain::Polygon))
        ));

        let mut bad = to_solana(5, 3, &bob);
        bad.recipient = "0xnot-a-solana-key".into();
        assert!(matches!(
            h.coordinator.submit(bad, &alice).await.unwrap_err(),
            EngineError::Validation(ValidationError::InvalidAddress { .. })
        ));

        assert!(matches!(
            h.coordinator.submit(to_solana(5, 4, &bob), &bob).await.unwrap_err(),
            EngineError::Validation(ValidationError::SignerChainMismatch { .. })
        ));
        assert_eq!(h.network.evm.successful_transactions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_rejected() {
        let h = harness(5);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 50 * USDC_UNIT);

        let first = h.coordinator.submit_and_wait(to_solana(USDC_UNIT, 7, &bob), &alice).await.unwrap();
        let err = h.coordinator.submit(to_solana(USDC_UNIT, 7, &bob), &alice).await.unwrap_err();
        match err {
            EngineError::State(StateError::DuplicateTransfer { existing, nonce, .. }) => {
                assert_eq!(existing, first.transfer_id);
                assert_eq!(nonce, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), Some(USDC_UNIT));
    }

    #[tokio::test]
    async fn test_withheld_attestation_fails_then_resumes() {
        let h = harness(3);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 10 * USDC_UNIT);
        h.network.guardians.set_withheld(true);

        let failed = h
            .coordinator
            .submit_and_wait(to_solana(4 * USDC_UNIT, 1, &bob), &alice)
            .await
            .unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert!(failed.recoverable);
        assert!(failed.sequence.is_some());
        assert!(failed.last_error.unwrap().contains("not available"));

        h.network.guardians.set_withheld(false);
        let done = h.coordinator.resume_transfer(&failed.transfer_id).await.unwrap();
        assert_eq!(done.status, TransferStatus::Redeemed);
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), Some(4 * USDC_UNIT));
    }

    #[tokio::test]
    async fn test_below_quorum_is_not_redeemed() {
        let h = harness(2);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 10 * USDC_UNIT);
        h.network.guardians.set_signing(2);

        let failed = h
            .coordinator
            .submit_and_wait(to_solana(USDC_UNIT, 1, &bob), &alice)
            .await
            .unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert!(failed.attestation.is_none());
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), None);
    }

    #[tokio::test]
    async fn test_resume_is_noop_once_redeemed() {
        let h = harness(5);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 10 * USDC_UNIT);

        let done = h.coordinator.submit_and_wait(to_solana(USDC_UNIT, 1, &bob), &alice).await.unwrap();
        let again = h.coordinator.resume(&done.key().unwrap()).await.unwrap();
        assert_eq!(again.transfer_id, done.transfer_id);
        assert_eq!(again.status, TransferStatus::Redeemed);
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), Some(USDC_UNIT));
    }

    #[tokio::test]
    async fn test_unknown_transfer_id() {
        let h = harness(1);
        assert!(matches!(
            h.coordinator.wait("xfer_missing").await.unwrap_err(),
            EngineError::State(StateError::TransferNotFound(_))
        ));
        assert!(h.coordinator.transfer("xfer_missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_emitter_is_not_rediscovered() {
        let h = harness(2);
        let foreign = TransferKey::new(Chain::Polygon, hex::encode([0xffu8; 32]), 0);
        let err = h.coordinator.resume(&foreign).await.unwrap_err();
        assert!(matches!(err, EngineError::Attestation(AttestationError::InvalidEmitter(_))));
        assert!(h.coordinator.unfinished().unwrap().is_empty());
        assert!(h.journal.find_by_key(&foreign).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_journaled_foreign_emitter_is_never_resumed() {
        let h = harness(2);
        let alice = SimulatedWallet::evm("alice");
        let bob = SimulatedWallet::solana("bob");
        h.network.evm.mint(&alice.address(), 10 * USDC_UNIT);
        h.network.guardians.set_withheld(true);

        let mut failed = h
            .coordinator
            .submit_and_wait(to_solana(USDC_UNIT, 1, &bob), &alice)
            .await
            .unwrap();
        assert!(failed.recoverable);
        failed.emitter = Some(hex::encode([0xffu8; 32]));
        h.journal.save(&failed).unwrap();
        h.network.guardians.set_withheld(false);

        assert!(h.coordinator.resume_pending().unwrap().is_empty());
        let stored = h.journal.load(&failed.transfer_id).unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert!(!stored.recoverable);
        assert!(stored.last_error.unwrap().contains("bridge emitter"));

        let err = h.coordinator.resume_transfer(&failed.transfer_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Attestation(AttestationError::InvalidEmitter(_))));
        assert_eq!(h.network.solana.token_balance(&bob.pubkey()), None);
    }
}
