// Bridge transfers that stall mid-flight and are picked back up: by id, by
// message identity alone, after a restart, and from the background sweep.

use std::sync::Arc;
use std::time::Duration;

use afrifutures_settlement::amm::{FeeRate, USDC_UNIT};
use afrifutures_settlement::bridge::{
    BridgeCoordinator, BridgeRequest, CoordinatorConfig, MemoryJournal, SledJournal, TransferJournal, TransferStatus,
};
use afrifutures_settlement::chain::simulated::{SimulatedNetwork, SimulatedWallet};
use afrifutures_settlement::chain::{ConfirmationPolicy, Signer};
use afrifutures_settlement::clock::ManualClock;
use afrifutures_settlement::error::{EngineError, StateError};
use afrifutures_settlement::models::Chain;
use afrifutures_settlement::retry::RetryPolicy;
use afrifutures_settlement::scheduler::{BridgeSweepJob, Scheduler};

fn network() -> (SimulatedNetwork, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    (SimulatedNetwork::new(clock.clone(), FeeRate::default()), clock)
}

fn coordinator(
    network: &SimulatedNetwork,
    clock: Arc<ManualClock>,
    journal: Arc<dyn TransferJournal>,
) -> BridgeCoordinator {
    let polygon = network.polygon_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
    let solana = network.solana_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
    BridgeCoordinator::builder(network.guardians.clone(), network.guardians.guardian_set(), journal)
        .endpoint(Arc::new(polygon))
        .endpoint(Arc::new(solana))
        .relayer(Arc::new(SimulatedWallet::evm("relayer")))
        .relayer(Arc::new(SimulatedWallet::solana("relayer")))
        .clock(clock)
        .config(CoordinatorConfig::immediate(3))
        .build()
}

fn request(source: Chain, amount: u64, nonce: u32, recipient: &SimulatedWallet) -> BridgeRequest {
    BridgeRequest {
        source,
        destination: source.counterpart(),
        amount,
        recipient: recipient.address(),
        nonce,
    }
}

#[tokio::test]
async fn test_withheld_attestation_recovers_on_resume() {
    let (network, clock) = network();
    let bridge = coordinator(&network, clock, Arc::new(MemoryJournal::new()));
    let alice = SimulatedWallet::solana("alice");
    let bob = SimulatedWallet::evm("bob");
    network.solana.mint(&alice.pubkey(), 20 * USDC_UNIT);
    network.guardians.set_withheld(true);

    let failed = bridge
        .submit_and_wait(request(Chain::Solana, 8 * USDC_UNIT, 1, &bob), &alice)
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.recoverable);
    assert_eq!(network.solana.token_balance(&alice.pubkey()), Some(12 * USDC_UNIT));
    assert_eq!(network.evm.balance(&bob.address()), 0);

    network.guardians.set_withheld(false);
    let done = bridge.resume_transfer(&failed.transfer_id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Redeemed);
    assert_eq!(done.transfer_id, failed.transfer_id);
    assert_eq!(network.evm.balance(&bob.address()), 8 * USDC_UNIT);
}

#[tokio::test]
async fn test_rediscover_from_message_identity_only() {
    let (network, clock) = network();
    let alice = SimulatedWallet::evm("alice");
    let bob = SimulatedWallet::solana("bob");
    network.evm.mint(&alice.address(), 20 * USDC_UNIT);
    network.guardians.set_withheld(true);

    let original = coordinator(&network, clock.clone(), Arc::new(MemoryJournal::new()));
    let failed = original
        .submit_and_wait(request(Chain::Polygon, 5 * USDC_UNIT, 1, &bob), &alice)
        .await
        .unwrap();
    let key = failed.key().unwrap();
    network.guardians.set_withheld(false);

    // a second engine with no record of the transfer
    let fresh = coordinator(&network, clock, Arc::new(MemoryJournal::new()));
    let rediscovered = fresh.resume(&key).await.unwrap();
    assert_eq!(rediscovered.status, TransferStatus::Redeemed);
    assert_eq!(rediscovered.amount, 5 * USDC_UNIT);
    assert_ne!(rediscovered.transfer_id, failed.transfer_id);
    assert_eq!(network.solana.token_balance(&bob.pubkey()), Some(5 * USDC_UNIT));

    // the original engine converges on the same outcome without paying twice
    let converged = original.resume_transfer(&failed.transfer_id).await.unwrap();
    assert_eq!(converged.status, TransferStatus::Redeemed);
    assert_eq!(network.solana.token_balance(&bob.pubkey()), Some(5 * USDC_UNIT));
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_journal() {
    let (network, clock) = network();
    let journal: Arc<dyn TransferJournal> = Arc::new(SledJournal::temporary().unwrap());
    let alice = SimulatedWallet::evm("alice");
    let bob = SimulatedWallet::solana("bob");
    network.evm.mint(&alice.address(), 20 * USDC_UNIT);
    network.guardians.set_withheld(true);

    let before_restart = coordinator(&network, clock.clone(), journal.clone());
    let failed = before_restart
        .submit_and_wait(request(Chain::Polygon, 3 * USDC_UNIT, 9, &bob), &alice)
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    drop(before_restart);

    network.guardians.set_withheld(false);
    let after_restart = coordinator(&network, clock, journal);
    let resumed = after_restart.resume_pending().unwrap();
    assert_eq!(resumed, vec![failed.transfer_id.clone()]);

    let done = after_restart.wait(&failed.transfer_id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Redeemed);
    assert_eq!(network.solana.token_balance(&bob.pubkey()), Some(3 * USDC_UNIT));

    // nonce 9 stays burned across the restart
    let err = after_restart
        .submit(request(Chain::Polygon, USDC_UNIT, 9, &bob), &alice)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::DuplicateTransfer { nonce: 9, .. })));
}

#[tokio::test]
async fn test_sweep_job_resumes_failed_transfers() {
    let (network, clock) = network();
    let bridge = coordinator(&network, clock.clone(), Arc::new(MemoryJournal::new()));
    let alice = SimulatedWallet::evm("alice");
    let bob = SimulatedWallet::solana("bob");
    network.evm.mint(&alice.address(), 20 * USDC_UNIT);
    network.guardians.set_offline(true);

    let failed = bridge
        .submit_and_wait(request(Chain::Polygon, 2 * USDC_UNIT, 1, &bob), &alice)
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    network.guardians.set_offline(false);

    let mut scheduler = Scheduler::new(Duration::from_secs(3_600), clock);
    scheduler.add_job(Arc::new(BridgeSweepJob::new(bridge.clone())));
    let results = scheduler.run_once().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.as_ref().unwrap().processed, 1);

    let done = bridge.wait(&failed.transfer_id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Redeemed);
    assert_eq!(network.solana.token_balance(&bob.pubkey()), Some(2 * USDC_UNIT));

    // nothing left to sweep
    let results = scheduler.run_once().await;
    assert_eq!(results[0].1.as_ref().unwrap().processed, 0);
    assert!(bridge.unfinished().unwrap().is_empty());
}
