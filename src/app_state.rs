// Application state and composition root

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bridge::attestation::{AttestationSource, GuardianClient, GuardianSet};
use crate::bridge::{BridgeCoordinator, BridgeEndpoint, MemoryJournal, SledJournal, TransferJournal};
use crate::chain::polygon::{HttpEvmRpc, PolygonAdapter};
use crate::chain::simulated::{SimulatedNetwork, SimulatedWallet};
use crate::chain::solana::{HttpSolanaRpc, SolanaAdapter};
use crate::chain::{ChainAdapter, Signer};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::facade::MarketFacade;
use crate::models::Chain;
use crate::oracle::{HttpOracleFeed, OracleFeed, StaticOracleFeed};
use crate::reconciler::SettlementReconciler;
use crate::scheduler::{BridgeSweepJob, ResolutionJob, Scheduler, StatusHandle};

pub type SharedState = Arc<AppState>;

/// Demo markets seeded in mock mode: commodity and threshold in cents
const DEMO_MARKETS: [(&str, u64); 5] = [
    ("COFFEE", 250_00),
    ("COCOA", 2_500_00),
    ("TEA", 3_50),
    ("MAIZE", 220_00),
    ("WHEAT", 280_00),
];

/// Days until demo markets reach their target date
const DEMO_MARKET_DAYS: i64 = 7;

pub struct AppState {
    pub facade: Arc<MarketFacade>,
    pub reconciler: SettlementReconciler,
    /// `None` when the two chains cannot be bridged with this configuration
    pub bridge: Option<BridgeCoordinator>,
    pub jobs: StatusHandle,
    pub mock_mode: bool,
    pub started_at: i64,
}

/// Everything `main` needs: shared state for the router, the scheduler it owns
pub struct Engine {
    pub state: SharedState,
    pub scheduler: Scheduler,
}

struct Adapters {
    polygon: Arc<PolygonAdapter>,
    solana: Arc<SolanaAdapter>,
}

impl AppState {
    pub fn build(config: &EngineConfig) -> Result<Engine> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        // backs every chain that has no RPC URL
        let network = SimulatedNetwork::new(clock.clone(), config.fee);
        let simulated = config.polygon.is_none() || config.solana.is_none();

        let adapters = build_adapters(config, &network);
        let facade = Arc::new(
            MarketFacade::new(config.fee)
                .with_adapter(adapters.polygon.clone() as Arc<dyn ChainAdapter>)
                .with_adapter(adapters.solana.clone() as Arc<dyn ChainAdapter>)
                .with_clock(clock.clone()),
        );

        // Resolver signers only exist for simulated chains; live deployments
        // resolve through an external signer and leave this job idle.
        let mut resolvers: HashMap<Chain, Arc<dyn Signer>> = HashMap::new();
        if simulated {
            seed_demo_markets(&network, config, clock.now());
            if config.polygon.is_none() {
                resolvers.insert(Chain::Polygon, Arc::new(network.authority(Chain::Polygon)));
            }
            if config.solana.is_none() {
                resolvers.insert(Chain::Solana, Arc::new(network.authority(Chain::Solana)));
            }
        }

        let oracle: Arc<dyn OracleFeed> = match &config.oracle_api_url {
            Some(url) => Arc::new(HttpOracleFeed::new(url.clone(), clock.clone())),
            None => {
                let feed = StaticOracleFeed::new(clock.clone());
                for (commodity, cents) in DEMO_MARKETS {
                    feed.set_price(commodity, cents);
                }
                Arc::new(feed)
            }
        };

        let bridge = build_bridge(config, &network, &adapters, clock.clone())?;

        let mut scheduler = Scheduler::new(config.scheduler_interval, clock.clone());
        if !resolvers.is_empty() {
            let job = resolvers.into_values().fold(
                ResolutionJob::new(facade.clone(), oracle, clock.clone()),
                |job, signer| job.with_resolver(signer),
            );
            scheduler.add_job(Arc::new(job));
        }
        if let Some(coordinator) = &bridge {
            scheduler.add_job(Arc::new(BridgeSweepJob::new(coordinator.clone())));
        }

        let state = Arc::new(AppState {
            reconciler: SettlementReconciler::new(facade.clone(), clock.clone()),
            facade,
            bridge,
            jobs: scheduler.status_handle(),
            mock_mode: config.is_mock_mode(),
            started_at: clock.now(),
        });

        Ok(Engine { state, scheduler })
    }
}

fn build_adapters(config: &EngineConfig, network: &SimulatedNetwork) -> Adapters {
    let polygon = match &config.polygon {
        Some(live) => {
            info!(rpc = %live.rpc_url, chain_id = live.contracts.chain_id, "polygon: live");
            PolygonAdapter::new(
                Arc::new(HttpEvmRpc::new(live.rpc_url.clone())),
                live.contracts.clone(),
                config.confirmation.clone(),
                config.retry.clone(),
            )
        }
        None => {
            warn!("polygon: mock mode (POLYGON_RPC_URL not set)");
            network.polygon_adapter(config.confirmation.clone(), config.retry.clone())
        }
    };
    let solana = match &config.solana {
        Some(live) => {
            info!(rpc = %live.rpc_url, program = %live.programs.market_program, "solana: live");
            SolanaAdapter::new(
                Arc::new(HttpSolanaRpc::new(live.rpc_url.clone())),
                live.programs.clone(),
                config.confirmation.clone(),
                config.retry.clone(),
            )
        }
        None => {
            warn!("solana: mock mode (SOLANA_RPC_URL not set)");
            network.solana_adapter(config.confirmation.clone(), config.retry.clone())
        }
    };
    Adapters {
        polygon: Arc::new(polygon),
        solana: Arc::new(solana),
    }
}

fn seed_demo_markets(network: &SimulatedNetwork, config: &EngineConfig, now: i64) {
    let target = now + DEMO_MARKET_DAYS * 86_400;
    for (commodity, threshold) in DEMO_MARKETS {
        if config.polygon.is_none() {
            network.evm.create_market(commodity, threshold, target);
        }
        if config.solana.is_none() {
            network.solana.create_market(commodity, threshold, target);
        }
    }
    info!(markets = DEMO_MARKETS.len(), "seeded demo markets");
}

fn build_bridge(
    config: &EngineConfig,
    network: &SimulatedNetwork,
    adapters: &Adapters,
    clock: Arc<dyn Clock>,
) -> Result<Option<BridgeCoordinator>> {
    let endpoints: [Arc<dyn BridgeEndpoint>; 2] = [adapters.polygon.clone(), adapters.solana.clone()];

    let live = (config.polygon.is_some(), config.solana.is_some());
    let builder = match live {
        (false, false) => {
            let journal: Arc<dyn TransferJournal> = Arc::new(MemoryJournal::new());
            let attestations: Arc<dyn AttestationSource> = network.guardians.clone();
            BridgeCoordinator::builder(attestations, network.guardians.guardian_set(), journal)
                .relayer(Arc::new(SimulatedWallet::evm("relayer")))
                .relayer(Arc::new(SimulatedWallet::solana("relayer")))
        }
        (true, true) => {
            let Some(url) = &config.guardian_api_url else {
                warn!("bridge disabled: GUARDIAN_API_URL not set");
                return Ok(None);
            };
            let journal: Arc<dyn TransferJournal> = Arc::new(SledJournal::open(&config.journal_path)?);
            let set = GuardianSet::new(config.guardian_set_index, config.guardian_addresses.clone());
            info!(guardians = set.addresses.len(), journal = %config.journal_path.display(), "bridge enabled");
            warn!("no relayer signers configured; transfers stop at Attested until redeemed externally");
            BridgeCoordinator::builder(Arc::new(GuardianClient::new(url.clone())), set, journal)
        }
        _ => {
            warn!("bridge disabled: one chain is live and the other simulated");
            return Ok(None);
        }
    };

    let coordinator = endpoints
        .into_iter()
        .fold(builder, |builder, endpoint| builder.endpoint(endpoint))
        .clock(clock)
        .config(config.coordinator_config())
        .build();
    Ok(Some(coordinator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn mock_config() -> EngineConfig {
        let empty: Map<String, String> = Map::new();
        EngineConfig::from_lookup(move |key| empty.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn test_mock_mode_wires_everything() {
        let engine = AppState::build(&mock_config()).unwrap();
        let state = engine.state;
        assert!(state.mock_mode);
        assert!(state.bridge.is_some());

        let markets = state.facade.list_markets(Chain::Solana).await.unwrap();
        assert_eq!(markets.len(), DEMO_MARKETS.len());
        assert_eq!(markets[0].commodity, "COFFEE");

        let names: Vec<String> = state.jobs.snapshot().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["bridge_sweep".to_string(), "market_resolution".to_string()]);
    }
}
