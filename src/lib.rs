/// AfriFutures cross-chain settlement engine
/// Prediction markets on Polygon and Solana behind one facade, a VAA bridge
/// between them, and a read-only portfolio reconciler

pub mod amm;
pub mod app_state;
pub mod bridge;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod models;
pub mod oracle;
pub mod reconciler;
pub mod retry;
pub mod scheduler;

// Pricing
pub use amm::{odds, payout, settled_payout, FeeRate, Odds, DEFAULT_FEE_BPS, USDC_UNIT};

// Markets
pub use facade::MarketFacade;
pub use models::{Chain, Claim, Market, MarketKey, OraclePrice, OracleResolution, Position, Side, Stake, TxRef};

// Chains
pub use chain::polygon::{PolygonAdapter, PolygonConfig};
pub use chain::solana::{SolanaAdapter, SolanaConfig};
pub use chain::{ChainAdapter, ConfirmationPolicy, Signer};

// Bridge
pub use bridge::{
    BridgeCoordinator, BridgeRequest, BridgeTransfer, CoordinatorConfig, TransferKey, TransferStatus,
};

// Reconciliation and background work
pub use reconciler::{AccountSet, MarketFailure, PortfolioReport, PositionCategory, SettlementReconciler};
pub use scheduler::{BridgeSweepJob, Job, ResolutionJob, Scheduler};

// Ambient
pub use app_state::{AppState, Engine, SharedState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, Result};
pub use retry::RetryPolicy;
