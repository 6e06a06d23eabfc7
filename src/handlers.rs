// HTTP request handlers for the settlement engine read API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::amm::{self, format_amount, format_signed, parse_amount};
use crate::app_state::SharedState;
use crate::bridge::TransferKey;
use crate::error::{EngineError, StateError, ValidationError};
use crate::models::{Chain, MarketKey, Side};
use crate::reconciler::AccountSet;

// ===== ERROR MAPPING =====

/// Rendered as `{"error": kind, "message": ..., "txRef": ...}`
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    /// Bridge routes when the chains cannot be bridged in this configuration
    BridgeDisabled,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Engine(err.into())
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        ApiError::Engine(err.into())
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(ValidationError::UnknownMarket(_))
        | EngineError::State(StateError::TransferNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::State(_) | EngineError::InsufficientAllowance { .. } => StatusCode::CONFLICT,
        EngineError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Chain { .. } | EngineError::Attestation(_) | EngineError::Oracle(_) => StatusCode::BAD_GATEWAY,
        EngineError::Journal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(err) => (
                status_for(&err),
                json!({
                    "error": err.kind(),
                    "message": err.to_string(),
                    "txRef": err.tx_ref().map(|t| t.as_str().to_string()),
                }),
            ),
            ApiError::BridgeDisabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "bridge_disabled",
                    "message": "bridge needs both chains live with GUARDIAN_API_URL, or both simulated",
                    "txRef": null,
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn market_key(chain: &str, market_id: u64) -> Result<MarketKey, ApiError> {
    Ok(MarketKey::new(chain.parse::<Chain>()?, market_id))
}

// ===== ROUTER =====

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        // ===== MARKETS =====
        .route("/markets/:chain", get(list_markets))
        .route("/markets/:chain/:id", get(get_market))
        .route("/markets/:chain/:id/odds", get(get_odds))
        .route("/markets/:chain/:id/quote", get(quote_payout))
        .route("/markets/:chain/:id/positions/:account", get(get_position))
        // ===== ACCOUNTS =====
        .route("/balance/:chain/:account", get(get_balance))
        .route("/portfolio", get(get_portfolio))
        // ===== BRIDGE =====
        .route("/bridge/transfers", get(list_unfinished_transfers))
        .route("/bridge/transfers/:id", get(get_transfer))
        .route("/bridge/status/:chain/:emitter/:sequence", get(get_transfer_status))
        // ===== OPERATIONS =====
        .route("/jobs", get(get_jobs))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ===== HEALTH =====

pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mockMode": state.mock_mode,
        "chains": state.facade.chains(),
        "bridge": state.bridge.is_some(),
        "startedAt": state.started_at,
        "feeBps": state.facade.fee().bps(),
    }))
}

// ===== MARKET ENDPOINTS =====

pub async fn list_markets(State(state): State<SharedState>, Path(chain): Path<String>) -> ApiResult {
    let chain: Chain = chain.parse()?;
    let markets = state.facade.list_markets(chain).await?;
    let markets: Vec<Value> = markets
        .into_iter()
        .map(|m| {
            let odds = amm::odds(m.yes_pool, m.no_pool);
            json!({ "market": m, "odds": odds })
        })
        .collect();
    Ok(Json(json!({ "chain": chain, "count": markets.len(), "markets": markets })))
}

pub async fn get_market(State(state): State<SharedState>, Path((chain, id)): Path<(String, u64)>) -> ApiResult {
    let key = market_key(&chain, id)?;
    let market = state.facade.get_market(&key).await?;
    let odds = amm::odds(market.yes_pool, market.no_pool);
    Ok(Json(json!({
        "market": market,
        "odds": odds,
        "totalPool": format_signed(market.total_pool() as i128),
    })))
}

pub async fn get_odds(State(state): State<SharedState>, Path((chain, id)): Path<(String, u64)>) -> ApiResult {
    let key = market_key(&chain, id)?;
    let odds = state.facade.get_odds(&key).await?;
    Ok(Json(json!({ "key": key, "yes": odds.yes, "no": odds.no })))
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub side: String,
    /// Human USDC amount, e.g. "12.5"
    pub amount: String,
}

pub async fn quote_payout(
    State(state): State<SharedState>,
    Path((chain, id)): Path<(String, u64)>,
    Query(query): Query<QuoteQuery>,
) -> ApiResult {
    let key = market_key(&chain, id)?;
    let side: Side = query.side.parse()?;
    let amount = parse_amount(&query.amount)?;
    let payout = state.facade.quote_payout(&key, side, amount).await?;
    Ok(Json(json!({
        "key": key,
        "side": side,
        "stake": format_amount(amount),
        "payout": format_amount(payout),
        "profit": format_signed(payout as i128 - amount as i128),
        "payoutBaseUnits": payout,
    })))
}

pub async fn get_position(
    State(state): State<SharedState>,
    Path((chain, id, account)): Path<(String, u64, String)>,
) -> ApiResult {
    let key = market_key(&chain, id)?;
    let position = state.facade.get_user_position(&key, &account).await?;
    Ok(Json(json!({
        "position": position,
        "staked": format_amount(position.total_staked()),
    })))
}

// ===== ACCOUNT ENDPOINTS =====

pub async fn get_balance(
    State(state): State<SharedState>,
    Path((chain, account)): Path<(String, String)>,
) -> ApiResult {
    let chain: Chain = chain.parse()?;
    let balance = state.facade.collateral_balance(chain, &account).await?;
    Ok(Json(json!({
        "chain": chain,
        "account": account,
        "balance": format_amount(balance),
        "baseUnits": balance,
    })))
}

/// At least one address is required
#[derive(Debug, Deserialize)]
pub struct PortfolioQuery {
    pub polygon: Option<String>,
    pub solana: Option<String>,
}

pub async fn get_portfolio(State(state): State<SharedState>, Query(query): Query<PortfolioQuery>) -> ApiResult {
    let mut accounts = AccountSet::new();
    if let Some(address) = query.polygon {
        accounts = accounts.with(Chain::Polygon, address);
    }
    if let Some(address) = query.solana {
        accounts = accounts.with(Chain::Solana, address);
    }
    if accounts.is_empty() {
        return Err(ValidationError::InvalidAddress {
            chain: Chain::Polygon,
            address: String::new(),
        }
        .into());
    }

    let report = state.reconciler.portfolio(&accounts).await;
    Ok(Json(json!({
        "report": report,
        "partial": report.is_partial(),
        "claimable": format_amount(report.claimable()),
        "unrealizedPnl": format_signed(report.unrealized_pnl),
        "realizedPnl": format_signed(report.realized_pnl),
    })))
}

// ===== BRIDGE ENDPOINTS =====

pub async fn list_unfinished_transfers(State(state): State<SharedState>) -> ApiResult {
    let bridge = state.bridge.as_ref().ok_or(ApiError::BridgeDisabled)?;
    let transfers = bridge.unfinished()?;
    Ok(Json(json!({ "count": transfers.len(), "transfers": transfers })))
}

pub async fn get_transfer(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let bridge = state.bridge.as_ref().ok_or(ApiError::BridgeDisabled)?;
    let transfer = bridge
        .transfer(&id)?
        .ok_or(StateError::TransferNotFound(id))?;
    Ok(Json(json!({ "transfer": transfer })))
}

pub async fn get_transfer_status(
    State(state): State<SharedState>,
    Path((chain, emitter, sequence)): Path<(String, String, u64)>,
) -> ApiResult {
    let bridge = state.bridge.as_ref().ok_or(ApiError::BridgeDisabled)?;
    let key = TransferKey::new(chain.parse()?, emitter, sequence);
    let transfer = bridge
        .status(&key)?
        .ok_or_else(|| StateError::TransferNotFound(key.to_string()))?;
    Ok(Json(json!({ "status": transfer.status, "transfer": transfer })))
}

// ===== OPERATIONS =====

pub async fn get_jobs(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "jobs": state.jobs.snapshot() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttestationError, ChainError};
    use crate::models::TxRef;

    #[test]
    fn test_status_codes() {
        let key = MarketKey::new(Chain::Polygon, 9);
        assert_eq!(
            status_for(&ValidationError::NonPositiveAmount.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ValidationError::UnknownMarket(key).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&StateError::AlreadyClaimed(key).into()), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::chain(Chain::Solana, ChainError::Rpc("503".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&AttestationError::Unreachable("down".into()).into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&EngineError::ConfirmationTimeout {
                chain: Chain::Polygon,
                tx_ref: TxRef::new("0xabc"),
                waited_ms: 90_000,
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_market_key_rejects_unknown_chain() {
        assert!(market_key("ethereum", 1).is_err());
        assert_eq!(market_key("Solana", 3).unwrap(), MarketKey::new(Chain::Solana, 3));
    }
}
