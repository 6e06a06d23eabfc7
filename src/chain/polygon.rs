//! EVM chain adapter.
//!
//! Market state lives in a prediction contract, collateral is an ERC-20
//! USDC, and bridge locks go through a token-bridge contract that emits
//! `TransferLocked(uint64 sequence, ...)`. Stakes need an ERC-20 allowance;
//! it is read on-chain right before every stake and topped up when short.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::abi::{self, Decoder, Token};
use super::rpc::{is_already_known, JsonRpcClient};
use super::{
    ensure_signer_chain, submit_and_confirm, ChainAdapter, Confirmation, ConfirmationPolicy, EvmTxRequest, Finality,
    SignedTx, Signer, TxRequest, TxStatus, TxTransport,
};
use crate::bridge::attestation::Attestation;
use crate::bridge::{BridgeEndpoint, BridgeRequest, SourceState};
use crate::error::{AttestationError, ChainError, EngineError, Result, ValidationError};
use crate::models::{outcome_for, Chain, Market, MarketKey, Position, Side, TxRef};
use crate::retry::RetryPolicy;

// ============================================================================
// CONTRACT INTERFACE
// ============================================================================

pub const FN_GET_PREDICTION: &str = "getPrediction(uint256)";
pub const FN_GET_POSITION: &str = "getPosition(uint256,address)";
pub const FN_PREDICTION_COUNT: &str = "predictionCount()";
pub const FN_STAKE: &str = "stake(uint256,bool,uint256)";
pub const FN_CLAIM_WINNINGS: &str = "claimWinnings(uint256)";
pub const FN_RESOLVE_PREDICTION: &str = "resolvePrediction(uint256,uint256)";

pub const FN_ALLOWANCE: &str = "allowance(address,address)";
pub const FN_APPROVE: &str = "approve(address,uint256)";
pub const FN_BALANCE_OF: &str = "balanceOf(address)";

pub const FN_BRIDGE_USDC: &str = "bridgeUSDC(uint256,bytes32,uint16,uint32)";
pub const FN_COMPLETE_TRANSFER: &str = "completeTransfer(bytes)";
pub const FN_IS_TRANSFER_COMPLETED: &str = "isTransferCompleted(bytes32)";

/// topics[1] carries the sequence
pub const EVENT_TRANSFER_LOCKED: &str = "TransferLocked(uint64,address,uint256,bytes32)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolygonConfig {
    pub chain_id: u64,
    pub market_contract: String,
    pub usdc: String,
    pub bridge_contract: String,
}

fn address_arg(chain_address: &str) -> Result<Token> {
    abi::parse_address(chain_address)
        .map(Token::Address)
        .ok_or_else(|| {
            ValidationError::InvalidAddress {
                chain: Chain::Polygon,
                address: chain_address.to_string(),
            }
            .into()
        })
}

// ============================================================================
// RPC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLog {
    pub address: [u8; 20],
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmReceipt {
    pub block_number: u64,
    pub success: bool,
    pub logs: Vec<EvmLog>,
}

#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// `eth_call` against the latest block
    async fn call(&self, to: &str, data: &[u8]) -> std::result::Result<Vec<u8>, ChainError>;

    async fn send_raw_transaction(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError>;

    /// Whether the node knows the transaction at all (mempool or mined)
    async fn transaction_known(&self, tx_ref: &TxRef) -> std::result::Result<bool, ChainError>;

    async fn receipt(&self, tx_ref: &TxRef) -> std::result::Result<Option<EvmReceipt>, ChainError>;

    /// Height of the `finalized` block tag
    async fn finalized_block(&self) -> std::result::Result<u64, ChainError>;
}

fn parse_quantity(value: &str, what: &'static str) -> std::result::Result<u64, ChainError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| ChainError::decode(what, e.to_string()))
}

fn parse_hex(value: &str, what: &'static str) -> std::result::Result<Vec<u8>, ChainError> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| ChainError::decode(what, e.to_string()))
}

fn parse_word(value: &str, what: &'static str) -> std::result::Result<[u8; 32], ChainError> {
    parse_hex(value, what)?
        .try_into()
        .map_err(|_| ChainError::decode(what, "expected 32 bytes"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    block_number: String,
    status: String,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    number: String,
}

impl RawReceipt {
    fn into_receipt(self) -> std::result::Result<EvmReceipt, ChainError> {
        let mut logs = Vec::with_capacity(self.logs.len());
        for log in self.logs {
            let address = abi::parse_address(&log.address)
                .ok_or_else(|| ChainError::decode("receipt log", format!("bad address {}", log.address)))?;
            let topics = log
                .topics
                .iter()
                .map(|t| parse_word(t, "receipt topic"))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            logs.push(EvmLog {
                address,
                topics,
                data: parse_hex(&log.data, "receipt log data")?,
            });
        }
        Ok(EvmReceipt {
            block_number: parse_quantity(&self.block_number, "receipt block")?,
            success: parse_quantity(&self.status, "receipt status")? == 1,
            logs,
        })
    }
}

pub struct HttpEvmRpc {
    rpc: JsonRpcClient,
}

impl HttpEvmRpc {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            rpc: JsonRpcClient::new(endpoint_url),
        }
    }
}

#[async_trait]
impl EvmRpc for HttpEvmRpc {
    async fn call(&self, to: &str, data: &[u8]) -> std::result::Result<Vec<u8>, ChainError> {
        let result: String = self
            .rpc
            .call(
                "eth_call",
                json!([{"to": to, "data": format!("0x{}", hex::encode(data))}, "latest"]),
            )
            .await?;
        parse_hex(&result, "eth_call result")
    }

    async fn send_raw_transaction(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError> {
        let hash: String = self.rpc.call("eth_sendRawTransaction", json!([signed.raw])).await?;
        Ok(TxRef::new(hash))
    }

    async fn transaction_known(&self, tx_ref: &TxRef) -> std::result::Result<bool, ChainError> {
        let tx: Option<Value> = self
            .rpc
            .call("eth_getTransactionByHash", json!([tx_ref.as_str()]))
            .await?;
        Ok(tx.is_some())
    }

    async fn receipt(&self, tx_ref: &TxRef) -> std::result::Result<Option<EvmReceipt>, ChainError> {
        let receipt: Option<RawReceipt> = self
            .rpc
            .call("eth_getTransactionReceipt", json!([tx_ref.as_str()]))
            .await?;
        receipt.map(RawReceipt::into_receipt).transpose()
    }

    async fn finalized_block(&self) -> std::result::Result<u64, ChainError> {
        let block: Option<RawBlock> = self
            .rpc
            .call("eth_getBlockByNumber", json!(["finalized", false]))
            .await?;
        match block {
            Some(block) => parse_quantity(&block.number, "finalized block"),
            None => Err(ChainError::InvalidResponse("node has no finalized block".into())),
        }
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct PolygonAdapter {
    rpc: Arc<dyn EvmRpc>,
    config: PolygonConfig,
    confirmation: ConfirmationPolicy,
    retry: RetryPolicy,
}

impl PolygonAdapter {
    pub fn new(rpc: Arc<dyn EvmRpc>, config: PolygonConfig, confirmation: ConfirmationPolicy, retry: RetryPolicy) -> Self {
        Self {
            rpc,
            config,
            confirmation,
            retry,
        }
    }

    pub fn config(&self) -> &PolygonConfig {
        &self.config
    }

    async fn call(&self, to: &str, data: Vec<u8>, operation: &str) -> Result<Vec<u8>> {
        let data = &data;
        self.retry
            .run(operation, |_| async move {
                self.rpc
                    .call(to, data)
                    .await
                    .map_err(|e| EngineError::chain(Chain::Polygon, e))
            })
            .await
    }

    async fn sign(&self, signer: &dyn Signer, to: &str, data: Vec<u8>) -> Result<SignedTx> {
        ensure_signer_chain(signer, Chain::Polygon)?;
        let signed = signer
            .sign(TxRequest::Evm(EvmTxRequest {
                chain_id: self.config.chain_id,
                from: signer.address(),
                to: to.to_string(),
                data,
                value: 0,
            }))
            .await?;
        if signed.chain != Chain::Polygon {
            return Err(EngineError::chain(
                Chain::Polygon,
                ChainError::Signer(format!("signer returned a {} transaction", signed.chain)),
            ));
        }
        Ok(signed)
    }

    async fn send(&self, signer: &dyn Signer, to: &str, data: Vec<u8>, finality: Finality) -> Result<Confirmation> {
        let signed = self.sign(signer, to, data).await?;
        submit_and_confirm(self, &signed, finality, &self.confirmation, &self.retry).await
    }

    pub async fn allowance(&self, owner: &str, spender: &str) -> Result<u64> {
        let data = abi::encode_call(FN_ALLOWANCE, &[address_arg(owner)?, address_arg(spender)?]);
        let out = self.call(&self.config.usdc, data, "allowance").await?;
        // allowances are often max-uint; anything above u64 covers every stake
        match Decoder::new(&out, "allowance").uint(0) {
            Ok(value) => Ok(u64::try_from(value).unwrap_or(u64::MAX)),
            Err(ChainError::Decode { reason, .. }) if reason.contains("exceeds 128 bits") => Ok(u64::MAX),
            Err(e) => Err(EngineError::chain(Chain::Polygon, e)),
        }
    }

    /// Make sure `spender` may pull `amount` from the signer, approving if not.
    /// The allowance is re-read after the approval is confirmed.
    async fn ensure_allowance(&self, signer: &dyn Signer, spender: &str, amount: u64) -> Result<()> {
        let owner = signer.address();
        let current = self.allowance(&owner, spender).await?;
        if current >= amount {
            debug!(owner = %owner, spender, current, amount, "allowance sufficient");
            return Ok(());
        }

        info!(owner = %owner, spender, current, amount, "approving USDC allowance");
        let data = abi::encode_call(FN_APPROVE, &[address_arg(spender)?, Token::Uint(amount as u128)]);
        let usdc = self.config.usdc.clone();
        self.send(signer, &usdc, data, Finality::Confirmed).await?;

        let approved = self.allowance(&owner, spender).await?;
        if approved < amount {
            warn!(owner = %owner, spender, approved, amount, "allowance still short after approve");
            return Err(EngineError::InsufficientAllowance {
                chain: Chain::Polygon,
                allowance: approved,
                required: amount,
            });
        }
        Ok(())
    }

    fn emitter_bytes(&self) -> Option<[u8; 32]> {
        abi::parse_address(&self.config.bridge_contract).map(|a| abi::address_to_bytes32(&a))
    }
}

fn decode_market(market_id: u64, data: &[u8]) -> std::result::Result<Option<Market>, ChainError> {
    let d = Decoder::new(data, "getPrediction");
    let target_date = d.u64(3)?;
    // unset storage slot: the contract returns zeroes for unknown ids
    if target_date == 0 {
        return Ok(None);
    }
    let threshold_price = d.u64(2)?;
    let current_price = d.u64(1)?;
    let resolved = d.bool(7)?;
    let actual_price = d.u64(8)?;

    Ok(Some(Market {
        key: MarketKey::new(Chain::Polygon, market_id),
        commodity: d.string(0)?,
        threshold_price,
        current_price: Some(current_price),
        target_date: i64::try_from(target_date).map_err(|_| ChainError::decode("getPrediction", "target date overflow"))?,
        yes_pool: d.u64(5)?,
        no_pool: d.u64(6)?,
        resolved,
        outcome: resolved.then(|| outcome_for(threshold_price, actual_price)),
        oracle_price: resolved.then_some(actual_price),
        confidence: Some(d.u64(4)?.min(100) as u8),
    }))
}

#[async_trait]
impl TxTransport for PolygonAdapter {
    fn chain(&self) -> Chain {
        Chain::Polygon
    }

    async fn broadcast(&self, signed: &SignedTx) -> std::result::Result<TxRef, ChainError> {
        self.rpc.send_raw_transaction(signed).await
    }

    async fn tx_status(&self, tx_ref: &TxRef) -> std::result::Result<TxStatus, ChainError> {
        match self.rpc.receipt(tx_ref).await? {
            Some(receipt) if !receipt.success => Ok(TxStatus::Failed {
                reason: "execution reverted".into(),
            }),
            Some(receipt) => {
                let finalized = self.rpc.finalized_block().await?;
                if receipt.block_number <= finalized {
                    Ok(TxStatus::Finalized {
                        block: receipt.block_number,
                    })
                } else {
                    Ok(TxStatus::Confirmed {
                        block: receipt.block_number,
                    })
                }
            }
            None if self.rpc.transaction_known(tx_ref).await? => Ok(TxStatus::Pending),
            None => Ok(TxStatus::Unknown),
        }
    }
}

#[async_trait]
impl ChainAdapter for PolygonAdapter {
    fn chain(&self) -> Chain {
        Chain::Polygon
    }

    async fn market_ids(&self) -> Result<Vec<u64>> {
        let out = self
            .call(&self.config.market_contract, abi::encode_call(FN_PREDICTION_COUNT, &[]), "predictionCount")
            .await?;
        let count = Decoder::new(&out, "predictionCount")
            .u64(0)
            .map_err(|e| EngineError::chain(Chain::Polygon, e))?;
        Ok((1..=count).collect())
    }

    async fn market(&self, market_id: u64) -> Result<Option<Market>> {
        let data = abi::encode_call(FN_GET_PREDICTION, &[Token::Uint(market_id as u128)]);
        let out = self.call(&self.config.market_contract, data, "getPrediction").await?;
        decode_market(market_id, &out).map_err(|e| EngineError::chain(Chain::Polygon, e))
    }

    async fn position(&self, market_id: u64, account: &str) -> Result<Position> {
        let data = abi::encode_call(FN_GET_POSITION, &[Token::Uint(market_id as u128), address_arg(account)?]);
        let out = self.call(&self.config.market_contract, data, "getPosition").await?;
        let d = Decoder::new(&out, "getPosition");
        let decode = || -> std::result::Result<Position, ChainError> {
            Ok(Position {
                key: MarketKey::new(Chain::Polygon, market_id),
                account: account.to_string(),
                yes_amount: d.u64(0)?,
                no_amount: d.u64(1)?,
                claimed: d.bool(2)?,
            })
        };
        decode().map_err(|e| EngineError::chain(Chain::Polygon, e))
    }

    async fn stake(&self, market_id: u64, side: Side, amount: u64, signer: &dyn Signer) -> Result<Confirmation> {
        ensure_signer_chain(signer, Chain::Polygon)?;
        let market_contract = self.config.market_contract.clone();
        self.ensure_allowance(signer, &market_contract, amount).await?;

        let data = abi::encode_call(
            FN_STAKE,
            &[
                Token::Uint(market_id as u128),
                Token::Bool(side.is_yes()),
                Token::Uint(amount as u128),
            ],
        );
        info!(chain = "polygon", market_id, %side, amount, user = %signer.address(), "placing stake");
        self.send(signer, &market_contract, data, Finality::Confirmed).await
    }

    async fn claim(&self, market_id: u64, signer: &dyn Signer) -> Result<Confirmation> {
        let data = abi::encode_call(FN_CLAIM_WINNINGS, &[Token::Uint(market_id as u128)]);
        info!(chain = "polygon", market_id, user = %signer.address(), "claiming winnings");
        let market_contract = self.config.market_contract.clone();
        self.send(signer, &market_contract, data, Finality::Confirmed).await
    }

    async fn resolve(&self, market_id: u64, actual_price: u64, signer: &dyn Signer) -> Result<Confirmation> {
        let data = abi::encode_call(
            FN_RESOLVE_PREDICTION,
            &[Token::Uint(market_id as u128), Token::Uint(actual_price as u128)],
        );
        info!(chain = "polygon", market_id, actual_price, "resolving market");
        let market_contract = self.config.market_contract.clone();
        self.send(signer, &market_contract, data, Finality::Confirmed).await
    }

    async fn collateral_balance(&self, account: &str) -> Result<u64> {
        let data = abi::encode_call(FN_BALANCE_OF, &[address_arg(account)?]);
        let out = self.call(&self.config.usdc, data, "balanceOf").await?;
        Decoder::new(&out, "balanceOf")
            .u64(0)
            .map_err(|e| EngineError::chain(Chain::Polygon, e))
    }

    fn validate_address(&self, address: &str) -> bool {
        abi::parse_address(address).is_some()
    }
}

// ============================================================================
// BRIDGE ENDPOINT
// ============================================================================

#[async_trait]
impl BridgeEndpoint for PolygonAdapter {
    fn chain(&self) -> Chain {
        Chain::Polygon
    }

    fn emitter_address(&self) -> String {
        self.emitter_bytes().map(hex::encode).unwrap_or_default()
    }

    async fn prepare_lock(&self, request: &BridgeRequest, signer: &dyn Signer) -> Result<SignedTx> {
        ensure_signer_chain(signer, Chain::Polygon)?;
        let recipient = super::encode_address(request.destination, &request.recipient).ok_or_else(|| {
            ValidationError::InvalidAddress {
                chain: request.destination,
                address: request.recipient.clone(),
            }
        })?;

        let bridge = self.config.bridge_contract.clone();
        self.ensure_allowance(signer, &bridge, request.amount).await?;

        let data = abi::encode_call(
            FN_BRIDGE_USDC,
            &[
                Token::Uint(request.amount as u128),
                Token::Bytes32(recipient),
                Token::Uint(request.destination.wormhole_id() as u128),
                Token::Uint(request.nonce as u128),
            ],
        );
        self.sign(signer, &bridge, data).await
    }

    async fn broadcast_lock(&self, signed: &SignedTx) -> Result<()> {
        self.retry
            .run("broadcast_lock", |_| async {
                match self.rpc.send_raw_transaction(signed).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_already_known(&e) => Ok(()),
                    Err(e) => Err(EngineError::chain_tx(Chain::Polygon, e, &signed.tx_ref)),
                }
            })
            .await
    }

    async fn source_state(&self, signed: &SignedTx) -> Result<SourceState> {
        let tx_ref = &signed.tx_ref;
        let receipt = self
            .retry
            .run("eth_getTransactionReceipt", |_| async {
                self.rpc
                    .receipt(tx_ref)
                    .await
                    .map_err(|e| EngineError::chain_tx(Chain::Polygon, e, tx_ref))
            })
            .await?;

        let receipt = match receipt {
            None => {
                let known = self
                    .rpc
                    .transaction_known(tx_ref)
                    .await
                    .map_err(|e| EngineError::chain_tx(Chain::Polygon, e, tx_ref))?;
                return Ok(if known { SourceState::Pending } else { SourceState::Unknown });
            }
            Some(receipt) if !receipt.success => return Ok(SourceState::Reverted("execution reverted".into())),
            Some(receipt) => receipt,
        };

        let finalized = self
            .rpc
            .finalized_block()
            .await
            .map_err(|e| EngineError::chain(Chain::Polygon, e))?;
        if receipt.block_number > finalized {
            return Ok(SourceState::Pending);
        }

        let bridge = abi::parse_address(&self.config.bridge_contract).ok_or_else(|| ValidationError::InvalidAddress {
            chain: Chain::Polygon,
            address: self.config.bridge_contract.clone(),
        })?;
        let topic = abi::event_topic(EVENT_TRANSFER_LOCKED);
        let log = receipt
            .logs
            .iter()
            .find(|log| log.address == bridge && log.topics.first() == Some(&topic))
            .ok_or_else(|| {
                EngineError::chain_tx(
                    Chain::Polygon,
                    ChainError::decode("lock receipt", "no TransferLocked event"),
                    tx_ref,
                )
            })?;
        let sequence = log
            .topics
            .get(1)
            .ok_or_else(|| EngineError::chain(Chain::Polygon, ChainError::decode("TransferLocked", "missing sequence topic")))
            .and_then(|word| {
                Decoder::new(word, "TransferLocked")
                    .u64(0)
                    .map_err(|e| EngineError::chain(Chain::Polygon, e))
            })?;

        Ok(SourceState::Emitted {
            emitter: self.emitter_address(),
            sequence,
        })
    }

    async fn is_redeemed(&self, attestation: &Attestation) -> Result<bool> {
        let data = abi::encode_call(FN_IS_TRANSFER_COMPLETED, &[Token::Bytes32(attestation.digest())]);
        let out = self.call(&self.config.bridge_contract, data, "isTransferCompleted").await?;
        Decoder::new(&out, "isTransferCompleted")
            .bool(0)
            .map_err(|e| EngineError::chain(Chain::Polygon, e))
    }

    async fn redeem(&self, attestation: &Attestation, signer: &dyn Signer) -> Result<Confirmation> {
        let payload = attestation.transfer_payload()?;
        if payload.destination()? != Chain::Polygon {
            return Err(AttestationError::PayloadMismatch(format!(
                "payload targets chain {}",
                payload.recipient_chain
            ))
            .into());
        }
        let data = abi::encode_call(FN_COMPLETE_TRANSFER, &[Token::Bytes(attestation.raw().to_vec())]);
        info!(chain = "polygon", amount = payload.amount, "redeeming transfer");
        let bridge = self.config.bridge_contract.clone();
        self.send(signer, &bridge, data, Finality::Finalized).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::{FeeRate, USDC_UNIT};
    use crate::chain::simulated::{SimulatedNetwork, SimulatedWallet};
    use crate::clock::ManualClock;

    fn simulated() -> (SimulatedNetwork, PolygonAdapter, u64) {
        let network = SimulatedNetwork::new(Arc::new(ManualClock::new(1_700_000_000)), FeeRate::default());
        let adapter = network.polygon_adapter(ConfirmationPolicy::immediate(), RetryPolicy::immediate(3));
        let market_id = network.evm.create_market("COCOA", 9_000_00, 1_800_000_000);
        (network, adapter, market_id)
    }

    fn prediction_return(target_date: u64, resolved: bool, actual: u64) -> Vec<u8> {
        abi::encode(&[
            Token::String("COCOA".into()),
            Token::Uint(8_450_00),
            Token::Uint(9_000_00),
            Token::Uint(target_date as u128),
            Token::Uint(72),
            Token::Uint(100_000_000),
            Token::Uint(0),
            Token::Bool(resolved),
            Token::Uint(actual as u128),
        ])
    }

    #[tokio::test]
    async fn test_sufficient_allowance_skips_approve() {
        let (network, adapter, market_id) = simulated();
        let alice = SimulatedWallet::evm("alice");
        network.evm.mint(&alice.address(), 50 * USDC_UNIT);
        let market_contract = adapter.config.market_contract.clone();

        adapter.ensure_allowance(&alice, &market_contract, 40 * USDC_UNIT).await.unwrap();
        assert_eq!(network.evm.successful_transactions(), 1);

        adapter.stake(market_id, Side::Yes, 10 * USDC_UNIT, &alice).await.unwrap();
        assert_eq!(network.evm.successful_transactions(), 2);
        assert_eq!(
            adapter.allowance(&alice.address(), &market_contract).await.unwrap(),
            30 * USDC_UNIT
        );
    }

    #[tokio::test]
    async fn test_short_approve_is_insufficient_allowance() {
        let (network, adapter, market_id) = simulated();
        let alice = SimulatedWallet::evm("alice");
        network.evm.mint(&alice.address(), 50 * USDC_UNIT);
        network.evm.cap_approvals(Some(USDC_UNIT));

        let err = adapter.stake(market_id, Side::No, 5 * USDC_UNIT, &alice).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientAllowance {
                chain: Chain::Polygon,
                allowance: USDC_UNIT,
                required: 5 * USDC_UNIT,
            }
        );
        // only the approve landed
        assert_eq!(network.evm.successful_transactions(), 1);
        assert_eq!(network.evm.balance(&alice.address()), 50 * USDC_UNIT);
    }

    #[test]
    fn test_decode_open_market() {
        let market = decode_market(3, &prediction_return(1_800_000_000, false, 0))
            .unwrap()
            .unwrap();
        assert_eq!(market.key, MarketKey::new(Chain::Polygon, 3));
        assert_eq!(market.commodity, "COCOA");
        assert_eq!(market.threshold_price, 9_000_00);
        assert_eq!(market.current_price, Some(8_450_00));
        assert_eq!(market.confidence, Some(72));
        assert_eq!(market.outcome, None);
        assert_eq!(market.oracle_price, None);
    }

    #[test]
    fn test_decode_resolved_market_derives_outcome() {
        let market = decode_market(3, &prediction_return(1_800_000_000, true, 9_000_00))
            .unwrap()
            .unwrap();
        assert_eq!(market.outcome, Some(Side::Yes));

        let market = decode_market(3, &prediction_return(1_800_000_000, true, 8_999_99))
            .unwrap()
            .unwrap();
        assert_eq!(market.outcome, Some(Side::No));
    }

    #[test]
    fn test_unset_market_is_none() {
        assert_eq!(decode_market(99, &prediction_return(0, false, 0)).unwrap(), None);
    }

    #[test]
    fn test_raw_receipt_parsing() {
        let raw = RawReceipt {
            block_number: "0x10".into(),
            status: "0x1".into(),
            logs: vec![RawLog {
                address: "0x00000000000000000000000000000000000000bb".into(),
                topics: vec![format!("0x{}", hex::encode(abi::event_topic(EVENT_TRANSFER_LOCKED)))],
                data: "0x".into(),
            }],
        };
        let receipt = raw.into_receipt().unwrap();
        assert_eq!(receipt.block_number, 16);
        assert!(receipt.success);
        assert_eq!(receipt.logs[0].address[19], 0xbb);
    }

    #[test]
    fn test_address_arg_rejects_base58() {
        assert!(address_arg("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin").is_err());
        assert!(address_arg("0x00000000000000000000000000000000000000bb").is_ok());
    }
}
