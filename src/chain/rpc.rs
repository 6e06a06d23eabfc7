/// JSON-RPC 2.0 HTTP client shared by the EVM and account-model transports.
///
/// Transport failures (connection, timeout, 5xx) map to `ChainError::Rpc` and
/// are retried by the caller. Well-formed error objects from the node map to
/// `ChainError::InvalidResponse`, except for the "already known" family which
/// the submitters treat as success on rebroadcast.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::ChainError;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default timeout for a single RPC round-trip
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct JsonRpcClient {
    endpoint_url: String,
    client: Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            endpoint_url: endpoint_url.into(),
            client,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Call `method` and deserialize the `result` field. A JSON `null`
    /// result deserializes into `Option::None` when `T` is an Option.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!(method, id, url = %self.endpoint_url, "rpc call");

        let response = self
            .client
            .post(&self.endpoint_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ChainError::Rpc(format!("{} returned status {}", method, status)));
        }
        if !status.is_success() {
            return Err(ChainError::InvalidResponse(format!("{} returned status {}", method, status)));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(classify_node_error(method, &err));
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::decode(method, e.to_string()))
    }
}

/// Nodes report rate limiting and overload through error objects too
fn classify_node_error(method: &str, err: &RpcErrorObject) -> ChainError {
    let message = err.message.to_lowercase();
    if err.code == -32005 || message.contains("rate limit") || message.contains("timeout") {
        return ChainError::Rpc(format!("{}: {}", method, err.message));
    }
    ChainError::InvalidResponse(format!("{} error {}: {}", method, err.code, err.message))
}

/// Node rejected a rebroadcast because it already has the transaction
pub fn is_already_known(err: &ChainError) -> bool {
    match err {
        ChainError::InvalidResponse(message) => {
            let message = message.to_lowercase();
            message.contains("already known")
                || message.contains("already been processed")
                || message.contains("nonce too low")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_errors_are_classified() {
        let limited = RpcErrorObject {
            code: -32005,
            message: "limit exceeded".into(),
        };
        assert!(classify_node_error("eth_call", &limited).is_retryable());

        let reverted = RpcErrorObject {
            code: 3,
            message: "execution reverted".into(),
        };
        assert!(!classify_node_error("eth_call", &reverted).is_retryable());
    }

    #[test]
    fn test_already_known_rebroadcast() {
        let err = ChainError::InvalidResponse(
            "sendTransaction error -32002: This transaction has already been processed".into(),
        );
        assert!(is_already_known(&err));
        assert!(!is_already_known(&ChainError::Rpc("already known".into())));
    }
}
