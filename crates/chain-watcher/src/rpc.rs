use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc timed out after {0}ms")]
    Timeout(u64),
    #[error("rpc code={code} message={message}")]
    Node { code: i64, message: String },
    #[error("rpc decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// Whether the call may succeed if repeated unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            // -32000 generic server error, -32005 limit exceeded, -32603 internal error.
            Self::Node { code, .. } => matches!(code, -32000 | -32005 | -32603),
            Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransactionReceipt {
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub logs: Vec<EthLog>,
}

impl EthTransactionReceipt {
    /// EIP-658 status `0x1`. Missing or unparsable status counts as failure.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status
            .as_deref()
            .and_then(|s| parse_hex_u64(s).ok())
            .is_some_and(|v| v == 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub hash: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthSendTransaction {
    pub from: String,
    pub to: String,
    pub data: String,
    pub nonce: u64,
    pub gas_price: u128,
}

/// Node operations used by verification and escrow submission.
#[async_trait]
pub trait EvmJsonRpcClient: Send + Sync {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<EthTransactionReceipt>, RpcError>;

    async fn get_transaction_by_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<EthTransaction>, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError>;

    async fn gas_price(&self) -> Result<u128, RpcError>;

    async fn pending_transaction_count(&self, address: &str) -> Result<u64, RpcError>;

    async fn send_transaction(&self, tx: &EthSendTransaction) -> Result<String, RpcError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestEvmJsonRpcClient {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestEvmJsonRpcClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, Self::DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: endpoint.into(),
            client,
            timeout,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn rpc_call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let request = async {
            let resp = self
                .client
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        RpcError::Timeout(timeout_ms)
                    } else {
                        RpcError::Transport(e.to_string())
                    }
                })?;
            resp.json::<JsonRpcResponse>()
                .await
                .map_err(|e| RpcError::Decode(e.to_string()))
        };
        let payload = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| RpcError::Timeout(timeout_ms))??;
        if let Some(err) = payload.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(payload.result).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }
}

#[async_trait]
impl EvmJsonRpcClient for ReqwestEvmJsonRpcClient {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<EthTransactionReceipt>, RpcError> {
        self.rpc_call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await
    }

    async fn get_transaction_by_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<EthTransaction>, RpcError> {
        self.rpc_call("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let raw: String = self
            .rpc_call("eth_blockNumber", serde_json::json!([]))
            .await?;
        parse_hex_u64(&raw)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let raw: String = self.rpc_call("eth_gasPrice", serde_json::json!([])).await?;
        parse_hex_u128(&raw)
    }

    async fn pending_transaction_count(&self, address: &str) -> Result<u64, RpcError> {
        let raw: String = self
            .rpc_call(
                "eth_getTransactionCount",
                serde_json::json!([address, "pending"]),
            )
            .await?;
        parse_hex_u64(&raw)
    }

    async fn send_transaction(&self, tx: &EthSendTransaction) -> Result<String, RpcError> {
        self.rpc_call(
            "eth_sendTransaction",
            serde_json::json!([{
                "from": tx.from,
                "to": tx.to,
                "data": tx.data,
                "nonce": format!("0x{:x}", tx.nonce),
                "gasPrice": format!("0x{:x}", tx.gas_price),
            }]),
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

pub fn parse_hex_u64(input: &str) -> Result<u64, RpcError> {
    let s = input.trim();
    let raw = s.strip_prefix("0x").unwrap_or(s);
    if raw.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(raw, 16).map_err(|e| RpcError::Decode(format!("{input}: {e}")))
}

pub fn parse_hex_u128(input: &str) -> Result<u128, RpcError> {
    let s = input.trim();
    let raw = s.strip_prefix("0x").unwrap_or(s);
    if raw.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(raw, 16).map_err(|e| RpcError::Decode(format!("{input}: {e}")))
}
