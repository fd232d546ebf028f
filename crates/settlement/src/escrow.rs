use std::sync::Arc;

use async_trait::async_trait;
use battle_domain::{BattleId, TokenAmount};
use chain_watcher::{EthSendTransaction, EvmJsonRpcClient, RetryPolicy, parse_hex_u64};
use ethabi::ethereum_types::U256;
use ethabi::{Function, Param, ParamType, StateMutability, Token};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SettlementError;
use crate::nonce::NonceAllocator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReleaseRequest {
    pub battle_id: BattleId,
    pub recipient: String,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseTxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReleaseReceipt {
    pub tx_hash: String,
    pub status: ReleaseTxStatus,
    pub confirmations: u64,
}

/// Pays a settled wager pot out of the treasury. Amount and recipient in, tx hash out.
#[async_trait]
pub trait EscrowGateway: Send + Sync {
    async fn submit_release(&self, request: &EscrowReleaseRequest) -> Result<String, SettlementError>;

    async fn get_release_receipt(&self, tx_hash: &str)
    -> Result<EscrowReleaseReceipt, SettlementError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowGatewayConfig {
    pub token_contract: String,
    pub signer_address: String,
    pub max_gas_price_wei: u128,
    /// Applies to node reads (gas price, pending nonce, receipts, head block). Sends are
    /// never retried.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Submits ERC-20 `transfer` calls from the treasury signer through a node that holds the key.
#[derive(Clone)]
pub struct EvmEscrowGateway {
    client: Arc<dyn EvmJsonRpcClient>,
    config: EscrowGatewayConfig,
    nonces: NonceAllocator,
}

impl EvmEscrowGateway {
    pub fn new(client: Arc<dyn EvmJsonRpcClient>, config: EscrowGatewayConfig) -> Self {
        let nonces = NonceAllocator::spawn(
            client.clone(),
            config.signer_address.clone(),
            config.retry,
            64,
        );
        Self {
            client,
            config,
            nonces,
        }
    }

    async fn capped_gas_price(&self) -> Result<u128, SettlementError> {
        let suggested = self
            .config
            .retry
            .run("eth_gasPrice", || self.client.gas_price())
            .await?;
        let capped = cap_gas_price(suggested, self.config.max_gas_price_wei);
        if capped < suggested {
            warn!(
                suggested,
                cap = self.config.max_gas_price_wei,
                "node gas price above cap; using cap"
            );
        }
        Ok(capped)
    }
}

#[must_use]
pub fn cap_gas_price(suggested: u128, max_gas_price_wei: u128) -> u128 {
    suggested.min(max_gas_price_wei)
}

/// ABI-encodes `transfer(address,uint256)` as `0x`-prefixed call data.
pub fn encode_erc20_transfer(recipient: &str, amount: TokenAmount) -> Result<String, SettlementError> {
    let to = recipient
        .trim()
        .parse()
        .map(Token::Address)
        .map_err(|e| SettlementError::EscrowGateway(format!("invalid recipient {recipient}: {e}")))?;

    #[allow(deprecated)]
    let func = Function {
        name: "transfer".to_string(),
        inputs: vec![
            Param {
                name: "to".to_string(),
                kind: ParamType::Address,
                internal_type: None,
            },
            Param {
                name: "amount".to_string(),
                kind: ParamType::Uint(256),
                internal_type: None,
            },
        ],
        outputs: vec![Param {
            name: String::new(),
            kind: ParamType::Bool,
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    };
    let data = func
        .encode_input(&[to, Token::Uint(U256::from(amount.as_base_units()))])
        .map_err(|e| SettlementError::EscrowGateway(format!("abi encode failed: {e}")))?;
    Ok(format!("0x{}", hex::encode(data)))
}

#[async_trait]
impl EscrowGateway for EvmEscrowGateway {
    async fn submit_release(&self, request: &EscrowReleaseRequest) -> Result<String, SettlementError> {
        let data = encode_erc20_transfer(&request.recipient, request.amount)?;
        let gas_price = self.capped_gas_price().await?;
        let nonce = self.nonces.reserve().await?;
        let tx = EthSendTransaction {
            from: self.config.signer_address.clone(),
            to: self.config.token_contract.clone(),
            data,
            nonce,
            gas_price,
        };
        match self.client.send_transaction(&tx).await {
            Ok(tx_hash) => {
                info!(
                    battle_id = %request.battle_id,
                    recipient = %request.recipient,
                    amount = %request.amount,
                    nonce,
                    tx_hash = %tx_hash,
                    "escrow release submitted"
                );
                Ok(tx_hash)
            }
            Err(err) => {
                // The reserved nonce was never used; let the chain view fill the gap.
                if let Err(resync_err) = self.nonces.resync().await {
                    warn!(error = %resync_err, "nonce resync failed");
                }
                Err(SettlementError::Rpc(err))
            }
        }
    }

    async fn get_release_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<EscrowReleaseReceipt, SettlementError> {
        let retry = self.config.retry;
        let Some(receipt) = retry
            .run("eth_getTransactionReceipt", || {
                self.client.get_transaction_receipt(tx_hash)
            })
            .await?
        else {
            return Ok(EscrowReleaseReceipt {
                tx_hash: tx_hash.to_string(),
                status: ReleaseTxStatus::Pending,
                confirmations: 0,
            });
        };
        let latest_block = retry
            .run("eth_blockNumber", || self.client.block_number())
            .await?;
        let receipt_block = receipt
            .block_number
            .as_deref()
            .map(parse_hex_u64)
            .transpose()?
            .unwrap_or(0);
        let confirmations = latest_block.saturating_sub(receipt_block).saturating_add(1);
        Ok(EscrowReleaseReceipt {
            tx_hash: tx_hash.to_string(),
            status: if receipt.succeeded() {
                ReleaseTxStatus::Confirmed
            } else {
                ReleaseTxStatus::Failed
            },
            confirmations,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chain_watcher::{EthTransaction, EthTransactionReceipt, RpcError};

    use super::*;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const SIGNER: &str = "0x00000000000000000000000000000000000000bb";
    const WINNER: &str = "0x00000000000000000000000000000000000000cc";

    #[derive(Debug, Default)]
    struct RecordingClient {
        gas_price: u128,
        gas_price_failures: AtomicU32,
        receipt_failures: AtomicU32,
        fail_send: bool,
        sent: Mutex<Vec<EthSendTransaction>>,
        receipt: Option<EthTransactionReceipt>,
    }

    #[async_trait]
    impl EvmJsonRpcClient for RecordingClient {
        async fn get_transaction_receipt(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<EthTransactionReceipt>, RpcError> {
            if take_failure(&self.receipt_failures) {
                return Err(RpcError::Timeout(50));
            }
            Ok(self.receipt.clone())
        }

        async fn get_transaction_by_hash(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<EthTransaction>, RpcError> {
            Ok(None)
        }

        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(12)
        }

        async fn gas_price(&self) -> Result<u128, RpcError> {
            if take_failure(&self.gas_price_failures) {
                return Err(RpcError::Transport("connection reset".to_string()));
            }
            Ok(self.gas_price)
        }

        async fn pending_transaction_count(&self, _address: &str) -> Result<u64, RpcError> {
            Ok(u64::try_from(self.sent.lock().expect("lock").len()).unwrap_or(u64::MAX))
        }

        async fn send_transaction(&self, tx: &EthSendTransaction) -> Result<String, RpcError> {
            if self.fail_send {
                return Err(RpcError::Node {
                    code: -32000,
                    message: "insufficient funds".to_string(),
                });
            }
            let mut sent = self.sent.lock().expect("lock");
            sent.push(tx.clone());
            Ok(format!("0xrelease{}", sent.len()))
        }
    }

    fn take_failure(remaining: &AtomicU32) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn config(max_gas_price_wei: u128) -> EscrowGatewayConfig {
        EscrowGatewayConfig {
            token_contract: TOKEN.to_string(),
            signer_address: SIGNER.to_string(),
            max_gas_price_wei,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 1,
            },
        }
    }

    fn request(amount: u64) -> EscrowReleaseRequest {
        EscrowReleaseRequest {
            battle_id: BattleId::new(),
            recipient: WINNER.to_string(),
            amount: TokenAmount::from_whole_tokens(amount),
        }
    }

    #[test]
    fn erc20_transfer_call_data_has_selector_and_words() {
        let data = encode_erc20_transfer(WINNER, TokenAmount(1)).expect("encode");
        // keccak256("transfer(address,uint256)")[..4]
        assert!(data.starts_with("0xa9059cbb"));
        assert_eq!(data.len(), 2 + 8 + 64 * 2);
        assert!(data.ends_with(&format!("{:064x}", 1_u8)));
        assert!(data.contains("cc"));
        assert!(encode_erc20_transfer("not-an-address", TokenAmount(1)).is_err());
    }

    #[test]
    fn gas_price_is_capped() {
        assert_eq!(cap_gas_price(50, 100), 50);
        assert_eq!(cap_gas_price(500, 100), 100);
    }

    #[tokio::test]
    async fn submit_release_uses_capped_gas_and_token_contract() {
        let client = Arc::new(RecordingClient {
            gas_price: 90_000_000_000,
            ..RecordingClient::default()
        });
        let gateway = EvmEscrowGateway::new(client.clone(), config(30_000_000_000));

        let first = gateway.submit_release(&request(20)).await.expect("submit");
        let second = gateway.submit_release(&request(30)).await.expect("submit");
        assert_eq!(first, "0xrelease1");
        assert_eq!(second, "0xrelease2");

        let sent = client.sent.lock().expect("lock");
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|tx| tx.gas_price == 30_000_000_000));
        assert!(sent.iter().all(|tx| tx.to == TOKEN && tx.from == SIGNER));
        assert_eq!(sent[0].nonce, 0);
        assert_eq!(sent[1].nonce, 1);
    }

    #[tokio::test]
    async fn dropped_gas_price_query_is_retried_and_release_still_submits() {
        let client = Arc::new(RecordingClient {
            gas_price: 5,
            gas_price_failures: AtomicU32::new(1),
            ..RecordingClient::default()
        });
        let gateway = EvmEscrowGateway::new(client.clone(), config(10));

        let tx_hash = gateway.submit_release(&request(20)).await.expect("submit");
        assert_eq!(tx_hash, "0xrelease1");
        assert_eq!(client.gas_price_failures.load(Ordering::SeqCst), 0);
        assert_eq!(client.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn gas_price_outage_beyond_retry_budget_sends_nothing() {
        let client = Arc::new(RecordingClient {
            gas_price: 5,
            gas_price_failures: AtomicU32::new(10),
            ..RecordingClient::default()
        });
        let gateway = EvmEscrowGateway::new(client.clone(), config(10));

        let err = gateway
            .submit_release(&request(20))
            .await
            .expect_err("node down");
        assert!(matches!(err, SettlementError::Rpc(RpcError::Transport(_))));
        assert_eq!(client.gas_price_failures.load(Ordering::SeqCst), 7);
        assert!(client.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn failed_submission_surfaces_rpc_error() {
        let client = Arc::new(RecordingClient {
            gas_price: 1,
            fail_send: true,
            ..RecordingClient::default()
        });
        let gateway = EvmEscrowGateway::new(client, config(10));
        let err = gateway
            .submit_release(&request(5))
            .await
            .expect_err("send fails");
        assert!(matches!(err, SettlementError::Rpc(_)));
    }

    #[tokio::test]
    async fn release_receipt_counts_confirmations() {
        let client = Arc::new(RecordingClient {
            receipt: Some(EthTransactionReceipt {
                transaction_hash: Some("0xrelease1".to_string()),
                status: Some("0x1".to_string()),
                block_number: Some("0xa".to_string()),
                to: Some(TOKEN.to_string()),
                logs: Vec::new(),
            }),
            receipt_failures: AtomicU32::new(2),
            ..RecordingClient::default()
        });
        let gateway = EvmEscrowGateway::new(client, config(10));
        let receipt = gateway
            .get_release_receipt("0xrelease1")
            .await
            .expect("receipt");
        assert_eq!(receipt.status, ReleaseTxStatus::Confirmed);
        assert_eq!(receipt.confirmations, 3);
    }

    #[tokio::test]
    async fn missing_receipt_is_pending() {
        let gateway =
            EvmEscrowGateway::new(Arc::new(RecordingClient::default()), config(10));
        let receipt = gateway.get_release_receipt("0xnone").await.expect("receipt");
        assert_eq!(receipt.status, ReleaseTxStatus::Pending);
        assert_eq!(receipt.confirmations, 0);
    }
}
