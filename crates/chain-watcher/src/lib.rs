pub mod erc20;
pub mod retry;
pub mod rpc;

use async_trait::async_trait;
use battle_domain::{TokenAmount, addresses_equal, normalize_address};
use ethabi::ethereum_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use erc20::{TRANSFER_EVENT_SIGNATURE, TRANSFER_EVENT_TOPIC};
pub use retry::RetryPolicy;
pub use rpc::{
    EthLog, EthSendTransaction, EthTransaction, EthTransactionReceipt, EvmJsonRpcClient,
    ReqwestEvmJsonRpcClient, RpcError, parse_hex_u64,
};

/// Relative tolerance of 0.01%, as `1 / AMOUNT_TOLERANCE_DENOMINATOR`.
pub const AMOUNT_TOLERANCE_DENOMINATOR: u64 = 10_000;

pub const ERC20_TOKEN_TYPE: &str = "ERC20";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    NotFound,
    Reverted,
    Pending,
    WrongContract,
    NoTransferEvent,
    SenderMismatch,
    ReceiverMismatch,
    AmountMismatch,
    RpcUnavailable,
}

impl ChainErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Reverted => "reverted",
            Self::Pending => "pending",
            Self::WrongContract => "wrong_contract",
            Self::NoTransferEvent => "no_transfer_event",
            Self::SenderMismatch => "sender_mismatch",
            Self::ReceiverMismatch => "receiver_mismatch",
            Self::AmountMismatch => "amount_mismatch",
            Self::RpcUnavailable => "rpc_unavailable",
        }
    }

    /// `pending` and node unavailability may resolve on their own; everything else is final.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Pending | Self::RpcUnavailable)
    }
}

/// Addresses every verification is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub token_contract: String,
    pub treasury_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTransfer {
    pub tx_hash: String,
    pub expected_from: String,
    pub expected_amount: TokenAmount,
}

/// Decoded view of a transfer. Fields are filled as far as verification got, even on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferVerificationResult {
    pub tx_hash: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<TokenAmount>,
    pub token_type: String,
    pub block_number: Option<u64>,
    pub is_valid: bool,
    pub failure_reason: Option<String>,
}

impl TransferVerificationResult {
    fn empty(tx_hash: &str) -> Self {
        Self {
            tx_hash: tx_hash.to_string(),
            from: None,
            to: None,
            amount: None,
            token_type: ERC20_TOKEN_TYPE.to_string(),
            block_number: None,
            is_valid: false,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transfer verification failed ({}): {detail}", kind.as_str())]
pub struct ChainVerifyError {
    pub kind: ChainErrorKind,
    pub detail: String,
    pub result: Box<TransferVerificationResult>,
}

impl ChainVerifyError {
    fn new(
        kind: ChainErrorKind,
        detail: impl Into<String>,
        mut result: TransferVerificationResult,
    ) -> Self {
        let detail = detail.into();
        result.is_valid = false;
        result.failure_reason = Some(format!("{}: {detail}", kind.as_str()));
        Self {
            kind,
            detail,
            result: Box::new(result),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Confirms that a transaction hash is a finished ERC-20 transfer to the treasury.
///
/// Read-only and safe to repeat. It does not remember which hashes were already credited;
/// callers must consume the hash atomically with whatever they credit for it.
///
/// Nodes return no receipt for a transaction that is not yet mined, so a freshly broadcast
/// hash reports `not_found` rather than `pending`. Callers holding a hash they were just
/// handed should treat an early `not_found` as awaiting confirmation and retry later, not
/// as proof the transfer does not exist.
#[async_trait]
pub trait TransferVerifier: Send + Sync {
    async fn verify_transfer(
        &self,
        expected: &ExpectedTransfer,
    ) -> Result<TransferVerificationResult, ChainVerifyError>;
}

#[derive(Debug, Clone)]
pub struct EvmTransferVerifier<C> {
    client: C,
    config: VerifierConfig,
    retry: RetryPolicy,
}

impl<C> EvmTransferVerifier<C>
where
    C: EvmJsonRpcClient,
{
    #[must_use]
    pub fn new(client: C, config: VerifierConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
        }
    }

    #[must_use]
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    fn unavailable(err: &RpcError, result: TransferVerificationResult) -> ChainVerifyError {
        let kind = if err.is_transient() {
            ChainErrorKind::RpcUnavailable
        } else {
            ChainErrorKind::NotFound
        };
        ChainVerifyError::new(kind, err.to_string(), result)
    }
}

#[async_trait]
impl<C> TransferVerifier for EvmTransferVerifier<C>
where
    C: EvmJsonRpcClient,
{
    async fn verify_transfer(
        &self,
        expected: &ExpectedTransfer,
    ) -> Result<TransferVerificationResult, ChainVerifyError> {
        let tx_hash = expected.tx_hash.as_str();
        let mut result = TransferVerificationResult::empty(tx_hash);

        let receipt = match self
            .retry
            .run("eth_getTransactionReceipt", || {
                self.client.get_transaction_receipt(tx_hash)
            })
            .await
        {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                return Err(ChainVerifyError::new(
                    ChainErrorKind::NotFound,
                    "no receipt for transaction",
                    result,
                ));
            }
            Err(err) => return Err(Self::unavailable(&err, result)),
        };
        result.block_number = receipt
            .block_number
            .as_deref()
            .and_then(|b| parse_hex_u64(b).ok());
        if !receipt.succeeded() {
            return Err(ChainVerifyError::new(
                ChainErrorKind::Reverted,
                format!("receipt status {:?}", receipt.status),
                result,
            ));
        }

        let tx = match self
            .retry
            .run("eth_getTransactionByHash", || {
                self.client.get_transaction_by_hash(tx_hash)
            })
            .await
        {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                return Err(ChainVerifyError::new(
                    ChainErrorKind::NotFound,
                    "transaction body not found",
                    result,
                ));
            }
            Err(err) => return Err(Self::unavailable(&err, result)),
        };
        if tx.block_number.is_none() {
            return Err(ChainVerifyError::new(
                ChainErrorKind::Pending,
                "transaction not yet mined",
                result,
            ));
        }

        let tx_to = tx.to.as_deref().unwrap_or_default();
        if !addresses_equal(tx_to, &self.config.token_contract) {
            return Err(ChainVerifyError::new(
                ChainErrorKind::WrongContract,
                format!(
                    "transaction sent to {tx_to}, expected token contract {}",
                    self.config.token_contract
                ),
                result,
            ));
        }

        let Some(log) = receipt.logs.iter().find(|log| {
            addresses_equal(&log.address, &self.config.token_contract) && erc20::is_transfer_log(log)
        }) else {
            return Err(ChainVerifyError::new(
                ChainErrorKind::NoTransferEvent,
                "receipt has no ERC-20 Transfer log from the token contract",
                result,
            ));
        };
        let decoded = erc20::decode_transfer_log(log).map_err(|e| {
            ChainVerifyError::new(ChainErrorKind::NoTransferEvent, e.to_string(), result.clone())
        })?;
        result.from = Some(decoded.from.clone());
        result.to = Some(decoded.to.clone());
        result.amount = erc20::u256_to_token_amount(decoded.amount);

        if !addresses_equal(&decoded.from, &expected.expected_from) {
            warn!(tx_hash, from = %decoded.from, expected = %normalize_address(&expected.expected_from), "transfer sender mismatch");
            return Err(ChainVerifyError::new(
                ChainErrorKind::SenderMismatch,
                format!("sender {} != {}", decoded.from, expected.expected_from),
                result,
            ));
        }
        if !addresses_equal(&decoded.to, &self.config.treasury_address) {
            warn!(tx_hash, to = %decoded.to, "transfer receiver mismatch");
            return Err(ChainVerifyError::new(
                ChainErrorKind::ReceiverMismatch,
                format!("receiver {} != {}", decoded.to, self.config.treasury_address),
                result,
            ));
        }
        let expected_units = U256::from(expected.expected_amount.as_base_units());
        if !erc20::within_relative_tolerance(
            decoded.amount,
            expected_units,
            AMOUNT_TOLERANCE_DENOMINATOR,
        ) {
            let actual = result
                .amount
                .map_or_else(|| decoded.amount.to_string(), |a| a.to_string());
            warn!(tx_hash, %actual, expected = %expected.expected_amount, "transfer amount mismatch");
            return Err(ChainVerifyError::new(
                ChainErrorKind::AmountMismatch,
                format!("amount {actual} outside tolerance of {}", expected.expected_amount),
                result,
            ));
        }

        result.is_valid = true;
        debug!(tx_hash, block_number = ?result.block_number, "transfer verified");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const TREASURY: &str = "0x00000000000000000000000000000000000000bb";
    const SENDER: &str = "0xabcdef0000000000000000000000000000000001";

    #[derive(Debug, Default, Clone)]
    struct MockRpcClient {
        receipts: Arc<Mutex<HashMap<String, EthTransactionReceipt>>>,
        txs: Arc<Mutex<HashMap<String, EthTransaction>>>,
        transient_failures: Arc<Mutex<u32>>,
        receipt_calls: Arc<Mutex<u32>>,
    }

    impl MockRpcClient {
        fn insert(&self, receipt: EthTransactionReceipt, tx: EthTransaction) {
            self.receipts
                .lock()
                .expect("lock")
                .insert(tx.hash.clone(), receipt);
            self.txs.lock().expect("lock").insert(tx.hash.clone(), tx);
        }
    }

    #[async_trait]
    impl EvmJsonRpcClient for MockRpcClient {
        async fn get_transaction_receipt(
            &self,
            tx_hash: &str,
        ) -> Result<Option<EthTransactionReceipt>, RpcError> {
            *self.receipt_calls.lock().expect("lock") += 1;
            let mut failures = self.transient_failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(RpcError::Transport("connection refused".to_string()));
            }
            Ok(self.receipts.lock().expect("lock").get(tx_hash).cloned())
        }

        async fn get_transaction_by_hash(
            &self,
            tx_hash: &str,
        ) -> Result<Option<EthTransaction>, RpcError> {
            Ok(self.txs.lock().expect("lock").get(tx_hash).cloned())
        }

        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(100)
        }

        async fn gas_price(&self) -> Result<u128, RpcError> {
            Ok(1)
        }

        async fn pending_transaction_count(&self, _address: &str) -> Result<u64, RpcError> {
            Ok(0)
        }

        async fn send_transaction(&self, _tx: &EthSendTransaction) -> Result<String, RpcError> {
            Err(RpcError::Node {
                code: -32601,
                message: "not supported".to_string(),
            })
        }
    }

    fn address_topic(address: &str) -> String {
        format!("0x{}{}", "0".repeat(24), address.trim_start_matches("0x"))
    }

    fn transfer_log(from: &str, to: &str, amount: u128) -> EthLog {
        EthLog {
            address: TOKEN.to_string(),
            topics: vec![
                TRANSFER_EVENT_TOPIC.to_string(),
                address_topic(from),
                address_topic(to),
            ],
            data: format!("0x{amount:064x}"),
        }
    }

    fn mined(hash: &str, status: &str, logs: Vec<EthLog>) -> (EthTransactionReceipt, EthTransaction) {
        (
            EthTransactionReceipt {
                transaction_hash: Some(hash.to_string()),
                status: Some(status.to_string()),
                block_number: Some("0x2a".to_string()),
                to: Some(TOKEN.to_string()),
                logs,
            },
            EthTransaction {
                hash: hash.to_string(),
                from: Some(SENDER.to_string()),
                to: Some(TOKEN.to_string()),
                block_number: Some("0x2a".to_string()),
            },
        )
    }

    fn verifier(client: MockRpcClient) -> EvmTransferVerifier<MockRpcClient> {
        EvmTransferVerifier::new(
            client,
            VerifierConfig {
                token_contract: TOKEN.to_string(),
                treasury_address: TREASURY.to_string(),
            },
            RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        )
    }

    fn expected(hash: &str, amount: &str) -> ExpectedTransfer {
        ExpectedTransfer {
            tx_hash: hash.to_string(),
            expected_from: SENDER.to_string(),
            expected_amount: amount.parse().expect("amount"),
        }
    }

    fn units(amount: &str) -> u128 {
        amount
            .parse::<TokenAmount>()
            .expect("amount")
            .as_base_units()
    }

    #[tokio::test]
    async fn valid_transfer_returns_decoded_fields() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x01", "0x1", vec![transfer_log(SENDER, TREASURY, units("100"))]);
        client.insert(r, t);

        let result = verifier(client)
            .verify_transfer(&expected("0x01", "100"))
            .await
            .expect("valid");
        assert!(result.is_valid);
        assert_eq!(result.from.as_deref(), Some(SENDER));
        assert_eq!(result.to.as_deref(), Some(TREASURY));
        assert_eq!(result.amount, Some(TokenAmount::from_whole_tokens(100)));
        assert_eq!(result.block_number, Some(42));
        assert_eq!(result.token_type, "ERC20");
        assert!(result.failure_reason.is_none());
    }

    #[tokio::test]
    async fn amount_within_tolerance_band_is_accepted() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x02", "0x1", vec![transfer_log(SENDER, TREASURY, units("100.005"))]);
        client.insert(r, t);

        let result = verifier(client)
            .verify_transfer(&expected("0x02", "100.0"))
            .await
            .expect("0.005% off is inside tolerance");
        assert_eq!(result.amount.map(|a| a.to_string()).as_deref(), Some("100.005"));
    }

    #[tokio::test]
    async fn amount_outside_tolerance_band_is_rejected_with_decoded_amount() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x03", "0x1", vec![transfer_log(SENDER, TREASURY, units("100.02"))]);
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x03", "100.0"))
            .await
            .expect_err("0.02% off");
        assert_eq!(err.kind, ChainErrorKind::AmountMismatch);
        assert!(!err.is_retryable());
        assert_eq!(err.result.amount.map(|a| a.to_string()).as_deref(), Some("100.02"));
        assert!(!err.result.is_valid);
        assert!(
            err.result
                .failure_reason
                .as_deref()
                .is_some_and(|r| r.starts_with("amount_mismatch"))
        );
    }

    #[tokio::test]
    async fn sender_comparison_ignores_case() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x04", "0x1", vec![transfer_log(SENDER, TREASURY, units("5"))]);
        client.insert(r, t);

        let mut exp = expected("0x04", "5");
        exp.expected_from = SENDER.to_uppercase().replace("0X", "0x");
        verifier(client)
            .verify_transfer(&exp)
            .await
            .expect("mixed-case sender matches");
    }

    #[tokio::test]
    async fn sender_mismatch_returns_partial_result_for_audit() {
        let client = MockRpcClient::default();
        let other = "0x9999999999999999999999999999999999999999";
        let (r, t) = mined("0x05", "0x1", vec![transfer_log(other, TREASURY, units("5"))]);
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x05", "5"))
            .await
            .expect_err("sender mismatch");
        assert_eq!(err.kind, ChainErrorKind::SenderMismatch);
        assert_eq!(err.result.from.as_deref(), Some(other));
        assert_eq!(err.result.to.as_deref(), Some(TREASURY));
        assert_eq!(err.result.amount, Some(TokenAmount::from_whole_tokens(5)));
    }

    #[tokio::test]
    async fn receiver_other_than_treasury_is_rejected() {
        let client = MockRpcClient::default();
        let elsewhere = "0x7777777777777777777777777777777777777777";
        let (r, t) = mined("0x06", "0x1", vec![transfer_log(SENDER, elsewhere, units("5"))]);
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x06", "5"))
            .await
            .expect_err("receiver mismatch");
        assert_eq!(err.kind, ChainErrorKind::ReceiverMismatch);
    }

    #[tokio::test]
    async fn reverted_receipt_never_verifies_even_with_matching_logs() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x07", "0x0", vec![transfer_log(SENDER, TREASURY, units("5"))]);
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x07", "5"))
            .await
            .expect_err("reverted");
        assert_eq!(err.kind, ChainErrorKind::Reverted);
        assert_eq!(err.result.block_number, Some(42));
        assert!(err.result.from.is_none());
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let err = verifier(MockRpcClient::default())
            .verify_transfer(&expected("0xmissing", "5"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind, ChainErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unmined_transaction_is_pending_and_retryable() {
        let client = MockRpcClient::default();
        let (r, mut t) = mined("0x08", "0x1", vec![transfer_log(SENDER, TREASURY, units("5"))]);
        t.block_number = None;
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x08", "5"))
            .await
            .expect_err("pending");
        assert_eq!(err.kind, ChainErrorKind::Pending);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn native_transfer_not_addressed_to_token_contract_is_wrong_contract() {
        let client = MockRpcClient::default();
        let (r, mut t) = mined("0x09", "0x1", Vec::new());
        t.to = Some(TREASURY.to_string());
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x09", "5"))
            .await
            .expect_err("wrong contract");
        assert_eq!(err.kind, ChainErrorKind::WrongContract);
    }

    #[tokio::test]
    async fn logs_without_erc20_transfer_shape_are_ignored() {
        let client = MockRpcClient::default();
        let mut nft_style = transfer_log(SENDER, TREASURY, units("5"));
        nft_style.topics.push(format!("0x{:064x}", 1_u8));
        let mut foreign = transfer_log(SENDER, TREASURY, units("5"));
        foreign.address = "0x1111111111111111111111111111111111111111".to_string();
        let (r, t) = mined("0x0a", "0x1", vec![nft_style, foreign]);
        client.insert(r, t);

        let err = verifier(client)
            .verify_transfer(&expected("0x0a", "5"))
            .await
            .expect_err("no transfer event");
        assert_eq!(err.kind, ChainErrorKind::NoTransferEvent);
    }

    #[tokio::test]
    async fn transient_rpc_failures_are_retried() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x0b", "0x1", vec![transfer_log(SENDER, TREASURY, units("5"))]);
        client.insert(r, t);
        *client.transient_failures.lock().expect("lock") = 2;

        verifier(client.clone())
            .verify_transfer(&expected("0x0b", "5"))
            .await
            .expect("succeeds after retries");
        assert_eq!(*client.receipt_calls.lock().expect("lock"), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_rpc_unavailable() {
        let client = MockRpcClient::default();
        *client.transient_failures.lock().expect("lock") = 10;

        let err = verifier(client.clone())
            .verify_transfer(&expected("0x0c", "5"))
            .await
            .expect_err("node down");
        assert_eq!(err.kind, ChainErrorKind::RpcUnavailable);
        assert!(err.is_retryable());
        assert_eq!(*client.receipt_calls.lock().expect("lock"), 3);
    }

    #[tokio::test]
    async fn verification_is_repeatable_for_the_same_hash() {
        let client = MockRpcClient::default();
        let (r, t) = mined("0x0d", "0x1", vec![transfer_log(SENDER, TREASURY, units("5"))]);
        client.insert(r, t);
        let verifier = verifier(client);

        let first = verifier
            .verify_transfer(&expected("0x0d", "5"))
            .await
            .expect("first");
        let second = verifier
            .verify_transfer(&expected("0x0d", "5"))
            .await
            .expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn only_pending_and_rpc_unavailable_are_retryable() {
        let retryable: Vec<_> = [
            ChainErrorKind::NotFound,
            ChainErrorKind::Reverted,
            ChainErrorKind::Pending,
            ChainErrorKind::WrongContract,
            ChainErrorKind::NoTransferEvent,
            ChainErrorKind::SenderMismatch,
            ChainErrorKind::ReceiverMismatch,
            ChainErrorKind::AmountMismatch,
            ChainErrorKind::RpcUnavailable,
        ]
        .into_iter()
        .filter(|k| k.is_retryable())
        .collect();
        assert_eq!(
            retryable,
            vec![ChainErrorKind::Pending, ChainErrorKind::RpcUnavailable]
        );
    }
}
