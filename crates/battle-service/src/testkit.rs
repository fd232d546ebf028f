use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use battle_domain::{normalize_address, normalize_tx_hash};
use chain_watcher::{
    ChainErrorKind, ChainVerifyError, ERC20_TOKEN_TYPE, ExpectedTransfer,
    TransferVerificationResult, TransferVerifier,
};
use settlement::{
    EscrowGateway, EscrowReleaseReceipt, EscrowReleaseRequest, ReleaseTxStatus, SettlementError,
};

pub(crate) const FUNDER: &str = "0x00000000000000000000000000000000000000f1";
pub(crate) const TREASURY: &str = "0x00000000000000000000000000000000000000e5";

/// Accepts every transfer as described, unless a failure kind was registered for its hash.
#[derive(Debug, Default)]
pub(crate) struct StubVerifier {
    failures: Mutex<HashMap<String, ChainErrorKind>>,
    pub(crate) calls: AtomicUsize,
}

impl StubVerifier {
    pub(crate) fn fail_with(&self, tx_hash: &str, kind: ChainErrorKind) {
        self.failures
            .lock()
            .expect("lock")
            .insert(normalize_tx_hash(tx_hash), kind);
    }

    pub(crate) fn clear(&self, tx_hash: &str) {
        self.failures
            .lock()
            .expect("lock")
            .remove(&normalize_tx_hash(tx_hash));
    }
}

#[async_trait]
impl TransferVerifier for StubVerifier {
    async fn verify_transfer(
        &self,
        expected: &ExpectedTransfer,
    ) -> Result<TransferVerificationResult, ChainVerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = TransferVerificationResult {
            tx_hash: normalize_tx_hash(&expected.tx_hash),
            from: Some(normalize_address(&expected.expected_from)),
            to: Some(TREASURY.to_string()),
            amount: Some(expected.expected_amount),
            token_type: ERC20_TOKEN_TYPE.to_string(),
            block_number: Some(7),
            is_valid: true,
            failure_reason: None,
        };
        let failure = self
            .failures
            .lock()
            .expect("lock")
            .get(&result.tx_hash)
            .copied();
        match failure {
            None => Ok(result),
            Some(kind) => {
                result.is_valid = false;
                result.failure_reason = Some(format!("{}: stubbed", kind.as_str()));
                Err(ChainVerifyError {
                    kind,
                    detail: "stubbed".to_string(),
                    result: Box::new(result),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingEscrowGateway {
    pub(crate) fail_submit: AtomicBool,
    pub(crate) submitted: Mutex<Vec<EscrowReleaseRequest>>,
    receipts: Mutex<HashMap<String, EscrowReleaseReceipt>>,
}

impl RecordingEscrowGateway {
    pub(crate) fn set_receipt(&self, tx_hash: &str, status: ReleaseTxStatus, confirmations: u64) {
        self.receipts.lock().expect("lock").insert(
            tx_hash.to_string(),
            EscrowReleaseReceipt {
                tx_hash: tx_hash.to_string(),
                status,
                confirmations,
            },
        );
    }
}

#[async_trait]
impl EscrowGateway for RecordingEscrowGateway {
    async fn submit_release(
        &self,
        request: &EscrowReleaseRequest,
    ) -> Result<String, SettlementError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(SettlementError::EscrowGateway(
                "signer out of gas".to_string(),
            ));
        }
        let mut submitted = self.submitted.lock().expect("lock");
        submitted.push(request.clone());
        Ok(format!("0xrelease{}", submitted.len()))
    }

    async fn get_release_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<EscrowReleaseReceipt, SettlementError> {
        Ok(self
            .receipts
            .lock()
            .expect("lock")
            .get(tx_hash)
            .cloned()
            .unwrap_or(EscrowReleaseReceipt {
                tx_hash: tx_hash.to_string(),
                status: ReleaseTxStatus::Pending,
                confirmations: 0,
            }))
    }
}
