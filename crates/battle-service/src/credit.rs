use std::sync::Arc;

use audit_store::AuditRepository;
use battle_domain::{BattleId, SettlementEventKind, TokenAmount, TraceId};
use chain_watcher::{ExpectedTransfer, TransferVerificationResult, TransferVerifier};
use chrono::Utc;
use ledger_store::{ConsumedTransfer, LedgerStore, SettlementUnit};
use tracing::{info, warn};

use crate::BattleServiceError;
use crate::audit::AuditTrail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditedTransfer {
    pub verification: TransferVerificationResult,
    pub consumed: ConsumedTransfer,
}

/// Caller side of transfer verification: a transaction hash may back at most one credit.
#[derive(Clone)]
pub struct TransferCreditGuard {
    store: Arc<dyn LedgerStore>,
    verifier: Arc<dyn TransferVerifier>,
    audit: AuditTrail,
}

impl TransferCreditGuard {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        verifier: Arc<dyn TransferVerifier>,
        audit: Arc<dyn AuditRepository>,
    ) -> Self {
        Self {
            store,
            verifier,
            audit: AuditTrail::new(audit),
        }
    }

    /// Verifies and writes the outcome, valid or not, to the audit trail.
    pub async fn verify(
        &self,
        expected: &ExpectedTransfer,
        purpose: &str,
        battle_id: Option<BattleId>,
        trace_id: TraceId,
    ) -> Result<TransferVerificationResult, BattleServiceError> {
        match self.verifier.verify_transfer(expected).await {
            Ok(result) => {
                info!(
                    tx_hash = %result.tx_hash,
                    purpose,
                    block_number = ?result.block_number,
                    "transfer verified"
                );
                self.audit
                    .record(
                        battle_id,
                        trace_id,
                        SettlementEventKind::TransferVerified {
                            tx_hash: result.tx_hash.clone(),
                            purpose: purpose.to_string(),
                            from: result.from.clone().unwrap_or_default(),
                            to: result.to.clone().unwrap_or_default(),
                            amount: result.amount.unwrap_or(TokenAmount::ZERO),
                            block_number: result.block_number,
                        },
                    )
                    .await;
                Ok(result)
            }
            Err(err) => {
                warn!(
                    tx_hash = %expected.tx_hash,
                    purpose,
                    kind = err.kind.as_str(),
                    detail = %err.detail,
                    "transfer rejected"
                );
                let partial = &err.result;
                self.audit
                    .record(
                        battle_id,
                        trace_id,
                        SettlementEventKind::TransferRejected {
                            tx_hash: expected.tx_hash.clone(),
                            purpose: purpose.to_string(),
                            reason: partial
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| err.kind.as_str().to_string()),
                            from: partial.from.clone(),
                            to: partial.to.clone(),
                            amount: partial.amount,
                            block_number: partial.block_number,
                        },
                    )
                    .await;
                Err(BattleServiceError::Chain(err))
            }
        }
    }

    /// Verifies `expected` and records its hash as consumed in one commit. A hash that was
    /// credited before fails with `Validation` even when it still verifies.
    pub async fn credit_verified_transfer(
        &self,
        expected: &ExpectedTransfer,
        purpose: &str,
    ) -> Result<CreditedTransfer, BattleServiceError> {
        let trace_id = TraceId::new();
        let verification = self.verify(expected, purpose, None, trace_id).await?;
        let consumed = consumed_from(&verification, expected, purpose, None)?;

        let mut unit = self.store.begin().await?;
        consume_once(unit.as_mut(), &consumed).await?;
        unit.commit().await?;

        info!(
            tx_hash = %consumed.tx_hash,
            purpose,
            amount = %consumed.amount,
            "transfer credited"
        );
        Ok(CreditedTransfer {
            verification,
            consumed,
        })
    }
}

pub(crate) fn consumed_from(
    verification: &TransferVerificationResult,
    expected: &ExpectedTransfer,
    purpose: &str,
    battle_id: Option<BattleId>,
) -> Result<ConsumedTransfer, BattleServiceError> {
    let amount = verification.amount.ok_or_else(|| {
        BattleServiceError::Validation(format!(
            "verified transfer {} carries no amount",
            verification.tx_hash
        ))
    })?;
    let from = verification
        .from
        .as_deref()
        .unwrap_or(expected.expected_from.as_str());
    Ok(ConsumedTransfer::new(
        &verification.tx_hash,
        purpose,
        battle_id,
        from,
        amount,
        Utc::now(),
    ))
}

/// Inside an open unit: fails when the hash was consumed by an earlier credit.
pub(crate) async fn consume_once(
    unit: &mut dyn SettlementUnit,
    consumed: &ConsumedTransfer,
) -> Result<(), BattleServiceError> {
    if unit.consume_transfer(consumed).await? {
        Ok(())
    } else {
        warn!(tx_hash = %consumed.tx_hash, purpose = %consumed.purpose, "transfer replay rejected");
        Err(BattleServiceError::Validation(format!(
            "transfer {} was already consumed",
            consumed.tx_hash
        )))
    }
}
