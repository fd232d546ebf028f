use battle_domain::{SettlementEventKind, TraceId};
use chrono::Utc;
use ledger_store::{EscrowReleaseStatus, EscrowReleaseUpdate, PageRequest};
use serde::{Deserialize, Serialize};
use settlement::{ReleaseTxStatus, mark_release_for_manual_review};
use tracing::{debug, info, warn};

use crate::BattleServiceError;
use crate::manager::BattleLifecycleManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub confirmed: usize,
    pub awaiting: usize,
    pub manual_review: usize,
}

impl BattleLifecycleManager {
    /// Polls one page of submitted escrow releases. A release is confirmed once its receipt
    /// has `min_confirmations`; a reverted or untracked release goes to manual review.
    /// Receipt lookups that fail are left for the next pass.
    ///
    /// Releases still `pending` after the grace period are flagged for manual review: the
    /// process stopped between commit and submission, or the submission was never recorded.
    /// They are not resubmitted, since the transfer may already be on chain.
    pub async fn reconcile_escrow_releases(
        &self,
        min_confirmations: u64,
    ) -> Result<ReconcileSummary, BattleServiceError> {
        let trace_id = TraceId::new();
        let mut summary = ReconcileSummary::default();
        summary.manual_review += self.flag_stale_pending_releases(trace_id).await?;

        let submitted = self
            .store
            .list_escrow_releases(EscrowReleaseStatus::Submitted, PageRequest::default())
            .await?;

        for release in submitted {
            let Some(tx_hash) = release.release_tx_hash.clone() else {
                mark_release_for_manual_review(
                    self.store.as_ref(),
                    &release,
                    "submitted release has no tx hash",
                )
                .await?;
                summary.manual_review += 1;
                continue;
            };

            let receipt = match self.escrow.get_release_receipt(&tx_hash).await {
                Ok(receipt) => receipt,
                Err(err) => {
                    warn!(
                        battle_id = %release.battle_id,
                        tx_hash = %tx_hash,
                        error = %err,
                        "escrow release receipt lookup failed"
                    );
                    summary.awaiting += 1;
                    continue;
                }
            };

            match receipt.status {
                ReleaseTxStatus::Confirmed if receipt.confirmations >= min_confirmations => {
                    self.store
                        .update_escrow_release(
                            release.release_id,
                            EscrowReleaseUpdate {
                                status: EscrowReleaseStatus::Confirmed,
                                release_tx_hash: Some(&tx_hash),
                                failure_reason: None,
                                updated_at: Utc::now(),
                            },
                        )
                        .await?;
                    info!(
                        battle_id = %release.battle_id,
                        tx_hash = %tx_hash,
                        confirmations = receipt.confirmations,
                        "escrow release confirmed"
                    );
                    summary.confirmed += 1;
                }
                ReleaseTxStatus::Confirmed | ReleaseTxStatus::Pending => {
                    debug!(
                        battle_id = %release.battle_id,
                        tx_hash = %tx_hash,
                        confirmations = receipt.confirmations,
                        "escrow release awaiting confirmations"
                    );
                    summary.awaiting += 1;
                }
                ReleaseTxStatus::Failed => {
                    let reason = format!("release tx {tx_hash} reverted");
                    mark_release_for_manual_review(self.store.as_ref(), &release, &reason)
                        .await?;
                    self.audit
                        .record(
                            Some(release.battle_id),
                            trace_id,
                            SettlementEventKind::EscrowReleaseFailed {
                                recipient: release.recipient.clone(),
                                amount: release.amount,
                                reason,
                            },
                        )
                        .await;
                    summary.manual_review += 1;
                }
            }
        }

        if summary != ReconcileSummary::default() {
            info!(
                confirmed = summary.confirmed,
                awaiting = summary.awaiting,
                manual_review = summary.manual_review,
                "escrow releases reconciled"
            );
        }
        Ok(summary)
    }

    async fn flag_stale_pending_releases(
        &self,
        trace_id: TraceId,
    ) -> Result<usize, BattleServiceError> {
        let stale_before = Utc::now() - self.pending_release_grace;
        let pending = self
            .store
            .list_escrow_releases(EscrowReleaseStatus::Pending, PageRequest::default())
            .await?;

        let mut flagged = 0;
        for release in pending.iter().filter(|r| r.updated_at < stale_before) {
            let reason = format!(
                "release pending since {} with no recorded submission",
                release.updated_at.to_rfc3339()
            );
            mark_release_for_manual_review(self.store.as_ref(), release, &reason).await?;
            self.audit
                .record(
                    Some(release.battle_id),
                    trace_id,
                    SettlementEventKind::EscrowReleaseFailed {
                        recipient: release.recipient.clone(),
                        amount: release.amount,
                        reason,
                    },
                )
                .await;
            flagged += 1;
        }
        Ok(flagged)
    }
}
