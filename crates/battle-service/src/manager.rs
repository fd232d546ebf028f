use std::sync::Arc;

use audit_store::AuditRepository;
use battle_domain::{
    Battle, BattleHistoryEntry, BattleId, BattleMode, BattleStatus, DEFAULT_RATING,
    EscrowReference, ModeConfig, PlayerId, RevenueDistribution, SettlementEventKind, TokenAmount,
    TraceId,
};
use chain_watcher::{ExpectedTransfer, TransferVerifier};
use chrono::{DateTime, Duration, Utc};
use ledger_store::{
    ConsumedTransfer, EscrowReleaseRecord, EscrowReleaseStatus, EscrowReleaseUpdate, LedgerStore,
    SettlementUnit,
};
use rating_engine::{EloRatingEngine, RatingUpdate};
use settlement::{
    EscrowGateway, EscrowReleaseRequest, HistoryRecord, RewardLedger, RewardPlan,
    distribution_source, mark_release_for_manual_review,
};
use tracing::{info, warn};

use crate::BattleServiceError;
use crate::audit::AuditTrail;
use crate::credit::{TransferCreditGuard, consume_once, consumed_from};

const WAGER_ESCROW_PURPOSE: &str = "wager_escrow";

/// How long a release may stay `pending` before reconciliation flags it for manual review.
pub const DEFAULT_PENDING_RELEASE_GRACE_SECS: i64 = 600;

/// Everything one completion committed, plus the escrow release state after submission.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub battle: Battle,
    pub rating_update: Option<RatingUpdate>,
    pub history: Vec<BattleHistoryEntry>,
    pub distribution: Option<RevenueDistribution>,
    pub escrow_release: Option<EscrowReleaseRecord>,
}

struct Standing {
    player_id: PlayerId,
    rating_before: i32,
    rating_after: i32,
}

struct Settled {
    battle: Battle,
    rating_update: Option<RatingUpdate>,
    history: Vec<BattleHistoryEntry>,
    distribution: Option<RevenueDistribution>,
    escrow_release: Option<EscrowReleaseRecord>,
}

/// Owns battle state. Completion runs as one settlement unit: status transition, ratings,
/// history, revenue split and escrow bookkeeping commit together or not at all.
pub struct BattleLifecycleManager {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) credit: TransferCreditGuard,
    pub(crate) escrow: Arc<dyn EscrowGateway>,
    pub(crate) audit: AuditTrail,
    pub(crate) pending_release_grace: Duration,
    rating: EloRatingEngine,
    rewards: RewardLedger,
}

impl BattleLifecycleManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        verifier: Arc<dyn TransferVerifier>,
        escrow: Arc<dyn EscrowGateway>,
        audit: Arc<dyn AuditRepository>,
    ) -> Self {
        Self {
            credit: TransferCreditGuard::new(store.clone(), verifier, audit.clone()),
            store,
            escrow,
            audit: AuditTrail::new(audit),
            pending_release_grace: Duration::seconds(DEFAULT_PENDING_RELEASE_GRACE_SECS),
            rating: EloRatingEngine::new(),
            rewards: RewardLedger::new(),
        }
    }

    #[must_use]
    pub fn with_rating_engine(mut self, rating: EloRatingEngine) -> Self {
        self.rating = rating;
        self
    }

    #[must_use]
    pub fn with_reward_ledger(mut self, rewards: RewardLedger) -> Self {
        self.rewards = rewards;
        self
    }

    #[must_use]
    pub fn with_pending_release_grace(mut self, grace: Duration) -> Self {
        self.pending_release_grace = grace;
        self
    }

    #[must_use]
    pub fn credit_guard(&self) -> &TransferCreditGuard {
        &self.credit
    }

    pub async fn start_free(&self, player: PlayerId) -> Result<Battle, BattleServiceError> {
        self.persist_new(Battle::new_free(player, Utc::now())).await
    }

    pub async fn start_ranked(
        &self,
        player1: PlayerId,
        player2: PlayerId,
    ) -> Result<Battle, BattleServiceError> {
        let battle = Battle::new_ranked(player1, player2, Utc::now())?;
        self.persist_new(battle).await
    }

    /// `escrow` is the funding transfer produced by the external escrow gateway; it is only
    /// verified on completion.
    pub async fn start_wager(
        &self,
        player1: PlayerId,
        player2: PlayerId,
        amount: TokenAmount,
        escrow: EscrowReference,
    ) -> Result<Battle, BattleServiceError> {
        let config = self.mode_config(BattleMode::Wager).await?;
        if amount.is_zero() || !config.bet_in_bounds(amount) {
            return Err(BattleServiceError::Validation(format!(
                "wager {amount} outside [{}, {}]",
                config.min_bet, config.max_bet
            )));
        }
        if escrow.tx_hash.trim().is_empty() || escrow.funder.trim().is_empty() {
            return Err(BattleServiceError::Validation(
                "wager escrow reference is incomplete".to_string(),
            ));
        }
        let battle = Battle::new_wager(player1, player2, amount, escrow, Utc::now())?;
        self.persist_new(battle).await
    }

    pub async fn get_battle(&self, battle_id: BattleId) -> Result<Battle, BattleServiceError> {
        self.store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| BattleServiceError::NotFound(format!("battle {battle_id}")))
    }

    /// Recomputes the checksum of `replay_blob` and compares it with the one stored at
    /// completion.
    pub async fn verify_replay(
        &self,
        battle_id: BattleId,
        replay_blob: &[u8],
    ) -> Result<bool, BattleServiceError> {
        let battle = self.get_battle(battle_id).await?;
        if battle.status != BattleStatus::Completed {
            return Err(BattleServiceError::InvalidState(format!(
                "battle {battle_id} has no replay yet"
            )));
        }
        Ok(battle.replay_matches(replay_blob))
    }

    pub async fn complete(
        &self,
        battle_id: BattleId,
        winner: PlayerId,
        replay_blob: Vec<u8>,
    ) -> Result<CompletionOutcome, BattleServiceError> {
        let trace_id = TraceId::new();
        let battle = self.get_battle(battle_id).await?;
        battle.ensure_in_progress()?;
        battle.ensure_winner_eligible(&winner)?;
        let config = self.mode_config(battle.mode).await?;
        let plan = self.rewards.reward_for(&battle, &config)?;

        let escrow_credit = match battle.mode {
            BattleMode::Wager => Some(self.verify_escrow(&battle, plan, trace_id).await?),
            BattleMode::Free | BattleMode::Ranked => None,
        };
        let standings = match battle.mode {
            BattleMode::Ranked => Vec::new(),
            BattleMode::Free | BattleMode::Wager => self.unchanged_standings(&battle).await?,
        };

        let now = Utc::now();
        let mut unit = self.store.begin().await?;
        let settled = self
            .settle(
                unit.as_mut(),
                battle_id,
                winner,
                replay_blob,
                plan,
                escrow_credit.as_ref(),
                standings,
                now,
            )
            .await?;
        unit.commit().await?;

        let Settled {
            battle,
            rating_update,
            history,
            distribution,
            escrow_release,
        } = settled;
        let winner = battle.winner.clone().unwrap_or_else(|| battle.player1.clone());
        let replay_checksum = battle.replay_checksum.clone().unwrap_or_default();
        info!(
            battle_id = %battle_id,
            mode = battle.mode.as_str(),
            winner = %winner,
            replay_checksum = %replay_checksum,
            "battle completed"
        );
        self.audit
            .record(
                Some(battle_id),
                trace_id,
                SettlementEventKind::BattleCompleted {
                    mode: battle.mode,
                    winner,
                    replay_checksum,
                },
            )
            .await;

        let escrow_release = match escrow_release {
            Some(release) => Some(self.submit_release(release, trace_id).await),
            None => None,
        };

        Ok(CompletionOutcome {
            battle,
            rating_update,
            history,
            distribution,
            escrow_release,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        unit: &mut dyn SettlementUnit,
        battle_id: BattleId,
        winner: PlayerId,
        replay_blob: Vec<u8>,
        plan: RewardPlan,
        escrow_credit: Option<&ConsumedTransfer>,
        standings: Vec<Standing>,
        now: DateTime<Utc>,
    ) -> Result<Settled, BattleServiceError> {
        let mut battle = unit
            .lock_battle(battle_id)
            .await?
            .ok_or_else(|| BattleServiceError::NotFound(format!("battle {battle_id}")))?;
        let completion = battle.complete(winner.clone(), replay_blob, now)?;
        if !unit.mark_battle_completed(&completion).await? {
            return Err(BattleServiceError::InvalidState(format!(
                "battle {battle_id} was completed concurrently"
            )));
        }

        if let Some(consumed) = escrow_credit {
            consume_once(unit, consumed).await?;
        }

        let (rating_update, standings) = match battle.mode {
            BattleMode::Ranked => {
                let loser = battle.opponent_of(&winner).cloned().ok_or_else(|| {
                    BattleServiceError::Validation(format!(
                        "ranked battle {battle_id} has no opponent"
                    ))
                })?;
                let (update, standings) = self.apply_ratings(unit, &winner, &loser).await?;
                (Some(update), standings)
            }
            BattleMode::Free | BattleMode::Wager => (None, standings),
        };

        let mut history = Vec::with_capacity(standings.len());
        for standing in standings {
            let is_winner = standing.player_id == winner;
            let (token_reward, wager_reward) = if is_winner {
                (plan.token_reward, plan.wager_reward)
            } else {
                (TokenAmount::ZERO, TokenAmount::ZERO)
            };
            let entry = self
                .rewards
                .record_history(
                    unit,
                    HistoryRecord {
                        battle_id,
                        player_id: standing.player_id,
                        rating_before: standing.rating_before,
                        rating_after: standing.rating_after,
                        rating_delta: standing.rating_after - standing.rating_before,
                        token_reward,
                        wager_reward,
                        is_winner,
                    },
                    now,
                )
                .await?;
            history.push(entry);
        }

        let total = plan.total()?;
        let distribution = if total.is_zero() {
            None
        } else {
            Some(
                self.rewards
                    .record_distribution(unit, &distribution_source(battle.mode), total, now)
                    .await?,
            )
        };

        let escrow_release = if escrow_credit.is_some() {
            let release =
                EscrowReleaseRecord::pending(battle_id, winner, plan.wager_reward, now);
            unit.insert_escrow_release(&release).await?;
            Some(release)
        } else {
            None
        };

        Ok(Settled {
            battle,
            rating_update,
            history,
            distribution,
            escrow_release,
        })
    }

    /// Rating rows are locked in ascending player order so two completions touching the same
    /// pair of players cannot deadlock.
    async fn apply_ratings(
        &self,
        unit: &mut dyn SettlementUnit,
        winner: &PlayerId,
        loser: &PlayerId,
    ) -> Result<(RatingUpdate, Vec<Standing>), BattleServiceError> {
        let (first, second) = if winner < loser {
            (winner, loser)
        } else {
            (loser, winner)
        };
        let first_record = unit.lock_rating(first).await?;
        let second_record = unit.lock_rating(second).await?;
        let (mut winner_record, mut loser_record) = if first == winner {
            (first_record, second_record)
        } else {
            (second_record, first_record)
        };

        let winner_before = winner_record.rating;
        let loser_before = loser_record.rating;
        let update = self.rating.apply(&mut winner_record, &mut loser_record);
        unit.save_rating(&winner_record).await?;
        unit.save_rating(&loser_record).await?;

        Ok((
            update,
            vec![
                Standing {
                    player_id: winner.clone(),
                    rating_before: winner_before,
                    rating_after: update.new_rating_a,
                },
                Standing {
                    player_id: loser.clone(),
                    rating_before: loser_before,
                    rating_after: update.new_rating_b,
                },
            ],
        ))
    }

    async fn unchanged_standings(
        &self,
        battle: &Battle,
    ) -> Result<Vec<Standing>, BattleServiceError> {
        let mut standings = Vec::new();
        for player in battle.participants() {
            let rating = self
                .store
                .get_rating(player)
                .await?
                .map_or(DEFAULT_RATING, |r| r.rating);
            standings.push(Standing {
                player_id: player.clone(),
                rating_before: rating,
                rating_after: rating,
            });
        }
        Ok(standings)
    }

    /// The escrow funding must have moved the full pot from the funder to the treasury.
    async fn verify_escrow(
        &self,
        battle: &Battle,
        plan: RewardPlan,
        trace_id: TraceId,
    ) -> Result<ConsumedTransfer, BattleServiceError> {
        let escrow = battle.escrow.as_ref().ok_or_else(|| {
            BattleServiceError::Validation(format!(
                "wager battle {} has no escrow reference",
                battle.battle_id
            ))
        })?;
        let expected = ExpectedTransfer {
            tx_hash: escrow.tx_hash.clone(),
            expected_from: escrow.funder.clone(),
            expected_amount: plan.wager_reward,
        };
        let verification = match self
            .credit
            .verify(
                &expected,
                WAGER_ESCROW_PURPOSE,
                Some(battle.battle_id),
                trace_id,
            )
            .await
        {
            Ok(verification) => verification,
            Err(err) => {
                if err.is_retryable() {
                    info!(
                        battle_id = %battle.battle_id,
                        tx_hash = %escrow.tx_hash,
                        "wager escrow awaiting confirmation"
                    );
                }
                return Err(err);
            }
        };
        consumed_from(
            &verification,
            &expected,
            WAGER_ESCROW_PURPOSE,
            Some(battle.battle_id),
        )
    }

    /// Runs after the settlement committed. A failed submission is recorded for manual
    /// payout instead of undoing the settlement.
    async fn submit_release(
        &self,
        mut release: EscrowReleaseRecord,
        trace_id: TraceId,
    ) -> EscrowReleaseRecord {
        let request = EscrowReleaseRequest {
            battle_id: release.battle_id,
            recipient: release.recipient.as_str().to_string(),
            amount: release.amount,
        };
        match self.escrow.submit_release(&request).await {
            Ok(tx_hash) => {
                let now = Utc::now();
                let update = EscrowReleaseUpdate {
                    status: EscrowReleaseStatus::Submitted,
                    release_tx_hash: Some(&tx_hash),
                    failure_reason: None,
                    updated_at: now,
                };
                match self
                    .store
                    .update_escrow_release(release.release_id, update)
                    .await
                {
                    Ok(()) => {
                        release.status = EscrowReleaseStatus::Submitted;
                        release.release_tx_hash = Some(tx_hash.clone());
                        release.updated_at = now;
                    }
                    Err(err) => warn!(
                        battle_id = %release.battle_id,
                        tx_hash = %tx_hash,
                        error = %err,
                        "escrow release submitted but not recorded"
                    ),
                }
                self.audit
                    .record(
                        Some(release.battle_id),
                        trace_id,
                        SettlementEventKind::EscrowReleaseSubmitted {
                            tx_hash,
                            recipient: release.recipient.clone(),
                            amount: release.amount,
                        },
                    )
                    .await;
            }
            Err(err) => {
                let reason = err.to_string();
                match mark_release_for_manual_review(self.store.as_ref(), &release, &reason).await
                {
                    Ok(()) => {
                        release.status = EscrowReleaseStatus::ManualReviewRequired;
                        release.failure_reason = Some(reason.clone());
                    }
                    Err(mark_err) => warn!(
                        battle_id = %release.battle_id,
                        error = %mark_err,
                        "failed to flag escrow release for manual review"
                    ),
                }
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
            }
        }
        release
    }

    async fn persist_new(&self, battle: Battle) -> Result<Battle, BattleServiceError> {
        self.store.insert_battle(&battle).await?;
        info!(
            battle_id = %battle.battle_id,
            mode = battle.mode.as_str(),
            "battle started"
        );
        self.audit
            .record(
                Some(battle.battle_id),
                TraceId::new(),
                SettlementEventKind::BattleStarted { mode: battle.mode },
            )
            .await;
        Ok(battle)
    }

    async fn mode_config(&self, mode: BattleMode) -> Result<ModeConfig, BattleServiceError> {
        self.store
            .get_mode_config(mode)
            .await?
            .ok_or_else(|| BattleServiceError::NotFound(format!("mode config {}", mode.as_str())))
    }
}
