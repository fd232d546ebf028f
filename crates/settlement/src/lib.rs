mod escrow;
mod nonce;

use battle_domain::{
    Battle, BattleHistoryEntry, BattleId, BattleMode, MoneyError, ModeConfig, PlayerId,
    RevenueDistribution, TokenAmount,
};
use chain_watcher::RpcError;
use chrono::{DateTime, Utc};
use ledger_store::{
    EscrowReleaseRecord, EscrowReleaseRepository, EscrowReleaseStatus, EscrowReleaseUpdate,
    LedgerStoreError, SettlementUnit,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use escrow::{
    EscrowGateway, EscrowGatewayConfig, EscrowReleaseReceipt, EscrowReleaseRequest,
    EvmEscrowGateway, ReleaseTxStatus, cap_gas_price, encode_erc20_transfer,
};
pub use nonce::{NonceAllocator, NonceCommand};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),
    #[error("invalid distribution table: {0}")]
    InvalidDistributionTable(String),
    #[error("escrow gateway error: {0}")]
    EscrowGateway(String),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("nonce allocator error: {0}")]
    NonceAllocator(String),
}

const BPS_DENOMINATOR: u32 = 10_000;

/// Fund split in basis points. `tower_liquidity` also absorbs the rounding remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionTable {
    pub growth_bps: u16,
    pub security_bps: u16,
    pub operations_bps: u16,
    pub rewards_pool_bps: u16,
    pub dev_team_bps: u16,
    pub tower_liquidity_bps: u16,
}

impl Default for DistributionTable {
    fn default() -> Self {
        Self {
            growth_bps: 1_000,
            security_bps: 1_000,
            operations_bps: 500,
            rewards_pool_bps: 3_000,
            dev_team_bps: 2_000,
            tower_liquidity_bps: 2_500,
        }
    }
}

impl DistributionTable {
    pub fn validate(&self) -> Result<(), SettlementError> {
        let total: u32 = [
            self.growth_bps,
            self.security_bps,
            self.operations_bps,
            self.rewards_pool_bps,
            self.dev_team_bps,
            self.tower_liquidity_bps,
        ]
        .into_iter()
        .map(u32::from)
        .sum();
        if total != BPS_DENOMINATOR {
            return Err(SettlementError::InvalidDistributionTable(format!(
                "buckets sum to {total} bps, expected {BPS_DENOMINATOR}"
            )));
        }
        Ok(())
    }

    /// Splits `total` so that the six buckets add up to exactly `total`.
    pub fn split(
        &self,
        source: &str,
        total: TokenAmount,
        created_at: DateTime<Utc>,
    ) -> Result<RevenueDistribution, SettlementError> {
        if total.is_zero() {
            return Err(SettlementError::InvalidDistribution(format!(
                "total amount for {source} must be positive"
            )));
        }
        let growth = total.bps_share(self.growth_bps)?;
        let security = total.bps_share(self.security_bps)?;
        let operations = total.bps_share(self.operations_bps)?;
        let rewards_pool = total.bps_share(self.rewards_pool_bps)?;
        let dev_team = total.bps_share(self.dev_team_bps)?;
        let allocated = [security, operations, rewards_pool, dev_team]
            .into_iter()
            .try_fold(growth, TokenAmount::checked_add)?;
        let tower_liquidity = total.checked_sub(allocated)?;

        Ok(RevenueDistribution {
            distribution_id: Uuid::now_v7(),
            source: source.to_string(),
            total_amount: total,
            growth,
            security,
            operations,
            rewards_pool,
            dev_team,
            tower_liquidity,
            created_at,
        })
    }
}

/// Rewards granted to the winner of one battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPlan {
    pub token_reward: TokenAmount,
    pub wager_reward: TokenAmount,
}

impl RewardPlan {
    pub fn total(&self) -> Result<TokenAmount, SettlementError> {
        Ok(self.token_reward.checked_add(self.wager_reward)?)
    }
}

#[must_use]
pub fn distribution_source(mode: BattleMode) -> String {
    format!("battle_reward:{}", mode.as_str().to_ascii_lowercase())
}

/// One history row to append; id and timestamp are assigned on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub battle_id: BattleId,
    pub player_id: PlayerId,
    pub rating_before: i32,
    pub rating_after: i32,
    pub rating_delta: i32,
    pub token_reward: TokenAmount,
    pub wager_reward: TokenAmount,
    pub is_winner: bool,
}

/// Owns the distribution table and the per-mode reward rules. All writes go through
/// the caller's settlement unit so they commit or roll back with the battle transition.
#[derive(Debug, Clone, Default)]
pub struct RewardLedger {
    table: DistributionTable,
}

impl RewardLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: DistributionTable) -> Result<Self, SettlementError> {
        table.validate()?;
        Ok(Self { table })
    }

    #[must_use]
    pub fn table(&self) -> &DistributionTable {
        &self.table
    }

    /// FREE and RANKED pay the mode's flat reward; WAGER pays the doubled stake, no fee withheld.
    pub fn reward_for(
        &self,
        battle: &Battle,
        mode_config: &ModeConfig,
    ) -> Result<RewardPlan, SettlementError> {
        match battle.mode {
            BattleMode::Free | BattleMode::Ranked => Ok(RewardPlan {
                token_reward: mode_config.flat_reward,
                wager_reward: TokenAmount::ZERO,
            }),
            BattleMode::Wager => {
                let wager = battle.wager_amount.ok_or_else(|| {
                    SettlementError::InvalidDistribution(format!(
                        "wager battle {} has no wager amount",
                        battle.battle_id
                    ))
                })?;
                Ok(RewardPlan {
                    token_reward: TokenAmount::ZERO,
                    wager_reward: wager.checked_mul(2)?,
                })
            }
        }
    }

    pub async fn record_distribution(
        &self,
        unit: &mut dyn SettlementUnit,
        source: &str,
        total: TokenAmount,
        now: DateTime<Utc>,
    ) -> Result<RevenueDistribution, SettlementError> {
        let distribution = self.table.split(source, total, now)?;
        unit.insert_distribution(&distribution).await?;
        Ok(distribution)
    }

    pub async fn record_history(
        &self,
        unit: &mut dyn SettlementUnit,
        record: HistoryRecord,
        now: DateTime<Utc>,
    ) -> Result<BattleHistoryEntry, SettlementError> {
        let entry = BattleHistoryEntry {
            history_id: Uuid::now_v7(),
            battle_id: record.battle_id,
            player_id: record.player_id,
            rating_before: record.rating_before,
            rating_after: record.rating_after,
            rating_delta: record.rating_delta,
            token_reward: record.token_reward,
            wager_reward: record.wager_reward,
            is_winner: record.is_winner,
            recorded_at: now,
        };
        unit.append_history(&entry).await?;
        Ok(entry)
    }
}

/// Flags a release whose submission or receipt failed so it is paid out by hand.
pub async fn mark_release_for_manual_review<R>(
    repo: &R,
    record: &EscrowReleaseRecord,
    reason: &str,
) -> Result<(), SettlementError>
where
    R: EscrowReleaseRepository + ?Sized,
{
    warn!(
        battle_id = %record.battle_id,
        release_id = %record.release_id,
        reason,
        "escrow release requires manual review"
    );
    repo.update_escrow_release(
        record.release_id,
        EscrowReleaseUpdate {
            status: EscrowReleaseStatus::ManualReviewRequired,
            release_tx_hash: None,
            failure_reason: Some(reason),
            updated_at: Utc::now(),
        },
    )
    .await?;
    Ok(())
}
