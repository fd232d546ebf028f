mod memory;
mod postgres;

use async_trait::async_trait;
use battle_domain::{
    Battle, BattleCompletion, BattleHistoryEntry, BattleId, BattleMode, ModeConfig, PlayerId,
    RatingRecord, RevenueDistribution, TokenAmount, normalize_address, normalize_tx_hash,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemorySettlementStore;
pub use postgres::PostgresSettlementStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("duplicate {entity}: {id}")]
    Duplicate { entity: &'static str, id: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid value in column {field}: {value}")]
    InvalidColumn { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// A transaction hash that has been used to credit something. Primary key is the lowercase hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedTransfer {
    pub tx_hash: String,
    pub purpose: String,
    pub battle_id: Option<BattleId>,
    pub from_address: String,
    pub amount: TokenAmount,
    pub consumed_at: DateTime<Utc>,
}

impl ConsumedTransfer {
    #[must_use]
    pub fn new(
        tx_hash: &str,
        purpose: impl Into<String>,
        battle_id: Option<BattleId>,
        from_address: &str,
        amount: TokenAmount,
        consumed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_hash: normalize_tx_hash(tx_hash),
            purpose: purpose.into(),
            battle_id,
            from_address: normalize_address(from_address),
            amount,
            consumed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowReleaseStatus {
    Pending,
    Submitted,
    Confirmed,
    ManualReviewRequired,
}

impl EscrowReleaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::ManualReviewRequired => "manual_review_required",
        }
    }
}

impl std::str::FromStr for EscrowReleaseStatus {
    type Err = LedgerStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "confirmed" => Ok(Self::Confirmed),
            "manual_review_required" => Ok(Self::ManualReviewRequired),
            other => Err(LedgerStoreError::InvalidColumn {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Outbound payout of a wager pot. Written as `pending` inside the settlement unit and
/// advanced by the escrow gateway after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReleaseRecord {
    pub release_id: Uuid,
    pub battle_id: BattleId,
    pub recipient: PlayerId,
    pub amount: TokenAmount,
    pub status: EscrowReleaseStatus,
    pub release_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowReleaseRecord {
    #[must_use]
    pub fn pending(
        battle_id: BattleId,
        recipient: PlayerId,
        amount: TokenAmount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            release_id: Uuid::now_v7(),
            battle_id,
            recipient,
            amount,
            status: EscrowReleaseStatus::Pending,
            release_tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowReleaseUpdate<'a> {
    pub status: EscrowReleaseStatus,
    pub release_tx_hash: Option<&'a str>,
    pub failure_reason: Option<&'a str>,
    pub updated_at: DateTime<Utc>,
}

/// One atomic settlement. Nothing written through a unit is visible until `commit`;
/// dropping the unit without committing discards every write.
#[async_trait]
pub trait SettlementUnit: Send {
    /// Reads the battle row and holds it exclusively until the unit ends.
    async fn lock_battle(&mut self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError>;

    /// Compare-and-swap from `IN_PROGRESS` to `COMPLETED`. Returns `false` when the battle
    /// was no longer in progress and nothing was written.
    async fn mark_battle_completed(
        &mut self,
        completion: &BattleCompletion,
    ) -> Result<bool, LedgerStoreError>;

    /// Locks (and lazily creates at the default rating) a player's rating row.
    async fn lock_rating(&mut self, player_id: &PlayerId) -> Result<RatingRecord, LedgerStoreError>;

    async fn save_rating(&mut self, record: &RatingRecord) -> Result<(), LedgerStoreError>;

    async fn append_history(&mut self, entry: &BattleHistoryEntry) -> Result<(), LedgerStoreError>;

    async fn insert_distribution(
        &mut self,
        distribution: &RevenueDistribution,
    ) -> Result<(), LedgerStoreError>;

    /// Records `tx_hash` as consumed. Returns `false` if it was consumed before.
    async fn consume_transfer(&mut self, record: &ConsumedTransfer)
    -> Result<bool, LedgerStoreError>;

    async fn insert_escrow_release(
        &mut self,
        record: &EscrowReleaseRecord,
    ) -> Result<(), LedgerStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerStoreError>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SettlementUnit>, LedgerStoreError>;
}

#[async_trait]
pub trait BattleRepository: Send + Sync {
    async fn insert_battle(&self, battle: &Battle) -> Result<(), LedgerStoreError>;

    async fn get_battle(&self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError>;
}

#[async_trait]
pub trait ModeConfigRepository: Send + Sync {
    async fn get_mode_config(&self, mode: BattleMode)
    -> Result<Option<ModeConfig>, LedgerStoreError>;

    async fn upsert_mode_config(&self, config: &ModeConfig) -> Result<(), LedgerStoreError>;
}

#[async_trait]
pub trait LedgerReadRepository: Send + Sync {
    async fn get_rating(&self, player_id: &PlayerId)
    -> Result<Option<RatingRecord>, LedgerStoreError>;

    /// Ratings ordered by rating descending, ties broken by player id.
    async fn leaderboard(&self, page: PageRequest) -> Result<Vec<RatingRecord>, LedgerStoreError>;

    async fn list_history_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError>;

    async fn list_history_by_player(
        &self,
        player_id: &PlayerId,
        page: PageRequest,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError>;

    async fn list_distributions(
        &self,
        page: PageRequest,
    ) -> Result<Vec<RevenueDistribution>, LedgerStoreError>;

    async fn get_consumed_transfer(
        &self,
        tx_hash: &str,
    ) -> Result<Option<ConsumedTransfer>, LedgerStoreError>;
}

#[async_trait]
pub trait EscrowReleaseRepository: Send + Sync {
    async fn list_escrow_releases(
        &self,
        status: EscrowReleaseStatus,
        page: PageRequest,
    ) -> Result<Vec<EscrowReleaseRecord>, LedgerStoreError>;

    async fn get_escrow_release_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Option<EscrowReleaseRecord>, LedgerStoreError>;

    async fn update_escrow_release(
        &self,
        release_id: Uuid,
        update: EscrowReleaseUpdate<'_>,
    ) -> Result<(), LedgerStoreError>;
}

/// Everything the battle service needs from persistence.
pub trait LedgerStore:
    SettlementStore
    + BattleRepository
    + ModeConfigRepository
    + LedgerReadRepository
    + EscrowReleaseRepository
{
}

impl<T> LedgerStore for T where
    T: SettlementStore
        + BattleRepository
        + ModeConfigRepository
        + LedgerReadRepository
        + EscrowReleaseRepository
{
}
