use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use battle_domain::{
    Battle, BattleCompletion, BattleHistoryEntry, BattleId, BattleMode, BattleStatus, ModeConfig,
    PlayerId, RatingRecord, RevenueDistribution, normalize_tx_hash,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    BattleRepository, ConsumedTransfer, EscrowReleaseRecord, EscrowReleaseRepository,
    EscrowReleaseStatus, EscrowReleaseUpdate, LedgerReadRepository, LedgerStoreError,
    ModeConfigRepository, PageRequest, SettlementStore, SettlementUnit,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    battles: HashMap<BattleId, Battle>,
    mode_configs: HashMap<BattleMode, ModeConfig>,
    ratings: HashMap<PlayerId, RatingRecord>,
    history: Vec<BattleHistoryEntry>,
    distributions: Vec<RevenueDistribution>,
    consumed_transfers: HashMap<String, ConsumedTransfer>,
    escrow_releases: Vec<EscrowReleaseRecord>,
}

/// Process-local store. A settlement unit holds the table lock for its whole lifetime and
/// works on a staged copy that replaces the live tables on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemorySettlementStore {
    tables: Arc<Mutex<Tables>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemorySettlementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `commit` fail after all writes were staged.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn history_len(&self) -> usize {
        self.tables.lock().await.history.len()
    }

    pub async fn distribution_len(&self) -> usize {
        self.tables.lock().await.distributions.len()
    }
}

struct InMemorySettlementUnit {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn begin(&self) -> Result<Box<dyn SettlementUnit>, LedgerStoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemorySettlementUnit {
            guard,
            staged,
            fail_commit: self.fail_next_commit.clone(),
        }))
    }
}

#[async_trait]
impl SettlementUnit for InMemorySettlementUnit {
    async fn lock_battle(&mut self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError> {
        Ok(self.staged.battles.get(&battle_id).cloned())
    }

    async fn mark_battle_completed(
        &mut self,
        completion: &BattleCompletion,
    ) -> Result<bool, LedgerStoreError> {
        let Some(battle) = self.staged.battles.get_mut(&completion.battle_id) else {
            return Err(LedgerStoreError::NotFound {
                entity: "battle",
                id: completion.battle_id.to_string(),
            });
        };
        if battle.status != BattleStatus::InProgress {
            return Ok(false);
        }
        battle.status = BattleStatus::Completed;
        battle.winner = Some(completion.winner.clone());
        battle.replay_blob = Some(completion.replay_blob.clone());
        battle.replay_checksum = Some(completion.replay_checksum.clone());
        battle.completed_at = Some(completion.completed_at);
        Ok(true)
    }

    async fn lock_rating(&mut self, player_id: &PlayerId) -> Result<RatingRecord, LedgerStoreError> {
        Ok(self
            .staged
            .ratings
            .entry(player_id.clone())
            .or_insert_with(|| RatingRecord::initial(player_id.clone()))
            .clone())
    }

    async fn save_rating(&mut self, record: &RatingRecord) -> Result<(), LedgerStoreError> {
        self.staged
            .ratings
            .insert(record.player_id.clone(), record.clone());
        Ok(())
    }

    async fn append_history(&mut self, entry: &BattleHistoryEntry) -> Result<(), LedgerStoreError> {
        if self
            .staged
            .history
            .iter()
            .any(|h| h.battle_id == entry.battle_id && h.player_id == entry.player_id)
        {
            return Err(LedgerStoreError::Duplicate {
                entity: "battle_history",
                id: format!("{}:{}", entry.battle_id, entry.player_id),
            });
        }
        self.staged.history.push(entry.clone());
        Ok(())
    }

    async fn insert_distribution(
        &mut self,
        distribution: &RevenueDistribution,
    ) -> Result<(), LedgerStoreError> {
        self.staged.distributions.push(distribution.clone());
        Ok(())
    }

    async fn consume_transfer(
        &mut self,
        record: &ConsumedTransfer,
    ) -> Result<bool, LedgerStoreError> {
        let key = normalize_tx_hash(&record.tx_hash);
        if self.staged.consumed_transfers.contains_key(&key) {
            return Ok(false);
        }
        self.staged.consumed_transfers.insert(key, record.clone());
        Ok(true)
    }

    async fn insert_escrow_release(
        &mut self,
        record: &EscrowReleaseRecord,
    ) -> Result<(), LedgerStoreError> {
        self.staged.escrow_releases.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerStoreError> {
        let InMemorySettlementUnit {
            mut guard,
            staged,
            fail_commit,
        } = *self;
        if fail_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerStoreError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl BattleRepository for InMemorySettlementStore {
    async fn insert_battle(&self, battle: &Battle) -> Result<(), LedgerStoreError> {
        let mut tables = self.tables.lock().await;
        if tables.battles.contains_key(&battle.battle_id) {
            return Err(LedgerStoreError::Duplicate {
                entity: "battle",
                id: battle.battle_id.to_string(),
            });
        }
        tables.battles.insert(battle.battle_id, battle.clone());
        Ok(())
    }

    async fn get_battle(&self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError> {
        Ok(self.tables.lock().await.battles.get(&battle_id).cloned())
    }
}

#[async_trait]
impl ModeConfigRepository for InMemorySettlementStore {
    async fn get_mode_config(
        &self,
        mode: BattleMode,
    ) -> Result<Option<ModeConfig>, LedgerStoreError> {
        Ok(self.tables.lock().await.mode_configs.get(&mode).cloned())
    }

    async fn upsert_mode_config(&self, config: &ModeConfig) -> Result<(), LedgerStoreError> {
        self.tables
            .lock()
            .await
            .mode_configs
            .insert(config.mode, config.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerReadRepository for InMemorySettlementStore {
    async fn get_rating(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<RatingRecord>, LedgerStoreError> {
        Ok(self.tables.lock().await.ratings.get(player_id).cloned())
    }

    async fn leaderboard(&self, page: PageRequest) -> Result<Vec<RatingRecord>, LedgerStoreError> {
        let tables = self.tables.lock().await;
        let mut ratings: Vec<_> = tables.ratings.values().cloned().collect();
        ratings.sort_by(|a, b| {
            b.rating
                .cmp(&a.rating)
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        Ok(ratings
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn list_history_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.battle_id == battle_id)
            .cloned()
            .collect())
    }

    async fn list_history_by_player(
        &self,
        player_id: &PlayerId,
        page: PageRequest,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .iter()
            .rev()
            .filter(|h| &h.player_id == player_id)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn list_distributions(
        &self,
        page: PageRequest,
    ) -> Result<Vec<RevenueDistribution>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .distributions
            .iter()
            .rev()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn get_consumed_transfer(
        &self,
        tx_hash: &str,
    ) -> Result<Option<ConsumedTransfer>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .consumed_transfers
            .get(&normalize_tx_hash(tx_hash))
            .cloned())
    }
}

#[async_trait]
impl EscrowReleaseRepository for InMemorySettlementStore {
    async fn list_escrow_releases(
        &self,
        status: EscrowReleaseStatus,
        page: PageRequest,
    ) -> Result<Vec<EscrowReleaseRecord>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .escrow_releases
            .iter()
            .filter(|r| r.status == status)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn get_escrow_release_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Option<EscrowReleaseRecord>, LedgerStoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .escrow_releases
            .iter()
            .find(|r| r.battle_id == battle_id)
            .cloned())
    }

    async fn update_escrow_release(
        &self,
        release_id: Uuid,
        update: EscrowReleaseUpdate<'_>,
    ) -> Result<(), LedgerStoreError> {
        let mut tables = self.tables.lock().await;
        let Some(record) = tables
            .escrow_releases
            .iter_mut()
            .find(|r| r.release_id == release_id)
        else {
            return Err(LedgerStoreError::NotFound {
                entity: "escrow_release",
                id: release_id.to_string(),
            });
        };
        record.status = update.status;
        if let Some(hash) = update.release_tx_hash {
            record.release_tx_hash = Some(hash.to_string());
        }
        record.failure_reason = update.failure_reason.map(str::to_string);
        record.updated_at = update.updated_at;
        Ok(())
    }
}
