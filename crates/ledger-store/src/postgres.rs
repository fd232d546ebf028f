use async_trait::async_trait;
use battle_domain::{
    Battle, BattleCompletion, BattleHistoryEntry, BattleId, BattleMode, BattleStatus,
    EscrowReference, ModeConfig, PlayerId, RatingRecord, RevenueDistribution, TokenAmount,
    normalize_address, normalize_tx_hash,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    BattleRepository, ConsumedTransfer, EscrowReleaseRecord, EscrowReleaseRepository,
    EscrowReleaseStatus, EscrowReleaseUpdate, LedgerReadRepository, LedgerStoreError,
    ModeConfigRepository, PageRequest, SettlementStore, SettlementUnit,
};

/// Amounts are stored as `NUMERIC(78, 0)` base units and moved across the wire as text.
const BATTLE_COLUMNS: &str = r#"
    battle_id, mode, player1, player2, wager_amount::text AS wager_amount,
    escrow_tx_hash, escrow_funder, winner, replay_blob, replay_checksum, status,
    created_at, completed_at
"#;

const RATING_COLUMNS: &str = r#"
    player_id, rating, games_played, wins, losses, win_streak, highest_rating
"#;

const HISTORY_COLUMNS: &str = r#"
    history_id, battle_id, player_id, rating_before, rating_after, rating_delta,
    token_reward::text AS token_reward, wager_reward::text AS wager_reward, is_winner, recorded_at
"#;

const DISTRIBUTION_COLUMNS: &str = r#"
    distribution_id, source, total_amount::text AS total_amount, growth::text AS growth,
    security::text AS security, operations::text AS operations,
    rewards_pool::text AS rewards_pool, dev_team::text AS dev_team,
    tower_liquidity::text AS tower_liquidity, created_at
"#;

const ESCROW_RELEASE_COLUMNS: &str = r#"
    release_id, battle_id, recipient, amount::text AS amount, status, release_tx_hash,
    failure_reason, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresSettlementStore {
    pool: PgPool,
}

impl PostgresSettlementStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PostgresSettlementUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SettlementStore for PostgresSettlementStore {
    async fn begin(&self) -> Result<Box<dyn SettlementUnit>, LedgerStoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PostgresSettlementUnit { tx }))
    }
}

#[async_trait]
impl SettlementUnit for PostgresSettlementUnit {
    async fn lock_battle(&mut self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BATTLE_COLUMNS} FROM battles WHERE battle_id = $1 FOR UPDATE"
        ))
        .bind(battle_id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_battle_row).transpose()
    }

    async fn mark_battle_completed(
        &mut self,
        completion: &BattleCompletion,
    ) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE battles
            SET status = $2, winner = $3, replay_blob = $4, replay_checksum = $5, completed_at = $6
            WHERE battle_id = $1 AND status = $7
            "#,
        )
        .bind(completion.battle_id.0)
        .bind(BattleStatus::Completed.as_str())
        .bind(completion.winner.as_str())
        .bind(&completion.replay_blob)
        .bind(&completion.replay_checksum)
        .bind(completion.completed_at)
        .bind(BattleStatus::InProgress.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn lock_rating(&mut self, player_id: &PlayerId) -> Result<RatingRecord, LedgerStoreError> {
        let initial = RatingRecord::initial(player_id.clone());
        sqlx::query(
            r#"
            INSERT INTO player_ratings (
                player_id, rating, games_played, wins, losses, win_streak, highest_rating
            ) VALUES ($1, $2, 0, 0, 0, 0, $3)
            ON CONFLICT (player_id) DO NOTHING
            "#,
        )
        .bind(player_id.as_str())
        .bind(initial.rating)
        .bind(initial.highest_rating)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let row = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM player_ratings WHERE player_id = $1 FOR UPDATE"
        ))
        .bind(player_id.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        map_rating_row(&row)
    }

    async fn save_rating(&mut self, record: &RatingRecord) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            UPDATE player_ratings
            SET rating = $2, games_played = $3, wins = $4, losses = $5, win_streak = $6,
                highest_rating = $7
            WHERE player_id = $1
            "#,
        )
        .bind(record.player_id.as_str())
        .bind(record.rating)
        .bind(to_i32(record.games_played))
        .bind(to_i32(record.wins))
        .bind(to_i32(record.losses))
        .bind(to_i32(record.win_streak))
        .bind(record.highest_rating)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_history(&mut self, entry: &BattleHistoryEntry) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO battle_history (
                history_id, battle_id, player_id, rating_before, rating_after, rating_delta,
                token_reward, wager_reward, is_winner, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8::numeric, $9, $10)
            "#,
        )
        .bind(entry.history_id)
        .bind(entry.battle_id.0)
        .bind(entry.player_id.as_str())
        .bind(entry.rating_before)
        .bind(entry.rating_after)
        .bind(entry.rating_delta)
        .bind(amount_text(entry.token_reward))
        .bind(amount_text(entry.wager_reward))
        .bind(entry.is_winner)
        .bind(entry.recorded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_distribution(
        &mut self,
        distribution: &RevenueDistribution,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO revenue_distributions (
                distribution_id, source, total_amount, growth, security, operations,
                rewards_pool, dev_team, tower_liquidity, created_at
            ) VALUES (
                $1, $2, $3::numeric, $4::numeric, $5::numeric, $6::numeric,
                $7::numeric, $8::numeric, $9::numeric, $10
            )
            "#,
        )
        .bind(distribution.distribution_id)
        .bind(&distribution.source)
        .bind(amount_text(distribution.total_amount))
        .bind(amount_text(distribution.growth))
        .bind(amount_text(distribution.security))
        .bind(amount_text(distribution.operations))
        .bind(amount_text(distribution.rewards_pool))
        .bind(amount_text(distribution.dev_team))
        .bind(amount_text(distribution.tower_liquidity))
        .bind(distribution.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn consume_transfer(
        &mut self,
        record: &ConsumedTransfer,
    ) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_transfers (
                tx_hash, purpose, battle_id, from_address, amount, consumed_at
            ) VALUES ($1, $2, $3, $4, $5::numeric, $6)
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(normalize_tx_hash(&record.tx_hash))
        .bind(&record.purpose)
        .bind(record.battle_id.map(|v| v.0))
        .bind(&record.from_address)
        .bind(amount_text(record.amount))
        .bind(record.consumed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_escrow_release(
        &mut self,
        record: &EscrowReleaseRecord,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO escrow_releases (
                release_id, battle_id, recipient, amount, status, release_tx_hash,
                failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4::numeric, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.release_id)
        .bind(record.battle_id.0)
        .bind(record.recipient.as_str())
        .bind(amount_text(record.amount))
        .bind(record.status.as_str())
        .bind(&record.release_tx_hash)
        .bind(&record.failure_reason)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| LedgerStoreError::CommitFailed(e.to_string()))
    }
}

#[async_trait]
impl BattleRepository for PostgresSettlementStore {
    async fn insert_battle(&self, battle: &Battle) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO battles (
                battle_id, mode, player1, player2, wager_amount, escrow_tx_hash, escrow_funder,
                winner, replay_blob, replay_checksum, status, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(battle.battle_id.0)
        .bind(battle.mode.as_str())
        .bind(battle.player1.as_str())
        .bind(battle.player2.as_ref().map(PlayerId::as_str))
        .bind(battle.wager_amount.map(amount_text))
        .bind(battle.escrow.as_ref().map(|e| normalize_tx_hash(&e.tx_hash)))
        .bind(battle.escrow.as_ref().map(|e| normalize_address(&e.funder)))
        .bind(battle.winner.as_ref().map(PlayerId::as_str))
        .bind(&battle.replay_blob)
        .bind(&battle.replay_checksum)
        .bind(battle.status.as_str())
        .bind(battle.created_at)
        .bind(battle.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_battle(&self, battle_id: BattleId) -> Result<Option<Battle>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BATTLE_COLUMNS} FROM battles WHERE battle_id = $1"
        ))
        .bind(battle_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_battle_row).transpose()
    }
}

#[async_trait]
impl ModeConfigRepository for PostgresSettlementStore {
    async fn get_mode_config(
        &self,
        mode: BattleMode,
    ) -> Result<Option<ModeConfig>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT mode, min_bet::text AS min_bet, max_bet::text AS max_bet,
                   flat_reward::text AS flat_reward
            FROM battle_mode_configs
            WHERE mode = $1
            "#,
        )
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ModeConfig {
            mode,
            min_bet: amount_column(&row, "min_bet")?,
            max_bet: amount_column(&row, "max_bet")?,
            flat_reward: amount_column(&row, "flat_reward")?,
        }))
    }

    async fn upsert_mode_config(&self, config: &ModeConfig) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO battle_mode_configs (mode, min_bet, max_bet, flat_reward)
            VALUES ($1, $2::numeric, $3::numeric, $4::numeric)
            ON CONFLICT (mode) DO UPDATE SET
                min_bet = EXCLUDED.min_bet,
                max_bet = EXCLUDED.max_bet,
                flat_reward = EXCLUDED.flat_reward
            "#,
        )
        .bind(config.mode.as_str())
        .bind(amount_text(config.min_bet))
        .bind(amount_text(config.max_bet))
        .bind(amount_text(config.flat_reward))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerReadRepository for PostgresSettlementStore {
    async fn get_rating(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<RatingRecord>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM player_ratings WHERE player_id = $1"
        ))
        .bind(player_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_rating_row).transpose()
    }

    async fn leaderboard(&self, page: PageRequest) -> Result<Vec<RatingRecord>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM player_ratings \
             ORDER BY rating DESC, player_id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_rating_row).collect()
    }

    async fn list_history_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM battle_history WHERE battle_id = $1 \
             ORDER BY recorded_at ASC, history_id ASC"
        ))
        .bind(battle_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_history_row).collect()
    }

    async fn list_history_by_player(
        &self,
        player_id: &PlayerId,
        page: PageRequest,
    ) -> Result<Vec<BattleHistoryEntry>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM battle_history WHERE player_id = $1 \
             ORDER BY recorded_at DESC, history_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(player_id.as_str())
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_history_row).collect()
    }

    async fn list_distributions(
        &self,
        page: PageRequest,
    ) -> Result<Vec<RevenueDistribution>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DISTRIBUTION_COLUMNS} FROM revenue_distributions \
             ORDER BY created_at DESC, distribution_id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_distribution_row).collect()
    }

    async fn get_consumed_transfer(
        &self,
        tx_hash: &str,
    ) -> Result<Option<ConsumedTransfer>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT tx_hash, purpose, battle_id, from_address, amount::text AS amount, consumed_at
            FROM consumed_transfers
            WHERE tx_hash = $1
            "#,
        )
        .bind(normalize_tx_hash(tx_hash))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ConsumedTransfer {
            tx_hash: column(&row, "tx_hash")?,
            purpose: column(&row, "purpose")?,
            battle_id: column::<Option<Uuid>>(&row, "battle_id")?.map(BattleId),
            from_address: column(&row, "from_address")?,
            amount: amount_column(&row, "amount")?,
            consumed_at: column(&row, "consumed_at")?,
        }))
    }
}

#[async_trait]
impl EscrowReleaseRepository for PostgresSettlementStore {
    async fn list_escrow_releases(
        &self,
        status: EscrowReleaseStatus,
        page: PageRequest,
    ) -> Result<Vec<EscrowReleaseRecord>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ESCROW_RELEASE_COLUMNS} FROM escrow_releases WHERE status = $1 \
             ORDER BY created_at ASC LIMIT $2 OFFSET $3"
        ))
        .bind(status.as_str())
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_escrow_release_row).collect()
    }

    async fn get_escrow_release_by_battle(
        &self,
        battle_id: BattleId,
    ) -> Result<Option<EscrowReleaseRecord>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ESCROW_RELEASE_COLUMNS} FROM escrow_releases WHERE battle_id = $1"
        ))
        .bind(battle_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_escrow_release_row).transpose()
    }

    async fn update_escrow_release(
        &self,
        release_id: Uuid,
        update: EscrowReleaseUpdate<'_>,
    ) -> Result<(), LedgerStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE escrow_releases
            SET status = $2,
                release_tx_hash = COALESCE($3, release_tx_hash),
                failure_reason = $4,
                updated_at = $5
            WHERE release_id = $1
            "#,
        )
        .bind(release_id)
        .bind(update.status.as_str())
        .bind(update.release_tx_hash)
        .bind(update.failure_reason)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerStoreError::NotFound {
                entity: "escrow_release",
                id: release_id.to_string(),
            });
        }
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Database(err.to_string())
}

fn amount_text(amount: TokenAmount) -> String {
    amount.as_base_units().to_string()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn column<'r, T>(row: &'r PgRow, field: &'static str) -> Result<T, LedgerStoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(field).map_err(db_err)
}

fn parse_amount(field: &'static str, raw: &str) -> Result<TokenAmount, LedgerStoreError> {
    raw.parse::<u128>()
        .map(TokenAmount)
        .map_err(|_| LedgerStoreError::InvalidColumn {
            field,
            value: raw.to_string(),
        })
}

fn amount_column(row: &PgRow, field: &'static str) -> Result<TokenAmount, LedgerStoreError> {
    let raw: String = column(row, field)?;
    parse_amount(field, &raw)
}

fn counter_column(row: &PgRow, field: &'static str) -> Result<u32, LedgerStoreError> {
    let raw: i32 = column(row, field)?;
    u32::try_from(raw).map_err(|_| LedgerStoreError::InvalidColumn {
        field,
        value: raw.to_string(),
    })
}

fn parsed_column<T>(row: &PgRow, field: &'static str) -> Result<T, LedgerStoreError>
where
    T: std::str::FromStr,
{
    let raw: String = column(row, field)?;
    raw.parse().map_err(|_| LedgerStoreError::InvalidColumn { field, value: raw })
}

fn map_battle_row(row: &PgRow) -> Result<Battle, LedgerStoreError> {
    let escrow_tx_hash: Option<String> = column(row, "escrow_tx_hash")?;
    let escrow_funder: Option<String> = column(row, "escrow_funder")?;
    let escrow = escrow_tx_hash
        .zip(escrow_funder)
        .map(|(tx_hash, funder)| EscrowReference { tx_hash, funder });
    let wager_amount = column::<Option<String>>(row, "wager_amount")?
        .map(|raw| parse_amount("wager_amount", &raw))
        .transpose()?;
    Ok(Battle {
        battle_id: BattleId(column(row, "battle_id")?),
        mode: parsed_column(row, "mode")?,
        player1: PlayerId::new(column::<String>(row, "player1")?),
        player2: column::<Option<String>>(row, "player2")?.map(PlayerId::new),
        wager_amount,
        escrow,
        winner: column::<Option<String>>(row, "winner")?.map(PlayerId::new),
        replay_blob: column(row, "replay_blob")?,
        replay_checksum: column(row, "replay_checksum")?,
        status: parsed_column(row, "status")?,
        created_at: column(row, "created_at")?,
        completed_at: column(row, "completed_at")?,
    })
}

fn map_rating_row(row: &PgRow) -> Result<RatingRecord, LedgerStoreError> {
    Ok(RatingRecord {
        player_id: PlayerId::new(column::<String>(row, "player_id")?),
        rating: column(row, "rating")?,
        games_played: counter_column(row, "games_played")?,
        wins: counter_column(row, "wins")?,
        losses: counter_column(row, "losses")?,
        win_streak: counter_column(row, "win_streak")?,
        highest_rating: column(row, "highest_rating")?,
    })
}

fn map_history_row(row: &PgRow) -> Result<BattleHistoryEntry, LedgerStoreError> {
    Ok(BattleHistoryEntry {
        history_id: column(row, "history_id")?,
        battle_id: BattleId(column(row, "battle_id")?),
        player_id: PlayerId::new(column::<String>(row, "player_id")?),
        rating_before: column(row, "rating_before")?,
        rating_after: column(row, "rating_after")?,
        rating_delta: column(row, "rating_delta")?,
        token_reward: amount_column(row, "token_reward")?,
        wager_reward: amount_column(row, "wager_reward")?,
        is_winner: column(row, "is_winner")?,
        recorded_at: column(row, "recorded_at")?,
    })
}

fn map_distribution_row(row: &PgRow) -> Result<RevenueDistribution, LedgerStoreError> {
    Ok(RevenueDistribution {
        distribution_id: column(row, "distribution_id")?,
        source: column(row, "source")?,
        total_amount: amount_column(row, "total_amount")?,
        growth: amount_column(row, "growth")?,
        security: amount_column(row, "security")?,
        operations: amount_column(row, "operations")?,
        rewards_pool: amount_column(row, "rewards_pool")?,
        dev_team: amount_column(row, "dev_team")?,
        tower_liquidity: amount_column(row, "tower_liquidity")?,
        created_at: column(row, "created_at")?,
    })
}

fn map_escrow_release_row(row: &PgRow) -> Result<EscrowReleaseRecord, LedgerStoreError> {
    Ok(EscrowReleaseRecord {
        release_id: column(row, "release_id")?,
        battle_id: BattleId(column(row, "battle_id")?),
        recipient: PlayerId::new(column::<String>(row, "recipient")?),
        amount: amount_column(row, "amount")?,
        status: parsed_column(row, "status")?,
        release_tx_hash: column(row, "release_tx_hash")?,
        failure_reason: column(row, "failure_reason")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}
