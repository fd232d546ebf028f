use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{BattleId, PlayerId};
use crate::money::TokenAmount;

pub const DEFAULT_RATING: i32 = 1200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub player_id: PlayerId,
    pub rating: i32,
    pub games_played: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_streak: u32,
    pub highest_rating: i32,
}

impl RatingRecord {
    #[must_use]
    pub fn initial(player_id: PlayerId) -> Self {
        Self {
            player_id,
            rating: DEFAULT_RATING,
            games_played: 0,
            wins: 0,
            losses: 0,
            win_streak: 0,
            highest_rating: DEFAULT_RATING,
        }
    }

    /// Applies one finished ranked game to this record.
    pub fn record_result(&mut self, new_rating: i32, won: bool) {
        self.rating = new_rating;
        self.games_played = self.games_played.saturating_add(1);
        if won {
            self.wins = self.wins.saturating_add(1);
            self.win_streak = self.win_streak.saturating_add(1);
        } else {
            self.losses = self.losses.saturating_add(1);
            self.win_streak = 0;
        }
        self.highest_rating = self.highest_rating.max(new_rating);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleHistoryEntry {
    pub history_id: Uuid,
    pub battle_id: BattleId,
    pub player_id: PlayerId,
    pub rating_before: i32,
    pub rating_after: i32,
    pub rating_delta: i32,
    pub token_reward: TokenAmount,
    pub wager_reward: TokenAmount,
    pub is_winner: bool,
    pub recorded_at: DateTime<Utc>,
}

/// One settlement event split across the six fund buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueDistribution {
    pub distribution_id: Uuid,
    pub source: String,
    pub total_amount: TokenAmount,
    pub growth: TokenAmount,
    pub security: TokenAmount,
    pub operations: TokenAmount,
    pub rewards_pool: TokenAmount,
    pub dev_team: TokenAmount,
    pub tower_liquidity: TokenAmount,
    pub created_at: DateTime<Utc>,
}

impl RevenueDistribution {
    #[must_use]
    pub fn bucket_total(&self) -> Option<TokenAmount> {
        [
            self.growth,
            self.security,
            self.operations,
            self.rewards_pool,
            self.dev_team,
            self.tower_liquidity,
        ]
        .into_iter()
        .try_fold(TokenAmount::ZERO, |acc, v| acc.checked_add(v).ok())
    }
}
