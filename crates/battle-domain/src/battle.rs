use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::DomainError;
use crate::ids::{BattleId, PlayerId};
use crate::money::TokenAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BattleMode {
    Free,
    Ranked,
    Wager,
}

impl BattleMode {
    pub const ALL: [Self; 3] = [Self::Free, Self::Ranked, Self::Wager];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Ranked => "RANKED",
            Self::Wager => "WAGER",
        }
    }
}

impl std::str::FromStr for BattleMode {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "RANKED" => Ok(Self::Ranked),
            "WAGER" => Ok(Self::Wager),
            other => Err(DomainError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BattleStatus {
    InProgress,
    Completed,
}

impl BattleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }
}

impl std::str::FromStr for BattleStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Funding transfer that backs a wager battle's escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReference {
    pub tx_hash: String,
    pub funder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battle {
    pub battle_id: BattleId,
    pub mode: BattleMode,
    pub player1: PlayerId,
    pub player2: Option<PlayerId>,
    pub wager_amount: Option<TokenAmount>,
    pub escrow: Option<EscrowReference>,
    pub winner: Option<PlayerId>,
    pub replay_blob: Option<Vec<u8>>,
    pub replay_checksum: Option<String>,
    pub status: BattleStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields written by the IN_PROGRESS -> COMPLETED transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleCompletion {
    pub battle_id: BattleId,
    pub winner: PlayerId,
    pub replay_blob: Vec<u8>,
    pub replay_checksum: String,
    pub completed_at: DateTime<Utc>,
}

impl Battle {
    #[must_use]
    pub fn new_free(player: PlayerId, created_at: DateTime<Utc>) -> Self {
        Self::in_progress(BattleMode::Free, player, None, None, None, created_at)
    }

    pub fn new_ranked(
        player1: PlayerId,
        player2: PlayerId,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if player1 == player2 {
            return Err(DomainError::SelfBattle);
        }
        Ok(Self::in_progress(
            BattleMode::Ranked,
            player1,
            Some(player2),
            None,
            None,
            created_at,
        ))
    }

    pub fn new_wager(
        player1: PlayerId,
        player2: PlayerId,
        wager_amount: TokenAmount,
        escrow: EscrowReference,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if player1 == player2 {
            return Err(DomainError::SelfBattle);
        }
        Ok(Self::in_progress(
            BattleMode::Wager,
            player1,
            Some(player2),
            Some(wager_amount),
            Some(escrow),
            created_at,
        ))
    }

    fn in_progress(
        mode: BattleMode,
        player1: PlayerId,
        player2: Option<PlayerId>,
        wager_amount: Option<TokenAmount>,
        escrow: Option<EscrowReference>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            battle_id: BattleId::new(),
            mode,
            player1,
            player2,
            wager_amount,
            escrow,
            winner: None,
            replay_blob: None,
            replay_checksum: None,
            status: BattleStatus::InProgress,
            created_at,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn participants(&self) -> Vec<&PlayerId> {
        std::iter::once(&self.player1)
            .chain(self.player2.as_ref())
            .collect()
    }

    #[must_use]
    pub fn is_participant(&self, player: &PlayerId) -> bool {
        self.participants().into_iter().any(|p| p == player)
    }

    /// The participant who did not win. `None` for single-player battles.
    #[must_use]
    pub fn opponent_of(&self, player: &PlayerId) -> Option<&PlayerId> {
        let player2 = self.player2.as_ref()?;
        if &self.player1 == player {
            Some(player2)
        } else if player2 == player {
            Some(&self.player1)
        } else {
            None
        }
    }

    pub fn ensure_in_progress(&self) -> Result<(), DomainError> {
        match self.status {
            BattleStatus::InProgress => Ok(()),
            BattleStatus::Completed => Err(DomainError::InvalidBattleState {
                status: self.status,
            }),
        }
    }

    pub fn ensure_winner_eligible(&self, winner: &PlayerId) -> Result<(), DomainError> {
        if self.is_participant(winner) {
            Ok(())
        } else {
            Err(DomainError::WinnerNotParticipant(winner.to_string()))
        }
    }

    /// Applies the completion transition. All completion fields are set together or not at all.
    pub fn complete(
        &mut self,
        winner: PlayerId,
        replay_blob: Vec<u8>,
        completed_at: DateTime<Utc>,
    ) -> Result<BattleCompletion, DomainError> {
        self.ensure_in_progress()?;
        self.ensure_winner_eligible(&winner)?;
        let replay_checksum = replay_checksum(&replay_blob);

        self.status = BattleStatus::Completed;
        self.winner = Some(winner.clone());
        self.replay_blob = Some(replay_blob.clone());
        self.replay_checksum = Some(replay_checksum.clone());
        self.completed_at = Some(completed_at);

        Ok(BattleCompletion {
            battle_id: self.battle_id,
            winner,
            replay_blob,
            replay_checksum,
            completed_at,
        })
    }

    /// Recomputes the replay checksum of `blob` and compares it with the stored one.
    #[must_use]
    pub fn replay_matches(&self, blob: &[u8]) -> bool {
        self.replay_checksum
            .as_deref()
            .is_some_and(|stored| stored == replay_checksum(blob))
    }
}

/// SHA-256 of the replay blob, lowercase hex.
#[must_use]
pub fn replay_checksum(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// Per-mode bet bounds and flat rewards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub mode: BattleMode,
    pub min_bet: TokenAmount,
    pub max_bet: TokenAmount,
    pub flat_reward: TokenAmount,
}

impl ModeConfig {
    #[must_use]
    pub fn bet_in_bounds(&self, amount: TokenAmount) -> bool {
        amount >= self.min_bet && amount <= self.max_bet
    }
}
