use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::battle::BattleMode;
use crate::ids::{BattleId, PlayerId, TraceId};
use crate::money::TokenAmount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementEventKind {
    BattleStarted {
        mode: BattleMode,
    },
    BattleCompleted {
        mode: BattleMode,
        winner: PlayerId,
        replay_checksum: String,
    },
    TransferVerified {
        tx_hash: String,
        purpose: String,
        from: String,
        to: String,
        amount: TokenAmount,
        block_number: Option<u64>,
    },
    TransferRejected {
        tx_hash: String,
        purpose: String,
        reason: String,
        from: Option<String>,
        to: Option<String>,
        amount: Option<TokenAmount>,
        block_number: Option<u64>,
    },
    EscrowReleaseSubmitted {
        tx_hash: String,
        recipient: PlayerId,
        amount: TokenAmount,
    },
    EscrowReleaseFailed {
        recipient: PlayerId,
        amount: TokenAmount,
        reason: String,
    },
}

impl SettlementEventKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BattleStarted { .. } => "battle_started",
            Self::BattleCompleted { .. } => "battle_completed",
            Self::TransferVerified { .. } => "transfer_verified",
            Self::TransferRejected { .. } => "transfer_rejected",
            Self::EscrowReleaseSubmitted { .. } => "escrow_release_submitted",
            Self::EscrowReleaseFailed { .. } => "escrow_release_failed",
        }
    }

    #[must_use]
    pub fn severity(&self) -> &'static str {
        match self {
            Self::TransferRejected { .. } | Self::EscrowReleaseFailed { .. } => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub battle_id: Option<BattleId>,
    pub trace_id: TraceId,
    pub occurred_at: DateTime<Utc>,
    pub kind: SettlementEventKind,
}
