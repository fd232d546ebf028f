use thiserror::Error;

use crate::battle::BattleStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("battle is {}, expected IN_PROGRESS", status.as_str())]
    InvalidBattleState { status: BattleStatus },
    #[error("winner {0} is not a participant of this battle")]
    WinnerNotParticipant(String),
    #[error("a player cannot battle themselves")]
    SelfBattle,
    #[error("unknown battle mode: {0}")]
    UnknownMode(String),
    #[error("unknown battle status: {0}")]
    UnknownStatus(String),
}
