mod audit;
mod credit;
mod manager;
mod release;

#[cfg(test)]
mod testkit;

pub use credit::{CreditedTransfer, TransferCreditGuard};
pub use manager::{BattleLifecycleManager, CompletionOutcome, DEFAULT_PENDING_RELEASE_GRACE_SECS};
pub use release::ReconcileSummary;

use battle_domain::DomainError;
use chain_watcher::ChainVerifyError;
use ledger_store::LedgerStoreError;
use settlement::SettlementError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BattleServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Chain(#[from] ChainVerifyError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] LedgerStoreError),
    #[error("escrow gateway failed: {0}")]
    Escrow(#[source] SettlementError),
}

impl BattleServiceError {
    /// Only a pending transfer or an unreachable node is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Chain(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<DomainError> for BattleServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidBattleState { .. } => Self::InvalidState(err.to_string()),
            DomainError::WinnerNotParticipant(_)
            | DomainError::SelfBattle
            | DomainError::UnknownMode(_)
            | DomainError::UnknownStatus(_) => Self::Validation(err.to_string()),
        }
    }
}

impl From<SettlementError> for BattleServiceError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Ledger(inner) => Self::Persistence(inner),
            SettlementError::Money(_)
            | SettlementError::InvalidDistribution(_)
            | SettlementError::InvalidDistributionTable(_) => Self::Validation(err.to_string()),
            other => Self::Escrow(other),
        }
    }
}
