use std::sync::Arc;

use audit_store::{AuditEventRecord, AuditRepository};
use battle_domain::{BattleId, SettlementEvent, SettlementEventKind, TraceId};
use chrono::Utc;
use tracing::warn;

/// Best-effort writer for the settlement audit trail. A failed audit write is logged,
/// never propagated into the settlement path.
#[derive(Clone)]
pub(crate) struct AuditTrail {
    repo: Arc<dyn AuditRepository>,
}

impl AuditTrail {
    pub(crate) fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    pub(crate) async fn record(
        &self,
        battle_id: Option<BattleId>,
        trace_id: TraceId,
        kind: SettlementEventKind,
    ) {
        let event = SettlementEvent {
            battle_id,
            trace_id,
            occurred_at: Utc::now(),
            kind,
        };
        let result = match AuditEventRecord::from_event(&event) {
            Ok(record) => self.repo.insert_event(&record).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(
                event_kind = event.kind.name(),
                trace_id = %trace_id,
                error = %err,
                "settlement audit write failed"
            );
        }
    }
}
