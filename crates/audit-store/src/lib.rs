use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use battle_domain::{BattleId, SettlementEvent, SettlementEventKind, TraceId, normalize_tx_hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Row in the append-only settlement audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEventRecord {
    pub event_id: Uuid,
    pub event_kind: String,
    pub battle_id: Option<BattleId>,
    pub related_tx_hash: Option<String>,
    pub severity: String,
    pub payload_json: Value,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl AuditEventRecord {
    pub fn from_event(event: &SettlementEvent) -> Result<Self, AuditStoreError> {
        let payload_json = serde_json::to_value(&event.kind)
            .map_err(|e| AuditStoreError::Serialization(e.to_string()))?;
        Ok(Self {
            event_id: Uuid::now_v7(),
            event_kind: event.kind.name().to_string(),
            battle_id: event.battle_id,
            related_tx_hash: related_tx_hash(&event.kind).map(normalize_tx_hash),
            severity: event.kind.severity().to_string(),
            payload_json,
            occurred_at: event.occurred_at,
            trace_id: event.trace_id,
        })
    }
}

fn related_tx_hash(kind: &SettlementEventKind) -> Option<&str> {
    match kind {
        SettlementEventKind::TransferVerified { tx_hash, .. }
        | SettlementEventKind::TransferRejected { tx_hash, .. }
        | SettlementEventKind::EscrowReleaseSubmitted { tx_hash, .. } => Some(tx_hash),
        SettlementEventKind::BattleStarted { .. }
        | SettlementEventKind::BattleCompleted { .. }
        | SettlementEventKind::EscrowReleaseFailed { .. } => None,
    }
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

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn insert_event(&self, record: &AuditEventRecord) -> Result<(), AuditStoreError>;
}

#[async_trait]
pub trait AuditReadRepository: Send + Sync {
    async fn list_events(
        &self,
        battle_id: Option<BattleId>,
        page: PageRequest,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError>;

    async fn list_events_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError>;
}

#[derive(Debug, Default)]
pub struct NoopAuditRepository;

#[async_trait]
impl AuditRepository for NoopAuditRepository {
    async fn insert_event(&self, _record: &AuditEventRecord) -> Result<(), AuditStoreError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditRepository {
    pub events: Arc<Mutex<Vec<AuditEventRecord>>>,
}

impl InMemoryAuditRepository {
    pub fn event_kinds(&self) -> Result<Vec<String>, AuditStoreError> {
        Ok(self
            .events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
            .iter()
            .map(|e| e.event_kind.clone())
            .collect())
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn insert_event(&self, record: &AuditEventRecord) -> Result<(), AuditStoreError> {
        self.events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditReadRepository for InMemoryAuditRepository {
    async fn list_events(
        &self,
        battle_id: Option<BattleId>,
        page: PageRequest,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError> {
        let guard = self
            .events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?;
        Ok(guard
            .iter()
            .filter(|e| battle_id.is_none_or(|id| e.battle_id == Some(id)))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn list_events_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError> {
        let wanted = normalize_tx_hash(tx_hash);
        let guard = self
            .events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?;
        Ok(guard
            .iter()
            .filter(|e| e.related_tx_hash.as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_audit_event_record(row: &sqlx::postgres::PgRow) -> Result<AuditEventRecord, AuditStoreError> {
    Ok(AuditEventRecord {
        event_id: row
            .try_get("event_id")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        event_kind: row
            .try_get("event_kind")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        battle_id: row
            .try_get::<Option<Uuid>, _>("battle_id")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?
            .map(BattleId),
        related_tx_hash: row
            .try_get("related_tx_hash")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        severity: row
            .try_get("severity")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        payload_json: row
            .try_get("payload_json")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        occurred_at: row
            .try_get("occurred_at")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        trace_id: TraceId(
            row.try_get("trace_id")
                .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        ),
    })
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn insert_event(&self, record: &AuditEventRecord) -> Result<(), AuditStoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_settlement_events (
                event_id, event_kind, battle_id, related_tx_hash, severity, payload_json,
                occurred_at, trace_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.event_id)
        .bind(&record.event_kind)
        .bind(record.battle_id.map(|v| v.0))
        .bind(&record.related_tx_hash)
        .bind(&record.severity)
        .bind(&record.payload_json)
        .bind(record.occurred_at)
        .bind(record.trace_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AuditReadRepository for PostgresAuditRepository {
    async fn list_events(
        &self,
        battle_id: Option<BattleId>,
        page: PageRequest,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_kind, battle_id, related_tx_hash, severity, payload_json,
                   occurred_at, trace_id
            FROM audit_settlement_events
            WHERE ($1::uuid IS NULL OR battle_id = $1)
            ORDER BY occurred_at ASC, event_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(battle_id.map(|v| v.0))
        .bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_audit_event_record).collect()
    }

    async fn list_events_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<AuditEventRecord>, AuditStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_kind, battle_id, related_tx_hash, severity, payload_json,
                   occurred_at, trace_id
            FROM audit_settlement_events
            WHERE related_tx_hash = $1
            ORDER BY occurred_at ASC, event_id ASC
            "#,
        )
        .bind(normalize_tx_hash(tx_hash))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_audit_event_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use battle_domain::{BattleMode, PlayerId, TokenAmount};
    use serde_json::json;

    use super::*;

    fn event(battle_id: Option<BattleId>, kind: SettlementEventKind) -> SettlementEvent {
        SettlementEvent {
            battle_id,
            trace_id: TraceId::new(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn record_carries_kind_severity_and_full_payload() {
        let record = AuditEventRecord::from_event(&event(
            None,
            SettlementEventKind::TransferRejected {
                tx_hash: "0xABC".to_string(),
                purpose: "wager_escrow".to_string(),
                reason: "sender_mismatch: 0x02 != 0x01".to_string(),
                from: Some("0x02".to_string()),
                to: Some("0x03".to_string()),
                amount: Some(TokenAmount::from_whole_tokens(5)),
                block_number: Some(9),
            },
        ))
        .expect("record");
        assert_eq!(record.event_kind, "transfer_rejected");
        assert_eq!(record.severity, "error");
        assert_eq!(record.related_tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(
            record.payload_json["transfer_rejected"]["from"],
            json!("0x02")
        );
        assert_eq!(
            record.payload_json["transfer_rejected"]["block_number"],
            json!(9)
        );
    }

    #[test]
    fn wager_sized_amounts_are_recorded_as_decimal_strings() {
        let record = AuditEventRecord::from_event(&event(
            Some(BattleId::new()),
            SettlementEventKind::TransferVerified {
                tx_hash: "0xF00D".to_string(),
                purpose: "wager_escrow".to_string(),
                from: "0x01".to_string(),
                to: "0x02".to_string(),
                amount: TokenAmount::from_whole_tokens(100),
                block_number: Some(12),
            },
        ))
        .expect("record");
        assert_eq!(record.related_tx_hash.as_deref(), Some("0xf00d"));
        assert_eq!(
            record.payload_json["transfer_verified"]["amount"],
            json!("100")
        );

        let released = AuditEventRecord::from_event(&event(
            None,
            SettlementEventKind::EscrowReleaseFailed {
                recipient: PlayerId::new("0x01"),
                amount: "1999.5".parse().expect("amount"),
                reason: "signer out of gas".to_string(),
            },
        ))
        .expect("record");
        assert_eq!(
            released.payload_json["escrow_release_failed"]["amount"],
            json!("1999.5")
        );
    }

    #[tokio::test]
    async fn in_memory_lists_by_battle_and_tx_hash() {
        let repo = InMemoryAuditRepository::default();
        let battle_id = BattleId::new();
        for ev in [
            event(
                Some(battle_id),
                SettlementEventKind::BattleStarted {
                    mode: BattleMode::Ranked,
                },
            ),
            event(
                None,
                SettlementEventKind::TransferVerified {
                    tx_hash: "0xdead".to_string(),
                    purpose: "deposit".to_string(),
                    from: "0x01".to_string(),
                    to: "0x02".to_string(),
                    amount: TokenAmount::from_whole_tokens(1),
                    block_number: Some(1),
                },
            ),
            event(
                Some(battle_id),
                SettlementEventKind::BattleCompleted {
                    mode: BattleMode::Ranked,
                    winner: PlayerId::new("0x01"),
                    replay_checksum: "00".to_string(),
                },
            ),
        ] {
            repo.insert_event(&AuditEventRecord::from_event(&ev).expect("record"))
                .await
                .expect("insert");
        }

        let for_battle = repo
            .list_events(Some(battle_id), PageRequest::default())
            .await
            .expect("list");
        assert_eq!(for_battle.len(), 2);
        assert_eq!(
            repo.list_events(None, PageRequest::default())
                .await
                .expect("list")
                .len(),
            3
        );
        let by_hash = repo.list_events_by_tx_hash("0xDEAD").await.expect("list");
        assert_eq!(by_hash.len(), 1);
        assert_eq!(by_hash[0].event_kind, "transfer_verified");
        assert_eq!(
            repo.event_kinds().expect("kinds"),
            vec!["battle_started", "transfer_verified", "battle_completed"]
        );
    }

    #[tokio::test]
    async fn noop_repository_accepts_everything() {
        let record = AuditEventRecord::from_event(&event(
            None,
            SettlementEventKind::BattleStarted {
                mode: BattleMode::Free,
            },
        ))
        .expect("record");
        NoopAuditRepository
            .insert_event(&record)
            .await
            .expect("noop insert");
    }
}
