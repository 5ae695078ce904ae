use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use negotiation_cell::EscalationReason;
use shared_utils::{with_retry, RetryPolicy};

use crate::error::LedgerError;
use crate::services::messaging::MessagingCapability;
use crate::services::templates;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: Uuid,
    pub session_key: String,
    pub session_id: Option<Uuid>,
    pub reason: EscalationReason,
    pub context: Value,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable log of handoffs to the human team. Records are never removed.
#[async_trait]
pub trait EscalationLedger: Send + Sync {
    async fn append(&self, record: &EscalationRecord) -> Result<(), LedgerError>;

    /// Flip `notified` on a record written earlier.
    async fn mark_notified(&self, id: Uuid) -> Result<(), LedgerError>;

    /// Most recent records, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<EscalationRecord>, LedgerError>;
}

#[derive(Clone, Default)]
pub struct InMemoryEscalationLedger {
    records: Arc<RwLock<Vec<EscalationRecord>>>,
}

impl InMemoryEscalationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<EscalationRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl EscalationLedger for InMemoryEscalationLedger {
    async fn append(&self, record: &EscalationRecord) -> Result<(), LedgerError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn mark_notified(&self, id: Uuid) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        record.notified = true;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EscalationRecord>, LedgerError> {
        let records = self.records.read().await;
        let skip = records.len().saturating_sub(limit);
        Ok(records[skip..].to_vec())
    }
}

/// Records live in the hash `{prefix}escalation_records` keyed by id; the
/// list `{prefix}escalation_order` keeps append order.
#[derive(Clone)]
pub struct RedisEscalationLedger {
    pool: Pool,
    records_key: String,
    order_key: String,
}

impl RedisEscalationLedger {
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            records_key: format!("{}escalation_records", key_prefix),
            order_key: format!("{}escalation_order", key_prefix),
        }
    }

    async fn get_connection(&self) -> Result<Connection, LedgerError> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Backend(format!("Redis pool exhausted: {}", e)))
    }
}

#[async_trait]
impl EscalationLedger for RedisEscalationLedger {
    async fn append(&self, record: &EscalationRecord) -> Result<(), LedgerError> {
        let mut conn = self.get_connection().await?;
        let data = serde_json::to_string(record)?;
        let id = record.id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.records_key, &id, data)
            .ignore()
            .rpush(&self.order_key, &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_notified(&self, id: Uuid) -> Result<(), LedgerError> {
        let mut conn = self.get_connection().await?;
        let field = id.to_string();

        let data: Option<String> = conn.hget(&self.records_key, &field).await?;
        let mut record: EscalationRecord = match data {
            Some(data) => serde_json::from_str(&data)?,
            None => return Err(LedgerError::NotFound(id)),
        };
        record.notified = true;

        let _: () = conn
            .hset(&self.records_key, &field, serde_json::to_string(&record)?)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EscalationRecord>, LedgerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.get_connection().await?;
        let start = -(limit as isize);
        let ids: Vec<String> = conn.lrange(&self.order_key, start, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.records_key)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for entry in raw.into_iter().flatten() {
            records.push(serde_json::from_str(&entry)?);
        }
        Ok(records)
    }
}

/// Hands a session over to the human team: writes the ledger record and,
/// where the channel allows, tells the patient someone will be in touch.
///
/// Reporting never fails. Ledger and messaging problems are logged and the
/// record is still returned.
pub struct EscalationReporter {
    ledger: Arc<dyn EscalationLedger>,
    messaging: Arc<dyn MessagingCapability>,
    retry: RetryPolicy,
}

impl EscalationReporter {
    pub fn new(
        ledger: Arc<dyn EscalationLedger>,
        messaging: Arc<dyn MessagingCapability>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            messaging,
            retry,
        }
    }

    #[instrument(skip(self, context))]
    pub async fn report(
        &self,
        session_key: &str,
        session_id: Option<Uuid>,
        reason: EscalationReason,
        context: Value,
        notify_patient: bool,
    ) -> EscalationRecord {
        warn!("Escalating session {}: {}", session_key, reason);

        let mut record = EscalationRecord {
            id: Uuid::new_v4(),
            session_key: session_key.to_string(),
            session_id,
            reason,
            context,
            notified: false,
            created_at: Utc::now(),
        };

        let recorded = match with_retry(&self.retry, "append_escalation_record", || self.ledger.append(&record)).await {
            Ok(()) => {
                info!("Escalation {} recorded for {}", record.id, session_key);
                true
            }
            Err(e) => {
                error!(
                    "Failed to persist escalation {} for {} ({}): {}",
                    record.id, session_key, reason, e
                );
                false
            }
        };

        if !(notify_patient && reason.allows_notification()) {
            return record;
        }

        let notice = templates::escalation_notice();
        if let Err(e) = with_retry(&self.retry, "send_escalation_notice", || {
            self.messaging.send_message(session_key, &notice)
        })
        .await
        {
            warn!("Could not notify {} about escalation: {}", session_key, e);
            return record;
        }
        record.notified = true;

        if recorded {
            if let Err(e) = with_retry(&self.retry, "mark_escalation_notified", || {
                self.ledger.mark_notified(record.id)
            })
            .await
            {
                warn!("Notified {} but could not update escalation {}: {}", session_key, record.id, e);
            }
        }

        record
    }
}
