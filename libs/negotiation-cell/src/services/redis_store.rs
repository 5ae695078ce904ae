use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionStoreError;
use crate::models::{BookedAppointment, NegotiationPhase, NegotiationSession};
use crate::services::store::SessionStore;
use shared_config::AppConfig;

// KEYS: session hash, expiry index, retention index
// ARGV: data, phase, expires_at_ms, member
static CREATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local terminal = redis.call('HGET', KEYS[1], 'terminal')
        if terminal == '0' then
            return 0
        end
        redis.call('DEL', KEYS[1])
        redis.call('HSET', KEYS[1], 'data', ARGV[1], 'phase', ARGV[2], 'revision', '0', 'terminal', '0')
        redis.call('ZREM', KEYS[3], ARGV[4])
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
        return 1
        ",
    )
});

// KEYS: session hash, expiry index, retention index
// ARGV: expected phase, expected revision, data, phase, revision, terminal,
//       expires_at_ms, purge_at_ms, member
static UPDATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HMGET', KEYS[1], 'phase', 'revision')
        if not current[1] then
            return -1
        end
        if current[1] ~= ARGV[1] or current[2] ~= ARGV[2] then
            return 0
        end
        redis.call('HSET', KEYS[1], 'data', ARGV[3], 'phase', ARGV[4], 'revision', ARGV[5], 'terminal', ARGV[6])
        if ARGV[6] == '1' then
            redis.call('ZREM', KEYS[2], ARGV[9])
            redis.call('ZADD', KEYS[3], ARGV[8], ARGV[9])
        else
            redis.call('ZADD', KEYS[2], ARGV[7], ARGV[9])
        end
        return 1
        ",
    )
});

// KEYS: session hash, retention index
// ARGV: member
static PURGE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('ZREM', KEYS[2], ARGV[1])
        if redis.call('HGET', KEYS[1], 'terminal') == '1' then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
        ",
    )
});

/// Build a Redis pool and check it answers `PING`.
pub async fn connect_redis_pool(redis_url: &str) -> Result<Pool, SessionStoreError> {
    let cfg = Config::from_url(redis_url);
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| SessionStoreError::Backend(format!("Failed to create Redis pool: {}", e)))?;

    // Test connection
    let mut conn = pool
        .get()
        .await
        .map_err(|e| SessionStoreError::Backend(format!("Failed to connect to Redis: {}", e)))?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(pool)
}

/// Redis-backed session store.
///
/// Layout under the configured key prefix:
/// - `negotiation_session:{key}` hash with `data`, `phase`, `revision`, `terminal`
/// - `negotiation_sessions:expiry` sorted set of live keys by deadline (ms)
/// - `negotiation_sessions:retention` sorted set of terminal keys by purge time (ms)
/// - `booked_appointment:{session_id}` written with `SET NX`
#[derive(Clone)]
pub struct RedisSessionStore {
    pool: Pool,
    key_prefix: String,
    audit_retention: Duration,
}

impl RedisSessionStore {
    pub async fn new(config: &AppConfig) -> Result<Self, SessionStoreError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let pool = connect_redis_pool(&redis_url).await?;
        info!("Redis session store initialized successfully");

        Ok(Self::from_pool(
            pool,
            config.redis_key_prefix.clone(),
            Duration::days(config.scheduling.audit_retention_days),
        ))
    }

    pub fn from_pool(pool: Pool, key_prefix: impl Into<String>, audit_retention: Duration) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            audit_retention,
        }
    }

    async fn get_connection(&self) -> Result<Connection, SessionStoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| SessionStoreError::Backend(format!("Redis pool exhausted: {}", e)))
    }

    fn session_key(&self, session_key: &str) -> String {
        format!("{}negotiation_session:{}", self.key_prefix, session_key)
    }

    fn expiry_index(&self) -> String {
        format!("{}negotiation_sessions:expiry", self.key_prefix)
    }

    fn retention_index(&self) -> String {
        format!("{}negotiation_sessions:retention", self.key_prefix)
    }

    fn booking_key(&self, session_id: Uuid) -> String {
        format!("{}booked_appointment:{}", self.key_prefix, session_id)
    }

    fn purge_at(&self, session: &NegotiationSession) -> DateTime<Utc> {
        session.closed_at.unwrap_or(session.last_activity_at) + self.audit_retention
    }

    async fn load(&self, conn: &mut Connection, session_key: &str) -> Result<Option<NegotiationSession>, SessionStoreError> {
        let data: Option<String> = conn.hget(self.session_key(session_key), "data").await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: &NegotiationSession) -> Result<NegotiationSession, SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let mut stored = session.clone();
        stored.revision = 0;
        let data = serde_json::to_string(&stored)?;

        let created: i64 = CREATE_SCRIPT
            .key(self.session_key(&stored.session_key))
            .key(self.expiry_index())
            .key(self.retention_index())
            .arg(data)
            .arg(stored.phase.as_str())
            .arg(stored.expires_at.timestamp_millis())
            .arg(&stored.session_key)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(SessionStoreError::AlreadyExists(stored.session_key));
        }

        debug!("Session {} created ({})", stored.session_key, stored.session_id);
        Ok(stored)
    }

    async fn get(&self, session_key: &str) -> Result<NegotiationSession, SessionStoreError> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, session_key)
            .await?
            .ok_or_else(|| SessionStoreError::NotFound(session_key.to_string()))
    }

    async fn update(
        &self,
        session: &NegotiationSession,
        expected_phase: NegotiationPhase,
    ) -> Result<NegotiationSession, SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let mut stored = session.clone();
        stored.revision = session.revision + 1;
        let data = serde_json::to_string(&stored)?;
        let terminal = if stored.phase.is_terminal() { "1" } else { "0" };

        let outcome: i64 = UPDATE_SCRIPT
            .key(self.session_key(&stored.session_key))
            .key(self.expiry_index())
            .key(self.retention_index())
            .arg(expected_phase.as_str())
            .arg(session.revision.to_string())
            .arg(data)
            .arg(stored.phase.as_str())
            .arg(stored.revision.to_string())
            .arg(terminal)
            .arg(stored.expires_at.timestamp_millis())
            .arg(self.purge_at(&stored).timestamp_millis())
            .arg(&stored.session_key)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => {
                debug!(
                    "Session {} moved {} -> {} at revision {}",
                    stored.session_key, expected_phase, stored.phase, stored.revision
                );
                Ok(stored)
            }
            0 => Err(SessionStoreError::Conflict {
                session_key: stored.session_key,
                expected_phase,
                expected_revision: session.revision,
            }),
            _ => Err(SessionStoreError::NotFound(stored.session_key)),
        }
    }

    async fn delete(&self, session_key: &str) -> Result<(), SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let _: () = conn.del(self.session_key(session_key)).await?;
        let _: () = conn.zrem(self.expiry_index(), session_key).await?;
        let _: () = conn.zrem(self.retention_index(), session_key).await?;

        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<NegotiationSession>, SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let keys: Vec<String> = conn
            .zrangebyscore(self.expiry_index(), "-inf", now.timestamp_millis())
            .await?;

        let mut expired = Vec::with_capacity(keys.len());
        for key in keys {
            match self.load(&mut conn, &key).await? {
                Some(session) if session.is_live() && session.expires_at <= now => expired.push(session),
                Some(_) => {}
                None => {
                    warn!("Expiry index references missing session {}, dropping it", key);
                    let _: () = conn.zrem(self.expiry_index(), &key).await?;
                }
            }
        }

        Ok(expired)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let keys: Vec<String> = conn
            .zrangebyscore(self.retention_index(), "-inf", before.timestamp_millis())
            .await?;

        let mut purged = 0;
        for key in keys {
            let removed: i64 = PURGE_SCRIPT
                .key(self.session_key(&key))
                .key(self.retention_index())
                .arg(&key)
                .invoke_async(&mut conn)
                .await?;
            purged += removed as usize;
        }

        if purged > 0 {
            debug!("Purged {} terminal session(s)", purged);
        }
        Ok(purged)
    }

    async fn record_booking(&self, appointment: &BookedAppointment) -> Result<(), SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let data = serde_json::to_string(appointment)?;
        let written: bool = conn.set_nx(self.booking_key(appointment.session_id), data).await?;
        if !written {
            return Err(SessionStoreError::AlreadyExists(appointment.session_id.to_string()));
        }

        Ok(())
    }

    async fn get_booking(&self, session_id: Uuid) -> Result<Option<BookedAppointment>, SessionStoreError> {
        let mut conn = self.get_connection().await?;

        let data: Option<String> = conn.get(self.booking_key(session_id)).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}
