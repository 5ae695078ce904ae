use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionStoreError;
use crate::models::{BookedAppointment, NegotiationPhase, NegotiationSession};

/// Durable keyed storage for negotiation sessions.
///
/// `update` is a compare-and-swap on the pair (phase, revision): the write
/// only lands when the stored session is still in `expected_phase` at
/// `session.revision`. A successful write returns the stored session with
/// its revision bumped.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session. Fails with `AlreadyExists` while a live session
    /// holds the key; a terminal one is replaced.
    async fn create(&self, session: &NegotiationSession) -> Result<NegotiationSession, SessionStoreError>;

    async fn get(&self, session_key: &str) -> Result<NegotiationSession, SessionStoreError>;

    async fn update(
        &self,
        session: &NegotiationSession,
        expected_phase: NegotiationPhase,
    ) -> Result<NegotiationSession, SessionStoreError>;

    async fn delete(&self, session_key: &str) -> Result<(), SessionStoreError>;

    /// Live sessions whose deadline is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<NegotiationSession>, SessionStoreError>;

    /// Drop terminal sessions whose audit retention ended at or before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, SessionStoreError>;

    /// Write-once per `session_id`.
    async fn record_booking(&self, appointment: &BookedAppointment) -> Result<(), SessionStoreError>;

    async fn get_booking(&self, session_id: Uuid) -> Result<Option<BookedAppointment>, SessionStoreError>;
}

/// Process-local store. Contents are lost on restart; use it for tests and
/// local development only.
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, NegotiationSession>>>,
    bookings: Arc<RwLock<HashMap<Uuid, BookedAppointment>>>,
    audit_retention: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::days(30))
    }
}

impl InMemorySessionStore {
    pub fn new(audit_retention: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            bookings: Arc::new(RwLock::new(HashMap::new())),
            audit_retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &NegotiationSession) -> Result<NegotiationSession, SessionStoreError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&session.session_key) {
            if existing.is_live() {
                return Err(SessionStoreError::AlreadyExists(session.session_key.clone()));
            }
            debug!("Replacing {} session for {}", existing.phase, session.session_key);
        }

        let mut stored = session.clone();
        stored.revision = 0;
        sessions.insert(stored.session_key.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, session_key: &str) -> Result<NegotiationSession, SessionStoreError> {
        self.sessions
            .read()
            .await
            .get(session_key)
            .cloned()
            .ok_or_else(|| SessionStoreError::NotFound(session_key.to_string()))
    }

    async fn update(
        &self,
        session: &NegotiationSession,
        expected_phase: NegotiationPhase,
    ) -> Result<NegotiationSession, SessionStoreError> {
        let mut sessions = self.sessions.write().await;

        let current = sessions
            .get(&session.session_key)
            .ok_or_else(|| SessionStoreError::NotFound(session.session_key.clone()))?;

        if current.phase != expected_phase || current.revision != session.revision {
            return Err(SessionStoreError::Conflict {
                session_key: session.session_key.clone(),
                expected_phase,
                expected_revision: session.revision,
            });
        }

        let mut stored = session.clone();
        stored.revision = session.revision + 1;
        sessions.insert(stored.session_key.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, session_key: &str) -> Result<(), SessionStoreError> {
        self.sessions.write().await.remove(session_key);
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<NegotiationSession>, SessionStoreError> {
        let sessions = self.sessions.read().await;
        let mut expired: Vec<NegotiationSession> = sessions
            .values()
            .filter(|session| session.is_live() && session.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|session| session.expires_at);
        Ok(expired)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let retention = self.audit_retention;
        let initial = sessions.len();

        sessions.retain(|_, session| {
            let closed_at = session.closed_at.unwrap_or(session.last_activity_at);
            session.is_live() || closed_at + retention > before
        });

        Ok(initial - sessions.len())
    }

    async fn record_booking(&self, appointment: &BookedAppointment) -> Result<(), SessionStoreError> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&appointment.session_id) {
            return Err(SessionStoreError::AlreadyExists(appointment.session_id.to_string()));
        }
        bookings.insert(appointment.session_id, appointment.clone());
        Ok(())
    }

    async fn get_booking(&self, session_id: Uuid) -> Result<Option<BookedAppointment>, SessionStoreError> {
        Ok(self.bookings.read().await.get(&session_id).cloned())
    }
}
