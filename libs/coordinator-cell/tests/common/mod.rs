#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use availability_cell::{IntervalSpec, IntervalUnit, TimeInterval};
use coordinator_cell::{
    BookingCoordinator, CalendarCapability, CapabilityError, CoordinatorSettings, InMemoryEscalationLedger,
    MessagingCapability,
};
use negotiation_cell::{
    BookedAppointment, FollowUpRequest, InMemorySessionStore, NegotiationPhase, NegotiationSession, SessionStore,
    SessionStoreError,
};
use shared_utils::RetryPolicy;

pub const PATIENT: &str = "whatsapp:+15550102030";
pub const PATIENT_KEY: &str = "+15550102030";

#[derive(Debug, Clone)]
pub struct CreatedEvent {
    pub calendar_id: String,
    pub interval: TimeInterval,
    pub summary: String,
}

/// Calendar double: a mutable busy list, injectable failures, and a record
/// of every created event.
#[derive(Default)]
pub struct FakeCalendar {
    busy: Mutex<Vec<TimeInterval>>,
    created: Mutex<Vec<CreatedEvent>>,
    busy_calls: AtomicU32,
    conflicts_to_raise: AtomicU32,
    unavailable: Mutex<bool>,
}

impl FakeCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_busy(&self, interval: TimeInterval) {
        self.busy.lock().unwrap().push(interval);
    }

    pub fn raise_conflicts(&self, count: u32) {
        self.conflicts_to_raise.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn created(&self) -> Vec<CreatedEvent> {
        self.created.lock().unwrap().clone()
    }

    pub fn busy_calls(&self) -> u32 {
        self.busy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarCapability for FakeCalendar {
    async fn list_busy_intervals(
        &self,
        _calendar_id: &str,
        window: &TimeInterval,
    ) -> Result<Vec<TimeInterval>, CapabilityError> {
        self.busy_calls.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock().unwrap() {
            return Err(CapabilityError::Unavailable("quota exceeded".to_string()));
        }
        Ok(self
            .busy
            .lock()
            .unwrap()
            .iter()
            .filter(|interval| interval.overlaps(window))
            .copied()
            .collect())
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        interval: &TimeInterval,
        summary: &str,
    ) -> Result<String, CapabilityError> {
        let pending = self.conflicts_to_raise.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts_to_raise.store(pending - 1, Ordering::SeqCst);
            return Err(CapabilityError::Conflict("slot overlaps an existing event".to_string()));
        }

        let mut created = self.created.lock().unwrap();
        created.push(CreatedEvent {
            calendar_id: calendar_id.to_string(),
            interval: *interval,
            summary: summary.to_string(),
        });
        self.busy.lock().unwrap().push(*interval);
        Ok(format!("evt-{}", created.len()))
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub text: String,
}

#[derive(Default)]
pub struct FakeMessaging {
    sent: Mutex<Vec<SentMessage>>,
    failure: Mutex<Option<CapabilityError>>,
}

impl FakeMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: Option<CapabilityError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_text(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|message| message.text.clone())
    }
}

#[async_trait]
impl MessagingCapability for FakeMessaging {
    async fn send_message(&self, to: &str, text: &str) -> Result<String, CapabilityError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentMessage {
            to: to.to_string(),
            text: text.to_string(),
        });
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Yields to the scheduler before every compare-and-swap so concurrent
/// handlers interleave between their read and their write.
pub struct YieldingStore {
    inner: InMemorySessionStore,
}

impl YieldingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemorySessionStore::default(),
        }
    }
}

#[async_trait]
impl SessionStore for YieldingStore {
    async fn create(&self, session: &NegotiationSession) -> Result<NegotiationSession, SessionStoreError> {
        self.inner.create(session).await
    }

    async fn get(&self, session_key: &str) -> Result<NegotiationSession, SessionStoreError> {
        self.inner.get(session_key).await
    }

    async fn update(
        &self,
        session: &NegotiationSession,
        expected_phase: NegotiationPhase,
    ) -> Result<NegotiationSession, SessionStoreError> {
        tokio::task::yield_now().await;
        self.inner.update(session, expected_phase).await
    }

    async fn delete(&self, session_key: &str) -> Result<(), SessionStoreError> {
        self.inner.delete(session_key).await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<NegotiationSession>, SessionStoreError> {
        self.inner.list_expired(now).await
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        self.inner.purge_terminal(before).await
    }

    async fn record_booking(&self, appointment: &BookedAppointment) -> Result<(), SessionStoreError> {
        self.inner.record_booking(appointment).await
    }

    async fn get_booking(&self, session_id: Uuid) -> Result<Option<BookedAppointment>, SessionStoreError> {
        self.inner.get_booking(session_id).await
    }
}

pub fn test_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: StdDuration::from_millis(1),
            attempt_timeout: StdDuration::from_secs(1),
        },
        default_calendar_id: "dr-lee".to_string(),
        ..CoordinatorSettings::default()
    }
}

pub struct Harness {
    pub coordinator: Arc<BookingCoordinator>,
    pub store: Arc<dyn SessionStore>,
    pub calendar: Arc<FakeCalendar>,
    pub messaging: Arc<FakeMessaging>,
    pub ledger: Arc<InMemoryEscalationLedger>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemorySessionStore::default()))
    }

    pub fn with_store(store: Arc<dyn SessionStore>) -> Self {
        Self::with_parts(store, test_settings())
    }

    pub fn with_settings(settings: CoordinatorSettings) -> Self {
        Self::with_parts(Arc::new(InMemorySessionStore::default()), settings)
    }

    fn with_parts(store: Arc<dyn SessionStore>, settings: CoordinatorSettings) -> Self {
        let calendar = Arc::new(FakeCalendar::new());
        let messaging = Arc::new(FakeMessaging::new());
        let ledger = Arc::new(InMemoryEscalationLedger::new());

        let coordinator = Arc::new(BookingCoordinator::new(
            store.clone(),
            calendar.clone(),
            messaging.clone(),
            ledger.clone(),
            settings,
        ));

        Self {
            coordinator,
            store,
            calendar,
            messaging,
            ledger,
        }
    }

    pub async fn session(&self) -> NegotiationSession {
        self.store.get(PATIENT_KEY).await.unwrap()
    }
}

/// Follow-up roughly one week out, created now.
pub fn follow_up(handle: &str) -> FollowUpRequest {
    FollowUpRequest {
        patient_identity: handle.to_string(),
        required: true,
        reason_text: "blood pressure review".to_string(),
        interval: IntervalSpec::Relative {
            amount: 1,
            unit: IntervalUnit::Weeks,
        },
        created_at: Utc::now(),
        provider_calendar_id: None,
    }
}
