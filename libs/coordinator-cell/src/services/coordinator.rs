use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use availability_cell::{slot_is_free, window_for, AvailabilityReconciler, CandidateSlot, TimeInterval};
use negotiation_cell::{
    BookedAppointment, EscalationReason, FollowUpRequest, NegotiationPhase, NegotiationSession,
    NegotiationStateMachine, PatientIdentity, ProposalTransition, ReplyTransition, SessionStore,
    SessionStoreError,
};
use shared_utils::with_retry;

use crate::error::{CapabilityError, CoordinatorError};
use crate::models::{CoordinatorSettings, InitiationOutcome, ReplyOutcome};
use crate::services::calendar::CalendarCapability;
use crate::services::escalation::{EscalationLedger, EscalationReporter};
use crate::services::messaging::MessagingCapability;
use crate::services::templates;

/// Maximum number of passes over one reply: the first attempt plus one
/// reprocess after a compare-and-swap conflict.
const REPLY_PASSES: usize = 2;

/// Drives a follow-up from initiation to a booked calendar event.
///
/// Every state change is written through the store's compare-and-swap
/// before the matching message goes out, so a duplicate or concurrent
/// event loses the race before it can cause side effects.
pub struct BookingCoordinator {
    store: Arc<dyn SessionStore>,
    calendar: Arc<dyn CalendarCapability>,
    messaging: Arc<dyn MessagingCapability>,
    reporter: EscalationReporter,
    machine: NegotiationStateMachine,
    reconciler: AvailabilityReconciler,
    settings: CoordinatorSettings,
}

impl BookingCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        calendar: Arc<dyn CalendarCapability>,
        messaging: Arc<dyn MessagingCapability>,
        ledger: Arc<dyn EscalationLedger>,
        settings: CoordinatorSettings,
    ) -> Self {
        let reporter = EscalationReporter::new(ledger, messaging.clone(), settings.retry.clone());
        let machine = NegotiationStateMachine::new(settings.negotiation.clone());
        let reconciler = AvailabilityReconciler::new(
            settings.working_hours.clone(),
            settings.slot_duration,
            settings.max_candidates,
        );

        Self {
            store,
            calendar,
            messaging,
            reporter,
            machine,
            reconciler,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn session(&self, handle: &str) -> Result<NegotiationSession, CoordinatorError> {
        let identity = PatientIdentity::parse(handle)?;
        Ok(self.store.get(identity.as_str()).await?)
    }

    // ==========================================================================
    // INITIATION
    // ==========================================================================

    #[instrument(skip(self, request), fields(patient = %request.patient_identity))]
    pub async fn on_initiation(&self, request: FollowUpRequest) -> Result<InitiationOutcome, CoordinatorError> {
        if !request.required {
            info!("Follow-up not required, nothing to schedule");
            return Ok(InitiationOutcome::NotRequired);
        }

        let identity = PatientIdentity::parse(&request.patient_identity)?;
        if !identity.is_verified() {
            warn!("Scheduling for unverified identity {}", identity);
        }

        let now = Utc::now();
        let window = window_for(&request.interval, request.created_at.date_naive(), &self.settings.default_window)?;
        if window.flagged_unspecified {
            warn!(
                "Follow-up for {} has no stated interval, using default window",
                identity
            );
        }

        let calendar_id = request
            .provider_calendar_id
            .clone()
            .unwrap_or_else(|| self.settings.default_calendar_id.clone());
        let session = NegotiationSession::open(
            &identity,
            &window,
            request.reason_text.clone(),
            calendar_id,
            now,
            self.settings.negotiation.session_ttl,
        );

        let mut session = match self.store.create(&session).await {
            Ok(session) => session,
            Err(SessionStoreError::AlreadyExists(key)) => {
                info!("Live session already exists for {}, ignoring duplicate initiation", key);
                return Ok(InitiationOutcome::Duplicate { session_key: key });
            }
            Err(e) => return Err(e.into()),
        };

        info!("Opened session {} for {}", session.session_id, session.session_key);

        let Some(search) = self.search_window(&session.window, now) else {
            return self
                .escalate_initiation(session, EscalationReason::NoAvailability, json!({ "window": "elapsed" }), true)
                .await;
        };

        let busy = match self.list_busy(&session.calendar_id, &search).await {
            Ok(busy) => busy,
            Err(e) => {
                return self
                    .escalate_initiation(
                        session,
                        EscalationReason::CapabilityUnavailable,
                        json!({ "capability": "calendar", "error": e.to_string() }),
                        true,
                    )
                    .await;
            }
        };

        let candidates = self.reconciler.find_candidate_slots(&busy, &search);
        let session_key = session.session_key.clone();
        let session_id = session.session_id;

        match self.machine.propose(&mut session, candidates, now)? {
            ProposalTransition::Escalated(reason) => {
                let session = match self.persist(&session, NegotiationPhase::Initiated).await? {
                    Some(session) => session,
                    None => return Ok(InitiationOutcome::Superseded { session_key }),
                };
                self.reporter
                    .report(
                        &session.session_key,
                        Some(session.session_id),
                        reason,
                        json!({ "window_start": search.start(), "window_end": search.end() }),
                        true,
                    )
                    .await;
                Ok(InitiationOutcome::Escalated {
                    session_key,
                    session_id,
                    reason,
                })
            }
            ProposalTransition::Proposed { .. } => {
                let session = match self.persist(&session, NegotiationPhase::Initiated).await? {
                    Some(session) => session,
                    None => return Ok(InitiationOutcome::Superseded { session_key }),
                };

                let text = templates::proposal(&session.reason_text, &session.proposed_slots);
                if let Err(e) = self.send(&session.session_key, &text).await {
                    let reason = match &e {
                        CapabilityError::ChannelWindowClosed(_) => EscalationReason::ChannelWindowClosed,
                        _ => EscalationReason::CapabilityUnavailable,
                    };
                    // The patient cannot be reached, so no notice goes out.
                    return self
                        .escalate_initiation(session, reason, json!({ "capability": "messaging", "error": e.to_string() }), false)
                        .await;
                }

                info!(
                    "Proposed {} slot(s) to {}",
                    session.proposed_slots.len(),
                    session.session_key
                );
                Ok(InitiationOutcome::Proposed {
                    session_key,
                    session_id,
                    slots: session.proposed_slots.clone(),
                    flagged_unspecified: session.window_flagged_unspecified,
                })
            }
        }
    }

    async fn escalate_initiation(
        &self,
        session: NegotiationSession,
        reason: EscalationReason,
        context: serde_json::Value,
        notify: bool,
    ) -> Result<InitiationOutcome, CoordinatorError> {
        let session_key = session.session_key.clone();
        let session_id = session.session_id;

        let expected = session.phase;
        match self.escalate(session, expected, reason, context, notify).await? {
            Some(_) => Ok(InitiationOutcome::Escalated {
                session_key,
                session_id,
                reason,
            }),
            None => Ok(InitiationOutcome::Superseded { session_key }),
        }
    }

    // ==========================================================================
    // REPLIES
    // ==========================================================================

    #[instrument(skip(self, body))]
    pub async fn on_reply(
        &self,
        from: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ReplyOutcome, CoordinatorError> {
        let identity = PatientIdentity::parse(from)?;
        let session_key = identity.as_str().to_string();

        for pass in 1..=REPLY_PASSES {
            let session = match self.store.get(&session_key).await {
                Ok(session) => session,
                Err(SessionStoreError::NotFound(_)) => {
                    info!("Reply from {} with no pending session", session_key);
                    if self.channel_open(received_at, Utc::now()) {
                        if let Err(e) = self.send(&session_key, &templates::no_pending_appointment()).await {
                            warn!("Could not tell {} there is no pending request: {}", session_key, e);
                        }
                    }
                    return Ok(ReplyOutcome::NoSession { session_key });
                }
                Err(e) => return Err(e.into()),
            };

            match self.process_reply(session, body, received_at).await? {
                Some(outcome) => return Ok(outcome),
                None if pass < REPLY_PASSES => {
                    debug!("Session {} changed while handling reply, reprocessing", session_key);
                }
                None => {}
            }
        }

        warn!(
            "Dropping reply from {} after {} conflicting writes",
            session_key, REPLY_PASSES
        );
        Ok(ReplyOutcome::Superseded { session_key })
    }

    /// One pass over a reply. `None` means the claiming write lost a
    /// compare-and-swap race and the reply should be reprocessed.
    async fn process_reply(
        &self,
        mut session: NegotiationSession,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<ReplyOutcome>, CoordinatorError> {
        let now = Utc::now();
        let expected = session.phase;
        let session_key = session.session_key.clone();
        let channel_open = self.channel_open(received_at, now);

        // A stale reply to a live proposal can no longer be answered.
        if !channel_open && session.phase == NegotiationPhase::Proposed && received_at < session.expires_at {
            return self.escalate_closed_channel(session, expected, received_at, now).await;
        }

        match self.machine.apply_reply(&mut session, body, received_at) {
            ReplyTransition::Ignored { phase } => {
                info!("Reply from {} ignored, session is {}", session_key, phase);
                Ok(Some(ReplyOutcome::Ignored { session_key, phase }))
            }
            ReplyTransition::Expired => {
                let Some(session) = self.persist(&session, expected).await? else {
                    return Ok(None);
                };
                self.reporter
                    .report(
                        &session.session_key,
                        Some(session.session_id),
                        EscalationReason::SessionExpired,
                        json!({ "expires_at": session.expires_at, "received_at": received_at }),
                        channel_open,
                    )
                    .await;
                Ok(Some(ReplyOutcome::Expired { session_key }))
            }
            ReplyTransition::Escalated(reason) => {
                let Some(session) = self.persist(&session, expected).await? else {
                    return Ok(None);
                };
                self.reporter
                    .report(
                        &session.session_key,
                        Some(session.session_id),
                        reason,
                        json!({ "attempt_count": session.attempt_count, "last_reply": body }),
                        channel_open,
                    )
                    .await;
                Ok(Some(ReplyOutcome::Escalated { session_key, reason }))
            }
            ReplyTransition::Reprompt { attempt_count, ambiguous } => {
                let Some(session) = self.persist(&session, expected).await? else {
                    return Ok(None);
                };
                let text = templates::reprompt(&session.proposed_slots, ambiguous);
                if let Err(e) = self.send(&session.session_key, &text).await {
                    warn!("Could not re-prompt {}: {}", session.session_key, e);
                }
                Ok(Some(ReplyOutcome::Reprompted {
                    session_key,
                    attempt_count,
                }))
            }
            ReplyTransition::Selected(slot) => {
                // This write claims the booking; a concurrent reply now loses.
                let Some(session) = self.persist(&session, expected).await? else {
                    return Ok(None);
                };
                info!("{} selected slot {}", session.session_key, slot.ordinal);
                self.book(session, slot).await.map(Some)
            }
        }
    }

    async fn escalate_closed_channel(
        &self,
        session: NegotiationSession,
        expected: NegotiationPhase,
        received_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyOutcome>, CoordinatorError> {
        let session_key = session.session_key.clone();
        let context = json!({ "received_at": received_at, "handled_at": now });

        Ok(self
            .escalate(session, expected, EscalationReason::ChannelWindowClosed, context, false)
            .await?
            .map(|_| ReplyOutcome::Escalated {
                session_key,
                reason: EscalationReason::ChannelWindowClosed,
            }))
    }

    // ==========================================================================
    // BOOKING
    // ==========================================================================

    async fn book(&self, session: NegotiationSession, slot: CandidateSlot) -> Result<ReplyOutcome, CoordinatorError> {
        let session_key = session.session_key.clone();

        if let Some(existing) = self.store.get_booking(session.session_id).await? {
            info!("Session {} already has event {}, finishing", session_key, existing.calendar_event_id);
            return self.finish_booking(session, existing).await;
        }

        let busy = match self.list_busy(&session.calendar_id, &slot.interval).await {
            Ok(busy) => busy,
            Err(e) => return self.escalate_reply(session, EscalationReason::CapabilityUnavailable, &e, true).await,
        };

        if !slot_is_free(&busy, &slot.interval) {
            info!("Slot {} for {} is no longer free", slot.ordinal, session_key);
            return self.regenerate(session, slot).await;
        }

        let summary = templates::event_summary(&session.reason_text);
        let event_id = match self.create_event(&session.calendar_id, &slot.interval, &summary).await {
            Ok(event_id) => event_id,
            Err(CapabilityError::Conflict(detail)) => {
                info!("Calendar rejected slot {} for {}: {}", slot.ordinal, session_key, detail);
                return self.regenerate(session, slot).await;
            }
            Err(e) => return self.escalate_reply(session, EscalationReason::CapabilityUnavailable, &e, true).await,
        };

        let appointment = BookedAppointment {
            session_key: session_key.clone(),
            session_id: session.session_id,
            slot,
            calendar_event_id: event_id,
            summary_text: summary,
            created_at: Utc::now(),
        };

        match self.store.record_booking(&appointment).await {
            Ok(()) => {}
            Err(SessionStoreError::AlreadyExists(_)) => {
                warn!("Booking for session {} was already recorded", appointment.session_id);
            }
            Err(e) => return Err(e.into()),
        }

        self.finish_booking(session, appointment).await
    }

    async fn finish_booking(
        &self,
        mut session: NegotiationSession,
        appointment: BookedAppointment,
    ) -> Result<ReplyOutcome, CoordinatorError> {
        let session_key = session.session_key.clone();
        self.machine.confirm_booked(&mut session, Utc::now())?;

        if self.persist(&session, NegotiationPhase::AwaitingConfirmation).await?.is_none() {
            warn!(
                "Session {} moved on before its booking {} was confirmed",
                session_key, appointment.calendar_event_id
            );
            return Ok(ReplyOutcome::Superseded { session_key });
        }

        if let Err(e) = self.send(&session_key, &templates::confirmation(&appointment)).await {
            warn!("Booked {} but could not send confirmation: {}", session_key, e);
        }

        info!("Session {} booked as event {}", session_key, appointment.calendar_event_id);
        Ok(ReplyOutcome::Booked {
            session_key,
            appointment,
        })
    }

    /// Offer a fresh batch after the selected slot was lost. Everything
    /// offered before is treated as busy so the new batch is disjoint.
    async fn regenerate(&self, mut session: NegotiationSession, lost: CandidateSlot) -> Result<ReplyOutcome, CoordinatorError> {
        let now = Utc::now();
        let session_key = session.session_key.clone();

        let mut busy = Vec::new();
        let mut candidates = Vec::new();
        if let Some(search) = self.search_window(&session.window, now) {
            busy = match self.list_busy(&session.calendar_id, &search).await {
                Ok(busy) => busy,
                Err(e) => return self.escalate_reply(session, EscalationReason::CapabilityUnavailable, &e, true).await,
            };
            busy.push(lost.interval);
            busy.extend(session.offered_intervals.iter().copied());
            candidates = self.reconciler.find_candidate_slots(&busy, &search);
        }

        debug!(
            "Regenerating for {} against {} busy interval(s)",
            session_key,
            busy.len()
        );

        match self.machine.regenerate(&mut session, candidates, now)? {
            ProposalTransition::Escalated(reason) => {
                let Some(session) = self.persist(&session, NegotiationPhase::AwaitingConfirmation).await? else {
                    return Ok(ReplyOutcome::Superseded { session_key });
                };
                self.reporter
                    .report(
                        &session.session_key,
                        Some(session.session_id),
                        reason,
                        json!({ "lost_slot": lost, "regeneration_count": session.regeneration_count }),
                        true,
                    )
                    .await;
                Ok(ReplyOutcome::Escalated { session_key, reason })
            }
            ProposalTransition::Proposed { .. } => {
                let Some(session) = self.persist(&session, NegotiationPhase::AwaitingConfirmation).await? else {
                    return Ok(ReplyOutcome::Superseded { session_key });
                };
                if let Err(e) = self.send(&session.session_key, &templates::regenerated(&session.proposed_slots)).await {
                    warn!("Could not send new options to {}: {}", session.session_key, e);
                }
                Ok(ReplyOutcome::Regenerated {
                    session_key,
                    slots: session.proposed_slots,
                })
            }
        }
    }

    async fn escalate_reply(
        &self,
        session: NegotiationSession,
        reason: EscalationReason,
        error: &CapabilityError,
        notify: bool,
    ) -> Result<ReplyOutcome, CoordinatorError> {
        let session_key = session.session_key.clone();
        let context = json!({ "error": error.to_string() });

        let expected = session.phase;
        Ok(match self.escalate(session, expected, reason, context, notify).await? {
            Some(_) => ReplyOutcome::Escalated { session_key, reason },
            None => ReplyOutcome::Superseded { session_key },
        })
    }

    // ==========================================================================
    // EXPIRY
    // ==========================================================================

    /// Move a session past its deadline to `Expired` and report it. Returns
    /// false when the session was already handled elsewhere.
    pub async fn expire_session(&self, mut session: NegotiationSession, now: DateTime<Utc>) -> Result<bool, CoordinatorError> {
        if !session.is_live() || session.expires_at > now {
            return Ok(false);
        }

        let expected = session.phase;
        self.machine.expire(&mut session, now)?;
        let Some(session) = self.persist(&session, expected).await? else {
            return Ok(false);
        };

        let notify = session
            .last_inbound_at
            .is_some_and(|last| self.channel_open(last, now));
        self.reporter
            .report(
                &session.session_key,
                Some(session.session_id),
                EscalationReason::SessionExpired,
                json!({ "expired_in_phase": expected, "expires_at": session.expires_at }),
                notify,
            )
            .await;

        Ok(true)
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    /// Escalate and persist against the stored `expected` phase; `None`
    /// when the write lost a race.
    async fn escalate(
        &self,
        mut session: NegotiationSession,
        expected: NegotiationPhase,
        reason: EscalationReason,
        context: serde_json::Value,
        notify: bool,
    ) -> Result<Option<NegotiationSession>, CoordinatorError> {
        self.machine.escalate(&mut session, reason, Utc::now())?;

        let Some(session) = self.persist(&session, expected).await? else {
            return Ok(None);
        };

        self.reporter
            .report(&session.session_key, Some(session.session_id), reason, context, notify)
            .await;
        Ok(Some(session))
    }

    /// Compare-and-swap write. `None` on conflict.
    async fn persist(
        &self,
        session: &NegotiationSession,
        expected: NegotiationPhase,
    ) -> Result<Option<NegotiationSession>, CoordinatorError> {
        match self.store.update(session, expected).await {
            Ok(stored) => Ok(Some(stored)),
            Err(SessionStoreError::Conflict { session_key, .. }) => {
                debug!("Lost compare-and-swap on {} (expected {})", session_key, expected);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn channel_open(&self, received_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - received_at <= self.settings.channel_window
    }

    /// The stored window, minus whatever part of it is already in the past.
    fn search_window(&self, window: &TimeInterval, now: DateTime<Utc>) -> Option<TimeInterval> {
        let upcoming = TimeInterval::new(now, window.end()).ok()?;
        window.intersect(&upcoming)
    }

    async fn list_busy(&self, calendar_id: &str, window: &TimeInterval) -> Result<Vec<TimeInterval>, CapabilityError> {
        with_retry(&self.settings.retry, "list_busy_intervals", || {
            self.calendar.list_busy_intervals(calendar_id, window)
        })
        .await
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        interval: &TimeInterval,
        summary: &str,
    ) -> Result<String, CapabilityError> {
        with_retry(&self.settings.retry, "create_event", || {
            self.calendar.create_event(calendar_id, interval, summary)
        })
        .await
    }

    async fn send(&self, to: &str, text: &str) -> Result<String, CapabilityError> {
        with_retry(&self.settings.retry, "send_message", || self.messaging.send_message(to, text)).await
    }
}
