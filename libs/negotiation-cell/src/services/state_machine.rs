use availability_cell::CandidateSlot;
use chrono::{DateTime, Duration, Utc};
use shared_config::SchedulingPolicy;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::models::{EscalationReason, NegotiationPhase, NegotiationSession};
use crate::services::reply::{ReplyResolution, ReplyResolver};

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationPolicy {
    pub max_reply_attempts: u32,
    pub max_regenerations: u32,
    pub session_ttl: Duration,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            max_reply_attempts: 2,
            max_regenerations: 2,
            session_ttl: Duration::hours(72),
        }
    }
}

impl NegotiationPolicy {
    pub fn from_scheduling(policy: &SchedulingPolicy) -> Self {
        Self {
            max_reply_attempts: policy.max_reply_attempts.max(1),
            max_regenerations: policy.max_regenerations,
            session_ttl: Duration::hours(policy.session_ttl_hours),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProposalTransition {
    Proposed { batch: u32 },
    Escalated(EscalationReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyTransition {
    /// Terminal session, or a booking already in progress. Nothing changed.
    Ignored { phase: NegotiationPhase },
    /// The reply arrived after the session deadline; the session is now expired.
    Expired,
    Selected(CandidateSlot),
    Reprompt { attempt_count: u32, ambiguous: bool },
    Escalated(EscalationReason),
}

/// Pure transition logic for one negotiation. Every method mutates the
/// session in place and performs no I/O; persistence and side effects
/// belong to the caller.
#[derive(Debug, Clone, Default)]
pub struct NegotiationStateMachine {
    policy: NegotiationPolicy,
    resolver: ReplyResolver,
}

impl NegotiationStateMachine {
    pub fn new(policy: NegotiationPolicy) -> Self {
        Self {
            policy,
            resolver: ReplyResolver::new(),
        }
    }

    /// Initiated → Proposed with the first batch, or → Escalated when there
    /// is nothing to offer.
    pub fn propose(
        &self,
        session: &mut NegotiationSession,
        candidates: Vec<CandidateSlot>,
        now: DateTime<Utc>,
    ) -> Result<ProposalTransition, NegotiationError> {
        if session.phase != NegotiationPhase::Initiated {
            return Err(NegotiationError::InvalidTransition {
                from: session.phase,
                to: NegotiationPhase::Proposed,
            });
        }

        if candidates.is_empty() {
            self.escalate(session, EscalationReason::NoAvailability, now)?;
            return Ok(ProposalTransition::Escalated(EscalationReason::NoAvailability));
        }

        self.install_batch(session, candidates, now);
        Ok(ProposalTransition::Proposed { batch: session.batch })
    }

    /// AwaitingConfirmation → Proposed after the selected slot was lost to a
    /// concurrent booking. Spends one unit of the regeneration budget.
    pub fn regenerate(
        &self,
        session: &mut NegotiationSession,
        candidates: Vec<CandidateSlot>,
        now: DateTime<Utc>,
    ) -> Result<ProposalTransition, NegotiationError> {
        if session.phase != NegotiationPhase::AwaitingConfirmation {
            return Err(NegotiationError::InvalidTransition {
                from: session.phase,
                to: NegotiationPhase::Proposed,
            });
        }

        if session.regeneration_count >= self.policy.max_regenerations {
            warn!(
                "Session {} lost {} booking race(s), regeneration budget spent",
                session.session_key, session.regeneration_count
            );
            self.escalate(session, EscalationReason::BookingConflictExhausted, now)?;
            return Ok(ProposalTransition::Escalated(EscalationReason::BookingConflictExhausted));
        }

        if candidates.is_empty() {
            self.escalate(session, EscalationReason::NoAvailability, now)?;
            return Ok(ProposalTransition::Escalated(EscalationReason::NoAvailability));
        }

        session.regeneration_count += 1;
        self.install_batch(session, candidates, now);
        Ok(ProposalTransition::Proposed { batch: session.batch })
    }

    pub fn apply_reply(
        &self,
        session: &mut NegotiationSession,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> ReplyTransition {
        if session.phase.is_terminal() {
            info!(
                "Ignoring late reply for {} session {}",
                session.phase, session.session_key
            );
            return ReplyTransition::Ignored { phase: session.phase };
        }

        if received_at >= session.expires_at {
            info!(
                "Reply for session {} arrived after its deadline {}",
                session.session_key, session.expires_at
            );
            session.last_inbound_at = Some(received_at);
            close(session, NegotiationPhase::Expired, received_at);
            return ReplyTransition::Expired;
        }

        if session.phase != NegotiationPhase::Proposed {
            debug!(
                "Session {} is {}, reply not applicable",
                session.session_key, session.phase
            );
            return ReplyTransition::Ignored { phase: session.phase };
        }

        session.last_inbound_at = Some(received_at);
        session.last_activity_at = received_at;

        let ambiguous = match self.resolver.resolve(body, &session.proposed_slots) {
            ReplyResolution::Selected(slot) => {
                session.selected_slot = Some(slot.clone());
                session.phase = NegotiationPhase::AwaitingConfirmation;
                return ReplyTransition::Selected(slot);
            }
            ReplyResolution::Ambiguous(_) => true,
            ReplyResolution::Unresolved => false,
        };

        session.attempt_count += 1;
        if session.attempt_count >= self.policy.max_reply_attempts {
            close(session, NegotiationPhase::Escalated, received_at);
            session.escalation = Some(EscalationReason::RetriesExhausted);
            return ReplyTransition::Escalated(EscalationReason::RetriesExhausted);
        }

        ReplyTransition::Reprompt {
            attempt_count: session.attempt_count,
            ambiguous,
        }
    }

    /// AwaitingConfirmation → Booked once the calendar event exists.
    pub fn confirm_booked(&self, session: &mut NegotiationSession, now: DateTime<Utc>) -> Result<(), NegotiationError> {
        if session.phase != NegotiationPhase::AwaitingConfirmation || session.selected_slot.is_none() {
            return Err(NegotiationError::InvalidTransition {
                from: session.phase,
                to: NegotiationPhase::Booked,
            });
        }
        close(session, NegotiationPhase::Booked, now);
        Ok(())
    }

    pub fn escalate(
        &self,
        session: &mut NegotiationSession,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) -> Result<(), NegotiationError> {
        ensure_transition(session, NegotiationPhase::Escalated)?;
        close(session, NegotiationPhase::Escalated, now);
        session.escalation = Some(reason);
        Ok(())
    }

    pub fn expire(&self, session: &mut NegotiationSession, now: DateTime<Utc>) -> Result<(), NegotiationError> {
        ensure_transition(session, NegotiationPhase::Expired)?;
        close(session, NegotiationPhase::Expired, now);
        Ok(())
    }

    fn install_batch(&self, session: &mut NegotiationSession, candidates: Vec<CandidateSlot>, now: DateTime<Utc>) {
        let offset = session.highest_ordinal();
        session.proposed_slots = candidates
            .into_iter()
            .enumerate()
            .map(|(index, slot)| CandidateSlot {
                ordinal: offset + index as u32 + 1,
                interval: slot.interval,
            })
            .collect();
        session
            .offered_intervals
            .extend(session.proposed_slots.iter().map(|slot| slot.interval));
        session.selected_slot = None;
        session.batch += 1;
        session.phase = NegotiationPhase::Proposed;
        session.last_activity_at = now;
        session.expires_at = now + self.policy.session_ttl;

        debug!(
            "Session {} proposed batch {} with ordinals {}..={}",
            session.session_key,
            session.batch,
            offset + 1,
            session.highest_ordinal()
        );
    }
}

fn ensure_transition(session: &NegotiationSession, target: NegotiationPhase) -> Result<(), NegotiationError> {
    if session.phase.can_transition_to(&target) {
        Ok(())
    } else {
        Err(NegotiationError::InvalidTransition {
            from: session.phase,
            to: target,
        })
    }
}

fn close(session: &mut NegotiationSession, phase: NegotiationPhase, now: DateTime<Utc>) {
    session.phase = phase;
    session.last_activity_at = now;
    session.closed_at = Some(now);
}
