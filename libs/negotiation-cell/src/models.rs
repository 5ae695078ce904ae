use std::fmt;

use availability_cell::{CandidateSlot, DesiredWindow, IntervalSpec, TimeInterval};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NegotiationError;

const CHANNEL_PREFIXES: &[&str] = &["whatsapp:", "sms:", "tel:", "unverified:"];
const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

// ==============================================================================
// PATIENT IDENTITY
// ==============================================================================

/// Normalized messaging-channel handle used as the session key.
///
/// Phone-like handles with 8 to 15 digits normalize to `+<digits>` and are
/// marked verified. Anything else is kept as `unverified:<text>` so that the
/// same raw handle always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientIdentity {
    value: String,
    verified: bool,
}

impl PatientIdentity {
    pub fn parse(raw: &str) -> Result<Self, NegotiationError> {
        let mut handle = raw.trim();
        for prefix in CHANNEL_PREFIXES {
            let matches_prefix = handle
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
            if matches_prefix {
                handle = handle[prefix.len()..].trim();
                break;
            }
        }

        if handle.is_empty() {
            return Err(NegotiationError::ValidationError(
                "Patient identity must not be empty".to_string(),
            ));
        }

        let phone_like = handle
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.' | ' '));
        let mut digits: String = handle.chars().filter(|c| c.is_ascii_digit()).collect();
        if !handle.starts_with('+') && digits.starts_with("00") {
            digits.drain(..2);
        }

        if phone_like && (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
            return Ok(Self {
                value: format!("+{}", digits),
                verified: true,
            });
        }

        let fallback = if phone_like && !digits.is_empty() {
            digits
        } else {
            handle.to_lowercase()
        };

        Ok(Self {
            value: format!("unverified:{}", fallback),
            verified: false,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }
}

impl fmt::Display for PatientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ==============================================================================
// PHASES AND ESCALATION REASONS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    Initiated,
    Proposed,
    AwaitingConfirmation,
    Booked,
    Expired,
    Escalated,
}

impl NegotiationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationPhase::Booked | NegotiationPhase::Expired | NegotiationPhase::Escalated
        )
    }

    pub fn can_transition_to(&self, target: &NegotiationPhase) -> bool {
        use NegotiationPhase::*;
        match (self, target) {
            (Initiated, Proposed) => true,
            (Proposed, Proposed) => true,
            (Proposed, AwaitingConfirmation) => true,
            (AwaitingConfirmation, Booked) => true,
            (AwaitingConfirmation, Proposed) => true,
            (_, Escalated) => !self.is_terminal(),
            (_, Expired) => !self.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPhase::Initiated => "initiated",
            NegotiationPhase::Proposed => "proposed",
            NegotiationPhase::AwaitingConfirmation => "awaiting_confirmation",
            NegotiationPhase::Booked => "booked",
            NegotiationPhase::Expired => "expired",
            NegotiationPhase::Escalated => "escalated",
        }
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    NoAvailability,
    RetriesExhausted,
    ChannelWindowClosed,
    BookingConflictExhausted,
    CapabilityUnavailable,
    SessionExpired,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::NoAvailability => "no_availability",
            EscalationReason::RetriesExhausted => "retries_exhausted",
            EscalationReason::ChannelWindowClosed => "channel_window_closed",
            EscalationReason::BookingConflictExhausted => "booking_conflict_exhausted",
            EscalationReason::CapabilityUnavailable => "capability_unavailable",
            EscalationReason::SessionExpired => "session_expired",
        }
    }

    /// A closed channel cannot carry the "we'll contact you" message.
    pub fn allows_notification(&self) -> bool {
        !matches!(self, EscalationReason::ChannelWindowClosed)
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// INITIATION EVENT
// ==============================================================================

/// Structured output of the upstream note classification step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpRequest {
    pub patient_identity: String,
    pub required: bool,
    #[serde(default)]
    pub reason_text: String,
    #[serde(default = "unspecified_interval")]
    pub interval: IntervalSpec,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_calendar_id: Option<String>,
}

fn unspecified_interval() -> IntervalSpec {
    IntervalSpec::Unspecified
}

// ==============================================================================
// SESSION
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSession {
    pub session_key: String,
    pub session_id: Uuid,
    pub phase: NegotiationPhase,
    /// Compare-and-swap token, bumped by every store write.
    pub revision: u64,
    pub proposed_slots: Vec<CandidateSlot>,
    /// Every interval proposed in any batch of this session.
    #[serde(default)]
    pub offered_intervals: Vec<TimeInterval>,
    pub selected_slot: Option<CandidateSlot>,
    pub attempt_count: u32,
    pub batch: u32,
    pub regeneration_count: u32,
    pub window: TimeInterval,
    pub window_flagged_unspecified: bool,
    pub reason_text: String,
    pub calendar_id: String,
    pub escalation: Option<EscalationReason>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl NegotiationSession {
    /// A fresh `Initiated` session. It expires after `ttl` unless a proposal
    /// pushes the deadline out.
    pub fn open(
        identity: &PatientIdentity,
        window: &DesiredWindow,
        reason_text: impl Into<String>,
        calendar_id: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            session_key: identity.as_str().to_string(),
            session_id: Uuid::new_v4(),
            phase: NegotiationPhase::Initiated,
            revision: 0,
            proposed_slots: Vec::new(),
            offered_intervals: Vec::new(),
            selected_slot: None,
            attempt_count: 0,
            batch: 0,
            regeneration_count: 0,
            window: window.interval,
            window_flagged_unspecified: window.flagged_unspecified,
            reason_text: reason_text.into(),
            calendar_id: calendar_id.into(),
            escalation: None,
            created_at: now,
            last_activity_at: now,
            last_inbound_at: None,
            expires_at: now + ttl,
            closed_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.phase.is_terminal()
    }

    pub fn slot_by_ordinal(&self, ordinal: u32) -> Option<&CandidateSlot> {
        self.proposed_slots.iter().find(|slot| slot.ordinal == ordinal)
    }

    /// Highest ordinal handed out so far; the next batch continues after it.
    pub fn highest_ordinal(&self) -> u32 {
        self.proposed_slots
            .iter()
            .map(|slot| slot.ordinal)
            .max()
            .unwrap_or(0)
    }
}

/// Committed calendar booking, written once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookedAppointment {
    pub session_key: String,
    pub session_id: Uuid,
    pub slot: CandidateSlot,
    pub calendar_event_id: String,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}
