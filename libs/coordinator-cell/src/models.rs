use std::time::Duration as StdDuration;

use availability_cell::{CandidateSlot, DefaultWindow, WorkingHours};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use negotiation_cell::{BookedAppointment, EscalationReason, NegotiationPhase, NegotiationPolicy};
use shared_config::AppConfig;
use shared_utils::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitiationOutcome {
    /// The classification said no follow-up is needed.
    NotRequired,
    /// A live session already exists for the patient; nothing was sent.
    Duplicate { session_key: String },
    Proposed {
        session_key: String,
        session_id: Uuid,
        slots: Vec<CandidateSlot>,
        flagged_unspecified: bool,
    },
    Escalated {
        session_key: String,
        session_id: Uuid,
        reason: EscalationReason,
    },
    /// Another writer moved the session before the proposal was stored.
    Superseded { session_key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyOutcome {
    NoSession { session_key: String },
    Ignored { session_key: String, phase: NegotiationPhase },
    Expired { session_key: String },
    Reprompted { session_key: String, attempt_count: u32 },
    Booked { session_key: String, appointment: BookedAppointment },
    Regenerated { session_key: String, slots: Vec<CandidateSlot> },
    Escalated { session_key: String, reason: EscalationReason },
    /// The reply lost two compare-and-swap rounds and was dropped.
    Superseded { session_key: String },
}

/// Inbound patient message as delivered by the messaging webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapSummary {
    pub expired: usize,
    pub purged: usize,
}

/// Everything the coordinator needs from configuration, resolved into
/// domain types.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub working_hours: WorkingHours,
    pub slot_duration: Duration,
    pub max_candidates: usize,
    pub default_window: DefaultWindow,
    pub negotiation: NegotiationPolicy,
    pub channel_window: Duration,
    pub retry: RetryPolicy,
    pub default_calendar_id: String,
    pub reaper_interval: StdDuration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            working_hours: WorkingHours::default(),
            slot_duration: Duration::minutes(30),
            max_candidates: 3,
            default_window: DefaultWindow::default(),
            negotiation: NegotiationPolicy::default(),
            channel_window: Duration::hours(24),
            retry: RetryPolicy::default(),
            default_calendar_id: "primary".to_string(),
            reaper_interval: StdDuration::from_secs(60),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let policy = &config.scheduling;

        Self {
            working_hours: WorkingHours {
                start_of_day: policy.workday_start,
                end_of_day: policy.workday_end,
                days: policy.working_days.clone(),
            },
            slot_duration: Duration::minutes(policy.slot_duration_minutes),
            max_candidates: policy.max_candidates,
            default_window: DefaultWindow {
                start_weeks: policy.default_window_start_weeks,
                end_weeks: policy.default_window_end_weeks,
            },
            negotiation: NegotiationPolicy::from_scheduling(policy),
            channel_window: Duration::hours(policy.channel_window_hours),
            retry: RetryPolicy {
                max_attempts: policy.capability_max_attempts,
                base_delay: StdDuration::from_millis(policy.retry_base_delay_ms),
                attempt_timeout: StdDuration::from_secs(policy.capability_timeout_seconds),
            },
            default_calendar_id: config.provider_calendar_id.clone(),
            reaper_interval: StdDuration::from_secs(policy.reaper_interval_seconds.max(1)),
        }
    }
}
