mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Days, Duration, NaiveTime, Timelike, Utc, Weekday};

use availability_cell::{DefaultWindow, IntervalSpec, TimeInterval, WorkingHours};
use common::{follow_up, test_settings, Harness, YieldingStore, PATIENT, PATIENT_KEY};
use coordinator_cell::{CapabilityError, CoordinatorSettings, InitiationOutcome, ReplyOutcome};
use negotiation_cell::{EscalationReason, FollowUpRequest, NegotiationPhase};

async fn proposed(harness: &Harness) -> Vec<availability_cell::CandidateSlot> {
    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();
    match outcome {
        InitiationOutcome::Proposed { slots, .. } => slots,
        other => panic!("Expected a proposal, got {:?}", other),
    }
}

#[tokio::test]
async fn initiation_proposes_ordered_slots_and_messages_the_patient() {
    let harness = Harness::new();

    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();

    let slots = assert_matches!(
        outcome,
        InitiationOutcome::Proposed { session_key, slots, flagged_unspecified: false, .. } => {
            assert_eq!(session_key, PATIENT_KEY);
            slots
        }
    );
    assert_eq!(slots.len(), 3);
    assert_eq!(slots.iter().map(|s| s.ordinal).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(slots.iter().all(|s| s.interval.start() >= Utc::now() - Duration::minutes(1)));

    let session = harness.session().await;
    assert_eq!(session.phase, NegotiationPhase::Proposed);
    assert_eq!(session.calendar_id, "dr-lee");

    let sent = harness.messaging.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, PATIENT_KEY);
    assert!(sent[0].text.contains("1) "));
    assert!(sent[0].text.contains("blood pressure review"));
}

#[tokio::test]
async fn follow_up_not_required_does_nothing() {
    let harness = Harness::new();
    let mut request = follow_up(PATIENT);
    request.required = false;

    let outcome = harness.coordinator.on_initiation(request).await.unwrap();

    assert_eq!(outcome, InitiationOutcome::NotRequired);
    assert!(harness.messaging.sent().is_empty());
    assert_eq!(harness.calendar.busy_calls(), 0);
}

#[tokio::test]
async fn duplicate_initiation_is_ignored_while_session_is_live() {
    let harness = Harness::new();
    proposed(&harness).await;

    let outcome = harness
        .coordinator
        .on_initiation(follow_up("+1 555 010 2030"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        InitiationOutcome::Duplicate {
            session_key: PATIENT_KEY.to_string()
        }
    );
    assert_eq!(harness.messaging.sent().len(), 1);
}

#[tokio::test]
async fn empty_identity_is_rejected() {
    let harness = Harness::new();

    let result = harness.coordinator.on_initiation(follow_up("  ")).await;

    assert_matches!(result, Err(coordinator_cell::CoordinatorError::ValidationError(_)));
}

#[tokio::test]
async fn fully_booked_calendar_escalates_with_no_availability() {
    let harness = Harness::new();
    let now = Utc::now();
    harness
        .calendar
        .add_busy(TimeInterval::new(now - Duration::days(1), now + Duration::days(30)).unwrap());

    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();

    assert_matches!(
        outcome,
        InitiationOutcome::Escalated {
            reason: EscalationReason::NoAvailability,
            ..
        }
    );
    assert_eq!(harness.session().await.phase, NegotiationPhase::Escalated);

    let records = harness.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, EscalationReason::NoAvailability);
    assert!(records[0].notified);
}

#[tokio::test]
async fn unavailable_calendar_escalates_after_retries() {
    let harness = Harness::new();
    harness.calendar.set_unavailable(true);

    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();

    assert_matches!(
        outcome,
        InitiationOutcome::Escalated {
            reason: EscalationReason::CapabilityUnavailable,
            ..
        }
    );
    assert_eq!(harness.calendar.busy_calls(), 2);
}

#[tokio::test]
async fn closed_channel_on_proposal_escalates_without_notice() {
    let harness = Harness::new();
    harness
        .messaging
        .fail_with(Some(CapabilityError::ChannelWindowClosed("outside 24h window".to_string())));

    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();

    assert_matches!(
        outcome,
        InitiationOutcome::Escalated {
            reason: EscalationReason::ChannelWindowClosed,
            ..
        }
    );
    let records = harness.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].notified);
    assert_eq!(harness.session().await.escalation, Some(EscalationReason::ChannelWindowClosed));
}

#[tokio::test]
async fn reply_selecting_a_slot_books_it() {
    let harness = Harness::new();
    let slots = proposed(&harness).await;

    let outcome = harness.coordinator.on_reply(PATIENT, "2", Utc::now()).await.unwrap();

    let appointment = assert_matches!(outcome, ReplyOutcome::Booked { appointment, .. } => appointment);
    assert_eq!(appointment.slot, slots[1]);
    assert_eq!(appointment.calendar_event_id, "evt-1");

    let created = harness.calendar.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].interval, slots[1].interval);
    assert_eq!(created[0].calendar_id, "dr-lee");
    assert_eq!(created[0].summary, "Follow-up visit: blood pressure review");

    let session = harness.session().await;
    assert_eq!(session.phase, NegotiationPhase::Booked);
    assert_eq!(session.selected_slot, Some(slots[1].clone()));

    let booking = harness.store.get_booking(session.session_id).await.unwrap();
    assert_eq!(booking, Some(appointment));
    assert!(harness.messaging.last_text().unwrap().starts_with("You're booked"));
}

#[tokio::test]
async fn unreadable_replies_escalate_without_touching_the_calendar() {
    let harness = Harness::new();
    proposed(&harness).await;

    let first = harness.coordinator.on_reply(PATIENT, "banana", Utc::now()).await.unwrap();
    assert_matches!(first, ReplyOutcome::Reprompted { attempt_count: 1, .. });
    assert!(harness.messaging.last_text().unwrap().starts_with("Sorry"));

    let second = harness.coordinator.on_reply(PATIENT, "banana", Utc::now()).await.unwrap();
    assert_matches!(
        second,
        ReplyOutcome::Escalated {
            reason: EscalationReason::RetriesExhausted,
            ..
        }
    );

    assert!(harness.calendar.created().is_empty());
    assert_eq!(harness.session().await.phase, NegotiationPhase::Escalated);
    assert_eq!(harness.ledger.records().await.len(), 1);
}

#[tokio::test]
async fn ambiguous_reply_reprompts_with_ambiguity_notice() {
    let harness = Harness::new();
    proposed(&harness).await;

    let outcome = harness
        .coordinator
        .on_reply(PATIENT, "either 1 or 3 works", Utc::now())
        .await
        .unwrap();

    assert_matches!(outcome, ReplyOutcome::Reprompted { attempt_count: 1, .. });
    assert!(harness.messaging.last_text().unwrap().contains("more than one"));
    assert_eq!(harness.session().await.phase, NegotiationPhase::Proposed);
}

#[tokio::test]
async fn slot_taken_before_booking_regenerates_a_disjoint_batch() {
    let harness = Harness::new();
    let original = proposed(&harness).await;
    harness.calendar.add_busy(original[1].interval);

    let outcome = harness.coordinator.on_reply(PATIENT, "2", Utc::now()).await.unwrap();

    let fresh = assert_matches!(outcome, ReplyOutcome::Regenerated { slots, .. } => slots);
    assert_eq!(fresh.iter().map(|s| s.ordinal).collect::<Vec<_>>(), vec![4, 5, 6]);
    for slot in &fresh {
        assert!(original.iter().all(|old| !old.interval.overlaps(&slot.interval)));
    }
    assert!(harness.calendar.created().is_empty());

    let session = harness.session().await;
    assert_eq!(session.phase, NegotiationPhase::Proposed);
    assert_eq!(session.regeneration_count, 1);
    assert_eq!(session.selected_slot, None);
    assert_eq!(session.proposed_slots, fresh);
    assert!(harness.messaging.last_text().unwrap().contains("4) "));

    // The old ordinal no longer resolves; the new one books.
    let booked = harness.coordinator.on_reply(PATIENT, "5", Utc::now()).await.unwrap();
    let appointment = assert_matches!(booked, ReplyOutcome::Booked { appointment, .. } => appointment);
    assert_eq!(appointment.slot, fresh[1]);
}

#[tokio::test]
async fn calendar_conflict_on_create_regenerates() {
    let harness = Harness::new();
    let original = proposed(&harness).await;
    harness.calendar.raise_conflicts(1);

    let outcome = harness.coordinator.on_reply(PATIENT, "first", Utc::now()).await.unwrap();

    let fresh = assert_matches!(outcome, ReplyOutcome::Regenerated { slots, .. } => slots);
    assert!(fresh.iter().all(|slot| slot.interval != original[0].interval));
    assert!(harness.calendar.created().is_empty());
}

#[tokio::test]
async fn repeated_conflicts_exhaust_the_regeneration_budget() {
    let harness = Harness::new();
    proposed(&harness).await;
    harness.calendar.raise_conflicts(10);

    let first = harness.coordinator.on_reply(PATIENT, "1", Utc::now()).await.unwrap();
    let slots = assert_matches!(first, ReplyOutcome::Regenerated { slots, .. } => slots);
    let second = harness
        .coordinator
        .on_reply(PATIENT, &slots[0].ordinal.to_string(), Utc::now())
        .await
        .unwrap();
    let slots = assert_matches!(second, ReplyOutcome::Regenerated { slots, .. } => slots);
    let third = harness
        .coordinator
        .on_reply(PATIENT, &slots[0].ordinal.to_string(), Utc::now())
        .await
        .unwrap();

    assert_matches!(
        third,
        ReplyOutcome::Escalated {
            reason: EscalationReason::BookingConflictExhausted,
            ..
        }
    );
    assert_eq!(harness.session().await.phase, NegotiationPhase::Escalated);
}

#[tokio::test]
async fn selection_outside_channel_window_escalates_instead_of_booking() {
    let harness = Harness::new();
    proposed(&harness).await;
    let stale = Utc::now() - Duration::hours(25);

    let outcome = harness.coordinator.on_reply(PATIENT, "1", stale).await.unwrap();

    assert_matches!(
        outcome,
        ReplyOutcome::Escalated {
            reason: EscalationReason::ChannelWindowClosed,
            ..
        }
    );
    assert!(harness.calendar.created().is_empty());
    let records = harness.ledger.records().await;
    assert!(!records[0].notified);
    assert_eq!(harness.messaging.sent().len(), 1);
}

#[tokio::test]
async fn reply_with_no_session_gets_a_polite_answer() {
    let harness = Harness::new();

    let outcome = harness.coordinator.on_reply("sms:+44 20 7946 0000", "2", Utc::now()).await.unwrap();

    assert_eq!(
        outcome,
        ReplyOutcome::NoSession {
            session_key: "+442079460000".to_string()
        }
    );
    let sent = harness.messaging.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("don't have an appointment request"));
}

#[tokio::test]
async fn reply_after_deadline_expires_the_session() {
    let harness = Harness::new();
    proposed(&harness).await;
    let deadline = harness.session().await.expires_at;

    let outcome = harness
        .coordinator
        .on_reply(PATIENT, "1", deadline + Duration::minutes(5))
        .await
        .unwrap();

    assert_matches!(outcome, ReplyOutcome::Expired { .. });
    assert_eq!(harness.session().await.phase, NegotiationPhase::Expired);
    assert_eq!(harness.ledger.records().await[0].reason, EscalationReason::SessionExpired);
    assert!(harness.calendar.created().is_empty());
}

#[tokio::test]
async fn replies_after_booking_are_ignored() {
    let harness = Harness::new();
    proposed(&harness).await;
    harness.coordinator.on_reply(PATIENT, "1", Utc::now()).await.unwrap();

    let outcome = harness.coordinator.on_reply(PATIENT, "2", Utc::now()).await.unwrap();

    assert_matches!(
        outcome,
        ReplyOutcome::Ignored {
            phase: NegotiationPhase::Booked,
            ..
        }
    );
    assert_eq!(harness.calendar.created().len(), 1);
}

#[tokio::test]
async fn new_follow_up_replaces_a_closed_session() {
    let harness = Harness::new();
    proposed(&harness).await;
    harness.coordinator.on_reply(PATIENT, "1", Utc::now()).await.unwrap();
    let booked_id = harness.session().await.session_id;

    let outcome = harness.coordinator.on_initiation(follow_up(PATIENT)).await.unwrap();

    let session_id = assert_matches!(outcome, InitiationOutcome::Proposed { session_id, .. } => session_id);
    assert_ne!(session_id, booked_id);
}

#[tokio::test]
async fn concurrent_replies_book_exactly_once() {
    let harness = Harness::with_store(Arc::new(YieldingStore::new()));
    proposed(&harness).await;

    let (a, b) = tokio::join!(
        harness.coordinator.on_reply(PATIENT, "2", Utc::now()),
        harness.coordinator.on_reply(PATIENT, "3", Utc::now()),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let booked = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, ReplyOutcome::Booked { .. }))
        .count();
    assert_eq!(booked, 1, "outcomes: {:?}", outcomes);
    assert!(outcomes.iter().any(|outcome| matches!(outcome, ReplyOutcome::Ignored { .. })));

    assert_eq!(harness.calendar.created().len(), 1);
    assert_eq!(harness.session().await.phase, NegotiationPhase::Booked);
}

#[tokio::test]
async fn duplicate_delivery_of_the_same_reply_books_once() {
    let harness = Harness::with_store(Arc::new(YieldingStore::new()));
    proposed(&harness).await;
    let received_at = Utc::now();

    let (a, b) = tokio::join!(
        harness.coordinator.on_reply(PATIENT, "1", received_at),
        harness.coordinator.on_reply(PATIENT, "1", received_at),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(harness.calendar.created().len(), 1);
    assert_eq!(harness.session().await.phase, NegotiationPhase::Booked);
}

#[tokio::test]
async fn proposed_slots_sit_on_the_slot_grid() {
    let settings = CoordinatorSettings {
        working_hours: WorkingHours {
            start_of_day: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end_of_day: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
        },
        ..test_settings()
    };
    let harness = Harness::with_settings(settings);
    let before = Utc::now();

    let slots = proposed(&harness).await;

    assert_eq!(slots.len(), 3);
    for slot in &slots {
        let start = slot.interval.start();
        assert!(start >= before, "slot {} starts in the past", start);
        assert_eq!(start.second(), 0, "slot {} is off the grid", start);
        assert_eq!(start.nanosecond(), 0, "slot {} is off the grid", start);
        assert_eq!(start.minute() % 30, 0, "slot {} is off the grid", start);
    }
    let booked = harness.coordinator.on_reply(PATIENT, "1", Utc::now()).await.unwrap();
    assert_matches!(booked, ReplyOutcome::Booked { .. });
    assert_eq!(harness.calendar.created()[0].interval, slots[0].interval);
}

#[tokio::test]
async fn stale_unreadable_reply_escalates_as_closed_channel() {
    let harness = Harness::new();
    proposed(&harness).await;

    let first = harness.coordinator.on_reply(PATIENT, "banana", Utc::now()).await.unwrap();
    assert_matches!(first, ReplyOutcome::Reprompted { attempt_count: 1, .. });
    let sent_before = harness.messaging.sent().len();

    let stale = Utc::now() - Duration::hours(25);
    let second = harness.coordinator.on_reply(PATIENT, "banana", stale).await.unwrap();

    assert_matches!(
        second,
        ReplyOutcome::Escalated {
            reason: EscalationReason::ChannelWindowClosed,
            ..
        }
    );
    let session = harness.session().await;
    assert_eq!(session.phase, NegotiationPhase::Escalated);
    assert_eq!(session.escalation, Some(EscalationReason::ChannelWindowClosed));
    let records = harness.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].notified);
    assert_eq!(harness.messaging.sent().len(), sent_before);
}

#[tokio::test]
async fn unspecified_interval_uses_the_default_window_and_is_flagged() {
    let harness = Harness::new();
    let request = FollowUpRequest {
        interval: IntervalSpec::Unspecified,
        ..follow_up(PATIENT)
    };
    let today = request.created_at.date_naive();

    let outcome = harness.coordinator.on_initiation(request).await.unwrap();

    let slots = assert_matches!(
        outcome,
        InitiationOutcome::Proposed { slots, flagged_unspecified: true, .. } => slots
    );
    let session = harness.session().await;
    assert!(session.window_flagged_unspecified);

    let defaults = DefaultWindow::default();
    let expected_start = (today + Days::new(7 * defaults.start_weeks as u64)).and_hms_opt(0, 0, 0).unwrap().and_utc();
    let expected_end = (today + Days::new(7 * defaults.end_weeks as u64)).and_hms_opt(0, 0, 0).unwrap().and_utc();
    assert_eq!(session.window.start(), expected_start);
    assert_eq!(session.window.end(), expected_end);
    assert!(slots.iter().all(|slot| slot.interval.start() >= expected_start));
}

#[tokio::test]
async fn unbounded_interval_uses_the_default_window_without_the_flag() {
    let harness = Harness::new();
    let request = FollowUpRequest {
        interval: IntervalSpec::Unbounded,
        ..follow_up(PATIENT)
    };

    let outcome = harness.coordinator.on_initiation(request).await.unwrap();

    assert_matches!(outcome, InitiationOutcome::Proposed { flagged_unspecified: false, .. });
    assert!(!harness.session().await.window_flagged_unspecified);
}

#[tokio::test]
async fn second_regeneration_never_reoffers_the_first_batch() {
    let harness = Harness::new();
    let first_batch = proposed(&harness).await;
    harness.calendar.raise_conflicts(2);

    let first = harness.coordinator.on_reply(PATIENT, "1", Utc::now()).await.unwrap();
    let second_batch = assert_matches!(first, ReplyOutcome::Regenerated { slots, .. } => slots);
    let second = harness
        .coordinator
        .on_reply(PATIENT, &second_batch[0].ordinal.to_string(), Utc::now())
        .await
        .unwrap();
    let third_batch = assert_matches!(second, ReplyOutcome::Regenerated { slots, .. } => slots);

    assert_eq!(third_batch.iter().map(|s| s.ordinal).collect::<Vec<_>>(), vec![7, 8, 9]);
    for slot in &third_batch {
        assert!(
            first_batch.iter().chain(&second_batch).all(|old| !old.interval.overlaps(&slot.interval)),
            "slot {:?} was offered before",
            slot.interval
        );
    }
    assert_eq!(harness.session().await.offered_intervals.len(), 9);
}
