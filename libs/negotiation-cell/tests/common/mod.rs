#![allow(dead_code)]

use availability_cell::{CandidateSlot, DesiredWindow, TimeInterval};
use chrono::{DateTime, Duration, TimeZone, Utc};

use negotiation_cell::*;

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn slot(ordinal: u32, start: DateTime<Utc>) -> CandidateSlot {
    CandidateSlot {
        ordinal,
        interval: TimeInterval::new(start, start + Duration::minutes(30)).unwrap(),
    }
}

/// Three morning slots on 2025-02-05: 09:00, 09:30, 10:30.
pub fn three_slots() -> Vec<CandidateSlot> {
    vec![
        slot(1, at(2025, 2, 5, 9, 0)),
        slot(2, at(2025, 2, 5, 9, 30)),
        slot(3, at(2025, 2, 5, 10, 30)),
    ]
}

pub fn test_window() -> DesiredWindow {
    DesiredWindow {
        interval: TimeInterval::new(at(2025, 1, 29, 0, 0), at(2025, 2, 12, 0, 0)).unwrap(),
        flagged_unspecified: false,
    }
}

pub fn session_for(handle: &str, now: DateTime<Utc>) -> NegotiationSession {
    let identity = PatientIdentity::parse(handle).unwrap();
    NegotiationSession::open(
        &identity,
        &test_window(),
        "Blood pressure review",
        "primary",
        now,
        Duration::hours(72),
    )
}

pub fn proposed_session(handle: &str, now: DateTime<Utc>) -> NegotiationSession {
    let machine = NegotiationStateMachine::default();
    let mut session = session_for(handle, now);
    machine.propose(&mut session, three_slots(), now).unwrap();
    session
}
