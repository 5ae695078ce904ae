use availability_cell::CandidateSlot;

use negotiation_cell::BookedAppointment;

pub fn format_slot(slot: &CandidateSlot) -> String {
    format!(
        "{}) {}-{} UTC",
        slot.ordinal,
        slot.interval.start().format("%a %d %b %H:%M"),
        slot.interval.end().format("%H:%M")
    )
}

fn slot_lines(slots: &[CandidateSlot]) -> String {
    slots.iter().map(format_slot).collect::<Vec<_>>().join("\n")
}

pub fn proposal(reason_text: &str, slots: &[CandidateSlot]) -> String {
    let reason = if reason_text.trim().is_empty() {
        String::new()
    } else {
        format!(" ({})", reason_text.trim())
    };

    format!(
        "Hello! Your provider would like to see you again for a follow-up visit{}. \
         These times are available:\n{}\nReply with the number of the time that suits you.",
        reason,
        slot_lines(slots)
    )
}

pub fn reprompt(slots: &[CandidateSlot], ambiguous: bool) -> String {
    let lead = if ambiguous {
        "That reply matches more than one time."
    } else {
        "Sorry, we couldn't tell which time you meant."
    };

    format!(
        "{} Please reply with a single number:\n{}",
        lead,
        slot_lines(slots)
    )
}

pub fn regenerated(slots: &[CandidateSlot]) -> String {
    format!(
        "That time was just taken. Here are new options:\n{}\nReply with the number of the time that suits you.",
        slot_lines(slots)
    )
}

pub fn confirmation(appointment: &BookedAppointment) -> String {
    format!(
        "You're booked for {} UTC. See you then!",
        appointment.slot.interval.start().format("%A %d %B at %H:%M")
    )
}

pub fn event_summary(reason_text: &str) -> String {
    if reason_text.trim().is_empty() {
        "Follow-up visit".to_string()
    } else {
        format!("Follow-up visit: {}", reason_text.trim())
    }
}

pub fn no_pending_appointment() -> String {
    "We don't have an appointment request waiting for your reply. \
     If you need to book a visit, please contact the clinic."
        .to_string()
}

pub fn escalation_notice() -> String {
    "Thanks for your patience. A member of our team will contact you to arrange your follow-up visit."
        .to_string()
}
