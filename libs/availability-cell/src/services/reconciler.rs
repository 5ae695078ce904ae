use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::models::{CandidateSlot, TimeInterval, WorkingHours};

/// Availability reconciler bound to one provider's scheduling policy.
#[derive(Debug, Clone)]
pub struct AvailabilityReconciler {
    working_hours: WorkingHours,
    slot_duration: Duration,
    max_candidates: usize,
}

impl AvailabilityReconciler {
    pub fn new(working_hours: WorkingHours, slot_duration: Duration, max_candidates: usize) -> Self {
        Self {
            working_hours,
            slot_duration,
            max_candidates,
        }
    }

    pub fn find_candidate_slots(&self, busy: &[TimeInterval], window: &TimeInterval) -> Vec<CandidateSlot> {
        find_candidate_slots(
            busy,
            window,
            &self.working_hours,
            self.slot_duration,
            self.max_candidates,
        )
    }
}

/// Compute up to `max_candidates` free slots of `slot_duration` inside
/// `window` and `working_hours`, earliest first, numbered 1..N.
///
/// An empty result means there is no availability in the window.
pub fn find_candidate_slots(
    busy: &[TimeInterval],
    window: &TimeInterval,
    working_hours: &WorkingHours,
    slot_duration: Duration,
    max_candidates: usize,
) -> Vec<CandidateSlot> {
    if slot_duration <= Duration::zero() || max_candidates == 0 {
        warn!(
            "Refusing to reconcile with slot duration {} and max candidates {}",
            slot_duration, max_candidates
        );
        return Vec::new();
    }

    let merged = merge_busy_intervals(busy);
    let mut candidates: Vec<CandidateSlot> = Vec::with_capacity(max_candidates);

    let mut day = window.start.date_naive();
    let last_day = window.end.date_naive();

    'days: while day <= last_day && candidates.len() < max_candidates {
        let span = working_hours.span_for(day);
        let open = span.and_then(|span| span.intersect(window));

        if let (Some(span), Some(open)) = (span, open) {
            for gap in free_gaps(&open, &merged) {
                let mut start = align_to_grid(gap.start, span.start, slot_duration);
                while start + slot_duration <= gap.end {
                    if candidates.len() >= max_candidates {
                        break 'days;
                    }
                    candidates.push(CandidateSlot {
                        ordinal: candidates.len() as u32 + 1,
                        interval: TimeInterval {
                            start,
                            end: start + slot_duration,
                        },
                    });
                    start += slot_duration;
                }
            }
        }

        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    debug!(
        "Reconciled {} busy interval(s) into {} candidate slot(s) between {} and {}",
        merged.len(),
        candidates.len(),
        window.start,
        window.end
    );

    candidates
}

/// Sort by start (shorter first on ties) and merge overlapping or adjacent
/// intervals.
pub fn merge_busy_intervals(busy: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut sorted = busy.to_vec();
    sorted.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.duration().cmp(&b.duration()))
    });

    let mut merged: Vec<TimeInterval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                if interval.end > last.end {
                    last.end = interval.end;
                }
            }
            _ => merged.push(interval),
        }
    }

    merged
}

/// Whether `slot` is clear of every busy interval.
pub fn slot_is_free(busy: &[TimeInterval], slot: &TimeInterval) -> bool {
    !busy.iter().any(|interval| interval.overlaps(slot))
}

/// First instant at or after `instant` lying on the `step` grid that starts
/// at `origin`.
fn align_to_grid(instant: DateTime<Utc>, origin: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    if instant <= origin {
        return origin;
    }
    match ((instant - origin).num_nanoseconds(), step.num_nanoseconds()) {
        (Some(elapsed), Some(step)) if step > 0 => {
            let steps = elapsed / step + i64::from(elapsed % step != 0);
            origin + Duration::nanoseconds(steps * step)
        }
        _ => instant,
    }
}

// Complement of `merged` (sorted, disjoint) within `open`.
fn free_gaps(open: &TimeInterval, merged: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut gaps = Vec::new();
    let mut cursor = open.start;

    for busy in merged {
        if busy.end <= cursor {
            continue;
        }
        if busy.start >= open.end {
            break;
        }
        if busy.start > cursor {
            gaps.push(TimeInterval {
                start: cursor,
                end: busy.start,
            });
        }
        cursor = cursor.max(busy.end);
        if cursor >= open.end {
            break;
        }
    }

    if cursor < open.end {
        gaps.push(TimeInterval {
            start: cursor,
            end: open.end,
        });
    }

    gaps
}
