use std::collections::BTreeSet;
use std::sync::LazyLock;

use availability_cell::CandidateSlot;
use chrono::Timelike;
use regex::Regex;
use tracing::debug;

/// Clock times such as "10:30", "10am", "2:30 p.m." or "14:00".
static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?::([0-5]\d))?(?:\s*([ap])\.?m\b\.?)?").unwrap()
});

/// Digit tokens ("2", "#2", "2nd") and plain words.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#?\d+(?:st|nd|rd|th)?|[a-z]+").unwrap());

const NUMBER_WORDS: &[(&str, u32)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
];

const POSITION_WORDS: &[(&str, usize)] = &[
    ("first", 1),
    ("second", 2),
    ("third", 3),
    ("fourth", 4),
    ("fifth", 5),
];

/// Words after which "one" means "option" rather than the number.
const ONE_FILLER_LEADS: &[&str] = &["the", "that", "this", "which", "any", "either", "a", "last"];

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyResolution {
    Selected(CandidateSlot),
    /// More than one distinct slot was named explicitly.
    Ambiguous(Vec<u32>),
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reference {
    Ordinal(u32),
    Position(usize),
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClockTime {
    hour: u32,
    minute: u32,
    has_meridiem: bool,
}

/// Deterministic resolver for the small reply grammar patients use to pick
/// a slot.
///
/// Ordinals ("2", "#2", "two") and positions ("first", "2nd", "the last one")
/// are explicit references. A single explicit slot wins outright; several are
/// ambiguous. Without an explicit reference, a clock time resolves the reply
/// only when it matches exactly one slot's start.
#[derive(Debug, Default, Clone)]
pub struct ReplyResolver;

impl ReplyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, body: &str, slots: &[CandidateSlot]) -> ReplyResolution {
        let lowered = body.to_lowercase();
        let (clock_times, remainder) = extract_clock_times(&lowered);

        let mut batch: Vec<&CandidateSlot> = slots.iter().collect();
        batch.sort_by_key(|slot| slot.ordinal);

        let explicit: BTreeSet<u32> = explicit_references(&remainder)
            .into_iter()
            .filter_map(|reference| match reference {
                Reference::Ordinal(ordinal) => batch.iter().find(|slot| slot.ordinal == ordinal).map(|slot| slot.ordinal),
                Reference::Position(position) => position
                    .checked_sub(1)
                    .and_then(|index| batch.get(index))
                    .map(|slot| slot.ordinal),
                Reference::Last => batch.last().map(|slot| slot.ordinal),
            })
            .collect();

        let find = |ordinal: &u32| batch.iter().find(|slot| slot.ordinal == *ordinal).map(|slot| (*slot).clone());

        if explicit.len() == 1 {
            if let Some(slot) = explicit.first().and_then(find) {
                debug!("Reply resolved to ordinal {} by explicit reference", slot.ordinal);
                return ReplyResolution::Selected(slot);
            }
        }
        if explicit.len() > 1 {
            debug!("Reply names several slots: {:?}", explicit);
            return ReplyResolution::Ambiguous(explicit.into_iter().collect());
        }

        let by_clock: BTreeSet<u32> = batch
            .iter()
            .filter(|slot| clock_times.iter().any(|time| time.matches(slot)))
            .map(|slot| slot.ordinal)
            .collect();

        if by_clock.len() == 1 {
            if let Some(slot) = by_clock.first().and_then(find) {
                debug!("Reply resolved to ordinal {} by clock time", slot.ordinal);
                return ReplyResolution::Selected(slot);
            }
        }

        ReplyResolution::Unresolved
    }
}

impl ClockTime {
    fn matches(&self, slot: &CandidateSlot) -> bool {
        let start = slot.interval.start();
        if start.minute() != self.minute {
            return false;
        }
        // "2:30" without am/pm is read as either 02:30 or 14:30.
        start.hour() == self.hour || (!self.has_meridiem && self.hour < 12 && start.hour() == self.hour + 12)
    }
}

// Pull clock times out of the text and blank their spans so "10:30" is not
// also read as the ordinals 10 and 30.
fn extract_clock_times(text: &str) -> (Vec<ClockTime>, String) {
    let mut times = Vec::new();
    let mut remainder = text.to_string();

    for caps in CLOCK_RE.captures_iter(text) {
        let minute = caps.get(2);
        let meridiem = caps.get(3);
        if minute.is_none() && meridiem.is_none() {
            continue;
        }

        let Some(hour) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        let minute = minute.and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);

        let hour = match meridiem.map(|m| m.as_str()) {
            Some(half) => {
                if !(1..=12).contains(&hour) {
                    continue;
                }
                match (half, hour) {
                    ("a", 12) => 0,
                    ("a", h) => h,
                    (_, 12) => 12,
                    (_, h) => h + 12,
                }
            }
            None if hour <= 23 => hour,
            None => continue,
        };

        times.push(ClockTime {
            hour,
            minute,
            has_meridiem: meridiem.is_some(),
        });

        if let Some(whole) = caps.get(0) {
            remainder.replace_range(whole.range(), &" ".repeat(whole.len()));
        }
    }

    (times, remainder)
}

fn explicit_references(text: &str) -> Vec<Reference> {
    let tokens: Vec<&str> = TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect();
    let mut references = Vec::new();

    for (index, token) in tokens.iter().enumerate() {
        let token = token.trim_start_matches('#');

        if token.starts_with(|c: char| c.is_ascii_digit()) {
            let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
            let Ok(value) = digits.parse::<u32>() else {
                continue;
            };
            if digits.len() < token.len() {
                references.push(Reference::Position(value as usize));
            } else {
                references.push(Reference::Ordinal(value));
            }
            continue;
        }

        if token == "last" {
            references.push(Reference::Last);
            continue;
        }

        if let Some((_, position)) = POSITION_WORDS.iter().find(|(word, _)| *word == token) {
            references.push(Reference::Position(*position));
            continue;
        }

        if let Some((_, value)) = NUMBER_WORDS.iter().find(|(word, _)| *word == token) {
            if token == "one" && index > 0 && is_filler_lead(tokens[index - 1]) {
                continue;
            }
            references.push(Reference::Ordinal(*value));
        }
    }

    references
}

fn is_filler_lead(token: &str) -> bool {
    let token = token.trim_start_matches('#');
    ONE_FILLER_LEADS.contains(&token)
        || POSITION_WORDS.iter().any(|(word, _)| *word == token)
        || (token.starts_with(|c: char| c.is_ascii_digit()) && !token.ends_with(|c: char| c.is_ascii_digit()))
}
