use chrono::{DateTime, Days, Months, NaiveDate, NaiveTime, Utc};
use tracing::debug;

use crate::models::{AvailabilityError, DefaultWindow, DesiredWindow, IntervalSpec, IntervalUnit, TimeInterval};

/// Map a follow-up interval onto a concrete scheduling window.
///
/// `Relative(n, unit)` becomes `[today + (n-1)*unit, today + (n+1)*unit)`
/// with the lower bound clamped to `today`. `Unbounded` and `Unspecified`
/// use the default window; `Unspecified` is flagged.
pub fn window_for(
    spec: &IntervalSpec,
    today: NaiveDate,
    defaults: &DefaultWindow,
) -> Result<DesiredWindow, AvailabilityError> {
    let (start, end, flagged_unspecified) = match spec {
        IntervalSpec::Relative { amount, unit } => {
            let lower = amount.saturating_sub(1);
            let upper = amount.saturating_add(1);
            (
                offset(today, lower, *unit)?,
                offset(today, upper, *unit)?,
                false,
            )
        }
        IntervalSpec::Unbounded => {
            let (start, end) = default_bounds(today, defaults)?;
            (start, end, false)
        }
        IntervalSpec::Unspecified => {
            let (start, end) = default_bounds(today, defaults)?;
            (start, end, true)
        }
    };

    let interval = TimeInterval::new(midnight(start), midnight(end))?;
    debug!(
        "Interval {:?} from {} maps to window [{}, {})",
        spec,
        today,
        interval.start(),
        interval.end()
    );

    Ok(DesiredWindow {
        interval,
        flagged_unspecified,
    })
}

fn default_bounds(today: NaiveDate, defaults: &DefaultWindow) -> Result<(NaiveDate, NaiveDate), AvailabilityError> {
    let start_weeks = u32::try_from(defaults.start_weeks)
        .map_err(|_| AvailabilityError::WindowOutOfRange(format!("start_weeks={}", defaults.start_weeks)))?;
    let end_weeks = u32::try_from(defaults.end_weeks)
        .map_err(|_| AvailabilityError::WindowOutOfRange(format!("end_weeks={}", defaults.end_weeks)))?;

    Ok((
        offset(today, start_weeks, IntervalUnit::Weeks)?,
        offset(today, end_weeks, IntervalUnit::Weeks)?,
    ))
}

fn offset(today: NaiveDate, amount: u32, unit: IntervalUnit) -> Result<NaiveDate, AvailabilityError> {
    let shifted = match unit {
        IntervalUnit::Days => today.checked_add_days(Days::new(amount as u64)),
        IntervalUnit::Weeks => today.checked_add_days(Days::new(amount as u64 * 7)),
        IntervalUnit::Months => today.checked_add_months(Months::new(amount)),
    };

    shifted.ok_or_else(|| {
        AvailabilityError::WindowOutOfRange(format!("{} {:?} after {}", amount, unit, today))
    })
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
