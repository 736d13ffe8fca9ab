//! Recurrence arithmetic.
//!
//! Advancing a rule is pure: given the rule carried by the occurrence that
//! just reached a terminal state, produce the schedule for the next
//! occurrence or decide the series is over. Month and year steps clamp to
//! the last day of the target month (Jan 31 + 1 month = Feb 28/29).

use crate::types::{EndCondition, Frequency, RepeatRule};
use chrono::{DateTime, Days, Months, Utc};

/// The next candidate instant after `rule.next_scheduled_time`, ignoring
/// end conditions. `None` only on date overflow.
pub fn advance(rule: &RepeatRule) -> Option<DateTime<Utc>> {
    let from = rule.next_scheduled_time;
    let interval = u64::from(rule.interval);
    match rule.frequency {
        Frequency::Daily => from.checked_add_days(Days::new(interval)),
        Frequency::Weekly => from.checked_add_days(Days::new(interval * 7)),
        Frequency::Monthly => from.checked_add_months(Months::new(rule.interval)),
        Frequency::Yearly => from.checked_add_months(Months::new(rule.interval.checked_mul(12)?)),
    }
}

/// The rule for the next occurrence, or `None` when the series terminates
/// (count exhausted, end date reached, or rule already inactive).
pub fn next_occurrence(rule: &RepeatRule) -> Option<RepeatRule> {
    if !rule.is_active {
        return None;
    }
    if rule.end_condition == EndCondition::Count
        && rule
            .max_occurrences
            .is_some_and(|max| rule.current_occurrence >= max)
    {
        return None;
    }
    let next_time = advance(rule)?;
    if rule.end_condition == EndCondition::Date
        && rule.end_date.is_some_and(|end| next_time >= end)
    {
        return None;
    }
    Some(RepeatRule {
        current_occurrence: rule.current_occurrence + 1,
        next_scheduled_time: next_time,
        ..rule.clone()
    })
}
