//! Input validation for admin commands.
//!
//! All rules here are pure functions of the payload plus "now"; storage
//! conflicts (duplicate ids, immutable states) are detected later by the
//! repository. Errors name the offending field.

use crate::error::{Error, Result};
use crate::types::{CreateReminder, EscalationInput, RepeatInput, Reminder, UpdateReminder};
use crate::types::{EndCondition, TriggerCondition};
use chrono::{DateTime, Months, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Maximum content / escalation-message length, counted in code points.
pub const MAX_CONTENT_CODE_POINTS: usize = 2000;

/// Escalation timeout bounds, minutes. Upper bound is one week.
pub const MIN_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_TIMEOUT_MINUTES: u32 = 10_080;

/// How far into the future a reminder may be scheduled.
pub const SCHEDULE_HORIZON_MONTHS: u32 = 12;

static SNOWFLAKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{17,19}$").expect("snowflake regex is valid"));

/// Chat-platform user ids are snowflakes: 17–19 decimal digits.
pub fn is_snowflake(id: &str) -> bool {
    SNOWFLAKE.is_match(id)
}

/// Whether `tz` names an IANA time zone.
pub fn is_iana_timezone(tz: &str) -> bool {
    tz.parse::<chrono_tz::Tz>().is_ok()
}

fn check_content(field: &'static str, content: &str) -> Result<()> {
    let count = content.chars().count();
    if count == 0 {
        return Err(Error::validation(field, "must not be empty"));
    }
    if count > MAX_CONTENT_CODE_POINTS {
        return Err(Error::validation(
            field,
            format!("{count} code points exceeds the {MAX_CONTENT_CODE_POINTS} limit"),
        ));
    }
    Ok(())
}

fn check_user_id(field: &'static str, id: &str) -> Result<()> {
    if is_snowflake(id) {
        Ok(())
    } else {
        Err(Error::validation(
            field,
            format!("'{id}' is not a valid user id (expected 17-19 digits)"),
        ))
    }
}

fn check_schedule(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if scheduled <= now {
        return Err(Error::validation(
            "scheduledTime",
            "must be in the future",
        ));
    }
    let horizon = now
        .checked_add_months(Months::new(SCHEDULE_HORIZON_MONTHS))
        .ok_or_else(|| Error::Internal("schedule horizon overflow".to_owned()))?;
    if scheduled > horizon {
        return Err(Error::validation(
            "scheduledTime",
            "must be within one year",
        ));
    }
    Ok(())
}

fn check_timezone(tz: &str) -> Result<()> {
    if is_iana_timezone(tz) {
        Ok(())
    } else {
        Err(Error::validation(
            "timezone",
            format!("'{tz}' is not an IANA time zone"),
        ))
    }
}

fn check_escalation(input: &EscalationInput, target_user_id: &str) -> Result<()> {
    check_user_id("escalation.secondaryUserId", &input.secondary_user_id)?;
    if input.secondary_user_id == target_user_id {
        return Err(Error::validation(
            "escalation.secondaryUserId",
            "must differ from targetUserId",
        ));
    }
    if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&input.timeout_minutes) {
        return Err(Error::validation(
            "escalation.timeoutMinutes",
            format!("must be between {MIN_TIMEOUT_MINUTES} and {MAX_TIMEOUT_MINUTES}"),
        ));
    }
    if input.trigger_conditions.is_empty() {
        return Err(Error::validation(
            "escalation.triggerConditions",
            "at least one of timeout/decline is required",
        ));
    }
    for condition in [TriggerCondition::Timeout, TriggerCondition::Decline] {
        let occurrences = input
            .trigger_conditions
            .iter()
            .filter(|c| **c == condition)
            .count();
        if occurrences > 1 {
            return Err(Error::validation(
                "escalation.triggerConditions",
                format!("'{condition}' listed more than once"),
            ));
        }
    }
    if let Some(msg) = &input.timeout_message {
        check_content("escalation.timeoutMessage", msg)?;
    }
    if let Some(msg) = &input.decline_message {
        check_content("escalation.declineMessage", msg)?;
    }
    Ok(())
}

fn check_repeat(input: &RepeatInput, scheduled: DateTime<Utc>) -> Result<()> {
    if input.interval < 1 {
        return Err(Error::validation("repeatRule.interval", "must be >= 1"));
    }
    match input.end_condition {
        EndCondition::Never => Ok(()),
        EndCondition::Date => {
            let Some(end_date) = input.end_date else {
                return Err(Error::validation(
                    "repeatRule.endDate",
                    "required when endCondition is 'date'",
                ));
            };
            if end_date <= scheduled {
                return Err(Error::validation(
                    "repeatRule.endDate",
                    "must be after scheduledTime",
                ));
            }
            Ok(())
        }
        EndCondition::Count => match input.max_occurrences {
            Some(n) if n >= 1 => Ok(()),
            Some(_) => Err(Error::validation(
                "repeatRule.maxOccurrences",
                "must be >= 1",
            )),
            None => Err(Error::validation(
                "repeatRule.maxOccurrences",
                "required when endCondition is 'count'",
            )),
        },
    }
}

/// Full validation of a Create payload against "now".
pub fn validate_create(input: &CreateReminder, now: DateTime<Utc>) -> Result<()> {
    check_content("content", &input.content)?;
    check_user_id("targetUserId", &input.target_user_id)?;
    check_schedule(input.scheduled_time, now)?;
    if let Some(tz) = &input.timezone {
        check_timezone(tz)?;
    }
    if let Some(escalation) = &input.escalation {
        check_escalation(escalation, &input.target_user_id)?;
    }
    if let Some(repeat) = &input.repeat_rule {
        check_repeat(repeat, input.scheduled_time)?;
    }
    Ok(())
}

/// Validation of an Update delta against the record it would produce.
///
/// `current` is the stored reminder; the effective value of each field is
/// the delta's when present, the stored one otherwise, so cross-field
/// invariants (I1, I2) hold on the merged result.
pub fn validate_update(
    delta: &UpdateReminder,
    current: &Reminder,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(content) = &delta.content {
        check_content("content", content)?;
    }
    let target = delta
        .target_user_id
        .as_deref()
        .unwrap_or(&current.target_user_id);
    if delta.target_user_id.is_some() {
        check_user_id("targetUserId", target)?;
    }
    let scheduled = delta.scheduled_time.unwrap_or(current.scheduled_time);
    if delta.scheduled_time.is_some() {
        check_schedule(scheduled, now)?;
    }
    if let Some(tz) = &delta.timezone {
        check_timezone(tz)?;
    }
    match (&delta.escalation, &current.escalation) {
        (Some(input), _) => check_escalation(input, target)?,
        (None, Some(rule)) => {
            // Retargeting must not collide with a kept escalation rule.
            if rule.secondary_user_id == target {
                return Err(Error::validation(
                    "targetUserId",
                    "must differ from escalation.secondaryUserId",
                ));
            }
        }
        (None, None) => {}
    }
    if let Some(repeat) = &delta.repeat_rule {
        check_repeat(repeat, scheduled)?;
    }
    Ok(())
}
