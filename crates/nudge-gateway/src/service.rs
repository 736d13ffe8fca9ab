//! The reminder command surface.
//!
//! Every state-changing operation funnels through here: admin CRUD, the
//! dispatch loop's delivery bookkeeping, response recording, test
//! execution, and repeat scheduling. Each mutation is a read–modify–write
//! against the repository; version conflicts are retried a bounded number
//! of times before surfacing to the caller.

use crate::escalation::{EscalationEngine, render_escalation_message};
use chrono::DateTime;
use chrono::Utc;
use nudge_core::retry::RetryPolicy;
use nudge_core::validate;
use nudge_core::{
    Clock, Conflict, CreateReminder, Error, EscalationInput, EscalationRule, Reminder,
    ResponseLog, ResponseType, Result, SYSTEM_ACTOR, Status, TestExecution, TestResult, TestType,
    Transport, TriggerCondition, UpdateReminder, new_reminder_id, repeat,
};
use nudge_store::ReminderRepo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a version-conflicted mutation is re-attempted before the
/// conflict reaches the caller.
const CONFLICT_RETRIES: usize = 3;

/// Retry a read–modify–write that may lose a version race.
pub(crate) fn retry_conflicts<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_version_conflict() && attempt < CONFLICT_RETRIES => attempt += 1,
            other => return other,
        }
    }
}

/// A recipient's answer, normalized from whatever envelope it arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ResponseAction {
    Acknowledge,
    Decline,
}

impl ResponseAction {
    /// Stable string form, bound into ack-link tokens.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Decline => "decline",
        }
    }
}

pub(crate) struct ReminderService {
    repo: ReminderRepo,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    escalation: Arc<EscalationEngine>,
    retry: RetryPolicy,
    application_id: Option<String>,
}

impl ReminderService {
    pub(crate) fn new(
        repo: ReminderRepo,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        escalation: Arc<EscalationEngine>,
        application_id: Option<String>,
    ) -> Self {
        Self {
            repo,
            transport,
            clock,
            escalation,
            retry: RetryPolicy::default(),
            application_id,
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // -- Admin commands -----------------------------------------------------

    pub(crate) fn create(&self, input: CreateReminder, actor: &str) -> Result<Reminder> {
        let now = self.clock.now();
        validate::validate_create(&input, now)?;

        let scheduled_time = input.scheduled_time;
        let reminder = Reminder {
            id: new_reminder_id(),
            content: input.content,
            target_user_id: input.target_user_id,
            scheduled_time,
            timezone: input.timezone,
            created_by: actor.to_owned(),
            created_at: now,
            updated_at: now,
            status: Status::Pending,
            delivery_attempts: 0,
            last_delivery_attempt: None,
            next_retry_at: None,
            last_error: None,
            responses: Vec::new(),
            test_executions: Vec::new(),
            escalation: input.escalation.map(EscalationInput::into_rule),
            repeat_rule: input.repeat_rule.map(|r| r.into_rule(scheduled_time)),
        };
        self.repo.create(&reminder)?;

        info!(
            reminder.id = %reminder.id,
            scheduled = %reminder.scheduled_time,
            target = %reminder.target_user_id,
            created_by = %actor,
            "reminder created"
        );
        Ok(reminder)
    }

    /// Edit a reminder. Only `Pending` reminders are editable.
    pub(crate) fn update(&self, id: &str, delta: &UpdateReminder) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            let current = self.repo.get(id)?.ok_or_else(|| Error::not_found(id))?;
            if current.status != Status::Pending {
                return Err(Conflict::ImmutableState(current.status).into());
            }
            validate::validate_update(delta, &current, now)?;
            self.repo.update(id, |r| {
                if r.status != Status::Pending {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                apply_update(r, delta, now);
                Ok(())
            })
        })
    }

    /// Cancel a pending reminder.
    pub(crate) fn cancel(&self, id: &str, actor: &str) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if r.status != Status::Pending {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                r.status = Status::Cancelled;
                r.updated_at = now;
                r.push_response(ResponseLog::new(actor, ResponseType::Cancelled, now))
            })
        })
    }

    /// Hard delete, permitted in any state.
    pub(crate) fn delete(&self, id: &str) -> Result<()> {
        retry_conflicts(|| self.repo.delete(id))
    }

    /// Admin override: put a reminder back on the schedule. Refused once
    /// the recipient has answered. Deliberately bypasses the transition
    /// table — that table models the engine, not the operator.
    pub(crate) fn reset(&self, id: &str) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if r.status.is_answered() {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                r.status = Status::Pending;
                r.delivery_attempts = 0;
                r.last_delivery_attempt = None;
                r.next_retry_at = None;
                r.last_error = None;
                if let Some(rule) = &mut r.escalation {
                    reset_escalation_bookkeeping(rule);
                }
                r.updated_at = now;
                Ok(())
            })
        })
    }

    // -- Queries ------------------------------------------------------------

    pub(crate) fn get(&self, id: &str) -> Result<Reminder> {
        self.repo.get(id)?.ok_or_else(|| Error::not_found(id))
    }

    pub(crate) fn list(
        &self,
        status: Option<Status>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Reminder>, usize)> {
        self.repo.list(status, limit, offset)
    }

    pub(crate) fn responses(&self, id: &str) -> Result<Vec<ResponseLog>> {
        Ok(self.get(id)?.responses)
    }

    pub(crate) fn flush_all(&self) -> Result<usize> {
        let removed = self.repo.flush_all()?;
        warn!(removed, "flushed all reminders");
        Ok(removed)
    }

    // -- Delivery bookkeeping (dispatch loop) -------------------------------

    /// Record a successful delivery: `Pending -> Sent` plus attempt and
    /// audit bookkeeping. The ack-deadline index entry appears as part of
    /// the same commit when an escalation rule is armed.
    pub(crate) fn mark_as_delivered(&self, id: &str, message_id: &str) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if !r.status.can_transition_to(Status::Sent) {
                    return Err(Conflict::IllegalTransition {
                        from: r.status,
                        to: Status::Sent,
                    }
                    .into());
                }
                r.status = Status::Sent;
                r.delivery_attempts += 1;
                r.last_delivery_attempt = Some(now);
                r.next_retry_at = None;
                r.last_error = None;
                r.updated_at = now;
                let mut entry = ResponseLog::new(SYSTEM_ACTOR, ResponseType::Delivered, now)
                    .with_message_id(message_id);
                if let Some(app) = &self.application_id {
                    entry = entry.with_metadata(serde_json::json!({ "applicationId": app }));
                }
                r.push_response(entry)
            })
        })
    }

    /// Record a transient delivery failure: bump attempts, reschedule with
    /// backoff, or fail terminally once the budget is spent.
    pub(crate) fn record_transient_failure(
        &self,
        id: &str,
        message: &str,
        retry_after: Option<Duration>,
    ) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if r.status != Status::Pending {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                r.delivery_attempts += 1;
                r.last_delivery_attempt = Some(now);
                r.last_error = Some(message.to_owned());
                r.updated_at = now;
                if self.retry.exhausted(r.delivery_attempts) {
                    r.status = Status::Failed;
                    r.next_retry_at = None;
                    r.push_response(ResponseLog::new(
                        SYSTEM_ACTOR,
                        ResponseType::FailedDelivery,
                        now,
                    ))
                } else {
                    r.next_retry_at = Some(self.retry.next_attempt_at(
                        now,
                        r.delivery_attempts - 1,
                        retry_after,
                    ));
                    Ok(())
                }
            })
        })
    }

    /// Record a permanent delivery failure: terminal `Failed`.
    pub(crate) fn record_permanent_failure(&self, id: &str, message: &str) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if !r.status.can_transition_to(Status::Failed) {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                r.status = Status::Failed;
                r.delivery_attempts += 1;
                r.last_delivery_attempt = Some(now);
                r.next_retry_at = None;
                r.last_error = Some(message.to_owned());
                r.updated_at = now;
                r.push_response(ResponseLog::new(
                    SYSTEM_ACTOR,
                    ResponseType::FailedDelivery,
                    now,
                ))
            })
        })
    }

    /// A due reminder that was never picked up in time and has no retry
    /// budget left. Its by-time index entry disappears with this commit.
    pub(crate) fn expire(&self, id: &str) -> Result<Reminder> {
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if !r.status.can_transition_to(Status::Expired) {
                    return Err(Conflict::ImmutableState(r.status).into());
                }
                r.status = Status::Expired;
                r.next_retry_at = None;
                r.last_error = Some("expired before delivery".to_owned());
                r.updated_at = now;
                Ok(())
            })
        })
    }

    // -- Responses ----------------------------------------------------------

    /// Apply an inbound acknowledge/decline from `actor`.
    ///
    /// Idempotent in the state-machine sense: duplicates and answers in
    /// non-answerable states append an audit entry but change nothing
    /// else. A decline with an armed decline-escalation triggers the
    /// escalation send before returning; if that send fails the reminder
    /// stays `Declined` and the escalation scan retries it.
    pub(crate) async fn record_response(
        &self,
        id: &str,
        actor: &str,
        action: ResponseAction,
    ) -> Result<Reminder> {
        let response_type = match action {
            ResponseAction::Acknowledge => ResponseType::Acknowledged,
            ResponseAction::Decline => ResponseType::Declined,
        };
        let updated = retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if let Some(next) = answer_transition(r.status, action) {
                    r.status = next;
                } else {
                    debug!(
                        reminder.id = %id,
                        status = %r.status,
                        action = ?action,
                        "response recorded without state change"
                    );
                }
                r.updated_at = now;
                r.push_response(ResponseLog::new(actor, response_type, now))
            })
        })?;

        info!(
            reminder.id = %id,
            actor = %actor,
            action = ?action,
            status = %updated.status,
            "response recorded"
        );

        if action == ResponseAction::Decline && updated.pending_decline_escalation() {
            match self
                .escalation
                .escalate(id, TriggerCondition::Decline)
                .await
            {
                Ok(true) => return self.get(id),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        reminder.id = %id,
                        error = %e,
                        "decline escalation failed; the scan will retry"
                    );
                }
            }
        }
        Ok(updated)
    }

    // -- Tests against live reminders ---------------------------------------

    /// Run an admin-triggered dry run. The execution entry is appended
    /// whatever the outcome; the reminder's status only moves for an
    /// immediate delivery with `preserve_schedule = false`.
    pub(crate) async fn execute_test(
        &self,
        id: &str,
        test_type: TestType,
        preserve_schedule: bool,
        actor: &str,
    ) -> Result<TestExecution> {
        let reminder = self.get(id)?;

        let (result, error_message) = match test_type {
            TestType::ImmediateDelivery => {
                match self
                    .transport
                    .send_reminder(&reminder.target_user_id, id, &reminder.content)
                    .await
                {
                    Ok(message_id) => {
                        if !preserve_schedule && reminder.status == Status::Pending {
                            match self.mark_as_delivered(id, &message_id) {
                                Ok(_) => (TestResult::Success, None),
                                Err(e) => (
                                    TestResult::Partial,
                                    Some(format!("delivered but not recorded: {e}")),
                                ),
                            }
                        } else {
                            (TestResult::Success, None)
                        }
                    }
                    Err(e) => (TestResult::Failed, Some(e.to_string())),
                }
            }
            TestType::EscalationFlow => match &reminder.escalation {
                None => (
                    TestResult::Failed,
                    Some("no escalation rule configured".to_owned()),
                ),
                Some(rule) => {
                    let text = format!(
                        "[TEST] {}",
                        render_escalation_message(&reminder, rule, TriggerCondition::Timeout)
                    );
                    match self
                        .transport
                        .send_escalation(&rule.secondary_user_id, id, &text)
                        .await
                    {
                        Ok(_) => (TestResult::Success, None),
                        Err(e) => (TestResult::Failed, Some(e.to_string())),
                    }
                }
            },
            TestType::Validation => {
                let issues = validate_stored(&reminder);
                if issues.is_empty() {
                    (TestResult::Success, None)
                } else {
                    (TestResult::Failed, Some(issues.join("; ")))
                }
            }
        };

        let now = self.clock.now();
        let mut entry = TestExecution::new(actor, now, test_type, result, preserve_schedule);
        if let Some(message) = error_message {
            entry = entry.with_error(message);
        }
        retry_conflicts(|| {
            self.repo.update(id, |r| {
                r.updated_at = now;
                r.push_test_execution(entry.clone())
            })
        })?;
        Ok(entry)
    }

    // -- Recurrence ---------------------------------------------------------

    /// After a terminal outcome on a recurring occurrence: create the next
    /// occurrence, or mark the series finished and return `None`.
    pub(crate) fn schedule_next_repeat(&self, id: &str) -> Result<Option<Reminder>> {
        let current = self.get(id)?;
        let Some(rule) = &current.repeat_rule else {
            return Ok(None);
        };

        match repeat::next_occurrence(rule) {
            None => {
                if rule.is_active {
                    retry_conflicts(|| {
                        let now = self.clock.now();
                        self.repo.update(id, |r| {
                            if let Some(rule) = &mut r.repeat_rule {
                                rule.is_active = false;
                            }
                            r.updated_at = now;
                            Ok(())
                        })
                    })?;
                    info!(reminder.id = %id, "repeat series finished");
                }
                Ok(None)
            }
            Some(next_rule) => {
                let now = self.clock.now();
                let next = Reminder {
                    id: new_reminder_id(),
                    content: current.content.clone(),
                    target_user_id: current.target_user_id.clone(),
                    scheduled_time: next_rule.next_scheduled_time,
                    timezone: current.timezone.clone(),
                    created_by: current.created_by.clone(),
                    created_at: now,
                    updated_at: now,
                    status: Status::Pending,
                    delivery_attempts: 0,
                    last_delivery_attempt: None,
                    next_retry_at: None,
                    last_error: None,
                    responses: Vec::new(),
                    test_executions: Vec::new(),
                    escalation: current.escalation.clone().map(|mut rule| {
                        reset_escalation_bookkeeping(&mut rule);
                        rule
                    }),
                    repeat_rule: Some(next_rule),
                };
                self.repo.create(&next)?;
                info!(
                    reminder.id = %id,
                    next.id = %next.id,
                    next.scheduled = %next.scheduled_time,
                    occurrence = next.repeat_rule.as_ref().map_or(0, |r| r.current_occurrence),
                    "next repeat occurrence scheduled"
                );
                Ok(Some(next))
            }
        }
    }
}

fn apply_update(r: &mut Reminder, delta: &UpdateReminder, now: DateTime<Utc>) {
    if let Some(content) = &delta.content {
        r.content.clone_from(content);
    }
    if let Some(target) = &delta.target_user_id {
        r.target_user_id.clone_from(target);
    }
    if let Some(tz) = &delta.timezone {
        r.timezone = Some(tz.clone());
    }
    if let Some(scheduled) = delta.scheduled_time {
        r.scheduled_time = scheduled;
        // A fresh schedule clears retry debris from the old one.
        r.next_retry_at = None;
        r.last_error = None;
        if delta.repeat_rule.is_none()
            && let Some(rule) = &mut r.repeat_rule
        {
            rule.next_scheduled_time = scheduled;
        }
    }
    if let Some(escalation) = &delta.escalation {
        r.escalation = Some(escalation.clone().into_rule());
    }
    if let Some(repeat) = &delta.repeat_rule {
        r.repeat_rule = Some(repeat.clone().into_rule(r.scheduled_time));
    }
    r.updated_at = now;
}

/// Status an answer moves the reminder to, if any. `None` covers
/// duplicates and answers that arrive in a state with nothing to answer.
fn answer_transition(status: Status, action: ResponseAction) -> Option<Status> {
    match (status, action) {
        (Status::Sent, ResponseAction::Acknowledge) => Some(Status::Acknowledged),
        (Status::Sent, ResponseAction::Decline) => Some(Status::Declined),
        (Status::Escalated, ResponseAction::Acknowledge) => Some(Status::EscalatedAck),
        (Status::Escalated, ResponseAction::Decline) => Some(Status::EscalatedDeclined),
        _ => None,
    }
}

fn reset_escalation_bookkeeping(rule: &mut EscalationRule) {
    rule.triggered_at = None;
    rule.trigger_reason = None;
    rule.last_error = None;
    rule.next_attempt_after = None;
    rule.attempts = 0;
    rule.is_active = true;
}

/// The invariant sweep behind `testType = validation`.
fn validate_stored(r: &Reminder) -> Vec<String> {
    let mut issues = Vec::new();
    let chars = r.content.chars().count();
    if chars == 0 || chars > validate::MAX_CONTENT_CODE_POINTS {
        issues.push(format!("content length {chars} out of range"));
    }
    if !validate::is_snowflake(&r.target_user_id) {
        issues.push(format!("targetUserId '{}' is malformed", r.target_user_id));
    }
    if r.scheduled_time <= r.created_at {
        issues.push("scheduledTime is not after createdAt".to_owned());
    }
    if let Some(tz) = &r.timezone
        && !validate::is_iana_timezone(tz)
    {
        issues.push(format!("timezone '{tz}' is not an IANA zone"));
    }
    if let Some(rule) = &r.escalation {
        if rule.secondary_user_id == r.target_user_id {
            issues.push("escalation.secondaryUserId equals targetUserId".to_owned());
        }
        if !(validate::MIN_TIMEOUT_MINUTES..=validate::MAX_TIMEOUT_MINUTES)
            .contains(&rule.timeout_minutes)
        {
            issues.push(format!(
                "escalation.timeoutMinutes {} out of range",
                rule.timeout_minutes
            ));
        }
    }
    if let Some(rule) = &r.repeat_rule
        && rule.interval < 1
    {
        issues.push("repeatRule.interval below 1".to_owned());
    }
    if r.responses.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
        issues.push("responses are not ordered by timestamp".to_owned());
    }
    if r.test_executions
        .windows(2)
        .any(|w| w[1].executed_at < w[0].executed_at)
    {
        issues.push("testExecutions are not ordered by executedAt".to_owned());
    }
    issues
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ADMIN, Harness, SECONDARY, TARGET, basic_create, escalating_create, harness, t0};
    use chrono::Duration as ChronoDuration;
    use nudge_core::fakes::{SendKind, SendOutcome};
    use nudge_core::{EndCondition, Frequency, RepeatInput};

    // -- Create / read (R1) --

    #[test]
    fn create_then_get_round_trips() {
        let h = harness();
        let created = basic_create(&h);
        let fetched = h.service.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, Status::Pending);
        assert_eq!(fetched.created_by, ADMIN);
        assert!(fetched.responses.is_empty());
    }

    #[test]
    fn create_rejects_invalid_payload() {
        let h = harness();
        let err = h
            .service
            .create(
                CreateReminder {
                    content: String::new(),
                    target_user_id: TARGET.to_owned(),
                    scheduled_time: t0() + ChronoDuration::minutes(1),
                    timezone: None,
                    escalation: None,
                    repeat_rule: None,
                },
                ADMIN,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "content", .. }));
    }

    // -- Update (R2) --

    #[test]
    fn noop_update_still_bumps_updated_at() {
        let h = harness();
        let created = basic_create(&h);
        h.clock.advance(ChronoDuration::seconds(10));
        let updated = h
            .service
            .update(&created.id, &UpdateReminder::default())
            .unwrap();
        assert_eq!(updated.content, created.content);
        assert_eq!(updated.scheduled_time, created.scheduled_time);
        assert!(updated.updated_at > created.updated_at);
    }

    #[test]
    fn update_rewrites_schedule() {
        let h = harness();
        let created = basic_create(&h);
        let new_time = t0() + ChronoDuration::hours(3);
        let updated = h
            .service
            .update(
                &created.id,
                &UpdateReminder {
                    scheduled_time: Some(new_time),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.scheduled_time, new_time);

        // Due scan follows the new schedule.
        assert!(h.repo.due_reminders(t0() + ChronoDuration::hours(1)).unwrap().is_empty());
        assert_eq!(h.repo.due_reminders(new_time).unwrap().len(), 1);
    }

    #[test]
    fn update_refused_when_not_pending() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let err = h
            .service
            .update(&created.id, &UpdateReminder::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::ImmutableState(Status::Sent))
        ));
    }

    // -- Cancel / delete / reset --

    #[test]
    fn cancel_appends_audit_entry() {
        let h = harness();
        let created = basic_create(&h);
        let cancelled = h.service.cancel(&created.id, ADMIN).unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert_eq!(cancelled.responses.len(), 1);
        assert_eq!(
            cancelled.responses[0].response_type,
            ResponseType::Cancelled
        );
        assert_eq!(cancelled.responses[0].user_id, ADMIN);
    }

    #[test]
    fn cancel_refused_after_delivery() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let err = h.service.cancel(&created.id, ADMIN).unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::ImmutableState(Status::Sent))
        ));
    }

    #[test]
    fn delete_works_in_any_state() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.service.delete(&created.id).unwrap();
        assert!(matches!(
            h.service.get(&created.id).unwrap_err(),
            Error::Conflict(Conflict::NotFound(_))
        ));
    }

    #[test]
    fn reset_restores_pending_and_clears_bookkeeping() {
        let h = harness();
        let created = escalating_create(&h, 5);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let reset = h.service.reset(&created.id).unwrap();
        assert_eq!(reset.status, Status::Pending);
        assert_eq!(reset.delivery_attempts, 0);
        assert!(reset.last_delivery_attempt.is_none());
        assert!(reset.ack_deadline().is_none());
    }

    #[tokio::test]
    async fn reset_refused_from_answered_states() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.service
            .record_response(&created.id, TARGET, ResponseAction::Acknowledge)
            .await
            .unwrap();
        let err = h.service.reset(&created.id).unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::ImmutableState(Status::Acknowledged))
        ));
    }

    // -- Delivery bookkeeping --

    #[test]
    fn mark_as_delivered_records_everything() {
        let h = harness();
        let created = basic_create(&h);
        h.clock.advance(ChronoDuration::minutes(1));
        let sent = h.service.mark_as_delivered(&created.id, "msg_77").unwrap();
        assert_eq!(sent.status, Status::Sent);
        assert_eq!(sent.delivery_attempts, 1);
        assert_eq!(sent.last_delivery_attempt, Some(h.clock.now()));
        assert_eq!(sent.responses.len(), 1);
        let log = &sent.responses[0];
        assert_eq!(log.response_type, ResponseType::Delivered);
        assert_eq!(log.user_id, SYSTEM_ACTOR);
        assert_eq!(log.message_id.as_deref(), Some("msg_77"));
        assert_eq!(
            log.metadata.as_ref().unwrap()["applicationId"],
            "55555555555555555"
        );
    }

    #[test]
    fn mark_as_delivered_twice_is_refused() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let err = h.service.mark_as_delivered(&created.id, "msg_2").unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::IllegalTransition { .. })
        ));
    }

    #[test]
    fn transient_failures_back_off_then_fail() {
        let h = harness();
        let created = basic_create(&h);

        // Failures 1..=3: rescheduled at +30s, +60s, +120s.
        for expected_delay in [30_i64, 60, 120] {
            let now = h.clock.now();
            let r = h
                .service
                .record_transient_failure(&created.id, "connect timeout", None)
                .unwrap();
            assert_eq!(r.status, Status::Pending);
            assert_eq!(
                r.next_retry_at,
                Some(now + ChronoDuration::seconds(expected_delay))
            );
            assert_eq!(r.last_error.as_deref(), Some("connect timeout"));
        }

        // Failures 4 and 5: 5 exhausts the budget.
        h.service
            .record_transient_failure(&created.id, "still down", None)
            .unwrap();
        let r = h
            .service
            .record_transient_failure(&created.id, "still down", None)
            .unwrap();
        assert_eq!(r.status, Status::Failed);
        assert_eq!(r.delivery_attempts, 5);
        assert!(r.next_retry_at.is_none());
        assert_eq!(
            r.responses.last().unwrap().response_type,
            ResponseType::FailedDelivery
        );
    }

    #[test]
    fn rate_limit_retry_after_stretches_backoff() {
        let h = harness();
        let created = basic_create(&h);
        let now = h.clock.now();
        let r = h
            .service
            .record_transient_failure(
                &created.id,
                "rate limited",
                Some(Duration::from_secs(300)),
            )
            .unwrap();
        assert_eq!(r.next_retry_at, Some(now + ChronoDuration::seconds(300)));
    }

    #[test]
    fn permanent_failure_is_terminal() {
        let h = harness();
        let created = basic_create(&h);
        let r = h
            .service
            .record_permanent_failure(&created.id, "unknown recipient")
            .unwrap();
        assert_eq!(r.status, Status::Failed);
        assert_eq!(r.delivery_attempts, 1);
        assert_eq!(
            r.responses.last().unwrap().response_type,
            ResponseType::FailedDelivery
        );
    }

    #[test]
    fn expire_removes_from_due_scan() {
        let h = harness();
        let created = basic_create(&h);
        let expired = h.service.expire(&created.id).unwrap();
        assert_eq!(expired.status, Status::Expired);
        assert!(
            h.repo
                .due_reminders(t0() + ChronoDuration::days(30))
                .unwrap()
                .is_empty()
        );
    }

    // -- Responses (R3, scenario 1, scenario 3) --

    #[tokio::test]
    async fn acknowledge_after_delivery() {
        let h = harness();
        let created = basic_create(&h);
        h.clock.advance(ChronoDuration::minutes(1));
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.clock.advance(ChronoDuration::minutes(2));

        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Acknowledge)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Acknowledged);
        assert_eq!(r.responses.len(), 2);
        assert!(r.ack_deadline().is_none());
    }

    #[tokio::test]
    async fn duplicate_acknowledge_keeps_state_appends_audit() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();

        h.service
            .record_response(&created.id, TARGET, ResponseAction::Acknowledge)
            .await
            .unwrap();
        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Acknowledge)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Acknowledged);
        // delivered + ack + duplicate ack
        assert_eq!(r.responses.len(), 3);
    }

    #[tokio::test]
    async fn decline_after_ack_never_moves_backwards() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.service
            .record_response(&created.id, TARGET, ResponseAction::Acknowledge)
            .await
            .unwrap();
        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Decline)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Acknowledged);
        assert_eq!(r.responses.len(), 3);
    }

    #[tokio::test]
    async fn decline_without_escalation_is_terminal() {
        let h = harness();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Decline)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Declined);
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn decline_with_escalation_escalates_synchronously() {
        let h = harness();
        let created = escalating_create(&h, 5);
        h.clock.advance(ChronoDuration::minutes(1));
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.clock.advance(ChronoDuration::minutes(1));

        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Decline)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Escalated);
        let rule = r.escalation.as_ref().unwrap();
        assert_eq!(rule.trigger_reason, Some(TriggerCondition::Decline));
        assert_eq!(rule.triggered_at, Some(h.clock.now()));
        assert!(r.ack_deadline().is_none());

        let sent = h.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SendKind::Escalation);
        assert_eq!(sent[0].recipient, SECONDARY);
        assert!(sent[0].content.contains("file the report"));
    }

    #[tokio::test]
    async fn failed_decline_escalation_leaves_declined_and_deadline() {
        let h = harness();
        let created = escalating_create(&h, 5);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.clock.advance(ChronoDuration::minutes(1));
        h.transport
            .push_outcome(SendOutcome::Transient { retry_after: None });

        let r = h
            .service
            .record_response(&created.id, TARGET, ResponseAction::Decline)
            .await
            .unwrap();
        assert_eq!(r.status, Status::Declined);

        // The scan still sees it: the decline is durable, retry pending.
        let stored = h.service.get(&created.id).unwrap();
        assert!(stored.ack_deadline().is_some());
        assert_eq!(
            stored.escalation.as_ref().unwrap().attempts,
            1
        );
    }

    // -- Repeats (P6, scenario 5) --

    fn weekly_count_create(h: &Harness, max: u32) -> Reminder {
        h.service
            .create(
                CreateReminder {
                    content: "weekly sync notes".to_owned(),
                    target_user_id: TARGET.to_owned(),
                    scheduled_time: t0() + ChronoDuration::minutes(1),
                    timezone: None,
                    escalation: None,
                    repeat_rule: Some(RepeatInput {
                        frequency: Frequency::Weekly,
                        interval: 1,
                        end_condition: EndCondition::Count,
                        end_date: None,
                        max_occurrences: Some(max),
                    }),
                },
                ADMIN,
            )
            .unwrap()
    }

    #[test]
    fn repeat_series_creates_exactly_max_occurrences() {
        let h = harness();
        let first = weekly_count_create(&h, 3);

        let second = h.service.schedule_next_repeat(&first.id).unwrap().unwrap();
        assert_eq!(
            second.scheduled_time,
            first.scheduled_time + ChronoDuration::weeks(1)
        );
        assert_eq!(
            second.repeat_rule.as_ref().unwrap().current_occurrence,
            2
        );
        assert_ne!(second.id, first.id);
        assert!(second.responses.is_empty());

        let third = h.service.schedule_next_repeat(&second.id).unwrap().unwrap();
        assert_eq!(third.repeat_rule.as_ref().unwrap().current_occurrence, 3);

        // Third is the last: nothing new, rule flipped inactive.
        assert!(h.service.schedule_next_repeat(&third.id).unwrap().is_none());
        let third_after = h.service.get(&third.id).unwrap();
        assert!(!third_after.repeat_rule.as_ref().unwrap().is_active);

        let (_, total) = h.service.list(None, 100, 0).unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn repeat_occurrence_resets_escalation_bookkeeping() {
        let h = harness();
        let first = escalating_create(&h, 5);
        // Graft a repeat rule on via update.
        h.service
            .update(
                &first.id,
                &UpdateReminder {
                    repeat_rule: Some(RepeatInput {
                        frequency: Frequency::Daily,
                        interval: 1,
                        end_condition: EndCondition::Never,
                        end_date: None,
                        max_occurrences: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        h.service.mark_as_delivered(&first.id, "msg_1").unwrap();

        let next = h.service.schedule_next_repeat(&first.id).unwrap().unwrap();
        let rule = next.escalation.as_ref().unwrap();
        assert!(rule.triggered_at.is_none());
        assert_eq!(rule.attempts, 0);
        assert!(rule.is_active);
        assert_eq!(next.status, Status::Pending);
    }

    // -- Test executions --

    #[tokio::test]
    async fn immediate_delivery_test_preserving_schedule() {
        let h = harness();
        let created = basic_create(&h);
        let entry = h
            .service
            .execute_test(&created.id, TestType::ImmediateDelivery, true, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Success);
        assert!(entry.preserved_schedule);

        let stored = h.service.get(&created.id).unwrap();
        assert_eq!(stored.status, Status::Pending);
        assert_eq!(stored.test_executions.len(), 1);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn immediate_delivery_test_consuming_schedule() {
        let h = harness();
        let created = basic_create(&h);
        let entry = h
            .service
            .execute_test(&created.id, TestType::ImmediateDelivery, false, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Success);
        let stored = h.service.get(&created.id).unwrap();
        assert_eq!(stored.status, Status::Sent);
    }

    #[tokio::test]
    async fn failed_test_send_still_appends_entry() {
        let h = harness();
        let created = basic_create(&h);
        h.transport.push_outcome(SendOutcome::Permanent);
        let entry = h
            .service
            .execute_test(&created.id, TestType::ImmediateDelivery, true, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Failed);
        assert!(entry.error_message.is_some());
        assert_eq!(
            h.service.get(&created.id).unwrap().test_executions.len(),
            1
        );
    }

    #[tokio::test]
    async fn escalation_flow_test_hits_secondary_with_prefix() {
        let h = harness();
        let created = escalating_create(&h, 5);
        let entry = h
            .service
            .execute_test(&created.id, TestType::EscalationFlow, true, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Success);
        let sent = h.transport.take_sent();
        assert_eq!(sent[0].recipient, SECONDARY);
        assert!(sent[0].content.starts_with("[TEST] "));
    }

    #[tokio::test]
    async fn escalation_flow_test_without_rule_fails() {
        let h = harness();
        let created = basic_create(&h);
        let entry = h
            .service
            .execute_test(&created.id, TestType::EscalationFlow, true, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Failed);
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn validation_test_passes_clean_reminder() {
        let h = harness();
        let created = basic_create(&h);
        let entry = h
            .service
            .execute_test(&created.id, TestType::Validation, true, ADMIN)
            .await
            .unwrap();
        assert_eq!(entry.result, TestResult::Success);
        assert_eq!(h.transport.sent_count(), 0);
    }

    // -- Flush --

    #[test]
    fn flush_all_counts_removed() {
        let h = harness();
        basic_create(&h);
        basic_create(&h);
        assert_eq!(h.service.flush_all().unwrap(), 2);
        let (_, total) = h.service.list(None, 10, 0).unwrap();
        assert_eq!(total, 0);
    }
}
