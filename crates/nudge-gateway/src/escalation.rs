//! Escalation engine.
//!
//! Two entry points, one action: the periodic scan over elapsed ack
//! deadlines, and the synchronous hand-off from a decline. Both converge
//! on [`EscalationEngine::escalate`], which re-reads the record, renders
//! the escalation message, sends it to the secondary recipient, and
//! commits the state change — or the retry bookkeeping when the send
//! fails.

use crate::service::retry_conflicts;
use chrono::Duration as ChronoDuration;
use nudge_core::retry::RetryPolicy;
use nudge_core::{
    Clock, Conflict, Error, Reminder, ResponseLog, ResponseType, Result, SYSTEM_ACTOR, Status,
    Transport, TriggerCondition,
};
use nudge_store::ReminderRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How long an escalation is parked after its retry budget is spent.
const PARK_AFTER_EXHAUSTION_MINUTES: i64 = 60;

const DEFAULT_TIMEOUT_TEMPLATE: &str = "⏰ Escalation: <@{targetUserId}> has not responded to a \
     reminder within {timeoutMinutes} minutes.\nOriginal reminder (scheduled {scheduledTime}): \
     {content}";

const DEFAULT_DECLINE_TEMPLATE: &str = "⚠️ Escalation: <@{targetUserId}> declined a reminder.\n\
     Original reminder (scheduled {scheduledTime}): {content}";

/// Render the outbound escalation text: the rule's custom message when
/// non-empty, the default template otherwise, with placeholders filled in.
pub(crate) fn render_escalation_message(
    reminder: &Reminder,
    rule: &nudge_core::EscalationRule,
    reason: TriggerCondition,
) -> String {
    let custom = match reason {
        TriggerCondition::Timeout => rule.timeout_message.as_deref(),
        TriggerCondition::Decline => rule.decline_message.as_deref(),
    };
    let template = match custom {
        Some(text) if !text.trim().is_empty() => text,
        _ => match reason {
            TriggerCondition::Timeout => DEFAULT_TIMEOUT_TEMPLATE,
            TriggerCondition::Decline => DEFAULT_DECLINE_TEMPLATE,
        },
    };
    template
        .replace("{content}", &reminder.content)
        .replace("{targetUserId}", &reminder.target_user_id)
        .replace(
            "{scheduledTime}",
            &reminder.scheduled_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )
        .replace("{timeoutMinutes}", &rule.timeout_minutes.to_string())
}

pub(crate) struct EscalationEngine {
    repo: ReminderRepo,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl EscalationEngine {
    pub(crate) fn new(
        repo: ReminderRepo,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            transport,
            clock,
            retry: RetryPolicy::escalation(),
        }
    }

    /// One scan pass: escalate everything whose deadline has elapsed.
    pub(crate) async fn tick(&self) {
        let now = self.clock.now();
        let candidates = match self.repo.delivered_with_escalation(now) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "escalation scan failed");
                return;
            }
        };
        for reminder in candidates {
            let reason = match reminder.status {
                Status::Sent => TriggerCondition::Timeout,
                Status::Declined => TriggerCondition::Decline,
                _ => continue,
            };
            if let Err(e) = self.escalate(&reminder.id, reason).await {
                error!(reminder.id = %reminder.id, error = %e, "escalation failed");
            }
        }
    }

    /// Escalate one reminder for `reason`. Returns `Ok(true)` when the
    /// reminder transitioned to `Escalated`; `Ok(false)` when it was not
    /// eligible (answered meanwhile, rule gone) or the send failed and
    /// retry bookkeeping was recorded instead.
    pub(crate) async fn escalate(&self, id: &str, reason: TriggerCondition) -> Result<bool> {
        let span = info_span!("escalation", reminder.id = %id, reason = %reason);
        async {
            let Some(reminder) = self.repo.get(id)? else {
                debug!("reminder vanished before escalation");
                return Ok(false);
            };
            let Some(rule) = reminder.escalation.clone().filter(|r| r.pending()) else {
                debug!("no pending escalation rule");
                return Ok(false);
            };
            let eligible = match (reminder.status, reason) {
                (Status::Sent, TriggerCondition::Timeout) => {
                    rule.triggers_on(TriggerCondition::Timeout)
                }
                (Status::Sent | Status::Declined, TriggerCondition::Decline) => {
                    rule.triggers_on(TriggerCondition::Decline)
                }
                _ => false,
            };
            if !eligible {
                debug!(status = %reminder.status, "not eligible for escalation");
                return Ok(false);
            }

            let text = render_escalation_message(&reminder, &rule, reason);
            match self
                .transport
                .send_escalation(&rule.secondary_user_id, id, &text)
                .await
            {
                Ok(message_id) => {
                    self.commit_escalated(id, reason, &message_id)?;
                    info!(
                        secondary = %rule.secondary_user_id,
                        message.id = %message_id,
                        "escalation sent"
                    );
                    Ok(true)
                }
                Err(e) if matches!(e, Error::TransportTransient { .. } | Error::TransportPermanent { .. }) => {
                    warn!(error = %e, "escalation send failed");
                    self.commit_send_failure(id, &e)?;
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await
    }

    /// Commit the successful escalation. If the reminder was answered
    /// between our send and this commit, leave it alone.
    fn commit_escalated(&self, id: &str, reason: TriggerCondition, message_id: &str) -> Result<()> {
        let outcome = retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                if !r.status.can_transition_to(Status::Escalated) {
                    return Err(Conflict::IllegalTransition {
                        from: r.status,
                        to: Status::Escalated,
                    }
                    .into());
                }
                r.status = Status::Escalated;
                r.updated_at = now;
                if let Some(rule) = &mut r.escalation {
                    rule.triggered_at = Some(now);
                    rule.trigger_reason = Some(reason);
                    rule.last_error = None;
                    rule.next_attempt_after = None;
                    rule.attempts = 0;
                }
                r.push_response(
                    ResponseLog::new(SYSTEM_ACTOR, ResponseType::Escalated, now)
                        .with_message_id(message_id),
                )
            })
        });
        match outcome {
            Ok(_) => Ok(()),
            Err(Error::Conflict(Conflict::IllegalTransition { from, .. })) => {
                warn!(
                    reminder.id = %id,
                    status = %from,
                    "reminder answered while escalation was in flight"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commit retry bookkeeping for a failed send. Status is untouched, so
    /// the deadline entry stays and the next scan picks the reminder up
    /// again once `next_attempt_after` passes.
    fn commit_send_failure(&self, id: &str, send_error: &Error) -> Result<()> {
        let retry_after = send_error.retry_after();
        let message = send_error.to_string();
        retry_conflicts(|| {
            let now = self.clock.now();
            self.repo.update(id, |r| {
                let Some(rule) = &mut r.escalation else {
                    return Ok(());
                };
                rule.attempts += 1;
                rule.last_error = Some(message.clone());
                if self.retry.exhausted(rule.attempts) {
                    rule.next_attempt_after =
                        Some(now + ChronoDuration::minutes(PARK_AFTER_EXHAUSTION_MINUTES));
                    rule.attempts = 0;
                } else {
                    rule.next_attempt_after =
                        Some(self.retry.next_attempt_at(now, rule.attempts - 1, retry_after));
                }
                r.updated_at = now;
                Ok(())
            })
        })
        .map(|_| ())
    }
}

/// The 120-second escalation job. Each tick body runs to completion
/// before the next fire is observed, so invocations never overlap.
pub(crate) async fn run_escalation_loop(
    engine: Arc<EscalationEngine>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_secs = period.as_secs(), "escalation loop started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick().await;
            }
            () = shutdown.cancelled() => {
                info!("escalation loop shutting down");
                return;
            }
        }
    }
}
