//! Dispatch loop.
//!
//! The 60-second due-scan job: find pending reminders whose due time has
//! passed, send each one, and record the outcome. Within a tick reminders
//! are processed one at a time in ascending due order; every record is
//! re-read immediately before sending so a concurrent cancel or edit is
//! observed, and the version-checked commit catches anything that slips
//! between the re-read and the write.

use crate::ack_link::AckLinkBuilder;
use crate::service::ReminderService;
use chrono::Duration as ChronoDuration;
use nudge_core::retry::RetryPolicy;
use nudge_core::{Clock, Error, Status, Transport};
use nudge_store::ReminderRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// A reminder past its due time by more than this with no retry budget
/// left expires instead of being delivered absurdly late.
const EXPIRY_GRACE_MINUTES: i64 = 10;

/// Budget for a single reminder within a tick; slower work is abandoned
/// and re-attempted on the next tick.
const PER_REMINDER_BUDGET: Duration = Duration::from_secs(45);

pub(crate) struct Dispatcher {
    service: Arc<ReminderService>,
    repo: ReminderRepo,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    /// When present, reminder DMs carry signed ack/decline links.
    ack_links: Option<AckLinkBuilder>,
}

impl Dispatcher {
    pub(crate) fn new(
        service: Arc<ReminderService>,
        repo: ReminderRepo,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        ack_links: Option<AckLinkBuilder>,
    ) -> Self {
        let retry = service.retry_policy();
        Self {
            service,
            repo,
            transport,
            clock,
            retry,
            ack_links,
        }
    }

    /// One due-scan pass.
    pub(crate) async fn tick(&self) {
        let now = self.clock.now();
        let due = match self.repo.due_reminders(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "due scan failed");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "due reminders found");

        for reminder in due {
            let outcome =
                tokio::time::timeout(PER_REMINDER_BUDGET, self.dispatch_one(&reminder.id)).await;
            if outcome.is_err() {
                warn!(
                    reminder.id = %reminder.id,
                    budget_secs = PER_REMINDER_BUDGET.as_secs(),
                    "reminder dispatch exceeded budget, abandoned until next tick"
                );
            }
        }
    }

    async fn dispatch_one(&self, id: &str) {
        let span = info_span!("dispatch", reminder.id = %id);
        async {
            // Re-read: the scan snapshot may be stale by now.
            let reminder = match self.repo.get(id) {
                Ok(Some(reminder)) => reminder,
                Ok(None) => {
                    debug!("reminder deleted since scan");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to re-read reminder");
                    return;
                }
            };
            if reminder.status != Status::Pending {
                debug!(status = %reminder.status, "status changed since scan, skipping");
                return;
            }

            let now = self.clock.now();
            let overdue = now - reminder.due_time();

            if self.retry.exhausted(reminder.delivery_attempts)
                && overdue > ChronoDuration::minutes(EXPIRY_GRACE_MINUTES)
            {
                match self.service.expire(id) {
                    Ok(_) => info!("reminder expired: past grace with no retry budget"),
                    Err(e) => warn!(error = %e, "failed to expire reminder"),
                }
                return;
            }

            if overdue > ChronoDuration::seconds(60) {
                warn!(
                    late_by_secs = overdue.num_seconds(),
                    "firing late reminder (gateway was likely down)"
                );
            }

            let content = match &self.ack_links {
                Some(links) => format!("{}{}", reminder.content, links.footer(id)),
                None => reminder.content.clone(),
            };
            match self
                .transport
                .send_reminder(&reminder.target_user_id, id, &content)
                .await
            {
                Ok(message_id) => self.record_success(id, &message_id),
                Err(e) if e.is_transient_transport() => {
                    let retry_after = e.retry_after();
                    warn!(error = %e, "transient delivery failure");
                    match self
                        .service
                        .record_transient_failure(id, &e.to_string(), retry_after)
                    {
                        Ok(r) if r.status == Status::Failed => {
                            warn!(attempts = r.delivery_attempts, "retry budget exhausted");
                        }
                        Ok(r) => {
                            debug!(next_retry = ?r.next_retry_at, "delivery rescheduled");
                        }
                        Err(e) => warn!(error = %e, "failed to record transient failure"),
                    }
                }
                Err(e @ Error::TransportPermanent { .. }) => {
                    warn!(error = %e, "permanent delivery failure");
                    if let Err(e) = self.service.record_permanent_failure(id, &e.to_string()) {
                        warn!(error = %e, "failed to record permanent failure");
                    }
                }
                Err(e) => {
                    error!(error = %e, "unexpected delivery error");
                }
            }
        }
        .instrument(span)
        .await;
    }

    fn record_success(&self, id: &str, message_id: &str) {
        match self.service.mark_as_delivered(id, message_id) {
            Ok(sent) => {
                info!(message.id = %message_id, attempts = sent.delivery_attempts, "reminder delivered");
                if sent.repeat_rule.as_ref().is_some_and(|rule| rule.is_active) {
                    match self.service.schedule_next_repeat(id) {
                        Ok(Some(next)) => {
                            info!(next.id = %next.id, next.scheduled = %next.scheduled_time, "recurrence scheduled");
                        }
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "failed to schedule recurrence"),
                    }
                }
            }
            Err(e) => {
                // Sent but not recorded: a concurrent writer (cancel,
                // delete) won the commit. The message is out; state
                // reflects the winner.
                warn!(error = %e, "delivery succeeded but was not recorded");
            }
        }
    }
}

/// The 60-second due-scan job. Tick bodies run to completion before the
/// next fire is observed, so invocations never overlap.
pub(crate) async fn run_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_secs = period.as_secs(), "dispatch loop started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                dispatcher.tick().await;
            }
            () = shutdown.cancelled() => {
                info!("dispatch loop shutting down");
                return;
            }
        }
    }
}
