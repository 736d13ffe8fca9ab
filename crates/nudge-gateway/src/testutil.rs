//! Shared test fixtures: a service wired to fakes over an in-memory store.
#![allow(clippy::unwrap_used)]

use crate::escalation::EscalationEngine;
use crate::service::ReminderService;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use nudge_core::fakes::{FakeClock, FakeTransport};
use nudge_core::{Clock, CreateReminder, EscalationInput, Reminder, Transport, TriggerCondition};
use nudge_store::{MemKv, ReminderRepo};
use std::sync::Arc;

pub(crate) const ADMIN: &str = "99999999999999999";
pub(crate) const TARGET: &str = "12345678901234567";
pub(crate) const SECONDARY: &str = "11111111111111111";

pub(crate) struct Harness {
    pub service: Arc<ReminderService>,
    pub repo: ReminderRepo,
    pub clock: Arc<FakeClock>,
    pub transport: Arc<FakeTransport>,
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn harness() -> Harness {
    let kv = Arc::new(MemKv::new());
    let repo = ReminderRepo::new(kv);
    let clock = Arc::new(FakeClock::new(t0()));
    let transport = Arc::new(FakeTransport::new());
    let escalation = Arc::new(EscalationEngine::new(
        repo.clone(),
        Arc::<FakeTransport>::clone(&transport) as Arc<dyn Transport>,
        Arc::<FakeClock>::clone(&clock) as Arc<dyn Clock>,
    ));
    let service = Arc::new(ReminderService::new(
        repo.clone(),
        Arc::<FakeTransport>::clone(&transport) as Arc<dyn Transport>,
        Arc::<FakeClock>::clone(&clock) as Arc<dyn Clock>,
        escalation,
        Some("55555555555555555".to_owned()),
    ));
    Harness {
        service,
        repo,
        clock,
        transport,
    }
}

/// A plain reminder due one minute after `t0`.
pub(crate) fn basic_create(h: &Harness) -> Reminder {
    h.service
        .create(
            CreateReminder {
                content: "water the plants".to_owned(),
                target_user_id: TARGET.to_owned(),
                scheduled_time: t0() + ChronoDuration::minutes(1),
                timezone: None,
                escalation: None,
                repeat_rule: None,
            },
            ADMIN,
        )
        .unwrap()
}

/// A reminder with a timeout+decline escalation rule, due one minute
/// after `t0`.
pub(crate) fn escalating_create(h: &Harness, timeout_minutes: u32) -> Reminder {
    h.service
        .create(
            CreateReminder {
                content: "file the report".to_owned(),
                target_user_id: TARGET.to_owned(),
                scheduled_time: t0() + ChronoDuration::minutes(1),
                timezone: None,
                escalation: Some(EscalationInput {
                    secondary_user_id: SECONDARY.to_owned(),
                    timeout_minutes,
                    trigger_conditions: vec![
                        TriggerCondition::Timeout,
                        TriggerCondition::Decline,
                    ],
                    timeout_message: None,
                    decline_message: None,
                }),
                repeat_rule: None,
            },
            ADMIN,
        )
        .unwrap()
}
