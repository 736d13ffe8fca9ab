//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::error::{Error, Result};
use crate::traits::{Clock, Transport};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// FakeClock
// ---------------------------------------------------------------------------

/// Manually advanced clock.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

/// What a scripted send should do.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success,
    Transient { retry_after: Option<std::time::Duration> },
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Reminder,
    Escalation,
}

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub kind: SendKind,
    pub recipient: String,
    pub reminder_id: String,
    pub content: String,
}

/// Fake transport: records every send and replays scripted outcomes.
/// With an empty script every send succeeds.
#[derive(Debug, Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<SendOutcome>>,
    sent: Mutex<Vec<SentMessage>>,
    next_message_id: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next unscripted send. Outcomes are
    /// consumed in order; once the queue drains, sends succeed again.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Drain and return everything sent so far.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn record(&self, message: SentMessage) -> Result<String> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Success);
        self.sent.lock().unwrap().push(message);
        match outcome {
            SendOutcome::Success => {
                let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
                Ok(format!("msg_{id}"))
            }
            SendOutcome::Transient { retry_after } => {
                Err(Error::transient("scripted transient failure", retry_after))
            }
            SendOutcome::Permanent => Err(Error::permanent("scripted permanent failure")),
        }
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send_reminder(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String> {
        self.record(SentMessage {
            kind: SendKind::Reminder,
            recipient: recipient.to_owned(),
            reminder_id: reminder_id.to_owned(),
            content: content.to_owned(),
        })
    }

    async fn send_escalation(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String> {
        self.record(SentMessage {
            kind: SendKind::Escalation,
            recipient: recipient.to_owned(),
            reminder_id: reminder_id.to_owned(),
            content: content.to_owned(),
        })
    }
}
