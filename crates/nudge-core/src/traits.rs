//! Contracts between the engine's components.
//!
//! Implementations live elsewhere: the Discord transport in
//! `nudge-channels`, the system clock here, fakes in [`crate::fakes`].

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Source of "now". Injected everywhere time matters so tests can steer it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outbound side of the chat platform.
///
/// Both calls return the platform's message id on success. Failures are
/// categorized by the implementation into
/// [`Error::TransportTransient`](crate::Error::TransportTransient) (retry
/// with backoff) or
/// [`Error::TransportPermanent`](crate::Error::TransportPermanent)
/// (terminal).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Platform name, for logs.
    fn name(&self) -> &str;

    /// Send the reminder text to `recipient` with acknowledge/decline
    /// affordances carrying `reminder_id`, so inbound responses can be
    /// correlated back to the record.
    async fn send_reminder(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String>;

    /// Send an escalation notice to the secondary recipient. No response
    /// affordances are attached; the message is informational.
    async fn send_escalation(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String>;
}
