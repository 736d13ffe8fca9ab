//! Core types for Nudge.
//!
//! These are Nudge's first-class entities. The store crate persists them as
//! canonical JSON; the gateway's HTTP surface serializes the same types, so
//! the wire form and the persisted form never drift apart. Timestamps are
//! RFC 3339 UTC throughout, which keeps the time-ordered indexes lexically
//! sortable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Actor id recorded on log entries written by the engine itself rather
/// than a chat-platform user.
pub const SYSTEM_ACTOR: &str = "system";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a reminder occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Sent,
    Acknowledged,
    Declined,
    Escalated,
    EscalatedAck,
    EscalatedDeclined,
    Failed,
    Cancelled,
    Expired,
}

impl Status {
    /// Stable string form, used in the by-status index keyspace.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Declined => "declined",
            Self::Escalated => "escalated",
            Self::EscalatedAck => "escalated_ack",
            Self::EscalatedDeclined => "escalated_declined",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "acknowledged" => Some(Self::Acknowledged),
            "declined" => Some(Self::Declined),
            "escalated" => Some(Self::Escalated),
            "escalated_ack" => Some(Self::EscalatedAck),
            "escalated_declined" => Some(Self::EscalatedDeclined),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// The legal transition table. Staying in the same state (a retry that
    /// leaves a reminder `Pending`) is not a transition and is not listed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Sent | Self::Failed | Self::Cancelled | Self::Expired
            ) | (
                Self::Sent,
                Self::Acknowledged | Self::Declined | Self::Escalated
            ) | (Self::Declined, Self::Escalated)
                | (Self::Escalated, Self::EscalatedAck | Self::EscalatedDeclined)
        )
    }

    /// Terminal states accept no further transitions from the engine.
    /// `Declined` is terminal only when no decline-escalation is pending,
    /// which callers check via [`Reminder::pending_decline_escalation`].
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Acknowledged
                | Self::EscalatedAck
                | Self::EscalatedDeclined
                | Self::Failed
                | Self::Cancelled
                | Self::Expired
        )
    }

    /// States from which an admin reset back to `Pending` is refused:
    /// the recipient already answered, so re-sending would be noise.
    pub fn is_answered(self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::Declined | Self::EscalatedAck | Self::EscalatedDeclined
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Response log
// ---------------------------------------------------------------------------

/// Normalized response/event kind recorded on a reminder's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Acknowledged,
    Declined,
    Delivered,
    FailedDelivery,
    Escalated,
    Cancelled,
}

/// One append-only audit entry. Entries are strictly non-decreasing by
/// `timestamp` within a reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseLog {
    pub id: String,
    pub user_id: String,
    pub response_type: ResponseType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ResponseLog {
    pub fn new(
        user_id: impl Into<String>,
        response_type: ResponseType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("rsp_{}", Uuid::new_v4().simple()),
            user_id: user_id.into(),
            response_type,
            timestamp,
            message_id: None,
            metadata: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ---------------------------------------------------------------------------
// Test executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    ImmediateDelivery,
    EscalationFlow,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Success,
    Failed,
    Partial,
}

/// Record of an admin-triggered dry run against a reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecution {
    pub id: String,
    pub executed_by: String,
    pub executed_at: DateTime<Utc>,
    pub test_type: TestType,
    pub result: TestResult,
    pub preserved_schedule: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TestExecution {
    pub fn new(
        executed_by: impl Into<String>,
        executed_at: DateTime<Utc>,
        test_type: TestType,
        result: TestResult,
        preserved_schedule: bool,
    ) -> Self {
        Self {
            id: format!("tst_{}", Uuid::new_v4().simple()),
            executed_by: executed_by.into(),
            executed_at,
            test_type,
            result,
            preserved_schedule,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// What causes an escalation to the secondary recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerCondition {
    Timeout,
    Decline,
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Decline => f.write_str("decline"),
        }
    }
}

/// Escalation rule attached to a reminder.
///
/// `attempts`, `last_error` and `next_attempt_after` are engine bookkeeping
/// for the escalation-send retry policy; they are reset when a rule is
/// replaced through an admin update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
    pub secondary_user_id: String,
    pub timeout_minutes: u32,
    pub trigger_conditions: Vec<TriggerCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<TriggerCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    pub is_active: bool,
}

impl EscalationRule {
    pub fn triggers_on(&self, condition: TriggerCondition) -> bool {
        self.trigger_conditions.contains(&condition)
    }

    /// True while the rule can still fire: active and not yet triggered.
    pub fn pending(&self) -> bool {
        self.is_active && self.triggered_at.is_none()
    }

    /// The answer deadline for a delivery at `delivered_at`.
    pub fn deadline_after(&self, delivered_at: DateTime<Utc>) -> DateTime<Utc> {
        delivered_at + Duration::minutes(i64::from(self.timeout_minutes))
    }
}

// ---------------------------------------------------------------------------
// Repeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndCondition {
    Never,
    Date,
    Count,
}

/// Recurrence rule. Each occurrence is its own reminder record; the chain
/// is linked only by this rule travelling forward with a bumped
/// `current_occurrence`, so there are no parent pointers to keep alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub end_condition: EndCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    pub current_occurrence: u32,
    pub next_scheduled_time: DateTime<Utc>,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Reminder
// ---------------------------------------------------------------------------

/// The root entity: one scheduled delivery occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub content: String,
    pub target_user_id: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: Status,
    #[serde(default)]
    pub delivery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_attempt: Option<DateTime<Utc>>,
    /// Retry bookkeeping: when set, the dispatch loop treats this instant
    /// (not `scheduled_time`) as the next due time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub responses: Vec<ResponseLog>,
    #[serde(default)]
    pub test_executions: Vec<TestExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_rule: Option<RepeatRule>,
}

/// Mint a fresh reminder id.
pub fn new_reminder_id() -> String {
    format!("rem_{}", Uuid::new_v4().simple())
}

impl Reminder {
    /// The instant the dispatch loop considers this reminder due.
    pub fn due_time(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.scheduled_time)
    }

    /// Append an audit entry, enforcing non-decreasing timestamps.
    pub fn push_response(&mut self, entry: ResponseLog) -> crate::Result<()> {
        if let Some(last) = self.responses.last()
            && entry.timestamp < last.timestamp
        {
            return Err(crate::Error::Internal(format!(
                "response log for {} would go backwards: {} < {}",
                self.id, entry.timestamp, last.timestamp
            )));
        }
        self.responses.push(entry);
        Ok(())
    }

    /// Append a test execution entry, enforcing non-decreasing timestamps.
    pub fn push_test_execution(&mut self, entry: TestExecution) -> crate::Result<()> {
        if let Some(last) = self.test_executions.last()
            && entry.executed_at < last.executed_at
        {
            return Err(crate::Error::Internal(format!(
                "test log for {} would go backwards: {} < {}",
                self.id, entry.executed_at, last.executed_at
            )));
        }
        self.test_executions.push(entry);
        Ok(())
    }

    /// True when a decline has been recorded but its escalation send has
    /// not yet succeeded.
    pub fn pending_decline_escalation(&self) -> bool {
        self.status == Status::Declined
            && self
                .escalation
                .as_ref()
                .is_some_and(|e| e.pending() && e.triggers_on(TriggerCondition::Decline))
    }

    /// The instant at which this reminder becomes eligible for escalation,
    /// if any. This drives the ack-deadline index:
    ///
    /// * `Sent` with a pending timeout-trigger rule — the answer deadline,
    ///   pushed out by `next_attempt_after` while the escalation send is
    ///   backing off.
    /// * `Declined` with a pending decline-trigger rule — the decline
    ///   instant (the sync send failed; the scan retries it), likewise
    ///   pushed out while backing off.
    pub fn ack_deadline(&self) -> Option<DateTime<Utc>> {
        let rule = self.escalation.as_ref().filter(|e| e.pending())?;
        let base = match self.status {
            Status::Sent if rule.triggers_on(TriggerCondition::Timeout) => {
                let delivered = self.last_delivery_attempt?;
                rule.deadline_after(delivered)
            }
            Status::Declined if rule.triggers_on(TriggerCondition::Decline) => self
                .responses
                .iter()
                .rev()
                .find(|r| r.response_type == ResponseType::Declined)
                .map_or(self.updated_at, |r| r.timestamp),
            _ => return None,
        };
        Some(match rule.next_attempt_after {
            Some(after) if after > base => after,
            _ => base,
        })
    }
}

// ---------------------------------------------------------------------------
// Command inputs
// ---------------------------------------------------------------------------

/// Escalation rule as supplied by an admin command; engine bookkeeping
/// fields are not settable from the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationInput {
    pub secondary_user_id: String,
    pub timeout_minutes: u32,
    pub trigger_conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub timeout_message: Option<String>,
    #[serde(default)]
    pub decline_message: Option<String>,
}

impl EscalationInput {
    pub fn into_rule(self) -> EscalationRule {
        EscalationRule {
            secondary_user_id: self.secondary_user_id,
            timeout_minutes: self.timeout_minutes,
            trigger_conditions: self.trigger_conditions,
            timeout_message: self.timeout_message,
            decline_message: self.decline_message,
            triggered_at: None,
            trigger_reason: None,
            last_error: None,
            next_attempt_after: None,
            attempts: 0,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatInput {
    pub frequency: Frequency,
    pub interval: u32,
    pub end_condition: EndCondition,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_occurrences: Option<u32>,
}

impl RepeatInput {
    pub fn into_rule(self, first_occurrence: DateTime<Utc>) -> RepeatRule {
        RepeatRule {
            frequency: self.frequency,
            interval: self.interval,
            end_condition: self.end_condition,
            end_date: self.end_date,
            max_occurrences: self.max_occurrences,
            current_occurrence: 1,
            next_scheduled_time: first_occurrence,
            is_active: true,
        }
    }
}

/// Payload for the Create command (`POST /api/reminders`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReminder {
    pub content: String,
    pub target_user_id: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub escalation: Option<EscalationInput>,
    #[serde(default)]
    pub repeat_rule: Option<RepeatInput>,
}

/// Payload for the Update command (`PUT /api/reminders/{id}`). Absent
/// fields are left unchanged; a present `escalation` or `repeat_rule`
/// replaces the prior rule wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReminder {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub escalation: Option<EscalationInput>,
    #[serde(default)]
    pub repeat_rule: Option<RepeatInput>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
