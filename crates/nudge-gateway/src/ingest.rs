//! Response ingestion.
//!
//! Inbound envelopes (button interactions from the webhook, signed ack
//! links) are normalized to an `(action, reminder_id, actor)` triple and
//! handed to the service. Identity is authenticated upstream — the
//! fronting proxy verifies interaction signatures, the link route
//! verifies its HMAC — so this module only parses and routes.

use crate::service::{ReminderService, ResponseAction};
use nudge_core::{Error, Reminder, Result};
use regex::Regex;
use std::sync::LazyLock;
use tracing::info;

static CUSTOM_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(acknowledge|decline)_reminder(?:_(.+))?$").expect("custom id regex is valid")
});

/// A parsed button custom id. `reminder_id` is absent in the legacy form
/// (`acknowledge_reminder` with no id suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedCustomId {
    pub action: ResponseAction,
    pub reminder_id: Option<String>,
}

pub(crate) fn parse_custom_id(custom_id: &str) -> Option<ParsedCustomId> {
    let captures = CUSTOM_ID.captures(custom_id)?;
    let action = match captures.get(1)?.as_str() {
        "acknowledge" => ResponseAction::Acknowledge,
        "decline" => ResponseAction::Decline,
        _ => return None,
    };
    Some(ParsedCustomId {
        action,
        reminder_id: captures.get(2).map(|m| m.as_str().to_owned()),
    })
}

/// The fields the ingestor needs from a platform interaction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InteractionEvent {
    pub custom_id: String,
    pub actor_id: String,
}

/// Pull `data.custom_id` and the actor id out of a raw interaction
/// object. The actor lives under `member.user.id` in guild interactions
/// and `user.id` in DM interactions.
pub(crate) fn parse_interaction(payload: &serde_json::Value) -> Result<InteractionEvent> {
    let custom_id = payload["data"]["custom_id"]
        .as_str()
        .ok_or_else(|| Error::validation("data.custom_id", "missing or not a string"))?;
    let actor_id = payload["member"]["user"]["id"]
        .as_str()
        .or_else(|| payload["user"]["id"].as_str())
        .ok_or_else(|| Error::validation("user.id", "no actor id in interaction"))?;
    Ok(InteractionEvent {
        custom_id: custom_id.to_owned(),
        actor_id: actor_id.to_owned(),
    })
}

#[derive(Debug)]
pub(crate) enum IngestOutcome {
    /// The response was mapped to a reminder and applied.
    Applied {
        reminder: Reminder,
        action: ResponseAction,
    },
    /// Legacy custom id with no reminder id: recorded, nothing applied.
    Legacy { action: ResponseAction },
}

/// Route a parsed interaction into the service.
pub(crate) async fn process_interaction(
    service: &ReminderService,
    event: &InteractionEvent,
) -> Result<IngestOutcome> {
    let parsed = parse_custom_id(&event.custom_id)
        .ok_or_else(|| Error::validation("data.custom_id", "unrecognized custom id"))?;

    match parsed.reminder_id {
        Some(reminder_id) => {
            let reminder = service
                .record_response(&reminder_id, &event.actor_id, parsed.action)
                .await?;
            Ok(IngestOutcome::Applied {
                reminder,
                action: parsed.action,
            })
        }
        None => {
            info!(
                actor = %event.actor_id,
                action = ?parsed.action,
                "legacy response event without reminder id, recorded only"
            );
            Ok(IngestOutcome::Legacy {
                action: parsed.action,
            })
        }
    }
}

/// User-facing reply for the interaction response.
pub(crate) fn reply_text(outcome: &IngestOutcome) -> String {
    match outcome {
        IngestOutcome::Applied {
            action: ResponseAction::Acknowledge,
            ..
        } => "✅ Reminder acknowledged.".to_owned(),
        IngestOutcome::Applied {
            reminder,
            action: ResponseAction::Decline,
        } => {
            if reminder.status == nudge_core::Status::Escalated {
                "❌ Reminder declined — the secondary contact has been notified.".to_owned()
            } else {
                "❌ Reminder declined.".to_owned()
            }
        }
        IngestOutcome::Legacy { .. } => "Response recorded.".to_owned(),
    }
}
