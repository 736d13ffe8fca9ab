//! Discord REST transport.
//!
//! Reminders go out as direct messages carrying an acknowledge/decline
//! button row; the button custom ids embed the reminder id
//! (`acknowledge_reminder_<id>` / `decline_reminder_<id>`) so the webhook
//! ingestor can correlate responses. Escalations are plain DMs.
//!
//! Failure categorization drives the retry policy upstream: connection
//! errors, timeouts, 429 and 5xx are transient (429 carries the server's
//! retry-after); any other 4xx is permanent.

use async_trait::async_trait;
use nudge_core::{Error, Result, Transport};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Per-call HTTP deadline; dispatch abandons slower sends anyway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const BUTTON_STYLE_SUCCESS: u8 = 3;
const BUTTON_STYLE_DANGER: u8 = 4;

#[derive(Debug, Clone)]
pub struct DiscordTransport {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

impl DiscordTransport {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Point the transport at a non-default API root (tests, proxies).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        })
    }

    /// Open (or reuse) the DM channel for a user. Discord dedupes this
    /// server-side, so calling it per send is fine.
    async fn open_dm(&self, user_id: &str) -> Result<String> {
        let url = format!("{}/users/@me/channels", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "recipient_id": user_id }))
            .send()
            .await
            .map_err(request_error)?;
        let channel: ObjectRef = parse_success(response, "open DM channel").await?;
        Ok(channel.id)
    }

    async fn post_message(
        &self,
        channel_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(payload)
            .send()
            .await
            .map_err(request_error)?;
        let message: ObjectRef = parse_success(response, "post message").await?;
        Ok(message.id)
    }
}

/// The acknowledge/decline button row for a reminder.
fn response_components(reminder_id: &str) -> serde_json::Value {
    serde_json::json!([{
        "type": 1,
        "components": [
            {
                "type": 2,
                "style": BUTTON_STYLE_SUCCESS,
                "label": "Acknowledge",
                "custom_id": format!("acknowledge_reminder_{reminder_id}"),
            },
            {
                "type": 2,
                "style": BUTTON_STYLE_DANGER,
                "label": "Decline",
                "custom_id": format!("decline_reminder_{reminder_id}"),
            },
        ],
    }])
}

fn request_error(e: reqwest::Error) -> Error {
    // Everything that failed before an HTTP status came back is worth a
    // retry: DNS, connect, TLS, timeout.
    Error::transient(format!("discord request failed: {e}"), None)
}

/// Map a non-2xx response onto the error taxonomy.
fn categorize_status(status: u16, retry_after: Option<Duration>, context: &str) -> Error {
    match status {
        429 => Error::transient(format!("discord rate limited while {context}"), retry_after),
        500..=599 => Error::transient(format!("discord {status} while {context}"), None),
        _ => Error::permanent(format!("discord {status} while {context}")),
    }
}

async fn parse_success<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| Error::transient(format!("discord response decode: {e}"), None));
    }

    let retry_after = if status.as_u16() == 429 {
        response
            .json::<RateLimitBody>()
            .await
            .ok()
            .and_then(|body| body.retry_after)
            .map(Duration::from_secs_f64)
    } else {
        None
    };
    Err(categorize_status(status.as_u16(), retry_after, context))
}

#[async_trait]
impl Transport for DiscordTransport {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send_reminder(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String> {
        let channel_id = self.open_dm(recipient).await?;
        let payload = serde_json::json!({
            "content": content,
            "components": response_components(reminder_id),
        });
        let message_id = self.post_message(&channel_id, &payload).await?;
        debug!(
            reminder.id = %reminder_id,
            recipient = %recipient,
            message.id = %message_id,
            "reminder delivered"
        );
        Ok(message_id)
    }

    async fn send_escalation(
        &self,
        recipient: &str,
        reminder_id: &str,
        content: &str,
    ) -> Result<String> {
        let channel_id = self.open_dm(recipient).await?;
        let payload = serde_json::json!({ "content": content });
        let message_id = self.post_message(&channel_id, &payload).await?;
        debug!(
            reminder.id = %reminder_id,
            recipient = %recipient,
            message.id = %message_id,
            "escalation delivered"
        );
        Ok(message_id)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_custom_ids_embed_reminder_id() {
        let components = response_components("rem_abc123");
        let row = &components[0];
        assert_eq!(row["type"], 1);
        assert_eq!(
            row["components"][0]["custom_id"],
            "acknowledge_reminder_rem_abc123"
        );
        assert_eq!(
            row["components"][1]["custom_id"],
            "decline_reminder_rem_abc123"
        );
        assert_eq!(row["components"][0]["style"], 3);
        assert_eq!(row["components"][1]["style"], 4);
    }

    #[test]
    fn rate_limit_is_transient_with_retry_after() {
        let err = categorize_status(429, Some(Duration::from_secs(12)), "post message");
        assert!(err.is_transient_transport());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503] {
            let err = categorize_status(status, None, "post message");
            assert!(err.is_transient_transport(), "status {status}");
            assert_eq!(err.retry_after(), None);
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 403, 404] {
            let err = categorize_status(status, None, "open DM channel");
            assert!(
                matches!(err, Error::TransportPermanent { .. }),
                "status {status}"
            );
        }
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let transport =
            DiscordTransport::with_base_url("token", "http://localhost:9999/api/").unwrap();
        assert_eq!(transport.base_url, "http://localhost:9999/api");
    }
}
