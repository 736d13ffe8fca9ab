//! Signed acknowledgement links.
//!
//! `GET /ack/{id}?action=...&token=...` lets a recipient answer from a
//! plain link (email forward, mobile notification) without the chat
//! platform. The token is an HMAC-SHA256 over `(reminder id, action)`
//! with the server secret, so a link for one reminder/action pair cannot
//! be replayed against another.

use crate::service::ResponseAction;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub(crate) struct AckTokenSigner {
    key: Vec<u8>,
}

impl AckTokenSigner {
    pub(crate) fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, reminder_id: &str, action: ResponseAction) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(reminder_id.as_bytes());
        mac.update(b":");
        mac.update(action.as_str().as_bytes());
        mac
    }

    /// Hex token for `(reminder_id, action)`.
    pub(crate) fn mint(&self, reminder_id: &str, action: ResponseAction) -> String {
        hex::encode(self.mac(reminder_id, action).finalize().into_bytes())
    }

    /// Constant-time verification.
    pub(crate) fn verify(&self, reminder_id: &str, action: ResponseAction, token: &str) -> bool {
        let Ok(bytes) = hex::decode(token) else {
            return false;
        };
        self.mac(reminder_id, action).verify_slice(&bytes).is_ok()
    }
}

impl std::fmt::Debug for AckTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTokenSigner").finish_non_exhaustive()
    }
}

/// Builds the public ack/decline URLs embedded in outbound reminders,
/// for recipients answering outside the chat platform.
#[derive(Debug, Clone)]
pub(crate) struct AckLinkBuilder {
    signer: std::sync::Arc<AckTokenSigner>,
    base_url: String,
}

impl AckLinkBuilder {
    pub(crate) fn new(signer: std::sync::Arc<AckTokenSigner>, base_url: impl Into<String>) -> Self {
        Self {
            signer,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    pub(crate) fn url_for(&self, reminder_id: &str, action: ResponseAction) -> String {
        let token = self.signer.mint(reminder_id, action);
        format!(
            "{}/ack/{reminder_id}?action={}&token={token}",
            self.base_url,
            action.as_str()
        )
    }

    /// The footer appended to reminder DMs.
    pub(crate) fn footer(&self, reminder_id: &str) -> String {
        format!(
            "\n\nAcknowledge: {}\nDecline: {}",
            self.url_for(reminder_id, ResponseAction::Acknowledge),
            self.url_for(reminder_id, ResponseAction::Decline),
        )
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_round_trips() {
        let signer = AckTokenSigner::new(b"secret".to_vec());
        let token = signer.mint("rem_1", ResponseAction::Acknowledge);
        assert!(signer.verify("rem_1", ResponseAction::Acknowledge, &token));
    }

    #[test]
    fn token_is_bound_to_reminder_and_action() {
        let signer = AckTokenSigner::new(b"secret".to_vec());
        let token = signer.mint("rem_1", ResponseAction::Acknowledge);
        assert!(!signer.verify("rem_2", ResponseAction::Acknowledge, &token));
        assert!(!signer.verify("rem_1", ResponseAction::Decline, &token));
    }

    #[test]
    fn different_keys_do_not_cross_verify() {
        let a = AckTokenSigner::new(b"key-a".to_vec());
        let b = AckTokenSigner::new(b"key-b".to_vec());
        let token = a.mint("rem_1", ResponseAction::Decline);
        assert!(!b.verify("rem_1", ResponseAction::Decline, &token));
    }

    #[test]
    fn link_builder_embeds_token_and_action() {
        let signer = std::sync::Arc::new(AckTokenSigner::new(b"secret".to_vec()));
        let builder = AckLinkBuilder::new(std::sync::Arc::clone(&signer), "https://nudge.test/");
        let url = builder.url_for("rem_1", ResponseAction::Acknowledge);
        assert!(url.starts_with("https://nudge.test/ack/rem_1?action=acknowledge&token="));
        let token = url.rsplit('=').next().unwrap();
        assert!(signer.verify("rem_1", ResponseAction::Acknowledge, token));

        let footer = builder.footer("rem_1");
        assert!(footer.contains("Acknowledge: https://nudge.test/ack/rem_1"));
        assert!(footer.contains("action=decline"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let signer = AckTokenSigner::new(b"secret".to_vec());
        assert!(!signer.verify("rem_1", ResponseAction::Acknowledge, "not-hex"));
        assert!(!signer.verify("rem_1", ResponseAction::Acknowledge, ""));
        assert!(!signer.verify("rem_1", ResponseAction::Acknowledge, "deadbeef"));
    }
}
