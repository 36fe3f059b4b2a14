use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use herald_core::{channel_names, ChannelConfig, RecipientKind};
use reqwest::Method;
use serde_json::json;
use sha2::Sha256;

use crate::{
    channel::{DeliveryChannel, SendParams},
    error::{ChannelError, ErrorCode},
    format::validate_webhook_url,
    http::dispatch,
    types::SendOutcome,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the request body when a secret is set.
pub const SIGNATURE_HEADER: &str = "X-Herald-Signature";
pub const DELIVERY_HEADER: &str = "X-Herald-Delivery";

/// Generic JSON webhook.
///
/// The target URL comes from `webhook_url` in the channel config, or from a
/// `webhook` recipient's target when the config carries none.
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method_for(config: Option<&ChannelConfig>) -> Result<Method, ChannelError> {
    match config
        .and_then(|c| c.webhook_method.as_deref())
        .map(|m| m.trim().to_ascii_uppercase())
        .as_deref()
    {
        None | Some("") | Some("POST") => Ok(Method::POST),
        Some("PUT") => Ok(Method::PUT),
        Some(other) => Err(ChannelError::config(
            channel_names::WEBHOOK,
            format!("unsupported method {other}"),
        )),
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &str {
        channel_names::WEBHOOK
    }

    fn supports_html(&self) -> bool {
        true
    }

    fn max_content_length(&self) -> Option<usize> {
        None
    }

    fn validate_config(&self, config: Option<&ChannelConfig>) -> Result<(), ChannelError> {
        if let Some(url) = config.and_then(|c| c.webhook_url.as_deref()) {
            if !validate_webhook_url(url) {
                return Err(ChannelError::config(
                    channel_names::WEBHOOK,
                    format!("invalid webhook URL: {url}"),
                ));
            }
        }
        method_for(config).map(|_| ())
    }

    async fn send(&self, params: SendParams<'_>) -> SendOutcome {
        let config = params.config;
        let url = match config.and_then(|c| c.webhook_url.as_deref()) {
            Some(url) => url,
            None if params.recipient.kind == RecipientKind::Webhook => {
                if !validate_webhook_url(&params.recipient.target) {
                    return SendOutcome::failed(
                        ErrorCode::InvalidRecipient,
                        format!("invalid webhook URL: {}", params.recipient.target),
                    );
                }
                params.recipient.target.as_str()
            }
            None => {
                return SendOutcome::failed(
                    ErrorCode::InvalidConfig,
                    "no webhook URL configured",
                )
            }
        };
        let method = match method_for(config) {
            Ok(m) => m,
            Err(e) => return SendOutcome::failed(e.error_code(), e.to_string()),
        };

        let payload = json!({
            "delivery_id": params.delivery_id,
            "subject": params.message.subject,
            "html": params.message.html,
            "text": params.message.text,
            "recipient": params.recipient,
            "sent_at": Utc::now().to_rfc3339(),
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return SendOutcome::failed(ErrorCode::Unknown, e.to_string()),
        };

        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(DELIVERY_HEADER, params.delivery_id);
        if let Some(cfg) = config {
            for (name, value) in &cfg.webhook_headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(auth) = cfg.webhook_auth.as_deref() {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }
            if let Some(secret) = cfg.webhook_secret.as_deref() {
                match sign_body(secret, &body) {
                    Some(sig) => request = request.header(SIGNATURE_HEADER, format!("sha256={sig}")),
                    None => {
                        return SendOutcome::failed(ErrorCode::InvalidConfig, "unusable webhook secret")
                    }
                }
            }
        }

        dispatch(channel_names::WEBHOOK, request.body(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_hex_hmac() {
        // RFC 4231 test case 2
        let sig = sign_body("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn config_validation() {
        let channel = WebhookChannel::new(reqwest::Client::new());
        assert!(channel.validate_config(None).is_ok());

        let bad_url = ChannelConfig {
            webhook_url: Some("ftp://example.com".into()),
            ..ChannelConfig::default()
        };
        assert!(channel.validate_config(Some(&bad_url)).is_err());

        let bad_method = ChannelConfig {
            webhook_url: Some("https://example.com/hook".into()),
            webhook_method: Some("DELETE".into()),
            ..ChannelConfig::default()
        };
        assert!(channel.validate_config(Some(&bad_method)).is_err());

        let put = ChannelConfig {
            webhook_url: Some("https://example.com/hook".into()),
            webhook_method: Some("put".into()),
            ..ChannelConfig::default()
        };
        assert!(channel.validate_config(Some(&put)).is_ok());
    }
}
