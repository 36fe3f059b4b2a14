use async_trait::async_trait;
use herald_core::{channel_names, ChannelConfig};
use serde_json::{json, Value};

use crate::{
    channel::{DeliveryChannel, SendParams},
    error::{ChannelError, ErrorCode},
    format::validate_webhook_url,
    http::dispatch,
    types::{RenderedMessage, SendOutcome},
};

pub const SLACK_MAX_CONTENT: usize = 3000;

/// Slack incoming webhook.
pub struct SlackChannel {
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn webhook_url(config: Option<&ChannelConfig>) -> Result<&str, ChannelError> {
    let url = config
        .and_then(|c| c.slack_webhook_url.as_deref())
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ChannelError::config(channel_names::SLACK, "slack_webhook_url is required"))?;
    if !validate_webhook_url(url) {
        return Err(ChannelError::config(
            channel_names::SLACK,
            format!("invalid webhook URL: {url}"),
        ));
    }
    Ok(url)
}

pub(crate) fn build_payload(message: &RenderedMessage, config: Option<&ChannelConfig>) -> Value {
    let text = if message.subject.is_empty() {
        message.text.clone()
    } else {
        format!("*{}*\n\n{}", message.subject, message.text)
    };
    let mut payload = json!({ "text": text });
    if let Some(cfg) = config {
        if let Some(channel) = cfg.slack_channel.as_deref() {
            payload["channel"] = json!(channel);
        }
        if let Some(username) = cfg.slack_username.as_deref() {
            payload["username"] = json!(username);
        }
        if let Some(emoji) = cfg.slack_icon_emoji.as_deref() {
            payload["icon_emoji"] = json!(emoji);
        }
    }
    payload
}

#[async_trait]
impl DeliveryChannel for SlackChannel {
    fn name(&self) -> &str {
        channel_names::SLACK
    }

    fn supports_html(&self) -> bool {
        false
    }

    fn max_content_length(&self) -> Option<usize> {
        Some(SLACK_MAX_CONTENT)
    }

    fn validate_config(&self, config: Option<&ChannelConfig>) -> Result<(), ChannelError> {
        webhook_url(config).map(|_| ())
    }

    async fn send(&self, params: SendParams<'_>) -> SendOutcome {
        let url = match webhook_url(params.config) {
            Ok(u) => u,
            Err(e) => return SendOutcome::failed(ErrorCode::InvalidConfig, e.to_string()),
        };
        let payload = build_payload(params.message, params.config);
        dispatch(channel_names::SLACK, self.client.post(url).json(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_bolds_subject() {
        let cfg = ChannelConfig {
            slack_channel: Some("#news".into()),
            slack_icon_emoji: Some(":mega:".into()),
            ..ChannelConfig::default()
        };
        let msg = RenderedMessage::new("Digest", "", "Three new posts");
        let payload = build_payload(&msg, Some(&cfg));
        assert_eq!(payload["text"], "*Digest*\n\nThree new posts");
        assert_eq!(payload["channel"], "#news");
        assert_eq!(payload["icon_emoji"], ":mega:");
        assert!(payload.get("username").is_none());
    }

    #[test]
    fn rejects_invalid_url() {
        let channel = SlackChannel::new(reqwest::Client::new());
        let cfg = ChannelConfig {
            slack_webhook_url: Some("hooks.slack.com/services/x".into()),
            ..ChannelConfig::default()
        };
        let err = channel.validate_config(Some(&cfg)).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidConfig);
    }
}
