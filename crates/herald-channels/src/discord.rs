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

/// Discord embed description limit.
pub const DISCORD_MAX_CONTENT: usize = 4096;
const DISCORD_TITLE_LIMIT: usize = 256;

/// Posts an embed to a Discord incoming webhook. The webhook addresses the
/// destination channel, so the recipient is not part of the payload.
pub struct DiscordChannel {
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn webhook_url(config: Option<&ChannelConfig>) -> Result<&str, ChannelError> {
    let url = config
        .and_then(|c| c.discord_webhook_url.as_deref())
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ChannelError::config(channel_names::DISCORD, "discord_webhook_url is required"))?;
    if !validate_webhook_url(url) {
        return Err(ChannelError::config(
            channel_names::DISCORD,
            format!("invalid webhook URL: {url}"),
        ));
    }
    Ok(url)
}

pub(crate) fn build_payload(message: &RenderedMessage, config: Option<&ChannelConfig>) -> Value {
    let title: String = message.subject.chars().take(DISCORD_TITLE_LIMIT).collect();
    let mut payload = json!({
        "embeds": [{
            "title": title,
            "description": message.text,
        }],
    });
    if let Some(cfg) = config {
        if let Some(username) = cfg.discord_username.as_deref() {
            payload["username"] = json!(username);
        }
        if let Some(avatar) = cfg.discord_avatar_url.as_deref() {
            payload["avatar_url"] = json!(avatar);
        }
    }
    payload
}

#[async_trait]
impl DeliveryChannel for DiscordChannel {
    fn name(&self) -> &str {
        channel_names::DISCORD
    }

    fn supports_html(&self) -> bool {
        false
    }

    fn max_content_length(&self) -> Option<usize> {
        Some(DISCORD_MAX_CONTENT)
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
        dispatch(channel_names::DISCORD, self.client.post(url).json(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_webhook_url() {
        let channel = DiscordChannel::new(reqwest::Client::new());
        assert!(channel.validate_config(None).is_err());
        assert!(channel
            .validate_config(Some(&ChannelConfig::default()))
            .is_err());
        let cfg = ChannelConfig {
            discord_webhook_url: Some("https://discord.com/api/webhooks/1/abc".into()),
            ..ChannelConfig::default()
        };
        assert!(channel.validate_config(Some(&cfg)).is_ok());
    }

    #[test]
    fn payload_uses_embed_and_overrides() {
        let cfg = ChannelConfig {
            discord_username: Some("Herald".into()),
            ..ChannelConfig::default()
        };
        let msg = RenderedMessage::new("Weekly digest", "<p>hi</p>", "hi");
        let payload = build_payload(&msg, Some(&cfg));
        assert_eq!(payload["embeds"][0]["title"], "Weekly digest");
        assert_eq!(payload["embeds"][0]["description"], "hi");
        assert_eq!(payload["username"], "Herald");
        assert!(payload.get("avatar_url").is_none());
    }
}
