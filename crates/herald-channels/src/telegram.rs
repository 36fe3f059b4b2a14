use async_trait::async_trait;
use herald_core::{channel_names, ChannelConfig, RecipientKind};
use serde_json::{json, Value};

use crate::{
    channel::{DeliveryChannel, SendParams},
    error::{ChannelError, ErrorCode},
    format::html_to_plaintext,
    http::dispatch,
    types::{RenderedMessage, SendOutcome},
};

pub const TELEGRAM_MAX_CONTENT: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API `sendMessage`.
///
/// The chat comes from `telegram_chat_id`, or from a `user` recipient whose
/// target is the chat id.
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_api_base(client, TELEGRAM_API_BASE)
    }

    /// Point at a different Bot API host (self-hosted server, tests).
    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, token)
    }
}

fn bot_token(config: Option<&ChannelConfig>) -> Result<&str, ChannelError> {
    config
        .and_then(|c| c.telegram_bot_token.as_deref())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ChannelError::config(channel_names::TELEGRAM, "telegram_bot_token is required"))
}

fn parse_mode(config: Option<&ChannelConfig>) -> Result<Option<&str>, ChannelError> {
    match config.and_then(|c| c.telegram_parse_mode.as_deref()) {
        None => Ok(None),
        Some(mode @ ("HTML" | "Markdown" | "MarkdownV2")) => Ok(Some(mode)),
        Some(other) => Err(ChannelError::config(
            channel_names::TELEGRAM,
            format!("unsupported parse mode {other}"),
        )),
    }
}

pub(crate) fn build_payload(chat_id: &str, message: &RenderedMessage, parse_mode: Option<&str>) -> Value {
    let use_html = parse_mode == Some("HTML") && !message.html.trim().is_empty();
    let body = if use_html {
        message.html.clone()
    } else if message.text.trim().is_empty() {
        html_to_plaintext(&message.html)
    } else {
        message.text.clone()
    };
    let text = if message.subject.is_empty() {
        body
    } else if use_html {
        format!("<b>{}</b>\n\n{}", message.subject, body)
    } else {
        format!("{}\n\n{}", message.subject, body)
    };

    let mut payload = json!({
        "chat_id": chat_id,
        "text": text,
    });
    if let Some(mode) = parse_mode {
        payload["parse_mode"] = json!(mode);
    }
    payload
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn name(&self) -> &str {
        channel_names::TELEGRAM
    }

    fn supports_html(&self) -> bool {
        true
    }

    fn max_content_length(&self) -> Option<usize> {
        Some(TELEGRAM_MAX_CONTENT)
    }

    fn validate_config(&self, config: Option<&ChannelConfig>) -> Result<(), ChannelError> {
        bot_token(config)?;
        parse_mode(config).map(|_| ())
    }

    async fn send(&self, params: SendParams<'_>) -> SendOutcome {
        let token = match bot_token(params.config) {
            Ok(t) => t,
            Err(e) => return SendOutcome::failed(ErrorCode::InvalidConfig, e.to_string()),
        };
        let mode = match parse_mode(params.config) {
            Ok(m) => m,
            Err(e) => return SendOutcome::failed(ErrorCode::InvalidConfig, e.to_string()),
        };
        let chat_id = match params.config.and_then(|c| c.telegram_chat_id.as_deref()) {
            Some(id) if !id.trim().is_empty() => id,
            _ if params.recipient.kind == RecipientKind::User
                && !params.recipient.target.trim().is_empty() =>
            {
                params.recipient.target.as_str()
            }
            _ => {
                return SendOutcome::failed(
                    ErrorCode::InvalidRecipient,
                    "no telegram chat id for recipient",
                )
            }
        };

        let payload = build_payload(chat_id, params.message, mode);
        dispatch(
            channel_names::TELEGRAM,
            self.client.post(self.endpoint(token)).json(&payload),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_token() {
        let channel = TelegramChannel::with_api_base(reqwest::Client::new(), "http://127.0.0.1:9/");
        assert_eq!(
            channel.endpoint("123:abc"),
            "http://127.0.0.1:9/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn validation() {
        let channel = TelegramChannel::new(reqwest::Client::new());
        assert!(channel.validate_config(None).is_err());
        let mut cfg = ChannelConfig {
            telegram_bot_token: Some("123:abc".into()),
            ..ChannelConfig::default()
        };
        assert!(channel.validate_config(Some(&cfg)).is_ok());
        cfg.telegram_parse_mode = Some("BBCode".into());
        assert!(channel.validate_config(Some(&cfg)).is_err());
    }

    #[test]
    fn html_payload_when_parse_mode_html() {
        let msg = RenderedMessage::new("News", "<i>body</i>", "body");
        let html = build_payload("42", &msg, Some("HTML"));
        assert_eq!(html["text"], "<b>News</b>\n\n<i>body</i>");
        assert_eq!(html["parse_mode"], "HTML");

        let plain = build_payload("42", &msg, None);
        assert_eq!(plain["text"], "News\n\nbody");
        assert_eq!(plain["chat_id"], "42");
        assert!(plain.get("parse_mode").is_none());

        let html_only = RenderedMessage::new("", "<p>only &amp; html</p>", "");
        assert_eq!(build_payload("42", &html_only, None)["text"], "only & html");
    }
}
