use std::sync::Arc;

use async_trait::async_trait;
use herald_core::{channel_names, ChannelConfig};
use tracing::debug;

use crate::{
    channel::{DeliveryChannel, SendParams},
    classify::classify_error_message,
    error::{ChannelError, ErrorCode, TransportError},
    format::validate_email,
    types::SendOutcome,
};

const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP connection settings extracted from a [`ChannelConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub use_tls: bool,
}

impl SmtpSettings {
    pub fn from_config(config: Option<&ChannelConfig>) -> Result<Self, ChannelError> {
        let cfg = config.ok_or_else(|| ChannelError::config(channel_names::EMAIL, "smtp settings are required"))?;
        let host = cfg
            .smtp_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ChannelError::config(channel_names::EMAIL, "smtp_host is required"))?;
        let from = cfg
            .smtp_from
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ChannelError::config(channel_names::EMAIL, "smtp_from is required"))?;
        if !validate_email(from) {
            return Err(ChannelError::config(
                channel_names::EMAIL,
                format!("invalid sender address {from}"),
            ));
        }
        let port = match cfg.smtp_port {
            None => DEFAULT_SMTP_PORT,
            Some(0) => return Err(ChannelError::config(channel_names::EMAIL, "smtp_port must be non-zero")),
            Some(p) => p,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username: cfg.smtp_user.clone(),
            password: cfg.smtp_password.clone(),
            from_address: from.to_string(),
            from_name: cfg.smtp_from_name.clone(),
            use_tls: cfg.use_tls,
        })
    }
}

/// A single addressed message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// The wire side of email. SMTP sessions, pooling and MIME assembly live
/// behind this seam; failures are classified from their message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns the provider message id when one is known.
    async fn send_mail(
        &self,
        settings: &SmtpSettings,
        mail: &OutgoingMail,
    ) -> Result<Option<String>, TransportError>;
}

pub struct EmailChannel {
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn name(&self) -> &str {
        channel_names::EMAIL
    }

    fn supports_html(&self) -> bool {
        true
    }

    fn max_content_length(&self) -> Option<usize> {
        None
    }

    fn validate_config(&self, config: Option<&ChannelConfig>) -> Result<(), ChannelError> {
        SmtpSettings::from_config(config).map(|_| ())
    }

    async fn send(&self, params: SendParams<'_>) -> SendOutcome {
        let settings = match SmtpSettings::from_config(params.config) {
            Ok(s) => s,
            Err(e) => return SendOutcome::failed(ErrorCode::InvalidConfig, e.to_string()),
        };
        let address = params.recipient.target.trim();
        if !validate_email(address) {
            return SendOutcome::failed(
                ErrorCode::InvalidRecipient,
                format!("invalid email address: {address}"),
            );
        }

        let mail = OutgoingMail {
            to: address.to_string(),
            to_name: params.recipient.name.clone(),
            subject: params.message.subject.clone(),
            html: params.message.html.clone(),
            text: params.message.text.clone(),
        };
        match self.transport.send_mail(&settings, &mail).await {
            Ok(Some(id)) => {
                debug!(to = %address, message_id = %id, "email accepted by relay");
                SendOutcome::delivered_with_id(id)
            }
            Ok(None) => SendOutcome::delivered(),
            Err(e) => SendOutcome::failed(classify_error_message(&e.0), e.0),
        }
    }
}
