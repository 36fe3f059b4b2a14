use async_trait::async_trait;
use herald_core::{ChannelConfig, Recipient};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ChannelError,
    types::{RenderedMessage, SendOutcome},
};

/// Everything a channel needs for one send attempt.
#[derive(Clone, Copy)]
pub struct SendParams<'a> {
    pub delivery_id: &'a str,
    pub recipient: &'a Recipient,
    /// Already adapted to the channel's HTML support and length limit.
    pub message: &'a RenderedMessage,
    pub config: Option<&'a ChannelConfig>,
    /// Cancelled when the owning delivery is abandoned.
    pub cancel: &'a CancellationToken,
}

/// Common interface implemented by every delivery transport (email, webhook,
/// Discord, Slack, Telegram, in-app).
///
/// Implementations must be `Send + Sync` so one instance can serve many
/// concurrent units from the [`DeliveryManager`](crate::DeliveryManager).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Stable lowercase identifier (e.g. `"slack"`), used as the registry key.
    fn name(&self) -> &str;

    fn supports_html(&self) -> bool;

    /// Maximum body length in characters, `None` when unbounded.
    fn max_content_length(&self) -> Option<usize>;

    /// Check the channel settings a schedule carries before anything is sent.
    fn validate_config(&self, config: Option<&ChannelConfig>) -> Result<(), ChannelError>;

    /// Deliver one message to one recipient.
    ///
    /// Never fails at the type level: invalid recipients, bad configuration
    /// and transport errors all come back as an unsuccessful [`SendOutcome`].
    async fn send(&self, params: SendParams<'_>) -> SendOutcome;
}
