use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::{ChannelConfig, DeliveryStatus, Recipient};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Final content handed to channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    /// Rich body. May be empty for plain-text only content.
    pub html: String,
    /// Plain-text body. Channels without HTML support fall back to a
    /// stripped copy of `html` when this is empty.
    pub text: String,
}

impl RenderedMessage {
    pub fn new(subject: impl Into<String>, html: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
            text: text.into(),
        }
    }
}

/// Result of a single send attempt.
///
/// Channels never return `Err` from `send`; every failure is described here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    /// Whether a retry may succeed.
    pub transient: bool,
    /// Server-requested wait before the next attempt.
    pub retry_after: Option<Duration>,
    /// Provider-side message identifier, when the remote end returns one.
    pub external_id: Option<String>,
}

impl SendOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn delivered_with_id(external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            ..Self::default()
        }
    }

    /// Failure whose transience follows the code.
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code),
            error_message: Some(message.into()),
            transient: code.is_transient(),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(ErrorCode::Cancelled, "delivery cancelled")
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// One message fanned out to every recipient over every listed channel.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRequest {
    pub delivery_id: String,
    pub schedule_id: Option<String>,
    pub recipients: Vec<Recipient>,
    /// Channel names, resolved through the registry.
    pub channels: Vec<String>,
    pub channel_configs: HashMap<String, ChannelConfig>,
    pub message: RenderedMessage,
}

impl DeliveryRequest {
    pub fn unit_count(&self) -> usize {
        self.recipients.len() * self.channels.len()
    }
}

/// Outcome of one (recipient, channel) unit after all attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub recipient: Recipient,
    pub channel: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub transient: bool,
    /// Send attempts made. Zero when the unit never reached a channel.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl DeliveryResult {
    pub(crate) fn from_outcome(
        recipient: Recipient,
        channel: String,
        outcome: SendOutcome,
        attempts: u32,
    ) -> Self {
        Self {
            recipient,
            channel,
            success: outcome.success,
            error_code: outcome.error_code,
            error_message: outcome.error_message,
            transient: outcome.transient,
            attempts,
            external_id: outcome.external_id,
            completed_at: Utc::now(),
        }
    }

    pub(crate) fn failure(
        recipient: Recipient,
        channel: String,
        code: ErrorCode,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::from_outcome(recipient, channel, SendOutcome::failed(code, message), attempts)
    }
}

/// Aggregate of every unit in a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivery_id: String,
    pub status: DeliveryStatus,
    pub total_recipients: usize,
    pub successful_deliveries: usize,
    pub failed_deliveries: usize,
    /// Per-unit results in request order (recipient-major).
    pub results: Vec<DeliveryResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl DeliveryReport {
    pub fn failures(&self) -> impl Iterator<Item = &DeliveryResult> {
        self.results.iter().filter(|r| !r.success)
    }
}
