use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable lowercase identifiers of the built-in delivery channels.
///
/// Channels are keyed by plain strings so that deployments can register
/// additional transports without touching this crate.
pub mod channel_names {
    pub const EMAIL: &str = "email";
    pub const DISCORD: &str = "discord";
    pub const SLACK: &str = "slack";
    pub const TELEGRAM: &str = "telegram";
    pub const WEBHOOK: &str = "webhook";
    pub const IN_APP: &str = "in_app";

    pub const ALL: [&str; 6] = [EMAIL, DISCORD, SLACK, TELEGRAM, WEBHOOK, IN_APP];
}

// ---------------------------------------------------------------------------
// Recipients
// ---------------------------------------------------------------------------

/// What a recipient's `target` identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    /// An application user id (in-app notifications, chat ids).
    User,
    /// An e-mail address.
    Email,
    /// A webhook URL.
    Webhook,
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecipientKind::User => "user",
            RecipientKind::Email => "email",
            RecipientKind::Webhook => "webhook",
        };
        write!(f, "{s}")
    }
}

/// A single addressee of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "type")]
    pub kind: RecipientKind,
    /// User id, e-mail address or webhook URL depending on `kind`.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Recipient {
    pub fn new(kind: RecipientKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            name: None,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(RecipientKind::User, id)
    }

    pub fn email(address: impl Into<String>) -> Self {
        Self::new(RecipientKind::Email, address)
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new(RecipientKind::Webhook, url)
    }
}

// ---------------------------------------------------------------------------
// Channel configuration
// ---------------------------------------------------------------------------

/// Per-channel delivery settings attached to a schedule.
///
/// One flat struct shared by every transport; each channel reads the fields
/// it understands and its validator rejects missing required ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    // email
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_from_name: Option<String>,
    pub use_tls: bool,

    // discord
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_avatar_url: Option<String>,

    // slack
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_icon_emoji: Option<String>,

    // telegram
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    /// `HTML`, `Markdown` or `MarkdownV2`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_parse_mode: Option<String>,

    // generic webhook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// `POST` (default) or `PUT`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_method: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub webhook_headers: HashMap<String, String>,
    /// Raw `Authorization` header value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_auth: Option<String>,
    /// When set, the body is signed with HMAC-SHA256 using this secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Lifecycle state of a delivery (execution record).
///
/// `Pending -> Sending -> {Delivered, Partial, Failed}`; failures before the
/// hand-off to the delivery manager go straight from `Pending` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Delivered,
    Partial,
    Failed,
    Canceled,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Partial
                | DeliveryStatus::Failed
                | DeliveryStatus::Canceled
        )
    }

    /// Overall status of a fan-out given its unit counts.
    ///
    /// All succeeded (including the empty fan-out) is `Delivered`, none
    /// succeeded is `Failed`, anything in between is `Partial`.
    pub fn from_counts(successful: usize, failed: usize) -> Self {
        match (successful, failed) {
            (_, 0) => DeliveryStatus::Delivered,
            (0, _) => DeliveryStatus::Failed,
            _ => DeliveryStatus::Partial,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Partial => "partial",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "partial" => Ok(DeliveryStatus::Partial),
            "failed" => Ok(DeliveryStatus::Failed),
            "canceled" => Ok(DeliveryStatus::Canceled),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Schedule => write!(f, "schedule"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(TriggerSource::Schedule),
            "manual" => Ok(TriggerSource::Manual),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFrameUnit {
    Hours,
    Days,
    Weeks,
    Months,
}

/// Content-resolution options: reporting window plus resolver-specific keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Length of the reporting window, in `time_frame_unit`s (default 7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_unit: Option<TimeFrameUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u32>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// A content/template definition referenced by schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTemplate {
    pub id: String,
    pub name: String,
    /// Resolver-defined content type (e.g. `weekly_digest`).
    pub content_type: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<TemplateConfig>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// A recurring job definition: when to run, what to render, who receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub template_id: String,
    /// Five-field cron expression, evaluated in `timezone`.
    pub cron_expression: String,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    pub recipients: Vec<Recipient>,
    /// Channel names; see [`channel_names`].
    pub channels: Vec<String>,
    #[serde(default)]
    pub channel_configs: HashMap<String, ChannelConfig>,
    /// Overrides the template's default config when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TemplateConfig>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<DeliveryStatus>,
    pub run_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// The channel used for record keeping on the delivery record.
    pub fn primary_channel(&self) -> &str {
        self.channels
            .first()
            .map(String::as_str)
            .unwrap_or(channel_names::EMAIL)
    }

    /// Number of (recipient, channel) delivery units one execution fans out to.
    pub fn unit_count(&self) -> usize {
        self.recipients.len() * self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// Delivery (execution record)
// ---------------------------------------------------------------------------

/// One record per schedule execution or manual send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub schedule_id: String,
    pub template_id: String,
    /// Primary channel, for record keeping only.
    pub channel: String,
    pub status: DeliveryStatus,
    pub recipients_total: u32,
    pub recipients_delivered: u32,
    pub recipients_failed: u32,
    pub rendered_subject: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Human-readable cause when the execution failed.
    pub error_message: Option<String>,
    pub triggered_by: TriggerSource,
}

impl Delivery {
    /// A fresh `Pending` record for an execution of `schedule` starting now.
    pub fn pending(schedule: &Schedule, triggered_by: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            template_id: schedule.template_id.clone(),
            channel: schedule.primary_channel().to_string(),
            status: DeliveryStatus::Pending,
            recipients_total: schedule.unit_count() as u32,
            recipients_delivered: 0,
            recipients_failed: 0,
            rendered_subject: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            triggered_by,
        }
    }

    pub fn mark_sending(&mut self, rendered_subject: &str) {
        self.status = DeliveryStatus::Sending;
        self.rendered_subject = Some(rendered_subject.to_string());
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(message.into());
        self.finish();
    }

    pub fn mark_completed(&mut self, status: DeliveryStatus, delivered: u32, failed: u32) {
        self.status = status;
        self.recipients_delivered = delivered;
        self.recipients_failed = failed;
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(channels: &[&str], recipients: usize) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: "s-1".into(),
            name: "weekly".into(),
            template_id: "t-1".into(),
            cron_expression: "0 9 * * 1".into(),
            timezone: "UTC".into(),
            recipients: (0..recipients)
                .map(|i| Recipient::user(format!("u-{i}")))
                .collect(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            channel_configs: HashMap::new(),
            config: None,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            last_run_status: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_from_counts() {
        assert_eq!(DeliveryStatus::from_counts(3, 0), DeliveryStatus::Delivered);
        assert_eq!(DeliveryStatus::from_counts(0, 0), DeliveryStatus::Delivered);
        assert_eq!(DeliveryStatus::from_counts(0, 2), DeliveryStatus::Failed);
        assert_eq!(DeliveryStatus::from_counts(2, 2), DeliveryStatus::Partial);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Partial,
            DeliveryStatus::Failed,
            DeliveryStatus::Canceled,
        ] {
            assert_eq!(status.to_string().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn primary_channel_defaults_to_email() {
        assert_eq!(schedule(&[], 1).primary_channel(), "email");
        assert_eq!(schedule(&["slack", "email"], 1).primary_channel(), "slack");
    }

    #[test]
    fn pending_record_counts_units() {
        let s = schedule(&["email", "in_app"], 3);
        let d = Delivery::pending(&s, TriggerSource::Schedule);
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.recipients_total, 6);
        assert!(d.completed_at.is_none());
    }

    #[test]
    fn failed_record_carries_message_and_duration() {
        let s = schedule(&["email"], 1);
        let mut d = Delivery::pending(&s, TriggerSource::Manual);
        d.mark_failed("template missing");
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.error_message.as_deref(), Some("template missing"));
        assert!(d.completed_at.is_some());
        assert!(d.duration_ms.is_some());
    }

    #[test]
    fn recipient_wire_format_uses_type_key() {
        let r = Recipient::email("a@example.com");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"type":"email","target":"a@example.com"}"#);
    }
}
