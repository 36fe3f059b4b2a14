use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification attached to every failed send.
///
/// The code decides whether the delivery manager retries: only
/// [`is_transient`](ErrorCode::is_transient) codes are attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRecipient,
    InvalidConfig,
    ConnectionFailed,
    Timeout,
    RateLimited,
    ServerError,
    AuthFailed,
    ContentTooLarge,
    RecipientNotFound,
    Cancelled,
    Unknown,
}

impl ErrorCode {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed
                | Self::Timeout
                | Self::RateLimited
                | Self::ServerError
                | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRecipient => "invalid_recipient",
            Self::InvalidConfig => "invalid_config",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::AuthFailed => "auth_failed",
            Self::ContentTooLarge => "content_too_large",
            Self::RecipientNotFound => "recipient_not_found",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration and registry errors raised before anything is sent.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel-specific configuration is invalid or missing.
    #[error("invalid {channel} configuration: {reason}")]
    InvalidConfig { channel: String, reason: String },

    #[error("invalid recipient for {channel}: {reason}")]
    InvalidRecipient { channel: String, reason: String },

    /// No adapter is registered under this name.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

impl ChannelError {
    pub fn config(channel: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn recipient(channel: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRecipient {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    /// Map to the classification recorded on a failed unit.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidRecipient { .. } => ErrorCode::InvalidRecipient,
            Self::InvalidConfig { .. } | Self::UnknownChannel(_) => ErrorCode::InvalidConfig,
        }
    }
}

/// Request-level rejection from [`DeliveryManager::deliver`](crate::DeliveryManager::deliver).
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no recipients specified for {channels} channel(s)")]
    NoRecipients { channels: usize },

    #[error("no channels specified for {recipients} recipient(s)")]
    NoChannels { recipients: usize },
}

/// Opaque failure reported by a pluggable backend (mail transport,
/// notification store). The message is classified by keyword.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        for code in [
            ErrorCode::ConnectionFailed,
            ErrorCode::Timeout,
            ErrorCode::RateLimited,
            ErrorCode::ServerError,
            ErrorCode::Cancelled,
        ] {
            assert!(code.is_transient(), "{code} should be transient");
        }
        for code in [
            ErrorCode::InvalidRecipient,
            ErrorCode::InvalidConfig,
            ErrorCode::AuthFailed,
            ErrorCode::ContentTooLarge,
            ErrorCode::RecipientNotFound,
            ErrorCode::Unknown,
        ] {
            assert!(!code.is_transient(), "{code} should be permanent");
        }
    }

    #[test]
    fn code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::RecipientNotFound).unwrap();
        assert_eq!(json, "\"recipient_not_found\"");
        assert_eq!(ErrorCode::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn channel_error_codes() {
        assert_eq!(
            ChannelError::config("slack", "missing url").error_code(),
            ErrorCode::InvalidConfig
        );
        assert_eq!(
            ChannelError::recipient("email", "bad address").error_code(),
            ErrorCode::InvalidRecipient
        );
        assert_eq!(
            ChannelError::UnknownChannel("fax".into()).error_code(),
            ErrorCode::InvalidConfig
        );
    }
}
