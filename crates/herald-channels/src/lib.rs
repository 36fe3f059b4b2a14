//! `herald-channels` — delivery channels and the fan-out delivery manager.
//!
//! A [`DeliveryChannel`] sends one rendered message to one recipient and
//! reports a classified [`SendOutcome`]. The [`DeliveryManager`] expands a
//! [`DeliveryRequest`] into (recipient, channel) units, runs them with
//! bounded parallelism, retries transient failures with exponential backoff
//! and folds everything into a single [`DeliveryReport`].
//!
//! | Channel    | Rich HTML | Max length |
//! |------------|-----------|------------|
//! | `email`    | yes       | -          |
//! | `webhook`  | yes       | -          |
//! | `discord`  | no        | 4096       |
//! | `slack`    | no        | 3000       |
//! | `telegram` | yes       | 4096       |
//! | `in_app`   | no        | 1000       |

pub mod channel;
pub mod classify;
pub mod discord;
pub mod email;
pub mod error;
pub mod format;
mod http;
pub mod in_app;
pub mod manager;
pub mod registry;
pub mod slack;
pub mod telegram;
pub mod types;
pub mod webhook;

pub use channel::{DeliveryChannel, SendParams};
pub use email::{EmailChannel, MailTransport, OutgoingMail, SmtpSettings};
pub use error::{ChannelError, DeliveryError, ErrorCode, TransportError};
pub use in_app::{InAppChannel, InAppNotification, NotificationStore};
pub use manager::{DeliveryManager, RetryPolicy};
pub use registry::ChannelRegistry;
pub use types::{DeliveryReport, DeliveryRequest, DeliveryResult, RenderedMessage, SendOutcome};
