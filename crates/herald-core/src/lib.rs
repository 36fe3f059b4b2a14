//! `herald-core` — configuration, shared errors and domain models for the
//! herald notification engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ContentConfig, DatabaseConfig, DeliveryConfig, HeraldConfig, SchedulerConfig};
pub use error::{HeraldError, Result};
pub use types::{
    channel_names, ChannelConfig, ContentTemplate, Delivery, DeliveryStatus, Recipient,
    RecipientKind, Schedule, TemplateConfig, TimeFrameUnit, TriggerSource,
};
