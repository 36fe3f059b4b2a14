use std::collections::HashMap;
use std::sync::Arc;

use herald_core::ChannelConfig;
use tracing::info;

use crate::{
    channel::DeliveryChannel, discord::DiscordChannel, error::ChannelError, slack::SlackChannel,
    telegram::TelegramChannel, webhook::WebhookChannel,
};

/// Name-keyed collection of delivery channels.
///
/// Built once at startup and then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every HTTP-backed channel sharing one client.
    pub fn with_http_channels(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebhookChannel::new(client.clone())));
        registry.register(Arc::new(DiscordChannel::new(client.clone())));
        registry.register(Arc::new(SlackChannel::new(client.clone())));
        registry.register(Arc::new(TelegramChannel::new(client)));
        registry
    }

    /// Register a channel. A channel with the same name is replaced.
    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registering delivery channel");
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeliveryChannel>> {
        self.channels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Registered channel names, sorted for deterministic output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn validate_config(
        &self,
        name: &str,
        config: Option<&ChannelConfig>,
    ) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get(name)
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_string()))?;
        channel.validate_config(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_app::{InAppChannel, InAppNotification, NotificationStore};
    use crate::TransportError;
    use async_trait::async_trait;

    struct NullStore;

    #[async_trait]
    impl NotificationStore for NullStore {
        async fn create_notification(&self, _n: &InAppNotification) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn http_channels_are_registered_sorted() {
        let registry = ChannelRegistry::with_http_channels(reqwest::Client::new());
        assert_eq!(registry.names(), vec!["discord", "slack", "telegram", "webhook"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn register_replaces_by_name() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(InAppChannel::new(Arc::new(NullStore))));
        registry.register(Arc::new(InAppChannel::new(Arc::new(NullStore))));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("in_app"));
        assert!(registry.get("in_app").is_some());
        assert!(registry.get("fax").is_none());
    }

    #[test]
    fn validate_unknown_channel() {
        let registry = ChannelRegistry::new();
        let err = registry.validate_config("fax", None).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownChannel(ref n) if n == "fax"));
    }

    #[test]
    fn validate_delegates_to_channel() {
        let registry = ChannelRegistry::with_http_channels(reqwest::Client::new());
        assert!(registry.validate_config("slack", None).is_err());
        let cfg = ChannelConfig {
            slack_webhook_url: Some("https://hooks.slack.com/services/T/B/X".into()),
            ..ChannelConfig::default()
        };
        assert!(registry.validate_config("slack", Some(&cfg)).is_ok());
    }
}
