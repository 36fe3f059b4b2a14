use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{channel_names, ChannelConfig, RecipientKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    channel::{DeliveryChannel, SendParams},
    classify::classify_error_message,
    error::{ChannelError, ErrorCode, TransportError},
    types::SendOutcome,
};

pub const IN_APP_MAX_CONTENT: usize = 1000;

/// Notification row shown inside the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InAppNotification {
    pub id: String,
    pub user_id: String,
    pub delivery_id: String,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Persistence for in-app notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(&self, notification: &InAppNotification) -> Result<(), TransportError>;
}

pub struct InAppChannel {
    store: Arc<dyn NotificationStore>,
}

impl InAppChannel {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn name(&self) -> &str {
        channel_names::IN_APP
    }

    fn supports_html(&self) -> bool {
        false
    }

    fn max_content_length(&self) -> Option<usize> {
        Some(IN_APP_MAX_CONTENT)
    }

    fn validate_config(&self, _config: Option<&ChannelConfig>) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, params: SendParams<'_>) -> SendOutcome {
        let recipient = params.recipient;
        if recipient.kind != RecipientKind::User || recipient.target.trim().is_empty() {
            return SendOutcome::failed(
                ErrorCode::InvalidRecipient,
                format!("in-app notifications need a user recipient, got {}", recipient.kind),
            );
        }

        let notification = InAppNotification {
            id: Uuid::new_v4().to_string(),
            user_id: recipient.target.clone(),
            delivery_id: params.delivery_id.to_string(),
            title: params.message.subject.clone(),
            body: params.message.text.clone(),
            read: false,
            created_at: Utc::now(),
        };
        match self.store.create_notification(&notification).await {
            Ok(()) => SendOutcome::delivered_with_id(notification.id),
            Err(e) => SendOutcome::failed(classify_error_message(&e.0), e.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::types::RenderedMessage;
    use herald_core::Recipient;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<InAppNotification>>,
    }

    #[async_trait]
    impl NotificationStore for MemoryStore {
        async fn create_notification(&self, n: &InAppNotification) -> Result<(), TransportError> {
            self.rows.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn stores_notification_for_user() {
        let store = Arc::new(MemoryStore::default());
        let channel = InAppChannel::new(store.clone());
        let recipient = Recipient::user("u-1");
        let message = RenderedMessage::new("Digest", "", "5 new items");
        let cancel = CancellationToken::new();

        let outcome = channel
            .send(SendParams {
                delivery_id: "d-9",
                recipient: &recipient,
                message: &message,
                config: None,
                cancel: &cancel,
            })
            .await;
        assert!(outcome.success);

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "u-1");
        assert_eq!(rows[0].delivery_id, "d-9");
        assert_eq!(rows[0].body, "5 new items");
        assert_eq!(outcome.external_id.as_deref(), Some(rows[0].id.as_str()));
    }

    #[tokio::test]
    async fn email_recipient_rejected() {
        let channel = InAppChannel::new(Arc::new(MemoryStore::default()));
        let recipient = Recipient::email("a@example.com");
        let message = RenderedMessage::default();
        let cancel = CancellationToken::new();

        let outcome = channel
            .send(SendParams {
                delivery_id: "d",
                recipient: &recipient,
                message: &message,
                config: None,
                cancel: &cancel,
            })
            .await;
        assert_eq!(outcome.error_code, Some(ErrorCode::InvalidRecipient));
    }
}
