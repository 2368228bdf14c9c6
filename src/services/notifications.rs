use crate::errors::ServiceError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// External email/SMS sender, keyed by template.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError>;
}

/// Fire-and-forget notification dispatch. Failures are logged and never abort
/// the owning mutation; the core does not own delivery guarantees.
#[derive(Clone)]
pub struct NotificationService {
    sender: Arc<dyn NotificationSender>,
}

impl NotificationService {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }

    pub async fn notify(&self, template: &str, recipient: &str, payload: serde_json::Value) {
        if let Err(e) = self.sender.send(template, recipient, payload).await {
            warn!(template, recipient, error = %e, "notification send failed");
        }
    }
}
