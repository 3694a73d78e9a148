//! Heirloom Notification Service
//!
//! Delivers messages queued in the vault's notification outbox.
//!
//! # Delivery Methods
//!
//! - **Email**: SMTP with operator-provided credentials
//! - **Log only**: no transport configured; each message is logged
//!
//! Delivery never feeds back into the vault state. A failed message stays in
//! the outbox with its attempt count raised and is retried on a later drain.
//!
//! # Example
//!
//! ```ignore
//! use heirloom_notify::{NotificationService, NotifyConfig};
//!
//! let service = NotificationService::new(NotifyConfig::default());
//! let pending = heirloom_vault::outbox::pending(&conn, 50)?;
//! let report = service.deliver_batch(&pending).await;
//! ```

mod config;
mod smtp;
pub mod templates;

pub use config::{EmailConfig, NotifyConfig, DEFAULT_BATCH_SIZE};
pub use templates::NotificationMessage;

use heirloom_vault::OutboxMessage;
use thiserror::Error;

/// Errors from notification operations
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Email send failed: {0}")]
    EmailFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Outcome of one delivery batch, by outbox message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<i64>,
    pub failed: Vec<(i64, String)>,
}

/// Notification service for outbox messages
pub struct NotificationService {
    config: NotifyConfig,
}

impl NotificationService {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Reject an email section that could never deliver.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.config.batch_size == 0 {
            return Err(NotifyError::Config("batch_size must be at least 1".into()));
        }
        match &self.config.email {
            Some(email) if email.enabled => email.validate().map_err(NotifyError::Config),
            _ => Ok(()),
        }
    }

    /// True when messages are only logged.
    pub fn is_log_only(&self) -> bool {
        !matches!(&self.config.email, Some(email) if email.enabled)
    }

    /// Deliver one outbox message.
    pub async fn deliver(&self, message: &OutboxMessage) -> Result<(), NotifyError> {
        let rendered = templates::render(message.kind, &message.owner_id, &message.payload);

        match &self.config.email {
            Some(email) if email.enabled => {
                smtp::send_email(email, &message.recipient, &rendered).await
            }
            _ => {
                log::info!(
                    "[log-only] {} to {} for {}: {}",
                    message.kind,
                    message.recipient,
                    message.owner_id,
                    rendered.subject
                );
                Ok(())
            }
        }
    }

    /// Deliver every message in `messages`, in order. Failures are logged
    /// and collected; they never stop the batch.
    pub async fn deliver_batch(&self, messages: &[OutboxMessage]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for message in messages {
            match self.deliver(message).await {
                Ok(()) => report.delivered.push(message.id),
                Err(e) => {
                    log::error!(
                        "Delivery of {} #{} to {} failed (attempt {}): {}",
                        message.kind,
                        message.id,
                        message.recipient,
                        message.attempts + 1,
                        e
                    );
                    report.failed.push((message.id, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use heirloom_core::OwnerId;
    use heirloom_inherit::NotificationKind;

    fn message(id: i64, recipient: &str) -> OutboxMessage {
        OutboxMessage {
            id,
            owner_id: OwnerId::from("alice"),
            recipient: recipient.to_string(),
            kind: NotificationKind::CheckInReminder,
            payload: serde_json::json!({ "missed_count": 1 }),
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    #[test]
    fn test_log_only_by_default() {
        let service = NotificationService::new(NotifyConfig::default());
        assert!(service.is_log_only());
        assert!(service.validate().is_ok());
    }

    #[test]
    fn test_disabled_email_is_log_only() {
        let mut email = EmailConfig::new("smtp.example.com", "u", "p", "from@example.com");
        email.enabled = false;
        let service = NotificationService::new(NotifyConfig {
            email: Some(email),
            ..NotifyConfig::default()
        });
        assert!(service.is_log_only());
    }

    #[test]
    fn test_validate_rejects_bad_email() {
        let service = NotificationService::new(NotifyConfig {
            email: Some(EmailConfig::new("", "u", "p", "from@example.com")),
            ..NotifyConfig::default()
        });
        assert!(matches!(service.validate(), Err(NotifyError::Config(_))));
    }

    #[tokio::test]
    async fn test_log_only_batch_delivers_everything() {
        let service = NotificationService::new(NotifyConfig::default());
        let report = service
            .deliver_batch(&[message(1, "a@example.com"), message(2, "b@example.com")])
            .await;
        assert_eq!(report.delivered, vec![1, 2]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_bad_recipient_fails_without_stopping_batch() {
        // Unparseable recipient fails before any network access
        let service = NotificationService::new(NotifyConfig {
            email: Some(EmailConfig::new(
                "smtp.invalid",
                "u",
                "p",
                "from@example.com",
            )),
            ..NotifyConfig::default()
        });
        let report = service
            .deliver_batch(&[message(1, "not an address"), message(2, "also bad")])
            .await;
        assert!(report.delivered.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, 1);
    }
}
