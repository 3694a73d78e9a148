//! SMTP email sending

use crate::config::EmailConfig;
use crate::templates::NotificationMessage;
use crate::NotifyError;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Send `notification` to `recipient` (async, safe for tokio runtimes).
pub async fn send_email(
    config: &EmailConfig,
    recipient: &str,
    notification: &NotificationMessage,
) -> Result<(), NotifyError> {
    let email = build_message(&config.from_address, recipient, notification)?;

    let mailer = build_async_transport(config)?;

    mailer
        .send(email)
        .await
        .map_err(|e| NotifyError::EmailFailed(format!("SMTP send failed: {}", e)))?;

    log::info!("Email sent to {} ({})", recipient, notification.kind);

    Ok(())
}

/// Build a `lettre::Message` from addresses and notification content.
fn build_message(
    from: &str,
    to: &str,
    notification: &NotificationMessage,
) -> Result<Message, NotifyError> {
    Message::builder()
        .from(
            from.parse()
                .map_err(|e| NotifyError::EmailFailed(format!("Invalid from address: {}", e)))?,
        )
        .to(to
            .parse()
            .map_err(|e| NotifyError::EmailFailed(format!("Invalid to address: {}", e)))?)
        .subject(&notification.subject)
        .body(notification.body.clone())
        .map_err(|e| NotifyError::EmailFailed(format!("Failed to build email: {}", e)))
}

fn build_async_transport(
    config: &EmailConfig,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
    let creds = Credentials::new(config.smtp_user.clone(), config.smtp_password.clone());

    Ok(
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| NotifyError::EmailFailed(format!("SMTP relay error: {}", e)))?
            .credentials(creds)
            .port(config.smtp_port)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::render;
    use heirloom_core::OwnerId;
    use heirloom_inherit::NotificationKind;

    #[test]
    fn test_email_builder() {
        let notification = render(
            NotificationKind::CheckInReminder,
            &OwnerId::from("alice"),
            &serde_json::json!({ "due_at": "2026-04-01T00:00:00Z" }),
        );

        assert!(build_message("noreply@heirloom.example", "alice@example.com", &notification).is_ok());
        assert!(build_message("noreply@heirloom.example", "not an address", &notification).is_err());
    }

    // Actual delivery needs a real SMTP server
}
