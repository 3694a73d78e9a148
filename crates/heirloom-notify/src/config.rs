//! Notification configuration

use heirloom_inherit::heartbeat::DEFAULT_LEAD_DAYS;
use serde::{Deserialize, Serialize};

/// Messages taken from the outbox per drain
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Main notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Days before a due date to send upcoming-check-in reminders
    pub lead_days: Vec<u32>,
    /// Outbox messages delivered per drain
    pub batch_size: usize,
    /// Email configuration. Without it, messages are only logged.
    pub email: Option<EmailConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            lead_days: DEFAULT_LEAD_DAYS.to_vec(),
            batch_size: DEFAULT_BATCH_SIZE,
            email: None,
        }
    }
}

/// Email (SMTP) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Enable email notifications
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP port (typically 587 for TLS)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: String,
    /// SMTP password (stored securely)
    pub smtp_password: String,
    /// Sender email address
    pub from_address: String,
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

impl EmailConfig {
    pub fn new(
        smtp_host: impl Into<String>,
        smtp_user: impl Into<String>,
        smtp_password: impl Into<String>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            smtp_host: smtp_host.into(),
            smtp_port: default_smtp_port(),
            smtp_user: smtp_user.into(),
            smtp_password: smtp_password.into(),
            from_address: from_address.into(),
        }
    }

    /// Check for obviously unusable settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.smtp_host.trim().is_empty() {
            return Err("smtp_host is empty".into());
        }
        if self.smtp_port == 0 {
            return Err("smtp_port must be non-zero".into());
        }
        if !self.from_address.contains('@') {
            return Err(format!("from_address is not an email: {}", self.from_address));
        }
        Ok(())
    }
}
