//! Notification message templates

use chrono::{DateTime, Utc};
use heirloom_core::OwnerId;
use heirloom_inherit::NotificationKind;
use serde_json::Value;

/// A notification message ready to send
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    /// Message subject (for email)
    pub subject: String,
    /// Message body (plain text)
    pub body: String,
    pub kind: NotificationKind,
}

/// Render the message for one queued notification.
///
/// `payload` is the JSON queued with it. Missing fields render as "unknown"
/// rather than failing; the message still goes out.
pub fn render(kind: NotificationKind, owner: &OwnerId, payload: &Value) -> NotificationMessage {
    let (subject, body) = match kind {
        NotificationKind::UpcomingCheckIn => {
            let days = days_str(payload.get("days_left").and_then(Value::as_u64));
            (
                format!("Heirloom: check-in due in {}", days),
                format!(
                    r#"Hello,

This is a friendly reminder that your Heirloom check-in is due in {}
(by {}).

Open Heirloom and check in to keep your vault sealed.

Heirloom"#,
                    days,
                    date(payload, "due_at")
                ),
            )
        }

        NotificationKind::CheckInReminder => (
            "Heirloom: you missed a check-in".to_string(),
            format!(
                r#"Hello,

Your Heirloom check-in was due on {} and we have not heard from you.

Please check in as soon as you can. If you keep missing check-ins,
your trusted contacts will be asked to confirm what happened.

Heirloom"#,
                date(payload, "due_at")
            ),
        ),

        NotificationKind::UrgentReminder => (
            "Heirloom: URGENT - check-in overdue".to_string(),
            format!(
                r#"URGENT: CHECK-IN OVERDUE

You have missed {} check-ins in a row (first due {}).

One more missed check-in and your trusted contacts will be asked to
verify whether you have died.

Please check in IMMEDIATELY.

Heirloom"#,
                text(payload, "missed_count"),
                date(payload, "due_at")
            ),
        ),

        NotificationKind::FinalWarning => (
            "Heirloom: FINAL WARNING - contacts are being contacted".to_string(),
            format!(
                r#"FINAL WARNING

You have missed {} check-ins. Your trusted contacts have now been
asked to verify your status (escalation cycle {}).

If you are reading this, check in now. A check-in cancels the
escalation immediately.

Heirloom"#,
                text(payload, "missed_count"),
                text(payload, "cycle_id")
            ),
        ),

        NotificationKind::VerificationRequest => (
            format!("Heirloom: please confirm the status of {}", owner),
            format!(
                r#"Hello,

You are a trusted contact for {}. They have stopped checking in with
Heirloom.

Please confirm, through the Heirloom app, whether they have died.
Reference: escalation cycle {}.

If you know they are alive, please tell them to check in.

Heirloom"#,
                owner,
                text(payload, "cycle_id")
            ),
        ),

        NotificationKind::LastChance => (
            "Heirloom: LAST CHANCE - your vault will unlock".to_string(),
            format!(
                r#"LAST CHANCE

Two of your trusted contacts have confirmed your death.

Your vault will unlock on {}.

If you are alive, check in before then. A check-in stops the unlock
and cancels the escalation.

Heirloom"#,
                date(payload, "unlock_at")
            ),
        ),

        NotificationKind::EscalationCancelled => (
            format!("Heirloom: {} has checked in", owner),
            format!(
                r#"Hello,

{} has checked in. Escalation cycle {} is cancelled and no further
action is needed from you.

Heirloom"#,
                owner,
                text(payload, "cycle_id")
            ),
        ),

        NotificationKind::VaultUnlocked => (
            format!("Heirloom: the vault of {} is unlocked", owner),
            format!(
                r#"Hello,

The vault of {} was unlocked on {}.

Open Heirloom to access what they left for you.

Heirloom"#,
                owner,
                date(payload, "unlocked_at")
            ),
        ),

        NotificationKind::ContactInvitation => (
            format!("Heirloom: {} named you a trusted contact", owner),
            format!(
                r#"Hello,

{} has named you as a trusted contact in Heirloom
(contact id {}).

Please confirm your enrollment in the Heirloom app. Until you do,
you cannot take part in verifying their status.

Heirloom"#,
                owner,
                text(payload, "contact_id")
            ),
        ),
    };

    NotificationMessage {
        subject,
        body,
        kind,
    }
}

fn days_str(days: Option<u64>) -> String {
    match days {
        Some(1) => "1 day".to_string(),
        Some(n) => format!("{} days", n),
        None => "a few days".to_string(),
    }
}

fn text(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}

fn date(payload: &Value, key: &str) -> String {
    let raw = text(payload, key);
    match raw.parse::<DateTime<Utc>>() {
        Ok(at) => at.format("%Y-%m-%d %H:%M UTC").to_string(),
        Err(_) => raw,
    }
}
