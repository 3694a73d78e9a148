//! Events emitted when a vault transition commits

use crate::state::{CheckInSource, VaultState};
use chrono::{DateTime, Utc};
use heirloom_core::OwnerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VaultEvent {
    CheckInRecorded {
        owner_id: OwnerId,
        at: DateTime<Utc>,
        source: CheckInSource,
        /// Escalation cycle this check-in cancelled, if any
        cancelled_cycle: Option<i64>,
    },

    /// A due date passed without a check-in
    CheckInMissed {
        owner_id: OwnerId,
        missed_count: u32,
    },

    EscalationTriggered {
        owner_id: OwnerId,
        cycle_id: i64,
    },

    DeathVerified {
        owner_id: OwnerId,
        cycle_id: i64,
        unlock_at: DateTime<Utc>,
    },

    Unlocked {
        owner_id: OwnerId,
        version: i64,
    },

    /// Reconstruction failed; the vault stays in `PendingUnlock` until an
    /// operator intervenes
    UnlockFailed {
        owner_id: OwnerId,
        reason: String,
    },
}

impl VaultEvent {
    pub fn owner_id(&self) -> &OwnerId {
        match self {
            VaultEvent::CheckInRecorded { owner_id, .. }
            | VaultEvent::CheckInMissed { owner_id, .. }
            | VaultEvent::EscalationTriggered { owner_id, .. }
            | VaultEvent::DeathVerified { owner_id, .. }
            | VaultEvent::Unlocked { owner_id, .. }
            | VaultEvent::UnlockFailed { owner_id, .. } => owner_id,
        }
    }

    /// Short action name, as written to the audit log
    pub fn action(&self) -> &'static str {
        match self {
            VaultEvent::CheckInRecorded { .. } => "check_in",
            VaultEvent::CheckInMissed { .. } => "check_in_missed",
            VaultEvent::EscalationTriggered { .. } => "escalation_triggered",
            VaultEvent::DeathVerified { .. } => "death_verified",
            VaultEvent::Unlocked { .. } => "unlocked",
            VaultEvent::UnlockFailed { .. } => "unlock_failed",
        }
    }

    /// The state the vault is in once this event has committed
    pub fn resulting_state(&self) -> Option<VaultState> {
        match self {
            VaultEvent::CheckInRecorded { .. } => Some(VaultState::Alive),
            VaultEvent::EscalationTriggered { .. } => Some(VaultState::Escalation),
            VaultEvent::DeathVerified { .. } => Some(VaultState::PendingUnlock),
            VaultEvent::Unlocked { .. } => Some(VaultState::Unlocked),
            VaultEvent::UnlockFailed { .. } => Some(VaultState::PendingUnlock),
            VaultEvent::CheckInMissed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, VaultEvent::UnlockFailed { .. })
    }
}

/// Which message a queued notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Owner: a check-in is coming due
    UpcomingCheckIn,
    /// Owner: first missed check-in
    CheckInReminder,
    /// Owner: second missed check-in
    UrgentReminder,
    /// Owner: contacts are being asked to verify
    FinalWarning,
    /// Contact: please confirm whether the owner has died
    VerificationRequest,
    /// Owner: quorum reached, check in before `unlock_at` to stop the unlock
    LastChance,
    /// Contact: the owner checked in, escalation is over
    EscalationCancelled,
    /// Contact: the vault is now unlocked
    VaultUnlocked,
    /// Contact: confirm enrollment as a trusted contact
    ContactInvitation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::UpcomingCheckIn => "upcoming_check_in",
            NotificationKind::CheckInReminder => "check_in_reminder",
            NotificationKind::UrgentReminder => "urgent_reminder",
            NotificationKind::FinalWarning => "final_warning",
            NotificationKind::VerificationRequest => "verification_request",
            NotificationKind::LastChance => "last_chance",
            NotificationKind::EscalationCancelled => "escalation_cancelled",
            NotificationKind::VaultUnlocked => "vault_unlocked",
            NotificationKind::ContactInvitation => "contact_invitation",
        }
    }

    pub fn all() -> [NotificationKind; 9] {
        [
            NotificationKind::UpcomingCheckIn,
            NotificationKind::CheckInReminder,
            NotificationKind::UrgentReminder,
            NotificationKind::FinalWarning,
            NotificationKind::VerificationRequest,
            NotificationKind::LastChance,
            NotificationKind::EscalationCancelled,
            NotificationKind::VaultUnlocked,
            NotificationKind::ContactInvitation,
        ]
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationKind::all()
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown notification kind: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_kind_roundtrip() {
        for kind in NotificationKind::all() {
            assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
        }
        assert!("nope".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn test_owner_id_and_action() {
        let event = VaultEvent::EscalationTriggered {
            owner_id: OwnerId::from("alice"),
            cycle_id: 1,
        };
        assert_eq!(event.owner_id().as_str(), "alice");
        assert_eq!(event.action(), "escalation_triggered");
        assert_eq!(event.resulting_state(), Some(VaultState::Escalation));
        assert!(!event.is_failure());
    }

    #[test]
    fn test_serializes_with_tag() {
        let event = VaultEvent::UnlockFailed {
            owner_id: OwnerId::from("bob"),
            reason: "share 2 commitment mismatch".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"unlock_failed\""));
        assert!(event.is_failure());

        let back: VaultEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
