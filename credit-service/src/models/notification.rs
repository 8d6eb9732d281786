//! Credit notifications and their exactly-once latches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Low-credit threshold crossed.
    Threshold80,
    /// All credit used.
    Threshold100,
    CreditsExpired,
    /// Account left the depleted state after a top-up.
    CreditsAvailable,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold80 => "THRESHOLD_80",
            Self::Threshold100 => "THRESHOLD_100",
            Self::CreditsExpired => "CREDITS_EXPIRED",
            Self::CreditsAvailable => "CREDITS_AVAILABLE",
        }
    }

    /// E-mail subject line delivered for the event.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Threshold80 => "Your Cloud Credits are about to run out",
            Self::Threshold100 => "You have used 100% of your Cloud Credits",
            Self::CreditsExpired => "Credits Expired Notification",
            Self::CreditsAvailable => "Your Cloud Credits are available",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub cloud_account_id: String,
    pub kind: NotificationKind,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(cloud_account_id: &str, kind: NotificationKind, now: DateTime<Utc>) -> Self {
        Self {
            cloud_account_id: cloud_account_id.to_string(),
            kind,
            subject: kind.subject().to_string(),
            created_at: now,
        }
    }
}

/// Per-account latch. Reset on enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    pub threshold80_sent: bool,
    pub threshold100_sent: bool,
    /// Grants expiring at or before this instant have already been reported.
    pub expired_notified_through: DateTime<Utc>,
}

impl NotificationState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            threshold80_sent: false,
            threshold100_sent: false,
            expired_notified_through: now,
        }
    }
}
