//! MessageRecord: one row per (user, message type, occurrence date).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use greeter_core::error::GreeterError;
use greeter_core::MessageType;

/// Delivery state of a record. Transitions only move along
/// [`MessageStatus::can_transition_to`]; `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Pending,
        MessageStatus::Queued,
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Sending => "SENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Sending)
                | (Sending, Sent)
                | (Sending, Queued)
                | (Sending, Failed)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = GreeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| GreeterError::Validation(format!("unknown message status '{s}'")))
    }
}

/// `{messageType}-{userId}-{occurrenceDate}`, the storage-level uniqueness key.
pub fn idempotency_key(
    message_type: MessageType,
    user_id: &str,
    occurrence_date: NaiveDate,
) -> String {
    format!(
        "{}-{}-{}",
        message_type.as_str(),
        user_id,
        occurrence_date.format("%Y-%m-%d")
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub user_id: String,
    pub message_type: MessageType,
    pub occurrence_date: NaiveDate,
    pub idempotency_key: String,
    pub status: MessageStatus,
    /// Computed once at creation, never rewritten.
    pub scheduled_send_time_utc: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// A fresh PENDING record.
    pub fn pending(
        user_id: &str,
        message_type: MessageType,
        occurrence_date: NaiveDate,
        scheduled_send_time_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            message_type,
            occurrence_date,
            idempotency_key: idempotency_key(message_type, user_id, occurrence_date),
            status: MessageStatus::Pending,
            scheduled_send_time_utc,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            failed_at: None,
        }
    }
}

/// Extra columns written alongside a conditional status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub at: DateTime<Utc>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            retry_count: None,
            last_error: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_idempotency_key_format() {
        let key = idempotency_key(
            MessageType::Birthday,
            "user-42",
            NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
        );
        assert_eq!(key, "BIRTHDAY-user-42-2025-03-07");
    }

    #[test]
    fn test_allowed_transitions() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Queued));
        assert!(Sending.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Sending));
        assert!(!Queued.can_transition_to(Sent));
    }

    #[test]
    fn test_terminal_states_never_move() {
        for terminal in [MessageStatus::Sent, MessageStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in MessageStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_status_parse() {
        for status in MessageStatus::ALL {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_pending_record() {
        let now = Utc.with_ymd_and_hms(2025, 1, 14, 12, 0, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap();
        let record = MessageRecord::pending(
            "u1",
            MessageType::Anniversary,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            at,
            now,
        );
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.idempotency_key, "ANNIVERSARY-u1-2025-01-15");
        assert_eq!(record.scheduled_send_time_utc, at);
    }
}
