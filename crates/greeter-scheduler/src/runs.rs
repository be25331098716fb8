//! Per-scheduler run bookkeeping surfaced to operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three periodic triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Eligibility,
    Dispatch,
    Recovery,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 3] = [
        SchedulerKind::Eligibility,
        SchedulerKind::Dispatch,
        SchedulerKind::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Eligibility => "eligibility",
            SchedulerKind::Dispatch => "dispatch",
            SchedulerKind::Recovery => "recovery",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{lastRunAt, nextRunAt, runCount, errorCount}` for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Sent/failed/in-flight counts for one message type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub pending: u64,
    pub queued: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
}
