//! Eligibility Finder: daily coarse selection of upcoming occurrences.
//!
//! Walks every local calendar date that can intersect the target window in
//! some timezone, asks the user store who celebrates on it, and inserts one
//! PENDING record per (user, type, occurrence date). Overlapping runs are safe:
//! the idempotency key makes the second insert a no-op.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

use greeter_core::error::Result;
use greeter_core::traits::{Clock, UserStore};
use greeter_core::{MessageType, MonthDay, User};

use crate::persistence::MessageDb;
use crate::record::MessageRecord;
use crate::timezone::{parse_timezone, resolve_send_instant};

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[now - lookback, now + lookahead)`.
    pub fn around(now: DateTime<Utc>, lookback: Duration, lookahead: Duration) -> Self {
        Self {
            start: now - lookback,
            end: now + lookahead,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Local dates that can map into this range in any timezone (UTC-12..UTC+14).
    fn candidate_dates(&self) -> Vec<NaiveDate> {
        let first = self.start.date_naive() - Duration::days(1);
        let last = self.end.date_naive() + Duration::days(1);
        first.iter_days().take_while(|d| *d <= last).collect()
    }
}

/// Outcome of one finder run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderReport {
    pub users_scanned: usize,
    pub created: usize,
    pub already_scheduled: usize,
    pub skipped_invalid: usize,
}

pub struct EligibilityFinder {
    users: Arc<dyn UserStore>,
    store: Arc<MessageDb>,
    clock: Arc<dyn Clock>,
    send_hour: u32,
}

impl EligibilityFinder {
    pub fn new(
        users: Arc<dyn UserStore>,
        store: Arc<MessageDb>,
        clock: Arc<dyn Clock>,
        send_hour: u32,
    ) -> Self {
        Self {
            users,
            store,
            clock,
            send_hour,
        }
    }

    /// Insert PENDING records for every occurrence whose send instant falls
    /// inside `range`. Existing rows are never touched.
    pub async fn find_due_occurrences(&self, range: TimeRange) -> Result<FinderReport> {
        let now = self.clock.now();
        let mut report = FinderReport::default();

        for local_date in range.candidate_dates() {
            for month_day in MonthDay::celebrated_on(local_date) {
                let users = self.users.find_users_with_occurrence_on(month_day).await?;
                for user in users.iter().filter(|u| !u.is_deleted()) {
                    report.users_scanned += 1;
                    self.schedule_user(user, month_day, local_date, range, now, &mut report)?;
                }
            }
        }

        tracing::info!(
            created = report.created,
            existing = report.already_scheduled,
            skipped = report.skipped_invalid,
            "🎂 Eligibility run: {} new record(s) for {} → {}",
            report.created,
            range.start,
            range.end
        );
        Ok(report)
    }

    fn schedule_user(
        &self,
        user: &User,
        month_day: MonthDay,
        local_date: NaiveDate,
        range: TimeRange,
        now: DateTime<Utc>,
        report: &mut FinderReport,
    ) -> Result<()> {
        for message_type in MessageType::ALL {
            let Some(event_date) = user.event_date(message_type) else {
                continue;
            };
            if MonthDay::from_date(event_date) != month_day || local_date <= event_date {
                continue;
            }

            let tz = match parse_timezone(&user.timezone) {
                Ok(tz) => tz,
                Err(e) => {
                    tracing::warn!(user_id = %user.id, "⚠️ Skipping {message_type}: {e}");
                    report.skipped_invalid += 1;
                    continue;
                }
            };
            let send_at = match resolve_send_instant(local_date, tz, self.send_hour) {
                Ok(at) => at,
                Err(e) => {
                    tracing::warn!(user_id = %user.id, "⚠️ Skipping {message_type}: {e}");
                    report.skipped_invalid += 1;
                    continue;
                }
            };
            if !range.contains(send_at) {
                continue;
            }

            let record = MessageRecord::pending(&user.id, message_type, local_date, send_at, now);
            if self.store.insert_if_absent(&record)? {
                tracing::debug!(
                    key = %record.idempotency_key,
                    send_at = %send_at,
                    "📝 Scheduled {message_type} for {}",
                    user.id
                );
                report.created += 1;
            } else {
                report.already_scheduled += 1;
            }
        }
        Ok(())
    }
}
