//! Recovery Sweep: hourly reconciliation of records stuck mid-pipeline.
//!
//! | stuck in | condition                        | action                                  |
//! |----------|----------------------------------|-----------------------------------------|
//! | PENDING  | scheduled before `now - grace`   | mark QUEUED, publish                    |
//! | QUEUED   | unchanged for `staleness`        | publish again (job lost or never sent)  |
//! | SENDING  | unchanged for `staleness`        | worker died mid-send: transient failure |
//!
//! SENT and FAILED rows are never selected.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use greeter_core::error::Result;

use crate::persistence::MessageDb;
use crate::queue::{JobPayload, JobQueue, PublishOptions};
use crate::record::{MessageRecord, MessageStatus, StatusUpdate};
use crate::retry::{RetryDecision, next_attempt};

/// Recovered jobs jump ahead of freshly dispatched ones.
const RECOVERY_PRIORITY: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub overdue_pending: usize,
    pub stale_queued: usize,
    pub stale_sending: usize,
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.overdue_pending + self.stale_queued + self.stale_sending + self.failed
    }
}

pub struct RecoverySweep {
    store: Arc<MessageDb>,
    queue: Arc<dyn JobQueue>,
    staleness: Duration,
    grace: Duration,
    batch_size: usize,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<MessageDb>,
        queue: Arc<dyn JobQueue>,
        staleness: Duration,
        grace: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            staleness,
            grace,
            batch_size: batch_size.max(1),
        }
    }

    /// Re-enter orphaned records into the pipeline. Returns the number of
    /// records acted on.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        let report = self.sweep(now).await?;
        if report.total() > 0 {
            tracing::warn!(
                pending = report.overdue_pending,
                queued = report.stale_queued,
                sending = report.stale_sending,
                failed = report.failed,
                "🩹 Recovery re-entered {} record(s)",
                report.total()
            );
        } else {
            tracing::info!("🩹 Recovery sweep: nothing stuck");
        }
        Ok(report.total())
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let overdue =
            self.store
                .find_scheduled_before(MessageStatus::Pending, now - self.grace, self.batch_size)?;
        for record in overdue {
            if self.store.update_status(
                &record.id,
                MessageStatus::Pending,
                MessageStatus::Queued,
                &StatusUpdate::at(now),
            )? {
                tracing::debug!(record_id = %record.id, "🩹 Overdue PENDING → QUEUED");
                self.republish(&record, record.retry_count).await?;
                report.overdue_pending += 1;
            }
        }

        let cutoff = now - self.staleness;

        let stale_queued =
            self.store
                .find_updated_before(MessageStatus::Queued, cutoff, self.batch_size)?;
        for record in stale_queued {
            if self.store.touch(&record.id, MessageStatus::Queued, now)? {
                tracing::debug!(record_id = %record.id, "🩹 Stale QUEUED re-published");
                self.republish(&record, record.retry_count).await?;
                report.stale_queued += 1;
            }
        }

        let stale_sending =
            self.store
                .find_updated_before(MessageStatus::Sending, cutoff, self.batch_size)?;
        for record in stale_sending {
            let update = StatusUpdate::at(now).with_error("stuck in SENDING");
            match next_attempt(record.retry_count) {
                RetryDecision::Requeue { retry_count, .. } => {
                    if self.store.update_status(
                        &record.id,
                        MessageStatus::Sending,
                        MessageStatus::Queued,
                        &update.with_retry_count(retry_count),
                    )? {
                        self.republish(&record, retry_count).await?;
                        report.stale_sending += 1;
                    }
                }
                RetryDecision::Exhausted => {
                    if self.store.update_status(
                        &record.id,
                        MessageStatus::Sending,
                        MessageStatus::Failed,
                        &update,
                    )? {
                        tracing::warn!(record_id = %record.id, "💀 Stuck SENDING with no retries left");
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn republish(&self, record: &MessageRecord, retry_count: u32) -> Result<()> {
        let payload = JobPayload {
            retry_count,
            ..JobPayload::for_record(record)
        };
        self.queue
            .publish(
                &payload,
                PublishOptions {
                    delay: Duration::zero(),
                    priority: RECOVERY_PRIORITY,
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use greeter_core::traits::ManualClock;
    use greeter_core::MessageType;

    use crate::queue::{QueueDepth, SqliteJobQueue};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap()
    }

    fn setup() -> (Arc<MessageDb>, Arc<SqliteJobQueue>, RecoverySweep) {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0() + Duration::hours(1)));
        let queue = Arc::new(SqliteJobQueue::open_in_memory(clock, Duration::minutes(5)).unwrap());
        let sweep = RecoverySweep::new(
            db.clone(),
            queue.clone(),
            Duration::minutes(30),
            Duration::minutes(5),
            100,
        );
        (db, queue, sweep)
    }

    fn insert_in(db: &MessageDb, user: &str, path: &[MessageStatus]) -> MessageRecord {
        let record = MessageRecord::pending(
            user,
            MessageType::Birthday,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            t0(),
            t0(),
        );
        db.insert_if_absent(&record).unwrap();
        for pair in path.windows(2) {
            assert!(db
                .update_status(&record.id, pair[0], pair[1], &StatusUpdate::at(t0()))
                .unwrap());
        }
        record
    }

    #[tokio::test]
    async fn test_overdue_pending_is_queued() {
        let (db, queue, sweep) = setup();
        let record = insert_in(&db, "u1", &[MessageStatus::Pending]);

        assert_eq!(sweep.recover(t0() + Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(db.get(&record.id).unwrap().unwrap().status, MessageStatus::Queued);
        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.payload.record_id, record.id);
    }

    #[tokio::test]
    async fn test_pending_within_grace_is_left_alone() {
        let (db, _queue, sweep) = setup();
        insert_in(&db, "u1", &[MessageStatus::Pending]);
        assert_eq!(sweep.recover(t0() + Duration::minutes(4)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_queued_is_republished_once_per_staleness() {
        let (db, queue, sweep) = setup();
        let record = insert_in(&db, "u1", &[MessageStatus::Pending, MessageStatus::Queued]);

        let now = t0() + Duration::hours(1);
        assert_eq!(sweep.recover(now).await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
        // Touched, so a sweep right after does nothing.
        assert_eq!(sweep.recover(now + Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(db.get(&record.id).unwrap().unwrap().status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn test_stale_sending_counts_as_transient_failure() {
        let (db, queue, sweep) = setup();
        let record = insert_in(
            &db,
            "u1",
            &[MessageStatus::Pending, MessageStatus::Queued, MessageStatus::Sending],
        );

        assert_eq!(sweep.recover(t0() + Duration::hours(1)).await.unwrap(), 1);
        let stored = db.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.payload.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_sending_without_retries_fails() {
        let (db, _queue, sweep) = setup();
        let record = insert_in(
            &db,
            "u1",
            &[MessageStatus::Pending, MessageStatus::Queued, MessageStatus::Sending],
        );
        db.update_status(
            &record.id,
            MessageStatus::Sending,
            MessageStatus::Queued,
            &StatusUpdate::at(t0()).with_retry_count(3),
        )
        .unwrap();
        db.update_status(&record.id, MessageStatus::Queued, MessageStatus::Sending, &StatusUpdate::at(t0()))
            .unwrap();

        let report = sweep.sweep(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(db.get(&record.id).unwrap().unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_records_untouched() {
        let (db, queue, sweep) = setup();
        insert_in(
            &db,
            "sent",
            &[
                MessageStatus::Pending,
                MessageStatus::Queued,
                MessageStatus::Sending,
                MessageStatus::Sent,
            ],
        );
        assert_eq!(sweep.recover(t0() + Duration::days(2)).await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }
}
