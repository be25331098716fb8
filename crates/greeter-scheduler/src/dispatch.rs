//! Dispatcher: per-minute promotion of due PENDING records onto the queue.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use greeter_core::error::Result;

use crate::persistence::MessageDb;
use crate::queue::{JobPayload, JobQueue, PublishOptions};
use crate::record::{MessageStatus, StatusUpdate};

pub struct Dispatcher {
    store: Arc<MessageDb>,
    queue: Arc<dyn JobQueue>,
    /// Look-ahead past `now`.
    window: Duration,
    /// Look-behind before `now`, so a late tick does not strand records
    /// scheduled between two ticks.
    catch_up: Duration,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MessageDb>,
        queue: Arc<dyn JobQueue>,
        window: Duration,
        catch_up: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            window,
            catch_up,
            batch_size: batch_size.max(1),
        }
    }

    /// Queue every PENDING record due before `now + window`. Returns how many
    /// records this call moved to QUEUED.
    ///
    /// The record is marked QUEUED before its job is published. A crash in
    /// between leaves a QUEUED record with no job, which the recovery sweep
    /// re-publishes once it goes stale.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.find_scheduled_between(
            MessageStatus::Pending,
            now - self.catch_up,
            now + self.window,
            self.batch_size,
        )?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut queued = 0;
        for mut record in due {
            let claimed = self.store.update_status(
                &record.id,
                MessageStatus::Pending,
                MessageStatus::Queued,
                &StatusUpdate::at(now),
            )?;
            if !claimed {
                tracing::debug!(record_id = %record.id, "⏭️ Already dispatched elsewhere");
                continue;
            }
            record.status = MessageStatus::Queued;

            let delay = (record.scheduled_send_time_utc - now).max(Duration::zero());
            if let Err(e) = self
                .queue
                .publish(&JobPayload::for_record(&record), PublishOptions::delayed(delay))
                .await
            {
                tracing::error!(
                    record_id = %record.id,
                    "❌ Publish failed after marking QUEUED, left for recovery: {e}"
                );
                return Err(e);
            }
            queued += 1;
        }

        if queued == self.batch_size {
            tracing::warn!("⚠️ Dispatch batch full ({queued}), remaining records wait for next tick");
        }
        tracing::info!("📤 Dispatched {queued} message(s)");
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use greeter_core::MessageType;
    use greeter_core::error::GreeterError;
    use greeter_core::traits::ManualClock;

    use crate::queue::{DeadLetter, QueueDepth, QueuedJob, SqliteJobQueue};
    use crate::record::MessageRecord;
    use crate::recovery::RecoverySweep;

    /// Broker that refuses every publish.
    struct QueueDown;

    #[async_trait]
    impl JobQueue for QueueDown {
        async fn publish(&self, _: &JobPayload, _: PublishOptions) -> Result<String> {
            Err(GreeterError::Queue("broker unreachable".into()))
        }
        async fn claim(&self) -> Result<Option<QueuedJob>> {
            Ok(None)
        }
        async fn ack(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn nack(&self, _: &str, _: Duration, _: &str) -> Result<()> {
            Ok(())
        }
        async fn dead_letter(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn dead_letters(&self, _: usize) -> Result<Vec<DeadLetter>> {
            Ok(vec![])
        }
        async fn depth(&self) -> Result<QueueDepth> {
            Ok(QueueDepth::default())
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, s).unwrap()
    }

    fn setup(now: DateTime<Utc>, batch: usize) -> (Arc<MessageDb>, Arc<SqliteJobQueue>, Dispatcher) {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(now));
        let queue = Arc::new(SqliteJobQueue::open_in_memory(clock, Duration::minutes(5)).unwrap());
        let dispatcher = Dispatcher::new(
            db.clone(),
            queue.clone(),
            Duration::minutes(1),
            Duration::minutes(5),
            batch,
        );
        (db, queue, dispatcher)
    }

    fn insert(db: &MessageDb, user: &str, scheduled: DateTime<Utc>) -> MessageRecord {
        let record = MessageRecord::pending(
            user,
            MessageType::Birthday,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            scheduled,
            at(0, 0, 0),
        );
        db.insert_if_absent(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_dispatches_only_due_window() {
        let now = at(14, 0, 0);
        let (db, queue, dispatcher) = setup(now, 100);
        let due = insert(&db, "due", at(14, 0, 30));
        let later = insert(&db, "later", at(14, 1, 0));
        let stale = insert(&db, "stale", at(13, 0, 0));

        assert_eq!(dispatcher.dispatch_due(now).await.unwrap(), 1);
        assert_eq!(db.get(&due.id).unwrap().unwrap().status, MessageStatus::Queued);
        assert_eq!(db.get(&later.id).unwrap().unwrap().status, MessageStatus::Pending);
        // Beyond catch-up: recovery's job, not ours.
        assert_eq!(db.get(&stale.id).unwrap().unwrap().status, MessageStatus::Pending);

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.delayed, 1, "job waits until its scheduled second");
    }

    #[tokio::test]
    async fn test_second_tick_does_not_republish() {
        let now = at(14, 0, 0);
        let (db, queue, dispatcher) = setup(now, 100);
        insert(&db, "u1", at(14, 0, 0));

        assert_eq!(dispatcher.dispatch_due(now).await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_due(now).await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_batch_bound() {
        let now = at(14, 0, 0);
        let (db, _queue, dispatcher) = setup(now, 2);
        for user in ["a", "b", "c"] {
            insert(&db, user, at(14, 0, 0));
        }
        assert_eq!(dispatcher.dispatch_due(now).await.unwrap(), 2);
        assert_eq!(dispatcher.dispatch_due(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_after_late_tick() {
        let (db, queue, dispatcher) = setup(at(14, 2, 10), 100);
        let record = insert(&db, "u1", at(14, 0, 0));
        assert_eq!(dispatcher.dispatch_due(at(14, 2, 10)).await.unwrap(), 1);
        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.payload.record_id, record.id);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_queued_record_for_recovery() {
        let now = at(14, 0, 0);
        let (db, queue, _) = setup(now, 100);
        let first = insert(&db, "first", at(14, 0, 0));
        let second = insert(&db, "second", at(14, 0, 30));

        let broken = Dispatcher::new(
            db.clone(),
            Arc::new(QueueDown),
            Duration::minutes(1),
            Duration::minutes(5),
            100,
        );
        assert!(matches!(broken.dispatch_due(now).await, Err(GreeterError::Queue(_))));

        // The claimed record is QUEUED with no job behind it; the tick stopped there.
        assert_eq!(db.get(&first.id).unwrap().unwrap().status, MessageStatus::Queued);
        assert_eq!(db.get(&second.id).unwrap().unwrap().status, MessageStatus::Pending);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());

        let recovery = RecoverySweep::new(
            db.clone(),
            queue.clone(),
            Duration::minutes(30),
            Duration::minutes(5),
            500,
        );
        // Neither stale nor past grace yet.
        assert_eq!(recovery.sweep(at(14, 4, 0)).await.unwrap(), Default::default());

        let report = recovery.sweep(at(14, 31, 0)).await.unwrap();
        assert_eq!(report.stale_queued, 1);
        assert_eq!(report.overdue_pending, 1);
        assert_eq!(db.get(&second.id).unwrap().unwrap().status, MessageStatus::Queued);
        assert_eq!(queue.depth().await.unwrap().ready, 2);

        let mut claimed = vec![
            queue.claim().await.unwrap().unwrap().payload.record_id,
            queue.claim().await.unwrap().unwrap().payload.record_id,
        ];
        claimed.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(claimed, expected);
    }
}
