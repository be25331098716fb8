//! Queue consumers: one job in, one state-machine step out.
//!
//! A job is acked only after the record reached its next state. Store or
//! queue failures while handling a job release it with `nack` so the broker
//! redelivers it later instead of the worker spinning on it.

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use greeter_core::error::{Result, SendError};
use greeter_core::traits::{Clock, Sender, UserStore};

use crate::breaker::CircuitBreaker;
use crate::persistence::MessageDb;
use crate::queue::{JobPayload, JobQueue, PublishOptions, QueuedJob};
use crate::record::{MessageRecord, MessageStatus, StatusUpdate};
use crate::retry::{RetryDecision, next_attempt};

/// What a worker did with one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    /// Transient failure, record back in QUEUED with a delayed job.
    Retrying { retry_count: u32, delay: Duration },
    /// Terminal failure, job dead-lettered.
    Failed,
    /// Duplicate or stale job; acked without touching the record.
    Skipped,
    /// Infrastructure error; job released for redelivery.
    Released,
}

pub struct Worker {
    store: Arc<MessageDb>,
    queue: Arc<dyn JobQueue>,
    users: Arc<dyn UserStore>,
    sender: Arc<dyn Sender>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    infra_retry_delay: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<MessageDb>,
        queue: Arc<dyn JobQueue>,
        users: Arc<dyn UserStore>,
        sender: Arc<dyn Sender>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        infra_retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            users,
            sender,
            breaker,
            clock,
            infra_retry_delay,
        }
    }

    /// Claim and handle one job. `Ok(None)` when the queue has nothing visible.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };

        match self.handle(&job).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    record_id = %job.payload.record_id,
                    "❌ Job handling failed, releasing: {e}"
                );
                self.queue
                    .nack(&job.id, self.infra_retry_delay, &e.to_string())
                    .await?;
                Ok(Some(JobOutcome::Released))
            }
        }
    }

    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload = &job.payload;
        let Some(record) = self.store.get(&payload.record_id)? else {
            self.queue.dead_letter(&job.id, "record not found").await?;
            return Ok(JobOutcome::Failed);
        };

        // Terminal, in flight elsewhere, or superseded by a newer retry job.
        if record.status != MessageStatus::Queued || record.retry_count != payload.retry_count {
            tracing::debug!(
                record_id = %record.id,
                status = %record.status,
                "⏭️ Dropping stale job"
            );
            self.queue.ack(&job.id).await?;
            return Ok(JobOutcome::Skipped);
        }

        let user = self.users.get_user(&record.user_id).await?;

        let now = self.clock.now();
        if !self.store.update_status(
            &record.id,
            MessageStatus::Queued,
            MessageStatus::Sending,
            &StatusUpdate::at(now),
        )? {
            self.queue.ack(&job.id).await?;
            return Ok(JobOutcome::Skipped);
        }

        let user = match user {
            Some(user) if !user.is_deleted() => user,
            Some(_) => return self.fail(job, &record, "user deleted").await,
            None => return self.fail(job, &record, "user not found").await,
        };

        let contact = user.contact();
        let result = self
            .breaker
            .call(|| {
                self.sender
                    .send(&contact, record.message_type, record.occurrence_date)
            })
            .await;

        match result {
            Ok(()) => {
                let marked = self.store.update_status(
                    &record.id,
                    MessageStatus::Sending,
                    MessageStatus::Sent,
                    &StatusUpdate::at(self.clock.now()),
                )?;
                if !marked {
                    tracing::warn!(record_id = %record.id, "⚠️ Sent, but record left SENDING meanwhile");
                }
                self.queue.ack(&job.id).await?;
                tracing::info!(
                    record_id = %record.id,
                    user_id = %record.user_id,
                    retry_count = record.retry_count,
                    "🎉 {} sent via {}",
                    record.message_type,
                    self.sender.name()
                );
                Ok(JobOutcome::Sent)
            }
            Err(e) if e.is_retryable() => self.retry_or_fail(job, &record, &e).await,
            Err(e) => self.fail(job, &record, &e.to_string()).await,
        }
    }

    async fn retry_or_fail(
        &self,
        job: &QueuedJob,
        record: &MessageRecord,
        error: &SendError,
    ) -> Result<JobOutcome> {
        match next_attempt(record.retry_count) {
            RetryDecision::Requeue { retry_count, delay } => {
                let now = self.clock.now();
                self.store.update_status(
                    &record.id,
                    MessageStatus::Sending,
                    MessageStatus::Queued,
                    &StatusUpdate::at(now)
                        .with_retry_count(retry_count)
                        .with_error(error.to_string()),
                )?;
                let payload = JobPayload {
                    retry_count,
                    ..JobPayload::for_record(record)
                };
                self.queue
                    .publish(&payload, PublishOptions::delayed(delay))
                    .await?;
                self.queue.ack(&job.id).await?;
                tracing::warn!(
                    record_id = %record.id,
                    retry_count,
                    retry_at = %(now + delay),
                    "🔁 Transient failure, retrying: {error}"
                );
                Ok(JobOutcome::Retrying { retry_count, delay })
            }
            RetryDecision::Exhausted => {
                self.fail(job, record, &format!("retries exhausted: {error}")).await
            }
        }
    }

    async fn fail(&self, job: &QueuedJob, record: &MessageRecord, reason: &str) -> Result<JobOutcome> {
        self.store.update_status(
            &record.id,
            MessageStatus::Sending,
            MessageStatus::Failed,
            &StatusUpdate::at(self.clock.now()).with_error(reason),
        )?;
        self.queue.dead_letter(&job.id, reason).await?;
        tracing::warn!(
            record_id = %record.id,
            user_id = %record.user_id,
            retry_count = record.retry_count,
            "💀 {} failed: {reason}",
            record.message_type
        );
        Ok(JobOutcome::Failed)
    }
}

/// Bounded set of workers draining the queue.
pub struct WorkerPool {
    worker: Arc<Worker>,
    concurrency: usize,
    poll_interval: std::time::Duration,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, concurrency: usize, poll_interval: std::time::Duration) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run until `shutdown` flips to true. A job already being handled is
    /// finished before its worker exits.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!("👷 Worker pool started ({} workers)", self.concurrency);
        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let worker = self.worker.clone();
            let shutdown = shutdown.clone();
            let poll = self.poll_interval;
            workers.spawn(async move { worker_loop(id, worker, poll, shutdown).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Worker task panicked: {e}");
            }
        }
        tracing::info!("👷 Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    worker: Arc<Worker>,
    poll: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match worker.run_once().await {
            Ok(Some(outcome)) => {
                tracing::debug!(worker = id, ?outcome, "job handled");
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::error!(worker = id, "❌ Queue unavailable: {e}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Drain everything currently visible. Returns the outcomes in order.
pub async fn drain(worker: &Worker) -> Result<Vec<JobOutcome>> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.run_once().await? {
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
