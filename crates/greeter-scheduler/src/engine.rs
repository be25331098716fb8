//! Scheduler Engine: wires the pipeline together and runs the three
//! periodic triggers plus the worker pool.
//!
//! Each trigger is an independent `tokio::time::interval` loop. They share
//! nothing in memory; all coordination goes through the record store and the
//! queue. Every tick is written to `scheduler_runs` whether it succeeds or not.

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use greeter_core::config::{GreeterConfig, expand_path};
use greeter_core::error::Result;
use greeter_core::traits::{Clock, Sender, UserStore};

use crate::breaker::CircuitBreaker;
use crate::dispatch::Dispatcher;
use crate::eligibility::{EligibilityFinder, TimeRange};
use crate::persistence::MessageDb;
use crate::queue::{JobQueue, SqliteJobQueue};
use crate::recovery::RecoverySweep;
use crate::runs::SchedulerKind;
use crate::worker::{Worker, WorkerPool};

pub struct SchedulerEngine {
    store: Arc<MessageDb>,
    queue: Arc<dyn JobQueue>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    finder: EligibilityFinder,
    dispatcher: Dispatcher,
    recovery: RecoverySweep,
    worker: Arc<Worker>,
    lookback: Duration,
    lookahead: Duration,
    eligibility_every: std::time::Duration,
    dispatch_every: std::time::Duration,
    recovery_every: std::time::Duration,
    concurrency: usize,
    poll_interval: std::time::Duration,
}

impl SchedulerEngine {
    /// Open the record store and queue at `config.database_path`.
    pub fn from_config(
        config: &GreeterConfig,
        users: Arc<dyn UserStore>,
        sender: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db_path = expand_path(&config.database_path);
        let store = Arc::new(MessageDb::open(&db_path)?);
        let queue = Arc::new(SqliteJobQueue::open(
            &db_path,
            clock.clone(),
            Duration::seconds(config.worker.visibility_timeout_secs as i64),
        )?);
        tracing::info!("🗄️ Message store: {}", db_path.display());
        Ok(Self::new(config, store, queue, users, sender, clock))
    }

    pub fn new(
        config: &GreeterConfig,
        store: Arc<MessageDb>,
        queue: Arc<dyn JobQueue>,
        users: Arc<dyn UserStore>,
        sender: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schedule = &config.schedule;
        let secs = |s: u64| Duration::seconds(s as i64);

        let breaker = Arc::new(CircuitBreaker::new(
            sender.name(),
            &config.breaker,
            std::time::Duration::from_secs(config.worker.send_timeout_secs),
            clock.clone(),
        ));
        let finder = EligibilityFinder::new(
            users.clone(),
            store.clone(),
            clock.clone(),
            schedule.send_hour,
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            secs(schedule.dispatch_window_secs),
            secs(schedule.grace_period_secs),
            schedule.dispatch_batch_size,
        );
        let recovery = RecoverySweep::new(
            store.clone(),
            queue.clone(),
            secs(schedule.staleness_timeout_secs),
            secs(schedule.grace_period_secs),
            schedule.dispatch_batch_size,
        );
        let worker = Arc::new(Worker::new(
            store.clone(),
            queue.clone(),
            users,
            sender,
            breaker.clone(),
            clock.clone(),
            secs(config.worker.infra_retry_delay_secs),
        ));

        Self {
            store,
            queue,
            breaker,
            clock,
            finder,
            dispatcher,
            recovery,
            worker,
            lookback: Duration::hours(schedule.lookback_hours as i64),
            lookahead: Duration::hours(schedule.lookahead_hours as i64),
            eligibility_every: std::time::Duration::from_secs(schedule.eligibility_interval_secs.max(1)),
            dispatch_every: std::time::Duration::from_secs(schedule.dispatch_interval_secs.max(1)),
            recovery_every: std::time::Duration::from_secs(schedule.recovery_interval_secs.max(1)),
            concurrency: config.worker.concurrency,
            poll_interval: std::time::Duration::from_millis(config.worker.poll_interval_ms),
        }
    }

    pub fn store(&self) -> Arc<MessageDb> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn worker(&self) -> Arc<Worker> {
        self.worker.clone()
    }

    /// Eligibility Finder over `[now - lookback, now + lookahead)`.
    pub async fn run_eligibility_tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let range = TimeRange::around(now, self.lookback, self.lookahead);
        let result = self.finder.find_due_occurrences(range).await.map(|r| r.created);
        self.record(SchedulerKind::Eligibility, self.eligibility_every, &result);
        result
    }

    pub async fn run_dispatch_tick(&self) -> Result<usize> {
        let result = self.dispatcher.dispatch_due(self.clock.now()).await;
        self.record(SchedulerKind::Dispatch, self.dispatch_every, &result);
        result
    }

    pub async fn run_recovery_tick(&self) -> Result<usize> {
        let result = self.recovery.recover(self.clock.now()).await;
        self.record(SchedulerKind::Recovery, self.recovery_every, &result);
        result
    }

    async fn tick(&self, kind: SchedulerKind) {
        let result = match kind {
            SchedulerKind::Eligibility => self.run_eligibility_tick().await,
            SchedulerKind::Dispatch => self.run_dispatch_tick().await,
            SchedulerKind::Recovery => self.run_recovery_tick().await,
        };
        if let Err(e) = result {
            tracing::error!(scheduler = %kind, "❌ Tick failed, retrying next interval: {e}");
        }
    }

    fn record(&self, kind: SchedulerKind, every: std::time::Duration, result: &Result<usize>) {
        let now = self.clock.now();
        let next = now + Duration::from_std(every).unwrap_or_else(|_| Duration::zero());
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.store.record_run(kind, now, next, error.as_deref()) {
            tracing::error!(scheduler = %kind, "❌ Failed to record run: {e}");
        }
    }

    /// Run all loops until `shutdown` becomes true. Ticks already running and
    /// jobs already claimed are finished before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Scheduler started (eligibility every {}s, dispatch every {}s, recovery every {}s)",
            self.eligibility_every.as_secs(),
            self.dispatch_every.as_secs(),
            self.recovery_every.as_secs()
        );

        let mut tasks = JoinSet::new();
        for (kind, every) in [
            (SchedulerKind::Eligibility, self.eligibility_every),
            (SchedulerKind::Dispatch, self.dispatch_every),
            (SchedulerKind::Recovery, self.recovery_every),
        ] {
            tasks.spawn(periodic(self.clone(), kind, every, shutdown.clone()));
        }
        let pool = WorkerPool::new(self.worker.clone(), self.concurrency, self.poll_interval);
        tasks.spawn(pool.run(shutdown));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Scheduler task panicked: {e}");
            }
        }
        tracing::info!("⏰ Scheduler stopped");
    }
}

async fn periodic(
    engine: Arc<SchedulerEngine>,
    kind: SchedulerKind,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => engine.tick(kind).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(scheduler = %kind, "loop stopped");
}
