//! # Greeter Scheduler
//!
//! Timezone-aware scheduling and delivery of birthday and anniversary
//! messages, exactly once per occurrence.
//!
//! ## Design Principles
//! - One row per (user, type, occurrence date); a UNIQUE idempotency key
//!   replaces any distributed lock
//! - Every status change is a compare-and-swap on `status`
//! - SQLite for both the record store and the job queue: survives restarts
//! - Tokio timers only: three independent loops and a bounded worker pool
//!
//! ## Architecture
//! ```text
//! Eligibility Finder (daily)   → PENDING rows
//! Dispatcher (every minute)    → QUEUED + job published
//! Worker pool (C workers)      → SENDING → Sender (via circuit breaker)
//!                                  ├── ok        → SENT
//!                                  ├── transient → QUEUED (retry 1/5/15 min) → ... → FAILED
//!                                  └── permanent → FAILED + dead letter
//! Recovery Sweep (hourly)      → re-enters stuck PENDING/QUEUED/SENDING rows
//! ```

pub mod breaker;
pub mod dispatch;
pub mod eligibility;
pub mod engine;
pub mod persistence;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod retry;
pub mod runs;
pub mod timezone;
pub mod worker;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dispatch::Dispatcher;
pub use eligibility::{EligibilityFinder, FinderReport, TimeRange};
pub use engine::SchedulerEngine;
pub use persistence::MessageDb;
pub use queue::{DeadLetter, JobPayload, JobQueue, PublishOptions, QueueDepth, QueuedJob, SqliteJobQueue};
pub use record::{MessageRecord, MessageStatus, StatusUpdate, idempotency_key};
pub use recovery::{RecoveryReport, RecoverySweep};
pub use retry::{MAX_RETRIES, RetryDecision, backoff_for_retry, next_attempt};
pub use runs::{MessageCounts, RunStats, SchedulerKind};
pub use timezone::{parse_timezone, resolve_send_instant};
pub use worker::{JobOutcome, Worker, WorkerPool, drain};
