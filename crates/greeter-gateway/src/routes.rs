//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use std::sync::Arc;

use super::server::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

fn internal_error(e: impl std::fmt::Display) -> Json<serde_json::Value> {
    tracing::error!("❌ Gateway query failed: {e}");
    Json(serde_json::json!({"ok": false, "error": e.to_string()}))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "greeter",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "greeter",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sender": state.breaker.snapshot().name,
    }))
}

/// `{lastRunAt, nextRunAt, runCount, errorCount}` per periodic trigger.
pub async fn scheduler_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.store.run_stats() {
        Ok(stats) => {
            let schedulers: Vec<_> = stats
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "lastRunAt": s.last_run_at.map(|t| t.to_rfc3339()),
                        "nextRunAt": s.next_run_at.map(|t| t.to_rfc3339()),
                        "runCount": s.run_count,
                        "errorCount": s.error_count,
                        "lastError": s.last_error,
                    })
                })
                .collect();
            Json(serde_json::json!({"ok": true, "schedulers": schedulers}))
        }
        Err(e) => internal_error(e),
    }
}

pub async fn message_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.store.count_by_type() {
        Ok(counts) => {
            let by_type: serde_json::Map<_, _> = counts
                .into_iter()
                .map(|(mt, c)| (mt.as_str().to_string(), serde_json::json!(c)))
                .collect();
            Json(serde_json::json!({"ok": true, "messages": by_type}))
        }
        Err(e) => internal_error(e),
    }
}

/// Look a record up by idempotency key, e.g. `BIRTHDAY-u1-2025-01-15`.
pub async fn message_by_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<serde_json::Value> {
    match state.store.get_by_key(&key) {
        Ok(Some(record)) => Json(serde_json::json!({"ok": true, "message": record})),
        Ok(None) => Json(serde_json::json!({"ok": false, "error": format!("No message '{key}'")})),
        Err(e) => internal_error(e),
    }
}

pub async fn user_messages(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    match state.store.records_for_user(&user_id) {
        Ok(records) => Json(serde_json::json!({
            "ok": true,
            "total": records.len(),
            "messages": records,
        })),
        Err(e) => internal_error(e),
    }
}

/// Queue depth plus the breaker guarding the sender.
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.queue.depth().await {
        Ok(depth) => Json(serde_json::json!({
            "ok": true,
            "queue": depth,
            "breaker": state.breaker.snapshot(),
        })),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

pub async fn dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    match state.queue.dead_letters(limit).await {
        Ok(letters) => Json(serde_json::json!({
            "ok": true,
            "total": letters.len(),
            "dead_letters": letters,
        })),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use greeter_core::MessageType;
    use greeter_core::config::BreakerConfig;
    use greeter_core::traits::SystemClock;
    use greeter_scheduler::{
        CircuitBreaker, JobPayload, JobQueue, MessageDb, MessageRecord, MessageStatus,
        PublishOptions, SchedulerKind, SqliteJobQueue, StatusUpdate,
    };

    fn test_state() -> State<Arc<AppState>> {
        let clock = Arc::new(SystemClock);
        State(Arc::new(AppState::new(
            Arc::new(MessageDb::open_in_memory().unwrap()),
            Arc::new(
                SqliteJobQueue::open_in_memory(clock.clone(), chrono::Duration::minutes(5)).unwrap(),
            ),
            Arc::new(CircuitBreaker::new(
                "http",
                &BreakerConfig::default(),
                std::time::Duration::from_secs(10),
                clock,
            )),
        )))
    }

    fn record(user: &str) -> MessageRecord {
        let now = Utc.with_ymd_and_hms(2025, 1, 14, 12, 0, 0).unwrap();
        MessageRecord::pending(
            user,
            MessageType::Birthday,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap(),
            now,
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check(test_state()).await.0;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "greeter");
    }

    #[tokio::test]
    async fn test_system_info_names_sender() {
        let json = system_info(test_state()).await.0;
        assert_eq!(json["sender"], "http");
    }

    #[tokio::test]
    async fn test_scheduler_stats_lists_all_triggers() {
        let state = test_state();
        let now = Utc::now();
        state
            .store
            .record_run(SchedulerKind::Dispatch, now, now, Some("queue down"))
            .unwrap();

        let json = scheduler_stats(state).await.0;
        assert!(json["ok"].as_bool().unwrap());
        let schedulers = json["schedulers"].as_array().unwrap();
        assert_eq!(schedulers.len(), 3);
        let dispatch = schedulers.iter().find(|s| s["name"] == "dispatch").unwrap();
        assert_eq!(dispatch["runCount"], 1);
        assert_eq!(dispatch["errorCount"], 1);
        assert_eq!(dispatch["lastError"], "queue down");
        let eligibility = schedulers.iter().find(|s| s["name"] == "eligibility").unwrap();
        assert_eq!(eligibility["runCount"], 0);
        assert!(eligibility["lastRunAt"].is_null());
    }

    #[tokio::test]
    async fn test_message_stats_by_type() {
        let state = test_state();
        let r = record("u1");
        state.store.insert_if_absent(&r).unwrap();
        state
            .store
            .update_status(
                &r.id,
                MessageStatus::Pending,
                MessageStatus::Queued,
                &StatusUpdate::at(Utc::now()),
            )
            .unwrap();
        state.store.insert_if_absent(&record("u2")).unwrap();

        let json = message_stats(state).await.0;
        assert_eq!(json["messages"]["BIRTHDAY"]["pending"], 1);
        assert_eq!(json["messages"]["BIRTHDAY"]["queued"], 1);
        assert_eq!(json["messages"]["ANNIVERSARY"]["sent"], 0);
    }

    #[tokio::test]
    async fn test_message_lookup() {
        let state = test_state();
        state.store.insert_if_absent(&record("u1")).unwrap();

        let found = message_by_key(state.clone(), Path("BIRTHDAY-u1-2025-01-15".to_string()))
            .await
            .0;
        assert!(found["ok"].as_bool().unwrap());
        assert_eq!(found["message"]["status"], "PENDING");

        let missing = message_by_key(state.clone(), Path("BIRTHDAY-x-2025-01-15".to_string()))
            .await
            .0;
        assert!(!missing["ok"].as_bool().unwrap());

        let by_user = user_messages(state, Path("u1".to_string())).await.0;
        assert_eq!(by_user["total"], 1);
    }

    #[tokio::test]
    async fn test_queue_stats_and_dead_letters() {
        let state = test_state();
        let r = record("u1");
        let id = state
            .queue
            .publish(&JobPayload::for_record(&r), PublishOptions::default())
            .await
            .unwrap();
        state.queue.dead_letter(&id, "HTTP 400").await.unwrap();

        let json = queue_stats(state.clone()).await.0;
        assert_eq!(json["queue"]["dead"], 1);
        assert_eq!(json["breaker"]["state"], "CLOSED");

        let json = dead_letters(state, Query(DeadLetterQuery { limit: None })).await.0;
        assert_eq!(json["total"], 1);
        assert_eq!(json["dead_letters"][0]["reason"], "HTTP 400");
    }
}
