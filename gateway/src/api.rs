use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use farm_common::{
    rules::ExecutionLogEntry, tank_report, AutomationMode, CommandRecord, CommandStatus,
    CommandUpdate, IngestPayload, Metric, NewActionLog, NewFeedingEvent, NewMotionEvent,
    QueueCommandRequest, Rule, SensorReading,
};

use crate::{
    app::{error_response, ApiJson, AppState},
    poller::PollState,
    store::{ReadingQuery, StoreCounts},
};

fn limit_param(params: &HashMap<String, String>, default: usize, max: usize) -> usize {
    params
        .get("limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(1, max)
}

fn device_param(params: &HashMap<String, String>) -> Option<&str> {
    params
        .get("device_id")
        .map(String::as_str)
        .filter(|id| !id.trim().is_empty())
}

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

#[derive(Debug, Serialize)]
struct StatusView {
    device_id: String,
    esp_configured: bool,
    poll_source: &'static str,
    uptime_s: i64,
    poll: PollState,
    automation_mode: AutomationMode,
    automation_started: bool,
    active_rules: Vec<String>,
    store: StoreCounts,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let poll = state.poll_state.borrow().clone();
    let (automation_mode, automation_started, active_rules) = {
        let engine = state.rules.lock().await;
        (engine.mode(), engine.is_started(), engine.active().to_vec())
    };

    Json(StatusView {
        device_id: state.config.device_id.clone(),
        esp_configured: state.device.base_url().is_some(),
        poll_source: state.config.poller.source.as_str(),
        uptime_s: (Utc::now() - state.started_at).num_seconds(),
        poll,
        automation_mode,
        automation_started,
        active_rules,
        store: state.store.counts().await,
    })
}

/// Dashboard queue: stores the command and its history row in one go.
pub async fn handle_queue_device_command(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueueCommandRequest>,
) -> Response {
    let command = match request.validate(
        &state.config.device_id,
        state.config.dispatcher.default_duration_ms,
    ) {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let outcome = state.local.submit(command).await;
    match outcome.command {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "command_id": id,
                "message": "Command queued successfully",
            })),
        )
            .into_response(),
        Err(err) => {
            warn!("failed to queue command: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue command")
        }
    }
}

/// Queue only, no history row. This is what a remote dispatcher talks to.
pub async fn handle_queue_command(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueueCommandRequest>,
) -> Response {
    let command = match request.validate(
        &state.config.device_id,
        state.config.dispatcher.default_duration_ms,
    ) {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let record = state.store.enqueue_command(command).await;
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "command_id": record.id,
            "command": record,
        })),
    )
        .into_response()
}

fn status_param(params: &HashMap<String, String>) -> Result<CommandStatus, Response> {
    match params.get("status") {
        None => Ok(CommandStatus::Pending),
        Some(raw) => raw
            .parse::<CommandStatus>()
            .map_err(|err| error_response(StatusCode::BAD_REQUEST, &err)),
    }
}

/// Pending commands for the device, oldest first. An empty queue answers
/// `204 No Content` so polling firmware can skip parsing.
pub async fn handle_list_device_commands(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let status = match status_param(&params) {
        Ok(status) => status,
        Err(response) => return response,
    };
    let device_id = device_param(&params).unwrap_or(&state.config.device_id);
    let limit = limit_param(&params, 10, 100);

    let commands = state.store.commands(Some(device_id), status, limit).await;
    if commands.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    Json(commands).into_response()
}

pub async fn handle_list_commands(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(device_id) = device_param(&params) else {
        return error_response(StatusCode::BAD_REQUEST, "device_id is required");
    };
    let status = match status_param(&params) {
        Ok(status) => status,
        Err(response) => return response,
    };
    let limit = limit_param(&params, 10, 100);

    let commands: Vec<CommandRecord> = state.store.commands(Some(device_id), status, limit).await;
    Json(json!({ "success": true, "commands": commands })).into_response()
}

pub async fn handle_update_command(
    State(state): State<AppState>,
    ApiJson(update): ApiJson<CommandUpdate>,
) -> Response {
    let Some(id) = update.command_id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required field: command_id");
    };
    let status = update.status.unwrap_or(CommandStatus::Completed);

    match state.store.update_command(id, status, update.completed_at).await {
        Some(record) => {
            info!("command #{id} marked {}", status.as_str());
            Json(json!({ "success": true, "command": record })).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "Command not found"),
    }
}

pub async fn handle_ingest_readings(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<IngestPayload>,
) -> Response {
    let readings = match payload.into_readings(&state.config.device_id, Utc::now()) {
        Ok(readings) => readings,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let stored: Vec<SensorReading> = state.store.insert_readings(readings).await;
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "count": stored.len(),
            "readings": stored,
        })),
    )
        .into_response()
}

pub async fn handle_query_readings(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let metric = match params.get("metric").map(|raw| raw.parse::<Metric>()) {
        None => None,
        Some(Ok(metric)) => Some(metric),
        Some(Err(err)) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let query = ReadingQuery {
        device_id: device_param(&params).map(str::to_string),
        metric,
        limit: limit_param(&params, 100, 1_000),
    };

    let readings = state.store.readings(&query).await;
    Json(json!({ "readings": readings, "count": readings.len() })).into_response()
}

pub async fn handle_latest_readings(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let device_id = device_param(&params).unwrap_or(&state.config.device_id);
    let readings = state.store.latest_readings(Some(device_id)).await;
    Json(json!({
        "readings": readings,
        "timestamp": Utc::now(),
        "device_id": device_id,
    }))
}

pub async fn handle_log_action(
    State(state): State<AppState>,
    ApiJson(entry): ApiJson<NewActionLog>,
) -> Response {
    if entry.command.as_deref().is_none_or(|command| command.trim().is_empty()) {
        return error_response(StatusCode::BAD_REQUEST, "Missing required field: command");
    }
    let entry = state.store.append_action(entry).await;
    (StatusCode::CREATED, Json(json!({ "success": true, "action": entry }))).into_response()
}

pub async fn handle_list_actions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = limit_param(&params, 50, 500);
    let actions = state.store.actions(device_param(&params), limit).await;
    Json(json!({ "actions": actions }))
}

pub async fn handle_record_motion(
    State(state): State<AppState>,
    ApiJson(event): ApiJson<NewMotionEvent>,
) -> Response {
    let event = state.store.record_motion(event).await;
    if event.motion_detected {
        info!(
            "motion on {}{}",
            event.device_id,
            event
                .animal_type
                .as_deref()
                .map(|kind| format!(" ({kind})"))
                .unwrap_or_default()
        );
    }
    (StatusCode::CREATED, Json(json!({ "success": true, "event": event }))).into_response()
}

pub async fn handle_list_motion(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = limit_param(&params, 50, 500);
    let hours = params
        .get("hours")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(24)
        .clamp(1, 24 * 30);
    let since: DateTime<Utc> = Utc::now() - Duration::hours(hours);

    let (events, stats) = state
        .store
        .motion_events(device_param(&params), limit, since)
        .await;
    Json(json!({ "events": events, "stats": stats }))
}

/// Recent events with 24-hour stats and the current motion and distance
/// readings.
pub async fn handle_latest_motion(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let device_id = device_param(&params).unwrap_or(&state.config.device_id);
    let limit = limit_param(&params, 10, 100);
    let since = Utc::now() - Duration::hours(24);

    let (events, stats) = state
        .store
        .motion_events(Some(device_id), limit, since)
        .await;
    let latest = state.store.latest_readings(Some(device_id)).await;
    let reading = |metric: Metric| latest.iter().find(|row| row.metric == metric.as_str());
    let motion = reading(Metric::MotionDetected);
    let distance = reading(Metric::Distance);

    Json(json!({
        "success": true,
        "count": events.len(),
        "data": events,
        "stats": stats,
        "current_sensors": {
            "motion_detected": motion.is_some_and(|row| row.value == 1.0),
            "distance": distance.map(|row| row.value),
            "last_reading": motion.or(distance).map(|row| row.timestamp),
        },
    }))
}

pub async fn handle_record_feeding(
    State(state): State<AppState>,
    ApiJson(event): ApiJson<NewFeedingEvent>,
) -> Response {
    let event = state.store.record_feeding(event).await;
    info!("feeding logged ({})", event.trigger_type);
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": event,
            "message": "Feeding event logged successfully",
        })),
    )
        .into_response()
}

pub async fn handle_list_feeding(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let device_id = device_param(&params).unwrap_or(&state.config.device_id);
    let limit = limit_param(&params, 10, 500);
    let events = state.store.feeding_events(Some(device_id), limit).await;
    Json(json!({
        "success": true,
        "count": events.len(),
        "events": events,
    }))
}

pub async fn handle_water_tank(State(state): State<AppState>) -> impl IntoResponse {
    let level = state
        .store
        .readings(&ReadingQuery {
            device_id: Some(state.config.device_id.clone()),
            metric: Some(Metric::WaterLevel),
            limit: 1,
        })
        .await
        .first()
        .map(|row| row.value);
    let info = state.store.tank_info().await;
    Json(tank_report(level, &info, Utc::now()))
}

#[derive(Debug, Default, Deserialize)]
pub struct TankUpdate {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    capacity_liters: Option<f64>,
    #[serde(default)]
    refill_amount: Option<u64>,
}

pub async fn handle_update_tank(
    State(state): State<AppState>,
    ApiJson(update): ApiJson<TankUpdate>,
) -> Response {
    if update.action.as_deref().map(str::trim) != Some("refill") {
        return error_response(StatusCode::BAD_REQUEST, "Invalid action");
    }
    let tank = state
        .store
        .refill_tank(update.capacity_liters, update.refill_amount)
        .await;
    info!(
        "tank refilled ({} ml, capacity {} L)",
        tank.last_refill_ml, tank.capacity_liters
    );
    Json(json!({
        "success": true,
        "message": "Tank refilled successfully",
        "tank": tank,
    }))
    .into_response()
}

#[derive(Debug, Serialize)]
struct RulesView {
    mode: AutomationMode,
    started: bool,
    active: Vec<String>,
    rules_triggered: u64,
    actions_executed: u64,
    rules: Vec<Rule>,
    execution_log: Vec<ExecutionLogEntry>,
}

async fn rules_view(state: &AppState) -> RulesView {
    let engine = state.rules.lock().await;
    let stats = engine.stats();
    RulesView {
        mode: engine.mode(),
        started: engine.is_started(),
        active: engine.active().to_vec(),
        rules_triggered: stats.rules_triggered,
        actions_executed: stats.actions_executed,
        rules: engine.rules().to_vec(),
        execution_log: engine.execution_log().cloned().collect(),
    }
}

pub async fn handle_get_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(rules_view(&state).await)
}

pub async fn handle_toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let enabled = state.rules.lock().await.toggle(&id);
    let Some(enabled) = enabled else {
        return error_response(StatusCode::NOT_FOUND, "Rule not found");
    };

    info!("rule {id} {}", if enabled { "enabled" } else { "disabled" });
    state.rules_changed.notify_one();
    Json(json!({ "id": id, "enabled": enabled })).into_response()
}

pub async fn handle_start_automation(State(state): State<AppState>) -> impl IntoResponse {
    state.rules.lock().await.start();
    info!("automation started");
    state.rules_changed.notify_one();
    Json(rules_view(&state).await)
}

pub async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let mode = match value.to_ascii_lowercase().as_str() {
        "auto" => AutomationMode::Auto,
        "manual" => AutomationMode::Manual,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid mode. Use 'auto' or 'manual'",
            )
        }
    };

    let changed = state.rules.lock().await.set_mode(mode);
    if changed {
        info!("automation mode set to {value}");
        state.rules_changed.notify_one();
    }
    Json(rules_view(&state).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{body_json, state};
    use farm_common::{SensorSnapshot, SnapshotSource};
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &str)]) -> Query<HashMap<String, String>> {
        Query(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn queue_request(action: Option<&str>) -> ApiJson<QueueCommandRequest> {
        ApiJson(QueueCommandRequest {
            action: action.map(str::to_string),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn queue_then_list_then_complete() {
        let (state, _tx) = state();

        let empty = handle_list_device_commands(State(state.clone()), params(&[])).await;
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);

        let created =
            handle_queue_device_command(State(state.clone()), queue_request(Some("b"))).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = body_json(created).await;
        assert_eq!(body["success"], json!(true));
        let id = body["command_id"].as_u64().unwrap();

        let listed = handle_list_device_commands(State(state.clone()), params(&[])).await;
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = body_json(listed).await;
        assert_eq!(listed[0]["action"], json!("B"));
        assert_eq!(listed[0]["duration_ms"], json!(3000));
        assert_eq!(listed[0]["location"], json!("unknown"));

        let history = state.store.actions(None, 10).await;
        assert_eq!(history[0].action_type, "fan");

        let done = handle_update_command(
            State(state.clone()),
            ApiJson(CommandUpdate {
                command_id: Some(id),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(done.status(), StatusCode::OK);
        assert_eq!(body_json(done).await["command"]["status"], json!("completed"));

        let empty = handle_list_device_commands(State(state), params(&[])).await;
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn queue_rejects_missing_action() {
        let (state, _tx) = state();
        let response = handle_queue_device_command(State(state.clone()), queue_request(None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Missing required field: action"})
        );
        assert_eq!(state.store.counts().await, StoreCounts::default());
    }

    #[tokio::test]
    async fn update_checks_id() {
        let (state, _tx) = state();
        let missing =
            handle_update_command(State(state.clone()), ApiJson(CommandUpdate::default())).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let unknown = handle_update_command(
            State(state),
            ApiJson(CommandUpdate {
                command_id: Some(42),
                status: Some(CommandStatus::Ack),
                completed_at: None,
            }),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_status_filter_is_rejected() {
        let (state, _tx) = state();
        let response =
            handle_list_device_commands(State(state), params(&[("status", "sleeping")])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn queue_only_endpoint_skips_history() {
        let (state, _tx) = state();
        let created =
            handle_queue_command(State(state.clone()), queue_request(Some("water"))).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        assert!(state.store.actions(None, 10).await.is_empty());

        let missing_device = handle_list_commands(State(state.clone()), params(&[])).await;
        assert_eq!(missing_device.status(), StatusCode::BAD_REQUEST);

        let listed =
            handle_list_commands(State(state), params(&[("device_id", "farm_001")])).await;
        let body = body_json(listed).await;
        assert_eq!(body["commands"][0]["action"], json!("D"));
    }

    #[tokio::test]
    async fn ingest_then_query_latest() {
        let (state, _tx) = state();
        let payload: IngestPayload =
            serde_json::from_str(r#"{"temperature": 25.0, "humidity": 40, "steam": -1}"#).unwrap();

        let created = handle_ingest_readings(State(state.clone()), ApiJson(payload)).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(body_json(created).await["count"], json!(2));

        let latest = handle_latest_readings(State(state.clone()), params(&[]))
            .await
            .into_response();
        let body = body_json(latest).await;
        assert_eq!(body["device_id"], json!("farm_001"));
        assert_eq!(body["readings"].as_array().unwrap().len(), 2);

        let filtered =
            handle_query_readings(State(state.clone()), params(&[("metric", "humidity")])).await;
        assert_eq!(body_json(filtered).await["count"], json!(1));

        let bad = handle_query_readings(State(state), params(&[("metric", "pressure")])).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_rejects_empty_payload() {
        let (state, _tx) = state();
        let response =
            handle_ingest_readings(State(state), ApiJson(IngestPayload::default())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "No valid sensor data provided"})
        );
    }

    #[tokio::test]
    async fn action_log_requires_command() {
        let (state, _tx) = state();
        let rejected =
            handle_log_action(State(state.clone()), ApiJson(NewActionLog::default())).await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let created = handle_log_action(
            State(state.clone()),
            ApiJson(NewActionLog {
                command: Some("E".to_string()),
                location: Some("barn".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);

        let listed = handle_list_actions(State(state), params(&[]))
            .await
            .into_response();
        let body = body_json(listed).await;
        assert_eq!(body["actions"][0]["action_type"], json!("buzzer"));
    }

    #[tokio::test]
    async fn motion_events_report_stats() {
        let (state, _tx) = state();
        for animal in ["cat", "cat"] {
            let event: NewMotionEvent = serde_json::from_value(
                json!({"motion_detected": true, "animal_type": animal}),
            )
            .unwrap();
            handle_record_motion(State(state.clone()), ApiJson(event)).await;
        }

        let listed = handle_list_motion(State(state), params(&[]))
            .await
            .into_response();
        let body = body_json(listed).await;
        assert_eq!(body["stats"]["total_detections"], json!(2));
        assert_eq!(body["stats"]["detection_rate"], json!(100));
        assert_eq!(body["stats"]["animal_types"]["cat"], json!(2));
    }

    #[tokio::test]
    async fn rule_controls() {
        let (state, _tx) = state();

        let view = body_json(handle_get_rules(State(state.clone())).await.into_response()).await;
        assert_eq!(view["started"], json!(false));
        assert_eq!(view["rules"].as_array().unwrap().len(), 5);

        let toggled =
            handle_toggle_rule(State(state.clone()), Path("temp_control".to_string())).await;
        assert_eq!(body_json(toggled).await["enabled"], json!(false));

        let unknown = handle_toggle_rule(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let started = handle_start_automation(State(state.clone()))
            .await
            .into_response();
        assert_eq!(body_json(started).await["started"], json!(true));

        let manual = handle_set_mode(State(state.clone()), params(&[("value", "MANUAL")])).await;
        assert_eq!(body_json(manual).await["mode"], json!("manual"));

        let invalid = handle_set_mode(State(state), params(&[("value", "chaos")])).await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_poll_state() {
        let (state, tx) = state();
        let mut snapshot = SensorSnapshot::empty(SnapshotSource::Live, Utc::now());
        snapshot.temperature = Some(26.0);
        tx.send_replace(PollState {
            snapshot,
            connected: true,
            last_error: None,
            cycle: 7,
        });

        let body = body_json(handle_status(State(state)).await.into_response()).await;
        assert_eq!(body["poll"]["connected"], json!(true));
        assert_eq!(body["poll"]["cycle"], json!(7));
        assert_eq!(body["poll"]["snapshot"]["temperature"], json!(26.0));
        assert_eq!(body["esp_configured"], json!(false));
        assert_eq!(body["poll_source"], json!("storage"));
    }
}
