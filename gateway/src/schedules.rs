use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use farm_common::{ScheduleFields, ScheduleUpdate, WateringSchedule};

use crate::{
    app::{error_response, ApiJson, AppState},
    dispatcher::{CommandQueue, Dispatcher},
    store::FarmStore,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleExecution {
    pub schedule_id: u64,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Sends one watering command for `schedule` and logs the run. With
/// `advance` the schedule moves to its next slot whether or not the send
/// succeeded.
async fn execute<Q: CommandQueue>(
    store: &FarmStore,
    dispatcher: &Dispatcher<Q>,
    schedule: &WateringSchedule,
    at: DateTime<Utc>,
    advance: bool,
) -> ScheduleExecution {
    let outcome = dispatcher.submit(schedule.command()).await;
    let result = outcome.command.map_err(|err| err.to_string());
    match &result {
        Ok(id) => info!("schedule {} ({}) queued watering #{id}", schedule.id, schedule.name),
        Err(err) => warn!("schedule {} ({}) failed: {err}", schedule.id, schedule.name),
    }
    store
        .finish_schedule_run(schedule.id, result.clone(), at, advance)
        .await;

    let (command_id, error) = match result {
        Ok(id) => (Some(id), None),
        Err(err) => (None, Some(err)),
    };
    ScheduleExecution {
        schedule_id: schedule.id,
        name: schedule.name.clone(),
        success: command_id.is_some(),
        command_id,
        error,
        executed_at: at,
    }
}

/// Runs every active schedule whose `next_execution` has passed.
pub async fn run_due<Q: CommandQueue>(
    store: &FarmStore,
    dispatcher: &Dispatcher<Q>,
    now: DateTime<Utc>,
) -> Vec<ScheduleExecution> {
    let mut executions = Vec::new();
    for schedule in store.due_schedules(now).await {
        executions.push(execute(store, dispatcher, &schedule, now, true).await);
    }
    executions
}

pub fn spawn_schedule_loop<Q>(
    store: FarmStore,
    dispatcher: Arc<Dispatcher<Q>>,
    every: Duration,
) -> JoinHandle<()>
where
    Q: CommandQueue + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_due(&store, dispatcher.as_ref(), Utc::now()).await;
        }
    })
}

pub async fn handle_list_schedules(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let device_id = params
        .get("device_id")
        .map(String::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(&state.config.device_id);
    let active_only = params.get("active_only").is_some_and(|value| value == "true");

    let schedules = state.store.schedules(Some(device_id), active_only).await;
    Json(json!({
        "success": true,
        "count": schedules.len(),
        "data": schedules,
    }))
}

pub async fn handle_create_schedule(
    State(state): State<AppState>,
    ApiJson(fields): ApiJson<ScheduleFields>,
) -> Response {
    match state.store.create_schedule(fields).await {
        Ok(schedule) => {
            info!("watering schedule {} created: {}", schedule.id, schedule.name);
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "data": schedule,
                    "message": "Watering schedule created successfully",
                })),
            )
                .into_response()
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

pub async fn handle_update_schedule(
    State(state): State<AppState>,
    ApiJson(update): ApiJson<ScheduleUpdate>,
) -> Response {
    let Some(id) = update.id else {
        return error_response(StatusCode::BAD_REQUEST, "Schedule ID is required");
    };
    match state.store.update_schedule(id, update.changes).await {
        None => error_response(StatusCode::NOT_FOUND, "Schedule not found"),
        Some(Err(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Some(Ok(schedule)) => Json(json!({
            "success": true,
            "data": schedule,
            "message": "Watering schedule updated successfully",
        }))
        .into_response(),
    }
}

pub async fn handle_delete_schedule(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id").and_then(|raw| raw.parse::<u64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Schedule ID is required");
    };
    if !state.store.delete_schedule(id).await {
        return error_response(StatusCode::NOT_FOUND, "Schedule not found");
    }
    info!("watering schedule {id} deleted");
    Json(json!({
        "success": true,
        "message": "Watering schedule deleted successfully",
    }))
    .into_response()
}

pub async fn handle_execute_due(State(state): State<AppState>) -> impl IntoResponse {
    let results = run_due(&state.store, state.dispatcher.as_ref(), Utc::now()).await;
    Json(json!({
        "success": true,
        "executed_count": results.len(),
        "results": results,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    schedule_id: Option<u64>,
}

/// Runs one schedule now. Its `next_execution` is left where it was.
pub async fn handle_execute_one(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExecuteRequest>,
) -> Response {
    let Some(id) = request.schedule_id else {
        return error_response(StatusCode::BAD_REQUEST, "Schedule ID is required");
    };
    let Some(schedule) = state.store.schedule(id).await else {
        return error_response(StatusCode::NOT_FOUND, "Schedule not found");
    };

    let dispatcher = state.dispatcher.as_ref();
    let execution = execute(&state.store, dispatcher, &schedule, Utc::now(), false).await;
    if let Some(err) = execution.error {
        return error_response(
            StatusCode::BAD_GATEWAY,
            &format!("Failed to execute watering schedule: {err}"),
        );
    }
    Json(json!({
        "success": true,
        "message": format!("Schedule \"{}\" executed successfully", schedule.name),
        "execution_details": {
            "plant_type": schedule.plant_type,
            "water_amount_ml": schedule.water_amount_ml,
            "duration_ms": schedule.duration_ms,
            "command_id": execution.command_id,
        },
    }))
    .into_response()
}

pub async fn handle_list_runs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let schedule_id = params
        .get("schedule_id")
        .and_then(|raw| raw.parse::<u64>().ok());
    let limit = params
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(50)
        .clamp(1, 500);
    let runs = state.store.schedule_runs(schedule_id, limit).await;
    Json(json!({ "runs": runs }))
}
