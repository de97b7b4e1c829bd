use std::{collections::HashMap, time::Duration};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use farm_common::{
    command::DEFAULT_LOCATION, fallback_snapshot, render_sensor_text, ActionCode,
};

use crate::{
    app::{error_response, ApiJson, AppState},
    device::DeviceError,
};

pub const FALLBACK_HEADER: &str = "x-farm-fallback";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Relays the device's sensor page. When the device cannot be reached the
/// dashboard still gets a page, built from drifted mock values and marked
/// with `x-farm-fallback: mock`.
pub async fn handle_esp_dht(State(state): State<AppState>) -> Response {
    let timeout = Duration::from_millis(state.config.proxy.timeout_ms);
    match state.device.fetch_sensor_text(timeout).await {
        Ok(reply) => (
            relay_status(reply.status),
            [(header::CONTENT_TYPE, TEXT_PLAIN)],
            reply.body,
        )
            .into_response(),
        Err(err) => {
            warn!("device sensor page unavailable: {err}");
            let previous = state.poll_state.borrow().snapshot.clone();
            let synthetic = fallback_snapshot(&previous, &mut rand::thread_rng(), Utc::now());
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, TEXT_PLAIN),
                    (HeaderName::from_static(FALLBACK_HEADER), "mock"),
                ],
                render_sensor_text(&synthetic),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SetBody {
    #[serde(default)]
    value: Option<String>,
}

pub async fn handle_esp_set_query(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    forward_set(&state, params.get("value").map(String::as_str)).await
}

pub async fn handle_esp_set_body(State(state): State<AppState>, body: Bytes) -> Response {
    let body: SetBody = serde_json::from_slice(&body).unwrap_or_default();
    forward_set(&state, body.value.as_deref()).await
}

async fn forward_set(state: &AppState, value: Option<&str>) -> Response {
    let Some(value) = value.filter(|value| !value.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "value required");
    };
    let code = match ActionCode::parse_token(value) {
        Ok(code) => code,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let timeout = Duration::from_millis(state.config.proxy.timeout_ms);
    match state.device.send_value(code, timeout).await {
        Ok(reply) => {
            let body = if reply.body.is_empty() {
                "OK".to_string()
            } else {
                reply.body
            };
            (relay_status(reply.status), [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
        }
        Err(DeviceError::NotConfigured) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &DeviceError::NotConfigured.to_string(),
        ),
        Err(err) => {
            warn!("device /set {} failed: {err}", code.letter());
            error_response(StatusCode::BAD_GATEWAY, &format!("Proxy failed: {err}"))
        }
    }
}

fn relay_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    action: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct DispatchView {
    ok: bool,
    action: ActionCode,
    command_id: Option<u64>,
    audit_logged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    delivery_unknown: bool,
}

/// Optimistic command send used by dashboard buttons: answers as soon as the
/// command is queued, without waiting for the device.
pub async fn handle_dispatch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DispatchRequest>,
) -> Response {
    let Some(token) = request.action else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required field: action");
    };
    let location = request
        .location
        .filter(|location| !location.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string());

    let outcome = match state
        .dispatcher
        .dispatch(&token, &location, request.metadata.unwrap_or(Value::Null))
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    let view = DispatchView {
        ok: outcome.is_success(),
        action: outcome.action,
        command_id: outcome.command.as_ref().ok().copied(),
        audit_logged: outcome.audit_logged(),
        error: outcome.command.as_ref().err().map(ToString::to_string),
        delivery_unknown: outcome
            .command
            .as_ref()
            .is_err_and(|err| err.delivery_unknown()),
    };
    (status, Json(view)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::testing::{body_json, body_text, state, state_with},
        device::testing::{fake_device, silent_device},
    };
    use farm_common::{parse_sensor_text, CommandStatus, GatewayConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config_for(base: &str) -> GatewayConfig {
        let mut config = GatewayConfig {
            esp_base_url: Some(base.to_string()),
            ..Default::default()
        };
        config.proxy.timeout_ms = 200;
        config
    }

    #[tokio::test]
    async fn dht_relays_device_page() {
        let base = fake_device("Temperature:</b> <b>22.5</b>°C<br/>").await;
        let (state, _tx) = state_with(config_for(&base));

        let response = handle_esp_dht(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
        assert_eq!(body_text(response).await, "Temperature:</b> <b>22.5</b>°C<br/>");
    }

    #[tokio::test]
    async fn dht_falls_back_to_marked_mock_page() {
        let base = silent_device().await;
        let (state, _tx) = state_with(config_for(&base));

        let response = handle_esp_dht(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[FALLBACK_HEADER], "mock");

        let snapshot = parse_sensor_text(&body_text(response).await, Utc::now());
        let temperature = snapshot.temperature.unwrap();
        assert!((temperature - 21.0).abs() <= 0.15);
        assert_eq!(snapshot.water_level, Some(61.0));
    }

    #[tokio::test]
    async fn set_validates_before_forwarding() {
        let (state, _tx) = state();

        let missing = handle_esp_set_query(State(state.clone()), Query(HashMap::new())).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(missing).await, json!({"error": "value required"}));

        let unknown = handle_esp_set_body(State(state.clone()), Bytes::from(r#"{"value":"Z"}"#)).await;
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let unconfigured = handle_esp_set_body(State(state), Bytes::from(r#"{"value":"b"}"#)).await;
        assert_eq!(unconfigured.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(unconfigured).await,
            json!({"error": "ESP_BASE_URL not configured"})
        );
    }

    #[tokio::test]
    async fn set_forwards_letter_to_device() {
        let base = fake_device("unused").await;
        let (state, _tx) = state_with(config_for(&base));

        let params = HashMap::from([("value".to_string(), "water".to_string())]);
        let response = handle_esp_set_query(State(state), Query(params)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "set D");
    }

    #[tokio::test]
    async fn set_reports_unreachable_device() {
        let base = silent_device().await;
        let (state, _tx) = state_with(config_for(&base));

        let response = handle_esp_set_body(State(state), Bytes::from(r#"{"value":"A"}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn dispatch_queues_locally_and_logs_history() {
        let (state, _tx) = state();

        let response = handle_dispatch(
            State(state.clone()),
            ApiJson(DispatchRequest {
                action: Some("feed".to_string()),
                location: Some("dashboard".to_string()),
                metadata: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["action"], json!("C"));
        assert_eq!(body["audit_logged"], json!(true));

        let pending = state.store.commands(None, CommandStatus::Pending, 10).await;
        assert_eq!(pending[0].location, "dashboard");
        assert_eq!(state.store.actions(None, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_action() {
        let (state, _tx) = state();
        let response = handle_dispatch(
            State(state),
            ApiJson(DispatchRequest {
                action: Some("dance".to_string()),
                location: None,
                metadata: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
