use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex, Notify},
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use farm_common::{default_rules, GatewayConfig, RuleEngine};

use crate::{
    api,
    automation::spawn_automation_loop,
    device::DeviceClient,
    dispatcher::{Dispatcher, LocalQueue, QueueBackend, RemoteQueue},
    poller::{spawn_poll_loop, PollState, Poller},
    proxy,
    schedules::{self, spawn_schedule_loop},
    settings,
    store::FarmStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: FarmStore,
    pub device: DeviceClient,
    /// Backs the dashboard-facing queue endpoints.
    pub local: Arc<Dispatcher<LocalQueue>>,
    /// Local or remote depending on `dispatcher.queue_url`; used by
    /// automation and `/api/dispatch`.
    pub dispatcher: Arc<Dispatcher<QueueBackend>>,
    pub rules: Arc<Mutex<RuleEngine>>,
    pub rules_changed: Arc<Notify>,
    pub poll_state: watch::Receiver<PollState>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        store: FarmStore,
        http: reqwest::Client,
        poll_state: watch::Receiver<PollState>,
    ) -> Self {
        let device = DeviceClient::new(http.clone(), config.esp_base_url.as_deref());
        let local_queue = LocalQueue::new(store.clone());
        let backend = match config.dispatcher.queue_url.as_deref() {
            Some(url) => QueueBackend::Remote(RemoteQueue::new(http, url)),
            None => QueueBackend::Local(local_queue.clone()),
        };

        let mut engine = RuleEngine::new(default_rules(), config.rules.missing_reading);
        if config.rules.auto_start {
            engine.start();
        }

        Self {
            local: Arc::new(Dispatcher::new(
                local_queue,
                &config.device_id,
                &config.dispatcher,
            )),
            dispatcher: Arc::new(Dispatcher::new(
                backend,
                &config.device_id,
                &config.dispatcher,
            )),
            config: Arc::new(config),
            store,
            device,
            rules: Arc::new(Mutex::new(engine)),
            rules_changed: Arc::new(Notify::new()),
            poll_state,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// `Json` body extractor whose rejections (bad syntax, wrong content type,
/// wrong shape) answer with the usual `{"error": ...}` body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(error_response(rejection.status(), &rejection.body_text())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::handle_health))
        .route("/api/status", get(api::handle_status))
        .route("/api/esp/dht", get(proxy::handle_esp_dht))
        .route(
            "/api/esp/set",
            get(proxy::handle_esp_set_query).post(proxy::handle_esp_set_body),
        )
        .route("/api/esp-dht", get(proxy::handle_esp_dht))
        .route(
            "/api/esp-set",
            get(proxy::handle_esp_set_query).post(proxy::handle_esp_set_body),
        )
        .route("/api/dispatch", post(proxy::handle_dispatch))
        .route(
            "/api/device-commands",
            get(api::handle_list_device_commands)
                .post(api::handle_queue_device_command)
                .patch(api::handle_update_command),
        )
        .route(
            "/api/commands",
            get(api::handle_list_commands)
                .post(api::handle_queue_command)
                .patch(api::handle_update_command),
        )
        .route(
            "/api/sensor-data",
            get(api::handle_query_readings).post(api::handle_ingest_readings),
        )
        .route("/api/sensor-readings/latest", get(api::handle_latest_readings))
        .route(
            "/api/device-actions",
            get(api::handle_list_actions).post(api::handle_log_action),
        )
        .route(
            "/api/motion-events",
            get(api::handle_list_motion).post(api::handle_record_motion),
        )
        .route("/api/motion-events/latest", get(api::handle_latest_motion))
        .route(
            "/api/feeding-events",
            get(api::handle_list_feeding).post(api::handle_record_feeding),
        )
        .route(
            "/api/water-tank",
            get(api::handle_water_tank).post(api::handle_update_tank),
        )
        .route(
            "/api/watering-schedules",
            get(schedules::handle_list_schedules)
                .post(schedules::handle_create_schedule)
                .put(schedules::handle_update_schedule)
                .delete(schedules::handle_delete_schedule),
        )
        .route(
            "/api/watering-schedules/execute",
            get(schedules::handle_execute_due).post(schedules::handle_execute_one),
        )
        .route("/api/watering-schedules/runs", get(schedules::handle_list_runs))
        .route("/api/rules", get(api::handle_get_rules))
        .route("/api/rules/{id}/toggle", post(api::handle_toggle_rule))
        .route("/api/automation/start", post(api::handle_start_automation))
        .route("/api/automation/mode", post(api::handle_set_mode))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = settings::load().await;
    let data_dir = PathBuf::from(&config.data_dir);
    let store = FarmStore::open(&data_dir, &config.device_id)
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load store, starting empty: {err:#}");
            FarmStore::empty_at(&data_dir, &config.device_id)
        });

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    match config.esp_base_url.as_deref() {
        Some(url) => info!("device at {url}, polling {}", config.poller.source.as_str()),
        None => warn!("ESP_BASE_URL not set, device proxy disabled"),
    }

    let device = DeviceClient::new(http.clone(), config.esp_base_url.as_deref());
    let poller = Poller::new(&config, device, store.clone());
    let port = config.http_port;
    let schedule_every = Duration::from_millis(config.scheduler.interval_ms);
    let state = AppState::new(config, store, http, poller.subscribe());

    spawn_poll_loop(poller);
    spawn_automation_loop(
        state.rules.clone(),
        state.rules_changed.clone(),
        state.poll_state.clone(),
        state.dispatcher.clone(),
    );
    spawn_schedule_loop(state.store.clone(), state.dispatcher.clone(), schedule_every);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway server at {addr}"))?;

    info!("gateway listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}
