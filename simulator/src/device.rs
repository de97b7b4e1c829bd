use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info};

use farm_common::{
    fallback_snapshot, render_sensor_text, ActionCode, SensorSnapshot, SnapshotSource,
};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Simulated field controller state. Actuator commands nudge the readings
/// so automation has something to react to.
struct Field {
    snapshot: SensorSnapshot,
    rng: StdRng,
    outputs: HashMap<ActionCode, bool>,
}

impl Field {
    fn new(rng: StdRng) -> Self {
        let mut field = Self {
            snapshot: SensorSnapshot::empty(SnapshotSource::Live, Utc::now()),
            rng,
            outputs: HashMap::new(),
        };
        field.drift();
        field
    }

    fn drift(&mut self) {
        let mut next = fallback_snapshot(&self.snapshot, &mut self.rng, Utc::now());
        next.source = SnapshotSource::Live;
        self.snapshot = next;
    }

    fn apply(&mut self, code: ActionCode) -> bool {
        let state = self.outputs.entry(code).or_insert(false);
        *state = !*state;
        let on = *state;

        let snapshot = &mut self.snapshot;
        match code {
            ActionCode::Fan if on => {
                snapshot.temperature = snapshot.temperature.map(|t| t - 1.0);
            }
            ActionCode::Water => {
                snapshot.soil_moisture = snapshot.soil_moisture.map(|s| (s + 10.0).min(100.0));
                snapshot.water_level = snapshot.water_level.map(|w| (w - 2.0).max(0.0));
            }
            ActionCode::Light => {
                let delta = if on { 30.0 } else { -30.0 };
                snapshot.light_level = snapshot.light_level.map(|l| (l + delta).max(0.0));
            }
            ActionCode::Fan | ActionCode::Feed | ActionCode::Buzzer | ActionCode::PirAlarm => {}
        }
        on
    }
}

type SharedField = Arc<Mutex<Field>>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let field: SharedField = Arc::new(Mutex::new(Field::new(StdRng::from_entropy())));
    spawn_drift_loop(field.clone());

    let port = std::env::var("SIM_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind simulator at {addr}"))?;

    info!("device simulator listening on http://{addr}");
    axum::serve(listener, router(field)).await?;
    Ok(())
}

fn router(field: SharedField) -> Router {
    Router::new()
        .route("/dht", get(handle_dht))
        .route("/set", get(handle_set))
        .with_state(field)
}

fn spawn_drift_loop(field: SharedField) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            let mut field = field.lock().await;
            field.drift();
            debug!("simulated temperature {:?}", field.snapshot.temperature);
        }
    });
}

async fn handle_dht(State(field): State<SharedField>) -> impl IntoResponse {
    let page = render_sensor_text(&field.lock().await.snapshot);
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], page)
}

async fn handle_set(
    State(field): State<SharedField>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return (StatusCode::BAD_REQUEST, "value required".to_string());
    };
    let code = match ActionCode::parse_token(value) {
        Ok(code) => code,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()),
    };

    let on = field.lock().await.apply(code);
    info!("simulated {} {}", code.kind(), if on { "on" } else { "off" });
    (StatusCode::OK, format!("{} {}", code.letter(), if on { "ON" } else { "OFF" }))
}
