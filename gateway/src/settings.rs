use std::{io::ErrorKind, path::Path};

use anyhow::Context;
use tracing::warn;

use farm_common::{GatewayConfig, PollSource};

const CONFIG_FILE: &str = "gateway.json";

/// `<data_dir>/gateway.json` if present, then environment overrides, then
/// sanitised. A broken file is reported and replaced by defaults.
pub async fn load() -> GatewayConfig {
    let data_dir = std::env::var("FARM_DATA_DIR")
        .unwrap_or_else(|_| GatewayConfig::default().data_dir);

    let mut config = read_file(Path::new(&data_dir))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load gateway config: {err:#}");
            GatewayConfig::default()
        });
    config.data_dir = data_dir;
    apply_env(&mut config, |key| std::env::var(key).ok());
    config.sanitize();
    config
}

async fn read_file(data_dir: &Path) -> anyhow::Result<GatewayConfig> {
    let path = data_dir.join(CONFIG_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(GatewayConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env(config: &mut GatewayConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("ESP_BASE_URL") {
        config.esp_base_url = Some(url);
    }
    if let Some(device_id) = var("FARM_DEVICE_ID") {
        config.device_id = device_id;
    }
    if let Some(raw) = var("FARM_POLL_SOURCE") {
        match raw.parse::<PollSource>() {
            Ok(source) => config.poller.source = source,
            Err(err) => warn!("ignoring FARM_POLL_SOURCE: {err}"),
        }
    }
    if let Some(url) = var("FARM_QUEUE_URL") {
        config.dispatcher.queue_url = Some(url);
    }
    if let Some(port) = var("GATEWAY_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.http_port = port;
    }
}
