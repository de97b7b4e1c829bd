use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{command::DEFAULT_COMMAND_DURATION_MS, retry::RetryPolicy, rules::MissingReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSource {
    /// Proxy the device's plain-text `/dht` page.
    Device,
    /// Read the latest ingested rows from the readings store.
    Storage,
}

impl PollSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Storage => "storage",
        }
    }
}

impl FromStr for PollSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" | "direct" | "esp" => Ok(Self::Device),
            "storage" | "cloud" | "database" => Ok(Self::Storage),
            other => Err(format!("unknown poll source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub source: PollSource,
    pub persist_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_ms: 8_000,
            source: PollSource::Storage,
            persist_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub timeout_ms: u64,
    pub default_duration_ms: u64,
    pub queue_url: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            default_duration_ms: DEFAULT_COMMAND_DURATION_MS,
            queue_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub missing_reading: MissingReading,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due watering schedules are looked up.
    pub interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub device_id: String,
    pub esp_base_url: Option<String>,
    pub http_port: u16,
    pub data_dir: String,
    pub poller: PollerConfig,
    pub proxy: ProxyConfig,
    pub dispatcher: DispatcherConfig,
    pub rules: RulesConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_id: "farm_001".to_string(),
            esp_base_url: None,
            http_port: 8080,
            data_dir: "./.smartfarm".to_string(),
            poller: PollerConfig::default(),
            proxy: ProxyConfig::default(),
            dispatcher: DispatcherConfig::default(),
            rules: RulesConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn sanitize(&mut self) {
        if self.device_id.trim().is_empty() {
            self.device_id = "farm_001".to_string();
        }
        if self.http_port == 0 {
            self.http_port = 8080;
        }

        self.esp_base_url = normalize_url(self.esp_base_url.take());
        self.dispatcher.queue_url = normalize_url(self.dispatcher.queue_url.take());

        self.poller.interval_ms = self.poller.interval_ms.clamp(1_000, 5_000);
        self.poller.timeout_ms = clamp_timeout(self.poller.timeout_ms);
        self.poller.persist_interval_ms = self.poller.persist_interval_ms.max(1_000);
        self.proxy.timeout_ms = clamp_timeout(self.proxy.timeout_ms);
        self.proxy.retry.sanitize();
        self.dispatcher.timeout_ms = clamp_timeout(self.dispatcher.timeout_ms);
        if self.dispatcher.default_duration_ms == 0 {
            self.dispatcher.default_duration_ms = DEFAULT_COMMAND_DURATION_MS;
        }
        self.scheduler.interval_ms = self.scheduler.interval_ms.clamp(1_000, 3_600_000);
    }
}

fn clamp_timeout(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(500, 30_000)
}

fn normalize_url(url: Option<String>) -> Option<String> {
    url.map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
}
