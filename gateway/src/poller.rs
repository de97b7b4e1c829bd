use std::time::{Duration, Instant};

use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use farm_common::{
    config::GatewayConfig, fallback_snapshot, parse_sensor_text, readings_from_snapshot,
    PollSource, PollerConfig, RetryPolicy, SensorSnapshot, SnapshotSource,
};

use crate::{
    device::{DeviceClient, DeviceError},
    store::FarmStore,
};

/// What the rest of the gateway sees of the field: the newest snapshot and
/// whether it came from a real source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollState {
    pub snapshot: SensorSnapshot,
    pub connected: bool,
    pub last_error: Option<String>,
    pub cycle: u64,
}

impl PollState {
    pub fn initial() -> Self {
        Self {
            snapshot: SensorSnapshot::empty(SnapshotSource::Fallback, Utc::now()),
            connected: false,
            last_error: None,
            cycle: 0,
        }
    }
}

#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("device page contained no sensor values")]
    NoMetrics,
    #[error("no stored readings yet")]
    NoStoredReadings,
}

pub struct Poller {
    config: PollerConfig,
    retry: RetryPolicy,
    device_id: String,
    device: DeviceClient,
    store: FarmStore,
    state: watch::Sender<PollState>,
    rng: StdRng,
    last_persist: Option<Instant>,
}

impl Poller {
    pub fn new(config: &GatewayConfig, device: DeviceClient, store: FarmStore) -> Self {
        let (state, _) = watch::channel(PollState::initial());
        Self {
            config: config.poller.clone(),
            retry: config.proxy.retry,
            device_id: config.device_id.clone(),
            device,
            store,
            state,
            rng: StdRng::from_entropy(),
            last_persist: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// One cycle: read the configured source, fall back to a drifted copy of
    /// the previous snapshot on failure, and publish the result.
    pub async fn poll_once(&mut self) -> PollState {
        let previous = self.state.borrow().clone();
        let next = match self.read_source().await {
            Ok(snapshot) => PollState {
                snapshot,
                connected: true,
                last_error: None,
                cycle: previous.cycle + 1,
            },
            Err(err) => {
                let source = self.config.source.as_str();
                if previous.connected || previous.cycle == 0 {
                    warn!("{source} poll failed, serving fallback data: {err}");
                } else {
                    debug!("{source} poll still failing: {err}");
                }
                PollState {
                    snapshot: fallback_snapshot(&previous.snapshot, &mut self.rng, Utc::now()),
                    connected: false,
                    last_error: Some(err.to_string()),
                    cycle: previous.cycle + 1,
                }
            }
        };

        if next.connected && !previous.connected {
            info!("{} source connected", self.config.source.as_str());
        }
        self.state.send_replace(next.clone());
        next
    }

    async fn read_source(&mut self) -> Result<SensorSnapshot, PollError> {
        match self.config.source {
            PollSource::Device => {
                let timeout = Duration::from_millis(self.config.timeout_ms);
                let body = self.device.read_sensors(timeout, &self.retry).await?;
                let snapshot = parse_sensor_text(&body, Utc::now());
                if !snapshot.has_any_reading() {
                    return Err(PollError::NoMetrics);
                }
                self.persist_live(&snapshot).await;
                Ok(snapshot)
            }
            PollSource::Storage => {
                let latest = self.store.latest_readings(Some(&self.device_id)).await;
                let snapshot = SensorSnapshot::from_latest_readings(&latest, Utc::now());
                if !snapshot.has_any_reading() {
                    return Err(PollError::NoStoredReadings);
                }
                Ok(snapshot)
            }
        }
    }

    async fn persist_live(&mut self, snapshot: &SensorSnapshot) {
        let interval = Duration::from_millis(self.config.persist_interval_ms);
        if self
            .last_persist
            .is_some_and(|last| last.elapsed() < interval)
        {
            return;
        }
        let rows = readings_from_snapshot(snapshot, &self.device_id);
        let stored = self.store.insert_readings(rows).await;
        debug!("persisted {} live readings", stored.len());
        self.last_persist = Some(Instant::now());
    }
}

pub fn spawn_poll_loop(mut poller: Poller) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(poller.config.interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            poller.poll_once().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{fake_device, silent_device};
    use farm_common::{Metric, NewReading};
    use pretty_assertions::assert_eq;

    fn config(source: PollSource, base: Option<&str>) -> GatewayConfig {
        let mut config = GatewayConfig {
            esp_base_url: base.map(str::to_string),
            ..Default::default()
        };
        config.poller.source = source;
        config.poller.timeout_ms = 200;
        config.proxy.retry = RetryPolicy {
            attempts: 1,
            base_delay_ms: 10,
            max_delay_ms: 10,
        };
        config
    }

    fn poller(config: &GatewayConfig, store: FarmStore) -> Poller {
        let device = DeviceClient::new(reqwest::Client::new(), config.esp_base_url.as_deref());
        Poller::new(config, device, store)
    }

    #[tokio::test]
    async fn live_page_is_parsed_and_persisted_once_per_interval() {
        let base = fake_device(
            "SoilHumidity:</b> <b>35</b>%<br/>Temperature:</b> <b>31.5</b>°C<br/>",
        )
        .await;
        let store = FarmStore::in_memory("farm_001");
        let config = config(PollSource::Device, Some(&base));
        let mut poller = poller(&config, store.clone());
        let mut rx = poller.subscribe();

        let state = poller.poll_once().await;
        assert!(state.connected);
        assert_eq!(state.snapshot.temperature, Some(31.5));
        assert_eq!(state.snapshot.soil_moisture, Some(35.0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().cycle, 1);

        poller.poll_once().await;
        assert_eq!(store.counts().await.readings, 2);
    }

    #[tokio::test]
    async fn consecutive_timeouts_serve_bounded_fallback() {
        let base = silent_device().await;
        let config = config(PollSource::Device, Some(&base));
        let mut poller = poller(&config, FarmStore::in_memory("farm_001"));

        let first = poller.poll_once().await;
        let second = poller.poll_once().await;

        for state in [&first, &second] {
            assert!(!state.connected);
            assert_eq!(state.snapshot.source, SnapshotSource::Fallback);
            assert!(state.last_error.as_deref().unwrap().contains("did not answer"));
        }
        let first_temp = first.snapshot.temperature.unwrap();
        let second_temp = second.snapshot.temperature.unwrap();
        assert!((first_temp - 21.0).abs() <= 0.1 + 1e-9);
        assert!((second_temp - first_temp).abs() <= 0.1 + 1e-9);
        let humidity = second.snapshot.humidity.unwrap();
        assert!((0.0..=100.0).contains(&humidity));
    }

    #[tokio::test]
    async fn empty_page_counts_as_failure() {
        let base = fake_device("<html>booting</html>").await;
        let config = config(PollSource::Device, Some(&base));
        let mut poller = poller(&config, FarmStore::in_memory("farm_001"));

        let state = poller.poll_once().await;
        assert!(!state.connected);
        assert_eq!(
            state.last_error.as_deref(),
            Some("device page contained no sensor values")
        );
    }

    #[tokio::test]
    async fn storage_source_reads_latest_rows() {
        let store = FarmStore::in_memory("farm_001");
        let config = config(PollSource::Storage, None);
        let mut poller = poller(&config, store.clone());

        assert!(!poller.poll_once().await.connected);

        store
            .insert_readings(vec![NewReading {
                device_id: "farm_001".to_string(),
                metric: Metric::LightLevel,
                value: 12.0,
                timestamp: Utc::now(),
            }])
            .await;
        let state = poller.poll_once().await;
        assert!(state.connected);
        assert_eq!(state.snapshot.light_level, Some(12.0));
        assert_eq!(state.snapshot.source, SnapshotSource::Storage);
        assert_eq!(state.cycle, 2);
    }
}
