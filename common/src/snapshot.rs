use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::readings::SensorReading;

/// Placeholder the device reports for a sensor that is not wired or failed to read.
pub const OFFLINE_SENTINEL: f64 = -999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    SoilMoisture,
    WaterLevel,
    LightLevel,
    Steam,
    Distance,
    MotionDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric '{0}'")]
pub struct UnknownMetric(pub String);

impl Metric {
    pub const ALL: [Metric; 8] = [
        Self::Temperature,
        Self::Humidity,
        Self::SoilMoisture,
        Self::WaterLevel,
        Self::LightLevel,
        Self::Steam,
        Self::Distance,
        Self::MotionDetected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soil_moisture",
            Self::WaterLevel => "water_level",
            Self::LightLevel => "light_level",
            Self::Steam => "steam",
            Self::Distance => "distance",
            Self::MotionDetected => "motion_detected",
        }
    }

    /// Label used by the device's plain-text `/dht` page.
    pub fn label(self) -> Option<&'static str> {
        match self {
            Self::Temperature => Some("Temperature:"),
            Self::Humidity => Some("Humidity:"),
            Self::SoilMoisture => Some("SoilHumidity:"),
            Self::WaterLevel => Some("WaterLevel:"),
            Self::LightLevel => Some("Light:"),
            Self::Steam => Some("Steam:"),
            Self::Distance => Some("Distance:"),
            Self::MotionDetected => None,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity | Self::SoilMoisture | Self::WaterLevel => "%",
            Self::LightLevel => "lux",
            Self::Steam => "level",
            Self::Distance => "cm",
            Self::MotionDetected => "bool",
        }
    }

    /// `-999` means offline for every metric. `-1` does too, except for
    /// temperature where it is a plausible reading.
    pub fn is_sentinel(self, value: f64) -> bool {
        if !value.is_finite() || value == OFFLINE_SENTINEL {
            return true;
        }
        value == -1.0 && self != Self::Temperature
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Live,
    Storage,
    Fallback,
}

impl SnapshotSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Storage => "storage",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub water_level: Option<f64>,
    pub light_level: Option<f64>,
    pub steam: Option<f64>,
    pub distance: Option<f64>,
    pub motion_detected: Option<bool>,
    pub source: SnapshotSource,
    pub at: DateTime<Utc>,
}

impl SensorSnapshot {
    pub fn empty(source: SnapshotSource, at: DateTime<Utc>) -> Self {
        Self {
            temperature: None,
            humidity: None,
            soil_moisture: None,
            water_level: None,
            light_level: None,
            steam: None,
            distance: None,
            motion_detected: None,
            source,
            at,
        }
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::SoilMoisture => self.soil_moisture,
            Metric::WaterLevel => self.water_level,
            Metric::LightLevel => self.light_level,
            Metric::Steam => self.steam,
            Metric::Distance => self.distance,
            Metric::MotionDetected => self
                .motion_detected
                .map(|motion| if motion { 1.0 } else { 0.0 }),
        }
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let value = value.filter(|v| !metric.is_sentinel(*v));
        match metric {
            Metric::Temperature => self.temperature = value,
            Metric::Humidity => self.humidity = value,
            Metric::SoilMoisture => self.soil_moisture = value,
            Metric::WaterLevel => self.water_level = value,
            Metric::LightLevel => self.light_level = value,
            Metric::Steam => self.steam = value,
            Metric::Distance => self.distance = value,
            Metric::MotionDetected => self.motion_detected = value.map(|v| v >= 0.5),
        }
    }

    pub fn has_any_reading(&self) -> bool {
        Metric::ALL
            .into_iter()
            .any(|metric| self.value(metric).is_some())
    }

    /// Builds a snapshot from the newest stored row of each metric.
    pub fn from_latest_readings(readings: &[SensorReading], at: DateTime<Utc>) -> Self {
        let mut snapshot = Self::empty(SnapshotSource::Storage, at);
        for reading in readings {
            let Ok(metric) = reading.metric.parse::<Metric>() else {
                continue;
            };
            if metric == Metric::MotionDetected {
                snapshot.motion_detected = Some(reading.value == 1.0);
            } else {
                snapshot.set(metric, Some(reading.value));
            }
        }
        snapshot
    }
}

pub fn parse_sensor_text(text: &str, at: DateTime<Utc>) -> SensorSnapshot {
    let mut snapshot = SensorSnapshot::empty(SnapshotSource::Live, at);
    for metric in Metric::ALL {
        if let Some(label) = metric.label() {
            snapshot.set(metric, find_labelled_value(text, label));
        }
    }
    snapshot
}

fn find_labelled_value(text: &str, label: &str) -> Option<f64> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(label) {
        let start = search_from + offset;
        let end = start + label.len();

        // "Humidity:" must not match the tail of "SoilHumidity:".
        let at_boundary = text[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_ascii_alphanumeric());
        if at_boundary {
            return read_number_after(&text[end..]);
        }
        search_from = end;
    }
    None
}

fn read_number_after(mut rest: &str) -> Option<f64> {
    loop {
        rest = rest.trim_start();
        match rest.strip_prefix('<') {
            Some(tag) => {
                let close = tag.find('>')?;
                rest = &tag[close + 1..];
            }
            None => break,
        }
    }

    let len = rest
        .char_indices()
        .take_while(|&(i, c)| {
            c.is_ascii_digit() || c == '.' || (i == 0 && matches!(c, '-' | '+'))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    rest[..len].parse().ok()
}

pub fn render_sensor_text(snapshot: &SensorSnapshot) -> String {
    let mut out = String::new();
    for metric in Metric::ALL {
        let (Some(label), Some(value)) = (metric.label(), snapshot.value(metric)) else {
            continue;
        };
        out.push_str(&format!(
            "{label}</b> <b>{value:.1}</b>{}<br/>",
            metric.unit()
        ));
    }
    out
}

const SEED_TEMPERATURE: f64 = 21.0;
const SEED_HUMIDITY: f64 = 60.0;
const SEED_WATER_LEVEL: f64 = 61.0;
const SEED_LIGHT_LEVEL: f64 = 43.0;
const SEED_SOIL_MOISTURE: f64 = 40.0;
const SEED_DISTANCE: f64 = 12.8;

/// Synthesizes the next mock snapshot by nudging the previous values.
/// Every metric moves by at most a small delta so the dials never jump.
pub fn fallback_snapshot<R: Rng + ?Sized>(
    previous: &SensorSnapshot,
    rng: &mut R,
    at: DateTime<Utc>,
) -> SensorSnapshot {
    let temperature = previous.temperature.unwrap_or(SEED_TEMPERATURE) + rng.gen_range(-0.1..=0.1);
    let humidity = previous.humidity.unwrap_or(SEED_HUMIDITY) + rng.gen_range(-0.5..=0.5);
    let light =
        previous.light_level.unwrap_or(SEED_LIGHT_LEVEL) + f64::from(rng.gen_range(-1i32..=1));
    let soil =
        previous.soil_moisture.unwrap_or(SEED_SOIL_MOISTURE) + f64::from(rng.gen_range(-1i32..=1));
    let distance = previous.distance.unwrap_or(SEED_DISTANCE) + rng.gen_range(-0.5..=0.5);

    SensorSnapshot {
        temperature: Some(temperature),
        humidity: Some(humidity.clamp(0.0, 100.0)),
        soil_moisture: Some(soil.clamp(0.0, 100.0)),
        water_level: Some(previous.water_level.unwrap_or(SEED_WATER_LEVEL)),
        light_level: Some(light.max(0.0)),
        steam: Some(previous.steam.unwrap_or(0.0)),
        distance: Some(distance.max(0.0)),
        motion_detected: Some(rng.gen_bool(0.1)),
        source: SnapshotSource::Fallback,
        at,
    }
}
