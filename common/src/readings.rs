use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::{Metric, SensorSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: u64,
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub metric: Metric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl NewReading {
    pub fn into_reading(self, id: u64) -> SensorReading {
        SensorReading {
            id,
            device_id: self.device_id,
            metric: self.metric.as_str().to_string(),
            value: self.value,
            unit: self.metric.unit().to_string(),
            timestamp: self.timestamp,
        }
    }
}

/// Devices post numbers, numeric strings or booleans depending on firmware.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FlexibleNumber {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl FlexibleNumber {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            Self::Text(raw) => raw.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("No valid sensor data provided")]
    NoValidData,
    #[error("Invalid value for {metric}: '{raw}'")]
    InvalidValue { metric: Metric, raw: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestPayload {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<FlexibleNumber>,
    #[serde(default)]
    pub humidity: Option<FlexibleNumber>,
    #[serde(default)]
    pub soil_moisture: Option<FlexibleNumber>,
    #[serde(default)]
    pub water_level: Option<FlexibleNumber>,
    #[serde(default)]
    pub light_level: Option<FlexibleNumber>,
    #[serde(default)]
    pub steam: Option<FlexibleNumber>,
    #[serde(default)]
    pub distance: Option<FlexibleNumber>,
    #[serde(default)]
    pub motion_detected: Option<FlexibleNumber>,
}

impl IngestPayload {
    fn field(&self, metric: Metric) -> Option<&FlexibleNumber> {
        match metric {
            Metric::Temperature => self.temperature.as_ref(),
            Metric::Humidity => self.humidity.as_ref(),
            Metric::SoilMoisture => self.soil_moisture.as_ref(),
            Metric::WaterLevel => self.water_level.as_ref(),
            Metric::LightLevel => self.light_level.as_ref(),
            Metric::Steam => self.steam.as_ref(),
            Metric::Distance => self.distance.as_ref(),
            Metric::MotionDetected => self.motion_detected.as_ref(),
        }
    }

    /// Fans the flat payload out into one row per metric. Sentinel values are
    /// dropped rather than stored as measurements.
    pub fn into_readings(
        self,
        default_device: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<NewReading>, IngestError> {
        let device_id = self
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| default_device.to_string());

        let mut readings = Vec::new();
        for metric in Metric::ALL {
            let Some(raw) = self.field(metric) else {
                continue;
            };
            let Some(value) = raw.as_f64() else {
                return Err(IngestError::InvalidValue {
                    metric,
                    raw: format!("{raw:?}"),
                });
            };
            if metric.is_sentinel(value) {
                continue;
            }
            readings.push(NewReading {
                device_id: device_id.clone(),
                metric,
                value,
                timestamp: at,
            });
        }

        if readings.is_empty() {
            return Err(IngestError::NoValidData);
        }
        Ok(readings)
    }
}

/// Rows for every metric present in a snapshot, used when a live device
/// reading is written back to storage.
pub fn readings_from_snapshot(snapshot: &SensorSnapshot, device_id: &str) -> Vec<NewReading> {
    Metric::ALL
        .into_iter()
        .filter_map(|metric| {
            snapshot.value(metric).map(|value| NewReading {
                device_id: device_id.to_string(),
                metric,
                value,
                timestamp: snapshot.at,
            })
        })
        .collect()
}

/// Keeps the newest row per metric, ordered by metric name.
pub fn latest_per_metric<'a, I>(rows: I) -> Vec<SensorReading>
where
    I: IntoIterator<Item = &'a SensorReading>,
{
    let mut latest: BTreeMap<&str, &SensorReading> = BTreeMap::new();
    for row in rows {
        let newer = latest
            .get(row.metric.as_str())
            .is_none_or(|current| (row.timestamp, row.id) > (current.timestamp, current.id));
        if newer {
            latest.insert(row.metric.as_str(), row);
        }
    }
    latest.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn fans_out_present_metrics() {
        let payload: IngestPayload = serde_json::from_str(
            r#"{"temperature": 24.5, "humidity": "55", "light_level": 300, "steam": -999}"#,
        )
        .unwrap();

        let readings = payload.into_readings("farm_001", at()).unwrap();
        let metrics: Vec<_> = readings.iter().map(|r| (r.metric, r.value)).collect();
        assert_eq!(
            metrics,
            vec![
                (Metric::Temperature, 24.5),
                (Metric::Humidity, 55.0),
                (Metric::LightLevel, 300.0),
            ]
        );
        assert!(readings.iter().all(|r| r.device_id == "farm_001"));

        let stored = readings[2].clone().into_reading(9);
        assert_eq!(stored.unit, "lux");
        assert_eq!(stored.metric, "light_level");
    }

    #[test]
    fn honours_device_id_and_motion_flag() {
        let payload: IngestPayload =
            serde_json::from_str(r#"{"device_id": "barn_2", "motion_detected": true}"#).unwrap();
        let readings = payload.into_readings("farm_001", at()).unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "barn_2");
        assert_eq!(readings[0].value, 1.0);
    }

    #[test]
    fn rejects_empty_and_garbage_payloads() {
        let empty: IngestPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(
            empty.into_readings("farm_001", at()),
            Err(IngestError::NoValidData)
        );

        let garbage: IngestPayload =
            serde_json::from_str(r#"{"temperature": "warm"}"#).unwrap();
        assert!(matches!(
            garbage.into_readings("farm_001", at()),
            Err(IngestError::InvalidValue {
                metric: Metric::Temperature,
                ..
            })
        ));
    }

    #[test]
    fn snapshot_rows_skip_missing_metrics() {
        let mut snapshot =
            SensorSnapshot::empty(crate::snapshot::SnapshotSource::Live, at());
        snapshot.temperature = Some(23.0);
        snapshot.distance = Some(0.0);

        let rows = readings_from_snapshot(&snapshot, "farm_001");
        let metrics: Vec<_> = rows.iter().map(|r| (r.metric, r.value)).collect();
        assert_eq!(
            metrics,
            vec![(Metric::Temperature, 23.0), (Metric::Distance, 0.0)]
        );
        assert!(rows.iter().all(|r| r.timestamp == at()));
    }

    #[test]
    fn latest_keeps_newest_row_per_metric() {
        let row = |id: u64, metric: &str, value: f64, offset_s: i64| SensorReading {
            id,
            device_id: "farm_001".to_string(),
            metric: metric.to_string(),
            value,
            unit: String::new(),
            timestamp: at() + Duration::seconds(offset_s),
        };
        let rows = vec![
            row(1, "temperature", 20.0, 0),
            row(2, "humidity", 50.0, 0),
            row(3, "temperature", 22.0, 10),
            row(4, "temperature", 21.0, 5),
            row(5, "humidity", 51.0, 0),
        ];

        let latest = latest_per_metric(&rows);
        let values: Vec<_> = latest.iter().map(|r| (r.metric.as_str(), r.value)).collect();
        assert_eq!(values, vec![("humidity", 51.0), ("temperature", 22.0)]);
    }
}
