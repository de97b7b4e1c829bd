use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_CONFIDENCE: u8 = 75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub id: u64,
    pub device_id: String,
    pub motion_detected: bool,
    pub animal_type: Option<String>,
    pub confidence_score: u8,
    #[serde(default)]
    pub sensor_data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMotionEvent {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub motion_detected: bool,
    #[serde(default)]
    pub animal_type: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<u8>,
    #[serde(default)]
    pub sensor_data: Option<Value>,
}

impl NewMotionEvent {
    pub fn into_event(self, id: u64, default_device: &str, now: DateTime<Utc>) -> MotionEvent {
        MotionEvent {
            id,
            device_id: self
                .device_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| default_device.to_string()),
            motion_detected: self.motion_detected,
            animal_type: self.animal_type.filter(|kind| !kind.trim().is_empty()),
            confidence_score: self.confidence_score.unwrap_or(DEFAULT_CONFIDENCE).min(100),
            sensor_data: self.sensor_data.unwrap_or(Value::Null),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MotionStats {
    pub total_detections: u64,
    /// Percentage of events since the window start that detected motion.
    pub detection_rate: u8,
    /// Mean confidence of the events that detected motion.
    pub avg_confidence: u8,
    pub animal_types: BTreeMap<String, u64>,
}

pub fn motion_stats<'a, I>(events: I, since: DateTime<Utc>) -> MotionStats
where
    I: IntoIterator<Item = &'a MotionEvent>,
{
    let mut stats = MotionStats::default();
    let mut seen = 0u64;
    let mut confidence_sum = 0u64;

    for event in events.into_iter().filter(|event| event.timestamp >= since) {
        seen += 1;
        if event.motion_detected {
            stats.total_detections += 1;
            confidence_sum += u64::from(event.confidence_score);
        }
        if let Some(kind) = &event.animal_type {
            *stats.animal_types.entry(kind.clone()).or_default() += 1;
        }
    }

    let rate = (stats.total_detections as f64 / seen.max(1) as f64 * 100.0).round();
    stats.detection_rate = rate as u8;
    let mean = (confidence_sum as f64 / stats.total_detections.max(1) as f64).round();
    stats.avg_confidence = mean as u8;
    stats
}
