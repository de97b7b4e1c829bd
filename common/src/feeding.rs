use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_TRIGGER: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingEvent {
    pub id: u64,
    pub device_id: String,
    pub feeding_time: DateTime<Utc>,
    /// What started the feed, e.g. `manual`, `motion`, `schedule`.
    pub trigger_type: String,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub motion_detected: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewFeedingEvent {
    pub device_id: Option<String>,
    pub feeding_time: Option<DateTime<Utc>>,
    pub trigger_type: Option<String>,
    pub distance: Option<f64>,
    pub motion_detected: bool,
}

impl NewFeedingEvent {
    pub fn into_event(self, id: u64, default_device: &str, now: DateTime<Utc>) -> FeedingEvent {
        FeedingEvent {
            id,
            device_id: self
                .device_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| default_device.to_string()),
            feeding_time: self.feeding_time.unwrap_or(now),
            trigger_type: self
                .trigger_type
                .map(|kind| kind.trim().to_ascii_lowercase())
                .filter(|kind| !kind.is_empty())
                .unwrap_or_else(|| DEFAULT_TRIGGER.to_string()),
            distance: self.distance.filter(|d| d.is_finite() && *d >= 0.0),
            motion_detected: self.motion_detected,
            timestamp: now,
        }
    }
}
