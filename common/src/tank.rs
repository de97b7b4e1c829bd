use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TANK_CAPACITY_LITERS: f64 = 100.0;
/// Level reported before the tank has any `water_level` reading.
const FALLBACK_LEVEL_PERCENT: f64 = 68.0;
const DAILY_USAGE_LITERS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TankInfo {
    pub capacity_liters: f64,
    pub last_refill: Option<DateTime<Utc>>,
    pub last_refill_ml: u64,
}

impl Default for TankInfo {
    fn default() -> Self {
        Self {
            capacity_liters: DEFAULT_TANK_CAPACITY_LITERS,
            last_refill: None,
            last_refill_ml: 0,
        }
    }
}

impl TankInfo {
    pub fn refill(
        &mut self,
        capacity_liters: Option<f64>,
        amount_ml: Option<u64>,
        at: DateTime<Utc>,
    ) {
        if let Some(capacity) = capacity_liters.filter(|c| c.is_finite() && *c > 0.0) {
            self.capacity_liters = capacity;
        }
        self.last_refill = Some(at);
        self.last_refill_ml = amount_ml.unwrap_or(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TankStatus {
    Full,
    Medium,
    Low,
}

impl TankStatus {
    pub fn from_percent(percent: i64) -> Self {
        if percent > 80 {
            Self::Full
        } else if percent > 30 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankReport {
    pub current_level_percent: i64,
    pub current_liters: i64,
    pub capacity_liters: f64,
    pub status: TankStatus,
    pub last_refill: DateTime<Utc>,
    pub estimated_days_remaining: i64,
    /// False when no `water_level` reading exists yet.
    pub measured: bool,
}

/// Derives the tank view from the latest `water_level` percentage.
pub fn tank_report(
    level_percent: Option<f64>,
    info: &TankInfo,
    now: DateTime<Utc>,
) -> TankReport {
    let measured = level_percent.is_some_and(f64::is_finite);
    let level = level_percent
        .filter(|level| level.is_finite())
        .unwrap_or(FALLBACK_LEVEL_PERCENT)
        .clamp(0.0, 100.0);
    let liters = (level / 100.0 * info.capacity_liters).round();
    let percent = level.round() as i64;

    TankReport {
        current_level_percent: percent,
        current_liters: liters as i64,
        capacity_liters: info.capacity_liters,
        status: TankStatus::from_percent(percent),
        last_refill: info.last_refill.unwrap_or(now),
        estimated_days_remaining: ((liters / DAILY_USAGE_LITERS).floor() as i64).max(1),
        measured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn status_cut_points() {
        assert_eq!(TankStatus::from_percent(81), TankStatus::Full);
        assert_eq!(TankStatus::from_percent(80), TankStatus::Medium);
        assert_eq!(TankStatus::from_percent(31), TankStatus::Medium);
        assert_eq!(TankStatus::from_percent(30), TankStatus::Low);
    }

    #[test]
    fn report_from_reading() {
        let info = TankInfo {
            capacity_liters: 200.0,
            ..Default::default()
        };
        let report = tank_report(Some(45.4), &info, now());
        assert_eq!(report.current_level_percent, 45);
        assert_eq!(report.current_liters, 91);
        assert_eq!(report.status, TankStatus::Medium);
        assert_eq!(report.estimated_days_remaining, 9);
        assert_eq!(report.last_refill, now());
        assert!(report.measured);
    }

    #[test]
    fn missing_reading_uses_fallback_level() {
        let report = tank_report(None, &TankInfo::default(), now());
        assert_eq!(report.current_level_percent, 68);
        assert_eq!(report.current_liters, 68);
        assert_eq!(report.estimated_days_remaining, 6);
        assert!(!report.measured);

        let empty = tank_report(Some(2.0), &TankInfo::default(), now());
        assert_eq!(empty.status, TankStatus::Low);
        assert_eq!(empty.estimated_days_remaining, 1);
    }

    #[test]
    fn refill_keeps_capacity_unless_given() {
        let mut info = TankInfo::default();
        info.refill(None, Some(5_000), now());
        assert_eq!(info.capacity_liters, 100.0);
        assert_eq!(info.last_refill, Some(now()));
        assert_eq!(info.last_refill_ml, 5_000);

        info.refill(Some(250.0), None, now());
        assert_eq!(info.capacity_liters, 250.0);
        info.refill(Some(-1.0), None, now());
        assert_eq!(info.capacity_liters, 250.0);
    }
}
