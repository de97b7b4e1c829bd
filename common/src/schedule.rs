use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::command::{ActionCode, NewCommand, DEFAULT_COMMAND_DURATION_MS};

pub const DEFAULT_WATER_AMOUNT_ML: u32 = 250;
const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
    Weekly,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    #[serde(alias = "monday")]
    Mon,
    #[serde(alias = "tuesday")]
    Tue,
    #[serde(alias = "wednesday")]
    Wed,
    #[serde(alias = "thursday")]
    Thu,
    #[serde(alias = "friday")]
    Fri,
    #[serde(alias = "saturday")]
    Sat,
    #[serde(alias = "sunday")]
    Sun,
}

impl DayOfWeek {
    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Missing required fields")]
    MissingFields,
    #[error("invalid scheduled_time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("weekly schedules need at least one scheduled day")]
    NoDays,
    #[error("end_date is before start_date")]
    EndBeforeStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WateringSchedule {
    pub id: u64,
    pub device_id: String,
    pub name: String,
    pub plant_type: String,
    pub water_amount_ml: u32,
    pub duration_ms: u64,
    pub schedule_type: ScheduleType,
    /// Local wall-clock time in `timezone`, `HH:MM`.
    pub scheduled_time: String,
    #[serde(default)]
    pub scheduled_days: Vec<DayOfWeek>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub timezone: String,
    pub is_active: bool,
    #[serde(default)]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Body of a schedule create, and the changes carried by an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_amount_ml: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<ScheduleType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_days: Option<Vec<DayOfWeek>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub changes: ScheduleFields,
}

impl ScheduleFields {
    pub fn into_schedule(
        self,
        id: u64,
        default_device: &str,
        now: DateTime<Utc>,
    ) -> Result<WateringSchedule, ScheduleError> {
        let (Some(name), Some(plant_type), Some(schedule_type), Some(scheduled_time)) = (
            non_empty(self.name),
            non_empty(self.plant_type),
            self.schedule_type,
            non_empty(self.scheduled_time),
        ) else {
            return Err(ScheduleError::MissingFields);
        };

        let timezone = non_empty(self.timezone).unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let tz = parse_timezone(&timezone)?;
        let mut schedule = WateringSchedule {
            id,
            device_id: non_empty(self.device_id).unwrap_or_else(|| default_device.to_string()),
            name,
            plant_type,
            water_amount_ml: self.water_amount_ml.unwrap_or(DEFAULT_WATER_AMOUNT_ML),
            duration_ms: self
                .duration_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_COMMAND_DURATION_MS),
            schedule_type,
            scheduled_time,
            scheduled_days: self.scheduled_days.unwrap_or_default(),
            start_date: self
                .start_date
                .unwrap_or_else(|| now.with_timezone(&tz).date_naive()),
            end_date: self.end_date,
            timezone,
            is_active: self.is_active.unwrap_or(true),
            last_executed: None,
            execution_count: 0,
            next_execution: None,
            created_at: now,
        };
        schedule.normalize()?;
        schedule.next_execution = schedule.next_after(now);
        Ok(schedule)
    }
}

impl WateringSchedule {
    /// Applies an update. On error the schedule is left untouched.
    pub fn apply(
        &mut self,
        changes: ScheduleFields,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut next = self.clone();
        if let Some(device_id) = non_empty(changes.device_id) {
            next.device_id = device_id;
        }
        if let Some(name) = non_empty(changes.name) {
            next.name = name;
        }
        if let Some(plant_type) = non_empty(changes.plant_type) {
            next.plant_type = plant_type;
        }
        if let Some(amount) = changes.water_amount_ml {
            next.water_amount_ml = amount;
        }
        if let Some(duration_ms) = changes.duration_ms.filter(|ms| *ms > 0) {
            next.duration_ms = duration_ms;
        }
        if let Some(schedule_type) = changes.schedule_type {
            next.schedule_type = schedule_type;
        }
        if let Some(time) = non_empty(changes.scheduled_time) {
            next.scheduled_time = time;
        }
        if let Some(days) = changes.scheduled_days {
            next.scheduled_days = days;
        }
        if let Some(start_date) = changes.start_date {
            next.start_date = start_date;
        }
        if let Some(end_date) = changes.end_date {
            next.end_date = Some(end_date);
        }
        if let Some(timezone) = non_empty(changes.timezone) {
            next.timezone = timezone;
        }
        if let Some(active) = changes.is_active {
            next.is_active = active;
        }

        next.normalize()?;
        next.next_execution = next.next_after(now);
        *self = next;
        Ok(())
    }

    fn normalize(&mut self) -> Result<(), ScheduleError> {
        parse_timezone(&self.timezone)?;
        let time = parse_time(&self.scheduled_time)?;
        self.scheduled_time = time.format("%H:%M").to_string();
        self.scheduled_days.sort();
        self.scheduled_days.dedup();
        if self.schedule_type == ScheduleType::Weekly && self.scheduled_days.is_empty() {
            return Err(ScheduleError::NoDays);
        }
        if self.end_date.is_some_and(|end| end < self.start_date) {
            return Err(ScheduleError::EndBeforeStart);
        }
        Ok(())
    }

    /// First run strictly after `after`, or `None` once the schedule is
    /// inactive or past its end date.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active {
            return None;
        }
        let tz = parse_timezone(&self.timezone).ok()?;
        let time = parse_time(&self.scheduled_time).ok()?;
        let first = after.with_timezone(&tz).date_naive().max(self.start_date);

        // Eight days covers a weekly slot whose time today has already passed.
        (0..=7)
            .filter_map(|offset| first.checked_add_days(Days::new(offset)))
            .take_while(|date| self.end_date.is_none_or(|end| *date <= end))
            .filter(|date| self.runs_on(*date))
            .filter_map(|date| tz.from_local_datetime(&date.and_time(time)).earliest())
            .map(|local| local.with_timezone(&Utc))
            .find(|candidate| *candidate > after)
    }

    fn runs_on(&self, date: NaiveDate) -> bool {
        match self.schedule_type {
            ScheduleType::Daily => true,
            ScheduleType::Weekly => self
                .scheduled_days
                .contains(&DayOfWeek::from_chrono(date.weekday())),
            ScheduleType::Once => date == self.start_date,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_execution.is_some_and(|at| at <= now)
    }

    pub fn record_run(&mut self, at: DateTime<Utc>) {
        self.last_executed = Some(at);
        self.execution_count += 1;
    }

    pub fn advance(&mut self, after: DateTime<Utc>) {
        self.next_execution = self.next_after(after);
    }

    /// Watering command for one run of this schedule.
    pub fn command(&self) -> NewCommand {
        NewCommand {
            device_id: self.device_id.clone(),
            action: ActionCode::Water,
            duration_ms: self.duration_ms,
            location: format!("schedule:{}", self.id),
            metadata: json!({
                "schedule_id": self.id,
                "schedule_name": self.name,
                "plant_type": self.plant_type,
                "water_amount_ml": self.water_amount_ml,
            }),
        }
    }
}

/// One execution attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: u64,
    pub schedule_id: u64,
    pub device_id: String,
    pub water_amount_ml: u32,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub command_id: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ScheduleRun {
    pub fn new(
        id: u64,
        schedule: &WateringSchedule,
        outcome: Result<u64, String>,
        at: DateTime<Utc>,
    ) -> Self {
        let (command_id, error_message) = match outcome {
            Ok(command_id) => (Some(command_id), None),
            Err(message) => (None, Some(message)),
        };
        Self {
            id,
            schedule_id: schedule.id,
            device_id: schedule.device_id.clone(),
            water_amount_ml: schedule.water_amount_ml,
            duration_ms: schedule.duration_ms,
            success: command_id.is_some(),
            command_id,
            error_message,
            executed_at: at,
        }
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

fn parse_timezone(raw: &str) -> Result<Tz, ScheduleError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(raw.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
