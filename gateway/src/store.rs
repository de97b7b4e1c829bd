use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use farm_common::{
    latest_per_metric, motion_stats, ActionLogEntry, CommandRecord, CommandStatus, FeedingEvent,
    Metric, MotionEvent, MotionStats, NewActionLog, NewCommand, NewFeedingEvent, NewMotionEvent,
    NewReading, ScheduleError, ScheduleFields, ScheduleRun, SensorReading, TankInfo,
    WateringSchedule,
};

const MAX_READINGS: usize = 5_000;
/// Finished commands kept for history. Pending ones are never dropped.
const MAX_COMMANDS: usize = 1_000;
const MAX_ACTIONS: usize = 1_000;
const MAX_MOTION_EVENTS: usize = 1_000;
const MAX_FEEDING_EVENTS: usize = 1_000;
const MAX_SCHEDULE_RUNS: usize = 1_000;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    next_id: u64,
    readings: Vec<SensorReading>,
    commands: Vec<CommandRecord>,
    actions: Vec<ActionLogEntry>,
    motion_events: Vec<MotionEvent>,
    feeding_events: Vec<FeedingEvent>,
    schedules: Vec<WateringSchedule>,
    schedule_runs: Vec<ScheduleRun>,
    tank: TankInfo,
}

impl StoreData {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadingQuery {
    pub device_id: Option<String>,
    pub metric: Option<Metric>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub readings: usize,
    pub commands: usize,
    pub pending_commands: usize,
    pub actions: usize,
    pub motion_events: usize,
    pub feeding_events: usize,
    pub schedules: usize,
}

/// In-memory tables for readings, the command queue, action history, motion
/// and feeding events, watering schedules and tank details, mirrored to
/// `store.json` after every write.
#[derive(Clone)]
pub struct FarmStore {
    path: Option<Arc<PathBuf>>,
    default_device: Arc<str>,
    data: Arc<Mutex<StoreData>>,
}

impl FarmStore {
    pub fn in_memory(default_device: &str) -> Self {
        Self {
            path: None,
            default_device: Arc::from(default_device),
            data: Arc::new(Mutex::new(StoreData::default())),
        }
    }

    pub async fn open(data_dir: &Path, default_device: &str) -> anyhow::Result<Self> {
        let path = data_dir.join("store.json");
        let data = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<StoreData>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => StoreData::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        Ok(Self {
            path: Some(Arc::new(path)),
            default_device: Arc::from(default_device),
            data: Arc::new(Mutex::new(data)),
        })
    }

    /// Same location as [`FarmStore::open`] but starting from empty tables.
    pub fn empty_at(data_dir: &Path, default_device: &str) -> Self {
        Self {
            path: Some(Arc::new(data_dir.join("store.json"))),
            ..Self::in_memory(default_device)
        }
    }

    async fn persist(&self, data: &StoreData) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(err) = write_json(path, data).await {
            warn!("failed to persist store to {}: {err:#}", path.display());
        }
    }

    pub async fn insert_readings(&self, readings: Vec<NewReading>) -> Vec<SensorReading> {
        let mut data = self.data.lock().await;
        let mut stored = Vec::with_capacity(readings.len());
        for reading in readings {
            let id = data.allocate_id();
            stored.push(reading.into_reading(id));
        }
        data.readings.extend(stored.iter().cloned());
        trim_front(&mut data.readings, MAX_READINGS);
        self.persist(&data).await;
        stored
    }

    /// Newest first.
    pub async fn readings(&self, query: &ReadingQuery) -> Vec<SensorReading> {
        let data = self.data.lock().await;
        data.readings
            .iter()
            .rev()
            .filter(|row| {
                query
                    .device_id
                    .as_deref()
                    .is_none_or(|device| row.device_id == device)
            })
            .filter(|row| query.metric.is_none_or(|metric| row.metric == metric.as_str()))
            .take(query.limit)
            .cloned()
            .collect()
    }

    pub async fn latest_readings(&self, device_id: Option<&str>) -> Vec<SensorReading> {
        let data = self.data.lock().await;
        latest_per_metric(
            data.readings
                .iter()
                .filter(|row| device_id.is_none_or(|device| row.device_id == device)),
        )
    }

    pub async fn enqueue_command(&self, command: NewCommand) -> CommandRecord {
        let mut data = self.data.lock().await;
        let id = data.allocate_id();
        let record = command.into_record(id, Utc::now());
        data.commands.push(record.clone());
        trim_finished(&mut data.commands, MAX_COMMANDS);
        self.persist(&data).await;
        record
    }

    /// Oldest first, so a device works through its queue in order.
    pub async fn commands(
        &self,
        device_id: Option<&str>,
        status: CommandStatus,
        limit: usize,
    ) -> Vec<CommandRecord> {
        let data = self.data.lock().await;
        data.commands
            .iter()
            .filter(|record| record.status == status)
            .filter(|record| device_id.is_none_or(|device| record.device_id == device))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn update_command(
        &self,
        id: u64,
        status: CommandStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Option<CommandRecord> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let record = data.commands.iter_mut().find(|record| record.id == id)?;
        record.status = status;
        record.updated_at = Some(now);
        if matches!(status, CommandStatus::Completed | CommandStatus::Error) {
            record.completed_at = Some(completed_at.unwrap_or(now));
        }
        let updated = record.clone();
        self.persist(&data).await;
        Some(updated)
    }

    pub async fn append_action(&self, entry: NewActionLog) -> ActionLogEntry {
        let mut data = self.data.lock().await;
        let id = data.allocate_id();
        let entry = entry.into_entry(id, &self.default_device, Utc::now());
        data.actions.push(entry.clone());
        trim_front(&mut data.actions, MAX_ACTIONS);
        self.persist(&data).await;
        entry
    }

    /// Newest first.
    pub async fn actions(&self, device_id: Option<&str>, limit: usize) -> Vec<ActionLogEntry> {
        let data = self.data.lock().await;
        data.actions
            .iter()
            .rev()
            .filter(|entry| device_id.is_none_or(|device| entry.device_id == device))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn record_motion(&self, event: NewMotionEvent) -> MotionEvent {
        let mut data = self.data.lock().await;
        let id = data.allocate_id();
        let event = event.into_event(id, &self.default_device, Utc::now());
        data.motion_events.push(event.clone());
        trim_front(&mut data.motion_events, MAX_MOTION_EVENTS);
        self.persist(&data).await;
        event
    }

    /// Newest events first, plus statistics over everything since `since`.
    pub async fn motion_events(
        &self,
        device_id: Option<&str>,
        limit: usize,
        since: DateTime<Utc>,
    ) -> (Vec<MotionEvent>, MotionStats) {
        let data = self.data.lock().await;
        let matching = || {
            data.motion_events
                .iter()
                .filter(move |event| device_id.is_none_or(|device| event.device_id == device))
        };
        let events = matching().rev().take(limit).cloned().collect();
        (events, motion_stats(matching(), since))
    }

    pub async fn record_feeding(&self, event: NewFeedingEvent) -> FeedingEvent {
        let mut data = self.data.lock().await;
        let id = data.allocate_id();
        let event = event.into_event(id, &self.default_device, Utc::now());
        data.feeding_events.push(event.clone());
        trim_front(&mut data.feeding_events, MAX_FEEDING_EVENTS);
        self.persist(&data).await;
        event
    }

    /// Newest first.
    pub async fn feeding_events(&self, device_id: Option<&str>, limit: usize) -> Vec<FeedingEvent> {
        let data = self.data.lock().await;
        data.feeding_events
            .iter()
            .rev()
            .filter(|event| device_id.is_none_or(|device| event.device_id == device))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn create_schedule(
        &self,
        fields: ScheduleFields,
    ) -> Result<WateringSchedule, ScheduleError> {
        let mut data = self.data.lock().await;
        let id = data.next_id + 1;
        let schedule = fields.into_schedule(id, &self.default_device, Utc::now())?;
        data.next_id = id;
        data.schedules.push(schedule.clone());
        self.persist(&data).await;
        Ok(schedule)
    }

    /// Newest first.
    pub async fn schedules(
        &self,
        device_id: Option<&str>,
        active_only: bool,
    ) -> Vec<WateringSchedule> {
        let data = self.data.lock().await;
        data.schedules
            .iter()
            .rev()
            .filter(|schedule| device_id.is_none_or(|device| schedule.device_id == device))
            .filter(|schedule| !active_only || schedule.is_active)
            .cloned()
            .collect()
    }

    pub async fn schedule(&self, id: u64) -> Option<WateringSchedule> {
        let data = self.data.lock().await;
        data.schedules.iter().find(|schedule| schedule.id == id).cloned()
    }

    /// `None` when no schedule has this id.
    pub async fn update_schedule(
        &self,
        id: u64,
        changes: ScheduleFields,
    ) -> Option<Result<WateringSchedule, ScheduleError>> {
        let mut data = self.data.lock().await;
        let schedule = data.schedules.iter_mut().find(|schedule| schedule.id == id)?;
        if let Err(err) = schedule.apply(changes, Utc::now()) {
            return Some(Err(err));
        }
        let updated = schedule.clone();
        self.persist(&data).await;
        Some(Ok(updated))
    }

    pub async fn delete_schedule(&self, id: u64) -> bool {
        let mut data = self.data.lock().await;
        let before = data.schedules.len();
        data.schedules.retain(|schedule| schedule.id != id);
        let removed = data.schedules.len() != before;
        if removed {
            self.persist(&data).await;
        }
        removed
    }

    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Vec<WateringSchedule> {
        let data = self.data.lock().await;
        data.schedules
            .iter()
            .filter(|schedule| schedule.is_due(now))
            .cloned()
            .collect()
    }

    /// Logs one run of a schedule. A successful run bumps its counters;
    /// `advance` moves `next_execution` past `at` whatever the outcome.
    pub async fn finish_schedule_run(
        &self,
        schedule_id: u64,
        outcome: Result<u64, String>,
        at: DateTime<Utc>,
        advance: bool,
    ) -> Option<ScheduleRun> {
        let mut data = self.data.lock().await;
        let schedule = data
            .schedules
            .iter_mut()
            .find(|schedule| schedule.id == schedule_id)?;
        if outcome.is_ok() {
            schedule.record_run(at);
        }
        if advance {
            schedule.advance(at);
        }
        let schedule = schedule.clone();

        let id = data.allocate_id();
        let run = ScheduleRun::new(id, &schedule, outcome, at);
        data.schedule_runs.push(run.clone());
        trim_front(&mut data.schedule_runs, MAX_SCHEDULE_RUNS);
        self.persist(&data).await;
        Some(run)
    }

    /// Newest first.
    pub async fn schedule_runs(&self, schedule_id: Option<u64>, limit: usize) -> Vec<ScheduleRun> {
        let data = self.data.lock().await;
        data.schedule_runs
            .iter()
            .rev()
            .filter(|run| schedule_id.is_none_or(|id| run.schedule_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn tank_info(&self) -> TankInfo {
        self.data.lock().await.tank.clone()
    }

    pub async fn refill_tank(
        &self,
        capacity_liters: Option<f64>,
        amount_ml: Option<u64>,
    ) -> TankInfo {
        let mut data = self.data.lock().await;
        data.tank.refill(capacity_liters, amount_ml, Utc::now());
        let tank = data.tank.clone();
        self.persist(&data).await;
        tank
    }

    pub async fn counts(&self) -> StoreCounts {
        let data = self.data.lock().await;
        StoreCounts {
            readings: data.readings.len(),
            commands: data.commands.len(),
            pending_commands: data
                .commands
                .iter()
                .filter(|record| record.status == CommandStatus::Pending)
                .count(),
            actions: data.actions.len(),
            motion_events: data.motion_events.len(),
            feeding_events: data.feeding_events.len(),
            schedules: data.schedules.len(),
        }
    }
}

/// Staged in a sibling file and renamed into place.
async fn write_json(path: &Path, data: &StoreData) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(data)?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, payload)
        .await
        .with_context(|| format!("failed to write {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Drops the oldest finished records once the table is over `max`.
fn trim_finished(commands: &mut Vec<CommandRecord>, max: usize) {
    let mut excess = commands.len().saturating_sub(max);
    if excess == 0 {
        return;
    }
    commands.retain(|record| {
        if excess > 0 && record.status.is_finished() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

fn trim_front<T>(rows: &mut Vec<T>, max: usize) {
    if rows.len() > max {
        let excess = rows.len() - max;
        rows.drain(..excess);
    }
}
